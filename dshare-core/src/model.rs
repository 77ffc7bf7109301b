//! Data model for mirrored roots and datasets
//!
//! A dataset is addressed as `<root>/<relative path>`. Its metadata is a
//! closed union over the three kinds of data the network shares: chunked
//! n-dimensional arrays, chunked byte streams, and lazy expressions that are
//! computed from other datasets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::grid::ChunkGrid;

/// Root name reserved for local, never-mirrored datasets
pub const SCRATCH_ROOT: &str = "@scratch";

/// Element type of an array dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes
    pub fn itemsize(&self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::Uint8 => 1,
            DType::Int16 | DType::Uint16 => 2,
            DType::Int32 | DType::Uint32 | DType::Float32 => 4,
            DType::Int64 | DType::Uint64 | DType::Float64 => 8,
        }
    }

    /// Decode one little-endian element as f64
    ///
    /// `bytes` must be exactly `itemsize()` long.
    pub fn decode_f64(&self, bytes: &[u8]) -> f64 {
        match self {
            DType::Bool => {
                if bytes[0] != 0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Int8 => bytes[0] as i8 as f64,
            DType::Uint8 => bytes[0] as f64,
            DType::Int16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            DType::Uint16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            DType::Int32 => i32::from_le_bytes(le4(bytes)) as f64,
            DType::Uint32 => u32::from_le_bytes(le4(bytes)) as f64,
            DType::Float32 => f32::from_le_bytes(le4(bytes)) as f64,
            DType::Int64 => i64::from_le_bytes(le8(bytes)) as f64,
            DType::Uint64 => u64::from_le_bytes(le8(bytes)) as f64,
            DType::Float64 => f64::from_le_bytes(le8(bytes)),
        }
    }

    /// Append `value` encoded as this type (little endian, saturating casts)
    pub fn encode_f64(&self, value: f64, out: &mut Vec<u8>) {
        match self {
            DType::Bool => out.push((value != 0.0) as u8),
            DType::Int8 => out.extend_from_slice(&(value as i8).to_le_bytes()),
            DType::Uint8 => out.push(value as u8),
            DType::Int16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            DType::Uint16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            DType::Int32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            DType::Uint32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
            DType::Float32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            DType::Int64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
            DType::Uint64 => out.extend_from_slice(&(value as u64).to_le_bytes()),
            DType::Float64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

fn le4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

fn le8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Chunked n-dimensional array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: DType,
}

/// Opaque byte stream split into fixed-size chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByteStreamMeta {
    pub size: u64,
    pub chunk_size: u64,
}

/// Derived dataset computed from named operands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyExprMeta {
    pub expression: String,
    /// Variable name -> operand dataset path (`<root>/<relative path>`)
    pub operands: BTreeMap<String, String>,
    pub shape: Vec<u64>,
    pub dtype: DType,
}

/// Dataset metadata as served by a publisher and stored in container headers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetMeta {
    Array(ArrayMeta),
    ByteStream(ByteStreamMeta),
    LazyExpr(LazyExprMeta),
}

impl DatasetMeta {
    /// Chunk layout; lazy expressions store no chunks and have none
    pub fn grid(&self) -> Result<Option<ChunkGrid>> {
        match self {
            DatasetMeta::Array(a) => ChunkGrid::new(a.shape.clone(), a.chunks.clone()).map(Some),
            DatasetMeta::ByteStream(b) => {
                ChunkGrid::new(vec![b.size], vec![b.chunk_size]).map(Some)
            }
            DatasetMeta::LazyExpr(_) => Ok(None),
        }
    }

    /// Number of chunk slots a container for this dataset holds
    pub fn total_chunks(&self) -> Result<u64> {
        Ok(self.grid()?.map(|g| g.total_chunks()).unwrap_or(0))
    }

    /// Logical shape (byte streams are one-dimensional)
    pub fn shape(&self) -> Vec<u64> {
        match self {
            DatasetMeta::Array(a) => a.shape.clone(),
            DatasetMeta::ByteStream(b) => vec![b.size],
            DatasetMeta::LazyExpr(e) => e.shape.clone(),
        }
    }

    /// Element type (byte streams are `uint8`)
    pub fn dtype(&self) -> DType {
        match self {
            DatasetMeta::Array(a) => a.dtype,
            DatasetMeta::ByteStream(_) => DType::Uint8,
            DatasetMeta::LazyExpr(e) => e.dtype,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            DatasetMeta::Array(_) => "array",
            DatasetMeta::ByteStream(_) => "byte_stream",
            DatasetMeta::LazyExpr(_) => "lazy_expr",
        }
    }
}

/// A named remote repository and the publisher serving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub name: String,
    /// Base URL of the owning publisher, e.g. `http://host:8002`
    pub endpoint: String,
    pub subscribed: bool,
}

/// Validated `<root>/<relative path>` address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetPath {
    root: String,
    rel: String,
}

impl DatasetPath {
    /// Parse `<root>/<relative path>`
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.trim_matches('/');
        let (root, rel) = path
            .split_once('/')
            .ok_or_else(|| Error::InvalidPath(path.to_string()))?;
        Self::new(root, rel)
    }

    pub fn new(root: &str, rel: &str) -> Result<Self> {
        if root.is_empty() || root.contains('/') || root == "." || root == ".." {
            return Err(Error::InvalidPath(format!("{}/{}", root, rel)));
        }
        validate_relative(rel).map_err(|_| Error::InvalidPath(format!("{}/{}", root, rel)))?;
        Ok(Self {
            root: root.to_string(),
            rel: rel.to_string(),
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn rel(&self) -> &str {
        &self.rel
    }

    /// Scratch datasets live only in the local cache and are never fetched
    pub fn is_scratch(&self) -> bool {
        self.root == SCRATCH_ROOT
    }
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root, self.rel)
    }
}

/// Reject empty, absolute, and parent-escaping relative paths
pub fn validate_relative(rel: &str) -> Result<()> {
    if rel.is_empty() || rel.starts_with('/') {
        return Err(Error::InvalidPath(rel.to_string()));
    }
    for part in rel.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(Error::InvalidPath(rel.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_json_tagging() {
        let meta = DatasetMeta::Array(ArrayMeta {
            shape: vec![100],
            chunks: vec![10],
            dtype: DType::Float64,
        });
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["kind"], "array");
        assert_eq!(json["dtype"], "float64");

        let parsed: DatasetMeta = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.total_chunks().unwrap(), 10);
    }

    #[test]
    fn test_byte_stream_chunks() {
        let meta = DatasetMeta::ByteStream(ByteStreamMeta {
            size: 2_500_000,
            chunk_size: 1 << 20,
        });
        assert_eq!(meta.total_chunks().unwrap(), 3);
        assert_eq!(meta.dtype(), DType::Uint8);
    }

    #[test]
    fn test_lazy_expr_has_no_chunks() {
        let meta = DatasetMeta::LazyExpr(LazyExprMeta {
            expression: "a + 1".into(),
            operands: [("a".to_string(), "root/a".to_string())].into(),
            shape: vec![10],
            dtype: DType::Float64,
        });
        assert!(meta.grid().unwrap().is_none());
        assert_eq!(meta.total_chunks().unwrap(), 0);
    }

    #[test]
    fn test_dataset_path_parse() {
        let p = DatasetPath::parse("foo/dir/data.b2nd").unwrap();
        assert_eq!(p.root(), "foo");
        assert_eq!(p.rel(), "dir/data.b2nd");
        assert_eq!(p.to_string(), "foo/dir/data.b2nd");
        assert!(!p.is_scratch());

        assert!(DatasetPath::parse("foo").is_err());
        assert!(DatasetPath::parse("foo/../etc/passwd").is_err());
        assert!(DatasetPath::parse("foo/a//b").is_err());
        assert!(DatasetPath::parse("@scratch/x").unwrap().is_scratch());
    }

    #[test]
    fn test_dtype_roundtrip_values() {
        let mut buf = Vec::new();
        DType::Int16.encode_f64(-300.0, &mut buf);
        assert_eq!(DType::Int16.decode_f64(&buf), -300.0);

        buf.clear();
        DType::Float32.encode_f64(1.5, &mut buf);
        assert_eq!(buf.len(), 4);
        assert_eq!(DType::Float32.decode_f64(&buf), 1.5);
    }
}
