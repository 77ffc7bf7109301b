//! dshare publisher HTTP endpoints
//!
//! Serves a directory as a root:
//!   GET /api/list                      → relative paths of every dataset
//!   GET /api/info/{path}               → dataset metadata (ETag, 304 on If-None-Match)
//!   GET /api/download/{path}?nchunk=N  → compressed bytes of chunk N
//!
//! Container files are served as stored. Any other regular file is served as
//! a byte stream, chunked and compressed on the fly.

pub mod handlers;
pub mod http_util;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

pub use handlers::PublisherHandler;

/// Chunk size used when serving plain files as byte streams
pub const BYTE_STREAM_CHUNK: u64 = 1 << 20;

/// Publisher configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PublisherConfig {
    /// Root name announced for this directory
    pub name: String,
    /// Directory whose files are published
    pub root_dir: PathBuf,
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8002".to_string()
}

/// Publisher errors
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] dshare_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PublishError {
    pub(crate) fn status(&self) -> u16 {
        match self {
            PublishError::NotFound(_) => 404,
            PublishError::InvalidRequest(_) => 400,
            PublishError::Store(e) if e.is_not_found() => 404,
            PublishError::Store(dshare_core::Error::ChunkOutOfRange { .. }) => 400,
            _ => 500,
        }
    }
}

/// Change token of a file: modification time (ns) and size
pub fn file_etag(path: &Path) -> std::io::Result<String> {
    let md = fs::metadata(path)?;
    let mtime = md
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(format!("{}:{}", mtime, md.len()))
}
