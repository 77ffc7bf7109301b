//! Chunked container files (the local chunk store)
//!
//! Each dataset is one self-describing file:
//!
//! ```text
//! "DSHC" | u32 version | u32 meta_len | meta JSON | u64 nchunks
//!        | nchunks x slot (u64 offset, u32 length, u32 state)
//!        | chunk payloads (zstd frames, appended on install)
//! ```
//!
//! A slot holding `SLOT_UNINIT` is a placeholder for a chunk that has not
//! been fetched yet. Installing a chunk appends its payload, flushes it, and
//! only then rewrites the slot, so a present flag always points at complete
//! bytes.

use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::grid::{DimRange, MAX_CHUNKS, Slice, c_strides, for_each_index};
use crate::model::{ArrayMeta, DType, DatasetMeta, DatasetPath};

/// File magic
pub const MAGIC: &[u8; 4] = b"DSHC";

/// Container format version
pub const FORMAT_VERSION: u32 = 1;

/// Slot state of a chunk that has not been installed
pub const SLOT_UNINIT: u32 = 0xFFFF_FFFF;

/// Slot state of an installed chunk
pub const SLOT_PRESENT: u32 = 1;

const SLOT_SIZE: u64 = 16;
const PREFIX_SIZE: u64 = 12;
const MAX_META_LEN: u32 = 16 * 1024 * 1024;
const INSTALL_SHARDS: usize = 16;

/// zstd level used for chunk payloads
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    offset: u64,
    len: u32,
    state: u32,
}

impl Slot {
    const UNINIT: Slot = Slot {
        offset: 0,
        len: 0,
        state: SLOT_UNINIT,
    };

    fn encode(&self) -> [u8; SLOT_SIZE as usize] {
        let mut buf = [0u8; SLOT_SIZE as usize];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf[12..].copy_from_slice(&self.state.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; SLOT_SIZE as usize]) -> Self {
        let mut off = [0u8; 8];
        off.copy_from_slice(&buf[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[8..12]);
        let mut state = [0u8; 4];
        state.copy_from_slice(&buf[12..]);
        Self {
            offset: u64::from_le_bytes(off),
            len: u32::from_le_bytes(len),
            state: u32::from_le_bytes(state),
        }
    }
}

/// Where the slot table lives, read without parsing the metadata
#[derive(Debug, Clone, Copy)]
struct Layout {
    meta_len: u32,
    nchunks: u64,
    slots_offset: u64,
}

fn read_layout(file: &mut File, display: &str) -> Result<Layout> {
    let mut prefix = [0u8; PREFIX_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    read_exact_or_corrupt(file, &mut prefix, display, "truncated header")?;
    if &prefix[..4] != MAGIC {
        return Err(Error::corrupt(display, "bad magic"));
    }
    let version = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
    if version != FORMAT_VERSION {
        return Err(Error::corrupt(
            display,
            format!("unsupported format version {}", version),
        ));
    }
    let meta_len = u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]);
    if meta_len > MAX_META_LEN {
        return Err(Error::corrupt(display, format!("metadata length {}", meta_len)));
    }
    file.seek(SeekFrom::Start(PREFIX_SIZE + meta_len as u64))?;
    let mut count = [0u8; 8];
    read_exact_or_corrupt(file, &mut count, display, "truncated chunk table")?;
    let nchunks = u64::from_le_bytes(count);
    if nchunks > MAX_CHUNKS {
        return Err(Error::corrupt(display, format!("{} chunk slots", nchunks)));
    }
    Ok(Layout {
        meta_len,
        nchunks,
        slots_offset: PREFIX_SIZE + meta_len as u64 + 8,
    })
}

fn read_meta(file: &mut File, layout: &Layout, display: &str) -> Result<DatasetMeta> {
    let mut buf = vec![0u8; layout.meta_len as usize];
    file.seek(SeekFrom::Start(PREFIX_SIZE))?;
    read_exact_or_corrupt(file, &mut buf, display, "truncated metadata")?;
    let meta: DatasetMeta = serde_json::from_slice(&buf)
        .map_err(|e| Error::corrupt(display, format!("metadata: {}", e)))?;
    let expected = meta
        .total_chunks()
        .map_err(|e| Error::corrupt(display, e.to_string()))?;
    if expected != layout.nchunks {
        return Err(Error::corrupt(
            display,
            format!("{} chunk slots, metadata implies {}", layout.nchunks, expected),
        ));
    }
    Ok(meta)
}

fn read_slot(file: &mut File, layout: &Layout, index: u64, display: &str) -> Result<Slot> {
    if index >= layout.nchunks {
        return Err(Error::ChunkOutOfRange {
            path: display.to_string(),
            index,
            total: layout.nchunks,
        });
    }
    let mut buf = [0u8; SLOT_SIZE as usize];
    file.seek(SeekFrom::Start(layout.slots_offset + index * SLOT_SIZE))?;
    read_exact_or_corrupt(file, &mut buf, display, "truncated chunk table")?;
    let slot = Slot::decode(&buf);
    if slot.state != SLOT_UNINIT && slot.state != SLOT_PRESENT {
        return Err(Error::corrupt(
            display,
            format!("chunk {} has unknown state {:#x}", index, slot.state),
        ));
    }
    Ok(slot)
}

fn read_exact_or_corrupt(file: &mut File, buf: &mut [u8], display: &str, what: &str) -> Result<()> {
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::corrupt(display, what)),
        Err(e) => Err(e.into()),
    }
}

fn open_file(file_path: &Path, display: &str, write: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .open(file_path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(display.to_string()),
            _ => Error::Io(e),
        })
}

/// Compress raw chunk bytes into a payload
pub fn compress_chunk(raw: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::encode_all(raw, COMPRESSION_LEVEL)?)
}

/// Decompress a chunk payload
pub fn decompress_chunk(payload: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::decode_all(payload)?)
}

/// Write a complete container file atomically (temp file + rename)
///
/// `payloads` must be empty (all placeholders) or hold one entry per chunk;
/// `None` entries are written as placeholders.
pub fn write_container(
    file_path: &Path,
    meta: &DatasetMeta,
    payloads: &[Option<Vec<u8>>],
) -> Result<()> {
    let display = file_path.display().to_string();
    let nchunks = meta.total_chunks()?;
    if !payloads.is_empty() && payloads.len() as u64 != nchunks {
        return Err(Error::corrupt(
            display,
            format!("{} payloads for {} chunks", payloads.len(), nchunks),
        ));
    }
    let meta_json = serde_json::to_vec(meta)?;

    let mut header = Vec::with_capacity(meta_json.len() + 20);
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    header.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
    header.extend_from_slice(&meta_json);
    header.extend_from_slice(&nchunks.to_le_bytes());

    let mut offset = header.len() as u64 + nchunks * SLOT_SIZE;
    let mut slots = Vec::with_capacity((nchunks * SLOT_SIZE) as usize);
    for i in 0..nchunks as usize {
        let slot = match payloads.get(i).and_then(|p| p.as_ref()) {
            Some(p) => {
                let len = u32::try_from(p.len())
                    .map_err(|_| Error::corrupt(&display, format!("chunk {} too large", i)))?;
                let slot = Slot {
                    offset,
                    len,
                    state: SLOT_PRESENT,
                };
                offset += p.len() as u64;
                slot
            }
            None => Slot::UNINIT,
        };
        slots.extend_from_slice(&slot.encode());
    }

    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = temp_path(file_path);
    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&header)?;
        file.write_all(&slots)?;
        for p in payloads.iter().flatten() {
            file.write_all(p)?;
        }
        file.sync_all()?;
        fs::rename(&tmp_path, file_path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Split a C-order array into compressed chunk payloads
pub fn compress_array(meta: &ArrayMeta, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let grid = crate::grid::ChunkGrid::new(meta.shape.clone(), meta.chunks.clone())?;
    let itemsize = meta.dtype.itemsize();
    let expected = meta.shape.iter().product::<u64>() as usize * itemsize;
    if data.len() != expected {
        return Err(Error::InvalidSlice(format!(
            "{} bytes given for shape {:?} of {:?}",
            data.len(),
            meta.shape,
            meta.dtype
        )));
    }
    let strides = c_strides(&meta.shape);
    let mut out = Vec::with_capacity(grid.total_chunks() as usize);
    for n in 0..grid.total_chunks() {
        let extent = grid.chunk_extent(n);
        let lens: Vec<u64> = extent.iter().map(|r| r.len()).collect();
        let mut raw = Vec::with_capacity(lens.iter().product::<u64>() as usize * itemsize);
        for_each_index(&lens, |idx| {
            let src: u64 = idx
                .iter()
                .enumerate()
                .map(|(d, &i)| (extent[d].start + i) * strides[d])
                .sum();
            let at = src as usize * itemsize;
            raw.extend_from_slice(&data[at..at + itemsize]);
        });
        out.push(compress_chunk(&raw)?);
    }
    Ok(out)
}

/// Write a fully populated array container from C-order little-endian data
pub fn write_array(file_path: &Path, meta: ArrayMeta, data: &[u8]) -> Result<()> {
    let payloads: Vec<Option<Vec<u8>>> = compress_array(&meta, data)?.into_iter().map(Some).collect();
    write_container(file_path, &DatasetMeta::Array(meta), &payloads)
}

fn temp_path(file_path: &Path) -> PathBuf {
    let name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

/// Dense n-dimensional values read out of a container
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: DType,
    pub shape: Vec<u64>,
    /// C-order little-endian element bytes
    pub data: Vec<u8>,
}

impl NdArray {
    pub fn from_f64(shape: Vec<u64>, values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            DType::Float64.encode_f64(*v, &mut data);
        }
        Self {
            dtype: DType::Float64,
            shape,
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.itemsize()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_f64(&self) -> Vec<f64> {
        self.data
            .chunks_exact(self.dtype.itemsize())
            .map(|b| self.dtype.decode_f64(b))
            .collect()
    }
}

/// Read handle on one container file
///
/// The handle keeps the file open, so a container replaced on disk after
/// `open` (re-initialized or removed) stays readable as it was.
#[derive(Debug, Clone)]
pub struct Container {
    file: Arc<Mutex<File>>,
    display: String,
    meta: DatasetMeta,
    layout: Layout,
}

impl Container {
    /// Open a container file; `display` names it in errors
    pub fn open(file_path: &Path, display: &str) -> Result<Self> {
        let mut file = open_file(file_path, display, false)?;
        let layout = read_layout(&mut file, display)?;
        let meta = read_meta(&mut file, &layout, display)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            display: display.to_string(),
            meta,
            layout,
        })
    }

    /// Cheap check whether `file_path` starts with the container magic
    pub fn sniff(file_path: &Path) -> bool {
        let mut magic = [0u8; 4];
        File::open(file_path)
            .and_then(|mut f| f.read_exact(&mut magic))
            .map(|_| &magic == MAGIC)
            .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.display
    }

    fn file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    pub fn shape(&self) -> Vec<u64> {
        self.meta.shape()
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    pub fn total_chunks(&self) -> u64 {
        self.layout.nchunks
    }

    /// Whether chunk `index` has been installed
    pub fn is_present(&self, index: u64) -> Result<bool> {
        let mut file = self.file();
        let slot = read_slot(&mut file, &self.layout, index, &self.display)?;
        Ok(slot.state == SLOT_PRESENT)
    }

    /// Indices that are not yet present
    pub fn missing_chunks(&self) -> Result<Vec<u64>> {
        let mut file = self.file();
        let mut missing = Vec::new();
        for i in 0..self.layout.nchunks {
            if read_slot(&mut file, &self.layout, i, &self.display)?.state != SLOT_PRESENT {
                missing.push(i);
            }
        }
        Ok(missing)
    }

    /// Stored (compressed) payload of chunk `index`
    pub fn read_payload(&self, index: u64) -> Result<Vec<u8>> {
        let mut file = self.file();
        let slot = read_slot(&mut file, &self.layout, index, &self.display)?;
        if slot.state != SLOT_PRESENT {
            return Err(Error::ChunkAbsent {
                path: self.display.clone(),
                index,
            });
        }
        let mut buf = vec![0u8; slot.len as usize];
        file.seek(SeekFrom::Start(slot.offset))?;
        read_exact_or_corrupt(&mut file, &mut buf, &self.display, "truncated chunk payload")?;
        Ok(buf)
    }

    /// Decompressed bytes of chunk `index`
    pub fn read_chunk(&self, index: u64) -> Result<Vec<u8>> {
        let payload = self.read_payload(index)?;
        decompress_chunk(&payload).map_err(|e| {
            Error::corrupt(&self.display, format!("chunk {}: {}", index, e))
        })
    }

    /// Read the elements selected by `slice`
    ///
    /// Every chunk overlapping the slice must be present.
    pub fn read_slice(&self, slice: &Slice) -> Result<NdArray> {
        let grid = self.meta.grid()?.ok_or_else(|| {
            Error::Expression(format!("{} is a lazy expression and stores no data", self.display))
        })?;
        let dtype = self.meta.dtype();
        let itemsize = dtype.itemsize();
        let out_shape = slice.shape();
        let out_strides = c_strides(&out_shape);
        let mut out = vec![0u8; out_shape.iter().product::<u64>() as usize * itemsize];

        for n in grid.overlapping_chunks(slice)? {
            let extent = grid.chunk_extent(n);
            let chunk_shape: Vec<u64> = extent.iter().map(|r| r.len()).collect();
            let raw = self.read_chunk(n)?;
            if raw.len() != chunk_shape.iter().product::<u64>() as usize * itemsize {
                return Err(Error::corrupt(
                    &self.display,
                    format!("chunk {} holds {} bytes, expected shape {:?}", n, raw.len(), chunk_shape),
                ));
            }
            let chunk_strides = c_strides(&chunk_shape);
            let inter: Vec<DimRange> = extent
                .iter()
                .zip(slice.ranges())
                .map(|(e, s)| e.intersect(s))
                .collect();
            let inter_shape: Vec<u64> = inter.iter().map(|r| r.len()).collect();
            for_each_index(&inter_shape, |idx| {
                let mut src = 0u64;
                let mut dst = 0u64;
                for d in 0..idx.len() {
                    let pos = inter[d].start + idx[d];
                    src += (pos - extent[d].start) * chunk_strides[d];
                    dst += (pos - slice.ranges()[d].start) * out_strides[d];
                }
                let (src, dst) = (src as usize * itemsize, dst as usize * itemsize);
                out[dst..dst + itemsize].copy_from_slice(&raw[src..src + itemsize]);
            });
        }

        Ok(NdArray {
            dtype,
            shape: out_shape,
            data: out,
        })
    }

    /// Read a byte range of a byte-stream dataset
    pub fn read_bytes(&self, range: DimRange) -> Result<Vec<u8>> {
        match &self.meta {
            DatasetMeta::ByteStream(_) => Ok(self.read_slice(&Slice::new(vec![range]))?.data),
            other => Err(Error::InvalidSlice(format!(
                "{} is a {} dataset, not a byte stream",
                self.display,
                other.kind_name()
            ))),
        }
    }
}

/// On-disk cache of containers, one directory per root
///
/// `<base>/<root>/<relative path>` mirrors remote paths one to one.
#[derive(Debug)]
pub struct ChunkStore {
    base: PathBuf,
    install_locks: Vec<Mutex<()>>,
}

impl ChunkStore {
    /// Open (creating if needed) a store rooted at `base`
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            install_locks: (0..INSTALL_SHARDS).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn file_path(&self, path: &DatasetPath) -> PathBuf {
        let mut p = self.base.join(path.root());
        for part in path.rel().split('/') {
            p.push(part);
        }
        p
    }

    pub fn exists(&self, path: &DatasetPath) -> bool {
        self.file_path(path).is_file()
    }

    /// Create a placeholder container with every chunk absent
    ///
    /// Replaces any existing container for `path`.
    pub fn initialize(&self, path: &DatasetPath, meta: &DatasetMeta) -> Result<()> {
        let file_path = self.file_path(path);
        write_container(&file_path, meta, &[])?;
        tracing::debug!("Initialized {} ({} chunks)", path, meta.total_chunks()?);
        Ok(())
    }

    /// Whether chunk `index` of `path` is present, reading only its slot
    pub fn is_present(&self, path: &DatasetPath, index: u64) -> Result<bool> {
        let display = path.to_string();
        let mut file = open_file(&self.file_path(path), &display, false)?;
        let layout = read_layout(&mut file, &display)?;
        let slot = read_slot(&mut file, &layout, index, &display)?;
        Ok(slot.state == SLOT_PRESENT)
    }

    /// Install the compressed payload of chunk `index`
    ///
    /// The payload is flushed before the slot flips to present. Installs
    /// targeting the same file are serialized through a sharded lock.
    pub fn install(&self, path: &DatasetPath, index: u64, payload: &[u8]) -> Result<()> {
        let display = path.to_string();
        let file_path = self.file_path(path);
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::corrupt(&display, format!("chunk {} too large", index)))?;

        let _guard = self.install_locks[self.shard(&file_path)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut file = open_file(&file_path, &display, true)?;
        let layout = read_layout(&mut file, &display)?;
        // validates the index and the slot table before appending
        read_slot(&mut file, &layout, index, &display)?;

        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(payload)?;
        file.sync_data()?;

        let slot = Slot {
            offset,
            len,
            state: SLOT_PRESENT,
        };
        file.seek(SeekFrom::Start(layout.slots_offset + index * SLOT_SIZE))?;
        file.write_all(&slot.encode())?;
        file.sync_data()?;
        Ok(())
    }

    /// Open a container for reading
    pub fn open(&self, path: &DatasetPath) -> Result<Container> {
        Container::open(&self.file_path(path), &path.to_string())
    }

    /// Delete the container for `path`; returns whether one existed
    pub fn remove(&self, path: &DatasetPath) -> Result<bool> {
        match fs::remove_file(self.file_path(path)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Relative paths of every container stored under `root`, sorted
    pub fn list(&self, root: &str) -> Result<Vec<String>> {
        let dir = self.base.join(root);
        let mut out = Vec::new();
        if dir.is_dir() {
            walk(&dir, "", &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    fn shard(&self, file_path: &Path) -> usize {
        let mut h = DefaultHasher::new();
        file_path.hash(&mut h);
        (h.finish() as usize) % self.install_locks.len()
    }
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        let kind = entry.file_type()?;
        if kind.is_dir() {
            walk(&entry.path(), &rel, out)?;
        } else if kind.is_file() && !is_temp_name(&name) {
            out.push(rel);
        }
    }
    Ok(())
}
