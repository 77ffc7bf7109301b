//! Chunk store integration tests: presence monotonicity and concurrent installs.

use dshare_core::container::{compress_chunk, write_array};
use dshare_core::{ArrayMeta, ChunkStore, Container, DType, DatasetMeta, DatasetPath};
use std::sync::Arc;
use tempfile::TempDir;

fn f64_bytes(values: impl IntoIterator<Item = f64>) -> Vec<u8> {
    values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn test_presence_is_monotonic_across_installs() {
    let tmp = TempDir::new().unwrap();
    let store = ChunkStore::new(tmp.path()).unwrap();
    let path = DatasetPath::parse("root/data.dsc").unwrap();
    let meta = DatasetMeta::Array(ArrayMeta {
        shape: vec![40],
        chunks: vec![10],
        dtype: DType::Float64,
    });
    store.initialize(&path, &meta).unwrap();

    let payload = compress_chunk(&f64_bytes((0..10).map(|v| v as f64))).unwrap();
    store.install(&path, 1, &payload).unwrap();
    for other in [3, 0, 2] {
        store.install(&path, other, &payload).unwrap();
        assert!(store.is_present(&path, 1).unwrap());
    }
    assert!(store.open(&path).unwrap().missing_chunks().unwrap().is_empty());
}

#[test]
fn test_concurrent_installs_same_container() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source.dsc");
    let meta = ArrayMeta {
        shape: vec![64, 8],
        chunks: vec![4, 8],
        dtype: DType::Float64,
    };
    write_array(&source, meta.clone(), &f64_bytes((0..512).map(|v| v as f64))).unwrap();
    let full = Container::open(&source, "source").unwrap();

    let store = Arc::new(ChunkStore::new(tmp.path().join("cache")).unwrap());
    let path = DatasetPath::parse("root/big.dsc").unwrap();
    store.initialize(&path, &DatasetMeta::Array(meta)).unwrap();

    let handles: Vec<_> = (0..full.total_chunks())
        .map(|n| {
            let store = store.clone();
            let path = path.clone();
            let payload = full.read_payload(n).unwrap();
            std::thread::spawn(move || store.install(&path, n, &payload).unwrap())
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let local = store.open(&path).unwrap();
    let slice = dshare_core::Slice::full(&[64, 8]);
    assert_eq!(local.read_slice(&slice).unwrap(), full.read_slice(&slice).unwrap());
}
