//! dshare Core Library
//!
//! Local building blocks of a dataset-sharing subscriber:
//! - Dataset / root model (arrays, byte streams, lazy expressions)
//! - Chunk grid and slice arithmetic
//! - Chunk store: self-describing containers with per-chunk placeholders
//! - Durable etag and root tables
//! - Lazy expression parsing and evaluation

pub mod container;
pub mod error;
pub mod expr;
pub mod grid;
pub mod model;
pub mod state;

pub use container::{ChunkStore, Container, NdArray};
pub use error::{Error, Result};
pub use expr::Expr;
pub use grid::{ChunkGrid, DimRange, Slice, SliceSpec};
pub use model::{
    ArrayMeta, ByteStreamMeta, DType, DatasetMeta, DatasetPath, LazyExprMeta, Root, SCRATCH_ROOT,
};
pub use state::{EtagTable, RootTable};
