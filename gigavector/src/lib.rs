//! GigaVector storage and indexing core.
//!
//! This crate provides the embedded, durable, concurrently-accessible
//! pieces of a vector database: the columnar primary store, a metadata
//! inverted index, the HNSW and IVF-PQ approximate nearest-neighbour
//! indices, a write-ahead log with checkpointed snapshots, and an MVCC
//! conditional-mutation layer on top of the whole thing.
//!
//! # Layering
//!
//! ```text
//! Database (facade, rwlock, WAL, snapshot I/O)
//!   |-- VectorStorage      (columnar SoA, append-only, soft delete)
//!   |-- Index              (Hnsw | IvfPq)
//!   |-- MetadataIndex      (inverted (key,value) -> ids)
//!   `-- ConditionalManager (per-id version slots, CAS-style mutation)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use gigavector::{Database, DistanceMetric, IndexKind};
//!
//! # fn example() -> gigavector::Result<()> {
//! let mut db = Database::create_in_memory(128, DistanceMetric::Cosine, IndexKind::Hnsw(Default::default()))?;
//! let id = db.add(vec![0.1; 128])?;
//! let results = db.search(&vec![0.1; 128], 10, None)?;
//! # let _ = (id, results);
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod distance;
pub mod hnsw;
pub mod ivfpq;
pub mod metadata_index;
pub mod mvcc;
pub mod storage;
pub mod types;
pub mod vector;
pub mod wal;

pub use db::Database;
pub use distance::DistanceMetric;
pub use hnsw::{HnswConfig, HnswIndex};
pub use ivfpq::{IvfPqConfig, IvfPqIndex};
pub use mvcc::{ConditionalManager, MutationCondition, MutationOutcome};
pub use types::{IndexKind, SearchResult, VectorId};
pub use vector::Metadata;

/// Errors surfaced by every fallible operation in this crate. Storage,
/// indexing, WAL/snapshot I/O, and the MVCC layer all report through these
/// variants rather than inventing their own.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector id {0} out of range")]
    OutOfRange(VectorId),

    #[error("index must be trained before this operation")]
    NotTrained,

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("corrupt write-ahead log: {0}")]
    CorruptWal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("conditional mutation conflict on vector {0}")]
    Conflict(VectorId),

    #[error("condition not satisfied for vector {0}")]
    ConditionFailed(VectorId),

    #[error("vector {0} not found")]
    NotFound(VectorId),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
