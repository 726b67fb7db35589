//! Persistent storage core
//!
//! Layers typed, expirable Redis data structures on top of RocksDB:
//! - key and metadata encoding over a fixed set of column families
//! - compaction filters that reclaim orphaned subkeys in the background
//! - backup shipping and WAL tailing for replicas
//! - an optional reverse index from hash slot to owned keys

pub mod backup;
pub mod compaction;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod keys;
pub mod lock;
pub mod metadata;
pub mod slot;
pub mod types;

pub use config::{CompressionType, RocksDbConfig, StorageConfig, DEFAULT_NAMESPACE};
pub use engine::{BatchOp, ColumnFamilyId, Db, Storage, TypedBatch};
pub use error::{Error, Result};
pub use metadata::{Metadata, RedisType};
