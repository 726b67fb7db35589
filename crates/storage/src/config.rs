//! Storage-facing configuration snapshot.
//!
//! The server hands the engine an immutable copy of the fields it cares
//! about; hot-reloadable knobs stay on the server side.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::{GIB, MIB};

/// Namespace assumed by admin connections before any token binds them
/// elsewhere.
pub const DEFAULT_NAMESPACE: &[u8] = b"__namespace";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_dir: PathBuf,
    pub backup_dir: PathBuf,
    /// GiB; zero means unlimited.
    pub max_db_size: u64,
    /// MiB/s for compaction and flush I/O; zero selects the built-in cap.
    pub max_io_mb: u64,
    /// Maintain the slot reverse index for the sharded front-end.
    pub codis_enabled: bool,
    pub rocksdb: RocksDbConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("/tmp/sediment/db"),
            backup_dir: PathBuf::from("/tmp/sediment/backup"),
            max_db_size: 0,
            max_io_mb: 500,
            codis_enabled: false,
            rocksdb: RocksDbConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Snappy,
    Lz4,
    Zstd,
}

impl From<CompressionType> for rocksdb::DBCompressionType {
    fn from(v: CompressionType) -> Self {
        match v {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    pub metadata_block_cache_size: u64,
    pub subkey_block_cache_size: u64,
    pub max_open_files: i32,
    pub write_buffer_size: u64,
    pub max_write_buffer_number: i32,
    pub max_background_jobs: i32,
    pub max_sub_compactions: u32,
    pub compression: CompressionType,
    pub enable_pipelined_write: bool,
    pub delayed_write_rate: u64,
    pub compaction_readahead_size: u64,
    pub target_file_size_base: u64,
    pub wal_ttl_seconds: u64,
    pub wal_size_limit_mb: u64,
    pub level0_slowdown_writes_trigger: i32,
    pub level0_stop_writes_trigger: i32,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            metadata_block_cache_size: 4 * GIB,
            subkey_block_cache_size: 8 * GIB,
            max_open_files: 4096,
            write_buffer_size: 256 * MIB,
            max_write_buffer_number: 2,
            max_background_jobs: 4,
            max_sub_compactions: 1,
            compression: CompressionType::Snappy,
            enable_pipelined_write: true,
            delayed_write_rate: 0,
            compaction_readahead_size: 2 * MIB,
            target_file_size_base: 256 * MIB,
            wal_ttl_seconds: 7 * 24 * 3600,
            wal_size_limit_mb: 5 * 1024,
            level0_slowdown_writes_trigger: 20,
            level0_stop_writes_trigger: 36,
        }
    }
}
