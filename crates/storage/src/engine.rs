//! Storage engine wrapper
//!
//! Owns the RocksDB handle and the fixed set of column families, routes
//! writes through the slot indexer, gates them on the database size limit,
//! and coordinates shutdown with background readers (compaction filters, the
//! WAL streamer) through a refcount protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, Cache, ColumnFamilyDescriptor, CompactOptions,
    DBWithThreadMode, MultiThreaded, Options, WriteBatch,
};
use tracing::{error, info, warn};

use crate::compaction::{
    MetadataFilterFactory, PubSubFilterFactory, SlotKeyFilterFactory, SubKeyFilterFactory,
};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::slot::SlotIndex;

pub type Db = DBWithThreadMode<MultiThreaded>;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Built-in I/O rate cap applied when `max_io_mb` is zero.
const IO_RATE_LIMIT_MAX_MB: u64 = 1_024_000;

/// Column families in registration order. The order is part of the on-disk
/// contract: handles are addressed by index and must not be reshuffled
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ColumnFamilyId {
    Default = 0,
    Metadata = 1,
    ZSetScore = 2,
    PubSub = 3,
    SlotMetadata = 4,
    Slot = 5,
}

impl ColumnFamilyId {
    pub const ALL: [ColumnFamilyId; 6] = [
        ColumnFamilyId::Default,
        ColumnFamilyId::Metadata,
        ColumnFamilyId::ZSetScore,
        ColumnFamilyId::PubSub,
        ColumnFamilyId::SlotMetadata,
        ColumnFamilyId::Slot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ColumnFamilyId::Default => "default",
            ColumnFamilyId::Metadata => "metadata",
            ColumnFamilyId::ZSetScore => "zset_score",
            ColumnFamilyId::PubSub => "pubsub",
            ColumnFamilyId::SlotMetadata => "slot_metadata",
            ColumnFamilyId::Slot => "slot",
        }
    }
}

pub fn cf_handle<'a>(db: &'a Db, id: ColumnFamilyId) -> Result<Arc<BoundColumnFamily<'a>>> {
    db.cf_handle(id.name())
        .ok_or_else(|| Error::NotOk(format!("missing column family: {}", id.name())))
}

/// One mutation of a write batch. Commands assemble these and the engine
/// folds them into a single RocksDB batch; the slot indexer folds over the
/// same list, so the user write and the reverse index commit together.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        cf: ColumnFamilyId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamilyId,
        key: Vec<u8>,
    },
    DeleteRange {
        cf: ColumnFamilyId,
        begin: Vec<u8>,
        end: Vec<u8>,
    },
}

#[derive(Debug, Default)]
pub struct TypedBatch {
    ops: Vec<BatchOp>,
}

impl TypedBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: ColumnFamilyId, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { cf, key, value });
    }

    pub fn delete(&mut self, cf: ColumnFamilyId, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { cf, key });
    }

    pub fn delete_range(&mut self, cf: ColumnFamilyId, begin: Vec<u8>, end: Vec<u8>) {
        self.ops.push(BatchOp::DeleteRange { cf, begin, end });
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

struct RefState {
    refs: u32,
    closing: bool,
}

/// Shared view of the DB handle for subsystems that read outside the command
/// path. `acquire` fails once shutdown has begun; `close` spin-waits until
/// every outstanding guard is dropped before the handle is destroyed.
pub struct DbHolder {
    db: RwLock<Option<Arc<Db>>>,
    state: Mutex<RefState>,
}

impl DbHolder {
    fn new() -> Self {
        Self {
            db: RwLock::new(None),
            state: Mutex::new(RefState {
                refs: 0,
                closing: true,
            }),
        }
    }

    pub fn db(&self) -> Option<Arc<Db>> {
        self.db.read().clone()
    }

    pub fn acquire(&self) -> Result<DbRefGuard<'_>> {
        self.incr_refs()?;
        Ok(DbRefGuard { holder: self })
    }

    fn incr_refs(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(Error::NotOk("db is closing".into()));
        }
        state.refs += 1;
        Ok(())
    }

    fn decr_refs(&self) {
        let mut state = self.state.lock();
        if state.refs == 0 {
            warn!("db refs was zero");
            return;
        }
        state.refs -= 1;
    }
}

pub struct DbRefGuard<'a> {
    holder: &'a DbHolder,
}

impl Drop for DbRefGuard<'_> {
    fn drop(&mut self) {
        self.holder.decr_refs();
    }
}

pub struct Storage {
    pub(crate) config: Arc<StorageConfig>,
    pub(crate) holder: Arc<DbHolder>,
    reach_db_size_limit: AtomicBool,
    lock_mgr: LockManager,
}

impl Storage {
    pub fn new(config: Arc<StorageConfig>) -> Self {
        Self {
            config,
            holder: Arc::new(DbHolder::new()),
            reach_db_size_limit: AtomicBool::new(false),
            lock_mgr: LockManager::new(16),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_mgr
    }

    pub fn open(&self) -> Result<()> {
        self.open_internal(false)
    }

    pub fn open_for_read_only(&self) -> Result<()> {
        self.open_internal(true)
    }

    fn open_internal(&self, read_only: bool) -> Result<()> {
        {
            let mut state = self.holder.state.lock();
            state.closing = false;
            state.refs = 0;
        }

        let options = self.init_options();
        if !read_only {
            self.create_column_families(&options)?;
        }

        let metadata_table = block_table_options(self.config.rocksdb.metadata_block_cache_size);
        let mut metadata_opts = options.clone();
        metadata_opts.set_block_based_table_factory(&metadata_table);
        metadata_opts.set_compaction_filter_factory(MetadataFilterFactory::new());

        let subkey_table = block_table_options(self.config.rocksdb.subkey_block_cache_size);
        let mut subkey_opts = options.clone();
        subkey_opts.set_block_based_table_factory(&subkey_table);
        subkey_opts.set_compaction_filter_factory(SubKeyFilterFactory::new(self.holder.clone()));

        let mut score_opts = options.clone();
        score_opts.set_block_based_table_factory(&subkey_table);
        score_opts.set_compaction_filter_factory(SubKeyFilterFactory::new(self.holder.clone()));

        let mut pubsub_opts = options.clone();
        pubsub_opts.set_block_based_table_factory(&block_table_options(8 * MIB));
        pubsub_opts.set_compaction_filter_factory(PubSubFilterFactory::new());

        let mut slot_metadata_opts = options.clone();
        slot_metadata_opts.set_block_based_table_factory(&metadata_table);

        let mut slot_opts = options.clone();
        slot_opts.set_block_based_table_factory(&subkey_table);
        slot_opts.set_compaction_filter_factory(SlotKeyFilterFactory::new(self.holder.clone()));

        // Caution: registration order is addressed by index downstream.
        let descriptors = vec![
            ColumnFamilyDescriptor::new(ColumnFamilyId::Default.name(), subkey_opts),
            ColumnFamilyDescriptor::new(ColumnFamilyId::Metadata.name(), metadata_opts),
            ColumnFamilyDescriptor::new(ColumnFamilyId::ZSetScore.name(), score_opts),
            ColumnFamilyDescriptor::new(ColumnFamilyId::PubSub.name(), pubsub_opts),
            ColumnFamilyDescriptor::new(ColumnFamilyId::SlotMetadata.name(), slot_metadata_opts),
            ColumnFamilyDescriptor::new(ColumnFamilyId::Slot.name(), slot_opts),
        ];

        let start = Instant::now();
        let db = if read_only {
            Db::open_cf_descriptors_read_only(&options, &self.config.db_dir, descriptors, false)
        } else {
            Db::open_cf_descriptors(&options, &self.config.db_dir, descriptors)
        };
        let db = match db {
            Ok(db) => db,
            Err(e) => {
                error!(elapsed = ?start.elapsed(), "failed to load the data from disk: {e}");
                return Err(Error::DbOpen(e.into_string()));
            }
        };
        info!(elapsed = ?start.elapsed(), "loaded the data from disk");
        *self.holder.db.write() = Some(Arc::new(db));

        if !read_only {
            let status = SlotIndex::new(self)
                .and_then(|index| index.check_enabled_status(self.config.codis_enabled));
            if let Err(e) = status {
                // a partial open must not leak the handle
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }

    /// First open of a fresh or upgraded directory: make sure every column
    /// family exists before the real open with the full descriptor set.
    fn create_column_families(&self, options: &Options) -> Result<()> {
        let existing = Db::list_cf(options, &self.config.db_dir).unwrap_or_default();
        let missing: Vec<&str> = ColumnFamilyId::ALL
            .iter()
            .map(|cf| cf.name())
            .filter(|name| !existing.iter().any(|have| have == name))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let open_with: Vec<String> = if existing.is_empty() {
            vec![ColumnFamilyId::Default.name().to_string()]
        } else {
            existing
        };
        let db = Db::open_cf(options, &self.config.db_dir, &open_with)
            .map_err(|e| Error::DbOpen(e.into_string()))?;
        for name in missing {
            if name == ColumnFamilyId::Default.name() {
                continue;
            }
            db.create_cf(name, options)
                .map_err(|e| Error::DbOpen(e.into_string()))?;
        }
        Ok(())
    }

    fn init_options(&self) -> Options {
        let cfg = &self.config.rocksdb;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.enable_statistics();
        opts.set_stats_dump_period_sec(0);
        opts.set_max_open_files(cfg.max_open_files);
        opts.set_max_subcompactions(cfg.max_sub_compactions);
        opts.set_max_background_jobs(cfg.max_background_jobs);
        opts.set_max_write_buffer_number(cfg.max_write_buffer_number);
        opts.set_write_buffer_size(cfg.write_buffer_size as usize);
        opts.set_compression_type(cfg.compression.into());
        opts.set_enable_pipelined_write(cfg.enable_pipelined_write);
        opts.set_target_file_size_base(cfg.target_file_size_base);
        opts.set_max_manifest_file_size(64 * MIB as usize);
        opts.set_max_log_file_size(256 * MIB as usize);
        opts.set_keep_log_file_num(12);
        opts.set_wal_ttl_seconds(cfg.wal_ttl_seconds);
        opts.set_wal_size_limit_mb(cfg.wal_size_limit_mb);
        let max_io_mb = if self.config.max_io_mb > 0 {
            self.config.max_io_mb
        } else {
            IO_RATE_LIMIT_MAX_MB
        };
        opts.set_ratelimiter((max_io_mb * MIB) as i64, 100_000, 10);
        if cfg.delayed_write_rate > 0 {
            opts.set_delayed_write_rate(cfg.delayed_write_rate);
        }
        opts.set_compaction_readahead_size(cfg.compaction_readahead_size as usize);
        opts.set_level_zero_slowdown_writes_trigger(cfg.level0_slowdown_writes_trigger);
        opts.set_level_zero_stop_writes_trigger(cfg.level0_stop_writes_trigger);
        opts
    }

    pub fn db(&self) -> Result<Arc<Db>> {
        self.holder
            .db()
            .ok_or_else(|| Error::NotOk("db is not opened".into()))
    }

    pub(crate) fn holder(&self) -> &Arc<DbHolder> {
        &self.holder
    }

    pub fn is_closing(&self) -> bool {
        self.holder.state.lock().closing
    }

    /// Commit one typed batch. When the sharded front-end is active the slot
    /// indexer appends its reverse-index mutations to the same batch first,
    /// so both land atomically or not at all.
    pub fn write(&self, mut batch: TypedBatch) -> Result<()> {
        if self.reach_db_size_limit.load(Ordering::Relaxed) {
            return Err(Error::SpaceLimit);
        }
        if self.config.codis_enabled {
            SlotIndex::new(self)?.index_batch(&mut batch)?;
        }
        self.write_typed(&batch)
    }

    /// Deletes bypass the size gate: reclaiming space must stay possible
    /// while the gate is tripped.
    pub fn delete(&self, cf: ColumnFamilyId, key: &[u8]) -> Result<()> {
        let mut batch = TypedBatch::new();
        batch.delete(cf, key.to_vec());
        if self.config.codis_enabled && cf == ColumnFamilyId::Metadata {
            SlotIndex::new(self)?.index_batch(&mut batch)?;
        }
        self.write_typed(&batch)
    }

    pub fn delete_range(&self, cf: ColumnFamilyId, begin: &[u8], end: &[u8]) -> Result<()> {
        let mut batch = TypedBatch::new();
        batch.delete_range(cf, begin.to_vec(), end.to_vec());
        self.write_typed(&batch)
    }

    fn write_typed(&self, batch: &TypedBatch) -> Result<()> {
        let db = self.db()?;
        let mut wb = WriteBatch::default();
        for op in batch.ops() {
            match op {
                BatchOp::Put { cf, key, value } => wb.put_cf(&cf_handle(&db, *cf)?, key, value),
                BatchOp::Delete { cf, key } => wb.delete_cf(&cf_handle(&db, *cf)?, key),
                BatchOp::DeleteRange { cf, begin, end } => {
                    wb.delete_range_cf(&cf_handle(&db, *cf)?, begin, end)
                }
            }
        }
        db.write(wb)?;
        Ok(())
    }

    /// Apply a batch obtained from a leader's WAL. The leader already folded
    /// its slot-index rows into the batch, so no extraction happens here.
    pub fn apply_replicated_batch(&self, batch: WriteBatch) -> Result<()> {
        if self.reach_db_size_limit.load(Ordering::Relaxed) {
            return Err(Error::SpaceLimit);
        }
        self.db()?.write(batch)?;
        Ok(())
    }

    /// Visit WAL updates since `seq` in order; the visitor returns `false`
    /// to stop early. Used by replicas to catch up.
    pub fn scan_wal(
        &self,
        seq: u64,
        mut visit: impl FnMut(u64, WriteBatch) -> bool,
    ) -> Result<()> {
        let _guard = self
            .holder
            .acquire()
            .map_err(|_| Error::DbGetWal("db is closing".into()))?;
        let db = self.db()?;
        let iter = db
            .get_updates_since(seq)
            .map_err(|e| Error::DbGetWal(e.into_string()))?;
        for item in iter {
            let (batch_seq, batch) = item.map_err(|e| Error::DbGetWal(e.into_string()))?;
            if !visit(batch_seq, batch) {
                break;
            }
        }
        Ok(())
    }

    pub fn latest_seq(&self) -> Result<u64> {
        Ok(self.db()?.latest_sequence_number())
    }

    pub fn wal_has_new_data(&self, seq: u64) -> Result<bool> {
        Ok(seq <= self.latest_seq()?)
    }

    pub fn compact(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let db = self.db()?;
        let mut opts = CompactOptions::default();
        opts.set_change_level(true);
        for cf in ColumnFamilyId::ALL {
            db.compact_range_cf_opt(&cf_handle(&db, cf)?, begin, end, &opts);
        }
        Ok(())
    }

    pub fn get_total_size(&self) -> Result<u64> {
        let db = self.db()?;
        let mut total = 0;
        for cf in ColumnFamilyId::ALL {
            total += db
                .property_int_value_cf(&cf_handle(&db, cf)?, "rocksdb.total-sst-files-size")?
                .unwrap_or(0);
        }
        Ok(total)
    }

    /// Periodic tick: flip the size gate on the over/under-limit transition.
    /// The hot write path only reads the cached flag.
    pub fn check_db_size_limit(&self) -> Result<()> {
        let reached =
            self.config.max_db_size != 0 && self.get_total_size()? >= self.config.max_db_size * GIB;
        if self.reach_db_size_limit.swap(reached, Ordering::Relaxed) != reached {
            if reached {
                warn!(
                    max_db_size_gb = self.config.max_db_size,
                    "reached the database size limit, writes are rejected from now on"
                );
            } else {
                warn!("dropped below the database size limit, writes are accepted again");
            }
        }
        Ok(())
    }

    pub fn incr_db_refs(&self) -> Result<()> {
        self.holder.incr_refs()
    }

    pub fn decr_db_refs(&self) {
        self.holder.decr_refs()
    }

    /// Shutdown: flush the WAL, refuse new background readers, wait for the
    /// outstanding ones to drain, then drop the handle. Compaction filters
    /// can therefore never observe a destroyed handle.
    pub fn close(&self) {
        let Some(db) = self.holder.db() else {
            return;
        };
        if let Err(e) = db.flush_wal(true) {
            error!("failed to sync WAL before close: {e}");
        }
        drop(db);

        self.holder.state.lock().closing = true;
        loop {
            if self.holder.state.lock().refs == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        *self.holder.db.write() = None;
    }

    #[cfg(test)]
    pub(crate) fn force_db_size_limit(&self, reached: bool) {
        self.reach_db_size_limit.store(reached, Ordering::Relaxed);
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.close();
    }
}

fn block_table_options(cache_size: u64) -> BlockBasedOptions {
    let mut table_opts = BlockBasedOptions::default();
    table_opts.set_bloom_filter(10.0, true);
    table_opts.set_block_cache(&Cache::new_lru_cache(cache_size as usize));
    table_opts.set_cache_index_and_filter_blocks(true);
    table_opts.set_pin_l0_filter_and_index_blocks_in_cache(true);
    table_opts
}


#[cfg(test)]
mod tests {
    use super::test_util::TestStorage;
    use super::*;

    #[test]
    fn test_open_creates_all_column_families() {
        let t = TestStorage::open();
        let db = t.storage.db().unwrap();
        for cf in ColumnFamilyId::ALL {
            assert!(cf_handle(&db, cf).is_ok(), "missing {}", cf.name());
        }
    }

    #[test]
    fn test_typed_batch_commits_across_column_families() {
        let t = TestStorage::open();
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Metadata, b"m".to_vec(), b"1".to_vec());
        batch.put(ColumnFamilyId::Default, b"s".to_vec(), b"2".to_vec());
        t.storage.write(batch).unwrap();

        let db = t.storage.db().unwrap();
        let meta_cf = cf_handle(&db, ColumnFamilyId::Metadata).unwrap();
        let default_cf = cf_handle(&db, ColumnFamilyId::Default).unwrap();
        assert_eq!(db.get_cf(&meta_cf, b"m").unwrap().unwrap(), b"1");
        assert_eq!(db.get_cf(&default_cf, b"s").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_delete_and_delete_range() {
        let t = TestStorage::open();
        for key in [b"a", b"b", b"c"] {
            let mut batch = TypedBatch::new();
            batch.put(ColumnFamilyId::Default, key.to_vec(), b"v".to_vec());
            t.storage.write(batch).unwrap();
        }
        t.storage.delete(ColumnFamilyId::Default, b"c").unwrap();
        t.storage
            .delete_range(ColumnFamilyId::Default, b"a", b"b")
            .unwrap();

        let db = t.storage.db().unwrap();
        let cf = cf_handle(&db, ColumnFamilyId::Default).unwrap();
        assert!(db.get_cf(&cf, b"a").unwrap().is_none());
        assert_eq!(db.get_cf(&cf, b"b").unwrap().unwrap(), b"v");
        assert!(db.get_cf(&cf, b"c").unwrap().is_none());
    }

    #[test]
    fn test_size_gate_rejects_writes_until_cleared() {
        let t = TestStorage::open();
        t.storage.force_db_size_limit(true);

        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Default, b"k".to_vec(), b"v".to_vec());
        assert!(matches!(t.storage.write(batch), Err(Error::SpaceLimit)));
        // deletes still pass so the condition can heal
        t.storage.delete(ColumnFamilyId::Default, b"k").unwrap();

        // max_db_size is 0 in tests, so the tick clears the gate
        t.storage.check_db_size_limit().unwrap();
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Default, b"k".to_vec(), b"v".to_vec());
        t.storage.write(batch).unwrap();
    }

    #[test]
    fn test_refcount_blocks_after_close_begins() {
        let t = TestStorage::open();
        t.storage.incr_db_refs().unwrap();
        t.storage.decr_db_refs();

        t.storage.close();
        assert!(t.storage.incr_db_refs().is_err());
    }

    #[test]
    fn test_wal_scan_sees_committed_batches() {
        let t = TestStorage::open();
        let since = t.storage.latest_seq().unwrap();
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Default, b"w".to_vec(), b"1".to_vec());
        t.storage.write(batch).unwrap();

        assert!(t.storage.wal_has_new_data(since + 1).unwrap());
        let mut batches = 0;
        t.storage
            .scan_wal(since, |_, _| {
                batches += 1;
                true
            })
            .unwrap();
        assert!(batches >= 1);
    }

    // Follower catch-up: batches tailed from the leader's WAL and applied
    // through the write path reproduce the leader's state.
    #[test]
    fn test_wal_replication_roundtrip() {
        let leader = TestStorage::open();
        let follower = TestStorage::open();

        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Metadata, b"m".to_vec(), b"meta".to_vec());
        batch.put(ColumnFamilyId::Default, b"s".to_vec(), b"sub".to_vec());
        leader.storage.write(batch).unwrap();

        leader
            .storage
            .scan_wal(0, |_, wal_batch| {
                follower.storage.apply_replicated_batch(wal_batch).unwrap();
                true
            })
            .unwrap();

        let db = follower.storage.db().unwrap();
        let meta_cf = cf_handle(&db, ColumnFamilyId::Metadata).unwrap();
        let default_cf = cf_handle(&db, ColumnFamilyId::Default).unwrap();
        assert_eq!(db.get_cf(&meta_cf, b"m").unwrap().unwrap(), b"meta");
        assert_eq!(db.get_cf(&default_cf, b"s").unwrap().unwrap(), b"sub");
    }

    #[test]
    fn test_reopen_preserves_data() {
        let config = TestStorage::config(false);
        let t = TestStorage::open_with(config.clone());
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Metadata, b"k".to_vec(), b"v".to_vec());
        t.storage.write(batch).unwrap();
        t.storage.close();

        t.storage.open().unwrap();
        let db = t.storage.db().unwrap();
        let cf = cf_handle(&db, ColumnFamilyId::Metadata).unwrap();
        assert_eq!(db.get_cf(&cf, b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_total_size_and_compact() {
        let t = TestStorage::open();
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Default, b"x".to_vec(), vec![0u8; 1024]);
        t.storage.write(batch).unwrap();
        t.storage.compact(None, None).unwrap();
        // no limit configured, the gate must stay open
        t.storage.check_db_size_limit().unwrap();
        let _ = t.storage.get_total_size().unwrap();
    }
}
