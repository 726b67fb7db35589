//! Compaction filters
//!
//! One filter per column family. Subkeys carry the owning metadata's version
//! in their key; the filters drop records whose owner is gone, expired, or
//! rewritten, which is what makes O(1) logical deletes safe. Filters read the
//! database outside the command path, so every lookup goes through the
//! engine's refcount protocol; when anything looks wrong the safe default is
//! to keep the record.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use rocksdb::compaction_filter::{CompactionFilter, Decision};
use rocksdb::compaction_filter_factory::{CompactionFilterContext, CompactionFilterFactory};
use tracing::{debug, error, warn};

use crate::encoding::put_u32;
use crate::engine::{cf_handle, ColumnFamilyId, DbHolder};
use crate::error::{Error, Result};
use crate::keys::InternalKey;
use crate::metadata::{now_micros, Metadata, RedisType, VERSION_COUNTER_BITS};
use crate::slot::{slot_num_for_key, SlotInternalKey, SlotMetadata};
use crate::types::bitmap::is_empty_segment;

/// Pub-sub records older than this are dropped; subscribers and replicas
/// have long since consumed them.
const PUBSUB_STALE_SECS: u64 = 60;

fn cstring(name: &str) -> CString {
    CString::new(name).unwrap_or_default()
}

pub struct MetadataFilter {
    name: CString,
}

impl CompactionFilter for MetadataFilter {
    fn filter(&mut self, _level: u32, key: &[u8], value: &[u8]) -> Decision {
        match Metadata::decode(value) {
            Ok(metadata) => {
                if metadata.expired() {
                    debug!(key = ?key, "dropping expired metadata");
                    Decision::Remove
                } else {
                    Decision::Keep
                }
            }
            Err(e) => {
                warn!(key = ?key, "failed to decode metadata during compaction: {e}");
                Decision::Keep
            }
        }
    }

    fn name(&self) -> &CStr {
        &self.name
    }
}

pub struct MetadataFilterFactory {
    name: CString,
}

impl MetadataFilterFactory {
    pub fn new() -> Self {
        Self {
            name: cstring("metadata_filter_factory"),
        }
    }
}

impl Default for MetadataFilterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CompactionFilterFactory for MetadataFilterFactory {
    type Filter = MetadataFilter;

    fn create(&mut self, _context: CompactionFilterContext) -> Self::Filter {
        MetadataFilter {
            name: cstring("metadata_filter"),
        }
    }

    fn name(&self) -> &CStr {
        &self.name
    }
}

/// Filter for the default and zset-score column families: keep a subkey iff
/// its owning metadata exists, is live, and records the same version.
///
/// The parent lookup is cached on the composed metadata key and reused while
/// consecutive subkeys share it; compaction visits keys in order, so runs of
/// the same logical key cost one metadata read.
pub struct SubKeyFilter {
    name: CString,
    holder: Arc<DbHolder>,
    cached_key: Vec<u8>,
    cached_metadata: Option<Vec<u8>>,
}

impl SubKeyFilter {
    pub(crate) fn new(holder: Arc<DbHolder>) -> Self {
        Self {
            name: cstring("subkey_filter"),
            holder,
            cached_key: Vec::new(),
            cached_metadata: None,
        }
    }

    fn is_stale(&mut self, ikey: &InternalKey, value: &[u8]) -> Result<bool> {
        if self.cached_key.as_slice() != ikey.ns_key() {
            let _guard = self.holder.acquire()?;
            let db = self
                .holder
                .db()
                .ok_or_else(|| Error::NotOk("db is not opened".into()))?;
            let cf = cf_handle(&db, ColumnFamilyId::Metadata)?;
            match db.get_cf(&cf, ikey.ns_key()) {
                Ok(bytes) => {
                    self.cached_key = ikey.ns_key().to_vec();
                    self.cached_metadata = bytes;
                }
                Err(e) => {
                    self.cached_key.clear();
                    self.cached_metadata = None;
                    return Err(e.into());
                }
            }
        }
        let Some(bytes) = self.cached_metadata.as_deref() else {
            // metadata was deleted, by compaction or by hand
            return Ok(true);
        };
        let metadata = match Metadata::decode(bytes) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.cached_key.clear();
                return Err(e);
            }
        };
        // a string overwrote the container, the owner expired, or the owner
        // was recreated under a newer version
        Ok(metadata.kind == RedisType::String
            || metadata.expired()
            || ikey.version() != metadata.version
            || (metadata.kind == RedisType::Bitmap && is_empty_segment(value)))
    }
}

impl CompactionFilter for SubKeyFilter {
    fn filter(&mut self, _level: u32, key: &[u8], value: &[u8]) -> Decision {
        let ikey = match InternalKey::parse(key) {
            Ok(ikey) => ikey,
            Err(e) => {
                warn!(key = ?key, "undecodable subkey during compaction: {e}");
                return Decision::Keep;
            }
        };
        match self.is_stale(&ikey, value) {
            Ok(true) => Decision::Remove,
            Ok(false) => Decision::Keep,
            Err(e) => {
                error!(key = ?key, "failed to fetch metadata during compaction: {e}");
                Decision::Keep
            }
        }
    }

    fn name(&self) -> &CStr {
        &self.name
    }
}

pub struct SubKeyFilterFactory {
    name: CString,
    holder: Arc<DbHolder>,
}

impl SubKeyFilterFactory {
    pub(crate) fn new(holder: Arc<DbHolder>) -> Self {
        Self {
            name: cstring("subkey_filter_factory"),
            holder,
        }
    }
}

impl CompactionFilterFactory for SubKeyFilterFactory {
    type Filter = SubKeyFilter;

    fn create(&mut self, _context: CompactionFilterContext) -> Self::Filter {
        SubKeyFilter::new(self.holder.clone())
    }

    fn name(&self) -> &CStr {
        &self.name
    }
}

pub struct PubSubFilter {
    name: CString,
}

impl CompactionFilter for PubSubFilter {
    fn filter(&mut self, _level: u32, key: &[u8], _value: &[u8]) -> Decision {
        if key.len() < 8 {
            return Decision::Remove;
        }
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&key[key.len() - 8..]);
        // the stamp is a version: microseconds above the counter bits
        let published_at = u64::from_be_bytes(stamp) >> VERSION_COUNTER_BITS;
        if now_micros().saturating_sub(published_at) >= PUBSUB_STALE_SECS * 1_000_000 {
            Decision::Remove
        } else {
            Decision::Keep
        }
    }

    fn name(&self) -> &CStr {
        &self.name
    }
}

pub struct PubSubFilterFactory {
    name: CString,
}

impl PubSubFilterFactory {
    pub fn new() -> Self {
        Self {
            name: cstring("pubsub_filter_factory"),
        }
    }
}

impl Default for PubSubFilterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CompactionFilterFactory for PubSubFilterFactory {
    type Filter = PubSubFilter;

    fn create(&mut self, _context: CompactionFilterContext) -> Self::Filter {
        PubSubFilter {
            name: cstring("pubsub_filter"),
        }
    }

    fn name(&self) -> &CStr {
        &self.name
    }
}

/// Filter for the slot column family: drop reverse-index rows whose slot
/// metadata is gone or records a newer version.
pub struct SlotKeyFilter {
    name: CString,
    holder: Arc<DbHolder>,
    cached_key: Vec<u8>,
    cached_metadata: Option<Vec<u8>>,
}

impl SlotKeyFilter {
    pub(crate) fn new(holder: Arc<DbHolder>) -> Self {
        Self {
            name: cstring("slot_key_filter"),
            holder,
            cached_key: Vec::new(),
            cached_metadata: None,
        }
    }

    fn is_stale(&mut self, ikey: &SlotInternalKey) -> Result<bool> {
        let mut metadata_key = Vec::with_capacity(4);
        put_u32(&mut metadata_key, slot_num_for_key(ikey.key()));
        if self.cached_key != metadata_key {
            let _guard = self.holder.acquire()?;
            let db = self
                .holder
                .db()
                .ok_or_else(|| Error::NotOk("db is not opened".into()))?;
            let cf = cf_handle(&db, ColumnFamilyId::SlotMetadata)?;
            match db.get_cf(&cf, &metadata_key) {
                Ok(bytes) => {
                    self.cached_key = metadata_key;
                    self.cached_metadata = bytes;
                }
                Err(e) => {
                    self.cached_key.clear();
                    self.cached_metadata = None;
                    return Err(e.into());
                }
            }
        }
        let Some(bytes) = self.cached_metadata.as_deref() else {
            return Ok(true);
        };
        let metadata = match SlotMetadata::decode(bytes) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.cached_key.clear();
                return Err(e);
            }
        };
        Ok(ikey.version() != metadata.version)
    }
}

impl CompactionFilter for SlotKeyFilter {
    fn filter(&mut self, _level: u32, key: &[u8], _value: &[u8]) -> Decision {
        let ikey = match SlotInternalKey::parse(key) {
            Ok(ikey) => ikey,
            Err(e) => {
                warn!(key = ?key, "undecodable slot key during compaction: {e}");
                return Decision::Keep;
            }
        };
        match self.is_stale(&ikey) {
            Ok(true) => Decision::Remove,
            Ok(false) => Decision::Keep,
            Err(e) => {
                error!(key = ?key, "failed to fetch slot metadata during compaction: {e}");
                Decision::Keep
            }
        }
    }

    fn name(&self) -> &CStr {
        &self.name
    }
}

pub struct SlotKeyFilterFactory {
    name: CString,
    holder: Arc<DbHolder>,
}

impl SlotKeyFilterFactory {
    pub(crate) fn new(holder: Arc<DbHolder>) -> Self {
        Self {
            name: cstring("slot_key_filter_factory"),
            holder,
        }
    }
}

impl CompactionFilterFactory for SlotKeyFilterFactory {
    type Filter = SlotKeyFilter;

    fn create(&mut self, _context: CompactionFilterContext) -> Self::Filter {
        SlotKeyFilter::new(self.holder.clone())
    }

    fn name(&self) -> &CStr {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_util::TestStorage;
    use crate::engine::TypedBatch;
    use crate::keys::compose_namespace_key;

    fn put_metadata(t: &TestStorage, ns_key: &[u8], metadata: &Metadata) {
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Metadata, ns_key.to_vec(), metadata.encode());
        t.storage.write(batch).unwrap();
    }

    #[test]
    fn test_metadata_filter_decisions() {
        let mut filter = MetadataFilter {
            name: cstring("metadata_filter"),
        };
        let live = Metadata::new(RedisType::Hash);
        assert!(matches!(
            filter.filter(0, b"k", &live.encode()),
            Decision::Keep
        ));

        let mut dead = Metadata::new(RedisType::Hash);
        dead.expire = 1;
        assert!(matches!(
            filter.filter(0, b"k", &dead.encode()),
            Decision::Remove
        ));

        // corruption keeps the record: false positives only cost space
        assert!(matches!(filter.filter(0, b"k", b"xy"), Decision::Keep));
    }

    #[test]
    fn test_subkey_filter_keeps_live_and_drops_stale() {
        let t = TestStorage::open();
        let ns_key = compose_namespace_key(b"ns", b"h");
        let mut metadata = Metadata::new(RedisType::Hash);
        metadata.size = 1;
        put_metadata(&t, &ns_key, &metadata);

        let mut filter = SubKeyFilter::new(t.storage.holder().clone());
        let live = InternalKey::new(&ns_key, b"f", metadata.version).encode();
        assert!(matches!(filter.filter(0, &live, b"v"), Decision::Keep));

        let stale = InternalKey::new(&ns_key, b"f", metadata.version - 1).encode();
        assert!(matches!(filter.filter(0, &stale, b"v"), Decision::Remove));

        let orphan_ns_key = compose_namespace_key(b"ns", b"gone");
        let orphan = InternalKey::new(&orphan_ns_key, b"f", 1).encode();
        assert!(matches!(filter.filter(0, &orphan, b"v"), Decision::Remove));
    }

    #[test]
    fn test_subkey_filter_drops_after_string_overwrite_and_expiry() {
        let t = TestStorage::open();
        let ns_key = compose_namespace_key(b"ns", b"k");
        let mut hash = Metadata::new(RedisType::Hash);
        hash.size = 1;
        let sub = InternalKey::new(&ns_key, b"f", hash.version).encode();

        let mut string = Metadata::new(RedisType::String);
        string.version = hash.version;
        put_metadata(&t, &ns_key, &string);
        let mut filter = SubKeyFilter::new(t.storage.holder().clone());
        assert!(matches!(filter.filter(0, &sub, b"v"), Decision::Remove));

        let mut expired = hash;
        expired.expire = 1;
        put_metadata(&t, &ns_key, &expired);
        let mut filter = SubKeyFilter::new(t.storage.holder().clone());
        assert!(matches!(filter.filter(0, &sub, b"v"), Decision::Remove));
    }

    #[test]
    fn test_subkey_filter_drops_all_zero_bitmap_segment() {
        let t = TestStorage::open();
        let ns_key = compose_namespace_key(b"ns", b"b");
        let mut metadata = Metadata::new(RedisType::Bitmap);
        metadata.size = 4;
        put_metadata(&t, &ns_key, &metadata);

        let sub = InternalKey::new(&ns_key, &0u32.to_be_bytes(), metadata.version).encode();
        let mut filter = SubKeyFilter::new(t.storage.holder().clone());
        assert!(matches!(
            filter.filter(0, &sub, &[0, 0, 0, 0]),
            Decision::Remove
        ));
        assert!(matches!(filter.filter(0, &sub, &[0, 8, 0, 0]), Decision::Keep));
    }

    // The cache is keyed on the full composed metadata key; switching to a
    // different logical key must refetch, not reuse.
    #[test]
    fn test_subkey_filter_cache_invalidation_across_keys() {
        let t = TestStorage::open();
        let live_key = compose_namespace_key(b"ns", b"live");
        let mut live = Metadata::new(RedisType::Set);
        live.size = 1;
        put_metadata(&t, &live_key, &live);
        let gone_key = compose_namespace_key(b"ns", b"gone");

        let mut filter = SubKeyFilter::new(t.storage.holder().clone());
        let live_sub = InternalKey::new(&live_key, b"m", live.version).encode();
        let gone_sub = InternalKey::new(&gone_key, b"m", live.version).encode();
        assert!(matches!(filter.filter(0, &live_sub, b""), Decision::Keep));
        assert!(matches!(filter.filter(0, &gone_sub, b""), Decision::Remove));
        // and back again, still correct
        assert!(matches!(filter.filter(0, &live_sub, b""), Decision::Keep));
    }

    #[test]
    fn test_subkey_filter_keeps_everything_while_closing() {
        let t = TestStorage::open();
        let ns_key = compose_namespace_key(b"ns", b"gone");
        let sub = InternalKey::new(&ns_key, b"f", 1).encode();

        t.storage.close();
        let mut filter = SubKeyFilter::new(t.storage.holder().clone());
        assert!(matches!(filter.filter(0, &sub, b"v"), Decision::Keep));
    }

    #[test]
    fn test_pubsub_filter_staleness() {
        let mut filter = PubSubFilter {
            name: cstring("pubsub_filter"),
        };
        let mut fresh = b"chan".to_vec();
        fresh.extend_from_slice(&crate::metadata::generate_version().to_be_bytes());
        assert!(matches!(filter.filter(0, &fresh, b"m"), Decision::Keep));

        let mut stale = b"chan".to_vec();
        stale.extend_from_slice(&(1u64 << VERSION_COUNTER_BITS).to_be_bytes());
        assert!(matches!(filter.filter(0, &stale, b"m"), Decision::Remove));

        assert!(matches!(filter.filter(0, b"x", b"m"), Decision::Remove));
    }

    #[test]
    fn test_slot_filter_decisions() {
        let t = TestStorage::open();
        let user_key = b"some-key";
        let slot = slot_num_for_key(user_key);
        let metadata = SlotMetadata::new();
        let mut metadata_key = Vec::new();
        put_u32(&mut metadata_key, slot);
        let mut batch = TypedBatch::new();
        batch.put(
            ColumnFamilyId::SlotMetadata,
            metadata_key,
            metadata.encode(),
        );
        t.storage.write(batch).unwrap();

        let mut filter = SlotKeyFilter::new(t.storage.holder().clone());
        let live = SlotInternalKey::new(user_key, metadata.version).encode();
        assert!(matches!(filter.filter(0, &live, b""), Decision::Keep));

        let stale = SlotInternalKey::new(user_key, metadata.version - 1).encode();
        assert!(matches!(filter.filter(0, &stale, b""), Decision::Remove));

        let unindexed = SlotInternalKey::new(b"other-key", 7).encode();
        assert!(matches!(filter.filter(0, &unindexed, b""), Decision::Remove));
    }
}
