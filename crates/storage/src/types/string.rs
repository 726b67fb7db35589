//! String type: the payload lives inline after the metadata header, so every
//! operation is a single metadata-column-family access.

use std::sync::Arc;

use crate::engine::{cf_handle, ColumnFamilyId, Storage, TypedBatch};
use crate::error::{Error, Result};
use crate::metadata::{now_secs, Metadata, RedisType, METADATA_HEADER_SIZE};
use crate::types::{Database, LatestSnapshot};

pub struct StringDb {
    base: Database,
}

impl StringDb {
    pub fn new(storage: Arc<Storage>, namespace: &[u8]) -> Result<Self> {
        Ok(Self {
            base: Database::new(storage, namespace)?,
        })
    }

    fn get_value(&self, ns_key: &[u8]) -> Result<Vec<u8>> {
        let bytes = self.base.get_raw_metadata(ns_key)?;
        let metadata = Metadata::decode(&bytes)?;
        if metadata.expired() {
            return Err(Error::NotFound);
        }
        if metadata.kind != RedisType::String {
            return Err(Error::WrongType);
        }
        Ok(bytes[METADATA_HEADER_SIZE..].to_vec())
    }

    fn encode_value(expire: u32, payload: &[u8]) -> Vec<u8> {
        let mut metadata = Metadata::new(RedisType::String);
        metadata.expire = expire;
        metadata.size = payload.len() as u64;
        let mut bytes = metadata.encode();
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Overwrite regardless of the previous type; the orphaned subkeys of a
    /// replaced container are reclaimed by compaction.
    fn update(&self, user_key: &[u8], payload: &[u8], expire: u32, nx: bool, xx: bool) -> Result<bool> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        if nx || xx {
            let alive = self.base.exists(&[user_key])? > 0;
            if (nx && alive) || (xx && !alive) {
                return Ok(false);
            }
        }
        let mut batch = TypedBatch::new();
        batch.put(
            ColumnFamilyId::Metadata,
            ns_key,
            Self::encode_value(expire, payload),
        );
        self.base.storage.write(batch)?;
        Ok(true)
    }

    pub fn get(&self, user_key: &[u8]) -> Result<Vec<u8>> {
        self.get_value(&self.base.ns_key(user_key))
    }

    pub fn set(&self, user_key: &[u8], value: &[u8]) -> Result<()> {
        self.update(user_key, value, 0, false, false).map(|_| ())
    }

    pub fn set_with_options(
        &self,
        user_key: &[u8],
        value: &[u8],
        ttl_secs: u64,
        nx: bool,
        xx: bool,
    ) -> Result<bool> {
        let expire = if ttl_secs > 0 {
            now_secs().saturating_add(ttl_secs as u32)
        } else {
            0
        };
        self.update(user_key, value, expire, nx, xx)
    }

    pub fn setex(&self, user_key: &[u8], value: &[u8], ttl_secs: u64) -> Result<()> {
        self.set_with_options(user_key, value, ttl_secs, false, false)
            .map(|_| ())
    }

    pub fn setnx(&self, user_key: &[u8], value: &[u8]) -> Result<bool> {
        self.update(user_key, value, 0, true, false)
    }

    pub fn getset(&self, user_key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let old = match self.get_value(&ns_key) {
            Ok(old) => Some(old),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Metadata, ns_key, Self::encode_value(0, value));
        self.base.storage.write(batch)?;
        Ok(old)
    }

    pub fn strlen(&self, user_key: &[u8]) -> Result<usize> {
        Ok(self.get(user_key)?.len())
    }

    /// Arithmetic on the decimal payload; the key's expiry survives.
    pub fn incr_by(&self, user_key: &[u8], delta: i64) -> Result<i64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let (expire, old) = self.live_payload(&ns_key)?;
        let current: i64 = if old.is_empty() {
            0
        } else {
            std::str::from_utf8(&old)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::NotOk("value is not an integer or out of range".into()))?
        };
        let updated = current
            .checked_add(delta)
            .ok_or_else(|| Error::NotOk("increment or decrement would overflow".into()))?;

        let mut batch = TypedBatch::new();
        batch.put(
            ColumnFamilyId::Metadata,
            ns_key,
            Self::encode_value(expire, updated.to_string().as_bytes()),
        );
        self.base.storage.write(batch)?;
        Ok(updated)
    }

    pub fn append(&self, user_key: &[u8], tail: &[u8]) -> Result<usize> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let (expire, mut payload) = self.live_payload(&ns_key)?;
        payload.extend_from_slice(tail);
        let len = payload.len();
        let mut batch = TypedBatch::new();
        batch.put(
            ColumnFamilyId::Metadata,
            ns_key,
            Self::encode_value(expire, &payload),
        );
        self.base.storage.write(batch)?;
        Ok(len)
    }

    // Current (expire, payload) for read-modify-write; a missing or expired
    // key reads as an empty payload without expiry.
    fn live_payload(&self, ns_key: &[u8]) -> Result<(u32, Vec<u8>)> {
        let bytes = match self.base.get_raw_metadata(ns_key) {
            Ok(bytes) => bytes,
            Err(Error::NotFound) => return Ok((0, Vec::new())),
            Err(e) => return Err(e),
        };
        let metadata = Metadata::decode(&bytes)?;
        if metadata.expired() {
            return Ok((0, Vec::new()));
        }
        if metadata.kind != RedisType::String {
            return Err(Error::WrongType);
        }
        Ok((metadata.expire, bytes[METADATA_HEADER_SIZE..].to_vec()))
    }

    pub fn mget(&self, user_keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Metadata)?;
        let mut values = Vec::with_capacity(user_keys.len());
        for user_key in user_keys {
            let ns_key = self.base.ns_key(user_key);
            let value = self
                .base
                .db
                .get_cf_opt(&cf, &ns_key, &snapshot.read_options())?
                .and_then(|bytes| {
                    let metadata = Metadata::decode(&bytes).ok()?;
                    if metadata.expired() || metadata.kind != RedisType::String {
                        return None;
                    }
                    Some(bytes[METADATA_HEADER_SIZE..].to_vec())
                });
            values.push(value);
        }
        Ok(values)
    }

    /// All pairs land in one batch under the stripes of every touched key.
    pub fn mset(&self, pairs: &[(&[u8], &[u8])]) -> Result<()> {
        let ns_keys: Vec<Vec<u8>> = pairs.iter().map(|(k, _)| self.base.ns_key(k)).collect();
        let _guards = self.base.storage.lock_manager().multi_lock(ns_keys.iter());

        let mut batch = TypedBatch::new();
        for ((_, value), ns_key) in pairs.iter().zip(ns_keys) {
            batch.put(ColumnFamilyId::Metadata, ns_key, Self::encode_value(0, value));
        }
        self.base.storage.write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_util::TestStorage;

    fn string_db(t: &TestStorage) -> StringDb {
        StringDb::new(t.storage_arc(), b"ns").unwrap()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let t = TestStorage::open();
        let sdb = string_db(&t);
        assert!(matches!(sdb.get(b"k"), Err(Error::NotFound)));
        sdb.set(b"k", b"hello").unwrap();
        assert_eq!(sdb.get(b"k").unwrap(), b"hello");
        assert_eq!(sdb.strlen(b"k").unwrap(), 5);
    }

    #[test]
    fn test_setnx_and_xx() {
        let t = TestStorage::open();
        let sdb = string_db(&t);
        assert!(sdb.setnx(b"k", b"a").unwrap());
        assert!(!sdb.setnx(b"k", b"b").unwrap());
        assert_eq!(sdb.get(b"k").unwrap(), b"a");

        assert!(!sdb
            .set_with_options(b"other", b"v", 0, false, true)
            .unwrap());
        assert!(sdb.set_with_options(b"k", b"c", 0, false, true).unwrap());
        assert_eq!(sdb.get(b"k").unwrap(), b"c");
    }

    #[test]
    fn test_setex_expires() {
        let t = TestStorage::open();
        let sdb = string_db(&t);
        sdb.setex(b"k", b"v", 100).unwrap();
        let db = Database::new(t.storage_arc(), b"ns").unwrap();
        assert!(db.ttl(b"k").unwrap() > 0);

        // simulate the clock passing the deadline
        db.expire(b"k", now_secs() - 1).unwrap();
        assert!(matches!(sdb.get(b"k"), Err(Error::NotFound)));
    }

    #[test]
    fn test_getset() {
        let t = TestStorage::open();
        let sdb = string_db(&t);
        assert_eq!(sdb.getset(b"k", b"1").unwrap(), None);
        assert_eq!(sdb.getset(b"k", b"2").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_incr_by() {
        let t = TestStorage::open();
        let sdb = string_db(&t);
        assert_eq!(sdb.incr_by(b"n", 3).unwrap(), 3);
        assert_eq!(sdb.incr_by(b"n", -5).unwrap(), -2);

        sdb.set(b"s", b"abc").unwrap();
        assert!(matches!(sdb.incr_by(b"s", 1), Err(Error::NotOk(_))));

        sdb.set(b"max", i64::MAX.to_string().as_bytes()).unwrap();
        assert!(matches!(sdb.incr_by(b"max", 1), Err(Error::NotOk(_))));
    }

    #[test]
    fn test_append() {
        let t = TestStorage::open();
        let sdb = string_db(&t);
        assert_eq!(sdb.append(b"k", b"hello").unwrap(), 5);
        assert_eq!(sdb.append(b"k", b" world").unwrap(), 11);
        assert_eq!(sdb.get(b"k").unwrap(), b"hello world");
    }

    #[test]
    fn test_mset_mget() {
        let t = TestStorage::open();
        let sdb = string_db(&t);
        sdb.mset(&[(b"a".as_slice(), b"1".as_slice()), (b"b", b"2")])
            .unwrap();
        let values = sdb.mget(&[b"a", b"missing", b"b"]).unwrap();
        assert_eq!(
            values,
            vec![Some(b"1".to_vec()), None, Some(b"2".to_vec())]
        );
    }

    #[test]
    fn test_set_overwrites_other_type() {
        let t = TestStorage::open();
        let hdb = crate::types::HashDb::new(t.storage_arc(), b"ns").unwrap();
        hdb.set(b"k", b"f", b"v").unwrap();

        let sdb = string_db(&t);
        assert!(matches!(sdb.get(b"k"), Err(Error::WrongType)));
        sdb.set(b"k", b"now a string").unwrap();
        assert_eq!(sdb.get(b"k").unwrap(), b"now a string");
    }
}
