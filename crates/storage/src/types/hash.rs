//! Hash type: one subkey per field.

use std::sync::Arc;

use crate::engine::{cf_handle, ColumnFamilyId, Storage, TypedBatch};
use crate::error::{Error, Result};
use crate::keys::InternalKey;
use crate::metadata::{Metadata, RedisType};
use crate::types::{Database, LatestSnapshot};

pub struct HashDb {
    base: Database,
}

impl HashDb {
    pub fn new(storage: Arc<Storage>, namespace: &[u8]) -> Result<Self> {
        Ok(Self {
            base: Database::new(storage, namespace)?,
        })
    }

    pub fn get(&self, user_key: &[u8], field: &[u8]) -> Result<Vec<u8>> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = self.base.get_metadata(RedisType::Hash, &ns_key)?;
        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let key = InternalKey::new(&ns_key, field, metadata.version).encode();
        self.base
            .db
            .get_cf_opt(&cf, &key, &snapshot.read_options())?
            .ok_or(Error::NotFound)
    }

    pub fn mget(&self, user_key: &[u8], fields: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = match self.base.get_metadata(RedisType::Hash, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(vec![None; fields.len()]),
            Err(e) => return Err(e),
        };
        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            let key = InternalKey::new(&ns_key, field, metadata.version).encode();
            values.push(
                self.base
                    .db
                    .get_cf_opt(&cf, &key, &snapshot.read_options())?,
            );
        }
        Ok(values)
    }

    pub fn set(&self, user_key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        Ok(self.mset(user_key, &[(field, value)], false)? > 0)
    }

    pub fn setnx(&self, user_key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        Ok(self.mset(user_key, &[(field, value)], true)? > 0)
    }

    /// Write the pairs, returning how many fields are new. With `nx` set,
    /// existing fields are left untouched.
    pub fn mset(&self, user_key: &[u8], pairs: &[(&[u8], &[u8])], nx: bool) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::Hash, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => Metadata::new(RedisType::Hash),
            Err(e) => return Err(e),
        };

        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut batch = TypedBatch::new();
        let mut seen = std::collections::HashSet::new();
        let mut added = 0;
        for (field, value) in pairs {
            let first_mention = seen.insert(field.to_vec());
            let key = InternalKey::new(&ns_key, field, metadata.version).encode();
            let exists = self.base.db.get_cf(&cf, &key)?.is_some();
            if exists && nx {
                continue;
            }
            if !exists && first_mention {
                added += 1;
            }
            batch.put(ColumnFamilyId::Default, key, value.to_vec());
        }
        metadata.size += added;
        batch.put(ColumnFamilyId::Metadata, ns_key, metadata.encode());
        self.base.storage.write(batch)?;
        Ok(added)
    }

    pub fn delete(&self, user_key: &[u8], fields: &[&[u8]]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::Hash, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(0),
            Err(e) => return Err(e),
        };

        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut batch = TypedBatch::new();
        let mut deleted = 0;
        for field in fields {
            let key = InternalKey::new(&ns_key, field, metadata.version).encode();
            if self.base.db.get_cf(&cf, &key)?.is_some() {
                deleted += 1;
                batch.delete(ColumnFamilyId::Default, key);
            }
        }
        if deleted == 0 {
            return Ok(0);
        }
        metadata.size -= deleted;
        if metadata.size == 0 {
            batch.delete(ColumnFamilyId::Metadata, ns_key);
        } else {
            batch.put(ColumnFamilyId::Metadata, ns_key, metadata.encode());
        }
        self.base.storage.write(batch)?;
        Ok(deleted)
    }

    pub fn size(&self, user_key: &[u8]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        match self.base.get_metadata(RedisType::Hash, &ns_key) {
            Ok(metadata) => Ok(metadata.size),
            Err(Error::NotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, user_key: &[u8], field: &[u8]) -> Result<bool> {
        match self.get(user_key, field) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn get_all(&self, user_key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (fields, values) =
            match self
                .base
                .scan_sub_keys(RedisType::Hash, user_key, None, 0, b"")
            {
                Ok(pairs) => pairs,
                Err(Error::NotFound) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
        Ok(fields.into_iter().zip(values).collect())
    }

    pub fn incr_by(&self, user_key: &[u8], field: &[u8], delta: i64) -> Result<i64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::Hash, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => Metadata::new(RedisType::Hash),
            Err(e) => return Err(e),
        };
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let key = InternalKey::new(&ns_key, field, metadata.version).encode();
        let old = self.base.db.get_cf(&cf, &key)?;
        let current: i64 = match &old {
            Some(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::NotOk("hash value is not an integer".into()))?,
            None => 0,
        };
        let updated = current
            .checked_add(delta)
            .ok_or_else(|| Error::NotOk("increment or decrement would overflow".into()))?;

        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Default, key, updated.to_string().into_bytes());
        if old.is_none() {
            metadata.size += 1;
        }
        batch.put(ColumnFamilyId::Metadata, ns_key, metadata.encode());
        self.base.storage.write(batch)?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_util::TestStorage;

    fn hash_db(t: &TestStorage) -> HashDb {
        HashDb::new(t.storage_arc(), b"ns").unwrap()
    }

    #[test]
    fn test_set_get() {
        let t = TestStorage::open();
        let hdb = hash_db(&t);
        assert!(hdb.set(b"h", b"f1", b"v1").unwrap());
        assert!(!hdb.set(b"h", b"f1", b"v2").unwrap());
        assert_eq!(hdb.get(b"h", b"f1").unwrap(), b"v2");
        assert!(matches!(hdb.get(b"h", b"nope"), Err(Error::NotFound)));
        assert_eq!(hdb.size(b"h").unwrap(), 1);
    }

    #[test]
    fn test_setnx() {
        let t = TestStorage::open();
        let hdb = hash_db(&t);
        assert!(hdb.setnx(b"h", b"f", b"a").unwrap());
        assert!(!hdb.setnx(b"h", b"f", b"b").unwrap());
        assert_eq!(hdb.get(b"h", b"f").unwrap(), b"a");
    }

    #[test]
    fn test_mset_mget_getall() {
        let t = TestStorage::open();
        let hdb = hash_db(&t);
        assert_eq!(
            hdb.mset(b"h", &[(b"a".as_slice(), b"1".as_slice()), (b"b", b"2")], false)
                .unwrap(),
            2
        );
        let values = hdb.mget(b"h", &[b"a", b"x", b"b"]).unwrap();
        assert_eq!(values, vec![Some(b"1".to_vec()), None, Some(b"2".to_vec())]);

        let mut all = hdb.get_all(b"h").unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec())
            ]
        );
    }

    #[test]
    fn test_delete_drops_key_when_empty() {
        let t = TestStorage::open();
        let hdb = hash_db(&t);
        hdb.mset(b"h", &[(b"a".as_slice(), b"1".as_slice()), (b"b", b"2")], false)
            .unwrap();
        assert_eq!(hdb.delete(b"h", &[b"a", b"missing"]).unwrap(), 1);
        assert_eq!(hdb.size(b"h").unwrap(), 1);
        assert_eq!(hdb.delete(b"h", &[b"b"]).unwrap(), 1);
        assert_eq!(hdb.size(b"h").unwrap(), 0);

        let db = Database::new(t.storage_arc(), b"ns").unwrap();
        assert_eq!(db.exists(&[b"h"]).unwrap(), 0);
    }

    #[test]
    fn test_incr_by() {
        let t = TestStorage::open();
        let hdb = hash_db(&t);
        assert_eq!(hdb.incr_by(b"h", b"n", 5).unwrap(), 5);
        assert_eq!(hdb.incr_by(b"h", b"n", -7).unwrap(), -2);
        hdb.set(b"h", b"s", b"abc").unwrap();
        assert!(hdb.incr_by(b"h", b"s", 1).is_err());
    }

    #[test]
    fn test_recreation_bumps_version() {
        let t = TestStorage::open();
        let hdb = hash_db(&t);
        hdb.set(b"h", b"f", b"v").unwrap();
        let db = Database::new(t.storage_arc(), b"ns").unwrap();
        let ns_key = db.ns_key(b"h");
        let v1 = db.get_metadata(RedisType::Hash, &ns_key).unwrap().version;

        db.del(b"h").unwrap();
        hdb.set(b"h", b"f", b"v").unwrap();
        let v2 = db.get_metadata(RedisType::Hash, &ns_key).unwrap().version;
        assert!(v2 > v1);
        // the old field is unreachable even though its bytes may linger
        assert_eq!(hdb.size(b"h").unwrap(), 1);
    }
}
