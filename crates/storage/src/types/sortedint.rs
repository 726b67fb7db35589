//! Sorted-integer type: a set of u64 ids stored as big-endian subkeys, so
//! iteration yields them in numeric order.

use std::sync::Arc;

use crate::encoding::put_u64;
use crate::engine::{cf_handle, ColumnFamilyId, Storage, TypedBatch};
use crate::error::{Error, Result};
use crate::keys::InternalKey;
use crate::metadata::{Metadata, RedisType};
use crate::types::Database;

fn id_sub_key(id: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    put_u64(&mut out, id);
    out
}

pub struct SortedIntDb {
    base: Database,
}

impl SortedIntDb {
    pub fn new(storage: Arc<Storage>, namespace: &[u8]) -> Result<Self> {
        Ok(Self {
            base: Database::new(storage, namespace)?,
        })
    }

    pub fn add(&self, user_key: &[u8], ids: &[u64]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::SortedInt, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => Metadata::new(RedisType::SortedInt),
            Err(e) => return Err(e),
        };

        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut batch = TypedBatch::new();
        let mut seen = std::collections::HashSet::new();
        let mut added = 0;
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            let key = InternalKey::new(&ns_key, &id_sub_key(id), metadata.version).encode();
            if self.base.db.get_cf(&cf, &key)?.is_none() {
                added += 1;
                batch.put(ColumnFamilyId::Default, key, Vec::new());
            }
        }
        if added == 0 {
            return Ok(0);
        }
        metadata.size += added;
        batch.put(ColumnFamilyId::Metadata, ns_key, metadata.encode());
        self.base.storage.write(batch)?;
        Ok(added)
    }

    pub fn remove(&self, user_key: &[u8], ids: &[u64]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::SortedInt, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(0),
            Err(e) => return Err(e),
        };

        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut batch = TypedBatch::new();
        let mut removed = 0;
        for &id in ids {
            let key = InternalKey::new(&ns_key, &id_sub_key(id), metadata.version).encode();
            if self.base.db.get_cf(&cf, &key)?.is_some() {
                removed += 1;
                batch.delete(ColumnFamilyId::Default, key);
            }
        }
        if removed == 0 {
            return Ok(0);
        }
        metadata.size -= removed;
        if metadata.size == 0 {
            batch.delete(ColumnFamilyId::Metadata, ns_key);
        } else {
            batch.put(ColumnFamilyId::Metadata, ns_key, metadata.encode());
        }
        self.base.storage.write(batch)?;
        Ok(removed)
    }

    pub fn card(&self, user_key: &[u8]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        match self.base.get_metadata(RedisType::SortedInt, &ns_key) {
            Ok(metadata) => Ok(metadata.size),
            Err(Error::NotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_util::TestStorage;

    #[test]
    fn test_add_remove_card() {
        let t = TestStorage::open();
        let sidb = SortedIntDb::new(t.storage_arc(), b"ns").unwrap();
        assert_eq!(sidb.add(b"si", &[9, 2, 9]).unwrap(), 2);
        assert_eq!(sidb.card(b"si").unwrap(), 2);
        assert_eq!(sidb.remove(b"si", &[2, 100]).unwrap(), 1);
        assert_eq!(sidb.card(b"si").unwrap(), 1);
        assert_eq!(sidb.remove(b"si", &[9]).unwrap(), 1);
        assert_eq!(sidb.card(b"si").unwrap(), 0);
    }
}
