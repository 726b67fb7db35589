//! Set type: members are subkeys with empty values.

use std::sync::Arc;

use crate::engine::{cf_handle, ColumnFamilyId, Storage, TypedBatch};
use crate::error::{Error, Result};
use crate::keys::InternalKey;
use crate::metadata::{Metadata, RedisType};
use crate::types::{Database, LatestSnapshot};

pub struct SetDb {
    base: Database,
}

impl SetDb {
    pub fn new(storage: Arc<Storage>, namespace: &[u8]) -> Result<Self> {
        Ok(Self {
            base: Database::new(storage, namespace)?,
        })
    }

    pub fn add(&self, user_key: &[u8], members: &[&[u8]]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::Set, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => Metadata::new(RedisType::Set),
            Err(e) => return Err(e),
        };

        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut batch = TypedBatch::new();
        let mut seen = std::collections::HashSet::new();
        let mut added = 0;
        for member in members {
            if !seen.insert(member.to_vec()) {
                continue;
            }
            let key = InternalKey::new(&ns_key, member, metadata.version).encode();
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

    pub fn remove(&self, user_key: &[u8], members: &[&[u8]]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::Set, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(0),
            Err(e) => return Err(e),
        };

        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut batch = TypedBatch::new();
        let mut removed = 0;
        for member in members {
            let key = InternalKey::new(&ns_key, member, metadata.version).encode();
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
        match self.base.get_metadata(RedisType::Set, &ns_key) {
            Ok(metadata) => Ok(metadata.size),
            Err(Error::NotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn is_member(&self, user_key: &[u8], member: &[u8]) -> Result<bool> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = match self.base.get_metadata(RedisType::Set, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let key = InternalKey::new(&ns_key, member, metadata.version).encode();
        Ok(self
            .base
            .db
            .get_cf_opt(&cf, &key, &snapshot.read_options())?
            .is_some())
    }

    pub fn members(&self, user_key: &[u8]) -> Result<Vec<Vec<u8>>> {
        match self
            .base
            .scan_sub_keys(RedisType::Set, user_key, None, 0, b"")
        {
            Ok((members, _)) => Ok(members),
            Err(Error::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
