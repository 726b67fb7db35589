//! List type: elements are subkeys under a big-endian index; the metadata
//! carries head and tail cursors that move outwards on pushes.

use std::sync::Arc;

use crate::encoding::put_u64;
use crate::engine::{cf_handle, ColumnFamilyId, Storage, TypedBatch};
use crate::error::{Error, Result};
use crate::keys::InternalKey;
use crate::metadata::{ListMetadata, Metadata, RedisType};
use crate::types::{Database, LatestSnapshot};

fn index_sub_key(index: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    put_u64(&mut out, index);
    out
}

pub struct ListDb {
    base: Database,
}

impl ListDb {
    pub fn new(storage: Arc<Storage>, namespace: &[u8]) -> Result<Self> {
        Ok(Self {
            base: Database::new(storage, namespace)?,
        })
    }

    fn get_list_metadata(&self, ns_key: &[u8]) -> Result<ListMetadata> {
        let bytes = self.base.get_raw_metadata(ns_key)?;
        let metadata = Metadata::decode(&bytes)?;
        if metadata.expired() {
            return Err(Error::NotFound);
        }
        if metadata.kind != RedisType::List
            && (metadata.size > 0 || metadata.kind == RedisType::String)
        {
            return Err(Error::WrongType);
        }
        if metadata.size == 0 {
            return Err(Error::NotFound);
        }
        ListMetadata::decode(&bytes)
    }

    /// Push values on one end, returning the new length.
    pub fn push(&self, user_key: &[u8], values: &[&[u8]], left: bool) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.get_list_metadata(&ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => ListMetadata::new(),
            Err(e) => return Err(e),
        };

        let mut batch = TypedBatch::new();
        for value in values {
            let index = if left {
                metadata.head -= 1;
                metadata.head
            } else {
                let index = metadata.tail;
                metadata.tail += 1;
                index
            };
            let key =
                InternalKey::new(&ns_key, &index_sub_key(index), metadata.meta.version).encode();
            batch.put(ColumnFamilyId::Default, key, value.to_vec());
        }
        metadata.meta.size += values.len() as u64;
        let size = metadata.meta.size;
        batch.put(ColumnFamilyId::Metadata, ns_key, metadata.encode());
        self.base.storage.write(batch)?;
        Ok(size)
    }

    pub fn pop(&self, user_key: &[u8], left: bool) -> Result<Vec<u8>> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = self.get_list_metadata(&ns_key)?;
        let index = if left {
            metadata.head
        } else {
            metadata.tail - 1
        };
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let key = InternalKey::new(&ns_key, &index_sub_key(index), metadata.meta.version).encode();
        let value = self.base.db.get_cf(&cf, &key)?.ok_or(Error::NotFound)?;

        let mut batch = TypedBatch::new();
        batch.delete(ColumnFamilyId::Default, key);
        if left {
            metadata.head += 1;
        } else {
            metadata.tail -= 1;
        }
        metadata.meta.size -= 1;
        if metadata.meta.size == 0 {
            batch.delete(ColumnFamilyId::Metadata, ns_key);
        } else {
            batch.put(ColumnFamilyId::Metadata, ns_key, metadata.encode());
        }
        self.base.storage.write(batch)?;
        Ok(value)
    }

    pub fn size(&self, user_key: &[u8]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        match self.get_list_metadata(&ns_key) {
            Ok(metadata) => Ok(metadata.meta.size),
            Err(Error::NotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn index(&self, user_key: &[u8], index: i64) -> Result<Vec<u8>> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = self.get_list_metadata(&ns_key)?;
        let size = metadata.meta.size as i64;
        let index = if index < 0 { size + index } else { index };
        if index < 0 || index >= size {
            return Err(Error::NotFound);
        }

        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let key = InternalKey::new(
            &ns_key,
            &index_sub_key(metadata.head + index as u64),
            metadata.meta.version,
        )
        .encode();
        self.base
            .db
            .get_cf_opt(&cf, &key, &snapshot.read_options())?
            .ok_or(Error::NotFound)
    }

    pub fn range(&self, user_key: &[u8], start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = match self.get_list_metadata(&ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let size = metadata.meta.size as i64;
        let start = if start < 0 { (size + start).max(0) } else { start };
        let stop = if stop < 0 { size + stop } else { stop.min(size - 1) };
        if start > stop {
            return Ok(Vec::new());
        }

        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut values = Vec::with_capacity((stop - start + 1) as usize);
        for offset in start..=stop {
            let key = InternalKey::new(
                &ns_key,
                &index_sub_key(metadata.head + offset as u64),
                metadata.meta.version,
            )
            .encode();
            if let Some(value) = self
                .base
                .db
                .get_cf_opt(&cf, &key, &snapshot.read_options())?
            {
                values.push(value);
            }
        }
        Ok(values)
    }
}
