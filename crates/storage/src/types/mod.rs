//! Typed data-structure facades over the flat engine.
//!
//! Each facade owns the read-modify-write cycle for one Redis type: take the
//! stripe lock for the namespaced key, read metadata under a snapshot, and
//! commit metadata plus subkeys as one batch.

pub mod bitmap;
pub mod hash;
pub mod list;
pub mod pubsub;
pub mod set;
pub mod sortedint;
pub mod string;
pub mod zset;

use std::sync::Arc;

use rocksdb::{Direction, IteratorMode, ReadOptions, SnapshotWithThreadMode};

use crate::engine::{cf_handle, ColumnFamilyId, Db, Storage, TypedBatch};
use crate::error::{Error, Result};
use crate::keys::{compose_namespace_key, extract_namespace_key, InternalKey};
use crate::metadata::{Metadata, RedisType};
use crate::slot::SlotIndex;

/// Scoped snapshot: reads of one command see a single sequence number, and
/// dropping the guard releases the snapshot on every exit path.
pub(crate) struct LatestSnapshot<'db> {
    snapshot: SnapshotWithThreadMode<'db, Db>,
}

impl<'db> LatestSnapshot<'db> {
    pub fn new(db: &'db Db) -> Self {
        Self {
            snapshot: db.snapshot(),
        }
    }

    pub fn read_options(&self) -> ReadOptions {
        let mut opts = ReadOptions::default();
        opts.set_snapshot(&self.snapshot);
        opts
    }

    pub fn iter_options(&self) -> ReadOptions {
        let mut opts = self.read_options();
        opts.fill_cache(false);
        opts
    }
}

/// Type-agnostic operations shared by every facade.
pub struct Database {
    pub(crate) storage: Arc<Storage>,
    pub(crate) db: Arc<Db>,
    pub(crate) namespace: Vec<u8>,
}

impl Database {
    pub fn new(storage: Arc<Storage>, namespace: &[u8]) -> Result<Self> {
        let db = storage.db()?;
        Ok(Self {
            storage,
            db,
            namespace: namespace.to_vec(),
        })
    }

    pub fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    pub fn ns_key(&self, user_key: &[u8]) -> Vec<u8> {
        compose_namespace_key(&self.namespace, user_key)
    }

    /// Read and screen the metadata record for an operation on `kind`:
    /// missing, expired, or empty containers read as `NotFound`; a live
    /// record of another type is a `WrongType`.
    pub(crate) fn get_metadata(&self, kind: RedisType, ns_key: &[u8]) -> Result<Metadata> {
        let bytes = self.get_raw_metadata(ns_key)?;
        let metadata = Metadata::decode(&bytes)?;
        if metadata.expired() {
            return Err(Error::NotFound);
        }
        if metadata.kind != kind && (metadata.size > 0 || metadata.kind == RedisType::String) {
            return Err(Error::WrongType);
        }
        if metadata.kind != RedisType::String && metadata.size == 0 {
            return Err(Error::NotFound);
        }
        Ok(metadata)
    }

    pub(crate) fn get_raw_metadata(&self, ns_key: &[u8]) -> Result<Vec<u8>> {
        let snapshot = LatestSnapshot::new(&self.db);
        let cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        self.db
            .get_cf_opt(&cf, ns_key, &snapshot.read_options())?
            .ok_or(Error::NotFound)
    }

    /// Set the absolute expire timestamp by patching the stored record in
    /// place; the payload tail is untouched.
    pub fn expire(&self, user_key: &[u8], timestamp: u32) -> Result<()> {
        let ns_key = self.ns_key(user_key);
        let _guard = self.storage.lock_manager().lock(&ns_key);

        let cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        let mut bytes = self.db.get_cf(&cf, &ns_key)?.ok_or(Error::NotFound)?;
        let metadata = Metadata::decode(&bytes)?;
        if metadata.expired() {
            return Err(Error::NotFound);
        }
        if metadata.kind != RedisType::String && metadata.size == 0 {
            return Err(Error::NotFound);
        }
        if metadata.expire == timestamp {
            return Ok(());
        }
        // expire sits right after the type and flags bytes
        bytes[2..6].copy_from_slice(&timestamp.to_be_bytes());
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Metadata, ns_key, bytes);
        self.storage.write(batch)
    }

    pub fn del(&self, user_key: &[u8]) -> Result<()> {
        let ns_key = self.ns_key(user_key);
        let _guard = self.storage.lock_manager().lock(&ns_key);

        let cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        let bytes = self.db.get_cf(&cf, &ns_key)?.ok_or(Error::NotFound)?;
        if Metadata::decode(&bytes)?.expired() {
            return Err(Error::NotFound);
        }
        self.storage.delete(ColumnFamilyId::Metadata, &ns_key)
    }

    pub fn exists(&self, user_keys: &[&[u8]]) -> Result<i64> {
        let snapshot = LatestSnapshot::new(&self.db);
        let cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        let mut alive = 0;
        for user_key in user_keys {
            let ns_key = self.ns_key(user_key);
            if let Some(bytes) = self.db.get_cf_opt(&cf, &ns_key, &snapshot.read_options())? {
                if !Metadata::decode(&bytes)?.expired() {
                    alive += 1;
                }
            }
        }
        Ok(alive)
    }

    /// Remaining lifetime in seconds; -1 without expiry, -2 when missing.
    pub fn ttl(&self, user_key: &[u8]) -> Result<i64> {
        let bytes = match self.get_raw_metadata(&self.ns_key(user_key)) {
            Ok(bytes) => bytes,
            Err(Error::NotFound) => return Ok(-2),
            Err(e) => return Err(e),
        };
        let metadata = Metadata::decode(&bytes)?;
        if metadata.expired() {
            return Ok(-2);
        }
        Ok(metadata.ttl())
    }

    pub fn key_type(&self, user_key: &[u8]) -> Result<RedisType> {
        let bytes = match self.get_raw_metadata(&self.ns_key(user_key)) {
            Ok(bytes) => bytes,
            Err(Error::NotFound) => return Ok(RedisType::None),
            Err(e) => return Err(e),
        };
        let metadata = Metadata::decode(&bytes)?;
        if metadata.expired() {
            return Ok(RedisType::None);
        }
        Ok(metadata.kind)
    }

    /// Live user keys under this namespace starting with `prefix`.
    pub fn keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let ns_prefix = self.ns_key(prefix);
        let snapshot = LatestSnapshot::new(&self.db);
        let cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        let iter = self.db.iterator_cf_opt(
            &cf,
            snapshot.iter_options(),
            IteratorMode::From(&ns_prefix, Direction::Forward),
        );
        let mut keys = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&ns_prefix) {
                break;
            }
            if Metadata::decode(&value)?.expired() {
                continue;
            }
            let (_, user_key) = extract_namespace_key(&key)?;
            keys.push(user_key.to_vec());
        }
        Ok(keys)
    }

    /// Cursor scan over live keys; the cursor is the last key the previous
    /// scan returned.
    pub fn scan(
        &self,
        cursor: Option<&[u8]>,
        limit: u64,
        prefix: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let ns_prefix = self.ns_key(prefix);
        let snapshot = LatestSnapshot::new(&self.db);
        let cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        let start = match cursor {
            Some(cursor) => self.ns_key(cursor),
            None => ns_prefix.clone(),
        };
        let iter = self.db.iterator_cf_opt(
            &cf,
            snapshot.iter_options(),
            IteratorMode::From(&start, Direction::Forward),
        );
        let mut keys = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if cursor.is_some() && key.as_ref() == start.as_slice() {
                continue;
            }
            if !key.starts_with(&ns_prefix) || keys.len() as u64 >= limit {
                break;
            }
            if Metadata::decode(&value)?.expired() {
                continue;
            }
            let (_, user_key) = extract_namespace_key(&key)?;
            keys.push(user_key.to_vec());
        }
        Ok(keys)
    }

    pub fn random_key(&self, cursor: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let mut keys = self.scan(cursor, 60, b"")?;
        if keys.is_empty() && cursor.is_some() {
            // reached the end, restart from the beginning
            keys = self.scan(None, 60, b"")?;
        }
        if keys.is_empty() {
            return Ok(None);
        }
        let pick = (crate::metadata::now_micros() as usize) % keys.len();
        Ok(Some(keys.swap_remove(pick)))
    }

    /// Drop every key in this namespace; subkeys become orphans for the
    /// compaction filters. Clears the slot index wholesale in sharded mode.
    pub fn flush_db(&self) -> Result<()> {
        let prefix = self.ns_key(b"");
        let (begin, end) = match self.find_key_range_with_prefix(&prefix) {
            Ok(range) => range,
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.storage
            .delete_range(ColumnFamilyId::Metadata, &begin, &end)?;
        self.storage.delete(ColumnFamilyId::Metadata, &end)?;
        if self.storage.config().codis_enabled {
            SlotIndex::new(&self.storage)?.delete_all()?;
        }
        Ok(())
    }

    /// Drop every key across all namespaces.
    pub fn flush_all(&self) -> Result<()> {
        let snapshot = LatestSnapshot::new(&self.db);
        let cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        let mut iter =
            self.db
                .iterator_cf_opt(&cf, snapshot.iter_options(), IteratorMode::Start);
        let Some(first) = iter.next().transpose()? else {
            return Ok(());
        };
        let mut iter = self.db.iterator_cf_opt(
            &cf,
            snapshot.iter_options(),
            IteratorMode::End,
        );
        let Some(last) = iter.next().transpose()? else {
            return Ok(());
        };
        self.storage
            .delete_range(ColumnFamilyId::Metadata, &first.0, &last.0)?;
        self.storage.delete(ColumnFamilyId::Metadata, &last.0)
    }

    fn find_key_range_with_prefix(&self, prefix: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let snapshot = LatestSnapshot::new(&self.db);
        let cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        let mut iter = self.db.iterator_cf_opt(
            &cf,
            snapshot.iter_options(),
            IteratorMode::From(prefix, Direction::Forward),
        );
        let begin = match iter.next().transpose()? {
            Some((key, _)) if key.starts_with(prefix) => key.to_vec(),
            _ => return Err(Error::NotFound),
        };

        // seek backwards from just past the prefix; namespace bytes stay
        // below 0x80 so bumping the last byte cannot overflow
        let mut next_prefix = prefix.to_vec();
        if let Some(last) = next_prefix.last_mut() {
            *last += 1;
        }
        let iter = self.db.iterator_cf_opt(
            &cf,
            snapshot.iter_options(),
            IteratorMode::From(&next_prefix, Direction::Reverse),
        );
        for item in iter {
            let (key, _) = item?;
            if key.starts_with(prefix) {
                return Ok((begin, key.to_vec()));
            }
        }
        Err(Error::NotFound)
    }

    /// Cursor+prefix scan over a live container's subkeys, returning
    /// `(sub_keys, values)`.
    pub fn scan_sub_keys(
        &self,
        kind: RedisType,
        user_key: &[u8],
        cursor: Option<&[u8]>,
        limit: u64,
        subkey_prefix: &[u8],
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let ns_key = self.ns_key(user_key);
        let metadata = self.get_metadata(kind, &ns_key)?;

        let snapshot = LatestSnapshot::new(&self.db);
        let handle = cf_handle(&self.db, ColumnFamilyId::Default)?;
        let match_prefix = InternalKey::new(&ns_key, subkey_prefix, metadata.version).encode();
        let start = match cursor {
            Some(cursor) => InternalKey::new(&ns_key, cursor, metadata.version).encode(),
            None => match_prefix.clone(),
        };
        let iter = self.db.iterator_cf_opt(
            &handle,
            snapshot.iter_options(),
            IteratorMode::From(&start, Direction::Forward),
        );
        let mut sub_keys = Vec::new();
        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if cursor.is_some() && key.as_ref() == start.as_slice() {
                // already returned by the previous scan
                continue;
            }
            if !key.starts_with(&match_prefix) {
                break;
            }
            sub_keys.push(InternalKey::parse(&key)?.sub_key().to_vec());
            values.push(value.to_vec());
            if limit > 0 && sub_keys.len() as u64 >= limit {
                break;
            }
        }
        Ok((sub_keys, values))
    }
}

pub use bitmap::BitmapDb;
pub use hash::HashDb;
pub use list::ListDb;
pub use pubsub::PubSubDb;
pub use set::SetDb;
pub use sortedint::SortedIntDb;
pub use string::StringDb;
pub use zset::ZSetDb;
