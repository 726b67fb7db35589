//! Slot index
//!
//! Active when the server sits behind a sharded front-end that pre-hashes
//! keys into 1024 fixed buckets. Every metadata write is mirrored into a
//! reverse index (`slot || version || user_key`) plus a per-slot counter, in
//! the same batch as the user write, so the two can never diverge.

use std::collections::BTreeMap;
use std::sync::Arc;

use crc::{Crc, CRC_16_XMODEM};
use rocksdb::{Direction, IteratorMode, ReadOptions};

use crate::encoding::{get_u32, get_u64, put_u32, put_u64};
use crate::engine::{cf_handle, BatchOp, ColumnFamilyId, Db, Storage, TypedBatch};
use crate::error::{Error, Result};
use crate::keys::extract_namespace_key;
use crate::metadata::{generate_version, Metadata};

pub const HASH_SLOTS_SIZE: u32 = 1024;
const HASH_SLOTS_MASK: u16 = (HASH_SLOTS_SIZE - 1) as u16;

/// Row recording whether the on-disk index was built with sharding on; the
/// mode cannot be flipped on an existing database.
pub const CODIS_ENABLED_STATUS_KEY: &[u8] = b"codis_enabled";

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// `{tag}` hashing: only the braced part of the key participates, so related
/// keys can be pinned to one slot. Empty or missing tags fall back to the
/// whole key.
pub fn tag_from_key(key: &[u8]) -> Option<&[u8]> {
    let left = key.iter().position(|&b| b == b'{')?;
    let right = key.iter().position(|&b| b == b'}')?;
    if right <= left + 1 {
        return None;
    }
    Some(&key[left + 1..right])
}

pub fn slot_num_for_key(key: &[u8]) -> u32 {
    let tag = tag_from_key(key).unwrap_or(key);
    u32::from(CRC16.checksum(tag) & HASH_SLOTS_MASK)
}

pub fn slot_metadata_key(slot_num: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    put_u32(&mut out, slot_num);
    out
}

/// `slot || version || user_key`; the version ties the row to the slot
/// metadata generation, mirroring the subkey invalidation scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInternalKey<'a> {
    slot_num: u32,
    version: u64,
    key: &'a [u8],
}

impl<'a> SlotInternalKey<'a> {
    pub fn new(key: &'a [u8], version: u64) -> Self {
        Self {
            slot_num: slot_num_for_key(key),
            version,
            key,
        }
    }

    pub fn parse(input: &'a [u8]) -> Result<Self> {
        let mut rest = input;
        let slot_num = get_u32(&mut rest)
            .ok_or_else(|| Error::Corruption("slot key is too short".into()))?;
        let version = get_u64(&mut rest)
            .ok_or_else(|| Error::Corruption("slot key is too short".into()))?;
        Ok(Self {
            slot_num,
            version,
            key: rest,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 8 + self.key.len());
        put_u32(&mut out, self.slot_num);
        put_u64(&mut out, self.version);
        out.extend_from_slice(self.key);
        out
    }

    pub fn prefix(slot_num: u32, version: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        put_u32(&mut out, slot_num);
        put_u64(&mut out, version);
        out
    }

    pub fn slot_num(&self) -> u32 {
        self.slot_num
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn key(&self) -> &'a [u8] {
        self.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMetadata {
    pub version: u64,
    pub size: u32,
}

impl SlotMetadata {
    pub fn new() -> Self {
        Self {
            version: generate_version(),
            size: 0,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut input = bytes;
        let version = get_u64(&mut input)
            .ok_or_else(|| Error::Corruption("slot metadata is too short".into()))?;
        let size = get_u32(&mut input)
            .ok_or_else(|| Error::Corruption("slot metadata is too short".into()))?;
        Ok(Self { version, size })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        put_u64(&mut out, self.version);
        put_u32(&mut out, self.size);
        out
    }
}

impl Default for SlotMetadata {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SlotIndex<'a> {
    storage: &'a Storage,
    db: Arc<Db>,
}

impl<'a> SlotIndex<'a> {
    pub fn new(storage: &'a Storage) -> Result<Self> {
        let db = storage.db()?;
        Ok(Self { storage, db })
    }

    fn get_metadata(&self, slot_num: u32) -> Result<SlotMetadata> {
        let cf = cf_handle(&self.db, ColumnFamilyId::SlotMetadata)?;
        match self.db.get_cf(&cf, slot_metadata_key(slot_num))? {
            Some(bytes) => SlotMetadata::decode(&bytes),
            None => Err(Error::NotFound),
        }
    }

    pub fn is_key_exist(&self, key: &[u8]) -> Result<bool> {
        let metadata = match self.get_metadata(slot_num_for_key(key)) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        let cf = cf_handle(&self.db, ColumnFamilyId::Slot)?;
        Ok(self
            .db
            .get_cf(&cf, SlotInternalKey::new(key, metadata.version).encode())?
            .is_some())
    }

    /// Fold over the batch a command assembled: collect the user keys its
    /// metadata puts and deletes touch, then append the matching reverse-index
    /// rows and counter updates to the same batch.
    pub fn index_batch(&self, batch: &mut TypedBatch) -> Result<()> {
        let mut put_keys: Vec<Vec<u8>> = Vec::new();
        let mut delete_keys: Vec<Vec<u8>> = Vec::new();
        for op in batch.ops() {
            match op {
                BatchOp::Put { cf, key, .. } if *cf == ColumnFamilyId::Metadata => {
                    let (_, user_key) = extract_namespace_key(key)?;
                    put_keys.push(user_key.to_vec());
                }
                BatchOp::Delete { cf, key } if *cf == ColumnFamilyId::Metadata => {
                    let (_, user_key) = extract_namespace_key(key)?;
                    delete_keys.push(user_key.to_vec());
                }
                _ => {}
            }
        }
        if put_keys.is_empty() && delete_keys.is_empty() {
            return Ok(());
        }
        self.update_keys(&put_keys, &delete_keys, batch)
    }

    pub fn update_keys(
        &self,
        put_keys: &[Vec<u8>],
        delete_keys: &[Vec<u8>],
        batch: &mut TypedBatch,
    ) -> Result<()> {
        let mut metadatas: BTreeMap<u32, SlotMetadata> = BTreeMap::new();

        for key in put_keys {
            let slot_num = slot_num_for_key(key);
            if !metadatas.contains_key(&slot_num) {
                metadatas.insert(slot_num, self.metadata_or_fresh(slot_num)?);
            }
            if !self.is_key_exist(key)? {
                if let Some(metadata) = metadatas.get_mut(&slot_num) {
                    let slot_key = SlotInternalKey::new(key, metadata.version).encode();
                    metadata.size += 1;
                    batch.put(ColumnFamilyId::Slot, slot_key, Vec::new());
                }
            }
        }

        for key in delete_keys {
            let slot_num = slot_num_for_key(key);
            if !metadatas.contains_key(&slot_num) {
                metadatas.insert(slot_num, self.metadata_or_fresh(slot_num)?);
            }
            if self.is_key_exist(key)? {
                if let Some(metadata) = metadatas.get_mut(&slot_num) {
                    let slot_key = SlotInternalKey::new(key, metadata.version).encode();
                    metadata.size = metadata.size.saturating_sub(1);
                    batch.delete(ColumnFamilyId::Slot, slot_key);
                }
            }
        }

        for (slot_num, metadata) in metadatas {
            batch.put(
                ColumnFamilyId::SlotMetadata,
                slot_metadata_key(slot_num),
                metadata.encode(),
            );
        }
        Ok(())
    }

    fn metadata_or_fresh(&self, slot_num: u32) -> Result<SlotMetadata> {
        match self.get_metadata(slot_num) {
            Ok(metadata) => Ok(metadata),
            Err(Error::NotFound) => Ok(SlotMetadata::new()),
            Err(e) => Err(e),
        }
    }

    /// Per-slot key counts for `[start, start + count]`.
    pub fn get_info(&self, start: u32, count: u32) -> Result<Vec<(u32, u32)>> {
        let max_slot_num = start.saturating_add(count);
        let cf = cf_handle(&self.db, ColumnFamilyId::SlotMetadata)?;
        let mut read_opts = ReadOptions::default();
        read_opts.fill_cache(false);
        let start_key = slot_metadata_key(start);
        let iter = self.db.iterator_cf_opt(
            &cf,
            read_opts,
            IteratorMode::From(&start_key, Direction::Forward),
        );
        let mut counts = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() != 4 {
                continue; // the codis status row lives in this family too
            }
            let mut input = key.as_ref();
            let slot_num = get_u32(&mut input)
                .ok_or_else(|| Error::Corruption("invalid slot metadata key".into()))?;
            if slot_num > max_slot_num {
                break;
            }
            counts.push((slot_num, SlotMetadata::decode(&value)?.size));
        }
        Ok(counts)
    }

    pub fn size(&self, slot_num: u32) -> Result<u32> {
        Ok(self.get_metadata(slot_num)?.size)
    }

    pub fn scan(
        &self,
        slot_num: u32,
        cursor: Option<&[u8]>,
        limit: u64,
    ) -> Result<Vec<Vec<u8>>> {
        let metadata = self.get_metadata(slot_num)?;
        let prefix = SlotInternalKey::prefix(slot_num, metadata.version);
        let start_key = match cursor {
            Some(cursor) => SlotInternalKey::new(cursor, metadata.version).encode(),
            None => prefix.clone(),
        };
        let cf = cf_handle(&self.db, ColumnFamilyId::Slot)?;
        let mut read_opts = ReadOptions::default();
        read_opts.fill_cache(false);
        let iter = self.db.iterator_cf_opt(
            &cf,
            read_opts,
            IteratorMode::From(&start_key, Direction::Forward),
        );
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if cursor.is_some() && key.as_ref() == start_key.as_slice() {
                // the cursor was returned by the previous scan
                continue;
            }
            if !key.starts_with(&prefix) || keys.len() as u64 >= limit {
                break;
            }
            keys.push(SlotInternalKey::parse(&key)?.key().to_vec());
        }
        Ok(keys)
    }

    /// Drop one slot's counter; its reverse-index rows become stale and the
    /// slot filter reclaims them during compaction.
    pub fn del(&self, slot_num: u32) -> Result<()> {
        let _guard = self
            .storage
            .lock_manager()
            .lock(slot_num.to_string().as_bytes());
        self.get_metadata(slot_num)?;
        let mut batch = TypedBatch::new();
        batch.delete(ColumnFamilyId::SlotMetadata, slot_metadata_key(slot_num));
        self.storage.write(batch)
    }

    /// Wholesale clear, used by flushdb.
    pub fn delete_all(&self) -> Result<()> {
        let _guard = self.storage.lock_manager().lock(b"slots_all");
        self.storage.delete_range(
            ColumnFamilyId::SlotMetadata,
            &slot_metadata_key(0),
            &slot_metadata_key(HASH_SLOTS_SIZE),
        )
    }

    /// Cross-check the metadata column family against the reverse index.
    pub fn check(&self, namespace: &[u8]) -> Result<()> {
        let metadata_cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        let mut read_opts = ReadOptions::default();
        read_opts.fill_cache(false);
        let iter = self
            .db
            .iterator_cf_opt(&metadata_cf, read_opts, IteratorMode::Start);
        for item in iter {
            let (key, value) = item?;
            let metadata = Metadata::decode(&value)?;
            if metadata.expired() {
                continue;
            }
            let (_, user_key) = extract_namespace_key(&key)?;
            if !self.is_key_exist(user_key)? {
                return Err(Error::NotOk(format!(
                    "metadata key not in slot index: {}",
                    String::from_utf8_lossy(user_key)
                )));
            }
        }

        let slot_cf = cf_handle(&self.db, ColumnFamilyId::Slot)?;
        let mut read_opts = ReadOptions::default();
        read_opts.fill_cache(false);
        let iter = self
            .db
            .iterator_cf_opt(&slot_cf, read_opts, IteratorMode::Start);
        let metadata_cf = cf_handle(&self.db, ColumnFamilyId::Metadata)?;
        for item in iter {
            let (key, _) = item?;
            let ikey = SlotInternalKey::parse(&key)?;
            let slot_metadata = match self.get_metadata(ikey.slot_num()) {
                Ok(metadata) => metadata,
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            };
            if ikey.version() != slot_metadata.version {
                continue; // stale row, compaction will reclaim it
            }
            let ns_key = crate::keys::compose_namespace_key(namespace, ikey.key());
            let live = match self.db.get_cf(&metadata_cf, &ns_key)? {
                Some(bytes) => !Metadata::decode(&bytes)?.expired(),
                None => false,
            };
            if !live {
                return Err(Error::NotOk(format!(
                    "slot index key not in metadata: {}",
                    String::from_utf8_lossy(ikey.key())
                )));
            }
        }
        Ok(())
    }

    /// The sharding mode is recorded on first open and must match afterwards.
    pub fn check_enabled_status(&self, enabled: bool) -> Result<()> {
        let cf = cf_handle(&self.db, ColumnFamilyId::SlotMetadata)?;
        let recorded = self.db.get_cf(&cf, CODIS_ENABLED_STATUS_KEY)?;
        let want: &[u8] = if enabled { b"1" } else { b"0" };
        match recorded {
            None => {
                self.db.put_cf(&cf, CODIS_ENABLED_STATUS_KEY, want)?;
                Ok(())
            }
            Some(have) if have == want => Ok(()),
            Some(_) => Err(Error::DbOpen("codis enabled status mismatch".into())),
        }
    }
}
