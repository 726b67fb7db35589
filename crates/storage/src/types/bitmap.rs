//! Bitmap type: the bit space is sliced into 1 KiB segments stored as
//! subkeys under the big-endian byte offset of the segment start. An all-zero
//! segment is never kept on disk; reads treat missing segments as zero.

use std::sync::Arc;

use crate::encoding::put_u32;
use crate::engine::{cf_handle, ColumnFamilyId, Storage, TypedBatch};
use crate::error::{Error, Result};
use crate::keys::InternalKey;
use crate::metadata::{Metadata, RedisType};
use crate::types::{Database, LatestSnapshot};

pub const SEGMENT_BYTES: u32 = 1024;

pub fn is_empty_segment(segment: &[u8]) -> bool {
    segment.iter().all(|&b| b == 0)
}

fn segment_sub_key(byte_index: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    put_u32(&mut out, byte_index / SEGMENT_BYTES * SEGMENT_BYTES);
    out
}

pub struct BitmapDb {
    base: Database,
}

impl BitmapDb {
    pub fn new(storage: Arc<Storage>, namespace: &[u8]) -> Result<Self> {
        Ok(Self {
            base: Database::new(storage, namespace)?,
        })
    }

    pub fn get_bit(&self, user_key: &[u8], offset: u32) -> Result<bool> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = match self.base.get_metadata(RedisType::Bitmap, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };

        let byte_index = offset / 8;
        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let sub_key = segment_sub_key(byte_index);
        let key = InternalKey::new(&ns_key, &sub_key, metadata.version).encode();
        let Some(segment) = self
            .base
            .db
            .get_cf_opt(&cf, &key, &snapshot.read_options())?
        else {
            return Ok(false);
        };
        let in_segment = (byte_index % SEGMENT_BYTES) as usize;
        Ok(segment.len() > in_segment && segment[in_segment] & (1 << (offset % 8)) != 0)
    }

    pub fn set_bit(&self, user_key: &[u8], offset: u32, bit: bool) -> Result<bool> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::Bitmap, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => Metadata::new(RedisType::Bitmap),
            Err(e) => return Err(e),
        };

        let byte_index = offset / 8;
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let sub_key = segment_sub_key(byte_index);
        let key = InternalKey::new(&ns_key, &sub_key, metadata.version).encode();
        let mut segment = self.base.db.get_cf(&cf, &key)?.unwrap_or_default();

        let in_segment = (byte_index % SEGMENT_BYTES) as usize;
        if segment.len() <= in_segment {
            segment.resize(in_segment + 1, 0);
        }
        let mask = 1u8 << (offset % 8);
        let old_bit = segment[in_segment] & mask != 0;
        if bit {
            segment[in_segment] |= mask;
        } else {
            segment[in_segment] &= !mask;
        }

        let mut batch = TypedBatch::new();
        if is_empty_segment(&segment) {
            batch.delete(ColumnFamilyId::Default, key);
        } else {
            batch.put(ColumnFamilyId::Default, key, segment);
        }
        metadata.size = metadata.size.max(u64::from(byte_index) + 1);
        batch.put(ColumnFamilyId::Metadata, ns_key, metadata.encode());
        self.base.storage.write(batch)?;
        Ok(old_bit)
    }

    /// Count set bits over the byte range `[start, stop]`; negative offsets
    /// address from the end, as the wire command does.
    pub fn bit_count(&self, user_key: &[u8], start: i64, stop: i64) -> Result<u32> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = match self.base.get_metadata(RedisType::Bitmap, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(0),
            Err(e) => return Err(e),
        };

        let Some((start, stop)) = normalize_range(start, stop, metadata.size) else {
            return Ok(0);
        };
        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut count = 0;
        let mut segment_start = start / u64::from(SEGMENT_BYTES) * u64::from(SEGMENT_BYTES);
        while segment_start <= stop {
            let sub_key = segment_sub_key(segment_start as u32);
            let key = InternalKey::new(&ns_key, &sub_key, metadata.version).encode();
            if let Some(segment) = self
                .base
                .db
                .get_cf_opt(&cf, &key, &snapshot.read_options())?
            {
                for (i, byte) in segment.iter().enumerate() {
                    let byte_index = segment_start + i as u64;
                    if byte_index >= start && byte_index <= stop {
                        count += byte.count_ones();
                    }
                }
            }
            segment_start += u64::from(SEGMENT_BYTES);
        }
        Ok(count)
    }

    /// First offset holding `bit` within the byte range. Searching for a
    /// clear bit on a missing key answers 0; an open-ended search for a clear
    /// bit that finds none answers one past the end.
    pub fn bit_pos(
        &self,
        user_key: &[u8],
        bit: bool,
        start: i64,
        stop: Option<i64>,
    ) -> Result<i64> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = match self.base.get_metadata(RedisType::Bitmap, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(if bit { -1 } else { 0 }),
            Err(e) => return Err(e),
        };

        let stop_given = stop.is_some();
        let Some((start, stop)) = normalize_range(start, stop.unwrap_or(-1), metadata.size) else {
            return Ok(-1);
        };
        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut byte_index = start;
        while byte_index <= stop {
            let sub_key = segment_sub_key(byte_index as u32);
            let key = InternalKey::new(&ns_key, &sub_key, metadata.version).encode();
            let segment = self
                .base
                .db
                .get_cf_opt(&cf, &key, &snapshot.read_options())?
                .unwrap_or_default();
            let segment_start = byte_index / u64::from(SEGMENT_BYTES) * u64::from(SEGMENT_BYTES);
            while byte_index <= stop && byte_index < segment_start + u64::from(SEGMENT_BYTES) {
                let byte = segment
                    .get((byte_index - segment_start) as usize)
                    .copied()
                    .unwrap_or(0);
                for shift in 0..8 {
                    if (byte & (1 << shift) != 0) == bit {
                        return Ok((byte_index * 8 + shift) as i64);
                    }
                }
                byte_index += 1;
            }
        }
        if !bit && !stop_given {
            return Ok((metadata.size * 8) as i64);
        }
        Ok(-1)
    }
}

// [start, stop] byte range with redis-style negative indexes over `size`
// bytes; None when empty.
fn normalize_range(start: i64, stop: i64, size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return None;
    }
    let size = size as i64;
    let start = if start < 0 { (size + start).max(0) } else { start };
    let stop = if stop < 0 { size + stop } else { stop.min(size - 1) };
    if start > stop {
        return None;
    }
    Some((start as u64, stop as u64))
}
