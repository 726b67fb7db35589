//! Pub-sub records: published messages are appended to the pubsub column
//! family (no metadata indirection) so replicas see them through WAL tailing.
//! The records are transient; the pubsub compaction filter drops them once
//! they pass the staleness threshold.

use std::sync::Arc;

use crate::encoding::put_u32;
use crate::engine::{cf_handle, ColumnFamilyId, Storage, TypedBatch};
use crate::error::Result;
use crate::metadata::generate_version;

// `channel_len u32 || channel || stamp u64`. The length prefix keeps the
// composition injective: a channel can never alias the records of another
// channel it is a byte-prefix of.
fn compose_channel_prefix(channel: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + channel.len());
    put_u32(&mut out, channel.len() as u32);
    out.extend_from_slice(channel);
    out
}

pub struct PubSubDb {
    storage: Arc<Storage>,
}

impl PubSubDb {
    pub fn new(storage: Arc<Storage>) -> Result<Self> {
        storage.db()?;
        Ok(Self { storage })
    }

    /// Append one message under `channel_len || channel || stamp`. The stamp
    /// comes from the monotonic version source, so two messages in the same
    /// microsecond still get distinct keys.
    pub fn publish(&self, channel: &[u8], message: &[u8]) -> Result<()> {
        let mut key = compose_channel_prefix(channel);
        key.extend_from_slice(&generate_version().to_be_bytes());
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::PubSub, key, message.to_vec());
        self.storage.write(batch)
    }

    /// Messages currently retained for `channel`, oldest first.
    pub fn pending(&self, channel: &[u8]) -> Result<Vec<Vec<u8>>> {
        let prefix = compose_channel_prefix(channel);
        let db = self.storage.db()?;
        let cf = cf_handle(&db, ColumnFamilyId::PubSub)?;
        let iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        let mut messages = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            messages.push(value.to_vec());
        }
        Ok(messages)
    }
}
