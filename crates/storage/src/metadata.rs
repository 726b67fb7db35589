//! Metadata codec
//!
//! Every logical key owns one record in the metadata column family. The
//! header is fixed-width (`type || flags || expire || version || size`,
//! 22 bytes); string records carry their payload after the header, list
//! records carry the head/tail cursors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::encoding::{get_u32, get_u64, get_u8, put_u32, put_u64, put_u8};
use crate::error::{Error, Result};

pub const METADATA_HEADER_SIZE: usize = 1 + 1 + 4 + 8 + 8;

/// Low bits of a version reserved for the collision counter.
pub(crate) const VERSION_COUNTER_BITS: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RedisType {
    None = 0,
    String = 1,
    Hash = 2,
    List = 3,
    Set = 4,
    ZSet = 5,
    Bitmap = 6,
    SortedInt = 7,
}

impl RedisType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RedisType::None),
            1 => Some(RedisType::String),
            2 => Some(RedisType::Hash),
            3 => Some(RedisType::List),
            4 => Some(RedisType::Set),
            5 => Some(RedisType::ZSet),
            6 => Some(RedisType::Bitmap),
            7 => Some(RedisType::SortedInt),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RedisType::None => "none",
            RedisType::String => "string",
            RedisType::Hash => "hash",
            RedisType::List => "list",
            RedisType::Set => "set",
            RedisType::ZSet => "zset",
            RedisType::Bitmap => "bitmap",
            RedisType::SortedInt => "sortedint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: RedisType,
    pub flags: u8,
    /// Unix seconds; zero means no expiry.
    pub expire: u32,
    /// Bumped on every (re)creation of the key; embedded in subkeys as the
    /// invalidation token.
    pub version: u64,
    /// Element count for containers, byte length for strings and bitmaps.
    pub size: u64,
}

impl Metadata {
    pub fn new(kind: RedisType) -> Self {
        Self {
            kind,
            flags: 0,
            expire: 0,
            version: generate_version(),
            size: 0,
        }
    }

    /// Decode the fixed header; the caller owns whatever tail follows it.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut input = bytes;
        if input.len() < METADATA_HEADER_SIZE {
            return Err(Error::Corruption("metadata is too short".into()));
        }
        let type_byte = get_u8(&mut input).unwrap_or_default();
        let kind = RedisType::from_u8(type_byte)
            .ok_or_else(|| Error::Corruption(format!("unknown metadata type: {type_byte}")))?;
        let flags = get_u8(&mut input).unwrap_or_default();
        let expire = get_u32(&mut input).unwrap_or_default();
        let version = get_u64(&mut input).unwrap_or_default();
        let size = get_u64(&mut input).unwrap_or_default();
        Ok(Self {
            kind,
            flags,
            expire,
            version,
            size,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_HEADER_SIZE);
        put_u8(&mut out, self.kind as u8);
        put_u8(&mut out, self.flags);
        put_u32(&mut out, self.expire);
        put_u64(&mut out, self.version);
        put_u64(&mut out, self.size);
        out
    }

    pub fn expired(&self) -> bool {
        self.expired_at(now_secs())
    }

    pub fn expired_at(&self, now: u32) -> bool {
        self.expire != 0 && self.expire <= now
    }

    /// Remaining lifetime in seconds; -1 when the key never expires.
    pub fn ttl(&self) -> i64 {
        if self.expire == 0 {
            return -1;
        }
        i64::from(self.expire) - i64::from(now_secs())
    }
}

/// List records append the head and tail cursors to the common header. Both
/// start mid-range so pushes on either side never wrap.
#[derive(Debug, Clone, Copy)]
pub struct ListMetadata {
    pub meta: Metadata,
    pub head: u64,
    pub tail: u64,
}

impl ListMetadata {
    pub fn new() -> Self {
        Self {
            meta: Metadata::new(RedisType::List),
            head: u64::MAX / 2,
            tail: u64::MAX / 2,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let meta = Metadata::decode(bytes)?;
        let mut input = &bytes[METADATA_HEADER_SIZE..];
        let head = get_u64(&mut input)
            .ok_or_else(|| Error::Corruption("list metadata is too short".into()))?;
        let tail = get_u64(&mut input)
            .ok_or_else(|| Error::Corruption("list metadata is too short".into()))?;
        Ok(Self { meta, head, tail })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.meta.encode();
        put_u64(&mut out, self.head);
        put_u64(&mut out, self.tail);
        out
    }
}

impl Default for ListMetadata {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Strictly monotonic 64-bit version source: microsecond timestamp shifted
/// left with a wrapping counter in the low bits, clamped so it never moves
/// backwards even if the clock does.
pub(crate) fn generate_version() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let candidate =
        (now_micros() << VERSION_COUNTER_BITS) | (counter & ((1 << VERSION_COUNTER_BITS) - 1));
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut meta = Metadata::new(RedisType::Hash);
        meta.expire = 12345;
        meta.size = 9;
        let bytes = meta.encode();
        assert_eq!(bytes.len(), METADATA_HEADER_SIZE);
        assert_eq!(Metadata::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_short_record_is_corruption() {
        let err = Metadata::decode(&[1, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_unknown_type_is_corruption() {
        let mut bytes = Metadata::new(RedisType::Set).encode();
        bytes[0] = 0xfe;
        assert!(matches!(
            Metadata::decode(&bytes),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_string_payload_survives_header() {
        let meta = Metadata::new(RedisType::String);
        let mut bytes = meta.encode();
        bytes.extend_from_slice(b"payload");
        let decoded = Metadata::decode(&bytes).unwrap();
        assert_eq!(decoded.version, meta.version);
        assert_eq!(&bytes[METADATA_HEADER_SIZE..], b"payload");
    }

    #[test]
    fn test_expiry() {
        let mut meta = Metadata::new(RedisType::String);
        assert!(!meta.expired());
        assert_eq!(meta.ttl(), -1);

        meta.expire = now_secs() - 1;
        assert!(meta.expired());

        meta.expire = now_secs() + 100;
        assert!(!meta.expired());
        assert!(meta.ttl() > 0);
    }

    #[test]
    fn test_zero_expire_means_no_expiry() {
        let mut meta = Metadata::new(RedisType::String);
        meta.expire = 0;
        assert!(!meta.expired_at(u32::MAX));
    }

    #[test]
    fn test_versions_strictly_increase() {
        let mut last = 0;
        for _ in 0..10_000 {
            let v = generate_version();
            assert!(v > last);
            last = v;
        }
    }

    #[test]
    fn test_list_metadata_roundtrip() {
        let mut meta = ListMetadata::new();
        meta.head -= 3;
        meta.tail += 2;
        meta.meta.size = 5;
        let decoded = ListMetadata::decode(&meta.encode()).unwrap();
        assert_eq!(decoded.head, meta.head);
        assert_eq!(decoded.tail, meta.tail);
        assert_eq!(decoded.meta.size, 5);
    }
}
