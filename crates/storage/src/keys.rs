//! Key composer
//!
//! Composes and parses the namespaced keys, subkeys, and score keys that let
//! many logical data structures share one ordered key space. The encodings
//! are byte-exact and stable; they are not self-describing beyond the leading
//! lengths, so iteration callers must know the expected layout.

use crate::encoding::{encode_double, get_u32, get_u64, put_u32, put_u64};
use crate::error::{Error, Result};

/// `len(ns) as u8 || ns || user_key`. Injective and order-preserving within a
/// namespace; the namespace length must fit in one byte.
pub fn compose_namespace_key(namespace: &[u8], user_key: &[u8]) -> Vec<u8> {
    debug_assert!(!namespace.is_empty() && namespace.len() <= u8::MAX as usize);
    let mut out = Vec::with_capacity(1 + namespace.len() + user_key.len());
    out.push(namespace.len() as u8);
    out.extend_from_slice(namespace);
    out.extend_from_slice(user_key);
    out
}

/// Inverse of [`compose_namespace_key`].
pub fn extract_namespace_key(ns_key: &[u8]) -> Result<(&[u8], &[u8])> {
    let (&ns_len, rest) = ns_key
        .split_first()
        .ok_or_else(|| Error::Corruption("namespace key is empty".into()))?;
    if ns_len == 0 || rest.len() < ns_len as usize {
        return Err(Error::Corruption("invalid namespace length".into()));
    }
    Ok(rest.split_at(ns_len as usize))
}

/// Subkey addressing: `len(ns_key) as u32 || ns_key || version || sub_key`.
///
/// The embedded version is the invalidation token. Rewriting the metadata
/// record with a fresh version makes every subkey carrying the old one
/// unreachable; compaction reclaims them later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalKey<'a> {
    ns_key: &'a [u8],
    version: u64,
    sub_key: &'a [u8],
}

impl<'a> InternalKey<'a> {
    pub fn new(ns_key: &'a [u8], sub_key: &'a [u8], version: u64) -> Self {
        Self {
            ns_key,
            version,
            sub_key,
        }
    }

    pub fn parse(input: &'a [u8]) -> Result<Self> {
        let mut rest = input;
        let ns_key_len = get_u32(&mut rest)
            .ok_or_else(|| Error::Corruption("internal key is too short".into()))?
            as usize;
        if ns_key_len == 0 || rest.len() < ns_key_len + 8 {
            return Err(Error::Corruption("invalid internal key length".into()));
        }
        let (ns_key, mut rest) = rest.split_at(ns_key_len);
        let version = get_u64(&mut rest)
            .ok_or_else(|| Error::Corruption("internal key is too short".into()))?;
        Ok(Self {
            ns_key,
            version,
            sub_key: rest,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.ns_key.len() + 8 + self.sub_key.len());
        put_u32(&mut out, self.ns_key.len() as u32);
        out.extend_from_slice(self.ns_key);
        put_u64(&mut out, self.version);
        out.extend_from_slice(self.sub_key);
        out
    }

    pub fn ns_key(&self) -> &'a [u8] {
        self.ns_key
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn sub_key(&self) -> &'a [u8] {
        self.sub_key
    }

    pub fn namespace(&self) -> Result<&'a [u8]> {
        Ok(extract_namespace_key(self.ns_key)?.0)
    }

    pub fn user_key(&self) -> Result<&'a [u8]> {
        Ok(extract_namespace_key(self.ns_key)?.1)
    }
}

/// Sorted-set score addressing:
/// `len(ns_key) as u32 || ns_key || version || encoded_score || member`.
/// The score is stored with the sign-flip trick so range scans by score are
/// plain prefix scans.
pub fn compose_score_key(ns_key: &[u8], version: u64, score: f64, member: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ns_key.len() + 8 + 8 + member.len());
    put_u32(&mut out, ns_key.len() as u32);
    out.extend_from_slice(ns_key);
    put_u64(&mut out, version);
    out.extend_from_slice(&encode_double(score));
    out.extend_from_slice(member);
    out
}

/// Split a score key back into `(score, member)` given its prefix layout.
pub fn parse_score_key(input: &[u8]) -> Result<(f64, &[u8])> {
    let ikey = InternalKey::parse(input)?;
    let sub_key = ikey.sub_key();
    if sub_key.len() < 8 {
        return Err(Error::Corruption("score key is too short".into()));
    }
    let (score_bytes, member) = sub_key.split_at(8);
    let score = crate::encoding::decode_double(
        score_bytes
            .try_into()
            .map_err(|_| Error::Corruption("invalid score bytes".into()))?,
    );
    Ok((score, member))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_key_roundtrip() {
        let ns_key = compose_namespace_key(b"ns1", b"user-key");
        let (ns, user_key) = extract_namespace_key(&ns_key).unwrap();
        assert_eq!(ns, b"ns1");
        assert_eq!(user_key, b"user-key");
    }

    #[test]
    fn test_namespace_key_rejects_garbage() {
        assert!(extract_namespace_key(b"").is_err());
        assert!(extract_namespace_key(&[9, b'a']).is_err());
        assert!(extract_namespace_key(&[0, b'a']).is_err());
    }

    #[test]
    fn test_internal_key_roundtrip() {
        let ns_key = compose_namespace_key(b"ns", b"mykey");
        let ikey = InternalKey::new(&ns_key, b"field", 42);
        let encoded = ikey.encode();
        let parsed = InternalKey::parse(&encoded).unwrap();
        assert_eq!(parsed.ns_key(), ns_key.as_slice());
        assert_eq!(parsed.version(), 42);
        assert_eq!(parsed.sub_key(), b"field");
        assert_eq!(parsed.namespace().unwrap(), b"ns");
        assert_eq!(parsed.user_key().unwrap(), b"mykey");
    }

    #[test]
    fn test_internal_key_rejects_short_input() {
        assert!(InternalKey::parse(b"").is_err());
        assert!(InternalKey::parse(&[0, 0, 0, 200, b'x']).is_err());
    }

    #[test]
    fn test_version_partitions_subkeys() {
        let ns_key = compose_namespace_key(b"ns", b"k");
        let v1 = InternalKey::new(&ns_key, b"a", 1).encode();
        let v2 = InternalKey::new(&ns_key, b"a", 2).encode();
        assert_ne!(v1, v2);
        // same prefix up to the version field
        assert_eq!(v1[..4 + ns_key.len()], v2[..4 + ns_key.len()]);
    }

    #[test]
    fn test_score_key_orders_by_score() {
        let ns_key = compose_namespace_key(b"ns", b"zs");
        let low = compose_score_key(&ns_key, 1, -2.5, b"m");
        let mid = compose_score_key(&ns_key, 1, 0.0, b"m");
        let high = compose_score_key(&ns_key, 1, 11.0, b"m");
        assert!(low < mid && mid < high);

        let (score, member) = parse_score_key(&high).unwrap();
        assert_eq!(score, 11.0);
        assert_eq!(member, b"m");
    }
}
