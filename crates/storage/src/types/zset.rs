//! Sorted-set type. Each member owns two rows: the member row in the default
//! column family holding the encoded score, and a score row in the
//! `zset_score` family whose key embeds the score, so ordered scans by score
//! are plain prefix scans.

use std::sync::Arc;

use rocksdb::{Direction, IteratorMode};

use crate::encoding::{decode_double, encode_double};
use crate::engine::{cf_handle, ColumnFamilyId, Storage, TypedBatch};
use crate::error::{Error, Result};
use crate::keys::{compose_score_key, parse_score_key, InternalKey};
use crate::metadata::{Metadata, RedisType};
use crate::types::{Database, LatestSnapshot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBound {
    pub value: f64,
    pub exclusive: bool,
}

impl ScoreBound {
    pub fn inclusive(value: f64) -> Self {
        Self {
            value,
            exclusive: false,
        }
    }
}

pub struct ZSetDb {
    base: Database,
}

impl ZSetDb {
    pub fn new(storage: Arc<Storage>, namespace: &[u8]) -> Result<Self> {
        Ok(Self {
            base: Database::new(storage, namespace)?,
        })
    }

    /// Insert or update members, returning how many were newly added.
    pub fn add(&self, user_key: &[u8], entries: &[(f64, &[u8])]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::ZSet, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => Metadata::new(RedisType::ZSet),
            Err(e) => return Err(e),
        };

        // last mention of a member wins, and only one pair of rows is written
        let mut seen = std::collections::HashSet::new();
        let mut unique: Vec<(f64, &[u8])> = Vec::with_capacity(entries.len());
        for &(score, member) in entries.iter().rev() {
            if seen.insert(member.to_vec()) {
                unique.push((score, member));
            }
        }

        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut batch = TypedBatch::new();
        let mut added = 0;
        for (score, member) in unique {
            let member_key = InternalKey::new(&ns_key, member, metadata.version).encode();
            match self.base.db.get_cf(&cf, &member_key)? {
                Some(old) => {
                    let old_score = decode_double(
                        old.as_slice()
                            .try_into()
                            .map_err(|_| Error::Corruption("invalid score bytes".into()))?,
                    );
                    if old_score == score {
                        continue;
                    }
                    batch.delete(
                        ColumnFamilyId::ZSetScore,
                        compose_score_key(&ns_key, metadata.version, old_score, member),
                    );
                }
                None => added += 1,
            }
            batch.put(
                ColumnFamilyId::Default,
                member_key,
                encode_double(score).to_vec(),
            );
            batch.put(
                ColumnFamilyId::ZSetScore,
                compose_score_key(&ns_key, metadata.version, score, member),
                Vec::new(),
            );
        }
        metadata.size += added;
        batch.put(ColumnFamilyId::Metadata, ns_key, metadata.encode());
        self.base.storage.write(batch)?;
        Ok(added)
    }

    pub fn card(&self, user_key: &[u8]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        match self.base.get_metadata(RedisType::ZSet, &ns_key) {
            Ok(metadata) => Ok(metadata.size),
            Err(Error::NotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn score(&self, user_key: &[u8], member: &[u8]) -> Result<f64> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = self.base.get_metadata(RedisType::ZSet, &ns_key)?;
        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let key = InternalKey::new(&ns_key, member, metadata.version).encode();
        let bytes = self
            .base
            .db
            .get_cf_opt(&cf, &key, &snapshot.read_options())?
            .ok_or(Error::NotFound)?;
        Ok(decode_double(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::Corruption("invalid score bytes".into()))?,
        ))
    }

    pub fn incr_by(&self, user_key: &[u8], member: &[u8], delta: f64) -> Result<f64> {
        let current = match self.score(user_key, member) {
            Ok(score) => score,
            Err(Error::NotFound) => 0.0,
            Err(e) => return Err(e),
        };
        let updated = current + delta;
        self.add(user_key, &[(updated, member)])?;
        Ok(updated)
    }

    pub fn remove(&self, user_key: &[u8], members: &[&[u8]]) -> Result<u64> {
        let ns_key = self.base.ns_key(user_key);
        let _guard = self.base.storage.lock_manager().lock(&ns_key);

        let mut metadata = match self.base.get_metadata(RedisType::ZSet, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(0),
            Err(e) => return Err(e),
        };

        let cf = cf_handle(&self.base.db, ColumnFamilyId::Default)?;
        let mut batch = TypedBatch::new();
        let mut removed = 0;
        for member in members {
            let member_key = InternalKey::new(&ns_key, member, metadata.version).encode();
            let Some(old) = self.base.db.get_cf(&cf, &member_key)? else {
                continue;
            };
            let old_score = decode_double(
                old.as_slice()
                    .try_into()
                    .map_err(|_| Error::Corruption("invalid score bytes".into()))?,
            );
            removed += 1;
            batch.delete(ColumnFamilyId::Default, member_key);
            batch.delete(
                ColumnFamilyId::ZSetScore,
                compose_score_key(&ns_key, metadata.version, old_score, member),
            );
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

    /// Members by rank, ascending; negative indexes count from the tail.
    pub fn range_by_rank(
        &self,
        user_key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = match self.base.get_metadata(RedisType::ZSet, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let size = metadata.size as i64;
        let start = if start < 0 { (size + start).max(0) } else { start };
        let stop = if stop < 0 { size + stop } else { stop.min(size - 1) };
        if start > stop {
            return Ok(Vec::new());
        }

        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::ZSetScore)?;
        let prefix = InternalKey::new(&ns_key, b"", metadata.version).encode();
        let iter = self.base.db.iterator_cf_opt(
            &cf,
            snapshot.iter_options(),
            IteratorMode::From(&prefix, Direction::Forward),
        );
        let mut entries = Vec::new();
        for (rank, item) in iter.enumerate() {
            let (key, _) = item?;
            if !key.starts_with(&prefix) || rank as i64 > stop {
                break;
            }
            if (rank as i64) < start {
                continue;
            }
            let (score, member) = parse_score_key(&key)?;
            entries.push((member.to_vec(), score));
        }
        Ok(entries)
    }

    /// Members whose score falls within the bounds, ascending.
    pub fn range_by_score(
        &self,
        user_key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        let ns_key = self.base.ns_key(user_key);
        let metadata = match self.base.get_metadata(RedisType::ZSet, &ns_key) {
            Ok(metadata) => metadata,
            Err(Error::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let snapshot = LatestSnapshot::new(&self.base.db);
        let cf = cf_handle(&self.base.db, ColumnFamilyId::ZSetScore)?;
        let prefix = InternalKey::new(&ns_key, b"", metadata.version).encode();
        let start = compose_score_key(&ns_key, metadata.version, min.value, b"");
        let iter = self.base.db.iterator_cf_opt(
            &cf,
            snapshot.iter_options(),
            IteratorMode::From(&start, Direction::Forward),
        );
        let mut entries = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let (score, member) = parse_score_key(&key)?;
            if score > max.value || (max.exclusive && score == max.value) {
                break;
            }
            if min.exclusive && score == min.value {
                continue;
            }
            entries.push((member.to_vec(), score));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_util::TestStorage;

    fn zset_db(t: &TestStorage) -> ZSetDb {
        ZSetDb::new(t.storage_arc(), b"ns").unwrap()
    }

    #[test]
    fn test_add_score_card() {
        let t = TestStorage::open();
        let zdb = zset_db(&t);
        assert_eq!(
            zdb.add(b"z", &[(1.5, b"a"), (-2.0, b"b")]).unwrap(),
            2
        );
        assert_eq!(zdb.card(b"z").unwrap(), 2);
        assert_eq!(zdb.score(b"z", b"a").unwrap(), 1.5);
        assert_eq!(zdb.score(b"z", b"b").unwrap(), -2.0);

        // update keeps cardinality
        assert_eq!(zdb.add(b"z", &[(9.0, b"a")]).unwrap(), 0);
        assert_eq!(zdb.score(b"z", b"a").unwrap(), 9.0);
        assert_eq!(zdb.card(b"z").unwrap(), 2);
    }

    #[test]
    fn test_range_by_rank_orders_by_score() {
        let t = TestStorage::open();
        let zdb = zset_db(&t);
        zdb.add(b"z", &[(3.0, b"c"), (-1.0, b"a"), (2.0, b"b")])
            .unwrap();

        let all = zdb.range_by_rank(b"z", 0, -1).unwrap();
        assert_eq!(
            all,
            vec![
                (b"a".to_vec(), -1.0),
                (b"b".to_vec(), 2.0),
                (b"c".to_vec(), 3.0)
            ]
        );
        let tail = zdb.range_by_rank(b"z", -2, -1).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, b"b".to_vec());
    }

    #[test]
    fn test_range_by_score_bounds() {
        let t = TestStorage::open();
        let zdb = zset_db(&t);
        zdb.add(b"z", &[(1.0, b"a"), (2.0, b"b"), (3.0, b"c")])
            .unwrap();

        let mid = zdb
            .range_by_score(
                b"z",
                ScoreBound::inclusive(1.5),
                ScoreBound::inclusive(3.0),
            )
            .unwrap();
        assert_eq!(mid.len(), 2);

        let exclusive = zdb
            .range_by_score(
                b"z",
                ScoreBound {
                    value: 1.0,
                    exclusive: true,
                },
                ScoreBound {
                    value: 3.0,
                    exclusive: true,
                },
            )
            .unwrap();
        assert_eq!(exclusive, vec![(b"b".to_vec(), 2.0)]);
    }

    #[test]
    fn test_update_removes_stale_score_row() {
        let t = TestStorage::open();
        let zdb = zset_db(&t);
        zdb.add(b"z", &[(1.0, b"m")]).unwrap();
        zdb.add(b"z", &[(5.0, b"m")]).unwrap();

        let all = zdb.range_by_rank(b"z", 0, -1).unwrap();
        assert_eq!(all, vec![(b"m".to_vec(), 5.0)]);
    }

    #[test]
    fn test_remove_and_incr() {
        let t = TestStorage::open();
        let zdb = zset_db(&t);
        zdb.add(b"z", &[(1.0, b"a"), (2.0, b"b")]).unwrap();
        assert_eq!(zdb.remove(b"z", &[b"a", b"missing"]).unwrap(), 1);
        assert_eq!(zdb.card(b"z").unwrap(), 1);

        assert_eq!(zdb.incr_by(b"z", b"b", 2.5).unwrap(), 4.5);
        assert_eq!(zdb.incr_by(b"z", b"new", 1.0).unwrap(), 1.0);
        assert_eq!(zdb.card(b"z").unwrap(), 2);
    }
}
