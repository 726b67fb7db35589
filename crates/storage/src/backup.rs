//! Backup, restore, and backup shipping.
//!
//! The leader snapshots the database with the engine's backup machinery and
//! ships the manifest plus data files over descriptors the transport layer
//! can feed to sendfile. The follower re-parses the manifest, stores every
//! file under a `.tmp` name, and renames into place only after the checksum
//! holds, so a torn transfer never leaves a half-written backup behind.
//!
//! The backup engine handle is opened per operation rather than held for the
//! storage lifetime: a restore swaps the files underneath, and a fresh handle
//! is the only one guaranteed to see the new state.

use std::fs::{self, File};
use std::io::Write;

use crc::{Crc, CRC_32_ISCSI};
use rocksdb::backup::{BackupEngine, BackupEngineOptions, RestoreOptions};
use rocksdb::Env;
use tracing::{error, info, warn};

use crate::engine::Storage;
use crate::error::{Error, Result};
use crate::metadata::now_secs;

/// The engine checksums backup files with CRC32C (Castagnoli).
static CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

impl Storage {
    fn open_backup_engine(&self) -> Result<BackupEngine> {
        let opts = BackupEngineOptions::new(&self.config.backup_dir)
            .map_err(|e| Error::DbBackup(e.into_string()))?;
        let env = Env::new().map_err(|e| Error::DbBackup(e.into_string()))?;
        BackupEngine::open(&opts, &env).map_err(|e| Error::DbBackup(e.into_string()))
    }

    /// Snapshot the current database. Returns the new backup id.
    pub fn create_backup(&self) -> Result<u32> {
        info!("start to create new backup");
        let db = self.db()?;
        let mut engine = self.open_backup_engine()?;
        engine
            .create_new_backup_flush(&*db, true)
            .map_err(|e| Error::DbBackup(e.into_string()))?;
        let backup_id = engine
            .get_backup_info()
            .last()
            .map(|backup| backup.backup_id)
            .unwrap_or_default();
        info!(backup_id, "success to create new backup");
        Ok(backup_id)
    }

    /// Close the database, restore the latest backup into the data directory,
    /// and reopen. All-or-nothing: a failed restore leaves the old files.
    pub fn restore_from_backup(&self) -> Result<()> {
        // reopen the backup engine every time, the files may have changed
        let mut engine = self.open_backup_engine()?;
        self.close();

        if let Err(e) = engine.restore_from_latest_backup(
            &self.config.db_dir,
            &self.config.db_dir,
            &RestoreOptions::default(),
        ) {
            error!("failed to restore: {e}");
            return Err(Error::DbBackup(e.into_string()));
        }
        info!("restore from backup");
        drop(engine);

        self.open().map_err(|e| {
            error!("failed to reopen db after restore: {e}");
            e
        })
    }

    /// Keep the most recent `num_backups_to_keep`, then drop whatever is
    /// older than `backup_max_keep_hours` (zero disables the age cut).
    pub fn purge_old_backups(
        &self,
        num_backups_to_keep: u32,
        backup_max_keep_hours: u32,
    ) -> Result<()> {
        let mut engine = self.open_backup_engine()?;
        let backups = engine.get_backup_info();
        if backups.len() > num_backups_to_keep as usize {
            info!(
                purged = backups.len() - num_backups_to_keep as usize,
                "going to purge old backups"
            );
            engine
                .purge_old_backups(num_backups_to_keep as usize)
                .map_err(|e| Error::DbBackup(e.into_string()))?;
        }

        if backup_max_keep_hours == 0 {
            return Ok(());
        }
        let backups = engine.get_backup_info();
        let deadline = i64::from(now_secs()) - i64::from(backup_max_keep_hours) * 3600;
        // infos are ordered oldest first, so an age cut is a keep-count
        let expired = backups
            .iter()
            .take_while(|backup| backup.timestamp < deadline)
            .count();
        if expired > 0 {
            info!(purged = expired, "going to purge expired backups");
            engine
                .purge_old_backups(backups.len() - expired)
                .map_err(|e| Error::DbBackup(e.into_string()))?;
        }
        Ok(())
    }

    /// Recover from a partial prior transfer: if the highest existing backup
    /// id is not `next_backup_id - 1`, wipe the backup directory wholesale.
    pub fn purge_backup_if_needed(&self, next_backup_id: u32) {
        let backups = match self.open_backup_engine() {
            Ok(engine) => engine.get_backup_info(),
            Err(_) => return,
        };
        let Some(latest) = backups.last() else {
            return;
        };
        if latest.backup_id == next_backup_id.wrapping_sub(1) {
            return;
        }
        warn!(
            latest = latest.backup_id,
            next = next_backup_id,
            "backup set does not line up with the incoming transfer, purging"
        );
        if let Err(e) = fs::remove_dir_all(&self.config.backup_dir) {
            error!("failed to remove backup dir: {e}");
        }
        if let Err(e) = fs::create_dir_all(&self.config.backup_dir) {
            error!("failed to recreate backup dir: {e}");
        }
    }
}

/// Parsed backup manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaInfo {
    pub timestamp: i64,
    pub seq: u64,
    pub meta_data: Option<String>,
    /// `(filename, crc32)` pairs.
    pub files: Vec<(String, u32)>,
}

pub struct BackupManager;

impl BackupManager {
    /// Leader side: create and verify a fresh backup, then hand back an open
    /// descriptor on its manifest so the transport can sendfile it. Bypasses
    /// the engine's file abstraction on purpose.
    pub fn open_latest_meta(storage: &Storage) -> Result<(File, u32, u64)> {
        storage.create_backup()?;
        let engine = storage.open_backup_engine()?;
        let backups = engine.get_backup_info();
        let latest = backups
            .last()
            .ok_or_else(|| Error::DbBackup("no backup found".into()))?;
        engine
            .verify_backup(latest.backup_id)
            .map_err(|e| Error::NotOk(e.into_string()))?;

        let meta_path = storage
            .config
            .backup_dir
            .join("meta")
            .join(latest.backup_id.to_string());
        let file = File::open(&meta_path)?;
        let size = file.metadata()?.len();
        Ok((file, latest.backup_id, size))
    }

    /// Leader side: open one referenced data file read-only.
    pub fn open_data_file(storage: &Storage, rel_path: &str) -> Result<(File, u64)> {
        let abs_path = storage.config.backup_dir.join(rel_path);
        if !abs_path.is_file() {
            error!(path = %abs_path.display(), "backup data file not found");
            return Err(Error::NotOk("backup data file not found".into()));
        }
        let file = File::open(&abs_path)?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    /// Follower side: persist the manifest bytes under their final name (via
    /// a tmp file and an atomic rename) and parse the fields in wire order:
    /// timestamp, sequence number, optional `metadata` line, file count, then
    /// `(filename crc32)` lines until EOF.
    pub fn parse_meta_and_save(storage: &Storage, meta_id: u32, data: &[u8]) -> Result<MetaInfo> {
        let rel_path = format!("meta/{meta_id}");
        let mut tmp = Self::new_tmp_file(storage, &rel_path)?;
        tmp.write_all(data)?;
        drop(tmp);

        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Corruption("backup manifest is not valid text".into()))?;
        let mut lines = text.lines();
        let timestamp: i64 = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| Error::Corruption("backup manifest misses the timestamp".into()))?;
        let seq: u64 = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| Error::Corruption("backup manifest misses the sequence".into()))?;

        let mut meta_data = None;
        let mut count_line = lines
            .next()
            .ok_or_else(|| Error::Corruption("backup manifest misses the file count".into()))?;
        if let Some(blob) = count_line.strip_prefix("metadata") {
            meta_data = Some(blob.trim_start().to_string());
            count_line = lines
                .next()
                .ok_or_else(|| Error::Corruption("backup manifest misses the file count".into()))?;
        }
        let _file_count: usize = count_line
            .trim()
            .parse()
            .map_err(|_| Error::Corruption("backup manifest has a bad file count".into()))?;

        let mut files = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let (name, crc) = match tokens.as_slice() {
                [name, "crc32", crc] => (*name, *crc),
                [name, crc] => (*name, *crc),
                _ => {
                    return Err(Error::Corruption(format!(
                        "bad backup manifest file line: {line}"
                    )))
                }
            };
            let crc: u32 = crc
                .parse()
                .map_err(|_| Error::Corruption(format!("bad file checksum: {line}")))?;
            files.push((name.to_string(), crc));
        }

        Self::swap_tmp_file(storage, &rel_path)?;
        Ok(MetaInfo {
            timestamp,
            seq,
            meta_data,
            files,
        })
    }

    /// Follower side: verify a received data file against its declared
    /// checksum and move it into place. A mismatch discards the bytes.
    pub fn check_and_save_data_file(
        storage: &Storage,
        rel_path: &str,
        data: &[u8],
        expected_crc32: u32,
    ) -> Result<()> {
        let actual = CRC32C.checksum(data);
        if actual != expected_crc32 {
            return Err(Error::DbBackup(format!(
                "checksum mismatch for {rel_path}: got {actual}, want {expected_crc32}"
            )));
        }
        let mut tmp = Self::new_tmp_file(storage, rel_path)?;
        tmp.write_all(data)?;
        drop(tmp);
        Self::swap_tmp_file(storage, rel_path)
    }

    pub fn file_exists(storage: &Storage, rel_path: &str) -> bool {
        storage.config.backup_dir.join(rel_path).is_file()
    }

    /// Remove the whole backup directory.
    pub fn purge_backup(storage: &Storage) -> Result<()> {
        let dir = &storage.config.backup_dir;
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn new_tmp_file(storage: &Storage, rel_path: &str) -> Result<File> {
        let tmp_path = storage.config.backup_dir.join(format!("{rel_path}.tmp"));
        if tmp_path.exists() {
            warn!(path = %tmp_path.display(), "tmp file exists, overriding");
        }
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(File::create(&tmp_path)?)
    }

    fn swap_tmp_file(storage: &Storage, rel_path: &str) -> Result<()> {
        let tmp_path = storage.config.backup_dir.join(format!("{rel_path}.tmp"));
        let path = storage.config.backup_dir.join(rel_path);
        fs::rename(&tmp_path, &path)
            .map_err(|_| Error::NotOk(format!("unable to rename: {}", tmp_path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_util::TestStorage;
    use crate::engine::{ColumnFamilyId, TypedBatch};
    use std::sync::Arc;

    fn unopened_storage() -> (Storage, std::path::PathBuf) {
        let config = TestStorage::config(false);
        let dir = config.backup_dir.parent().map(std::path::PathBuf::from);
        (
            Storage::new(Arc::new(config)),
            dir.unwrap_or_else(|| "/tmp".into()),
        )
    }

    #[test]
    fn test_manifest_parse_and_save() {
        let (storage, dir) = unopened_storage();
        let manifest = b"1700000000\n\
                         12345\n\
                         metadata some opaque blob\n\
                         2\n\
                         private/1/MANIFEST-000001 crc32 4021952935\n\
                         shared/000010.sst 77\n";
        let meta = BackupManager::parse_meta_and_save(&storage, 3, manifest).unwrap();
        assert_eq!(meta.timestamp, 1_700_000_000);
        assert_eq!(meta.seq, 12_345);
        assert_eq!(meta.meta_data.as_deref(), Some("some opaque blob"));
        assert_eq!(
            meta.files,
            vec![
                ("private/1/MANIFEST-000001".to_string(), 4_021_952_935),
                ("shared/000010.sst".to_string(), 77),
            ]
        );
        assert!(BackupManager::file_exists(&storage, "meta/3"));
        assert!(!BackupManager::file_exists(&storage, "meta/3.tmp"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_manifest_without_metadata_line() {
        let (storage, dir) = unopened_storage();
        let manifest = b"42\n7\n1\nshared/000007.sst crc32 9\n";
        let meta = BackupManager::parse_meta_and_save(&storage, 1, manifest).unwrap();
        assert_eq!(meta.meta_data, None);
        assert_eq!(meta.files.len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_truncated_manifest_is_corruption() {
        let (storage, dir) = unopened_storage();
        assert!(matches!(
            BackupManager::parse_meta_and_save(&storage, 1, b"42\n"),
            Err(Error::Corruption(_))
        ));
        assert!(matches!(
            BackupManager::parse_meta_and_save(&storage, 1, b"42\n7\n1\nno-checksum-here\n"),
            Err(Error::Corruption(_))
        ));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_data_file_checksum_gate() {
        let (storage, dir) = unopened_storage();
        let data = b"sst contents";
        let crc = CRC32C.checksum(data);

        assert!(BackupManager::check_and_save_data_file(&storage, "shared/1.sst", data, crc ^ 1)
            .is_err());
        assert!(!BackupManager::file_exists(&storage, "shared/1.sst"));

        BackupManager::check_and_save_data_file(&storage, "shared/1.sst", data, crc).unwrap();
        assert!(BackupManager::file_exists(&storage, "shared/1.sst"));
        let _ = std::fs::remove_dir_all(dir);
    }

    fn put_string(t: &TestStorage, key: &[u8], value: &[u8]) {
        let mut batch = TypedBatch::new();
        batch.put(ColumnFamilyId::Metadata, key.to_vec(), value.to_vec());
        t.storage.write(batch).unwrap();
    }

    fn get_metadata_value(t: &TestStorage, key: &[u8]) -> Option<Vec<u8>> {
        let db = t.storage.db().unwrap();
        let cf = crate::engine::cf_handle(&db, ColumnFamilyId::Metadata).unwrap();
        db.get_cf(&cf, key).unwrap()
    }

    #[test]
    fn test_backup_restore_roundtrip() {
        let t = TestStorage::open();
        put_string(&t, b"k1", b"v1");
        t.storage.create_backup().unwrap();
        put_string(&t, b"k2", b"v2");

        t.storage.restore_from_backup().unwrap();
        assert_eq!(get_metadata_value(&t, b"k1"), Some(b"v1".to_vec()));
        assert_eq!(get_metadata_value(&t, b"k2"), None);
    }

    #[test]
    fn test_open_latest_meta_ships_a_manifest() {
        let t = TestStorage::open();
        put_string(&t, b"k", b"v");
        let (file, backup_id, size) = BackupManager::open_latest_meta(&t.storage).unwrap();
        assert!(backup_id >= 1);
        assert!(size > 0);
        assert_eq!(file.metadata().unwrap().len(), size);
    }

    #[test]
    fn test_purge_old_backups_by_count() {
        let t = TestStorage::open();
        put_string(&t, b"k", b"v");
        for _ in 0..3 {
            t.storage.create_backup().unwrap();
        }
        t.storage.purge_old_backups(1, 0).unwrap();
        let engine = t.storage.open_backup_engine().unwrap();
        assert_eq!(engine.get_backup_info().len(), 1);
    }

    #[test]
    fn test_purge_backup_if_needed() {
        let t = TestStorage::open();
        put_string(&t, b"k", b"v");
        let backup_id = t.storage.create_backup().unwrap();

        // lined up with the next transfer: nothing happens
        t.storage.purge_backup_if_needed(backup_id + 1);
        let engine = t.storage.open_backup_engine().unwrap();
        assert_eq!(engine.get_backup_info().len(), 1);

        // out of line: the whole set is discarded
        t.storage.purge_backup_if_needed(backup_id + 7);
        let engine = t.storage.open_backup_engine().unwrap();
        assert!(engine.get_backup_info().is_empty());
    }
}
