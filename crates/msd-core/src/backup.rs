//! Durable, hash-verified calibration backups.
//!
//! A backup is written before any erase and is the rollback source for a
//! failed verify. Files are append-only: the name encodes variant and
//! timestamp, and an existing file is never overwritten.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::variant::EcuVariant;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("backup I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("backup hash mismatch: expected {expected}, found {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("backup metadata invalid: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Sidecar metadata written next to every backup image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMeta {
    pub variant: EcuVariant,
    pub timestamp: String,
    pub sha256: String,
    pub size: usize,
    pub source_ecu_id: String,
}

/// One written-and-verified backup.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub bin_path: PathBuf,
    pub meta_path: PathBuf,
    pub sha256: String,
    pub size: usize,
    pub timestamp: DateTime<Utc>,
    pub variant: EcuVariant,
}

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Append-only backup directory.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one backup with its sidecar, then re-read and verify the hash.
    pub fn write(
        &self,
        variant: EcuVariant,
        source_ecu_id: &str,
        image: &[u8],
    ) -> Result<BackupRecord, BackupError> {
        fs::create_dir_all(&self.dir)?;

        let timestamp = Utc::now();
        let stamp = timestamp.format("%Y%m%dT%H%M%S%.3fZ");
        let bin_path = self.dir.join(format!("backup-{variant}-{stamp}.bin"));
        let meta_path = bin_path.with_extension("json");
        if bin_path.exists() {
            return Err(BackupError::AlreadyExists(bin_path));
        }

        let sha256 = sha256_hex(image);
        fs::write(&bin_path, image)?;

        let meta = BackupMeta {
            variant,
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            sha256: sha256.clone(),
            size: image.len(),
            source_ecu_id: source_ecu_id.to_string(),
        };
        fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;

        let record = BackupRecord {
            bin_path,
            meta_path,
            sha256,
            size: image.len(),
            timestamp,
            variant,
        };
        // Read back what actually hit the disk.
        self.verify(&record)?;
        info!(path = %record.bin_path.display(), size = record.size, "backup written");
        Ok(record)
    }

    /// Re-read a backup image and check it against the recorded hash.
    pub fn verify(&self, record: &BackupRecord) -> Result<Vec<u8>, BackupError> {
        let data = fs::read(&record.bin_path)?;
        let actual = sha256_hex(&data);
        if actual != record.sha256 {
            return Err(BackupError::HashMismatch {
                expected: record.sha256.clone(),
                actual,
            });
        }
        Ok(data)
    }

    /// Load a backup by its sidecar path, verifying the recorded hash.
    pub fn load(&self, meta_path: &Path) -> Result<(BackupMeta, Vec<u8>), BackupError> {
        let meta: BackupMeta = serde_json::from_str(&fs::read_to_string(meta_path)?)?;
        let bin_path = meta_path.with_extension("bin");
        let data = fs::read(&bin_path)?;
        let actual = sha256_hex(&data);
        if actual != meta.sha256 {
            return Err(BackupError::HashMismatch {
                expected: meta.sha256.clone(),
                actual,
            });
        }
        Ok((meta, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> BackupStore {
        let dir = std::env::temp_dir().join(format!("msd-core-backup-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        BackupStore::new(dir)
    }

    #[test]
    fn write_verify_load_round_trip() {
        let store = temp_store("round-trip");
        let image = vec![0xA5u8; 4096];
        let record = store.write(EcuVariant::Msd80, "I8A0S", &image).unwrap();

        assert!(record.bin_path.exists());
        assert!(record.meta_path.exists());
        assert_eq!(record.size, 4096);

        let read_back = store.verify(&record).unwrap();
        assert_eq!(read_back, image);

        let (meta, data) = store.load(&record.meta_path).unwrap();
        assert_eq!(meta.variant, EcuVariant::Msd80);
        assert_eq!(meta.source_ecu_id, "I8A0S");
        assert_eq!(meta.sha256, record.sha256);
        assert_eq!(data, image);
    }

    #[test]
    fn tampered_backup_fails_verification() {
        let store = temp_store("tamper");
        let image = vec![0x11u8; 512];
        let record = store.write(EcuVariant::Msd81, "I9A0S", &image).unwrap();

        fs::write(&record.bin_path, vec![0x22u8; 512]).unwrap();
        assert!(matches!(
            store.verify(&record),
            Err(BackupError::HashMismatch { .. })
        ));
    }

    #[test]
    fn filenames_encode_variant_and_timestamp() {
        let store = temp_store("names");
        let record = store.write(EcuVariant::Msd81, "ecu", &[1, 2, 3]).unwrap();
        let name = record.bin_path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("backup-msd81-"));
        assert!(name.ends_with(".bin"));
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
