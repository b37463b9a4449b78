//! Whole-manifest snapshots and verified restore.
//!
//! Backups are byte-for-byte copies of the encrypted manifest; nothing is
//! decrypted. Every copy is re-read and checked before it is reported as
//! good, and a restore candidate is verified before it touches the live file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use super::crypto::MasterKey;
use super::error::{Result, VaultError};
use super::integrity::IntegrityVerifier;
use super::permissions::{ensure_private_dir, write_private_file, PermissionGuard};
use super::store::CredentialStore;
use super::types::StoreManifest;

const BACKUP_PREFIX: &str = "manifest-";
const SNAPSHOT_PREFIX: &str = "pre-restore-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Taken by `backup` / `backup_to`
    Backup,
    /// Safety snapshot taken automatically before a restore
    PreRestore,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub restored_entries: usize,
    pub safety_snapshot: PathBuf,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

fn kind_of(name: &str) -> Option<BackupKind> {
    if !name.ends_with(".json") {
        return None;
    }
    if name.starts_with(BACKUP_PREFIX) {
        Some(BackupKind::Backup)
    } else if name.starts_with(SNAPSHOT_PREFIX) {
        Some(BackupKind::PreRestore)
    } else {
        None
    }
}

/// Write `bytes` to a fresh `<prefix><ts>.json` in `dir`.
async fn write_snapshot(
    guard: &dyn PermissionGuard,
    dir: &Path,
    prefix: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let stamp = timestamp();
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("{}{}.json", prefix, stamp)
        } else {
            format!("{}{}-{}.json", prefix, stamp, attempt)
        };
        let path = dir.join(name);
        match write_private_file(guard, &path, bytes).await {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 16 => {
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Check that a manifest was sealed under `key` and that every
/// non-quarantined entry verifies.
fn verify_manifest(key: &MasterKey, manifest: &StoreManifest) -> Result<()> {
    let verifier = IntegrityVerifier::new(key);
    if key.salt() != manifest.encryption.salt.as_slice()
        || key.iterations() != manifest.encryption.iterations
        || !verifier.verify_key_check(&manifest.encryption.key_check)
    {
        return Err(VaultError::validation(
            "Manifest was sealed under different key material",
        ));
    }
    if let Some((api_id, reason)) = verifier.sweep(manifest).into_iter().next() {
        return Err(VaultError::integrity(api_id, reason));
    }
    Ok(())
}

pub struct BackupManager {
    store: Arc<CredentialStore>,
    backup_dir: PathBuf,
    retention: usize,
}

impl BackupManager {
    pub fn new(store: Arc<CredentialStore>, backup_dir: PathBuf, retention: usize) -> Self {
        Self {
            store,
            backup_dir,
            retention,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Back up into the default backup directory.
    pub async fn backup(&self) -> Result<BackupInfo> {
        let dir = self.backup_dir.clone();
        self.backup_to(&dir).await
    }

    /// Copy the live manifest verbatim into `dir`, then verify the copy.
    pub async fn backup_to(&self, dir: &Path) -> Result<BackupInfo> {
        let key = self.store.session_key().await?;
        let source = self.store.read_manifest_bytes().await?;
        let source_hash = sha256_hex(&source);

        ensure_private_dir(self.store.guard(), dir)?;
        let path = write_snapshot(self.store.guard(), dir, BACKUP_PREFIX, &source).await?;

        match self.verify_copy(&path, &source_hash, &key).await {
            Ok(()) => {
                let size = source.len() as u64;
                info!(path = %path.display(), bytes = size, "Backup written and verified");
                Ok(BackupInfo {
                    path,
                    kind: BackupKind::Backup,
                    created_at: Utc::now(),
                    size,
                    sha256: source_hash,
                })
            }
            Err(e) => {
                error!(path = %path.display(), "Backup verification failed: {}", e);
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), "Failed to remove bad backup: {}", rm);
                }
                Err(e)
            }
        }
    }

    async fn verify_copy(&self, path: &Path, expected_hash: &str, key: &MasterKey) -> Result<()> {
        let copy = tokio::fs::read(path).await?;
        if sha256_hex(&copy) != expected_hash {
            return Err(VaultError::Format(format!(
                "Backup {} does not match the source bytes",
                path.display()
            )));
        }
        let manifest = StoreManifest::parse(&copy)?;
        verify_manifest(key, &manifest)
    }

    /// Replace the live manifest with a verified backup.
    ///
    /// The live manifest is snapshotted to `pre-restore-<ts>.json` first and
    /// put back automatically if the restored file fails re-verification.
    pub async fn restore(&self, path: &Path) -> Result<RestoreReport> {
        let key = self.store.session_key().await?;
        let candidate_bytes = tokio::fs::read(path).await?;
        let candidate = StoreManifest::parse(&candidate_bytes)?;
        verify_manifest(&key, &candidate)?;
        let candidate_hash = sha256_hex(&candidate_bytes);

        let lock = self.store.lock_for_write().await?;
        let live_bytes = self.store.read_manifest_bytes().await?;
        ensure_private_dir(self.store.guard(), &self.backup_dir)?;
        let safety_snapshot = write_snapshot(
            self.store.guard(),
            &self.backup_dir,
            SNAPSHOT_PREFIX,
            &live_bytes,
        )
        .await?;

        self.store.commit_bytes(&candidate_bytes, &lock).await?;

        let check = async {
            let written = self.store.read_manifest_bytes().await?;
            if sha256_hex(&written) != candidate_hash {
                return Err(VaultError::Format(
                    "Restored manifest does not match the backup".to_string(),
                ));
            }
            verify_manifest(&key, &StoreManifest::parse(&written)?)
        }
        .await;

        if let Err(e) = check {
            error!(
                backup = %path.display(),
                "Restored manifest failed verification; rolling back: {}", e
            );
            self.store.commit_bytes(&live_bytes, &lock).await?;
            return Err(e);
        }
        drop(lock);

        info!(
            backup = %path.display(),
            snapshot = %safety_snapshot.display(),
            entries = candidate.apis.len(),
            "Restored manifest from backup"
        );
        Ok(RestoreReport {
            restored_entries: candidate.apis.len(),
            safety_snapshot,
        })
    }

    /// Backups and safety snapshots, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let read_dir = match std::fs::read_dir(&self.backup_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(kind) = kind_of(&name) else {
                continue;
            };
            let path = entry.path();
            let meta = entry.metadata()?;
            let bytes = std::fs::read(&path)?;
            let created_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            backups.push(BackupInfo {
                path,
                kind,
                created_at,
                size: meta.len(),
                sha256: sha256_hex(&bytes),
            });
        }
        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(backups)
    }

    /// Keep the newest `keep` of each kind; return the removed paths.
    pub fn prune(&self, keep: usize) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for kind in [BackupKind::Backup, BackupKind::PreRestore] {
            let stale = self
                .list_backups()?
                .into_iter()
                .filter(|b| b.kind == kind)
                .skip(keep);
            for backup in stale {
                std::fs::remove_file(&backup.path)?;
                removed.push(backup.path);
            }
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), keep, "Pruned old backups");
        }
        Ok(removed)
    }

    /// Apply the configured retention.
    pub fn prune_to_retention(&self) -> Result<Vec<PathBuf>> {
        self.prune(self.retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::secrets::{Credentials, EntryStatus};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    const PASS: &str = "Correct-Horse-42!";

    async fn setup(dir: &Path) -> (Arc<CredentialStore>, BackupManager) {
        let config = VaultConfig::for_tests(dir.join("vault"));
        let store = Arc::new(CredentialStore::open(&config).unwrap());
        store.unlock(PASS).await.unwrap();
        store
            .store(
                "fsk",
                "food_safety_korea",
                &Credentials::new().with("api_key", "ABCDEFGHIJ0123456789"),
                serde_json::Map::new(),
                false,
            )
            .await
            .unwrap();
        let manager = BackupManager::new(Arc::clone(&store), config.backup_dir(), 10);
        (store, manager)
    }

    fn corrupt(path: &Path, api_id: &str) {
        let mut json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        let field = &mut json["apis"][api_id]["encrypted_credentials"]["ciphertext"];
        let mut bytes = BASE64.decode(field.as_str().unwrap()).unwrap();
        bytes[1] ^= 0x40;
        *field = serde_json::Value::String(BASE64.encode(bytes));
        std::fs::write(path, serde_json::to_vec(&json).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_backup_is_verbatim_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = setup(dir.path()).await;

        let info = manager.backup().await.unwrap();
        assert_eq!(info.kind, BackupKind::Backup);
        let name = info.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("manifest-") && name.ends_with(".json"));
        assert_eq!(
            std::fs::read(&info.path).unwrap(),
            std::fs::read(store.manifest_path()).unwrap()
        );
        assert_eq!(manager.list_backups().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_refuses_corrupted_source() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = setup(dir.path()).await;
        corrupt(store.manifest_path(), "fsk");

        let err = manager.backup().await.unwrap_err();
        assert!(matches!(err, VaultError::Integrity { .. }));
        assert!(manager.list_backups().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_recovers_quarantined_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = setup(dir.path()).await;
        store.record_probe_outcome("fsk", true, None).await.unwrap();
        let backup = manager.backup().await.unwrap();

        corrupt(store.manifest_path(), "fsk");
        assert!(store.retrieve("fsk").await.is_err());
        assert_eq!(
            store.get_entry("fsk").await.unwrap().status(),
            EntryStatus::Quarantined
        );

        let report = manager.restore(&backup.path).await.unwrap();
        assert_eq!(report.restored_entries, 1);
        assert!(report.safety_snapshot.exists());
        assert_eq!(
            store.get_entry("fsk").await.unwrap().status(),
            EntryStatus::Active
        );
        assert_eq!(
            store.retrieve("fsk").await.unwrap().get("api_key"),
            Some("ABCDEFGHIJ0123456789")
        );
    }

    #[tokio::test]
    async fn test_tampered_backup_leaves_live_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = setup(dir.path()).await;
        let backup = manager.backup().await.unwrap();
        corrupt(&backup.path, "fsk");
        let live_before = std::fs::read(store.manifest_path()).unwrap();

        let err = manager.restore(&backup.path).await.unwrap_err();
        assert!(matches!(err, VaultError::Integrity { .. }));
        assert_eq!(std::fs::read(store.manifest_path()).unwrap(), live_before);
        assert!(store.retrieve("fsk").await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = setup(dir.path()).await;
        let backup = manager.backup().await.unwrap();
        store.rotate_key("Another-Passphrase-7?").await.unwrap();

        let err = manager.restore(&backup.path).await.unwrap_err();
        assert!(matches!(err, VaultError::Validation { .. }));
        assert!(store.retrieve("fsk").await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_interrupted_before_swap() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = setup(dir.path()).await;
        let backup = manager.backup().await.unwrap();
        store
            .store(
                "later",
                "generic_api_key",
                &Credentials::new().with("api_key", "added-after-backup"),
                serde_json::Map::new(),
                false,
            )
            .await
            .unwrap();
        let live_before = std::fs::read(store.manifest_path()).unwrap();

        store.fail_nth_commit(1);
        assert!(manager.restore(&backup.path).await.is_err());
        assert_eq!(std::fs::read(store.manifest_path()).unwrap(), live_before);
        assert!(store.retrieve("later").await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_survives_directory_fsync_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = setup(dir.path()).await;
        let backup = manager.backup().await.unwrap();
        store.delete("fsk").await.unwrap();

        store.fail_dir_sync(true);
        let report = manager.restore(&backup.path).await.unwrap();
        store.fail_dir_sync(false);

        assert_eq!(report.restored_entries, 1);
        assert_eq!(
            std::fs::read(store.manifest_path()).unwrap(),
            std::fs::read(&backup.path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_snapshots_go_through_guard() {
        use crate::secrets::permissions::tests::RecordingGuard;

        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::for_tests(dir.path().join("vault"));
        let guard = Arc::new(RecordingGuard::default());
        let store = Arc::new(CredentialStore::with_guard(&config, guard.clone()).unwrap());
        store.unlock(PASS).await.unwrap();
        let manager = BackupManager::new(Arc::clone(&store), config.backup_dir(), 10);

        let backup = manager.backup().await.unwrap();
        assert!(guard.files().contains(&backup.path));
        assert!(guard.seen.lock().unwrap().contains(&config.backup_dir()));

        let report = manager.restore(&backup.path).await.unwrap();
        assert!(guard.files().contains(&report.safety_snapshot));
    }

    #[tokio::test]
    async fn test_restore_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, manager) = setup(dir.path()).await;
        let bogus = dir.path().join("bogus.json");
        std::fs::write(&bogus, b"{\"version\": 99}").unwrap();
        assert!(matches!(
            manager.restore(&bogus).await,
            Err(VaultError::Format(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, manager) = setup(dir.path()).await;
        let mut paths = Vec::new();
        for _ in 0..4 {
            paths.push(manager.backup().await.unwrap().path);
            tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        }

        let removed = manager.prune(2).unwrap();
        assert_eq!(removed.len(), 2);
        let left: Vec<PathBuf> = manager
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|b| b.path)
            .collect();
        assert_eq!(left, vec![paths[3].clone(), paths[2].clone()]);
    }
}
