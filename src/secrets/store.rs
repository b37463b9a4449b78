//! Persisted, encrypted credential collection.
//!
//! The manifest is only ever replaced whole: every mutation re-reads the live
//! file under the in-process writer mutex and the cross-process `fs2` lock,
//! writes a sibling temp file, fsyncs it and renames it over the manifest.
//! Readers take no locks and always see a complete old or new manifest.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::crypto::{self, MasterKey};
use super::error::{FieldIssue, Result, VaultError};
use super::integrity::IntegrityVerifier;
use super::permissions::{self, OwnerOnly, PermissionGuard};
use super::types::{
    Credentials, CredentialEntry, EncryptionParams, EntryMetadata, EntryStatus, EntrySummary,
    GlobalSettings, StoreManifest, ALGORITHM_AES_256_GCM, KDF_PBKDF2_SHA256,
};
use crate::config::VaultConfig;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Holds the cross-process advisory lock until dropped.
struct ManifestFileLock {
    file: File,
}

impl Drop for ManifestFileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release manifest lock: {}", e);
        }
    }
}

/// Both writer locks. The file lock is released first.
pub(crate) struct WriteLock<'a> {
    _file: ManifestFileLock,
    _writer: MutexGuard<'a, ()>,
}

/// Result of a full integrity and permission sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    /// Entries whose hash was checked
    pub checked: usize,
    /// Entries quarantined by this sweep
    pub newly_quarantined: Vec<String>,
    /// Entries that were already quarantined
    pub already_quarantined: Vec<String>,
    pub permission_warnings: Vec<String>,
    pub backup_count: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.newly_quarantined.is_empty()
            && self.already_quarantined.is_empty()
            && self.permission_warnings.is_empty()
    }
}

/// Manifest statistics. Contains no key material.
#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub manifest_path: PathBuf,
    pub manifest_bytes: u64,
    pub version: u32,
    pub algorithm: String,
    pub key_derivation: String,
    pub iterations: u32,
    pub total_entries: usize,
    pub by_status: BTreeMap<String, usize>,
}

pub struct CredentialStore {
    vault_dir: PathBuf,
    manifest_path: PathBuf,
    lock_path: PathBuf,
    backup_dir: PathBuf,
    kdf_iterations: u32,
    lock_timeout: Duration,
    settings: GlobalSettings,
    require_strong_passphrase: bool,
    guard: Arc<dyn PermissionGuard>,
    writer: Mutex<()>,
    session: RwLock<Option<Arc<MasterKey>>>,
    #[cfg(test)]
    fail_on_commit: std::sync::atomic::AtomicUsize,
    #[cfg(test)]
    fail_dir_sync: std::sync::atomic::AtomicBool,
}

fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

pub(crate) fn validate_api_id(api_id: &str) -> Result<()> {
    let valid = !api_id.is_empty()
        && api_id.len() <= 128
        && api_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(VaultError::invalid_fields(vec![FieldIssue::new(
            "api_id",
            "must be 1-128 characters of [A-Za-z0-9_.-]",
        )]))
    }
}

fn strength_check(passphrase: &str) -> Result<()> {
    let issues = crypto::passphrase_issues(passphrase);
    if issues.is_empty() {
        return Ok(());
    }
    Err(VaultError::invalid_fields(
        issues
            .into_iter()
            .map(|m| FieldIssue::new("master_passphrase", m))
            .collect(),
    ))
}

/// Refuse to act on a manifest sealed under a different key (rotated elsewhere).
fn check_session(key: &MasterKey, manifest: &StoreManifest) -> Result<()> {
    if key.salt() != manifest.encryption.salt.as_slice()
        || !IntegrityVerifier::new(key).verify_key_check(&manifest.encryption.key_check)
    {
        return Err(VaultError::Decryption(
            "Session key does not match the manifest; unlock again".to_string(),
        ));
    }
    Ok(())
}

fn live_entry_mut<'m>(
    manifest: &'m mut StoreManifest,
    api_id: &str,
) -> Result<&'m mut CredentialEntry> {
    manifest
        .apis
        .get_mut(api_id)
        .filter(|e| !e.is_removed())
        .ok_or_else(|| VaultError::NotFound(api_id.to_string()))
}

fn transition(entry: &mut CredentialEntry, next: EntryStatus, reason: Option<String>) -> bool {
    if !entry.metadata.status.can_transition_to(next) {
        return false;
    }
    entry.metadata.status = next;
    entry.metadata.status_reason = reason;
    entry.metadata.updated_at = now();
    true
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl CredentialStore {
    /// Open the vault directory, creating it (0700) if needed. Does not unlock.
    pub fn open(config: &VaultConfig) -> Result<Self> {
        Self::with_guard(config, Arc::new(OwnerOnly))
    }

    pub fn with_guard(config: &VaultConfig, guard: Arc<dyn PermissionGuard>) -> Result<Self> {
        permissions::ensure_private_dir(guard.as_ref(), &config.vault_dir)?;
        Ok(Self {
            vault_dir: config.vault_dir.clone(),
            manifest_path: config.manifest_path(),
            lock_path: config.lock_path(),
            backup_dir: config.backup_dir(),
            kdf_iterations: config.kdf_iterations,
            lock_timeout: config.lock_timeout,
            settings: config.global_settings(),
            require_strong_passphrase: config.require_strong_passphrase,
            guard,
            writer: Mutex::new(()),
            session: RwLock::new(None),
            #[cfg(test)]
            fail_on_commit: std::sync::atomic::AtomicUsize::new(0),
            #[cfg(test)]
            fail_dir_sync: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn vault_dir(&self) -> &Path {
        &self.vault_dir
    }

    pub(crate) fn guard(&self) -> &dyn PermissionGuard {
        self.guard.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────────────

    /// Derive the session key, initialising a new manifest if none exists.
    pub async fn unlock(&self, passphrase: &str) -> Result<()> {
        if !self.manifest_path.exists() {
            let lock = self.lock_for_write().await?;
            if !self.manifest_path.exists() {
                let key = self.initialise(passphrase, &lock).await?;
                *self.session.write().await = Some(Arc::new(key));
                return Ok(());
            }
        }

        let manifest = self.read_manifest().await?;
        let key = crypto::derive_key(
            passphrase,
            &manifest.encryption.salt,
            manifest.encryption.iterations,
        )?;
        if !IntegrityVerifier::new(&key).verify_key_check(&manifest.encryption.key_check) {
            warn!(path = %self.manifest_path.display(), "Unlock rejected: wrong master passphrase");
            return Err(VaultError::Decryption(
                "Incorrect master passphrase".to_string(),
            ));
        }

        *self.session.write().await = Some(Arc::new(key));
        info!(
            path = %self.manifest_path.display(),
            entries = manifest.apis.len(),
            "Credential vault unlocked"
        );
        Ok(())
    }

    async fn initialise(&self, passphrase: &str, lock: &WriteLock<'_>) -> Result<MasterKey> {
        if self.require_strong_passphrase {
            strength_check(passphrase)?;
        }
        let salt = crypto::generate_salt();
        let key = crypto::derive_key(passphrase, &salt, self.kdf_iterations)?;
        let key_check = IntegrityVerifier::new(&key).key_check()?;
        let manifest = StoreManifest::new(
            EncryptionParams {
                algorithm: ALGORITHM_AES_256_GCM.to_string(),
                key_derivation: KDF_PBKDF2_SHA256.to_string(),
                salt,
                iterations: self.kdf_iterations,
                key_check,
            },
            self.settings.clone(),
        );
        self.commit(&manifest, lock).await?;
        info!(
            path = %self.manifest_path.display(),
            iterations = self.kdf_iterations,
            "Initialised new credential vault"
        );
        Ok(key)
    }

    /// Drop the session key. Key bytes are zeroed once no operation holds them.
    pub async fn lock(&self) {
        if self.session.write().await.take().is_some() {
            info!("Credential vault locked");
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub(crate) async fn session_key(&self) -> Result<Arc<MasterKey>> {
        self.session.read().await.clone().ok_or(VaultError::Locked)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) async fn lock_for_write(&self) -> Result<WriteLock<'_>> {
        let writer = tokio::time::timeout(self.lock_timeout, self.writer.lock())
            .await
            .map_err(|_| {
                VaultError::Concurrency(format!(
                    "Timed out after {:?} waiting for the writer lock",
                    self.lock_timeout
                ))
            })?;
        let file = self.acquire_file_lock().await?;
        Ok(WriteLock {
            _file: file,
            _writer: writer,
        })
    }

    async fn acquire_file_lock(&self) -> Result<ManifestFileLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(ManifestFileLock { file }),
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(path = %self.lock_path.display(), "Manifest lock held by another writer");
                return Err(VaultError::Concurrency(format!(
                    "Timed out after {:?} waiting for {}",
                    self.lock_timeout,
                    self.lock_path.display()
                )));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    pub(crate) async fn read_manifest_bytes(&self) -> Result<Vec<u8>> {
        match tokio::fs::read(&self.manifest_path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VaultError::Format(format!(
                "No manifest at {}; unlock to initialise",
                self.manifest_path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn read_manifest(&self) -> Result<StoreManifest> {
        let bytes = self.read_manifest_bytes().await?;
        StoreManifest::parse(&bytes)
    }

    pub(crate) async fn commit(
        &self,
        manifest: &StoreManifest,
        lock: &WriteLock<'_>,
    ) -> Result<()> {
        let data = serde_json::to_vec_pretty(manifest)?;
        self.commit_bytes(&data, lock).await
    }

    /// Temp file, fsync, rename, fsync directory.
    ///
    /// Once the rename succeeds the commit has happened: a failed directory
    /// fsync is logged, not returned.
    pub(crate) async fn commit_bytes(&self, data: &[u8], _lock: &WriteLock<'_>) -> Result<()> {
        let tmp_path = self
            .vault_dir
            .join(format!(".manifest.{}.tmp", Uuid::new_v4()));
        permissions::write_private_file(self.guard(), &tmp_path, data).await?;

        #[cfg(test)]
        if self.take_injected_failure() {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated crash before rename",
            )));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.manifest_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = self.sync_vault_dir().await {
            warn!(
                dir = %self.vault_dir.display(),
                "Manifest renamed but directory fsync failed: {}",
                e
            );
        }
        debug!(bytes = data.len(), "Committed manifest");
        Ok(())
    }

    async fn sync_vault_dir(&self) -> std::io::Result<()> {
        #[cfg(test)]
        if self.fail_dir_sync.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated directory fsync failure",
            ));
        }
        sync_dir(&self.vault_dir).await
    }

    /// Make every directory fsync after a commit rename fail.
    #[cfg(test)]
    pub(crate) fn fail_dir_sync(&self, fail: bool) {
        self.fail_dir_sync
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Fail the `n`th commit from now (1 = the next one) after its temp write.
    #[cfg(test)]
    pub(crate) fn fail_nth_commit(&self, n: usize) {
        self.fail_on_commit
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> bool {
        use std::sync::atomic::Ordering;
        match self.fail_on_commit.load(Ordering::SeqCst) {
            0 => false,
            1 => {
                self.fail_on_commit.store(0, Ordering::SeqCst);
                true
            }
            n => {
                self.fail_on_commit.store(n - 1, Ordering::SeqCst);
                false
            }
        }
    }

    /// Re-read the live manifest under both locks, apply `f`, commit.
    pub(crate) async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreManifest, &MasterKey) -> Result<T>,
    {
        let key = self.session_key().await?;
        let lock = self.lock_for_write().await?;
        let mut manifest = self.read_manifest().await?;
        check_session(&key, &manifest)?;
        let out = f(&mut manifest, &key)?;
        self.commit(&manifest, &lock).await?;
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Entries
    // ─────────────────────────────────────────────────────────────────────

    /// Encrypt and write a new entry as `pending`.
    pub async fn store(
        &self,
        api_id: &str,
        provider: &str,
        credentials: &Credentials,
        configuration: serde_json::Map<String, serde_json::Value>,
        overwrite: bool,
    ) -> Result<()> {
        validate_api_id(api_id)?;
        if credentials.is_empty() {
            return Err(VaultError::validation("Credentials must not be empty"));
        }
        let key = self.session_key().await?;
        let record = crypto::encrypt(credentials, &key)?;
        let integrity_hash = IntegrityVerifier::new(&key).seal(api_id, &record)?;

        self.mutate(|manifest, _| {
            if manifest.live(api_id).is_some() && !overwrite {
                return Err(VaultError::validation(format!(
                    "API registration {} already exists",
                    api_id
                )));
            }
            manifest.apis.insert(
                api_id.to_string(),
                CredentialEntry {
                    provider: provider.to_string(),
                    encrypted_credentials: record,
                    configuration,
                    metadata: EntryMetadata::new(now()),
                    integrity_hash,
                },
            );
            Ok(())
        })
        .await?;

        info!(api_id, provider, fields = credentials.len(), "Stored credential entry");
        Ok(())
    }

    /// Integrity check, then decrypt. The plaintext is not cached.
    pub async fn retrieve(&self, api_id: &str) -> Result<Credentials> {
        let key = self.session_key().await?;
        let manifest = self.read_manifest().await?;
        check_session(&key, &manifest)?;
        let entry = manifest
            .live(api_id)
            .ok_or_else(|| VaultError::NotFound(api_id.to_string()))?;

        if entry.status() == EntryStatus::Quarantined {
            let reason = entry
                .metadata
                .status_reason
                .clone()
                .unwrap_or_else(|| "entry is quarantined".to_string());
            return Err(VaultError::integrity(api_id, reason));
        }

        if let Err(err) = IntegrityVerifier::new(&key).verify(
            api_id,
            &entry.encrypted_credentials,
            &entry.integrity_hash,
        ) {
            warn!(api_id, "Integrity check failed");
            match self
                .quarantine_failing(&[(api_id.to_string(), err.to_string())])
                .await
            {
                Ok(ids) if ids.is_empty() => {
                    debug!(api_id, "Entry changed since the failed check; not quarantined")
                }
                Ok(_) => warn!(api_id, "Entry quarantined"),
                Err(e) => error!(api_id, "Failed to quarantine entry: {}", e),
            }
            return Err(err);
        }

        match crypto::decrypt(&entry.encrypted_credentials, &key) {
            Ok(credentials) => {
                debug!(api_id, "Decrypted credential entry");
                Ok(credentials)
            }
            Err(err) => {
                warn!(api_id, "Decryption failed after a valid integrity check");
                if let Err(e) = self
                    .mark_error_if_unchanged(api_id, &entry.integrity_hash, &err.to_string())
                    .await
                {
                    error!(api_id, "Failed to mark entry as errored: {}", e);
                }
                Err(err)
            }
        }
    }

    /// Replace the secret with a freshly encrypted record; status returns to `pending`.
    pub async fn update(&self, api_id: &str, credentials: &Credentials) -> Result<()> {
        if credentials.is_empty() {
            return Err(VaultError::validation("Credentials must not be empty"));
        }
        let key = self.session_key().await?;
        let record = crypto::encrypt(credentials, &key)?;
        let integrity_hash = IntegrityVerifier::new(&key).seal(api_id, &record)?;

        self.mutate(|manifest, _| {
            let entry = live_entry_mut(manifest, api_id)?;
            if entry.status() == EntryStatus::Quarantined {
                return Err(VaultError::validation(format!(
                    "{} is quarantined; restore a backup or re-register it",
                    api_id
                )));
            }
            entry.encrypted_credentials = record;
            entry.integrity_hash = integrity_hash;
            entry.metadata.status = EntryStatus::Pending;
            entry.metadata.status_reason = None;
            entry.metadata.consecutive_failures = 0;
            entry.metadata.updated_at = now();
            Ok(())
        })
        .await?;

        info!(api_id, "Updated credential entry");
        Ok(())
    }

    /// Replace the non-secret configuration only.
    pub async fn update_configuration(
        &self,
        api_id: &str,
        configuration: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.mutate(|manifest, _| {
            let entry = live_entry_mut(manifest, api_id)?;
            entry.configuration = configuration;
            entry.metadata.updated_at = now();
            Ok(())
        })
        .await?;
        debug!(api_id, "Updated entry configuration");
        Ok(())
    }

    /// Two commits: a zeroed `removed` tombstone, then the entry is dropped.
    pub async fn delete(&self, api_id: &str) -> Result<()> {
        let key = self.session_key().await?;
        let lock = self.lock_for_write().await?;
        let mut manifest = self.read_manifest().await?;
        check_session(&key, &manifest)?;

        let entry = live_entry_mut(&mut manifest, api_id)?;
        let scrubbed = entry.encrypted_credentials.scrubbed();
        entry.integrity_hash = IntegrityVerifier::new(&key).seal(api_id, &scrubbed)?;
        entry.encrypted_credentials = scrubbed;
        entry.metadata.status = EntryStatus::Removed;
        entry.metadata.status_reason = None;
        entry.metadata.updated_at = now();
        self.commit(&manifest, &lock).await?;

        manifest.apis.remove(api_id);
        self.commit(&manifest, &lock).await?;

        info!(api_id, "Deleted credential entry");
        Ok(())
    }

    /// Summaries of live entries, sorted by id. Does not need an unlocked session.
    pub async fn list(&self) -> Result<Vec<EntrySummary>> {
        let manifest = self.read_manifest().await?;
        Ok(manifest
            .summaries()
            .into_iter()
            .filter(|s| s.status != EntryStatus::Removed)
            .collect())
    }

    pub async fn get_entry(&self, api_id: &str) -> Result<CredentialEntry> {
        let manifest = self.read_manifest().await?;
        manifest
            .live(api_id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(api_id.to_string()))
    }

    pub async fn global_settings(&self) -> Result<GlobalSettings> {
        Ok(self.read_manifest().await?.global_settings)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────

    /// Apply a connectivity result and return the resulting status.
    ///
    /// Success resets the failure counter and activates the entry. A failed
    /// first probe moves `pending` to `error`; an `active` entry moves to
    /// `error` only after `max_consecutive_failures` failures in a row.
    /// Quarantined entries are left alone.
    pub async fn record_probe_outcome(
        &self,
        api_id: &str,
        success: bool,
        message: Option<String>,
    ) -> Result<EntryStatus> {
        let status = self
            .mutate(|manifest, _| {
                let max_failures = manifest.global_settings.max_consecutive_failures.max(1);
                let entry = live_entry_mut(manifest, api_id)?;
                if entry.status() == EntryStatus::Quarantined {
                    return Ok(EntryStatus::Quarantined);
                }
                let tested_at = now();
                entry.metadata.last_tested = Some(tested_at);
                entry.metadata.updated_at = tested_at;

                if success {
                    entry.metadata.consecutive_failures = 0;
                    entry.metadata.status = EntryStatus::Active;
                    entry.metadata.status_reason = None;
                } else {
                    entry.metadata.consecutive_failures =
                        entry.metadata.consecutive_failures.saturating_add(1);
                    let next = match entry.metadata.status {
                        EntryStatus::Active
                            if entry.metadata.consecutive_failures < max_failures =>
                        {
                            EntryStatus::Active
                        }
                        _ => EntryStatus::Error,
                    };
                    entry.metadata.status = next;
                    entry.metadata.status_reason = message;
                }
                Ok(entry.metadata.status)
            })
            .await?;

        debug!(api_id, success, status = %status, "Recorded connectivity outcome");
        Ok(status)
    }

    /// Move an entry to `quarantined`, keeping its data for investigation.
    pub async fn quarantine(&self, api_id: &str, reason: &str) -> Result<()> {
        let changed = self
            .mutate(|manifest, _| {
                let entry = live_entry_mut(manifest, api_id)?;
                Ok(transition(
                    entry,
                    EntryStatus::Quarantined,
                    Some(reason.to_string()),
                ))
            })
            .await?;
        if changed {
            warn!(api_id, reason, "Entry quarantined");
        }
        Ok(())
    }

    /// Quarantine each failed entry whose current record still fails verification.
    ///
    /// Failures come from a lock-free read; an entry replaced since then (by
    /// re-registration, import or restore) is left alone. Returns the ids that
    /// were quarantined.
    pub(crate) async fn quarantine_failing(
        &self,
        failures: &[(String, String)],
    ) -> Result<Vec<String>> {
        self.mutate(|manifest, key| {
            let verifier = IntegrityVerifier::new(key);
            let mut quarantined = Vec::new();
            for (api_id, reason) in failures {
                let Some(entry) = manifest.apis.get_mut(api_id).filter(|e| !e.is_removed())
                else {
                    continue;
                };
                if entry.status() == EntryStatus::Quarantined
                    || verifier
                        .verify(api_id, &entry.encrypted_credentials, &entry.integrity_hash)
                        .is_ok()
                {
                    continue;
                }
                if transition(entry, EntryStatus::Quarantined, Some(reason.clone())) {
                    quarantined.push(api_id.clone());
                }
            }
            Ok(quarantined)
        })
        .await
    }

    /// Mark `api_id` as `error` unless its record changed since `failed_hash` was read.
    pub(crate) async fn mark_error_if_unchanged(
        &self,
        api_id: &str,
        failed_hash: &str,
        reason: &str,
    ) -> Result<bool> {
        self.mutate(|manifest, _| {
            let Some(entry) = manifest.apis.get_mut(api_id).filter(|e| !e.is_removed()) else {
                return Ok(false);
            };
            if entry.integrity_hash != failed_hash {
                return Ok(false);
            }
            Ok(transition(entry, EntryStatus::Error, Some(reason.to_string())))
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Re-encrypt every entry under a key derived from `new_passphrase`.
    ///
    /// All-or-nothing: entries are verified and re-encrypted into a staged
    /// manifest, which is committed in one rename. Any failure leaves the live
    /// manifest and the session key untouched.
    pub async fn rotate_key(&self, new_passphrase: &str) -> Result<()> {
        let old_key = self.session_key().await?;
        if self.require_strong_passphrase {
            strength_check(new_passphrase)?;
        }
        let salt = crypto::generate_salt();
        let new_key = crypto::derive_key(new_passphrase, &salt, self.kdf_iterations)?;
        let key_check = IntegrityVerifier::new(&new_key).key_check()?;

        let lock = self.lock_for_write().await?;
        let manifest = self.read_manifest().await?;
        check_session(&old_key, &manifest)?;

        let old_verifier = IntegrityVerifier::new(&old_key);
        let mut ids: Vec<&String> = manifest
            .apis
            .iter()
            .filter(|(_, e)| !e.is_removed())
            .map(|(id, _)| id)
            .collect();
        ids.sort();

        let mut records = Vec::with_capacity(ids.len());
        for id in &ids {
            let entry = &manifest.apis[*id];
            old_verifier.verify(id, &entry.encrypted_credentials, &entry.integrity_hash)?;
            records.push(entry.encrypted_credentials.clone());
        }
        let rotated = crypto::rotate_key(&old_key, &new_key, &records)?;

        let new_verifier = IntegrityVerifier::new(&new_key);
        let mut staged = StoreManifest {
            version: manifest.version,
            encryption: EncryptionParams {
                algorithm: ALGORITHM_AES_256_GCM.to_string(),
                key_derivation: KDF_PBKDF2_SHA256.to_string(),
                salt,
                iterations: self.kdf_iterations,
                key_check,
            },
            apis: HashMap::with_capacity(ids.len()),
            global_settings: manifest.global_settings.clone(),
        };
        for (id, record) in ids.iter().zip(rotated) {
            let mut entry = manifest.apis[*id].clone();
            entry.integrity_hash = new_verifier.seal(id, &record)?;
            entry.encrypted_credentials = record;
            staged.apis.insert((*id).clone(), entry);
        }

        if let Err(e) = self.commit(&staged, &lock).await {
            error!("Key rotation aborted before commit: {}", e);
            return Err(e);
        }
        *self.session.write().await = Some(Arc::new(new_key));
        info!(entries = staged.apis.len(), "Rotated master key");
        Ok(())
    }

    /// Verify every entry, quarantine failures and check file permissions.
    pub async fn verify_all(&self) -> Result<HealthReport> {
        let key = self.session_key().await?;
        let manifest = self.read_manifest().await?;
        check_session(&key, &manifest)?;

        let failures = IntegrityVerifier::new(&key).sweep(&manifest);
        let mut already_quarantined: Vec<String> = manifest
            .apis
            .iter()
            .filter(|(_, e)| e.status() == EntryStatus::Quarantined)
            .map(|(id, _)| id.clone())
            .collect();
        already_quarantined.sort();
        let checked = manifest
            .apis
            .values()
            .filter(|e| !matches!(e.status(), EntryStatus::Removed | EntryStatus::Quarantined))
            .count();

        let newly_quarantined = if failures.is_empty() {
            Vec::new()
        } else {
            self.quarantine_failing(&failures).await?
        };
        for id in &newly_quarantined {
            warn!(api_id = %id, "Entry quarantined by integrity sweep");
        }

        let permission_warnings = permissions::permission_problems([
            self.vault_dir.as_path(),
            self.manifest_path.as_path(),
            self.backup_dir.as_path(),
        ]);
        for warning in &permission_warnings {
            warn!("{}", warning);
        }

        let backup_count = std::fs::read_dir(&self.backup_dir)
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .count()
            })
            .unwrap_or(0);

        let report = HealthReport {
            checked,
            newly_quarantined,
            already_quarantined,
            permission_warnings,
            backup_count,
        };
        info!(
            checked = report.checked,
            quarantined = report.newly_quarantined.len(),
            "Integrity sweep finished"
        );
        Ok(report)
    }

    pub async fn storage_info(&self) -> Result<StorageInfo> {
        let bytes = self.read_manifest_bytes().await?;
        let manifest = StoreManifest::parse(&bytes)?;
        let mut by_status = BTreeMap::new();
        for entry in manifest.apis.values() {
            *by_status.entry(entry.status().to_string()).or_insert(0) += 1;
        }
        Ok(StorageInfo {
            manifest_path: self.manifest_path.clone(),
            manifest_bytes: bytes.len() as u64,
            version: manifest.version,
            algorithm: manifest.encryption.algorithm,
            key_derivation: manifest.encryption.key_derivation,
            iterations: manifest.encryption.iterations,
            total_entries: manifest.apis.len(),
            by_status,
        })
    }
}
