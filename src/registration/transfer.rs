//! Portable export and import of registrations.
//!
//! Sensitive exports are re-encrypted under a key derived from a separate
//! passphrase, so an export file never shares key material with the vault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::RegistrationManager;
use crate::secrets::{
    self, replace_private_file, validate_api_id, CredentialEntry, Credentials, EncryptedRecord,
    EncryptionParams, EntryMetadata, EntryStatus, IntegrityVerifier, Result, VaultError,
    ALGORITHM_AES_256_GCM, KDF_PBKDF2_SHA256,
};

const EXPORT_FORMAT: &str = "credential-vault-export";
const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Entries to export; all live entries when `None`
    pub api_ids: Option<BTreeSet<String>>,
    /// Include re-encrypted credentials (requires an export passphrase)
    pub include_sensitive: bool,
}

/// Which colliding ids an import may replace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Overwrite {
    #[default]
    None,
    Ids(HashSet<String>),
    All,
}

impl Overwrite {
    pub fn allows(&self, api_id: &str) -> bool {
        match self {
            Overwrite::None => false,
            Overwrite::Ids(ids) => ids.contains(api_id),
            Overwrite::All => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub include_sensitive: bool,
    pub exported: Vec<String>,
    /// `(api_id, reason)` for entries that could not be read
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    /// `(api_id, reason)`
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportFile {
    format: String,
    version: u32,
    exported_at: DateTime<Utc>,
    include_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption: Option<EncryptionParams>,
    entries: BTreeMap<String, ExportedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportedEntry {
    provider: String,
    #[serde(default)]
    configuration: serde_json::Map<String, serde_json::Value>,
    status: EntryStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    last_tested: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encrypted_credentials: Option<EncryptedRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    integrity_hash: Option<String>,
}

impl ExportedEntry {
    fn metadata_only(entry: &CredentialEntry) -> Self {
        Self {
            provider: entry.provider.clone(),
            configuration: entry.configuration.clone(),
            status: entry.metadata.status,
            created_at: entry.metadata.created_at,
            updated_at: entry.metadata.updated_at,
            last_tested: entry.metadata.last_tested,
            encrypted_credentials: None,
            integrity_hash: None,
        }
    }
}

/// A decrypted import waiting for the commit.
struct StagedImport {
    api_id: String,
    provider: String,
    configuration: serde_json::Map<String, serde_json::Value>,
    created_at: DateTime<Utc>,
    credentials: Credentials,
}

impl RegistrationManager {
    /// Write selected entries to `path` (mode 0600).
    ///
    /// Without `include_sensitive` only metadata and configuration are written.
    pub async fn export(
        &self,
        path: &Path,
        options: &ExportOptions,
        passphrase: Option<&str>,
    ) -> Result<ExportSummary> {
        let live = self.store.list().await?;
        let ids: Vec<String> = match &options.api_ids {
            None => live.into_iter().map(|s| s.api_id).collect(),
            Some(selected) => {
                if let Some(missing) = selected
                    .iter()
                    .find(|id| !live.iter().any(|s| &s.api_id == *id))
                {
                    return Err(VaultError::NotFound(missing.clone()));
                }
                selected.iter().cloned().collect()
            }
        };

        let export_key = if options.include_sensitive {
            let passphrase = passphrase.ok_or_else(|| {
                VaultError::validation("A sensitive export needs an export passphrase")
            })?;
            let iterations = self.store.session_key().await?.iterations();
            Some(secrets::derive_key(
                passphrase,
                &secrets::generate_salt(),
                iterations,
            )?)
        } else {
            None
        };

        let mut entries = BTreeMap::new();
        let mut skipped = Vec::new();
        for api_id in &ids {
            let entry = match self.store.get_entry(api_id).await {
                Ok(entry) => entry,
                Err(VaultError::NotFound(_)) => {
                    skipped.push((api_id.clone(), "deleted during export".to_string()));
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut exported = ExportedEntry::metadata_only(&entry);

            if let Some(key) = &export_key {
                let credentials = match self.store.retrieve(api_id).await {
                    Ok(credentials) => credentials,
                    Err(
                        e @ (VaultError::Integrity { .. }
                        | VaultError::Decryption(_)
                        | VaultError::NotFound(_)),
                    ) => {
                        warn!(api_id = %api_id, "Skipping unreadable entry in export");
                        skipped.push((api_id.clone(), e.to_string()));
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let record = secrets::encrypt(&credentials, key)?;
                exported.integrity_hash = Some(IntegrityVerifier::new(key).seal(api_id, &record)?);
                exported.encrypted_credentials = Some(record);
            }
            entries.insert(api_id.clone(), exported);
        }

        let encryption = match &export_key {
            Some(key) => Some(EncryptionParams {
                algorithm: ALGORITHM_AES_256_GCM.to_string(),
                key_derivation: KDF_PBKDF2_SHA256.to_string(),
                salt: key.salt().to_vec(),
                iterations: key.iterations(),
                key_check: IntegrityVerifier::new(key).key_check()?,
            }),
            None => None,
        };

        let exported: Vec<String> = entries.keys().cloned().collect();
        let file = ExportFile {
            format: EXPORT_FORMAT.to_string(),
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            include_sensitive: options.include_sensitive,
            encryption,
            entries,
        };
        let data = serde_json::to_vec_pretty(&file)?;
        replace_private_file(self.store.guard(), path, &data).await?;

        info!(
            path = %path.display(),
            entries = exported.len(),
            skipped = skipped.len(),
            include_sensitive = options.include_sensitive,
            "Exported registrations"
        );
        Ok(ExportSummary {
            path: path.to_path_buf(),
            include_sensitive: options.include_sensitive,
            exported,
            skipped,
        })
    }

    /// Import a sensitive export. Accepted entries land as `pending` in one commit.
    pub async fn import(
        &self,
        path: &Path,
        passphrase: &str,
        overwrite: &Overwrite,
    ) -> Result<ImportReport> {
        let bytes = tokio::fs::read(path).await?;
        let file: ExportFile = serde_json::from_slice(&bytes)?;
        if file.format != EXPORT_FORMAT {
            return Err(VaultError::Format(format!(
                "{} is not a credential export (format '{}')",
                path.display(),
                file.format
            )));
        }
        if file.version != EXPORT_VERSION {
            return Err(VaultError::Format(format!(
                "Unsupported export version {} (expected {})",
                file.version, EXPORT_VERSION
            )));
        }
        let header = match (&file.encryption, file.include_sensitive) {
            (Some(header), true) => header,
            _ => {
                return Err(VaultError::validation(
                    "Export holds no credentials; re-export with sensitive data included",
                ))
            }
        };
        if header.algorithm != ALGORITHM_AES_256_GCM || header.key_derivation != KDF_PBKDF2_SHA256
        {
            return Err(VaultError::Format(format!(
                "Unsupported export encryption {} / {}",
                header.algorithm, header.key_derivation
            )));
        }

        let export_key = secrets::derive_key(passphrase, &header.salt, header.iterations)?;
        let verifier = IntegrityVerifier::new(&export_key);
        if !verifier.verify_key_check(&header.key_check) {
            return Err(VaultError::Decryption(
                "Export passphrase is incorrect".to_string(),
            ));
        }
        // Fail before decrypting anything if the vault is locked.
        self.store.session_key().await?;

        let mut report = ImportReport::default();
        let mut staged = Vec::new();
        for (api_id, exported) in file.entries {
            match stage_entry(&verifier, &export_key, &self.catalog, &api_id, exported) {
                Ok(entry) => staged.push(entry),
                Err(reason) => {
                    warn!(api_id = %api_id, "Skipping entry in import");
                    report.skipped.push((api_id, reason));
                }
            }
        }

        let (imported, collisions) = self
            .store
            .mutate(|manifest, key| {
                let session = IntegrityVerifier::new(key);
                let mut imported = Vec::new();
                let mut collisions = Vec::new();
                let now = Utc::now();
                for item in &staged {
                    if manifest.live(&item.api_id).is_some() && !overwrite.allows(&item.api_id) {
                        collisions.push(item.api_id.clone());
                        continue;
                    }
                    let record = secrets::encrypt(&item.credentials, key)?;
                    let integrity_hash = session.seal(&item.api_id, &record)?;
                    let mut metadata = EntryMetadata::new(now);
                    metadata.created_at = item.created_at;
                    manifest.apis.insert(
                        item.api_id.clone(),
                        CredentialEntry {
                            provider: item.provider.clone(),
                            encrypted_credentials: record,
                            configuration: item.configuration.clone(),
                            metadata,
                            integrity_hash,
                        },
                    );
                    imported.push(item.api_id.clone());
                }
                Ok((imported, collisions))
            })
            .await?;
        drop(staged);

        report.imported = imported;
        report.skipped.extend(
            collisions
                .into_iter()
                .map(|id| (id, "already registered; overwrite not allowed".to_string())),
        );
        report.skipped.sort();

        info!(
            path = %path.display(),
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            "Imported registrations"
        );
        Ok(report)
    }
}

/// Verify and decrypt one exported entry. Errors are skip reasons.
fn stage_entry(
    verifier: &IntegrityVerifier<'_>,
    export_key: &secrets::MasterKey,
    catalog: &crate::providers::ProviderCatalog,
    api_id: &str,
    exported: ExportedEntry,
) -> std::result::Result<StagedImport, String> {
    validate_api_id(api_id).map_err(|e| e.to_string())?;
    if catalog.get(&exported.provider).is_none() {
        return Err(format!("unknown provider '{}'", exported.provider));
    }
    let (Some(record), Some(hash)) = (&exported.encrypted_credentials, &exported.integrity_hash)
    else {
        return Err("entry carries no credentials".to_string());
    };
    verifier
        .verify(api_id, record, hash)
        .map_err(|e| e.to_string())?;
    let credentials = secrets::decrypt(record, export_key).map_err(|e| e.to_string())?;

    Ok(StagedImport {
        api_id: api_id.to_string(),
        provider: exported.provider,
        configuration: exported.configuration,
        created_at: exported.created_at,
        credentials,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::providers::{ProviderCatalog, FOOD_SAFETY_KOREA, K_HEALTH_EXERCISE};
    use crate::registration::tests::open_store;
    use crate::secrets::CredentialStore;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use std::sync::Arc;

    const FSK_KEY: &str = "ABCDEFGHIJ0123456789";
    const KH_KEY: &str = "kh-exercise_key-0001";
    const EXPORT_PASS: &str = "Export-Pass-2024!";

    async fn populated(dir: &Path) -> (Arc<CredentialStore>, RegistrationManager) {
        let store = open_store(dir).await;
        let manager = RegistrationManager::new(
            Arc::clone(&store),
            Arc::new(ProviderCatalog::builtin().unwrap()),
        );
        manager
            .register_as(
                "fsk_main",
                FOOD_SAFETY_KOREA,
                &Credentials::new().with("api_key", FSK_KEY),
                false,
            )
            .await
            .unwrap();
        manager
            .register_as(
                "kh_main",
                K_HEALTH_EXERCISE,
                &Credentials::new().with("api_key", KH_KEY),
                false,
            )
            .await
            .unwrap();
        (store, manager)
    }

    async fn fresh_manager(
        dir: &Path,
        passphrase: &str,
    ) -> (Arc<CredentialStore>, RegistrationManager) {
        let store = Arc::new(CredentialStore::open(&VaultConfig::for_tests(dir)).unwrap());
        store.unlock(passphrase).await.unwrap();
        let manager = RegistrationManager::new(
            Arc::clone(&store),
            Arc::new(ProviderCatalog::builtin().unwrap()),
        );
        (store, manager)
    }

    #[tokio::test]
    async fn test_metadata_export_has_no_secret_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = populated(dir.path()).await;
        let path = dir.path().join("export.json");

        let summary = manager
            .export(&path, &ExportOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(summary.exported, vec!["fsk_main", "kh_main"]);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains(FSK_KEY));
        assert!(!text.contains(KH_KEY));
        for id in ["fsk_main", "kh_main"] {
            let entry = store.get_entry(id).await.unwrap();
            let record = &entry.encrypted_credentials;
            assert!(!text.contains(&BASE64.encode(&record.ciphertext)));
            assert!(!text.contains(&BASE64.encode(&record.tag)));
            assert!(!text.contains(&entry.integrity_hash));
        }
        assert!(!text.contains("encrypted_credentials"));
        assert!(!text.contains("\"encryption\""));
    }

    #[tokio::test]
    async fn test_sensitive_export_imports_into_another_vault() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let (_, manager) = populated(src.path()).await;
        let path = src.path().join("export.json");

        let options = ExportOptions {
            api_ids: Some(BTreeSet::from(["fsk_main".to_string()])),
            include_sensitive: true,
        };
        manager
            .export(&path, &options, Some(EXPORT_PASS))
            .await
            .unwrap();
        assert!(!std::fs::read_to_string(&path).unwrap().contains(FSK_KEY));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        let (dst_store, dst_manager) = fresh_manager(dst.path(), "Another-Vault-77!").await;
        let report = dst_manager
            .import(&path, EXPORT_PASS, &Overwrite::None)
            .await
            .unwrap();
        assert_eq!(report.imported, vec!["fsk_main"]);
        assert!(report.skipped.is_empty());

        let credentials = dst_store.retrieve("fsk_main").await.unwrap();
        assert_eq!(credentials.get("api_key"), Some(FSK_KEY));
        let entry = dst_store.get_entry("fsk_main").await.unwrap();
        assert_eq!(entry.status(), EntryStatus::Pending);
        assert_eq!(entry.configuration["timeout"], 30);
    }

    #[tokio::test]
    async fn test_export_file_goes_through_store_guard() {
        use crate::secrets::tests_support::RecordingGuard;

        let dir = tempfile::tempdir().unwrap();
        let guard = Arc::new(RecordingGuard::default());
        let store = Arc::new(
            CredentialStore::with_guard(&VaultConfig::for_tests(dir.path()), guard.clone())
                .unwrap(),
        );
        store.unlock("Correct-Horse-42!").await.unwrap();
        let manager = RegistrationManager::new(
            Arc::clone(&store),
            Arc::new(ProviderCatalog::builtin().unwrap()),
        );
        let path = dir.path().join("export.json");
        manager
            .export(&path, &ExportOptions::default(), None)
            .await
            .unwrap();

        assert!(guard.files().iter().any(|p| {
            let name = p.file_name().unwrap().to_string_lossy().to_string();
            name.starts_with(".export.json.") && name.ends_with(".tmp")
        }));
    }

    #[tokio::test]
    async fn test_sensitive_export_requires_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let (_, manager) = populated(dir.path()).await;
        let options = ExportOptions {
            api_ids: None,
            include_sensitive: true,
        };
        let path = dir.path().join("export.json");
        assert!(matches!(
            manager.export(&path, &options, None).await,
            Err(VaultError::Validation { .. })
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_export_unknown_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (_, manager) = populated(dir.path()).await;
        let options = ExportOptions {
            api_ids: Some(BTreeSet::from(["nope".to_string()])),
            include_sensitive: false,
        };
        assert!(matches!(
            manager.export(&dir.path().join("e.json"), &options, None).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_quarantined_entry_is_left_out_of_sensitive_export() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = populated(dir.path()).await;
        store.quarantine("kh_main", "tampered").await.unwrap();
        let options = ExportOptions {
            api_ids: None,
            include_sensitive: true,
        };
        let summary = manager
            .export(&dir.path().join("export.json"), &options, Some(EXPORT_PASS))
            .await
            .unwrap();
        assert_eq!(summary.exported, vec!["fsk_main"]);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].0, "kh_main");
    }

    #[tokio::test]
    async fn test_wrong_import_passphrase_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = populated(dir.path()).await;
        let path = dir.path().join("export.json");
        let options = ExportOptions {
            api_ids: None,
            include_sensitive: true,
        };
        manager
            .export(&path, &options, Some(EXPORT_PASS))
            .await
            .unwrap();
        let before = std::fs::read(store.manifest_path()).unwrap();

        let err = manager
            .import(&path, "not-the-export-pass", &Overwrite::All)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));
        assert_eq!(std::fs::read(store.manifest_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_collisions_need_explicit_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = populated(dir.path()).await;
        let path = dir.path().join("export.json");
        let options = ExportOptions {
            api_ids: None,
            include_sensitive: true,
        };
        manager
            .export(&path, &options, Some(EXPORT_PASS))
            .await
            .unwrap();
        manager
            .update(
                "fsk_main",
                &Credentials::new().with("api_key", "ZYXWVUTSRQ9876543210"),
            )
            .await
            .unwrap();

        let report = manager.import(&path, EXPORT_PASS, &Overwrite::None).await.unwrap();
        assert!(report.imported.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(
            store.retrieve("fsk_main").await.unwrap().get("api_key"),
            Some("ZYXWVUTSRQ9876543210")
        );

        let only_fsk = Overwrite::Ids(HashSet::from(["fsk_main".to_string()]));
        let report = manager.import(&path, EXPORT_PASS, &only_fsk).await.unwrap();
        assert_eq!(report.imported, vec!["fsk_main"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "kh_main");
        assert_eq!(
            store.retrieve("fsk_main").await.unwrap().get("api_key"),
            Some(FSK_KEY)
        );
    }

    #[tokio::test]
    async fn test_tampered_export_entry_is_skipped() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let (_, manager) = populated(src.path()).await;
        let path = src.path().join("export.json");
        let options = ExportOptions {
            api_ids: None,
            include_sensitive: true,
        };
        manager
            .export(&path, &options, Some(EXPORT_PASS))
            .await
            .unwrap();

        let mut json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let ciphertext = json["entries"]["kh_main"]["encrypted_credentials"]["ciphertext"]
            .as_str()
            .unwrap()
            .to_string();
        let mut bytes = BASE64.decode(ciphertext).unwrap();
        bytes[0] ^= 0x01;
        json["entries"]["kh_main"]["encrypted_credentials"]["ciphertext"] =
            serde_json::Value::String(BASE64.encode(&bytes));
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let (dst_store, dst_manager) = fresh_manager(dst.path(), "Another-Vault-77!").await;
        let report = dst_manager
            .import(&path, EXPORT_PASS, &Overwrite::None)
            .await
            .unwrap();
        assert_eq!(report.imported, vec!["fsk_main"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "kh_main");
        assert!(matches!(
            dst_store.get_entry("kh_main").await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_import_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let (_, manager) = populated(dir.path()).await;

        let metadata_only = dir.path().join("meta.json");
        manager
            .export(&metadata_only, &ExportOptions::default(), None)
            .await
            .unwrap();
        assert!(matches!(
            manager.import(&metadata_only, EXPORT_PASS, &Overwrite::None).await,
            Err(VaultError::Validation { .. })
        ));

        let mut json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&metadata_only).unwrap()).unwrap();
        json["version"] = serde_json::json!(99);
        let future = dir.path().join("future.json");
        std::fs::write(&future, serde_json::to_vec(&json).unwrap()).unwrap();
        assert!(matches!(
            manager.import(&future, EXPORT_PASS, &Overwrite::None).await,
            Err(VaultError::Format(_))
        ));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, b"not json").unwrap();
        assert!(matches!(
            manager.import(&garbage, EXPORT_PASS, &Overwrite::None).await,
            Err(VaultError::Format(_))
        ));
    }
}
