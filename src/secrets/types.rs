//! Data model for the persisted manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use zeroize::Zeroize;

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Algorithm identifier written into every record.
pub const ALGORITHM_AES_256_GCM: &str = "AES-256-GCM";

/// Key derivation identifier written into the encryption block.
pub const KDF_PBKDF2_SHA256: &str = "PBKDF2-HMAC-SHA256";

// ─────────────────────────────────────────────────────────────────────────────
// Plaintext credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Plaintext credential fields (e.g. `api_key`, `client_secret`).
///
/// Values are zeroed when dropped and never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        if let Some(mut old) = self.0.insert(field.into(), value.into()) {
            old.zeroize();
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.0)
    }

    pub(crate) fn from_json_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes).map(Self)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut creds = Credentials::new();
        for (k, v) in iter {
            creds.insert(k, v);
        }
        creds
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encrypted record
// ─────────────────────────────────────────────────────────────────────────────

/// Output of one authenticated encryption. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub algorithm: String,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

impl EncryptedRecord {
    /// Same-length record with every secret-bearing byte zeroed.
    pub(crate) fn scrubbed(&self) -> Self {
        Self {
            algorithm: self.algorithm.clone(),
            nonce: vec![0u8; self.nonce.len()],
            ciphertext: vec![0u8; self.ciphertext.len()],
            tag: vec![0u8; self.tag.len()],
        }
    }
}

/// Serde helpers for base64 byte fields.
pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a registered credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Active,
    Error,
    Quarantined,
    Removed,
}

impl EntryStatus {
    /// Transitions reachable through normal operation.
    ///
    /// `Quarantined -> Active` is deliberately absent: it happens only by
    /// replacing the entry (restore or re-registration), never by transition.
    pub fn can_transition_to(self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        match (self, next) {
            (Removed, _) => false,
            (_, Removed) => true,
            (a, b) if a == b => true,
            (Pending, Active) | (Pending, Error) => true,
            (Active, Error) | (Error, Active) => true,
            (Pending | Active | Error, Quarantined) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Active => "active",
            EntryStatus::Error => "error",
            EntryStatus::Quarantined => "quarantined",
            EntryStatus::Removed => "removed",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_tested: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    /// Consecutive failed connectivity checks since the last success.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Why the entry was quarantined or errored, for operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

impl EntryMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            last_tested: None,
            status: EntryStatus::Pending,
            consecutive_failures: 0,
            status_reason: None,
        }
    }
}

/// One registered credential as persisted in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub provider: String,
    pub encrypted_credentials: EncryptedRecord,
    #[serde(default)]
    pub configuration: serde_json::Map<String, serde_json::Value>,
    pub metadata: EntryMetadata,
    /// Keyed hash over `api_id` and the encrypted record.
    pub integrity_hash: String,
}

impl CredentialEntry {
    pub fn status(&self) -> EntryStatus {
        self.metadata.status
    }

    pub fn is_removed(&self) -> bool {
        self.metadata.status == EntryStatus::Removed
    }

    /// Whether a connectivity check is due.
    pub fn needs_testing(&self, interval: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.metadata.last_tested {
            None => true,
            Some(last) => now - last > interval,
        }
    }
}

/// Metadata view returned by `list`; never carries ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySummary {
    pub api_id: String,
    pub provider: String,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_tested: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl EntrySummary {
    pub fn from_entry(api_id: &str, entry: &CredentialEntry) -> Self {
        Self {
            api_id: api_id.to_string(),
            provider: entry.provider.clone(),
            status: entry.metadata.status,
            created_at: entry.metadata.created_at,
            updated_at: entry.metadata.updated_at,
            last_tested: entry.metadata.last_tested,
            consecutive_failures: entry.metadata.consecutive_failures,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manifest
// ─────────────────────────────────────────────────────────────────────────────

/// Key-derivation parameters. Contains no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub algorithm: String,
    pub key_derivation: String,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    pub iterations: u32,
    /// Keyed check value used to reject a wrong passphrase at unlock.
    pub key_check: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_auto_test_interval")]
    pub auto_test_interval_secs: u64,
}

fn default_backup_retention() -> usize {
    10
}

fn default_max_failures() -> u32 {
    3
}

fn default_auto_test_interval() -> u64 {
    3600
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            backup_retention: default_backup_retention(),
            max_consecutive_failures: default_max_failures(),
            auto_test_interval_secs: default_auto_test_interval(),
        }
    }
}

/// The unit of atomic persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub version: u32,
    pub encryption: EncryptionParams,
    #[serde(default)]
    pub apis: HashMap<String, CredentialEntry>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

impl StoreManifest {
    pub fn new(encryption: EncryptionParams, global_settings: GlobalSettings) -> Self {
        Self {
            version: MANIFEST_VERSION,
            encryption,
            apis: HashMap::new(),
            global_settings,
        }
    }

    pub fn parse(bytes: &[u8]) -> crate::secrets::Result<Self> {
        let manifest: StoreManifest = serde_json::from_slice(bytes)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(crate::secrets::VaultError::Format(format!(
                "Unsupported manifest version {} (expected {})",
                manifest.version, MANIFEST_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Live (non-tombstoned) entry by id.
    pub fn live(&self, api_id: &str) -> Option<&CredentialEntry> {
        self.apis.get(api_id).filter(|e| !e.is_removed())
    }

    pub fn summaries(&self) -> Vec<EntrySummary> {
        let mut out: Vec<EntrySummary> = self
            .apis
            .iter()
            .map(|(id, entry)| EntrySummary::from_entry(id, entry))
            .collect();
        out.sort_by(|a, b| a.api_id.cmp(&b.api_id));
        out
    }
}
