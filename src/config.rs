//! Configuration management for the credential vault.
//!
//! Configuration can be set via environment variables:
//! - `VAULT_DIR` - Optional. Directory holding the manifest. Defaults to `./.credential-vault`.
//! - `VAULT_MASTER_PASSPHRASE` - Optional. Master passphrase used to unlock at startup.
//! - `VAULT_KDF_ITERATIONS` - Optional. PBKDF2 iterations for new vaults. Defaults to `100000`.
//! - `VAULT_LOCK_TIMEOUT_MS` - Optional. Writer lock acquisition timeout. Defaults to `5000`.
//! - `VAULT_BACKUP_RETENTION` - Optional. Backups kept by `prune`. Defaults to `10`.
//! - `VAULT_MAX_CONNECTIVITY_FAILURES` - Optional. Consecutive probe failures before an
//!   active entry moves to `error`. Defaults to `3`.
//! - `VAULT_AUTO_TEST_INTERVAL_SECS` - Optional. Minimum age of the last probe before
//!   `test_all` re-tests an entry. Defaults to `3600`.
//! - `VAULT_REQUIRE_STRONG_PASSPHRASE` - Optional. Refuse weak passphrases when creating a vault.
//! - `PROVIDER_CATALOG_PATH` - Optional. JSON provider catalog replacing the built-in one.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::secrets::{GlobalSettings, DEFAULT_ITERATIONS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Vault configuration.
#[derive(Clone)]
pub struct VaultConfig {
    /// Directory holding `manifest.json`, `manifest.lock` and `backups/`
    pub vault_dir: PathBuf,

    /// Master passphrase, if supplied through the environment
    pub master_passphrase: Option<String>,

    /// PBKDF2 iterations used when a new vault is initialised
    pub kdf_iterations: u32,

    /// How long a writer waits for the cross-process lock
    pub lock_timeout: Duration,

    /// Number of backups kept by retention pruning
    pub backup_retention: usize,

    /// Consecutive probe failures before an active entry is marked `error`
    pub max_consecutive_failures: u32,

    /// Probe interval used by `test_all`
    pub auto_test_interval_secs: u64,

    /// Reject weak master passphrases when initialising a vault
    pub require_strong_passphrase: bool,

    /// Optional JSON provider catalog
    pub provider_catalog_path: Option<PathBuf>,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("vault_dir", &self.vault_dir)
            .field(
                "master_passphrase",
                &self.master_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("kdf_iterations", &self.kdf_iterations)
            .field("lock_timeout", &self.lock_timeout)
            .field("backup_retention", &self.backup_retention)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .field("auto_test_interval_secs", &self.auto_test_interval_secs)
            .field("require_strong_passphrase", &self.require_strong_passphrase)
            .field("provider_catalog_path", &self.provider_catalog_path)
            .finish()
    }
}

fn parse_var<T>(name: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
    }
}

fn parse_bool(name: &str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off" | "") => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("expected a boolean, got {}", v),
        )),
    }
}

impl VaultConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric or boolean variable does not parse,
    /// or if `VAULT_KDF_ITERATIONS` is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vault_dir = lookup("VAULT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".credential-vault"));

        let master_passphrase = lookup("VAULT_MASTER_PASSPHRASE").filter(|p| !p.is_empty());

        let kdf_iterations: u32 = parse_var(
            "VAULT_KDF_ITERATIONS",
            lookup("VAULT_KDF_ITERATIONS"),
            DEFAULT_ITERATIONS,
        )?;
        if kdf_iterations == 0 {
            return Err(ConfigError::InvalidValue(
                "VAULT_KDF_ITERATIONS".to_string(),
                "must be positive".to_string(),
            ));
        }

        let lock_timeout_ms: u64 = parse_var(
            "VAULT_LOCK_TIMEOUT_MS",
            lookup("VAULT_LOCK_TIMEOUT_MS"),
            5000,
        )?;

        let defaults = GlobalSettings::default();
        let backup_retention = parse_var(
            "VAULT_BACKUP_RETENTION",
            lookup("VAULT_BACKUP_RETENTION"),
            defaults.backup_retention,
        )?;
        let max_consecutive_failures = parse_var(
            "VAULT_MAX_CONNECTIVITY_FAILURES",
            lookup("VAULT_MAX_CONNECTIVITY_FAILURES"),
            defaults.max_consecutive_failures,
        )?;
        let auto_test_interval_secs = parse_var(
            "VAULT_AUTO_TEST_INTERVAL_SECS",
            lookup("VAULT_AUTO_TEST_INTERVAL_SECS"),
            defaults.auto_test_interval_secs,
        )?;

        let require_strong_passphrase = parse_bool(
            "VAULT_REQUIRE_STRONG_PASSPHRASE",
            lookup("VAULT_REQUIRE_STRONG_PASSPHRASE"),
        )?;

        let provider_catalog_path = lookup("PROVIDER_CATALOG_PATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            vault_dir,
            master_passphrase,
            kdf_iterations,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            backup_retention,
            max_consecutive_failures,
            auto_test_interval_secs,
            require_strong_passphrase,
            provider_catalog_path,
        })
    }

    /// Create a config rooted at `vault_dir` with defaults (useful for testing).
    pub fn new(vault_dir: impl Into<PathBuf>) -> Self {
        let defaults = GlobalSettings::default();
        Self {
            vault_dir: vault_dir.into(),
            master_passphrase: None,
            kdf_iterations: DEFAULT_ITERATIONS,
            lock_timeout: Duration::from_millis(5000),
            backup_retention: defaults.backup_retention,
            max_consecutive_failures: defaults.max_consecutive_failures,
            auto_test_interval_secs: defaults.auto_test_interval_secs,
            require_strong_passphrase: false,
            provider_catalog_path: None,
        }
    }

    /// Cheap KDF and short lock timeout for unit tests.
    #[cfg(test)]
    pub(crate) fn for_tests(vault_dir: impl Into<PathBuf>) -> Self {
        Self {
            kdf_iterations: 1_000,
            lock_timeout: Duration::from_millis(500),
            ..Self::new(vault_dir)
        }
    }

    /// The master passphrase, required for unattended unlock.
    pub fn require_passphrase(&self) -> Result<&str, ConfigError> {
        self.master_passphrase
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("VAULT_MASTER_PASSPHRASE".to_string()))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.vault_dir.join("manifest.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.vault_dir.join("manifest.lock")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.vault_dir.join("backups")
    }

    /// Settings written into a freshly initialised manifest.
    pub fn global_settings(&self) -> GlobalSettings {
        GlobalSettings {
            backup_retention: self.backup_retention,
            max_consecutive_failures: self.max_consecutive_failures,
            auto_test_interval_secs: self.auto_test_interval_secs,
        }
    }
}
