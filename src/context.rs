//! Per-process vault context.
//!
//! Built once at startup and handed to whatever needs the vault. There is no
//! global credential manager.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, VaultConfig};
use crate::providers::{CatalogError, ProviderCatalog};
use crate::registration::{ConnectivityProbe, RegistrationManager, UsageMonitor};
use crate::secrets::{BackupManager, CredentialStore, VaultError};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

pub struct VaultContext {
    pub config: VaultConfig,
    pub store: Arc<CredentialStore>,
    pub catalog: Arc<ProviderCatalog>,
    pub registrations: RegistrationManager,
    pub backups: BackupManager,
}

impl VaultContext {
    /// Open the vault described by `config`. Does not unlock it.
    pub fn open(config: VaultConfig) -> Result<Self, ContextError> {
        Self::open_with(config, None, None)
    }

    pub fn open_with(
        config: VaultConfig,
        probe: Option<Arc<dyn ConnectivityProbe>>,
        monitor: Option<Arc<dyn UsageMonitor>>,
    ) -> Result<Self, ContextError> {
        let catalog = match &config.provider_catalog_path {
            Some(path) => ProviderCatalog::from_path(path)?,
            None => ProviderCatalog::builtin()?,
        };
        let catalog = Arc::new(catalog);
        info!(providers = catalog.len(), "Loaded provider catalog");

        let store = Arc::new(CredentialStore::open(&config)?);

        let mut registrations = RegistrationManager::new(Arc::clone(&store), Arc::clone(&catalog));
        if let Some(probe) = probe {
            registrations = registrations.with_probe(probe);
        }
        if let Some(monitor) = monitor {
            registrations = registrations.with_monitor(monitor);
        }

        let backups = BackupManager::new(
            Arc::clone(&store),
            config.backup_dir(),
            config.backup_retention,
        );

        Ok(Self {
            config,
            store,
            catalog,
            registrations,
            backups,
        })
    }

    /// Unlock with the configured passphrase.
    pub async fn unlock_from_config(&self) -> Result<(), ContextError> {
        let passphrase = self.config.require_passphrase()?;
        self.store.unlock(passphrase).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FOOD_SAFETY_KOREA;
    use crate::secrets::{Credentials, EntryStatus};

    #[tokio::test]
    async fn test_context_wires_components() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VaultConfig::for_tests(dir.path().join("vault"));
        config.master_passphrase = Some("Correct-Horse-42!".to_string());

        let ctx = VaultContext::open(config).unwrap();
        assert!(!ctx.store.is_unlocked().await);
        ctx.unlock_from_config().await.unwrap();

        let result = ctx
            .registrations
            .register(
                FOOD_SAFETY_KOREA,
                &Credentials::new().with("api_key", "ABCDEFGHIJ0123456789"),
            )
            .await
            .unwrap();
        assert_eq!(result.status, EntryStatus::Pending);

        let info = ctx.backups.backup().await.unwrap();
        assert!(info.path.starts_with(dir.path().join("vault").join("backups")));
    }

    #[tokio::test]
    async fn test_missing_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = VaultContext::open(VaultConfig::for_tests(dir.path())).unwrap();
        assert!(matches!(
            ctx.unlock_from_config().await,
            Err(ContextError::Config(ConfigError::MissingEnvVar(_)))
        ));
    }

    #[test]
    fn test_bad_catalog_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VaultConfig::for_tests(dir.path());
        config.provider_catalog_path = Some(dir.path().join("missing.json"));
        assert!(matches!(
            VaultContext::open(config),
            Err(ContextError::Catalog(CatalogError::Io { .. }))
        ));
    }
}
