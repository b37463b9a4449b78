//! API registration lifecycle.
//!
//! `RegistrationManager` is the only component callers talk to. It validates
//! credentials against the provider catalog before anything is encrypted,
//! stores new entries as `pending`, and promotes them through connectivity
//! checks that run with no store lock held.

mod transfer;

pub use transfer::{ExportOptions, ExportSummary, ImportReport, Overwrite};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::providers::{mask_value, ProviderCatalog, ProviderDescriptor};
use crate::secrets::{
    CredentialStore, Credentials, EntryStatus, EntrySummary, FieldIssue, Result, VaultError,
};

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one connectivity check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub message: Option<String>,
}

impl ProbeOutcome {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms: Some(latency_ms),
            status_code: None,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms: None,
            status_code: None,
            message: Some(message.into()),
        }
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// Checks that a credential actually works against the provider.
///
/// Receives transient plaintext; implementations must not retain or log it.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, provider: &ProviderDescriptor, credentials: &Credentials)
        -> ProbeOutcome;
}

/// Receives connectivity outcomes. Never reads the store.
pub trait UsageMonitor: Send + Sync {
    fn record(&self, api_id: &str, provider: &str, outcome: &ProbeOutcome);
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Explicit id; generated as `<provider>_<YYYYmmdd_HHMMSS>_<8 hex>` when absent
    pub api_id: Option<String>,
    /// Merged over the provider's default configuration
    pub configuration: serde_json::Map<String, serde_json::Value>,
    /// Replace an existing live entry with the same id
    pub overwrite: bool,
    /// Skip the connectivity check; the entry stays `pending`
    pub skip_test: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResult {
    pub api_id: String,
    pub provider: String,
    pub status: EntryStatus,
    pub warnings: Vec<FieldIssue>,
    pub probe: Option<ProbeOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub api_id: String,
    pub status: EntryStatus,
    pub outcome: ProbeOutcome,
}

/// Metadata plus a masked preview of each credential field.
#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    #[serde(flatten)]
    pub summary: EntrySummary,
    pub provider_display_name: Option<String>,
    pub configuration: serde_json::Map<String, serde_json::Value>,
    pub status_reason: Option<String>,
    /// `None` when the secret could not be read (locked or quarantined)
    pub masked_credentials: Option<BTreeMap<String, String>>,
}

// About 100 years; keeps chrono::Duration in range.
const MAX_INTERVAL_SECS: u64 = 100 * 365 * 24 * 3600;

/// `<provider>_<YYYYmmdd_HHMMSS>_<8 hex>`
pub fn generate_api_id(provider: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        provider,
        Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

pub struct RegistrationManager {
    store: Arc<CredentialStore>,
    catalog: Arc<ProviderCatalog>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    monitor: Option<Arc<dyn UsageMonitor>>,
}

impl RegistrationManager {
    pub fn new(store: Arc<CredentialStore>, catalog: Arc<ProviderCatalog>) -> Self {
        Self {
            store,
            catalog,
            probe: None,
            monitor: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn UsageMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    fn validate(&self, provider: &str, credentials: &Credentials) -> Result<Vec<FieldIssue>> {
        let descriptor = self.catalog.require(provider)?;
        let warnings = descriptor.validate(credentials).into_result()?;
        for warning in &warnings {
            warn!(provider, field = %warning.field, "{}", warning.message);
        }
        Ok(warnings)
    }

    /// Register credentials under a generated id.
    pub async fn register(
        &self,
        provider: &str,
        credentials: &Credentials,
    ) -> Result<RegistrationResult> {
        self.register_with(provider, credentials, RegisterOptions::default())
            .await
    }

    /// Register under an explicit id, e.g. to re-register a quarantined entry.
    pub async fn register_as(
        &self,
        api_id: &str,
        provider: &str,
        credentials: &Credentials,
        overwrite: bool,
    ) -> Result<RegistrationResult> {
        let options = RegisterOptions {
            api_id: Some(api_id.to_string()),
            overwrite,
            ..RegisterOptions::default()
        };
        self.register_with(provider, credentials, options).await
    }

    pub async fn register_with(
        &self,
        provider: &str,
        credentials: &Credentials,
        options: RegisterOptions,
    ) -> Result<RegistrationResult> {
        let warnings = self.validate(provider, credentials)?;
        let descriptor = self.catalog.require(provider)?;

        let api_id = options
            .api_id
            .unwrap_or_else(|| generate_api_id(provider));
        let mut configuration = descriptor.default_configuration();
        configuration.extend(options.configuration);
        let auto_test = configuration
            .get("auto_test")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        self.store
            .store(&api_id, provider, credentials, configuration, options.overwrite)
            .await?;
        info!(api_id = %api_id, provider, "Registered API credentials");

        let mut status = EntryStatus::Pending;
        let mut probe = None;
        if auto_test && !options.skip_test {
            if let Some(outcome) = self.run_probe(&api_id, descriptor, credentials).await {
                status = self
                    .store
                    .record_probe_outcome(&api_id, outcome.success, outcome.message.clone())
                    .await?;
                probe = Some(outcome);
            }
        }

        Ok(RegistrationResult {
            api_id,
            provider: provider.to_string(),
            status,
            warnings,
            probe,
        })
    }

    /// Probe without holding any store lock. `None` when no probe is configured.
    async fn run_probe(
        &self,
        api_id: &str,
        descriptor: &ProviderDescriptor,
        credentials: &Credentials,
    ) -> Option<ProbeOutcome> {
        let probe = self.probe.as_ref()?;
        let started = Instant::now();
        let mut outcome = probe.probe(descriptor, credentials).await;
        if outcome.latency_ms.is_none() {
            outcome.latency_ms = Some(started.elapsed().as_millis() as u64);
        }
        debug!(
            api_id,
            provider = %descriptor.name,
            success = outcome.success,
            latency_ms = outcome.latency_ms,
            "Connectivity check finished"
        );
        if let Some(monitor) = &self.monitor {
            monitor.record(api_id, &descriptor.name, &outcome);
        }
        Some(outcome)
    }

    /// Replace an entry's credentials; the entry is re-validated and re-tested.
    pub async fn update(
        &self,
        api_id: &str,
        credentials: &Credentials,
    ) -> Result<RegistrationResult> {
        let entry = self.store.get_entry(api_id).await?;
        let warnings = self.validate(&entry.provider, credentials)?;
        let descriptor = self.catalog.require(&entry.provider)?;

        self.store.update(api_id, credentials).await?;

        let mut status = EntryStatus::Pending;
        let mut probe = None;
        if let Some(outcome) = self.run_probe(api_id, descriptor, credentials).await {
            status = self
                .store
                .record_probe_outcome(api_id, outcome.success, outcome.message.clone())
                .await?;
            probe = Some(outcome);
        }

        Ok(RegistrationResult {
            api_id: api_id.to_string(),
            provider: entry.provider,
            status,
            warnings,
            probe,
        })
    }

    /// Merge `overrides` into the entry's configuration.
    pub async fn update_configuration(
        &self,
        api_id: &str,
        overrides: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let mut configuration = self.store.get_entry(api_id).await?.configuration;
        configuration.extend(overrides);
        self.store.update_configuration(api_id, configuration).await
    }

    pub async fn remove(&self, api_id: &str) -> Result<()> {
        self.store.delete(api_id).await
    }

    pub async fn list(&self) -> Result<Vec<EntrySummary>> {
        self.store.list().await
    }

    pub async fn show(&self, api_id: &str) -> Result<EntryView> {
        let entry = self.store.get_entry(api_id).await?;
        let masked_credentials = if entry.status() == EntryStatus::Quarantined {
            None
        } else {
            match self.store.retrieve(api_id).await {
                Ok(credentials) => Some(
                    credentials
                        .iter()
                        .map(|(field, value)| (field.to_string(), mask_value(value)))
                        .collect(),
                ),
                Err(
                    VaultError::Locked
                    | VaultError::Integrity { .. }
                    | VaultError::Decryption(_),
                ) => None,
                Err(e) => return Err(e),
            }
        };
        // Re-read: a failed integrity check above changes the status.
        let entry = self.store.get_entry(api_id).await?;

        Ok(EntryView {
            summary: EntrySummary::from_entry(api_id, &entry),
            provider_display_name: self
                .catalog
                .get(&entry.provider)
                .map(|d| d.display_name.clone()),
            configuration: entry.configuration,
            status_reason: entry.metadata.status_reason,
            masked_credentials,
        })
    }

    /// Retrieve (integrity-checked) and probe one entry.
    pub async fn test_connection(&self, api_id: &str) -> Result<ConnectionTest> {
        if self.probe.is_none() {
            return Err(VaultError::validation(
                "No connectivity probe is configured",
            ));
        }
        let entry = self.store.get_entry(api_id).await?;
        let descriptor = self.catalog.require(&entry.provider)?;
        let credentials = self.store.retrieve(api_id).await?;

        let outcome = self
            .run_probe(api_id, descriptor, &credentials)
            .await
            .ok_or_else(|| VaultError::validation("No connectivity probe is configured"))?;
        drop(credentials);

        let status = self
            .store
            .record_probe_outcome(api_id, outcome.success, outcome.message.clone())
            .await?;
        Ok(ConnectionTest {
            api_id: api_id.to_string(),
            status,
            outcome,
        })
    }

    /// Probe every entry that is due (or all with `force`), concurrently.
    ///
    /// Quarantined entries are never probed.
    pub async fn test_all(&self, force: bool) -> Result<Vec<(String, Result<ConnectionTest>)>> {
        let settings = self.store.global_settings().await?;
        let interval = chrono::Duration::seconds(
            settings.auto_test_interval_secs.min(MAX_INTERVAL_SECS) as i64,
        );
        let now = Utc::now();

        let mut due = Vec::new();
        for summary in self.store.list().await? {
            if summary.status == EntryStatus::Quarantined {
                continue;
            }
            let entry = match self.store.get_entry(&summary.api_id).await {
                Ok(entry) => entry,
                Err(VaultError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if force || entry.needs_testing(interval, now) {
                due.push(summary.api_id);
            }
        }

        let results =
            futures::future::join_all(due.iter().map(|id| self.test_connection(id))).await;
        let results: Vec<_> = due.into_iter().zip(results).collect();
        info!(
            tested = results.len(),
            failed = results
                .iter()
                .filter(|(_, r)| !matches!(r, Ok(t) if t.outcome.success))
                .count(),
            "Connectivity sweep finished"
        );
        Ok(results)
    }
}
