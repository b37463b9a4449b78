//! # Credential Vault
//!
//! Encrypted storage for third-party food and exercise API credentials.
//!
//! This library provides:
//! - An AES-256-GCM encrypted manifest with per-entry integrity hashes
//! - Atomic, lock-protected writes safe across processes
//! - Verified backups, restore with rollback, and master key rotation
//! - Provider-aware registration with out-of-band connectivity checks
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │           VaultContext           │
//!        │  (one per process, passed down)  │
//!        └───────┬──────────────┬───────────┘
//!                │              │
//!                ▼              ▼
//!   ┌─────────────────────┐  ┌───────────────┐
//!   │ RegistrationManager │  │ BackupManager │
//!   └──────────┬──────────┘  └───────┬───────┘
//!              │                     │
//!              ▼                     ▼
//!        ┌──────────────────────────────────┐
//!        │         CredentialStore          │
//!        │  (manifest.json + manifest.lock) │
//!        └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//! - `secrets`: encryption, integrity, the store, and backups
//! - `providers`: provider catalog and credential validation
//! - `registration`: registration lifecycle, export and import
//! - `context`: per-process wiring
//! - `config`: environment configuration

pub mod config;
pub mod context;
pub mod providers;
pub mod registration;
pub mod secrets;

pub use config::VaultConfig;
pub use context::{ContextError, VaultContext};
pub use providers::{ProviderCatalog, ProviderDescriptor};
pub use registration::{ConnectivityProbe, ProbeOutcome, RegistrationManager, UsageMonitor};
pub use secrets::{CredentialStore, Credentials, VaultError};
