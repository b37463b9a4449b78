//! Encrypted credential storage.
//!
//! Keeps third-party API credentials encrypted at rest, detects tampering and
//! supports key rotation and backup/restore without losing or mixing data.
//!
//! ## Architecture
//!
//! ```text
//! <vault_dir>/               (0700)
//! ├── manifest.json          # Encrypted entries + KDF parameters (0600)
//! ├── manifest.lock          # Advisory cross-process writer lock
//! └── backups/               (0700)
//!     ├── manifest-20250101T120000Z.json
//!     └── pre-restore-20250102T080000Z.json
//! ```
//!
//! Writes: encrypt -> seal with integrity hash -> atomic commit.
//! Reads: integrity check -> decrypt -> transient plaintext to the caller.
//!
//! ## Usage
//!
//! ```ignore
//! let store = CredentialStore::open(&config)?;
//! store.unlock("my-master-passphrase").await?;
//!
//! store.store("fsk_main", "food_safety_korea", &creds, config, false).await?;
//! let creds = store.retrieve("fsk_main").await?;
//! ```

mod backup;
mod crypto;
mod error;
mod integrity;
mod permissions;
mod store;
pub mod types;

pub use backup::{BackupInfo, BackupKind, BackupManager, RestoreReport};
pub use crypto::{
    decrypt, derive_key, encrypt, generate_salt, passphrase_issues, rotate_key, MasterKey,
    DEFAULT_ITERATIONS,
};
pub use error::{FieldIssue, Result, VaultError};
pub use integrity::IntegrityVerifier;
pub use permissions::{permission_problems, OwnerOnly, PermissionGuard};
pub use store::{CredentialStore, HealthReport, StorageInfo};

pub(crate) use permissions::replace_private_file;
#[cfg(test)]
pub(crate) use permissions::tests as tests_support;
pub(crate) use store::validate_api_id;
pub use types::*;
