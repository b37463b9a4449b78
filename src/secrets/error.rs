//! Error taxonomy for the credential vault.
//!
//! `Validation` and `Decryption` are local and recoverable: nothing is mutated
//! before they are raised. `Integrity` is never auto-recovered; the affected
//! entry is quarantined before the error reaches the caller.

use serde::Serialize;
use thiserror::Error;

/// A single field-level validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum VaultError {
    /// Malformed credentials or request, raised before any encryption.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        issues: Vec<FieldIssue>,
    },

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Authentication tag mismatch, wrong key or undecodable payload.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Stored data failed its keyed integrity check (fires before decryption).
    #[error("Integrity check failed for {api_id}: {reason}")]
    Integrity { api_id: String, reason: String },

    /// Lock acquisition timed out or a writer is stuck.
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest, backup or export file is structurally invalid.
    #[error("Invalid format: {0}")]
    Format(String),

    #[error("API registration not found: {0}")]
    NotFound(String),

    /// No unlocked session; call `unlock` first.
    #[error("Vault is locked")]
    Locked,
}

impl VaultError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            issues: Vec::new(),
        }
    }

    pub fn invalid_fields(issues: Vec<FieldIssue>) -> Self {
        Self::Validation {
            message: join_issues(&issues),
            issues,
        }
    }

    pub fn integrity(api_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            api_id: api_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller can fix the problem and retry without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VaultError::Validation { .. }
                | VaultError::Decryption(_)
                | VaultError::Concurrency(_)
                | VaultError::Locked
        )
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Format(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
