//! Key derivation and authenticated encryption for stored credentials.
//!
//! Uses PBKDF2-HMAC-SHA256 to stretch the master passphrase into two 256-bit
//! keys (one for AES-256-GCM, one for the integrity MAC) and AES-256-GCM with
//! a fresh random 96-bit nonce per record. The tag is kept detached so the
//! manifest stores nonce, ciphertext and tag as separate fields.

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::error::{Result, VaultError};
use super::types::{Credentials, EncryptedRecord, ALGORITHM_AES_256_GCM};

/// Key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

/// Nonce length in bytes (96 bits for AES-GCM)
pub const NONCE_LENGTH: usize = 12;

/// GCM authentication tag length in bytes
pub const TAG_LENGTH: usize = 16;

/// Salt length in bytes
pub const SALT_LENGTH: usize = 32;

/// PBKDF2 iteration count for newly initialised vaults.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Key material for one unlocked session.
///
/// Never serialized. Zeroed when the last reference is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    encryption_key: [u8; KEY_LENGTH],
    integrity_key: [u8; KEY_LENGTH],
    salt: Vec<u8>,
    iterations: u32,
}

impl MasterKey {
    pub(crate) fn encryption_key(&self) -> &[u8; KEY_LENGTH] {
        &self.encryption_key
    }

    pub(crate) fn integrity_key(&self) -> &[u8; KEY_LENGTH] {
        &self.integrity_key
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("salt_len", &self.salt.len())
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

/// Generate a random salt for a new vault or export.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive session key material from a passphrase.
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<MasterKey> {
    if passphrase.is_empty() {
        return Err(VaultError::KeyDerivation(
            "Passphrase must not be empty".to_string(),
        ));
    }
    if iterations == 0 {
        return Err(VaultError::KeyDerivation(
            "Iteration count must be positive".to_string(),
        ));
    }
    if salt.is_empty() {
        return Err(VaultError::KeyDerivation("Salt must not be empty".to_string()));
    }

    let mut okm = Zeroizing::new([0u8; KEY_LENGTH * 2]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, okm.as_mut());

    let mut encryption_key = [0u8; KEY_LENGTH];
    let mut integrity_key = [0u8; KEY_LENGTH];
    encryption_key.copy_from_slice(&okm[..KEY_LENGTH]);
    integrity_key.copy_from_slice(&okm[KEY_LENGTH..]);

    Ok(MasterKey {
        encryption_key,
        integrity_key,
        salt: salt.to_vec(),
        iterations,
    })
}

fn cipher_for(key: &MasterKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.encryption_key())
        .map_err(|e| VaultError::Encryption(format!("Failed to create cipher: {}", e)))
}

/// Encrypt a credential map under `key` with a fresh random nonce.
pub fn encrypt(credentials: &Credentials, key: &MasterKey) -> Result<EncryptedRecord> {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut buffer = Zeroizing::new(
        credentials
            .to_json_bytes()
            .map_err(|e| VaultError::Encryption(format!("Failed to serialize: {}", e)))?,
    );

    let cipher = cipher_for(key)?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", buffer.as_mut_slice())
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    Ok(EncryptedRecord {
        algorithm: ALGORITHM_AES_256_GCM.to_string(),
        nonce: nonce.to_vec(),
        ciphertext: buffer.to_vec(),
        tag: tag.to_vec(),
    })
}

/// Decrypt a record. Never returns partial plaintext.
pub fn decrypt(record: &EncryptedRecord, key: &MasterKey) -> Result<Credentials> {
    if record.algorithm != ALGORITHM_AES_256_GCM {
        return Err(VaultError::Decryption(format!(
            "Unsupported algorithm: {}",
            record.algorithm
        )));
    }
    if record.nonce.len() != NONCE_LENGTH {
        return Err(VaultError::Decryption(format!(
            "Nonce must be {} bytes, got {}",
            NONCE_LENGTH,
            record.nonce.len()
        )));
    }
    if record.tag.len() != TAG_LENGTH {
        return Err(VaultError::Decryption(format!(
            "Tag must be {} bytes, got {}",
            TAG_LENGTH,
            record.tag.len()
        )));
    }

    let cipher = cipher_for(key)?;
    // The buffer holds keystream-applied bytes even when the tag check fails.
    let mut buffer = Zeroizing::new(record.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&record.nonce),
            b"",
            buffer.as_mut_slice(),
            GenericArray::from_slice(&record.tag),
        )
        .map_err(|_| VaultError::Decryption("Invalid key or corrupted data".to_string()))?;

    Credentials::from_json_bytes(&buffer).map_err(|e| {
        VaultError::Decryption(format!("Decrypted payload is not a credential map: {}", e))
    })
}

/// Re-encrypt every record from `old` to `new`.
///
/// Returns the staged records in input order. On the first failure the staged
/// set is dropped and the error returned, so callers never see a mix.
pub fn rotate_key(
    old: &MasterKey,
    new: &MasterKey,
    records: &[EncryptedRecord],
) -> Result<Vec<EncryptedRecord>> {
    let mut staged = Vec::with_capacity(records.len());
    for record in records {
        let plaintext = decrypt(record, old)?;
        staged.push(encrypt(&plaintext, new)?);
    }
    Ok(staged)
}

/// Weaknesses found in a master passphrase. Empty means acceptable.
pub fn passphrase_issues(passphrase: &str) -> Vec<String> {
    const SYMBOLS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";
    let mut issues = Vec::new();
    let chars: Vec<char> = passphrase.chars().collect();

    if chars.len() < 12 {
        issues.push("must be at least 12 characters".to_string());
    }
    if !chars.iter().any(|c| c.is_lowercase()) {
        issues.push("must contain a lowercase letter".to_string());
    }
    if !chars.iter().any(|c| c.is_uppercase()) {
        issues.push("must contain an uppercase letter".to_string());
    }
    if !chars.iter().any(|c| c.is_ascii_digit()) {
        issues.push("must contain a digit".to_string());
    }
    if !chars.iter().any(|c| SYMBOLS.contains(*c)) {
        issues.push("must contain a symbol".to_string());
    }
    let sequential = chars.windows(3).any(|w| {
        w.iter().all(|c| c.is_ascii_alphanumeric())
            && (w[1] as u32) == (w[0] as u32) + 1
            && (w[2] as u32) == (w[0] as u32) + 2
    });
    if sequential {
        issues.push("avoid sequential characters".to_string());
    }
    if chars.windows(3).any(|w| w[0] == w[1] && w[1] == w[2]) {
        issues.push("avoid repeating a character three times".to_string());
    }
    issues
}
