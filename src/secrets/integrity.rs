//! Keyed tamper detection for stored records.
//!
//! Every entry carries an HMAC-SHA256 over its api_id and the full encrypted
//! record. The hash is checked before any decryption is attempted.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::crypto::MasterKey;
use super::error::{Result, VaultError};
use super::types::{EncryptedRecord, EntryStatus, StoreManifest};

type HmacSha256 = Hmac<Sha256>;

const KEY_CHECK_LABEL: &[u8] = b"credential-vault/key-check";

/// Computes and verifies integrity hashes under one integrity key.
pub struct IntegrityVerifier<'a> {
    key: &'a MasterKey,
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(key: &'a MasterKey) -> Self {
        Self { key }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(self.key.integrity_key())
            .map_err(|e| VaultError::Encryption(format!("Invalid integrity key: {}", e)))
    }

    fn record_mac(&self, api_id: &str, record: &EncryptedRecord) -> Result<HmacSha256> {
        let mut mac = self.mac()?;
        let parts: [&[u8]; 5] = [
            api_id.as_bytes(),
            record.algorithm.as_bytes(),
            &record.nonce,
            &record.ciphertext,
            &record.tag,
        ];
        for part in parts {
            mac.update(&(part.len() as u64).to_be_bytes());
            mac.update(part);
        }
        Ok(mac)
    }

    /// Hex-encoded hash for a record about to be written.
    pub fn seal(&self, api_id: &str, record: &EncryptedRecord) -> Result<String> {
        let mac = self.record_mac(api_id, record)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a stored hash.
    pub fn verify(&self, api_id: &str, record: &EncryptedRecord, stored: &str) -> Result<()> {
        let expected = hex::decode(stored)
            .map_err(|_| VaultError::integrity(api_id, "stored hash is not valid hex"))?;
        self.record_mac(api_id, record)?
            .verify_slice(&expected)
            .map_err(|_| VaultError::integrity(api_id, "integrity hash mismatch"))
    }

    /// Check value proving a passphrase derives this key.
    pub fn key_check(&self) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(KEY_CHECK_LABEL);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify_key_check(&self, stored: &str) -> bool {
        let Ok(expected) = hex::decode(stored) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(KEY_CHECK_LABEL);
        mac.verify_slice(&expected).is_ok()
    }

    /// Ids of entries whose hash does not verify, with the reason.
    ///
    /// Removed and already-quarantined entries are skipped.
    pub fn sweep(&self, manifest: &StoreManifest) -> Vec<(String, String)> {
        let mut failures: Vec<(String, String)> = manifest
            .apis
            .iter()
            .filter(|(_, e)| {
                !matches!(
                    e.metadata.status,
                    EntryStatus::Removed | EntryStatus::Quarantined
                )
            })
            .filter_map(|(id, e)| {
                self.verify(id, &e.encrypted_credentials, &e.integrity_hash)
                    .err()
                    .map(|err| (id.clone(), err.to_string()))
            })
            .collect();
        failures.sort();
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::crypto::{derive_key, encrypt};
    use crate::secrets::types::Credentials;

    fn key(p: &str) -> MasterKey {
        derive_key(p, b"integrity-test-salt", 1_000).unwrap()
    }

    fn record(k: &MasterKey) -> EncryptedRecord {
        encrypt(&Credentials::new().with("api_key", "abcdefgh12345678"), k).unwrap()
    }

    #[test]
    fn seal_then_verify() {
        let k = key("pass");
        let rec = record(&k);
        let verifier = IntegrityVerifier::new(&k);
        let hash = verifier.seal("api_1", &rec).unwrap();
        assert_eq!(hash.len(), 64);
        verifier.verify("api_1", &rec, &hash).unwrap();
    }

    #[test]
    fn hash_is_bound_to_api_id() {
        let k = key("pass");
        let rec = record(&k);
        let verifier = IntegrityVerifier::new(&k);
        let hash = verifier.seal("api_1", &rec).unwrap();
        let err = verifier.verify("api_2", &rec, &hash).unwrap_err();
        assert!(matches!(err, VaultError::Integrity { ref api_id, .. } if api_id == "api_2"));
    }

    #[test]
    fn any_field_change_is_detected() {
        let k = key("pass");
        let rec = record(&k);
        let verifier = IntegrityVerifier::new(&k);
        let hash = verifier.seal("a", &rec).unwrap();

        let mut t = rec.clone();
        t.ciphertext[3] ^= 1;
        assert!(verifier.verify("a", &t, &hash).is_err());

        let mut t = rec.clone();
        t.nonce[0] ^= 1;
        assert!(verifier.verify("a", &t, &hash).is_err());

        let mut t = rec.clone();
        t.tag[15] ^= 1;
        assert!(verifier.verify("a", &t, &hash).is_err());

        let mut t = rec.clone();
        t.algorithm = "AES-128-GCM".into();
        assert!(verifier.verify("a", &t, &hash).is_err());

        assert!(verifier.verify("a", &rec, "not-hex").is_err());
    }

    #[test]
    fn other_key_rejects_hash() {
        let a = key("a");
        let b = key("b");
        let rec = record(&a);
        let hash = IntegrityVerifier::new(&a).seal("x", &rec).unwrap();
        assert!(IntegrityVerifier::new(&b).verify("x", &rec, &hash).is_err());
    }

    #[test]
    fn key_check_distinguishes_passphrases() {
        let a = key("a");
        let check = IntegrityVerifier::new(&a).key_check().unwrap();
        assert!(IntegrityVerifier::new(&a).verify_key_check(&check));
        assert!(!IntegrityVerifier::new(&key("b")).verify_key_check(&check));
        assert!(!IntegrityVerifier::new(&a).verify_key_check("zz"));
    }
}
