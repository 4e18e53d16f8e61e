//! Symmetric encryption of stored data source secrets.
//!
//! AES-256-GCM with a fresh 96-bit nonce per call. The stored form is
//! `base64(nonce || ciphertext || tag)`; the empty string stands for "no
//! secret" and bypasses the cipher in both directions.

use std::fmt;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    KeyInvalid(usize),
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
    #[error("ciphertext failed authentication")]
    AuthenticationFailed,
    #[error("encryption failed")]
    Cipher,
}

/// Process-wide secret box for data source passwords.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::KeyInvalid(key.len()))?;
        Ok(Self { cipher })
    }

    /// Builds a vault from a configuration value holding either base64 of 32
    /// bytes or a raw 32-character string.
    pub fn from_config_value(value: &str) -> Result<Self, VaultError> {
        let trimmed = value.trim();
        match STANDARD.decode(trimmed) {
            Ok(bytes) if bytes.len() == KEY_LEN => Self::new(&bytes),
            _ => Self::new(trimmed.as_bytes()),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Cipher)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, VaultError> {
        if stored.is_empty() {
            return Ok(String::new());
        }

        let blob = STANDARD
            .decode(stored)
            .map_err(|err| VaultError::Malformed(err.to_string()))?;
        if blob.len() < NONCE_LEN {
            return Err(VaultError::Malformed("ciphertext too short".into()));
        }

        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let opened = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::AuthenticationFailed)?;

        String::from_utf8(opened)
            .map_err(|_| VaultError::Malformed("plaintext is not UTF-8".into()))
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn roundtrip_uses_fresh_nonces() {
        let vault = vault();
        let first = vault.encrypt("s3cret").unwrap();
        let second = vault.encrypt("s3cret").unwrap();

        assert_ne!(first, "s3cret");
        assert_ne!(first, second);
        assert_eq!(vault.decrypt(&first).unwrap(), "s3cret");
        assert_eq!(vault.decrypt(&second).unwrap(), "s3cret");
    }

    #[test]
    fn empty_secret_passes_through() {
        let vault = vault();
        assert_eq!(vault.encrypt("").unwrap(), "");
        assert_eq!(vault.decrypt("").unwrap(), "");
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        assert_eq!(
            CredentialVault::new(b"short").unwrap_err(),
            VaultError::KeyInvalid(5)
        );
        assert!(CredentialVault::from_config_value("not-thirty-two-bytes").is_err());
    }

    #[test]
    fn config_value_accepts_base64_and_raw_keys() {
        let raw = "0123456789abcdef0123456789abcdef";
        let from_raw = CredentialVault::from_config_value(raw).unwrap();
        let from_b64 = CredentialVault::from_config_value(&STANDARD.encode(raw)).unwrap();

        let sealed = from_raw.encrypt("hunter2").unwrap();
        assert_eq!(from_b64.decrypt(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let vault = vault();
        let sealed = vault.encrypt("s3cret").unwrap();
        let mut blob = STANDARD.decode(&sealed).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        assert_eq!(
            vault.decrypt(&STANDARD.encode(blob)).unwrap_err(),
            VaultError::AuthenticationFailed
        );
    }

    #[test]
    fn foreign_key_cannot_open_ciphertext() {
        let sealed = vault().encrypt("s3cret").unwrap();
        let other = CredentialVault::new(&[9u8; KEY_LEN]).unwrap();
        assert_eq!(
            other.decrypt(&sealed).unwrap_err(),
            VaultError::AuthenticationFailed
        );
    }

    #[test]
    fn short_or_garbled_input_is_malformed() {
        let vault = vault();
        assert!(matches!(
            vault.decrypt(&STANDARD.encode([1u8; 4])),
            Err(VaultError::Malformed(_))
        ));
        assert!(matches!(
            vault.decrypt("%%% not base64 %%%"),
            Err(VaultError::Malformed(_))
        ));
    }
}
