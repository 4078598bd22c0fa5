//! Credential vault for receiver tokens at rest.
//!
//! Tokens are sealed with AES-256-GCM and stored as
//! `base64(nonce || ciphertext || tag)`. The key is the SHA-256 digest of a
//! per-installation secret that is generated on first open and kept in the
//! `settings` table.
//!
//! Setting `vault.encrypt_tokens = false` selects [`VaultMode::Passthrough`],
//! where tokens are stored unmodified. That mode is an explicit configuration
//! choice and is announced once with a warning when the vault opens.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::VaultConfig;
use crate::db::Database;
use crate::error::{Error, Result};

/// Settings key holding the hex-encoded installation secret.
pub const SECRET_SETTING: &str = "vault_secret";

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Size of a generated installation secret, before hex encoding.
const SECRET_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultMode {
    Encrypting,
    Passthrough,
}

#[derive(Clone)]
pub struct Vault {
    key: Option<[u8; 32]>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").field("mode", &self.mode()).finish()
    }
}

impl Vault {
    /// Open the vault for this installation, creating the secret on first use.
    pub fn open(db: &Database, config: &VaultConfig) -> Result<Self> {
        if !config.encrypt_tokens {
            tracing::warn!("Token encryption disabled; receiver tokens are stored unmodified");
            return Ok(Self::passthrough());
        }

        let mut candidate = [0u8; SECRET_SIZE];
        OsRng.fill_bytes(&mut candidate);
        let secret = db.setting_or_insert(SECRET_SETTING, &hex::encode(candidate))?;
        if secret.is_empty() {
            return Err(Error::Vault("stored installation secret is empty".to_string()));
        }

        Ok(Self::with_secret(&secret))
    }

    /// Build a vault keyed by `SHA-256(secret)`.
    pub fn with_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key: Some(key) }
    }

    pub fn passthrough() -> Self {
        Self { key: None }
    }

    pub fn mode(&self) -> VaultMode {
        match self.key {
            Some(_) => VaultMode::Encrypting,
            None => VaultMode::Passthrough,
        }
    }

    /// Seal a token for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_string());
        };

        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| Error::Vault(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Vault(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&sealed))
    }

    /// Open a stored token.
    ///
    /// Returns `None` for anything that does not yield a non-empty token:
    /// empty input, bad base64, truncated data, a failed tag check or
    /// non-UTF-8 plaintext. Callers treat `None` as "no credential".
    pub fn decrypt(&self, stored: &str) -> Option<String> {
        if stored.is_empty() {
            return None;
        }

        let Some(key) = &self.key else {
            return Some(stored.to_string());
        };

        let sealed = match BASE64.decode(stored) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, "Stored token is not valid base64");
                return None;
            }
        };
        if sealed.len() <= NONCE_SIZE {
            tracing::debug!(len = sealed.len(), "Stored token too short");
            return None;
        }

        let cipher = Aes256Gcm::new_from_slice(key).ok()?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = match cipher.decrypt(Nonce::from_slice(nonce), ciphertext) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                tracing::debug!("Stored token failed authentication");
                return None;
            }
        };

        String::from_utf8(plaintext).ok().filter(|t| !t.is_empty())
    }
}
