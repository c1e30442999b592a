//! Encrypted identity key storage
//!
//! The operator's identity key signs DKG packages and authenticates the
//! operator to its peers. It is encrypted at rest using AES-256-GCM with a
//! password-derived key.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::keys;

/// Key store errors
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("key error: {0}")]
    Key(#[from] keys::KeyError),
    #[error("key not found")]
    KeyNotFound,
    #[error("invalid password")]
    InvalidPassword,
}

/// Encrypted key file format
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeyFile {
    version: u8,
    /// Compressed public key (hex), readable without the password
    identity_public_key: String,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Encrypted identity key file
pub struct IdentityKeystore {
    key_path: PathBuf,
}

impl IdentityKeystore {
    pub fn new(key_path: impl AsRef<Path>) -> Self {
        Self {
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    pub fn exists(&self) -> bool {
        self.key_path.exists()
    }

    /// Derive encryption key from password using SHA-256
    fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt);
        hasher.update(b"frost-operator-identity-v1");
        hasher.finalize().into()
    }

    /// Create a fresh identity key, save it, and return its public key
    pub fn generate(&self, password: &str) -> Result<Vec<u8>, KeystoreError> {
        let secret = keys::generate_private_key();
        self.save(&secret, password)
    }

    /// Save an identity key encrypted with password, returning its public key
    pub fn save(&self, identity_key: &[u8], password: &str) -> Result<Vec<u8>, KeystoreError> {
        let public_key = keys::public_key_from_private_key(identity_key)?;

        let mut salt = [0u8; 16];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = Self::derive_key(password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, identity_key)
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;

        let encrypted = EncryptedKeyFile {
            version: 1,
            identity_public_key: hex::encode(&public_key),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        };

        let json = serde_json::to_string_pretty(&encrypted)?;
        if let Some(parent) = self.key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.key_path, json)?;

        tracing::info!(
            path = %self.key_path.display(),
            identity_public_key = %hex::encode(&public_key),
            "Saved encrypted identity key"
        );

        Ok(public_key)
    }

    /// Load the identity key decrypted with password
    pub fn load(&self, password: &str) -> Result<Vec<u8>, KeystoreError> {
        let encrypted = self.read_file()?;

        let salt = hex::decode(&encrypted.salt)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let nonce_bytes = hex::decode(&encrypted.nonce)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let ciphertext = hex::decode(&encrypted.ciphertext)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(KeystoreError::Decryption("invalid nonce length".to_string()));
        }

        let key = Self::derive_key(password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let identity_key = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| KeystoreError::InvalidPassword)?;

        let public_key = keys::public_key_from_private_key(&identity_key)?;
        if hex::encode(&public_key) != encrypted.identity_public_key {
            return Err(KeystoreError::Decryption(
                "public key does not match decrypted key".to_string(),
            ));
        }

        tracing::info!(path = %self.key_path.display(), "Loaded identity key");

        Ok(identity_key)
    }

    /// Public key from file without decryption
    pub fn public_key(&self) -> Result<String, KeystoreError> {
        Ok(self.read_file()?.identity_public_key)
    }

    fn read_file(&self) -> Result<EncryptedKeyFile, KeystoreError> {
        if !self.exists() {
            return Err(KeystoreError::KeyNotFound);
        }
        let json = std::fs::read_to_string(&self.key_path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
