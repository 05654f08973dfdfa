//! Mailbox credential decryption
//!
//! Department passwords are stored encrypted as `enc:v1:<base64(nonce || ciphertext)>`.
//!
//! - The AES-256-GCM key is derived from an operator-supplied key with HKDF-SHA256
//! - Each value gets a unique 96-bit nonce
//! - Values without the `enc:v1:` prefix are legacy plaintext and pass through unchanged

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::config::SecretsConfig;
use crate::error::{Error, Result};

/// Prefix marking an encrypted value
pub const ENCRYPTED_PREFIX: &str = "enc:v1:";

/// Nonce size for AES-256-GCM (96 bits = 12 bytes)
const NONCE_SIZE: usize = 12;

/// Turns a stored secret into the plaintext the mailbox login needs
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, stored: &str) -> Result<String>;
}

/// Accepts only plaintext values; used when no encryption key is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextDecryptor;

impl SecretDecryptor for PlaintextDecryptor {
    fn decrypt(&self, stored: &str) -> Result<String> {
        if stored.starts_with(ENCRYPTED_PREFIX) {
            return Err(Error::Credentials(
                "encrypted secret found but no encryption key is configured".to_string(),
            ));
        }
        Ok(stored.to_string())
    }
}

/// AES-256-GCM decryptor for `enc:v1:` values
pub struct AesGcmDecryptor {
    cipher: Aes256Gcm,
}

impl AesGcmDecryptor {
    /// Build a decryptor from the raw operator key
    pub fn new(key: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::Credentials("encryption key is empty".to_string()));
        }
        let derived_key = Self::derive_key(key)?;
        Ok(Self {
            cipher: Aes256Gcm::new(&derived_key.into()),
        })
    }

    /// Derive a 256-bit key from the user-provided key using HKDF
    fn derive_key(key: &str) -> Result<[u8; 32]> {
        let hkdf = Hkdf::<Sha256>::new(Some(b"helpdesk-sync-secrets"), key.as_bytes());
        let mut okm = [0u8; 32];
        hkdf.expand(b"aes-256-gcm", &mut okm)
            .map_err(|_| Error::Credentials("Failed to derive encryption key".to_string()))?;
        Ok(okm)
    }

    /// Encrypt a plaintext secret into its stored form
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        use aes_gcm::aead::rand_core::RngCore;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Credentials(format!("Encryption failed: {}", e)))?;

        let mut data = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        data.extend_from_slice(&nonce_bytes);
        data.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(data)))
    }
}

impl SecretDecryptor for AesGcmDecryptor {
    fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(stored.to_string());
        };

        let data = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Credentials(format!("Invalid encrypted secret: {}", e)))?;
        if data.len() <= NONCE_SIZE {
            return Err(Error::Credentials(
                "Invalid encrypted secret: too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Credentials("Decryption failed (wrong key?)".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::Credentials("Decrypted secret is not UTF-8".to_string()))
    }
}

/// Build the decryptor described by the config, reading the key from the environment
pub fn decryptor_from_config(config: &SecretsConfig) -> Result<Box<dyn SecretDecryptor>> {
    match std::env::var(&config.encryption_key_env) {
        Ok(key) if !key.is_empty() => Ok(Box::new(AesGcmDecryptor::new(&key)?)),
        _ => {
            tracing::warn!(
                "{} is not set; only plaintext mailbox passwords can be used",
                config.encryption_key_env
            );
            Ok(Box::new(PlaintextDecryptor))
        }
    }
}
