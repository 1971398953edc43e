//! Symmetric encryption of stored key material

use crate::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use alloy::primitives::hex;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

/// Context string for deriving the AES key from the master secret
const KEY_CONTEXT: &str = "yield-custody 2024-06 wallet keystore v1";

/// AES-GCM standard nonce length
const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher keyed from a master secret.
///
/// Ciphertext is stored as hex(nonce || ciphertext+tag) with a fresh random
/// nonce per encryption.
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    pub fn new(master_secret: &SecretString) -> Result<Self> {
        let master = master_secret.expose_secret();
        if master.len() < 16 {
            return Err(Error::Config(
                "Keystore master key must be at least 16 characters".to_string(),
            ));
        }

        let key = blake3::derive_key(KEY_CONTEXT, master.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Crypto(format!("Invalid cipher key: {}", e)))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &SecretString) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                plaintext.expose_secret().as_bytes(),
            )
            .map_err(|_| Error::Crypto("Encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<SecretString> {
        let raw = hex::decode(encoded)
            .map_err(|e| Error::Crypto(format!("Stored ciphertext is not hex: {}", e)))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::Crypto("Stored ciphertext is truncated".to_string()));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                Error::Crypto("Decryption failed (wrong master key or corrupted data)".to_string())
            })?;

        let text = String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto("Decrypted secret is not UTF-8".to_string()))?;
        Ok(SecretString::from(text))
    }
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCipher").field("key", &"[REDACTED]").finish()
    }
}
