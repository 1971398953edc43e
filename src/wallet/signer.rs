//! Signing wallet built from a decrypted key
//!
//! SECURITY: the key stays inside alloy's `PrivateKeySigner`.
//! - Never serialized (no Serialize impl)
//! - Never logged (manual Debug)
//! - Dropped as soon as the signing operation finishes

use crate::{Error, Result};
use alloy::network::EthereumWallet;
use alloy::primitives::{hex, Address, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signature;
use secrecy::{ExposeSecret, SecretString};

pub struct SecureWallet {
    signer: PrivateKeySigner,
    address: Address,
    wallet: EthereumWallet,
}

impl SecureWallet {
    /// Parse a hex-encoded private key, with or without `0x`
    pub fn from_secret(secret: &SecretString) -> Result<Self> {
        let key_hex = secret.expose_secret().trim();
        let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);

        let signer: PrivateKeySigner = key_hex
            .parse()
            .map_err(|e| Error::Wallet(format!("Invalid private key: {}", e)))?;

        Ok(Self::from_signer(signer))
    }

    /// Fresh random key. Returns the wallet and its hex secret for storage.
    pub fn generate() -> (Self, SecretString) {
        let signer = PrivateKeySigner::random();
        let secret = SecretString::from(format!("0x{}", hex::encode(signer.to_bytes())));
        (Self::from_signer(signer), secret)
    }

    fn from_signer(signer: PrivateKeySigner) -> Self {
        let address = signer.address();
        let wallet = EthereumWallet::from(signer.clone());
        Self {
            signer,
            address,
            wallet,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Wallet for alloy providers; exposes signing only
    pub fn wallet(&self) -> &EthereumWallet {
        &self.wallet
    }

    /// Sign a 32-byte digest (relay bundle authorization)
    pub fn sign_hash(&self, hash: &B256) -> Result<Signature> {
        use alloy::signers::SignerSync;

        self.signer
            .sign_hash_sync(hash)
            .map_err(|e| Error::Wallet(format!("Signing failed: {}", e)))
    }
}

impl std::fmt::Debug for SecureWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureWallet")
            .field("address", &self.address)
            .field("signer", &"[REDACTED]")
            .finish()
    }
}
