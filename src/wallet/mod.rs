//! Wallet custody
//!
//! Private keys are stored only as AES-256-GCM ciphertext and decrypted on
//! demand. Decrypted material lives in `SecretString` or inside alloy's
//! `PrivateKeySigner` and is never logged or serialized.

mod cipher;
mod keystore;
mod signer;

pub use cipher::KeyCipher;
pub use keystore::EncryptedKeyStore;
pub use signer::SecureWallet;
