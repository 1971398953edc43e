//! Per-user encrypted key storage

use super::{KeyCipher, SecureWallet};
use crate::store::{Database, WalletKind, WalletRecord};
use crate::{Error, Result};
use alloy::primitives::Address;
use chrono::Utc;
use secrecy::SecretString;

/// Owns encryption of key material and wallet classification.
///
/// A `Delegated` wallet's stored key controls only the owner account; the
/// funds at `WalletRecord::address` are reachable through the relay alone.
pub struct EncryptedKeyStore {
    db: Database,
    cipher: KeyCipher,
}

impl EncryptedKeyStore {
    pub fn new(db: Database, master_secret: &SecretString) -> Result<Self> {
        Ok(Self {
            db,
            cipher: KeyCipher::new(master_secret)?,
        })
    }

    /// Generate and store a fresh direct-controlled key
    pub async fn create_direct(&self, user_id: i64) -> Result<WalletRecord> {
        self.ensure_absent(user_id).await?;
        let (wallet, secret) = SecureWallet::generate();
        self.persist(user_id, wallet.address(), WalletKind::Direct, None, &secret, true)
            .await
    }

    /// Import an existing key the user controls directly
    pub async fn store_direct(&self, user_id: i64, raw_secret: &SecretString) -> Result<WalletRecord> {
        self.ensure_absent(user_id).await?;
        let wallet = SecureWallet::from_secret(raw_secret)?;
        self.persist(user_id, wallet.address(), WalletKind::Direct, None, raw_secret, false)
            .await
    }

    /// Record a gasless-provisioned smart wallet at `funds_address`, owned by
    /// `owner_secret`
    pub async fn store_delegated(
        &self,
        user_id: i64,
        owner_secret: &SecretString,
        funds_address: Address,
    ) -> Result<WalletRecord> {
        self.ensure_absent(user_id).await?;
        let owner = SecureWallet::from_secret(owner_secret)?;
        if owner.address() == funds_address {
            return Err(Error::InvalidArgument(
                "Delegated wallet address must differ from its owner key".to_string(),
            ));
        }
        self.persist(
            user_id,
            funds_address,
            WalletKind::Delegated,
            Some(owner.address()),
            owner_secret,
            true,
        )
        .await
    }

    /// Wallet for a user, `KeyNotFound` if none
    pub async fn wallet(&self, user_id: i64) -> Result<WalletRecord> {
        self.db
            .get_wallet(user_id)
            .await?
            .ok_or(Error::KeyNotFound(user_id))
    }

    /// Decrypt the stored secret. Callers gating disclosure must run the export
    /// check first.
    pub async fn reveal(&self, user_id: i64) -> Result<SecretString> {
        let wallet = self.wallet(user_id).await?;
        self.cipher.decrypt(&wallet.encrypted_secret)
    }

    /// Signer for the stored key
    pub async fn signer(&self, user_id: i64) -> Result<SecureWallet> {
        let secret = self.reveal(user_id).await?;
        SecureWallet::from_secret(&secret)
    }

    async fn ensure_absent(&self, user_id: i64) -> Result<()> {
        if self.db.get_wallet(user_id).await?.is_some() {
            return Err(Error::WalletExists(user_id));
        }
        Ok(())
    }

    async fn persist(
        &self,
        user_id: i64,
        address: Address,
        kind: WalletKind,
        owner_address: Option<Address>,
        secret: &SecretString,
        auto_provisioned: bool,
    ) -> Result<WalletRecord> {
        let record = WalletRecord {
            user_id,
            address,
            kind,
            owner_address,
            encrypted_secret: self.cipher.encrypt(secret)?,
            auto_provisioned,
            created_at: Utc::now(),
        };
        self.db.insert_wallet(&record).await?;

        tracing::info!(
            user_id = user_id,
            address = %address,
            kind = kind.as_str(),
            "Stored wallet"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use secrecy::ExposeSecret;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const SMART_WALLET: Address = address!("1111111111111111111111111111111111111111");

    async fn keystore() -> EncryptedKeyStore {
        let db = Database::in_memory().await.unwrap();
        EncryptedKeyStore::new(db, &SecretString::from("test master key 0123456789".to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_and_reveal_direct() {
        let store = keystore().await;
        let record = store
            .store_direct(1, &SecretString::from(TEST_KEY.to_string()))
            .await
            .unwrap();

        assert_eq!(record.kind, WalletKind::Direct);
        assert!(!record.encrypted_secret.contains("ac0974bec"));
        assert_eq!(store.reveal(1).await.unwrap().expose_secret(), TEST_KEY);
    }

    #[tokio::test]
    async fn test_reveal_missing_user() {
        let store = keystore().await;
        assert!(matches!(store.reveal(42).await, Err(Error::KeyNotFound(42))));
    }

    #[tokio::test]
    async fn test_delegated_wallet_funds_live_elsewhere() {
        let store = keystore().await;
        let record = store
            .store_delegated(2, &SecretString::from(TEST_KEY.to_string()), SMART_WALLET)
            .await
            .unwrap();

        assert_eq!(record.kind, WalletKind::Delegated);
        assert_eq!(record.address, SMART_WALLET);
        assert_ne!(record.key_address(), record.address);
        assert!(record.auto_provisioned);
    }

    #[tokio::test]
    async fn test_second_wallet_rejected() {
        let store = keystore().await;
        let first = store.create_direct(3).await.unwrap();
        assert!(matches!(store.create_direct(3).await, Err(Error::WalletExists(3))));

        // Address unchanged by the failed attempt
        assert_eq!(store.wallet(3).await.unwrap().address, first.address);
        assert_eq!(store.signer(3).await.unwrap().address(), first.address);
    }
}
