//! On-chain submission back-ends
//!
//! Submission is the point of no return: once a call is sent it is never
//! cancelled. Both back-ends wait for the outcome and report a revert as an
//! error, so a receipt means every call in the batch succeeded.

use crate::chain::with_timeout;
use crate::protocols::PreparedCall;
use crate::store::{WalletKind, WalletRecord};
use crate::wallet::EncryptedKeyStore;
use crate::{Error, Result};
use alloy::primitives::{keccak256, Address};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a successful submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionReceipt {
    /// Hash of the last transaction in the batch
    pub tx_hash: String,
    pub gas_used: Option<u64>,
}

#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute `calls` in order from `wallet`
    async fn submit(&self, wallet: &WalletRecord, calls: &[PreparedCall]) -> Result<SubmissionReceipt>;
}

/// Signs and sends each call with the stored key
pub struct DirectSubmitter {
    keystore: Arc<EncryptedKeyStore>,
    rpc_url: url::Url,
    send_timeout: Duration,
    confirm_timeout: Duration,
}

impl DirectSubmitter {
    pub fn new(keystore: Arc<EncryptedKeyStore>, rpc_url: url::Url, timeout: Duration) -> Self {
        Self {
            keystore,
            rpc_url,
            send_timeout: timeout,
            // Inclusion takes longer than a read
            confirm_timeout: timeout * 12,
        }
    }
}

#[async_trait]
impl TransactionSubmitter for DirectSubmitter {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn submit(&self, wallet: &WalletRecord, calls: &[PreparedCall]) -> Result<SubmissionReceipt> {
        if wallet.kind != WalletKind::Direct {
            return Err(Error::Submission(
                "Delegated wallets must use the gasless relay".to_string(),
            ));
        }

        let signer = self.keystore.signer(wallet.user_id).await?;
        if signer.address() != wallet.address {
            return Err(Error::Wallet(format!(
                "Stored key controls {}, not wallet {}",
                signer.address(),
                wallet.address
            )));
        }

        let provider = ProviderBuilder::new()
            .wallet(signer.wallet().clone())
            .connect_http(self.rpc_url.clone());

        let mut gas_used = 0u64;
        let mut last_hash = None;

        for (i, call) in calls.iter().enumerate() {
            let tx = TransactionRequest::default()
                .from(wallet.address)
                .to(call.to)
                .input(call.data.clone().into())
                .value(call.value);

            let pending = with_timeout(self.send_timeout, "send_transaction", async {
                provider
                    .send_transaction(tx)
                    .await
                    .map_err(|e| Error::Submission(format!("Call {} to {} rejected: {}", i, call.to, e)))
            })
            .await?;

            let receipt = with_timeout(self.confirm_timeout, "transaction receipt", async {
                pending
                    .get_receipt()
                    .await
                    .map_err(|e| Error::Submission(format!("Call {} not confirmed: {}", i, e)))
            })
            .await?;

            if !receipt.status() {
                return Err(Error::Submission(format!(
                    "Transaction {} reverted",
                    receipt.transaction_hash
                )));
            }

            tracing::info!(
                user_id = wallet.user_id,
                step = i,
                to = %call.to,
                tx_hash = %receipt.transaction_hash,
                gas_used = receipt.gas_used,
                "Transaction confirmed"
            );
            gas_used += receipt.gas_used;
            last_hash = Some(receipt.transaction_hash.to_string());
        }

        let tx_hash =
            last_hash.ok_or_else(|| Error::Submission("No calls to submit".to_string()))?;
        Ok(SubmissionReceipt {
            tx_hash,
            gas_used: Some(gas_used),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayBundle<'a> {
    chain_id: u64,
    wallet: Address,
    owner: Address,
    calls: &'a [PreparedCall],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedRelayBundle<'a> {
    #[serde(flatten)]
    bundle: RelayBundle<'a>,
    signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayResponse {
    tx_hash: Option<String>,
    status: String,
    #[serde(default)]
    gas_used: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

fn relay_outcome(response: RelayResponse) -> Result<SubmissionReceipt> {
    match (response.status.as_str(), response.tx_hash) {
        ("success", Some(tx_hash)) => Ok(SubmissionReceipt {
            tx_hash,
            gas_used: response.gas_used,
        }),
        (status, hash) => Err(Error::Submission(format!(
            "Relay reported {}{}{}",
            status,
            hash.map(|h| format!(" for {}", h)).unwrap_or_default(),
            response.error.map(|e| format!(": {}", e)).unwrap_or_default()
        ))),
    }
}

/// Relays the call bundle for a delegated smart wallet, authorized by the
/// owner key's signature over the bundle
pub struct GaslessSubmitter {
    keystore: Arc<EncryptedKeyStore>,
    client: Client,
    relay_url: String,
    chain_id: u64,
}

impl GaslessSubmitter {
    pub fn new(
        keystore: Arc<EncryptedKeyStore>,
        relay_url: &str,
        chain_id: u64,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            keystore,
            client,
            relay_url: relay_url.to_string(),
            chain_id,
        })
    }
}

#[async_trait]
impl TransactionSubmitter for GaslessSubmitter {
    fn name(&self) -> &'static str {
        "gasless"
    }

    async fn submit(&self, wallet: &WalletRecord, calls: &[PreparedCall]) -> Result<SubmissionReceipt> {
        if wallet.kind != WalletKind::Delegated {
            return Err(Error::Submission(
                "Gasless relay only serves delegated wallets".to_string(),
            ));
        }
        if calls.is_empty() {
            return Err(Error::Submission("No calls to submit".to_string()));
        }

        let owner = self.keystore.signer(wallet.user_id).await?;
        let bundle = RelayBundle {
            chain_id: self.chain_id,
            wallet: wallet.address,
            owner: owner.address(),
            calls,
        };
        let digest = keccak256(serde_json::to_vec(&bundle)?);
        let signature = owner.sign_hash(&digest)?;

        let response: RelayResponse = self
            .client
            .post(&self.relay_url)
            .json(&SignedRelayBundle {
                bundle,
                signature: format!("0x{}", alloy::primitives::hex::encode(signature.as_bytes())),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let receipt = relay_outcome(response)?;
        tracing::info!(
            user_id = wallet.user_id,
            wallet = %wallet.address,
            calls = calls.len(),
            tx_hash = %receipt.tx_hash,
            "Relayed bundle confirmed"
        );
        Ok(receipt)
    }
}
