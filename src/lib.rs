//! Custodial yield assistant
//!
//! Holds or co-controls user funds, deploys them into lending and vault
//! protocols, and keeps the local ledger honest against the chain:
//! - Aggregates liquid and protocol balances with cached USD prices
//! - Reconciles stored positions against live receipt-token balances
//! - Routes swap quotes across two providers under per-provider rate limits
//! - Executes deposits, withdrawals and zaps through an explicit
//!   confirm-then-execute state machine
//!
//! # Security Model
//!
//! - Keys are stored encrypted (AES-256-GCM) and decrypted only on demand
//! - A key is revealed only after a fresh export check proves it controls
//!   every dollar the user holds; any unverifiable balance blocks export
//! - Only confirmed on-chain effects are written to the ledger

pub mod audit;
pub mod balances;
pub mod chain;
pub mod config;
pub mod deposit_monitor;
pub mod executor;
pub mod export_gate;
pub mod pricing;
pub mod protocols;
pub mod quote;
pub mod reconcile;
pub mod services;
pub mod store;
pub mod tokens;
pub mod wallet;

mod error;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, RpcConfig, KEYSTORE_MASTER_KEY_ENV};
pub use error::{Error, Result};
pub use services::Services;
