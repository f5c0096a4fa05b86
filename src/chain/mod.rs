//! Blockchain Gateway
//!
//! Outbound side of the hot wallet: USDT (BEP-20) transfers, status polls,
//! balance reads. Every call is network-fallible; callers poll status and
//! never infer it from a successful send.

pub mod bep20;
pub mod mock;

pub use bep20::Bep20Gateway;
pub use mock::MockGateway;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::money::MoneyError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] MoneyError),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// On-chain state of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainTxStatus {
    /// Known to the node, not mined yet
    Pending,
    Confirmed,
    /// Mined and reverted
    Failed,
    /// The node has never seen it, or dropped it
    Unknown,
}

impl ChainTxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainTxStatus::Pending => "pending",
            ChainTxStatus::Confirmed => "confirmed",
            ChainTxStatus::Failed => "failed",
            ChainTxStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ChainTxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTxReport {
    pub status: ChainTxStatus,
    pub confirmations: u64,
    pub block_number: Option<u64>,
    /// Gas price the transaction was submitted with (wei)
    pub gas_price: Option<u128>,
}

impl ChainTxReport {
    pub fn unknown() -> Self {
        Self {
            status: ChainTxStatus::Unknown,
            confirmations: 0,
            block_number: None,
            gas_price: None,
        }
    }

    pub fn pending(gas_price: Option<u128>) -> Self {
        Self {
            status: ChainTxStatus::Pending,
            confirmations: 0,
            block_number: None,
            gas_price,
        }
    }

    pub fn confirmed(block_number: u64, confirmations: u64) -> Self {
        Self {
            status: ChainTxStatus::Confirmed,
            confirmations,
            block_number: Some(block_number),
            gas_price: None,
        }
    }

    pub fn failed(block_number: u64) -> Self {
        Self {
            status: ChainTxStatus::Failed,
            confirmations: 0,
            block_number: Some(block_number),
            gas_price: None,
        }
    }
}

#[async_trait]
pub trait BlockchainGateway: Send + Sync {
    /// Transfer `amount` USDT from the hot wallet; returns the tx hash
    async fn send_payment(&self, to_address: &str, amount: Decimal) -> Result<String, ChainError>;

    async fn check_transaction_status(&self, tx_hash: &str) -> Result<ChainTxReport, ChainError>;

    fn validate_wallet_address(&self, address: &str) -> bool;

    async fn get_usdt_balance(&self, address: &str) -> Result<Decimal, ChainError>;

    /// Current network gas price (wei)
    async fn gas_price(&self) -> Result<u128, ChainError>;
}

/// `0x` followed by 40 hex digits (case-insensitive, no checksum check)
pub fn is_evm_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}
