//! Withdrawal error types
//!
//! `Display` is for logs. Chat handlers relay [`WithdrawalError::user_message`]
//! which never contains internal error text.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::backoff::LockConflict;
use crate::chain::ChainError;
use crate::core_types::{TransactionId, UserId};
use crate::models::TransactionStatus;
use crate::money::format_usdt;
use crate::store::StoreError;

/// A Policy Gate rejection
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyViolation {
    #[error("Withdrawals are under emergency stop")]
    EmergencyStop,

    #[error("Amount {amount} below minimum {minimum}")]
    BelowMinimum { amount: Decimal, minimum: Decimal },

    #[error("User is banned")]
    Banned,

    #[error("Withdrawals blocked for user")]
    WithdrawalBlocked,

    #[error("Financial password recovery in progress")]
    RecoveryInProgress,

    #[error("Fraud risk score {score} at or above threshold")]
    FraudRisk { score: u8 },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },
}

impl PolicyViolation {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyViolation::EmergencyStop => "EMERGENCY_STOP",
            PolicyViolation::BelowMinimum { .. } => "BELOW_MINIMUM",
            PolicyViolation::Banned => "USER_BANNED",
            PolicyViolation::WithdrawalBlocked => "WITHDRAWAL_BLOCKED",
            PolicyViolation::RecoveryInProgress => "RECOVERY_IN_PROGRESS",
            PolicyViolation::FraudRisk { .. } => "FRAUD_BLOCKED",
            PolicyViolation::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PolicyViolation::EmergencyStop => {
                "Withdrawals are temporarily unavailable due to maintenance. Please try again later."
                    .to_string()
            }
            PolicyViolation::BelowMinimum { minimum, .. } => {
                format!("Minimum withdrawal amount is {}.", format_usdt(*minimum))
            }
            PolicyViolation::Banned => {
                "Your account is restricted. Please contact support.".to_string()
            }
            PolicyViolation::WithdrawalBlocked => {
                "Withdrawals are blocked on your account. Please contact support.".to_string()
            }
            PolicyViolation::RecoveryInProgress => {
                "Withdrawals are unavailable while financial password recovery is in progress. \
                 Pending withdrawals have been returned to your balance."
                    .to_string()
            }
            PolicyViolation::FraudRisk { .. } => {
                "Your withdrawal was blocked by a security review. Please contact support."
                    .to_string()
            }
            PolicyViolation::InsufficientBalance {
                requested,
                available,
            } => format!(
                "Insufficient balance. Requested {}, available {} (short by {}).",
                format_usdt(*requested),
                format_usdt(*available),
                format_usdt(*requested - *available)
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum WithdrawalError {
    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    // === Request validation ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("User {0} has no wallet address")]
    WalletMissing(UserId),

    #[error("Invalid wallet address: {0}")]
    InvalidWallet(String),

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    // === State machine ===
    #[error("Withdrawal not found: {0}")]
    NotFound(TransactionId),

    #[error("Transaction {0} is not a withdrawal")]
    NotAWithdrawal(TransactionId),

    #[error("Withdrawal {0} belongs to another user")]
    NotOwner(TransactionId),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Withdrawal {0} already has an on-chain transaction")]
    AlreadySent(TransactionId),

    #[error("Withdrawal {0} is already being processed")]
    AlreadyProcessing(TransactionId),

    // === System ===
    #[error("Row lock unavailable after retries")]
    Busy,

    #[error("Blockchain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl WithdrawalError {
    pub fn code(&self) -> &'static str {
        match self {
            WithdrawalError::Policy(v) => v.code(),
            WithdrawalError::InvalidAmount => "INVALID_AMOUNT",
            WithdrawalError::WalletMissing(_) => "WALLET_MISSING",
            WithdrawalError::InvalidWallet(_) => "INVALID_WALLET",
            WithdrawalError::UserNotFound(_) => "USER_NOT_FOUND",
            WithdrawalError::NotFound(_) => "WITHDRAWAL_NOT_FOUND",
            WithdrawalError::NotAWithdrawal(_) => "NOT_A_WITHDRAWAL",
            WithdrawalError::NotOwner(_) => "NOT_OWNER",
            WithdrawalError::InvalidTransition { .. } => "INVALID_STATE_TRANSITION",
            WithdrawalError::AlreadySent(_) => "ALREADY_SENT",
            WithdrawalError::AlreadyProcessing(_) => "ALREADY_PROCESSING",
            WithdrawalError::Busy => "SYSTEM_BUSY",
            WithdrawalError::Chain(_) => "BLOCKCHAIN_ERROR",
            WithdrawalError::Store(_) => "INTERNAL_ERROR",
        }
    }

    /// Safe text for the chat user
    pub fn user_message(&self) -> String {
        match self {
            WithdrawalError::Policy(v) => v.user_message(),
            WithdrawalError::InvalidAmount => "Amount must be greater than zero.".to_string(),
            WithdrawalError::WalletMissing(_) => {
                "Please set your USDT (BEP-20) wallet address before withdrawing.".to_string()
            }
            WithdrawalError::InvalidWallet(_) => {
                "Your wallet address is not a valid BEP-20 address. Please update it.".to_string()
            }
            WithdrawalError::NotFound(_)
            | WithdrawalError::NotAWithdrawal(_)
            | WithdrawalError::NotOwner(_) => "Withdrawal not found.".to_string(),
            WithdrawalError::InvalidTransition { .. } | WithdrawalError::AlreadySent(_) => {
                "This withdrawal can no longer be changed.".to_string()
            }
            WithdrawalError::AlreadyProcessing(_) => {
                "This withdrawal is already being processed.".to_string()
            }
            WithdrawalError::Busy => {
                "The system is busy right now. Please try again in a moment.".to_string()
            }
            WithdrawalError::UserNotFound(_)
            | WithdrawalError::Chain(_)
            | WithdrawalError::Store(_) => {
                "Something went wrong. Please try again later.".to_string()
            }
        }
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(self, WithdrawalError::Policy(_))
    }
}

impl LockConflict for WithdrawalError {
    fn is_lock_conflict(&self) -> bool {
        matches!(self, WithdrawalError::Store(e) if e.is_lock_unavailable())
    }
}
