//! Post-payout monitoring of PROCESSING withdrawals.
//!
//! - [`ConfirmationMonitor`]: frequent sweep promoting confirmed payouts
//!   and refunding reverted ones
//! - [`StuckTransactionMonitor`]: slower sweep over payouts older than the
//!   stuck window, with speed-up and resend recommendations for operators

pub mod confirmation;
pub mod stuck;

pub use confirmation::{ConfirmationMonitor, ConfirmationReport};
pub use stuck::{StuckAction, StuckReport, StuckTransaction, StuckTransactionMonitor};

use thiserror::Error;

use crate::chain::ChainError;
use crate::store::StoreError;
use crate::withdrawal::WithdrawalError;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Blockchain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Withdrawal error: {0}")]
    Withdrawal(#[from] WithdrawalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
