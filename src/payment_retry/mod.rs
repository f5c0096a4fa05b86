//! Payment Retry Engine
//!
//! Failed referral and deposit-reward payouts land here. A record is retried
//! on an exponential schedule (`base * 2^attempt_count`) until it succeeds or
//! uses up `max_retries`, after which it is parked in the dead-letter queue
//! until an admin requeues it. An earning is therefore always either paid or
//! visible in one of the two queues.
//!
//! Withdrawals never come through here; they have their own approve/reject
//! flow.

pub mod service;

pub use service::{NewRetry, PaymentRetryEngine, RetrySweepReport};

use thiserror::Error;

use crate::core_types::RetryId;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Retry record not found: {0}")]
    NotFound(RetryId),

    #[error("Retry record {0} is not in the dead-letter queue")]
    NotInDlq(RetryId),

    #[error("Retry record {0} is already resolved")]
    AlreadyResolved(RetryId),

    #[error("Retry record {0} is being processed")]
    AlreadyProcessing(RetryId),

    #[error("Payout amount must be greater than zero")]
    InvalidAmount,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl crate::backoff::LockConflict for RetryError {
    fn is_lock_conflict(&self) -> bool {
        matches!(self, RetryError::Store(e) if e.is_lock_unavailable())
    }
}
