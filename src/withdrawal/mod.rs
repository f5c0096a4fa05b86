//! Withdrawals: policy gate, state machine and the orchestrator that
//! debits, records, approves, pays out and refunds.
//!
//! Every debit has exactly one matching outcome: the withdrawal ends
//! CONFIRMED, or it ends FAILED with the amount credited back once.

pub mod error;
pub mod policy;
pub mod service;
pub mod state;

pub use error::{PolicyViolation, WithdrawalError};
pub use policy::{PolicyCheck, PolicyGate, PolicyPass};
pub use service::WithdrawalService;
pub use state::{RefundGuard, can_transition, ensure_transition, is_terminal};

use rust_decimal::Decimal;

use crate::core_types::UserId;
use crate::models::Transaction;

/// A user's withdrawal request as received from the chat front-end
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WithdrawalRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    /// Balance the front-end displayed; re-checked under the row lock
    pub available_balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct WithdrawalReceipt {
    pub transaction: Transaction,
    /// `true` when the withdrawal skipped manual approval and is waiting
    /// for dispatch
    pub auto_approved: bool,
}
