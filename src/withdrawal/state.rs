//! Withdrawal state machine
//!
//! ```text
//! PENDING ──▶ PROCESSING ──▶ CONFIRMED
//!    │            │
//!    └────────────┴────────▶ FAILED
//! ```
//!
//! CONFIRMED and FAILED are terminal. Every refund flips to FAILED, so a
//! second refund of the same withdrawal fails the transition check.

use super::error::WithdrawalError;
use crate::core_types::UserId;
use crate::models::{Transaction, TransactionStatus};

#[inline]
pub fn is_terminal(status: TransactionStatus) -> bool {
    matches!(
        status,
        TransactionStatus::Confirmed | TransactionStatus::Failed
    )
}

pub fn can_transition(from: TransactionStatus, to: TransactionStatus) -> bool {
    use TransactionStatus::*;
    matches!(
        (from, to),
        (Pending, Processing) | (Pending, Failed) | (Processing, Confirmed) | (Processing, Failed)
    )
}

pub fn ensure_transition(
    from: TransactionStatus,
    to: TransactionStatus,
) -> Result<(), WithdrawalError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(WithdrawalError::InvalidTransition { from, to })
    }
}

/// Precondition a refund must find on the locked row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundGuard {
    /// User cancel: PENDING and owned by this user
    PendingOwnedBy(UserId),
    /// Recovery freeze, escrow reject
    Pending,
    /// Admin reject: PENDING, or PROCESSING with no payout sent yet
    Unsent,
    /// Chain reported the payout as reverted
    Processing,
}

impl RefundGuard {
    pub fn check(&self, withdrawal: &Transaction) -> Result<(), WithdrawalError> {
        let required = match self {
            RefundGuard::PendingOwnedBy(user_id) => {
                if withdrawal.user_id != *user_id {
                    return Err(WithdrawalError::NotOwner(withdrawal.id));
                }
                TransactionStatus::Pending
            }
            RefundGuard::Pending => TransactionStatus::Pending,
            RefundGuard::Unsent
                if withdrawal.status == TransactionStatus::Processing
                    && withdrawal.tx_hash.is_none() =>
            {
                TransactionStatus::Processing
            }
            RefundGuard::Unsent => TransactionStatus::Pending,
            RefundGuard::Processing => TransactionStatus::Processing,
        };
        if withdrawal.status != required {
            return Err(WithdrawalError::InvalidTransition {
                from: withdrawal.status,
                to: TransactionStatus::Failed,
            });
        }
        ensure_transition(withdrawal.status, TransactionStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionType;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn withdrawal(status: TransactionStatus) -> Transaction {
        Transaction {
            id: 10,
            user_id: 1,
            tx_type: TransactionType::Withdrawal,
            amount: Decimal::from(50),
            fee: Decimal::ZERO,
            balance_before: Decimal::from(100),
            balance_after: Decimal::from(50),
            status,
            tx_hash: None,
            to_address: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(is_terminal(TransactionStatus::Confirmed));
        assert!(is_terminal(TransactionStatus::Failed));
        assert!(!is_terminal(TransactionStatus::Pending));
        assert!(!is_terminal(TransactionStatus::Processing));
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for to in [
            TransactionStatus::Pending,
            TransactionStatus::Processing,
            TransactionStatus::Confirmed,
            TransactionStatus::Failed,
        ] {
            assert!(!can_transition(TransactionStatus::Confirmed, to));
            assert!(!can_transition(TransactionStatus::Failed, to));
        }
        assert!(!can_transition(
            TransactionStatus::Pending,
            TransactionStatus::Confirmed
        ));
    }

    #[test]
    fn test_refund_guard() {
        let pending = withdrawal(TransactionStatus::Pending);
        assert!(RefundGuard::PendingOwnedBy(1).check(&pending).is_ok());
        assert!(matches!(
            RefundGuard::PendingOwnedBy(2).check(&pending),
            Err(WithdrawalError::NotOwner(10))
        ));
        assert!(RefundGuard::Processing.check(&pending).is_err());

        let failed = withdrawal(TransactionStatus::Failed);
        assert!(matches!(
            RefundGuard::Pending.check(&failed),
            Err(WithdrawalError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unsent_guard_refuses_paid_out_rows() {
        let mut processing = withdrawal(TransactionStatus::Processing);
        assert!(RefundGuard::Unsent.check(&processing).is_ok());
        assert!(RefundGuard::Pending.check(&processing).is_err());

        processing.tx_hash = Some("0xabc".into());
        assert!(matches!(
            RefundGuard::Unsent.check(&processing),
            Err(WithdrawalError::InvalidTransition { .. })
        ));
        assert!(RefundGuard::Unsent.check(&withdrawal(TransactionStatus::Pending)).is_ok());
    }
}
