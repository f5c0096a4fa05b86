use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::EscrowError;
use crate::backoff::retry_on_lock_conflict;
use crate::config::EscrowConfig;
use crate::core_types::{AdminId, EscrowId, TransactionId};
use crate::models::{
    AdminActionEscrow, EscrowOperation, EscrowStatus, NewEscrow, Transaction, TransactionStatus,
    WithdrawalApprovalData,
};
use crate::notify::{AdminAlert, UserNotice};
use crate::store::{LedgerTx, LockMode, StoreError};
use crate::withdrawal::{RefundGuard, WithdrawalError, WithdrawalService};

/// What an admin's "approve" on a withdrawal turned into
#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// At or above the dual-control threshold: waiting for a second admin
    Escrow(AdminActionEscrow),
    /// Below the threshold: paid out immediately
    DirectApproval {
        tx_hash: String,
        transaction: Transaction,
    },
}

/// Second-admin approval of an escrow
#[derive(Debug, Clone)]
pub struct EscrowApproval {
    pub escrow: AdminActionEscrow,
    pub transaction: Transaction,
}

pub struct EscrowService {
    withdrawals: Arc<WithdrawalService>,
    config: EscrowConfig,
}

impl EscrowService {
    pub fn new(withdrawals: Arc<WithdrawalService>, config: EscrowConfig) -> Self {
        Self {
            withdrawals,
            config,
        }
    }

    /// First admin's approve.
    ///
    /// Below the threshold the payout happens now. At or above it an escrow
    /// is opened (or the open one returned) and nothing touches the chain.
    pub async fn approve_withdrawal_via_escrow(
        &self,
        transaction_id: TransactionId,
        admin_id: AdminId,
    ) -> Result<ApprovalOutcome, EscrowError> {
        let withdrawal = self
            .withdrawals
            .get_withdrawal_by_id(transaction_id)
            .await?
            .ok_or(WithdrawalError::NotFound(transaction_id))?;

        if withdrawal.amount < self.config.dual_control_withdrawal_threshold {
            let transaction = self
                .withdrawals
                .approve_direct(transaction_id, admin_id)
                .await?;
            let tx_hash = transaction.tx_hash.clone().unwrap_or_default();
            return Ok(ApprovalOutcome::DirectApproval {
                tx_hash,
                transaction,
            });
        }

        let store = self.withdrawals.store();
        let mut tx = store.begin().await?;
        let withdrawal = self
            .withdrawals
            .claim_for_payout(tx.as_mut(), transaction_id)
            .await?;

        if let Some(existing) = tx
            .pending_escrow_for(EscrowOperation::WithdrawalApproval, transaction_id)
            .await?
        {
            info!(
                escrow_id = existing.id,
                transaction_id, admin_id, "Escrow already open for withdrawal"
            );
            return Ok(ApprovalOutcome::Escrow(existing));
        }

        let snapshot = WithdrawalApprovalData {
            amount: withdrawal.amount,
            to_address: withdrawal.to_address.clone(),
            user_id: withdrawal.user_id,
        };
        let escrow = tx
            .insert_escrow(NewEscrow {
                operation_type: EscrowOperation::WithdrawalApproval,
                target_id: transaction_id,
                operation_data: serde_json::to_value(&snapshot)?,
                initiator_admin_id: admin_id,
                expires_at: Utc::now() + Duration::hours(self.config.expires_in_hours),
            })
            .await?;
        tx.commit().await?;

        info!(
            escrow_id = escrow.id,
            transaction_id,
            initiator_admin_id = admin_id,
            amount = %withdrawal.amount,
            "Escrow created, awaiting second admin"
        );
        self.withdrawals
            .notifier()
            .alert_admins(AdminAlert::EscrowAwaitingApproval {
                escrow_id: escrow.id,
                transaction_id,
                amount: withdrawal.amount,
                initiator_admin_id: admin_id,
            });
        Ok(ApprovalOutcome::Escrow(escrow))
    }

    /// Second admin's approve: pay out, then mark the escrow APPROVED and
    /// the withdrawal PROCESSING in one commit.
    ///
    /// A gateway failure leaves the escrow PENDING so it can be approved
    /// again.
    pub async fn approve(
        &self,
        escrow_id: EscrowId,
        admin_id: AdminId,
    ) -> Result<EscrowApproval, EscrowError> {
        let mut tx = self.withdrawals.store().begin().await?;
        let mut escrow = lock_pending_escrow(tx.as_mut(), escrow_id).await?;

        if escrow.is_expired_at(Utc::now()) {
            return Err(EscrowError::Expired(escrow_id));
        }
        if escrow.initiator_admin_id == admin_id {
            warn!(escrow_id, admin_id, "Escrow self-approval attempt rejected");
            return Err(EscrowError::SelfApproval {
                escrow_id,
                admin_id,
            });
        }

        let snapshot: WithdrawalApprovalData =
            serde_json::from_value(escrow.operation_data.clone())?;
        let withdrawal = self
            .withdrawals
            .claim_for_payout(tx.as_mut(), escrow.target_id)
            .await?;
        if snapshot.amount != withdrawal.amount
            || snapshot.user_id != withdrawal.user_id
            || snapshot.to_address != withdrawal.to_address
        {
            error!(
                escrow_id,
                transaction_id = withdrawal.id,
                "Escrow snapshot differs from withdrawal row"
            );
            return Err(EscrowError::SnapshotMismatch(escrow_id));
        }

        let tx_hash = match self.withdrawals.send_payout(&withdrawal).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(escrow_id, error = %e, "Escrow payout failed, escrow stays pending");
                return Err(e.into());
            }
        };

        let transaction = self
            .withdrawals
            .approve_locked(tx.as_mut(), withdrawal, tx_hash.clone(), Some(admin_id))
            .await?;
        escrow.status = EscrowStatus::Approved;
        escrow.approver_admin_id = Some(admin_id);
        tx.update_escrow(&escrow).await?;

        if let Err(e) = tx.commit().await {
            self.withdrawals
                .report_unrecorded_payout(format!("escrow:{}", escrow_id), &tx_hash, &e);
            return Err(e.into());
        }

        info!(
            escrow_id,
            transaction_id = transaction.id,
            initiator_admin_id = escrow.initiator_admin_id,
            approver_admin_id = admin_id,
            tx_hash = %tx_hash,
            "Escrow approved and paid out"
        );
        self.withdrawals.notify_approved(&transaction);
        Ok(EscrowApproval {
            escrow,
            transaction,
        })
    }

    /// Reject a PENDING escrow and refund the withdrawal in the same commit
    pub async fn reject(
        &self,
        escrow_id: EscrowId,
        admin_id: AdminId,
        reason: String,
    ) -> Result<AdminActionEscrow, EscrowError> {
        let (escrow, refunded) = retry_on_lock_conflict(
            self.withdrawals.lock_retry(),
            "escrow_reject",
            || self.reject_once(escrow_id, admin_id, &reason),
        )
        .await?;

        info!(escrow_id, admin_id, reason = %reason, "Escrow rejected");
        if let Some(withdrawal) = refunded {
            self.withdrawals
                .notifier()
                .notify_user(UserNotice::WithdrawalRejected {
                    user_id: withdrawal.user_id,
                    transaction_id: withdrawal.id,
                    amount: withdrawal.amount,
                    reason: Some(reason),
                });
        }
        Ok(escrow)
    }

    async fn reject_once(
        &self,
        escrow_id: EscrowId,
        admin_id: AdminId,
        reason: &str,
    ) -> Result<(AdminActionEscrow, Option<Transaction>), EscrowError> {
        let mut tx = self.withdrawals.store().begin().await?;
        let mut escrow = lock_pending_escrow(tx.as_mut(), escrow_id).await?;

        let refunded = match self
            .withdrawals
            .refund_locked(tx.as_mut(), escrow.target_id, RefundGuard::Pending)
            .await
        {
            Ok(w) => Some(w),
            // refunded in the meantime by a recovery freeze; nothing left to refund
            Err(WithdrawalError::InvalidTransition {
                from: TransactionStatus::Failed,
                ..
            }) => {
                warn!(
                    escrow_id,
                    transaction_id = escrow.target_id,
                    "Withdrawal already failed, closing escrow without refund"
                );
                None
            }
            Err(e) => return Err(e.into()),
        };

        escrow.status = EscrowStatus::Rejected;
        escrow.rejected_by_admin_id = Some(admin_id);
        escrow.rejection_reason = Some(reason.to_string());
        tx.update_escrow(&escrow).await?;
        tx.commit().await?;
        Ok((escrow, refunded))
    }

    pub async fn get(&self, escrow_id: EscrowId) -> Result<Option<AdminActionEscrow>, EscrowError> {
        Ok(self.withdrawals.store().get_escrow(escrow_id).await?)
    }

    pub async fn get_pending_by_operation(
        &self,
        operation: EscrowOperation,
    ) -> Result<Vec<AdminActionEscrow>, EscrowError> {
        Ok(self
            .withdrawals
            .store()
            .list_pending_escrows(operation)
            .await?)
    }

    pub async fn mark_expired(&self) -> Result<usize, EscrowError> {
        self.mark_expired_at(Utc::now()).await
    }

    /// Flip overdue PENDING escrows to EXPIRED. The withdrawal is left
    /// untouched for an admin to follow up.
    pub async fn mark_expired_at(&self, now: DateTime<Utc>) -> Result<usize, EscrowError> {
        let store = self.withdrawals.store();
        let overdue = store.list_expired_escrows(now).await?;

        let mut expired = 0;
        for candidate in overdue {
            let mut tx = store.begin().await?;
            let mut escrow = match tx.lock_escrow(candidate.id, LockMode::NoWait).await {
                Ok(e) => e,
                Err(e) if e.is_lock_unavailable() => continue,
                Err(e) => return Err(e.into()),
            };
            if escrow.status != EscrowStatus::Pending || !escrow.is_expired_at(now) {
                continue;
            }
            escrow.status = EscrowStatus::Expired;
            tx.update_escrow(&escrow).await?;
            tx.commit().await?;
            expired += 1;

            warn!(
                escrow_id = escrow.id,
                target_id = escrow.target_id,
                "Escrow expired without second approval"
            );
            self.withdrawals
                .notifier()
                .alert_admins(AdminAlert::EscrowExpired {
                    escrow_id: escrow.id,
                    target_id: escrow.target_id,
                });
        }
        Ok(expired)
    }
}

/// Blocking lock on the escrow row; a concurrent approver waits here and
/// then sees the outcome
async fn lock_pending_escrow(
    tx: &mut dyn LedgerTx,
    escrow_id: EscrowId,
) -> Result<AdminActionEscrow, EscrowError> {
    let escrow = match tx.lock_escrow(escrow_id, LockMode::Wait).await {
        Ok(e) => e,
        Err(StoreError::NotFound { .. }) => return Err(EscrowError::NotFound(escrow_id)),
        Err(e) if e.is_lock_unavailable() => return Err(EscrowError::AlreadyProcessing(escrow_id)),
        Err(e) => return Err(e.into()),
    };
    if escrow.status != EscrowStatus::Pending {
        return Err(EscrowError::AlreadyProcessed {
            escrow_id,
            status: escrow.status,
        });
    }
    Ok(escrow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockGateway;
    use crate::config::WithdrawalConfig;
    use crate::fraud::DisabledFraudDetector;
    use crate::models::User;
    use crate::notify::MemoryNotifier;
    use crate::settings::SettingsProvider;
    use crate::store::MemoryLedgerStore;
    use crate::withdrawal::WithdrawalRequest;
    use rust_decimal::Decimal;

    async fn setup() -> (Arc<MemoryLedgerStore>, Arc<MemoryNotifier>, EscrowService, TransactionId) {
        let store = Arc::new(MemoryLedgerStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let settings = Arc::new(SettingsProvider::new(
            store.clone(),
            std::time::Duration::from_secs(30),
        ));
        let withdrawals = Arc::new(WithdrawalService::new(
            store.clone(),
            Arc::new(MockGateway::new()),
            notifier.clone(),
            Arc::new(DisabledFraudDetector),
            settings,
            WithdrawalConfig::default(),
        ));
        store.insert_user(
            User::new(1, Decimal::from(5000))
                .with_wallet("0x2222222222222222222222222222222222222222"),
        );
        let id = withdrawals
            .request_withdrawal(WithdrawalRequest {
                user_id: 1,
                amount: Decimal::from(2000),
                available_balance: Decimal::from(5000),
            })
            .await
            .unwrap()
            .transaction
            .id;
        let escrows = EscrowService::new(withdrawals, EscrowConfig::default());
        (store, notifier, escrows, id)
    }

    #[tokio::test]
    async fn test_second_initiation_returns_open_escrow() {
        let (_store, _notifier, escrows, id) = setup().await;
        let first = match escrows.approve_withdrawal_via_escrow(id, 10).await.unwrap() {
            ApprovalOutcome::Escrow(e) => e,
            other => panic!("expected escrow, got {:?}", other),
        };
        let second = match escrows.approve_withdrawal_via_escrow(id, 11).await.unwrap() {
            ApprovalOutcome::Escrow(e) => e,
            other => panic!("expected escrow, got {:?}", other),
        };
        assert_eq!(first.id, second.id);
        assert_eq!(second.initiator_admin_id, 10);
        assert_eq!(
            escrows
                .get_pending_by_operation(EscrowOperation::WithdrawalApproval)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_expiry_does_not_refund() {
        let (store, notifier, escrows, id) = setup().await;
        let escrow = match escrows.approve_withdrawal_via_escrow(id, 10).await.unwrap() {
            ApprovalOutcome::Escrow(e) => e,
            other => panic!("expected escrow, got {:?}", other),
        };

        let later = escrow.expires_at + Duration::seconds(1);
        assert_eq!(escrows.mark_expired_at(later).await.unwrap(), 1);
        assert_eq!(escrows.mark_expired_at(later).await.unwrap(), 0);

        let stored = escrows.get(escrow.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EscrowStatus::Expired);
        assert_eq!(store.user(1).unwrap().balance, Decimal::from(3000));
        assert!(
            notifier
                .admin_alerts()
                .iter()
                .any(|a| matches!(a, AdminAlert::EscrowExpired { .. }))
        );

        assert!(matches!(
            escrows.approve(escrow.id, 11).await,
            Err(EscrowError::AlreadyProcessed {
                status: EscrowStatus::Expired,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reject_refunds_withdrawal() {
        let (store, _notifier, escrows, id) = setup().await;
        let escrow = match escrows.approve_withdrawal_via_escrow(id, 10).await.unwrap() {
            ApprovalOutcome::Escrow(e) => e,
            other => panic!("expected escrow, got {:?}", other),
        };

        let rejected = escrows
            .reject(escrow.id, 11, "destination under review".into())
            .await
            .unwrap();
        assert_eq!(rejected.status, EscrowStatus::Rejected);
        assert_eq!(rejected.rejected_by_admin_id, Some(11));
        assert_eq!(store.user(1).unwrap().balance, Decimal::from(5000));

        assert!(matches!(
            escrows.reject(escrow.id, 12, "again".into()).await,
            Err(EscrowError::AlreadyProcessed { .. })
        ));
        assert_eq!(store.user(1).unwrap().balance, Decimal::from(5000));
    }
}
