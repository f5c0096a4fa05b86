//! Withdrawal Orchestrator
//!
//! Lock discipline:
//! - the User row is locked (NOWAIT, retried with backoff) only for the debit
//!   or a refund, and never across a blockchain call
//! - every path that sends money on-chain first claims the withdrawal row
//!   with a NOWAIT lock and holds it across the gateway call, so a second
//!   sender observes "already being processed"
//! - lock order is escrow row, withdrawal row, user row

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::error::{PolicyViolation, WithdrawalError};
use super::policy::{PolicyCheck, PolicyGate};
use super::state::{RefundGuard, ensure_transition};
use super::{WithdrawalReceipt, WithdrawalRequest};
use crate::backoff::{LockConflict, LockRetryPolicy, retry_on_lock_conflict};
use crate::chain::BlockchainGateway;
use crate::config::WithdrawalConfig;
use crate::core_types::{AdminId, TransactionId, UserId};
use crate::fraud::FraudDetector;
use crate::models::{
    EscrowOperation, EscrowStatus, GlobalSettings, NewTransaction, Transaction, TransactionStatus,
};
use crate::money::service_fee;
use crate::notify::{AdminAlert, Notifier, UserNotice};
use crate::settings::SettingsProvider;
use crate::store::{LedgerStore, LedgerTx, LockMode, StoreError, WithdrawalPage, WithdrawalQuery};

/// Lifetime withdrawals may not exceed this multiple of confirmed deposits
/// for a request to be auto-approved
const AUTO_WITHDRAWAL_DEPOSIT_MULTIPLE: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Rejection reason stored on an escrow closed by the user's cancel
const CANCELLED_BY_USER: &str = "withdrawal cancelled by user";

pub struct WithdrawalService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn BlockchainGateway>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<SettingsProvider>,
    gate: PolicyGate,
    config: WithdrawalConfig,
    lock_retry: LockRetryPolicy,
}

impl WithdrawalService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn BlockchainGateway>,
        notifier: Arc<dyn Notifier>,
        fraud: Arc<dyn FraudDetector>,
        settings: Arc<SettingsProvider>,
        config: WithdrawalConfig,
    ) -> Self {
        let gate = PolicyGate::new(
            store.clone(),
            fraud,
            config.emergency_stop,
            config.fraud_block_threshold,
        );
        let lock_retry = LockRetryPolicy::from(&config.lock_retry);
        Self {
            store,
            gateway,
            notifier,
            settings,
            gate,
            config,
            lock_retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub(crate) fn lock_retry(&self) -> &LockRetryPolicy {
        &self.lock_retry
    }

    // ========================================================================
    // Request
    // ========================================================================

    /// Gate, debit and record a withdrawal.
    ///
    /// An auto-approved receipt comes back `PROCESSING` without a hash; the
    /// caller hands it to [`Self::dispatch_auto_withdrawal`].
    pub async fn request_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalReceipt, WithdrawalError> {
        if request.amount <= Decimal::ZERO {
            return Err(WithdrawalError::InvalidAmount);
        }

        let settings = self.settings.current().await?;
        let user = self
            .store
            .get_user(request.user_id)
            .await?
            .ok_or(WithdrawalError::UserNotFound(request.user_id))?;

        let check = PolicyCheck {
            user: &user,
            amount: request.amount,
            available_balance: request.available_balance,
            settings: &settings,
        };
        let pass = match self.gate.evaluate(&check).await {
            Ok(pass) => pass,
            Err(e) => return Err(self.on_gate_rejection(request, e).await),
        };

        let to_address = user
            .wallet_address
            .clone()
            .ok_or(WithdrawalError::WalletMissing(user.id))?;
        if !self.gateway.validate_wallet_address(&to_address) {
            return Err(WithdrawalError::InvalidWallet(to_address));
        }

        let fee = service_fee(request.amount, settings.withdrawal_service_fee);
        let auto_allowed = settings.auto_withdrawal_enabled && pass.risk_score.is_some();

        let (transaction, auto_approved) =
            retry_on_lock_conflict(&self.lock_retry, "request_withdrawal", || {
                self.debit_and_record(&request, fee, &to_address, &settings, auto_allowed)
            })
            .await
            .map_err(|e| {
                if e.is_lock_conflict() {
                    warn!(user_id = request.user_id, "Withdrawal request gave up on busy user row");
                    WithdrawalError::Busy
                } else {
                    e
                }
            })?;

        info!(
            user_id = request.user_id,
            transaction_id = transaction.id,
            amount = %request.amount,
            fee = %fee,
            auto_approved,
            "Withdrawal requested"
        );

        self.notifier.notify_user(UserNotice::WithdrawalRequested {
            user_id: request.user_id,
            transaction_id: transaction.id,
            amount: request.amount,
            auto_approved,
        });
        if !auto_approved {
            self.notifier.alert_admins(AdminAlert::WithdrawalPending {
                transaction_id: transaction.id,
                user_id: request.user_id,
                amount: request.amount,
            });
        }

        Ok(WithdrawalReceipt {
            transaction,
            auto_approved,
        })
    }

    /// Apply the side effects a rejection calls for and hand the error back
    async fn on_gate_rejection(
        &self,
        request: WithdrawalRequest,
        err: WithdrawalError,
    ) -> WithdrawalError {
        match &err {
            WithdrawalError::Policy(PolicyViolation::RecoveryInProgress) => {
                match self.freeze_pending_withdrawals(request.user_id).await {
                    Ok(frozen) => warn!(
                        user_id = request.user_id,
                        frozen, "Recovery in progress, pending withdrawals frozen"
                    ),
                    Err(e) => error!(
                        user_id = request.user_id,
                        error = %e,
                        "Failed to freeze pending withdrawals during recovery"
                    ),
                }
            }
            WithdrawalError::Policy(PolicyViolation::FraudRisk { score }) => {
                if let Err(e) = self.flag_user_for_fraud(request.user_id, *score).await {
                    error!(user_id = request.user_id, error = %e, "Failed to flag user for fraud");
                }
            }
            WithdrawalError::Policy(v) => {
                warn!(
                    user_id = request.user_id,
                    amount = %request.amount,
                    code = v.code(),
                    "Withdrawal rejected by policy gate"
                );
            }
            _ => {}
        }
        err
    }

    async fn debit_and_record(
        &self,
        request: &WithdrawalRequest,
        fee: Decimal,
        to_address: &str,
        settings: &GlobalSettings,
        auto_allowed: bool,
    ) -> Result<(Transaction, bool), WithdrawalError> {
        let mut tx = self.store.begin().await?;
        let mut user = tx.lock_user(request.user_id, LockMode::NoWait).await?;

        // flags may have changed since the gate read the row
        if user.is_banned {
            return Err(PolicyViolation::Banned.into());
        }
        if user.withdrawal_blocked {
            return Err(PolicyViolation::WithdrawalBlocked.into());
        }
        if user.balance < request.amount {
            return Err(PolicyViolation::InsufficientBalance {
                requested: request.amount,
                available: user.balance,
            }
            .into());
        }

        let auto_approved = auto_allowed
            && self
                .auto_withdrawal_eligible(tx.as_mut(), request, settings)
                .await?;
        let status = if auto_approved {
            TransactionStatus::Processing
        } else {
            TransactionStatus::Pending
        };

        let balance_before = user.balance;
        user.balance -= request.amount;
        tx.update_user(&user).await?;
        let transaction = tx
            .insert_transaction(NewTransaction::withdrawal(
                request.user_id,
                request.amount,
                fee,
                balance_before,
                status,
                to_address.to_string(),
            ))
            .await?;
        tx.commit().await?;

        Ok((transaction, auto_approved))
    }

    /// 5x deposit rule plus the optional global daily ceiling
    async fn auto_withdrawal_eligible(
        &self,
        tx: &mut dyn LedgerTx,
        request: &WithdrawalRequest,
        settings: &GlobalSettings,
    ) -> Result<bool, WithdrawalError> {
        let exposure = tx.withdrawal_exposure(request.user_id).await?;
        let cap = exposure.confirmed_deposits * AUTO_WITHDRAWAL_DEPOSIT_MULTIPLE;
        if exposure.lifetime_withdrawn + request.amount > cap {
            info!(
                user_id = request.user_id,
                lifetime_withdrawn = %exposure.lifetime_withdrawn,
                confirmed_deposits = %exposure.confirmed_deposits,
                "Auto-withdrawal denied by deposit multiple rule"
            );
            return Ok(false);
        }

        if let Some(limit) = settings.daily_withdrawal_limit {
            let today = tx.daily_withdrawal_total(Utc::now().date_naive()).await?;
            if today + request.amount > limit {
                warn!(
                    today = %today,
                    limit = %limit,
                    "Daily withdrawal ceiling reached, routing to manual approval"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ========================================================================
    // Cancel / reject / refund
    // ========================================================================

    /// Refund a PENDING withdrawal for its owner. An escrow still waiting
    /// on a second admin is closed as REJECTED in the same commit.
    pub async fn cancel_withdrawal(
        &self,
        transaction_id: TransactionId,
        user_id: UserId,
    ) -> Result<Transaction, WithdrawalError> {
        let withdrawal = retry_on_lock_conflict(&self.lock_retry, "cancel_withdrawal", || {
            self.cancel_once(transaction_id, user_id)
        })
        .await
        .map_err(|e| {
            if e.is_lock_conflict() {
                WithdrawalError::Busy
            } else {
                e
            }
        })?;

        info!(transaction_id, user_id, "Withdrawal cancelled by user");
        self.notifier.notify_user(UserNotice::WithdrawalRefunded {
            user_id: withdrawal.user_id,
            transaction_id,
            amount: withdrawal.amount,
        });
        Ok(withdrawal)
    }

    async fn cancel_once(
        &self,
        transaction_id: TransactionId,
        user_id: UserId,
    ) -> Result<Transaction, WithdrawalError> {
        let mut tx = self.store.begin().await?;

        let open_escrow = tx
            .pending_escrow_for(EscrowOperation::WithdrawalApproval, transaction_id)
            .await?;
        // a second admin holding the escrow row is paying this withdrawal out
        let escrow = match open_escrow {
            Some(found) => match tx.lock_escrow(found.id, LockMode::NoWait).await {
                Ok(locked) => Some(locked),
                Err(e) if e.is_lock_unavailable() => {
                    return Err(WithdrawalError::AlreadyProcessing(transaction_id));
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let withdrawal = self
            .refund_locked(tx.as_mut(), transaction_id, RefundGuard::PendingOwnedBy(user_id))
            .await?;

        if let Some(mut escrow) = escrow.filter(|e| e.status == EscrowStatus::Pending) {
            escrow.status = EscrowStatus::Rejected;
            escrow.rejection_reason = Some(CANCELLED_BY_USER.to_string());
            tx.update_escrow(&escrow).await?;
            info!(escrow_id = escrow.id, transaction_id, "Escrow closed, withdrawal cancelled by user");
        }
        tx.commit().await?;
        Ok(withdrawal)
    }

    pub async fn reject_withdrawal(
        &self,
        transaction_id: TransactionId,
        reason: Option<String>,
    ) -> Result<Transaction, WithdrawalError> {
        let withdrawal = self
            .refund_without_notice(transaction_id, RefundGuard::Unsent)
            .await?;
        info!(transaction_id, reason = ?reason, "Withdrawal rejected");
        self.notifier.notify_user(UserNotice::WithdrawalRejected {
            user_id: withdrawal.user_id,
            transaction_id,
            amount: withdrawal.amount,
            reason,
        });
        Ok(withdrawal)
    }

    /// Re-credit the user and mark the withdrawal FAILED, once.
    ///
    /// The guard is checked against the locked row, so repeating the call
    /// for the same id fails with `InvalidTransition` and changes nothing.
    pub async fn refund_and_fail(
        &self,
        transaction_id: TransactionId,
        guard: RefundGuard,
    ) -> Result<Transaction, WithdrawalError> {
        let withdrawal = self.refund_without_notice(transaction_id, guard).await?;
        self.notifier.notify_user(UserNotice::WithdrawalRefunded {
            user_id: withdrawal.user_id,
            transaction_id,
            amount: withdrawal.amount,
        });
        Ok(withdrawal)
    }

    async fn refund_without_notice(
        &self,
        transaction_id: TransactionId,
        guard: RefundGuard,
    ) -> Result<Transaction, WithdrawalError> {
        retry_on_lock_conflict(&self.lock_retry, "refund_and_fail", || async move {
            let mut tx = self.store.begin().await?;
            let refunded = self.refund_locked(tx.as_mut(), transaction_id, guard).await?;
            tx.commit().await?;
            Ok::<_, WithdrawalError>(refunded)
        })
        .await
        .map_err(|e| {
            if e.is_lock_conflict() {
                WithdrawalError::Busy
            } else {
                e
            }
        })
    }

    /// Refund inside a caller-owned unit of work
    pub(crate) async fn refund_locked(
        &self,
        tx: &mut dyn LedgerTx,
        transaction_id: TransactionId,
        guard: RefundGuard,
    ) -> Result<Transaction, WithdrawalError> {
        let mut withdrawal = lock_withdrawal(tx, transaction_id).await?;
        guard.check(&withdrawal)?;

        let mut user = tx.lock_user(withdrawal.user_id, LockMode::NoWait).await?;
        let balance_before = user.balance;
        user.balance += withdrawal.amount;
        tx.update_user(&user).await?;

        withdrawal.status = TransactionStatus::Failed;
        tx.update_transaction(&withdrawal).await?;
        tx.insert_transaction(NewTransaction::adjustment(
            withdrawal.user_id,
            withdrawal.amount,
            balance_before,
        ))
        .await?;

        info!(
            transaction_id,
            user_id = withdrawal.user_id,
            amount = %withdrawal.amount,
            balance_before = %balance_before,
            balance_after = %user.balance,
            "Withdrawal refunded"
        );
        Ok(withdrawal)
    }

    /// Refund every PENDING withdrawal of the user; returns how many
    pub async fn freeze_pending_withdrawals(&self, user_id: UserId) -> Result<usize, WithdrawalError> {
        let pending = self
            .store
            .list_withdrawals(&WithdrawalQuery {
                user_id: Some(user_id),
                status: Some(TransactionStatus::Pending),
                ..WithdrawalQuery::default()
            })
            .await?;

        let mut frozen = 0;
        for withdrawal in pending.items {
            match self
                .refund_and_fail(withdrawal.id, RefundGuard::Pending)
                .await
            {
                Ok(_) => frozen += 1,
                Err(e) => warn!(
                    transaction_id = withdrawal.id,
                    error = %e,
                    "Could not freeze pending withdrawal"
                ),
            }
        }
        Ok(frozen)
    }

    /// Set `suspicious` and `withdrawal_blocked` under the user row lock
    pub async fn flag_user_for_fraud(&self, user_id: UserId, risk_score: u8) -> Result<(), WithdrawalError> {
        retry_on_lock_conflict(&self.lock_retry, "flag_user_for_fraud", || async move {
            let mut tx = self.store.begin().await?;
            let mut user = tx.lock_user(user_id, LockMode::NoWait).await?;
            user.suspicious = true;
            user.withdrawal_blocked = true;
            tx.update_user(&user).await?;
            tx.commit().await?;
            Ok::<_, StoreError>(())
        })
        .await?;

        warn!(user_id, risk_score, "User flagged by fraud screening, withdrawals blocked");
        self.notifier
            .alert_admins(AdminAlert::FraudBlocked { user_id, risk_score });
        Ok(())
    }

    // ========================================================================
    // Approval & payout
    // ========================================================================

    /// Record a payout an admin already made; moves the withdrawal to
    /// PROCESSING with `tx_hash`. Never touches the balance.
    pub async fn approve_withdrawal(
        &self,
        transaction_id: TransactionId,
        tx_hash: String,
        admin_id: AdminId,
    ) -> Result<Transaction, WithdrawalError> {
        let mut tx = self.store.begin().await?;
        let withdrawal = self.claim_for_payout(tx.as_mut(), transaction_id).await?;
        let approved = self
            .approve_locked(tx.as_mut(), withdrawal, tx_hash, Some(admin_id))
            .await?;
        tx.commit().await?;
        self.notify_approved(&approved);
        Ok(approved)
    }

    /// Send the payout through the gateway, then approve.
    ///
    /// On a gateway error nothing is written and the withdrawal keeps its
    /// state.
    pub async fn approve_direct(
        &self,
        transaction_id: TransactionId,
        admin_id: AdminId,
    ) -> Result<Transaction, WithdrawalError> {
        let mut tx = self.store.begin().await?;
        let withdrawal = self.claim_for_payout(tx.as_mut(), transaction_id).await?;
        let tx_hash = self.send_payout(&withdrawal).await?;
        let approved = self
            .approve_locked(tx.as_mut(), withdrawal, tx_hash.clone(), Some(admin_id))
            .await?;
        if let Err(e) = tx.commit().await {
            self.report_unrecorded_payout(format!("withdrawal:{}", transaction_id), &tx_hash, &e);
            return Err(e.into());
        }
        self.notify_approved(&approved);
        Ok(approved)
    }

    /// Pay out an auto-approved withdrawal (PROCESSING, no hash yet).
    ///
    /// A gateway failure leaves it PROCESSING without a hash for manual
    /// approval and alerts the admins.
    pub async fn dispatch_auto_withdrawal(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Transaction, WithdrawalError> {
        let mut tx = self.store.begin().await?;
        let withdrawal = self.claim_for_payout(tx.as_mut(), transaction_id).await?;
        if withdrawal.status != TransactionStatus::Processing {
            return Err(WithdrawalError::InvalidTransition {
                from: withdrawal.status,
                to: TransactionStatus::Processing,
            });
        }

        let tx_hash = match self.send_payout(&withdrawal).await {
            Ok(hash) => hash,
            Err(e) => {
                drop(tx);
                error!(transaction_id, error = %e, "Auto-withdrawal dispatch failed");
                self.notifier.alert_admins(AdminAlert::AutoDispatchFailed {
                    transaction_id,
                    user_id: withdrawal.user_id,
                    amount: withdrawal.amount,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let approved = self
            .approve_locked(tx.as_mut(), withdrawal, tx_hash.clone(), None)
            .await?;
        if let Err(e) = tx.commit().await {
            self.report_unrecorded_payout(format!("withdrawal:{}", transaction_id), &tx_hash, &e);
            return Err(e.into());
        }
        self.notify_approved(&approved);
        Ok(approved)
    }

    /// Lock the withdrawal row for a payout and check it can still be paid
    pub(crate) async fn claim_for_payout(
        &self,
        tx: &mut dyn LedgerTx,
        transaction_id: TransactionId,
    ) -> Result<Transaction, WithdrawalError> {
        let withdrawal = lock_withdrawal(tx, transaction_id).await?;
        match withdrawal.status {
            TransactionStatus::Pending => Ok(withdrawal),
            TransactionStatus::Processing if withdrawal.tx_hash.is_none() => Ok(withdrawal),
            TransactionStatus::Processing => Err(WithdrawalError::AlreadySent(transaction_id)),
            from => Err(WithdrawalError::InvalidTransition {
                from,
                to: TransactionStatus::Processing,
            }),
        }
    }

    /// Gateway call for a claimed withdrawal
    pub(crate) async fn send_payout(&self, withdrawal: &Transaction) -> Result<String, WithdrawalError> {
        let to_address = withdrawal
            .to_address
            .as_deref()
            .ok_or(WithdrawalError::WalletMissing(withdrawal.user_id))?;
        let amount = if self.config.deduct_fee_on_chain {
            withdrawal.amount - withdrawal.fee
        } else {
            withdrawal.amount
        };
        let tx_hash = self.gateway.send_payment(to_address, amount).await?;
        info!(
            transaction_id = withdrawal.id,
            to = to_address,
            amount = %amount,
            tx_hash = %tx_hash,
            "Withdrawal payout sent"
        );
        Ok(tx_hash)
    }

    /// Store `tx_hash` and move to PROCESSING on a claimed row
    pub(crate) async fn approve_locked(
        &self,
        tx: &mut dyn LedgerTx,
        mut withdrawal: Transaction,
        tx_hash: String,
        admin_id: Option<AdminId>,
    ) -> Result<Transaction, WithdrawalError> {
        if withdrawal.tx_hash.is_some() {
            return Err(WithdrawalError::AlreadySent(withdrawal.id));
        }
        if withdrawal.status != TransactionStatus::Processing {
            ensure_transition(withdrawal.status, TransactionStatus::Processing)?;
        }
        withdrawal.status = TransactionStatus::Processing;
        withdrawal.tx_hash = Some(tx_hash);
        tx.update_transaction(&withdrawal).await?;
        info!(
            transaction_id = withdrawal.id,
            admin_id = ?admin_id,
            tx_hash = ?withdrawal.tx_hash,
            "Withdrawal approved"
        );
        Ok(withdrawal)
    }

    pub(crate) fn notify_approved(&self, withdrawal: &Transaction) {
        if let Some(tx_hash) = &withdrawal.tx_hash {
            self.notifier.notify_user(UserNotice::WithdrawalApproved {
                user_id: withdrawal.user_id,
                transaction_id: withdrawal.id,
                amount: withdrawal.amount,
                tx_hash: tx_hash.clone(),
            });
        }
    }

    /// Money left the wallet but the ledger write failed
    pub(crate) fn report_unrecorded_payout(&self, reference: String, tx_hash: &str, err: &dyn std::fmt::Display) {
        error!(
            reference = %reference,
            tx_hash,
            error = %err,
            "Payout sent on-chain but ledger commit failed, manual reconciliation required"
        );
        self.notifier.alert_admins(AdminAlert::PayoutNotRecorded {
            reference,
            tx_hash: tx_hash.to_string(),
            error: err.to_string(),
        });
    }

    /// PROCESSING -> CONFIRMED after the chain confirmed the payout
    pub async fn mark_confirmed(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Transaction, WithdrawalError> {
        let mut tx = self.store.begin().await?;
        let mut withdrawal = lock_withdrawal(tx.as_mut(), transaction_id).await?;
        ensure_transition(withdrawal.status, TransactionStatus::Confirmed)?;
        withdrawal.status = TransactionStatus::Confirmed;
        tx.update_transaction(&withdrawal).await?;
        tx.commit().await?;

        info!(
            transaction_id,
            user_id = withdrawal.user_id,
            tx_hash = ?withdrawal.tx_hash,
            "Withdrawal confirmed on-chain"
        );
        self.notifier.notify_user(UserNotice::WithdrawalConfirmed {
            user_id: withdrawal.user_id,
            transaction_id,
            amount: withdrawal.amount,
        });
        Ok(withdrawal)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_pending_withdrawals(&self) -> Result<Vec<Transaction>, WithdrawalError> {
        let page = self
            .store
            .list_withdrawals(&WithdrawalQuery {
                status: Some(TransactionStatus::Pending),
                ..WithdrawalQuery::default()
            })
            .await?;
        Ok(page.items)
    }

    /// Auto-approved withdrawals whose payout never went out. These hold a
    /// debit and are paid with `approve_direct` or refunded with `reject`.
    pub async fn get_undispatched_withdrawals(&self) -> Result<Vec<Transaction>, WithdrawalError> {
        Ok(self
            .store
            .list_undispatched_withdrawals(None, i64::MAX)
            .await?)
    }

    /// `page` is 1-based
    pub async fn get_user_withdrawals(
        &self,
        user_id: UserId,
        page: u32,
        limit: u32,
    ) -> Result<WithdrawalPage, WithdrawalError> {
        let limit = i64::from(limit.max(1));
        let offset = i64::from(page.max(1) - 1) * limit;
        Ok(self
            .store
            .list_withdrawals(&WithdrawalQuery {
                user_id: Some(user_id),
                status: None,
                offset,
                limit,
            })
            .await?)
    }

    pub async fn get_withdrawal_by_id(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Transaction>, WithdrawalError> {
        Ok(self
            .store
            .get_transaction(transaction_id)
            .await?
            .filter(Transaction::is_withdrawal))
    }
}

/// NOWAIT lock on a withdrawal row; a held lock means someone is paying it
async fn lock_withdrawal(
    tx: &mut dyn LedgerTx,
    transaction_id: TransactionId,
) -> Result<Transaction, WithdrawalError> {
    match tx.lock_transaction(transaction_id, LockMode::NoWait).await {
        Ok(row) if row.is_withdrawal() => Ok(row),
        Ok(_) => Err(WithdrawalError::NotAWithdrawal(transaction_id)),
        Err(e) if e.is_lock_unavailable() => Err(WithdrawalError::AlreadyProcessing(transaction_id)),
        Err(StoreError::NotFound { .. }) => Err(WithdrawalError::NotFound(transaction_id)),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockGateway;
    use crate::fraud::StaticFraudDetector;
    use crate::models::User;
    use crate::notify::MemoryNotifier;
    use crate::store::MemoryLedgerStore;
    use std::time::Duration;

    const WALLET: &str = "0x1111111111111111111111111111111111111111";

    struct Fixture {
        store: Arc<MemoryLedgerStore>,
        gateway: Arc<MockGateway>,
        notifier: Arc<MemoryNotifier>,
        settings: Arc<SettingsProvider>,
        service: WithdrawalService,
    }

    fn fixture(config: WithdrawalConfig) -> Fixture {
        let store = Arc::new(MemoryLedgerStore::new());
        let gateway = Arc::new(MockGateway::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let settings = Arc::new(SettingsProvider::new(store.clone(), Duration::from_secs(30)));
        let service = WithdrawalService::new(
            store.clone(),
            gateway.clone(),
            notifier.clone(),
            Arc::new(StaticFraudDetector::new()),
            settings.clone(),
            config,
        );
        Fixture {
            store,
            gateway,
            notifier,
            settings,
            service,
        }
    }

    fn request(user_id: UserId, amount: i64, available: i64) -> WithdrawalRequest {
        WithdrawalRequest {
            user_id,
            amount: Decimal::from(amount),
            available_balance: Decimal::from(available),
        }
    }

    #[tokio::test]
    async fn test_request_debits_and_records_pending() {
        let f = fixture(WithdrawalConfig::default());
        f.store
            .insert_user(User::new(1, Decimal::from(100)).with_wallet(WALLET));

        let receipt = f.service.request_withdrawal(request(1, 40, 100)).await.unwrap();
        assert!(!receipt.auto_approved);
        assert_eq!(receipt.transaction.status, TransactionStatus::Pending);
        assert_eq!(receipt.transaction.balance_before, Decimal::from(100));
        assert_eq!(receipt.transaction.balance_after, Decimal::from(60));
        assert_eq!(f.store.user(1).unwrap().balance, Decimal::from(60));
        assert!(matches!(
            f.notifier.admin_alerts()[0],
            AdminAlert::WithdrawalPending { .. }
        ));
    }

    #[tokio::test]
    async fn test_fee_recorded_gross_debited() {
        let f = fixture(WithdrawalConfig::default());
        f.store
            .insert_user(User::new(1, Decimal::from(100)).with_wallet(WALLET));
        f.settings
            .update(&GlobalSettings {
                withdrawal_service_fee: Decimal::new(15, 1),
                ..GlobalSettings::default()
            })
            .await
            .unwrap();

        let receipt = f.service.request_withdrawal(request(1, 40, 100)).await.unwrap();
        assert_eq!(receipt.transaction.fee, Decimal::new(60, 2));
        assert_eq!(f.store.user(1).unwrap().balance, Decimal::from(60));
    }

    #[tokio::test]
    async fn test_missing_wallet_leaves_balance() {
        let f = fixture(WithdrawalConfig::default());
        f.store.insert_user(User::new(1, Decimal::from(100)));

        let err = f.service.request_withdrawal(request(1, 40, 100)).await.unwrap_err();
        assert!(matches!(err, WithdrawalError::WalletMissing(1)));
        assert_eq!(f.store.user(1).unwrap().balance, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_stale_available_balance_rechecked_under_lock() {
        let f = fixture(WithdrawalConfig::default());
        f.store
            .insert_user(User::new(1, Decimal::from(30)).with_wallet(WALLET));

        let err = f.service.request_withdrawal(request(1, 40, 100)).await.unwrap_err();
        assert!(matches!(
            err,
            WithdrawalError::Policy(PolicyViolation::InsufficientBalance { .. })
        ));
        assert_eq!(f.store.user(1).unwrap().balance, Decimal::from(30));
    }

    #[tokio::test]
    async fn test_approve_direct_sends_net_when_configured() {
        let f = fixture(WithdrawalConfig {
            deduct_fee_on_chain: true,
            ..WithdrawalConfig::default()
        });
        f.store
            .insert_user(User::new(1, Decimal::from(100)).with_wallet(WALLET));
        f.settings
            .update(&GlobalSettings {
                withdrawal_service_fee: Decimal::from(10),
                ..GlobalSettings::default()
            })
            .await
            .unwrap();
        let receipt = f.service.request_withdrawal(request(1, 50, 100)).await.unwrap();

        let approved = f
            .service
            .approve_direct(receipt.transaction.id, 7)
            .await
            .unwrap();
        assert_eq!(approved.status, TransactionStatus::Processing);
        assert!(approved.tx_hash.is_some());
        assert_eq!(f.gateway.sent()[0].amount, Decimal::from(45));
    }

    #[tokio::test]
    async fn test_approve_direct_chain_failure_keeps_pending() {
        let f = fixture(WithdrawalConfig::default());
        f.store
            .insert_user(User::new(1, Decimal::from(100)).with_wallet(WALLET));
        let receipt = f.service.request_withdrawal(request(1, 50, 100)).await.unwrap();

        f.gateway.fail_next_sends(1);
        let err = f
            .service
            .approve_direct(receipt.transaction.id, 7)
            .await
            .unwrap_err();
        assert!(matches!(err, WithdrawalError::Chain(_)));

        let row = f
            .service
            .get_withdrawal_by_id(receipt.transaction.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TransactionStatus::Pending);
        assert!(row.tx_hash.is_none());
        assert_eq!(f.store.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_mark_confirmed_requires_processing() {
        let f = fixture(WithdrawalConfig::default());
        f.store
            .insert_user(User::new(1, Decimal::from(100)).with_wallet(WALLET));
        let receipt = f.service.request_withdrawal(request(1, 50, 100)).await.unwrap();
        let id = receipt.transaction.id;

        assert!(matches!(
            f.service.mark_confirmed(id).await,
            Err(WithdrawalError::InvalidTransition { .. })
        ));

        f.service.approve_withdrawal(id, "0xabc".into(), 7).await.unwrap();
        let confirmed = f.service.mark_confirmed(id).await.unwrap();
        assert_eq!(confirmed.status, TransactionStatus::Confirmed);
        assert_eq!(f.store.user(1).unwrap().balance, Decimal::from(50));
    }

    #[tokio::test]
    async fn test_approve_twice_is_already_sent() {
        let f = fixture(WithdrawalConfig::default());
        f.store
            .insert_user(User::new(1, Decimal::from(100)).with_wallet(WALLET));
        let id = f
            .service
            .request_withdrawal(request(1, 50, 100))
            .await
            .unwrap()
            .transaction
            .id;

        f.service.approve_withdrawal(id, "0xabc".into(), 7).await.unwrap();
        assert!(matches!(
            f.service.approve_withdrawal(id, "0xdef".into(), 7).await,
            Err(WithdrawalError::AlreadySent(_))
        ));
        assert!(matches!(
            f.service.approve_direct(id, 7).await,
            Err(WithdrawalError::AlreadySent(_))
        ));
        assert_eq!(f.gateway.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_reject_refunds_and_writes_adjustment() {
        let f = fixture(WithdrawalConfig::default());
        f.store
            .insert_user(User::new(1, Decimal::from(100)).with_wallet(WALLET));
        let id = f
            .service
            .request_withdrawal(request(1, 50, 100))
            .await
            .unwrap()
            .transaction
            .id;

        let rejected = f
            .service
            .reject_withdrawal(id, Some("address flagged".into()))
            .await
            .unwrap();
        assert_eq!(rejected.status, TransactionStatus::Failed);
        assert_eq!(f.store.user(1).unwrap().balance, Decimal::from(100));

        let rows = f.store.transactions_for(1);
        let adjustment = rows
            .iter()
            .find(|t| t.tx_type == crate::models::TransactionType::Adjustment)
            .unwrap();
        assert_eq!(adjustment.amount, Decimal::from(50));
        assert_eq!(adjustment.status, TransactionStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_user_withdrawals_paged() {
        let f = fixture(WithdrawalConfig::default());
        f.store
            .insert_user(User::new(1, Decimal::from(100)).with_wallet(WALLET));
        for _ in 0..3 {
            f.service.request_withdrawal(request(1, 10, 100)).await.unwrap();
        }

        let first = f.service.get_user_withdrawals(1, 1, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.total, 3);
        let second = f.service.get_user_withdrawals(1, 2, 2).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(f.service.get_pending_withdrawals().await.unwrap().len(), 3);
    }
}
