use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::RetryError;
use crate::backoff::{LockRetryPolicy, retry_on_lock_conflict};
use crate::chain::BlockchainGateway;
use crate::config::RetryConfig;
use crate::core_types::{EarningId, RetryId, UserId};
use crate::models::{NewPaymentRetry, NewTransaction, PaymentRetry, PaymentType, RetryStats};
use crate::notify::{AdminAlert, Notifier};
use crate::store::{LedgerStore, LedgerTx, LockMode, StoreError};

/// A failed payout to queue
#[derive(Debug, Clone)]
pub struct NewRetry {
    pub user_id: UserId,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub earning_ids: Vec<EarningId>,
    pub error: String,
}

/// Outcome counts of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweepReport {
    pub resolved: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Locked by another worker or no longer due
    pub skipped: usize,
    pub errors: usize,
}

enum AttemptOutcome {
    Resolved,
    Rescheduled,
    DeadLettered,
    Skipped,
}

pub struct PaymentRetryEngine {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn BlockchainGateway>,
    notifier: Arc<dyn Notifier>,
    config: RetryConfig,
    lock_retry: LockRetryPolicy,
}

impl PaymentRetryEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn BlockchainGateway>,
        notifier: Arc<dyn Notifier>,
        config: RetryConfig,
        lock_retry: LockRetryPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            config,
            lock_retry,
        }
    }

    /// Queue a failed payout, merging into the open record for the same
    /// user and payment type when there is one
    pub async fn create_retry_record(&self, new: NewRetry) -> Result<PaymentRetry, RetryError> {
        if new.amount <= Decimal::ZERO {
            return Err(RetryError::InvalidAmount);
        }
        retry_on_lock_conflict(&self.lock_retry, "create_retry_record", || {
            self.upsert_open_record(&new)
        })
        .await
    }

    async fn upsert_open_record(&self, new: &NewRetry) -> Result<PaymentRetry, RetryError> {
        let mut tx = self.store.begin().await?;
        let open = tx
            .lock_open_retry(new.user_id, new.payment_type)
            .await?
            .filter(|r| !r.resolved);

        let record = match open {
            Some(mut retry) => {
                retry.amount += new.amount;
                for id in &new.earning_ids {
                    if !retry.earning_ids.contains(id) {
                        retry.earning_ids.push(*id);
                    }
                }
                retry.last_error = Some(new.error.clone());
                tx.update_retry(&retry).await?;
                info!(
                    retry_id = retry.id,
                    user_id = new.user_id,
                    payment_type = %new.payment_type,
                    added = %new.amount,
                    total = %retry.amount,
                    "Payout failure merged into open retry record"
                );
                retry
            }
            None => {
                let retry = match tx
                    .insert_retry(NewPaymentRetry {
                        user_id: new.user_id,
                        amount: new.amount,
                        payment_type: new.payment_type,
                        earning_ids: new.earning_ids.clone(),
                        max_retries: self.config.max_retries,
                        next_retry_at: Utc::now()
                            + Duration::seconds(self.config.initial_delay_secs),
                        last_error: Some(new.error.clone()),
                    })
                    .await
                {
                    Ok(r) => r,
                    // a concurrent insert won the open-record slot; surface as
                    // a lock conflict so the merge is retried
                    Err(StoreError::Conflict(msg)) => {
                        return Err(StoreError::LockUnavailable(msg).into());
                    }
                    Err(e) => return Err(e.into()),
                };
                info!(
                    retry_id = retry.id,
                    user_id = new.user_id,
                    payment_type = %new.payment_type,
                    amount = %new.amount,
                    error = %new.error,
                    "Payout failure queued for retry"
                );
                retry
            }
        };
        tx.commit().await?;
        Ok(record)
    }

    pub async fn process_pending_retries(&self) -> Result<RetrySweepReport, RetryError> {
        self.process_pending_retries_at(Utc::now()).await
    }

    /// Attempt every record due at `now`, each in its own unit of work
    pub async fn process_pending_retries_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RetrySweepReport, RetryError> {
        let due = self
            .store
            .list_due_retries(now, self.config.batch_size)
            .await?;
        let mut report = RetrySweepReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        debug!(count = due.len(), "Processing due payment retries");

        for retry in due {
            match self.attempt(retry.id, now, false).await {
                Ok(AttemptOutcome::Resolved) => report.resolved += 1,
                Ok(AttemptOutcome::Rescheduled) => report.rescheduled += 1,
                Ok(AttemptOutcome::DeadLettered) => report.dead_lettered += 1,
                Ok(AttemptOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(retry_id = retry.id, error = %e, "Payment retry attempt failed");
                }
            }
        }

        info!(
            resolved = report.resolved,
            rescheduled = report.rescheduled,
            dead_lettered = report.dead_lettered,
            skipped = report.skipped,
            errors = report.errors,
            "Payment retry sweep finished"
        );
        Ok(report)
    }

    /// Run one attempt on a due record now
    pub async fn process_one(&self, retry_id: RetryId) -> Result<PaymentRetry, RetryError> {
        self.attempt(retry_id, Utc::now(), false).await?;
        self.load(retry_id).await
    }

    /// Requeue a dead-lettered record with a fresh attempt budget and try
    /// it straight away
    pub async fn retry_dlq_item(&self, retry_id: RetryId) -> Result<PaymentRetry, RetryError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut retry = lock_retry_row(tx.as_mut(), retry_id).await?;
        if retry.resolved {
            return Err(RetryError::AlreadyResolved(retry_id));
        }
        if !retry.in_dlq {
            return Err(RetryError::NotInDlq(retry_id));
        }
        retry.attempt_count = 0;
        retry.in_dlq = false;
        retry.next_retry_at = Some(now);
        tx.update_retry(&retry).await?;
        tx.commit().await?;
        info!(retry_id, user_id = retry.user_id, amount = %retry.amount, "DLQ item requeued");

        self.attempt(retry_id, now, true).await?;
        self.load(retry_id).await
    }

    pub async fn get_dlq_items(&self) -> Result<Vec<PaymentRetry>, RetryError> {
        Ok(self.store.list_dlq_retries().await?)
    }

    pub async fn get_retry_stats(&self) -> Result<RetryStats, RetryError> {
        Ok(self.store.retry_stats().await?)
    }

    async fn load(&self, retry_id: RetryId) -> Result<PaymentRetry, RetryError> {
        self.store
            .get_retry(retry_id)
            .await?
            .ok_or(RetryError::NotFound(retry_id))
    }

    /// Backoff before the next attempt once `attempt_count` attempts failed
    fn next_delay(&self, attempt_count: i32) -> Duration {
        let exp = attempt_count.clamp(0, 20) as u32;
        Duration::seconds(self.config.base_delay_secs.saturating_mul(1i64 << exp))
    }

    /// One payout attempt. The retry row stays locked across the gateway
    /// call so two workers never pay the same record.
    async fn attempt(
        &self,
        retry_id: RetryId,
        now: DateTime<Utc>,
        manual: bool,
    ) -> Result<AttemptOutcome, RetryError> {
        let mut tx = self.store.begin().await?;
        let mut retry = match lock_retry_row(tx.as_mut(), retry_id).await {
            Ok(r) => r,
            Err(RetryError::AlreadyProcessing(_)) if !manual => return Ok(AttemptOutcome::Skipped),
            Err(e) => return Err(e),
        };
        if !retry.is_due(now) {
            return Ok(AttemptOutcome::Skipped);
        }

        retry.attempt_count += 1;
        let wallet = self
            .store
            .get_user(retry.user_id)
            .await?
            .and_then(|u| u.wallet_address);

        let sent = match wallet {
            Some(address) => match self.gateway.send_payment(&address, retry.amount).await {
                Ok(tx_hash) => Ok((tx_hash, address)),
                Err(e) => Err(e.to_string()),
            },
            None => Err(format!("User {} has no wallet address", retry.user_id)),
        };

        match sent {
            Ok((tx_hash, address)) => {
                self.record_success(tx, retry, tx_hash, address).await?;
                Ok(AttemptOutcome::Resolved)
            }
            Err(reason) => {
                let outcome = self.record_failure(tx.as_mut(), &mut retry, reason, now).await?;
                tx.commit().await?;
                if matches!(outcome, AttemptOutcome::DeadLettered) {
                    self.notifier.alert_admins(AdminAlert::PayoutInDlq {
                        retry_id,
                        user_id: retry.user_id,
                        amount: retry.amount,
                        payment_type: retry.payment_type,
                        last_error: retry.last_error.clone(),
                    });
                }
                Ok(outcome)
            }
        }
    }

    /// Resolve the record, mark the earnings paid, move the amount out of
    /// `pending_earnings` and write the ledger row, all in one commit
    async fn record_success(
        &self,
        mut tx: Box<dyn LedgerTx>,
        mut retry: PaymentRetry,
        tx_hash: String,
        to_address: String,
    ) -> Result<(), RetryError> {
        retry.resolved = true;
        retry.tx_hash = Some(tx_hash.clone());
        retry.next_retry_at = None;
        retry.last_error = None;

        let committed = match write_success(tx.as_mut(), &retry, &tx_hash, to_address).await {
            Ok(marked) => tx.commit().await.map(|_| marked),
            Err(e) => Err(e),
        };
        match committed {
            Ok(marked) => {
                info!(
                    retry_id = retry.id,
                    user_id = retry.user_id,
                    amount = %retry.amount,
                    attempt = retry.attempt_count,
                    earnings_marked = marked,
                    tx_hash = %tx_hash,
                    "Payment retry resolved"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    retry_id = retry.id,
                    tx_hash = %tx_hash,
                    error = %e,
                    "Payout sent on-chain but ledger commit failed, manual reconciliation required"
                );
                self.notifier.alert_admins(AdminAlert::PayoutNotRecorded {
                    reference: format!("payment_retry:{}", retry.id),
                    tx_hash,
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// The attempt that brings `attempt_count` to `max_retries` is still
    /// made; only its failure parks the record.
    async fn record_failure(
        &self,
        tx: &mut dyn LedgerTx,
        retry: &mut PaymentRetry,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, RetryError> {
        retry.last_error = Some(reason);
        let outcome = if retry.attempt_count >= retry.max_retries {
            retry.in_dlq = true;
            retry.next_retry_at = None;
            error!(
                retry_id = retry.id,
                user_id = retry.user_id,
                amount = %retry.amount,
                attempts = retry.attempt_count,
                last_error = ?retry.last_error,
                "Payout moved to dead-letter queue"
            );
            AttemptOutcome::DeadLettered
        } else {
            let delay = self.next_delay(retry.attempt_count);
            retry.next_retry_at = Some(now + delay);
            warn!(
                retry_id = retry.id,
                attempt = retry.attempt_count,
                max_retries = retry.max_retries,
                next_in_secs = delay.num_seconds(),
                last_error = ?retry.last_error,
                "Payout retry failed, rescheduled"
            );
            AttemptOutcome::Rescheduled
        };
        tx.update_retry(retry).await?;
        Ok(outcome)
    }
}

async fn write_success(
    tx: &mut dyn LedgerTx,
    retry: &PaymentRetry,
    tx_hash: &str,
    to_address: String,
) -> Result<u64, StoreError> {
    tx.update_retry(retry).await?;
    let marked = tx
        .mark_earnings_paid(retry.payment_type, &retry.earning_ids)
        .await?;
    let mut user = tx.lock_user(retry.user_id, LockMode::Wait).await?;
    user.pending_earnings = (user.pending_earnings - retry.amount).max(Decimal::ZERO);
    user.total_earned += retry.amount;
    tx.update_user(&user).await?;
    tx.insert_transaction(NewTransaction::payout(
        retry.user_id,
        retry.payment_type.transaction_type(),
        retry.amount,
        user.balance,
        tx_hash.to_string(),
        to_address,
    ))
    .await?;
    Ok(marked)
}

async fn lock_retry_row(tx: &mut dyn LedgerTx, retry_id: RetryId) -> Result<PaymentRetry, RetryError> {
    match tx.lock_retry(retry_id, LockMode::NoWait).await {
        Ok(r) => Ok(r),
        Err(StoreError::NotFound { .. }) => Err(RetryError::NotFound(retry_id)),
        Err(e) if e.is_lock_unavailable() => Err(RetryError::AlreadyProcessing(retry_id)),
        Err(e) => Err(e.into()),
    }
}
