//! In-memory Ledger Store
//!
//! Behaves like the Postgres store where it matters to the services:
//! - per-row exclusive locks owned by one open transaction (`NOWAIT` fails
//!   fast, `Wait` polls until the holder finishes or a timeout elapses)
//! - writes are staged inside the transaction and applied on commit only
//! - a dropped transaction releases its locks and discards its writes
//! - ids come from one shared sequence and are not reused after rollback

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::error::StoreError;
use super::{LedgerStore, LedgerTx, LockMode, WithdrawalPage, WithdrawalQuery};
use crate::core_types::{DepositId, EarningId, EscrowId, RetryId, TransactionId, UserId};
use crate::models::{
    AdminActionEscrow, CategoryTotal, DailyBalanceSnapshot, Deposit, Earning, EscrowOperation,
    EscrowStatus, GlobalSettings, LedgerTotals, NewEscrow, NewPaymentRetry, NewTransaction,
    PaymentRetry, PaymentType, RetryStats, Transaction, TransactionStatus, TransactionType, User,
    WithdrawalExposure,
};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(2);
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    User(UserId),
    Transaction(TransactionId),
    Escrow(EscrowId),
    Retry(RetryId),
}

#[derive(Default)]
struct MemoryState {
    users: BTreeMap<UserId, User>,
    transactions: BTreeMap<TransactionId, Transaction>,
    deposits: BTreeMap<DepositId, Deposit>,
    earnings: BTreeMap<EarningId, Earning>,
    escrows: BTreeMap<EscrowId, AdminActionEscrow>,
    retries: BTreeMap<RetryId, PaymentRetry>,
    snapshots: BTreeMap<NaiveDate, DailyBalanceSnapshot>,
    settings: Option<GlobalSettings>,
    recoveries: HashSet<UserId>,
    locks: HashMap<RowKey, u64>,
    next_id: i64,
    next_handle: u64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn release(&mut self, handle: u64) {
        self.locks.retain(|_, owner| *owner != handle);
    }
}

fn guard(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared in-memory ledger; clones share the same state
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        guard(&self.state)
    }

    // ------------------------------------------------------------------
    // Seeding & inspection (collaborators outside this core write these rows)
    // ------------------------------------------------------------------

    pub fn insert_user(&self, user: User) {
        self.state().users.insert(user.id, user);
    }

    pub fn user(&self, id: UserId) -> Option<User> {
        self.state().users.get(&id).cloned()
    }

    pub fn add_deposit(&self, user_id: UserId, amount: Decimal, status: TransactionStatus) -> DepositId {
        let mut s = self.state();
        let id = s.next_id();
        s.deposits.insert(
            id,
            Deposit {
                id,
                user_id,
                level: 1,
                amount,
                status,
                tx_hash: None,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn add_earning(&self, user_id: UserId, payment_type: PaymentType, amount: Decimal) -> EarningId {
        let mut s = self.state();
        let id = s.next_id();
        s.earnings.insert(
            id,
            Earning {
                id,
                user_id,
                payment_type,
                amount,
                paid: false,
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Mark an earning paid directly (payouts that never needed a retry)
    pub fn set_earning_paid(&self, id: EarningId) {
        if let Some(earning) = self.state().earnings.get_mut(&id) {
            earning.paid = true;
        }
    }

    pub fn earning(&self, id: EarningId) -> Option<Earning> {
        self.state().earnings.get(&id).cloned()
    }

    pub fn start_finpass_recovery(&self, user_id: UserId) {
        self.state().recoveries.insert(user_id);
    }

    pub fn finish_finpass_recovery(&self, user_id: UserId) {
        self.state().recoveries.remove(&user_id);
    }

    /// Write a ledger row directly, bypassing any balance logic
    pub fn seed_transaction(&self, new: NewTransaction) -> Transaction {
        let mut s = self.state();
        let id = s.next_id();
        let row = materialize_transaction(id, new, Utc::now());
        s.transactions.insert(id, row.clone());
        row
    }

    pub fn transactions_for(&self, user_id: UserId) -> Vec<Transaction> {
        self.state()
            .transactions
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Number of row locks currently held by open transactions
    pub fn held_locks(&self) -> usize {
        self.state().locks.len()
    }
}

fn materialize_transaction(id: TransactionId, new: NewTransaction, now: DateTime<Utc>) -> Transaction {
    Transaction {
        id,
        user_id: new.user_id,
        tx_type: new.tx_type,
        amount: new.amount,
        fee: new.fee,
        balance_before: new.balance_before,
        balance_after: new.balance_after,
        status: new.status,
        tx_hash: new.tx_hash,
        to_address: new.to_address,
        created_at: now,
        updated_at: now,
    }
}

fn is_live_withdrawal(t: &Transaction) -> bool {
    t.tx_type == TransactionType::Withdrawal
        && matches!(
            t.status,
            TransactionStatus::Pending | TransactionStatus::Processing | TransactionStatus::Confirmed
        )
}

fn add(total: &mut CategoryTotal, amount: Decimal) {
    total.count += 1;
    total.total += amount;
}

// ============================================================================
// Transaction handle
// ============================================================================

pub struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    handle: u64,
    users: HashMap<UserId, User>,
    transactions: BTreeMap<TransactionId, Transaction>,
    escrows: BTreeMap<EscrowId, AdminActionEscrow>,
    retries: BTreeMap<RetryId, PaymentRetry>,
    paid_earnings: Vec<EarningId>,
    snapshots: BTreeMap<NaiveDate, DailyBalanceSnapshot>,
    finished: bool,
}

impl MemoryTx {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        guard(&self.state)
    }

    async fn acquire(&self, key: RowKey, mode: LockMode) -> Result<(), StoreError> {
        let started = Instant::now();
        loop {
            {
                let mut s = self.state();
                match s.locks.get(&key) {
                    Some(owner) if *owner != self.handle => {}
                    _ => {
                        s.locks.insert(key, self.handle);
                        return Ok(());
                    }
                }
            }
            if mode == LockMode::NoWait || started.elapsed() >= LOCK_WAIT_TIMEOUT {
                return Err(StoreError::LockUnavailable(format!("{:?}", key)));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    fn merged_transactions(&self) -> BTreeMap<TransactionId, Transaction> {
        let mut merged = self.state().transactions.clone();
        for (id, t) in &self.transactions {
            merged.insert(*id, t.clone());
        }
        merged
    }

    fn merged_escrows(&self) -> BTreeMap<EscrowId, AdminActionEscrow> {
        let mut merged = self.state().escrows.clone();
        for (id, e) in &self.escrows {
            merged.insert(*id, e.clone());
        }
        merged
    }

    fn merged_retries(&self) -> BTreeMap<RetryId, PaymentRetry> {
        let mut merged = self.state().retries.clone();
        for (id, r) in &self.retries {
            merged.insert(*id, r.clone());
        }
        merged
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            let handle = self.handle;
            guard(&self.state).release(handle);
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_user(&mut self, user_id: UserId, mode: LockMode) -> Result<User, StoreError> {
        self.acquire(RowKey::User(user_id), mode).await?;
        if let Some(user) = self.users.get(&user_id) {
            return Ok(user.clone());
        }
        self.state()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("user", user_id))
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn lock_transaction(
        &mut self,
        id: TransactionId,
        mode: LockMode,
    ) -> Result<Transaction, StoreError> {
        self.acquire(RowKey::Transaction(id), mode).await?;
        if let Some(t) = self.transactions.get(&id) {
            return Ok(t.clone());
        }
        self.state()
            .transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("transaction", id))
    }

    async fn insert_transaction(
        &mut self,
        new: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let id = self.state().next_id();
        let row = materialize_transaction(id, new, Utc::now());
        self.transactions.insert(id, row.clone());
        Ok(row)
    }

    async fn update_transaction(&mut self, tx: &Transaction) -> Result<(), StoreError> {
        let mut row = tx.clone();
        row.updated_at = Utc::now();
        self.transactions.insert(row.id, row);
        Ok(())
    }

    async fn withdrawal_exposure(
        &mut self,
        user_id: UserId,
    ) -> Result<WithdrawalExposure, StoreError> {
        let lifetime_withdrawn = self
            .merged_transactions()
            .values()
            .filter(|t| t.user_id == user_id && is_live_withdrawal(t))
            .map(|t| t.amount)
            .sum();
        let confirmed_deposits = self
            .state()
            .deposits
            .values()
            .filter(|d| d.user_id == user_id && d.status == TransactionStatus::Confirmed)
            .map(|d| d.amount)
            .sum();
        Ok(WithdrawalExposure {
            lifetime_withdrawn,
            confirmed_deposits,
        })
    }

    async fn daily_withdrawal_total(&mut self, day: NaiveDate) -> Result<Decimal, StoreError> {
        Ok(self
            .merged_transactions()
            .values()
            .filter(|t| is_live_withdrawal(t) && t.created_at.date_naive() == day)
            .map(|t| t.amount)
            .sum())
    }

    async fn lock_escrow(
        &mut self,
        id: EscrowId,
        mode: LockMode,
    ) -> Result<AdminActionEscrow, StoreError> {
        self.acquire(RowKey::Escrow(id), mode).await?;
        if let Some(e) = self.escrows.get(&id) {
            return Ok(e.clone());
        }
        self.state()
            .escrows
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("escrow", id))
    }

    async fn pending_escrow_for(
        &mut self,
        operation: EscrowOperation,
        target_id: i64,
    ) -> Result<Option<AdminActionEscrow>, StoreError> {
        Ok(self.merged_escrows().into_values().find(|e| {
            e.operation_type == operation
                && e.target_id == target_id
                && e.status == EscrowStatus::Pending
        }))
    }

    async fn insert_escrow(&mut self, new: NewEscrow) -> Result<AdminActionEscrow, StoreError> {
        let id = self.state().next_id();
        let now = Utc::now();
        let escrow = AdminActionEscrow {
            id,
            operation_type: new.operation_type,
            target_id: new.target_id,
            operation_data: new.operation_data,
            initiator_admin_id: new.initiator_admin_id,
            approver_admin_id: None,
            rejected_by_admin_id: None,
            rejection_reason: None,
            status: EscrowStatus::Pending,
            expires_at: new.expires_at,
            created_at: now,
            updated_at: now,
        };
        self.escrows.insert(id, escrow.clone());
        Ok(escrow)
    }

    async fn update_escrow(&mut self, escrow: &AdminActionEscrow) -> Result<(), StoreError> {
        let mut row = escrow.clone();
        row.updated_at = Utc::now();
        self.escrows.insert(row.id, row);
        Ok(())
    }

    async fn lock_retry(
        &mut self,
        id: RetryId,
        mode: LockMode,
    ) -> Result<PaymentRetry, StoreError> {
        self.acquire(RowKey::Retry(id), mode).await?;
        if let Some(r) = self.retries.get(&id) {
            return Ok(r.clone());
        }
        self.state()
            .retries
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("payment_retry", id))
    }

    async fn lock_open_retry(
        &mut self,
        user_id: UserId,
        payment_type: PaymentType,
    ) -> Result<Option<PaymentRetry>, StoreError> {
        let open = self.merged_retries().into_values().find(|r| {
            r.user_id == user_id && r.payment_type == payment_type && !r.resolved
        });
        match open {
            Some(r) => Ok(Some(self.lock_retry(r.id, LockMode::Wait).await?)),
            None => Ok(None),
        }
    }

    async fn insert_retry(&mut self, new: NewPaymentRetry) -> Result<PaymentRetry, StoreError> {
        let id = self.state().next_id();
        let now = Utc::now();
        let retry = PaymentRetry {
            id,
            user_id: new.user_id,
            amount: new.amount,
            payment_type: new.payment_type,
            earning_ids: new.earning_ids,
            attempt_count: 0,
            max_retries: new.max_retries,
            next_retry_at: Some(new.next_retry_at),
            last_error: new.last_error,
            in_dlq: false,
            resolved: false,
            tx_hash: None,
            created_at: now,
            updated_at: now,
        };
        self.retries.insert(id, retry.clone());
        Ok(retry)
    }

    async fn update_retry(&mut self, retry: &PaymentRetry) -> Result<(), StoreError> {
        let mut row = retry.clone();
        row.updated_at = Utc::now();
        self.retries.insert(row.id, row);
        Ok(())
    }

    async fn mark_earnings_paid(
        &mut self,
        payment_type: PaymentType,
        ids: &[EarningId],
    ) -> Result<u64, StoreError> {
        let matching: Vec<EarningId> = {
            let s = self.state();
            ids.iter()
                .copied()
                .filter(|id| {
                    s.earnings
                        .get(id)
                        .is_some_and(|e| e.payment_type == payment_type && !e.paid)
                })
                .collect()
        };
        let mut changed = 0;
        for id in matching {
            if !self.paid_earnings.contains(&id) {
                self.paid_earnings.push(id);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn upsert_snapshot(
        &mut self,
        snapshot: &DailyBalanceSnapshot,
    ) -> Result<(), StoreError> {
        self.snapshots
            .insert(snapshot.snapshot_date, snapshot.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let users = std::mem::take(&mut self.users);
        let transactions = std::mem::take(&mut self.transactions);
        let escrows = std::mem::take(&mut self.escrows);
        let retries = std::mem::take(&mut self.retries);
        let paid = std::mem::take(&mut self.paid_earnings);
        let snapshots = std::mem::take(&mut self.snapshots);

        let mut s = guard(&self.state);
        s.users.extend(users);
        s.transactions.extend(transactions);
        s.escrows.extend(escrows);
        s.retries.extend(retries);
        for id in paid {
            if let Some(earning) = s.earnings.get_mut(&id) {
                earning.paid = true;
            }
        }
        for (date, mut snapshot) in snapshots {
            if let Some(existing) = s.snapshots.get(&date) {
                snapshot.created_at = existing.created_at;
            }
            s.snapshots.insert(date, snapshot);
        }
        s.release(self.handle);
        drop(s);
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        guard(&self.state).release(self.handle);
        self.finished = true;
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let handle = {
            let mut s = self.state();
            s.next_handle += 1;
            s.next_handle
        };
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            handle,
            users: HashMap::new(),
            transactions: BTreeMap::new(),
            escrows: BTreeMap::new(),
            retries: BTreeMap::new(),
            paid_earnings: Vec::new(),
            snapshots: BTreeMap::new(),
            finished: false,
        }))
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.user(user_id))
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        Ok(self.state().transactions.get(&id).cloned())
    }

    async fn list_withdrawals(
        &self,
        query: &WithdrawalQuery,
    ) -> Result<WithdrawalPage, StoreError> {
        let mut rows: Vec<Transaction> = self
            .state()
            .transactions
            .values()
            .filter(|t| t.tx_type == TransactionType::Withdrawal)
            .filter(|t| query.user_id.is_none_or(|u| t.user_id == u))
            .filter(|t| query.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = rows.len() as i64;
        let limit = if query.limit > 0 { query.limit as usize } else { rows.len() };
        let items = rows
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(limit)
            .collect();
        Ok(WithdrawalPage { items, total })
    }

    async fn list_processing_withdrawals(
        &self,
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut rows: Vec<Transaction> = self
            .state()
            .transactions
            .values()
            .filter(|t| {
                t.tx_type == TransactionType::Withdrawal
                    && t.status == TransactionStatus::Processing
                    && t.tx_hash.is_some()
                    && updated_before.is_none_or(|before| t.updated_at < before)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.updated_at, t.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_undispatched_withdrawals(
        &self,
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut rows: Vec<Transaction> = self
            .state()
            .transactions
            .values()
            .filter(|t| {
                t.tx_type == TransactionType::Withdrawal
                    && t.status == TransactionStatus::Processing
                    && t.tx_hash.is_none()
                    && updated_before.is_none_or(|before| t.updated_at < before)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.updated_at, t.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn has_active_finpass_recovery(&self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.state().recoveries.contains(&user_id))
    }

    async fn load_settings(&self) -> Result<GlobalSettings, StoreError> {
        Ok(self
            .state()
            .settings
            .get_or_insert_with(GlobalSettings::default)
            .clone())
    }

    async fn save_settings(&self, settings: &GlobalSettings) -> Result<(), StoreError> {
        self.state().settings = Some(settings.clone());
        Ok(())
    }

    async fn get_escrow(&self, id: EscrowId) -> Result<Option<AdminActionEscrow>, StoreError> {
        Ok(self.state().escrows.get(&id).cloned())
    }

    async fn find_pending_escrow(
        &self,
        operation: EscrowOperation,
        target_id: i64,
    ) -> Result<Option<AdminActionEscrow>, StoreError> {
        Ok(self
            .state()
            .escrows
            .values()
            .find(|e| {
                e.operation_type == operation
                    && e.target_id == target_id
                    && e.status == EscrowStatus::Pending
            })
            .cloned())
    }

    async fn list_pending_escrows(
        &self,
        operation: EscrowOperation,
    ) -> Result<Vec<AdminActionEscrow>, StoreError> {
        Ok(self
            .state()
            .escrows
            .values()
            .filter(|e| e.operation_type == operation && e.status == EscrowStatus::Pending)
            .cloned()
            .collect())
    }

    async fn list_expired_escrows(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AdminActionEscrow>, StoreError> {
        Ok(self
            .state()
            .escrows
            .values()
            .filter(|e| e.status == EscrowStatus::Pending && e.is_expired_at(now))
            .cloned()
            .collect())
    }

    async fn get_retry(&self, id: RetryId) -> Result<Option<PaymentRetry>, StoreError> {
        Ok(self.state().retries.get(&id).cloned())
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRetry>, StoreError> {
        let mut rows: Vec<PaymentRetry> = self
            .state()
            .retries
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.next_retry_at, r.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_dlq_retries(&self) -> Result<Vec<PaymentRetry>, StoreError> {
        Ok(self
            .state()
            .retries
            .values()
            .filter(|r| r.in_dlq && !r.resolved)
            .cloned()
            .collect())
    }

    async fn retry_stats(&self) -> Result<RetryStats, StoreError> {
        let mut stats = RetryStats::default();
        for r in self.state().retries.values() {
            if r.resolved {
                stats.resolved_count += 1;
                stats.resolved_amount += r.amount;
            } else if r.in_dlq {
                stats.dlq_count += 1;
                stats.dlq_amount += r.amount;
            } else {
                stats.pending_count += 1;
                stats.pending_amount += r.amount;
            }
        }
        Ok(stats)
    }

    async fn ledger_totals(&self) -> Result<LedgerTotals, StoreError> {
        let s = self.state();
        let mut totals = LedgerTotals::default();

        for d in s.deposits.values() {
            if d.status == TransactionStatus::Confirmed {
                add(&mut totals.confirmed_deposits, d.amount);
            }
        }
        for t in s.transactions.values() {
            if t.tx_type != TransactionType::Withdrawal {
                continue;
            }
            match t.status {
                TransactionStatus::Confirmed => add(&mut totals.confirmed_withdrawals, t.amount),
                TransactionStatus::Pending | TransactionStatus::Processing => {
                    add(&mut totals.in_flight_withdrawals, t.amount)
                }
                _ => {}
            }
        }
        for e in s.earnings.values() {
            if e.payment_type == PaymentType::ReferralEarning && e.paid {
                add(&mut totals.paid_referrals, e.amount);
            }
        }
        for u in s.users.values() {
            add(&mut totals.user_balances, u.balance);
            if u.pending_earnings > Decimal::ZERO {
                add(&mut totals.pending_earnings, u.pending_earnings);
            }
        }
        Ok(totals)
    }

    async fn get_snapshot(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DailyBalanceSnapshot>, StoreError> {
        Ok(self.state().snapshots.get(&date).cloned())
    }
}
