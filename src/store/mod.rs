//! Ledger Store
//!
//! Transactional row store behind every balance-affecting operation.
//!
//! # Contract
//!
//! - [`LedgerStore::begin`] opens a unit of work. Everything written through
//!   the returned [`LedgerTx`] becomes visible atomically on
//!   [`LedgerTx::commit`]; dropping the handle without committing rolls back.
//! - `lock_*` methods take an exclusive row lock held until commit/rollback.
//!   With [`LockMode::NoWait`] a contended row fails fast with
//!   [`StoreError::LockUnavailable`] instead of blocking.
//! - Read methods on [`LedgerStore`] see committed data only and take no locks.
//!
//! Two implementations ship with the crate: [`PgLedgerStore`] (production)
//! and [`MemoryLedgerStore`] (tests, local runs).

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::StoreError;
pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::core_types::{EarningId, EscrowId, RetryId, TransactionId, UserId};
use crate::models::{
    AdminActionEscrow, DailyBalanceSnapshot, EscrowOperation, GlobalSettings, LedgerTotals,
    NewEscrow, NewPaymentRetry, NewTransaction, PaymentRetry, PaymentType, RetryStats,
    Transaction, TransactionStatus, User, WithdrawalExposure,
};

/// Row lock acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// `FOR UPDATE NOWAIT`: fail immediately if the row is locked
    NoWait,
    /// `FOR UPDATE`: wait for the current holder
    Wait,
}

/// Filter for withdrawal listings
#[derive(Debug, Clone, Default)]
pub struct WithdrawalQuery {
    pub user_id: Option<UserId>,
    pub status: Option<TransactionStatus>,
    /// 0-based row offset
    pub offset: i64,
    pub limit: i64,
}

/// One page of withdrawals plus the unpaged total
#[derive(Debug, Clone, Default)]
pub struct WithdrawalPage {
    pub items: Vec<Transaction>,
    pub total: i64,
}

/// An open unit of work
#[async_trait]
pub trait LedgerTx: Send {
    // --- users ---

    async fn lock_user(&mut self, user_id: UserId, mode: LockMode) -> Result<User, StoreError>;

    /// Persist balance and flag columns of a user locked in this transaction
    async fn update_user(&mut self, user: &User) -> Result<(), StoreError>;

    // --- transactions ---

    async fn lock_transaction(
        &mut self,
        id: TransactionId,
        mode: LockMode,
    ) -> Result<Transaction, StoreError>;

    async fn insert_transaction(&mut self, new: NewTransaction)
    -> Result<Transaction, StoreError>;

    /// Persist `status` and `tx_hash`; bumps `updated_at`
    async fn update_transaction(&mut self, tx: &Transaction) -> Result<(), StoreError>;

    async fn withdrawal_exposure(&mut self, user_id: UserId)
    -> Result<WithdrawalExposure, StoreError>;

    /// Pending + processing + confirmed withdrawals created on `day` (UTC)
    async fn daily_withdrawal_total(&mut self, day: NaiveDate) -> Result<Decimal, StoreError>;

    // --- escrows ---

    async fn lock_escrow(
        &mut self,
        id: EscrowId,
        mode: LockMode,
    ) -> Result<AdminActionEscrow, StoreError>;

    async fn pending_escrow_for(
        &mut self,
        operation: EscrowOperation,
        target_id: i64,
    ) -> Result<Option<AdminActionEscrow>, StoreError>;

    async fn insert_escrow(&mut self, new: NewEscrow) -> Result<AdminActionEscrow, StoreError>;

    async fn update_escrow(&mut self, escrow: &AdminActionEscrow) -> Result<(), StoreError>;

    // --- payment retries ---

    async fn lock_retry(&mut self, id: RetryId, mode: LockMode)
    -> Result<PaymentRetry, StoreError>;

    /// The unresolved record for `(user_id, payment_type)`, locked
    async fn lock_open_retry(
        &mut self,
        user_id: UserId,
        payment_type: PaymentType,
    ) -> Result<Option<PaymentRetry>, StoreError>;

    async fn insert_retry(&mut self, new: NewPaymentRetry) -> Result<PaymentRetry, StoreError>;

    async fn update_retry(&mut self, retry: &PaymentRetry) -> Result<(), StoreError>;

    /// Flag earning rows as paid; returns how many rows changed
    async fn mark_earnings_paid(
        &mut self,
        payment_type: PaymentType,
        ids: &[EarningId],
    ) -> Result<u64, StoreError>;

    // --- reconciliation ---

    async fn upsert_snapshot(&mut self, snapshot: &DailyBalanceSnapshot)
    -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Entry point and lock-free reads
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    /// Newest first
    async fn list_withdrawals(&self, query: &WithdrawalQuery)
    -> Result<WithdrawalPage, StoreError>;

    /// `processing` withdrawals with a `tx_hash`, optionally only those last
    /// touched before `updated_before`. Oldest first.
    async fn list_processing_withdrawals(
        &self,
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// `processing` withdrawals still without a `tx_hash`: debited and
    /// auto-approved but never paid out. Oldest first.
    async fn list_undispatched_withdrawals(
        &self,
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn has_active_finpass_recovery(&self, user_id: UserId) -> Result<bool, StoreError>;

    /// Get-or-create the singleton settings row
    async fn load_settings(&self) -> Result<GlobalSettings, StoreError>;

    async fn save_settings(&self, settings: &GlobalSettings) -> Result<(), StoreError>;

    async fn get_escrow(&self, id: EscrowId) -> Result<Option<AdminActionEscrow>, StoreError>;

    async fn find_pending_escrow(
        &self,
        operation: EscrowOperation,
        target_id: i64,
    ) -> Result<Option<AdminActionEscrow>, StoreError>;

    /// PENDING escrows of one operation type, oldest first
    async fn list_pending_escrows(
        &self,
        operation: EscrowOperation,
    ) -> Result<Vec<AdminActionEscrow>, StoreError>;

    /// PENDING escrows with `expires_at < now`
    async fn list_expired_escrows(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AdminActionEscrow>, StoreError>;

    async fn get_retry(&self, id: RetryId) -> Result<Option<PaymentRetry>, StoreError>;

    /// Unresolved, non-DLQ retries with `next_retry_at <= now`, oldest first
    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRetry>, StoreError>;

    async fn list_dlq_retries(&self) -> Result<Vec<PaymentRetry>, StoreError>;

    async fn retry_stats(&self) -> Result<RetryStats, StoreError>;

    async fn ledger_totals(&self) -> Result<LedgerTotals, StoreError>;

    async fn get_snapshot(&self, date: NaiveDate)
    -> Result<Option<DailyBalanceSnapshot>, StoreError>;
}
