//! PostgreSQL Ledger Store
//!
//! Runtime-checked `sqlx` queries. Row locks are `SELECT ... FOR UPDATE
//! [NOWAIT]`; blocking waits are bounded by `lock_timeout`, which Postgres
//! reports with the same `55P03` SQLSTATE as NOWAIT.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::str::FromStr;

use super::error::StoreError;
use super::{LedgerStore, LedgerTx, LockMode, WithdrawalPage, WithdrawalQuery};
use crate::core_types::{EarningId, EscrowId, RetryId, TransactionId, UserId};
use crate::models::{
    AdminActionEscrow, CategoryTotal, DailyBalanceSnapshot, EscrowOperation, GlobalSettings,
    LedgerTotals, NewEscrow, NewPaymentRetry, NewTransaction, PaymentRetry, PaymentType,
    RetryStats, Transaction, User, WithdrawalExposure,
};

/// Upper bound for `LockMode::Wait` acquisitions
const LOCK_TIMEOUT: &str = "5s";

/// Recovery request states that still block withdrawals
const ACTIVE_RECOVERY_STATUSES: &str = "('pending', 'in_progress', 'approved')";

const USER_COLUMNS: &str = "id, balance, pending_earnings, total_earned, is_banned, \
    withdrawal_blocked, earnings_blocked, suspicious, finpass_attempts, \
    finpass_locked_until, wallet_address";

const TRANSACTION_COLUMNS: &str = "id, user_id, type, amount, fee, balance_before, \
    balance_after, status, tx_hash, to_address, created_at, updated_at";

const ESCROW_COLUMNS: &str = "id, operation_type, target_id, operation_data, \
    initiator_admin_id, approver_admin_id, rejected_by_admin_id, rejection_reason, \
    status, expires_at, created_at, updated_at";

const RETRY_COLUMNS: &str = "id, user_id, amount, payment_type, earning_ids, attempt_count, \
    max_retries, next_retry_at, last_error, in_dlq, resolved, tx_hash, created_at, updated_at";

const SNAPSHOT_COLUMNS: &str = "snapshot_date, expected_balance, actual_balance, discrepancy, \
    discrepancy_percent, reconciliation_status, reconciliation_report, created_at";

/// Statuses counted against withdrawal limits
const LIVE_WITHDRAWAL: &str =
    "type = 'withdrawal' AND status IN ('pending', 'processing', 'confirmed')";

fn lock_clause(mode: LockMode) -> &'static str {
    match mode {
        LockMode::NoWait => "FOR UPDATE NOWAIT",
        LockMode::Wait => "FOR UPDATE",
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(StoreError::Decode)
}

fn map_user(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        balance: row.try_get("balance")?,
        pending_earnings: row.try_get("pending_earnings")?,
        total_earned: row.try_get("total_earned")?,
        is_banned: row.try_get("is_banned")?,
        withdrawal_blocked: row.try_get("withdrawal_blocked")?,
        earnings_blocked: row.try_get("earnings_blocked")?,
        suspicious: row.try_get("suspicious")?,
        finpass_attempts: row.try_get("finpass_attempts")?,
        finpass_locked_until: row.try_get("finpass_locked_until")?,
        wallet_address: row.try_get("wallet_address")?,
    })
}

fn map_transaction(row: &PgRow) -> Result<Transaction, StoreError> {
    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        tx_type: parse_column(row, "type")?,
        amount: row.try_get("amount")?,
        fee: row.try_get("fee")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        status: parse_column(row, "status")?,
        tx_hash: row.try_get("tx_hash")?,
        to_address: row.try_get("to_address")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_escrow(row: &PgRow) -> Result<AdminActionEscrow, StoreError> {
    Ok(AdminActionEscrow {
        id: row.try_get("id")?,
        operation_type: parse_column(row, "operation_type")?,
        target_id: row.try_get("target_id")?,
        operation_data: row.try_get("operation_data")?,
        initiator_admin_id: row.try_get("initiator_admin_id")?,
        approver_admin_id: row.try_get("approver_admin_id")?,
        rejected_by_admin_id: row.try_get("rejected_by_admin_id")?,
        rejection_reason: row.try_get("rejection_reason")?,
        status: parse_column(row, "status")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_retry(row: &PgRow) -> Result<PaymentRetry, StoreError> {
    Ok(PaymentRetry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        payment_type: parse_column(row, "payment_type")?,
        earning_ids: row.try_get("earning_ids")?,
        attempt_count: row.try_get("attempt_count")?,
        max_retries: row.try_get("max_retries")?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        in_dlq: row.try_get("in_dlq")?,
        resolved: row.try_get("resolved")?,
        tx_hash: row.try_get("tx_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_snapshot(row: &PgRow) -> Result<DailyBalanceSnapshot, StoreError> {
    Ok(DailyBalanceSnapshot {
        snapshot_date: row.try_get("snapshot_date")?,
        expected_balance: row.try_get("expected_balance")?,
        actual_balance: row.try_get("actual_balance")?,
        discrepancy: row.try_get("discrepancy")?,
        discrepancy_percent: row.try_get("discrepancy_percent")?,
        reconciliation_status: parse_column(row, "reconciliation_status")?,
        reconciliation_report: row.try_get("reconciliation_report")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_settings(row: &PgRow) -> Result<GlobalSettings, StoreError> {
    Ok(GlobalSettings {
        emergency_stop_withdrawals: row.try_get("emergency_stop_withdrawals")?,
        emergency_stop_deposits: row.try_get("emergency_stop_deposits")?,
        emergency_stop_roi: row.try_get("emergency_stop_roi")?,
        min_withdrawal_amount: row.try_get("min_withdrawal_amount")?,
        daily_withdrawal_limit: row.try_get("daily_withdrawal_limit")?,
        auto_withdrawal_enabled: row.try_get("auto_withdrawal_enabled")?,
        withdrawal_service_fee: row.try_get("withdrawal_service_fee")?,
    })
}

fn map_category(row: &PgRow) -> Result<CategoryTotal, StoreError> {
    Ok(CategoryTotal {
        count: row.try_get("count")?,
        total: row.try_get("total")?,
    })
}

// ============================================================================
// Transaction handle
// ============================================================================

pub struct PgLedgerTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgLedgerTx {
    async fn lock_row(
        &mut self,
        table: &str,
        columns: &str,
        id: i64,
        mode: LockMode,
    ) -> Result<Option<PgRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1 {}",
            columns,
            table,
            lock_clause(mode)
        );
        Ok(sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?)
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_user(&mut self, user_id: UserId, mode: LockMode) -> Result<User, StoreError> {
        let row = self
            .lock_row("users", USER_COLUMNS, user_id, mode)
            .await?
            .ok_or_else(|| StoreError::not_found("user", user_id))?;
        map_user(&row)
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
            SET balance = $1, pending_earnings = $2, total_earned = $3,
                withdrawal_blocked = $4, earnings_blocked = $5, suspicious = $6
            WHERE id = $7
            "#,
        )
        .bind(user.balance)
        .bind(user.pending_earnings)
        .bind(user.total_earned)
        .bind(user.withdrawal_blocked)
        .bind(user.earnings_blocked)
        .bind(user.suspicious)
        .bind(user.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_transaction(
        &mut self,
        id: TransactionId,
        mode: LockMode,
    ) -> Result<Transaction, StoreError> {
        let row = self
            .lock_row("transactions", TRANSACTION_COLUMNS, id, mode)
            .await?
            .ok_or_else(|| StoreError::not_found("transaction", id))?;
        map_transaction(&row)
    }

    async fn insert_transaction(
        &mut self,
        new: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO transactions
                (user_id, type, amount, fee, balance_before, balance_after, status,
                 tx_hash, to_address, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(new.user_id)
            .bind(new.tx_type.as_str())
            .bind(new.amount)
            .bind(new.fee)
            .bind(new.balance_before)
            .bind(new.balance_after)
            .bind(new.status.as_str())
            .bind(&new.tx_hash)
            .bind(&new.to_address)
            .fetch_one(&mut *self.tx)
            .await?;
        map_transaction(&row)
    }

    async fn update_transaction(&mut self, tx: &Transaction) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE transactions SET status = $1, tx_hash = $2, updated_at = NOW() WHERE id = $3",
        )
        .bind(tx.status.as_str())
        .bind(&tx.tx_hash)
        .bind(tx.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn withdrawal_exposure(
        &mut self,
        user_id: UserId,
    ) -> Result<WithdrawalExposure, StoreError> {
        let sql = format!(
            "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE user_id = $1 AND {}",
            LIVE_WITHDRAWAL
        );
        let lifetime_withdrawn: Decimal = sqlx::query_scalar(&sql)
            .bind(user_id)
            .fetch_one(&mut *self.tx)
            .await?;
        let confirmed_deposits: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM deposits WHERE user_id = $1 AND status = 'confirmed'",
        )
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(WithdrawalExposure {
            lifetime_withdrawn,
            confirmed_deposits,
        })
    }

    async fn daily_withdrawal_total(&mut self, day: NaiveDate) -> Result<Decimal, StoreError> {
        let sql = format!(
            "SELECT COALESCE(SUM(amount), 0) FROM transactions \
             WHERE {} AND (created_at AT TIME ZONE 'UTC')::date = $1",
            LIVE_WITHDRAWAL
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(day)
            .fetch_one(&mut *self.tx)
            .await?)
    }

    async fn lock_escrow(
        &mut self,
        id: EscrowId,
        mode: LockMode,
    ) -> Result<AdminActionEscrow, StoreError> {
        let row = self
            .lock_row("admin_action_escrows", ESCROW_COLUMNS, id, mode)
            .await?
            .ok_or_else(|| StoreError::not_found("escrow", id))?;
        map_escrow(&row)
    }

    async fn pending_escrow_for(
        &mut self,
        operation: EscrowOperation,
        target_id: i64,
    ) -> Result<Option<AdminActionEscrow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM admin_action_escrows \
             WHERE operation_type = $1 AND target_id = $2 AND status = 'PENDING'",
            ESCROW_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(operation.as_str())
            .bind(target_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(map_escrow).transpose()
    }

    async fn insert_escrow(&mut self, new: NewEscrow) -> Result<AdminActionEscrow, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO admin_action_escrows
                (operation_type, target_id, operation_data, initiator_admin_id, status,
                 expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'PENDING', $5, NOW(), NOW())
            RETURNING {}
            "#,
            ESCROW_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(new.operation_type.as_str())
            .bind(new.target_id)
            .bind(&new.operation_data)
            .bind(new.initiator_admin_id)
            .bind(new.expires_at)
            .fetch_one(&mut *self.tx)
            .await?;
        map_escrow(&row)
    }

    async fn update_escrow(&mut self, escrow: &AdminActionEscrow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE admin_action_escrows
            SET status = $1, approver_admin_id = $2, rejected_by_admin_id = $3,
                rejection_reason = $4, updated_at = NOW()
            WHERE id = $5
            "#,
        )
        .bind(escrow.status.as_str())
        .bind(escrow.approver_admin_id)
        .bind(escrow.rejected_by_admin_id)
        .bind(&escrow.rejection_reason)
        .bind(escrow.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_retry(
        &mut self,
        id: RetryId,
        mode: LockMode,
    ) -> Result<PaymentRetry, StoreError> {
        let row = self
            .lock_row("payment_retries", RETRY_COLUMNS, id, mode)
            .await?
            .ok_or_else(|| StoreError::not_found("payment_retry", id))?;
        map_retry(&row)
    }

    async fn lock_open_retry(
        &mut self,
        user_id: UserId,
        payment_type: PaymentType,
    ) -> Result<Option<PaymentRetry>, StoreError> {
        let sql = format!(
            "SELECT {} FROM payment_retries \
             WHERE user_id = $1 AND payment_type = $2 AND resolved = FALSE \
             ORDER BY id LIMIT 1 FOR UPDATE",
            RETRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(payment_type.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(map_retry).transpose()
    }

    async fn insert_retry(&mut self, new: NewPaymentRetry) -> Result<PaymentRetry, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO payment_retries
                (user_id, amount, payment_type, earning_ids, attempt_count, max_retries,
                 next_retry_at, last_error, in_dlq, resolved, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7, FALSE, FALSE, NOW(), NOW())
            RETURNING {}
            "#,
            RETRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(new.user_id)
            .bind(new.amount)
            .bind(new.payment_type.as_str())
            .bind(&new.earning_ids)
            .bind(new.max_retries)
            .bind(new.next_retry_at)
            .bind(&new.last_error)
            .fetch_one(&mut *self.tx)
            .await?;
        map_retry(&row)
    }

    async fn update_retry(&mut self, retry: &PaymentRetry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE payment_retries
            SET amount = $1, earning_ids = $2, attempt_count = $3, next_retry_at = $4,
                last_error = $5, in_dlq = $6, resolved = $7, tx_hash = $8, updated_at = NOW()
            WHERE id = $9
            "#,
        )
        .bind(retry.amount)
        .bind(&retry.earning_ids)
        .bind(retry.attempt_count)
        .bind(retry.next_retry_at)
        .bind(&retry.last_error)
        .bind(retry.in_dlq)
        .bind(retry.resolved)
        .bind(&retry.tx_hash)
        .bind(retry.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn mark_earnings_paid(
        &mut self,
        payment_type: PaymentType,
        ids: &[EarningId],
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET paid = TRUE WHERE id = ANY($1) AND paid = FALSE",
            payment_type.earnings_table()
        );
        let result = sqlx::query(&sql)
            .bind(ids.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_snapshot(
        &mut self,
        snapshot: &DailyBalanceSnapshot,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO daily_balance_snapshots
                (snapshot_date, expected_balance, actual_balance, discrepancy,
                 discrepancy_percent, reconciliation_status, reconciliation_report, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (snapshot_date) DO UPDATE SET
                expected_balance = EXCLUDED.expected_balance,
                actual_balance = EXCLUDED.actual_balance,
                discrepancy = EXCLUDED.discrepancy,
                discrepancy_percent = EXCLUDED.discrepancy_percent,
                reconciliation_status = EXCLUDED.reconciliation_status,
                reconciliation_report = EXCLUDED.reconciliation_report
            "#,
        )
        .bind(snapshot.snapshot_date)
        .bind(snapshot.expected_balance)
        .bind(snapshot.actual_balance)
        .bind(snapshot.discrepancy)
        .bind(snapshot.discrepancy_percent)
        .bind(snapshot.reconciliation_status.as_str())
        .bind(&snapshot.reconciliation_report)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

/// Ledger store over a PostgreSQL pool
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn category(conn: &mut PgConnection, sql: &str) -> Result<CategoryTotal, StoreError> {
    let row = sqlx::query(sql).fetch_one(conn).await?;
    map_category(&row)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}'", LOCK_TIMEOUT))
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_user).transpose()
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_transaction).transpose()
    }

    async fn list_withdrawals(
        &self,
        query: &WithdrawalQuery,
    ) -> Result<WithdrawalPage, StoreError> {
        const FILTER: &str = "type = 'withdrawal' \
            AND ($1::BIGINT IS NULL OR user_id = $1) \
            AND ($2::TEXT IS NULL OR status = $2)";
        let status = query.status.map(|s| s.as_str());

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM transactions WHERE {}", FILTER))
                .bind(query.user_id)
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        let sql = format!(
            "SELECT {} FROM transactions WHERE {} \
             ORDER BY created_at DESC, id DESC OFFSET $3 LIMIT $4",
            TRANSACTION_COLUMNS, FILTER
        );
        let limit = if query.limit > 0 { Some(query.limit) } else { None };
        let rows = sqlx::query(&sql)
            .bind(query.user_id)
            .bind(status)
            .bind(query.offset.max(0))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let items = rows
            .iter()
            .map(map_transaction)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WithdrawalPage { items, total })
    }

    async fn list_processing_withdrawals(
        &self,
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let sql = format!(
            "SELECT {} FROM transactions \
             WHERE type = 'withdrawal' AND status = 'processing' AND tx_hash IS NOT NULL \
               AND ($1::TIMESTAMPTZ IS NULL OR updated_at < $1) \
             ORDER BY updated_at, id LIMIT $2",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(updated_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_transaction).collect()
    }

    async fn list_undispatched_withdrawals(
        &self,
        updated_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let sql = format!(
            "SELECT {} FROM transactions \
             WHERE type = 'withdrawal' AND status = 'processing' AND tx_hash IS NULL \
               AND ($1::TIMESTAMPTZ IS NULL OR updated_at < $1) \
             ORDER BY updated_at, id LIMIT $2",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(updated_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_transaction).collect()
    }

    async fn has_active_finpass_recovery(&self, user_id: UserId) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM financial_recovery_requests \
             WHERE user_id = $1 AND status IN {})",
            ACTIVE_RECOVERY_STATUSES
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn load_settings(&self) -> Result<GlobalSettings, StoreError> {
        sqlx::query("INSERT INTO global_settings (id) VALUES (1) ON CONFLICT (id) DO NOTHING")
            .execute(&self.pool)
            .await?;
        let row = sqlx::query(
            r#"
            SELECT emergency_stop_withdrawals, emergency_stop_deposits, emergency_stop_roi,
                   min_withdrawal_amount, daily_withdrawal_limit, auto_withdrawal_enabled,
                   withdrawal_service_fee
            FROM global_settings WHERE id = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        map_settings(&row)
    }

    async fn save_settings(&self, settings: &GlobalSettings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO global_settings
                (id, emergency_stop_withdrawals, emergency_stop_deposits, emergency_stop_roi,
                 min_withdrawal_amount, daily_withdrawal_limit, auto_withdrawal_enabled,
                 withdrawal_service_fee)
            VALUES (1, $1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                emergency_stop_withdrawals = EXCLUDED.emergency_stop_withdrawals,
                emergency_stop_deposits = EXCLUDED.emergency_stop_deposits,
                emergency_stop_roi = EXCLUDED.emergency_stop_roi,
                min_withdrawal_amount = EXCLUDED.min_withdrawal_amount,
                daily_withdrawal_limit = EXCLUDED.daily_withdrawal_limit,
                auto_withdrawal_enabled = EXCLUDED.auto_withdrawal_enabled,
                withdrawal_service_fee = EXCLUDED.withdrawal_service_fee
            "#,
        )
        .bind(settings.emergency_stop_withdrawals)
        .bind(settings.emergency_stop_deposits)
        .bind(settings.emergency_stop_roi)
        .bind(settings.min_withdrawal_amount)
        .bind(settings.daily_withdrawal_limit)
        .bind(settings.auto_withdrawal_enabled)
        .bind(settings.withdrawal_service_fee)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_escrow(&self, id: EscrowId) -> Result<Option<AdminActionEscrow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM admin_action_escrows WHERE id = $1",
            ESCROW_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_escrow).transpose()
    }

    async fn find_pending_escrow(
        &self,
        operation: EscrowOperation,
        target_id: i64,
    ) -> Result<Option<AdminActionEscrow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM admin_action_escrows \
             WHERE operation_type = $1 AND target_id = $2 AND status = 'PENDING'",
            ESCROW_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(operation.as_str())
            .bind(target_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_escrow).transpose()
    }

    async fn list_pending_escrows(
        &self,
        operation: EscrowOperation,
    ) -> Result<Vec<AdminActionEscrow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM admin_action_escrows \
             WHERE operation_type = $1 AND status = 'PENDING' ORDER BY created_at, id",
            ESCROW_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(operation.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_escrow).collect()
    }

    async fn list_expired_escrows(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AdminActionEscrow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM admin_action_escrows \
             WHERE status = 'PENDING' AND expires_at < $1 ORDER BY expires_at",
            ESCROW_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(map_escrow).collect()
    }

    async fn get_retry(&self, id: RetryId) -> Result<Option<PaymentRetry>, StoreError> {
        let sql = format!("SELECT {} FROM payment_retries WHERE id = $1", RETRY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_retry).transpose()
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRetry>, StoreError> {
        let sql = format!(
            "SELECT {} FROM payment_retries \
             WHERE resolved = FALSE AND in_dlq = FALSE AND next_retry_at <= $1 \
             ORDER BY next_retry_at, id LIMIT $2",
            RETRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_retry).collect()
    }

    async fn list_dlq_retries(&self) -> Result<Vec<PaymentRetry>, StoreError> {
        let sql = format!(
            "SELECT {} FROM payment_retries WHERE in_dlq = TRUE AND resolved = FALSE ORDER BY id",
            RETRY_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(map_retry).collect()
    }

    async fn retry_stats(&self) -> Result<RetryStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE NOT resolved AND NOT in_dlq) AS pending_count,
                COALESCE(SUM(amount) FILTER (WHERE NOT resolved AND NOT in_dlq), 0) AS pending_amount,
                COUNT(*) FILTER (WHERE NOT resolved AND in_dlq) AS dlq_count,
                COALESCE(SUM(amount) FILTER (WHERE NOT resolved AND in_dlq), 0) AS dlq_amount,
                COUNT(*) FILTER (WHERE resolved) AS resolved_count,
                COALESCE(SUM(amount) FILTER (WHERE resolved), 0) AS resolved_amount
            FROM payment_retries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(RetryStats {
            pending_count: row.try_get("pending_count")?,
            pending_amount: row.try_get("pending_amount")?,
            dlq_count: row.try_get("dlq_count")?,
            dlq_amount: row.try_get("dlq_amount")?,
            resolved_count: row.try_get("resolved_count")?,
            resolved_amount: row.try_get("resolved_amount")?,
        })
    }

    /// All six aggregates read one REPEATABLE READ snapshot, so a withdrawal
    /// committing mid-way cannot leave `users` without showing up in flight
    async fn ledger_totals(&self) -> Result<LedgerTotals, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let totals = LedgerTotals {
            confirmed_deposits: category(
                &mut *tx,
                "SELECT COUNT(*) AS count, COALESCE(SUM(amount), 0) AS total \
                 FROM deposits WHERE status = 'confirmed'",
            )
            .await?,
            confirmed_withdrawals: category(
                &mut *tx,
                "SELECT COUNT(*) AS count, COALESCE(SUM(amount), 0) AS total \
                 FROM transactions WHERE type = 'withdrawal' AND status = 'confirmed'",
            )
            .await?,
            paid_referrals: category(
                &mut *tx,
                "SELECT COUNT(*) AS count, COALESCE(SUM(amount), 0) AS total \
                 FROM referral_earnings WHERE paid = TRUE",
            )
            .await?,
            user_balances: category(
                &mut *tx,
                "SELECT COUNT(*) AS count, COALESCE(SUM(balance), 0) AS total FROM users",
            )
            .await?,
            pending_earnings: category(
                &mut *tx,
                "SELECT COUNT(*) AS count, COALESCE(SUM(pending_earnings), 0) AS total \
                 FROM users WHERE pending_earnings > 0",
            )
            .await?,
            in_flight_withdrawals: category(
                &mut *tx,
                "SELECT COUNT(*) AS count, COALESCE(SUM(amount), 0) AS total \
                 FROM transactions WHERE type = 'withdrawal' \
                   AND status IN ('pending', 'processing')",
            )
            .await?,
        };
        tx.commit().await?;
        Ok(totals)
    }

    async fn get_snapshot(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DailyBalanceSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {} FROM daily_balance_snapshots WHERE snapshot_date = $1",
            SNAPSHOT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_snapshot).transpose()
    }
}
