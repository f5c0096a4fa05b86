//! Ledger schema bootstrap
//!
//! `ensure_schema` is idempotent (`IF NOT EXISTS` everywhere) and runs at
//! startup. Amounts are `NUMERIC(20, 8)`.

use sqlx::PgPool;

const CREATE_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id                    BIGSERIAL PRIMARY KEY,
    balance               NUMERIC(20, 8) NOT NULL DEFAULT 0 CHECK (balance >= 0),
    pending_earnings      NUMERIC(20, 8) NOT NULL DEFAULT 0,
    total_earned          NUMERIC(20, 8) NOT NULL DEFAULT 0,
    is_banned             BOOLEAN NOT NULL DEFAULT FALSE,
    withdrawal_blocked    BOOLEAN NOT NULL DEFAULT FALSE,
    earnings_blocked      BOOLEAN NOT NULL DEFAULT FALSE,
    suspicious            BOOLEAN NOT NULL DEFAULT FALSE,
    finpass_attempts      INTEGER NOT NULL DEFAULT 0,
    finpass_locked_until  TIMESTAMPTZ,
    wallet_address        VARCHAR(64)
)
"#;

const CREATE_TRANSACTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id              BIGSERIAL PRIMARY KEY,
    user_id         BIGINT NOT NULL REFERENCES users(id),
    type            VARCHAR(32) NOT NULL,
    amount          NUMERIC(20, 8) NOT NULL,
    fee             NUMERIC(20, 8) NOT NULL DEFAULT 0,
    balance_before  NUMERIC(20, 8) NOT NULL,
    balance_after   NUMERIC(20, 8) NOT NULL,
    status          VARCHAR(32) NOT NULL,
    tx_hash         VARCHAR(80),
    to_address      VARCHAR(64),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_TRANSACTIONS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_transactions_user_type ON transactions (user_id, type, status);
CREATE INDEX IF NOT EXISTS idx_transactions_status_updated ON transactions (type, status, updated_at)
"#;

const CREATE_DEPOSITS: &str = r#"
CREATE TABLE IF NOT EXISTS deposits (
    id          BIGSERIAL PRIMARY KEY,
    user_id     BIGINT NOT NULL REFERENCES users(id),
    level       SMALLINT NOT NULL DEFAULT 1,
    amount      NUMERIC(20, 8) NOT NULL,
    status      VARCHAR(32) NOT NULL,
    tx_hash     VARCHAR(80),
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_REFERRAL_EARNINGS: &str = r#"
CREATE TABLE IF NOT EXISTS referral_earnings (
    id          BIGSERIAL PRIMARY KEY,
    user_id     BIGINT NOT NULL REFERENCES users(id),
    amount      NUMERIC(20, 8) NOT NULL,
    paid        BOOLEAN NOT NULL DEFAULT FALSE,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_DEPOSIT_REWARDS: &str = r#"
CREATE TABLE IF NOT EXISTS deposit_rewards (
    id          BIGSERIAL PRIMARY KEY,
    user_id     BIGINT NOT NULL REFERENCES users(id),
    amount      NUMERIC(20, 8) NOT NULL,
    paid        BOOLEAN NOT NULL DEFAULT FALSE,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_FINANCIAL_RECOVERY: &str = r#"
CREATE TABLE IF NOT EXISTS financial_recovery_requests (
    id          BIGSERIAL PRIMARY KEY,
    user_id     BIGINT NOT NULL REFERENCES users(id),
    status      VARCHAR(32) NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ESCROWS: &str = r#"
CREATE TABLE IF NOT EXISTS admin_action_escrows (
    id                    BIGSERIAL PRIMARY KEY,
    operation_type        VARCHAR(32) NOT NULL,
    target_id             BIGINT NOT NULL,
    operation_data        JSONB NOT NULL,
    initiator_admin_id    BIGINT NOT NULL,
    approver_admin_id     BIGINT,
    rejected_by_admin_id  BIGINT,
    rejection_reason      TEXT,
    status                VARCHAR(16) NOT NULL,
    expires_at            TIMESTAMPTZ NOT NULL,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// At most one PENDING escrow per operation target
const CREATE_ESCROWS_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS uq_escrow_pending_target
    ON admin_action_escrows (operation_type, target_id)
    WHERE status = 'PENDING'
"#;

const CREATE_PAYMENT_RETRIES: &str = r#"
CREATE TABLE IF NOT EXISTS payment_retries (
    id             BIGSERIAL PRIMARY KEY,
    user_id        BIGINT NOT NULL REFERENCES users(id),
    amount         NUMERIC(20, 8) NOT NULL,
    payment_type   VARCHAR(32) NOT NULL,
    earning_ids    BIGINT[] NOT NULL DEFAULT '{}',
    attempt_count  INTEGER NOT NULL DEFAULT 0,
    max_retries    INTEGER NOT NULL,
    next_retry_at  TIMESTAMPTZ,
    last_error     TEXT,
    in_dlq         BOOLEAN NOT NULL DEFAULT FALSE,
    resolved       BOOLEAN NOT NULL DEFAULT FALSE,
    tx_hash        VARCHAR(80),
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_PAYMENT_RETRIES_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_payment_retries_due
    ON payment_retries (next_retry_at)
    WHERE resolved = FALSE AND in_dlq = FALSE;
CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_retries_open
    ON payment_retries (user_id, payment_type)
    WHERE resolved = FALSE
"#;

const CREATE_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS daily_balance_snapshots (
    snapshot_date          DATE PRIMARY KEY,
    expected_balance       NUMERIC(20, 8) NOT NULL,
    actual_balance         NUMERIC(20, 8) NOT NULL,
    discrepancy            NUMERIC(20, 8) NOT NULL,
    discrepancy_percent    NUMERIC(12, 6) NOT NULL,
    reconciliation_status  VARCHAR(16) NOT NULL,
    reconciliation_report  JSONB NOT NULL,
    created_at             TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_GLOBAL_SETTINGS: &str = r#"
CREATE TABLE IF NOT EXISTS global_settings (
    id                          SMALLINT PRIMARY KEY CHECK (id = 1),
    emergency_stop_withdrawals  BOOLEAN NOT NULL DEFAULT FALSE,
    emergency_stop_deposits     BOOLEAN NOT NULL DEFAULT FALSE,
    emergency_stop_roi          BOOLEAN NOT NULL DEFAULT FALSE,
    min_withdrawal_amount       NUMERIC(20, 8) NOT NULL DEFAULT 5,
    daily_withdrawal_limit      NUMERIC(20, 8),
    auto_withdrawal_enabled     BOOLEAN NOT NULL DEFAULT FALSE,
    withdrawal_service_fee      NUMERIC(8, 4) NOT NULL DEFAULT 0
)
"#;

const STATEMENTS: &[(&str, &str)] = &[
    ("users", CREATE_USERS),
    ("transactions", CREATE_TRANSACTIONS),
    ("transactions indexes", CREATE_TRANSACTIONS_INDEXES),
    ("deposits", CREATE_DEPOSITS),
    ("referral_earnings", CREATE_REFERRAL_EARNINGS),
    ("deposit_rewards", CREATE_DEPOSIT_REWARDS),
    ("financial_recovery_requests", CREATE_FINANCIAL_RECOVERY),
    ("admin_action_escrows", CREATE_ESCROWS),
    ("admin_action_escrows index", CREATE_ESCROWS_INDEX),
    ("payment_retries", CREATE_PAYMENT_RETRIES),
    ("payment_retries indexes", CREATE_PAYMENT_RETRIES_INDEX),
    ("daily_balance_snapshots", CREATE_SNAPSHOTS),
    ("global_settings", CREATE_GLOBAL_SETTINGS),
];

/// Create all ledger tables and indexes that do not exist yet
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Ensuring ledger schema...");
    for (name, ddl) in STATEMENTS {
        // raw_sql allows the multi-statement index blocks
        sqlx::raw_sql(ddl).execute(pool).await.map_err(|e| {
            tracing::error!(object = name, error = %e, "Schema statement failed");
            e
        })?;
    }
    tracing::info!("Ledger schema ready");
    Ok(())
}
