//! Core identifier types shared by every subsystem.
//!
//! All ids map 1:1 onto `BIGINT` primary keys in PostgreSQL.

/// Platform user (Telegram account) id
pub type UserId = i64;

/// `transactions.id`
pub type TransactionId = i64;

/// `admin_action_escrows.id`
pub type EscrowId = i64;

/// `payment_retries.id`
pub type RetryId = i64;

/// Administrator id (Telegram id of the admin)
pub type AdminId = i64;

/// Referral earning / deposit reward row id
pub type EarningId = i64;

/// `deposits.id`
pub type DepositId = i64;
