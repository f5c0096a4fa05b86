//! Balance Guard - withdrawal and balance-integrity core
//!
//! Everything that moves USDT out of the platform or checks that the books
//! still add up: policy-gated withdrawals, two-admin escrow for large
//! payouts, retry/dead-letter handling for failed earning payouts, monitoring
//! of in-flight on-chain payouts and daily reconciliation.
//!
//! # Modules
//!
//! - [`core_types`] - Id aliases
//! - [`models`] - Ledger rows and their enums
//! - [`money`] - Decimal helpers (display, fees, percentages)
//! - [`store`] - Transactional ledger store (PostgreSQL / in-memory)
//! - [`chain`] - Blockchain gateway (BEP-20 JSON-RPC / mock)
//! - [`withdrawal`] - Policy gate and withdrawal orchestrator
//! - [`escrow`] - Dual-control approval of large withdrawals
//! - [`payment_retry`] - Retry engine and dead-letter queue
//! - [`monitor`] - Confirmation and stuck-transaction sweeps
//! - [`reconciliation`] - Daily expected-vs-actual balance check
//! - [`worker`] - Periodic scheduling of the sweeps
//!
//! # Lock order
//!
//! escrow row, then transaction / retry row, then user row. The user row is
//! never held across a blockchain call.

// Core types - must be first!
pub mod core_types;

// Ambient
pub mod config;
pub mod db;
pub mod logging;

// Ledger
pub mod backoff;
pub mod models;
pub mod money;
pub mod settings;
pub mod store;

// External seams
pub mod chain;
pub mod fraud;
pub mod notify;

// Subsystems
pub mod escrow;
pub mod monitor;
pub mod payment_retry;
pub mod reconciliation;
pub mod withdrawal;

// Wiring
pub mod app;
pub mod worker;

// Convenient re-exports at crate root
pub use app::Services;
pub use core_types::{AdminId, EscrowId, RetryId, TransactionId, UserId};
pub use escrow::{ApprovalOutcome, EscrowError, EscrowService};
pub use models::{
    AdminActionEscrow, DailyBalanceSnapshot, GlobalSettings, PaymentRetry, PaymentType,
    Transaction, TransactionStatus, TransactionType, User,
};
pub use payment_retry::{PaymentRetryEngine, RetryError};
pub use reconciliation::{ReconciliationEngine, ReconciliationError};
pub use store::{LedgerStore, LedgerTx, LockMode, StoreError};
pub use withdrawal::{
    PolicyViolation, WithdrawalError, WithdrawalReceipt, WithdrawalRequest, WithdrawalService,
};
