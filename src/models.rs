//! Ledger row types
//!
//! Rows of the `users`, `transactions`, `deposits`, `referral_earnings`,
//! `deposit_rewards`, `admin_action_escrows`, `payment_retries`,
//! `daily_balance_snapshots` and `global_settings` tables.
//!
//! Enumerated columns are stored as TEXT; `as_str()` is the storage form and
//! `FromStr` parses it back.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::{
    AdminId, DepositId, EarningId, EscrowId, RetryId, TransactionId, UserId,
};

// ============================================================================
// User
// ============================================================================

/// Balance-owning aggregate root.
///
/// `balance` is only ever mutated inside a store transaction that holds the
/// exclusive row lock for this user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub balance: Decimal,
    pub pending_earnings: Decimal,
    pub total_earned: Decimal,
    pub is_banned: bool,
    pub withdrawal_blocked: bool,
    pub earnings_blocked: bool,
    pub suspicious: bool,
    pub finpass_attempts: i32,
    pub finpass_locked_until: Option<DateTime<Utc>>,
    pub wallet_address: Option<String>,
}

impl User {
    /// A clean, unflagged user with the given balance
    pub fn new(id: UserId, balance: Decimal) -> Self {
        Self {
            id,
            balance,
            pending_earnings: Decimal::ZERO,
            total_earned: Decimal::ZERO,
            is_banned: false,
            withdrawal_blocked: false,
            earnings_blocked: false,
            suspicious: false,
            finpass_attempts: 0,
            finpass_locked_until: None,
            wallet_address: None,
        }
    }

    pub fn with_wallet(mut self, address: impl Into<String>) -> Self {
        self.wallet_address = Some(address.into());
        self
    }
}

// ============================================================================
// Transaction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    ReferralReward,
    DepositReward,
    SystemPayout,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::ReferralReward => "referral_reward",
            TransactionType::DepositReward => "deposit_reward",
            TransactionType::SystemPayout => "system_payout",
            TransactionType::Adjustment => "adjustment",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            "referral_reward" => Ok(TransactionType::ReferralReward),
            "deposit_reward" => Ok(TransactionType::DepositReward),
            "system_payout" => Ok(TransactionType::SystemPayout),
            "adjustment" => Ok(TransactionType::Adjustment),
            _ => Err(format!("Invalid transaction type: {}", s)),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Confirmed,
    Failed,
    Frozen,
    PendingNetworkRecovery,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Frozen => "frozen",
            TransactionStatus::PendingNetworkRecovery => "pending_network_recovery",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "processing" => Ok(TransactionStatus::Processing),
            "confirmed" => Ok(TransactionStatus::Confirmed),
            "failed" => Ok(TransactionStatus::Failed),
            "frozen" => Ok(TransactionStatus::Frozen),
            "pending_network_recovery" => Ok(TransactionStatus::PendingNetworkRecovery),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only financial event. Only `status`, `tx_hash` and `updated_at`
/// change after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub fee: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub status: TransactionStatus,
    pub tx_hash: Option<String>,
    pub to_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_withdrawal(&self) -> bool {
        self.tx_type == TransactionType::Withdrawal
    }
}

/// Insert payload for `transactions`
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: UserId,
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub fee: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub status: TransactionStatus,
    pub tx_hash: Option<String>,
    pub to_address: Option<String>,
}

impl NewTransaction {
    pub fn withdrawal(
        user_id: UserId,
        amount: Decimal,
        fee: Decimal,
        balance_before: Decimal,
        status: TransactionStatus,
        to_address: String,
    ) -> Self {
        Self {
            user_id,
            tx_type: TransactionType::Withdrawal,
            amount,
            fee,
            balance_before,
            balance_after: balance_before - amount,
            status,
            tx_hash: None,
            to_address: Some(to_address),
        }
    }

    /// Confirmed ledger row for a balance correction (e.g. a withdrawal refund)
    pub fn adjustment(user_id: UserId, amount: Decimal, balance_before: Decimal) -> Self {
        Self {
            user_id,
            tx_type: TransactionType::Adjustment,
            amount,
            fee: Decimal::ZERO,
            balance_before,
            balance_after: balance_before + amount,
            status: TransactionStatus::Confirmed,
            tx_hash: None,
            to_address: None,
        }
    }

    /// Confirmed ledger row for an earning paid straight to the user's
    /// wallet; the internal balance does not move
    pub fn payout(
        user_id: UserId,
        tx_type: TransactionType,
        amount: Decimal,
        balance: Decimal,
        tx_hash: String,
        to_address: String,
    ) -> Self {
        Self {
            user_id,
            tx_type,
            amount,
            fee: Decimal::ZERO,
            balance_before: balance,
            balance_after: balance,
            status: TransactionStatus::Confirmed,
            tx_hash: Some(tx_hash),
            to_address: Some(to_address),
        }
    }
}

// ============================================================================
// Deposits & earnings (written by the accrual side, read here)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: DepositId,
    pub user_id: UserId,
    pub level: i16,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Kind of on-chain payout handled by the retry engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    ReferralEarning,
    DepositReward,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::ReferralEarning => "REFERRAL_EARNING",
            PaymentType::DepositReward => "DEPOSIT_REWARD",
        }
    }

    /// Ledger type recorded when the payout finally succeeds
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            PaymentType::ReferralEarning => TransactionType::ReferralReward,
            PaymentType::DepositReward => TransactionType::DepositReward,
        }
    }

    /// Table holding the earning rows of this kind
    pub fn earnings_table(&self) -> &'static str {
        match self {
            PaymentType::ReferralEarning => "referral_earnings",
            PaymentType::DepositReward => "deposit_rewards",
        }
    }
}

impl FromStr for PaymentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REFERRAL_EARNING" => Ok(PaymentType::ReferralEarning),
            "DEPOSIT_REWARD" => Ok(PaymentType::DepositReward),
            _ => Err(format!("Invalid payment type: {}", s)),
        }
    }
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A referral earning or deposit reward row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Earning {
    pub id: EarningId,
    pub user_id: UserId,
    pub payment_type: PaymentType,
    pub amount: Decimal,
    pub paid: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Dual-control escrow
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowOperation {
    WithdrawalApproval,
}

impl EscrowOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowOperation::WithdrawalApproval => "WITHDRAWAL_APPROVAL",
        }
    }
}

impl FromStr for EscrowOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WITHDRAWAL_APPROVAL" => Ok(EscrowOperation::WithdrawalApproval),
            _ => Err(format!("Invalid escrow operation: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "PENDING",
            EscrowStatus::Approved => "APPROVED",
            EscrowStatus::Rejected => "REJECTED",
            EscrowStatus::Expired => "EXPIRED",
        }
    }
}

impl FromStr for EscrowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EscrowStatus::Pending),
            "APPROVED" => Ok(EscrowStatus::Approved),
            "REJECTED" => Ok(EscrowStatus::Rejected),
            "EXPIRED" => Ok(EscrowStatus::Expired),
            _ => Err(format!("Invalid escrow status: {}", s)),
        }
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Four-eyes approval record. `operation_data` is a snapshot of the
/// operation taken when the first admin initiated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminActionEscrow {
    pub id: EscrowId,
    pub operation_type: EscrowOperation,
    pub target_id: i64,
    pub operation_data: serde_json::Value,
    pub initiator_admin_id: AdminId,
    pub approver_admin_id: Option<AdminId>,
    pub rejected_by_admin_id: Option<AdminId>,
    pub rejection_reason: Option<String>,
    pub status: EscrowStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdminActionEscrow {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone)]
pub struct NewEscrow {
    pub operation_type: EscrowOperation,
    pub target_id: i64,
    pub operation_data: serde_json::Value,
    pub initiator_admin_id: AdminId,
    pub expires_at: DateTime<Utc>,
}

/// `operation_data` payload of a WITHDRAWAL_APPROVAL escrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalApprovalData {
    pub amount: Decimal,
    pub to_address: Option<String>,
    pub user_id: UserId,
}

// ============================================================================
// Payment retries
// ============================================================================

/// Retry / dead-letter record for a failed referral or reward payout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRetry {
    pub id: RetryId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub earning_ids: Vec<EarningId>,
    pub attempt_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub in_dlq: bool,
    pub resolved: bool,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRetry {
    /// Eligible for an automatic attempt at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.resolved && !self.in_dlq && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
pub struct NewPaymentRetry {
    pub user_id: UserId,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub earning_ids: Vec<EarningId>,
    pub max_retries: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Aggregate view over `payment_retries`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub pending_count: i64,
    pub pending_amount: Decimal,
    pub dlq_count: i64,
    pub dlq_amount: Decimal,
    pub resolved_count: i64,
    pub resolved_amount: Decimal,
}

// ============================================================================
// Reconciliation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Reconciled,
    Discrepancy,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Reconciled => "reconciled",
            ReconciliationStatus::Discrepancy => "discrepancy",
        }
    }
}

impl FromStr for ReconciliationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconciled" => Ok(ReconciliationStatus::Reconciled),
            "discrepancy" => Ok(ReconciliationStatus::Discrepancy),
            _ => Err(format!("Invalid reconciliation status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBalanceSnapshot {
    pub snapshot_date: NaiveDate,
    pub expected_balance: Decimal,
    pub actual_balance: Decimal,
    pub discrepancy: Decimal,
    pub discrepancy_percent: Decimal,
    pub reconciliation_status: ReconciliationStatus,
    pub reconciliation_report: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Count and sum of one ledger category
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub count: i64,
    pub total: Decimal,
}

/// Raw aggregates the reconciliation engine works from
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub confirmed_deposits: CategoryTotal,
    pub confirmed_withdrawals: CategoryTotal,
    pub paid_referrals: CategoryTotal,
    pub user_balances: CategoryTotal,
    pub pending_earnings: CategoryTotal,
    pub in_flight_withdrawals: CategoryTotal,
}

/// Per-user figures consulted by the auto-withdrawal rules
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WithdrawalExposure {
    /// Pending + processing + confirmed withdrawals, all time
    pub lifetime_withdrawn: Decimal,
    pub confirmed_deposits: Decimal,
}

// ============================================================================
// Global settings
// ============================================================================

/// Singleton `global_settings` row (id = 1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub emergency_stop_withdrawals: bool,
    pub emergency_stop_deposits: bool,
    pub emergency_stop_roi: bool,
    pub min_withdrawal_amount: Decimal,
    /// Global daily ceiling for auto-withdrawals; `None` disables it
    pub daily_withdrawal_limit: Option<Decimal>,
    pub auto_withdrawal_enabled: bool,
    /// Percent of the amount, e.g. `1.5` = 1.5%
    pub withdrawal_service_fee: Decimal,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            emergency_stop_withdrawals: false,
            emergency_stop_deposits: false,
            emergency_stop_roi: false,
            min_withdrawal_amount: Decimal::new(5, 0),
            daily_withdrawal_limit: None,
            auto_withdrawal_enabled: false,
            withdrawal_service_fee: Decimal::ZERO,
        }
    }
}
