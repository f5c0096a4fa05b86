//! Reconciliation Engine
//!
//! ```text
//! expected = confirmed deposits - confirmed withdrawals - paid referrals
//! actual   = user balances + pending earnings + pending/processing withdrawals
//! ```
//!
//! Detection only: a discrepancy outside the tolerance is logged and sent to
//! the admins, balances are never corrected. One snapshot per calendar date;
//! re-running a date overwrites it with the same figures if nothing moved.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::chain::BlockchainGateway;
use crate::config::ReconciliationConfig;
use crate::models::{DailyBalanceSnapshot, LedgerTotals, ReconciliationStatus};
use crate::money::ratio_percent;
use crate::notify::{AdminAlert, Notifier};
use crate::store::{LedgerStore, StoreError};

#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// The numbers of one run, derived from [`LedgerTotals`] only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationFigures {
    pub expected_balance: Decimal,
    pub actual_balance: Decimal,
    pub discrepancy: Decimal,
    /// Rounded to two places; zero when nothing is expected
    pub discrepancy_percent: Decimal,
    pub status: ReconciliationStatus,
}

pub fn compute(totals: &LedgerTotals, tolerance_percent: Decimal) -> ReconciliationFigures {
    let expected_balance = totals.confirmed_deposits.total
        - totals.confirmed_withdrawals.total
        - totals.paid_referrals.total;
    let actual_balance = totals.user_balances.total
        + totals.pending_earnings.total
        + totals.in_flight_withdrawals.total;
    let discrepancy = actual_balance - expected_balance;
    let discrepancy_percent = ratio_percent(discrepancy, expected_balance).round_dp(2);
    let status = if discrepancy_percent.abs() <= tolerance_percent {
        ReconciliationStatus::Reconciled
    } else {
        ReconciliationStatus::Discrepancy
    };
    ReconciliationFigures {
        expected_balance,
        actual_balance,
        discrepancy,
        discrepancy_percent,
        status,
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn BlockchainGateway>,
    notifier: Arc<dyn Notifier>,
    config: ReconciliationConfig,
    hot_wallet_address: String,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn BlockchainGateway>,
        notifier: Arc<dyn Notifier>,
        config: ReconciliationConfig,
        hot_wallet_address: String,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            config,
            hot_wallet_address,
        }
    }

    /// Reconcile the ledger as it is now and store the snapshot under
    /// `snapshot_date` (today, UTC, when `None`)
    pub async fn perform_reconciliation(
        &self,
        snapshot_date: Option<NaiveDate>,
    ) -> Result<DailyBalanceSnapshot, ReconciliationError> {
        let snapshot_date = snapshot_date.unwrap_or_else(|| Utc::now().date_naive());
        let totals = self.store.ledger_totals().await?;
        let figures = compute(&totals, self.config.tolerance_percent);

        let mut report = json!({
            "categories": {
                "confirmed_deposits": totals.confirmed_deposits,
                "confirmed_withdrawals": totals.confirmed_withdrawals,
                "paid_referrals": totals.paid_referrals,
                "user_balances": totals.user_balances,
                "pending_earnings": totals.pending_earnings,
                "pending_withdrawals": totals.in_flight_withdrawals,
            },
            "tolerance_percent": self.config.tolerance_percent,
        });
        if self.config.include_hot_wallet && !self.hot_wallet_address.is_empty() {
            report["hot_wallet"] = match self.gateway.get_usdt_balance(&self.hot_wallet_address).await {
                Ok(balance) => json!({
                    "address": self.hot_wallet_address,
                    "balance": balance,
                }),
                Err(e) => {
                    warn!(error = %e, "Hot wallet balance unavailable for reconciliation");
                    json!({
                        "address": self.hot_wallet_address,
                        "error": e.to_string(),
                    })
                }
            };
        }

        let snapshot = DailyBalanceSnapshot {
            snapshot_date,
            expected_balance: figures.expected_balance,
            actual_balance: figures.actual_balance,
            discrepancy: figures.discrepancy,
            discrepancy_percent: figures.discrepancy_percent,
            reconciliation_status: figures.status,
            reconciliation_report: report,
            created_at: Utc::now(),
        };

        let mut tx = self.store.begin().await?;
        tx.upsert_snapshot(&snapshot).await?;
        tx.commit().await?;

        match figures.status {
            ReconciliationStatus::Reconciled => info!(
                date = %snapshot_date,
                expected = %figures.expected_balance,
                actual = %figures.actual_balance,
                discrepancy_percent = %figures.discrepancy_percent,
                "Reconciliation passed"
            ),
            ReconciliationStatus::Discrepancy => {
                error!(
                    date = %snapshot_date,
                    expected = %figures.expected_balance,
                    actual = %figures.actual_balance,
                    discrepancy = %figures.discrepancy,
                    discrepancy_percent = %figures.discrepancy_percent,
                    report = %snapshot.reconciliation_report,
                    "Balance discrepancy detected"
                );
                self.notifier
                    .alert_admins(AdminAlert::ReconciliationDiscrepancy {
                        snapshot_date,
                        expected_balance: figures.expected_balance,
                        actual_balance: figures.actual_balance,
                        discrepancy_percent: figures.discrepancy_percent,
                    });
            }
        }
        Ok(snapshot)
    }

    pub async fn get_snapshot(
        &self,
        snapshot_date: NaiveDate,
    ) -> Result<Option<DailyBalanceSnapshot>, ReconciliationError> {
        Ok(self.store.get_snapshot(snapshot_date).await?)
    }
}
