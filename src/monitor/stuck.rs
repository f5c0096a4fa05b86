//! Stuck-Transaction Monitor
//!
//! Looks at PROCESSING withdrawals whose payout has not settled within the
//! stuck window. Confirmed and reverted payouts are settled here; anything
//! still in flight only produces an operator recommendation. A payout the
//! node has never seen is never refunded automatically, since it may still
//! be mined.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::MonitorError;
use crate::chain::{BlockchainGateway, ChainTxStatus};
use crate::config::MonitorConfig;
use crate::core_types::TransactionId;
use crate::models::{Transaction, TransactionStatus};
use crate::notify::AdminAlert;
use crate::withdrawal::{RefundGuard, WithdrawalError, WithdrawalService};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StuckAction {
    Confirmed,
    Refunded,
    /// Still in the mempool and the network price moved above ours
    SpeedUpRecommended {
        original_gas_price: u128,
        current_gas_price: u128,
    },
    /// Still in the mempool at a competitive price
    AwaitingInclusion,
    /// Unknown to the node; an operator decides whether to resend
    ManualResendReview,
    /// Status or settlement failed this round
    CheckFailed { error: String },
}

impl StuckAction {
    fn still_stuck(&self) -> bool {
        !matches!(self, StuckAction::Confirmed | StuckAction::Refunded)
    }

    fn recommendation(&self) -> String {
        match self {
            StuckAction::Confirmed => "none, confirmed".to_string(),
            StuckAction::Refunded => "none, refunded".to_string(),
            StuckAction::SpeedUpRecommended {
                original_gas_price,
                current_gas_price,
            } => format!(
                "speed up: resubmit with the same nonce above {} wei (sent at {} wei)",
                current_gas_price, original_gas_price
            ),
            StuckAction::AwaitingInclusion => "wait, gas price still competitive".to_string(),
            StuckAction::ManualResendReview => {
                "not found on-chain: verify before any resend, do not refund blindly".to_string()
            }
            StuckAction::CheckFailed { error } => format!("status check failed: {}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckTransaction {
    pub transaction_id: TransactionId,
    pub tx_hash: String,
    pub chain_status: Option<ChainTxStatus>,
    pub action: StuckAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StuckReport {
    pub checked: usize,
    pub items: Vec<StuckTransaction>,
    /// Auto-approved withdrawals past the window with no payout sent
    pub undispatched: Vec<TransactionId>,
    pub systemic_incident: bool,
}

impl StuckReport {
    pub fn still_stuck(&self) -> usize {
        self.items.iter().filter(|t| t.action.still_stuck()).count()
    }
}

pub struct StuckTransactionMonitor {
    withdrawals: Arc<WithdrawalService>,
    gateway: Arc<dyn BlockchainGateway>,
    config: MonitorConfig,
}

impl StuckTransactionMonitor {
    pub fn new(
        withdrawals: Arc<WithdrawalService>,
        gateway: Arc<dyn BlockchainGateway>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            withdrawals,
            gateway,
            config,
        }
    }

    pub async fn sweep(&self) -> Result<StuckReport, MonitorError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<StuckReport, MonitorError> {
        let cutoff = now - Duration::minutes(self.config.stuck_after_mins);
        let store = self.withdrawals.store();
        let candidates = store
            .list_processing_withdrawals(Some(cutoff), self.config.batch_size)
            .await?;
        let undispatched = store
            .list_undispatched_withdrawals(Some(cutoff), self.config.batch_size)
            .await?;

        let mut report = StuckReport {
            checked: candidates.len(),
            undispatched: undispatched.iter().map(|w| w.id).collect(),
            ..StuckReport::default()
        };
        for withdrawal in &undispatched {
            self.alert_undispatched(withdrawal);
        }
        if candidates.is_empty() {
            return Ok(report);
        }
        warn!(count = candidates.len(), cutoff = %cutoff, "Found stuck withdrawals");

        // one network price for the whole sweep
        let mut current_gas: Option<u128> = None;

        for withdrawal in candidates {
            let Some(tx_hash) = withdrawal.tx_hash.clone() else {
                continue;
            };

            let (chain_status, action) = match self.gateway.check_transaction_status(&tx_hash).await {
                Err(e) => (None, StuckAction::CheckFailed { error: e.to_string() }),
                Ok(status) => {
                    let action = match status.status {
                        ChainTxStatus::Confirmed => settled(
                            self.withdrawals.mark_confirmed(withdrawal.id).await,
                            TransactionStatus::Confirmed,
                            StuckAction::Confirmed,
                        ),
                        ChainTxStatus::Failed => settled(
                            self.withdrawals
                                .refund_and_fail(withdrawal.id, RefundGuard::Processing)
                                .await,
                            TransactionStatus::Failed,
                            StuckAction::Refunded,
                        ),
                        ChainTxStatus::Pending => {
                            if current_gas.is_none() {
                                current_gas = self.gateway.gas_price().await.ok();
                            }
                            speed_up_decision(status.gas_price, current_gas)
                        }
                        ChainTxStatus::Unknown => StuckAction::ManualResendReview,
                    };
                    (Some(status.status), action)
                }
            };

            if action.still_stuck() {
                warn!(
                    transaction_id = withdrawal.id,
                    tx_hash = %tx_hash,
                    chain_status = ?chain_status,
                    recommendation = %action.recommendation(),
                    "Stuck withdrawal needs attention"
                );
                self.withdrawals
                    .notifier()
                    .alert_admins(AdminAlert::StuckTransaction {
                        transaction_id: withdrawal.id,
                        tx_hash: tx_hash.clone(),
                        chain_status: chain_status.unwrap_or(ChainTxStatus::Unknown),
                        recommendation: action.recommendation(),
                    });
            } else {
                info!(transaction_id = withdrawal.id, tx_hash = %tx_hash, action = ?action, "Stuck withdrawal settled");
            }

            report.items.push(StuckTransaction {
                transaction_id: withdrawal.id,
                tx_hash,
                chain_status,
                action,
            });
        }

        let stuck_count = report.still_stuck();
        if stuck_count > self.config.systemic_threshold {
            report.systemic_incident = true;
            error!(
                stuck_count,
                threshold = self.config.systemic_threshold,
                "Systemic stuck-transaction incident"
            );
            self.withdrawals
                .notifier()
                .alert_admins(AdminAlert::SystemicStuckIncident { stuck_count });
        }
        Ok(report)
    }

    fn alert_undispatched(&self, withdrawal: &Transaction) {
        warn!(
            transaction_id = withdrawal.id,
            user_id = withdrawal.user_id,
            amount = %withdrawal.amount,
            since = %withdrawal.updated_at,
            "Auto-approved withdrawal never dispatched"
        );
        self.withdrawals
            .notifier()
            .alert_admins(AdminAlert::UndispatchedWithdrawal {
                transaction_id: withdrawal.id,
                user_id: withdrawal.user_id,
                amount: withdrawal.amount,
                since: withdrawal.updated_at,
            });
    }
}

/// A row another sweep already moved to the target state counts as settled
fn settled(
    result: Result<Transaction, WithdrawalError>,
    target: TransactionStatus,
    action: StuckAction,
) -> StuckAction {
    match result {
        Ok(_) => action,
        Err(WithdrawalError::InvalidTransition { from, .. }) if from == target => action,
        Err(e) => StuckAction::CheckFailed { error: e.to_string() },
    }
}

/// Recommend a speed-up only when the network now pays more than we did
fn speed_up_decision(original: Option<u128>, current: Option<u128>) -> StuckAction {
    match (original, current) {
        (Some(original), Some(current)) if current > original => StuckAction::SpeedUpRecommended {
            original_gas_price: original,
            current_gas_price: current,
        },
        _ => StuckAction::AwaitingInclusion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_up_only_when_network_price_higher() {
        assert_eq!(
            speed_up_decision(Some(5), Some(7)),
            StuckAction::SpeedUpRecommended {
                original_gas_price: 5,
                current_gas_price: 7
            }
        );
        assert_eq!(speed_up_decision(Some(7), Some(7)), StuckAction::AwaitingInclusion);
        assert_eq!(speed_up_decision(None, Some(7)), StuckAction::AwaitingInclusion);
        assert_eq!(speed_up_decision(Some(5), None), StuckAction::AwaitingInclusion);
    }

    #[test]
    fn test_already_settled_row_is_not_a_failure() {
        let already_refunded = Err(WithdrawalError::InvalidTransition {
            from: TransactionStatus::Failed,
            to: TransactionStatus::Failed,
        });
        assert_eq!(
            settled(already_refunded, TransactionStatus::Failed, StuckAction::Refunded),
            StuckAction::Refunded
        );

        let confirmed_elsewhere = Err(WithdrawalError::InvalidTransition {
            from: TransactionStatus::Confirmed,
            to: TransactionStatus::Failed,
        });
        assert!(matches!(
            settled(confirmed_elsewhere, TransactionStatus::Failed, StuckAction::Refunded),
            StuckAction::CheckFailed { .. }
        ));
    }

    #[test]
    fn test_unknown_is_still_stuck() {
        assert!(StuckAction::ManualResendReview.still_stuck());
        assert!(!StuckAction::Refunded.still_stuck());
    }
}
