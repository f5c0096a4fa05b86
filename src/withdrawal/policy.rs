//! Policy Gate
//!
//! Ordered, short-circuiting preconditions for a new withdrawal request:
//!
//! 1. emergency stop (config switch or settings flag)
//! 2. minimum amount
//! 3. banned user
//! 4. withdrawal block
//! 5. active financial-password recovery
//! 6. fraud risk score
//! 7. balance sufficiency
//!
//! The gate only decides. Side effects of a rejection (freezing pending
//! withdrawals, flagging the user) belong to the orchestrator.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::warn;

use super::error::{PolicyViolation, WithdrawalError};
use crate::fraud::FraudDetector;
use crate::models::{GlobalSettings, User};
use crate::store::LedgerStore;

/// Inputs of one evaluation
#[derive(Debug, Clone, Copy)]
pub struct PolicyCheck<'a> {
    pub user: &'a User,
    pub amount: Decimal,
    /// Balance the caller showed the user
    pub available_balance: Decimal,
    pub settings: &'a GlobalSettings,
}

/// Result of a passed gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyPass {
    /// `None` when the fraud scorer was unavailable
    pub risk_score: Option<u8>,
}

pub struct PolicyGate {
    store: Arc<dyn LedgerStore>,
    fraud: Arc<dyn FraudDetector>,
    emergency_stop: bool,
    fraud_block_threshold: u8,
}

impl PolicyGate {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        fraud: Arc<dyn FraudDetector>,
        emergency_stop: bool,
        fraud_block_threshold: u8,
    ) -> Self {
        Self {
            store,
            fraud,
            emergency_stop,
            fraud_block_threshold,
        }
    }

    pub async fn evaluate(&self, check: &PolicyCheck<'_>) -> Result<PolicyPass, WithdrawalError> {
        if self.emergency_stop || check.settings.emergency_stop_withdrawals {
            return Err(PolicyViolation::EmergencyStop.into());
        }

        if check.amount < check.settings.min_withdrawal_amount {
            return Err(PolicyViolation::BelowMinimum {
                amount: check.amount,
                minimum: check.settings.min_withdrawal_amount,
            }
            .into());
        }

        if check.user.is_banned {
            return Err(PolicyViolation::Banned.into());
        }

        if check.user.withdrawal_blocked {
            return Err(PolicyViolation::WithdrawalBlocked.into());
        }

        if self.store.has_active_finpass_recovery(check.user.id).await? {
            return Err(PolicyViolation::RecoveryInProgress.into());
        }

        let risk_score = match self.fraud.risk_score(check.user.id, check.amount).await {
            Ok(score) if score >= self.fraud_block_threshold => {
                return Err(PolicyViolation::FraudRisk { score }.into());
            }
            Ok(score) => Some(score),
            Err(e) => {
                warn!(user_id = check.user.id, error = %e, "Fraud scoring failed, manual review required");
                None
            }
        };

        if check.available_balance < check.amount {
            return Err(PolicyViolation::InsufficientBalance {
                requested: check.amount,
                available: check.available_balance,
            }
            .into());
        }

        Ok(PolicyPass { risk_score })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fraud::StaticFraudDetector;
    use crate::store::MemoryLedgerStore;

    struct Fixture {
        store: Arc<MemoryLedgerStore>,
        fraud: Arc<StaticFraudDetector>,
        gate: PolicyGate,
    }

    fn fixture(emergency_stop: bool) -> Fixture {
        let store = Arc::new(MemoryLedgerStore::new());
        let fraud = Arc::new(StaticFraudDetector::new());
        let gate = PolicyGate::new(store.clone(), fraud.clone(), emergency_stop, 80);
        Fixture { store, fraud, gate }
    }

    fn violation(result: Result<PolicyPass, WithdrawalError>) -> PolicyViolation {
        match result {
            Err(WithdrawalError::Policy(v)) => v,
            other => panic!("expected policy violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_minimum_boundary() {
        let f = fixture(false);
        let user = User::new(1, Decimal::from(100));
        let settings = GlobalSettings::default();

        let at_min = PolicyCheck {
            user: &user,
            amount: Decimal::new(500, 2),
            available_balance: user.balance,
            settings: &settings,
        };
        assert!(f.gate.evaluate(&at_min).await.is_ok());

        let below = PolicyCheck {
            amount: Decimal::new(499, 2),
            ..at_min
        };
        assert!(matches!(
            violation(f.gate.evaluate(&below).await),
            PolicyViolation::BelowMinimum { .. }
        ));
    }

    #[tokio::test]
    async fn test_order_emergency_stop_first() {
        let f = fixture(true);
        let mut user = User::new(1, Decimal::ZERO);
        user.is_banned = true;
        let settings = GlobalSettings::default();
        let check = PolicyCheck {
            user: &user,
            amount: Decimal::ONE,
            available_balance: Decimal::ZERO,
            settings: &settings,
        };
        assert_eq!(
            violation(f.gate.evaluate(&check).await),
            PolicyViolation::EmergencyStop
        );
    }

    #[tokio::test]
    async fn test_settings_flag_trips_emergency_stop() {
        let f = fixture(false);
        let user = User::new(1, Decimal::from(100));
        let settings = GlobalSettings {
            emergency_stop_withdrawals: true,
            ..GlobalSettings::default()
        };
        let check = PolicyCheck {
            user: &user,
            amount: Decimal::from(10),
            available_balance: user.balance,
            settings: &settings,
        };
        assert_eq!(
            violation(f.gate.evaluate(&check).await),
            PolicyViolation::EmergencyStop
        );
    }

    #[tokio::test]
    async fn test_banned_before_blocked() {
        let f = fixture(false);
        let mut user = User::new(1, Decimal::from(100));
        user.is_banned = true;
        user.withdrawal_blocked = true;
        let settings = GlobalSettings::default();
        let check = PolicyCheck {
            user: &user,
            amount: Decimal::from(10),
            available_balance: user.balance,
            settings: &settings,
        };
        assert_eq!(violation(f.gate.evaluate(&check).await), PolicyViolation::Banned);
    }

    #[tokio::test]
    async fn test_recovery_before_fraud() {
        let f = fixture(false);
        f.store.start_finpass_recovery(1);
        f.fraud.set_score(1, 99);
        let user = User::new(1, Decimal::from(100));
        let settings = GlobalSettings::default();
        let check = PolicyCheck {
            user: &user,
            amount: Decimal::from(10),
            available_balance: user.balance,
            settings: &settings,
        };
        assert_eq!(
            violation(f.gate.evaluate(&check).await),
            PolicyViolation::RecoveryInProgress
        );
    }

    #[tokio::test]
    async fn test_fraud_threshold_inclusive() {
        let f = fixture(false);
        let user = User::new(1, Decimal::from(100));
        let settings = GlobalSettings::default();
        let check = PolicyCheck {
            user: &user,
            amount: Decimal::from(10),
            available_balance: user.balance,
            settings: &settings,
        };

        f.fraud.set_score(1, 79);
        assert_eq!(
            f.gate.evaluate(&check).await.unwrap().risk_score,
            Some(79)
        );

        f.fraud.set_score(1, 80);
        assert_eq!(
            violation(f.gate.evaluate(&check).await),
            PolicyViolation::FraudRisk { score: 80 }
        );
    }

    #[tokio::test]
    async fn test_scorer_outage_passes_without_score() {
        let f = fixture(false);
        f.fraud.set_unavailable(1, "timeout");
        let user = User::new(1, Decimal::from(100));
        let settings = GlobalSettings::default();
        let check = PolicyCheck {
            user: &user,
            amount: Decimal::from(10),
            available_balance: user.balance,
            settings: &settings,
        };
        assert_eq!(f.gate.evaluate(&check).await.unwrap().risk_score, None);
    }

    #[tokio::test]
    async fn test_balance_exactly_equal_passes() {
        let f = fixture(false);
        let user = User::new(1, Decimal::from(100));
        let settings = GlobalSettings::default();
        let check = PolicyCheck {
            user: &user,
            amount: Decimal::from(100),
            available_balance: Decimal::from(100),
            settings: &settings,
        };
        assert!(f.gate.evaluate(&check).await.is_ok());

        let short = PolicyCheck {
            available_balance: Decimal::new(9999, 2),
            ..check
        };
        assert!(matches!(
            violation(f.gate.evaluate(&short).await),
            PolicyViolation::InsufficientBalance { .. }
        ));
    }
}
