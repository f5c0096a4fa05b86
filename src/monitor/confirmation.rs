//! Confirmation sweep
//!
//! PROCESSING -> CONFIRMED once the payout has enough confirmations;
//! PROCESSING -> FAILED (with refund) when the chain reports a revert.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::MonitorError;
use crate::chain::{BlockchainGateway, ChainTxStatus};
use crate::config::MonitorConfig;
use crate::withdrawal::{RefundGuard, WithdrawalService};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmationReport {
    pub confirmed: usize,
    pub refunded: usize,
    /// Not final yet (pending, too few confirmations, unknown)
    pub waiting: usize,
    pub errors: usize,
}

pub struct ConfirmationMonitor {
    withdrawals: Arc<WithdrawalService>,
    gateway: Arc<dyn BlockchainGateway>,
    config: MonitorConfig,
}

impl ConfirmationMonitor {
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

    pub async fn sweep(&self) -> Result<ConfirmationReport, MonitorError> {
        let processing = self
            .withdrawals
            .store()
            .list_processing_withdrawals(None, self.config.batch_size)
            .await?;
        let mut report = ConfirmationReport::default();
        if processing.is_empty() {
            return Ok(report);
        }
        debug!(count = processing.len(), "Checking processing withdrawals");

        for withdrawal in processing {
            let Some(tx_hash) = withdrawal.tx_hash.as_deref() else {
                continue;
            };

            let status = match self.gateway.check_transaction_status(tx_hash).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(transaction_id = withdrawal.id, tx_hash, error = %e, "Status check failed");
                    report.errors += 1;
                    continue;
                }
            };

            let result = match status.status {
                ChainTxStatus::Confirmed
                    if status.confirmations >= self.config.required_confirmations =>
                {
                    self.withdrawals
                        .mark_confirmed(withdrawal.id)
                        .await
                        .map(|_| report.confirmed += 1)
                }
                ChainTxStatus::Failed => {
                    warn!(
                        transaction_id = withdrawal.id,
                        tx_hash,
                        block = ?status.block_number,
                        "Withdrawal payout reverted on-chain, refunding"
                    );
                    self.withdrawals
                        .refund_and_fail(withdrawal.id, RefundGuard::Processing)
                        .await
                        .map(|_| report.refunded += 1)
                }
                _ => {
                    report.waiting += 1;
                    Ok(())
                }
            };

            if let Err(e) = result {
                warn!(transaction_id = withdrawal.id, error = %e, "Confirmation update failed");
                report.errors += 1;
            }
        }

        if report.confirmed + report.refunded > 0 {
            info!(
                confirmed = report.confirmed,
                refunded = report.refunded,
                waiting = report.waiting,
                "Confirmation sweep finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainTxReport, MockGateway};
    use crate::config::WithdrawalConfig;
    use crate::fraud::DisabledFraudDetector;
    use crate::models::{NewTransaction, TransactionStatus, User};
    use crate::notify::MemoryNotifier;
    use crate::settings::SettingsProvider;
    use crate::store::MemoryLedgerStore;
    use rust_decimal::Decimal;
    use std::time::Duration;

    #[tokio::test]
    async fn test_requires_confirmations_then_promotes() {
        let store = Arc::new(MemoryLedgerStore::new());
        let gateway = Arc::new(MockGateway::new());
        store.insert_user(User::new(1, Decimal::from(50)));
        let mut seeded = NewTransaction::withdrawal(
            1,
            Decimal::from(50),
            Decimal::ZERO,
            Decimal::from(100),
            TransactionStatus::Processing,
            "0x4444444444444444444444444444444444444444".into(),
        );
        seeded.tx_hash = Some("0xaaa".into());
        let row = store.seed_transaction(seeded);

        let withdrawals = Arc::new(WithdrawalService::new(
            store.clone(),
            gateway.clone(),
            Arc::new(MemoryNotifier::new()),
            Arc::new(DisabledFraudDetector),
            Arc::new(SettingsProvider::new(store.clone(), Duration::from_secs(30))),
            WithdrawalConfig::default(),
        ));
        let monitor = ConfirmationMonitor::new(withdrawals, gateway.clone(), MonitorConfig::default());

        gateway.set_status("0xaaa", ChainTxReport::confirmed(100, 3));
        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.waiting, 1);

        gateway.set_status("0xaaa", ChainTxReport::confirmed(100, 12));
        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(
            store.transactions_for(1)[0].status,
            TransactionStatus::Confirmed
        );
        assert_eq!(store.user(1).unwrap().balance, Decimal::from(50));
        assert_eq!(row.id, store.transactions_for(1)[0].id);
    }
}
