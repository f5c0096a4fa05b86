//! Service wiring shared by the binary and the integration tests

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::LockRetryPolicy;
use crate::chain::BlockchainGateway;
use crate::config::AppConfig;
use crate::escrow::EscrowService;
use crate::fraud::FraudDetector;
use crate::monitor::{ConfirmationMonitor, StuckTransactionMonitor};
use crate::notify::Notifier;
use crate::payment_retry::PaymentRetryEngine;
use crate::reconciliation::ReconciliationEngine;
use crate::settings::SettingsProvider;
use crate::store::LedgerStore;
use crate::withdrawal::WithdrawalService;
use crate::worker::BackgroundWorkers;

pub struct Services {
    pub settings: Arc<SettingsProvider>,
    pub withdrawals: Arc<WithdrawalService>,
    pub escrow: Arc<EscrowService>,
    pub retries: Arc<PaymentRetryEngine>,
    pub confirmations: Arc<ConfirmationMonitor>,
    pub stuck: Arc<StuckTransactionMonitor>,
    pub reconciliation: Arc<ReconciliationEngine>,
}

impl Services {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn BlockchainGateway>,
        notifier: Arc<dyn Notifier>,
        fraud: Arc<dyn FraudDetector>,
    ) -> Self {
        let settings = Arc::new(SettingsProvider::new(
            store.clone(),
            Duration::from_secs(config.withdrawal.settings_cache_ttl_secs),
        ));
        let withdrawals = Arc::new(WithdrawalService::new(
            store.clone(),
            gateway.clone(),
            notifier.clone(),
            fraud,
            settings.clone(),
            config.withdrawal.clone(),
        ));
        let escrow = Arc::new(EscrowService::new(
            withdrawals.clone(),
            config.escrow.clone(),
        ));
        let retries = Arc::new(PaymentRetryEngine::new(
            store.clone(),
            gateway.clone(),
            notifier.clone(),
            config.retry.clone(),
            LockRetryPolicy::from(&config.withdrawal.lock_retry),
        ));
        let confirmations = Arc::new(ConfirmationMonitor::new(
            withdrawals.clone(),
            gateway.clone(),
            config.monitor.clone(),
        ));
        let stuck = Arc::new(StuckTransactionMonitor::new(
            withdrawals.clone(),
            gateway.clone(),
            config.monitor.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationEngine::new(
            store,
            gateway,
            notifier,
            config.reconciliation.clone(),
            config.chain.hot_wallet_address.clone(),
        ));

        Self {
            settings,
            withdrawals,
            escrow,
            retries,
            confirmations,
            stuck,
            reconciliation,
        }
    }

    pub fn workers(&self, config: &AppConfig) -> BackgroundWorkers {
        BackgroundWorkers {
            escrow: self.escrow.clone(),
            retries: self.retries.clone(),
            confirmations: self.confirmations.clone(),
            stuck: self.stuck.clone(),
            reconciliation: self.reconciliation.clone(),
            intervals: config.workers.clone(),
        }
    }
}
