//! Shared fixture: every service wired over the in-memory store, the mock
//! gateway and a recording notifier.

#![allow(dead_code)]

use rust_decimal::Decimal;
use std::sync::Arc;

use balance_guard::Services;
use balance_guard::chain::MockGateway;
use balance_guard::config::AppConfig;
use balance_guard::fraud::StaticFraudDetector;
use balance_guard::models::{GlobalSettings, User};
use balance_guard::notify::MemoryNotifier;
use balance_guard::store::MemoryLedgerStore;
use balance_guard::withdrawal::WithdrawalRequest;

pub const WALLET: &str = "0x1111111111111111111111111111111111111111";
pub const HOT_WALLET: &str = "0x9999999999999999999999999999999999999999";

/// Short lock-retry delays so contention tests finish quickly
const TEST_CONFIG: &str = r#"
log_level: debug
log_dir: ./logs
log_file: test.log
use_json: false
rotation: never
database:
  url: postgresql://unused
chain:
  hot_wallet_address: "0x9999999999999999999999999999999999999999"
withdrawal:
  lock_retry:
    max_attempts: 5
    base_delay_ms: 2
    max_jitter_ms: 3
escrow:
  dual_control_withdrawal_threshold: 1000
  expires_in_hours: 24
retry:
  max_retries: 5
  base_delay_secs: 60
  initial_delay_secs: 60
monitor:
  stuck_after_mins: 15
  systemic_threshold: 3
reconciliation:
  tolerance_percent: 5
"#;

pub struct Harness {
    pub config: AppConfig,
    pub store: Arc<MemoryLedgerStore>,
    pub gateway: Arc<MockGateway>,
    pub notifier: Arc<MemoryNotifier>,
    pub fraud: Arc<StaticFraudDetector>,
    pub services: Services,
}

pub fn config() -> AppConfig {
    AppConfig::from_yaml(TEST_CONFIG).expect("test config parses")
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: AppConfig) -> Harness {
    let store = Arc::new(MemoryLedgerStore::new());
    let gateway = Arc::new(MockGateway::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let fraud = Arc::new(StaticFraudDetector::new());
    let services = Services::new(
        &config,
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        fraud.clone(),
    );
    Harness {
        config,
        store,
        gateway,
        notifier,
        fraud,
        services,
    }
}

impl Harness {
    /// Clean user with a valid wallet
    pub fn user(&self, id: i64, balance: i64) {
        self.store
            .insert_user(User::new(id, Decimal::from(balance)).with_wallet(WALLET));
    }

    pub fn balance(&self, id: i64) -> Decimal {
        self.store.user(id).expect("user exists").balance
    }

    pub async fn settings(&self, settings: GlobalSettings) {
        self.services
            .settings
            .update(&settings)
            .await
            .expect("settings update");
    }
}

/// Request with the caller's view of the balance matching the amount asked
pub fn request(user_id: i64, amount: i64, available: i64) -> WithdrawalRequest {
    WithdrawalRequest {
        user_id,
        amount: Decimal::from(amount),
        available_balance: Decimal::from(available),
    }
}

pub fn usdt(s: &str) -> Decimal {
    s.parse().expect("decimal literal")
}
