use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub database: PostgresConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub withdrawal: WithdrawalConfig,
    #[serde(default)]
    pub escrow: EscrowConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub workers: WorkerIntervals,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

/// BSC node and USDT (BEP-20) contract
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub usdt_contract: String,
    /// Hot wallet; must be unlocked on the node (node-managed signer)
    pub hot_wallet_address: String,
    pub token_decimals: u32,
    pub gas_limit: u64,
    pub request_timeout_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            // BSC-USD (Binance-Peg USDT)
            usdt_contract: "0x55d398326f99059fF775485246999027B3197955".to_string(),
            hot_wallet_address: String::new(),
            token_decimals: 18,
            gas_limit: 100_000,
            request_timeout_secs: 15,
        }
    }
}

/// Row-lock retry around the user debit
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LockRetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_jitter_ms: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WithdrawalConfig {
    /// Static kill switch, OR-ed with the settings flag
    pub emergency_stop: bool,
    /// Send `amount - fee` on-chain instead of the gross amount
    pub deduct_fee_on_chain: bool,
    pub fraud_block_threshold: u8,
    pub settings_cache_ttl_secs: u64,
    pub lock_retry: LockRetryConfig,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            emergency_stop: false,
            deduct_fee_on_chain: false,
            fraud_block_threshold: 80,
            settings_cache_ttl_secs: 30,
            lock_retry: LockRetryConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EscrowConfig {
    pub dual_control_withdrawal_threshold: Decimal,
    pub expires_in_hours: i64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            dual_control_withdrawal_threshold: Decimal::new(1000, 0),
            expires_in_hours: 24,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: i32,
    /// Backoff unit: `base_delay_secs * 2^attempt_count`
    pub base_delay_secs: i64,
    /// Delay before the first automatic attempt of a new record
    pub initial_delay_secs: i64,
    pub batch_size: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_secs: 60,
            initial_delay_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub stuck_after_mins: i64,
    /// More stuck transactions than this is a systemic incident
    pub systemic_threshold: usize,
    pub required_confirmations: u64,
    pub batch_size: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stuck_after_mins: 15,
            systemic_threshold: 3,
            required_confirmations: 12,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub tolerance_percent: Decimal,
    /// Add the hot wallet's on-chain USDT balance to the report
    pub include_hot_wallet: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            tolerance_percent: Decimal::new(5, 0),
            include_hot_wallet: false,
        }
    }
}

/// Background sweep periods
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerIntervals {
    pub confirmation_secs: u64,
    pub stuck_secs: u64,
    pub retry_secs: u64,
    pub escrow_expiry_secs: u64,
    pub reconciliation_secs: u64,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            confirmation_secs: 30,
            stuck_secs: 300,
            retry_secs: 60,
            escrow_expiry_secs: 300,
            reconciliation_secs: 86_400,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NotifyConfig {
    /// Admin/user events are POSTed here as JSON; log-only when unset
    pub webhook_url: Option<String>,
}

impl LockRetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
