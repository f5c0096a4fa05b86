//! Scriptable in-process gateway for tests and local runs

use super::{BlockchainGateway, ChainError, ChainTxReport, is_evm_address};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// A payment accepted by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct SentPayment {
    pub to_address: String,
    pub amount: Decimal,
    pub tx_hash: String,
}

#[derive(Default)]
pub struct MockGateway {
    sent: Mutex<Vec<SentPayment>>,
    send_attempts: AtomicUsize,
    /// Next N sends fail
    failures_remaining: AtomicUsize,
    always_fail: AtomicBool,
    send_delay_ms: AtomicU64,
    statuses: Mutex<HashMap<String, ChainTxReport>>,
    balances: Mutex<HashMap<String, Decimal>>,
    gas_price: AtomicU64,
    status_error: AtomicBool,
    hash_seq: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_sends(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Hold every send for `delay` before answering
    pub fn set_send_delay(&self, delay: Duration) {
        self.send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_status(&self, tx_hash: &str, report: ChainTxReport) {
        self.lock_statuses().insert(tx_hash.to_string(), report);
    }

    /// Make `check_transaction_status` return a network error
    pub fn set_status_error(&self, fail: bool) {
        self.status_error.store(fail, Ordering::SeqCst);
    }

    pub fn set_balance(&self, address: &str, balance: Decimal) {
        self.lock_balances().insert(address.to_lowercase(), balance);
    }

    pub fn set_gas_price(&self, wei: u64) {
        self.gas_price.store(wei, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentPayment> {
        self.lock_sent().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.lock_sent().len()
    }

    /// Successful and failed sends
    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    fn lock_sent(&self) -> std::sync::MutexGuard<'_, Vec<SentPayment>> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_statuses(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChainTxReport>> {
        self.statuses.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_balances(&self) -> std::sync::MutexGuard<'_, HashMap<String, Decimal>> {
        self.balances.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn should_fail(&self) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BlockchainGateway for MockGateway {
    async fn send_payment(&self, to_address: &str, amount: Decimal) -> Result<String, ChainError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !is_evm_address(to_address) {
            return Err(ChainError::InvalidAddress(to_address.to_string()));
        }
        if self.should_fail() {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "insufficient funds for gas".to_string(),
            });
        }

        let seq = self.hash_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let tx_hash = format!("0x{:064x}", seq);
        self.lock_sent().push(SentPayment {
            to_address: to_address.to_string(),
            amount,
            tx_hash: tx_hash.clone(),
        });
        self.lock_statuses()
            .insert(tx_hash.clone(), ChainTxReport::pending(Some(5_000_000_000)));
        Ok(tx_hash)
    }

    async fn check_transaction_status(&self, tx_hash: &str) -> Result<ChainTxReport, ChainError> {
        if self.status_error.load(Ordering::SeqCst) {
            return Err(ChainError::Network("connection refused".to_string()));
        }
        Ok(self
            .lock_statuses()
            .get(tx_hash)
            .copied()
            .unwrap_or_else(ChainTxReport::unknown))
    }

    fn validate_wallet_address(&self, address: &str) -> bool {
        is_evm_address(address)
    }

    async fn get_usdt_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        Ok(self
            .lock_balances()
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.gas_price.load(Ordering::SeqCst) as u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainTxStatus;

    const TO: &str = "0x2222222222222222222222222222222222222222";

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let gateway = MockGateway::new();
        gateway.fail_next_sends(2);

        assert!(gateway.send_payment(TO, Decimal::ONE).await.is_err());
        assert!(gateway.send_payment(TO, Decimal::ONE).await.is_err());
        let hash = gateway.send_payment(TO, Decimal::ONE).await.unwrap();

        assert_eq!(gateway.send_attempts(), 3);
        assert_eq!(gateway.sent_count(), 1);
        let report = gateway.check_transaction_status(&hash).await.unwrap();
        assert_eq!(report.status, ChainTxStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_hash() {
        let gateway = MockGateway::new();
        let report = gateway.check_transaction_status("0xdead").await.unwrap();
        assert_eq!(report.status, ChainTxStatus::Unknown);
    }
}
