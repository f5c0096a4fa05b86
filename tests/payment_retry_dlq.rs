//! Failed earning payouts: backoff, dead-letter queue, manual requeue

mod common;

use chrono::{Duration, Utc};
use common::{WALLET, harness};
use rust_decimal::Decimal;

use balance_guard::models::{PaymentRetry, PaymentType, TransactionType, User};
use balance_guard::notify::AdminAlert;
use balance_guard::payment_retry::{NewRetry, RetryError};
use balance_guard::store::LedgerStore;

fn referral_user(h: &common::Harness) {
    let mut user = User::new(1, Decimal::ZERO).with_wallet(WALLET);
    user.pending_earnings = Decimal::from(25);
    h.store.insert_user(user);
}

async fn reload(h: &common::Harness, id: i64) -> PaymentRetry {
    h.store.get_retry(id).await.unwrap().unwrap()
}

/// Sweep at the record's own due time until `attempts` attempts have run
async fn fail_attempts(h: &common::Harness, id: i64, attempts: usize) -> PaymentRetry {
    for _ in 0..attempts {
        let due = reload(h, id).await.next_retry_at.expect("record still scheduled");
        h.services.retries.process_pending_retries_at(due).await.unwrap();
    }
    reload(h, id).await
}

#[tokio::test]
async fn five_failures_dead_letter_then_manual_retry_resolves() {
    let h = harness();
    referral_user(&h);
    let earning = h
        .store
        .add_earning(1, PaymentType::ReferralEarning, Decimal::from(25));

    let record = h
        .services
        .retries
        .create_retry_record(NewRetry {
            user_id: 1,
            amount: Decimal::from(25),
            payment_type: PaymentType::ReferralEarning,
            earning_ids: vec![earning],
            error: "execution reverted".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(record.attempt_count, 0);
    assert!(record.next_retry_at.unwrap() > Utc::now());

    h.gateway.set_always_fail(true);
    let parked = fail_attempts(&h, record.id, 5).await;
    assert!(parked.in_dlq);
    assert_eq!(parked.attempt_count, 5);
    assert!(parked.next_retry_at.is_none());
    assert!(!parked.resolved);
    assert_eq!(h.gateway.send_attempts(), 5);
    assert!(h.notifier.admin_alerts().iter().any(|a| matches!(
        a,
        AdminAlert::PayoutInDlq { retry_id, .. } if *retry_id == record.id
    )));

    let dlq = h.services.retries.get_dlq_items().await.unwrap();
    assert_eq!(dlq.len(), 1);
    let stats = h.services.retries.get_retry_stats().await.unwrap();
    assert_eq!(stats.dlq_count, 1);
    assert_eq!(stats.dlq_amount, Decimal::from(25));

    // sweeps leave DLQ items alone
    let report = h
        .services
        .retries
        .process_pending_retries_at(Utc::now() + Duration::days(30))
        .await
        .unwrap();
    assert_eq!(report.resolved + report.rescheduled + report.dead_lettered, 0);

    h.gateway.set_always_fail(false);
    let resolved = h.services.retries.retry_dlq_item(record.id).await.unwrap();
    assert!(resolved.resolved);
    assert!(!resolved.in_dlq);
    assert!(resolved.tx_hash.is_some());
    assert!(h.store.earning(earning).unwrap().paid);

    let user = h.store.user(1).unwrap();
    assert_eq!(user.pending_earnings, Decimal::ZERO);
    assert_eq!(user.total_earned, Decimal::from(25));
    assert_eq!(user.balance, Decimal::ZERO);
    assert!(h
        .store
        .transactions_for(1)
        .iter()
        .any(|t| t.tx_type == TransactionType::ReferralReward && t.tx_hash == resolved.tx_hash));

    let stats = h.services.retries.get_retry_stats().await.unwrap();
    assert_eq!(stats.resolved_count, 1);
    assert_eq!(stats.dlq_count, 0);
}

#[tokio::test]
async fn fourth_failure_is_still_scheduled_with_backoff() {
    let h = harness();
    referral_user(&h);
    let record = h
        .services
        .retries
        .create_retry_record(NewRetry {
            user_id: 1,
            amount: Decimal::from(10),
            payment_type: PaymentType::DepositReward,
            earning_ids: vec![],
            error: "nonce too low".to_string(),
        })
        .await
        .unwrap();

    h.gateway.set_always_fail(true);
    let before = reload(&h, record.id).await.next_retry_at.unwrap();
    let after_one = fail_attempts(&h, record.id, 1).await;
    assert_eq!(after_one.attempt_count, 1);
    assert_eq!(
        after_one.next_retry_at.unwrap() - before,
        Duration::minutes(2)
    );

    let after_four = fail_attempts(&h, record.id, 3).await;
    assert_eq!(after_four.attempt_count, 4);
    assert!(!after_four.in_dlq);
    assert!(after_four.next_retry_at.is_some());
    assert!(after_four.last_error.unwrap().contains("insufficient funds"));
}

#[tokio::test]
async fn retry_dlq_item_rejects_records_outside_the_queue() {
    let h = harness();
    referral_user(&h);
    let record = h
        .services
        .retries
        .create_retry_record(NewRetry {
            user_id: 1,
            amount: Decimal::from(3),
            payment_type: PaymentType::ReferralEarning,
            earning_ids: vec![],
            error: "timeout".to_string(),
        })
        .await
        .unwrap();

    assert!(matches!(
        h.services.retries.retry_dlq_item(record.id).await,
        Err(RetryError::NotInDlq(_))
    ));
    assert!(matches!(
        h.services.retries.retry_dlq_item(9_999).await,
        Err(RetryError::NotFound(9_999))
    ));
}

#[tokio::test]
async fn zero_amount_is_refused() {
    let h = harness();
    referral_user(&h);
    let err = h
        .services
        .retries
        .create_retry_record(NewRetry {
            user_id: 1,
            amount: Decimal::ZERO,
            payment_type: PaymentType::ReferralEarning,
            earning_ids: vec![],
            error: "timeout".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RetryError::InvalidAmount));
}
