//! Confirmation and stuck-transaction sweeps

mod common;

use chrono::{Duration, Utc};
use common::{harness, request};
use rust_decimal::Decimal;

use balance_guard::chain::{ChainTxReport, ChainTxStatus};
use balance_guard::models::{GlobalSettings, Transaction, TransactionStatus};
use balance_guard::monitor::StuckAction;
use balance_guard::notify::AdminAlert;
use balance_guard::withdrawal::WithdrawalError;

const GWEI: u64 = 1_000_000_000;

/// Withdrawal paid through the mock gateway, PROCESSING with a hash
async fn paid_withdrawal(h: &common::Harness, user_id: i64, amount: i64) -> Transaction {
    h.user(user_id, amount);
    let w = h
        .services
        .withdrawals
        .request_withdrawal(request(user_id, amount, amount))
        .await
        .unwrap()
        .transaction;
    h.services.withdrawals.approve_direct(w.id, 900).await.unwrap()
}

fn hash(t: &Transaction) -> String {
    t.tx_hash.clone().expect("paid withdrawal has a hash")
}

async fn status(h: &common::Harness, id: i64) -> TransactionStatus {
    h.services
        .withdrawals
        .get_withdrawal_by_id(id)
        .await
        .unwrap()
        .expect("withdrawal exists")
        .status
}

fn later() -> chrono::DateTime<Utc> {
    Utc::now() + Duration::minutes(16)
}

#[tokio::test]
async fn stuck_sweep_settles_or_recommends() {
    let h = harness();
    let confirmed = paid_withdrawal(&h, 1, 10).await;
    let reverted = paid_withdrawal(&h, 2, 20).await;
    let underpriced = paid_withdrawal(&h, 3, 30).await;

    h.gateway
        .set_status(&hash(&confirmed), ChainTxReport::confirmed(500, 20));
    h.gateway.set_status(&hash(&reverted), ChainTxReport::failed(501));
    h.gateway
        .set_status(&hash(&underpriced), ChainTxReport::pending(Some(3 * GWEI as u128)));
    h.gateway.set_gas_price(5 * GWEI);

    // too recent to count as stuck
    let report = h.services.stuck.sweep().await.unwrap();
    assert_eq!(report.checked, 0);

    let report = h.services.stuck.sweep_at(later()).await.unwrap();
    assert_eq!(report.checked, 3);
    assert!(!report.systemic_incident);

    let action = |id: i64| {
        report
            .items
            .iter()
            .find(|i| i.transaction_id == id)
            .map(|i| i.action.clone())
            .unwrap()
    };
    assert_eq!(action(confirmed.id), StuckAction::Confirmed);
    assert_eq!(action(reverted.id), StuckAction::Refunded);
    assert_eq!(
        action(underpriced.id),
        StuckAction::SpeedUpRecommended {
            original_gas_price: 3 * GWEI as u128,
            current_gas_price: 5 * GWEI as u128,
        }
    );

    assert_eq!(status(&h, confirmed.id).await, TransactionStatus::Confirmed);
    assert_eq!(status(&h, reverted.id).await, TransactionStatus::Failed);
    assert_eq!(status(&h, underpriced.id).await, TransactionStatus::Processing);
    assert_eq!(h.balance(2), Decimal::from(20));
    assert_eq!(h.balance(3), Decimal::ZERO);
}

#[tokio::test]
async fn unknown_payout_is_never_refunded() {
    let h = harness();
    let lost = paid_withdrawal(&h, 1, 40).await;
    h.gateway.set_status(&hash(&lost), ChainTxReport::unknown());

    let report = h.services.stuck.sweep_at(later()).await.unwrap();
    assert_eq!(report.items[0].action, StuckAction::ManualResendReview);
    assert_eq!(report.items[0].chain_status, Some(ChainTxStatus::Unknown));
    assert_eq!(report.still_stuck(), 1);
    assert_eq!(h.balance(1), Decimal::ZERO);
    assert!(h.notifier.admin_alerts().iter().any(|a| matches!(
        a,
        AdminAlert::StuckTransaction { transaction_id, .. } if *transaction_id == lost.id
    )));
}

#[tokio::test]
async fn more_than_three_stuck_is_systemic() {
    let h = harness();
    for user_id in 1..=4 {
        let w = paid_withdrawal(&h, user_id, 10).await;
        h.gateway.set_status(&hash(&w), ChainTxReport::unknown());
    }

    let report = h.services.stuck.sweep_at(later()).await.unwrap();
    assert_eq!(report.still_stuck(), 4);
    assert!(report.systemic_incident);
    assert!(h.notifier.admin_alerts().iter().any(|a| matches!(
        a,
        AdminAlert::SystemicStuckIncident { stuck_count: 4 }
    )));
}

#[tokio::test]
async fn exactly_three_stuck_is_not_systemic() {
    let h = harness();
    for user_id in 1..=3 {
        let w = paid_withdrawal(&h, user_id, 10).await;
        h.gateway.set_status(&hash(&w), ChainTxReport::unknown());
    }

    let report = h.services.stuck.sweep_at(later()).await.unwrap();
    assert_eq!(report.still_stuck(), 3);
    assert!(!report.systemic_incident);
}

#[tokio::test]
async fn status_check_failure_leaves_row_alone() {
    let h = harness();
    let w = paid_withdrawal(&h, 1, 10).await;
    h.gateway.set_status_error(true);

    let report = h.services.stuck.sweep_at(later()).await.unwrap();
    assert!(matches!(report.items[0].action, StuckAction::CheckFailed { .. }));
    let row = h.services.withdrawals.get_withdrawal_by_id(w.id).await.unwrap().unwrap();
    assert_eq!(row.status, TransactionStatus::Processing);
}

#[tokio::test]
async fn confirmation_sweep_promotes_after_enough_blocks() {
    let h = harness();
    let w = paid_withdrawal(&h, 1, 10).await;

    h.gateway.set_status(&hash(&w), ChainTxReport::confirmed(100, 2));
    let report = h.services.confirmations.sweep().await.unwrap();
    assert_eq!(report.waiting, 1);
    assert_eq!(report.confirmed, 0);

    h.gateway.set_status(&hash(&w), ChainTxReport::confirmed(100, 12));
    let report = h.services.confirmations.sweep().await.unwrap();
    assert_eq!(report.confirmed, 1);
    let row = h.services.withdrawals.get_withdrawal_by_id(w.id).await.unwrap().unwrap();
    assert_eq!(row.status, TransactionStatus::Confirmed);
}

#[tokio::test]
async fn confirmation_sweep_refunds_reverted_payout() {
    let h = harness();
    let w = paid_withdrawal(&h, 1, 10).await;
    h.gateway.set_status(&hash(&w), ChainTxReport::failed(100));

    let report = h.services.confirmations.sweep().await.unwrap();
    assert_eq!(report.refunded, 1);
    assert_eq!(h.balance(1), Decimal::from(10));

    // second sweep finds nothing to refund
    let report = h.services.confirmations.sweep().await.unwrap();
    assert_eq!(report.refunded, 0);
    assert_eq!(h.balance(1), Decimal::from(10));
}

#[tokio::test]
async fn undispatched_auto_withdrawal_is_surfaced_and_refundable() {
    let h = harness();
    h.user(1, 200);
    h.store
        .add_deposit(1, Decimal::from(100), TransactionStatus::Confirmed);
    h.settings(GlobalSettings {
        auto_withdrawal_enabled: true,
        ..GlobalSettings::default()
    })
    .await;

    // debited and auto-approved, then never dispatched
    let w = h
        .services
        .withdrawals
        .request_withdrawal(request(1, 10, 200))
        .await
        .unwrap()
        .transaction;
    assert_eq!(w.status, TransactionStatus::Processing);
    assert_eq!(h.balance(1), Decimal::from(190));

    let undispatched = h
        .services
        .withdrawals
        .get_undispatched_withdrawals()
        .await
        .unwrap();
    assert_eq!(undispatched.len(), 1);
    assert_eq!(undispatched[0].id, w.id);

    let report = h.services.stuck.sweep().await.unwrap();
    assert!(report.undispatched.is_empty());

    let report = h.services.stuck.sweep_at(later()).await.unwrap();
    assert_eq!(report.checked, 0);
    assert_eq!(report.undispatched, vec![w.id]);
    assert!(h.notifier.admin_alerts().iter().any(|a| matches!(
        a,
        AdminAlert::UndispatchedWithdrawal { transaction_id, .. } if *transaction_id == w.id
    )));

    h.services
        .withdrawals
        .reject_withdrawal(w.id, Some("dispatch never ran".into()))
        .await
        .unwrap();
    assert_eq!(status(&h, w.id).await, TransactionStatus::Failed);
    assert_eq!(h.balance(1), Decimal::from(200));
    assert!(
        h.services
            .withdrawals
            .get_undispatched_withdrawals()
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn paid_out_withdrawal_cannot_be_rejected() {
    let h = harness();
    let paid = paid_withdrawal(&h, 1, 10).await;

    let err = h
        .services
        .withdrawals
        .reject_withdrawal(paid.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WithdrawalError::InvalidTransition { .. }));
    assert_eq!(status(&h, paid.id).await, TransactionStatus::Processing);
    assert_eq!(h.balance(1), Decimal::ZERO);
}
