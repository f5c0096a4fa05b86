//! Daily reconciliation over a seeded ledger

mod common;

use chrono::NaiveDate;
use common::{WALLET, harness, usdt};
use rust_decimal::Decimal;

use balance_guard::models::{
    NewTransaction, PaymentType, ReconciliationStatus, TransactionStatus, User,
};
use balance_guard::notify::AdminAlert;

fn withdrawal(user_id: i64, amount: i64, status: TransactionStatus) -> NewTransaction {
    NewTransaction::withdrawal(
        user_id,
        Decimal::from(amount),
        Decimal::ZERO,
        Decimal::from(amount),
        status,
        WALLET.to_string(),
    )
}

/// deposits 1000, withdrawals 200, referrals paid 50; balances as given
fn seed(h: &common::Harness, balances: [i64; 2]) {
    let mut first = User::new(1, Decimal::from(balances[0])).with_wallet(WALLET);
    first.pending_earnings = Decimal::from(20);
    h.store.insert_user(first);
    h.store
        .insert_user(User::new(2, Decimal::from(balances[1])).with_wallet(WALLET));

    h.store
        .add_deposit(1, Decimal::from(600), TransactionStatus::Confirmed);
    h.store
        .add_deposit(2, Decimal::from(400), TransactionStatus::Confirmed);
    // never counted
    h.store
        .add_deposit(2, Decimal::from(999), TransactionStatus::Pending);

    h.store
        .seed_transaction(withdrawal(1, 200, TransactionStatus::Confirmed));
    h.store
        .seed_transaction(withdrawal(2, 10, TransactionStatus::Pending));
    h.store
        .seed_transaction(withdrawal(2, 77, TransactionStatus::Failed));

    let referral = h
        .store
        .add_earning(2, PaymentType::ReferralEarning, Decimal::from(50));
    h.store.set_earning_paid(referral);
    // rewards are not referrals
    let reward = h
        .store
        .add_earning(1, PaymentType::DepositReward, Decimal::from(5));
    h.store.set_earning_paid(reward);
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
}

#[tokio::test]
async fn small_shortfall_within_tolerance_is_reconciled() {
    let h = harness();
    seed(&h, [400, 300]);

    let snapshot = h
        .services
        .reconciliation
        .perform_reconciliation(Some(date()))
        .await
        .unwrap();
    assert_eq!(snapshot.expected_balance, Decimal::from(750));
    assert_eq!(snapshot.actual_balance, Decimal::from(730));
    assert_eq!(snapshot.discrepancy, Decimal::from(-20));
    assert_eq!(snapshot.discrepancy_percent, usdt("-2.67"));
    assert_eq!(snapshot.reconciliation_status, ReconciliationStatus::Reconciled);
    assert!(h.notifier.admin_alerts().is_empty());

    let categories = &snapshot.reconciliation_report["categories"];
    assert_eq!(categories["pending_withdrawals"]["count"], 1);
    assert_eq!(categories["user_balances"]["count"], 2);
}

#[tokio::test]
async fn large_shortfall_raises_discrepancy_without_touching_balances() {
    let h = harness();
    seed(&h, [300, 300]);

    let snapshot = h
        .services
        .reconciliation
        .perform_reconciliation(Some(date()))
        .await
        .unwrap();
    assert_eq!(snapshot.actual_balance, Decimal::from(630));
    assert_eq!(snapshot.discrepancy_percent, usdt("-16.00"));
    assert_eq!(snapshot.reconciliation_status, ReconciliationStatus::Discrepancy);
    assert!(h.notifier.admin_alerts().iter().any(|a| matches!(
        a,
        AdminAlert::ReconciliationDiscrepancy { .. }
    )));
    assert_eq!(h.balance(1), Decimal::from(300));
    assert_eq!(h.balance(2), Decimal::from(300));
}

#[tokio::test]
async fn rerun_for_same_date_replaces_the_snapshot() {
    let h = harness();
    seed(&h, [400, 300]);

    let first = h
        .services
        .reconciliation
        .perform_reconciliation(Some(date()))
        .await
        .unwrap();
    let second = h
        .services
        .reconciliation
        .perform_reconciliation(Some(date()))
        .await
        .unwrap();
    assert_eq!(first.expected_balance, second.expected_balance);
    assert_eq!(first.actual_balance, second.actual_balance);
    assert_eq!(first.reconciliation_status, second.reconciliation_status);

    let stored = h
        .services
        .reconciliation
        .get_snapshot(date())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.discrepancy_percent, second.discrepancy_percent);
    assert!(h
        .services
        .reconciliation
        .get_snapshot(date().succ_opt().unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn hot_wallet_balance_is_reported_when_enabled() {
    let mut config = common::config();
    config.reconciliation.include_hot_wallet = true;
    let h = common::harness_with(config);
    seed(&h, [400, 300]);
    h.gateway.set_balance(common::HOT_WALLET, Decimal::from(745));

    let snapshot = h
        .services
        .reconciliation
        .perform_reconciliation(Some(date()))
        .await
        .unwrap();
    let hot = &snapshot.reconciliation_report["hot_wallet"];
    assert_eq!(hot["address"], common::HOT_WALLET);
    assert!(hot.get("balance").is_some());
    // informational only
    assert_eq!(snapshot.actual_balance, Decimal::from(730));
}
