//! Dual-control approval of large withdrawals

mod common;

use common::{harness, request};
use rust_decimal::Decimal;
use std::time::Duration;

use balance_guard::escrow::{ApprovalOutcome, EscrowError};
use balance_guard::models::{AdminActionEscrow, EscrowOperation, EscrowStatus, TransactionStatus};
use balance_guard::notify::AdminAlert;
use balance_guard::withdrawal::WithdrawalError;

const ADMIN_A: i64 = 101;
const ADMIN_B: i64 = 102;
const ADMIN_C: i64 = 103;

fn expect_escrow(outcome: ApprovalOutcome) -> AdminActionEscrow {
    match outcome {
        ApprovalOutcome::Escrow(escrow) => escrow,
        other => panic!("expected escrow, got {:?}", other),
    }
}

#[tokio::test]
async fn large_withdrawal_needs_two_admins() {
    let h = harness();
    h.user(1, 5000);
    let w = h
        .services
        .withdrawals
        .request_withdrawal(request(1, 5000, 5000))
        .await
        .unwrap()
        .transaction;

    let escrow = expect_escrow(
        h.services
            .escrow
            .approve_withdrawal_via_escrow(w.id, ADMIN_A)
            .await
            .unwrap(),
    );
    assert_eq!(escrow.status, EscrowStatus::Pending);
    assert_eq!(escrow.target_id, w.id);
    assert_eq!(h.gateway.send_attempts(), 0);
    let row = h.services.withdrawals.get_withdrawal_by_id(w.id).await.unwrap().unwrap();
    assert_eq!(row.status, TransactionStatus::Pending);
    assert!(h.notifier.admin_alerts().iter().any(|a| matches!(
        a,
        AdminAlert::EscrowAwaitingApproval { initiator_admin_id: ADMIN_A, .. }
    )));

    let err = h.services.escrow.approve(escrow.id, ADMIN_A).await.unwrap_err();
    assert!(matches!(err, EscrowError::SelfApproval { .. }));
    assert_eq!(err.code(), "SELF_APPROVAL");
    assert_eq!(h.gateway.send_attempts(), 0);

    let approval = h.services.escrow.approve(escrow.id, ADMIN_B).await.unwrap();
    assert_eq!(approval.escrow.status, EscrowStatus::Approved);
    assert_eq!(approval.escrow.approver_admin_id, Some(ADMIN_B));
    assert_eq!(approval.transaction.status, TransactionStatus::Processing);
    assert!(approval.transaction.tx_hash.is_some());
    assert_eq!(h.gateway.sent_count(), 1);
    assert_eq!(h.gateway.sent()[0].amount, Decimal::from(5000));
    assert_eq!(h.balance(1), Decimal::ZERO);
}

#[tokio::test]
async fn below_threshold_is_paid_directly() {
    let h = harness();
    h.user(1, 500);
    let w = h
        .services
        .withdrawals
        .request_withdrawal(request(1, 300, 500))
        .await
        .unwrap()
        .transaction;
    match h
        .services
        .escrow
        .approve_withdrawal_via_escrow(w.id, ADMIN_A)
        .await
        .unwrap()
    {
        ApprovalOutcome::DirectApproval {
            tx_hash,
            transaction,
        } => {
            assert_eq!(transaction.status, TransactionStatus::Processing);
            assert_eq!(transaction.tx_hash.as_deref(), Some(tx_hash.as_str()));
        }
        other => panic!("expected direct approval, got {:?}", other),
    }
    assert_eq!(h.gateway.sent_count(), 1);
}

#[tokio::test]
async fn threshold_amount_itself_goes_to_escrow() {
    let h = harness();
    h.user(1, 1000);
    let w = h
        .services
        .withdrawals
        .request_withdrawal(request(1, 1000, 1000))
        .await
        .unwrap()
        .transaction;

    let outcome = h
        .services
        .escrow
        .approve_withdrawal_via_escrow(w.id, ADMIN_A)
        .await
        .unwrap();
    assert!(matches!(outcome, ApprovalOutcome::Escrow(_)));
    assert_eq!(h.gateway.send_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_second_approvals_pay_once() {
    let h = harness();
    h.user(1, 2000);
    let w = h
        .services
        .withdrawals
        .request_withdrawal(request(1, 2000, 2000))
        .await
        .unwrap()
        .transaction;
    let escrow = expect_escrow(
        h.services
            .escrow
            .approve_withdrawal_via_escrow(w.id, ADMIN_A)
            .await
            .unwrap(),
    );
    h.gateway.set_send_delay(Duration::from_millis(50));

    let first = {
        let escrow_service = h.services.escrow.clone();
        tokio::spawn(async move { escrow_service.approve(escrow.id, ADMIN_B).await })
    };
    let second = {
        let escrow_service = h.services.escrow.clone();
        tokio::spawn(async move { escrow_service.approve(escrow.id, ADMIN_C).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    let approved = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(approved, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(EscrowError::AlreadyProcessed {
            status: EscrowStatus::Approved,
            ..
        })
    )));
    assert_eq!(h.gateway.send_attempts(), 1);
    assert_eq!(h.gateway.sent_count(), 1);
}

#[tokio::test]
async fn gateway_failure_keeps_escrow_pending() {
    let h = harness();
    h.user(1, 3000);
    let w = h
        .services
        .withdrawals
        .request_withdrawal(request(1, 3000, 3000))
        .await
        .unwrap()
        .transaction;
    let escrow = expect_escrow(
        h.services
            .escrow
            .approve_withdrawal_via_escrow(w.id, ADMIN_A)
            .await
            .unwrap(),
    );

    h.gateway.fail_next_sends(1);
    let err = h.services.escrow.approve(escrow.id, ADMIN_B).await.unwrap_err();
    assert!(matches!(
        err,
        EscrowError::Withdrawal(WithdrawalError::Chain(_))
    ));
    let stored = h.services.escrow.get(escrow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EscrowStatus::Pending);
    let row = h.services.withdrawals.get_withdrawal_by_id(w.id).await.unwrap().unwrap();
    assert_eq!(row.status, TransactionStatus::Pending);
    assert!(row.tx_hash.is_none());

    // second try goes through
    let approval = h.services.escrow.approve(escrow.id, ADMIN_B).await.unwrap();
    assert_eq!(approval.escrow.status, EscrowStatus::Approved);
    assert_eq!(h.gateway.sent_count(), 1);
}

#[tokio::test]
async fn user_cancel_closes_open_escrow() {
    let h = harness();
    h.user(1, 1500);
    let w = h
        .services
        .withdrawals
        .request_withdrawal(request(1, 1500, 1500))
        .await
        .unwrap()
        .transaction;
    let escrow = expect_escrow(
        h.services
            .escrow
            .approve_withdrawal_via_escrow(w.id, ADMIN_A)
            .await
            .unwrap(),
    );

    h.services.withdrawals.cancel_withdrawal(w.id, 1).await.unwrap();
    assert_eq!(h.balance(1), Decimal::from(1500));

    let closed = h.services.escrow.get(escrow.id).await.unwrap().unwrap();
    assert_eq!(closed.status, EscrowStatus::Rejected);
    assert_eq!(closed.rejected_by_admin_id, None);
    assert!(closed.rejection_reason.is_some());
    assert!(
        h.services
            .escrow
            .get_pending_by_operation(EscrowOperation::WithdrawalApproval)
            .await
            .unwrap()
            .is_empty()
    );

    let err = h.services.escrow.approve(escrow.id, ADMIN_B).await.unwrap_err();
    assert!(matches!(
        err,
        EscrowError::AlreadyProcessed {
            status: EscrowStatus::Rejected,
            ..
        }
    ));
    let err = h
        .services
        .escrow
        .reject(escrow.id, ADMIN_B, "too late".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::AlreadyProcessed { .. }));

    assert_eq!(h.balance(1), Decimal::from(1500));
    assert_eq!(h.gateway.sent_count(), 0);
    let expired = h
        .services
        .escrow
        .mark_expired_at(escrow.expires_at + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(expired, 0);
}

#[tokio::test]
async fn expired_escrow_cannot_be_approved() {
    let h = harness();
    h.user(1, 4000);
    let w = h
        .services
        .withdrawals
        .request_withdrawal(request(1, 4000, 4000))
        .await
        .unwrap()
        .transaction;
    let escrow = expect_escrow(
        h.services
            .escrow
            .approve_withdrawal_via_escrow(w.id, ADMIN_A)
            .await
            .unwrap(),
    );

    let expired = h
        .services
        .escrow
        .mark_expired_at(escrow.expires_at + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let err = h.services.escrow.approve(escrow.id, ADMIN_B).await.unwrap_err();
    assert!(matches!(
        err,
        EscrowError::AlreadyProcessed {
            status: EscrowStatus::Expired,
            ..
        }
    ));
    assert_eq!(h.gateway.send_attempts(), 0);
    // still the admins' call: no automatic refund
    assert_eq!(h.balance(1), Decimal::ZERO);
}
