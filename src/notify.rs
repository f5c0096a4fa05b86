//! Notifications
//!
//! Fire-and-forget: a notifier never fails the operation that triggered it.
//! Delivery to the chat bot / admin channel happens behind this trait.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::chain::ChainTxStatus;
use crate::core_types::{AdminId, EscrowId, RetryId, TransactionId, UserId};
use crate::models::PaymentType;

/// Event relayed to one user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UserNotice {
    WithdrawalRequested {
        user_id: UserId,
        transaction_id: TransactionId,
        amount: Decimal,
        auto_approved: bool,
    },
    WithdrawalApproved {
        user_id: UserId,
        transaction_id: TransactionId,
        amount: Decimal,
        tx_hash: String,
    },
    WithdrawalConfirmed {
        user_id: UserId,
        transaction_id: TransactionId,
        amount: Decimal,
    },
    WithdrawalRejected {
        user_id: UserId,
        transaction_id: TransactionId,
        amount: Decimal,
        reason: Option<String>,
    },
    /// Balance returned after cancel, chain failure or freeze
    WithdrawalRefunded {
        user_id: UserId,
        transaction_id: TransactionId,
        amount: Decimal,
    },
}

impl UserNotice {
    pub fn user_id(&self) -> UserId {
        match self {
            UserNotice::WithdrawalRequested { user_id, .. }
            | UserNotice::WithdrawalApproved { user_id, .. }
            | UserNotice::WithdrawalConfirmed { user_id, .. }
            | UserNotice::WithdrawalRejected { user_id, .. }
            | UserNotice::WithdrawalRefunded { user_id, .. } => *user_id,
        }
    }
}

/// Event for the admin channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdminAlert {
    WithdrawalPending {
        transaction_id: TransactionId,
        user_id: UserId,
        amount: Decimal,
    },
    EscrowAwaitingApproval {
        escrow_id: EscrowId,
        transaction_id: TransactionId,
        amount: Decimal,
        initiator_admin_id: AdminId,
    },
    EscrowExpired {
        escrow_id: EscrowId,
        target_id: i64,
    },
    FraudBlocked {
        user_id: UserId,
        risk_score: u8,
    },
    AutoDispatchFailed {
        transaction_id: TransactionId,
        user_id: UserId,
        amount: Decimal,
        error: String,
    },
    /// Money left the hot wallet but the ledger update did not commit
    PayoutNotRecorded {
        reference: String,
        tx_hash: String,
        error: String,
    },
    PayoutInDlq {
        retry_id: RetryId,
        user_id: UserId,
        amount: Decimal,
        payment_type: PaymentType,
        last_error: Option<String>,
    },
    /// Debited and auto-approved, but no payout was ever sent
    UndispatchedWithdrawal {
        transaction_id: TransactionId,
        user_id: UserId,
        amount: Decimal,
        since: DateTime<Utc>,
    },
    StuckTransaction {
        transaction_id: TransactionId,
        tx_hash: String,
        chain_status: ChainTxStatus,
        recommendation: String,
    },
    SystemicStuckIncident {
        stuck_count: usize,
    },
    ReconciliationDiscrepancy {
        snapshot_date: NaiveDate,
        expected_balance: Decimal,
        actual_balance: Decimal,
        discrepancy_percent: Decimal,
    },
}

pub trait Notifier: Send + Sync {
    fn notify_user(&self, notice: UserNotice);

    fn alert_admins(&self, alert: AdminAlert);
}

// ============================================================================
// Log-only
// ============================================================================

/// Writes every event to the log; the default when no webhook is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_user(&self, notice: UserNotice) {
        info!(user_id = notice.user_id(), ?notice, "User notification");
    }

    fn alert_admins(&self, alert: AdminAlert) {
        warn!(?alert, "Admin alert");
    }
}

// ============================================================================
// Webhook
// ============================================================================

#[derive(Serialize)]
struct WebhookEnvelope<'a, T: Serialize> {
    audience: &'a str,
    #[serde(flatten)]
    payload: T,
}

/// POSTs events as JSON to the bot's webhook; falls back to logging
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    fn post<T: Serialize + Send + 'static>(&self, audience: &'static str, payload: T) {
        let body = match serde_json::to_value(WebhookEnvelope { audience, payload }) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to encode notification");
                return;
            }
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%body, "No runtime for webhook delivery, logging instead");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(status = %resp.status(), %body, "Webhook rejected notification"),
                Err(e) => warn!(error = %e, %body, "Webhook delivery failed"),
            }
        });
    }
}

impl Notifier for WebhookNotifier {
    fn notify_user(&self, notice: UserNotice) {
        info!(user_id = notice.user_id(), ?notice, "User notification");
        self.post("user", notice);
    }

    fn alert_admins(&self, alert: AdminAlert) {
        warn!(?alert, "Admin alert");
        self.post("admin", alert);
    }
}

// ============================================================================
// Recording (tests)
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct MemoryNotifier {
    users: Arc<Mutex<Vec<UserNotice>>>,
    admins: Arc<Mutex<Vec<AdminAlert>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_notices(&self) -> Vec<UserNotice> {
        self.users.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn admin_alerts(&self) -> Vec<AdminAlert> {
        self.admins.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify_user(&self, notice: UserNotice) {
        self.users
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(notice);
    }

    fn alert_admins(&self, alert: AdminAlert) {
        self.admins
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(alert);
    }
}
