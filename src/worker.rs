//! Background sweeps
//!
//! Each sweep runs on its own interval in its own task and opens its own
//! short unit of work per item. A failing round is logged and the next tick
//! tries again; nothing here stops the process.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::WorkerIntervals;
use crate::escrow::EscrowService;
use crate::monitor::{ConfirmationMonitor, StuckTransactionMonitor};
use crate::payment_retry::PaymentRetryEngine;
use crate::reconciliation::ReconciliationEngine;

pub struct BackgroundWorkers {
    pub escrow: Arc<EscrowService>,
    pub retries: Arc<PaymentRetryEngine>,
    pub confirmations: Arc<ConfirmationMonitor>,
    pub stuck: Arc<StuckTransactionMonitor>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub intervals: WorkerIntervals,
}

impl BackgroundWorkers {
    /// Start every sweep; each task ends when `shutdown` flips to `true`
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let i = &self.intervals;
        info!(
            confirmation_secs = i.confirmation_secs,
            stuck_secs = i.stuck_secs,
            retry_secs = i.retry_secs,
            escrow_expiry_secs = i.escrow_expiry_secs,
            reconciliation_secs = i.reconciliation_secs,
            "Starting background workers"
        );

        let confirmations = self.confirmations.clone();
        let stuck = self.stuck.clone();
        let retries = self.retries.clone();
        let escrow = self.escrow.clone();
        let reconciliation = self.reconciliation.clone();

        vec![
            spawn_periodic(
                "confirmation",
                Duration::from_secs(i.confirmation_secs),
                shutdown.clone(),
                move || {
                    let m = confirmations.clone();
                    async move { m.sweep().await }
                },
            ),
            spawn_periodic(
                "stuck_transactions",
                Duration::from_secs(i.stuck_secs),
                shutdown.clone(),
                move || {
                    let m = stuck.clone();
                    async move { m.sweep().await.map(|r| r.still_stuck()) }
                },
            ),
            spawn_periodic(
                "payment_retry",
                Duration::from_secs(i.retry_secs),
                shutdown.clone(),
                move || {
                    let e = retries.clone();
                    async move { e.process_pending_retries().await }
                },
            ),
            spawn_periodic(
                "escrow_expiry",
                Duration::from_secs(i.escrow_expiry_secs),
                shutdown.clone(),
                move || {
                    let s = escrow.clone();
                    async move { s.mark_expired().await }
                },
            ),
            spawn_periodic(
                "reconciliation",
                Duration::from_secs(i.reconciliation_secs),
                shutdown,
                move || {
                    let r = reconciliation.clone();
                    async move {
                        r.perform_reconciliation(None)
                            .await
                            .map(|s| s.reconciliation_status)
                    }
                },
            ),
        ]
    }
}

/// Run `task` every `every` until shutdown. The first round runs
/// immediately; late ticks are delayed, not bunched.
pub fn spawn_periodic<F, Fut, T, E>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Debug + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match task().await {
                        Ok(outcome) => debug!(worker = name, outcome = ?outcome, "Sweep finished"),
                        Err(e) => error!(worker = name, error = %e, "Sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(worker = name, "Worker stopped");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_periodic_runs_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = runs.clone();
        let handle = spawn_periodic("test", Duration::from_millis(10), rx, move || {
            let c = counter.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(())
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {} times", seen);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
