//! balance-guard
//!
//! ```text
//! balance-guard [--env <name>]                     run all background sweeps
//! balance-guard [--env <name>] --reconcile [date]  one reconciliation, JSON to stdout
//! ```

use anyhow::Context;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio::sync::watch;

use balance_guard::Services;
use balance_guard::chain::Bep20Gateway;
use balance_guard::config::AppConfig;
use balance_guard::db::{Database, schema};
use balance_guard::fraud::DisabledFraudDetector;
use balance_guard::notify::{LogNotifier, Notifier, WebhookNotifier};
use balance_guard::store::PgLedgerStore;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// `Some(None)` for `--reconcile` alone, `Some(Some(date))` with a date
fn get_reconcile_date() -> anyhow::Result<Option<Option<NaiveDate>>> {
    let args: Vec<String> = std::env::args().collect();
    let Some(pos) = args.iter().position(|a| a == "--reconcile") else {
        return Ok(None);
    };
    match args.get(pos + 1).filter(|a| !a.starts_with('-')) {
        Some(date) => {
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .with_context(|| format!("Invalid --reconcile date: {}", date))?;
            Ok(Some(Some(date)))
        }
        None => Ok(Some(None)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = balance_guard::logging::init_logging(&config);

    tracing::info!(
        env = %env,
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        "Starting balance-guard"
    );

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check().await?;
    schema::ensure_schema(db.pool()).await?;

    let store = Arc::new(PgLedgerStore::new(db.pool().clone()));
    let gateway = Arc::new(Bep20Gateway::new(config.chain.clone())?);
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let services = Services::new(
        &config,
        store,
        gateway,
        notifier,
        Arc::new(DisabledFraudDetector),
    );

    if let Some(date) = get_reconcile_date()? {
        let snapshot = services.reconciliation.perform_reconciliation(date).await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = services.workers(&config).spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("balance-guard stopped");
    Ok(())
}
