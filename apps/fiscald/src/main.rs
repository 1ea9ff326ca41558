//! # fiscald
//!
//! Fiscal queue daemon: drains queued sales, refunds and shift operations
//! against the fiscal provider until asked to stop.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG or "info,vendfisc=debug,sqlx=warn")              │
//! │  2. FiscalConfig::load(path from argv[1] | platform config dir)        │
//! │  3. Database::new (runs migrations)                                    │
//! │  4. WorkerPool::spawn + ShiftScheduler::spawn                          │
//! │  5. Ctrl-C / SIGTERM → shutdown channel → workers finish their item    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vendfisc_db::Database;
use vendfisc_queue::{FiscalConfig, FiscalService, SandboxProvider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = FiscalConfig::load(config_path)?;
    info!(
        db_path = %config.database.path.display(),
        workers = config.worker.pool_size,
        holder = %config.worker.holder_id,
        "Configuration loaded"
    );

    if let Some(dir) = config.database.path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let db = Database::new(config.database.db_config()).await?;
    let devices = db.devices().count().await?;
    if devices == 0 {
        warn!("No fiscal devices registered yet");
    }

    let service = FiscalService::new(db.clone(), config, Arc::new(SandboxProvider::new()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = service.worker_pool(shutdown_rx.clone()).spawn();
    handles.push(service.scheduler().spawn(shutdown_rx));
    info!(devices, "fiscald running");

    shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        warn!("All workers already stopped");
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!(?e, "Worker task panicked");
        }
    }

    db.close().await;
    info!("fiscald stopped");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=vendfisc_queue=trace` - Trace the queue runtime only
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vendfisc=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping workers");
}
