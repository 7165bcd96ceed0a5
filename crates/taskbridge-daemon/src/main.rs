//! taskbridge-daemon - the synchronization daemon.
//!
//! Runs a pool of dispatcher workers and one reconciler per external
//! source against the shared store. Configuration comes from the
//! environment and is validated before anything starts; SIGINT/SIGTERM
//! drain the workers, which finish the transaction in hand before exiting.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use taskbridge_core::config::{Config, ConfigError};
use taskbridge_core::forge::github::GithubForge;
use taskbridge_core::forge::ForgeGateway;
use taskbridge_core::sheet::lark::LarkSheet;
use taskbridge_core::sheet::SheetGateway;
use taskbridge_daemon::dispatch::{Dispatcher, DispatcherConfig};
use taskbridge_daemon::reconcile::{ForgeReconciler, SheetReconciler};
use taskbridge_daemon::resolver::IdentityResolver;
use taskbridge_daemon::store::Store;

/// taskbridge sync daemon
#[derive(Parser, Debug)]
#[command(name = "taskbridge-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Database path, overriding the environment
    #[arg(long)]
    db: Option<std::path::PathBuf>,

    /// Drain the outbox and reconcile once, then exit
    #[arg(long)]
    once: bool,
}

fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let code = match run(args) {
        Ok(()) => 0,
        Err(err) => {
            error!(error = ?err, "daemon failed");
            if err.chain().any(|cause| cause.downcast_ref::<ConfigError>().is_some()) {
                64
            } else {
                70
            }
        }
    };
    std::process::exit(code);
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("taskbridge={log_level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let store = Store::open(&config.db_path)
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;
    let forge: Arc<dyn ForgeGateway> =
        Arc::new(GithubForge::new(&config.forge).context("building forge gateway")?);
    let lark = Arc::new(
        LarkSheet::spawn(&config.sheet)
            .await
            .context("spawning sheet broker")?,
    );
    let sheet: Arc<dyn SheetGateway> = lark.clone();
    let resolver = Arc::new(IdentityResolver::new(store.clone(), sheet.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        forge.clone(),
        sheet.clone(),
        resolver,
        DispatcherConfig::from_sync(&config.sync, config.sheet.notify_chat_id.clone()),
    ));
    let forge_reconciler = Arc::new(ForgeReconciler::new(store.clone(), forge, &config.sync));
    let sheet_reconciler = Arc::new(SheetReconciler::new(store, sheet, &config.sync));

    if args.once {
        let processed = dispatcher.drain().await?;
        let forge_outcome = forge_reconciler.tick().await?;
        let sheet_outcome = sheet_reconciler.tick().await?;
        info!(processed, ?forge_outcome, ?sheet_outcome, "single pass complete");
        lark.shutdown().await;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    for _ in 0..config.sync.workers {
        handles.push(tokio::spawn(dispatcher.clone().run(shutdown.clone())));
    }
    handles.push(tokio::spawn(forge_reconciler.run(shutdown.clone())));
    handles.push(tokio::spawn(sheet_reconciler.run(shutdown.clone())));

    wait_for_signal().await?;
    info!("shutdown signal received, draining workers");
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    lark.shutdown().await;
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    Ok(())
}
