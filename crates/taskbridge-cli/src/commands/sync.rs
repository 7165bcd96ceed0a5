//! One-shot sync: drain the outbox and reconcile both sources.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use taskbridge_core::config::Config;
use taskbridge_core::forge::github::GithubForge;
use taskbridge_core::forge::ForgeGateway;
use taskbridge_core::sheet::lark::LarkSheet;
use taskbridge_core::sheet::SheetGateway;
use taskbridge_daemon::dispatch::{Dispatcher, DispatcherConfig};
use taskbridge_daemon::reconcile::{ForgeReconciler, SheetReconciler};
use taskbridge_daemon::resolver::IdentityResolver;
use taskbridge_daemon::store::Store;

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Only drain the outbox, skip reconciliation
    #[arg(long)]
    push_only: bool,

    /// Only reconcile, skip the outbox
    #[arg(long, conflicts_with = "push_only")]
    pull_only: bool,
}

pub async fn run(args: SyncArgs, store: Store) -> Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    let forge: Arc<dyn ForgeGateway> =
        Arc::new(GithubForge::new(&config.forge).context("building forge gateway")?);
    let lark = Arc::new(
        LarkSheet::spawn(&config.sheet)
            .await
            .context("spawning sheet broker")?,
    );
    let sheet: Arc<dyn SheetGateway> = lark.clone();

    if !args.pull_only {
        let resolver = Arc::new(IdentityResolver::new(store.clone(), sheet.clone()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            forge.clone(),
            sheet.clone(),
            resolver,
            DispatcherConfig::from_sync(&config.sync, config.sheet.notify_chat_id.clone()),
        );
        let processed = dispatcher.drain().await?;
        println!("dispatched {processed} event(s)");
    }

    if !args.push_only {
        let forge_outcome = ForgeReconciler::new(store.clone(), forge, &config.sync)
            .tick()
            .await?;
        println!(
            "forge: {} imported, {} updated, {} conflict(s), {} unchanged",
            forge_outcome.imported,
            forge_outcome.updated,
            forge_outcome.conflicts,
            forge_outcome.unchanged
        );
        let sheet_outcome = SheetReconciler::new(store, sheet, &config.sync).tick().await?;
        println!(
            "sheet: {} imported, {} updated, {} conflict(s), {} unchanged",
            sheet_outcome.imported,
            sheet_outcome.updated,
            sheet_outcome.conflicts,
            sheet_outcome.unchanged
        );
    }

    lark.shutdown().await;
    Ok(())
}
