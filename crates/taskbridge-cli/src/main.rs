//! taskbridge - operator CLI.
//!
//! Mutating subcommands are intent-API calls against the local store;
//! they succeed as soon as the local commit does. `sync` constructs the
//! gateways and pushes the queue through.

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use taskbridge_core::config::{db_path_from_env, SyncConfig};
use taskbridge_daemon::intent::Intents;
use taskbridge_daemon::store::Store;

mod commands;
mod exit;

/// taskbridge - bidirectional task synchronization
#[derive(Parser, Debug)]
#[command(name = "taskbridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Database path, overriding the environment
    #[arg(long)]
    db: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the local database
    Init,

    /// Task operations
    #[command(subcommand)]
    Task(commands::task::TaskCmd),

    /// Member operations
    #[command(subcommand)]
    Member(commands::member::MemberCmd),

    /// Sheet table registry operations
    #[command(subcommand)]
    Table(commands::table::TableCmd),

    /// Cross-store conversions
    #[command(subcommand)]
    Convert(commands::convert::ConvertCmd),

    /// Process the outbox and reconcile both sources once
    Sync(commands::sync::SyncArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("taskbridge={}", cli.log_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli) {
        Ok(()) => std::process::exit(exit::OK),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit::code_for(&err));
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let db_path = cli.db.unwrap_or_else(db_path_from_env);
    let store = Store::open(&db_path)?;
    let sync = SyncConfig::from_env()?;
    let intents = Intents::new(store.clone(), sync.max_attempts);

    match cli.command {
        Commands::Init => {
            println!("database ready at {}", db_path.display());
            Ok(())
        }
        Commands::Task(cmd) => commands::task::run(cmd, &intents),
        Commands::Member(cmd) => commands::member::run(cmd, &intents),
        Commands::Table(cmd) => commands::table::run(cmd, &intents).await,
        Commands::Convert(cmd) => commands::convert::run(cmd, &intents),
        Commands::Sync(args) => commands::sync::run(args, store).await,
    }
}
