//! Cross-store conversion subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;

use taskbridge_core::config::Config;
use taskbridge_core::model::{ForgeIssueRef, SheetRecordRef, SheetTableRef};
use taskbridge_daemon::intent::Intents;

#[derive(Subcommand, Debug)]
pub enum ConvertCmd {
    /// Import a forge issue into a sheet table
    IssueToSheet {
        /// Issue number in the configured repository
        number: u64,

        /// Target sheet app token (defaults to the registered default table)
        #[arg(long, requires = "table_id")]
        app_token: Option<String>,

        /// Target sheet table id
        #[arg(long, requires = "app_token")]
        table_id: Option<String>,
    },

    /// Import a sheet record into the forge
    RecordToIssue {
        #[arg(long)]
        app_token: String,

        #[arg(long)]
        table_id: String,

        #[arg(long)]
        record_id: String,
    },
}

pub fn run(cmd: ConvertCmd, intents: &Intents) -> Result<()> {
    match cmd {
        ConvertCmd::IssueToSheet {
            number,
            app_token,
            table_id,
        } => {
            let config = Config::from_env().context("loading configuration")?;
            let table = match (app_token, table_id) {
                (Some(app_token), Some(table_id)) => Some(SheetTableRef::new(app_token, table_id)),
                _ => None,
            };
            intents.convert_forge_to_sheet(
                ForgeIssueRef::new(config.forge.repo_slug(), number),
                table,
            )?;
            println!("conversion queued for issue #{number}");
            Ok(())
        }
        ConvertCmd::RecordToIssue {
            app_token,
            table_id,
            record_id,
        } => {
            intents.convert_sheet_to_forge(SheetRecordRef::new(app_token, table_id, &record_id))?;
            println!("conversion queued for record {record_id}");
            Ok(())
        }
    }
}
