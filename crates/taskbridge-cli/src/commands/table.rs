//! Sheet table registry subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;

use taskbridge_core::config::Config;
use taskbridge_core::model::{FieldMap, SheetTableRef, TableRegistryEntry};
use taskbridge_core::sheet::lark::LarkSheet;
use taskbridge_core::sheet::{SheetFieldDef, SheetGateway};
use taskbridge_daemon::intent::Intents;

#[derive(Subcommand, Debug)]
pub enum TableCmd {
    /// Create a task table in the sheet app and register it
    Create {
        /// Sheet app token (defaults to LARK_APP_TOKEN)
        #[arg(long)]
        app_token: Option<String>,

        #[arg(long)]
        name: String,

        /// Make this the default table for new tasks
        #[arg(long)]
        default: bool,
    },

    /// Register (or update) an existing table
    Register {
        #[arg(long)]
        app_token: String,

        #[arg(long)]
        table_id: String,

        #[arg(long)]
        name: String,

        /// Make this the default table for new tasks
        #[arg(long)]
        default: bool,

        /// Title column name
        #[arg(long)]
        title_field: Option<String>,

        /// Status column name
        #[arg(long)]
        status_field: Option<String>,

        /// Assignee column name
        #[arg(long)]
        assignee_field: Option<String>,

        /// Auto-updated last-modified column, enables filtered polling
        #[arg(long)]
        last_modified_field: Option<String>,
    },

    /// List registered tables
    List,
}

pub async fn run(cmd: TableCmd, intents: &Intents) -> Result<()> {
    match cmd {
        TableCmd::Create {
            app_token,
            name,
            default,
        } => {
            let config = Config::from_env().context("loading configuration")?;
            let app_token = app_token
                .or_else(|| {
                    config
                        .sheet
                        .default_table
                        .as_ref()
                        .map(|table| table.app_token.clone())
                })
                .context("no app token given and LARK_APP_TOKEN is not set")?;

            let lark = LarkSheet::spawn(&config.sheet)
                .await
                .context("spawning sheet broker")?;
            let fields = config.sheet.fields.clone();
            let table_id = lark
                .create_table(&app_token, &name, &standard_columns(&fields))
                .await
                .context("creating table")?;
            lark.shutdown().await;

            let table = SheetTableRef::new(app_token, table_id);
            intents.register_table(TableRegistryEntry {
                table: table.clone(),
                display_name: name,
                fields,
                is_default: default,
            })?;
            println!("created and registered {table}");
            Ok(())
        }
        TableCmd::Register {
            app_token,
            table_id,
            name,
            default,
            title_field,
            status_field,
            assignee_field,
            last_modified_field,
        } => {
            let mut fields = FieldMap::default();
            if let Some(title) = title_field {
                fields.title = title;
            }
            if let Some(status) = status_field {
                fields.status = status;
            }
            if let Some(assignee) = assignee_field {
                fields.assignee = assignee;
            }
            fields.last_modified = last_modified_field;

            let table = SheetTableRef::new(app_token, table_id);
            intents.register_table(TableRegistryEntry {
                table: table.clone(),
                display_name: name,
                fields,
                is_default: default,
            })?;
            println!("registered {table}");
            Ok(())
        }
        TableCmd::List => {
            for entry in intents.list_tables()? {
                let default = if entry.is_default { " (default)" } else { "" };
                println!("{}  {}{}", entry.table, entry.display_name, default);
            }
            Ok(())
        }
    }
}

/// Column set of a standard task table: text title and description, the
/// status and priority single-selects with their literal option names, a
/// person column, the issue-link number, and the sync timestamp.
fn standard_columns(fields: &FieldMap) -> Vec<SheetFieldDef> {
    let mut columns = vec![
        SheetFieldDef {
            name: fields.title.clone(),
            kind: 1,
            options: Vec::new(),
        },
        SheetFieldDef {
            name: fields.status.clone(),
            kind: 3,
            options: vec![
                "To Do".to_owned(),
                "In Progress".to_owned(),
                "Done".to_owned(),
                "Cancelled".to_owned(),
            ],
        },
        SheetFieldDef {
            name: fields.assignee.clone(),
            kind: 11,
            options: Vec::new(),
        },
        SheetFieldDef {
            name: fields.github_issue.clone(),
            kind: 2,
            options: Vec::new(),
        },
        SheetFieldDef {
            name: fields.last_sync.clone(),
            kind: 5,
            options: Vec::new(),
        },
    ];
    if let Some(priority) = &fields.priority {
        columns.push(SheetFieldDef {
            name: priority.clone(),
            kind: 3,
            options: vec![
                "Critical".to_owned(),
                "High".to_owned(),
                "Medium".to_owned(),
                "Low".to_owned(),
            ],
        });
    }
    if let Some(description) = &fields.description {
        columns.push(SheetFieldDef {
            name: description.clone(),
            kind: 1,
            options: Vec::new(),
        });
    }
    columns
}
