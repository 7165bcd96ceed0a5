//! Task subcommands.

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;

use taskbridge_core::model::{CloseReason, Priority, SheetTableRef, TaskStatus};
use taskbridge_daemon::intent::{Intents, NewTaskRequest, TaskPatch, TaskView};
use taskbridge_daemon::store::tasks::TaskFilter;

#[derive(Subcommand, Debug)]
pub enum TaskCmd {
    /// Create a task
    Create {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        body: String,

        /// Assignee email (must be a known member)
        #[arg(long)]
        assignee: Option<String>,

        /// Label, repeatable
        #[arg(long = "label")]
        labels: Vec<String>,

        /// critical, high, medium, or low
        #[arg(long)]
        priority: Option<String>,

        /// Target sheet app token (with --table-id)
        #[arg(long, requires = "table_id")]
        app_token: Option<String>,

        /// Target sheet table id (with --app-token)
        #[arg(long, requires = "app_token")]
        table_id: Option<String>,

        /// Also push to the default sheet table
        #[arg(long)]
        convert: bool,
    },

    /// Update task fields
    Update {
        task_id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        body: Option<String>,

        /// ToDo, InProgress, Done, or Cancelled
        #[arg(long)]
        status: Option<String>,

        /// Assignee email; empty string clears
        #[arg(long)]
        assignee: Option<String>,

        #[arg(long)]
        priority: Option<String>,

        /// Replace the label set, repeatable
        #[arg(long = "label")]
        labels: Vec<String>,
    },

    /// Close a task
    Close {
        task_id: String,

        /// completed or not_planned
        #[arg(long, default_value = "completed")]
        reason: String,
    },

    /// List tasks
    List {
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one task with its bindings
    Show { task_id: String },
}

pub fn run(cmd: TaskCmd, intents: &Intents) -> Result<()> {
    match cmd {
        TaskCmd::Create {
            title,
            body,
            assignee,
            labels,
            priority,
            app_token,
            table_id,
            convert,
        } => {
            let target_table = match (app_token, table_id) {
                (Some(app_token), Some(table_id)) => Some(SheetTableRef::new(app_token, table_id)),
                _ => None,
            };
            let task_id = intents.create_task(NewTaskRequest {
                title,
                body,
                assignee_email: assignee,
                labels,
                priority: priority.as_deref().map(parse_priority).transpose()?,
                target_table,
                also_convert: convert,
            })?;
            println!("{task_id}");
            Ok(())
        }
        TaskCmd::Update {
            task_id,
            title,
            body,
            status,
            assignee,
            priority,
            labels,
        } => {
            let patch = TaskPatch {
                title,
                body,
                status: status.as_deref().map(parse_status).transpose()?,
                assignee_email: assignee
                    .map(|email| if email.is_empty() { None } else { Some(email) }),
                labels: if labels.is_empty() { None } else { Some(labels) },
                priority: priority.as_deref().map(parse_priority).transpose()?,
            };
            intents.update_task(&task_id, patch)?;
            println!("updated {task_id}");
            Ok(())
        }
        TaskCmd::Close { task_id, reason } => {
            let reason = CloseReason::parse(&reason)
                .ok_or_else(|| anyhow!("unknown close reason {reason:?}"))?;
            intents.close_task(&task_id, reason)?;
            println!("closed {task_id}");
            Ok(())
        }
        TaskCmd::List { status } => {
            let filter = TaskFilter {
                status: status.as_deref().map(parse_status).transpose()?,
                ..TaskFilter::default()
            };
            for view in intents.list_tasks(&filter)? {
                print_row(&view);
            }
            Ok(())
        }
        TaskCmd::Show { task_id } => {
            let view = intents.get_task(&task_id).context("loading task")?;
            print_detail(&view);
            Ok(())
        }
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    TaskStatus::parse(raw).ok_or_else(|| anyhow!("unknown status {raw:?}"))
}

fn parse_priority(raw: &str) -> Result<Priority> {
    Priority::parse(raw).ok_or_else(|| anyhow!("unknown priority {raw:?}"))
}

fn print_row(view: &TaskView) {
    let sync = view
        .mapping
        .as_ref()
        .map_or("unmapped", |mapping| mapping.sync_status.as_str());
    println!(
        "{}  [{}] ({}) {}",
        view.task.task_id, view.task.status, sync, view.task.title
    );
}

fn print_detail(view: &TaskView) {
    let task = &view.task;
    println!("task:     {}", task.task_id);
    println!("title:    {}", task.title);
    println!("status:   {} ({})", task.status, task.priority);
    println!("source:   {}", task.source.as_str());
    if let Some(assignee) = &task.assignee_member_id {
        println!("assignee: {assignee}");
    }
    if !task.labels.is_empty() {
        println!(
            "labels:   {}",
            task.labels.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    if let Some(mapping) = &view.mapping {
        println!("sync:     {}", mapping.sync_status.as_str());
        if let Some(forge) = &mapping.forge {
            println!("forge:    {}#{}", forge.repo, forge.number);
        }
        if let Some(sheet) = &mapping.sheet {
            println!("sheet:    {}/{}/{}", sheet.app_token, sheet.table_id, sheet.record_id);
        }
    }
    if !task.body.is_empty() {
        println!("\n{}", task.body);
    }
}
