//! Member subcommands.

use anyhow::{anyhow, Result};
use clap::Subcommand;

use taskbridge_core::model::{MemberRole, MemberStatus};
use taskbridge_daemon::intent::{Intents, MemberPatch, NewMemberRequest};
use taskbridge_daemon::store::members::MemberFilter;

#[derive(Subcommand, Debug)]
pub enum MemberCmd {
    /// Add a member
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: String,

        /// admin, manager, developer, designer, qa, or member
        #[arg(long)]
        role: Option<String>,

        /// Forge username for assignee mapping
        #[arg(long)]
        github: Option<String>,

        #[arg(long)]
        position: Option<String>,

        #[arg(long)]
        team: Option<String>,
    },

    /// Update member fields
    Set {
        member_id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        role: Option<String>,

        #[arg(long)]
        github: Option<String>,

        #[arg(long)]
        position: Option<String>,

        #[arg(long)]
        team: Option<String>,
    },

    /// Deactivate a member (the row is preserved)
    Deactivate { member_id: String },

    /// List members
    List {
        /// Only active members
        #[arg(long)]
        active: bool,
    },

    /// Show a member's work, looked up by id, email, or name
    Work { identifier: String },
}

pub fn run(cmd: MemberCmd, intents: &Intents) -> Result<()> {
    match cmd {
        MemberCmd::Add {
            name,
            email,
            role,
            github,
            position,
            team,
        } => {
            let member_id = intents.create_member(NewMemberRequest {
                name,
                email,
                role: role.as_deref().map(parse_role).transpose()?,
                forge_username: github,
                position,
                team,
            })?;
            println!("{member_id}");
            Ok(())
        }
        MemberCmd::Set {
            member_id,
            name,
            role,
            github,
            position,
            team,
        } => {
            intents.update_member(
                &member_id,
                MemberPatch {
                    name,
                    role: role.as_deref().map(parse_role).transpose()?,
                    forge_username: github,
                    position,
                    team,
                },
            )?;
            println!("updated {member_id}");
            Ok(())
        }
        MemberCmd::Deactivate { member_id } => {
            intents.deactivate_member(&member_id)?;
            println!("deactivated {member_id}");
            Ok(())
        }
        MemberCmd::List { active } => {
            let filter = MemberFilter {
                status: active.then_some(MemberStatus::Active),
                role: None,
            };
            for member in intents.list_members(&filter)? {
                println!(
                    "{}  {} <{}> [{}] {}",
                    member.member_id,
                    member.name,
                    member.email,
                    member.role.as_str(),
                    member.status.as_str()
                );
            }
            Ok(())
        }
        MemberCmd::Work { identifier } => {
            let work = intents.get_member_work(&identifier)?;
            println!("{} <{}>", work.member.name, work.member.email);
            for view in work.tasks {
                let sync = view
                    .mapping
                    .as_ref()
                    .map_or("unmapped", |mapping| mapping.sync_status.as_str());
                println!("  {}  [{}] ({}) {}", view.task.task_id, view.task.status, sync, view.task.title);
            }
            Ok(())
        }
    }
}

fn parse_role(raw: &str) -> Result<MemberRole> {
    MemberRole::parse(raw).ok_or_else(|| anyhow!("unknown role {raw:?}"))
}
