//! The intent API: the in-process surface frontends call.
//!
//! Every mutating intent validates first, then runs one store transaction
//! that applies the local change and enqueues the outbox events the
//! external stores need. Intents never touch a gateway; user-visible
//! success is the local commit, the external effect is eventual. Read
//! intents surface the mapping's sync status so a frontend can show
//! pending, conflict, or error states.

use chrono::Utc;
use thiserror::Error;

use taskbridge_core::mapper::FieldSelection;
use taskbridge_core::model::{
    CloseReason, ForgeIssueRef, Mapping, Member, MemberRole, MemberStatus, Priority,
    SheetRecordRef, SheetTableRef, TableRegistryEntry, Task, TaskSource,
};

use crate::event::EventPayload;
use crate::store::members::MemberFilter;
use crate::store::tasks::TaskFilter;
use crate::store::{audit, mappings, members, outbox, registry, tasks, Store, StoreError};

/// Intent failures. Validation problems are rejected before anything is
/// committed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IntentError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("a member with email {0} already exists")]
    DuplicateEmail(String),

    #[error("unknown sheet table: {0}")]
    UnknownTable(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Request to create a task.
#[derive(Debug, Clone, Default)]
pub struct NewTaskRequest {
    pub title: String,
    pub body: String,
    pub assignee_email: Option<String>,
    pub labels: Vec<String>,
    pub priority: Option<Priority>,
    /// Sheet table the task syncs to. Must be registered.
    pub target_table: Option<SheetTableRef>,
    /// With no explicit table, also push to the registered default table.
    pub also_convert: bool,
}

/// Partial task update. `assignee_email: Some(None)` clears the assignee.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub status: Option<taskbridge_core::model::TaskStatus>,
    pub assignee_email: Option<Option<String>>,
    pub labels: Option<Vec<String>>,
    pub priority: Option<Priority>,
}

/// Request to create a member.
#[derive(Debug, Clone, Default)]
pub struct NewMemberRequest {
    pub name: String,
    pub email: String,
    pub role: Option<MemberRole>,
    pub forge_username: Option<String>,
    pub position: Option<String>,
    pub team: Option<String>,
}

/// Partial member update.
#[derive(Debug, Clone, Default)]
pub struct MemberPatch {
    pub name: Option<String>,
    pub role: Option<MemberRole>,
    pub forge_username: Option<String>,
    pub position: Option<String>,
    pub team: Option<String>,
}

/// A task with its external bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskView {
    pub task: Task,
    pub mapping: Option<Mapping>,
}

/// A member's current work across both bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberWork {
    pub member: Member,
    pub tasks: Vec<TaskView>,
}

/// The intent API surface.
pub struct Intents {
    store: Store,
    max_attempts: u32,
}

impl Intents {
    #[must_use]
    pub fn new(store: Store, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    /// Creates a task, its mapping, and the outbox events that bring both
    /// external stores in line. Returns the task id.
    pub fn create_task(&self, req: NewTaskRequest) -> Result<String, IntentError> {
        let title = req.title.trim();
        if title.is_empty() {
            return Err(IntentError::Validation("title must not be empty".into()));
        }

        let assignee = req
            .assignee_email
            .as_deref()
            .map(|email| self.member_id_for_email(email))
            .transpose()?;
        let table = self.resolve_target_table(req.target_table.as_ref(), req.also_convert)?;

        let now = Utc::now();
        let mut task = Task::new(title, TaskSource::Intent, now);
        task.body = req.body;
        task.assignee_member_id = assignee;
        task.labels = req.labels.into_iter().collect();
        task.priority = req.priority.unwrap_or_default();
        task.target_table.clone_from(&table);

        let max_attempts = self.max_attempts;
        let task_id = task.task_id.clone();
        self.store.transaction(move |tx| {
            tasks::insert(tx, &task)?;
            mappings::insert(tx, &Mapping::new(task.task_id.clone(), now))?;
            outbox::enqueue(
                tx,
                &EventPayload::ForgeCreateIssue {
                    task_id: task.task_id.clone(),
                },
                max_attempts,
                now,
            )?;
            if let Some(table) = table {
                outbox::enqueue(
                    tx,
                    &EventPayload::SheetCreateRecord {
                        task_id: task.task_id.clone(),
                        table,
                    },
                    max_attempts,
                    now,
                )?;
            }
            audit::append(
                tx,
                "local",
                "task",
                Some(&task.task_id),
                "created",
                Some(&task.title),
                now,
            )
        })?;
        Ok(task_id)
    }

    /// Applies a patch to a task. The set of changed fields decides which
    /// external updates are enqueued; a patch that changes nothing commits
    /// nothing.
    pub fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<(), IntentError> {
        let (prior, mapping) = self.load_task(task_id)?;

        let mut updated = prior.clone();
        if let Some(title) = patch.title {
            let title = title.trim().to_owned();
            if title.is_empty() {
                return Err(IntentError::Validation("title must not be empty".into()));
            }
            updated.title = title;
        }
        if let Some(body) = patch.body {
            updated.body = body;
        }
        if let Some(status) = patch.status {
            updated.status = status;
        }
        if let Some(priority) = patch.priority {
            updated.priority = priority;
        }
        if let Some(labels) = patch.labels {
            updated.labels = labels.into_iter().collect();
        }
        if let Some(assignee) = patch.assignee_email {
            updated.assignee_member_id = assignee
                .as_deref()
                .map(|email| self.member_id_for_email(email))
                .transpose()?;
        }

        let fields = FieldSelection::diff(&prior, &updated);
        if !fields.any() {
            return Ok(());
        }
        let now = Utc::now();
        updated.updated_at = now;

        let max_attempts = self.max_attempts;
        self.store.transaction(move |tx| {
            let snapshot = serde_json::to_string(&prior)?;
            audit::append(
                tx,
                "local",
                "task",
                Some(&prior.task_id),
                "updated",
                Some(&snapshot),
                now,
            )?;
            tasks::update(tx, &updated)?;
            enqueue_updates(tx, &updated, mapping.as_ref(), fields, max_attempts)
        })?;
        Ok(())
    }

    /// Closes a task: local terminal status plus the forge close and sheet
    /// update events.
    pub fn close_task(&self, task_id: &str, reason: CloseReason) -> Result<(), IntentError> {
        let (prior, mapping) = self.load_task(task_id)?;
        let target = reason.target_status();
        if prior.status == target {
            return Ok(());
        }

        let now = Utc::now();
        let mut updated = prior.clone();
        updated.status = target;
        updated.updated_at = now;

        let max_attempts = self.max_attempts;
        self.store.transaction(move |tx| {
            let snapshot = serde_json::to_string(&prior)?;
            audit::append(
                tx,
                "local",
                "task",
                Some(&prior.task_id),
                "closed",
                Some(&snapshot),
                now,
            )?;
            tasks::update(tx, &updated)?;

            if wants_forge(tx, &updated, mapping.as_ref())? {
                outbox::enqueue(
                    tx,
                    &EventPayload::ForgeCloseIssue {
                        task_id: updated.task_id.clone(),
                        reason,
                    },
                    max_attempts,
                    now,
                )?;
            }
            if wants_sheet(tx, &updated, mapping.as_ref())? {
                outbox::enqueue(
                    tx,
                    &EventPayload::SheetUpdateRecord {
                        task_id: updated.task_id.clone(),
                        fields: FieldSelection::status_only(),
                    },
                    max_attempts,
                    now,
                )?;
            }
            mark_pending(tx, &updated.task_id)
        })?;
        Ok(())
    }

    /// Enqueues the import of a forge issue into a sheet table.
    pub fn convert_forge_to_sheet(
        &self,
        issue: ForgeIssueRef,
        table: Option<SheetTableRef>,
    ) -> Result<(), IntentError> {
        let table = self
            .resolve_target_table(table.as_ref(), true)?
            .ok_or_else(|| IntentError::UnknownTable("no default table registered".into()))?;
        let max_attempts = self.max_attempts;
        self.store.transaction(move |tx| {
            outbox::enqueue(
                tx,
                &EventPayload::ConvertForgeToSheet { issue, table },
                max_attempts,
                Utc::now(),
            )
            .map(|_| ())
        })?;
        Ok(())
    }

    /// Enqueues the import of a sheet record into the forge.
    pub fn convert_sheet_to_forge(&self, record: SheetRecordRef) -> Result<(), IntentError> {
        let table = record.table();
        self.store
            .read(|conn| registry::get(conn, &table))?
            .ok_or_else(|| IntentError::UnknownTable(table.to_string()))?;

        let max_attempts = self.max_attempts;
        self.store.transaction(move |tx| {
            outbox::enqueue(
                tx,
                &EventPayload::ConvertSheetToForge { record },
                max_attempts,
                Utc::now(),
            )
            .map(|_| ())
        })?;
        Ok(())
    }

    /// Tasks matching the filter, with their bindings.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskView>, IntentError> {
        let filter = filter.clone();
        let views = self.store.read(|conn| {
            let tasks = tasks::list(conn, &filter)?;
            tasks
                .into_iter()
                .map(|task| {
                    let mapping = mappings::get_by_task(conn, &task.task_id)?;
                    Ok(TaskView { task, mapping })
                })
                .collect::<Result<Vec<_>, StoreError>>()
        })?;
        Ok(views)
    }

    /// A single task with its bindings.
    pub fn get_task(&self, task_id: &str) -> Result<TaskView, IntentError> {
        let (task, mapping) = self.load_task(task_id)?;
        Ok(TaskView { task, mapping })
    }

    /// A member's work, looked up by member id, email, or name.
    pub fn get_member_work(&self, identifier: &str) -> Result<MemberWork, IntentError> {
        let ident = identifier.to_owned();
        let member = self
            .store
            .read(move |conn| {
                if let Some(member) = members::find_by_id(conn, &ident)? {
                    return Ok(Some(member));
                }
                if let Some(member) = members::find_by_email(conn, &ident)? {
                    return Ok(Some(member));
                }
                members::find_by_name(conn, &ident)
            })?
            .ok_or_else(|| IntentError::NotFound {
                what: "member",
                id: identifier.to_owned(),
            })?;

        let tasks = self.list_tasks(&TaskFilter {
            assignee_member_id: Some(member.member_id.clone()),
            ..TaskFilter::default()
        })?;
        Ok(MemberWork {
            member,
            tasks,
        })
    }

    /// Creates a member. Emails are unique for all time.
    pub fn create_member(&self, req: NewMemberRequest) -> Result<String, IntentError> {
        let name = req.name.trim();
        let email = req.email.trim();
        if name.is_empty() || email.is_empty() {
            return Err(IntentError::Validation(
                "member name and email must not be empty".into(),
            ));
        }
        let lookup = email.to_owned();
        if self
            .store
            .read(move |conn| members::find_by_email(conn, &lookup))?
            .is_some()
        {
            return Err(IntentError::DuplicateEmail(email.to_owned()));
        }

        let mut member = Member::new(name, email, Utc::now());
        member.role = req.role.unwrap_or_default();
        member.forge_username = req.forge_username;
        member.position = req.position;
        member.team = req.team;
        let member_id = member.member_id.clone();
        self.store
            .transaction(move |tx| members::insert(tx, &member))?;
        Ok(member_id)
    }

    /// Applies a patch to a member.
    pub fn update_member(&self, member_id: &str, patch: MemberPatch) -> Result<(), IntentError> {
        let mut member = self.require_member(member_id)?;
        if let Some(name) = patch.name {
            member.name = name;
        }
        if let Some(role) = patch.role {
            member.role = role;
        }
        if let Some(forge_username) = patch.forge_username {
            member.forge_username = Some(forge_username);
        }
        if let Some(position) = patch.position {
            member.position = Some(position);
        }
        if let Some(team) = patch.team {
            member.team = Some(team);
        }
        member.updated_at = Utc::now();
        self.store
            .transaction(move |tx| members::update(tx, &member))?;
        Ok(())
    }

    /// Soft-deletes a member: the row survives with `inactive` status.
    pub fn deactivate_member(&self, member_id: &str) -> Result<(), IntentError> {
        let mut member = self.require_member(member_id)?;
        member.status = MemberStatus::Inactive;
        member.updated_at = Utc::now();
        self.store
            .transaction(move |tx| members::update(tx, &member))?;
        Ok(())
    }

    pub fn list_members(&self, filter: &MemberFilter) -> Result<Vec<Member>, IntentError> {
        let filter = filter.clone();
        Ok(self.store.read(move |conn| members::list(conn, &filter))?)
    }

    /// Registers (or updates) a sheet table.
    pub fn register_table(&self, entry: TableRegistryEntry) -> Result<(), IntentError> {
        self.store
            .transaction(move |tx| registry::upsert(tx, &entry, Utc::now()))?;
        Ok(())
    }

    pub fn list_tables(&self) -> Result<Vec<TableRegistryEntry>, IntentError> {
        Ok(self.store.read(registry::list)?)
    }

    fn load_task(&self, task_id: &str) -> Result<(Task, Option<Mapping>), IntentError> {
        let id = task_id.to_owned();
        let pair = self.store.read(move |conn| {
            Ok((tasks::get(conn, &id)?, mappings::get_by_task(conn, &id)?))
        })?;
        match pair {
            (Some(task), mapping) => Ok((task, mapping)),
            (None, _) => Err(IntentError::NotFound {
                what: "task",
                id: task_id.to_owned(),
            }),
        }
    }

    fn require_member(&self, member_id: &str) -> Result<Member, IntentError> {
        let id = member_id.to_owned();
        self.store
            .read(move |conn| members::find_by_id(conn, &id))?
            .ok_or_else(|| IntentError::NotFound {
                what: "member",
                id: member_id.to_owned(),
            })
    }

    fn member_id_for_email(&self, email: &str) -> Result<String, IntentError> {
        let lookup = email.to_owned();
        self.store
            .read(move |conn| members::find_by_email(conn, &lookup))?
            .map(|member| member.member_id)
            .ok_or_else(|| IntentError::Validation(format!("unknown member email {email:?}")))
    }

    /// Resolves the sheet table a task should sync to: the explicit table
    /// (which must be registered), or the default when conversion is
    /// wanted.
    fn resolve_target_table(
        &self,
        explicit: Option<&SheetTableRef>,
        fall_back_to_default: bool,
    ) -> Result<Option<SheetTableRef>, IntentError> {
        match explicit {
            Some(table) => {
                let lookup = table.clone();
                self.store
                    .read(move |conn| registry::get(conn, &lookup))?
                    .ok_or_else(|| IntentError::UnknownTable(table.to_string()))?;
                Ok(Some(table.clone()))
            }
            None if fall_back_to_default => Ok(self
                .store
                .read(registry::get_default)?
                .map(|entry| entry.table)),
            None => Ok(None),
        }
    }
}

/// Enqueues the external updates a changed field set requires. A side is
/// only targeted when it is bound or a creation for it is already queued.
fn enqueue_updates(
    tx: &rusqlite::Transaction<'_>,
    task: &Task,
    mapping: Option<&Mapping>,
    fields: FieldSelection,
    max_attempts: u32,
) -> Result<(), StoreError> {
    let now = Utc::now();
    if wants_forge(tx, task, mapping)? {
        outbox::enqueue(
            tx,
            &EventPayload::ForgeUpdateIssue {
                task_id: task.task_id.clone(),
                fields,
            },
            max_attempts,
            now,
        )?;
    }
    if wants_sheet(tx, task, mapping)? {
        outbox::enqueue(
            tx,
            &EventPayload::SheetUpdateRecord {
                task_id: task.task_id.clone(),
                fields,
            },
            max_attempts,
            now,
        )?;
    }
    mark_pending(tx, &task.task_id)
}

fn wants_forge(
    tx: &rusqlite::Transaction<'_>,
    task: &Task,
    mapping: Option<&Mapping>,
) -> Result<bool, StoreError> {
    if mapping.is_some_and(|mapping| mapping.forge.is_some()) {
        return Ok(true);
    }
    outbox::has_open_kind(tx, &task.task_id, "forge_create_issue")
}

fn wants_sheet(
    tx: &rusqlite::Transaction<'_>,
    task: &Task,
    mapping: Option<&Mapping>,
) -> Result<bool, StoreError> {
    if mapping.is_some_and(|mapping| mapping.sheet.is_some()) {
        return Ok(true);
    }
    outbox::has_open_kind(tx, &task.task_id, "sheet_create_record")
}

fn mark_pending(tx: &rusqlite::Transaction<'_>, task_id: &str) -> Result<(), StoreError> {
    match mappings::set_sync_status(tx, task_id, taskbridge_core::model::SyncStatus::Pending, Utc::now())
    {
        Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}
