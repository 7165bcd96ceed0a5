//! Per-kind event handlers.
//!
//! Every handler is idempotent: it checks the mapping first and, for
//! creations, falls back to a lookup by the deterministic key (the
//! `[AUTO][task:<id>]` title prefix on the forge, the issue link or exact
//! title on the sheet) before inserting. A retried create therefore
//! degrades into update semantics instead of duplicating the object.

use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use tracing::warn;

use taskbridge_core::mapper::{
    forge_issue_to_task, sheet_record_to_task, task_to_forge_issue, task_to_forge_patch,
    task_to_sheet_fields, text_value, title_prefix, FieldSelection, SheetWriteContext,
};
use taskbridge_core::model::{
    CloseReason, ForgeIssueRef, Mapping, SheetRecordRef, SheetTableRef, SyncStatus, Task,
};
use taskbridge_core::forge::{ForgeGateway, IssuePatch, IssueQuery};
use taskbridge_core::sheet::{MessageTarget, RecordQuery, SheetGateway};

use super::{Dispatcher, HandlerError};
use crate::event::EventPayload;
use crate::store::{audit, mappings, members, outbox, registry, tasks, StoreError};

impl Dispatcher {
    pub(super) async fn forge_create(
        &self,
        event_id: &str,
        task_id: &str,
    ) -> Result<(), HandlerError> {
        let id = task_id.to_owned();
        let (task, mapping) = self
            .read_store(move |conn| {
                Ok((tasks::require(conn, &id)?, mappings::get_by_task(conn, &id)?))
            })
            .await?;
        let assignee = self.forge_assignee(&task).await;

        if let Some(forge_ref) = mapping.as_ref().and_then(|mapping| mapping.forge.clone()) {
            // Already bound; a retried create becomes an update.
            let patch = task_to_forge_patch(&task, FieldSelection::all(), assignee.as_deref());
            self.forge.update_issue(forge_ref.number, &patch).await?;
            return self
                .finish_task_event(
                    event_id,
                    task_id,
                    "forge",
                    format!("issue #{} updated", forge_ref.number),
                )
                .await;
        }

        // Pre-insert lookup by the deterministic title key, so a crash
        // between the external create and the binding commit cannot
        // duplicate the issue.
        let prefix = title_prefix(&task.task_id);
        let existing = self
            .forge
            .list_issues(&IssueQuery::default())
            .await?
            .into_iter()
            .find(|issue| issue.title.starts_with(&prefix));

        let issue = match existing {
            Some(found) => found,
            None => {
                self.forge
                    .create_issue(&task_to_forge_issue(&task, assignee.as_deref()))
                    .await?
            }
        };
        let forge_ref = ForgeIssueRef::new(self.forge.repo(), issue.number);
        let message = format!("issue #{} bound", issue.number);

        let store = self.store.clone();
        let event = event_id.to_owned();
        let id = task_id.to_owned();
        run_blocking(move || {
            store.transaction(|tx| {
                let now = Utc::now();
                if mappings::get_by_task(tx, &id)?.is_none() {
                    mappings::insert(tx, &Mapping::new(id.clone(), now))?;
                }
                mappings::set_forge_ref(tx, &id, &forge_ref, now)?;
                finish_in_tx(tx, &event, &id, "forge", &message)
            })
        })
        .await
    }

    pub(super) async fn forge_update(
        &self,
        event_id: &str,
        task_id: &str,
        fields: FieldSelection,
    ) -> Result<(), HandlerError> {
        let id = task_id.to_owned();
        let (task, mapping) = self
            .read_store(move |conn| {
                Ok((tasks::require(conn, &id)?, mappings::require_by_task(conn, &id)?))
            })
            .await?;
        let forge_ref = mapping
            .forge
            .ok_or_else(|| HandlerError::Payload(format!("task {task_id} has no forge binding")))?;

        let assignee = if fields.assignee {
            self.forge_assignee(&task).await
        } else {
            None
        };
        let patch = task_to_forge_patch(&task, fields, assignee.as_deref());
        if !patch.is_empty() {
            self.forge.update_issue(forge_ref.number, &patch).await?;
        }
        self.finish_task_event(
            event_id,
            task_id,
            "forge",
            format!("issue #{} updated", forge_ref.number),
        )
        .await
    }

    pub(super) async fn forge_close(
        &self,
        event_id: &str,
        task_id: &str,
        reason: CloseReason,
    ) -> Result<(), HandlerError> {
        let id = task_id.to_owned();
        let mapping = self
            .read_store(move |conn| mappings::require_by_task(conn, &id))
            .await?;
        let forge_ref = mapping
            .forge
            .ok_or_else(|| HandlerError::Payload(format!("task {task_id} has no forge binding")))?;

        let patch = IssuePatch {
            state: Some(reason.target_status().to_forge().0),
            state_reason: Some(reason.state_reason()),
            ..IssuePatch::default()
        };
        self.forge.update_issue(forge_ref.number, &patch).await?;
        self.finish_task_event(
            event_id,
            task_id,
            "forge",
            format!("issue #{} closed ({})", forge_ref.number, reason.state_reason().as_str()),
        )
        .await
    }

    pub(super) async fn sheet_create(
        &self,
        event_id: &str,
        task_id: &str,
        table: &SheetTableRef,
    ) -> Result<(), HandlerError> {
        let id = task_id.to_owned();
        let table_key = table.clone();
        let (task, mapping, entry) = self
            .read_store(move |conn| {
                Ok((
                    tasks::require(conn, &id)?,
                    mappings::get_by_task(conn, &id)?,
                    registry::require(conn, &table_key)?,
                ))
            })
            .await?;

        let issue_number = mapping
            .as_ref()
            .and_then(|mapping| mapping.forge.as_ref())
            .map(|forge| forge.number);
        let open_id = self.sheet_assignee(&task).await;
        let fields = task_to_sheet_fields(
            &task,
            &entry,
            SheetWriteContext {
                assignee_open_id: open_id.as_deref(),
                issue_number,
            },
            Utc::now(),
        );

        if let Some(sheet_ref) = mapping.as_ref().and_then(|mapping| mapping.sheet.clone()) {
            // Already bound; rewrite the record instead.
            self.sheet.update_record(&sheet_ref, &fields).await?;
            return self
                .finish_task_event(
                    event_id,
                    task_id,
                    "sheet",
                    format!("record {} updated", sheet_ref.record_id),
                )
                .await;
        }

        // Pre-insert lookup: the bound issue number is the deterministic
        // key when present, the exact title otherwise.
        let existing = self
            .sheet
            .search_records(table, &RecordQuery::default())
            .await?
            .into_iter()
            .find(|record| {
                if let Some(number) = issue_number {
                    if record
                        .fields
                        .get(&entry.fields.github_issue)
                        .and_then(Value::as_u64)
                        == Some(number)
                    {
                        return true;
                    }
                }
                record
                    .fields
                    .get(&entry.fields.title)
                    .map(text_value)
                    .is_some_and(|title| title == task.title)
            });

        let record_id = match existing {
            Some(record) => {
                let sheet_ref =
                    SheetRecordRef::new(&table.app_token, &table.table_id, &record.record_id);
                self.sheet.update_record(&sheet_ref, &fields).await?;
                record.record_id
            }
            None => self.sheet.create_record(table, &fields).await?,
        };
        let sheet_ref = SheetRecordRef::new(&table.app_token, &table.table_id, record_id);
        let message = format!("record {} bound", sheet_ref.record_id);

        let store = self.store.clone();
        let event = event_id.to_owned();
        let id = task_id.to_owned();
        run_blocking(move || {
            store.transaction(|tx| {
                let now = Utc::now();
                if mappings::get_by_task(tx, &id)?.is_none() {
                    mappings::insert(tx, &Mapping::new(id.clone(), now))?;
                }
                mappings::set_sheet_ref(tx, &id, &sheet_ref, now)?;
                finish_in_tx(tx, &event, &id, "sheet", &message)
            })
        })
        .await
    }

    pub(super) async fn sheet_update(
        &self,
        event_id: &str,
        task_id: &str,
    ) -> Result<(), HandlerError> {
        let id = task_id.to_owned();
        let (task, mapping) = self
            .read_store(move |conn| {
                Ok((tasks::require(conn, &id)?, mappings::require_by_task(conn, &id)?))
            })
            .await?;
        let sheet_ref = mapping
            .sheet
            .clone()
            .ok_or_else(|| HandlerError::Payload(format!("task {task_id} has no sheet binding")))?;

        let table = sheet_ref.table();
        let entry = self
            .read_store(move |conn| registry::require(conn, &table))
            .await?;
        let open_id = self.sheet_assignee(&task).await;
        let fields = task_to_sheet_fields(
            &task,
            &entry,
            SheetWriteContext {
                assignee_open_id: open_id.as_deref(),
                issue_number: mapping.forge.as_ref().map(|forge| forge.number),
            },
            Utc::now(),
        );
        self.sheet.update_record(&sheet_ref, &fields).await?;
        self.finish_task_event(
            event_id,
            task_id,
            "sheet",
            format!("record {} updated", sheet_ref.record_id),
        )
        .await
    }

    pub(super) async fn convert_forge_to_sheet(
        &self,
        event_id: &str,
        issue_ref: &ForgeIssueRef,
        table: &SheetTableRef,
    ) -> Result<(), HandlerError> {
        if issue_ref.repo != self.forge.repo() {
            return Err(HandlerError::Payload(format!(
                "issue {}#{} is outside the configured repository",
                issue_ref.repo, issue_ref.number
            )));
        }
        let table_key = table.clone();
        self.read_store(move |conn| registry::require(conn, &table_key))
            .await?;

        let issue = self.forge.get_issue(issue_ref.number).await?;
        let lookup = issue_ref.clone();
        let mapping = self
            .read_store(move |conn| mappings::get_by_forge_ref(conn, &lookup))
            .await?;

        let store = self.store.clone();
        let event = event_id.to_owned();
        let max_attempts = self.config.max_attempts;
        let table = table.clone();
        let issue_ref = issue_ref.clone();

        if let Some(mapping) = mapping {
            // The issue is already tracked; only the sheet side may be
            // missing.
            let needs_sheet = mapping.sheet.is_none();
            let task_id = mapping.task_id;
            return run_blocking(move || {
                store.transaction(|tx| {
                    let now = Utc::now();
                    if needs_sheet {
                        outbox::enqueue(
                            tx,
                            &EventPayload::SheetCreateRecord {
                                task_id: task_id.clone(),
                                table,
                            },
                            max_attempts,
                            now,
                        )?;
                    }
                    outbox::mark_sent(tx, &event, now)?;
                    audit::append(
                        tx,
                        "inbound",
                        "convert",
                        Some(&task_id),
                        "success",
                        Some("issue already tracked"),
                        now,
                    )
                })
            })
            .await;
        }

        let mut task = forge_issue_to_task(&issue, None);
        task.target_table = Some(table.clone());
        if let Some(username) = issue.assignees.first().cloned() {
            task.assignee_member_id = self
                .read_store(move |conn| members::find_by_forge_username(conn, &username))
                .await?
                .map(|member| member.member_id);
        }
        let message = format!("issue #{} imported", issue.number);

        run_blocking(move || {
            store.transaction(|tx| {
                let now = Utc::now();
                tasks::insert(tx, &task)?;
                let mut binding = Mapping::new(task.task_id.clone(), now);
                binding.forge = Some(issue_ref);
                mappings::insert(tx, &binding)?;
                outbox::enqueue(
                    tx,
                    &EventPayload::SheetCreateRecord {
                        task_id: task.task_id.clone(),
                        table,
                    },
                    max_attempts,
                    now,
                )?;
                outbox::mark_sent(tx, &event, now)?;
                audit::append(
                    tx,
                    "inbound",
                    "convert",
                    Some(&task.task_id),
                    "success",
                    Some(&message),
                    now,
                )
            })
        })
        .await
    }

    pub(super) async fn convert_sheet_to_forge(
        &self,
        event_id: &str,
        record_ref: &SheetRecordRef,
    ) -> Result<(), HandlerError> {
        let table = record_ref.table();
        let entry = self
            .read_store(move |conn| registry::require(conn, &table))
            .await?;
        let record = self.sheet.get_record(record_ref).await?;

        let record_id = record_ref.record_id.clone();
        let mapping = self
            .read_store(move |conn| mappings::get_by_sheet_record(conn, &record_id))
            .await?;

        let store = self.store.clone();
        let event = event_id.to_owned();
        let max_attempts = self.config.max_attempts;

        if let Some(mapping) = mapping {
            let needs_forge = mapping.forge.is_none();
            let task_id = mapping.task_id;
            return run_blocking(move || {
                store.transaction(|tx| {
                    let now = Utc::now();
                    if needs_forge {
                        outbox::enqueue(
                            tx,
                            &EventPayload::ForgeCreateIssue {
                                task_id: task_id.clone(),
                            },
                            max_attempts,
                            now,
                        )?;
                    }
                    outbox::mark_sent(tx, &event, now)?;
                    audit::append(
                        tx,
                        "inbound",
                        "convert",
                        Some(&task_id),
                        "success",
                        Some("record already tracked"),
                        now,
                    )
                })
            })
            .await;
        }

        let pull = sheet_record_to_task(&record, &entry, None, Utc::now());
        let mut task = pull.task;
        if let Some(open_id) = pull.assignee_open_id {
            task.assignee_member_id = self
                .read_store(move |conn| members::find_by_sheet_open_id(conn, &open_id))
                .await?
                .map(|member| member.member_id);
        }
        let record_ref = record_ref.clone();
        let message = format!("record {} imported", record_ref.record_id);

        run_blocking(move || {
            store.transaction(|tx| {
                let now = Utc::now();
                tasks::insert(tx, &task)?;
                let mut binding = Mapping::new(task.task_id.clone(), now);
                binding.sheet = Some(record_ref);
                mappings::insert(tx, &binding)?;
                outbox::enqueue(
                    tx,
                    &EventPayload::ForgeCreateIssue {
                        task_id: task.task_id.clone(),
                    },
                    max_attempts,
                    now,
                )?;
                outbox::mark_sent(tx, &event, now)?;
                audit::append(
                    tx,
                    "inbound",
                    "convert",
                    Some(&task.task_id),
                    "success",
                    Some(&message),
                    now,
                )
            })
        })
        .await
    }

    pub(super) async fn notify(
        &self,
        event_id: &str,
        member_id: Option<&str>,
        message: &str,
    ) -> Result<(), HandlerError> {
        let target = match member_id {
            Some(member_id) => match self.resolver.resolve(member_id).await {
                Ok(identity) => identity
                    .sheet_open_id
                    .map(MessageTarget::OpenId)
                    .or_else(|| self.config.notify_chat_id.clone().map(MessageTarget::Chat)),
                Err(err) => {
                    warn!(member_id, error = %err, "notify target unresolvable");
                    self.config.notify_chat_id.clone().map(MessageTarget::Chat)
                }
            },
            None => self.config.notify_chat_id.clone().map(MessageTarget::Chat),
        };

        let status = match &target {
            Some(target) => {
                self.sheet.send_text(target, message).await?;
                "success"
            }
            None => {
                warn!("notification dropped, no deliverable target configured");
                "skipped"
            }
        };

        let store = self.store.clone();
        let event = event_id.to_owned();
        let subject_id = member_id.map(ToOwned::to_owned);
        let text = message.to_owned();
        let status = status.to_owned();
        run_blocking(move || {
            store.transaction(|tx| {
                let now = Utc::now();
                outbox::mark_sent(tx, &event, now)?;
                audit::append(
                    tx,
                    "outbound",
                    "notify",
                    subject_id.as_deref(),
                    &status,
                    Some(&text),
                    now,
                )
            })
        })
        .await
    }

    /// Resolves the forge username of the task's assignee, `None` when the
    /// task is unassigned or the facet is unknown.
    async fn forge_assignee(&self, task: &Task) -> Option<String> {
        let member_id = task.assignee_member_id.as_deref()?;
        match self.resolver.resolve(member_id).await {
            Ok(identity) => identity.forge_username,
            Err(err) => {
                warn!(member_id, error = %err, "assignee resolution failed");
                None
            }
        }
    }

    /// Resolves the sheet open id of the task's assignee.
    async fn sheet_assignee(&self, task: &Task) -> Option<String> {
        let member_id = task.assignee_member_id.as_deref()?;
        match self.resolver.resolve(member_id).await {
            Ok(identity) => identity.sheet_open_id,
            Err(err) => {
                warn!(member_id, error = %err, "assignee resolution failed");
                None
            }
        }
    }

    /// Success path for task-bound events: `sent`, sync status, audit in
    /// one transaction.
    async fn finish_task_event(
        &self,
        event_id: &str,
        task_id: &str,
        subject: &'static str,
        message: String,
    ) -> Result<(), HandlerError> {
        let store = self.store.clone();
        let event = event_id.to_owned();
        let id = task_id.to_owned();
        run_blocking(move || {
            store.transaction(|tx| finish_in_tx(tx, &event, &id, subject, &message))
        })
        .await
    }

    async fn read_store<T, F>(&self, f: F) -> Result<T, HandlerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.read(f))
            .await
            .map_err(|err| {
                HandlerError::Store(StoreError::Constraint(format!("store task failed: {err}")))
            })?
            .map_err(HandlerError::Store)
    }
}

/// Marks the event sent, settles the mapping's sync status once the task's
/// queue is quiet, and appends the audit entry.
fn finish_in_tx(
    tx: &rusqlite::Transaction<'_>,
    event_id: &str,
    task_id: &str,
    subject: &str,
    message: &str,
) -> Result<(), StoreError> {
    let now = Utc::now();
    outbox::mark_sent(tx, event_id, now)?;
    if outbox::open_for_task(tx, task_id)? == 0 {
        match mappings::set_sync_status(tx, task_id, SyncStatus::Synced, now) {
            Ok(()) | Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    audit::append(tx, "outbound", subject, Some(task_id), "success", Some(message), now)
}

async fn run_blocking(
    f: impl FnOnce() -> Result<(), StoreError> + Send + 'static,
) -> Result<(), HandlerError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| {
            HandlerError::Store(StoreError::Constraint(format!("store task failed: {err}")))
        })?
        .map_err(HandlerError::Store)
}
