//! Forge-side reconciler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskbridge_core::config::SyncConfig;
use taskbridge_core::forge::{ForgeGateway, ForgeIssue, IssueQuery};
use taskbridge_core::mapper::{forge_issue_to_task, FieldSelection};
use taskbridge_core::model::{ForgeIssueRef, Mapping, SyncStatus, Task};

use super::{run_store, run_tx, ReconcileError, ReconcileOutcome};
use crate::event::EventPayload;
use crate::store::{audit, cursor, mappings, members, outbox, registry, tasks, Store};

/// Cursor key for the forge source.
pub const FORGE_CURSOR: &str = "forge";

const PAGE_SIZE: u32 = 100;

/// Polls the forge for issues changed past the cursor and folds them into
/// the local model.
pub struct ForgeReconciler {
    store: Store,
    forge: Arc<dyn ForgeGateway>,
    interval: Duration,
    max_attempts: u32,
}

impl ForgeReconciler {
    #[must_use]
    pub fn new(store: Store, forge: Arc<dyn ForgeGateway>, sync: &SyncConfig) -> Self {
        Self {
            store,
            forge,
            interval: sync.interval,
            max_attempts: sync.max_attempts,
        }
    }

    /// Interval loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "forge reconciler started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {
                    match self.tick().await {
                        Ok(outcome) => debug!(?outcome, "forge reconcile tick"),
                        Err(err) => warn!(error = %err, "forge reconcile tick failed"),
                    }
                }
            }
        }
        info!("forge reconciler stopped");
    }

    /// One reconciliation pass. The cursor advances to the newest
    /// `updated_at` observed, and only after every entry was processed.
    pub async fn tick(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let since = run_store(self.store.clone(), |conn| cursor::get_time(conn, FORGE_CURSOR))
            .await?;

        let mut issues = Vec::new();
        let mut page = 1;
        loop {
            let batch = self
                .forge
                .list_issues(&IssueQuery {
                    since,
                    per_page: Some(PAGE_SIZE),
                    page: Some(page),
                    ..IssueQuery::default()
                })
                .await?;
            let full = batch.len() as u32 == PAGE_SIZE;
            issues.extend(batch);
            if !full {
                break;
            }
            page += 1;
        }

        let mut outcome = ReconcileOutcome::default();
        let mut newest: Option<DateTime<Utc>> = None;
        for issue in issues {
            newest = Some(newest.map_or(issue.updated_at, |seen| seen.max(issue.updated_at)));
            self.process_issue(issue, &mut outcome).await?;
        }

        if let Some(newest) = newest {
            run_tx(self.store.clone(), move |tx| {
                cursor::advance_time(tx, FORGE_CURSOR, newest, Utc::now()).map(|_| ())
            })
            .await?;
        }
        Ok(outcome)
    }

    async fn process_issue(
        &self,
        issue: ForgeIssue,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ReconcileError> {
        let forge_ref = ForgeIssueRef::new(self.forge.repo(), issue.number);
        let lookup = forge_ref.clone();
        let mapping =
            run_store(self.store.clone(), move |conn| mappings::get_by_forge_ref(conn, &lookup))
                .await?;

        match mapping {
            None => {
                self.import_issue(issue, forge_ref).await?;
                outcome.imported += 1;
            }
            Some(mapping) => self.merge_issue(issue, mapping, outcome).await?,
        }
        Ok(())
    }

    /// An issue with no mapping becomes a new `forge_pull` task. The sheet
    /// side catches up through an enqueued create aimed at the default
    /// table, when one is registered.
    async fn import_issue(
        &self,
        issue: ForgeIssue,
        forge_ref: ForgeIssueRef,
    ) -> Result<(), ReconcileError> {
        let mut task = forge_issue_to_task(&issue, None);
        task.assignee_member_id = self.member_for_assignees(&issue.assignees).await?;
        let remote_time = issue.updated_at;
        let max_attempts = self.max_attempts;

        run_tx(self.store.clone(), move |tx| {
            let now = Utc::now();
            tasks::insert(tx, &task)?;
            let mut binding = Mapping::new(task.task_id.clone(), now);
            binding.forge = Some(forge_ref);
            binding.last_synced_at = Some(remote_time);
            mappings::insert(tx, &binding)?;

            if let Some(default_table) = registry::get_default(tx)? {
                outbox::enqueue(
                    tx,
                    &EventPayload::SheetCreateRecord {
                        task_id: task.task_id.clone(),
                        table: default_table.table,
                    },
                    max_attempts,
                    now,
                )?;
            }
            audit::append(
                tx,
                "inbound",
                "forge",
                Some(&task.task_id),
                "success",
                Some(&format!("issue #{} imported", issue.number)),
                now,
            )
        })
        .await
    }

    async fn merge_issue(
        &self,
        issue: ForgeIssue,
        mapping: Mapping,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ReconcileError> {
        let id = mapping.task_id.clone();
        let task = run_store(self.store.clone(), move |conn| tasks::require(conn, &id)).await?;

        let last_synced = mapping.last_synced_at.unwrap_or(mapping.created_at);
        let remote_time = issue.updated_at;
        if remote_time <= last_synced {
            outcome.unchanged += 1;
            return Ok(());
        }

        let mut remote_task = forge_issue_to_task(&issue, Some(&task));
        remote_task.assignee_member_id = self.member_for_assignees(&issue.assignees).await?;

        if remote_task.same_content(&task) {
            // Usually our own push echoing back; just advance the
            // watermark.
            let id = mapping.task_id.clone();
            run_tx(self.store.clone(), move |tx| {
                mappings::set_reconciled(tx, &id, remote_time, None, Utc::now())
            })
            .await?;
            outcome.unchanged += 1;
            return Ok(());
        }

        let local_changed = task.updated_at > last_synced;
        let remote_wins = remote_time >= task.updated_at;
        let sheet_bound = mapping.sheet.is_some();
        let max_attempts = self.max_attempts;
        let task_id = mapping.task_id.clone();

        if local_changed {
            outcome.conflicts += 1;
            let both = json!({ "local": task, "remote": remote_task }).to_string();
            run_tx(self.store.clone(), move |tx| {
                let now = Utc::now();
                audit::append(
                    tx,
                    "inbound",
                    "forge",
                    Some(&task_id),
                    "conflict",
                    Some(&both),
                    now,
                )?;
                mappings::set_sync_status(tx, &task_id, SyncStatus::Conflict, now)?;
                outbox::enqueue(
                    tx,
                    &EventPayload::NotifyMember {
                        member_id: None,
                        message: format!("conflict on task {task_id}: both stores changed"),
                    },
                    max_attempts,
                    now,
                )?;
                if remote_wins {
                    apply_remote(tx, &task, &remote_task, remote_time, sheet_bound, max_attempts)?;
                } else if outbox::open_for_task(tx, &task_id)? == 0 {
                    // Local wins but nothing is queued to push it; make the
                    // forge catch up.
                    outbox::enqueue(
                        tx,
                        &EventPayload::ForgeUpdateIssue {
                            task_id: task_id.clone(),
                            fields: FieldSelection::all(),
                        },
                        max_attempts,
                        now,
                    )?;
                }
                Ok(())
            })
            .await?;
            return Ok(());
        }

        outcome.updated += 1;
        run_tx(self.store.clone(), move |tx| {
            apply_remote(tx, &task, &remote_task, remote_time, sheet_bound, max_attempts)
        })
        .await
    }

    /// Maps the issue's first assignee username onto a known member.
    async fn member_for_assignees(
        &self,
        assignees: &[String],
    ) -> Result<Option<String>, ReconcileError> {
        let Some(username) = assignees.first().cloned() else {
            return Ok(None);
        };
        let member = run_store(self.store.clone(), move |conn| {
            members::find_by_forge_username(conn, &username)
        })
        .await?;
        Ok(member.map(|member| member.member_id))
    }
}

/// Applies the pulled state locally and enqueues the sheet-side catch-up.
/// Snapshots the prior state into the sync log first.
fn apply_remote(
    tx: &rusqlite::Transaction<'_>,
    prior: &Task,
    remote: &Task,
    remote_time: DateTime<Utc>,
    sheet_bound: bool,
    max_attempts: u32,
) -> Result<(), crate::store::StoreError> {
    let now = Utc::now();
    let snapshot = serde_json::to_string(prior)?;
    audit::append(
        tx,
        "inbound",
        "forge",
        Some(&prior.task_id),
        "applied",
        Some(&snapshot),
        now,
    )?;

    let mut updated = remote.clone();
    updated.updated_at = remote_time;
    tasks::update(tx, &updated)?;
    mappings::set_reconciled(tx, &prior.task_id, remote_time, None, now)?;

    if sheet_bound {
        outbox::enqueue(
            tx,
            &EventPayload::SheetUpdateRecord {
                task_id: prior.task_id.clone(),
                fields: FieldSelection::diff(prior, remote),
            },
            max_attempts,
            now,
        )?;
    }
    Ok(())
}
