//! Sheet-side reconciler.
//!
//! Tables that expose a last-modified column are polled with a
//! `modified since cursor` filter; the rest are full-scanned with content
//! hashing over the mapped columns to detect change, which is acceptable
//! because registered tables are bounded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskbridge_core::config::SyncConfig;
use taskbridge_core::mapper::{sheet_record_to_task, FieldSelection};
use taskbridge_core::model::{Mapping, SheetRecordRef, SyncStatus, TableRegistryEntry, Task};
use taskbridge_core::sheet::{RecordQuery, SheetGateway, SheetRecord};

use super::{run_store, run_tx, ReconcileError, ReconcileOutcome};
use crate::event::EventPayload;
use crate::store::{audit, cursor, mappings, members, outbox, registry, tasks, Store};

/// Cursor key for the sheet source.
pub const SHEET_CURSOR: &str = "sheet";

/// Polls every registered sheet table and folds changed records into the
/// local model.
pub struct SheetReconciler {
    store: Store,
    sheet: Arc<dyn SheetGateway>,
    interval: Duration,
    max_attempts: u32,
}

impl SheetReconciler {
    #[must_use]
    pub fn new(store: Store, sheet: Arc<dyn SheetGateway>, sync: &SyncConfig) -> Self {
        Self {
            store,
            sheet,
            interval: sync.interval,
            max_attempts: sync.max_attempts,
        }
    }

    /// Interval loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "sheet reconciler started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {
                    match self.tick().await {
                        Ok(outcome) => debug!(?outcome, "sheet reconcile tick"),
                        Err(err) => warn!(error = %err, "sheet reconcile tick failed"),
                    }
                }
            }
        }
        info!("sheet reconciler stopped");
    }

    /// One reconciliation pass over every registered table.
    pub async fn tick(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let entries = run_store(self.store.clone(), registry::list).await?;
        let since =
            run_store(self.store.clone(), |conn| cursor::get_time(conn, SHEET_CURSOR)).await?;

        let mut outcome = ReconcileOutcome::default();
        let mut newest: Option<DateTime<Utc>> = None;

        for entry in entries {
            let query = RecordQuery {
                modified_since: entry
                    .fields
                    .last_modified
                    .clone()
                    .and_then(|field| since.map(|at| (field, at))),
                page_size: None,
            };
            let records = self.sheet.search_records(&entry.table, &query).await?;
            for record in records {
                if let Some(modified) = record.last_modified {
                    newest = Some(newest.map_or(modified, |seen| seen.max(modified)));
                }
                self.process_record(&entry, record, &mut outcome).await?;
            }
        }

        if let Some(newest) = newest {
            run_tx(self.store.clone(), move |tx| {
                cursor::advance_time(tx, SHEET_CURSOR, newest, Utc::now()).map(|_| ())
            })
            .await?;
        }
        Ok(outcome)
    }

    async fn process_record(
        &self,
        entry: &TableRegistryEntry,
        record: SheetRecord,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ReconcileError> {
        let record_id = record.record_id.clone();
        let mapping = run_store(self.store.clone(), move |conn| {
            mappings::get_by_sheet_record(conn, &record_id)
        })
        .await?;

        match mapping {
            None => {
                self.import_record(entry, record).await?;
                outcome.imported += 1;
            }
            Some(mapping) => self.merge_record(entry, record, mapping, outcome).await?,
        }
        Ok(())
    }

    /// An unmapped record becomes a new `sheet_pull` task; the forge side
    /// catches up through an enqueued issue creation.
    async fn import_record(
        &self,
        entry: &TableRegistryEntry,
        record: SheetRecord,
    ) -> Result<(), ReconcileError> {
        let now = Utc::now();
        let pull = sheet_record_to_task(&record, entry, None, now);
        let mut task = pull.task;
        task.assignee_member_id = self.member_for_open_id(pull.assignee_open_id).await?;

        let sheet_ref =
            SheetRecordRef::new(&entry.table.app_token, &entry.table.table_id, &record.record_id);
        let remote_time = record.last_modified.unwrap_or(now);
        let hash = content_hash(&record, entry);
        let foreign_status = pull.foreign_status;
        let max_attempts = self.max_attempts;

        run_tx(self.store.clone(), move |tx| {
            let now = Utc::now();
            tasks::insert(tx, &task)?;
            let mut binding = Mapping::new(task.task_id.clone(), now);
            binding.sheet = Some(sheet_ref);
            binding.last_synced_at = Some(remote_time);
            binding.sheet_content_hash = Some(hash);
            if foreign_status.is_some() {
                binding.sync_status = SyncStatus::Conflict;
            }
            mappings::insert(tx, &binding)?;

            if let Some(raw) = &foreign_status {
                audit::append(
                    tx,
                    "inbound",
                    "sheet",
                    Some(&task.task_id),
                    "conflict",
                    Some(&format!("status outside lattice: {raw:?}")),
                    now,
                )?;
            }
            outbox::enqueue(
                tx,
                &EventPayload::ForgeCreateIssue {
                    task_id: task.task_id.clone(),
                },
                max_attempts,
                now,
            )?;
            audit::append(
                tx,
                "inbound",
                "sheet",
                Some(&task.task_id),
                "success",
                Some("record imported"),
                now,
            )
        })
        .await
    }

    async fn merge_record(
        &self,
        entry: &TableRegistryEntry,
        record: SheetRecord,
        mapping: Mapping,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ReconcileError> {
        let id = mapping.task_id.clone();
        let task = run_store(self.store.clone(), move |conn| tasks::require(conn, &id)).await?;

        let now = Utc::now();
        let hash = content_hash(&record, entry);
        let last_synced = mapping.last_synced_at.unwrap_or(mapping.created_at);
        let remote_time = record.last_modified.unwrap_or(now);

        // Change detection: timestamp when the table has one, content hash
        // on full scans.
        if record.last_modified.is_some() {
            if remote_time <= last_synced {
                outcome.unchanged += 1;
                return Ok(());
            }
        } else if mapping.sheet_content_hash.as_deref() == Some(hash.as_str()) {
            outcome.unchanged += 1;
            return Ok(());
        }

        let pull = sheet_record_to_task(&record, entry, Some(&task), now);
        if let Some(raw) = pull.foreign_status {
            // Malformed remote status: record it verbatim, flag the
            // mapping, leave local data alone.
            let task_id = mapping.task_id.clone();
            run_tx(self.store.clone(), move |tx| {
                let now = Utc::now();
                audit::append(
                    tx,
                    "inbound",
                    "sheet",
                    Some(&task_id),
                    "conflict",
                    Some(&format!("status outside lattice: {raw:?}")),
                    now,
                )?;
                mappings::set_sync_status(tx, &task_id, SyncStatus::Conflict, now)
            })
            .await?;
            outcome.conflicts += 1;
            return Ok(());
        }

        let mut remote_task = pull.task;
        remote_task.assignee_member_id = self.member_for_open_id(pull.assignee_open_id).await?;

        if remote_task.same_content(&task) {
            let task_id = mapping.task_id.clone();
            run_tx(self.store.clone(), move |tx| {
                mappings::set_reconciled(tx, &task_id, remote_time, Some(&hash), Utc::now())
            })
            .await?;
            outcome.unchanged += 1;
            return Ok(());
        }

        let local_changed = task.updated_at > last_synced;
        let remote_wins = remote_time >= task.updated_at;
        let forge_bound = mapping.forge.is_some();
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
                    "sheet",
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
                    apply_remote(tx, &task, &remote_task, remote_time, &hash, forge_bound, max_attempts)?;
                } else if outbox::open_for_task(tx, &task_id)? == 0 {
                    outbox::enqueue(
                        tx,
                        &EventPayload::SheetUpdateRecord {
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
            apply_remote(tx, &task, &remote_task, remote_time, &hash, forge_bound, max_attempts)
        })
        .await
    }

    async fn member_for_open_id(
        &self,
        open_id: Option<String>,
    ) -> Result<Option<String>, ReconcileError> {
        let Some(open_id) = open_id else {
            return Ok(None);
        };
        let member = run_store(self.store.clone(), move |conn| {
            members::find_by_sheet_open_id(conn, &open_id)
        })
        .await?;
        Ok(member.map(|member| member.member_id))
    }
}

/// Applies the pulled state locally and enqueues the forge-side catch-up.
fn apply_remote(
    tx: &rusqlite::Transaction<'_>,
    prior: &Task,
    remote: &Task,
    remote_time: DateTime<Utc>,
    hash: &str,
    forge_bound: bool,
    max_attempts: u32,
) -> Result<(), crate::store::StoreError> {
    let now = Utc::now();
    let snapshot = serde_json::to_string(prior)?;
    audit::append(
        tx,
        "inbound",
        "sheet",
        Some(&prior.task_id),
        "applied",
        Some(&snapshot),
        now,
    )?;

    let mut updated = remote.clone();
    updated.updated_at = remote_time;
    tasks::update(tx, &updated)?;
    mappings::set_reconciled(tx, &prior.task_id, remote_time, Some(hash), now)?;

    if forge_bound {
        outbox::enqueue(
            tx,
            &EventPayload::ForgeUpdateIssue {
                task_id: prior.task_id.clone(),
                fields: FieldSelection::diff(prior, remote),
            },
            max_attempts,
            now,
        )?;
    }
    Ok(())
}

/// Stable hash over the mapped columns, excluding the last-sync column the
/// dispatcher itself writes.
fn content_hash(record: &SheetRecord, entry: &TableRegistryEntry) -> String {
    let map = &entry.fields;
    let mut hasher = Sha256::new();
    let mut tracked: Vec<&String> = vec![&map.title, &map.status, &map.assignee, &map.github_issue];
    if let Some(priority) = &map.priority {
        tracked.push(priority);
    }
    if let Some(description) = &map.description {
        tracked.push(description);
    }
    for field in tracked {
        if let Some(value) = record.fields.get(field) {
            hasher.update(field.as_bytes());
            hasher.update(value.to_string().as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}
