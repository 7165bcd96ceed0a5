//! Reconciler flows: remote-change pull, conflict last-write-wins,
//! conversions, write-loop suppression, and malformed remote data.

mod common;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::{TestEnv, REPO};
use taskbridge_core::config::SyncConfig;
use taskbridge_core::model::{ForgeIssueRef, SyncStatus, TaskSource, TaskStatus};
use taskbridge_daemon::event::{EventPayload, EventStatus};
use taskbridge_daemon::intent::{NewTaskRequest, TaskPatch};
use taskbridge_daemon::reconcile::{ForgeReconciler, SheetReconciler};
use taskbridge_daemon::store::tasks::TaskFilter;
use taskbridge_daemon::store::{cursor, outbox};

fn sync_config() -> SyncConfig {
    SyncConfig {
        interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

impl TestEnv {
    fn forge_reconciler(&self) -> ForgeReconciler {
        ForgeReconciler::new(self.store.clone(), self.forge.clone(), &sync_config())
    }

    fn sheet_reconciler(&self) -> SheetReconciler {
        SheetReconciler::new(self.store.clone(), self.sheet.clone(), &sync_config())
    }
}

#[tokio::test]
async fn remote_sheet_edit_wins_conflict_and_fans_out() {
    let env = TestEnv::new();
    let table = env.register_default_table();
    env.add_member();

    let task_id = env
        .intents
        .create_task(NewTaskRequest {
            title: "T1".into(),
            body: "details".into(),
            target_table: Some(table),
            ..NewTaskRequest::default()
        })
        .unwrap();
    env.dispatcher.drain().await.unwrap();

    // Local edit at t2...
    env.intents
        .update_task(
            &task_id,
            TaskPatch {
                title: Some("T1 local".into()),
                ..TaskPatch::default()
            },
        )
        .unwrap();
    env.dispatcher.drain().await.unwrap();

    // ...then a later remote edit at t3 with a different title.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let record_id = env
        .intents
        .get_task(&task_id)
        .unwrap()
        .mapping
        .unwrap()
        .sheet
        .unwrap()
        .record_id;
    env.sheet.edit_record(&record_id, |record| {
        record.fields.insert("Task Name".into(), json!("T1 remote"));
        record.last_modified = Some(Utc::now());
    });

    let outcome = env.sheet_reconciler().tick().await.unwrap();
    assert_eq!(outcome.conflicts, 1);

    // Last write wins: the sheet title lands locally.
    let view = env.intents.get_task(&task_id).unwrap();
    assert_eq!(view.task.title, "T1 remote");
    assert_eq!(view.mapping.unwrap().sync_status, SyncStatus::Conflict);

    // The operator is told, and the forge is brought up to date.
    let pending = env
        .store
        .read(|conn| outbox::list_by_status(conn, EventStatus::Pending))
        .unwrap();
    assert!(pending
        .iter()
        .any(|event| matches!(event.payload, EventPayload::NotifyMember { .. })));
    assert!(pending
        .iter()
        .any(|event| matches!(event.payload, EventPayload::ForgeUpdateIssue { .. })));

    env.drain_through_backoff().await;
    let forge_ref = env.intents.get_task(&task_id).unwrap().mapping.unwrap().forge.unwrap();
    let issue = env.forge.issue(forge_ref.number).unwrap();
    assert_eq!(issue.title, format!("[AUTO][task:{task_id}] T1 remote"));
}

#[tokio::test]
async fn convert_imports_forge_issue_and_creates_sheet_record() {
    let env = TestEnv::new();
    let table = env.register_default_table();

    let number = env.forge.seed_issue("Fix login", "Session drops on refresh", Utc::now());
    env.intents
        .convert_forge_to_sheet(ForgeIssueRef::new(REPO, number), Some(table))
        .unwrap();
    env.dispatcher.drain().await.unwrap();

    let tasks = env.intents.list_tasks(&TaskFilter::default()).unwrap();
    assert_eq!(tasks.len(), 1);
    let view = &tasks[0];
    assert_eq!(view.task.title, "Fix login");
    assert_eq!(view.task.source, TaskSource::ForgePull);

    let mapping = view.mapping.as_ref().unwrap();
    assert_eq!(mapping.forge.as_ref().unwrap().number, number);
    let sheet_ref = mapping.sheet.as_ref().unwrap();
    let record = env.sheet.record(&sheet_ref.record_id).unwrap();
    assert_eq!(record.fields.get("Task Name"), Some(&json!("Fix login")));
    assert_eq!(record.fields.get("GitHub Issue"), Some(&json!(number)));
}

#[tokio::test]
async fn reconciler_imports_unmapped_issue_once() {
    let env = TestEnv::new();
    env.register_default_table();

    let number = env.forge.seed_issue("Stray issue", "", Utc::now());
    let outcome = env.forge_reconciler().tick().await.unwrap();
    assert_eq!(outcome.imported, 1);

    let tasks = env.intents.list_tasks(&TaskFilter::default()).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task.source, TaskSource::ForgePull);
    assert_eq!(tasks[0].mapping.as_ref().unwrap().forge.as_ref().unwrap().number, number);

    // The sheet side catches up through the default table.
    let pending = env
        .store
        .read(|conn| outbox::list_by_status(conn, EventStatus::Pending))
        .unwrap();
    assert!(pending
        .iter()
        .any(|event| matches!(event.payload, EventPayload::SheetCreateRecord { .. })));

    // A second tick sees the same issue as already reconciled.
    let outcome = env.forge_reconciler().tick().await.unwrap();
    assert_eq!(outcome.imported, 0);
    assert_eq!(env.intents.list_tasks(&TaskFilter::default()).unwrap().len(), 1);
}

#[tokio::test]
async fn push_then_pull_does_not_echo_events() {
    let env = TestEnv::new();
    let table = env.register_default_table();
    env.add_member();

    env.intents
        .create_task(NewTaskRequest {
            title: "Quiet".into(),
            body: "no echo".into(),
            assignee_email: Some("a@co.example".into()),
            labels: vec!["infra".into()],
            target_table: Some(table),
            ..NewTaskRequest::default()
        })
        .unwrap();
    env.dispatcher.drain().await.unwrap();
    assert_eq!(env.store.read(outbox::open_count).unwrap(), 0);

    // Both reconcilers observe our own writes coming back; neither may
    // enqueue catch-up work for them.
    env.forge_reconciler().tick().await.unwrap();
    env.sheet_reconciler().tick().await.unwrap();
    assert_eq!(env.store.read(outbox::open_count).unwrap(), 0);

    let outcome = env.forge_reconciler().tick().await.unwrap();
    assert_eq!(outcome.imported + outcome.updated + outcome.conflicts, 0);
}

#[tokio::test]
async fn remote_status_outside_lattice_is_quarantined() {
    let env = TestEnv::new();
    let table = env.register_default_table();

    let task_id = env
        .intents
        .create_task(NewTaskRequest {
            title: "Odd".into(),
            target_table: Some(table),
            ..NewTaskRequest::default()
        })
        .unwrap();
    env.dispatcher.drain().await.unwrap();

    let record_id = env
        .intents
        .get_task(&task_id)
        .unwrap()
        .mapping
        .unwrap()
        .sheet
        .unwrap()
        .record_id;
    tokio::time::sleep(Duration::from_millis(5)).await;
    env.sheet.edit_record(&record_id, |record| {
        record.fields.insert("Status".into(), json!("Blocked"));
        record.last_modified = Some(Utc::now());
    });

    let outcome = env.sheet_reconciler().tick().await.unwrap();
    assert_eq!(outcome.conflicts, 1);

    // Local status is preserved; the mapping is flagged.
    let view = env.intents.get_task(&task_id).unwrap();
    assert_eq!(view.task.status, TaskStatus::ToDo);
    assert_eq!(view.mapping.unwrap().sync_status, SyncStatus::Conflict);
}

#[tokio::test]
async fn cursor_advances_monotonically_across_ticks() {
    let env = TestEnv::new();
    env.register_default_table();
    env.forge.seed_issue("First", "", Utc::now());

    env.forge_reconciler().tick().await.unwrap();
    let after_first = env
        .store
        .read(|conn| cursor::get_time(conn, taskbridge_daemon::reconcile::FORGE_CURSOR))
        .unwrap()
        .expect("cursor set");

    env.forge_reconciler().tick().await.unwrap();
    let after_second = env
        .store
        .read(|conn| cursor::get_time(conn, taskbridge_daemon::reconcile::FORGE_CURSOR))
        .unwrap()
        .expect("cursor still set");
    assert!(after_second >= after_first);
}
