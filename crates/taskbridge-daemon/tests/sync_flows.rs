//! End-to-end dispatch flows against mock gateways: create-and-sync,
//! close propagation, dead-lettering, retry, crash recovery, and handler
//! idempotency.

mod common;

use chrono::Utc;
use rusqlite::params;
use serde_json::json;

use common::TestEnv;
use taskbridge_core::forge::ForgeGateway;
use taskbridge_core::gateway::GatewayError;
use taskbridge_core::mapper::task_to_forge_issue;
use taskbridge_core::model::{CloseReason, IssueState, StateReason, SyncStatus, TaskStatus};
use taskbridge_daemon::event::{EventPayload, EventStatus};
use taskbridge_daemon::intent::{NewTaskRequest, TaskPatch};
use taskbridge_daemon::store::{audit, outbox};

#[tokio::test]
async fn create_and_sync_binds_both_stores() {
    let env = TestEnv::new();
    let table = env.register_default_table();
    let member_id = env.add_member();

    let task_id = env
        .intents
        .create_task(NewTaskRequest {
            title: "T1".into(),
            assignee_email: Some("a@co.example".into()),
            labels: vec!["bug".into()],
            target_table: Some(table),
            ..NewTaskRequest::default()
        })
        .unwrap();

    let view = env.intents.get_task(&task_id).unwrap();
    assert_eq!(view.task.status, TaskStatus::ToDo);
    assert_eq!(view.task.assignee_member_id.as_deref(), Some(member_id.as_str()));

    env.dispatcher.drain().await.unwrap();

    let mapping = env.intents.get_task(&task_id).unwrap().mapping.unwrap();
    assert_eq!(mapping.sync_status, SyncStatus::Synced);
    let forge_ref = mapping.forge.expect("forge binding");
    let sheet_ref = mapping.sheet.expect("sheet binding");

    let issue = env.forge.issue(forge_ref.number).unwrap();
    assert_eq!(issue.title, format!("[AUTO][task:{task_id}] T1"));
    assert_eq!(issue.assignees, vec!["a-gh".to_owned()]);
    assert!(issue.labels.contains(&"bug".to_owned()));

    let record = env.sheet.record(&sheet_ref.record_id).unwrap();
    assert_eq!(record.fields.get("Task Name"), Some(&json!("T1")));
    assert_eq!(record.fields.get("Status"), Some(&json!("To Do")));
    assert_eq!(record.fields.get("Assignee"), Some(&json!([{ "id": "ou_A" }])));
    assert_eq!(
        record.fields.get("GitHub Issue"),
        Some(&json!(forge_ref.number))
    );
}

#[tokio::test]
async fn close_propagates_to_both_stores() {
    let env = TestEnv::new();
    let table = env.register_default_table();
    env.add_member();

    let task_id = env
        .intents
        .create_task(NewTaskRequest {
            title: "Ship it".into(),
            target_table: Some(table),
            ..NewTaskRequest::default()
        })
        .unwrap();
    env.dispatcher.drain().await.unwrap();

    env.intents
        .update_task(
            &task_id,
            TaskPatch {
                status: Some(TaskStatus::InProgress),
                ..TaskPatch::default()
            },
        )
        .unwrap();
    env.dispatcher.drain().await.unwrap();

    env.intents.close_task(&task_id, CloseReason::Completed).unwrap();
    env.dispatcher.drain().await.unwrap();

    let view = env.intents.get_task(&task_id).unwrap();
    assert_eq!(view.task.status, TaskStatus::Done);

    let mapping = view.mapping.unwrap();
    let issue = env.forge.issue(mapping.forge.unwrap().number).unwrap();
    assert_eq!(issue.state, IssueState::Closed);
    assert_eq!(issue.state_reason, Some(StateReason::Completed));

    let record = env.sheet.record(&mapping.sheet.unwrap().record_id).unwrap();
    assert_eq!(record.fields.get("Status"), Some(&json!("Done")));
}

#[tokio::test]
async fn permanent_failure_dead_letters_and_notifies() {
    let env = TestEnv::new();
    env.forge
        .fail_next_create(GatewayError::InvalidRequest("422: bad field".into()));

    let task_id = env
        .intents
        .create_task(NewTaskRequest {
            title: "Broken".into(),
            ..NewTaskRequest::default()
        })
        .unwrap();
    env.drain_through_backoff().await;

    let dead = env
        .store
        .read(|conn| outbox::list_by_status(conn, EventStatus::Dead))
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert!(matches!(dead[0].payload, EventPayload::ForgeCreateIssue { .. }));
    assert!(dead[0].last_error.as_deref().unwrap().contains("422"));

    let mapping = env.intents.get_task(&task_id).unwrap().mapping.unwrap();
    assert_eq!(mapping.sync_status, SyncStatus::Error);

    // The operator chat hears about it.
    let messages = env.sheet.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "oc_ops");
    assert!(messages[0].1.contains("dead-lettered"));

    let entries = env
        .store
        .read(|conn| audit::list_for(conn, "forge_create_issue", &task_id))
        .unwrap();
    assert!(entries.iter().any(|entry| entry.status == "dead"));
    assert_eq!(env.forge.creates(), 0);
}

#[tokio::test]
async fn transient_failures_retry_with_backoff_until_success() {
    let env = TestEnv::new();
    env.forge.fail_next_create(GatewayError::Transient("timeout".into()));
    env.forge.fail_next_create(GatewayError::Transient("503".into()));

    let task_id = env
        .intents
        .create_task(NewTaskRequest {
            title: "Flaky".into(),
            ..NewTaskRequest::default()
        })
        .unwrap();
    env.drain_through_backoff().await;

    assert_eq!(env.forge.creates(), 1);
    let mapping = env.intents.get_task(&task_id).unwrap().mapping.unwrap();
    assert!(mapping.forge.is_some());
    assert_eq!(mapping.sync_status, SyncStatus::Synced);

    // Each failed attempt left its error in the audit trail.
    let entries = env
        .store
        .read(|conn| audit::list_for(conn, "forge_create_issue", &task_id))
        .unwrap();
    assert_eq!(
        entries.iter().filter(|entry| entry.status == "failed").count(),
        2
    );
}

#[tokio::test]
async fn crash_between_create_and_commit_does_not_duplicate() {
    let env = TestEnv::new();
    let task_id = env
        .intents
        .create_task(NewTaskRequest {
            title: "Crashy".into(),
            ..NewTaskRequest::default()
        })
        .unwrap();

    // A worker claims the event, performs the external create, then dies
    // before the completion transaction.
    let claimed = env
        .store
        .transaction(|tx| outbox::claim(tx, 10, Utc::now(), std::time::Duration::from_secs(120)))
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let task = env.intents.get_task(&task_id).unwrap().task;
    env.forge
        .create_issue(&task_to_forge_issue(&task, None))
        .await
        .unwrap();

    // Restart after the reclaim threshold: age the abandoned claim.
    let stale = (Utc::now() - chrono::Duration::minutes(3)).to_rfc3339();
    env.store
        .transaction(|tx| {
            tx.execute("UPDATE outbox SET processing_at = ?1", params![stale])?;
            Ok(())
        })
        .unwrap();

    env.dispatcher.drain().await.unwrap();

    // The pre-check found the issue by its title prefix; no duplicate.
    assert_eq!(env.forge.creates(), 1);
    assert_eq!(env.forge.issue_count(), 1);
    let mapping = env.intents.get_task(&task_id).unwrap().mapping.unwrap();
    assert!(mapping.forge.is_some());
    let open = env.store.read(outbox::open_count).unwrap();
    assert_eq!(open, 0);
}

#[tokio::test]
async fn replayed_events_do_not_create_twice() {
    let env = TestEnv::new();
    let table = env.register_default_table();
    let task_id = env
        .intents
        .create_task(NewTaskRequest {
            title: "Once".into(),
            target_table: Some(table.clone()),
            ..NewTaskRequest::default()
        })
        .unwrap();
    env.dispatcher.drain().await.unwrap();
    assert_eq!(env.forge.creates(), 1);
    assert_eq!(env.sheet.creates(), 1);

    // Replay both creation events with identical payloads.
    let replay_task = task_id.clone();
    env.store
        .transaction(move |tx| {
            let now = Utc::now();
            outbox::enqueue(
                tx,
                &EventPayload::ForgeCreateIssue {
                    task_id: replay_task.clone(),
                },
                common::MAX_ATTEMPTS,
                now,
            )?;
            outbox::enqueue(
                tx,
                &EventPayload::SheetCreateRecord {
                    task_id: replay_task,
                    table,
                },
                common::MAX_ATTEMPTS,
                now,
            )?;
            Ok(())
        })
        .unwrap();
    env.dispatcher.drain().await.unwrap();

    // Replays degrade into updates; external state is unchanged.
    assert_eq!(env.forge.creates(), 1);
    assert_eq!(env.sheet.creates(), 1);
    assert_eq!(env.forge.issue_count(), 1);
    assert_eq!(env.sheet.record_count(), 1);
    let mapping = env.intents.get_task(&task_id).unwrap().mapping.unwrap();
    assert_eq!(mapping.sync_status, SyncStatus::Synced);
}
