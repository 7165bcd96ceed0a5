//! Store-level properties of the outbox queue: claim exclusivity,
//! per-task ordering under backoff, crash reclaim, and dead-letter
//! permanence.

mod common;

use std::time::Duration;

use chrono::Utc;

use taskbridge_core::mapper::FieldSelection;
use taskbridge_daemon::event::{EventPayload, EventStatus};
use taskbridge_daemon::store::{cursor, outbox, Store};

const RECLAIM: Duration = Duration::from_secs(120);

fn store() -> Store {
    Store::in_memory().expect("in-memory store")
}

fn create_event(task: &str) -> EventPayload {
    EventPayload::ForgeCreateIssue {
        task_id: task.to_owned(),
    }
}

fn update_event(task: &str) -> EventPayload {
    EventPayload::ForgeUpdateIssue {
        task_id: task.to_owned(),
        fields: FieldSelection::all(),
    }
}

#[test]
fn claim_takes_one_event_per_task_in_enqueue_order() {
    let store = store();
    let now = Utc::now();
    let (first, _second, other) = store
        .transaction(|tx| {
            let first = outbox::enqueue(tx, &create_event("t1"), 5, now)?;
            let second = outbox::enqueue(tx, &update_event("t1"), 5, now)?;
            let other = outbox::enqueue(tx, &create_event("t2"), 5, now)?;
            Ok((first, second, other))
        })
        .unwrap();

    let claimed = store
        .transaction(|tx| outbox::claim(tx, 10, Utc::now(), RECLAIM))
        .unwrap();
    let ids: Vec<_> = claimed.iter().map(|event| event.event_id.clone()).collect();
    assert_eq!(ids, vec![first.clone(), other], "one event per task, oldest first");

    // The second event of t1 stays blocked while the first is in flight.
    let next = store
        .transaction(|tx| outbox::claim(tx, 10, Utc::now(), RECLAIM))
        .unwrap();
    assert!(next.is_empty());

    // Completing the head unblocks the tail.
    store
        .transaction(|tx| outbox::mark_sent(tx, &first, Utc::now()))
        .unwrap();
    let next = store
        .transaction(|tx| outbox::claim(tx, 10, Utc::now(), RECLAIM))
        .unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].payload, update_event("t1"));
}

#[test]
fn backed_off_head_blocks_the_tail() {
    let store = store();
    let now = Utc::now();
    let head = store
        .transaction(|tx| {
            let head = outbox::enqueue(tx, &create_event("t1"), 5, now)?;
            outbox::enqueue(tx, &update_event("t1"), 5, now)?;
            Ok(head)
        })
        .unwrap();

    let claimed = store
        .transaction(|tx| outbox::claim(tx, 10, Utc::now(), RECLAIM))
        .unwrap();
    assert_eq!(claimed[0].event_id, head);

    // Transient failure: the head goes back with a future not_before.
    store
        .transaction(|tx| {
            outbox::retry(tx, &head, "boom", Utc::now() + chrono::Duration::minutes(5), Utc::now())
        })
        .unwrap();

    // The tail must not overtake the backed-off head.
    let claimed = store
        .transaction(|tx| outbox::claim(tx, 10, Utc::now(), RECLAIM))
        .unwrap();
    assert!(claimed.is_empty(), "tail overtook a backed-off head");
}

#[test]
fn abandoned_claims_are_reclaimed_after_the_threshold() {
    let store = store();
    let now = Utc::now();
    let id = store
        .transaction(|tx| outbox::enqueue(tx, &create_event("t1"), 5, now))
        .unwrap();

    let claimed = store
        .transaction(|tx| outbox::claim(tx, 10, now, RECLAIM))
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // A second claim inside the threshold sees nothing.
    let immediate = store
        .transaction(|tx| outbox::claim(tx, 10, now, RECLAIM))
        .unwrap();
    assert!(immediate.is_empty());

    // Simulated crash: the worker never completed. Past the threshold the
    // event is claimable again.
    let later = now + chrono::Duration::minutes(3);
    let reclaimed = store
        .transaction(|tx| outbox::claim(tx, 10, later, RECLAIM))
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].event_id, id);
}

#[test]
fn every_event_lands_in_a_known_status() {
    let store = store();
    let now = Utc::now();
    let (sent, dead, pending) = store
        .transaction(|tx| {
            let sent = outbox::enqueue(tx, &create_event("t1"), 5, now)?;
            let dead = outbox::enqueue(tx, &create_event("t2"), 5, now)?;
            let pending = outbox::enqueue(tx, &create_event("t3"), 5, now)?;
            outbox::mark_sent(tx, &sent, now)?;
            outbox::mark_dead(tx, &dead, "permanent", now)?;
            Ok((sent, dead, pending))
        })
        .unwrap();

    for (id, status) in [
        (sent, EventStatus::Sent),
        (dead, EventStatus::Dead),
        (pending, EventStatus::Pending),
    ] {
        let event = store
            .read(|conn| outbox::get(conn, &id))
            .unwrap()
            .expect("event exists");
        assert_eq!(event.status, status);
    }
}

#[test]
fn dead_events_are_never_claimed_again() {
    let store = store();
    let now = Utc::now();
    store
        .transaction(|tx| {
            let id = outbox::enqueue(tx, &create_event("t1"), 5, now)?;
            outbox::mark_dead(tx, &id, "permanent", now)
        })
        .unwrap();

    let later = now + chrono::Duration::hours(1);
    let claimed = store
        .transaction(|tx| outbox::claim(tx, 10, later, RECLAIM))
        .unwrap();
    assert!(claimed.is_empty());
}

#[test]
fn retry_records_attempts_and_error() {
    let store = store();
    let now = Utc::now();
    let id = store
        .transaction(|tx| outbox::enqueue(tx, &create_event("t1"), 5, now))
        .unwrap();

    for attempt in 1..=3 {
        store
            .transaction(|tx| outbox::claim(tx, 10, Utc::now(), RECLAIM))
            .unwrap();
        store
            .transaction(|tx| {
                outbox::retry(tx, &id, &format!("failure {attempt}"), Utc::now(), Utc::now())
            })
            .unwrap();
        let event = store.read(|conn| outbox::get(conn, &id)).unwrap().unwrap();
        assert_eq!(event.attempts, attempt);
        assert_eq!(event.last_error.as_deref(), Some(format!("failure {attempt}").as_str()));
    }
}

#[test]
fn committed_events_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");
    let now = Utc::now();

    let id = {
        let store = Store::open(&path).unwrap();
        store
            .transaction(|tx| outbox::enqueue(tx, &create_event("t1"), 5, now))
            .unwrap()
    };

    // A fresh handle sees the committed event, still pending.
    let store = Store::open(&path).unwrap();
    let event = store.read(|conn| outbox::get(conn, &id)).unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.payload, create_event("t1"));
}

#[test]
fn cursor_never_moves_backwards() {
    let store = store();
    let now = Utc::now();
    let early = now - chrono::Duration::hours(2);

    let first = store
        .transaction(|tx| cursor::advance_time(tx, "forge", now, now))
        .unwrap();
    assert_eq!(first, now);

    // An older candidate leaves the cursor where it was.
    let second = store
        .transaction(|tx| cursor::advance_time(tx, "forge", early, now))
        .unwrap();
    assert_eq!(second, now);

    let stored = store
        .read(|conn| cursor::get_time(conn, "forge"))
        .unwrap()
        .unwrap();
    assert_eq!(stored, now);
}
