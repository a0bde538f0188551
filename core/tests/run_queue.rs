//! Run queue tests: idempotent enqueue, claim exclusivity, stale reclaim
//! and fencing of writes from a worker that lost its claim.

mod common;

use chrono::Duration;
use common::{at, go_params, store, t0};
use lineage_core::{
    error::LineageError,
    event::{EventDetail, ProgressEventKind},
    run::{ProgressUpdate, RunOutcome},
    status::RunStatus,
    store::LineageStore,
    types::{new_id, RunKind, RunRef},
};
use std::sync::{Arc, Barrier};
use std::thread;

const GO: [RunKind; 1] = [RunKind::GameOutcome];

fn stale() -> Duration {
    Duration::seconds(60)
}

/// Enqueueing the same run key twice yields one row and one `enqueued` event.
#[test]
fn enqueue_is_idempotent_per_run_key() {
    let s = store();
    let run_id = new_id();
    let params = go_params(&new_id(), "kenpom-v1");

    let first = s.enqueue(&run_id, &params, "api", t0()).unwrap();
    let second = s.enqueue(&run_id, &params, "api", at(5)).unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(second.value.created_at, t0());
    assert_eq!(second.value.status, RunStatus::Pending);
    let events = s.list_events(&RunRef::new(RunKind::GameOutcome, run_id.as_str())).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_kind, ProgressEventKind::Enqueued);
}

/// A run key already used by another kind is a conflict, not a silent reuse.
#[test]
fn run_key_reused_across_kinds_conflicts() {
    let s = store();
    let run_id = new_id();
    s.enqueue(&run_id, &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();

    let err = s
        .enqueue(&run_id, &common::ms_params(&new_id(), "ridge-v2", None), "api", t0())
        .unwrap_err();
    assert!(matches!(err, LineageError::Conflict(_)), "got {err:?}");
}

/// Eight workers, each on its own connection, race for one pending run.
#[test]
fn concurrent_claimers_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let path = path.to_str().unwrap().to_string();
    let s = LineageStore::open(&path).unwrap();
    s.migrate().unwrap();
    s.enqueue(&new_id(), &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let path = path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let store = LineageStore::open(&path).unwrap();
                barrier.wait();
                store.claim(&format!("w{i}"), &GO, t0(), stale()).unwrap()
            })
        })
        .collect();
    let winners: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(winners.len(), 1, "expected exactly one winner, got {winners:?}");
    assert_eq!(winners[0].attempt, 1);
}

/// Many runs, several workers: every run is claimed once and only once.
#[test]
fn concurrent_workers_partition_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let path = path.to_str().unwrap().to_string();
    let s = LineageStore::open(&path).unwrap();
    s.migrate().unwrap();
    let tournament = new_id();
    for i in 0..20 {
        s.enqueue(&new_id(), &go_params(&tournament, "kenpom-v1"), "api", at(i)).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let path = path.clone();
            thread::spawn(move || {
                let store = LineageStore::open(&path).unwrap();
                let mut mine = Vec::new();
                while let Some(claim) = store.claim(&format!("w{i}"), &GO, at(60), stale()).unwrap() {
                    mine.push(claim.run.id);
                }
                mine
            })
        })
        .collect();
    let mut claimed: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    claimed.sort();
    let before = claimed.len();
    claimed.dedup();

    assert_eq!(before, 20);
    assert_eq!(claimed.len(), 20, "a run was claimed twice");
}

/// A claim is reclaimable only strictly after `stale_after` has elapsed.
#[test]
fn stale_claim_boundary() {
    let s = store();
    s.enqueue(&new_id(), &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();
    let first = s.claim("w1", &GO, t0(), stale()).unwrap().unwrap();
    s.start(&first, t0()).unwrap();

    let boundary = t0() + stale();
    assert!(s.claim("w2", &GO, boundary, stale()).unwrap().is_none());

    let second = s
        .claim("w2", &GO, boundary + Duration::milliseconds(1), stale())
        .unwrap()
        .expect("stale claim is reclaimable");
    assert_eq!(second.run, first.run);
    assert_eq!(second.attempt, 2);
    assert_eq!(second.reclaimed_from.as_deref(), Some("w1"));

    let run = s.get_run(RunKind::GameOutcome, &first.run.id).unwrap();
    assert_eq!(run.status, RunStatus::Claimed);
    assert_eq!(run.claimed_by.as_deref(), Some("w2"));
}

/// Heartbeats keep a long-running claim from going stale.
#[test]
fn heartbeat_defers_staleness() {
    let s = store();
    s.enqueue(&new_id(), &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();
    let claim = s.claim("w1", &GO, t0(), stale()).unwrap().unwrap();
    s.start(&claim, t0()).unwrap();
    s.heartbeat(&claim, at(50)).unwrap();

    assert!(s.claim("w2", &GO, at(61), stale()).unwrap().is_none());
    assert!(s.claim("w2", &GO, at(111), stale()).unwrap().is_some());
}

/// After a reclaim, every write from the original owner is rejected and the
/// new owner's writes land.
#[test]
fn original_owner_is_fenced_after_reclaim() {
    let s = store();
    s.enqueue(&new_id(), &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();
    let w1 = s.claim("w1", &GO, t0(), stale()).unwrap().unwrap();
    s.start(&w1, t0()).unwrap();
    let w2 = s.claim("w2", &GO, at(61), stale()).unwrap().unwrap();

    let err = s.complete(&w1, &RunOutcome::Succeeded, at(62)).unwrap_err();
    assert!(matches!(err, LineageError::LostClaim { attempt: 1, .. }), "got {err:?}");
    let err = s.heartbeat(&w1, at(62)).unwrap_err();
    assert!(matches!(err, LineageError::LostClaim { .. }), "got {err:?}");
    let err = s.schedule_retry(&w1, "boom", at(70), at(62)).unwrap_err();
    assert!(matches!(err, LineageError::LostClaim { .. }), "got {err:?}");

    s.start(&w2, at(62)).unwrap();
    s.complete(&w2, &RunOutcome::Succeeded, at(63)).unwrap();
    let run = s.get_run(RunKind::GameOutcome, &w2.run.id).unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.attempt, 2);
    assert_eq!(run.started_at, Some(t0()), "started_at keeps the first start");
    assert_eq!(run.finished_at, Some(at(63)));
}

/// A terminal run can't be completed again by its own owner.
#[test]
fn completing_twice_is_an_illegal_transition() {
    let s = store();
    s.enqueue(&new_id(), &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();
    let claim = s.claim("w1", &GO, t0(), stale()).unwrap().unwrap();
    s.start(&claim, t0()).unwrap();
    s.complete(&claim, &RunOutcome::Succeeded, at(1)).unwrap();

    let err = s
        .complete(&claim, &RunOutcome::Failed { error: "late".into() }, at(2))
        .unwrap_err();
    assert!(matches!(err, LineageError::IllegalTransition { from: RunStatus::Succeeded, .. }), "got {err:?}");
    assert!(s.claim("w2", &GO, at(600), stale()).unwrap().is_none());
}

/// The event log records the lifecycle in append order.
#[test]
fn events_follow_the_lifecycle() {
    let s = store();
    let run_id = new_id();
    s.enqueue(&run_id, &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();
    let claim = s.claim("w1", &GO, at(1), stale()).unwrap().unwrap();
    s.start(&claim, at(2)).unwrap();
    s.report_progress(
        &claim.run,
        &ProgressUpdate::new(50.0, Some("simulate"), Some("halfway")),
        "w1",
        at(3),
    )
    .unwrap();
    s.complete(&claim, &RunOutcome::Succeeded, at(4)).unwrap();

    let events = s.list_events(&claim.run).unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.event_kind).collect();
    assert_eq!(
        kinds,
        vec![
            ProgressEventKind::Enqueued,
            ProgressEventKind::Claimed,
            ProgressEventKind::Started,
            ProgressEventKind::Progress,
            ProgressEventKind::Succeeded,
        ]
    );
    assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(events[1].payload, EventDetail::Claim { worker_id: "w1".into(), attempt: 1 });
    assert_eq!(events[3].percent, Some(50.0));
    assert_eq!(events[3].phase.as_deref(), Some("simulate"));

    let run = s.get_run(RunKind::GameOutcome, &run_id).unwrap();
    let progress = run.progress.expect("progress snapshot");
    assert_eq!(progress.percent, 50.0);
    assert_eq!(progress.message.as_deref(), Some("halfway"));
}

/// Progress outside [0, 100] is rejected before anything is written.
#[test]
fn out_of_range_progress_is_rejected() {
    let s = store();
    s.enqueue(&new_id(), &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();
    let claim = s.claim("w1", &GO, t0(), stale()).unwrap().unwrap();

    let err = s
        .report_progress(&claim.run, &ProgressUpdate::new(150.0, None, None), "w1", t0())
        .unwrap_err();
    assert!(matches!(err, LineageError::InvalidInput { .. }), "got {err:?}");
    assert_eq!(s.list_events(&claim.run).unwrap().len(), 2);
}

/// Soft-deleted runs are never claimed.
#[test]
fn soft_deleted_runs_are_not_claimable() {
    let s = store();
    let run_id = new_id();
    s.enqueue(&run_id, &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();
    s.soft_delete_run(RunKind::GameOutcome, &run_id, t0()).unwrap();
    assert!(s.claim("w1", &GO, at(1), stale()).unwrap().is_none());
}

/// Finished runs keep their last progress; late reports are rejected and
/// append nothing.
#[test]
fn progress_after_completion_is_rejected() {
    let s = store();
    s.enqueue(&new_id(), &go_params(&new_id(), "kenpom-v1"), "api", t0()).unwrap();
    let claim = s.claim("w1", &GO, t0(), stale()).unwrap().unwrap();
    s.start(&claim, t0()).unwrap();
    s.report_progress(&claim.run, &ProgressUpdate::new(90.0, Some("simulate"), None), "w1", at(1))
        .unwrap();
    s.complete(&claim, &RunOutcome::Succeeded, at(2)).unwrap();

    let err = s
        .report_progress(&claim.run, &ProgressUpdate::new(3.0, Some("late"), None), "w1", at(3))
        .unwrap_err();
    assert!(
        matches!(err, LineageError::IllegalTransition { from: RunStatus::Succeeded, .. }),
        "got {err:?}"
    );

    let run = s.get_run(RunKind::GameOutcome, &claim.run.id).unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    let progress = run.progress.expect("progress snapshot");
    assert_eq!(progress.percent, 90.0);
    assert_eq!(progress.phase.as_deref(), Some("simulate"));
    assert_eq!(s.list_events(&claim.run).unwrap().len(), 5);
}

/// Progress for an unknown run is a not-found error.
#[test]
fn progress_for_unknown_run_is_not_found() {
    let s = store();
    let run = RunRef::new(RunKind::GameOutcome, new_id());
    let err = s
        .report_progress(&run, &ProgressUpdate::new(10.0, None, None), "w1", t0())
        .unwrap_err();
    assert!(matches!(err, LineageError::NotFound { .. }), "got {err:?}");
}
