//! Lineage tests: upstream resolution and pinning, first-writer-wins
//! artifacts, and snapshot immutability.

mod common;

use common::{at, complete_run, go_params, ms_params, seed_pool, store, t0, upstream_for, GO_ALG, MS_ALG};
use lineage_core::{
    artifact::{
        ArtifactKind, ArtifactSummary, NewArtifact, PredictedMarketShareSummary,
    },
    error::LineageError,
    payload::RunParams,
    resolve::{pin_explicit, resolve_game_outcome, resolve_market_share},
    runs::{create_strategy_generation_run, CreateStrategyGenerationRun},
    snapshot::SnapshotSource,
    types::{new_id, RunKind, RunRef},
};

fn sg_request(calcutta_id: &str) -> CreateStrategyGenerationRun {
    CreateStrategyGenerationRun {
        calcutta_id: calcutta_id.to_string(),
        optimizer_key: "minlp_v1".into(),
        game_outcome_algorithm_id: Some(GO_ALG.into()),
        market_share_algorithm_id: Some(MS_ALG.into()),
        ..Default::default()
    }
}

fn sg_params(params: &RunParams) -> &lineage_core::payload::StrategyGenerationParams {
    match params {
        RunParams::StrategyGeneration(p) => p,
        other => panic!("expected strategy params, got {other:?}"),
    }
}

/// A strategy-generation run keeps the exact upstream runs and artifacts it
/// resolved at creation, even after newer upstream runs succeed.
#[test]
fn strategy_generation_pins_inputs_across_upstream_reruns() {
    let s = store();
    let pool = seed_pool(&s, &new_id(), &["Alice", "Bob", "Carol"]);
    let ((go_run, go_artifact), (ms_run, ms_artifact)) = upstream_for(&s, &pool, t0());

    let created = create_strategy_generation_run(&s, &sg_request(&pool.calcutta_id), at(10)).unwrap();
    assert!(created.created);
    let pinned = sg_params(&created.value.params).clone();
    assert_eq!(pinned.game_outcome_run_id, go_run);
    assert_eq!(pinned.market_share_run_id, ms_run);
    assert_eq!(pinned.game_outcome_artifact_id.as_deref(), Some(go_artifact.as_str()));
    assert_eq!(pinned.market_share_artifact_id.as_deref(), Some(ms_artifact.as_str()));

    // Newer upstream runs succeed.
    let (newer_go, _) = complete_run(&s, &go_params(&pool.tournament_id, GO_ALG), at(20));
    let (newer_ms, _) = complete_run(&s, &ms_params(&pool.calcutta_id, MS_ALG, None), at(20));

    let reloaded = s
        .get_run(RunKind::StrategyGeneration, &created.value.run_id)
        .unwrap();
    assert_eq!(sg_params(&reloaded.params), &pinned);

    let later = create_strategy_generation_run(&s, &sg_request(&pool.calcutta_id), at(30)).unwrap();
    let later = sg_params(&later.value.params);
    assert_eq!(later.game_outcome_run_id, newer_go);
    assert_eq!(later.market_share_run_id, newer_ms);
}

/// Replaying a run key returns the stored run without resolving again.
#[test]
fn strategy_generation_run_key_is_idempotent() {
    let s = store();
    let pool = seed_pool(&s, &new_id(), &["Alice", "Bob"]);
    upstream_for(&s, &pool, t0());
    let key = new_id();
    let request = CreateStrategyGenerationRun { run_key: Some(key.clone()), ..sg_request(&pool.calcutta_id) };

    let first = create_strategy_generation_run(&s, &request, at(10)).unwrap();
    complete_run(&s, &go_params(&pool.tournament_id, GO_ALG), at(20));
    let second = create_strategy_generation_run(&s, &request, at(30)).unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.value.run_id, key);
    assert_eq!(second.value.params, first.value.params);
    assert_eq!(s.list_snapshots(&pool.calcutta_id).unwrap().len(), 1);
}

/// Without any succeeded upstream the request fails and writes nothing.
#[test]
fn strategy_generation_without_upstream_is_missing_run() {
    let s = store();
    let pool = seed_pool(&s, &new_id(), &["Alice"]);
    complete_run(&s, &go_params(&pool.tournament_id, GO_ALG), t0());

    let err = create_strategy_generation_run(&s, &sg_request(&pool.calcutta_id), at(1)).unwrap_err();
    assert!(
        matches!(err, LineageError::MissingRun { kind: RunKind::MarketShare, .. }),
        "got {err:?}"
    );
    assert_eq!(common::count(&s, RunKind::StrategyGeneration), 0);
    assert!(s.list_snapshots(&pool.calcutta_id).unwrap().is_empty());
}

/// Explicit pins are checked for scope and status.
#[test]
fn explicit_pins_are_validated() {
    let s = store();
    let pool = seed_pool(&s, &new_id(), &["Alice"]);
    let other = seed_pool(&s, &new_id(), &["Zed"]);
    let ((go_run, _), _) = upstream_for(&s, &pool, t0());
    let (other_ms, _) = complete_run(&s, &ms_params(&other.calcutta_id, MS_ALG, None), t0());

    let err = pin_explicit(
        &s,
        &RunRef::new(RunKind::MarketShare, other_ms.as_str()),
        &pool.calcutta_id,
        "marketShareRunId",
    )
    .unwrap_err();
    assert!(matches!(err, LineageError::InvalidInput { ref field, .. } if field == "marketShareRunId"), "got {err:?}");

    let pending = new_id();
    s.enqueue(&pending, &go_params(&pool.tournament_id, GO_ALG), "api", t0()).unwrap();
    let err = pin_explicit(
        &s,
        &RunRef::new(RunKind::GameOutcome, pending.as_str()),
        &pool.tournament_id,
        "gameOutcomeRunId",
    )
    .unwrap_err();
    assert!(matches!(err, LineageError::MissingRun { .. }), "got {err:?}");

    let request = CreateStrategyGenerationRun {
        game_outcome_run_id: Some(go_run.clone()),
        game_outcome_algorithm_id: None,
        ..sg_request(&pool.calcutta_id)
    };
    let created = create_strategy_generation_run(&s, &request, at(5)).unwrap();
    assert_eq!(sg_params(&created.value.params).game_outcome_run_id, go_run);
}

/// Soft-deleted runs drop out of "latest" resolution.
#[test]
fn soft_deleted_runs_are_not_resolved() {
    let s = store();
    let tournament = new_id();
    let (older, _) = complete_run(&s, &go_params(&tournament, GO_ALG), t0());
    let (newer, _) = complete_run(&s, &go_params(&tournament, GO_ALG), at(10));
    assert_eq!(resolve_game_outcome(&s, &tournament, GO_ALG).unwrap().run_id, newer);

    s.soft_delete_run(RunKind::GameOutcome, &newer, at(20)).unwrap();
    assert_eq!(resolve_game_outcome(&s, &tournament, GO_ALG).unwrap().run_id, older);

    s.soft_delete_run(RunKind::GameOutcome, &older, at(21)).unwrap();
    let err = resolve_game_outcome(&s, &tournament, GO_ALG).unwrap_err();
    assert!(matches!(err, LineageError::MissingRun { .. }), "got {err:?}");
}

/// Resolution is scoped to the algorithm, and only succeeded runs count.
#[test]
fn resolution_ignores_other_algorithms_and_unfinished_runs() {
    let s = store();
    let tournament = new_id();
    let (wanted, _) = complete_run(&s, &go_params(&tournament, GO_ALG), t0());
    complete_run(&s, &go_params(&tournament, "other-alg"), at(5));
    s.enqueue(&new_id(), &go_params(&tournament, GO_ALG), "api", at(10)).unwrap();

    assert_eq!(resolve_game_outcome(&s, &tournament, GO_ALG).unwrap().run_id, wanted);
}

/// A market-share run computed under the same exclusion beats a newer one
/// that was not; any other exclusion falls back to the newest run.
#[test]
fn market_share_resolution_prefers_matching_exclusion() {
    let s = store();
    let pool = seed_pool(&s, &new_id(), &["Alice", "Bob"]);
    let (without_alice, _) = complete_run(&s, &ms_params(&pool.calcutta_id, MS_ALG, Some("Alice")), t0());
    let (full_pool, _) = complete_run(&s, &ms_params(&pool.calcutta_id, MS_ALG, None), at(10));

    let resolved = resolve_market_share(&s, &pool.calcutta_id, MS_ALG, Some("Alice")).unwrap();
    assert_eq!(resolved.run_id, without_alice);
    let resolved = resolve_market_share(&s, &pool.calcutta_id, MS_ALG, None).unwrap();
    assert_eq!(resolved.run_id, full_pool);
    let resolved = resolve_market_share(&s, &pool.calcutta_id, MS_ALG, Some("Bob")).unwrap();
    assert_eq!(resolved.run_id, full_pool);
}

/// The first artifact of a kind wins; a second write returns it unchanged.
#[test]
fn first_artifact_writer_wins() {
    let s = store();
    let run_id = new_id();
    s.enqueue(&run_id, &ms_params(&new_id(), MS_ALG, None), "api", t0()).unwrap();
    let run = RunRef::new(RunKind::MarketShare, run_id.as_str());
    let summary = ArtifactSummary::PredictedMarketShare(PredictedMarketShareSummary {
        team_count: 64,
        total_predicted_share: 1.0,
    });

    let first = s
        .put_artifact(
            &run,
            &NewArtifact::new(ArtifactKind::PredictedMarketShare)
                .with_storage_uri("s3://bucket/first.parquet")
                .with_summary(summary.clone()),
            t0(),
        )
        .unwrap();
    let second = s
        .put_artifact(
            &run,
            &NewArtifact::new(ArtifactKind::PredictedMarketShare).with_storage_uri("s3://bucket/second.parquet"),
            at(1),
        )
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(second.value.id, first.value.id);
    assert_eq!(second.value.storage_uri.as_deref(), Some("s3://bucket/first.parquet"));
    assert_eq!(second.value.summary, Some(summary));
    assert_eq!(s.list_artifacts(&run).unwrap().len(), 1);
}

/// Lineage edges must point at artifacts that exist.
#[test]
fn lineage_edges_require_existing_upstream() {
    let s = store();
    let pool = seed_pool(&s, &new_id(), &["Alice"]);
    let ((_, go_artifact), _) = upstream_for(&s, &pool, t0());
    let run_id = new_id();
    s.enqueue(&run_id, &go_params(&pool.tournament_id, "downstream"), "api", t0()).unwrap();
    let run = RunRef::new(RunKind::GameOutcome, run_id.as_str());

    let err = s
        .put_artifact(
            &run,
            &NewArtifact::new(ArtifactKind::SimulatedOutcomes).with_input("game_outcome", &new_id()),
            at(1),
        )
        .unwrap_err();
    assert!(matches!(err, LineageError::NotFound { .. }), "got {err:?}");
    assert!(s.list_artifacts(&run).unwrap().is_empty(), "failed write left an artifact behind");

    let ok = s
        .put_artifact(
            &run,
            &NewArtifact::new(ArtifactKind::SimulatedOutcomes).with_input("game_outcome", &go_artifact),
            at(2),
        )
        .unwrap();
    assert_eq!(ok.value.input("game_outcome"), Some(go_artifact.as_str()));
    assert_eq!(s.inputs_of(&ok.value.id).unwrap().len(), 1);
}

/// Provenance may point at an upstream artifact that was soft-deleted.
#[test]
fn lineage_edges_accept_soft_deleted_upstream() {
    let s = store();
    let pool = seed_pool(&s, &new_id(), &["Alice"]);
    let ((_, go_artifact), _) = upstream_for(&s, &pool, t0());
    s.soft_delete_artifact(&go_artifact, at(1)).unwrap();

    let run_id = new_id();
    s.enqueue(&run_id, &go_params(&pool.tournament_id, "downstream"), "api", at(2)).unwrap();
    let run = RunRef::new(RunKind::GameOutcome, run_id.as_str());
    let written = s
        .put_artifact(
            &run,
            &NewArtifact::new(ArtifactKind::SimulatedOutcomes).with_input("game_outcome", &go_artifact),
            at(3),
        )
        .unwrap();
    assert_eq!(written.value.input("game_outcome"), Some(go_artifact.as_str()));
}

/// Snapshots are copies: later edits to the live pool don't reach them.
#[test]
fn snapshot_is_immutable_copy_of_live_pool() {
    let s = store();
    let pool = seed_pool(&s, &new_id(), &["Alice", "Bob"]);
    let source = SnapshotSource::suite_execution(&new_id());

    let snap = s.create_snapshot(&pool.calcutta_id, None, &source, t0()).unwrap();
    assert!(snap.created);
    s.set_entry_bid(&pool.entry_ids[0], "team-duke", 99).unwrap();

    let again = s.create_snapshot(&pool.calcutta_id, None, &source, at(5)).unwrap();
    assert!(!again.created);
    assert_eq!(again.value.id, snap.value.id);
    assert_eq!(again.value.contents, snap.value.contents);
    let stored = s.get_snapshot(&snap.value.id).unwrap();
    let alice = &stored.contents.entries[0];
    assert_eq!(alice.name, "Alice");
    assert_eq!(alice.bids.iter().find(|b| b.team_id == "team-duke").unwrap().bid_points, 10);

    let fresh = s
        .create_snapshot(&pool.calcutta_id, None, &SnapshotSource::suite_execution(&new_id()), at(6))
        .unwrap();
    assert_ne!(fresh.value.id, snap.value.id);
    let alice = &fresh.value.contents.entries[0];
    assert_eq!(alice.bids.iter().find(|b| b.team_id == "team-duke").unwrap().bid_points, 99);
}

/// The excluded entry is left out by trimmed name; the exclusion is part of
/// the snapshot's identity.
#[test]
fn snapshot_omits_excluded_entry() {
    let s = store();
    let pool = seed_pool(&s, &new_id(), &["Alice", "Bob", "Carol"]);
    let source = SnapshotSource::suite_execution(&new_id());

    let full = s.create_snapshot(&pool.calcutta_id, None, &source, t0()).unwrap();
    let without_bob = s.create_snapshot(&pool.calcutta_id, Some("  Bob "), &source, t0()).unwrap();

    assert_ne!(full.value.id, without_bob.value.id);
    assert_eq!(full.value.contents.entries.len(), 3);
    let names: Vec<_> = without_bob.value.contents.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "Carol"]);
    assert_eq!(without_bob.value.excluded_entry_name.as_deref(), Some("Bob"));
    assert_eq!(without_bob.value.contents.tournament_id, pool.tournament_id);
}
