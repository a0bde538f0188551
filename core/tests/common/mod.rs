//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use lineage_core::{
    artifact::{ArtifactKind, NewArtifact},
    payload::{GameOutcomeParams, MarketShareParams, RunParams},
    snapshot::NewCalcutta,
    store::LineageStore,
    suite::{NewSuite, SimulationParams},
    types::{new_id, RunKind, RunRef},
};

pub const GO_ALG: &str = "kenpom-v1";
pub const MS_ALG: &str = "ridge-v2";

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-16T12:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(seconds)
}

pub fn store() -> LineageStore {
    let store = LineageStore::in_memory().expect("open in-memory store");
    store.migrate().expect("migrate");
    store
}

/// A pool with `entries` entrants, each bidding on two teams.
pub struct Pool {
    pub calcutta_id: String,
    pub tournament_id: String,
    pub entry_ids: Vec<String>,
}

pub fn seed_pool(store: &LineageStore, tournament_id: &str, entries: &[&str]) -> Pool {
    let calcutta_id = new_id();
    store
        .insert_calcutta(
            &NewCalcutta {
                id: calcutta_id.clone(),
                tournament_id: tournament_id.to_string(),
                name: format!("pool {}", &calcutta_id[..8]),
            },
            t0(),
        )
        .expect("insert calcutta");
    let mut entry_ids = Vec::new();
    for (i, name) in entries.iter().enumerate() {
        let entry_id = new_id();
        store.insert_entry(&calcutta_id, &entry_id, name, t0()).expect("insert entry");
        store.set_entry_bid(&entry_id, "team-duke", 10 + i as u32).expect("bid");
        store.set_entry_bid(&entry_id, "team-uconn", 20 + i as u32).expect("bid");
        entry_ids.push(entry_id);
    }
    Pool { calcutta_id, tournament_id: tournament_id.to_string(), entry_ids }
}

pub fn go_params(tournament_id: &str, algorithm_id: &str) -> RunParams {
    RunParams::GameOutcome(GameOutcomeParams {
        tournament_id: tournament_id.to_string(),
        algorithm_id: algorithm_id.to_string(),
        n_sims: 1000,
        seed: 7,
        starting_state_key: "post_first_four".into(),
    })
}

pub fn ms_params(calcutta_id: &str, algorithm_id: &str, excluded: Option<&str>) -> RunParams {
    RunParams::MarketShare(MarketShareParams {
        calcutta_id: calcutta_id.to_string(),
        algorithm_id: algorithm_id.to_string(),
        excluded_entry_name: excluded.map(str::to_string),
    })
}

/// Drive a run through claim, start, primary artifact and success.
/// Returns `(run_id, primary_artifact_id)`.
pub fn complete_run(store: &LineageStore, params: &RunParams, now: DateTime<Utc>) -> (String, String) {
    let kind = params.kind();
    let run_id = new_id();
    store.enqueue(&run_id, params, "test", now).expect("enqueue");
    let claim = store
        .claim("fixture", &[kind], now, Duration::minutes(10))
        .expect("claim")
        .expect("a claimable run");
    assert_eq!(claim.run.id, run_id, "fixture claimed an unexpected run");
    store.start(&claim, now).expect("start");
    let artifact = store
        .put_artifact(
            &RunRef::new(kind, run_id.as_str()),
            &NewArtifact::new(ArtifactKind::primary_for(kind))
                .with_storage_uri(format!("file:///artifacts/{run_id}.parquet")),
            now,
        )
        .expect("put artifact");
    store
        .complete(&claim, &lineage_core::run::RunOutcome::Succeeded, now)
        .expect("complete");
    (run_id, artifact.value.id)
}

/// Succeeded game-outcome and market-share runs for `pool`.
pub fn upstream_for(store: &LineageStore, pool: &Pool, now: DateTime<Utc>) -> ((String, String), (String, String)) {
    let go = complete_run(store, &go_params(&pool.tournament_id, GO_ALG), now);
    let ms = complete_run(store, &ms_params(&pool.calcutta_id, MS_ALG, None), now);
    (go, ms)
}

pub fn new_suite(name: &str) -> NewSuite {
    NewSuite {
        name: name.to_string(),
        game_outcome_algorithm_id: GO_ALG.into(),
        market_share_algorithm_id: MS_ALG.into(),
        defaults: SimulationParams {
            optimizer_key: "minlp_v1".into(),
            n_sims: 5000,
            seed: 42,
            starting_state_key: "post_first_four".into(),
            excluded_entry_name: None,
        },
    }
}

pub fn count(store: &LineageStore, kind: RunKind) -> usize {
    store.list_runs(kind, 1000, 0).expect("list runs").len()
}
