//! Idempotent creation of standalone runs and the read models served for them.

use crate::{
    artifact::{Artifact, ArtifactKind},
    error::{LineageError, LineageResult},
    event::ProgressEvent,
    payload::{GameOutcomeParams, MarketShareParams, RunParams, StrategyGenerationParams},
    resolve::{pin_explicit, resolve_game_outcome, resolve_market_share, PinnedInput},
    run::{ProgressSnapshot, RunRecord},
    snapshot::SnapshotSource,
    store::LineageStore,
    types::{canonical_id, Created, RunKey, RunKind, RunRef},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const SOURCE: &str = "api";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGameOutcomeRun {
    #[serde(default)]
    pub run_key: Option<String>,
    pub tournament_id: String,
    pub algorithm_id: String,
    pub n_sims: u32,
    pub seed: i64,
    pub starting_state_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMarketShareRun {
    #[serde(default)]
    pub run_key: Option<String>,
    pub calcutta_id: String,
    pub algorithm_id: String,
    #[serde(default)]
    pub excluded_entry_name: Option<String>,
}

/// Each upstream is either pinned explicitly by run id or resolved as the
/// latest succeeded run of the named algorithm.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStrategyGenerationRun {
    #[serde(default)]
    pub run_key: Option<String>,
    pub calcutta_id: String,
    pub optimizer_key: String,
    #[serde(default)]
    pub game_outcome_run_id: Option<String>,
    #[serde(default)]
    pub game_outcome_algorithm_id: Option<String>,
    #[serde(default)]
    pub market_share_run_id: Option<String>,
    #[serde(default)]
    pub market_share_algorithm_id: Option<String>,
    #[serde(default)]
    pub excluded_entry_name: Option<String>,
}

fn required(field: &str, value: &str) -> LineageResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LineageError::invalid(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn optional_name(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Return the stored run when `run_id` is already taken.
fn existing(store: &LineageStore, kind: RunKind, run_id: &str) -> LineageResult<Option<RunRecord>> {
    match store.find_run_by_id(run_id)? {
        Some(run) if run.run_kind == kind => Ok(Some(run)),
        Some(run) => Err(LineageError::Conflict(format!(
            "run key {run_id} already identifies a {} run",
            run.run_kind
        ))),
        None => Ok(None),
    }
}

pub fn create_game_outcome_run(
    store: &LineageStore,
    request: &CreateGameOutcomeRun,
    now: DateTime<Utc>,
) -> LineageResult<Created<RunRecord>> {
    let key = RunKey::or_generate(request.run_key.as_deref(), "runKey")?;
    if request.n_sims == 0 {
        return Err(LineageError::invalid("nSims", "must be positive"));
    }
    let params = RunParams::GameOutcome(GameOutcomeParams {
        tournament_id: canonical_id(&request.tournament_id, "tournamentId")?,
        algorithm_id: required("algorithmId", &request.algorithm_id)?,
        n_sims: request.n_sims,
        seed: request.seed,
        starting_state_key: required("startingStateKey", &request.starting_state_key)?,
    });
    store.enqueue(&key.as_id(), &params, SOURCE, now)
}

pub fn create_market_share_run(
    store: &LineageStore,
    request: &CreateMarketShareRun,
    now: DateTime<Utc>,
) -> LineageResult<Created<RunRecord>> {
    let key = RunKey::or_generate(request.run_key.as_deref(), "runKey")?;
    let calcutta_id = canonical_id(&request.calcutta_id, "calcuttaId")?;
    let params = RunParams::MarketShare(MarketShareParams {
        calcutta_id: calcutta_id.clone(),
        algorithm_id: required("algorithmId", &request.algorithm_id)?,
        excluded_entry_name: optional_name(request.excluded_entry_name.as_deref()),
    });
    store.atomically(|s| {
        if let Some(run) = existing(s, RunKind::MarketShare, &key.as_id())? {
            return Ok(Created { value: run, created: false });
        }
        s.get_calcutta(&calcutta_id)?;
        s.enqueue(&key.as_id(), &params, SOURCE, now)
    })
}

/// Resolve or pin both upstream runs, snapshot the pool, and enqueue the
/// run, all in one transaction. A repeated run key returns the stored run
/// without resolving again.
pub fn create_strategy_generation_run(
    store: &LineageStore,
    request: &CreateStrategyGenerationRun,
    now: DateTime<Utc>,
) -> LineageResult<Created<RunRecord>> {
    let key = RunKey::or_generate(request.run_key.as_deref(), "runKey")?;
    let run_id = key.as_id();
    let calcutta_id = canonical_id(&request.calcutta_id, "calcuttaId")?;
    let optimizer_key = required("optimizerKey", &request.optimizer_key)?;
    let excluded = optional_name(request.excluded_entry_name.as_deref());

    store.atomically(|s| {
        if let Some(run) = existing(s, RunKind::StrategyGeneration, &run_id)? {
            return Ok(Created { value: run, created: false });
        }
        let calcutta = s.get_calcutta(&calcutta_id)?;

        let game_outcome: PinnedInput = match (&request.game_outcome_run_id, &request.game_outcome_algorithm_id) {
            (Some(id), _) => {
                let id = canonical_id(id, "gameOutcomeRunId")?;
                pin_explicit(
                    s,
                    &RunRef::new(RunKind::GameOutcome, id),
                    &calcutta.tournament_id,
                    "gameOutcomeRunId",
                )?
            }
            (None, Some(algorithm)) => {
                resolve_game_outcome(s, &calcutta.tournament_id, &required("gameOutcomeAlgorithmId", algorithm)?)?
            }
            (None, None) => {
                return Err(LineageError::invalid(
                    "gameOutcomeAlgorithmId",
                    "either gameOutcomeRunId or gameOutcomeAlgorithmId is required",
                ))
            }
        };
        let market_share: PinnedInput = match (&request.market_share_run_id, &request.market_share_algorithm_id) {
            (Some(id), _) => {
                let id = canonical_id(id, "marketShareRunId")?;
                pin_explicit(s, &RunRef::new(RunKind::MarketShare, id), &calcutta.id, "marketShareRunId")?
            }
            (None, Some(algorithm)) => resolve_market_share(
                s,
                &calcutta.id,
                &required("marketShareAlgorithmId", algorithm)?,
                excluded.as_deref(),
            )?,
            (None, None) => {
                return Err(LineageError::invalid(
                    "marketShareAlgorithmId",
                    "either marketShareRunId or marketShareAlgorithmId is required",
                ))
            }
        };

        let snapshot = s.create_snapshot(
            &calcutta.id,
            excluded.as_deref(),
            &SnapshotSource::run(RunKind::StrategyGeneration, &run_id),
            now,
        )?;
        let params = RunParams::StrategyGeneration(StrategyGenerationParams {
            calcutta_id: calcutta.id.clone(),
            optimizer_key: optimizer_key.clone(),
            game_outcome_run_id: game_outcome.run_id,
            market_share_run_id: market_share.run_id,
            game_outcome_artifact_id: game_outcome.artifact_id,
            market_share_artifact_id: market_share.artifact_id,
            excluded_entry_name: excluded.clone(),
            snapshot_id: snapshot.value.id,
        });
        s.enqueue(&run_id, &params, SOURCE, now)
    })
}

/// Progress read model: the current snapshot plus the full event history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub run: RunRecord,
    pub progress: Option<ProgressSnapshot>,
    pub events: Vec<ProgressEvent>,
}

pub fn run_progress(store: &LineageStore, kind: RunKind, run_id: &str) -> LineageResult<RunProgress> {
    let run = store.get_run(kind, run_id)?;
    let events = store.list_events(&run.run_ref())?;
    Ok(RunProgress { progress: run.progress.clone(), run, events })
}

pub fn run_artifacts(store: &LineageStore, kind: RunKind, run_id: &str) -> LineageResult<Vec<Artifact>> {
    let run = store.get_run(kind, run_id)?;
    store.list_artifacts(&run.run_ref())
}

pub fn run_artifact(
    store: &LineageStore,
    kind: RunKind,
    run_id: &str,
    artifact_kind: ArtifactKind,
) -> LineageResult<Artifact> {
    let run = store.get_run(kind, run_id)?;
    store
        .find_artifact_for_run(&run.run_ref(), artifact_kind)?
        .ok_or_else(|| LineageError::not_found("artifact", format!("{}/{artifact_kind}", run.run_ref())))
}
