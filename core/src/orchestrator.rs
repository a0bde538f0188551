//! Suite batch orchestration.
//!
//! A suite execution fans out into one evaluation per pool. Resolution,
//! snapshotting and every insert for the whole batch happen in a single
//! IMMEDIATE transaction: either all evaluations and their run records exist
//! afterwards, or none do.

use crate::{
    error::{LineageError, LineageResult},
    payload::{RunParams, SuiteEvaluationParams},
    resolve::{resolve_game_outcome, resolve_market_share, PinnedInput},
    snapshot::SnapshotSource,
    store::LineageStore,
    suite::{
        ExecutionKind, ExecutionRollup, ExecutionStatus, NewSuite, NewSuiteEvaluation,
        SimulationParams, Suite, SuiteExecution, SuiteOverrides, SuiteScenario,
    },
    types::{canonical_id, new_id, Created, EntityId, RunKey, RunKind},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const SOURCE: &str = "orchestrator";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSuiteExecution {
    pub suite_id: String,
    pub calcutta_ids: Vec<String>,
    #[serde(default)]
    pub run_key: Option<String>,
    #[serde(flatten)]
    pub overrides: SuiteOverrides,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScenario {
    pub suite_id: String,
    pub calcutta_id: String,
    #[serde(default)]
    pub focus_strategy_generation_run_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxExecution {
    #[serde(default)]
    pub run_key: Option<String>,
    #[serde(flatten)]
    pub overrides: SuiteOverrides,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCreated {
    pub execution_id: EntityId,
    pub evaluation_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: SuiteExecution,
    pub status: ExecutionStatus,
    pub counts: ExecutionRollup,
}

pub fn create_suite(store: &LineageStore, suite: &NewSuite, now: DateTime<Utc>) -> LineageResult<Suite> {
    let suite = store.insert_suite(suite, now)?;
    log::info!("orchestrator: created suite {} ({})", suite.id, suite.name);
    Ok(suite)
}

/// Bind a suite to a pool. A focus strategy-generation run carries its
/// snapshot over to the scenario.
pub fn create_scenario(
    store: &LineageStore,
    request: &CreateScenario,
    now: DateTime<Utc>,
) -> LineageResult<SuiteScenario> {
    let suite_id = canonical_id(&request.suite_id, "suiteId")?;
    let calcutta_id = canonical_id(&request.calcutta_id, "calcuttaId")?;
    let focus_id = request
        .focus_strategy_generation_run_id
        .as_deref()
        .map(|id| canonical_id(id, "focusStrategyGenerationRunId"))
        .transpose()?;

    store.atomically(|s| {
        s.get_suite(&suite_id)?;
        s.get_calcutta(&calcutta_id)?;
        let focus_snapshot_id = match &focus_id {
            Some(run_id) => {
                let run = s.get_run(RunKind::StrategyGeneration, run_id)?;
                let RunParams::StrategyGeneration(params) = &run.params else {
                    return Err(LineageError::Conflict(format!("{} has non-strategy params", run.run_ref())));
                };
                if params.calcutta_id != calcutta_id {
                    return Err(LineageError::invalid(
                        "focusStrategyGenerationRunId",
                        format!("run {run_id} was generated for calcutta {}", params.calcutta_id),
                    ));
                }
                Some(params.snapshot_id.clone())
            }
            None => None,
        };
        let scenario = SuiteScenario {
            id: new_id(),
            suite_id: suite_id.clone(),
            calcutta_id: calcutta_id.clone(),
            focus_strategy_generation_run_id: focus_id.clone(),
            focus_snapshot_id,
            created_at: now,
        };
        s.insert_scenario(&scenario)?;
        Ok(scenario)
    })
}

fn validate_pools(raw: &[String]) -> LineageResult<Vec<EntityId>> {
    if raw.is_empty() {
        return Err(LineageError::invalid("calcuttaIds", "must not be empty"));
    }
    let mut seen = HashSet::new();
    let mut pools = Vec::with_capacity(raw.len());
    for id in raw {
        let id = canonical_id(id, "calcuttaIds")?;
        if !seen.insert(id.clone()) {
            return Err(LineageError::invalid("calcuttaIds", format!("duplicate calcutta {id}")));
        }
        pools.push(id);
    }
    Ok(pools)
}

/// Stored execution for a repeated run key, summarized as on creation.
/// A key reused for a different kind, suite or scenario is a conflict.
fn existing_execution(
    store: &LineageStore,
    execution_id: &str,
    kind: ExecutionKind,
    suite_id: Option<&str>,
    scenario_id: Option<&str>,
) -> LineageResult<Option<Created<ExecutionCreated>>> {
    let Some(execution) = store.find_execution(execution_id)? else {
        return Ok(None);
    };
    if execution.kind != kind {
        return Err(LineageError::Conflict(format!(
            "run key {execution_id} already identifies a {} execution",
            execution.kind.as_str()
        )));
    }
    if let Some(suite_id) = suite_id {
        if execution.suite_id != suite_id {
            return Err(LineageError::Conflict(format!(
                "run key {execution_id} already identifies an execution of suite {}",
                execution.suite_id
            )));
        }
    }
    if scenario_id.is_some() && execution.scenario_id.as_deref() != scenario_id {
        return Err(LineageError::Conflict(format!(
            "run key {execution_id} already identifies an execution of scenario {}",
            execution.scenario_id.as_deref().unwrap_or("none")
        )));
    }
    let count = store.execution_rollup(&execution.id)?.total();
    Ok(Some(Created {
        value: ExecutionCreated { execution_id: execution.id, evaluation_count: count },
        created: false,
    }))
}

/// Enqueue one evaluation: run record first, then the evaluation row that
/// references it.
fn enqueue_evaluation(
    store: &LineageStore,
    execution: &SuiteExecution,
    calcutta_id: &str,
    game_outcome: PinnedInput,
    market_share: PinnedInput,
    snapshot_id: EntityId,
    now: DateTime<Utc>,
) -> LineageResult<()> {
    let id = new_id();
    let p = &execution.params;
    let params = RunParams::SuiteEvaluation(SuiteEvaluationParams {
        suite_execution_id: execution.id.clone(),
        calcutta_id: calcutta_id.to_string(),
        optimizer_key: p.optimizer_key.clone(),
        n_sims: p.n_sims,
        seed: p.seed,
        starting_state_key: p.starting_state_key.clone(),
        excluded_entry_name: p.excluded_entry_name.clone(),
        game_outcome_run_id: game_outcome.run_id.clone(),
        market_share_run_id: market_share.run_id.clone(),
        game_outcome_artifact_id: game_outcome.artifact_id.clone(),
        market_share_artifact_id: market_share.artifact_id.clone(),
        snapshot_id: snapshot_id.clone(),
    });
    store.enqueue(&id, &params, SOURCE, now)?;
    store.insert_evaluation(
        &NewSuiteEvaluation {
            id,
            suite_execution_id: execution.id.clone(),
            calcutta_id: calcutta_id.to_string(),
            game_outcome_run_id: game_outcome.run_id,
            market_share_run_id: market_share.run_id,
            game_outcome_artifact_id: game_outcome.artifact_id,
            market_share_artifact_id: market_share.artifact_id,
            snapshot_id,
        },
        now,
    )
}

fn effective_params(suite: &Suite, overrides: &SuiteOverrides) -> LineageResult<SimulationParams> {
    let mut params = overrides.apply(&suite.defaults);
    params.excluded_entry_name = params
        .excluded_entry_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    params.validate()?;
    Ok(params)
}

/// Fan a suite out over an explicit pool list.
///
/// Any missing pool (404) or missing upstream run (409 `missing_run`) rolls
/// the whole batch back.
pub fn create_suite_execution(
    store: &LineageStore,
    request: &CreateSuiteExecution,
    now: DateTime<Utc>,
) -> LineageResult<Created<ExecutionCreated>> {
    let suite_id = canonical_id(&request.suite_id, "suiteId")?;
    let pools = validate_pools(&request.calcutta_ids)?;
    let key = RunKey::or_generate(request.run_key.as_deref(), "runKey")?;
    let execution_id = key.as_id();

    let result = store.atomically(|s| {
        let existing =
            existing_execution(s, &execution_id, ExecutionKind::Batch, Some(suite_id.as_str()), None)?;
        if let Some(existing) = existing {
            return Ok(existing);
        }
        let suite = s.get_suite(&suite_id)?;
        let execution = SuiteExecution {
            id: execution_id.clone(),
            suite_id: suite.id.clone(),
            kind: ExecutionKind::Batch,
            scenario_id: None,
            game_outcome_algorithm_id: suite.game_outcome_algorithm_id.clone(),
            market_share_algorithm_id: suite.market_share_algorithm_id.clone(),
            params: effective_params(&suite, &request.overrides)?,
            created_at: now,
        };
        s.insert_execution(&execution)?;

        let excluded = execution.params.excluded_entry_name.as_deref();
        for calcutta_id in &pools {
            let calcutta = s.get_calcutta(calcutta_id)?;
            let game_outcome =
                resolve_game_outcome(s, &calcutta.tournament_id, &execution.game_outcome_algorithm_id)?;
            let market_share =
                resolve_market_share(s, &calcutta.id, &execution.market_share_algorithm_id, excluded)?;
            let snapshot = s.create_snapshot(
                &calcutta.id,
                excluded,
                &SnapshotSource::suite_execution(&execution.id),
                now,
            )?;
            enqueue_evaluation(s, &execution, &calcutta.id, game_outcome, market_share, snapshot.value.id, now)?;
        }
        Ok(Created {
            value: ExecutionCreated {
                execution_id: execution.id.clone(),
                evaluation_count: pools.len() as u32,
            },
            created: true,
        })
    });
    match &result {
        Ok(created) if created.created => log::info!(
            "orchestrator: execution {} enqueued {} evaluations",
            created.value.execution_id,
            created.value.evaluation_count
        ),
        Ok(_) => {}
        Err(e) => log::warn!("orchestrator: execution for suite {suite_id} rejected: {e}"),
    }
    result
}

/// Re-evaluate a scenario's focus candidate on exactly the inputs its
/// strategy-generation run pinned, bypassing "latest" resolution.
pub fn create_sandbox_execution(
    store: &LineageStore,
    scenario_id: &str,
    request: &CreateSandboxExecution,
    now: DateTime<Utc>,
) -> LineageResult<Created<ExecutionCreated>> {
    let scenario_id = canonical_id(scenario_id, "scenarioId")?;
    let key = RunKey::or_generate(request.run_key.as_deref(), "runKey")?;
    let execution_id = key.as_id();

    store.atomically(|s| {
        let existing =
            existing_execution(s, &execution_id, ExecutionKind::Sandbox, None, Some(scenario_id.as_str()))?;
        if let Some(existing) = existing {
            return Ok(existing);
        }
        let scenario = s.get_scenario(&scenario_id)?;
        let suite = s.get_suite(&scenario.suite_id)?;
        let focus_id = scenario.focus_strategy_generation_run_id.as_deref().ok_or_else(|| {
            LineageError::MissingRun {
                kind: RunKind::StrategyGeneration,
                scope: format!("scenario {scenario_id} has no focus run"),
            }
        })?;
        let focus = s.get_run(RunKind::StrategyGeneration, focus_id)?;
        let RunParams::StrategyGeneration(pinned) = &focus.params else {
            return Err(LineageError::Conflict(format!("{} has non-strategy params", focus.run_ref())));
        };

        let mut params = effective_params(&suite, &request.overrides)?;
        params.optimizer_key = pinned.optimizer_key.clone();
        params.excluded_entry_name = pinned.excluded_entry_name.clone();
        let execution = SuiteExecution {
            id: execution_id.clone(),
            suite_id: suite.id.clone(),
            kind: ExecutionKind::Sandbox,
            scenario_id: Some(scenario.id.clone()),
            game_outcome_algorithm_id: suite.game_outcome_algorithm_id.clone(),
            market_share_algorithm_id: suite.market_share_algorithm_id.clone(),
            params,
            created_at: now,
        };
        s.insert_execution(&execution)?;

        let snapshot_id = scenario
            .focus_snapshot_id
            .clone()
            .unwrap_or_else(|| pinned.snapshot_id.clone());
        enqueue_evaluation(
            s,
            &execution,
            &scenario.calcutta_id,
            PinnedInput {
                run_id: pinned.game_outcome_run_id.clone(),
                artifact_id: pinned.game_outcome_artifact_id.clone(),
            },
            PinnedInput {
                run_id: pinned.market_share_run_id.clone(),
                artifact_id: pinned.market_share_artifact_id.clone(),
            },
            snapshot_id,
            now,
        )?;
        log::info!("orchestrator: sandbox execution {} for scenario {}", execution.id, scenario.id);
        Ok(Created {
            value: ExecutionCreated { execution_id: execution.id, evaluation_count: 1 },
            created: true,
        })
    })
}

pub fn execution_detail(store: &LineageStore, execution_id: &str) -> LineageResult<ExecutionDetail> {
    let execution = store.get_execution(execution_id)?;
    let counts = store.execution_rollup(&execution.id)?;
    Ok(ExecutionDetail { status: counts.status(), counts, execution })
}
