//! Suites, scenarios, executions and per-pool evaluations.

use crate::{
    error::{LineageError, LineageResult},
    status::RunStatus,
    types::{EntityId, RunId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default simulation parameters carried by a suite and by each execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationParams {
    pub optimizer_key: String,
    pub n_sims: u32,
    pub seed: i64,
    pub starting_state_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_entry_name: Option<String>,
}

impl SimulationParams {
    pub fn validate(&self) -> LineageResult<()> {
        if self.optimizer_key.trim().is_empty() {
            return Err(LineageError::invalid("optimizerKey", "must not be empty"));
        }
        if self.n_sims == 0 {
            return Err(LineageError::invalid("nSims", "must be positive"));
        }
        if self.starting_state_key.trim().is_empty() {
            return Err(LineageError::invalid("startingStateKey", "must not be empty"));
        }
        Ok(())
    }
}

/// Request-level overrides applied on top of a suite's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteOverrides {
    pub optimizer_key: Option<String>,
    pub n_sims: Option<u32>,
    pub seed: Option<i64>,
    pub starting_state_key: Option<String>,
    pub excluded_entry_name: Option<String>,
}

impl SuiteOverrides {
    pub fn apply(&self, defaults: &SimulationParams) -> SimulationParams {
        SimulationParams {
            optimizer_key: self.optimizer_key.clone().unwrap_or_else(|| defaults.optimizer_key.clone()),
            n_sims: self.n_sims.unwrap_or(defaults.n_sims),
            seed: self.seed.unwrap_or(defaults.seed),
            starting_state_key: self
                .starting_state_key
                .clone()
                .unwrap_or_else(|| defaults.starting_state_key.clone()),
            excluded_entry_name: self
                .excluded_entry_name
                .clone()
                .or_else(|| defaults.excluded_entry_name.clone()),
        }
    }
}

/// A fixed algorithm triple plus default parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suite {
    pub id: EntityId,
    pub name: String,
    pub game_outcome_algorithm_id: String,
    pub market_share_algorithm_id: String,
    pub defaults: SimulationParams,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSuite {
    pub name: String,
    pub game_outcome_algorithm_id: String,
    pub market_share_algorithm_id: String,
    #[serde(flatten)]
    pub defaults: SimulationParams,
}

impl NewSuite {
    pub fn validate(&self) -> LineageResult<()> {
        if self.name.trim().is_empty() {
            return Err(LineageError::invalid("name", "must not be empty"));
        }
        if self.game_outcome_algorithm_id.trim().is_empty() {
            return Err(LineageError::invalid("gameOutcomeAlgorithmId", "must not be empty"));
        }
        if self.market_share_algorithm_id.trim().is_empty() {
            return Err(LineageError::invalid("marketShareAlgorithmId", "must not be empty"));
        }
        self.defaults.validate()
    }
}

/// Binds one suite to one pool, optionally with a focus candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteScenario {
    pub id: EntityId,
    pub suite_id: EntityId,
    pub calcutta_id: EntityId,
    pub focus_strategy_generation_run_id: Option<RunId>,
    pub focus_snapshot_id: Option<EntityId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Fan-out over explicit pools with "latest" upstream resolution.
    Batch,
    /// Re-evaluation of a scenario's focus candidate on its exact pinned inputs.
    Sandbox,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch   => "batch",
            Self::Sandbox => "sandbox",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "batch"   => Some(Self::Batch),
            "sandbox" => Some(Self::Sandbox),
            _         => None,
        }
    }
}

/// Row from the `suite_execution` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteExecution {
    pub id: EntityId,
    pub suite_id: EntityId,
    pub kind: ExecutionKind,
    pub scenario_id: Option<EntityId>,
    pub game_outcome_algorithm_id: String,
    pub market_share_algorithm_id: String,
    pub params: SimulationParams,
    pub created_at: DateTime<Utc>,
}

/// Realized ranking/payout results written back by the evaluating worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub mean_normalized_payout: f64,
    pub median_normalized_payout: f64,
    pub p_top1: f64,
    pub p_in_money: f64,
    #[serde(default)]
    pub our_rank: Option<u32>,
}

impl EvaluationResult {
    pub fn validate(&self) -> LineageResult<()> {
        for (field, p) in [("pTop1", self.p_top1), ("pInMoney", self.p_in_money)] {
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(LineageError::invalid(field, format!("{p} is not a probability")));
            }
        }
        if !self.mean_normalized_payout.is_finite() || !self.median_normalized_payout.is_finite() {
            return Err(LineageError::invalid("meanNormalizedPayout", "must be finite"));
        }
        Ok(())
    }
}

/// Row from `suite_calcutta_evaluation`, with status read from its run record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteEvaluation {
    pub id: RunId,
    pub suite_execution_id: EntityId,
    pub calcutta_id: EntityId,
    pub game_outcome_run_id: RunId,
    pub market_share_run_id: RunId,
    pub game_outcome_artifact_id: Option<EntityId>,
    pub market_share_artifact_id: Option<EntityId>,
    pub snapshot_id: EntityId,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub result: Option<EvaluationResult>,
    pub created_at: DateTime<Utc>,
}

/// Pinned inputs of one evaluation, written in the same transaction as its
/// run record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSuiteEvaluation {
    pub id: RunId,
    pub suite_execution_id: EntityId,
    pub calcutta_id: EntityId,
    pub game_outcome_run_id: RunId,
    pub market_share_run_id: RunId,
    pub game_outcome_artifact_id: Option<EntityId>,
    pub market_share_artifact_id: Option<EntityId>,
    pub snapshot_id: EntityId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationFilter {
    pub suite_execution_id: Option<EntityId>,
    pub calcutta_id: Option<EntityId>,
}

/// Aggregate status of an execution derived from its evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRollup {
    pub pending: u32,
    pub claimed: u32,
    pub running: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending   => "pending",
            Self::Running   => "running",
            Self::Succeeded => "succeeded",
            Self::Failed    => "failed",
        };
        f.write_str(s)
    }
}

impl ExecutionRollup {
    pub fn add(&mut self, status: RunStatus, count: u32) {
        match status {
            RunStatus::Pending   => self.pending += count,
            RunStatus::Claimed   => self.claimed += count,
            RunStatus::Running   => self.running += count,
            RunStatus::Succeeded => self.succeeded += count,
            RunStatus::Failed    => self.failed += count,
        }
    }

    pub fn total(&self) -> u32 {
        self.pending + self.claimed + self.running + self.succeeded + self.failed
    }

    /// Failed once everything finished and anything failed; succeeded once
    /// everything succeeded; running once any evaluation left pending.
    pub fn status(&self) -> ExecutionStatus {
        let finished = self.succeeded + self.failed;
        if self.total() > 0 && finished == self.total() {
            if self.failed > 0 {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Succeeded
            }
        } else if self.claimed + self.running + finished > 0 {
            ExecutionStatus::Running
        } else {
            ExecutionStatus::Pending
        }
    }
}
