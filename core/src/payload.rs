//! Run parameters, schema-versioned, discriminated by run kind.
//!
//! Params are stored as JSON next to a `params_schema_version` column.
//! Decoding checks both the declared version and that the payload's
//! `kind` tag agrees with the row's `run_kind`.

use crate::{
    error::{LineageError, LineageResult},
    types::{EntityId, RunId, RunKind},
};
use serde::{Deserialize, Serialize};

pub const PARAMS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunParams {
    GameOutcome(GameOutcomeParams),
    MarketShare(MarketShareParams),
    StrategyGeneration(StrategyGenerationParams),
    SuiteEvaluation(SuiteEvaluationParams),
}

/// Tournament simulation under one game-outcome algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOutcomeParams {
    pub tournament_id: EntityId,
    pub algorithm_id: String,
    pub n_sims: u32,
    pub seed: i64,
    pub starting_state_key: String,
}

/// Market-share prediction for one pool, optionally without one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketShareParams {
    pub calcutta_id: EntityId,
    pub algorithm_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_entry_name: Option<String>,
}

/// Optimal-entry generation. Upstream runs and their artifacts are pinned
/// at creation time together with the snapshot the optimizer reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyGenerationParams {
    pub calcutta_id: EntityId,
    pub optimizer_key: String,
    pub game_outcome_run_id: RunId,
    pub market_share_run_id: RunId,
    #[serde(default)]
    pub game_outcome_artifact_id: Option<EntityId>,
    #[serde(default)]
    pub market_share_artifact_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_entry_name: Option<String>,
    pub snapshot_id: EntityId,
}

/// One pool evaluated inside a suite execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteEvaluationParams {
    pub suite_execution_id: EntityId,
    pub calcutta_id: EntityId,
    pub optimizer_key: String,
    pub n_sims: u32,
    pub seed: i64,
    pub starting_state_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_entry_name: Option<String>,
    pub game_outcome_run_id: RunId,
    pub market_share_run_id: RunId,
    #[serde(default)]
    pub game_outcome_artifact_id: Option<EntityId>,
    #[serde(default)]
    pub market_share_artifact_id: Option<EntityId>,
    pub snapshot_id: EntityId,
}

impl RunParams {
    pub fn kind(&self) -> RunKind {
        match self {
            Self::GameOutcome(_)        => RunKind::GameOutcome,
            Self::MarketShare(_)        => RunKind::MarketShare,
            Self::StrategyGeneration(_) => RunKind::StrategyGeneration,
            Self::SuiteEvaluation(_)    => RunKind::SuiteEvaluation,
        }
    }

    /// Tournament for game-outcome runs, pool for everything else.
    pub fn scope_id(&self) -> &str {
        match self {
            Self::GameOutcome(p)        => &p.tournament_id,
            Self::MarketShare(p)        => &p.calcutta_id,
            Self::StrategyGeneration(p) => &p.calcutta_id,
            Self::SuiteEvaluation(p)    => &p.calcutta_id,
        }
    }

    pub fn algorithm_id(&self) -> &str {
        match self {
            Self::GameOutcome(p)        => &p.algorithm_id,
            Self::MarketShare(p)        => &p.algorithm_id,
            Self::StrategyGeneration(p) => &p.optimizer_key,
            Self::SuiteEvaluation(p)    => &p.optimizer_key,
        }
    }

    pub fn excluded_entry_name(&self) -> Option<&str> {
        match self {
            Self::GameOutcome(_)        => None,
            Self::MarketShare(p)        => p.excluded_entry_name.as_deref(),
            Self::StrategyGeneration(p) => p.excluded_entry_name.as_deref(),
            Self::SuiteEvaluation(p)    => p.excluded_entry_name.as_deref(),
        }
    }

    /// Artifacts this run consumes, as `(role, artifact_id)` pairs.
    pub fn pinned_inputs(&self) -> Vec<(&'static str, &str)> {
        let (go, ms) = match self {
            Self::GameOutcome(_) | Self::MarketShare(_) => return Vec::new(),
            Self::StrategyGeneration(p) => (&p.game_outcome_artifact_id, &p.market_share_artifact_id),
            Self::SuiteEvaluation(p)    => (&p.game_outcome_artifact_id, &p.market_share_artifact_id),
        };
        let mut inputs = Vec::new();
        if let Some(id) = go {
            inputs.push(("game_outcome", id.as_str()));
        }
        if let Some(id) = ms {
            inputs.push(("market_share", id.as_str()));
        }
        inputs
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        match self {
            Self::StrategyGeneration(p) => Some(&p.snapshot_id),
            Self::SuiteEvaluation(p)    => Some(&p.snapshot_id),
            Self::GameOutcome(_) | Self::MarketShare(_) => None,
        }
    }

    pub fn encode(&self) -> LineageResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(kind: RunKind, schema_version: u32, json: &str) -> LineageResult<Self> {
        if schema_version != PARAMS_SCHEMA_VERSION {
            return Err(LineageError::UnsupportedSchema {
                what: format!("{kind} params"),
                version: schema_version,
            });
        }
        let params: RunParams = serde_json::from_str(json)?;
        if params.kind() != kind {
            return Err(LineageError::Conflict(format!(
                "params tagged {} stored on a {kind} run",
                params.kind()
            )));
        }
        Ok(params)
    }
}
