//! Typed run outputs (artifacts) and their lineage edges.
//!
//! An artifact belongs to exactly one run. Lineage edges name concrete
//! artifact ids, never runs or "latest" queries: once a downstream run has
//! pinned artifact X, later upstream re-runs (producing X') never change it.

use crate::{
    error::{LineageError, LineageResult},
    snapshot::TeamBid,
    types::{EntityId, RunId, RunKind},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SimulatedOutcomes,
    PredictedMarketShare,
    RecommendedEntryBids,
    EvaluationReport,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::SimulatedOutcomes,
        ArtifactKind::PredictedMarketShare,
        ArtifactKind::RecommendedEntryBids,
        ArtifactKind::EvaluationReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimulatedOutcomes    => "simulated_outcomes",
            Self::PredictedMarketShare => "predicted_market_share",
            Self::RecommendedEntryBids => "recommended_entry_bids",
            Self::EvaluationReport     => "evaluation_report",
        }
    }

    /// The artifact a downstream run pins when it consumes a run of `kind`.
    pub fn primary_for(kind: RunKind) -> ArtifactKind {
        match kind {
            RunKind::GameOutcome        => Self::SimulatedOutcomes,
            RunKind::MarketShare        => Self::PredictedMarketShare,
            RunKind::StrategyGeneration => Self::RecommendedEntryBids,
            RunKind::SuiteEvaluation    => Self::EvaluationReport,
        }
    }

    pub fn current_schema_version(&self) -> u32 {
        1
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = LineageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| LineageError::invalid("artifactKind", format!("unknown artifact kind '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedOutcomesSummary {
    pub n_sims: u32,
    pub seed: i64,
    pub team_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictedMarketShareSummary {
    pub team_count: u32,
    pub total_predicted_share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedEntryBidsSummary {
    pub budget_points: u32,
    pub bids: Vec<TeamBid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReportSummary {
    pub mean_normalized_payout: f64,
    pub p_top1: f64,
    pub p_in_money: f64,
    #[serde(default)]
    pub our_rank: Option<u32>,
}

/// Inline digest of an artifact, decoded against its declared kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArtifactSummary {
    SimulatedOutcomes(SimulatedOutcomesSummary),
    PredictedMarketShare(PredictedMarketShareSummary),
    RecommendedEntryBids(RecommendedEntryBidsSummary),
    EvaluationReport(EvaluationReportSummary),
}

impl ArtifactSummary {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::SimulatedOutcomes(_)    => ArtifactKind::SimulatedOutcomes,
            Self::PredictedMarketShare(_) => ArtifactKind::PredictedMarketShare,
            Self::RecommendedEntryBids(_) => ArtifactKind::RecommendedEntryBids,
            Self::EvaluationReport(_)     => ArtifactKind::EvaluationReport,
        }
    }

    pub fn decode(kind: ArtifactKind, schema_version: u32, value: Value) -> LineageResult<Self> {
        if schema_version != kind.current_schema_version() {
            return Err(LineageError::UnsupportedSchema {
                what: format!("{kind} summary"),
                version: schema_version,
            });
        }
        let summary = match kind {
            ArtifactKind::SimulatedOutcomes    => Self::SimulatedOutcomes(serde_json::from_value(value)?),
            ArtifactKind::PredictedMarketShare => Self::PredictedMarketShare(serde_json::from_value(value)?),
            ArtifactKind::RecommendedEntryBids => Self::RecommendedEntryBids(serde_json::from_value(value)?),
            ArtifactKind::EvaluationReport     => Self::EvaluationReport(serde_json::from_value(value)?),
        };
        Ok(summary)
    }

    pub fn decode_str(kind: ArtifactKind, schema_version: u32, json: &str) -> LineageResult<Self> {
        Self::decode(kind, schema_version, serde_json::from_str(json)?)
    }
}

/// One lineage edge: this artifact consumed `artifact_id` in `role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageInput {
    pub role: String,
    pub artifact_id: EntityId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub artifact_kind: ArtifactKind,
    pub schema_version: u32,
    pub storage_uri: Option<String>,
    pub summary: Option<ArtifactSummary>,
    pub inputs: Vec<LineageInput>,
}

impl NewArtifact {
    pub fn new(artifact_kind: ArtifactKind) -> Self {
        Self {
            artifact_kind,
            schema_version: artifact_kind.current_schema_version(),
            storage_uri: None,
            summary: None,
            inputs: Vec::new(),
        }
    }

    pub fn with_summary(mut self, summary: ArtifactSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn with_storage_uri(mut self, uri: impl Into<String>) -> Self {
        self.storage_uri = Some(uri.into());
        self
    }

    pub fn with_input(mut self, role: &str, artifact_id: &str) -> Self {
        self.inputs.push(LineageInput {
            role: role.to_string(),
            artifact_id: artifact_id.to_string(),
        });
        self
    }

    pub fn validate(&self) -> LineageResult<()> {
        if let Some(summary) = &self.summary {
            if summary.kind() != self.artifact_kind {
                return Err(LineageError::invalid(
                    "summary",
                    format!("{} summary on a {} artifact", summary.kind(), self.artifact_kind),
                ));
            }
        }
        if self.schema_version != self.artifact_kind.current_schema_version() {
            return Err(LineageError::UnsupportedSchema {
                what: format!("{} artifact", self.artifact_kind),
                version: self.schema_version,
            });
        }
        let mut roles: Vec<&str> = self.inputs.iter().map(|i| i.role.as_str()).collect();
        roles.sort_unstable();
        if roles.windows(2).any(|w| w[0] == w[1]) {
            return Err(LineageError::invalid("inputs", "duplicate lineage role"));
        }
        Ok(())
    }
}

/// Row from the `artifact` table plus its lineage edges.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: EntityId,
    pub run_kind: RunKind,
    pub run_id: RunId,
    pub artifact_kind: ArtifactKind,
    pub schema_version: u32,
    pub storage_uri: Option<String>,
    pub summary: Option<ArtifactSummary>,
    pub inputs: Vec<LineageInput>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Artifact {
    pub fn input(&self, role: &str) -> Option<&str> {
        self.inputs
            .iter()
            .find(|i| i.role == role)
            .map(|i| i.artifact_id.as_str())
    }
}
