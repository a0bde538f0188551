//! Run records and the claim handle handed to workers.

use crate::{
    error::{LineageError, LineageResult},
    payload::RunParams,
    status::RunStatus,
    types::{RunId, RunKind, RunRef},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row from the `run_job` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_kind: RunKind,
    pub run_id: RunId,
    pub status: RunStatus,
    pub attempt: u32,
    pub params: RunParams,
    pub progress: Option<ProgressSnapshot>,
    pub available_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn run_ref(&self) -> RunRef {
        RunRef::new(self.run_kind, self.run_id.clone())
    }
}

/// Latest progress as reported by the owning worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub phase: Option<String>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new(percent: f64, phase: Option<&str>, message: Option<&str>) -> Self {
        Self {
            percent,
            phase: phase.map(str::to_string),
            message: message.map(str::to_string),
        }
    }

    pub fn validate(&self) -> LineageResult<()> {
        if !self.percent.is_finite() || !(0.0..=100.0).contains(&self.percent) {
            return Err(LineageError::invalid(
                "percent",
                format!("{} is outside [0, 100]", self.percent),
            ));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            percent: self.percent,
            phase: self.phase.clone(),
            message: self.message.clone(),
        }
    }
}

/// Ownership of one run, returned by a successful claim.
///
/// `(worker_id, attempt)` is the fencing token: every later write for this
/// run is conditioned on both, so a worker whose claim expired and was taken
/// over cannot overwrite the new owner's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedRun {
    pub run: RunRef,
    pub worker_id: String,
    pub attempt: u32,
    pub claimed_at: DateTime<Utc>,
    pub params: RunParams,
    /// The previous owner when this claim was a staleness reclaim.
    pub reclaimed_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded,
    Failed { error: String },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Succeeded     => RunStatus::Succeeded,
            Self::Failed { .. } => RunStatus::Failed,
        }
    }
}
