//! The progress event log: how a run got to its current state.
//!
//! RULE: events are appended, never edited or deleted.
//! The run record's progress column answers "where is it now";
//! this log answers "how did we get here".

use crate::{
    status::RunStatus,
    types::{RunId, RunKind},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored in the `event_kind` column.
/// Variants are added as needed, never removed or renamed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    Enqueued,
    Claimed,
    Reclaimed,
    Started,
    Progress,
    RetryScheduled,
    Succeeded,
    Failed,
}

impl ProgressEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued       => "enqueued",
            Self::Claimed        => "claimed",
            Self::Reclaimed      => "reclaimed",
            Self::Started        => "started",
            Self::Progress       => "progress",
            Self::RetryScheduled => "retry_scheduled",
            Self::Succeeded      => "succeeded",
            Self::Failed         => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Enqueued,
            Self::Claimed,
            Self::Reclaimed,
            Self::Started,
            Self::Progress,
            Self::RetryScheduled,
            Self::Succeeded,
            Self::Failed,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

/// Typed event detail, persisted as JSON in `payload_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetail {
    None,
    Claim {
        worker_id: String,
        attempt: u32,
    },
    Reclaim {
        worker_id: String,
        previous_owner: Option<String>,
        attempt: u32,
    },
    Retry {
        attempt: u32,
        available_at: DateTime<Utc>,
        error: String,
    },
    Failure {
        attempt: u32,
        error: String,
    },
}

/// A progress event about to be appended.
#[derive(Debug, Clone)]
pub struct NewProgressEvent {
    pub run_kind: RunKind,
    pub run_id: RunId,
    pub event_kind: ProgressEventKind,
    pub status: Option<RunStatus>,
    pub percent: Option<f64>,
    pub phase: Option<String>,
    pub message: Option<String>,
    /// Producer identity: a worker id, "api" or "orchestrator".
    pub source: String,
    pub detail: EventDetail,
}

impl NewProgressEvent {
    pub fn lifecycle(
        run_kind: RunKind,
        run_id: &str,
        event_kind: ProgressEventKind,
        status: RunStatus,
        source: &str,
        detail: EventDetail,
    ) -> Self {
        Self {
            run_kind,
            run_id: run_id.to_string(),
            event_kind,
            status: Some(status),
            percent: None,
            phase: None,
            message: None,
            source: source.to_string(),
            detail,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub id: i64,
    pub run_kind: RunKind,
    pub run_id: RunId,
    pub event_kind: ProgressEventKind,
    pub status: Option<RunStatus>,
    pub percent: Option<f64>,
    pub phase: Option<String>,
    pub message: Option<String>,
    pub source: String,
    pub payload: EventDetail,
    pub created_at: DateTime<Utc>,
}
