//! Pool snapshots: immutable point-in-time copies of a calcutta's
//! entries and bids, taken when an evaluation or strategy run is created.
//!
//! A snapshot is created at most once per (pool, exclusion rule, triggering
//! run) and never updated afterwards. Scoring reads the snapshot, never the
//! live pool, so later edits to the pool cannot change a historical result.

use crate::types::{EntityId, RunKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamBid {
    pub team_id: EntityId,
    pub bid_points: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub entry_id: EntityId,
    pub name: String,
    pub bids: Vec<TeamBid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotContents {
    pub tournament_id: EntityId,
    pub entries: Vec<SnapshotEntry>,
}

/// What triggered the snapshot: a run, or a suite execution for batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    pub kind: String,
    pub id: EntityId,
}

impl SnapshotSource {
    pub fn run(kind: RunKind, id: &str) -> Self {
        Self { kind: kind.as_str().to_string(), id: id.to_string() }
    }

    pub fn suite_execution(id: &str) -> Self {
        Self { kind: "suite_execution".to_string(), id: id.to_string() }
    }
}

/// Row from the `calcutta_snapshot` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: EntityId,
    pub calcutta_id: EntityId,
    pub excluded_entry_name: Option<String>,
    pub source: SnapshotSource,
    pub schema_version: u32,
    pub contents: SnapshotContents,
    pub created_at: DateTime<Utc>,
}

/// Key used in the uniqueness constraint; `None` and `""` are the same rule.
pub fn exclusion_key(excluded_entry_name: Option<&str>) -> String {
    excluded_entry_name.map(str::trim).unwrap_or_default().to_string()
}

// ── Live pool state (written by the CRUD layer) ───────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Calcutta {
    pub id: EntityId,
    pub tournament_id: EntityId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCalcutta {
    pub id: EntityId,
    pub tournament_id: EntityId,
    pub name: String,
}
