//! Shared primitive types used across the entire crate.

use crate::error::{LineageError, LineageResult};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The canonical run identifier (a UUID rendered as text).
pub type RunId = String;

/// A stable identifier for pools, suites, executions, artifacts and snapshots.
pub type EntityId = String;

/// Category of computation a run record tracks.
/// Variants are stored as text: never rename an existing variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    GameOutcome,
    MarketShare,
    StrategyGeneration,
    SuiteEvaluation,
}

impl RunKind {
    pub const ALL: [RunKind; 4] = [
        RunKind::GameOutcome,
        RunKind::MarketShare,
        RunKind::StrategyGeneration,
        RunKind::SuiteEvaluation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GameOutcome        => "game_outcome",
            Self::MarketShare        => "market_share",
            Self::StrategyGeneration => "strategy_generation",
            Self::SuiteEvaluation    => "suite_evaluation",
        }
    }

    /// What the run's `scope_id` column refers to.
    pub fn scope_label(&self) -> &'static str {
        match self {
            Self::GameOutcome => "tournament",
            _                 => "calcutta",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = LineageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| LineageError::invalid("run_kind", format!("unknown run kind '{s}'")))
    }
}

impl ToSql for RunKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e: LineageError| FromSqlError::Other(Box::new(e)))
    }
}

/// Identity of one run record: `(run_kind, run_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRef {
    pub kind: RunKind,
    pub id: RunId,
}

impl RunRef {
    pub fn new(kind: RunKind, id: impl Into<RunId>) -> Self {
        Self { kind, id: id.into() }
    }
}

impl fmt::Display for RunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Client-supplied or server-generated key that doubles as a row's identity.
/// Re-submitting a creation with the same key never creates a second row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey(Uuid);

impl RunKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied key, naming `field` in the validation error.
    pub fn parse(raw: &str, field: &str) -> LineageResult<Self> {
        parse_uuid(raw, field).map(Self)
    }

    /// Use the supplied key, or mint one when the client sent none.
    pub fn or_generate(raw: Option<&str>, field: &str) -> LineageResult<Self> {
        match raw {
            Some(raw) => Self::parse(raw, field),
            None => Ok(Self::generate()),
        }
    }

    pub fn as_id(&self) -> RunId {
        self.0.to_string()
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub fn parse_uuid(raw: &str, field: &str) -> LineageResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| LineageError::invalid(field, format!("'{raw}' is not a valid UUID")))
}

/// Validate a textual id and return it in canonical (lowercase hyphenated) form.
pub fn canonical_id(raw: &str, field: &str) -> LineageResult<EntityId> {
    parse_uuid(raw, field).map(|u| u.to_string())
}

pub fn new_id() -> EntityId {
    Uuid::new_v4().to_string()
}

/// A created-or-found result for idempotent creation paths.
#[derive(Debug, Clone)]
pub struct Created<T> {
    pub value: T,
    /// `false` when the key already existed and the stored row was returned.
    pub created: bool,
}
