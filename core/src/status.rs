//! Run lifecycle: status enum and the transition function.
//!
//!   pending → claimed → running → {succeeded, failed}
//!   claimed/running → pending   (staleness reclaim, retry with backoff)
//!
//! RULE: every status predicate used in SQL is derived from `apply()`.
//! Adding a status or a transition forces this match to be revisited.

use crate::error::{LineageError, LineageResult};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunTransition {
    /// A worker takes ownership of a pending row.
    Claim,
    /// A stale claim expires and the row becomes claimable again.
    Reclaim,
    /// The owning worker begins processing.
    Start,
    /// The owning worker refreshes `claimed_at`.
    Heartbeat,
    Succeed,
    Fail,
    /// Processing failed with attempts left; back to pending after a backoff.
    Retry,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Claimed,
        RunStatus::Running,
        RunStatus::Succeeded,
        RunStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending   => "pending",
            Self::Claimed   => "claimed",
            Self::Running   => "running",
            Self::Succeeded => "succeeded",
            Self::Failed    => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// The single source of truth for legal lifecycle moves.
    pub fn apply(self, transition: RunTransition) -> LineageResult<RunStatus> {
        use RunStatus::*;
        use RunTransition::*;
        let next = match transition {
            Claim => match self {
                Pending => Some(Claimed),
                Claimed | Running | Succeeded | Failed => None,
            },
            Reclaim | Retry => match self {
                Claimed | Running => Some(Pending),
                Pending | Succeeded | Failed => None,
            },
            Start => match self {
                Claimed => Some(Running),
                Pending | Running | Succeeded | Failed => None,
            },
            Heartbeat => match self {
                Claimed | Running => Some(self),
                Pending | Succeeded | Failed => None,
            },
            Succeed => match self {
                Claimed | Running => Some(Succeeded),
                Pending | Succeeded | Failed => None,
            },
            Fail => match self {
                Claimed | Running => Some(Failed),
                Pending | Succeeded | Failed => None,
            },
        };
        next.ok_or(LineageError::IllegalTransition { from: self, transition })
    }

    /// Every status from which `transition` is legal.
    pub fn sources(transition: RunTransition) -> Vec<RunStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.apply(transition).is_ok())
            .collect()
    }

    /// `'a','b'` list for an SQL `IN (...)` predicate.
    pub(crate) fn sql_sources(transition: RunTransition) -> String {
        Self::sources(transition)
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = LineageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| LineageError::invalid("status", format!("unknown run status '{s}'")))
    }
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e: LineageError| FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunStatus::*;

    #[test]
    fn happy_path_walks_to_succeeded() {
        let s = Pending.apply(RunTransition::Claim).unwrap();
        assert_eq!(s, Claimed);
        let s = s.apply(RunTransition::Start).unwrap();
        assert_eq!(s, Running);
        assert_eq!(s.apply(RunTransition::Heartbeat).unwrap(), Running);
        assert_eq!(s.apply(RunTransition::Succeed).unwrap(), Succeeded);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for status in [Succeeded, Failed] {
            for t in [
                RunTransition::Claim,
                RunTransition::Reclaim,
                RunTransition::Start,
                RunTransition::Heartbeat,
                RunTransition::Succeed,
                RunTransition::Fail,
                RunTransition::Retry,
            ] {
                assert!(status.apply(t).is_err(), "{status} accepted {t:?}");
            }
        }
    }

    #[test]
    fn reclaim_only_from_owned_states() {
        assert_eq!(RunStatus::sources(RunTransition::Reclaim), vec![Claimed, Running]);
        assert_eq!(RunStatus::sources(RunTransition::Claim), vec![Pending]);
        assert_eq!(RunStatus::sql_sources(RunTransition::Reclaim), "'claimed','running'");
    }

    #[test]
    fn start_requires_claimed() {
        assert!(Pending.apply(RunTransition::Start).is_err());
        assert!(Running.apply(RunTransition::Start).is_err());
    }
}
