use crate::{status::{RunStatus, RunTransition}, types::RunKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LineageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// An upstream run needed for resolution does not exist or has not
    /// succeeded yet. Retryable once the upstream run completes.
    #[error("No completed {kind} run for {scope}")]
    MissingRun { kind: RunKind, scope: String },

    #[error("Invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Illegal transition {transition:?} from status {from}")]
    IllegalTransition { from: RunStatus, transition: RunTransition },

    /// The claim was reclaimed by another worker (or the run already
    /// reached a terminal state) before this write landed.
    #[error("Claim on {kind}/{run_id} (attempt {attempt}) is no longer held by {worker_id}")]
    LostClaim {
        kind: RunKind,
        run_id: String,
        worker_id: String,
        attempt: u32,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unsupported schema version {version} for {what}")]
    UnsupportedSchema { what: String, version: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LineageError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput { field: field.into(), message: message.into() }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }
}

pub type LineageResult<T> = Result<T, LineageError>;
