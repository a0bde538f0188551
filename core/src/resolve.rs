//! Upstream resolution and pinning.
//!
//! Resolution runs only at creation time. Whatever it picks is stored as
//! concrete run and artifact ids, and everything downstream dereferences
//! those ids instead of asking for "latest" again.

use crate::{
    artifact::ArtifactKind,
    error::{LineageError, LineageResult},
    run::RunRecord,
    status::RunStatus,
    store::LineageStore,
    types::{EntityId, RunId, RunKind, RunRef},
};

/// An upstream run and the primary artifact it had produced when pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedInput {
    pub run_id: RunId,
    pub artifact_id: Option<EntityId>,
}

fn pin(store: &LineageStore, run: &RunRecord) -> LineageResult<PinnedInput> {
    let artifact = store.find_artifact_for_run(&run.run_ref(), ArtifactKind::primary_for(run.run_kind))?;
    Ok(PinnedInput {
        run_id: run.run_id.clone(),
        artifact_id: artifact.map(|a| a.id),
    })
}

/// Latest succeeded game-outcome run for `(tournament, algorithm)`.
pub fn resolve_game_outcome(
    store: &LineageStore,
    tournament_id: &str,
    algorithm_id: &str,
) -> LineageResult<PinnedInput> {
    let run = store
        .latest_succeeded_run(RunKind::GameOutcome, tournament_id, algorithm_id, None)?
        .ok_or_else(|| LineageError::MissingRun {
            kind: RunKind::GameOutcome,
            scope: format!("tournament {tournament_id} with algorithm {algorithm_id}"),
        })?;
    pin(store, &run)
}

/// Latest succeeded market-share run for `(pool, algorithm)`, preferring
/// one computed under the same exclusion.
pub fn resolve_market_share(
    store: &LineageStore,
    calcutta_id: &str,
    algorithm_id: &str,
    excluded_entry_name: Option<&str>,
) -> LineageResult<PinnedInput> {
    let run = store
        .latest_succeeded_run(RunKind::MarketShare, calcutta_id, algorithm_id, excluded_entry_name)?
        .ok_or_else(|| LineageError::MissingRun {
            kind: RunKind::MarketShare,
            scope: format!("calcutta {calcutta_id} with algorithm {algorithm_id}"),
        })?;
    pin(store, &run)
}

/// Pin a caller-chosen upstream run. It must exist, be live, have
/// succeeded, and cover `expected_scope`.
pub fn pin_explicit(
    store: &LineageStore,
    run: &RunRef,
    expected_scope: &str,
    field: &str,
) -> LineageResult<PinnedInput> {
    let record = store.get_run(run.kind, &run.id)?;
    if record.deleted_at.is_some() {
        return Err(LineageError::not_found("run", run.to_string()));
    }
    if record.params.scope_id() != expected_scope {
        return Err(LineageError::invalid(
            field,
            format!("{run} covers {} instead of {expected_scope}", record.params.scope_id()),
        ));
    }
    if record.status != RunStatus::Succeeded {
        return Err(LineageError::MissingRun {
            kind: run.kind,
            scope: format!("{run} is {}", record.status),
        });
    }
    pin(store, &record)
}
