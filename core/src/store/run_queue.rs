//! Run records and the claim protocol.
//!
//! Every write after `claim` is fenced by `(claimed_by, attempt)` and by the
//! source statuses of its transition, so a stale worker's write matches no
//! row and surfaces as `LostClaim`.

use super::{decode_err, opt_json_col, opt_ts, to_millis, ts, LineageStore};
use crate::{
    error::{LineageError, LineageResult},
    event::{EventDetail, NewProgressEvent, ProgressEventKind},
    payload::{RunParams, PARAMS_SCHEMA_VERSION},
    run::{ClaimedRun, ProgressUpdate, RunOutcome, RunRecord},
    status::{RunStatus, RunTransition},
    types::{Created, RunKind, RunRef},
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};

pub(crate) const RUN_COLUMNS: &str = "run_kind, run_id, status, attempt, params_json,
    params_schema_version, progress_json, available_at, claimed_at, claimed_by,
    started_at, finished_at, error_message, created_at, updated_at, deleted_at";

pub(crate) fn map_run(r: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let run_kind: RunKind = r.get(0)?;
    let params_json: String = r.get(4)?;
    let version: u32 = r.get(5)?;
    let params = RunParams::decode(run_kind, version, &params_json).map_err(|e| decode_err(4, e))?;
    Ok(RunRecord {
        run_kind,
        run_id: r.get(1)?,
        status: r.get(2)?,
        attempt: r.get(3)?,
        params,
        progress: opt_json_col(r, 6)?,
        available_at: ts(r, 7)?,
        claimed_at: opt_ts(r, 8)?,
        claimed_by: r.get(9)?,
        started_at: opt_ts(r, 10)?,
        finished_at: opt_ts(r, 11)?,
        error_message: r.get(12)?,
        created_at: ts(r, 13)?,
        updated_at: ts(r, 14)?,
        deleted_at: opt_ts(r, 15)?,
    })
}

fn kind_list(kinds: &[RunKind]) -> String {
    kinds
        .iter()
        .map(|k| format!("'{}'", k.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

impl LineageStore {
    /// Insert a pending run. An existing `run_id` is returned unchanged
    /// with `created = false`; reusing it for another kind is a conflict.
    pub fn enqueue(
        &self,
        run_id: &str,
        params: &RunParams,
        source: &str,
        now: DateTime<Utc>,
    ) -> LineageResult<Created<RunRecord>> {
        let kind = params.kind();
        let params_json = params.encode()?;
        self.atomically(|s| {
            let inserted = s.conn.execute(
                "INSERT INTO run_job
                    (run_kind, run_id, status, attempt, params_json, params_schema_version,
                     scope_id, algorithm_id, excluded_entry_name, available_at,
                     created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?8)
                 ON CONFLICT DO NOTHING",
                params![
                    kind,
                    run_id,
                    params_json,
                    PARAMS_SCHEMA_VERSION,
                    params.scope_id(),
                    params.algorithm_id(),
                    params.excluded_entry_name(),
                    to_millis(now),
                ],
            )?;
            if inserted == 1 {
                s.append_event(
                    &NewProgressEvent::lifecycle(
                        kind,
                        run_id,
                        ProgressEventKind::Enqueued,
                        RunStatus::Pending,
                        source,
                        EventDetail::None,
                    ),
                    now,
                )?;
                log::debug!("queue: enqueued {kind}/{run_id}");
                return Ok(Created { value: s.get_run(kind, run_id)?, created: true });
            }
            let existing = s
                .find_run_by_id(run_id)?
                .ok_or_else(|| LineageError::not_found("run", run_id))?;
            if existing.run_kind != kind {
                return Err(LineageError::Conflict(format!(
                    "run key {run_id} already identifies a {} run",
                    existing.run_kind
                )));
            }
            Ok(Created { value: existing, created: false })
        })
    }

    pub fn find_run(&self, kind: RunKind, run_id: &str) -> LineageResult<Option<RunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM run_job WHERE run_kind=?1 AND run_id=?2");
        Ok(self
            .conn
            .query_row(&sql, params![kind, run_id], map_run)
            .optional()?)
    }

    pub fn get_run(&self, kind: RunKind, run_id: &str) -> LineageResult<RunRecord> {
        self.find_run(kind, run_id)?
            .ok_or_else(|| LineageError::not_found("run", format!("{kind}/{run_id}")))
    }

    pub fn find_run_by_id(&self, run_id: &str) -> LineageResult<Option<RunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM run_job WHERE run_id=?1");
        Ok(self.conn.query_row(&sql, params![run_id], map_run).optional()?)
    }

    /// Claim the next runnable row of one of `kinds`, if any.
    ///
    /// Candidates are pending rows whose `available_at` has passed, and
    /// claimed/running rows whose `claimed_at` is older than `stale_after`.
    /// The write is a compare-and-set on `(status, attempt)` inside an
    /// IMMEDIATE transaction, so of N concurrent claimers exactly one wins.
    pub fn claim(
        &self,
        worker_id: &str,
        kinds: &[RunKind],
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> LineageResult<Option<ClaimedRun>> {
        if kinds.is_empty() {
            return Ok(None);
        }
        let stale_before = to_millis(now - stale_after);
        let now_ms = to_millis(now);
        self.atomically(|s| {
            let select = format!(
                "SELECT run_kind, run_id, status, attempt, claimed_by
                 FROM run_job
                 WHERE deleted_at IS NULL
                   AND run_kind IN ({kinds})
                   AND ((status IN ({claimable}) AND available_at <= ?1)
                        OR (status IN ({reclaimable}) AND claimed_at < ?2))
                 ORDER BY available_at, created_at, run_id
                 LIMIT 1",
                kinds = kind_list(kinds),
                claimable = RunStatus::sql_sources(RunTransition::Claim),
                reclaimable = RunStatus::sql_sources(RunTransition::Reclaim),
            );
            let candidate = s
                .conn
                .query_row(&select, params![now_ms, stale_before], |r| {
                    Ok((
                        r.get::<_, RunKind>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, RunStatus>(2)?,
                        r.get::<_, u32>(3)?,
                        r.get::<_, Option<String>>(4)?,
                    ))
                })
                .optional()?;
            let Some((kind, run_id, status, attempt, previous_owner)) = candidate else {
                return Ok(None);
            };

            let reclaim = status != RunStatus::Pending;
            if reclaim {
                status.apply(RunTransition::Reclaim)?.apply(RunTransition::Claim)?;
            } else {
                status.apply(RunTransition::Claim)?;
            }

            let claimed = s
                .conn
                .query_row(
                    "UPDATE run_job
                     SET status='claimed', claimed_by=?1, claimed_at=?2,
                         attempt=attempt+1, updated_at=?2
                     WHERE run_kind=?3 AND run_id=?4 AND status=?5 AND attempt=?6
                     RETURNING attempt, params_json, params_schema_version",
                    params![worker_id, now_ms, kind, run_id, status, attempt],
                    |r| {
                        Ok((
                            r.get::<_, u32>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, u32>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((attempt, params_json, version)) = claimed else {
                return Ok(None);
            };
            let params = RunParams::decode(kind, version, &params_json)?;

            let (event_kind, detail) = if reclaim {
                (
                    ProgressEventKind::Reclaimed,
                    EventDetail::Reclaim {
                        worker_id: worker_id.to_string(),
                        previous_owner: previous_owner.clone(),
                        attempt,
                    },
                )
            } else {
                (
                    ProgressEventKind::Claimed,
                    EventDetail::Claim { worker_id: worker_id.to_string(), attempt },
                )
            };
            s.append_event(
                &NewProgressEvent::lifecycle(kind, &run_id, event_kind, RunStatus::Claimed, worker_id, detail),
                now,
            )?;
            if reclaim {
                log::warn!(
                    "queue: worker={worker_id} reclaimed stale {kind}/{run_id} from {} (attempt {attempt})",
                    previous_owner.as_deref().unwrap_or("unknown")
                );
            } else {
                log::info!("queue: worker={worker_id} claimed {kind}/{run_id} (attempt {attempt})");
            }
            Ok(Some(ClaimedRun {
                run: RunRef::new(kind, run_id),
                worker_id: worker_id.to_string(),
                attempt,
                claimed_at: now,
                params,
                reclaimed_from: if reclaim { previous_owner } else { None },
            }))
        })
    }

    /// `claimed → running`. `started_at` is set on the first start only.
    pub fn start(&self, claim: &ClaimedRun, now: DateTime<Utc>) -> LineageResult<()> {
        self.atomically(|s| {
            let sql = format!(
                "UPDATE run_job
                 SET status='running', started_at=COALESCE(started_at, ?1), updated_at=?1
                 WHERE run_kind=?2 AND run_id=?3 AND claimed_by=?4 AND attempt=?5
                   AND status IN ({})",
                RunStatus::sql_sources(RunTransition::Start)
            );
            s.fenced_update(&sql, claim, now, RunTransition::Start)?;
            s.append_event(
                &NewProgressEvent::lifecycle(
                    claim.run.kind,
                    &claim.run.id,
                    ProgressEventKind::Started,
                    RunStatus::Running,
                    &claim.worker_id,
                    EventDetail::None,
                ),
                now,
            )?;
            Ok(())
        })
    }

    /// Refresh `claimed_at` so the claim does not go stale.
    pub fn heartbeat(&self, claim: &ClaimedRun, now: DateTime<Utc>) -> LineageResult<()> {
        let sql = format!(
            "UPDATE run_job SET claimed_at=?1, updated_at=?1
             WHERE run_kind=?2 AND run_id=?3 AND claimed_by=?4 AND attempt=?5
               AND status IN ({})",
            RunStatus::sql_sources(RunTransition::Heartbeat)
        );
        self.fenced_update(&sql, claim, now, RunTransition::Heartbeat)
    }

    /// Overwrite the progress snapshot and append a `progress` event.
    /// Only claimed or running runs accept progress.
    pub fn report_progress(
        &self,
        run: &RunRef,
        update: &ProgressUpdate,
        source: &str,
        now: DateTime<Utc>,
    ) -> LineageResult<()> {
        update.validate()?;
        let snapshot = serde_json::to_string(&update.snapshot())?;
        self.atomically(|s| {
            let sql = format!(
                "UPDATE run_job SET progress_json=?1, updated_at=?2
                 WHERE run_kind=?3 AND run_id=?4 AND status IN ({})
                 RETURNING status",
                RunStatus::sql_sources(RunTransition::Heartbeat)
            );
            let status: Option<RunStatus> = s
                .conn
                .query_row(&sql, params![snapshot, to_millis(now), run.kind, run.id], |r| r.get(0))
                .optional()?;
            let Some(status) = status else {
                let current = s.get_run(run.kind, &run.id)?;
                return Err(LineageError::IllegalTransition {
                    from: current.status,
                    transition: RunTransition::Heartbeat,
                });
            };
            s.append_event(
                &NewProgressEvent {
                    run_kind: run.kind,
                    run_id: run.id.clone(),
                    event_kind: ProgressEventKind::Progress,
                    status: Some(status),
                    percent: Some(update.percent),
                    phase: update.phase.clone(),
                    message: update.message.clone(),
                    source: source.to_string(),
                    detail: EventDetail::None,
                },
                now,
            )?;
            Ok(())
        })
    }

    /// Move a claimed or running run to its terminal status.
    pub fn complete(
        &self,
        claim: &ClaimedRun,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> LineageResult<()> {
        let (transition, event_kind, error, detail) = match outcome {
            RunOutcome::Succeeded => (
                RunTransition::Succeed,
                ProgressEventKind::Succeeded,
                None,
                EventDetail::None,
            ),
            RunOutcome::Failed { error } => (
                RunTransition::Fail,
                ProgressEventKind::Failed,
                Some(error.as_str()),
                EventDetail::Failure { attempt: claim.attempt, error: error.clone() },
            ),
        };
        let status = outcome.status();
        self.atomically(|s| {
            let sql = format!(
                "UPDATE run_job
                 SET status=?6, finished_at=?1, updated_at=?1, error_message=?7
                 WHERE run_kind=?2 AND run_id=?3 AND claimed_by=?4 AND attempt=?5
                   AND status IN ({})",
                RunStatus::sql_sources(transition)
            );
            let changed = s.conn.execute(
                &sql,
                params![
                    to_millis(now),
                    claim.run.kind,
                    claim.run.id,
                    claim.worker_id,
                    claim.attempt,
                    status,
                    error,
                ],
            )?;
            if changed == 0 {
                return Err(s.fence_error(claim, transition)?);
            }
            s.append_event(
                &NewProgressEvent::lifecycle(
                    claim.run.kind,
                    &claim.run.id,
                    event_kind,
                    status,
                    &claim.worker_id,
                    detail,
                ),
                now,
            )?;
            log::info!(
                "queue: worker={} {} {} (attempt {})",
                claim.worker_id,
                status,
                claim.run,
                claim.attempt
            );
            Ok(())
        })
    }

    /// Release the claim and make the run claimable again at `available_at`.
    pub fn schedule_retry(
        &self,
        claim: &ClaimedRun,
        error: &str,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LineageResult<()> {
        self.atomically(|s| {
            let sql = format!(
                "UPDATE run_job
                 SET status='pending', claimed_by=NULL, claimed_at=NULL,
                     available_at=?6, error_message=?7, updated_at=?1
                 WHERE run_kind=?2 AND run_id=?3 AND claimed_by=?4 AND attempt=?5
                   AND status IN ({})",
                RunStatus::sql_sources(RunTransition::Retry)
            );
            let changed = s.conn.execute(
                &sql,
                params![
                    to_millis(now),
                    claim.run.kind,
                    claim.run.id,
                    claim.worker_id,
                    claim.attempt,
                    to_millis(available_at),
                    error,
                ],
            )?;
            if changed == 0 {
                return Err(s.fence_error(claim, RunTransition::Retry)?);
            }
            s.append_event(
                &NewProgressEvent::lifecycle(
                    claim.run.kind,
                    &claim.run.id,
                    ProgressEventKind::RetryScheduled,
                    RunStatus::Pending,
                    &claim.worker_id,
                    EventDetail::Retry {
                        attempt: claim.attempt,
                        available_at,
                        error: error.to_string(),
                    },
                ),
                now,
            )?;
            log::warn!(
                "queue: worker={} retry {} at {available_at} after attempt {}: {error}",
                claim.worker_id,
                claim.run,
                claim.attempt
            );
            Ok(())
        })
    }

    /// Hide a run from resolution and claiming. The row itself is kept.
    pub fn soft_delete_run(&self, kind: RunKind, run_id: &str, now: DateTime<Utc>) -> LineageResult<()> {
        let changed = self.conn.execute(
            "UPDATE run_job SET deleted_at=COALESCE(deleted_at, ?1), updated_at=?1
             WHERE run_kind=?2 AND run_id=?3",
            params![to_millis(now), kind, run_id],
        )?;
        if changed == 0 {
            return Err(LineageError::not_found("run", format!("{kind}/{run_id}")));
        }
        Ok(())
    }

    /// Newest live succeeded run for `(kind, scope, algorithm)`.
    ///
    /// With an exclusion, a run computed under the same exclusion wins over
    /// a newer one that was not; otherwise the newest run wins.
    pub fn latest_succeeded_run(
        &self,
        kind: RunKind,
        scope_id: &str,
        algorithm_id: &str,
        excluded_entry_name: Option<&str>,
    ) -> LineageResult<Option<RunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM run_job
             WHERE run_kind=?1 AND scope_id=?2 AND algorithm_id=?3
               AND status='succeeded' AND deleted_at IS NULL
             ORDER BY CASE WHEN ?4 IS NOT NULL AND excluded_entry_name = ?4 THEN 0 ELSE 1 END,
                      created_at DESC, run_id DESC
             LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![kind, scope_id, algorithm_id, excluded_entry_name],
                map_run,
            )
            .optional()?)
    }

    /// Runs of one kind, newest first.
    pub fn list_runs(&self, kind: RunKind, limit: u32, offset: u32) -> LineageResult<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM run_job
             WHERE run_kind=?1 AND deleted_at IS NULL
             ORDER BY created_at DESC, run_id DESC
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![kind, limit, offset], map_run)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    fn fenced_update(
        &self,
        sql: &str,
        claim: &ClaimedRun,
        now: DateTime<Utc>,
        transition: RunTransition,
    ) -> LineageResult<()> {
        let changed = self.conn.execute(
            sql,
            params![
                to_millis(now),
                claim.run.kind,
                claim.run.id,
                claim.worker_id,
                claim.attempt
            ],
        )?;
        if changed == 0 {
            return Err(self.fence_error(claim, transition)?);
        }
        Ok(())
    }

    /// Explain why a fenced write matched nothing.
    fn fence_error(&self, claim: &ClaimedRun, transition: RunTransition) -> LineageResult<LineageError> {
        let run = self.get_run(claim.run.kind, &claim.run.id)?;
        let owned = run.claimed_by.as_deref() == Some(claim.worker_id.as_str())
            && run.attempt == claim.attempt;
        if owned {
            if let Err(e) = run.status.apply(transition) {
                return Ok(e);
            }
        }
        Ok(LineageError::LostClaim {
            kind: claim.run.kind,
            run_id: claim.run.id.clone(),
            worker_id: claim.worker_id.clone(),
            attempt: claim.attempt,
        })
    }
}
