//! Append-only progress event log queries.

use super::{json_col, to_millis, ts, decode_err, LineageStore};
use crate::{
    error::{LineageError, LineageResult},
    event::{NewProgressEvent, ProgressEvent, ProgressEventKind},
    types::RunRef,
};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl LineageStore {
    pub fn append_event(&self, event: &NewProgressEvent, now: DateTime<Utc>) -> LineageResult<i64> {
        let payload = serde_json::to_string(&event.detail)?;
        self.conn.execute(
            "INSERT INTO progress_event
                (run_kind, run_id, event_kind, status, percent, phase, message,
                 source, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.run_kind,
                event.run_id,
                event.event_kind.as_str(),
                event.status,
                event.percent,
                event.phase,
                event.message,
                event.source,
                payload,
                to_millis(now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All events for one run in append order.
    pub fn list_events(&self, run: &RunRef) -> LineageResult<Vec<ProgressEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_kind, run_id, event_kind, status, percent, phase, message,
                    source, payload_json, created_at
             FROM progress_event
             WHERE run_kind=?1 AND run_id=?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run.kind, run.id], |r| {
            let raw_kind: String = r.get(3)?;
            let event_kind = ProgressEventKind::parse(&raw_kind).ok_or_else(|| {
                decode_err(
                    3,
                    LineageError::invalid("event_kind", format!("unknown event kind '{raw_kind}'")),
                )
            })?;
            Ok(ProgressEvent {
                id: r.get(0)?,
                run_kind: r.get(1)?,
                run_id: r.get(2)?,
                event_kind,
                status: r.get(4)?,
                percent: r.get(5)?,
                phase: r.get(6)?,
                message: r.get(7)?,
                source: r.get(8)?,
                payload: json_col(r, 9)?,
                created_at: ts(r, 10)?,
            })
        })?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }
}
