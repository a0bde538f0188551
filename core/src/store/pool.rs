//! Live pool state and its immutable snapshots.

use super::{json_col, to_millis, ts, LineageStore};
use crate::{
    error::{LineageError, LineageResult},
    snapshot::{
        exclusion_key, Calcutta, NewCalcutta, Snapshot, SnapshotContents, SnapshotEntry,
        SnapshotSource, TeamBid, SNAPSHOT_SCHEMA_VERSION,
    },
    types::{new_id, Created},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const SNAPSHOT_COLUMNS: &str = "id, calcutta_id, excluded_entry_name, source_kind, source_id,
    schema_version, contents_json, created_at";

fn map_snapshot(r: &Row<'_>) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: r.get(0)?,
        calcutta_id: r.get(1)?,
        excluded_entry_name: r.get(2)?,
        source: SnapshotSource { kind: r.get(3)?, id: r.get(4)? },
        schema_version: r.get(5)?,
        contents: json_col(r, 6)?,
        created_at: ts(r, 7)?,
    })
}

impl LineageStore {
    // ── Pool boundary helpers (the CRUD layer owns these tables) ───────

    pub fn insert_calcutta(&self, calcutta: &NewCalcutta, now: DateTime<Utc>) -> LineageResult<Calcutta> {
        self.conn.execute(
            "INSERT INTO calcutta (id, tournament_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![calcutta.id, calcutta.tournament_id, calcutta.name, to_millis(now)],
        )?;
        self.get_calcutta(&calcutta.id)
    }

    pub fn find_calcutta(&self, id: &str) -> LineageResult<Option<Calcutta>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, tournament_id, name, created_at FROM calcutta
                 WHERE id=?1 AND deleted_at IS NULL",
                params![id],
                |r| {
                    Ok(Calcutta {
                        id: r.get(0)?,
                        tournament_id: r.get(1)?,
                        name: r.get(2)?,
                        created_at: ts(r, 3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn get_calcutta(&self, id: &str) -> LineageResult<Calcutta> {
        self.find_calcutta(id)?
            .ok_or_else(|| LineageError::not_found("calcutta", id))
    }

    pub fn insert_entry(
        &self,
        calcutta_id: &str,
        entry_id: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> LineageResult<()> {
        self.conn.execute(
            "INSERT INTO calcutta_entry (id, calcutta_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![entry_id, calcutta_id, name, to_millis(now)],
        )?;
        Ok(())
    }

    /// Insert or overwrite one bid. Only the live pool changes; snapshots
    /// already taken keep the old value.
    pub fn set_entry_bid(&self, entry_id: &str, team_id: &str, bid_points: u32) -> LineageResult<()> {
        self.conn.execute(
            "INSERT INTO calcutta_entry_bid (entry_id, team_id, bid_points) VALUES (?1, ?2, ?3)
             ON CONFLICT (entry_id, team_id) DO UPDATE SET bid_points=excluded.bid_points",
            params![entry_id, team_id, bid_points],
        )?;
        Ok(())
    }

    fn live_pool_contents(
        &self,
        calcutta: &Calcutta,
        excluded_entry_name: Option<&str>,
    ) -> LineageResult<SnapshotContents> {
        let excluded = exclusion_key(excluded_entry_name);
        let mut stmt = self.conn.prepare(
            "SELECT id, name FROM calcutta_entry
             WHERE calcutta_id=?1 AND deleted_at IS NULL
             ORDER BY name, id",
        )?;
        let entries: Vec<(String, String)> = stmt
            .query_map(params![calcutta.id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut bid_stmt = self.conn.prepare(
            "SELECT team_id, bid_points FROM calcutta_entry_bid
             WHERE entry_id=?1 ORDER BY team_id",
        )?;
        let mut snapshot_entries = Vec::with_capacity(entries.len());
        for (entry_id, name) in entries {
            if !excluded.is_empty() && name.trim() == excluded {
                continue;
            }
            let bids: Vec<TeamBid> = bid_stmt
                .query_map(params![entry_id], |r| {
                    Ok(TeamBid { team_id: r.get(0)?, bid_points: r.get(1)? })
                })?
                .collect::<Result<_, _>>()?;
            snapshot_entries.push(SnapshotEntry { entry_id, name, bids });
        }
        Ok(SnapshotContents {
            tournament_id: calcutta.tournament_id.clone(),
            entries: snapshot_entries,
        })
    }

    /// Copy the live pool into a snapshot for `(pool, exclusion, source)`,
    /// or return the snapshot already taken for that key.
    pub fn create_snapshot(
        &self,
        calcutta_id: &str,
        excluded_entry_name: Option<&str>,
        source: &SnapshotSource,
        now: DateTime<Utc>,
    ) -> LineageResult<Created<Snapshot>> {
        let key = exclusion_key(excluded_entry_name);
        let stored_name = if key.is_empty() { None } else { Some(key.as_str()) };
        self.atomically(|s| {
            let calcutta = s.get_calcutta(calcutta_id)?;
            let contents = s.live_pool_contents(&calcutta, stored_name)?;
            let inserted = s.conn.execute(
                "INSERT INTO calcutta_snapshot
                    (id, calcutta_id, exclusion_key, excluded_entry_name, source_kind, source_id,
                     schema_version, contents_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (calcutta_id, exclusion_key, source_kind, source_id) DO NOTHING",
                params![
                    new_id(),
                    calcutta_id,
                    key,
                    stored_name,
                    source.kind,
                    source.id,
                    SNAPSHOT_SCHEMA_VERSION,
                    serde_json::to_string(&contents)?,
                    to_millis(now),
                ],
            )?;
            let snapshot = s.conn.query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM calcutta_snapshot
                     WHERE calcutta_id=?1 AND exclusion_key=?2 AND source_kind=?3 AND source_id=?4"
                ),
                params![calcutta_id, key, source.kind, source.id],
                map_snapshot,
            )?;
            Ok(Created { value: snapshot, created: inserted == 1 })
        })
    }

    pub fn get_snapshot(&self, id: &str) -> LineageResult<Snapshot> {
        self.conn
            .query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM calcutta_snapshot WHERE id=?1"),
                params![id],
                map_snapshot,
            )
            .optional()?
            .ok_or_else(|| LineageError::not_found("snapshot", id))
    }

    /// Every snapshot taken of one pool, oldest first.
    pub fn list_snapshots(&self, calcutta_id: &str) -> LineageResult<Vec<Snapshot>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM calcutta_snapshot
             WHERE calcutta_id=?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![calcutta_id], map_snapshot)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
