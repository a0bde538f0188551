//! Artifact and lineage-edge queries.

use super::{opt_ts, to_millis, ts, decode_err, is_unique_violation, LineageStore};
use crate::{
    artifact::{Artifact, ArtifactKind, ArtifactSummary, LineageInput, NewArtifact},
    error::{LineageError, LineageResult},
    types::{new_id, Created, RunRef},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const ARTIFACT_COLUMNS: &str = "id, run_kind, run_id, artifact_kind, schema_version,
    storage_uri, summary_json, created_at, deleted_at";

fn map_artifact(r: &Row<'_>) -> rusqlite::Result<Artifact> {
    let raw_kind: String = r.get(3)?;
    let artifact_kind: ArtifactKind = raw_kind.parse().map_err(|e| decode_err(3, e))?;
    let schema_version: u32 = r.get(4)?;
    let summary = match r.get::<_, Option<String>>(6)? {
        Some(json) => Some(
            ArtifactSummary::decode_str(artifact_kind, schema_version, &json)
                .map_err(|e| decode_err(6, e))?,
        ),
        None => None,
    };
    Ok(Artifact {
        id: r.get(0)?,
        run_kind: r.get(1)?,
        run_id: r.get(2)?,
        artifact_kind,
        schema_version,
        storage_uri: r.get(5)?,
        summary,
        inputs: Vec::new(),
        created_at: ts(r, 7)?,
        deleted_at: opt_ts(r, 8)?,
    })
}

impl LineageStore {
    /// Record an output of `run` with its lineage edges.
    ///
    /// First writer wins per `(run, artifact_kind)`: when a live artifact of
    /// that kind already exists it is returned with `created = false` and
    /// nothing is written.
    pub fn put_artifact(
        &self,
        run: &RunRef,
        artifact: &NewArtifact,
        now: DateTime<Utc>,
    ) -> LineageResult<Created<Artifact>> {
        artifact.validate()?;
        self.atomically(|s| {
            if let Some(existing) = s.find_artifact_for_run(run, artifact.artifact_kind)? {
                return Ok(Created { value: existing, created: false });
            }
            let id = new_id();
            let summary = artifact.summary.as_ref().map(serde_json::to_string).transpose()?;
            s.conn.execute(
                &format!(
                    "INSERT INTO artifact ({ARTIFACT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)"
                ),
                params![
                    id,
                    run.kind,
                    run.id,
                    artifact.artifact_kind.as_str(),
                    artifact.schema_version,
                    artifact.storage_uri,
                    summary,
                    to_millis(now),
                ],
            )?;
            for input in &artifact.inputs {
                s.insert_lineage_edge(&id, input)?;
            }
            log::debug!("artifacts: {} wrote {} {id}", run, artifact.artifact_kind);
            Ok(Created { value: s.get_artifact(&id)?, created: true })
        })
    }

    fn insert_lineage_edge(&self, artifact_id: &str, input: &LineageInput) -> LineageResult<()> {
        // Soft-deleted upstreams still anchor provenance.
        let upstream: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM artifact WHERE id=?1",
                params![input.artifact_id],
                |r| r.get(0),
            )
            .optional()?;
        if upstream.is_none() {
            return Err(LineageError::not_found("artifact", input.artifact_id.clone()));
        }
        self.conn
            .execute(
                "INSERT INTO artifact_input (artifact_id, role, input_artifact_id)
                 VALUES (?1, ?2, ?3)",
                params![artifact_id, input.role, input.artifact_id],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LineageError::invalid("inputs", format!("duplicate role '{}'", input.role))
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    /// Lineage edges of one artifact, ordered by role.
    pub fn inputs_of(&self, artifact_id: &str) -> LineageResult<Vec<LineageInput>> {
        let mut stmt = self.conn.prepare(
            "SELECT role, input_artifact_id FROM artifact_input
             WHERE artifact_id=?1 ORDER BY role",
        )?;
        let rows = stmt.query_map(params![artifact_id], |r| {
            Ok(LineageInput { role: r.get(0)?, artifact_id: r.get(1)? })
        })?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    /// Artifact by id, including soft-deleted ones (pinned ids must stay readable).
    pub fn find_artifact(&self, id: &str) -> LineageResult<Option<Artifact>> {
        let artifact = self
            .conn
            .query_row(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifact WHERE id=?1"),
                params![id],
                map_artifact,
            )
            .optional()?;
        match artifact {
            Some(mut a) => {
                a.inputs = self.inputs_of(&a.id)?;
                Ok(Some(a))
            }
            None => Ok(None),
        }
    }

    pub fn get_artifact(&self, id: &str) -> LineageResult<Artifact> {
        self.find_artifact(id)?
            .ok_or_else(|| LineageError::not_found("artifact", id))
    }

    /// The live artifact of `kind` produced by `run`, if any.
    pub fn find_artifact_for_run(
        &self,
        run: &RunRef,
        kind: ArtifactKind,
    ) -> LineageResult<Option<Artifact>> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM artifact
                 WHERE run_kind=?1 AND run_id=?2 AND artifact_kind=?3 AND deleted_at IS NULL",
                params![run.kind, run.id, kind.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        id.map(|id| self.get_artifact(&id)).transpose()
    }

    /// Live artifacts of a run, oldest first.
    pub fn list_artifacts(&self, run: &RunRef) -> LineageResult<Vec<Artifact>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifact
             WHERE run_kind=?1 AND run_id=?2 AND deleted_at IS NULL
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![run.kind, run.id], map_artifact)?;
        let mut result = Vec::new();
        for r in rows {
            let mut a = r?;
            a.inputs = self.inputs_of(&a.id)?;
            result.push(a);
        }
        Ok(result)
    }

    /// Hide an artifact from per-run lookups. Lineage edges that pin it
    /// keep pointing at the row.
    pub fn soft_delete_artifact(&self, id: &str, now: DateTime<Utc>) -> LineageResult<()> {
        let changed = self.conn.execute(
            "UPDATE artifact SET deleted_at=COALESCE(deleted_at, ?1) WHERE id=?2",
            params![to_millis(now), id],
        )?;
        if changed == 0 {
            return Err(LineageError::not_found("artifact", id));
        }
        Ok(())
    }
}
