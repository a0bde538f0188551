//! Suite, scenario, execution and evaluation queries.

use super::{is_unique_violation, opt_ts, to_millis, ts, decode_err, LineageStore, Page};
use crate::{
    error::{LineageError, LineageResult},
    status::RunStatus,
    suite::{
        EvaluationFilter, EvaluationResult, ExecutionKind, ExecutionRollup, NewSuite,
        NewSuiteEvaluation, SimulationParams, Suite, SuiteEvaluation, SuiteExecution,
        SuiteScenario,
    },
    types::new_id,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const SUITE_COLUMNS: &str = "id, name, game_outcome_algorithm_id, market_share_algorithm_id,
    optimizer_key, n_sims, seed, starting_state_key, excluded_entry_name, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, suite_id, kind, scenario_id, game_outcome_algorithm_id,
    market_share_algorithm_id, optimizer_key, n_sims, seed, starting_state_key,
    excluded_entry_name, created_at";

const EVALUATION_SELECT: &str = "SELECT e.id, e.suite_execution_id, e.calcutta_id,
        e.game_outcome_run_id, e.market_share_run_id,
        e.game_outcome_artifact_id, e.market_share_artifact_id, e.snapshot_id,
        r.status, r.error_message,
        e.mean_normalized_payout, e.median_normalized_payout, e.p_top1, e.p_in_money,
        e.our_rank, e.result_recorded_at, e.created_at
    FROM suite_calcutta_evaluation e
    JOIN run_job r ON r.run_kind = e.run_kind AND r.run_id = e.id";

fn map_suite(r: &Row<'_>) -> rusqlite::Result<Suite> {
    Ok(Suite {
        id: r.get(0)?,
        name: r.get(1)?,
        game_outcome_algorithm_id: r.get(2)?,
        market_share_algorithm_id: r.get(3)?,
        defaults: SimulationParams {
            optimizer_key: r.get(4)?,
            n_sims: r.get(5)?,
            seed: r.get(6)?,
            starting_state_key: r.get(7)?,
            excluded_entry_name: r.get(8)?,
        },
        created_at: ts(r, 9)?,
        updated_at: ts(r, 10)?,
    })
}

fn map_scenario(r: &Row<'_>) -> rusqlite::Result<SuiteScenario> {
    Ok(SuiteScenario {
        id: r.get(0)?,
        suite_id: r.get(1)?,
        calcutta_id: r.get(2)?,
        focus_strategy_generation_run_id: r.get(3)?,
        focus_snapshot_id: r.get(4)?,
        created_at: ts(r, 5)?,
    })
}

fn map_execution(r: &Row<'_>) -> rusqlite::Result<SuiteExecution> {
    let raw_kind: String = r.get(2)?;
    let kind = ExecutionKind::parse(&raw_kind).ok_or_else(|| {
        decode_err(2, LineageError::invalid("kind", format!("unknown execution kind '{raw_kind}'")))
    })?;
    Ok(SuiteExecution {
        id: r.get(0)?,
        suite_id: r.get(1)?,
        kind,
        scenario_id: r.get(3)?,
        game_outcome_algorithm_id: r.get(4)?,
        market_share_algorithm_id: r.get(5)?,
        params: SimulationParams {
            optimizer_key: r.get(6)?,
            n_sims: r.get(7)?,
            seed: r.get(8)?,
            starting_state_key: r.get(9)?,
            excluded_entry_name: r.get(10)?,
        },
        created_at: ts(r, 11)?,
    })
}

fn map_evaluation(r: &Row<'_>) -> rusqlite::Result<SuiteEvaluation> {
    let recorded_at = opt_ts(r, 15)?;
    let result = match recorded_at {
        Some(_) => Some(EvaluationResult {
            mean_normalized_payout: r.get(10)?,
            median_normalized_payout: r.get(11)?,
            p_top1: r.get(12)?,
            p_in_money: r.get(13)?,
            our_rank: r.get(14)?,
        }),
        None => None,
    };
    Ok(SuiteEvaluation {
        id: r.get(0)?,
        suite_execution_id: r.get(1)?,
        calcutta_id: r.get(2)?,
        game_outcome_run_id: r.get(3)?,
        market_share_run_id: r.get(4)?,
        game_outcome_artifact_id: r.get(5)?,
        market_share_artifact_id: r.get(6)?,
        snapshot_id: r.get(7)?,
        status: r.get(8)?,
        error_message: r.get(9)?,
        result,
        created_at: ts(r, 16)?,
    })
}

impl LineageStore {
    // ── Suites ─────────────────────────────────────────────────────────

    pub fn insert_suite(&self, suite: &NewSuite, now: DateTime<Utc>) -> LineageResult<Suite> {
        suite.validate()?;
        let id = new_id();
        let d = &suite.defaults;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO suite ({SUITE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)"
                ),
                params![
                    id,
                    suite.name.trim(),
                    suite.game_outcome_algorithm_id,
                    suite.market_share_algorithm_id,
                    d.optimizer_key,
                    d.n_sims,
                    d.seed,
                    d.starting_state_key,
                    d.excluded_entry_name,
                    to_millis(now),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LineageError::Conflict(format!("a suite named '{}' already exists", suite.name.trim()))
                } else {
                    e.into()
                }
            })?;
        self.get_suite(&id)
    }

    pub fn find_suite(&self, id: &str) -> LineageResult<Option<Suite>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {SUITE_COLUMNS} FROM suite WHERE id=?1 AND deleted_at IS NULL"),
                params![id],
                map_suite,
            )
            .optional()?)
    }

    pub fn get_suite(&self, id: &str) -> LineageResult<Suite> {
        self.find_suite(id)?.ok_or_else(|| LineageError::not_found("suite", id))
    }

    // ── Scenarios ──────────────────────────────────────────────────────

    pub fn insert_scenario(&self, scenario: &SuiteScenario) -> LineageResult<()> {
        self.conn
            .execute(
                "INSERT INTO suite_scenario
                    (id, suite_id, calcutta_id, focus_strategy_generation_run_id,
                     focus_snapshot_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    scenario.id,
                    scenario.suite_id,
                    scenario.calcutta_id,
                    scenario.focus_strategy_generation_run_id,
                    scenario.focus_snapshot_id,
                    to_millis(scenario.created_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LineageError::Conflict(format!(
                        "suite {} already has a scenario for calcutta {}",
                        scenario.suite_id, scenario.calcutta_id
                    ))
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub fn get_scenario(&self, id: &str) -> LineageResult<SuiteScenario> {
        self.conn
            .query_row(
                "SELECT id, suite_id, calcutta_id, focus_strategy_generation_run_id,
                        focus_snapshot_id, created_at
                 FROM suite_scenario WHERE id=?1 AND deleted_at IS NULL",
                params![id],
                map_scenario,
            )
            .optional()?
            .ok_or_else(|| LineageError::not_found("suite scenario", id))
    }

    // ── Executions ─────────────────────────────────────────────────────

    pub fn insert_execution(&self, execution: &SuiteExecution) -> LineageResult<()> {
        let p = &execution.params;
        self.conn.execute(
            &format!(
                "INSERT INTO suite_execution ({EXECUTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                execution.id,
                execution.suite_id,
                execution.kind.as_str(),
                execution.scenario_id,
                execution.game_outcome_algorithm_id,
                execution.market_share_algorithm_id,
                p.optimizer_key,
                p.n_sims,
                p.seed,
                p.starting_state_key,
                p.excluded_entry_name,
                to_millis(execution.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn find_execution(&self, id: &str) -> LineageResult<Option<SuiteExecution>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM suite_execution WHERE id=?1"),
                params![id],
                map_execution,
            )
            .optional()?)
    }

    pub fn get_execution(&self, id: &str) -> LineageResult<SuiteExecution> {
        self.find_execution(id)?
            .ok_or_else(|| LineageError::not_found("suite execution", id))
    }

    /// Executions newest first, optionally for one suite.
    pub fn list_executions(&self, suite_id: Option<&str>, page: Page) -> LineageResult<Vec<SuiteExecution>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM suite_execution
             WHERE (?1 IS NULL OR suite_id = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![suite_id, page.limit, page.offset], map_execution)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    /// Counts of the execution's evaluations by their run status.
    pub fn execution_rollup(&self, execution_id: &str) -> LineageResult<ExecutionRollup> {
        let mut stmt = self.conn.prepare(
            "SELECT r.status, COUNT(*)
             FROM suite_calcutta_evaluation e
             JOIN run_job r ON r.run_kind = e.run_kind AND r.run_id = e.id
             WHERE e.suite_execution_id=?1
             GROUP BY r.status",
        )?;
        let rows = stmt.query_map(params![execution_id], |r| {
            Ok((r.get::<_, RunStatus>(0)?, r.get::<_, u32>(1)?))
        })?;
        let mut rollup = ExecutionRollup::default();
        for r in rows {
            let (status, count) = r?;
            rollup.add(status, count);
        }
        Ok(rollup)
    }

    // ── Evaluations ────────────────────────────────────────────────────

    /// The evaluation's run record must already exist (same id, kind
    /// `suite_evaluation`).
    pub fn insert_evaluation(&self, evaluation: &NewSuiteEvaluation, now: DateTime<Utc>) -> LineageResult<()> {
        self.conn.execute(
            "INSERT INTO suite_calcutta_evaluation
                (id, suite_execution_id, calcutta_id, game_outcome_run_id, market_share_run_id,
                 game_outcome_artifact_id, market_share_artifact_id, snapshot_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                evaluation.id,
                evaluation.suite_execution_id,
                evaluation.calcutta_id,
                evaluation.game_outcome_run_id,
                evaluation.market_share_run_id,
                evaluation.game_outcome_artifact_id,
                evaluation.market_share_artifact_id,
                evaluation.snapshot_id,
                to_millis(now),
            ],
        )?;
        Ok(())
    }

    pub fn find_evaluation(&self, id: &str) -> LineageResult<Option<SuiteEvaluation>> {
        Ok(self
            .conn
            .query_row(&format!("{EVALUATION_SELECT} WHERE e.id=?1"), params![id], map_evaluation)
            .optional()?)
    }

    pub fn get_evaluation(&self, id: &str) -> LineageResult<SuiteEvaluation> {
        self.find_evaluation(id)?
            .ok_or_else(|| LineageError::not_found("suite calcutta evaluation", id))
    }

    pub fn list_evaluations(&self, filter: &EvaluationFilter, page: Page) -> LineageResult<Vec<SuiteEvaluation>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EVALUATION_SELECT}
             WHERE (?1 IS NULL OR e.suite_execution_id = ?1)
               AND (?2 IS NULL OR e.calcutta_id = ?2)
             ORDER BY e.created_at DESC, e.id
             LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![filter.suite_execution_id, filter.calcutta_id, page.limit, page.offset],
            map_evaluation,
        )?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    /// Write realized results. Results are recorded once; a redone run
    /// keeps the first values.
    pub fn record_evaluation_result(
        &self,
        id: &str,
        result: &EvaluationResult,
        now: DateTime<Utc>,
    ) -> LineageResult<bool> {
        result.validate()?;
        let changed = self.conn.execute(
            "UPDATE suite_calcutta_evaluation
             SET mean_normalized_payout=?1, median_normalized_payout=?2, p_top1=?3,
                 p_in_money=?4, our_rank=?5, result_recorded_at=?6
             WHERE id=?7 AND result_recorded_at IS NULL",
            params![
                result.mean_normalized_payout,
                result.median_normalized_payout,
                result.p_top1,
                result.p_in_money,
                result.our_rank,
                to_millis(now),
                id,
            ],
        )?;
        if changed == 0 && self.find_evaluation(id)?.is_none() {
            return Err(LineageError::not_found("suite calcutta evaluation", id));
        }
        Ok(changed == 1)
    }
}
