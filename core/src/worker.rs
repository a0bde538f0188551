//! Polling worker: claim one run per tick, process it, record the outcome.
//!
//! RULE: processing failures never escape `tick`. They end up on the run
//! record as a scheduled retry or a terminal `failed` status.

use crate::{
    clock::Clock,
    config::{QueueConfig, RetryConfig},
    error::{LineageError, LineageResult},
    processor::{ProcessOutput, RunContext, RunProcessor},
    retry::{RetryDecision, RetryPolicy},
    run::{ClaimedRun, RunOutcome},
    store::LineageStore,
    types::{RunKind, RunRef},
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// Upper bound on one uninterrupted sleep, so cancellation is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cooperative stop signal shared between a worker and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one tick did with the run it claimed.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Succeeded(RunRef),
    RetryScheduled { run: RunRef, available_at: DateTime<Utc> },
    Failed { run: RunRef, error: String },
    /// Another worker reclaimed the run mid-flight; nothing was written.
    LostClaim(RunRef),
}

pub struct Worker {
    worker_id: String,
    store: LineageStore,
    queue: QueueConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    processors: BTreeMap<RunKind, Box<dyn RunProcessor>>,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        store: LineageStore,
        queue: QueueConfig,
        retry: &RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            queue,
            retry: RetryPolicy::from_config(retry),
            clock,
            processors: BTreeMap::new(),
        }
    }

    /// Handle `processor.kind()` runs with `processor`, replacing any
    /// previous registration for that kind.
    pub fn register(&mut self, processor: Box<dyn RunProcessor>) {
        let kind = processor.kind();
        if self.processors.insert(kind, processor).is_some() {
            log::warn!("worker={} replaced processor for {kind}", self.worker_id);
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &LineageStore {
        &self.store
    }

    /// Claim and fully process at most one run.
    pub fn tick(&mut self) -> LineageResult<Option<TickOutcome>> {
        let kinds: Vec<RunKind> = self.processors.keys().copied().collect();
        let now = self.clock.now();
        let Some(claim) = self
            .store
            .claim(&self.worker_id, &kinds, now, self.queue.stale_after())?
        else {
            return Ok(None);
        };

        // Only a staleness reclaim can push attempt past the limit.
        if claim.attempt > self.retry.max_attempts() {
            return self.abandon(&claim, now).map(Some);
        }

        match self.store.start(&claim, now) {
            Ok(()) => {}
            Err(LineageError::LostClaim { .. }) => return Ok(Some(TickOutcome::LostClaim(claim.run))),
            Err(e) => return Err(e),
        }

        let processed = self.process(&claim);
        let outcome = match processed {
            Ok(output) => match self.finish(&claim, output) {
                Ok(()) => Ok(TickOutcome::Succeeded(claim.run.clone())),
                Err(LineageError::LostClaim { .. }) => Ok(TickOutcome::LostClaim(claim.run.clone())),
                Err(e) => self.fail(&claim, format!("failed to record output: {e}")),
            },
            Err(e) if is_lost_claim(&e) => Ok(TickOutcome::LostClaim(claim.run.clone())),
            Err(e) => self.fail(&claim, format!("{e:#}")),
        };
        match outcome {
            Ok(TickOutcome::LostClaim(run)) => {
                log::warn!("worker={} lost claim on {run} (attempt {})", self.worker_id, claim.attempt);
                Ok(Some(TickOutcome::LostClaim(run)))
            }
            Err(LineageError::LostClaim { .. }) => {
                log::warn!("worker={} lost claim on {} (attempt {})", self.worker_id, claim.run, claim.attempt);
                Ok(Some(TickOutcome::LostClaim(claim.run)))
            }
            other => other.map(Some),
        }
    }

    fn process(&mut self, claim: &ClaimedRun) -> anyhow::Result<ProcessOutput> {
        let snapshot = claim
            .params
            .snapshot_id()
            .map(|id| self.store.get_snapshot(id))
            .transpose()?;
        let processor = self
            .processors
            .get_mut(&claim.run.kind)
            .ok_or_else(|| anyhow::anyhow!("no processor registered for {}", claim.run.kind))?;
        let mut ctx = RunContext::new(
            &self.store,
            claim,
            self.clock.as_ref(),
            self.queue.heartbeat_interval(),
            snapshot,
        );
        let started = Instant::now();
        let output = processor.process(&mut ctx);
        log::debug!(
            "worker={} processed {} in {:?}",
            self.worker_id,
            claim.run,
            started.elapsed()
        );
        output
    }

    /// Persist artifacts and results, then mark the run succeeded, as one unit.
    /// Pinned upstream artifacts become lineage edges of every output.
    fn finish(&self, claim: &ClaimedRun, output: ProcessOutput) -> LineageResult<()> {
        let now = self.clock.now();
        let pinned = claim.params.pinned_inputs();
        self.store.atomically(|s| {
            for mut artifact in output.artifacts {
                for (role, id) in &pinned {
                    if !artifact.inputs.iter().any(|i| i.role == *role) {
                        artifact = artifact.with_input(role, id);
                    }
                }
                s.put_artifact(&claim.run, &artifact, now)?;
            }
            if let Some(result) = &output.evaluation_result {
                if claim.run.kind != RunKind::SuiteEvaluation {
                    return Err(LineageError::invalid(
                        "evaluationResult",
                        format!("{} runs do not carry evaluation results", claim.run.kind),
                    ));
                }
                s.record_evaluation_result(&claim.run.id, result, now)?;
            }
            s.complete(claim, &RunOutcome::Succeeded, now)
        })
    }

    fn fail(&self, claim: &ClaimedRun, error: String) -> LineageResult<TickOutcome> {
        let now = self.clock.now();
        match self.retry.decide(claim.attempt, now, &mut rand::thread_rng()) {
            RetryDecision::RetryAt(available_at) => {
                self.store.schedule_retry(claim, &error, available_at, now)?;
                Ok(TickOutcome::RetryScheduled { run: claim.run.clone(), available_at })
            }
            RetryDecision::GiveUp => {
                self.store
                    .complete(claim, &RunOutcome::Failed { error: error.clone() }, now)?;
                Ok(TickOutcome::Failed { run: claim.run.clone(), error })
            }
        }
    }

    /// Fail a run whose previous owners all went stale, without processing it.
    fn abandon(&self, claim: &ClaimedRun, now: DateTime<Utc>) -> LineageResult<TickOutcome> {
        let error = format!(
            "abandoned after {} attempts; last owner {}",
            self.retry.max_attempts(),
            claim.reclaimed_from.as_deref().unwrap_or("unknown")
        );
        match self
            .store
            .complete(claim, &RunOutcome::Failed { error: error.clone() }, now)
        {
            Ok(()) => {
                log::warn!("worker={} {} {error}", self.worker_id, claim.run);
                Ok(TickOutcome::Failed { run: claim.run.clone(), error })
            }
            Err(LineageError::LostClaim { .. }) => Ok(TickOutcome::LostClaim(claim.run.clone())),
            Err(e) => Err(e),
        }
    }

    /// Poll until `token` is cancelled. Store errors are logged and the
    /// loop keeps going.
    pub fn run(&mut self, token: &CancellationToken) {
        log::info!(
            "worker={} started; kinds={:?}",
            self.worker_id,
            self.processors.keys().map(|k| k.as_str()).collect::<Vec<_>>()
        );
        while !token.is_cancelled() {
            match self.tick() {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => log::error!("worker={} tick failed: {e}", self.worker_id),
            }
            sleep_unless_cancelled(self.queue.poll_interval(), token);
        }
        log::info!("worker={} stopped", self.worker_id);
    }
}

fn is_lost_claim(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<LineageError>(), Some(LineageError::LostClaim { .. }))
}

fn sleep_unless_cancelled(total: Duration, token: &CancellationToken) {
    let deadline = Instant::now() + total;
    while !token.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
