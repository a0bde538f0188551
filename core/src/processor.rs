//! The seam between the worker loop and the engines that do the work.
//!
//! A `RunProcessor` handles one run kind. It receives a `RunContext` bound
//! to the current claim and returns the artifacts (and, for evaluations, the
//! realized results) the worker persists on success.

use crate::{
    artifact::{Artifact, ArtifactKind, ArtifactSummary, LineageInput, NewArtifact},
    clock::Clock,
    config::ProcessorCommand,
    error::LineageResult,
    payload::RunParams,
    run::{ClaimedRun, ProgressUpdate},
    snapshot::Snapshot,
    store::LineageStore,
    suite::EvaluationResult,
    types::RunKind,
};
use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration as StdDuration;

/// What a successful processing attempt produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub artifacts: Vec<NewArtifact>,
    pub evaluation_result: Option<EvaluationResult>,
}

pub trait RunProcessor: Send {
    fn kind(&self) -> RunKind;
    fn process(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<ProcessOutput>;
}

/// Per-claim handle given to a processor.
pub struct RunContext<'a> {
    store: &'a LineageStore,
    claim: &'a ClaimedRun,
    clock: &'a dyn Clock,
    heartbeat_interval: Duration,
    last_heartbeat: DateTime<Utc>,
    snapshot: Option<Snapshot>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        store: &'a LineageStore,
        claim: &'a ClaimedRun,
        clock: &'a dyn Clock,
        heartbeat_interval: Duration,
        snapshot: Option<Snapshot>,
    ) -> Self {
        Self {
            store,
            claim,
            clock,
            heartbeat_interval,
            last_heartbeat: claim.claimed_at,
            snapshot,
        }
    }

    pub fn claim(&self) -> &ClaimedRun {
        self.claim
    }

    pub fn params(&self) -> &RunParams {
        &self.claim.params
    }

    /// The pinned pool snapshot, for kinds that carry one.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// The pinned upstream artifacts, by role.
    pub fn input_artifacts(&self) -> LineageResult<Vec<(&'static str, Artifact)>> {
        self.claim
            .params
            .pinned_inputs()
            .into_iter()
            .map(|(role, id)| Ok((role, self.store.get_artifact(id)?)))
            .collect()
    }

    /// Report progress. Doubles as a heartbeat, so a processor that reports
    /// regularly never needs to call `heartbeat` itself.
    pub fn progress(&mut self, percent: f64, phase: Option<&str>, message: Option<&str>) -> LineageResult<()> {
        let update = ProgressUpdate::new(percent, phase, message);
        update.validate()?;
        let now = self.clock.now();
        let claim = self.claim;
        self.store.atomically(|s| {
            s.heartbeat(claim, now)?;
            s.report_progress(&claim.run, &update, &claim.worker_id, now)
        })?;
        self.last_heartbeat = now;
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Refresh the claim if `heartbeat_interval` has passed since the last one.
    pub fn heartbeat(&mut self) -> LineageResult<()> {
        let now = self.clock.now();
        if now - self.last_heartbeat < self.heartbeat_interval {
            return Ok(());
        }
        self.store.heartbeat(self.claim, now)?;
        self.last_heartbeat = now;
        log::debug!("worker={} heartbeat {}", self.claim.worker_id, self.claim.run);
        Ok(())
    }
}

// ── External command bridge ────────────────────────────────────────────

/// Document written to the engine's stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessorInput<'a> {
    run_kind: RunKind,
    run_id: &'a str,
    attempt: u32,
    params: &'a RunParams,
    snapshot: Option<&'a Snapshot>,
    inputs: Vec<InputArtifact>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InputArtifact {
    role: &'static str,
    artifact_id: String,
    artifact_kind: ArtifactKind,
    storage_uri: Option<String>,
    summary: Option<ArtifactSummary>,
}

/// One artifact as declared on the engine's `result` line.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactOutput {
    pub artifact_kind: String,
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub storage_uri: Option<String>,
    #[serde(default)]
    pub summary: Option<Value>,
    #[serde(default)]
    pub inputs: Vec<LineageInput>,
}

impl ArtifactOutput {
    pub fn into_new_artifact(self) -> LineageResult<NewArtifact> {
        let kind: ArtifactKind = self.artifact_kind.parse()?;
        let mut artifact = NewArtifact::new(kind);
        if let Some(version) = self.schema_version {
            artifact.schema_version = version;
        }
        if let Some(summary) = self.summary {
            artifact.summary = Some(ArtifactSummary::decode(kind, artifact.schema_version, summary)?);
        }
        artifact.storage_uri = self.storage_uri;
        artifact.inputs = self.inputs;
        artifact.validate()?;
        Ok(artifact)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    #[serde(default)]
    pub artifacts: Vec<ArtifactOutput>,
    #[serde(default)]
    pub evaluation_result: Option<EvaluationResult>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    pub percent: f64,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One stdout line of the engine protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorMessage {
    Progress(ProgressMessage),
    Heartbeat,
    Result(ResultMessage),
}

/// Parse one stdout line. Lines that are not JSON objects are engine
/// chatter and yield `None`.
pub fn parse_line(line: &str) -> LineageResult<Option<ProcessorMessage>> {
    let line = line.trim();
    if !line.starts_with('{') {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Runs a configured program per claim and speaks the JSON-lines protocol
/// over its stdin and stdout.
pub struct CommandProcessor {
    kind: RunKind,
    command: ProcessorCommand,
}

impl CommandProcessor {
    pub fn new(kind: RunKind, command: ProcessorCommand) -> Self {
        Self { kind, command }
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.command.program))
    }

    fn input_document(ctx: &RunContext<'_>) -> anyhow::Result<Vec<u8>> {
        let inputs = ctx
            .input_artifacts()?
            .into_iter()
            .map(|(role, a)| InputArtifact {
                role,
                artifact_id: a.id,
                artifact_kind: a.artifact_kind,
                storage_uri: a.storage_uri,
                summary: a.summary,
            })
            .collect();
        let claim = ctx.claim();
        let doc = ProcessorInput {
            run_kind: claim.run.kind,
            run_id: &claim.run.id,
            attempt: claim.attempt,
            params: &claim.params,
            snapshot: ctx.snapshot(),
            inputs,
        };
        Ok(serde_json::to_vec(&doc)?)
    }
}

/// Fallback wait between heartbeats when the interval is not representable.
const DEFAULT_LINE_WAIT: StdDuration = StdDuration::from_secs(1);

/// Relay the engine's stdout protocol into `ctx`. Lines arrive through a
/// reader thread so the claim keeps being heartbeated while the engine is
/// silent.
fn drive(child: &mut Child, ctx: &mut RunContext<'_>) -> anyhow::Result<Option<ResultMessage>> {
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("engine stdout unavailable"))?;
    let (tx, rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
    let wait = ctx.heartbeat_interval().to_std().unwrap_or(DEFAULT_LINE_WAIT);

    let mut result = None;
    let mut n = 0usize;
    loop {
        let line = match rx.recv_timeout(wait) {
            Ok(line) => line?,
            Err(RecvTimeoutError::Timeout) => {
                ctx.heartbeat()?;
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        n += 1;
        let message = parse_line(&line).with_context(|| format!("engine output line {n}"))?;
        match message {
            None => log::debug!("engine: {line}"),
            Some(ProcessorMessage::Progress(p)) => {
                ctx.progress(p.percent, p.phase.as_deref(), p.message.as_deref())?
            }
            Some(ProcessorMessage::Heartbeat) => ctx.heartbeat()?,
            Some(ProcessorMessage::Result(r)) => {
                if result.is_some() {
                    bail!("engine emitted more than one result line");
                }
                result = Some(r);
            }
        }
    }
    reader.join().map_err(|_| anyhow!("engine stdout reader panicked"))?;
    Ok(result)
}

impl RunProcessor for CommandProcessor {
    fn kind(&self) -> RunKind {
        self.kind
    }

    fn process(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<ProcessOutput> {
        let input = Self::input_document(ctx)?;
        let mut child = self.spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("engine stdin unavailable"))?;
        stdin.write_all(&input).context("failed to write engine input")?;
        drop(stdin);

        let mut stderr = child.stderr.take().ok_or_else(|| anyhow!("engine stderr unavailable"))?;
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        });

        let driven = drive(&mut child, ctx);
        if driven.is_err() {
            let _ = child.kill();
        }
        let status = child.wait().context("failed to wait for engine")?;
        let stderr = stderr_reader.join().unwrap_or_default();
        let result = driven?;

        if !status.success() {
            let tail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            bail!("{} exited with {status}: {tail}", self.command.program);
        }
        let result = result.ok_or_else(|| anyhow!("{} exited without a result line", self.command.program))?;
        let artifacts = result
            .artifacts
            .into_iter()
            .map(ArtifactOutput::into_new_artifact)
            .collect::<LineageResult<Vec<_>>>()?;
        Ok(ProcessOutput { artifacts, evaluation_result: result.evaluation_result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_and_heartbeat_lines() {
        let msg = parse_line(r#"{"type":"progress","percent":40,"phase":"simulate"}"#)
            .unwrap()
            .unwrap();
        match msg {
            ProcessorMessage::Progress(p) => {
                assert_eq!(p.percent, 40.0);
                assert_eq!(p.phase.as_deref(), Some("simulate"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse_line(r#"{"type":"heartbeat"}"#).unwrap(),
            Some(ProcessorMessage::Heartbeat)
        ));
    }

    #[test]
    fn chatter_lines_are_skipped() {
        assert!(parse_line("loading bracket...").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_line(r#"{"type":"progress""#).is_err());
        assert!(parse_line(r#"{"type":"explode"}"#).is_err());
    }

    #[test]
    fn result_line_decodes_typed_summaries() {
        let line = r#"{"type":"result","artifacts":[{"artifactKind":"simulated_outcomes",
            "storageUri":"s3://sims/1.parquet","summary":{"nSims":100,"seed":1,"teamCount":64}}],
            "evaluationResult":null}"#
            .replace('\n', " ");
        let Some(ProcessorMessage::Result(result)) = parse_line(&line).unwrap() else {
            panic!("expected result line");
        };
        let artifact = result.artifacts[0].clone().into_new_artifact().unwrap();
        assert_eq!(artifact.artifact_kind, ArtifactKind::SimulatedOutcomes);
        assert_eq!(artifact.storage_uri.as_deref(), Some("s3://sims/1.parquet"));
        assert!(matches!(artifact.summary, Some(ArtifactSummary::SimulatedOutcomes(_))));
    }

    #[test]
    fn result_line_rejects_summary_of_wrong_shape() {
        let output = ArtifactOutput {
            artifact_kind: "predicted_market_share".into(),
            schema_version: None,
            storage_uri: None,
            summary: Some(serde_json::json!({"nSims": 1})),
            inputs: Vec::new(),
        };
        assert!(output.into_new_artifact().is_err());
    }
}
