//! Persisted run artifacts for external reporting.
//!
//! Layout under the run directory:
//! - `findings.jsonl`: one deduplicated finding per line with its attribution tags
//! - `metrics.json`: per-goal and per-hypothesis status, timing, cost, counts
//! - `events.jsonl`: the append-only event log, written live during the run
//! - `report.md`: the rendered outline report

use crate::budget::BudgetSnapshot;
use crate::engine::ResearchRun;
use crate::error::{DelveError, FailureReason};
use crate::findings::Finding;
use crate::goal::{ExecutionPath, GoalId, GoalResult, GoalStatus};
use crate::hypothesis::{HypothesisId, HypothesisMetrics, HypothesisStatus, StopReason};
use crate::report::ReportGenerator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const FINDINGS_FILE: &str = "findings.jsonl";
pub const METRICS_FILE: &str = "metrics.json";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const REPORT_FILE: &str = "report.md";

/// Where a run's artifacts were written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub findings: PathBuf,
    pub metrics: PathBuf,
    pub events: PathBuf,
    pub report: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            findings: dir.join(FINDINGS_FILE),
            metrics: dir.join(METRICS_FILE),
            events: dir.join(EVENTS_FILE),
            report: dir.join(REPORT_FILE),
        }
    }
}

/// Run-level metrics export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: Uuid,
    pub question: String,
    pub status: GoalStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub findings: usize,
    pub peak_concurrency: usize,
    pub budget: BudgetSnapshot,
    pub goals: Vec<GoalMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalMetrics {
    pub goal_id: GoalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<GoalId>,
    pub depth: usize,
    pub statement: String,
    pub status: GoalStatus,
    pub path: String,
    pub findings: usize,
    pub cost_usd: f64,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hypotheses: Vec<HypothesisRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisRow {
    pub id: HypothesisId,
    pub statement: String,
    pub status: HypothesisStatus,
    #[serde(flatten)]
    pub metrics: HypothesisMetrics,
}

impl GoalMetrics {
    fn from_node(node: &GoalResult) -> Self {
        let path = match &node.path {
            ExecutionPath::NotStarted => "not_started",
            ExecutionPath::Executed => "executed",
            ExecutionPath::Forced { .. } => "forced",
            ExecutionPath::Decomposed { .. } => "decomposed",
        };
        Self {
            goal_id: node.goal.id.clone(),
            parent: node.goal.parent.clone(),
            depth: node.goal.depth,
            statement: node.goal.statement.clone(),
            status: node.status(),
            path: path.to_string(),
            findings: node.goal.findings.len(),
            cost_usd: node.goal.cost_usd,
            elapsed_ms: node.elapsed_ms,
            failure: node.failure.clone(),
            errors: node.errors.clone(),
            stop_reason: node.stop_reason.clone(),
            hypotheses: node
                .hypotheses
                .iter()
                .map(|h| HypothesisRow {
                    id: h.id,
                    statement: h.statement.clone(),
                    status: h.status,
                    metrics: h.metrics.clone(),
                })
                .collect(),
        }
    }
}

impl RunMetrics {
    pub fn from_run(run: &ResearchRun) -> Self {
        Self {
            run_id: run.run_id,
            question: run.question.clone(),
            status: run.status(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            findings: run.findings().len(),
            peak_concurrency: run.peak_concurrency,
            budget: run.budget.clone(),
            goals: run
                .root
                .walk()
                .into_iter()
                .map(GoalMetrics::from_node)
                .collect(),
        }
    }
}

/// Write one finding per line.
pub fn write_findings(path: &Path, findings: &[Finding]) -> Result<(), DelveError> {
    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    for finding in findings {
        serde_json::to_writer(&mut writer, finding)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the findings export, the metrics export, and the report into `dir`.
/// The event log is already there.
pub fn write_all(dir: &Path, run: &ResearchRun) -> Result<ArtifactPaths, DelveError> {
    std::fs::create_dir_all(dir)?;
    let paths = ArtifactPaths::in_dir(dir);

    write_findings(&paths.findings, run.findings())?;
    let metrics = serde_json::to_string_pretty(&RunMetrics::from_run(run))?;
    std::fs::write(&paths.metrics, metrics)?;
    std::fs::write(&paths.report, ReportGenerator::render(run))?;

    tracing::info!(dir = %dir.display(), "Wrote run artifacts");
    Ok(paths)
}
