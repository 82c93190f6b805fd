//! Append-only structured event log for a research run.
//!
//! One event per scheduler decision (assessment, decomposition, hypothesis
//! start/finish, coverage decision, retry, ...). Events are fanned out to sinks;
//! [`JsonlEventSink`] appends one JSON object per line and never rewrites.

use crate::classify::ErrorKind;
use crate::coverage::CoverageVerdict;
use crate::error::{BudgetDimension, FailureReason};
use crate::goal::{GoalId, GoalStatus};
use crate::hypothesis::{HypothesisId, HypothesisStatus, StopReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// A scheduler decision or lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResearchEvent {
    RunStarted {
        question: String,
    },
    GoalStarted {
        goal_id: GoalId,
        depth: usize,
        statement: String,
    },
    BudgetExceeded {
        goal_id: GoalId,
        dimension: BudgetDimension,
    },
    CycleDetected {
        goal_id: GoalId,
        ancestor: GoalId,
        similarity: f64,
    },
    Assessment {
        goal_id: GoalId,
        action: String,
        sub_goals: usize,
        /// Set when the verdict was not taken from the oracle.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        override_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
    },
    Decomposition {
        goal_id: GoalId,
        tiers: Vec<Vec<GoalId>>,
    },
    DependencyGap {
        goal_id: GoalId,
        prerequisite: GoalId,
        status: GoalStatus,
    },
    HypothesisStarted {
        goal_id: GoalId,
        hypothesis: HypothesisId,
        statement: String,
    },
    HypothesisFinished {
        goal_id: GoalId,
        hypothesis: HypothesisId,
        status: HypothesisStatus,
        kept: usize,
        elapsed_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FailureReason>,
    },
    CoverageDecision {
        goal_id: GoalId,
        after_hypothesis: HypothesisId,
        verdict: CoverageVerdict,
        new_findings: usize,
        duplicate_findings: usize,
        new_entities: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
        fallback: bool,
    },
    HypothesesStopped {
        goal_id: GoalId,
        executed: usize,
        reason: StopReason,
    },
    Retry {
        unit: String,
        attempt: u32,
        kind: ErrorKind,
        backoff_ms: u64,
        reformulated: bool,
    },
    GoalFinished {
        goal_id: GoalId,
        status: GoalStatus,
        findings: usize,
        cost_usd: f64,
        elapsed_ms: u64,
    },
    RunFinished {
        status: GoalStatus,
        findings: usize,
        cost_usd: f64,
        goals: usize,
    },
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ResearchEvent,
}

/// Destination for event records.
pub trait EventSink: Send + Sync {
    fn append(&self, record: &EventRecord);
}

/// Per-run event dispatcher.
pub struct EventLog {
    run_id: Uuid,
    seq: AtomicU64,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventLog {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            seq: AtomicU64::new(0),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn emit(&self, event: ResearchEvent) {
        let record = EventRecord {
            seq: self.seq.fetch_add(1, Ordering::AcqRel),
            run_id: self.run_id,
            timestamp: Utc::now(),
            event,
        };
        tracing::debug!(seq = record.seq, event = ?record.event, "research event");
        for sink in &self.sinks {
            sink.append(&record);
        }
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("run_id", &self.run_id)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Appends one JSON object per line to a file opened in append mode.
pub struct JsonlEventSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl EventSink for JsonlEventSink {
    fn append(&self, record: &EventRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize research event");
                return;
            }
        };
        let Ok(mut writer) = self.writer.lock() else {
            tracing::warn!("Event log writer poisoned; dropping event");
            return;
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            tracing::warn!(error = %e, "Failed to append research event");
        }
    }
}

/// Keeps events in memory; used by tests and the report renderer.
#[derive(Default)]
pub struct MemoryEventSink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<ResearchEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn append(&self, record: &EventRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}
