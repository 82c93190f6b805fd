//! Top-level research run.
//!
//! [`ResearchEngine::run`] never fails: whatever happens below the root is
//! recorded as per-node status on the returned tree. Artifact persistence
//! errors are logged and leave `artifacts` empty.

use crate::artifacts::{self, ArtifactPaths, EVENTS_FILE};
use crate::budget::BudgetSnapshot;
use crate::config::ResearchConfig;
use crate::context::RunContext;
use crate::error::ConfigError;
use crate::events::{EventLog, EventSink, JsonlEventSink, ResearchEvent};
use crate::findings::Finding;
use crate::goal::{Goal, GoalResult, GoalStatus};
use crate::oracle::Oracle;
use crate::scheduler::GoalScheduler;
use crate::sources::SourceRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// The complete outcome of one research question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRun {
    pub run_id: Uuid,
    pub question: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub root: GoalResult,
    pub budget: BudgetSnapshot,
    /// Highest number of simultaneous oracle/source calls.
    pub peak_concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactPaths>,
}

impl ResearchRun {
    pub fn status(&self) -> GoalStatus {
        self.root.status()
    }

    /// Deduplicated findings of the whole tree.
    pub fn findings(&self) -> &[Finding] {
        &self.root.goal.findings
    }

    /// Nodes that ended failed or cancelled, in depth-first order.
    pub fn unsuccessful(&self) -> Vec<&GoalResult> {
        self.root
            .walk()
            .into_iter()
            .filter(|node| node.status() != GoalStatus::Synthesized)
            .collect()
    }
}

/// Entry point wiring the oracle, the sources, and the configuration together.
pub struct ResearchEngine {
    config: ResearchConfig,
    oracle: Arc<dyn Oracle>,
    registry: SourceRegistry,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl ResearchEngine {
    pub fn new(
        config: ResearchConfig,
        oracle: Arc<dyn Oracle>,
        registry: SourceRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if registry.is_empty() {
            tracing::warn!("No sources registered; every search will fail");
        }
        Ok(Self {
            config,
            oracle,
            registry,
            sinks: Vec::new(),
        })
    }

    /// Receive every event of every run.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Research `question` under a fresh budget.
    pub async fn run(&self, question: &str) -> ResearchRun {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let run_dir = self
            .config
            .artifacts_dir
            .as_ref()
            .map(|dir| dir.join(run_id.to_string()));

        let mut events = EventLog::new(run_id);
        for sink in &self.sinks {
            events = events.with_sink(sink.clone());
        }
        if let Some(dir) = &run_dir {
            match JsonlEventSink::open(&dir.join(EVENTS_FILE)) {
                Ok(sink) => events = events.with_sink(Arc::new(sink)),
                Err(e) => tracing::warn!(
                    dir = %dir.display(),
                    error = %e,
                    "Failed to open event log; continuing without it"
                ),
            }
        }
        let events = Arc::new(events);

        let ctx = Arc::new(RunContext::new(
            self.config.clone(),
            self.oracle.clone(),
            self.registry.clone(),
            events.clone(),
        ));
        tracing::info!(
            run_id = %run_id,
            question = %question,
            oracle = ctx.oracle.name(),
            sources = ?ctx.gateway.registry().ids(),
            "Starting research run"
        );
        events.emit(ResearchEvent::RunStarted {
            question: question.to_string(),
        });

        let scheduler = GoalScheduler::new(ctx.clone());
        let root = scheduler
            .pursue_goal(Goal::root(question), Vec::new(), Vec::new())
            .await;

        events.emit(ResearchEvent::RunFinished {
            status: root.status(),
            findings: root.goal.findings.len(),
            cost_usd: ctx.budget.cost_usd(),
            goals: root.node_count(),
        });
        tracing::info!(
            run_id = %run_id,
            status = %root.status(),
            findings = root.goal.findings.len(),
            goals = root.node_count(),
            cost_usd = ctx.budget.cost_usd(),
            "Research run finished"
        );

        let mut run = ResearchRun {
            run_id,
            question: question.to_string(),
            started_at,
            finished_at: Utc::now(),
            root,
            budget: ctx.budget.snapshot(),
            peak_concurrency: ctx.limiter.peak(),
            artifacts: None,
        };

        if let Some(dir) = run_dir {
            match artifacts::write_all(&dir, &run) {
                Ok(paths) => run.artifacts = Some(paths),
                Err(e) => tracing::warn!(
                    dir = %dir.display(),
                    error = %e,
                    "Failed to write run artifacts"
                ),
            }
        }
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockOracle;
    use crate::sources::{MockSource, RawResult, SourceId};

    #[test]
    fn test_invalid_config_rejected() {
        let config = ResearchConfig {
            max_concurrent_units: 0,
            ..Default::default()
        };
        let result = ResearchEngine::new(config, Arc::new(MockOracle::new()), SourceRegistry::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_simple_run_synthesizes() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(MockSource::new(SourceId::Web).with_results(vec![
            RawResult::new("Acme annual report", Some("https://acme.example/report")),
        ])));
        let engine =
            ResearchEngine::new(ResearchConfig::default(), Arc::new(MockOracle::new()), registry)
                .unwrap();
        let run = engine.run("What does Acme sell?").await;
        assert_eq!(run.status(), GoalStatus::Synthesized);
        assert_eq!(run.findings().len(), 1);
        assert!(run.unsuccessful().is_empty());
        assert!(run.artifacts.is_none());
    }
}
