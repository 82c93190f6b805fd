//! Hypothesis Branching Engine.
//!
//! A directly-executed goal is explored through alternative search strategies.
//! In parallel mode every hypothesis runs at once and all finish. In sequential
//! ("coverage") mode they run one at a time and the [`CoverageAssessor`] votes
//! after each; the hypothesis ceiling and the per-goal time budget always win
//! over a `Continue` vote. A goal with no hypotheses falls back to one direct
//! search across the default sources.

use crate::budget::BudgetCheck;
use crate::config::HypothesisMode;
use crate::context::RunContext;
use crate::coverage::{CoverageAssessor, CoverageOutcome, CoverageProgress, CoverageVerdict};
use crate::error::{BudgetDimension, FailureReason};
use crate::events::ResearchEvent;
use crate::findings::{AttributionTag, Finding, FindingSet, merge};
use crate::goal::{DependencyInput, Goal, GoalId};
use crate::oracle::{CostMeter, HypothesisPlan, HypothesisSpec, QueryPlan, RelevanceVerdict};
use crate::sources::{RawResult, SourceId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Dense per-goal hypothesis index, displayed as `h0`, `h1`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HypothesisId(pub usize);

impl std::fmt::Display for HypothesisId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for HypothesisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What one hypothesis execution did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HypothesisMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub sources_attempted: Vec<SourceId>,
    /// Declared target names that did not resolve to a registered source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_sources: Vec<String>,
    pub raw_results: usize,
    pub kept_results: usize,
    pub elapsed_ms: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,
    /// Individual source calls that failed without failing the hypothesis.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_errors: Vec<FailureReason>,
}

/// An alternative search strategy for one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: HypothesisId,
    pub statement: String,
    pub signals: Vec<String>,
    pub expected_entities: Vec<String>,
    pub target_sources: Vec<String>,
    pub status: HypothesisStatus,
    pub metrics: HypothesisMetrics,
}

impl Hypothesis {
    pub fn from_spec(id: HypothesisId, spec: HypothesisSpec) -> Self {
        Self {
            id,
            statement: spec.statement,
            signals: spec.signals,
            expected_entities: spec.expected_entities,
            target_sources: spec.target_sources,
            status: HypothesisStatus::Pending,
            metrics: HypothesisMetrics::default(),
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        self.status = HypothesisStatus::Failed;
        self.metrics.error = Some(reason);
    }
}

/// Why a hypothesis run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopReason {
    /// The coverage assessor voted STOP.
    Coverage,
    /// `max_per_goal` hypotheses ran.
    HypothesisCeiling,
    /// The per-goal hypothesis time budget ran out.
    TimeBudget,
    /// Every planned hypothesis ran.
    Exhausted,
    /// The run-wide budget stopped new hypotheses.
    BudgetExceeded { dimension: BudgetDimension },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coverage => f.write_str("coverage assessor voted stop"),
            Self::HypothesisCeiling => f.write_str("hypothesis ceiling reached"),
            Self::TimeBudget => f.write_str("hypothesis time budget exhausted"),
            Self::Exhausted => f.write_str("all planned hypotheses ran"),
            Self::BudgetExceeded { dimension } => write!(f, "run budget exceeded: {dimension}"),
        }
    }
}

/// Outcome of exploring one goal.
#[derive(Debug, Clone, Default)]
pub struct HypothesisRun {
    pub hypotheses: Vec<Hypothesis>,
    /// Deduplicated findings with hypothesis (or goal) attribution.
    pub findings: Vec<Finding>,
    pub coverage: Vec<CoverageOutcome>,
    pub stop_reason: Option<StopReason>,
    /// Recovered errors (fallbacks, failed direct searches).
    pub errors: Vec<FailureReason>,
    /// True when the goal fell back to a single direct search.
    pub direct: bool,
}

pub struct HypothesisEngine {
    ctx: Arc<RunContext>,
    assessor: CoverageAssessor,
}

impl HypothesisEngine {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        let assessor = CoverageAssessor::new(ctx.oracle.clone());
        Self { ctx, assessor }
    }

    /// Explore `goal` according to the configured hypothesis mode.
    pub async fn run(
        &self,
        goal: &Goal,
        dependencies: &[DependencyInput],
        meter: &CostMeter,
    ) -> HypothesisRun {
        let mode = self.ctx.config.hypotheses.mode;
        let mut run = HypothesisRun::default();

        let specs = if mode == HypothesisMode::Off {
            Vec::new()
        } else {
            self.generate(goal, dependencies, meter, &mut run.errors).await
        };

        if specs.is_empty() || !mode.executes_hypotheses() {
            run.hypotheses = specs
                .into_iter()
                .enumerate()
                .map(|(i, spec)| Hypothesis::from_spec(HypothesisId(i), spec))
                .collect();
            let (findings, errors) = self.direct_search(goal, meter).await;
            run.findings = findings;
            run.errors.extend(errors);
            run.direct = true;
            return run;
        }

        match mode {
            HypothesisMode::Parallel => self.run_parallel(goal, specs, meter, &mut run).await,
            _ => self.run_sequential(goal, specs, meter, &mut run).await,
        }
        run
    }

    /// Ask the oracle for strategies. Falls back to none on failure.
    async fn generate(
        &self,
        goal: &Goal,
        dependencies: &[DependencyInput],
        meter: &CostMeter,
        errors: &mut Vec<FailureReason>,
    ) -> Vec<HypothesisSpec> {
        let max = self.ctx.config.hypotheses.max_per_goal;
        let available: Vec<&str> = self
            .ctx
            .gateway
            .registry()
            .ids()
            .into_iter()
            .map(SourceId::as_str)
            .collect();
        let context = serde_json::json!({
            "goal": goal.statement,
            "goal_id": goal.id,
            "max_hypotheses": max,
            "available_sources": available,
            "dependency_inputs": dependencies,
        });
        match self.ctx.oracle.decide::<HypothesisPlan>(&context, meter).await {
            Ok(plan) => {
                let mut specs = plan.hypotheses;
                if specs.len() > max {
                    tracing::debug!(
                        goal_id = %goal.id,
                        proposed = specs.len(),
                        max,
                        "Truncating hypothesis plan"
                    );
                    specs.truncate(max);
                }
                specs
            }
            Err(reason) => {
                tracing::warn!(
                    goal_id = %goal.id,
                    reason = %reason,
                    "Hypothesis generation failed; falling back to direct search"
                );
                errors.push(reason);
                Vec::new()
            }
        }
    }

    async fn run_sequential(
        &self,
        goal: &Goal,
        specs: Vec<HypothesisSpec>,
        meter: &CostMeter,
        run: &mut HypothesisRun,
    ) {
        let max = self.ctx.config.hypotheses.max_per_goal;
        let planned = specs.len();
        let deadline = Instant::now() + self.ctx.config.hypotheses.time_budget();
        let mut accumulated = FindingSet::new();
        let mut stop = StopReason::Exhausted;

        for (index, spec) in specs.into_iter().enumerate() {
            if index >= max {
                stop = StopReason::HypothesisCeiling;
                break;
            }
            if let BudgetCheck::Exceeded(dimension) = self.ctx.budget.check_running() {
                stop = StopReason::BudgetExceeded { dimension };
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                stop = StopReason::TimeBudget;
                break;
            }

            let id = HypothesisId(index);
            let statement = spec.statement.clone();
            let (hypothesis, findings) = self.execute_bounded(goal, id, spec, meter, remaining).await;
            let timed_out = matches!(
                hypothesis.metrics.error,
                Some(FailureReason::Timeout { .. })
            );
            run.hypotheses.push(hypothesis);

            if timed_out {
                accumulated.extend(findings);
                stop = StopReason::TimeBudget;
                break;
            }

            let executed = index + 1;
            if executed == planned {
                accumulated.extend(findings);
                stop = if executed >= max {
                    StopReason::HypothesisCeiling
                } else {
                    StopReason::Exhausted
                };
                break;
            }

            let progress = CoverageProgress {
                executed,
                max_hypotheses: max,
                time_remaining_ms: deadline.saturating_duration_since(Instant::now()).as_millis()
                    as u64,
                budget: self.ctx.budget.snapshot(),
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let vote = tokio::time::timeout(
                remaining,
                self.assessor.assess(
                    &goal.statement,
                    id,
                    &statement,
                    &findings,
                    &accumulated,
                    &progress,
                    meter,
                ),
            )
            .await;
            accumulated.extend(findings);

            let Ok(outcome) = vote else {
                stop = StopReason::TimeBudget;
                break;
            };
            self.ctx.events.emit(ResearchEvent::CoverageDecision {
                goal_id: goal.id.clone(),
                after_hypothesis: id,
                verdict: outcome.verdict,
                new_findings: outcome.delta.new_findings,
                duplicate_findings: outcome.delta.duplicate_findings,
                new_entities: outcome.delta.new_entities,
                score: outcome.coverage_score,
                fallback: outcome.fallback,
            });
            let verdict = outcome.verdict;
            run.coverage.push(outcome);
            if verdict == CoverageVerdict::Stop {
                stop = StopReason::Coverage;
                break;
            }
        }

        tracing::info!(
            goal_id = %goal.id,
            executed = run.hypotheses.len(),
            planned,
            reason = %stop,
            "Sequential hypotheses stopped"
        );
        self.ctx.events.emit(ResearchEvent::HypothesesStopped {
            goal_id: goal.id.clone(),
            executed: run.hypotheses.len(),
            reason: stop.clone(),
        });
        run.stop_reason = Some(stop);
        run.findings = accumulated.into_vec();
    }

    async fn run_parallel(
        &self,
        goal: &Goal,
        specs: Vec<HypothesisSpec>,
        meter: &CostMeter,
        run: &mut HypothesisRun,
    ) {
        let budget = self.ctx.config.hypotheses.time_budget();
        let outcomes = join_all(
            specs
                .into_iter()
                .enumerate()
                .map(|(i, spec)| self.execute_bounded(goal, HypothesisId(i), spec, meter, budget)),
        )
        .await;

        let mut findings = Vec::new();
        for (hypothesis, kept) in outcomes {
            run.hypotheses.push(hypothesis);
            findings.extend(kept);
        }
        self.ctx.events.emit(ResearchEvent::HypothesesStopped {
            goal_id: goal.id.clone(),
            executed: run.hypotheses.len(),
            reason: StopReason::Exhausted,
        });
        run.stop_reason = Some(StopReason::Exhausted);
        run.findings = merge(findings);
    }

    /// Run one hypothesis, abandoning it if `limit` elapses first.
    ///
    /// Oracle spend is charged to the goal whether or not the hypothesis
    /// finishes in time.
    async fn execute_bounded(
        &self,
        goal: &Goal,
        id: HypothesisId,
        spec: HypothesisSpec,
        goal_meter: &CostMeter,
        limit: Duration,
    ) -> (Hypothesis, Vec<Finding>) {
        let started = Instant::now();
        let meter = CostMeter::new();
        let fallback = Hypothesis::from_spec(id, spec.clone());
        let outcome = tokio::time::timeout(limit, self.execute_one(goal, id, spec, &meter)).await;
        goal_meter.add(meter.total_usd());
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let mut hypothesis = fallback;
                hypothesis.metrics.elapsed_ms = elapsed_ms;
                hypothesis.metrics.cost_usd = meter.total_usd();
                hypothesis.fail(FailureReason::Timeout { elapsed_ms });
                tracing::warn!(goal_id = %goal.id, hypothesis = %id, elapsed_ms, "Hypothesis timed out");
                self.emit_finished(&goal.id, &hypothesis);
                (hypothesis, Vec::new())
            }
        }
    }

    /// Execute one hypothesis: query generation, source dispatch, relevance filtering.
    ///
    /// Spend accrues on `meter` as each oracle call completes.
    async fn execute_one(
        &self,
        goal: &Goal,
        id: HypothesisId,
        spec: HypothesisSpec,
        meter: &CostMeter,
    ) -> (Hypothesis, Vec<Finding>) {
        let started = Instant::now();
        let mut hypothesis = Hypothesis::from_spec(id, spec);
        hypothesis.status = HypothesisStatus::Running;
        self.ctx.events.emit(ResearchEvent::HypothesisStarted {
            goal_id: goal.id.clone(),
            hypothesis: id,
            statement: hypothesis.statement.clone(),
        });

        let kept = self.explore(goal, &mut hypothesis, meter).await;

        hypothesis.metrics.elapsed_ms = started.elapsed().as_millis() as u64;
        hypothesis.metrics.cost_usd = meter.total_usd();
        hypothesis.metrics.kept_results = kept.len();
        if hypothesis.status == HypothesisStatus::Running {
            hypothesis.status = HypothesisStatus::Succeeded;
        }
        self.emit_finished(&goal.id, &hypothesis);
        (hypothesis, kept)
    }

    async fn explore(
        &self,
        goal: &Goal,
        hypothesis: &mut Hypothesis,
        meter: &CostMeter,
    ) -> Vec<Finding> {
        let registry = self.ctx.gateway.registry();
        let (mut sources, unknown) = registry.resolve_all(&hypothesis.target_sources);
        if !unknown.is_empty() {
            tracing::info!(
                goal_id = %goal.id,
                hypothesis = %hypothesis.id,
                unknown = ?unknown,
                "Dropping unknown target sources"
            );
            hypothesis.metrics.unknown_sources = unknown;
        }
        if hypothesis.target_sources.is_empty() {
            sources = self.ctx.default_sources();
        }
        sources.retain(|id| {
            registry
                .get(*id)
                .is_some_and(|s| s.is_relevant(&goal.statement))
        });
        if sources.is_empty() {
            hypothesis.fail(FailureReason::HypothesisNoValidSources);
            return Vec::new();
        }
        hypothesis.metrics.sources_attempted = sources.clone();

        let plan = self.query_for(goal, hypothesis, &sources, meter).await;
        let plan = match plan {
            Ok(plan) => plan,
            Err(reason) => {
                hypothesis.fail(reason);
                return Vec::new();
            }
        };
        hypothesis.metrics.query = Some(plan.query.clone());

        let (raw, failures) = self.dispatch(&sources, &plan, meter).await;
        hypothesis.metrics.raw_results = raw.len();
        let all_failed = failures.len() == sources.len();
        if all_failed {
            if let Some(last) = failures.last() {
                hypothesis.fail(last.clone());
            }
        }
        hypothesis.metrics.source_errors = failures;
        if raw.is_empty() {
            return Vec::new();
        }

        let keep = self.filter_relevant(goal, hypothesis, &raw, meter).await;
        let tag = AttributionTag::hypothesis(goal.id.clone(), hypothesis.id);
        let kept: Vec<Finding> = raw
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, (source, result))| {
                let mut finding = Finding::from_raw(result, source, tag.clone());
                let text = format!("{} {}", finding.title, finding.snippet).to_lowercase();
                for entity in &hypothesis.expected_entities {
                    if text.contains(&entity.to_lowercase()) {
                        finding.add_entity(entity);
                    }
                }
                finding
            })
            .collect();
        merge(kept)
    }

    /// Generate the query; falls back to the statement plus signals.
    async fn query_for(
        &self,
        goal: &Goal,
        hypothesis: &Hypothesis,
        sources: &[SourceId],
        meter: &CostMeter,
    ) -> Result<QueryPlan, FailureReason> {
        let context = serde_json::json!({
            "goal": goal.statement,
            "hypothesis": hypothesis.statement,
            "signals": hypothesis.signals,
            "expected_entities": hypothesis.expected_entities,
            "sources": sources,
        });
        match self.ctx.oracle.decide::<QueryPlan>(&context, meter).await {
            Ok(plan) => Ok(plan),
            Err(reason @ FailureReason::BudgetExceeded { .. }) => Err(reason),
            Err(reason) => {
                tracing::warn!(
                    goal_id = %goal.id,
                    hypothesis = %hypothesis.id,
                    reason = %reason,
                    "Query generation failed; using statement and signals"
                );
                let mut query = hypothesis.statement.clone();
                for signal in &hypothesis.signals {
                    if !query.to_lowercase().contains(&signal.to_lowercase()) {
                        query.push(' ');
                        query.push_str(signal);
                    }
                }
                Ok(QueryPlan {
                    query,
                    filters: Default::default(),
                })
            }
        }
    }

    /// Query every source concurrently. Source failures are returned, not raised.
    ///
    /// A reformulation retry rewrites `plan.query`, the query that failed.
    async fn dispatch(
        &self,
        sources: &[SourceId],
        plan: &QueryPlan,
        meter: &CostMeter,
    ) -> (Vec<(SourceId, RawResult)>, Vec<FailureReason>) {
        let registry = self.ctx.gateway.registry();
        let limit = self.ctx.config.results_per_source;
        let reformulator = self.ctx.oracle.reformulator(meter);
        let calls = sources.iter().map(|&source| {
            let reformulator = &reformulator;
            async move {
                if let BudgetCheck::Exceeded(dimension) = self.ctx.budget.check_running() {
                    return Err(FailureReason::BudgetExceeded { dimension });
                }
                let mut params = match registry.get(source) {
                    Some(connector) => connector.generate_query(&plan.query),
                    None => crate::sources::SearchParams::new(&plan.query),
                };
                for (key, value) in &plan.filters {
                    params.filters.entry(key.clone()).or_insert_with(|| value.clone());
                }
                self.ctx
                    .gateway
                    .search(source, params, limit, Some(reformulator))
                    .await
                    .map_err(|failure| match self.ctx.budget.check_running() {
                        BudgetCheck::Exceeded(dimension) => FailureReason::BudgetExceeded { dimension },
                        BudgetCheck::Ok => failure.reason(),
                    })
            }
        });

        let mut raw = Vec::new();
        let mut failures = Vec::new();
        for (source, outcome) in sources.iter().zip(join_all(calls).await) {
            match outcome {
                Ok(response) => raw.extend(response.results.into_iter().map(|r| (*source, r))),
                Err(reason) => failures.push(reason),
            }
        }
        (raw, failures)
    }

    /// Indices of `raw` worth keeping. Falls back to keeping everything.
    async fn filter_relevant(
        &self,
        goal: &Goal,
        hypothesis: &Hypothesis,
        raw: &[(SourceId, RawResult)],
        meter: &CostMeter,
    ) -> Vec<usize> {
        let candidates: Vec<serde_json::Value> = raw
            .iter()
            .enumerate()
            .map(|(index, (source, r))| {
                serde_json::json!({
                    "index": index,
                    "source": source,
                    "title": r.title,
                    "snippet": r.snippet,
                })
            })
            .collect();
        let context = serde_json::json!({
            "goal": goal.statement,
            "hypothesis": hypothesis.statement,
            "candidates": candidates,
        });
        match self.ctx.oracle.decide::<RelevanceVerdict>(&context, meter).await {
            Ok(verdict) => {
                let (valid, invalid): (Vec<usize>, Vec<usize>) =
                    verdict.keep.into_iter().partition(|i| *i < raw.len());
                if !invalid.is_empty() {
                    tracing::debug!(invalid = ?invalid, "Ignoring out-of-range relevance indices");
                }
                valid
            }
            Err(reason) => {
                tracing::warn!(
                    goal_id = %goal.id,
                    hypothesis = %hypothesis.id,
                    reason = %reason,
                    "Relevance filter failed; keeping all results"
                );
                (0..raw.len()).collect()
            }
        }
    }

    /// One search across the default sources, attributed to the goal alone.
    pub async fn direct_search(
        &self,
        goal: &Goal,
        meter: &CostMeter,
    ) -> (Vec<Finding>, Vec<FailureReason>) {
        let sources: Vec<SourceId> = self
            .ctx
            .default_sources()
            .into_iter()
            .filter(|id| {
                self.ctx
                    .gateway
                    .registry()
                    .get(*id)
                    .is_some_and(|s| s.is_relevant(&goal.statement))
            })
            .collect();
        if sources.is_empty() {
            return (Vec::new(), vec![FailureReason::HypothesisNoValidSources]);
        }
        let plan = QueryPlan {
            query: goal.statement.clone(),
            filters: Default::default(),
        };
        let (raw, failures) = self.dispatch(&sources, &plan, meter).await;
        let tag = AttributionTag::goal(goal.id.clone());
        let findings = merge(
            raw.into_iter()
                .map(|(source, result)| Finding::from_raw(result, source, tag.clone())),
        );
        tracing::debug!(
            goal_id = %goal.id,
            sources = sources.len(),
            findings = findings.len(),
            "Direct search finished"
        );
        (findings, failures)
    }

    fn emit_finished(&self, goal_id: &GoalId, hypothesis: &Hypothesis) {
        self.ctx.events.emit(ResearchEvent::HypothesisFinished {
            goal_id: goal_id.clone(),
            hypothesis: hypothesis.id,
            status: hypothesis.status,
            kept: hypothesis.metrics.kept_results,
            elapsed_ms: hypothesis.metrics.elapsed_ms,
            error: hypothesis.metrics.error.clone(),
        });
    }
}
