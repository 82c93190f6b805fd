//! End-to-end research runs driven by `MockOracle` and `MockSource`.
//!
//! Each test wires a full `ResearchEngine` and inspects the returned result
//! tree, the event log, and (where relevant) the persisted artifacts.

use delve_core::config::{HypothesisMode, ResearchConfig, RetryConfig};
use delve_core::engine::{ResearchEngine, ResearchRun};
use delve_core::error::{BudgetDimension, FailureReason};
use delve_core::events::{EventRecord, MemoryEventSink, ResearchEvent};
use delve_core::goal::{ExecutionPath, ForcedReason, GoalId, GoalStatus};
use delve_core::hypothesis::{HypothesisId, HypothesisStatus, StopReason};
use delve_core::oracle::{MockOracle, PromptKind};
use delve_core::report::ReportGenerator;
use delve_core::sources::{MockSource, RawResult, SourceId, SourceRegistry};
use delve_core::{ErrorClassifier, ErrorKind, SourceError};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_backoff_ms: 10,
        max_backoff_ms: 100,
        jitter: false,
        ..Default::default()
    }
}

fn registry_with(source: MockSource) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(source));
    registry
}

fn engine(
    config: ResearchConfig,
    oracle: Arc<MockOracle>,
    registry: SourceRegistry,
) -> (ResearchEngine, Arc<MemoryEventSink>) {
    let sink = Arc::new(MemoryEventSink::new());
    let engine = ResearchEngine::new(config, oracle, registry)
        .unwrap()
        .with_event_sink(sink.clone());
    (engine, sink)
}

fn decompose(sub_goals: Value) -> Value {
    json!({ "action": "decompose", "sub_goals": sub_goals })
}

fn node<'a>(run: &'a ResearchRun, id: &str) -> &'a delve_core::GoalResult {
    run.root.find(&GoalId::from(id)).unwrap()
}

fn every_node_terminal(run: &ResearchRun) -> bool {
    run.root.walk().iter().all(|n| n.status().is_terminal())
}

#[tokio::test]
async fn test_comparison_waits_for_both_sides_and_notes_failed_side() {
    let question = "Compare Acme vs Globex government contracts";
    let oracle = Arc::new(MockOracle::new().respond(PromptKind::Assessment, move |ctx| {
        if ctx["depth"] == 0 {
            decompose(json!([
                { "statement": "Acme government contracts" },
                { "statement": "Globex government contracts" },
                { "statement": "Contrast the two award histories", "depends_on": [0, 1] }
            ]))
        } else {
            json!({ "action": "execute" })
        }
    }));
    let source = MockSource::new(SourceId::Web).with_responder(|params| {
        if params.query.starts_with("Contrast") {
            vec![RawResult::new("Award comparison", Some("https://compare.example/acme-globex"))]
        } else if params.query.contains("Globex") {
            vec![RawResult::new("Globex wins Navy award", Some("https://news.example/globex"))]
        } else {
            Vec::new()
        }
    });
    let config = ResearchConfig {
        retry: fast_retry(),
        ..Default::default()
    };
    let (engine, sink) = engine(config, oracle, registry_with(source));

    let run = engine.run(question).await;

    let acme = node(&run, "g0.0");
    assert_eq!(acme.status(), GoalStatus::Failed);
    assert_eq!(acme.failure, Some(FailureReason::NoFindings));
    assert_eq!(node(&run, "g0.1").status(), GoalStatus::Synthesized);

    let comparison = node(&run, "g0.2");
    assert_eq!(comparison.status(), GoalStatus::Synthesized);
    assert_eq!(comparison.dependency_inputs.len(), 2);
    let gap = comparison.dependency_inputs[0].gap.as_deref().unwrap();
    assert!(gap.contains("g0.0"));
    assert!(comparison.dependency_inputs[1].gap.is_none());

    assert_eq!(
        run.root.path,
        ExecutionPath::Decomposed {
            tiers: vec![
                vec![GoalId::from("g0.0"), GoalId::from("g0.1")],
                vec![GoalId::from("g0.2")],
            ]
        }
    );
    assert_eq!(run.status(), GoalStatus::Synthesized);
    assert_eq!(run.findings().len(), 2);

    let events = sink.events();
    let position = |wanted: &dyn Fn(&ResearchEvent) -> bool| events.iter().position(wanted).unwrap();
    let prerequisite_done = position(&|e| {
        matches!(e, ResearchEvent::GoalFinished { goal_id, .. } if goal_id.as_str() == "g0.0")
    });
    let other_done = position(&|e| {
        matches!(e, ResearchEvent::GoalFinished { goal_id, .. } if goal_id.as_str() == "g0.1")
    });
    let dependent_started = position(&|e| {
        matches!(e, ResearchEvent::GoalStarted { goal_id, .. } if goal_id.as_str() == "g0.2")
    });
    assert!(prerequisite_done < dependent_started);
    assert!(other_done < dependent_started);
    assert!(events.iter().any(|e| matches!(
        e,
        ResearchEvent::DependencyGap { goal_id, prerequisite, status: GoalStatus::Failed }
            if goal_id.as_str() == "g0.2" && prerequisite.as_str() == "g0.0"
    )));

    let report = ReportGenerator::render(&run);
    assert!(report.contains("[failed] `g0.0`"));
    assert!(report.contains("gap: prerequisite g0.0 ended failed"));
}

#[tokio::test]
async fn test_shared_result_is_attributed_to_both_hypotheses() {
    let oracle = Arc::new(MockOracle::new());
    oracle.queue(
        PromptKind::HypothesisGeneration,
        json!({ "hypotheses": [
            { "statement": "Acme appears in federal award records", "target_sources": ["usaspending"] },
            { "statement": "Acme press releases mention contracts", "target_sources": ["web"] }
        ]}),
    );
    let shared = RawResult::new("Acme awarded $2M", Some("https://www.awards.example/acme?utm_source=x"));
    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(
        MockSource::new(SourceId::Contracts).with_results(vec![shared.clone()]),
    ));
    registry.register(Arc::new(MockSource::new(SourceId::Web).with_results(vec![
        RawResult::new("Acme awarded $2M (press)", Some("https://awards.example/acme/")),
    ])));
    let (engine, _) = engine(ResearchConfig::default(), oracle.clone(), registry);

    let run = engine.run("Acme contracts").await;

    assert_eq!(run.status(), GoalStatus::Synthesized);
    assert_eq!(run.findings().len(), 1);
    let tags: Vec<String> = run.findings()[0]
        .attributions
        .iter()
        .map(|t| t.to_string())
        .collect();
    assert_eq!(tags, vec!["g0/h0", "g0/h1"]);
    assert_eq!(run.findings()[0].title, "Acme awarded $2M");

    assert_eq!(run.root.hypotheses.len(), 2);
    assert_eq!(
        run.root.hypotheses[0].metrics.sources_attempted,
        vec![SourceId::Contracts]
    );
    assert_eq!(run.root.stop_reason, Some(StopReason::Exhausted));
    // No vote after the last planned hypothesis.
    assert_eq!(oracle.count(PromptKind::CoverageAssessment), 1);
}

#[test]
fn test_rate_limit_recovered_from_message_without_status() {
    let classifier = ErrorClassifier::new();
    let classification = classifier.classify("upstream replied: 429, slow down", None);
    assert_eq!(classification.kind, ErrorKind::RateLimit);
    assert!(classification.retryable);
    assert_eq!(classifier.classify("upstream replied: 429", Some(0)).kind, ErrorKind::RateLimit);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_source_is_retried_with_backoff() {
    let source = MockSource::new(SourceId::Web)
        .fail_next(SourceError::new("upstream replied: 429, slow down"))
        .with_results(vec![RawResult::new("Acme 10-K", Some("https://sec.example/acme"))]);
    let calls = source.call_counter();
    let config = ResearchConfig {
        retry: fast_retry(),
        hypotheses: delve_core::HypothesisConfig {
            mode: HypothesisMode::Off,
            ..Default::default()
        },
        ..Default::default()
    };
    let (engine, sink) = engine(config, Arc::new(MockOracle::new()), registry_with(source));

    let run = engine.run("Acme annual filings").await;

    assert_eq!(run.status(), GoalStatus::Synthesized);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        ResearchEvent::Retry { kind: ErrorKind::RateLimit, attempt: 1, .. }
    )));
}

#[tokio::test]
async fn test_cost_ceiling_mid_tree_cancels_and_still_reports() {
    let oracle = Arc::new(
        MockOracle::new()
            .with_cost(0.004)
            .respond(PromptKind::Assessment, |ctx| {
                if ctx["depth"] == 0 {
                    decompose(json!([
                        { "statement": "Acme revenue" },
                        { "statement": "Globex revenue" },
                        { "statement": "Initech revenue" }
                    ]))
                } else {
                    json!({ "action": "execute" })
                }
            }),
    );
    let source = MockSource::new(SourceId::Web).with_responder(|params| {
        vec![RawResult::new(format!("{} figures", params.query), None)]
    });
    let mut config = ResearchConfig {
        retry: fast_retry(),
        hypotheses: delve_core::HypothesisConfig {
            mode: HypothesisMode::Off,
            ..Default::default()
        },
        ..Default::default()
    };
    config.budget.max_cost_usd = 0.01;
    let (engine, sink) = engine(config, oracle, registry_with(source));

    let run = engine.run("Who earns more: Acme, Globex, or Initech?").await;

    assert!(every_node_terminal(&run));
    assert_eq!(run.status(), GoalStatus::Cancelled);
    assert_eq!(
        run.root.failure,
        Some(FailureReason::BudgetExceeded {
            dimension: BudgetDimension::Cost
        })
    );
    let cancelled: Vec<_> = run
        .root
        .children
        .iter()
        .filter(|c| c.status() == GoalStatus::Cancelled)
        .collect();
    assert!(!cancelled.is_empty());
    // Partial findings of synthesized children survive at the root.
    let synthesized = run
        .root
        .children
        .iter()
        .filter(|c| c.status() == GoalStatus::Synthesized)
        .count();
    assert!(run.findings().len() >= synthesized);
    assert!(run.budget.cost_used_usd >= 0.01);
    assert!(
        sink.events()
            .iter()
            .any(|e| matches!(e, ResearchEvent::RunFinished { status: GoalStatus::Cancelled, .. }))
    );

    let report = ReportGenerator::render(&run);
    assert!(report.contains("**Status:** cancelled"));
    assert!(report.contains("## Failures"));
    assert!(report.contains("budget exceeded: cost"));
}

#[tokio::test]
async fn test_artifacts_are_written_for_every_run() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new(SourceId::Web)
        .with_results(vec![RawResult::new("Acme 10-K", Some("https://sec.example/acme"))]);
    let config = ResearchConfig {
        artifacts_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let (engine, _) = engine(config, Arc::new(MockOracle::new()), registry_with(source));

    let run = engine.run("Acme annual filings").await;
    let paths = run.artifacts.clone().unwrap();
    assert!(paths.dir.starts_with(dir.path()));

    let findings = std::fs::read_to_string(&paths.findings).unwrap();
    assert_eq!(findings.lines().count(), 1);

    let events = std::fs::read_to_string(&paths.events).unwrap();
    let records: Vec<EventRecord> = events
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(matches!(records.first().unwrap().event, ResearchEvent::RunStarted { .. }));
    assert!(matches!(records.last().unwrap().event, ResearchEvent::RunFinished { .. }));
    assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(records.iter().all(|r| r.run_id == run.run_id));

    let metrics: Value = serde_json::from_str(&std::fs::read_to_string(&paths.metrics).unwrap()).unwrap();
    assert_eq!(metrics["status"], "synthesized");
    assert_eq!(metrics["goals"][0]["goal_id"], "g0");

    assert!(std::fs::read_to_string(&paths.report).unwrap().contains("Acme 10-K"));
}

#[tokio::test]
async fn test_depth_ceiling_forces_execution_without_asking() {
    let oracle = Arc::new(MockOracle::new().respond(PromptKind::Assessment, |_| {
        decompose(json!([
            { "statement": "Supplier landscape" },
            { "statement": "Regulatory history" }
        ]))
    }));
    let source = MockSource::new(SourceId::Web)
        .with_responder(|params| vec![RawResult::new(params.query.clone(), None)]);
    let mut config = ResearchConfig::default();
    config.budget.max_depth = 1;
    let (engine, _) = engine(config, oracle.clone(), registry_with(source));

    let run = engine.run("Battery recycling market").await;

    assert_eq!(oracle.count(PromptKind::Assessment), 1);
    assert_eq!(run.root.deepest(), 1);
    for child in &run.root.children {
        assert_eq!(
            child.path,
            ExecutionPath::Forced {
                reason: ForcedReason::DepthLimit
            }
        );
        assert_eq!(child.status(), GoalStatus::Synthesized);
    }
    assert_eq!(run.status(), GoalStatus::Synthesized);
}

#[tokio::test]
async fn test_repeated_statements_are_forced_to_execute() {
    let oracle = Arc::new(MockOracle::new().respond(PromptKind::Assessment, |_| {
        decompose(json!([
            { "statement": "Acme contracts 2020" },
            { "statement": "Globex patents" }
        ]))
    }));
    let source = MockSource::new(SourceId::Web)
        .with_responder(|params| vec![RawResult::new(params.query.clone(), None)]);
    let (engine, sink) = engine(ResearchConfig::default(), oracle.clone(), registry_with(source));

    let run = engine.run("Acme contracts 2020").await;

    // Only g0 and g0.1 are ever assessed.
    assert_eq!(oracle.count(PromptKind::Assessment), 2);
    let forced_against = |id: &str| match &node(&run, id).path {
        ExecutionPath::Forced {
            reason: ForcedReason::Cycle { ancestor, .. },
        } => ancestor.as_str().to_string(),
        other => panic!("{id} was not forced by a cycle: {other:?}"),
    };
    assert_eq!(forced_against("g0.0"), "g0");
    assert_eq!(forced_against("g0.1.0"), "g0");
    assert_eq!(forced_against("g0.1.1"), "g0.1");
    assert!(node(&run, "g0.0").errors.contains(&FailureReason::CycleDetected));
    assert!(every_node_terminal(&run));
    assert_eq!(
        sink.events()
            .iter()
            .filter(|e| matches!(e, ResearchEvent::CycleDetected { .. }))
            .count(),
        3
    );
}

fn three_hypotheses() -> Value {
    json!({ "hypotheses": [
        { "statement": "Acme in award databases" },
        { "statement": "Acme in trade press" },
        { "statement": "Acme in court filings" }
    ]})
}

fn distinct_results_source() -> MockSource {
    MockSource::new(SourceId::Web).with_responder(|params| {
        vec![RawResult::new(
            format!("Result for {}", params.query),
            Some(&format!("https://example.com/{}", params.query.replace(' ', "-"))),
        )]
    })
}

#[tokio::test]
async fn test_sequential_mode_stops_at_hypothesis_ceiling() {
    let oracle = Arc::new(MockOracle::new());
    oracle.queue(
        PromptKind::HypothesisGeneration,
        json!({ "hypotheses": [
            { "statement": "a" }, { "statement": "b" }, { "statement": "c" }, { "statement": "d" }
        ]}),
    );
    let mut config = ResearchConfig::default();
    config.hypotheses.max_per_goal = 2;
    let (engine, _) = engine(config, oracle.clone(), registry_with(distinct_results_source()));

    let run = engine.run("Acme contracts").await;

    assert_eq!(run.root.hypotheses.len(), 2);
    assert_eq!(run.root.stop_reason, Some(StopReason::HypothesisCeiling));
    assert_eq!(run.findings().len(), 2);
}

#[tokio::test]
async fn test_sequential_mode_honors_coverage_stop() {
    let oracle = Arc::new(MockOracle::new());
    oracle.queue(PromptKind::HypothesisGeneration, three_hypotheses());
    oracle.queue(
        PromptKind::CoverageAssessment,
        json!({ "decision": "STOP", "coverage_score": 0.9, "confidence": 0.8, "rationale": "saturated" }),
    );
    let (engine, sink) = engine(
        ResearchConfig::default(),
        oracle.clone(),
        registry_with(distinct_results_source()),
    );

    let run = engine.run("Acme contracts").await;

    assert_eq!(run.root.hypotheses.len(), 1);
    assert_eq!(run.root.stop_reason, Some(StopReason::Coverage));
    assert_eq!(run.root.coverage.len(), 1);
    assert_eq!(run.root.coverage[0].after_hypothesis, HypothesisId(0));
    assert!(sink.events().iter().any(|e| matches!(
        e,
        ResearchEvent::HypothesesStopped { executed: 1, reason: StopReason::Coverage, .. }
    )));
}

#[tokio::test]
async fn test_coverage_vote_sees_every_finding_so_far() {
    let oracle = Arc::new(MockOracle::new());
    oracle.queue(
        PromptKind::HypothesisGeneration,
        json!({ "hypotheses": [
            { "statement": "Acme in award databases" },
            { "statement": "Acme in trade press" }
        ]}),
    );
    let calls = oracle.call_log();
    let source = MockSource::new(SourceId::Web).with_responder(|params| {
        (0..60)
            .map(|i| {
                RawResult::new(
                    format!("{} #{i}", params.query),
                    Some(&format!("https://example.com/{}/{i}", params.query.replace(' ', "-"))),
                )
            })
            .collect()
    });
    let mut config = ResearchConfig::default();
    config.results_per_source = 100;
    let (engine, _) = engine(config, oracle, registry_with(source));

    let run = engine.run("Acme contracts").await;

    assert_eq!(run.root.hypotheses.len(), 2);
    assert_eq!(run.findings().len(), 120);
    let log = calls.lock().unwrap();
    let coverage: Vec<&Value> = log
        .iter()
        .filter(|(kind, _)| *kind == PromptKind::CoverageAssessment)
        .map(|(_, context)| context)
        .collect();
    assert_eq!(coverage.len(), 1);
    let history = coverage[0]["finding_history"].as_array().unwrap();
    assert_eq!(history.len(), 60);
    assert_eq!(history[0], "Acme in award databases #0");
    assert_eq!(coverage[0]["finding_count"], 60);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_mode_respects_time_budget() {
    let oracle = Arc::new(MockOracle::new().with_cost(0.001));
    oracle.queue(PromptKind::HypothesisGeneration, three_hypotheses());
    let source = distinct_results_source().with_latency(Duration::from_secs(6));
    let mut config = ResearchConfig::default();
    config.hypotheses.time_budget_secs = 10;
    let (engine, _) = engine(config, oracle, registry_with(source));

    let run = engine.run("Acme contracts").await;

    let hypotheses = &run.root.hypotheses;
    assert_eq!(hypotheses.len(), 2);
    assert_eq!(hypotheses[0].status, HypothesisStatus::Succeeded);
    assert_eq!(hypotheses[1].status, HypothesisStatus::Failed);
    assert!(matches!(
        hypotheses[1].metrics.error,
        Some(FailureReason::Timeout { .. })
    ));
    assert_eq!(run.root.stop_reason, Some(StopReason::TimeBudget));
    assert_eq!(run.status(), GoalStatus::Synthesized);

    // The abandoned hypothesis still owns the query it paid for.
    assert!((hypotheses[1].metrics.cost_usd - 0.001).abs() < 1e-9);
    assert!((run.root.total_cost() - run.budget.cost_used_usd).abs() < 1e-9);
}

#[tokio::test]
async fn test_parallel_mode_runs_every_hypothesis() {
    let oracle = Arc::new(MockOracle::new());
    oracle.queue(PromptKind::HypothesisGeneration, three_hypotheses());
    let mut config = ResearchConfig::default();
    config.hypotheses.mode = HypothesisMode::Parallel;
    let (engine, _) = engine(config, oracle.clone(), registry_with(distinct_results_source()));

    let run = engine.run("Acme contracts").await;

    assert_eq!(run.root.hypotheses.len(), 3);
    assert_eq!(oracle.count(PromptKind::CoverageAssessment), 0);
    assert_eq!(run.findings().len(), 3);
}

#[tokio::test]
async fn test_failing_source_does_not_sink_sibling_hypothesis() {
    let oracle = Arc::new(MockOracle::new());
    oracle.queue(
        PromptKind::HypothesisGeneration,
        json!({ "hypotheses": [
            { "statement": "Acme patents", "target_sources": ["uspto"] },
            { "statement": "Acme news", "target_sources": ["web"] }
        ]}),
    );
    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(
        MockSource::new(SourceId::Patents)
            .always_fail(SourceError::with_status("invalid api key", 401)),
    ));
    registry.register(Arc::new(
        MockSource::new(SourceId::Web)
            .with_results(vec![RawResult::new("Acme expands", Some("https://news.example/a"))]),
    ));
    let (engine, _) = engine(ResearchConfig::default(), oracle, registry);

    let run = engine.run("Acme").await;

    let failed = &run.root.hypotheses[0];
    assert_eq!(failed.status, HypothesisStatus::Failed);
    assert!(matches!(
        failed.metrics.error,
        Some(FailureReason::Source {
            kind: ErrorKind::Authentication,
            ..
        })
    ));
    assert_eq!(run.root.hypotheses[1].status, HypothesisStatus::Succeeded);
    assert_eq!(run.status(), GoalStatus::Synthesized);
}

#[tokio::test]
async fn test_unknown_target_sources_fail_only_that_hypothesis() {
    let oracle = Arc::new(MockOracle::new());
    oracle.queue(
        PromptKind::HypothesisGeneration,
        json!({ "hypotheses": [
            { "statement": "Acme in the registry", "target_sources": ["companies_house"] },
            { "statement": "Acme on the web" }
        ]}),
    );
    let (engine, _) = engine(
        ResearchConfig::default(),
        oracle,
        registry_with(distinct_results_source()),
    );

    let run = engine.run("Acme").await;

    let first = &run.root.hypotheses[0];
    assert_eq!(first.metrics.error, Some(FailureReason::HypothesisNoValidSources));
    assert_eq!(first.metrics.unknown_sources, vec!["companies_house".to_string()]);
    assert_eq!(run.root.hypotheses[1].status, HypothesisStatus::Succeeded);
}

#[tokio::test]
async fn test_invalid_assessment_falls_back_to_execute() {
    let oracle = Arc::new(MockOracle::new());
    oracle.queue(
        PromptKind::Assessment,
        json!({ "action": "decompose", "sub_goals": [{ "statement": "a", "depends_on": [0] }] }),
    );
    let source = MockSource::new(SourceId::Web)
        .with_results(vec![RawResult::new("Acme", Some("https://acme.example"))]);
    let (engine, _) = engine(ResearchConfig::default(), oracle, registry_with(source));

    let run = engine.run("Acme").await;

    assert_eq!(run.root.path, ExecutionPath::Executed);
    assert!(run.root.children.is_empty());
    assert!(run.root.errors.contains(&FailureReason::OracleSchemaInvalid {
        kind: PromptKind::Assessment
    }));
    assert_eq!(run.status(), GoalStatus::Synthesized);
}

#[tokio::test]
async fn test_nothing_found_anywhere_fails_the_root() {
    let (engine, _) = engine(
        ResearchConfig::default(),
        Arc::new(MockOracle::new()),
        registry_with(MockSource::new(SourceId::Web)),
    );

    let run = engine.run("An unanswerable question").await;

    assert_eq!(run.status(), GoalStatus::Failed);
    assert_eq!(run.root.failure, Some(FailureReason::NoFindings));
    assert!(ReportGenerator::render(&run).contains("_No findings._"));
}
