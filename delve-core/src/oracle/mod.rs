//! Oracle interface: the external reasoning service behind every decision.
//!
//! The engine never trusts oracle output. [`OracleClient`] wraps any [`Oracle`]
//! with the global limiter, the retry policy, cost metering against the run's
//! [`Budget`], and per-kind schema validation. Call sites choose their own
//! fallback when a decision cannot be obtained.

pub mod heuristic;
pub mod http;
pub mod mock;
pub mod schema;

pub use heuristic::HeuristicOracle;
pub use http::HttpOracle;
pub use mock::MockOracle;
pub use schema::{
    AssessmentAction, AssessmentDecision, CoverageVote, Decision, HypothesisPlan, HypothesisSpec,
    QueryPlan, Reformulation, RelevanceVerdict, SubGoalSpec, parse_decision,
};

use crate::budget::{Budget, BudgetCheck};
use crate::error::{FailureReason, OracleError};
use crate::limiter::ConcurrencyLimiter;
use crate::retry::{ClassifiedFailure, QueryReformulator, RetryController};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// The structured prompt families the engine sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Assessment,
    HypothesisGeneration,
    CoverageAssessment,
    QueryGeneration,
    RelevanceFilter,
    Reformulation,
}

impl PromptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assessment => "assessment",
            Self::HypothesisGeneration => "hypothesis_generation",
            Self::CoverageAssessment => "coverage_assessment",
            Self::QueryGeneration => "query_generation",
            Self::RelevanceFilter => "relevance_filter",
            Self::Reformulation => "reformulation",
        }
    }
}

impl std::fmt::Display for PromptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw oracle answer: an unvalidated decision plus its metered cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleReply {
    pub decision: serde_json::Value,
    #[serde(default)]
    pub cost_usd: f64,
}

impl OracleReply {
    pub fn free(decision: serde_json::Value) -> Self {
        Self {
            decision,
            cost_usd: 0.0,
        }
    }
}

/// A reasoning backend. Non-deterministic, rate-limited, and metered.
#[async_trait]
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(
        &self,
        kind: PromptKind,
        context: &serde_json::Value,
    ) -> Result<OracleReply, OracleError>;
}

/// Accumulates the cost charged by one execution unit.
#[derive(Debug, Default)]
pub struct CostMeter {
    micros: AtomicU64,
}

impl CostMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, usd: f64) {
        let micros = (usd.max(0.0) * 1_000_000.0).round() as u64;
        self.micros.fetch_add(micros, Ordering::AcqRel);
    }

    pub fn total_usd(&self) -> f64 {
        self.micros.load(Ordering::Acquire) as f64 / 1_000_000.0
    }
}

/// Metered, validated access to an [`Oracle`].
#[derive(Clone)]
pub struct OracleClient {
    oracle: Arc<dyn Oracle>,
    retry: RetryController,
    limiter: ConcurrencyLimiter,
    budget: Arc<Budget>,
}

impl OracleClient {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        retry: RetryController,
        limiter: ConcurrencyLimiter,
        budget: Arc<Budget>,
    ) -> Self {
        Self {
            oracle,
            retry,
            limiter,
            budget,
        }
    }

    pub fn name(&self) -> &str {
        self.oracle.name()
    }

    /// Ask for a decision of type `D`, charging its cost to the budget and `meter`.
    ///
    /// Returns `BudgetExceeded` without calling out if wall time or cost is spent.
    pub async fn decide<D: Decision>(
        &self,
        context: &serde_json::Value,
        meter: &CostMeter,
    ) -> Result<D, FailureReason> {
        if let BudgetCheck::Exceeded(dimension) = self.budget.check_running() {
            return Err(FailureReason::BudgetExceeded { dimension });
        }

        let kind = D::KIND;
        let unit = format!("oracle:{kind}");
        let reply = self
            .retry
            .run(&unit, || {
                let oracle = self.oracle.clone();
                let limiter = self.limiter.clone();
                async move {
                    let _permit = limiter
                        .acquire()
                        .await
                        .ok_or_else(|| OracleError::call("concurrency limiter closed"))?;
                    oracle.decide(kind, context).await
                }
            })
            .await
            .map_err(|failure: ClassifiedFailure| {
                if let BudgetCheck::Exceeded(dimension) = self.budget.check_running() {
                    return FailureReason::BudgetExceeded { dimension };
                }
                tracing::warn!(
                    kind = %kind,
                    error_kind = %failure.kind,
                    attempts = failure.attempts,
                    error = %failure.message,
                    "Oracle call failed"
                );
                failure.as_oracle_reason()
            })?;

        meter.add(reply.cost_usd);
        if let BudgetCheck::Exceeded(_) = self.budget.record_cost(reply.cost_usd) {
            self.limiter.close();
        }

        parse_decision::<D>(reply.decision).map_err(|e| {
            tracing::warn!(kind = %kind, error = %e, "Oracle decision rejected");
            FailureReason::from(e)
        })
    }

    /// A reformulator that charges its oracle calls to `meter`.
    pub fn reformulator<'a>(&'a self, meter: &'a CostMeter) -> MeteredReformulator<'a> {
        MeteredReformulator {
            client: self,
            meter,
        }
    }
}

/// Asks the oracle for a replacement query after an authentication or client error.
pub struct MeteredReformulator<'a> {
    client: &'a OracleClient,
    meter: &'a CostMeter,
}

#[async_trait]
impl QueryReformulator for MeteredReformulator<'_> {
    async fn reformulate(&self, query: &str, failure: &ClassifiedFailure) -> Option<String> {
        let context = serde_json::json!({
            "query": query,
            "error_kind": failure.kind,
            "error": failure.message,
        });
        match self.client.decide::<Reformulation>(&context, self.meter).await {
            Ok(reformulation) => Some(reformulation.query),
            Err(reason) => {
                // Fallback: no alternative query, the original failure stands.
                tracing::debug!(reason = %reason, "Reformulation unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ErrorClassifier, ErrorKind};
    use crate::config::{BudgetConfig, RetryConfig};
    use serde_json::json;

    fn client(oracle: MockOracle, max_cost: f64) -> (OracleClient, Arc<Budget>) {
        client_with_limiter(oracle, max_cost, ConcurrencyLimiter::new(2))
    }

    fn client_with_limiter(
        oracle: MockOracle,
        max_cost: f64,
        limiter: ConcurrencyLimiter,
    ) -> (OracleClient, Arc<Budget>) {
        let budget = Arc::new(Budget::new(&BudgetConfig {
            max_cost_usd: max_cost,
            ..Default::default()
        }));
        let retry = RetryController::new(
            RetryConfig {
                initial_backoff_ms: 1,
                jitter: false,
                ..Default::default()
            },
            Arc::new(ErrorClassifier::new()),
        );
        let client = OracleClient::new(
            Arc::new(oracle),
            retry,
            limiter,
            budget.clone(),
        );
        (client, budget)
    }

    #[tokio::test]
    async fn test_decide_charges_cost() {
        let oracle = MockOracle::new().with_cost(0.02);
        let (client, budget) = client(oracle, 1.0);
        let meter = CostMeter::new();
        let d: AssessmentDecision = client.decide(&json!({"goal": "q"}), &meter).await.unwrap();
        assert_eq!(d.action, AssessmentAction::Execute);
        assert!((meter.total_usd() - 0.02).abs() < 1e-9);
        assert!((budget.cost_usd() - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_schema_violation_is_classified() {
        let oracle = MockOracle::new();
        oracle.queue(PromptKind::Assessment, json!({"verdict": "maybe"}));
        let (client, _) = client(oracle, 1.0);
        let err = client
            .decide::<AssessmentDecision>(&json!({}), &CostMeter::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FailureReason::OracleSchemaInvalid {
                kind: PromptKind::Assessment
            }
        );
    }

    #[tokio::test]
    async fn test_transport_failure_retried() {
        let oracle = MockOracle::new();
        oracle.queue_error(
            PromptKind::QueryGeneration,
            OracleError::with_status("overloaded", 529),
        );
        oracle.queue(PromptKind::QueryGeneration, json!({"query": "acme awards"}));
        let (client, _) = client(oracle, 1.0);
        let plan: QueryPlan = client.decide(&json!({}), &CostMeter::new()).await.unwrap();
        assert_eq!(plan.query, "acme awards");
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let oracle = MockOracle::new();
        oracle.queue_error(
            PromptKind::QueryGeneration,
            OracleError::with_status("invalid api key", 401),
        );
        let (client, _) = client(oracle, 1.0);
        let err = client
            .decide::<QueryPlan>(&json!({}), &CostMeter::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FailureReason::Oracle {
                kind: ErrorKind::Authentication,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_call() {
        let oracle = MockOracle::new().with_cost(0.05);
        let calls = oracle.call_log();
        let (client, _) = client(oracle, 0.05);
        let meter = CostMeter::new();
        client
            .decide::<AssessmentDecision>(&json!({}), &meter)
            .await
            .unwrap();
        let err = client
            .decide::<AssessmentDecision>(&json!({}), &meter)
            .await
            .unwrap_err();
        assert!(matches!(err, FailureReason::BudgetExceeded { .. }));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_crossing_cost_ceiling_closes_limiter() {
        let limiter = ConcurrencyLimiter::new(2);
        let oracle = MockOracle::new().with_cost(0.03);
        let (client, _) = client_with_limiter(oracle, 0.05, limiter.clone());
        let meter = CostMeter::new();

        client
            .decide::<AssessmentDecision>(&json!({}), &meter)
            .await
            .unwrap();
        assert!(!limiter.is_closed());
        client
            .decide::<AssessmentDecision>(&json!({}), &meter)
            .await
            .unwrap();
        assert!(limiter.is_closed());
    }

    #[tokio::test]
    async fn test_call_queued_behind_closed_limiter_reports_budget() {
        let limiter = ConcurrencyLimiter::new(1);
        let oracle = MockOracle::new();
        let calls = oracle.call_log();
        let (client, budget) = client_with_limiter(oracle, 0.05, limiter.clone());
        let held = limiter.acquire().await.unwrap();

        let queued = tokio::spawn(async move {
            client
                .decide::<AssessmentDecision>(&json!({}), &CostMeter::new())
                .await
        });
        tokio::task::yield_now().await;
        budget.record_cost(0.05);
        limiter.close();
        drop(held);

        let err = queued.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            FailureReason::BudgetExceeded {
                dimension: crate::error::BudgetDimension::Cost
            }
        );
        assert!(calls.lock().unwrap().is_empty());
    }
}
