//! Scripted oracle for tests.

use super::{Oracle, OracleReply, PromptKind};
use crate::error::OracleError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type Responder = dyn Fn(&Value) -> Value + Send + Sync;

/// Shared record of every call the mock received.
pub type CallLog = Arc<Mutex<Vec<(PromptKind, Value)>>>;

/// An oracle that answers from queues, then responders, then defaults.
///
/// Defaults: assessment executes, hypothesis generation yields nothing,
/// coverage continues, query generation echoes the hypothesis or goal,
/// relevance keeps every candidate, reformulation appends "overview".
pub struct MockOracle {
    queued: Mutex<HashMap<PromptKind, VecDeque<Result<Value, OracleError>>>>,
    responders: HashMap<PromptKind, Arc<Responder>>,
    cost_per_call: f64,
    latency: Option<Duration>,
    calls: CallLog,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            queued: Mutex::new(HashMap::new()),
            responders: HashMap::new(),
            cost_per_call: 0.0,
            latency: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Report this cost on every successful call.
    pub fn with_cost(mut self, usd: f64) -> Self {
        self.cost_per_call = usd;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer every unqueued call of `kind` with `responder(context)`.
    pub fn respond<F>(mut self, kind: PromptKind, responder: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.responders.insert(kind, Arc::new(responder));
        self
    }

    /// Queue a decision for the next call of `kind`.
    pub fn queue(&self, kind: PromptKind, decision: Value) {
        self.push(kind, Ok(decision));
    }

    /// Queue a failure for the next call of `kind`.
    pub fn queue_error(&self, kind: PromptKind, error: OracleError) {
        self.push(kind, Err(error));
    }

    fn push(&self, kind: PromptKind, entry: Result<Value, OracleError>) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push_back(entry);
    }

    /// Handle to the call log, usable after the mock is moved into an `Arc`.
    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }

    /// Number of calls of `kind` received so far.
    pub fn count(&self, kind: PromptKind) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    fn default_decision(kind: PromptKind, context: &Value) -> Value {
        match kind {
            PromptKind::Assessment => json!({ "action": "execute" }),
            PromptKind::HypothesisGeneration => json!({ "hypotheses": [] }),
            PromptKind::CoverageAssessment => json!({
                "decision": "continue",
                "coverage_score": 0.5,
                "confidence": 0.5,
                "rationale": "mock"
            }),
            PromptKind::QueryGeneration => {
                let query = context["hypothesis"]
                    .as_str()
                    .or_else(|| context["goal"].as_str())
                    .unwrap_or("query");
                json!({ "query": query })
            }
            PromptKind::RelevanceFilter => {
                let count = context["candidates"].as_array().map_or(0, Vec::len);
                json!({ "keep": (0..count).collect::<Vec<_>>() })
            }
            PromptKind::Reformulation => {
                let query = context["query"].as_str().unwrap_or_default();
                json!({ "query": format!("{query} overview") })
            }
        }
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Oracle for MockOracle {
    fn name(&self) -> &str {
        "mock"
    }

    async fn decide(&self, kind: PromptKind, context: &Value) -> Result<OracleReply, OracleError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, context.clone()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);

        let decision = match queued {
            Some(entry) => entry?,
            None => match self.responders.get(&kind) {
                Some(responder) => responder(context),
                None => Self::default_decision(kind, context),
            },
        };
        Ok(OracleReply {
            decision,
            cost_usd: self.cost_per_call,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_then_responder_then_default() {
        let oracle = MockOracle::new().respond(PromptKind::Assessment, |_| {
            json!({"action": "decompose", "sub_goals": [{"statement": "x"}]})
        });
        oracle.queue(PromptKind::Assessment, json!({"action": "execute"}));

        let first = oracle.decide(PromptKind::Assessment, &json!({})).await.unwrap();
        assert_eq!(first.decision["action"], "execute");
        let second = oracle.decide(PromptKind::Assessment, &json!({})).await.unwrap();
        assert_eq!(second.decision["action"], "decompose");
        let coverage = oracle
            .decide(PromptKind::CoverageAssessment, &json!({}))
            .await
            .unwrap();
        assert_eq!(coverage.decision["decision"], "continue");
        assert_eq!(oracle.count(PromptKind::Assessment), 2);
    }

    #[tokio::test]
    async fn test_default_relevance_keeps_everything() {
        let oracle = MockOracle::new();
        let reply = oracle
            .decide(
                PromptKind::RelevanceFilter,
                &json!({"candidates": [{"title": "a"}, {"title": "b"}]}),
            )
            .await
            .unwrap();
        assert_eq!(reply.decision["keep"], json!([0, 1]));
    }

    #[tokio::test]
    async fn test_queued_error_is_returned() {
        let oracle = MockOracle::new();
        oracle.queue_error(PromptKind::Reformulation, OracleError::call("down"));
        assert!(
            oracle
                .decide(PromptKind::Reformulation, &json!({"query": "q"}))
                .await
                .is_err()
        );
    }
}
