//! Coverage Assessor: the adaptive-stopping vote after each sequential hypothesis.
//!
//! Objective delta metrics are computed locally; the oracle adds the subjective
//! judgement. The caller enforces the hard ceilings, so this vote can only end
//! a run early. An oracle failure degrades to `Continue`.

use crate::budget::BudgetSnapshot;
use crate::error::FailureReason;
use crate::findings::{Finding, FindingSet};
use crate::hypothesis::HypothesisId;
use crate::oracle::{CostMeter, CoverageVote, OracleClient};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageVerdict {
    #[serde(alias = "CONTINUE", alias = "Continue")]
    Continue,
    #[serde(alias = "STOP", alias = "Stop")]
    Stop,
}

impl std::fmt::Display for CoverageVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => f.write_str("continue"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// Incremental value of one batch of findings against what was already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeltaMetrics {
    /// Findings whose dedup key was not seen before.
    pub new_findings: usize,
    /// Findings whose dedup key was already known.
    pub duplicate_findings: usize,
    /// Distinct entity mentions not seen before (case-insensitive).
    pub new_entities: usize,
}

impl DeltaMetrics {
    pub fn is_empty(&self) -> bool {
        self.new_findings == 0 && self.new_entities == 0
    }
}

/// Compare `new` against `prior` without modifying either.
pub fn delta(new: &[Finding], prior: &FindingSet) -> DeltaMetrics {
    let mut keys = HashSet::new();
    let mut entities = HashSet::new();
    let mut metrics = DeltaMetrics::default();
    for finding in new {
        if prior.contains_key(&finding.key) || !keys.insert(finding.key.as_str()) {
            metrics.duplicate_findings += 1;
        } else {
            metrics.new_findings += 1;
        }
        for entity in &finding.entities {
            let lowered = entity.to_lowercase();
            if !prior.knows_entity(&lowered) && entities.insert(lowered) {
                metrics.new_entities += 1;
            }
        }
    }
    metrics
}

/// The assessor's decision after one hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageOutcome {
    pub after_hypothesis: HypothesisId,
    pub delta: DeltaMetrics,
    pub verdict: CoverageVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// True when the oracle could not be consulted and `Continue` was assumed.
    pub fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,
}

/// Progress of the sequential run at the time of the vote.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageProgress {
    pub executed: usize,
    pub max_hypotheses: usize,
    pub time_remaining_ms: u64,
    pub budget: BudgetSnapshot,
}

#[derive(Clone)]
pub struct CoverageAssessor {
    oracle: OracleClient,
}

impl CoverageAssessor {
    pub fn new(oracle: OracleClient) -> Self {
        Self { oracle }
    }

    /// Vote on whether another hypothesis is worth running.
    #[allow(clippy::too_many_arguments)]
    pub async fn assess(
        &self,
        goal: &str,
        hypothesis: HypothesisId,
        hypothesis_statement: &str,
        new: &[Finding],
        prior: &FindingSet,
        progress: &CoverageProgress,
        meter: &CostMeter,
    ) -> CoverageOutcome {
        let delta = delta(new, prior);
        // Every finding seen so far, oldest first, then this hypothesis's batch.
        let history: Vec<&str> = prior
            .as_slice()
            .iter()
            .chain(new.iter())
            .map(|f| f.title.as_str())
            .collect();
        let context = serde_json::json!({
            "goal": goal,
            "hypothesis": hypothesis_statement,
            "delta": delta,
            "progress": progress,
            "finding_count": prior.len() + delta.new_findings,
            "finding_history": history,
        });

        match self.oracle.decide::<CoverageVote>(&context, meter).await {
            Ok(vote) => {
                tracing::debug!(
                    hypothesis = %hypothesis,
                    verdict = %vote.decision,
                    score = vote.coverage_score,
                    new_findings = delta.new_findings,
                    "Coverage vote"
                );
                CoverageOutcome {
                    after_hypothesis: hypothesis,
                    delta,
                    verdict: vote.decision,
                    coverage_score: Some(vote.coverage_score),
                    confidence: Some(vote.confidence),
                    rationale: Some(vote.rationale),
                    fallback: false,
                    error: None,
                }
            }
            Err(reason) => {
                tracing::warn!(
                    hypothesis = %hypothesis,
                    reason = %reason,
                    "Coverage assessment unavailable; continuing until a hard ceiling"
                );
                CoverageOutcome {
                    after_hypothesis: hypothesis,
                    delta,
                    verdict: CoverageVerdict::Continue,
                    coverage_score: None,
                    confidence: None,
                    rationale: None,
                    fallback: true,
                    error: Some(reason),
                }
            }
        }
    }
}
