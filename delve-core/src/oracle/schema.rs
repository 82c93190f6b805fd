//! Fixed decision schemas, one per prompt kind.
//!
//! Oracle output is untrusted: it is deserialized into these types and then
//! validated. Anything that fails either step becomes
//! [`OracleError::SchemaInvalid`](crate::error::OracleError::SchemaInvalid).

use super::PromptKind;
use crate::coverage::CoverageVerdict;
use crate::error::OracleError;
use crate::scheduler::dependency_tiers;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed oracle decision.
pub trait Decision: DeserializeOwned + Serialize + Send + Sized {
    const KIND: PromptKind;

    /// Semantic checks beyond what deserialization enforces.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Whether a goal is answered directly or split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentAction {
    #[serde(alias = "EXECUTE", alias = "Execute")]
    Execute,
    #[serde(alias = "DECOMPOSE", alias = "Decompose")]
    Decompose,
}

impl std::fmt::Display for AssessmentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execute => f.write_str("execute"),
            Self::Decompose => f.write_str("decompose"),
        }
    }
}

/// One proposed sub-goal. `depends_on` holds indices into the sibling list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGoalSpec {
    pub statement: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl SubGoalSpec {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, deps: &[usize]) -> Self {
        self.depends_on = deps.to_vec();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentDecision {
    pub action: AssessmentAction,
    #[serde(default)]
    pub sub_goals: Vec<SubGoalSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl AssessmentDecision {
    pub fn execute() -> Self {
        Self {
            action: AssessmentAction::Execute,
            sub_goals: Vec::new(),
            rationale: None,
        }
    }

    pub fn decompose(sub_goals: Vec<SubGoalSpec>) -> Self {
        Self {
            action: AssessmentAction::Decompose,
            sub_goals,
            rationale: None,
        }
    }
}

impl Decision for AssessmentDecision {
    const KIND: PromptKind = PromptKind::Assessment;

    fn validate(&self) -> Result<(), String> {
        if self.action == AssessmentAction::Execute {
            return Ok(());
        }
        if self.sub_goals.is_empty() {
            return Err("decompose verdict without sub-goals".into());
        }
        for (i, sub) in self.sub_goals.iter().enumerate() {
            if sub.statement.trim().is_empty() {
                return Err(format!("sub-goal {i} has an empty statement"));
            }
            for &dep in &sub.depends_on {
                if dep >= self.sub_goals.len() {
                    return Err(format!("sub-goal {i} depends on unknown sub-goal {dep}"));
                }
                if dep == i {
                    return Err(format!("sub-goal {i} depends on itself"));
                }
            }
        }
        let deps: Vec<Vec<usize>> = self.sub_goals.iter().map(|s| s.depends_on.clone()).collect();
        dependency_tiers(&deps).map(|_| ())
    }
}

/// One proposed search strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisSpec {
    pub statement: String,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub expected_entities: Vec<String>,
    /// Human-readable source names; resolved through the source registry.
    #[serde(default)]
    pub target_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisPlan {
    pub hypotheses: Vec<HypothesisSpec>,
}

impl Decision for HypothesisPlan {
    const KIND: PromptKind = PromptKind::HypothesisGeneration;

    fn validate(&self) -> Result<(), String> {
        match self
            .hypotheses
            .iter()
            .position(|h| h.statement.trim().is_empty())
        {
            Some(i) => Err(format!("hypothesis {i} has an empty statement")),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageVote {
    pub decision: CoverageVerdict,
    pub coverage_score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
}

impl Decision for CoverageVote {
    const KIND: PromptKind = PromptKind::CoverageAssessment;

    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.coverage_score) {
            return Err(format!("coverage_score {} outside [0, 1]", self.coverage_score));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
}

impl Decision for QueryPlan {
    const KIND: PromptKind = PromptKind::QueryGeneration;

    fn validate(&self) -> Result<(), String> {
        non_empty_query(&self.query)
    }
}

/// Indices of the candidate results worth keeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    pub keep: Vec<usize>,
}

impl Decision for RelevanceVerdict {
    const KIND: PromptKind = PromptKind::RelevanceFilter;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reformulation {
    pub query: String,
}

impl Decision for Reformulation {
    const KIND: PromptKind = PromptKind::Reformulation;

    fn validate(&self) -> Result<(), String> {
        non_empty_query(&self.query)
    }
}

/// Deserialize and validate a raw decision as `D`.
pub fn parse_decision<D: Decision>(value: serde_json::Value) -> Result<D, OracleError> {
    let invalid = |reason: String| OracleError::SchemaInvalid {
        kind: D::KIND,
        reason,
    };
    let decision: D = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
    decision.validate().map_err(invalid)?;
    Ok(decision)
}

fn non_empty_query(query: &str) -> Result<(), String> {
    if query.trim().is_empty() {
        Err("empty query".into())
    } else {
        Ok(())
    }
}
