//! Offline rule-based oracle.
//!
//! Lets the engine run without a reasoning service: comparative questions are
//! split per side with a dependent comparison goal, "how" questions get a
//! procedural follow-up, sources are suggested by keyword, relevance is keyword
//! overlap, and coverage stops once a hypothesis adds nothing new. Every call
//! costs nothing.

use super::schema::{
    AssessmentDecision, CoverageVote, HypothesisPlan, HypothesisSpec, QueryPlan, Reformulation,
    RelevanceVerdict, SubGoalSpec,
};
use super::{Oracle, OracleReply, PromptKind};
use crate::coverage::CoverageVerdict;
use crate::error::OracleError;
use crate::text::{keyword_overlap, keywords};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Query terms kept by query generation.
const MAX_QUERY_TERMS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct HeuristicOracle;

impl HeuristicOracle {
    pub fn new() -> Self {
        Self
    }

    fn assess(&self, context: &Value) -> AssessmentDecision {
        let goal = str_field(context, "goal");
        let depth = context["depth"].as_u64().unwrap_or(0);
        let max_depth = context["max_depth"].as_u64().unwrap_or(0);
        let has_prerequisites = context["dependency_inputs"]
            .as_array()
            .is_some_and(|deps| !deps.is_empty());

        if depth >= max_depth || has_prerequisites {
            return AssessmentDecision::execute();
        }

        let parts = split_comparative(goal);
        if parts.len() > 1 {
            let deps: Vec<usize> = (0..parts.len()).collect();
            let mut sub_goals: Vec<SubGoalSpec> = parts.into_iter().map(SubGoalSpec::new).collect();
            sub_goals.push(SubGoalSpec::new(format!("Compare findings: {goal}")).after(&deps));
            let mut decision = AssessmentDecision::decompose(sub_goals);
            decision.rationale = Some("comparative question split per side".into());
            return decision;
        }

        if goal.trim_start().to_lowercase().starts_with("how") {
            let mut decision = AssessmentDecision::decompose(vec![
                SubGoalSpec::new(format!("Background: {goal}")),
                SubGoalSpec::new(format!("Practical steps: {goal}")).after(&[0]),
            ]);
            decision.rationale = Some("procedural question needs background first".into());
            return decision;
        }

        AssessmentDecision::execute()
    }

    fn hypotheses(&self, context: &Value) -> HypothesisPlan {
        let goal = str_field(context, "goal");
        let max = context["max_hypotheses"].as_u64().unwrap_or(3) as usize;
        let available: Vec<String> = context["available_sources"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let terms = keywords(goal);
        let sources = suggest_sources(goal, &available);

        let mut hypotheses = vec![HypothesisSpec {
            statement: goal.to_string(),
            signals: terms.clone(),
            expected_entities: Vec::new(),
            target_sources: sources.clone(),
        }];
        if terms.len() > 1 {
            hypotheses.push(HypothesisSpec {
                statement: format!("Primary records about {}", terms[..2].join(" ")),
                signals: terms[..2].to_vec(),
                expected_entities: Vec::new(),
                target_sources: available.clone(),
            });
        }
        if let Some(first) = terms.first() {
            hypotheses.push(HypothesisSpec {
                statement: format!("Recent developments concerning {first}"),
                signals: vec![first.clone(), "recent".into()],
                expected_entities: Vec::new(),
                target_sources: sources,
            });
        }
        hypotheses.truncate(max);
        HypothesisPlan { hypotheses }
    }

    fn coverage(&self, context: &Value) -> CoverageVote {
        let new = context["delta"]["new_findings"].as_u64().unwrap_or(0);
        let duplicates = context["delta"]["duplicate_findings"].as_u64().unwrap_or(0);
        let total = new + duplicates;
        let novelty = if total == 0 {
            0.0
        } else {
            new as f64 / total as f64
        };
        if new == 0 {
            CoverageVote {
                decision: CoverageVerdict::Stop,
                coverage_score: 0.9,
                confidence: 0.6,
                rationale: "last hypothesis added no new findings".into(),
            }
        } else {
            CoverageVote {
                decision: CoverageVerdict::Continue,
                coverage_score: (1.0 - novelty).clamp(0.0, 1.0),
                confidence: 0.5,
                rationale: format!("{new} new of {total} findings"),
            }
        }
    }

    fn query(&self, context: &Value) -> QueryPlan {
        let mut terms = keywords(str_field(context, "hypothesis"));
        for signal in context["signals"].as_array().into_iter().flatten() {
            for term in keywords(signal.as_str().unwrap_or_default()) {
                if !terms.contains(&term) {
                    terms.push(term);
                }
            }
        }
        terms.truncate(MAX_QUERY_TERMS);
        let query = if terms.is_empty() {
            str_field(context, "goal").to_string()
        } else {
            terms.join(" ")
        };
        QueryPlan {
            query,
            filters: Default::default(),
        }
    }

    fn relevance(&self, context: &Value) -> RelevanceVerdict {
        let needles = keywords(&format!(
            "{} {}",
            str_field(context, "hypothesis"),
            str_field(context, "goal")
        ));
        let candidates = context["candidates"].as_array().cloned().unwrap_or_default();
        let keep = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                needles.is_empty()
                    || keyword_overlap(
                        &needles,
                        &format!("{} {}", str_field(c, "title"), str_field(c, "snippet")),
                    ) > 0
            })
            .map(|(i, _)| i)
            .collect();
        RelevanceVerdict { keep }
    }

    fn reformulate(&self, context: &Value) -> Reformulation {
        let query = str_field(context, "query");
        let terms = keywords(query);
        let simplified = terms.join(" ");
        let query = if simplified.is_empty() || simplified == query {
            terms.into_iter().take(3).collect::<Vec<_>>().join(" ")
        } else {
            simplified
        };
        Reformulation { query }
    }
}

#[async_trait]
impl Oracle for HeuristicOracle {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn decide(&self, kind: PromptKind, context: &Value) -> Result<OracleReply, OracleError> {
        let decision = match kind {
            PromptKind::Assessment => to_value(&self.assess(context))?,
            PromptKind::HypothesisGeneration => to_value(&self.hypotheses(context))?,
            PromptKind::CoverageAssessment => to_value(&self.coverage(context))?,
            PromptKind::QueryGeneration => to_value(&self.query(context))?,
            PromptKind::RelevanceFilter => to_value(&self.relevance(context))?,
            PromptKind::Reformulation => to_value(&self.reformulate(context))?,
        };
        Ok(OracleReply::free(decision))
    }
}

fn to_value<T: Serialize>(decision: &T) -> Result<Value, OracleError> {
    serde_json::to_value(decision).map_err(|e| OracleError::call(e.to_string()))
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or_default()
}

/// Split a comparative question into its sides.
fn split_comparative(question: &str) -> Vec<String> {
    let separators = [" vs. ", " vs ", " versus ", " compared to ", " or "];
    for sep in &separators {
        if question.contains(sep) {
            return question
                .split(sep)
                .map(|s| s.trim().trim_end_matches('?').to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    // Only split on " and " when it looks like a short enumeration.
    if question.contains(" and ") {
        let parts: Vec<String> = question
            .split(" and ")
            .map(|s| s.trim().trim_end_matches('?').to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if parts.len() <= 3 {
            return parts;
        }
    }
    vec![question.to_string()]
}

/// Suggest source names by keyword, restricted to what is available.
fn suggest_sources(question: &str, available: &[String]) -> Vec<String> {
    let lower = question.to_lowercase();
    let mut wanted = vec!["web", "corpus"];
    let rules: [(&[&str], &str); 5] = [
        (&["paper", "research", "arxiv", "study", "studies"], "academic"),
        (&["contract", "award", "procurement", "grant"], "contracts"),
        (&["filing", "annual report", "revenue", "sec ", "10-k"], "filings"),
        (&["patent", "invention"], "patents"),
        (&["news", "announce", "recent", "latest"], "news"),
    ];
    for (needles, source) in rules {
        if needles.iter().any(|n| lower.contains(n)) {
            wanted.push(source);
        }
    }
    let picked: Vec<String> = wanted
        .into_iter()
        .filter(|s| available.iter().any(|a| a == s))
        .map(str::to_string)
        .collect();
    if picked.is_empty() {
        available.to_vec()
    } else {
        picked
    }
}
