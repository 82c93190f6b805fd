//! Goals, their status state machine, and the result tree.
//!
//! A goal is mutated only by the scheduler invocation that owns it. Children
//! never write into their parent; the parent folds finished child results into
//! its own [`GoalResult`] during synthesis.

use crate::coverage::CoverageOutcome;
use crate::error::FailureReason;
use crate::findings::Finding;
use crate::hypothesis::{Hypothesis, StopReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hierarchical goal identifier: the root is `g0`, its children `g0.0`, `g0.1`, ...
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalId(String);

impl GoalId {
    pub fn root() -> Self {
        Self("g0".to_string())
    }

    pub fn child(&self, index: usize) -> Self {
        Self(format!("{}.{}", self.0, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GoalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for GoalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a goal. Never moves back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Running,
    Decomposed,
    Executed,
    Synthesized,
    Failed,
    Cancelled,
}

impl GoalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Synthesized | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(self, next: GoalStatus) -> bool {
        use GoalStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Decomposed | Executed | Failed | Cancelled),
            Decomposed | Executed => matches!(next, Synthesized | Failed | Cancelled),
            Synthesized | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Decomposed => "decomposed",
            Self::Executed => "executed",
            Self::Synthesized => "synthesized",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A unit of research intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<GoalId>,
    pub statement: String,
    pub depth: usize,
    pub status: GoalStatus,
    /// Findings in discovery order; after synthesis, the merged set for the subtree.
    pub findings: Vec<Finding>,
    /// Metered cost charged by this goal's own calls (not its children).
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Goal {
    pub fn root(statement: impl Into<String>) -> Self {
        Self::new(GoalId::root(), None, statement, 0)
    }

    fn new(id: GoalId, parent: Option<GoalId>, statement: impl Into<String>, depth: usize) -> Self {
        Self {
            id,
            parent,
            statement: statement.into(),
            depth,
            status: GoalStatus::Pending,
            findings: Vec::new(),
            cost_usd: 0.0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Create the `index`-th child one level deeper.
    pub fn child(&self, index: usize, statement: impl Into<String>) -> Self {
        Self::new(
            self.id.child(index),
            Some(self.id.clone()),
            statement,
            self.depth + 1,
        )
    }

    /// Move to `next` if the transition is legal. Illegal moves are logged and ignored.
    pub fn transition(&mut self, next: GoalStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                goal_id = %self.id,
                from = %self.status,
                to = %next,
                "Ignoring illegal goal status transition"
            );
            return false;
        }
        if self.status == GoalStatus::Pending {
            self.started_at = Some(Utc::now());
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }
}

/// How the scheduler handled a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionPath {
    /// Stopped before assessment (budget).
    NotStarted,
    /// The oracle classified the goal as directly executable.
    Executed,
    /// Executed without decomposition because decomposing was not allowed.
    Forced { reason: ForcedReason },
    /// Split into sub-goals.
    Decomposed { tiers: Vec<Vec<GoalId>> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForcedReason {
    /// Statement repeats an ancestor's.
    Cycle { ancestor: GoalId, similarity: f64 },
    /// The goal sits at the maximum depth.
    DepthLimit,
}

/// What a dependent goal receives about one of its prerequisites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyInput {
    pub goal_id: GoalId,
    pub statement: String,
    pub status: GoalStatus,
    pub finding_count: usize,
    /// Leading finding titles, passed to the oracle as context.
    pub titles: Vec<String>,
    /// Set when the prerequisite did not synthesize; describes the missing input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap: Option<String>,
}

impl DependencyInput {
    const MAX_TITLES: usize = 20;

    pub fn from_result(result: &GoalResult) -> Self {
        let gap = match result.goal.status {
            GoalStatus::Synthesized => None,
            status => {
                let missing = if result.goal.findings.is_empty() {
                    "its findings are absent"
                } else {
                    "only partial findings are available"
                };
                Some(match &result.failure {
                    Some(reason) => format!(
                        "prerequisite {} ended {status}: {reason}; {missing}",
                        result.goal.id
                    ),
                    None => format!("prerequisite {} ended {status}; {missing}", result.goal.id),
                })
            }
        };
        Self {
            goal_id: result.goal.id.clone(),
            statement: result.goal.statement.clone(),
            status: result.goal.status,
            finding_count: result.goal.findings.len(),
            titles: result
                .goal
                .findings
                .iter()
                .take(Self::MAX_TITLES)
                .map(|f| f.title.clone())
                .collect(),
            gap,
        }
    }
}

/// Final state of one goal and its subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalResult {
    #[serde(flatten)]
    pub goal: Goal,
    pub path: ExecutionPath,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hypotheses: Vec<Hypothesis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coverage: Vec<CoverageOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_inputs: Vec<DependencyInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<GoalResult>,
    /// Why this goal did not synthesize, if it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Local errors recovered from along the way (fallbacks, failed source calls).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FailureReason>,
    pub elapsed_ms: u64,
}

impl GoalResult {
    /// A goal that never started work, e.g. because a budget ceiling was hit.
    pub fn cancelled(mut goal: Goal, reason: FailureReason) -> Self {
        goal.transition(GoalStatus::Cancelled);
        Self {
            goal,
            path: ExecutionPath::NotStarted,
            hypotheses: Vec::new(),
            stop_reason: None,
            coverage: Vec::new(),
            dependency_inputs: Vec::new(),
            children: Vec::new(),
            failure: Some(reason),
            errors: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn status(&self) -> GoalStatus {
        self.goal.status
    }

    /// Cost of this goal plus its entire subtree.
    pub fn total_cost(&self) -> f64 {
        self.goal.cost_usd + self.children.iter().map(GoalResult::total_cost).sum::<f64>()
    }

    /// Depth-first iterator over this node and every descendant.
    pub fn walk(&self) -> Vec<&GoalResult> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(GoalResult::node_count).sum::<usize>()
    }

    pub fn deepest(&self) -> usize {
        self.children
            .iter()
            .map(GoalResult::deepest)
            .max()
            .unwrap_or(self.goal.depth)
            .max(self.goal.depth)
    }

    /// Find a node by id anywhere in the subtree.
    pub fn find(&self, id: &GoalId) -> Option<&GoalResult> {
        if &self.goal.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }
}
