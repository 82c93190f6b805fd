//! Goal Scheduler: the recursive core loop.
//!
//! For one goal: check the budget, detect cycles against the ancestor chain,
//! ask the oracle whether to execute or decompose, then either explore the goal
//! through the [`HypothesisEngine`] or pursue its sub-goals tier by tier, and
//! finally synthesize everything into one [`GoalResult`]. Children run
//! concurrently within a tier and hand their results back by value; nothing
//! below a goal writes into it.

use crate::budget::BudgetCheck;
use crate::context::RunContext;
use crate::error::{BudgetDimension, FailureReason};
use crate::events::ResearchEvent;
use crate::findings::{Finding, merge};
use crate::goal::{DependencyInput, ExecutionPath, ForcedReason, Goal, GoalId, GoalResult, GoalStatus};
use crate::hypothesis::{HypothesisEngine, HypothesisRun, StopReason};
use crate::oracle::{AssessmentAction, AssessmentDecision, CostMeter, SubGoalSpec};
use crate::text::{jaccard, token_set};
use futures::future::{BoxFuture, FutureExt, join_all};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// A goal on the path from the root to the goal being pursued.
#[derive(Debug, Clone, Serialize)]
pub struct Ancestor {
    pub id: GoalId,
    pub statement: String,
}

/// Token-set similarity of two goal statements in `[0, 1]`.
pub fn statement_similarity(a: &str, b: &str) -> f64 {
    jaccard(&token_set(a), &token_set(b))
}

/// Partition sub-goals into dependency tiers (Kahn's algorithm).
///
/// `deps[i]` lists the indices sub-goal `i` waits for. Every member of a tier
/// depends only on members of earlier tiers. Members keep index order.
pub fn dependency_tiers(deps: &[Vec<usize>]) -> Result<Vec<Vec<usize>>, String> {
    let n = deps.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, list) in deps.iter().enumerate() {
        let mut seen = Vec::new();
        for &dep in list {
            if dep >= n {
                return Err(format!("sub-goal {i} depends on unknown sub-goal {dep}"));
            }
            if dep == i {
                return Err(format!("sub-goal {i} depends on itself"));
            }
            if !seen.contains(&dep) {
                seen.push(dep);
                indegree[i] += 1;
                dependents[dep].push(i);
            }
        }
    }

    let mut tiers = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut placed = 0;
    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &i in &current {
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    next.push(d);
                }
            }
        }
        next.sort_unstable();
        tiers.push(current);
        current = next;
    }

    if placed != n {
        return Err("sub-goal dependencies contain a cycle".into());
    }
    Ok(tiers)
}

/// Keep the first `max` sub-goals and drop dependencies on removed ones.
fn truncate_sub_goals(mut sub_goals: Vec<SubGoalSpec>, max: usize) -> Vec<SubGoalSpec> {
    if sub_goals.len() <= max {
        return sub_goals;
    }
    sub_goals.truncate(max);
    for sub in &mut sub_goals {
        sub.depends_on.retain(|&d| d < max);
    }
    sub_goals
}

/// What the scheduler decided to do with a goal.
enum Plan {
    Execute(ExecutionPath),
    Decompose(Vec<SubGoalSpec>),
}

pub struct GoalScheduler {
    ctx: Arc<RunContext>,
    hypotheses: HypothesisEngine,
}

impl GoalScheduler {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        let hypotheses = HypothesisEngine::new(ctx.clone());
        Self { ctx, hypotheses }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Pursue `goal` to a terminal status. Never fails: every outcome is a node.
    pub fn pursue_goal<'a>(
        &'a self,
        goal: Goal,
        ancestors: Vec<Ancestor>,
        dependencies: Vec<DependencyInput>,
    ) -> BoxFuture<'a, GoalResult> {
        async move { self.pursue(goal, ancestors, dependencies).await }.boxed()
    }

    async fn pursue(
        &self,
        mut goal: Goal,
        ancestors: Vec<Ancestor>,
        dependencies: Vec<DependencyInput>,
    ) -> GoalResult {
        let started = Instant::now();

        let admitted = match self.ctx.budget.check_launch(goal.depth) {
            BudgetCheck::Ok => self.ctx.budget.try_reserve_goal(),
            exceeded => exceeded,
        };
        if let BudgetCheck::Exceeded(dimension) = admitted {
            return self.refuse(goal, dimension, dependencies);
        }

        goal.transition(GoalStatus::Running);
        tracing::info!(
            goal_id = %goal.id,
            depth = goal.depth,
            statement = %goal.statement,
            "Pursuing goal"
        );
        self.ctx.events.emit(ResearchEvent::GoalStarted {
            goal_id: goal.id.clone(),
            depth: goal.depth,
            statement: goal.statement.clone(),
        });

        let meter = CostMeter::new();
        let mut errors = Vec::new();

        let plan = match self.forced_execution(&goal, &ancestors) {
            Some(reason) => {
                if matches!(reason, ForcedReason::Cycle { .. }) {
                    errors.push(FailureReason::CycleDetected);
                }
                self.emit_assessment(&goal, AssessmentAction::Execute, 0, Some(&reason), None);
                Plan::Execute(ExecutionPath::Forced { reason })
            }
            None => match self
                .assess(&goal, &ancestors, &dependencies, &meter, &mut errors)
                .await
            {
                Ok(plan) => plan,
                Err(dimension) => {
                    let mut result = self.finish(
                        goal,
                        ExecutionPath::NotStarted,
                        None,
                        Vec::new(),
                        dependencies,
                        errors,
                        &meter,
                        started,
                    );
                    result.goal.transition(GoalStatus::Cancelled);
                    result.failure = Some(FailureReason::BudgetExceeded { dimension });
                    self.emit_finished(&result);
                    return result;
                }
            },
        };

        let result = match plan {
            Plan::Execute(path) => {
                let run = self.hypotheses.run(&goal, &dependencies, &meter).await;
                let interrupted = budget_interruption(&run);
                goal.transition(GoalStatus::Executed);
                let mut result = self.finish(
                    goal,
                    path,
                    Some(run),
                    Vec::new(),
                    dependencies,
                    errors,
                    &meter,
                    started,
                );
                self.settle(&mut result, interrupted);
                result
            }
            Plan::Decompose(sub_goals) => {
                goal.transition(GoalStatus::Decomposed);
                let (path, children, skipped) = self.decompose(&goal, &ancestors, sub_goals).await;
                let mut result =
                    self.finish(goal, path, None, children, dependencies, errors, &meter, started);
                let interrupted = skipped.or_else(|| {
                    let child_cancelled = result
                        .children
                        .iter()
                        .any(|c| c.status() == GoalStatus::Cancelled);
                    match self.ctx.budget.check_running() {
                        BudgetCheck::Exceeded(dimension) if child_cancelled => Some(dimension),
                        _ => None,
                    }
                });
                self.settle(&mut result, interrupted);
                result
            }
        };

        self.emit_finished(&result);
        result
    }

    /// A goal refused at entry: cancelled before any work.
    fn refuse(
        &self,
        goal: Goal,
        dimension: BudgetDimension,
        dependencies: Vec<DependencyInput>,
    ) -> GoalResult {
        tracing::info!(goal_id = %goal.id, dimension = %dimension, "Budget exceeded; goal cancelled");
        self.ctx.events.emit(ResearchEvent::BudgetExceeded {
            goal_id: goal.id.clone(),
            dimension,
        });
        let mut result = GoalResult::cancelled(goal, FailureReason::BudgetExceeded { dimension });
        result.dependency_inputs = dependencies;
        self.emit_finished(&result);
        result
    }

    /// Decide whether decomposition is off the table for this goal.
    fn forced_execution(&self, goal: &Goal, ancestors: &[Ancestor]) -> Option<ForcedReason> {
        let threshold = self.ctx.config.cycle_similarity;
        let closest = ancestors
            .iter()
            .map(|a| (a, statement_similarity(&goal.statement, &a.statement)))
            .filter(|(_, similarity)| *similarity >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((ancestor, similarity)) = closest {
            tracing::warn!(
                goal_id = %goal.id,
                ancestor = %ancestor.id,
                similarity,
                "Goal repeats an ancestor; forcing direct execution"
            );
            self.ctx.events.emit(ResearchEvent::CycleDetected {
                goal_id: goal.id.clone(),
                ancestor: ancestor.id.clone(),
                similarity,
            });
            return Some(ForcedReason::Cycle {
                ancestor: ancestor.id.clone(),
                similarity,
            });
        }
        if goal.depth >= self.ctx.budget.max_depth() {
            return Some(ForcedReason::DepthLimit);
        }
        None
    }

    /// Ask the oracle to classify the goal. Errors other than budget exhaustion
    /// fall back to direct execution.
    async fn assess(
        &self,
        goal: &Goal,
        ancestors: &[Ancestor],
        dependencies: &[DependencyInput],
        meter: &CostMeter,
        errors: &mut Vec<FailureReason>,
    ) -> Result<Plan, BudgetDimension> {
        let max_sub_goals = self.ctx.config.max_sub_goals;
        let context = serde_json::json!({
            "goal": goal.statement,
            "goal_id": goal.id,
            "depth": goal.depth,
            "max_depth": self.ctx.budget.max_depth(),
            "ancestors": ancestors,
            "dependency_inputs": dependencies,
            "max_sub_goals": max_sub_goals,
            "budget": self.ctx.budget.snapshot(),
        });

        let decision = match self.ctx.oracle.decide::<AssessmentDecision>(&context, meter).await {
            Ok(decision) => decision,
            Err(FailureReason::BudgetExceeded { dimension }) => return Err(dimension),
            Err(reason) => {
                tracing::warn!(
                    goal_id = %goal.id,
                    reason = %reason,
                    "Assessment failed; executing directly"
                );
                let fallback = reason.to_string();
                errors.push(reason);
                self.emit_assessment(goal, AssessmentAction::Execute, 0, None, Some(fallback));
                return Ok(Plan::Execute(ExecutionPath::Executed));
            }
        };

        match decision.action {
            AssessmentAction::Execute => {
                self.emit_assessment(goal, AssessmentAction::Execute, 0, None, decision.rationale);
                Ok(Plan::Execute(ExecutionPath::Executed))
            }
            AssessmentAction::Decompose => {
                let proposed = decision.sub_goals.len();
                let sub_goals = truncate_sub_goals(decision.sub_goals, max_sub_goals);
                if sub_goals.len() < proposed {
                    tracing::info!(
                        goal_id = %goal.id,
                        proposed,
                        kept = sub_goals.len(),
                        "Truncated decomposition"
                    );
                }
                self.emit_assessment(
                    goal,
                    AssessmentAction::Decompose,
                    sub_goals.len(),
                    None,
                    decision.rationale,
                );
                Ok(Plan::Decompose(sub_goals))
            }
        }
    }

    /// Pursue sub-goals tier by tier. Returns the path, the child results in
    /// sub-goal order, and the budget dimension that prevented a launch, if any.
    async fn decompose(
        &self,
        goal: &Goal,
        ancestors: &[Ancestor],
        sub_goals: Vec<SubGoalSpec>,
    ) -> (ExecutionPath, Vec<GoalResult>, Option<BudgetDimension>) {
        let deps: Vec<Vec<usize>> = sub_goals.iter().map(|s| s.depends_on.clone()).collect();
        // Already checked during validation; a single tier is the safe reading.
        let tiers = dependency_tiers(&deps).unwrap_or_else(|_| vec![(0..sub_goals.len()).collect()]);
        let children: Vec<Goal> = sub_goals
            .iter()
            .enumerate()
            .map(|(i, spec)| goal.child(i, spec.statement.clone()))
            .collect();

        let tier_ids: Vec<Vec<GoalId>> = tiers
            .iter()
            .map(|tier| tier.iter().map(|&i| children[i].id.clone()).collect())
            .collect();
        tracing::info!(goal_id = %goal.id, tiers = ?tier_ids, "Decomposed goal");
        self.ctx.events.emit(ResearchEvent::Decomposition {
            goal_id: goal.id.clone(),
            tiers: tier_ids.clone(),
        });

        let mut child_ancestors = ancestors.to_vec();
        child_ancestors.push(Ancestor {
            id: goal.id.clone(),
            statement: goal.statement.clone(),
        });

        let mut results: Vec<Option<GoalResult>> = vec![None; children.len()];
        let mut skipped = None;

        for tier in &tiers {
            let mut launches = Vec::new();
            for &i in tier {
                let child = children[i].clone();
                if let BudgetCheck::Exceeded(dimension) = self.ctx.budget.check_launch(child.depth) {
                    skipped.get_or_insert(dimension);
                    let inputs = self.dependency_inputs(&child, &deps[i], &results);
                    results[i] = Some(self.refuse(child, dimension, inputs));
                    continue;
                }
                let inputs = self.dependency_inputs(&child, &deps[i], &results);
                launches.push((i, self.pursue_goal(child, child_ancestors.clone(), inputs)));
            }
            let (indices, futures): (Vec<usize>, Vec<_>) = launches.into_iter().unzip();
            for (i, result) in indices.into_iter().zip(join_all(futures).await) {
                results[i] = Some(result);
            }
        }

        (
            ExecutionPath::Decomposed { tiers: tier_ids },
            results.into_iter().flatten().collect(),
            skipped,
        )
    }

    /// Describe each finished prerequisite of `child`, noting gaps.
    fn dependency_inputs(
        &self,
        child: &Goal,
        deps: &[usize],
        results: &[Option<GoalResult>],
    ) -> Vec<DependencyInput> {
        deps.iter()
            .filter_map(|&d| results.get(d).and_then(Option::as_ref))
            .map(|prerequisite| {
                let input = DependencyInput::from_result(prerequisite);
                if let Some(gap) = &input.gap {
                    tracing::info!(
                        goal_id = %child.id,
                        prerequisite = %input.goal_id,
                        gap = %gap,
                        "Proceeding without complete prerequisite"
                    );
                    self.ctx.events.emit(ResearchEvent::DependencyGap {
                        goal_id: child.id.clone(),
                        prerequisite: input.goal_id.clone(),
                        status: input.status,
                    });
                }
                input
            })
            .collect()
    }

    /// Assemble the result node and merge own and child findings.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        mut goal: Goal,
        path: ExecutionPath,
        run: Option<HypothesisRun>,
        children: Vec<GoalResult>,
        dependencies: Vec<DependencyInput>,
        mut errors: Vec<FailureReason>,
        meter: &CostMeter,
        started: Instant,
    ) -> GoalResult {
        let (own, hypotheses, coverage, stop_reason) = match run {
            Some(run) => {
                errors.extend(run.errors);
                (run.findings, run.hypotheses, run.coverage, run.stop_reason)
            }
            None => (Vec::new(), Vec::new(), Vec::new(), None),
        };
        let child_findings: Vec<Finding> = children
            .iter()
            .flat_map(|c| c.goal.findings.iter().cloned())
            .collect();
        goal.findings = merge(own.into_iter().chain(child_findings));
        goal.cost_usd = meter.total_usd();

        GoalResult {
            goal,
            path,
            hypotheses,
            stop_reason,
            coverage,
            dependency_inputs: dependencies,
            children,
            failure: None,
            errors,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Apply the terminal status: cancelled when the budget interrupted the work,
    /// failed when nothing was found, synthesized otherwise.
    fn settle(&self, result: &mut GoalResult, interrupted: Option<BudgetDimension>) {
        if let Some(dimension) = interrupted {
            result.goal.transition(GoalStatus::Cancelled);
            result.failure = Some(FailureReason::BudgetExceeded { dimension });
        } else if result.goal.findings.is_empty() {
            result.goal.transition(GoalStatus::Failed);
            result.failure = Some(FailureReason::NoFindings);
        } else {
            result.goal.transition(GoalStatus::Synthesized);
        }
    }

    fn emit_assessment(
        &self,
        goal: &Goal,
        action: AssessmentAction,
        sub_goals: usize,
        forced: Option<&ForcedReason>,
        rationale: Option<String>,
    ) {
        let override_reason = forced.map(|reason| match reason {
            ForcedReason::Cycle { .. } => "cycle".to_string(),
            ForcedReason::DepthLimit => "depth_limit".to_string(),
        });
        self.ctx.events.emit(ResearchEvent::Assessment {
            goal_id: goal.id.clone(),
            action: action.to_string(),
            sub_goals,
            override_reason,
            rationale,
        });
    }

    fn emit_finished(&self, result: &GoalResult) {
        tracing::info!(
            goal_id = %result.goal.id,
            status = %result.status(),
            findings = result.goal.findings.len(),
            elapsed_ms = result.elapsed_ms,
            "Goal finished"
        );
        self.ctx.events.emit(ResearchEvent::GoalFinished {
            goal_id: result.goal.id.clone(),
            status: result.status(),
            findings: result.goal.findings.len(),
            cost_usd: result.goal.cost_usd,
            elapsed_ms: result.elapsed_ms,
        });
    }
}

/// The budget dimension that cut an execution short, if any unit reported one.
fn budget_interruption(run: &HypothesisRun) -> Option<BudgetDimension> {
    let from_reason = |reason: &FailureReason| match reason {
        FailureReason::BudgetExceeded { dimension } => Some(*dimension),
        _ => None,
    };
    if let Some(StopReason::BudgetExceeded { dimension }) = &run.stop_reason {
        return Some(*dimension);
    }
    run.errors
        .iter()
        .chain(run.hypotheses.iter().flat_map(|h| {
            h.metrics
                .error
                .iter()
                .chain(h.metrics.source_errors.iter())
        }))
        .find_map(from_reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tiers_follow_dependencies() {
        let tiers = dependency_tiers(&[vec![], vec![], vec![0, 1]]).unwrap();
        assert_eq!(tiers, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_tiers_chain() {
        let tiers = dependency_tiers(&[vec![1], vec![2], vec![]]).unwrap();
        assert_eq!(tiers, vec![vec![2], vec![1], vec![0]]);
    }

    #[test]
    fn test_tiers_reject_cycles() {
        assert!(dependency_tiers(&[vec![1], vec![0]]).is_err());
        assert!(dependency_tiers(&[vec![0]]).is_err());
        assert!(dependency_tiers(&[vec![5]]).is_err());
    }

    #[test]
    fn test_tiers_ignore_duplicate_edges() {
        let tiers = dependency_tiers(&[vec![], vec![0, 0]]).unwrap();
        assert_eq!(tiers, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_truncation_prunes_dangling_dependencies() {
        let subs = vec![
            SubGoalSpec::new("a"),
            SubGoalSpec::new("b"),
            SubGoalSpec::new("c").after(&[0, 1]),
        ];
        let kept = truncate_sub_goals(subs, 2);
        assert_eq!(kept.len(), 2);

        let subs = vec![
            SubGoalSpec::new("a").after(&[2]),
            SubGoalSpec::new("b"),
            SubGoalSpec::new("c"),
        ];
        let kept = truncate_sub_goals(subs, 2);
        assert!(kept[0].depends_on.is_empty());
    }

    #[test]
    fn test_similarity() {
        assert_eq!(statement_similarity("Find Acme contracts", "find ACME contracts!"), 1.0);
        assert!(statement_similarity("Acme contracts", "Globex patents") < 0.1);
    }
}
