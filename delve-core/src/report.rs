//! Markdown outline of a research run.
//!
//! Renders any result tree, including partial ones: every node carries its
//! status, and failed or cancelled nodes say why.

use crate::engine::ResearchRun;
use crate::goal::{ExecutionPath, ForcedReason, GoalResult, GoalStatus};
use crate::hypothesis::HypothesisStatus;

/// Generates outline reports from a finished run.
pub struct ReportGenerator;

impl ReportGenerator {
    /// Full report: header, goal tree, findings, failures, budget.
    pub fn render(run: &ResearchRun) -> String {
        let mut out = format!("# Research Report: {}\n\n", run.question);
        out.push_str(&Self::header_line(run));

        out.push_str("\n## Goal Tree\n\n");
        Self::render_node(&mut out, &run.root);

        out.push_str("\n## Findings\n\n");
        if run.findings().is_empty() {
            out.push_str("_No findings._\n");
        }
        for (i, finding) in run.findings().iter().enumerate() {
            let tags: Vec<String> = finding.attributions.iter().map(|t| t.to_string()).collect();
            out.push_str(&format!(
                "{}. **{}** ({}) [{}]\n",
                i + 1,
                finding.title,
                finding.source,
                tags.join(", ")
            ));
            if let Some(ref url) = finding.url {
                out.push_str(&format!("   {url}\n"));
            }
            if !finding.snippet.is_empty() {
                out.push_str(&format!("   > {}\n", finding.snippet));
            }
        }

        let unsuccessful = run.unsuccessful();
        if !unsuccessful.is_empty() {
            out.push_str("\n## Failures\n\n");
            for node in unsuccessful {
                let reason = node
                    .failure
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "no reason recorded".to_string());
                out.push_str(&format!(
                    "- `{}` {}: {}\n",
                    node.goal.id,
                    node.status(),
                    reason
                ));
            }
        }

        let budget = &run.budget;
        out.push_str("\n## Budget\n\n");
        out.push_str(&format!(
            "- Cost: ${:.4} used, ${:.4} remaining\n",
            budget.cost_used_usd, budget.cost_remaining_usd
        ));
        out.push_str(&format!(
            "- Goals: {} used, {} remaining\n",
            budget.goals_used, budget.goals_remaining
        ));
        out.push_str(&format!(
            "- Time: {}ms elapsed, {}ms remaining\n",
            budget.elapsed_ms, budget.time_remaining_ms
        ));
        out.push_str(&format!(
            "- Depth: {} reached of {}\n",
            run.root.deepest(),
            budget.max_depth
        ));
        out.push_str(&format!("- Peak concurrency: {}\n", run.peak_concurrency));

        out
    }

    /// One-paragraph summary for terminal output.
    pub fn summary(run: &ResearchRun) -> String {
        let mut out = format!("# Research Summary: {}\n\n", run.question);
        out.push_str(&Self::header_line(run));
        let failed = run.unsuccessful();
        if !failed.is_empty() {
            let ids: Vec<String> = failed.iter().map(|n| n.goal.id.to_string()).collect();
            out.push_str(&format!("\nIncomplete goals: {}\n", ids.join(", ")));
        }
        out
    }

    fn header_line(run: &ResearchRun) -> String {
        format!(
            "**Status:** {} | **Findings:** {} | **Goals:** {} | **Cost:** ${:.4} | **Elapsed:** {}ms\n",
            run.status(),
            run.findings().len(),
            run.root.node_count(),
            run.budget.cost_used_usd,
            run.budget.elapsed_ms,
        )
    }

    fn render_node(out: &mut String, node: &GoalResult) {
        let indent = "  ".repeat(node.goal.depth);
        out.push_str(&format!(
            "{indent}- [{}] `{}` {}",
            node.status(),
            node.goal.id,
            node.goal.statement
        ));
        match &node.path {
            ExecutionPath::Forced {
                reason: ForcedReason::Cycle { ancestor, .. },
            } => out.push_str(&format!(" (forced: repeats {ancestor})")),
            ExecutionPath::Forced {
                reason: ForcedReason::DepthLimit,
            } => out.push_str(" (forced: depth limit)"),
            _ => {}
        }
        out.push_str(&format!(" ({} findings)\n", node.goal.findings.len()));

        if node.status() != GoalStatus::Synthesized {
            if let Some(ref reason) = node.failure {
                out.push_str(&format!("{indent}  - reason: {reason}\n"));
            }
        }
        for input in &node.dependency_inputs {
            if let Some(ref gap) = input.gap {
                out.push_str(&format!("{indent}  - gap: {gap}\n"));
            }
        }
        if let Some(ref stop) = node.stop_reason {
            out.push_str(&format!("{indent}  - hypotheses stopped: {stop}\n"));
        }
        for h in &node.hypotheses {
            let marker = match h.status {
                HypothesisStatus::Succeeded => "ok",
                HypothesisStatus::Failed => "failed",
                HypothesisStatus::Pending => "planned",
                HypothesisStatus::Running => "running",
            };
            out.push_str(&format!(
                "{indent}  - {} [{marker}] {} ({} kept)",
                h.id, h.statement, h.metrics.kept_results
            ));
            if let Some(ref error) = h.metrics.error {
                out.push_str(&format!(": {error}"));
            }
            out.push('\n');
        }

        for child in &node.children {
            Self::render_node(out, child);
        }
    }
}
