//! Property-based tests for the pure parts of the engine using proptest.

use proptest::prelude::*;

use delve_core::budget::{Budget, BudgetCheck};
use delve_core::classify::{ErrorClassifier, ErrorKind};
use delve_core::config::BudgetConfig;
use delve_core::error::BudgetDimension;
use delve_core::findings::{AttributionTag, Finding, merge};
use delve_core::goal::GoalId;
use delve_core::hypothesis::HypothesisId;
use delve_core::scheduler::dependency_tiers;
use delve_core::sources::{RawResult, SourceId};
use std::collections::{BTreeSet, HashSet};

fn finding_strategy() -> impl Strategy<Value = Finding> {
    (
        0usize..6,
        prop::option::of(0usize..6),
        prop_oneof![Just("g0"), Just("g0.0"), Just("g0.1")],
        prop::option::of(0usize..3),
        any::<bool>(),
    )
        .prop_map(|(title, url, goal, hypothesis, trailing_slash)| {
            let url = url.map(|u| {
                let slash = if trailing_slash { "/" } else { "" };
                format!("https://www.example.com/doc/{u}{slash}")
            });
            let tag = match hypothesis {
                Some(h) => AttributionTag::hypothesis(GoalId::from(goal), HypothesisId(h)),
                None => AttributionTag::goal(GoalId::from(goal)),
            };
            Finding::from_raw(
                RawResult::new(format!("Title {title}"), url.as_deref()),
                SourceId::Web,
                tag,
            )
        })
}

// --- Merge properties ---

proptest! {
    #[test]
    fn merge_is_idempotent(findings in prop::collection::vec(finding_strategy(), 0..40)) {
        let once = merge(findings);
        let twice = merge(once.clone());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn merge_size_equals_distinct_keys(findings in prop::collection::vec(finding_strategy(), 0..40)) {
        let keys: HashSet<String> = findings.iter().map(|f| f.key.clone()).collect();
        let merged = merge(findings);
        prop_assert_eq!(merged.len(), keys.len());
        let merged_keys: HashSet<&str> = merged.iter().map(|f| f.key.as_str()).collect();
        prop_assert_eq!(merged_keys.len(), merged.len());
    }

    #[test]
    fn merge_never_loses_attribution(findings in prop::collection::vec(finding_strategy(), 1..40)) {
        let merged = merge(findings.clone());
        for original in &findings {
            let canonical = merged.iter().find(|f| f.key == original.key).unwrap();
            prop_assert!(original.attributions.is_subset(&canonical.attributions));
        }
    }

    #[test]
    fn merge_is_order_insensitive_in_tags(findings in prop::collection::vec(finding_strategy(), 1..30)) {
        let forward = merge(findings.clone());
        let mut reversed_input = findings;
        reversed_input.reverse();
        let backward = merge(reversed_input);
        for f in &forward {
            let other = backward.iter().find(|b| b.key == f.key).unwrap();
            prop_assert_eq!(&f.attributions, &other.attributions);
        }
    }
}

// --- Classifier properties ---

proptest! {
    #[test]
    fn classifier_is_total(message in ".{0,80}", status in prop::option::of(any::<u16>())) {
        let classification = ErrorClassifier::new().classify(&message, status);
        prop_assert_eq!(classification.retryable, classification.kind.is_retryable());
    }

    #[test]
    fn status_wins_over_message(message in "[a-z ]{0,40}") {
        let classifier = ErrorClassifier::new();
        prop_assert_eq!(classifier.classify(&message, Some(429)).kind, ErrorKind::RateLimit);
        prop_assert_eq!(classifier.classify(&message, Some(503)).kind, ErrorKind::ServerError);
        prop_assert_eq!(classifier.classify(&message, Some(401)).kind, ErrorKind::Authentication);
    }
}

// --- Dependency tier properties ---

fn acyclic_deps() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..10).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    prop::collection::vec(0..i, 0..3).boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

proptest! {
    #[test]
    fn tiers_place_every_goal_after_its_prerequisites(deps in acyclic_deps()) {
        let tiers = dependency_tiers(&deps).unwrap();
        let mut tier_of = vec![usize::MAX; deps.len()];
        for (t, tier) in tiers.iter().enumerate() {
            for &i in tier {
                prop_assert_eq!(tier_of[i], usize::MAX);
                tier_of[i] = t;
            }
        }
        prop_assert!(tier_of.iter().all(|&t| t != usize::MAX));
        for (i, list) in deps.iter().enumerate() {
            for &d in list {
                prop_assert!(tier_of[d] < tier_of[i]);
            }
        }
    }

    #[test]
    fn back_edge_makes_tiers_fail(deps in acyclic_deps()) {
        let n = deps.len();
        prop_assume!(n >= 2);
        let mut cyclic = deps;
        cyclic[0].push(n - 1);
        // Close the loop along a chain n-1 -> ... -> 0.
        for i in 1..n {
            cyclic[i].push(i - 1);
        }
        prop_assert!(dependency_tiers(&cyclic).is_err());
    }
}

// --- Budget properties ---

proptest! {
    #[test]
    fn depth_ceiling_is_exact(max_depth in 0usize..8, depth in 0usize..16) {
        let check = tokio_test::block_on(async {
            let budget = Budget::new(&BudgetConfig {
                max_depth,
                max_wall_time_secs: 60,
                max_cost_usd: 1.0,
                max_goal_count: 10,
            });
            budget.check_launch(depth)
        });
        if depth > max_depth {
            prop_assert_eq!(check, BudgetCheck::Exceeded(BudgetDimension::Depth));
        } else {
            prop_assert_eq!(check, BudgetCheck::Ok);
        }
    }

    #[test]
    fn goal_reservations_never_exceed_ceiling(max in 1usize..20, attempts in 0usize..40) {
        let granted = tokio_test::block_on(async {
            let budget = Budget::new(&BudgetConfig {
                max_depth: 3,
                max_wall_time_secs: 60,
                max_cost_usd: 1.0,
                max_goal_count: max,
            });
            (0..attempts).filter(|_| budget.try_reserve_goal().is_ok()).count()
        });
        prop_assert_eq!(granted, attempts.min(max));
    }
}

#[test]
fn tags_sort_goal_before_hypotheses() {
    let tags: BTreeSet<AttributionTag> = [
        AttributionTag::hypothesis(GoalId::from("g0"), HypothesisId(1)),
        AttributionTag::goal(GoalId::from("g0")),
    ]
    .into_iter()
    .collect();
    let rendered: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    assert_eq!(rendered, vec!["g0", "g0/h1"]);
}
