//! Shared budget ledger for one research run.
//!
//! Every goal and hypothesis reads the ledger before starting work and every
//! metered call writes to it. Counters are atomics so concurrent units can
//! increment-and-compare without a lock. One `Budget` exists per run and is
//! passed around behind an `Arc`; several runs in one process never share one.

use crate::config::BudgetConfig;
use crate::error::BudgetDimension;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Costs are stored in micro-dollars so they fit an atomic integer.
const MICROS_PER_USD: f64 = 1_000_000.0;

/// The result of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Ok,
    Exceeded(BudgetDimension),
}

impl BudgetCheck {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn into_result(self) -> Result<(), BudgetDimension> {
        match self {
            Self::Ok => Ok(()),
            Self::Exceeded(dimension) => Err(dimension),
        }
    }
}

/// Ceilings plus live counters for one run.
#[derive(Debug)]
pub struct Budget {
    max_depth: usize,
    max_cost_micros: u64,
    max_goal_count: usize,
    started: Instant,
    deadline: Instant,
    cost_micros: AtomicU64,
    goal_count: AtomicUsize,
}

impl Budget {
    /// Create a ledger whose wall-clock deadline starts counting now.
    pub fn new(config: &BudgetConfig) -> Self {
        let started = Instant::now();
        Self {
            max_depth: config.max_depth,
            max_cost_micros: to_micros(config.max_cost_usd),
            max_goal_count: config.max_goal_count,
            started,
            deadline: started + config.max_wall_time(),
            cost_micros: AtomicU64::new(0),
            goal_count: AtomicUsize::new(0),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Check the dimensions that stop in-flight work: wall time and cost.
    pub fn check_running(&self) -> BudgetCheck {
        if Instant::now() >= self.deadline {
            return BudgetCheck::Exceeded(BudgetDimension::WallTime);
        }
        if self.cost_micros.load(Ordering::Acquire) >= self.max_cost_micros {
            return BudgetCheck::Exceeded(BudgetDimension::Cost);
        }
        BudgetCheck::Ok
    }

    /// Check whether a new unit at `depth` may start. Does not reserve a goal slot.
    pub fn check_launch(&self, depth: usize) -> BudgetCheck {
        if depth > self.max_depth {
            return BudgetCheck::Exceeded(BudgetDimension::Depth);
        }
        if let BudgetCheck::Exceeded(dimension) = self.check_running() {
            return BudgetCheck::Exceeded(dimension);
        }
        if self.goal_count.load(Ordering::Acquire) >= self.max_goal_count {
            return BudgetCheck::Exceeded(BudgetDimension::GoalCount);
        }
        BudgetCheck::Ok
    }

    /// Atomically claim one goal slot if the ceiling allows it.
    pub fn try_reserve_goal(&self) -> BudgetCheck {
        let max = self.max_goal_count;
        match self
            .goal_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            }) {
            Ok(_) => BudgetCheck::Ok,
            Err(_) => BudgetCheck::Exceeded(BudgetDimension::GoalCount),
        }
    }

    /// Charge a cost increment. Returns `Exceeded(Cost)` if the ledger is now at or
    /// past the ceiling; the charge is recorded either way.
    pub fn record_cost(&self, usd: f64) -> BudgetCheck {
        let delta = to_micros(usd);
        let previous = self.cost_micros.fetch_add(delta, Ordering::AcqRel);
        let total = previous.saturating_add(delta);
        if total >= self.max_cost_micros {
            if previous < self.max_cost_micros {
                tracing::warn!(
                    spent_usd = total as f64 / MICROS_PER_USD,
                    limit_usd = self.max_cost_micros as f64 / MICROS_PER_USD,
                    "Cost ceiling reached; no new units will launch"
                );
            }
            return BudgetCheck::Exceeded(BudgetDimension::Cost);
        }
        BudgetCheck::Ok
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_micros.load(Ordering::Acquire) as f64 / MICROS_PER_USD
    }

    pub fn goal_count(&self) -> usize {
        self.goal_count.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn time_remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Point-in-time view used in oracle prompts and run metrics.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let cost_used = self.cost_usd();
        let max_cost = self.max_cost_micros as f64 / MICROS_PER_USD;
        let goals_used = self.goal_count();
        BudgetSnapshot {
            max_depth: self.max_depth,
            elapsed_ms: self.elapsed().as_millis() as u64,
            time_remaining_ms: self.time_remaining().as_millis() as u64,
            cost_used_usd: cost_used,
            cost_remaining_usd: (max_cost - cost_used).max(0.0),
            goals_used,
            goals_remaining: self.max_goal_count.saturating_sub(goals_used),
        }
    }
}

/// Serializable view of a [`Budget`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub max_depth: usize,
    pub elapsed_ms: u64,
    pub time_remaining_ms: u64,
    pub cost_used_usd: f64,
    pub cost_remaining_usd: f64,
    pub goals_used: usize,
    pub goals_remaining: usize,
}

fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * MICROS_PER_USD).round() as u64
    } else {
        0
    }
}
