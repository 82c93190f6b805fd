//! # Delve Core
//!
//! Recursive research engine. A question becomes a tree of goals; each goal is
//! either decomposed into dependent sub-goals or executed as a set of search
//! hypotheses against registered sources. Findings are deduplicated with
//! attribution and folded back up the tree under hard budgets for depth, wall
//! time, cost, and goal count.

pub mod artifacts;
pub mod budget;
pub mod classify;
pub mod config;
pub mod context;
pub mod coverage;
pub mod engine;
pub mod error;
pub mod events;
pub mod findings;
pub mod goal;
pub mod hypothesis;
pub mod limiter;
pub mod oracle;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod sources;
pub mod text;

// Re-export commonly used types at the crate root.
pub use artifacts::{ArtifactPaths, RunMetrics};
pub use budget::{Budget, BudgetCheck, BudgetSnapshot};
pub use classify::{Classification, ErrorClassifier, ErrorKind};
pub use config::{
    BudgetConfig, HypothesisConfig, HypothesisMode, ResearchConfig, RetryConfig, load_config,
};
pub use engine::{ResearchEngine, ResearchRun};
pub use error::{
    BudgetDimension, ConfigError, DelveError, FailureReason, OracleError, Result, SourceError,
};
pub use events::{EventRecord, EventSink, JsonlEventSink, MemoryEventSink, ResearchEvent};
pub use findings::{AttributionTag, Finding, merge};
pub use goal::{ExecutionPath, Goal, GoalId, GoalResult, GoalStatus};
pub use hypothesis::{Hypothesis, HypothesisId, HypothesisStatus, StopReason};
pub use oracle::{HeuristicOracle, HttpOracle, MockOracle, Oracle, OracleReply, PromptKind};
pub use report::ReportGenerator;
pub use sources::{
    CorpusSource, MockSource, RawResult, SearchParams, SearchSource, SourceId, SourceRegistry,
};
