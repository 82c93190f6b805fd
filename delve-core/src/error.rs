//! Error types for the delve research engine.
//!
//! Uses `thiserror` for boundary error types (oracle, source, configuration) and a
//! serializable [`FailureReason`] that records why an individual goal or hypothesis
//! ended without results. Failures are recorded on result nodes; a run never throws.

use crate::classify::{ErrorClassifier, ErrorKind};
use crate::oracle::PromptKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level error type for the delve core library.
#[derive(Debug, thiserror::Error)]
pub enum DelveError {
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised at the oracle boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    /// The oracle could not be reached or answered with a failure.
    #[error("oracle call failed: {message}")]
    Call {
        message: String,
        status: Option<u16>,
    },

    /// The oracle answered, but the decision did not match the schema for its kind.
    #[error("oracle response for {kind} failed schema validation: {reason}")]
    SchemaInvalid { kind: PromptKind, reason: String },
}

impl OracleError {
    pub fn call(message: impl Into<String>) -> Self {
        Self::Call {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self::Call {
            message: message.into(),
            status: Some(status),
        }
    }

    /// HTTP-like status attached to the failure, if the transport reported one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Call { status, .. } => *status,
            Self::SchemaInvalid { .. } => None,
        }
    }
}

/// A raw failure from one source call, before classification.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SourceError {
    pub message: String,
    pub status: Option<u16>,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Budget dimension that stopped a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Depth,
    WallTime,
    Cost,
    GoalCount,
}

impl std::fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Depth => "depth",
            Self::WallTime => "wall_time",
            Self::Cost => "cost",
            Self::GoalCount => "goal_count",
        };
        f.write_str(name)
    }
}

/// Why a goal or hypothesis ended without (complete) results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("budget exceeded: {dimension}")]
    BudgetExceeded { dimension: BudgetDimension },

    #[error("cycle detected against ancestor goal")]
    CycleDetected,

    #[error("oracle schema invalid for {kind}")]
    OracleSchemaInvalid { kind: PromptKind },

    #[error("oracle {kind}: {message}")]
    Oracle { kind: ErrorKind, message: String },

    #[error("source {kind}: {message}")]
    Source { kind: ErrorKind, message: String },

    #[error("hypothesis has no valid sources")]
    HypothesisNoValidSources,

    #[error("time budget exhausted after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("no findings produced")]
    NoFindings,
}

impl From<OracleError> for FailureReason {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::SchemaInvalid { kind, .. } => Self::OracleSchemaInvalid { kind },
            OracleError::Call { message, status } => Self::Oracle {
                kind: ErrorClassifier::new().classify(&message, status).kind,
                message,
            },
        }
    }
}

/// A type alias for results using the top-level `DelveError`.
pub type Result<T> = std::result::Result<T, DelveError>;
