//! Error classification for oracle and source failures.
//!
//! Maps a raw failure (message text plus an optional HTTP-like status) to an
//! [`ErrorKind`] and a retry verdict. When no status is reported, or the status is
//! zero, the message text is pattern-matched to recover the real condition
//! before falling back to [`ErrorKind::Unknown`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Failure taxonomy shared by the oracle and source boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    ServerError,
    /// Malformed query or request rejected by the remote side.
    ClientError,
    Network,
    Unknown,
}

impl ErrorKind {
    /// Whether failures of this kind are retried as-is.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::ServerError | Self::Network)
    }

    /// Whether failures of this kind warrant a single reformulated attempt.
    pub fn wants_reformulation(self) -> bool {
        matches!(self, Self::Authentication | Self::ClientError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::Network => "network",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Result of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl Classification {
    pub fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
        }
    }
}

/// Message patterns in priority order: the first match wins.
static MESSAGE_PATTERNS: LazyLock<Vec<(Regex, ErrorKind)>> = LazyLock::new(|| {
    [
        (
            r"(?i)\b429\b|rate[\s_-]?limit|too many requests|quota exceeded",
            ErrorKind::RateLimit,
        ),
        (
            r"(?i)\b40[13]\b|unauthori[sz]ed|forbidden|invalid api key|authentication|access denied",
            ErrorKind::Authentication,
        ),
        (
            r"(?i)\b5\d\d\b|internal server error|bad gateway|service unavailable|gateway timeout|overloaded",
            ErrorKind::ServerError,
        ),
        (
            r"(?i)timed?\s?out|timeout|connection (refused|reset|closed|aborted)|dns|network|unreachable|broken pipe",
            ErrorKind::Network,
        ),
        (
            r"(?i)\b4(00|04|05|09|10|13|14|15|22)\b|bad request|not found|malformed|invalid (query|request|parameter)|unprocessable",
            ErrorKind::ClientError,
        ),
    ]
    .into_iter()
    .map(|(pattern, kind)| {
        let regex = Regex::new(pattern)
            .unwrap_or_else(|e| panic!("{kind} message pattern does not compile: {e}"));
        (regex, kind)
    })
    .collect()
});

/// Classifies raw failures by status code, then by message patterns.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a failure. A `status` of `None` or `Some(0)` defers to the message.
    pub fn classify(&self, message: &str, status: Option<u16>) -> Classification {
        let kind = match status {
            Some(code) if code != 0 => {
                Self::kind_for_status(code).unwrap_or_else(|| self.kind_for_message(message))
            }
            _ => self.kind_for_message(message),
        };
        Classification::of(kind)
    }

    fn kind_for_status(code: u16) -> Option<ErrorKind> {
        match code {
            401 | 403 => Some(ErrorKind::Authentication),
            429 => Some(ErrorKind::RateLimit),
            408 => Some(ErrorKind::Network),
            400..=499 => Some(ErrorKind::ClientError),
            500..=599 => Some(ErrorKind::ServerError),
            // Informational/success/redirect codes say nothing about the failure.
            _ => None,
        }
    }

    fn kind_for_message(&self, message: &str) -> ErrorKind {
        MESSAGE_PATTERNS
            .iter()
            .find(|(pattern, _)| pattern.is_match(message))
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }
}
