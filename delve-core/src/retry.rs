//! Retry controller for oracle and source calls.
//!
//! Rate-limit and server errors are retried with exponential backoff up to
//! `max_retries`; network errors up to `network_retries`. Authentication and
//! client errors are not retried as-is: the query is reformulated once instead,
//! when a reformulator is available. Exhausting the policy returns the last
//! classified failure to the owning unit.

use crate::budget::Budget;
use crate::classify::{ErrorClassifier, ErrorKind};
use crate::config::RetryConfig;
use crate::error::{FailureReason, OracleError, SourceError};
use crate::events::{EventLog, ResearchEvent};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A failure after classification and retries.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedFailure {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub message: String,
    /// Total attempts made, including the first.
    pub attempts: u32,
}

impl ClassifiedFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
            message: message.into(),
            attempts: 0,
        }
    }

    pub fn as_source_reason(&self) -> FailureReason {
        FailureReason::Source {
            kind: self.kind,
            message: self.message.clone(),
        }
    }

    pub fn as_oracle_reason(&self) -> FailureReason {
        FailureReason::Oracle {
            kind: self.kind,
            message: self.message.clone(),
        }
    }
}

impl std::fmt::Display for ClassifiedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.kind, self.attempts, self.message
        )
    }
}

/// A raw error that can be fed to the classifier.
pub trait RawFailure {
    fn message(&self) -> String;
    fn status(&self) -> Option<u16>;
}

impl RawFailure for SourceError {
    fn message(&self) -> String {
        self.message.clone()
    }

    fn status(&self) -> Option<u16> {
        self.status
    }
}

impl RawFailure for OracleError {
    fn message(&self) -> String {
        self.to_string()
    }

    fn status(&self) -> Option<u16> {
        OracleError::status(self)
    }
}

/// Produces an alternative query after a non-retryable failure.
#[async_trait]
pub trait QueryReformulator: Send + Sync {
    async fn reformulate(&self, query: &str, failure: &ClassifiedFailure) -> Option<String>;
}

/// Applies the retry policy around an async operation.
#[derive(Clone)]
pub struct RetryController {
    config: RetryConfig,
    classifier: Arc<ErrorClassifier>,
    budget: Option<Arc<Budget>>,
    events: Option<Arc<EventLog>>,
}

impl RetryController {
    pub fn new(config: RetryConfig, classifier: Arc<ErrorClassifier>) -> Self {
        Self {
            config,
            classifier,
            budget: None,
            events: None,
        }
    }

    /// Stop retrying once the run's wall-clock or cost budget is spent.
    pub fn with_budget(mut self, budget: Arc<Budget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Retry allowance for a failure kind.
    pub fn limit_for(&self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::RateLimit | ErrorKind::ServerError => self.config.max_retries,
            ErrorKind::Network => self.config.network_retries,
            ErrorKind::Authentication | ErrorKind::ClientError | ErrorKind::Unknown => 0,
        }
    }

    /// Run an operation that takes no query.
    pub async fn run<T, E, F, Fut>(&self, unit: &str, mut operation: F) -> Result<T, ClassifiedFailure>
    where
        E: RawFailure,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_reformulation(unit, String::new(), None, |_| operation())
            .await
            .map(|(value, _)| value)
    }

    /// Run a query-bearing operation. Returns the value and the query that produced it.
    pub async fn run_with_reformulation<T, E, F, Fut>(
        &self,
        unit: &str,
        query: String,
        reformulator: Option<&dyn QueryReformulator>,
        mut operation: F,
    ) -> Result<(T, String), ClassifiedFailure>
    where
        E: RawFailure,
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut query = query;
        let mut retries = 0u32;
        let mut attempts = 0u32;
        let mut reformulated = false;

        loop {
            attempts += 1;
            let err = match operation(query.clone()).await {
                Ok(value) => return Ok((value, query)),
                Err(err) => err,
            };

            let classification = self.classifier.classify(&err.message(), err.status());
            let failure = ClassifiedFailure {
                kind: classification.kind,
                retryable: classification.retryable,
                message: err.message(),
                attempts,
            };

            if self.budget_spent() {
                return Err(failure);
            }

            if failure.retryable && retries < self.limit_for(failure.kind) {
                let backoff = self.config.backoff(retries);
                let backoff_ms = backoff.as_millis() as u64;
                retries += 1;
                tracing::warn!(
                    unit = unit,
                    attempt = retries,
                    max = self.limit_for(failure.kind),
                    kind = %failure.kind,
                    backoff_ms = backoff_ms,
                    error = %failure.message,
                    "Retrying after transient error"
                );
                self.emit_retry(unit, retries, failure.kind, backoff_ms, false);
                tokio::time::sleep(backoff).await;
                if self.budget_spent() {
                    return Err(failure);
                }
                continue;
            }

            if failure.kind.wants_reformulation() && !reformulated {
                if let Some(reformulator) = reformulator {
                    reformulated = true;
                    match reformulator.reformulate(&query, &failure).await {
                        Some(next) if !next.trim().is_empty() && next != query => {
                            tracing::info!(
                                unit = unit,
                                kind = %failure.kind,
                                from = %query,
                                to = %next,
                                "Reformulating query after non-retryable error"
                            );
                            self.emit_retry(unit, retries + 1, failure.kind, 0, true);
                            query = next;
                            continue;
                        }
                        _ => {}
                    }
                }
            }

            return Err(failure);
        }
    }

    fn budget_spent(&self) -> bool {
        self.budget
            .as_ref()
            .is_some_and(|b| !b.check_running().is_ok())
    }

    fn emit_retry(&self, unit: &str, attempt: u32, kind: ErrorKind, backoff_ms: u64, reformulated: bool) {
        if let Some(events) = &self.events {
            events.emit(ResearchEvent::Retry {
                unit: unit.to_string(),
                attempt,
                kind,
                backoff_ms,
                reformulated,
            });
        }
    }
}

impl RetryConfig {
    /// Sleep before retry number `retry` (zero-based): the initial delay grown
    /// by `backoff_multiplier` per retry and capped at `max_backoff_ms`. With
    /// `jitter`, up to a quarter of the capped delay is added on top.
    pub fn backoff(&self, retry: u32) -> Duration {
        let grown = self.initial_backoff_ms as f64
            * self.backoff_multiplier.powi(retry.min(64) as i32);
        let capped_ms = grown.min(self.max_backoff_ms as f64) as u64;
        let spread_ms = if self.jitter {
            (capped_ms as f64 * 0.25 * jitter_fraction()) as u64
        } else {
            0
        };
        Duration::from_millis(capped_ms + spread_ms)
    }
}

/// A fraction in `[0, 1)` taken from the sub-second clock.
fn jitter_fraction() -> f64 {
    f64::from(chrono::Utc::now().timestamp_subsec_micros() % 1000) / 1000.0
}
