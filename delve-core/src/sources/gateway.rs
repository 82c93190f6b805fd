//! Dispatch of one query to one registered source, under the global limiter
//! and the retry policy.

use super::{RawResult, SearchParams, SourceId, SourceRegistry};
use crate::classify::ErrorKind;
use crate::error::{FailureReason, SourceError};
use crate::limiter::ConcurrencyLimiter;
use crate::retry::{ClassifiedFailure, QueryReformulator, RetryController};

/// Normalized results of a successful source call.
#[derive(Debug, Clone)]
pub struct SourceResponse {
    pub source: SourceId,
    pub results: Vec<RawResult>,
    /// The query that finally succeeded (differs from the request after reformulation).
    pub query_used: String,
}

/// A source call that failed after classification and retries.
#[derive(Debug, Clone, thiserror::Error)]
#[error("source {source_id} failed: {failure}")]
pub struct SourceFailure {
    pub source_id: SourceId,
    pub failure: ClassifiedFailure,
}

impl SourceFailure {
    pub fn reason(&self) -> FailureReason {
        self.failure.as_source_reason()
    }
}

/// Uniform entry point to every registered source.
#[derive(Clone)]
pub struct SourceGateway {
    registry: SourceRegistry,
    retry: RetryController,
    limiter: ConcurrencyLimiter,
}

impl SourceGateway {
    pub fn new(registry: SourceRegistry, retry: RetryController, limiter: ConcurrencyLimiter) -> Self {
        Self {
            registry,
            retry,
            limiter,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Issue `params` to `source`, returning at most `limit` results.
    ///
    /// A limiter permit is held for each attempt and released during backoff.
    pub async fn search(
        &self,
        source: SourceId,
        params: SearchParams,
        limit: usize,
        reformulator: Option<&dyn QueryReformulator>,
    ) -> Result<SourceResponse, SourceFailure> {
        let Some(connector) = self.registry.get(source) else {
            return Err(SourceFailure {
                source_id: source,
                failure: ClassifiedFailure::new(
                    ErrorKind::ClientError,
                    format!("source {source} is not registered"),
                ),
            });
        };

        let unit = format!("source:{source}");
        let filters = params.filters.clone();
        let outcome = self
            .retry
            .run_with_reformulation(&unit, params.query, reformulator, |query| {
                let connector = connector.clone();
                let limiter = self.limiter.clone();
                let params = SearchParams {
                    query,
                    filters: filters.clone(),
                };
                async move {
                    let _permit = limiter
                        .acquire()
                        .await
                        .ok_or_else(|| SourceError::new("concurrency limiter closed"))?;
                    connector.search(&params, limit).await
                }
            })
            .await;

        match outcome {
            Ok((mut results, query_used)) => {
                results.truncate(limit);
                tracing::debug!(
                    source = %source,
                    query = %query_used,
                    results = results.len(),
                    "Source call succeeded"
                );
                Ok(SourceResponse {
                    source,
                    results,
                    query_used,
                })
            }
            Err(failure) => {
                tracing::warn!(
                    source = %source,
                    kind = %failure.kind,
                    attempts = failure.attempts,
                    error = %failure.message,
                    "Source call failed"
                );
                Err(SourceFailure {
                    source_id: source,
                    failure,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClassifier;
    use crate::config::RetryConfig;
    use crate::sources::MockSource;
    use std::sync::Arc;

    fn gateway(sources: Vec<MockSource>, capacity: usize) -> SourceGateway {
        let mut registry = SourceRegistry::new();
        for source in sources {
            registry.register(Arc::new(source));
        }
        let retry = RetryController::new(
            RetryConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 10,
                jitter: false,
                ..Default::default()
            },
            Arc::new(ErrorClassifier::new()),
        );
        SourceGateway::new(registry, retry, ConcurrencyLimiter::new(capacity))
    }

    #[tokio::test]
    async fn test_search_truncates_to_limit() {
        let source = MockSource::new(SourceId::Web).with_responder(|params| {
            (0..5)
                .map(|i| RawResult::new(format!("{} {i}", params.query), None))
                .collect()
        });
        let gw = gateway(vec![source], 2);
        let response = gw
            .search(SourceId::Web, SearchParams::new("acme"), 3, None)
            .await
            .unwrap();
        assert_eq!(response.results.len(), 3);
        assert_eq!(response.query_used, "acme");
    }

    #[tokio::test]
    async fn test_unregistered_source_is_client_error() {
        let gw = gateway(vec![], 1);
        let err = gw
            .search(SourceId::Patents, SearchParams::new("x"), 3, None)
            .await
            .unwrap_err();
        assert_eq!(err.failure.kind, ErrorKind::ClientError);
        assert_eq!(err.source_id, SourceId::Patents);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let source = MockSource::new(SourceId::News)
            .fail_next(SourceError::with_status("unavailable", 503))
            .with_results(vec![RawResult::new("story", Some("https://news.example/1"))]);
        let calls = source.call_counter();
        let gw = gateway(vec![source], 1);
        let response = gw
            .search(SourceId::News, SearchParams::new("acme"), 10, None)
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_message_only_rate_limit_is_classified() {
        let source = MockSource::new(SourceId::Web).always_fail(SourceError::new("upstream said 429"));
        let gw = gateway(vec![source], 1);
        let err = gw
            .search(SourceId::Web, SearchParams::new("q"), 10, None)
            .await;
        // Retries are exhausted after backoff; the last error keeps its classification.
        let err = err.unwrap_err();
        assert_eq!(err.failure.kind, ErrorKind::RateLimit);
        assert!(err.failure.retryable);
    }
}
