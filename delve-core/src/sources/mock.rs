//! Scripted source for tests and offline demos.

use super::{RawResult, SearchParams, SearchSource, SourceId};
use crate::error::SourceError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type Responder = dyn Fn(&SearchParams) -> Vec<RawResult> + Send + Sync;

/// A source whose answers are fixed up front.
///
/// Queued failures are returned first, one per call; after that the responder
/// (or the fixed result list) answers every call.
pub struct MockSource {
    id: SourceId,
    responder: Arc<Responder>,
    failures: Mutex<VecDeque<SourceError>>,
    always_fail: Option<SourceError>,
    latency: Option<Duration>,
    relevant: bool,
    calls: Arc<AtomicUsize>,
    queries: Mutex<Vec<String>>,
}

impl MockSource {
    /// A source that answers every query with no results.
    pub fn new(id: SourceId) -> Self {
        Self {
            id,
            responder: Arc::new(|_: &SearchParams| Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            always_fail: None,
            latency: None,
            relevant: true,
            calls: Arc::new(AtomicUsize::new(0)),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Answer every query with the same results.
    pub fn with_results(mut self, results: Vec<RawResult>) -> Self {
        self.responder = Arc::new(move |_: &SearchParams| results.clone());
        self
    }

    /// Compute results from the query parameters.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&SearchParams) -> Vec<RawResult> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Fail the next call (calls queue in order).
    pub fn fail_next(self, error: SourceError) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
        self
    }

    /// Fail every call with `error`.
    pub fn always_fail(mut self, error: SourceError) -> Self {
        self.always_fail = Some(error);
        self
    }

    /// Sleep before answering each call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Value returned by the relevance pre-filter.
    pub fn with_relevance(mut self, relevant: bool) -> Self {
        self.relevant = relevant;
        self
    }

    /// Shared handle to the call counter, usable after the source is registered.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Queries received, in call order.
    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SearchSource for MockSource {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn search(
        &self,
        params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<RawResult>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(params.query.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let queued = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = queued.or_else(|| self.always_fail.clone()) {
            return Err(error);
        }

        let mut results = (self.responder)(params);
        results.truncate(limit);
        Ok(results)
    }

    fn is_relevant(&self, _question: &str) -> bool {
        self.relevant
    }
}
