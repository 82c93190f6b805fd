//! Per-run shared state handed to every scheduler and hypothesis invocation.

use crate::budget::Budget;
use crate::classify::ErrorClassifier;
use crate::config::ResearchConfig;
use crate::events::EventLog;
use crate::limiter::ConcurrencyLimiter;
use crate::oracle::{Oracle, OracleClient};
use crate::retry::RetryController;
use crate::sources::{SourceGateway, SourceId, SourceRegistry};
use std::sync::Arc;

/// Everything one research run shares across its units.
///
/// Only the budget and the limiter are mutated concurrently; both are
/// internally synchronized.
pub struct RunContext {
    pub config: ResearchConfig,
    pub budget: Arc<Budget>,
    pub limiter: ConcurrencyLimiter,
    pub oracle: OracleClient,
    pub gateway: SourceGateway,
    pub events: Arc<EventLog>,
}

impl RunContext {
    pub fn new(
        config: ResearchConfig,
        oracle: Arc<dyn Oracle>,
        registry: SourceRegistry,
        events: Arc<EventLog>,
    ) -> Self {
        let budget = Arc::new(Budget::new(&config.budget));
        let limiter = ConcurrencyLimiter::new(config.max_concurrent_units);
        let retry = RetryController::new(config.retry.clone(), Arc::new(ErrorClassifier::new()))
            .with_budget(budget.clone())
            .with_events(events.clone());
        let oracle = OracleClient::new(oracle, retry.clone(), limiter.clone(), budget.clone());
        let gateway = SourceGateway::new(registry, retry, limiter.clone());
        Self {
            config,
            budget,
            limiter,
            oracle,
            gateway,
            events,
        }
    }

    /// Configured default sources that are registered, falling back to every
    /// registered source.
    pub fn default_sources(&self) -> Vec<SourceId> {
        let registry = self.gateway.registry();
        let (resolved, unknown) = registry.resolve_all(&self.config.default_sources);
        if !unknown.is_empty() {
            tracing::debug!(unknown = ?unknown, "Ignoring unregistered default sources");
        }
        if resolved.is_empty() {
            registry.ids()
        } else {
            resolved
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("oracle", &self.oracle.name())
            .field("sources", self.gateway.registry())
            .field("budget", &self.budget)
            .finish()
    }
}
