//! Source Gateway: a uniform interface over external search collaborators.
//!
//! Sources are identified by the closed [`SourceId`] set. Human-readable names
//! coming from the oracle (`"arxiv"`, `"edgar"`, ...) are resolved through the
//! [`SourceRegistry`] at the mapping boundary; names that do not resolve to a
//! registered source are dropped there and never reach dispatch.

pub mod corpus;
pub mod gateway;
pub mod mock;

pub use corpus::{CorpusDocument, CorpusSource};
pub use gateway::{SourceFailure, SourceGateway, SourceResponse};
pub use mock::MockSource;

use crate::error::SourceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Closed set of source identifiers understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    /// General web search.
    Web,
    /// News articles and press releases.
    News,
    /// Academic papers and preprints.
    Academic,
    /// Corporate and regulatory filings.
    Filings,
    /// Government contract and award databases.
    Contracts,
    /// Patent databases.
    Patents,
    /// A local document collection.
    Corpus,
}

impl SourceId {
    pub const ALL: [SourceId; 7] = [
        SourceId::Web,
        SourceId::News,
        SourceId::Academic,
        SourceId::Filings,
        SourceId::Contracts,
        SourceId::Patents,
        SourceId::Corpus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::News => "news",
            Self::Academic => "academic",
            Self::Filings => "filings",
            Self::Contracts => "contracts",
            Self::Patents => "patents",
            Self::Corpus => "corpus",
        }
    }

    /// Alternate names that resolve to this source.
    fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Web => &["web_search", "search", "google", "bing", "internet"],
            Self::News => &["news_search", "press", "newswire"],
            Self::Academic => &["arxiv", "semantic_scholar", "papers", "scholar", "pubmed"],
            Self::Filings => &["sec", "edgar", "sec_filings", "annual_reports"],
            Self::Contracts => &[
                "usaspending",
                "sam",
                "sam_gov",
                "government_contracts",
                "procurement",
            ],
            Self::Patents => &["uspto", "patent_search", "google_patents"],
            Self::Corpus => &["local", "local_corpus", "documents"],
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for one source query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    /// Source-specific filters (date ranges, categories, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }
}

/// A single normalized result as returned by a source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawResult {
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawResult {
    pub fn new(title: impl Into<String>, url: Option<&str>) -> Self {
        Self {
            title: title.into(),
            url: url.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn with_entities(mut self, entities: &[&str]) -> Self {
        self.entities = entities.iter().map(|e| e.to_string()).collect();
        self
    }
}

/// Trait implemented by every search collaborator.
///
/// Authentication, pagination, and rate-limit handling are the implementor's
/// concern; the engine only sees normalized results or a raw [`SourceError`].
#[async_trait]
pub trait SearchSource: Send + Sync {
    fn id(&self) -> SourceId;

    /// Run one query and return at most `limit` results.
    async fn search(&self, params: &SearchParams, limit: usize)
    -> Result<Vec<RawResult>, SourceError>;

    /// Cheap pre-filter: can this source say anything about `question`?
    fn is_relevant(&self, _question: &str) -> bool {
        true
    }

    /// Turn a goal statement into source-specific query parameters.
    fn generate_query(&self, goal_statement: &str) -> SearchParams {
        SearchParams::new(goal_statement)
    }
}

/// Registered sources plus the name-to-identifier mapping.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<SourceId, Arc<dyn SearchSource>>,
    aliases: HashMap<String, SourceId>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        let mut aliases = HashMap::new();
        for id in SourceId::ALL {
            aliases.insert(id.as_str().to_string(), id);
            for alias in id.aliases() {
                aliases.insert(alias.to_string(), id);
            }
        }
        Self {
            sources: HashMap::new(),
            aliases,
        }
    }

    /// Register a source, replacing any previous source with the same id.
    pub fn register(&mut self, source: Arc<dyn SearchSource>) {
        self.sources.insert(source.id(), source);
    }

    /// Add a custom human-readable name for a source id.
    pub fn add_alias(&mut self, name: &str, id: SourceId) {
        self.aliases.insert(normalize_name(name), id);
    }

    pub fn get(&self, id: SourceId) -> Option<Arc<dyn SearchSource>> {
        self.sources.get(&id).cloned()
    }

    pub fn is_registered(&self, id: SourceId) -> bool {
        self.sources.contains_key(&id)
    }

    /// Registered ids in stable order.
    pub fn ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.sources.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Resolve one human-readable name to a registered source id.
    pub fn resolve(&self, name: &str) -> Option<SourceId> {
        self.aliases
            .get(&normalize_name(name))
            .copied()
            .filter(|id| self.is_registered(*id))
    }

    /// Resolve many names, keeping first-seen order and dropping duplicates.
    /// Returns the resolved ids and the names that did not resolve.
    pub fn resolve_all<S: AsRef<str>>(&self, names: &[S]) -> (Vec<SourceId>, Vec<String>) {
        let mut resolved = Vec::new();
        let mut unknown = Vec::new();
        for name in names {
            match self.resolve(name.as_ref()) {
                Some(id) if !resolved.contains(&id) => resolved.push(id),
                Some(_) => {}
                None => unknown.push(name.as_ref().to_string()),
            }
        }
        (resolved, unknown)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.ids())
            .finish()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace([' ', '-', '.'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(ids: &[SourceId]) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for id in ids {
            registry.register(Arc::new(MockSource::new(*id)));
        }
        registry
    }

    #[test]
    fn test_resolve_aliases() {
        let registry = registry_with(&[SourceId::Academic, SourceId::Filings]);
        assert_eq!(registry.resolve("arXiv"), Some(SourceId::Academic));
        assert_eq!(registry.resolve("Semantic Scholar"), Some(SourceId::Academic));
        assert_eq!(registry.resolve("EDGAR"), Some(SourceId::Filings));
    }

    #[test]
    fn test_unregistered_ids_do_not_resolve() {
        let registry = registry_with(&[SourceId::Web]);
        assert_eq!(registry.resolve("patents"), None);
        assert_eq!(registry.resolve("google"), Some(SourceId::Web));
    }

    #[test]
    fn test_resolve_all_drops_unknown_and_duplicates() {
        let registry = registry_with(&[SourceId::Web, SourceId::News]);
        let (ids, unknown) = registry.resolve_all(&["google", "web", "myspace", "press"]);
        assert_eq!(ids, vec![SourceId::Web, SourceId::News]);
        assert_eq!(unknown, vec!["myspace".to_string()]);
    }

    #[test]
    fn test_custom_alias() {
        let mut registry = registry_with(&[SourceId::Corpus]);
        registry.add_alias("Team Wiki", SourceId::Corpus);
        assert_eq!(registry.resolve("team-wiki"), Some(SourceId::Corpus));
    }

    #[test]
    fn test_source_id_serde() {
        let json = serde_json::to_string(&SourceId::Contracts).unwrap();
        assert_eq!(json, "\"contracts\"");
    }
}
