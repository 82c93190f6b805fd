//! Local document collection searched by keyword overlap.

use super::{RawResult, SearchParams, SearchSource, SourceId};
use crate::error::{DelveError, SourceError};
use crate::text::{keyword_overlap, keywords};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Snippet length in characters.
const SNIPPET_CHARS: usize = 240;

/// One document of a local corpus file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusDocument {
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub entities: Vec<String>,
}

/// Source backed by an in-memory list of documents.
#[derive(Debug, Clone, Default)]
pub struct CorpusSource {
    documents: Vec<CorpusDocument>,
}

impl CorpusSource {
    pub fn new(documents: Vec<CorpusDocument>) -> Self {
        Self { documents }
    }

    /// Load a JSON array of documents.
    pub fn load(path: &Path) -> Result<Self, DelveError> {
        let content = std::fs::read_to_string(path)?;
        let documents: Vec<CorpusDocument> = serde_json::from_str(&content)?;
        tracing::info!(path = %path.display(), documents = documents.len(), "Loaded corpus");
        Ok(Self::new(documents))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn score(&self, needles: &[String], doc: &CorpusDocument) -> usize {
        let haystack = format!("{} {} {}", doc.title, doc.text, doc.entities.join(" "));
        keyword_overlap(needles, &haystack)
    }
}

#[async_trait]
impl SearchSource for CorpusSource {
    fn id(&self) -> SourceId {
        SourceId::Corpus
    }

    async fn search(
        &self,
        params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<RawResult>, SourceError> {
        let needles = keywords(&params.query);
        if needles.is_empty() {
            return Err(SourceError::with_status(
                format!("query '{}' has no searchable terms", params.query),
                400,
            ));
        }

        let mut scored: Vec<(usize, &CorpusDocument)> = self
            .documents
            .iter()
            .map(|doc| (self.score(&needles, doc), doc))
            .filter(|(score, _)| *score > 0)
            .collect();
        // Stable sort keeps file order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, doc)| RawResult {
                title: doc.title.clone(),
                url: doc.url.clone(),
                snippet: doc.text.chars().take(SNIPPET_CHARS).collect(),
                entities: doc.entities.clone(),
                payload: serde_json::json!({ "score": score, "terms": needles.len() }),
            })
            .collect())
    }

    fn is_relevant(&self, question: &str) -> bool {
        let needles = keywords(question);
        self.documents
            .iter()
            .any(|doc| self.score(&needles, doc) > 0)
    }

    fn generate_query(&self, goal_statement: &str) -> SearchParams {
        let terms = keywords(goal_statement);
        if terms.is_empty() {
            SearchParams::new(goal_statement)
        } else {
            SearchParams::new(terms.join(" "))
        }
    }
}
