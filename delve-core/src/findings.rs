//! Normalized findings, attribution tags, and the deduplicating merger.
//!
//! A finding's dedup key comes from its canonical URL when one can be parsed,
//! otherwise from its normalized title. Merging keeps the first-seen record for
//! each key and unions the attribution tags of every later duplicate into it, so
//! a result corroborated by several branches surfaces once with every
//! contributor listed.

use crate::goal::GoalId;
use crate::hypothesis::HypothesisId;
use crate::sources::{RawResult, SourceId};
use crate::text::normalize;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Query parameters that never change what a URL points at.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "ref", "ref_src", "mc_cid", "mc_eid"];

/// Which execution unit produced a finding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributionTag {
    pub goal: GoalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<HypothesisId>,
}

impl AttributionTag {
    pub fn goal(goal: GoalId) -> Self {
        Self {
            goal,
            hypothesis: None,
        }
    }

    pub fn hypothesis(goal: GoalId, hypothesis: HypothesisId) -> Self {
        Self {
            goal,
            hypothesis: Some(hypothesis),
        }
    }
}

impl std::fmt::Display for AttributionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.hypothesis {
            Some(h) => write!(f, "{}/{}", self.goal, h),
            None => write!(f, "{}", self.goal),
        }
    }
}

/// One normalized unit of evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Dedup key (`url:` or `title:` prefixed).
    pub key: String,
    pub source: SourceId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub snippet: String,
    /// Entity names mentioned by this finding.
    #[serde(default)]
    pub entities: Vec<String>,
    /// Source-specific fields, opaque to the engine.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub attributions: BTreeSet<AttributionTag>,
}

impl Finding {
    /// Build a finding from a raw source result, tagged with its producer.
    pub fn from_raw(raw: RawResult, source: SourceId, tag: AttributionTag) -> Self {
        let key = dedup_key(raw.url.as_deref(), &raw.title);
        let mut entities = Vec::new();
        for entity in raw.entities {
            let entity = entity.trim().to_string();
            if !entity.is_empty() && !entities.contains(&entity) {
                entities.push(entity);
            }
        }
        Self {
            key,
            source,
            title: raw.title,
            url: raw.url,
            snippet: raw.snippet,
            entities,
            payload: raw.payload,
            attributions: BTreeSet::from([tag]),
        }
    }

    /// Record an entity mention if it is not already present (case-insensitive).
    pub fn add_entity(&mut self, entity: &str) {
        let lowered = entity.to_lowercase();
        if !self.entities.iter().any(|e| e.to_lowercase() == lowered) {
            self.entities.push(entity.to_string());
        }
    }
}

/// Compute the dedup key for a result.
pub fn dedup_key(url: Option<&str>, title: &str) -> String {
    if let Some(canonical) = url.and_then(canonical_url) {
        return format!("url:{canonical}");
    }
    format!("title:{}", normalize(title))
}

/// Canonical form of a URL: scheme-less, lowercase host without `www.`, no
/// fragment, no tracking parameters, sorted query, no trailing slash.
fn canonical_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = url::Url::parse(trimmed).ok()?;
    let Some(host) = parsed.host_str() else {
        // Opaque identifiers such as `doi:10.1000/182` are canonical as-is.
        return Some(trimmed.to_string());
    };
    let host = host.trim_start_matches("www.");

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    let mut out = String::from(host);
    if let Some(port) = parsed.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(parsed.path().trim_end_matches('/'));
    if !params.is_empty() {
        let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        out.push('?');
        out.push_str(&query.join("&"));
    }
    Some(out)
}

/// Ordered, key-unique collection of findings with an entity index.
#[derive(Debug, Clone, Default)]
pub struct FindingSet {
    items: Vec<Finding>,
    index: HashMap<String, usize>,
    entities: HashSet<String>,
}

impl FindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a finding. Returns `true` if its key was new; otherwise its
    /// attribution tags are unioned into the canonical record.
    pub fn insert(&mut self, finding: Finding) -> bool {
        for entity in &finding.entities {
            self.entities.insert(entity.to_lowercase());
        }
        match self.index.get(&finding.key) {
            Some(&pos) => {
                self.items[pos].attributions.extend(finding.attributions);
                false
            }
            None => {
                self.index.insert(finding.key.clone(), self.items.len());
                self.items.push(finding);
                true
            }
        }
    }

    pub fn extend(&mut self, findings: impl IntoIterator<Item = Finding>) {
        for finding in findings {
            self.insert(finding);
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Whether an entity (case-insensitive) has been seen.
    pub fn knows_entity(&self, entity: &str) -> bool {
        self.entities.contains(&entity.to_lowercase())
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[Finding] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<Finding> {
        self.items
    }
}

/// Collapse duplicate findings. Pure and idempotent: `merge(merge(x)) == merge(x)`.
pub fn merge(findings: impl IntoIterator<Item = Finding>) -> Vec<Finding> {
    let mut set = FindingSet::new();
    set.extend(findings);
    set.into_vec()
}
