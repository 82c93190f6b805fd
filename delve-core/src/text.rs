//! Text normalization helpers shared by cycle detection, dedup keys, the
//! heuristic oracle, and the local corpus source.

use std::collections::BTreeSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "how", "in",
    "into", "is", "it", "its", "of", "on", "or", "that", "the", "their", "this", "to", "was",
    "what", "when", "where", "which", "who", "why", "with", "about", "find", "information",
];

/// Lowercase, replace punctuation with spaces, and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Distinct normalized tokens.
pub fn token_set(text: &str) -> BTreeSet<String> {
    normalize(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Content-bearing words in first-seen order, without stopwords or duplicates.
pub fn keywords(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    normalize(text)
        .split_whitespace()
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of two token sets; two empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Number of `needles` that occur as keywords of `haystack`.
pub fn keyword_overlap(needles: &[String], haystack: &str) -> usize {
    let hay: BTreeSet<String> = keywords(haystack).into_iter().collect();
    needles.iter().filter(|n| hay.contains(n.as_str())).count()
}
