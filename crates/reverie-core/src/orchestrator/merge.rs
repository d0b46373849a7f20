//! Cross-chunk merge
//!
//! Chunk results are concatenated in chunk order, then emission order.
//! Near-duplicate meta-patterns (equal normalized text, or token Jaccard
//! similarity at or above the threshold) collapse into the first
//! occurrence, which takes the union of supporting IDs and the highest
//! confidence. Connections with the same ID set and normalized
//! description collapse the same way.

use std::collections::{BTreeSet, HashSet};

use crate::types::{Connection, MetaPattern};

/// Lowercase alphanumeric tokens joined by single spaces
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Token-set Jaccard similarity in [0, 1]
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let left: HashSet<&str> = a.split(' ').filter(|t| !t.is_empty()).collect();
    let right: HashSet<&str> = b.split(' ').filter(|t| !t.is_empty()).collect();
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}

/// Merge meta-patterns, collapsing near duplicates
pub fn merge_patterns(patterns: Vec<MetaPattern>, threshold: f64) -> Vec<MetaPattern> {
    let mut merged: Vec<(String, MetaPattern)> = Vec::with_capacity(patterns.len());

    for pattern in patterns {
        let normalized = normalize_text(&pattern.description);
        let existing = merged.iter_mut().find(|(key, _)| {
            *key == normalized || jaccard_similarity(key, &normalized) >= threshold
        });
        match existing {
            Some((_, kept)) => {
                kept.confidence = kept.confidence.max(pattern.confidence);
                for id in pattern.supporting_entry_ids {
                    if !kept.supporting_entry_ids.contains(&id) {
                        kept.supporting_entry_ids.push(id);
                    }
                }
            }
            None => merged.push((normalized, pattern)),
        }
    }

    merged.into_iter().map(|(_, p)| p).collect()
}

/// Merge connections, collapsing exact duplicates
pub fn merge_connections(connections: Vec<Connection>) -> Vec<Connection> {
    let mut merged: Vec<((BTreeSet<String>, String), Connection)> =
        Vec::with_capacity(connections.len());

    for connection in connections {
        let key = (
            connection.entry_ids.iter().cloned().collect::<BTreeSet<_>>(),
            normalize_text(&connection.description),
        );
        match merged.iter_mut().find(|(k, _)| *k == key) {
            Some((_, kept)) => {
                kept.surprise = kept.surprise.max(connection.surprise);
                kept.relevance = kept.relevance.max(connection.relevance);
            }
            None => merged.push((key, connection)),
        }
    }

    merged.into_iter().map(|(_, c)| c).collect()
}

/// Drop repeated recommendations, keeping first-seen order
pub fn merge_recommendations(recommendations: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    recommendations
        .into_iter()
        .filter(|r| seen.insert(normalize_text(r)))
        .collect()
}
