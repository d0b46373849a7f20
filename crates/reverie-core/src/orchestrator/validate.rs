//! Validation of extracted structure against the expected result shape
//!
//! The model output is untrusted. Individual bad items are dropped or
//! repaired and counted in a [`ValidationReport`]; only a missing or
//! mistyped top-level field rejects the response as a whole.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::types::{Connection, ConnectionCategory, MetaPattern};

/// How strictly top-level fields are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Complete response: `connections`, `metaPatterns` and `summary` required
    Strict,
    /// Streaming prefix: missing fields are allowed
    Partial,
}

/// Response rejected as a whole
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

/// What validation changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub unknown_ids_dropped: usize,
    pub connections_dropped: usize,
    pub patterns_dropped: usize,
    pub scores_clamped: usize,
    pub categories_remapped: usize,
    pub recommendations_dropped: usize,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Validated response content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedInsights {
    pub connections: Vec<Connection>,
    pub meta_patterns: Vec<MetaPattern>,
    /// `None` only in partial mode before the summary has arrived
    pub summary: Option<String>,
    pub recommendations: Vec<String>,
    pub report: ValidationReport,
}

impl ValidatedInsights {
    /// Whether `self` carries strictly more than `previous` without losing
    /// anything `previous` had
    pub fn refines(&self, previous: &ValidatedInsights) -> bool {
        let grew = self.connections.len() > previous.connections.len()
            || self.meta_patterns.len() > previous.meta_patterns.len()
            || self.recommendations.len() > previous.recommendations.len()
            || (self.summary.is_some() && previous.summary.is_none());
        let kept = self.connections.len() >= previous.connections.len()
            && self.meta_patterns.len() >= previous.meta_patterns.len()
            && self.recommendations.len() >= previous.recommendations.len()
            && (self.summary.is_some() || previous.summary.is_none());
        grew && kept
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
            && self.meta_patterns.is_empty()
            && self.recommendations.is_empty()
            && self.summary.is_none()
    }
}

/// Validate an extracted object against the known entry IDs
pub fn validate_insights(
    raw: &Map<String, Value>,
    known_ids: &HashSet<&str>,
    mode: ValidationMode,
) -> Result<ValidatedInsights, ValidationError> {
    let strict = mode == ValidationMode::Strict;
    let mut report = ValidationReport::default();

    let connections_raw = array_field(raw, &["connections"], "connections", strict)?;
    let patterns_raw = array_field(raw, &["metaPatterns", "meta_patterns"], "metaPatterns", strict)?;

    let summary = match raw.get("summary") {
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(Value::Null) | None if !strict => None,
        None => return Err(ValidationError::MissingField("summary")),
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "summary",
                expected: "a string",
            });
        }
    };

    let connections = connections_raw
        .iter()
        .filter_map(|item| {
            let parsed = validate_connection(item, known_ids, &mut report);
            if parsed.is_none() {
                report.connections_dropped += 1;
            }
            parsed
        })
        .collect();

    let meta_patterns = patterns_raw
        .iter()
        .filter_map(|item| {
            let parsed = validate_pattern(item, known_ids, &mut report);
            if parsed.is_none() {
                report.patterns_dropped += 1;
            }
            parsed
        })
        .collect();

    let recommendations = match raw.get("recommendations") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let text = item.as_str().map(str::trim).filter(|s| !s.is_empty());
                if text.is_none() {
                    report.recommendations_dropped += 1;
                }
                text.map(str::to_string)
            })
            .collect(),
        _ => Vec::new(),
    };

    if !report.is_clean() {
        tracing::debug!(
            unknown_ids = report.unknown_ids_dropped,
            connections_dropped = report.connections_dropped,
            patterns_dropped = report.patterns_dropped,
            scores_clamped = report.scores_clamped,
            categories_remapped = report.categories_remapped,
            "Repaired inference response"
        );
    }

    Ok(ValidatedInsights {
        connections,
        meta_patterns,
        summary,
        recommendations,
        report,
    })
}

fn array_field<'a>(
    raw: &'a Map<String, Value>,
    names: &[&str],
    field: &'static str,
    strict: bool,
) -> Result<&'a [Value], ValidationError> {
    match names.iter().find_map(|name| raw.get(*name)) {
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(Value::Null) | None if !strict => Ok(&[][..]),
        None => Err(ValidationError::MissingField(field)),
        Some(_) => Err(ValidationError::InvalidField {
            field,
            expected: "an array",
        }),
    }
}

fn validate_connection(
    item: &Value,
    known_ids: &HashSet<&str>,
    report: &mut ValidationReport,
) -> Option<Connection> {
    let obj = item.as_object()?;
    let description = non_empty_str(obj.get("description"))?;
    let surprise = score(obj.get("surprise"), report)?;
    let relevance = score(obj.get("relevance"), report)?;
    let entry_ids = known_entry_ids(
        obj.get("entryIds").or_else(|| obj.get("entry_ids")),
        known_ids,
        report,
    );
    if entry_ids.len() < 2 {
        return None;
    }

    let category = match obj.get("category").and_then(Value::as_str) {
        Some(label) => match label.parse::<ConnectionCategory>() {
            Ok(category) => category,
            Err(_) => {
                report.categories_remapped += 1;
                ConnectionCategory::Other
            }
        },
        None => {
            report.categories_remapped += 1;
            ConnectionCategory::Other
        }
    };

    Some(Connection {
        entry_ids,
        description,
        surprise,
        relevance,
        category,
    })
}

fn validate_pattern(
    item: &Value,
    known_ids: &HashSet<&str>,
    report: &mut ValidationReport,
) -> Option<MetaPattern> {
    let obj = item.as_object()?;
    let description = non_empty_str(obj.get("description"))?;
    let confidence = score(obj.get("confidence"), report)?;
    let supporting_entry_ids = known_entry_ids(
        obj.get("supportingEntryIds")
            .or_else(|| obj.get("supporting_entry_ids")),
        known_ids,
        report,
    );
    if supporting_entry_ids.is_empty() {
        return None;
    }
    Some(MetaPattern {
        description,
        confidence,
        supporting_entry_ids,
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Numeric score clamped to [0, 1]. Numeric strings are accepted.
fn score(value: Option<&Value>, report: &mut ValidationReport) -> Option<f64> {
    let raw = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    let clamped = raw.clamp(0.0, 1.0);
    if clamped != raw {
        report.scores_clamped += 1;
    }
    Some(clamped)
}

/// Known IDs in order, deduplicated. Unknown IDs are counted and dropped.
fn known_entry_ids(
    value: Option<&Value>,
    known_ids: &HashSet<&str>,
    report: &mut ValidationReport,
) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let id = match item {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        if !known_ids.contains(id.as_str()) {
            tracing::debug!(id = %id, "Dropping unknown entry id from inference response");
            report.unknown_ids_dropped += 1;
            continue;
        }
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    ids
}
