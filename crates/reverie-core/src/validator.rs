//! Input validation and formatting
//!
//! Turns raw history records into an [`AnalysisPayload`]:
//!
//! - entities decoded, markup stripped, whitespace collapsed
//! - each entry truncated to a character limit (on a char boundary)
//! - empty entries dropped, then duplicate IDs keep their first occurrence
//! - entries ordered chronologically (stable for equal timestamps)
//! - partitioned into contiguous chunks when the payload exceeds the budget
//!
//! Preparation is pure. Too little usable history yields
//! [`Preparation::Insufficient`], which is a normal outcome, not an error.

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::OnceLock;

use crate::config::ValidatorConfig;
use crate::digest::{Digest, DigestBuilder};
use crate::history::HistoryRecord;

/// Characters per estimated token
const CHARS_PER_TOKEN: usize = 4;

static BLOCK_RE: OnceLock<Regex> = OnceLock::new();
static TAG_RE: OnceLock<Regex> = OnceLock::new();

// SAFETY: literal patterns, compilation cannot fail
fn block_re() -> &'static Regex {
    BLOCK_RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>")
            .expect("block pattern is valid")
    })
}

fn tag_re() -> &'static Regex {
    TAG_RE.get_or_init(|| Regex::new(r"(?s)</?[A-Za-z!][^>]*>").expect("tag pattern is valid"))
}

// ============================================================================
// PAYLOAD
// ============================================================================

/// A normalized history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub tags: Vec<String>,
}

impl NormalizedEntry {
    pub fn char_count(&self) -> usize {
        self.content.chars().count()
    }
}

/// Normalized, bounded, digestible history ready for inference
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisPayload {
    /// Entries in chronological order
    pub entries: Vec<NormalizedEntry>,
    /// Total normalized characters
    pub total_chars: usize,
    /// `ceil(total_chars / 4)`
    pub estimated_tokens: usize,
    /// Content digest of the normalized entries
    pub digest: Digest,
    /// Contiguous, non-overlapping ranges into `entries`
    pub chunks: Vec<Range<usize>>,
}

impl AnalysisPayload {
    /// Entries of chunk `index`
    pub fn chunk(&self, index: usize) -> &[NormalizedEntry] {
        self.chunks
            .get(index)
            .map(|range| &self.entries[range.clone()])
            .unwrap_or(&[])
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Set of all entry IDs in the payload
    pub fn entry_ids(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| e.id.as_str()).collect()
    }
}

/// Not enough usable history to analyse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsufficientData {
    /// Guidance for the user
    pub message: String,
    /// Usable records found
    pub record_count: usize,
    /// Records required
    pub required_records: usize,
    /// Usable characters found
    pub total_chars: usize,
    /// Characters required
    pub required_chars: usize,
}

/// Outcome of preparing a user's history
#[derive(Debug, Clone, PartialEq)]
pub enum Preparation {
    Ready(AnalysisPayload),
    Insufficient(InsufficientData),
}

// ============================================================================
// VALIDATOR
// ============================================================================

/// Validates, normalizes and chunks raw history
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Normalize a single content string
    ///
    /// Entities are decoded before markup is stripped, so escaped markup
    /// cannot come back to life.
    pub fn normalize_content(&self, raw: &str) -> String {
        let decoded = decode_entities(raw);
        let without_blocks = block_re().replace_all(&decoded, " ");
        let without_tags = tag_re().replace_all(&without_blocks, " ");
        let collapsed = without_tags.split_whitespace().collect::<Vec<_>>().join(" ");
        truncate_chars(&collapsed, self.config.max_entry_chars).trim_end().to_string()
    }

    /// Prepare records for analysis
    pub fn prepare(&self, records: &[HistoryRecord]) -> Preparation {
        let mut seen: HashSet<&str> = HashSet::with_capacity(records.len());
        let mut entries: Vec<NormalizedEntry> = Vec::with_capacity(records.len());

        for record in records {
            let content = self.normalize_content(&record.content);
            if content.is_empty() {
                continue;
            }
            // Only usable entries claim their id
            if !seen.insert(record.id.as_str()) {
                tracing::debug!(id = %record.id, "Dropping duplicate history record");
                continue;
            }
            let tags = record
                .tags
                .iter()
                .map(|t| self.normalize_content(t))
                .filter(|t| !t.is_empty())
                .collect();
            entries.push(NormalizedEntry {
                id: record.id.clone(),
                timestamp: record.timestamp,
                content,
                tags,
            });
        }

        // Stable: equal timestamps keep input order
        entries.sort_by_key(|e| e.timestamp);

        let total_chars: usize = entries.iter().map(NormalizedEntry::char_count).sum();

        if entries.len() < self.config.min_records || total_chars < self.config.min_total_chars {
            return Preparation::Insufficient(self.insufficient(entries.len(), total_chars));
        }

        let digest = payload_digest(&entries);
        let chunks = partition(&entries, self.config.chunk_budget_chars);

        tracing::debug!(
            entries = entries.len(),
            total_chars,
            chunks = chunks.len(),
            digest = %digest.short(),
            "Prepared analysis payload"
        );

        Preparation::Ready(AnalysisPayload {
            estimated_tokens: total_chars.div_ceil(CHARS_PER_TOKEN),
            entries,
            total_chars,
            digest,
            chunks,
        })
    }

    fn insufficient(&self, record_count: usize, total_chars: usize) -> InsufficientData {
        let required_records = self.config.min_records;
        let required_chars = self.config.min_total_chars;
        let message = if record_count < required_records {
            let missing = required_records - record_count;
            format!(
                "Not enough history to find patterns yet. Add {} more {} (found {}, need at least {}).",
                missing,
                if missing == 1 { "entry" } else { "entries" },
                record_count,
                required_records
            )
        } else {
            format!(
                "Your entries are too short to analyse yet. Write a little more detail \
                 (found {} characters, need at least {}).",
                total_chars, required_chars
            )
        };
        InsufficientData {
            message,
            record_count,
            required_records,
            total_chars,
            required_chars,
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Digest of raw records for a user (source tier key)
pub fn raw_history_digest(user_id: &str, records: &[HistoryRecord]) -> Digest {
    let mut builder = DigestBuilder::new();
    builder.push(user_id).push(records.len().to_le_bytes());
    for record in records {
        builder
            .push(&record.id)
            .push(record.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .push(&record.content)
            .push(record.tags.len().to_le_bytes());
        for tag in &record.tags {
            builder.push(tag);
        }
    }
    builder.finish()
}

/// Digest of normalized entries, in order
pub fn payload_digest(entries: &[NormalizedEntry]) -> Digest {
    let mut builder = DigestBuilder::new();
    builder.push(entries.len().to_le_bytes());
    for entry in entries {
        builder
            .push(&entry.id)
            .push(entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .push(&entry.content)
            .push(entry.tags.len().to_le_bytes());
        for tag in &entry.tags {
            builder.push(tag);
        }
    }
    builder.finish()
}

/// Greedy, order-preserving partition into ranges within `budget` chars.
/// An entry larger than the budget gets a chunk of its own.
fn partition(entries: &[NormalizedEntry], budget: usize) -> Vec<Range<usize>> {
    if entries.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut size = 0;
    for (i, entry) in entries.iter().enumerate() {
        let len = entry.char_count();
        if i > start && size + len > budget {
            chunks.push(start..i);
            start = i;
            size = 0;
        }
        size += len;
    }
    chunks.push(start..entries.len());
    chunks
}

fn decode_entities(s: &str) -> String {
    // &amp; last so "&amp;lt;" decodes to "&lt;", not "<"
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
