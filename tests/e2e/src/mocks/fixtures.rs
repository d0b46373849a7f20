//! Test Data Factory
//!
//! Realistic history records and model responses:
//! - journal-style histories of any length
//! - responses built from connections and patterns over known entry IDs

use chrono::{DateTime, Duration, TimeZone, Utc};
use reverie_core::HistoryRecord;
use serde_json::{Value, json};

const JOURNAL_LINES: &[&str] = &[
    "Slept badly after a late coffee, sluggish through the morning standup.",
    "Walked to the office instead of driving; felt calmer in the first meeting.",
    "Skipped lunch to finish the report and snapped at a colleague around three.",
    "Evening run by the river, then read for an hour and slept through the night.",
    "Monday again: inbox overload, postponed the gym and ordered takeaway.",
    "Called my sister on the walk home, noticed the tension in my shoulders ease.",
    "Cooked a proper dinner, no screens after nine, woke before the alarm.",
    "Back-to-back calls all afternoon, headache by five, coffee number four.",
];

/// Factory for test histories
pub struct TestDataFactory;

impl TestDataFactory {
    /// First fixture timestamp
    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    /// `n` daily journal entries with IDs `j1..=jn`
    pub fn journal(n: usize) -> Vec<HistoryRecord> {
        (1..=n)
            .map(|i| {
                let line = JOURNAL_LINES[(i - 1) % JOURNAL_LINES.len()];
                let tags = if i % 2 == 0 { vec!["work"] } else { vec!["health"] };
                HistoryRecord::new(
                    Self::entry_id(i),
                    format!("Day {}: {}", i, line),
                    Self::base_time() + Duration::days(i as i64 - 1),
                )
                .with_tags(tags)
            })
            .collect()
    }

    /// A history too thin to analyse
    pub fn sparse() -> Vec<HistoryRecord> {
        vec![
            HistoryRecord::new("s1", "ok", Self::base_time()),
            HistoryRecord::new("s2", "   ", Self::base_time() + Duration::hours(1)),
        ]
    }

    pub fn entry_id(i: usize) -> String {
        format!("j{}", i)
    }
}

/// Builds model responses in the JSON shape the engine expects
#[derive(Debug, Default, Clone)]
pub struct ResponseBuilder {
    connections: Vec<Value>,
    patterns: Vec<Value>,
    summary: String,
    recommendations: Vec<String>,
    preamble: Option<String>,
}

impl ResponseBuilder {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn connection(
        mut self,
        ids: &[&str],
        description: &str,
        surprise: f64,
        relevance: f64,
        category: &str,
    ) -> Self {
        self.connections.push(json!({
            "entryIds": ids,
            "description": description,
            "surprise": surprise,
            "relevance": relevance,
            "category": category,
        }));
        self
    }

    pub fn pattern(mut self, description: &str, confidence: f64, ids: &[&str]) -> Self {
        self.patterns.push(json!({
            "description": description,
            "confidence": confidence,
            "supportingEntryIds": ids,
        }));
        self
    }

    pub fn recommendation(mut self, text: &str) -> Self {
        self.recommendations.push(text.to_string());
        self
    }

    /// Wrap the JSON in chatty prose and a code fence, as models often do
    pub fn chatty(mut self) -> Self {
        self.preamble = Some("Sure! Here is what I found in your history:".to_string());
        self
    }

    pub fn build(&self) -> String {
        let body = json!({
            "connections": self.connections,
            "metaPatterns": self.patterns,
            "summary": self.summary,
            "recommendations": self.recommendations,
        });
        let pretty = serde_json::to_string_pretty(&body).unwrap();
        match &self.preamble {
            Some(preamble) => format!("{}\n```json\n{}\n```\nHope this helps.", preamble, pretty),
            None => pretty,
        }
    }

    /// Two connections and one pattern over `j1..=j5`
    pub fn standard() -> Self {
        Self::new("Your routines outside work shape how your workdays go.")
            .connection(
                &["j2", "j6"],
                "Walking and phone calls on foot both ease tension",
                0.7,
                0.9,
                "behavioral",
            )
            .connection(
                &["j1", "j5"],
                "Poor evenings lead to heavy next mornings",
                0.4,
                0.8,
                "temporal",
            )
            .pattern(
                "Movement during the day precedes calmer evenings",
                0.8,
                &["j2", "j4", "j6"],
            )
            .recommendation("Keep walking to the office at least twice a week")
    }
}
