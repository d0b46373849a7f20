//! Prompt construction
//!
//! The prompt text is deterministic for a given chunk and parameter set, so
//! its digest doubles as the response-cache key.

use crate::types::{AnalysisParameters, ConnectionCategory, ResponseFormat};
use crate::validator::NormalizedEntry;

/// Builder for insight discovery prompts
#[derive(Debug, Clone)]
pub struct InsightPromptBuilder {
    /// Task framing placed before the entries
    system_prompt: String,
}

impl Default for InsightPromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InsightPromptBuilder {
    pub fn new() -> Self {
        Self {
            system_prompt: Self::default_system_prompt().to_string(),
        }
    }

    /// Set a custom task framing
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Build the prompt for one chunk of entries
    pub fn build(
        &self,
        entries: &[NormalizedEntry],
        params: &AnalysisParameters,
        chunk_index: usize,
        chunk_count: usize,
    ) -> String {
        let mut prompt = String::with_capacity(
            self.system_prompt.len() + entries.iter().map(|e| e.content.len() + 64).sum::<usize>() + 1024,
        );

        prompt.push_str(&self.system_prompt);
        prompt.push_str("\n\n");

        if chunk_count > 1 {
            prompt.push_str(&format!(
                "This is part {} of {} of the user's history. Analyse only the entries below.\n\n",
                chunk_index + 1,
                chunk_count
            ));
        }

        if let Some(focus) = params.normalized_focus() {
            prompt.push_str(&format!(
                "Pay particular attention to anything related to: {}\n\n",
                focus
            ));
        }

        prompt.push_str("ENTRIES:\n");
        for entry in entries {
            prompt.push_str(&format_entry(entry));
            prompt.push('\n');
        }

        prompt.push('\n');
        prompt.push_str(format_hint(params.response_format));
        prompt.push_str("\n\n");
        prompt.push_str(&output_schema());
        prompt
    }

    const fn default_system_prompt() -> &'static str {
        "You are an insight discovery assistant. You read a person's journal-style \
history and find non-obvious connections between entries and recurring higher-level \
patterns. Only reference entries by the IDs shown in square brackets. Never invent IDs."
    }
}

/// `[id] timestamp #tag #tag: content`
fn format_entry(entry: &NormalizedEntry) -> String {
    let tags: String = entry.tags.iter().map(|t| format!(" #{}", t)).collect();
    format!(
        "[{}] {}{}: {}",
        entry.id,
        entry.timestamp.format("%Y-%m-%d %H:%M"),
        tags,
        entry.content
    )
}

fn format_hint(format: ResponseFormat) -> &'static str {
    match format {
        ResponseFormat::Detailed => {
            "Write full-sentence descriptions and include practical recommendations."
        }
        ResponseFormat::Concise => {
            "Be brief: one short sentence per description, at most 5 connections, \
             3 patterns and 3 recommendations."
        }
    }
}

fn output_schema() -> String {
    let categories: Vec<String> = ConnectionCategory::all()
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect();
    format!(
        r#"Respond with a single JSON object and nothing else:
{{
  "connections": [
    {{
      "entryIds": ["<id>", "<id>"],
      "description": "<how the entries relate>",
      "surprise": <0.0-1.0>,
      "relevance": <0.0-1.0>,
      "category": {}
    }}
  ],
  "metaPatterns": [
    {{
      "description": "<recurring pattern>",
      "confidence": <0.0-1.0>,
      "supportingEntryIds": ["<id>", "..."]
    }}
  ],
  "summary": "<2-3 sentence overview>",
  "recommendations": ["<actionable suggestion>"]
}}"#,
        categories.join(" | ")
    )
}
