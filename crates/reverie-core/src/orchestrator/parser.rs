//! Tolerant extraction of JSON structure from free-form model output
//!
//! Models wrap JSON in prose and code fences, or stop mid-object while
//! streaming. This stage only finds structure. Whether that structure
//! is acceptable is decided by `validate`.

use serde_json::{Map, Value};

/// Extraction failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// No balanced `{...}` region in the text
    #[error("no JSON object found in response")]
    NoStructure,
    /// Balanced regions were found but none parsed as an object
    #[error("invalid JSON in response: {0}")]
    Invalid(String),
}

/// Extract the first well-formed JSON object embedded in `text`
///
/// A balanced region that fails to parse is skipped as a whole.
pub fn extract_structure(text: &str) -> Result<Map<String, Value>, ParseError> {
    let mut last_error = None;
    let mut from = 0;

    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        let Some(end) = balanced_end(text.as_bytes(), start) else {
            from = start + 1;
            continue;
        };
        match serde_json::from_str::<Value>(&text[start..=end]) {
            Ok(Value::Object(map)) => return Ok(map),
            Ok(_) => {}
            Err(e) => last_error = Some(e.to_string()),
        }
        from = end + 1;
    }

    Err(match last_error {
        Some(e) => ParseError::Invalid(e),
        None => ParseError::NoStructure,
    })
}

/// Best-effort parse of an incomplete object.
///
/// Cuts the text after the last complete nested value and closes every
/// container still open at that point. A complete object is returned as is.
/// Balanced non-JSON regions before the object (`{a, b}` in prose) are
/// skipped.
pub fn extract_partial(text: &str) -> Option<Map<String, Value>> {
    let mut from = 0;
    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        match scan_partial(text, start) {
            PartialScan::Closed { object: Some(map), .. } => return Some(map),
            PartialScan::Closed { end, object: None } => from = end + 1,
            PartialScan::Open(Some(map)) => return Some(map),
            PartialScan::Open(None) | PartialScan::Mismatched => from = start + 1,
        }
    }
    None
}

enum PartialScan {
    /// The region starting at `start` closed at `end`
    Closed {
        end: usize,
        object: Option<Map<String, Value>>,
    },
    /// Text ended with containers still open
    Open(Option<Map<String, Value>>),
    Mismatched,
}

fn scan_partial(text: &str, start: usize) -> PartialScan {
    let bytes = text.as_bytes();

    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    // (cut position, closers needed at that position)
    let mut cuts: Vec<(usize, String)> = Vec::new();

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return PartialScan::Mismatched;
                }
                if stack.is_empty() {
                    return PartialScan::Closed {
                        end: i,
                        object: parse_object(&text[start..=i]),
                    };
                }
                let closers = stack.iter().rev().map(|&c| c as char).collect();
                cuts.push((i + 1, closers));
            }
            _ => {}
        }
    }

    PartialScan::Open(
        cuts.iter()
            .rev()
            .find_map(|(pos, closers)| parse_object(&format!("{}{}", &text[start..*pos], closers))),
    )
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Index of the `}` matching the `{` at `start`, skipping string contents
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
