//! JSON extraction from LLM responses.
//!
//! Models wrap JSON in markdown fences, prefix it with prose, or leave
//! trailing commentary. [`extract_json`] finds the first balanced object;
//! [`parse_llm_json`] layers serde on top. Validation stays with callers.

use serde::de::DeserializeOwned;

/// Strip markdown fences from a response.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

/// Extract the first balanced JSON object from a response (handles models
/// that add surrounding text). Falls back to the trimmed input.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = strip_fences(raw);

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        for (i, c) in remainder.char_indices() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return &remainder[..=i];
                    }
                }
                _ => {}
            }
        }
    }

    trimmed
}

/// Parse a typed value out of an LLM response, tolerating surrounding text.
pub fn parse_llm_json<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(extract_json(raw))
}
