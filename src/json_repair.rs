//! Repair of malformed LLM JSON output.
//!
//! The repair pass is an explicit state machine over the text, not a chain
//! of fallbacks driven by parse exceptions: excess closing braces are
//! dropped, unbalanced braces/brackets are closed, trailing commas before
//! closers are removed, and content nested under a known wrapper field that
//! itself holds a JSON string is unwrapped.

use tracing::debug;

/// Wrapper fields some model deployments nest the real payload under.
const WRAPPER_FIELDS: &[&str] = &["extracted_text"];

/// Result of the parse-or-repair pipeline.
#[derive(Debug)]
pub enum ParsedJson {
    /// Parsed as-is.
    Clean(serde_json::Value),
    /// Parsed only after repair.
    Repaired(serde_json::Value),
}

impl ParsedJson {
    pub fn into_value(self) -> serde_json::Value {
        match self {
            ParsedJson::Clean(v) | ParsedJson::Repaired(v) => v,
        }
    }

    pub fn was_repaired(&self) -> bool {
        matches!(self, ParsedJson::Repaired(_))
    }
}

/// Strip a markdown code fence if the response is wrapped in one.
pub fn extract_json_block(response: &str) -> &str {
    if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    }
}

/// Parse LLM output as JSON, repairing and unwrapping as needed.
///
/// On total failure the repaired text is returned so the caller can decide
/// what to do with it.
pub fn parse_or_repair(response: &str) -> Result<ParsedJson, String> {
    let block = extract_json_block(response);

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(block) {
        return Ok(ParsedJson::Clean(unwrap_wrapper(value)));
    }

    let repaired = repair(block);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&repaired) {
        debug!("JSON repair succeeded ({} -> {} chars)", block.len(), repaired.len());
        return Ok(ParsedJson::Repaired(unwrap_wrapper(value)));
    }

    // Last resort: pull out an "entities" array by scanning.
    if let Some(entities) = extract_entities_array(block) {
        debug!("Recovered entities array from malformed response");
        return Ok(ParsedJson::Repaired(serde_json::json!({ "entities": entities })));
    }

    Err(repaired)
}

/// Apply the structural repair rules.
pub fn repair(content: &str) -> String {
    strip_trailing_commas(&rebalance(content))
}

/// If the payload is nested under a wrapper field as a JSON string, parse
/// and return the nested document instead.
pub fn unwrap_wrapper(value: serde_json::Value) -> serde_json::Value {
    let Some(object) = value.as_object() else {
        return value;
    };

    // Only unwrap when the payload itself is missing.
    if object.contains_key("entities") || object.contains_key("relationships") {
        return value;
    }

    for field in WRAPPER_FIELDS {
        let Some(serde_json::Value::String(nested)) = object.get(*field) else {
            continue;
        };

        if let Ok(inner) = serde_json::from_str::<serde_json::Value>(nested) {
            debug!("Unwrapped JSON nested under '{}'", field);
            return inner;
        }
        let repaired = repair(nested);
        if let Ok(inner) = serde_json::from_str::<serde_json::Value>(&repaired) {
            debug!("Unwrapped and repaired JSON nested under '{}'", field);
            return inner;
        }
    }

    value
}

/// Drop closers that have nothing to close and append closers for whatever
/// stays open. String literals (including escapes) are passed through.
fn rebalance(content: &str) -> String {
    let mut out = String::with_capacity(content.len() + 4);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in content.chars() {
        if in_string {
            out.push(c);
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
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                    out.push(c);
                }
                // An unmatched closer is excess and is dropped.
            }
            _ => out.push(c),
        }
    }

    // An unterminated string would make every appended closer part of the
    // literal; terminate it first.
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }

    out
}

/// Remove commas that directly precede a closing brace/bracket.
fn strip_trailing_commas(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    let mut out = String::with_capacity(content.len());
    let mut in_string = false;
    let mut escaped = false;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }

        if c == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1; // drop the comma, keep the whitespace
                continue;
            }
        }

        out.push(c);
        i += 1;
    }

    out
}

/// Scan for `"entities": [...]` and return the array if it parses after
/// rebalancing.
fn extract_entities_array(content: &str) -> Option<serde_json::Value> {
    let marker = content.find("\"entities\"")?;
    let after = &content[marker..];
    let bracket = after.find('[')?;
    let candidate = &after[bracket..];
    let candidate = &candidate[..balanced_array_end(candidate)];

    let repaired = repair(candidate);
    serde_json::from_str::<serde_json::Value>(&repaired)
        .ok()
        .filter(|v| v.is_array())
}

/// Index just past the bracket matching the leading `[`, or the full length
/// if the array never closes.
fn balanced_array_end(s: &str) -> usize {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
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
            '[' => depth += 1,
            ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + c.len_utf8();
                }
            }
            _ => {}
        }
    }

    s.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json_passes_through() {
        let result = parse_or_repair(r#"{"entities": [{"text": "Judge Smith"}]}"#).unwrap();
        assert!(!result.was_repaired());
        assert_eq!(result.into_value()["entities"][0]["text"], "Judge Smith");
    }

    #[test]
    fn test_markdown_fence_stripped() {
        let response = "```json\n{\"entities\": []}\n```";
        let result = parse_or_repair(response).unwrap();
        assert!(result.into_value()["entities"].is_array());
    }

    #[test]
    fn test_excess_closing_braces_dropped() {
        let result = parse_or_repair(r#"{"entities": [{"text": "x"}]}}}"#).unwrap();
        assert!(result.was_repaired());
        assert_eq!(result.into_value()["entities"][0]["text"], "x");
    }

    #[test]
    fn test_unbalanced_braces_closed() {
        let result = parse_or_repair(r#"{"entities": [{"text": "x""#).unwrap();
        assert!(result.was_repaired());
        assert_eq!(result.into_value()["entities"][0]["text"], "x");
    }

    #[test]
    fn test_trailing_comma_removed() {
        let result = parse_or_repair(r#"{"entities": [{"text": "x"},]}"#).unwrap();
        assert_eq!(result.into_value()["entities"][0]["text"], "x");
    }

    #[test]
    fn test_braces_inside_strings_untouched() {
        let result = parse_or_repair(r#"{"entities": [{"text": "see {brackets] here"}]}"#).unwrap();
        assert_eq!(
            result.into_value()["entities"][0]["text"],
            "see {brackets] here"
        );
    }

    #[test]
    fn test_wrapper_field_unwrapped() {
        let response = r#"{"extracted_text": "{\"entities\": [{\"text\": \"Judge Smith\"}]}"}"#;
        let result = parse_or_repair(response).unwrap();
        assert_eq!(result.into_value()["entities"][0]["text"], "Judge Smith");
    }

    #[test]
    fn test_wrapper_with_malformed_nested_json() {
        // Nested string is missing its closers
        let response = r#"{"extracted_text": "{\"entities\": [{\"text\": \"x\""}"#;
        let result = parse_or_repair(response).unwrap();
        assert_eq!(result.into_value()["entities"][0]["text"], "x");
    }

    #[test]
    fn test_wrapper_ignored_when_entities_present() {
        let response = r#"{"entities": [], "extracted_text": "not json"}"#;
        let value = parse_or_repair(response).unwrap().into_value();
        assert!(value["entities"].is_array());
        assert_eq!(value["extracted_text"], "not json");
    }

    #[test]
    fn test_entities_array_fallback() {
        // Prose before the payload, so direct parse and repair both fail
        let response = r#"Here are the results: "entities": [{"text": "x"}] and more"#;
        let result = parse_or_repair(response).unwrap();
        assert_eq!(result.into_value()["entities"][0]["text"], "x");
    }

    #[test]
    fn test_hopeless_content_returns_repaired_text() {
        let err = parse_or_repair("no json here at all").unwrap_err();
        assert!(err.contains("no json here"));
    }

    #[test]
    fn test_repair_is_idempotent_on_valid_json() {
        let valid = r#"{"a": [1, 2], "b": {"c": "d"}}"#;
        assert_eq!(repair(valid), valid);
    }

    #[test]
    fn test_unterminated_string_is_closed() {
        let result = parse_or_repair(r#"{"entities": [{"text": "dangling"#).unwrap();
        assert!(result.was_repaired());
        let value = result.into_value();
        assert_eq!(value["entities"][0]["text"], "dangling");
    }
}
