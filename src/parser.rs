//! Extraction of JSON objects from free-text model output.
//!
//! Models wrap their JSON in markdown fences, prepend chatter, or answer
//! with bare JSON. [`extract_object`] runs an ordered list of strategies and
//! returns the first candidate that parses as a JSON object. Nothing here
//! errors or panics; callers pick their own fallback when nothing parses.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::debug;

/// Length of the raw-text preview attached to parse failures.
pub const PREVIEW_CHARS: usize = 500;

type Strategy = fn(&str) -> Option<String>;

/// Candidate extractors, tried in order.
const STRATEGIES: &[(&str, Strategy)] = &[
    ("json_fence", json_fence),
    ("any_fence", any_fence),
    ("whole_text", whole_text),
    ("brace_span", brace_span),
];

/// Extract the first well-formed JSON object from `text`.
pub fn extract_object(text: &str) -> Option<Map<String, Value>> {
    for (name, strategy) in STRATEGIES {
        let Some(candidate) = strategy(text) else {
            continue;
        };
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&candidate) {
            debug!(strategy = name, "Parsed JSON object from model output");
            return Some(obj);
        }
    }
    None
}

/// Extract and deserialize into `T`, or return `fallback`.
pub fn parse_or<T: DeserializeOwned>(text: &str, fallback: T) -> T {
    extract_object(text)
        .and_then(|obj| serde_json::from_value(Value::Object(obj)).ok())
        .unwrap_or(fallback)
}

/// First `PREVIEW_CHARS` characters of `text`, on a char boundary.
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

fn json_fence(text: &str) -> Option<String> {
    let start = text.find("```json")? + "```json".len();
    let len = text[start..].find("```")?;
    Some(text[start..start + len].trim().to_string())
}

fn any_fence(text: &str) -> Option<String> {
    let start = text.find("```")? + 3;
    let len = text[start..].find("```")?;
    let body = &text[start..start + len];

    // A bare language tag on the opening line is not content.
    let body = match body.split_once('\n') {
        Some((first, rest)) if is_language_tag(first) => rest,
        _ => body,
    };
    Some(body.trim().to_string())
}

fn is_language_tag(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && line.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn whole_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn brace_span(text: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(?s)\{.*\}").ok())
        .as_ref()?;
    pattern.find(text).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DetectionReport;
    use serde_json::json;

    #[test]
    fn test_json_fence_with_chatter() {
        let text = "Here:\n```json\n{\"impairments\": [], \"narrative\": \"x\"}\n```\nthanks";
        let obj = extract_object(text).unwrap();
        assert_eq!(Value::Object(obj), json!({"impairments": [], "narrative": "x"}));
    }

    #[test]
    fn test_plain_fence_skips_language_tag() {
        let text = "```javascript\n{\"a\": 1}\n```";
        assert_eq!(extract_object(text).unwrap()["a"], json!(1));

        let untagged = "```\n  {\"b\": 2}  \n```";
        assert_eq!(extract_object(untagged).unwrap()["b"], json!(2));
    }

    #[test]
    fn test_whole_text_and_brace_span() {
        assert_eq!(extract_object("  {\"a\": true}\n").unwrap()["a"], json!(true));

        let text = "The result is {\"total_score\": 75, \"impairment_scores\": []} as requested.";
        assert_eq!(extract_object(text).unwrap()["total_score"], json!(75));
    }

    #[test]
    fn test_broken_fence_falls_through() {
        // The greedy span covers both objects, so nothing parses.
        let text = "```json\n{not json}\n```\n{\"ok\": 1}";
        assert!(extract_object(text).is_none());

        let stray = "Result {\"ok\": 1} ```";
        assert_eq!(extract_object(stray).unwrap()["ok"], json!(1));

        let unclosed = "```json\n{\"a\": 1}";
        assert_eq!(extract_object(unclosed).unwrap()["a"], json!(1));
    }

    #[test]
    fn test_non_object_json_rejected() {
        assert!(extract_object("[1, 2, 3]").is_none());
        assert!(extract_object("42").is_none());
    }

    #[test]
    fn test_garbage_yields_fallback() {
        assert!(extract_object("I could not find anything.").is_none());
        assert!(extract_object("").is_none());

        let report = parse_or("I could not find anything.", DetectionReport::empty());
        assert!(report.impairments.is_empty());
        assert_eq!(report.narrative, "");
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let text = "é".repeat(600);
        assert_eq!(preview(&text).chars().count(), PREVIEW_CHARS);
        assert_eq!(preview("short"), "short");
    }
}
