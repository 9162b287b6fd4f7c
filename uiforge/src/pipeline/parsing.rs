//! Tolerant readers for text-generation output.
//!
//! Every reader has an explicit `Unparsable` outcome; none of them fail.

use serde_json::Value;

use super::types::{
    Clarification, Intent, IntentOutcome, Issue, ReviewOutcome, ReviewVerdict, Severity, Verdict,
};

/// First JSON object embedded anywhere in `text`, ignoring surrounding prose.
pub fn find_first_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(object))) = stream.next() {
            return Some(object);
        }
    }
    None
}

pub fn parse_intent(text: &str) -> IntentOutcome {
    let Some(object) = find_first_json_object(text) else {
        return IntentOutcome::Unparsable(text.to_string());
    };

    let wants_clarification = object
        .get("needsClarification")
        .or_else(|| object.get("needs_clarification"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || object
            .get("type")
            .and_then(Value::as_str)
            .map(|t| t.eq_ignore_ascii_case("clarification"))
            .unwrap_or(false);

    if wants_clarification {
        return IntentOutcome::Clarification(Clarification {
            question: string_field(&object, "question"),
            options: string_list(&object, "options"),
            reasoning: string_field(&object, "reasoning"),
        });
    }

    match serde_json::from_value::<Intent>(Value::Object(object)) {
        Ok(intent) => IntentOutcome::Intent(intent),
        Err(e) => {
            log::debug!("Intent object did not match the expected shape: {}", e);
            IntentOutcome::Unparsable(text.to_string())
        }
    }
}

pub fn parse_review(text: &str) -> ReviewOutcome {
    let Some(object) = find_first_json_object(text) else {
        return ReviewOutcome::Unparsable(text.to_string());
    };

    let verdict = match object.get("verdict").and_then(Value::as_str) {
        Some(v) if v.eq_ignore_ascii_case("pass") => Verdict::Pass,
        Some(v) if v.eq_ignore_ascii_case("fail") => Verdict::Fail,
        _ => return ReviewOutcome::Unparsable(text.to_string()),
    };

    let issues = object
        .get("issues")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(parse_issue).collect());

    ReviewOutcome::Verdict(ReviewVerdict {
        verdict,
        issues,
        notes: string_field(&object, "notes"),
    })
}

fn parse_issue(value: &Value) -> Option<Issue> {
    let severity = match value.get("severity")?.as_str()?.to_lowercase().as_str() {
        "error" | "critical" => Severity::Error,
        _ => Severity::Warning,
    };
    Some(Issue {
        severity,
        category: value
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("general")
            .to_string(),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        suggestion: value
            .get("suggestion")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

fn string_field(object: &serde_json::Map<String, Value>, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_list(object: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    object
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
