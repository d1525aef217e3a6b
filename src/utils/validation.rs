use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::utils::time::parse_submission_time;

pub const REQUIRED_SUBMISSION_FIELDS: &[&str] = &["_id", "_submission_time", "_submitted_by"];
pub const MAX_FIELD_LENGTH: usize = 10_000;
pub const MAX_NESTED_DEPTH: usize = 10;

/// Fails with one validation error naming every field that is absent or blank.
pub fn require_fields(fields: &[(&str, bool)]) -> Result<()> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )))
    }
}

pub fn present(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Structural checks on a KoboToolbox submission; returns every problem found.
pub fn validate_submission(payload: &JsonValue) -> std::result::Result<(), Vec<String>> {
    let Some(obj) = payload.as_object() else {
        return Err(vec!["Payload must be a JSON object".to_string()]);
    };

    let mut errors = Vec::new();

    let missing: Vec<&str> = REQUIRED_SUBMISSION_FIELDS
        .iter()
        .copied()
        .filter(|f| !obj.contains_key(*f))
        .collect();
    if !missing.is_empty() {
        errors.push(format!("Missing required fields: {}", missing.join(", ")));
    }

    check_field_lengths(obj, "", &mut errors);

    if nested_depth(payload, 0) > MAX_NESTED_DEPTH {
        errors.push(format!(
            "Payload nested too deeply (max {} levels)",
            MAX_NESTED_DEPTH
        ));
    }

    if let Some(raw) = obj.get("_submission_time") {
        let valid = raw
            .as_str()
            .map(|s| parse_submission_time(s).is_some())
            .unwrap_or(false);
        if !valid {
            errors.push("Invalid _submission_time format".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_field_lengths(obj: &Map<String, JsonValue>, prefix: &str, errors: &mut Vec<String>) {
    for (key, value) in obj {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            JsonValue::String(s) if s.chars().count() > MAX_FIELD_LENGTH => errors.push(format!(
                "Field '{}' exceeds maximum length ({})",
                full_key, MAX_FIELD_LENGTH
            )),
            JsonValue::Object(inner) => check_field_lengths(inner, &full_key, errors),
            JsonValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let item_key = format!("{}[{}]", full_key, i);
                    match item {
                        JsonValue::Object(inner) => check_field_lengths(inner, &item_key, errors),
                        JsonValue::String(s) if s.chars().count() > MAX_FIELD_LENGTH => errors
                            .push(format!("Field '{}' exceeds maximum length", item_key)),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
}

fn nested_depth(value: &JsonValue, depth: usize) -> usize {
    if depth > MAX_NESTED_DEPTH {
        return depth;
    }
    match value {
        JsonValue::Object(m) if !m.is_empty() => m
            .values()
            .map(|v| nested_depth(v, depth + 1))
            .max()
            .unwrap_or(depth),
        JsonValue::Array(a) if !a.is_empty() => a
            .iter()
            .map(|v| nested_depth(v, depth + 1))
            .max()
            .unwrap_or(depth),
        _ => depth,
    }
}

/// Drops `__`-prefixed keys and strips NUL bytes and surrounding whitespace from strings.
pub fn sanitize_submission(payload: JsonValue) -> JsonValue {
    match payload {
        JsonValue::String(s) => JsonValue::String(s.replace('\0', "").trim().to_string()),
        JsonValue::Object(m) => JsonValue::Object(
            m.into_iter()
                .filter(|(k, _)| !k.is_empty() && !k.starts_with("__"))
                .map(|(k, v)| (k, sanitize_submission(v)))
                .collect(),
        ),
        JsonValue::Array(items) => {
            JsonValue::Array(items.into_iter().map(sanitize_submission).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission() -> JsonValue {
        json!({
            "_id": 42,
            "_submission_time": "2024-03-01T10:15:00",
            "_submitted_by": null,
            "household": {"members": 4}
        })
    }

    #[test]
    fn accepts_well_formed_submission() {
        assert!(validate_submission(&submission()).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let payload = json!({
            "_submission_time": "not a date",
            "notes": "x".repeat(MAX_FIELD_LENGTH + 1)
        });
        let errors = validate_submission(&payload).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("_id"));
        assert!(errors[0].contains("_submitted_by"));
        assert!(errors.iter().any(|e| e.contains("'notes'")));
        assert!(errors.iter().any(|e| e.contains("_submission_time")));
    }

    #[test]
    fn rejects_non_object_and_deep_nesting() {
        assert!(validate_submission(&json!([1, 2])).is_err());

        let mut deep = json!("leaf");
        for _ in 0..12 {
            deep = json!({ "n": deep });
        }
        let mut payload = submission();
        payload["deep"] = deep;
        let errors = validate_submission(&payload).unwrap_err();
        assert!(errors[0].contains("nested too deeply"));
    }

    #[test]
    fn sanitize_strips_private_keys_and_nul_bytes() {
        let payload = json!({
            "__version__": "v1",
            "name": "  Ami\u{0}na ",
            "group": {"__internal": 1, "answers": [" a ", "b\u{0}"]}
        });
        let clean = sanitize_submission(payload);
        assert_eq!(
            clean,
            json!({"name": "Amina", "group": {"answers": ["a", "b"]}})
        );
    }

    #[test]
    fn require_fields_lists_all_missing() {
        let err = require_fields(&[("namespace", true), ("key_name", false), ("key_value", false)])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: Missing required fields: key_name, key_value"
        );
    }
}
