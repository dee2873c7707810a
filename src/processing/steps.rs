//! The closed set of processing step types (spec.md §4.K). Each variant
//! carries its own typed config, deserialized from the pipeline YAML.

use chrono::DateTime;
use logbeam_core::entry::LogLevel;
use logbeam_core::LogEntry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum StepType {
    RegexExtract { pattern: String, field: String },
    TimestampParse { field: String, format: String },
    JsonParse { field: String },
    FieldAdd { field: String, value: String },
    FieldRemove { field: String },
    LogLevelExtract { field: Option<String> },
}

#[derive(Debug, Snafu)]
pub enum StepError {
    #[snafu(display("invalid regex pattern {}: {}", pattern, source))]
    BadRegex { pattern: String, source: regex::Error },
    #[snafu(display("regex did not match message"))]
    NoMatch,
    #[snafu(display("field {} not found", field))]
    MissingField { field: String },
    #[snafu(display("failed to parse timestamp {}: {}", value, source))]
    BadTimestamp { value: String, source: chrono::ParseError },
    #[snafu(display("field {} is not valid json: {}", field, source))]
    BadJson { field: String, source: serde_json::Error },
}

pub fn run(step: &StepType, entry: &mut LogEntry) -> Result<(), StepError> {
    match step {
        StepType::RegexExtract { pattern, field } => regex_extract(entry, pattern, field),
        StepType::TimestampParse { field, format } => timestamp_parse(entry, field, format),
        StepType::JsonParse { field } => json_parse(entry, field),
        StepType::FieldAdd { field, value } => {
            entry
                .fields
                .insert(field.clone(), serde_json::Value::String(value.clone()));
            Ok(())
        }
        StepType::FieldRemove { field } => {
            entry.fields.remove(field);
            Ok(())
        }
        StepType::LogLevelExtract { field } => log_level_extract(entry, field.as_deref()),
    }
}

fn regex_extract(entry: &mut LogEntry, pattern: &str, field: &str) -> Result<(), StepError> {
    let re = Regex::new(pattern).map_err(|source| StepError::BadRegex {
        pattern: pattern.to_string(),
        source,
    })?;
    let captures = re.captures(&entry.message).ok_or(StepError::NoMatch)?;
    let value = captures
        .name(field)
        .or_else(|| captures.get(1))
        .ok_or(StepError::NoMatch)?
        .as_str()
        .to_string();
    entry.fields.insert(field.to_string(), serde_json::Value::String(value));
    Ok(())
}

fn timestamp_parse(entry: &mut LogEntry, field: &str, format: &str) -> Result<(), StepError> {
    let raw = entry
        .fields
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| StepError::MissingField { field: field.to_string() })?;
    let parsed = DateTime::parse_from_str(&raw, format).map_err(|source| StepError::BadTimestamp {
        value: raw.clone(),
        source,
    })?;
    entry.event_timestamp = parsed.with_timezone(&chrono::Utc);
    Ok(())
}

fn json_parse(entry: &mut LogEntry, field: &str) -> Result<(), StepError> {
    let raw = if field == "message" {
        entry.message.clone()
    } else {
        entry
            .fields
            .get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| StepError::MissingField { field: field.to_string() })?
    };
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|source| StepError::BadJson { field: field.to_string(), source })?;
    if let serde_json::Value::Object(map) = value {
        for (k, v) in map {
            entry.fields.insert(k, v);
        }
    }
    Ok(())
}

fn log_level_extract(entry: &mut LogEntry, field: Option<&str>) -> Result<(), StepError> {
    let raw = match field {
        Some(field) => entry
            .fields
            .get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| StepError::MissingField { field: field.to_string() })?,
        None => entry.message.clone(),
    };
    entry.level = LogLevel::parse_loose(&raw);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use logbeam_core::entry::SourceKind;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(SourceKind::File, "src", message).unwrap()
    }

    #[test]
    fn regex_extract_populates_named_group() {
        let mut e = entry("code=42");
        run(
            &StepType::RegexExtract { pattern: "code=(?P<code>\\d+)".into(), field: "code".into() },
            &mut e,
        )
        .unwrap();
        assert_eq!(e.fields.get("code").unwrap(), "42");
    }

    #[test]
    fn json_parse_merges_object_fields() {
        let mut e = entry(r#"{"a":1,"b":"x"}"#);
        run(&StepType::JsonParse { field: "message".into() }, &mut e).unwrap();
        assert_eq!(e.fields.get("a").unwrap(), 1);
        assert_eq!(e.fields.get("b").unwrap(), "x");
    }

    #[test]
    fn field_add_and_remove_round_trip() {
        let mut e = entry("hi");
        run(&StepType::FieldAdd { field: "env".into(), value: "prod".into() }, &mut e).unwrap();
        assert_eq!(e.fields.get("env").unwrap(), "prod");
        run(&StepType::FieldRemove { field: "env".into() }, &mut e).unwrap();
        assert!(!e.fields.contains_key("env"));
    }

    #[test]
    fn log_level_extract_from_message_is_case_insensitive() {
        let mut e = entry("ERROR something broke");
        run(&StepType::LogLevelExtract { field: None }, &mut e).unwrap();
        assert_eq!(e.level, LogLevel::parse_loose("error"));
    }

    #[test]
    fn timestamp_parse_sets_event_timestamp() {
        let mut e = entry("x");
        e.fields.insert("ts".into(), serde_json::Value::String("2026-01-02T03:04:05+00:00".into()));
        run(&StepType::TimestampParse { field: "ts".into(), format: "%Y-%m-%dT%H:%M:%S%z".into() }, &mut e).unwrap();
        assert_eq!(e.event_timestamp.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[test]
    fn regex_extract_missing_match_is_an_error() {
        let mut e = entry("nothing here");
        let result = run(&StepType::RegexExtract { pattern: "code=(?P<code>\\d+)".into(), field: "code".into() }, &mut e);
        assert!(result.is_err());
    }
}
