//! Processing pipelines (spec.md §4.K): named, ordered sequences of steps
//! drawn from a closed set of step types, routed per source via
//! `source_mapping`.

mod steps;

use std::collections::HashMap;
use std::time::Instant;

use logbeam_core::entry::StepOutcome;
use logbeam_core::LogEntry;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::warn;

pub use steps::{StepError, StepType};

#[derive(Debug, Snafu)]
pub enum PipelineError {
    #[snafu(display("failed to read pipeline file {}: {}", path, source))]
    Read { path: String, source: std::io::Error },
    #[snafu(display("failed to parse pipeline file {}: {}", path, source))]
    Parse { path: String, source: serde_yaml::Error },
    #[snafu(display("pipeline step failed: {source}"))]
    Step { source: StepError },
}

/// Whether a pipeline step applies based on a simple field-equality
/// condition, or unconditionally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub equals: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Drop the entry entirely.
    Drop,
    /// Leave the entry as it was before this step and continue.
    Skip,
    /// Tag the entry with a `processing_error` field and continue.
    Tag,
}

impl Default for FailPolicy {
    fn default() -> Self {
        FailPolicy::Skip
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub fail_on_error: FailPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelinesFile {
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub source_mapping: HashMap<String, String>,
}

fn condition_matches(entry: &LogEntry, condition: &Condition) -> bool {
    entry
        .fields
        .get(&condition.field)
        .and_then(|v| v.as_str())
        .map(|v| v == condition.equals)
        .unwrap_or(false)
}

/// Applies a single pipeline's steps to an entry in order, recording a
/// trace entry per step and honoring each step's `fail_on_error` policy.
/// Returns `None` if a step's policy dropped the entry.
pub fn apply_pipeline(pipeline: &Pipeline, mut entry: LogEntry) -> Option<LogEntry> {
    for step in &pipeline.steps {
        if let Some(condition) = &step.condition {
            if !condition_matches(&entry, condition) {
                entry.record_step(&step.name, 0, StepOutcome::Skipped);
                continue;
            }
        }

        let start = Instant::now();
        match steps::run(&step.step_type, &mut entry) {
            Ok(()) => {
                entry.record_step(&step.name, start.elapsed().as_micros() as u64, StepOutcome::Applied);
            }
            Err(err) => {
                warn!(step = %step.name, error = %err, "processing step failed");
                match step.fail_on_error {
                    FailPolicy::Drop => return None,
                    FailPolicy::Skip => {
                        entry.record_step(&step.name, start.elapsed().as_micros() as u64, StepOutcome::Errored);
                    }
                    FailPolicy::Tag => {
                        entry.fields.insert(
                            "processing_error".to_string(),
                            serde_json::Value::String(err.to_string()),
                        );
                        entry.record_step(&step.name, start.elapsed().as_micros() as u64, StepOutcome::Errored);
                    }
                }
            }
        }
    }
    Some(entry)
}

/// Loaded pipelines indexed by name, plus the per-source routing table.
pub struct ProcessingRegistry {
    pipelines: HashMap<String, Pipeline>,
    source_mapping: HashMap<String, String>,
    default_pipeline: Option<String>,
}

impl ProcessingRegistry {
    pub fn new(file: PipelinesFile) -> Self {
        let default_pipeline = file.pipelines.first().map(|p| p.name.clone());
        let pipelines = file.pipelines.into_iter().map(|p| (p.name.clone(), p)).collect();
        Self {
            pipelines,
            source_mapping: file.source_mapping,
            default_pipeline,
        }
    }

    pub fn load(path: &str) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        let file: PipelinesFile = serde_yaml::from_str(&contents).context(ParseSnafu { path })?;
        Ok(Self::new(file))
    }

    pub fn empty() -> Self {
        Self::new(PipelinesFile::default())
    }

    /// Routes `entry` to its mapped pipeline (falling back to the default
    /// pipeline, if any) and applies it.
    pub fn process(&self, entry: LogEntry) -> Option<LogEntry> {
        let pipeline_name = self
            .source_mapping
            .get(&entry.source_id)
            .or(self.default_pipeline.as_ref());

        match pipeline_name.and_then(|name| self.pipelines.get(name)) {
            Some(pipeline) => apply_pipeline(pipeline, entry),
            None => Some(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logbeam_core::entry::SourceKind;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(SourceKind::File, "nginx", message).unwrap()
    }

    fn regex_extract_pipeline() -> Pipeline {
        Pipeline {
            name: "nginx".into(),
            steps: vec![Step {
                name: "extract_status".into(),
                step_type: StepType::RegexExtract {
                    pattern: r#"status=(?P<status>\d+)"#.into(),
                    field: "status".into(),
                },
                condition: None,
                fail_on_error: FailPolicy::Skip,
            }],
        }
    }

    #[test]
    fn regex_extract_step_populates_field() {
        let pipeline = regex_extract_pipeline();
        let entry = entry("GET / status=200 done");
        let result = apply_pipeline(&pipeline, entry).unwrap();
        assert_eq!(result.fields.get("status").unwrap(), "200");
        assert_eq!(result.trace.len(), 1);
    }

    #[test]
    fn drop_policy_removes_entry_on_failure() {
        let pipeline = Pipeline {
            name: "strict".into(),
            steps: vec![Step {
                name: "must_match".into(),
                step_type: StepType::RegexExtract {
                    pattern: r#"status=(?P<status>\d+)"#.into(),
                    field: "status".into(),
                },
                condition: None,
                fail_on_error: FailPolicy::Drop,
            }],
        };
        let entry = entry("no status here");
        assert!(apply_pipeline(&pipeline, entry).is_none());
    }

    #[test]
    fn condition_skips_step_when_not_matched() {
        let mut pipeline = regex_extract_pipeline();
        pipeline.steps[0].condition = Some(Condition {
            field: "kind".into(),
            equals: "access".into(),
        });
        let entry = entry("status=200");
        let result = apply_pipeline(&pipeline, entry).unwrap();
        assert!(!result.fields.contains_key("status"));
        assert_eq!(result.trace[0].outcome, StepOutcome::Skipped);
    }

    #[test]
    fn registry_routes_by_source_mapping() {
        let file = PipelinesFile {
            pipelines: vec![regex_extract_pipeline()],
            source_mapping: [("nginx".to_string(), "nginx".to_string())].into_iter().collect(),
        };
        let registry = ProcessingRegistry::new(file);
        let result = registry.process(entry("status=404")).unwrap();
        assert_eq!(result.fields.get("status").unwrap(), "404");
    }

    #[test]
    fn registry_passes_through_unmapped_source_unchanged() {
        let registry = ProcessingRegistry::empty();
        let result = registry.process(entry("status=404")).unwrap();
        assert!(!result.fields.contains_key("status"));
    }
}
