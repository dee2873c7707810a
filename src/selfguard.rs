//! Self-guard (spec.md §4.L step 1, §6 `selfguard`): keeps the agent from
//! ingesting its own log output, which would otherwise feed back into the
//! pipeline it is monitoring.

use glob::Pattern;
use logbeam_core::LogEntry;
use tracing::warn;

use crate::config::{SelfGuardConfig, SelfLogActionConfig};

pub enum Verdict {
    Pass(LogEntry),
    Drop,
    Tagged(LogEntry),
}

fn any_pattern_matches(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| {
        Pattern::new(p)
            .map(|pattern| pattern.matches(value))
            .unwrap_or_else(|_| value == p)
    })
}

/// Returns `true` if `entry` looks like it originated from the agent
/// itself, based on source id, container name, or message content.
fn is_self_log(config: &SelfGuardConfig, entry: &LogEntry) -> bool {
    if let Some(name) = &config.self_container_name {
        if entry.source_id.contains(name.as_str()) {
            return true;
        }
    }
    if let Some(id) = &config.self_id_short {
        if entry.source_id.contains(id.as_str()) {
            return true;
        }
    }
    if any_pattern_matches(&config.exclude_path_patterns, &entry.source_id) {
        return true;
    }
    if any_pattern_matches(&config.exclude_container_patterns, &entry.source_id) {
        return true;
    }
    if any_pattern_matches(&config.exclude_message_patterns, &entry.message) {
        return true;
    }
    false
}

/// Applies the configured self-log action to `entry`. Returns `Verdict::Pass`
/// unchanged if self-guard is disabled or the entry doesn't match.
pub fn check(config: &SelfGuardConfig, entry: LogEntry) -> Verdict {
    if !config.enabled || !is_self_log(config, &entry) {
        return Verdict::Pass(entry);
    }

    match config.self_log_action {
        SelfLogActionConfig::Drop => Verdict::Drop,
        SelfLogActionConfig::Warn => {
            warn!(source_id = %entry.source_id, "passing through agent self-log entry");
            Verdict::Tagged(entry)
        }
        SelfLogActionConfig::Tag => {
            let mut entry = entry;
            entry
                .fields
                .insert("logbeam_self_log".to_string(), serde_json::Value::Bool(true));
            Verdict::Tagged(entry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logbeam_core::entry::SourceKind;

    fn config() -> SelfGuardConfig {
        SelfGuardConfig {
            enabled: true,
            self_container_name: Some("logbeam-agent".into()),
            ..SelfGuardConfig::default()
        }
    }

    fn entry(source_id: &str) -> LogEntry {
        LogEntry::new(SourceKind::Container, source_id, "hello").unwrap()
    }

    #[test]
    fn drops_entry_matching_self_container_name() {
        let result = check(&config(), entry("logbeam-agent-1"));
        assert!(matches!(result, Verdict::Drop));
    }

    #[test]
    fn passes_unrelated_entry_unchanged() {
        let result = check(&config(), entry("nginx-1"));
        assert!(matches!(result, Verdict::Pass(_)));
    }

    #[test]
    fn tag_action_annotates_instead_of_dropping() {
        let mut c = config();
        c.self_log_action = SelfLogActionConfig::Tag;
        let result = check(&c, entry("logbeam-agent-1"));
        match result {
            Verdict::Tagged(e) => assert!(e.fields.contains_key("logbeam_self_log")),
            _ => panic!("expected tagged entry"),
        }
    }

    #[test]
    fn disabled_guard_always_passes() {
        let mut c = config();
        c.enabled = false;
        let result = check(&c, entry("logbeam-agent-1"));
        assert!(matches!(result, Verdict::Pass(_)));
    }

    #[test]
    fn exclude_message_pattern_drops_matching_messages() {
        let mut c = config();
        c.self_container_name = None;
        c.exclude_message_patterns.push("*healthcheck*".into());
        let mut e = entry("nginx-1");
        e.message = "healthcheck ok".into();
        let result = check(&c, e);
        assert!(matches!(result, Verdict::Drop));
    }
}
