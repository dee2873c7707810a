//! Container inclusion/exclusion matching (spec.md §4.J): a container is
//! monitored if it passes the include rules (or no include rules are
//! configured) and fails every exclude rule.

use std::collections::BTreeMap;

use crate::config::ContainerMonitorConfig;

pub struct ContainerMeta<'a> {
    pub name: &'a str,
    pub labels: &'a BTreeMap<String, String>,
}

fn name_matches(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| match glob::Pattern::new(p) {
        Ok(pattern) => pattern.matches(name),
        Err(_) => name == p,
    })
}

fn labels_match(wanted: &BTreeMap<String, String>, actual: &BTreeMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| actual.get(k).map(|av| av == v).unwrap_or(false))
}

pub fn should_monitor(config: &ContainerMonitorConfig, meta: &ContainerMeta) -> bool {
    let has_include_rules = !config.include_names.is_empty() || !config.include_labels.is_empty();
    let included = if has_include_rules {
        name_matches(&config.include_names, meta.name) || labels_match(&config.include_labels, meta.labels)
    } else {
        true
    };
    if !included {
        return false;
    }

    if name_matches(&config.exclude_names, meta.name) {
        return false;
    }
    if !config.exclude_labels.is_empty() && labels_match(&config.exclude_labels, meta.labels) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContainerMonitorConfig {
        ContainerMonitorConfig::default()
    }

    #[test]
    fn no_rules_monitors_everything() {
        let c = config();
        let labels = BTreeMap::new();
        assert!(should_monitor(&c, &ContainerMeta { name: "anything", labels: &labels }));
    }

    #[test]
    fn exclude_name_pattern_wins() {
        let mut c = config();
        c.exclude_names.push("logbeam*".into());
        let labels = BTreeMap::new();
        assert!(!should_monitor(&c, &ContainerMeta { name: "logbeam-agent", labels: &labels }));
    }

    #[test]
    fn include_names_restricts_to_matches() {
        let mut c = config();
        c.include_names.push("web-*".into());
        let labels = BTreeMap::new();
        assert!(should_monitor(&c, &ContainerMeta { name: "web-1", labels: &labels }));
        assert!(!should_monitor(&c, &ContainerMeta { name: "db-1", labels: &labels }));
    }

    #[test]
    fn include_labels_restricts_to_matches() {
        let mut c = config();
        c.include_labels.insert("monitor".into(), "true".into());
        let mut labels = BTreeMap::new();
        labels.insert("monitor".to_string(), "true".to_string());
        assert!(should_monitor(&c, &ContainerMeta { name: "anything", labels: &labels }));
        assert!(!should_monitor(&c, &ContainerMeta { name: "anything", labels: &BTreeMap::new() }));
    }

    #[test]
    fn exclude_labels_overrides_include() {
        let mut c = config();
        c.exclude_labels.insert("skip".into(), "true".into());
        let mut labels = BTreeMap::new();
        labels.insert("skip".to_string(), "true".to_string());
        assert!(!should_monitor(&c, &ContainerMeta { name: "anything", labels: &labels }));
    }
}
