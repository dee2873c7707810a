//! Glob-based file discovery with exclude patterns (spec.md §4.I).

use std::path::PathBuf;

use glob::Pattern;
use tracing::warn;

pub struct Discovery {
    include_patterns: Vec<String>,
    exclude_patterns: Vec<Pattern>,
}

impl Discovery {
    pub fn new(include_patterns: Vec<String>, exclude_patterns: Vec<String>) -> Self {
        let exclude_patterns = exclude_patterns
            .into_iter()
            .filter_map(|p| match Pattern::new(&p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "ignoring invalid exclude pattern");
                    None
                }
            })
            .collect();
        Self {
            include_patterns,
            exclude_patterns,
        }
    }

    /// Re-runs glob expansion and returns the current set of matching
    /// files, with excludes applied.
    pub fn discover(&self) -> Vec<PathBuf> {
        self.include_patterns
            .iter()
            .flat_map(|pattern| {
                glob::glob(pattern)
                    .into_iter()
                    .flatten()
                    .filter_map(|r| r.ok())
            })
            .filter(|path| {
                let path_str = path.to_string_lossy();
                !self
                    .exclude_patterns
                    .iter()
                    .any(|exclude| exclude.matches(&path_str))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovers_matching_files_and_skips_excluded() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.log"), "x").unwrap();
        fs::write(dir.path().join("b.log"), "x").unwrap();
        fs::write(dir.path().join("b.debug.log"), "x").unwrap();

        let include = vec![dir.path().join("*.log").to_string_lossy().to_string()];
        let exclude = vec![dir.path().join("*.debug.log").to_string_lossy().to_string()];
        let discovery = Discovery::new(include, exclude);
        let mut found: Vec<String> = discovery
            .discover()
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        found.sort();
        assert_eq!(found, vec!["a.log".to_string(), "b.log".to_string()]);
    }
}
