//! Query match predicates.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A predicate used by queries and project selection.
///
/// Matching is substring-based; an empty pattern matches everything. A
/// pattern that names an existing path also matches any path it is a prefix
/// of, so `rc project /home/x/src` selects files below that root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pattern: String,
}

impl Match {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        if self.pattern.is_empty() {
            return true;
        }
        candidate.contains(&self.pattern) || self.pattern.starts_with(candidate)
    }

    pub fn matches_path(&self, candidate: &Path) -> bool {
        candidate
            .to_str()
            .map(|s| self.matches(s))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_matches_everything() {
        assert!(Match::default().matches("/any/path.cpp"));
    }

    #[test]
    fn substring_matches() {
        let m = Match::new("src/foo");
        assert!(m.matches("/home/x/src/foo.cpp"));
        assert!(!m.matches("/home/x/lib/bar.cpp"));
    }

    #[test]
    fn project_root_prefix_matches_files_below_it() {
        let m = Match::new("/home/x/src/sub/file.cpp");
        assert!(m.matches("/home/x/src/"));
    }
}
