//! Shell-style filename patterns used to discover tool outputs.

use crate::errors::{DemflowError, Result};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::path::{Path, PathBuf};

/// A compiled `*` / `?` filename pattern.
///
/// Patterns match the file name only, never the directory part.
#[derive(Debug, Clone)]
pub struct FilePattern {
    source: String,
    regex: Regex,
}

impl FilePattern {
    /// Compiles a case-sensitive pattern.
    pub fn new(pattern: &str) -> Result<Self> {
        Self::build(pattern, false)
    }

    /// Compiles a pattern that ignores ASCII case.
    pub fn case_insensitive(pattern: &str) -> Result<Self> {
        Self::build(pattern, true)
    }

    fn build(pattern: &str, ignore_case: bool) -> Result<Self> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = RegexBuilder::new(&expr)
            .case_insensitive(ignore_case)
            .build()
            .map_err(|e| DemflowError::config(format!("invalid pattern '{pattern}': {e}")))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Returns the original pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if the file name of `path` matches.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.regex.is_match(name))
    }

    /// Lists regular files directly inside `dir` that match, sorted by path.
    pub fn find_in(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if !dir.is_dir() {
            return Ok(found);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && self.matches(&path) {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Returns the first match inside `dir`, if any.
    pub fn find_first(&self, dir: &Path) -> Result<Option<PathBuf>> {
        Ok(self.find_in(dir)?.into_iter().next())
    }
}

impl fmt::Display for FilePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
