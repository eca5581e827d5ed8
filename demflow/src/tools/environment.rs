//! Environment handed to external tools.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

/// Variable through which the alignment script reads its reference-data key.
pub const API_KEY_VAR: &str = "OPENTOPOGRAPHY_API_KEY";

/// Search paths and variables applied to every child process.
///
/// The parent process environment is never modified; these values are set on
/// each spawned command only.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEnvironment {
    /// Directories searched for bare program names, before `PATH`.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// Extra variables for the child environment.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Reference-data API key. Never written back out.
    #[serde(default, skip_serializing)]
    api_key: Option<String>,
}

impl ToolEnvironment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a program search directory.
    #[must_use]
    pub fn with_search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_paths.push(dir.into());
        self
    }

    /// Adds a child environment variable.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Sets the reference-data API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Returns true if an API key is configured.
    #[must_use]
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Returns the variables to set on a child, API key included.
    #[must_use]
    pub fn overrides(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(key) = &self.api_key {
            vars.push((API_KEY_VAR.to_string(), key.clone()));
        }
        vars
    }

    /// Builds the child `PATH`: search directories first, then `inherited`.
    ///
    /// Returns `None` when no search directory is configured.
    #[must_use]
    pub fn child_path(&self, inherited: Option<OsString>) -> Option<OsString> {
        if self.search_paths.is_empty() {
            return None;
        }
        let mut dirs = self.search_paths.clone();
        if let Some(inherited) = inherited {
            dirs.extend(std::env::split_paths(&inherited));
        }
        std::env::join_paths(dirs).ok()
    }
}

impl fmt::Debug for ToolEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolEnvironment")
            .field("search_paths", &self.search_paths)
            .field("variables", &self.variables)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
