//! Execution context shared by the stages of one input.

use crate::config::ToolConfig;
use crate::errors::Result;
use crate::events::{EventSink, NoOpEventSink};
use crate::tools::ToolRunner;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a stage writes and how it reaches its tools.
#[derive(Clone)]
pub struct StageContext {
    work_dir: PathBuf,
    input_index: usize,
    runner: Arc<dyn ToolRunner>,
    tools: Arc<ToolConfig>,
    sink: Arc<dyn EventSink>,
}

impl StageContext {
    /// Creates a context rooted at `work_dir`.
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>, runner: Arc<dyn ToolRunner>, tools: Arc<ToolConfig>) -> Self {
        Self {
            work_dir: work_dir.into(),
            input_index: 0,
            runner,
            tools,
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the index of the input this context serves.
    #[must_use]
    pub fn with_input_index(mut self, index: usize) -> Self {
        self.input_index = index;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the per-input working directory.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Returns the input index.
    #[must_use]
    pub const fn input_index(&self) -> usize {
        self.input_index
    }

    /// Returns the tool runner.
    #[must_use]
    pub fn runner(&self) -> &dyn ToolRunner {
        self.runner.as_ref()
    }

    /// Returns the toolchain configuration.
    #[must_use]
    pub fn tools(&self) -> &ToolConfig {
        &self.tools
    }

    /// Returns the event sink.
    #[must_use]
    pub fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    /// Creates and returns a subdirectory of the working directory.
    pub async fn stage_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.work_dir.join(name);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("work_dir", &self.work_dir)
            .field("input_index", &self.input_index)
            .finish_non_exhaustive()
    }
}
