//! Event sink trait and implementations.

use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

/// A job was accepted and its scratch space created.
pub const JOB_STARTED: &str = "job.started";
/// A job finished; the payload lists delivered artifacts.
pub const JOB_COMPLETED: &str = "job.completed";
/// A stage began for one input.
pub const STAGE_STARTED: &str = "stage.started";
/// A stage validated its artifact.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage failed and stopped its chain.
pub const STAGE_FAILED: &str = "stage.failed";
/// A stage failed without stopping its chain.
pub const STAGE_WARNED: &str = "stage.warned";

/// Trait for sinks that receive pipeline lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "stage.started")
    /// * `data` - Optional event data
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Tries to emit an event without blocking.
    ///
    /// Never fails; sink errors are logged and dropped.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// A sink that forwards events to `tracing`.
///
/// Stage failures and warnings are always logged at `WARN`; other events at
/// the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&serde_json::Value>) {
        let data = data.map(ToString::to_string).unwrap_or_default();
        match event_type {
            STAGE_FAILED | STAGE_WARNED => warn!(event = event_type, data = %data, "Pipeline event"),
            _ if self.level == Level::DEBUG => debug!(event = event_type, data = %data, "Pipeline event"),
            _ => info!(event = event_type, data = %data, "Pipeline event"),
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// A sink that records events in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Returns the payloads of stage events for one stage, in order.
    #[must_use]
    pub fn stage_payloads(&self, stage: &str) -> Vec<serde_json::Value> {
        self.events
            .read()
            .iter()
            .filter_map(|(_, data)| data.as_ref())
            .filter(|data| data.get("stage").and_then(serde_json::Value::as_str) == Some(stage))
            .cloned()
            .collect()
    }

    /// Returns the collected event names in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpEventSink.emit("job.started", None).await;
        let sink = LoggingEventSink::debug();
        sink.emit(STAGE_STARTED, Some(serde_json::json!({"stage": "stereo"})))
            .await;
        sink.try_emit(STAGE_WARNED, None);
    }

    #[tokio::test]
    async fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("stage.started", None).await;
        sink.try_emit(STAGE_FAILED, Some(serde_json::json!({"stage": "stereo", "code": "StereoTimeout"})));
        sink.emit(JOB_COMPLETED, None).await;

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.stage_payloads("stereo")[0]["code"], "StereoTimeout");
        assert_eq!(
            sink.event_types(),
            vec!["stage.started", "stage.failed", "job.completed"]
        );
    }
}
