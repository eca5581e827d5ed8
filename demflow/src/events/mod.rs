//! Event sinks for pipeline lifecycle observability.

mod sink;

pub use sink::{
    CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, JOB_COMPLETED, JOB_STARTED,
    STAGE_COMPLETED, STAGE_FAILED, STAGE_STARTED, STAGE_WARNED,
};
