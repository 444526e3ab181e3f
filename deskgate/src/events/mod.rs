//! Event sink system for observability.
//!
//! The orchestrator reports every stage transition through an [`EventSink`].
//! The default sink forwards events to `tracing`.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink};
