//! Event-sink interfaces the engine reports through.
//!
//! Callers hand a sink into each request instead of subscribing to
//! callbacks on a shared object. The engine guarantees exactly one
//! terminal `on_complete` per request, success or failure, with zero or
//! more progress events before it. Sink methods are invoked from the
//! task driving that worker's receive loop.

use crate::protocol::{
    AttachmentSet, DiscoveryCompletePayload, Message, RunCompletePayload, RunStats,
};
use std::time::Duration;

/// Terminal event of a discovery request.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryCompleteEvent {
    pub total_tests: i64,
    pub is_aborted: bool,
    pub error: Option<String>,
}

impl DiscoveryCompleteEvent {
    /// Synthesized terminal event for a request that failed before or
    /// instead of a worker-reported completion.
    pub fn aborted(error: impl Into<String>) -> Self {
        Self {
            total_tests: -1,
            is_aborted: true,
            error: Some(error.into()),
        }
    }
}

impl From<DiscoveryCompletePayload> for DiscoveryCompleteEvent {
    fn from(payload: DiscoveryCompletePayload) -> Self {
        Self {
            total_tests: payload.total_tests,
            is_aborted: payload.is_aborted,
            error: None,
        }
    }
}

/// Terminal event of an execution request.
#[derive(Debug, Clone, Default)]
pub struct RunCompleteEvent {
    pub stats: RunStats,
    pub is_aborted: bool,
    pub is_canceled: bool,
    pub error: Option<String>,
    pub attachments: Vec<AttachmentSet>,
    pub executor_ids: Vec<String>,
    pub elapsed: Duration,
}

impl RunCompleteEvent {
    /// Synthesized terminal event for a request that failed before or
    /// instead of a worker-reported completion.
    pub fn aborted(error: impl Into<String>) -> Self {
        Self {
            is_aborted: true,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

impl From<RunCompletePayload> for RunCompleteEvent {
    fn from(payload: RunCompletePayload) -> Self {
        Self {
            stats: payload.stats,
            is_aborted: payload.is_aborted,
            is_canceled: payload.is_canceled,
            error: payload.error,
            attachments: payload.attachments,
            executor_ids: payload.executor_ids,
            elapsed: Duration::from_millis(payload.elapsed_ms),
        }
    }
}

/// Sink for a discovery request's streamed and terminal events.
pub trait DiscoveryEventSink: Send + Sync {
    /// A batch of discovered tests, relayed as opaque data.
    fn on_tests_found(&self, tests: serde_json::Value);

    /// Every frame received from the worker, verbatim. Parallel
    /// managers use this relay and suppress per-slot terminal frames.
    fn on_raw_message(&self, _message: &Message) {}

    /// The single terminal event. Fired exactly once per request.
    fn on_complete(&self, event: DiscoveryCompleteEvent);
}

/// Sink for an execution request's streamed and terminal events.
pub trait RunEventSink: Send + Sync {
    /// Streamed run statistics / test results, relayed as opaque data.
    fn on_run_stats(&self, stats: serde_json::Value);

    /// Every frame received from the worker, verbatim.
    fn on_raw_message(&self, _message: &Message) {}

    /// The single terminal event. Fired exactly once per request.
    fn on_complete(&self, event: RunCompleteEvent);
}

/// Severity of an out-of-band engine message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Informational,
    Warning,
    Error,
}

/// Sink for out-of-band messages, used where failures are reported but
/// never propagated (the data-collection coordinator).
pub trait MessageSink: Send + Sync {
    fn on_message(&self, level: MessageLevel, message: &str);
}

/// Merge attachment sets by collector identity: same identity means the
/// attachments are concatenated, never replaced.
pub fn merge_attachment_sets(into: &mut Vec<AttachmentSet>, from: Vec<AttachmentSet>) {
    for set in from {
        match into.iter_mut().find(|s| s.collector_id == set.collector_id) {
            Some(existing) => existing.attachments.extend(set.attachments),
            None => into.push(set),
        }
    }
}
