//! Message envelope and typed payloads.
//!
//! Every frame on the wire is a [`Message`]: a string message type, an
//! opaque structured payload, and the negotiated protocol version for
//! version-sensitive payload shapes. The envelope is immutable once
//! constructed.

use crate::{CrossrunError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Message type string constants.
pub mod message_type {
    pub const VERSION_CHECK: &str = "ProtocolVersion";
    pub const EXTENSIONS_INITIALIZE: &str = "Extensions.Initialize";
    pub const SESSION_TERMINATE: &str = "TestSession.Terminate";

    pub const DISCOVERY_START: &str = "TestDiscovery.Start";
    pub const DISCOVERY_TESTS_FOUND: &str = "TestDiscovery.TestsFound";
    pub const DISCOVERY_COMPLETE: &str = "TestDiscovery.Completed";

    pub const EXECUTION_START: &str = "TestExecution.Start";
    pub const EXECUTION_STATS: &str = "TestExecution.StatsChange";
    pub const EXECUTION_COMPLETE: &str = "TestExecution.Completed";
    pub const EXECUTION_CANCEL: &str = "TestExecution.Cancel";
    pub const EXECUTION_ABORT: &str = "TestExecution.Abort";

    pub const BEFORE_RUN_START: &str = "DataCollection.BeforeRunStart";
    pub const BEFORE_RUN_START_RESULT: &str = "DataCollection.BeforeRunStartResult";
    pub const AFTER_RUN_END: &str = "DataCollection.AfterRunEnd";
    pub const AFTER_RUN_END_RESULT: &str = "DataCollection.AfterRunEndResult";
}

/// Wire envelope: `{ MessageType, Payload, Version }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "Payload", default)]
    pub payload: serde_json::Value,
    #[serde(rename = "Version", skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
}

impl Message {
    /// Construct an unversioned message.
    pub fn new(message_type: &str, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            message_type: message_type.to_string(),
            payload: serde_json::to_value(payload)?,
            version: None,
        })
    }

    /// Construct a message stamped with the negotiated protocol version.
    pub fn versioned(message_type: &str, payload: impl Serialize, version: i32) -> Result<Self> {
        Ok(Self {
            message_type: message_type.to_string(),
            payload: serde_json::to_value(payload)?,
            version: Some(version),
        })
    }

    /// Decode the payload into a typed value.
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| CrossrunError::Protocol {
            message: format!(
                "malformed payload for message '{}': {}",
                self.message_type, e
            ),
        })
    }
}

/// Handshake payload carried both ways on the version check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCheckPayload {
    pub version: i32,
}

/// Criteria for a discovery request. Immutable for the caller; the
/// proxy reconciles `sources` against the runtime provider's resolved
/// view before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryCriteria {
    pub sources: Vec<PathBuf>,
    pub run_settings: String,
    pub stats_event_frequency: u64,
}

impl DiscoveryCriteria {
    pub fn new(sources: Vec<PathBuf>, run_settings: impl Into<String>) -> Self {
        Self {
            sources,
            run_settings: run_settings.into(),
            stats_event_frequency: crate::config::SessionConfig::DEFAULT_STATS_EVENT_FREQUENCY,
        }
    }
}

/// The unit of work for an execution request: whole sources, or an
/// explicit set of already-discovered cases (opaque to the engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunItems {
    Sources(Vec<PathBuf>),
    TestCases(Vec<serde_json::Value>),
}

/// Criteria for an execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCriteria {
    pub items: RunItems,
    pub run_settings: String,
    pub stats_event_frequency: u64,
}

impl RunCriteria {
    pub fn from_sources(sources: Vec<PathBuf>, run_settings: impl Into<String>) -> Self {
        Self {
            items: RunItems::Sources(sources),
            run_settings: run_settings.into(),
            stats_event_frequency: crate::config::SessionConfig::DEFAULT_STATS_EVENT_FREQUENCY,
        }
    }

    pub fn from_test_cases(cases: Vec<serde_json::Value>, run_settings: impl Into<String>) -> Self {
        Self {
            items: RunItems::TestCases(cases),
            run_settings: run_settings.into(),
            stats_event_frequency: crate::config::SessionConfig::DEFAULT_STATS_EVENT_FREQUENCY,
        }
    }

    /// The source list, when this criteria is source-based.
    pub fn sources(&self) -> Option<&[PathBuf]> {
        match &self.items {
            RunItems::Sources(sources) => Some(sources),
            RunItems::TestCases(_) => None,
        }
    }

    /// Replace the source list with the provider-resolved one.
    pub fn set_sources(&mut self, sources: Vec<PathBuf>) {
        if matches!(self.items, RunItems::Sources(_)) {
            self.items = RunItems::Sources(sources);
        }
    }
}

/// Aggregatable run statistics. Payload contents beyond these counters
/// stay opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl RunStats {
    /// Sum another slot's statistics into this one.
    pub fn merge(&mut self, other: &RunStats) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Attachments produced by one data collector, merged across workers by
/// collector identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentSet {
    pub collector_id: String,
    pub display_name: String,
    pub attachments: Vec<serde_json::Value>,
}

/// Terminal payload of a discovery request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryCompletePayload {
    pub total_tests: i64,
    pub is_aborted: bool,
    #[serde(default)]
    pub last_chunk: Vec<serde_json::Value>,
}

/// Terminal payload of an execution request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompletePayload {
    pub stats: RunStats,
    pub is_aborted: bool,
    pub is_canceled: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentSet>,
    #[serde(default)]
    pub executor_ids: Vec<String>,
    pub elapsed_ms: u64,
}

/// Sent to the data collector before the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeRunStartPayload {
    pub settings: String,
    pub sources: Vec<PathBuf>,
}

/// Collector reply: environment the main workers must be launched
/// with, plus a port for the collector's secondary event channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeRunStartResult {
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    pub data_collection_port: u16,
}

/// Sent to the data collector after the run ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AfterRunEndPayload {
    pub is_cancelled: bool,
}

/// Collector reply after the run: final attachments plus telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AfterRunEndResult {
    #[serde(default)]
    pub attachments: Vec<AttachmentSet>,
    #[serde(default)]
    pub telemetry: BTreeMap<String, serde_json::Value>,
}
