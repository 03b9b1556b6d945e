//! Coordinator for one auxiliary data-collector process.
//!
//! Structurally a lifecycle manager plus a request sender, but invoked
//! at exactly two points in a run instead of continuously. Failures in
//! either call are logged and reported through the caller's message
//! sink, never propagated: a broken collector must not abort an
//! otherwise-healthy run.

use crate::config::ConnectionConfig;
use crate::events::{MessageLevel, MessageSink};
use crate::hosting::RuntimeProvider;
use crate::protocol::{
    message_type, AfterRunEndPayload, AfterRunEndResult, BeforeRunStartPayload,
    BeforeRunStartResult, Message,
};
use crate::proxy::ProxyOperationManager;
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct DataCollectionCoordinator {
    operation: Arc<ProxyOperationManager>,
}

impl DataCollectionCoordinator {
    pub fn new(provider: Arc<dyn RuntimeProvider>) -> Self {
        let debug_attach = std::env::var(ConnectionConfig::DEBUG_ENV_VAR)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        Self::with_timeout(provider, collector_timeout(debug_attach))
    }

    pub fn with_timeout(provider: Arc<dyn RuntimeProvider>, timeout: Duration) -> Self {
        Self {
            operation: Arc::new(
                ProxyOperationManager::new(provider).with_connection_timeout(timeout),
            ),
        }
    }

    /// Launch the collector and block until it connects. Returns false
    /// (after logging and reporting) when the collector cannot be
    /// brought up; the run then proceeds without collection.
    pub async fn initialize(
        &self,
        settings: &str,
        sources: &[PathBuf],
        messages: &dyn MessageSink,
    ) -> bool {
        match self.operation.setup_channel(sources, settings).await {
            Ok(()) => {
                info!("{}: data collector connected", self.operation.id());
                true
            }
            Err(e) => {
                self.report(messages, "data collector failed to start", &e);
                false
            }
        }
    }

    /// Negotiate the run environment with the collector. Workers must
    /// be launched with the returned environment variables; the port
    /// carries the collector's secondary event channel.
    pub async fn before_run_start(
        &self,
        settings: &str,
        sources: &[PathBuf],
        messages: &dyn MessageSink,
    ) -> BeforeRunStartResult {
        match self.try_before_run_start(settings, sources).await {
            Ok(result) => result,
            Err(e) => {
                self.report(messages, "collector BeforeRunStart failed", &e);
                BeforeRunStartResult::default()
            }
        }
    }

    async fn try_before_run_start(
        &self,
        settings: &str,
        sources: &[PathBuf],
    ) -> Result<BeforeRunStartResult> {
        let payload = BeforeRunStartPayload {
            settings: settings.to_string(),
            sources: sources.to_vec(),
        };
        let reply = self
            .operation
            .sender()
            .request(
                Message::new(message_type::BEFORE_RUN_START, payload)?,
                message_type::BEFORE_RUN_START_RESULT,
            )
            .await?;
        reply.deserialize_payload()
    }

    /// Collect final attachments and telemetry, optionally signaling
    /// that the run was cancelled.
    pub async fn after_run_end(
        &self,
        cancelled: bool,
        messages: &dyn MessageSink,
    ) -> AfterRunEndResult {
        match self.try_after_run_end(cancelled).await {
            Ok(result) => result,
            Err(e) => {
                self.report(messages, "collector AfterRunEnd failed", &e);
                AfterRunEndResult::default()
            }
        }
    }

    async fn try_after_run_end(&self, cancelled: bool) -> Result<AfterRunEndResult> {
        let payload = AfterRunEndPayload {
            is_cancelled: cancelled,
        };
        let reply = self
            .operation
            .sender()
            .request(
                Message::new(message_type::AFTER_RUN_END, payload)?,
                message_type::AFTER_RUN_END_RESULT,
            )
            .await?;
        reply.deserialize_payload()
    }

    /// Terminate the collector. Safe to call repeatedly.
    pub async fn close(&self) {
        self.operation.close().await;
    }

    fn report(&self, messages: &dyn MessageSink, what: &str, error: &crate::CrossrunError) {
        warn!("{}: {}: {}", self.operation.id(), what, error);
        messages.on_message(MessageLevel::Warning, &format!("{what}: {error}"));
    }
}

/// Collector connections get a short window, widened when a developer
/// has asked to attach a debugger to the collector process.
fn collector_timeout(debug_attach: bool) -> Duration {
    if debug_attach {
        ConnectionConfig::DEBUG_ATTACH_TIMEOUT
    } else {
        ConnectionConfig::COLLECTOR_CONNECTION_TIMEOUT
    }
}
