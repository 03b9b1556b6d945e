//! Worker-side request handler.
//!
//! Dials the coordinator, answers the version handshake, then services
//! requests by delegating to a [`HostSession`]. What a "test" is stays
//! entirely inside the session implementation; the handler only moves
//! frames.

use crate::config::ProtocolConfig;
use crate::protocol::{
    message_type, AfterRunEndPayload, AfterRunEndResult, BeforeRunStartPayload,
    BeforeRunStartResult, DiscoveryCompletePayload, DiscoveryCriteria, Message, MessageChannel,
    RunCompletePayload, RunCriteria, VersionCheckPayload,
};
use crate::{CrossrunError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Publishes streamed progress frames for an in-flight request.
pub struct ProgressPublisher {
    channel: Arc<MessageChannel>,
    version: i32,
}

impl ProgressPublisher {
    /// Stream a batch of discovered tests.
    pub async fn tests_found(&self, tests: serde_json::Value) -> Result<()> {
        self.channel
            .send(&Message::versioned(
                message_type::DISCOVERY_TESTS_FOUND,
                tests,
                self.version,
            )?)
            .await
    }

    /// Stream run statistics / results.
    pub async fn run_stats(&self, stats: serde_json::Value) -> Result<()> {
        self.channel
            .send(&Message::versioned(
                message_type::EXECUTION_STATS,
                stats,
                self.version,
            )?)
            .await
    }
}

/// The worker's actual test session, behind the protocol.
#[async_trait]
pub trait HostSession: Send + Sync {
    /// Extension paths forwarded by the coordinator before requests.
    async fn initialize_extensions(&self, _paths: Vec<PathBuf>) {}

    /// Perform discovery, streaming progress through `progress`, and
    /// return the terminal payload.
    async fn discover(
        &self,
        criteria: DiscoveryCriteria,
        progress: &ProgressPublisher,
    ) -> DiscoveryCompletePayload;

    /// Perform a run, streaming progress through `progress`, and
    /// return the terminal payload.
    ///
    /// Cancel and abort frames are only read between requests, so a
    /// session that wants to honor cooperative cancellation must watch
    /// for it itself while running (a stop flag, a deadline, or its
    /// framework's own mechanism).
    async fn run(&self, criteria: RunCriteria, progress: &ProgressPublisher)
        -> RunCompletePayload;

    /// Answer the coordinator's pre-run collector negotiation. The
    /// default suits hosts that collect nothing.
    async fn before_run_start(&self, _payload: BeforeRunStartPayload) -> BeforeRunStartResult {
        BeforeRunStartResult::default()
    }

    /// Report attachments and telemetry once the run has ended.
    async fn after_run_end(&self, _payload: AfterRunEndPayload) -> AfterRunEndResult {
        AfterRunEndResult::default()
    }
}

/// Worker end of the connection.
pub struct RequestHandler {
    channel: Arc<MessageChannel>,
    version: i32,
}

impl RequestHandler {
    /// Dial the coordinator's endpoint.
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| CrossrunError::ConnectionTimeout { timeout })??;
        info!("connected to coordinator at {}", endpoint);
        Ok(Self {
            channel: Arc::new(MessageChannel::new(stream)),
            version: ProtocolConfig::VERSION_MAX,
        })
    }

    /// Wrap an established stream (in-process workers in tests).
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            channel: Arc::new(MessageChannel::new(stream)),
            version: ProtocolConfig::VERSION_MAX,
        }
    }

    /// The protocol version negotiated with the coordinator.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Service requests until the coordinator terminates the session or
    /// closes the connection.
    pub async fn serve<S: HostSession>(&mut self, session: &S) -> Result<()> {
        loop {
            let Some(message) = self.channel.receive().await? else {
                debug!("coordinator closed the connection");
                return Ok(());
            };

            match message.message_type.as_str() {
                message_type::VERSION_CHECK => {
                    let payload: VersionCheckPayload = message.deserialize_payload()?;
                    self.version = payload.version.min(ProtocolConfig::VERSION_MAX);
                    self.channel
                        .send(&Message::new(
                            message_type::VERSION_CHECK,
                            VersionCheckPayload {
                                version: self.version,
                            },
                        )?)
                        .await?;
                    debug!("negotiated protocol version {}", self.version);
                }
                message_type::EXTENSIONS_INITIALIZE => {
                    let paths: Vec<PathBuf> = message.deserialize_payload()?;
                    session.initialize_extensions(paths).await;
                }
                message_type::DISCOVERY_START => {
                    let criteria: DiscoveryCriteria = message.deserialize_payload()?;
                    let progress = ProgressPublisher {
                        channel: self.channel.clone(),
                        version: self.version,
                    };
                    let complete = session.discover(criteria, &progress).await;
                    self.channel
                        .send(&Message::versioned(
                            message_type::DISCOVERY_COMPLETE,
                            complete,
                            self.version,
                        )?)
                        .await?;
                }
                message_type::EXECUTION_START => {
                    let criteria: RunCriteria = message.deserialize_payload()?;
                    let progress = ProgressPublisher {
                        channel: self.channel.clone(),
                        version: self.version,
                    };
                    let complete = session.run(criteria, &progress).await;
                    self.channel
                        .send(&Message::versioned(
                            message_type::EXECUTION_COMPLETE,
                            complete,
                            self.version,
                        )?)
                        .await?;
                }
                message_type::BEFORE_RUN_START => {
                    let payload: BeforeRunStartPayload = message.deserialize_payload()?;
                    let result = session.before_run_start(payload).await;
                    self.channel
                        .send(&Message::versioned(
                            message_type::BEFORE_RUN_START_RESULT,
                            result,
                            self.version,
                        )?)
                        .await?;
                }
                message_type::AFTER_RUN_END => {
                    let payload: AfterRunEndPayload = message.deserialize_payload()?;
                    let result = session.after_run_end(payload).await;
                    self.channel
                        .send(&Message::versioned(
                            message_type::AFTER_RUN_END_RESULT,
                            result,
                            self.version,
                        )?)
                        .await?;
                }
                message_type::EXECUTION_CANCEL | message_type::EXECUTION_ABORT => {
                    // Requests are serviced to completion before the
                    // next frame is read, so by the time these arrive
                    // there is nothing in flight to stop.
                    debug!("ignored {} with no request in flight", message.message_type);
                }
                message_type::SESSION_TERMINATE => {
                    info!("session terminated by coordinator");
                    return Ok(());
                }
                other => {
                    debug!("ignored unknown frame '{}'", other);
                }
            }
        }
    }
}
