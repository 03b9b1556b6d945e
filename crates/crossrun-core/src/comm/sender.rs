//! Coordinator-side request sender.
//!
//! One sender per worker connection. The sender owns the connection
//! state machine:
//!
//! ```text
//! Unconnected → AwaitingPeer → VersionNegotiated → Ready
//!   → (Discovering | Executing) → Ready → Closed
//! ```
//!
//! While a request is in flight the sender blocking-reads frames on the
//! caller's task and dispatches by message type: streamed progress goes
//! to the caller's event sink immediately; the terminal `*Complete`
//! frame forwards the final event and flips back to `Ready`. A peer
//! that disconnects mid-request produces a synthetic aborted completion
//! carrying a connection-closed error instead of a hang or a raw
//! transport error.

use crate::config::ProtocolConfig;
use crate::events::{DiscoveryCompleteEvent, DiscoveryEventSink, RunCompleteEvent, RunEventSink};
use crate::protocol::{
    message_type, ConnectionInfo, DiscoveryCompletePayload, DiscoveryCriteria, Message,
    MessageChannel, RunCompletePayload, RunCriteria, VersionCheckPayload,
};
use crate::{CrossrunError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    AwaitingPeer,
    VersionNegotiated,
    Ready,
    Discovering,
    Executing,
    Closed,
}

/// Coordinator end of one worker connection.
pub struct RequestSender {
    channel: Mutex<Option<Arc<MessageChannel>>>,
    state: Mutex<ConnectionState>,
    version: AtomicI32,
    session_end_signals: AtomicUsize,
}

impl Default for RequestSender {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSender {
    pub fn new() -> Self {
        Self {
            channel: Mutex::new(None),
            state: Mutex::new(ConnectionState::Unconnected),
            version: AtomicI32::new(ProtocolConfig::VERSION_MIN),
            session_end_signals: AtomicUsize::new(0),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("sender state lock poisoned")
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("sender state lock poisoned") = state;
    }

    /// The protocol version negotiated on connect.
    pub fn version(&self) -> i32 {
        self.version.load(Ordering::SeqCst)
    }

    /// How many end-of-session signals this sender has issued. Each
    /// `send_session_end` call counts, connected or not.
    pub fn session_end_signals(&self) -> usize {
        self.session_end_signals.load(Ordering::SeqCst)
    }

    fn channel(&self) -> Result<Arc<MessageChannel>> {
        self.channel
            .lock()
            .expect("sender channel lock poisoned")
            .clone()
            .ok_or_else(|| CrossrunError::channel_fault("not connected"))
    }

    fn ensure_ready(&self) -> Result<Arc<MessageChannel>> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(CrossrunError::Validation {
                field: "connection_state".to_string(),
                message: format!("request issued while {:?}, expected Ready", state),
            });
        }
        self.channel()
    }

    /// Wait for the launched worker to dial back, then negotiate the
    /// protocol version. Failing to see a peer within `timeout` is a
    /// fatal [`CrossrunError::ConnectionTimeout`].
    pub async fn wait_for_connection(
        &self,
        listener: &TcpListener,
        timeout: Duration,
    ) -> Result<()> {
        self.set_state(ConnectionState::AwaitingPeer);

        let accepted = tokio::time::timeout(timeout, listener.accept()).await;
        let (stream, peer) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Unconnected);
                return Err(e.into());
            }
            Err(_) => {
                self.set_state(ConnectionState::Unconnected);
                return Err(CrossrunError::ConnectionTimeout { timeout });
            }
        };
        debug!("worker connected from {}", peer);

        let channel = Arc::new(MessageChannel::new(stream));
        *self
            .channel
            .lock()
            .expect("sender channel lock poisoned") = Some(channel.clone());

        self.check_version(&channel).await?;
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    /// Send our highest supported version; the peer replies with its
    /// own and both sides clamp to the minimum.
    async fn check_version(&self, channel: &MessageChannel) -> Result<()> {
        let request = Message::new(
            message_type::VERSION_CHECK,
            VersionCheckPayload {
                version: ProtocolConfig::VERSION_MAX,
            },
        )?;
        channel.send(&request).await?;

        let reply = channel
            .receive()
            .await?
            .ok_or_else(|| CrossrunError::channel_fault("peer closed during handshake"))?;
        if reply.message_type != message_type::VERSION_CHECK {
            return Err(CrossrunError::Protocol {
                message: format!(
                    "expected version check reply, got '{}'",
                    reply.message_type
                ),
            });
        }

        let payload: VersionCheckPayload = reply.deserialize_payload()?;
        if payload.version < ProtocolConfig::VERSION_MIN {
            return Err(CrossrunError::Protocol {
                message: format!(
                    "peer version {} below supported minimum {}",
                    payload.version,
                    ProtocolConfig::VERSION_MIN
                ),
            });
        }

        let negotiated = payload.version.min(ProtocolConfig::VERSION_MAX);
        self.version.store(negotiated, Ordering::SeqCst);
        self.set_state(ConnectionState::VersionNegotiated);
        debug!("negotiated protocol version {}", negotiated);
        Ok(())
    }

    /// Forward additional extension paths to the worker, before any
    /// request.
    pub async fn initialize_extensions(&self, paths: &[PathBuf]) -> Result<()> {
        let channel = self.ensure_ready()?;
        let message =
            Message::versioned(message_type::EXTENSIONS_INITIALIZE, paths, self.version())?;
        channel.send(&message).await
    }

    /// Run a discovery request to completion, delivering streamed and
    /// terminal events to `sink`. After the start message is accepted,
    /// this never fails: a peer disconnect becomes a synthetic aborted
    /// completion on the sink.
    pub async fn discover(
        &self,
        criteria: &DiscoveryCriteria,
        sink: &dyn DiscoveryEventSink,
    ) -> Result<()> {
        let channel = self.ensure_ready()?;
        let start = Message::versioned(message_type::DISCOVERY_START, criteria, self.version())?;
        channel.send(&start).await?;
        self.set_state(ConnectionState::Discovering);

        loop {
            let message = match channel.receive().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.fault_during_request("worker closed the connection mid-discovery");
                    sink.on_complete(DiscoveryCompleteEvent::aborted(
                        "connection closed before discovery completed",
                    ));
                    return Ok(());
                }
                Err(e) => {
                    self.fault_during_request(&e.to_string());
                    sink.on_complete(DiscoveryCompleteEvent::aborted(e.to_string()));
                    return Ok(());
                }
            };

            sink.on_raw_message(&message);
            match message.message_type.as_str() {
                message_type::DISCOVERY_TESTS_FOUND => {
                    sink.on_tests_found(message.payload.clone());
                }
                message_type::DISCOVERY_COMPLETE => {
                    let event = match message.deserialize_payload::<DiscoveryCompletePayload>() {
                        Ok(payload) => payload.into(),
                        Err(e) => DiscoveryCompleteEvent::aborted(e.to_string()),
                    };
                    self.set_state(ConnectionState::Ready);
                    sink.on_complete(event);
                    return Ok(());
                }
                other => {
                    debug!("relayed unhandled discovery frame '{}'", other);
                }
            }
        }
    }

    /// Run an execution request to completion, delivering streamed and
    /// terminal events to `sink`. Same disconnect contract as
    /// [`discover`](Self::discover).
    pub async fn run(&self, criteria: &RunCriteria, sink: &dyn RunEventSink) -> Result<()> {
        let channel = self.ensure_ready()?;
        let start = Message::versioned(message_type::EXECUTION_START, criteria, self.version())?;
        channel.send(&start).await?;
        self.set_state(ConnectionState::Executing);

        loop {
            let message = match channel.receive().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.fault_during_request("worker closed the connection mid-run");
                    sink.on_complete(RunCompleteEvent::aborted(
                        "connection closed before the run completed",
                    ));
                    return Ok(());
                }
                Err(e) => {
                    self.fault_during_request(&e.to_string());
                    sink.on_complete(RunCompleteEvent::aborted(e.to_string()));
                    return Ok(());
                }
            };

            sink.on_raw_message(&message);
            match message.message_type.as_str() {
                message_type::EXECUTION_STATS => {
                    sink.on_run_stats(message.payload.clone());
                }
                message_type::EXECUTION_COMPLETE => {
                    let event = match message.deserialize_payload::<RunCompletePayload>() {
                        Ok(payload) => payload.into(),
                        Err(e) => RunCompleteEvent::aborted(e.to_string()),
                    };
                    self.set_state(ConnectionState::Ready);
                    sink.on_complete(event);
                    return Ok(());
                }
                other => {
                    debug!("relayed unhandled execution frame '{}'", other);
                }
            }
        }
    }

    /// Typed request/response call: send one message and wait for the
    /// reply of the given terminal type, skipping unrelated frames.
    pub async fn request(&self, message: Message, reply_type: &str) -> Result<Message> {
        let channel = self.ensure_ready()?;
        channel.send(&message).await?;

        loop {
            let reply = channel
                .receive()
                .await?
                .ok_or_else(|| CrossrunError::channel_fault("peer closed awaiting reply"))?;
            if reply.message_type == reply_type {
                return Ok(reply);
            }
            debug!("skipped frame '{}' awaiting '{}'", reply.message_type, reply_type);
        }
    }

    /// Ask the worker to cancel the in-flight run. Only valid while
    /// executing.
    pub async fn send_cancel(&self) -> Result<()> {
        if self.state() != ConnectionState::Executing {
            return Err(CrossrunError::Validation {
                field: "connection_state".to_string(),
                message: "cancel requested with no run in flight".to_string(),
            });
        }
        let channel = self.channel()?;
        channel
            .send(&Message::new(
                message_type::EXECUTION_CANCEL,
                serde_json::Value::Null,
            )?)
            .await
    }

    /// Ask the worker to abort the in-flight request. Best effort.
    pub async fn send_abort(&self) {
        if let Ok(channel) = self.channel() {
            let Ok(message) =
                Message::new(message_type::EXECUTION_ABORT, serde_json::Value::Null)
            else {
                return;
            };
            channel.send_quietly(&message).await;
        }
    }

    /// Send the end-of-session signal. Counted and attempted on every
    /// call, even when the channel is already gone; failures on a dead
    /// stream are swallowed.
    pub async fn send_session_end(&self) {
        self.session_end_signals.fetch_add(1, Ordering::SeqCst);
        let channel = {
            self.channel
                .lock()
                .expect("sender channel lock poisoned")
                .clone()
        };
        if let Some(channel) = channel {
            if let Ok(message) =
                Message::new(message_type::SESSION_TERMINATE, serde_json::Value::Null)
            {
                channel.send_quietly(&message).await;
            }
        }
    }

    /// Stop the channel. Safe to call repeatedly.
    pub async fn close(&self) {
        let channel = {
            self.channel
                .lock()
                .expect("sender channel lock poisoned")
                .take()
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.set_state(ConnectionState::Closed);
    }

    fn fault_during_request(&self, reason: &str) {
        warn!("channel fault mid-request: {}", reason);
        self.set_state(ConnectionState::Closed);
    }
}

/// Build a loopback connection descriptor for a bound listener.
pub(crate) fn listener_connection_info(listener: &TcpListener) -> Result<ConnectionInfo> {
    let addr = listener.local_addr()?;
    Ok(ConnectionInfo::host(addr.to_string()))
}
