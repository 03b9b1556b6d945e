//! Duplex message channel over a TCP stream.
//!
//! One side of a worker connection. Sends serialize the envelope and
//! write one length-prefixed frame, flushing synchronously; receives
//! block on the next complete frame. Frames preserve send order on a
//! single channel.
//!
//! # Thread Safety
//!
//! Reader and writer halves are guarded by separate tokio mutexes, so a
//! cancel message can be written by one task while another task is
//! blocked reading streamed events.

use super::frame::{read_frame, write_frame};
use super::message::Message;
use crate::{CrossrunError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Which side of the connection listens vs. dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionRole {
    Host,
    Client,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Host => "host",
            ConnectionRole::Client => "client",
        }
    }
}

/// Transport selector. Only sockets today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transport {
    Sockets,
}

/// Describes one end of a worker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// `host:port` address string.
    pub endpoint: String,
    pub role: ConnectionRole,
    pub transport: Transport,
}

impl ConnectionInfo {
    /// This side listens; the peer dials.
    pub fn host(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            role: ConnectionRole::Host,
            transport: Transport::Sockets,
        }
    }

    /// This side dials out.
    pub fn client(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            role: ConnectionRole::Client,
            transport: Transport::Sockets,
        }
    }

    /// The port component of the endpoint, when present.
    pub fn port(&self) -> Option<u16> {
        self.endpoint.rsplit(':').next()?.parse().ok()
    }
}

/// A connected duplex message channel.
#[derive(Debug)]
pub struct MessageChannel {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
}

impl MessageChannel {
    /// Wrap an established TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
        }
    }

    /// Serialize and send one message, flushing synchronously.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &bytes).await
    }

    /// Send, swallowing failures on a dead stream. Used for teardown
    /// signals where the peer may already be gone.
    pub async fn send_quietly(&self, message: &Message) {
        if let Err(e) = self.send(message).await {
            debug!("suppressed send failure during teardown: {}", e);
        }
    }

    /// Receive the next message. Returns `Ok(None)` when the peer has
    /// closed the connection cleanly.
    pub async fn receive(&self) -> Result<Option<Message>> {
        let mut reader = self.reader.lock().await;
        let Some(bytes) = read_frame(&mut *reader).await? else {
            return Ok(None);
        };
        let message: Message =
            serde_json::from_slice(&bytes).map_err(|e| CrossrunError::Protocol {
                message: format!("malformed frame: {}", e),
            })?;
        Ok(Some(message))
    }

    /// Shut down the write half. Never errors; a stream the peer
    /// already closed is fine to close again.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("suppressed channel shutdown error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::message_type;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (MessageChannel, MessageChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let dialed = dial.await.unwrap();
        (MessageChannel::new(accepted), MessageChannel::new(dialed))
    }

    #[tokio::test]
    async fn test_send_receive_roundtrip() {
        let (a, b) = connected_pair().await;

        let msg = Message::new(
            message_type::DISCOVERY_TESTS_FOUND,
            serde_json::json!(["test_one", "test_two"]),
        )
        .unwrap();
        a.send(&msg).await.unwrap();

        let received = b.receive().await.unwrap().unwrap();
        assert_eq!(received.message_type, message_type::DISCOVERY_TESTS_FOUND);
        assert_eq!(received.payload, serde_json::json!(["test_one", "test_two"]));
    }

    #[tokio::test]
    async fn test_unicode_payload_survives_channel() {
        let (a, b) = connected_pair().await;

        let msg = Message::new(
            message_type::EXECUTION_STATS,
            serde_json::json!({"name": "試験_🚀"}),
        )
        .unwrap();
        a.send(&msg).await.unwrap();

        let received = b.receive().await.unwrap().unwrap();
        assert_eq!(received.payload["name"], "試験_🚀");
    }

    #[tokio::test]
    async fn test_receive_after_peer_close_returns_none() {
        let (a, b) = connected_pair().await;
        a.close().await;
        drop(a);

        let received = b.receive().await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_close_is_infallible_when_peer_already_gone() {
        let (a, b) = connected_pair().await;
        drop(b);

        // Both calls must return without error.
        a.close().await;
        a.close().await;
    }

    #[tokio::test]
    async fn test_order_preserved_on_single_channel() {
        let (a, b) = connected_pair().await;

        for i in 0..10 {
            let msg =
                Message::new(message_type::EXECUTION_STATS, serde_json::json!(i)).unwrap();
            a.send(&msg).await.unwrap();
        }

        for i in 0..10 {
            let received = b.receive().await.unwrap().unwrap();
            assert_eq!(received.payload, serde_json::json!(i));
        }
    }
}
