//! Request sender / request handler pair built on the message channel.
//!
//! The sender is the coordinator end: version handshake, typed
//! request/response calls, and long-lived streamed event delivery. The
//! handler is the worker end, used by the reference host binary and by
//! in-process workers in tests.

pub mod handler;
pub mod sender;

pub use handler::{HostSession, ProgressPublisher, RequestHandler};
pub use sender::{ConnectionState, RequestSender};
