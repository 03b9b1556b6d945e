//! Crossrun Core - Test orchestration over short-lived worker processes.
//!
//! This crate provides the coordinator side of a test-run engine: it
//! launches worker processes (test hosts), speaks a length-prefixed
//! JSON protocol with them over loopback TCP, and fans discovery and
//! execution requests out across a pool of workers while aggregating
//! their completion streams into a single terminal event. What a
//! "test" is stays opaque; workers and runtimes plug in behind the
//! [`hosting::RuntimeProvider`] trait.
//!
//! For the reference worker binary, see the `crossrun-host` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use crossrun_core::hosting::{DefaultRuntimeProvider, ExtensionCache};
//! use crossrun_core::parallel::ParallelDiscoveryManager;
//! use crossrun_core::protocol::DiscoveryCriteria;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let provider = Arc::new(DefaultRuntimeProvider::new("crossrun-host".into()));
//!     let extensions = Arc::new(ExtensionCache::new());
//!     let manager = ParallelDiscoveryManager::new(provider, extensions, 4);
//!
//!     let criteria = DiscoveryCriteria::new(vec!["tests_a.dll".into()], "{}");
//!     manager.discover_tests(criteria, &MySink).await;
//! }
//! ```

pub mod cancel;
pub mod comm;
pub mod config;
pub mod datacollect;
pub mod error;
pub mod events;
pub mod hosting;
pub mod parallel;
pub mod protocol;
pub mod proxy;
pub mod session;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use comm::{HostSession, ProgressPublisher, RequestHandler, RequestSender};
pub use datacollect::DataCollectionCoordinator;
pub use error::{CrossrunError, Result};
pub use events::{
    DiscoveryCompleteEvent, DiscoveryEventSink, MessageLevel, MessageSink, RunCompleteEvent,
    RunEventSink,
};
pub use parallel::{ParallelDiscoveryManager, ParallelExecutionManager};
pub use proxy::{ProxyDiscoveryManager, ProxyExecutionManager, ProxyId, ProxyOperationManager};
pub use session::{
    ProxyFactory, SessionCriteria, SessionId, SessionPool, SessionStartedEvent,
    SettingsFingerprint,
};
