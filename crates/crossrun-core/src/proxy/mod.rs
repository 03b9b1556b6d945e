//! Coordinator-side proxies: the single-worker lifecycle manager and
//! the discovery/execution specializations layered on it.

pub mod discovery;
pub mod execution;
pub mod operation;

pub use discovery::ProxyDiscoveryManager;
pub use execution::ProxyExecutionManager;
pub use operation::{ProxyId, ProxyOperationManager};
