//! Pre-warmed worker sessions.
//!
//! A session holds one connected worker per source, started ahead of
//! any request and checked out by exact `(source, settings identity)`
//! match. The pool is an explicit object constructed once and passed by
//! reference; tests build a fresh pool per test.

pub mod fingerprint;
pub mod pool;

pub use fingerprint::SettingsFingerprint;
pub use pool::SessionPool;

use crate::proxy::ProxyOperationManager;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Opaque session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What to pre-warm and under which policy.
#[derive(Debug, Clone)]
pub struct SessionCriteria {
    pub sources: Vec<PathBuf>,
    pub run_settings: String,
    /// Tolerate per-source connection failures as long as at least one
    /// worker connected. Off by default: any failure fails the start.
    pub allow_setup_failures: bool,
}

impl SessionCriteria {
    pub fn new(sources: Vec<PathBuf>, run_settings: impl Into<String>) -> Self {
        Self {
            sources,
            run_settings: run_settings.into(),
            allow_setup_failures: false,
        }
    }

    pub fn allow_setup_failures(mut self) -> Self {
        self.allow_setup_failures = true;
        self
    }
}

/// Startup metrics reported by a successful session start.
#[derive(Debug, Clone)]
pub struct SessionStartedEvent {
    pub session_id: SessionId,
    pub worker_count: usize,
    pub spawn_duration: Duration,
}

/// Creates the lifecycle manager for each session worker. Kept behind a
/// trait so tests and embedders control provider, timeout, and
/// diagnostics wiring.
pub trait ProxyFactory: Send + Sync {
    fn create(&self) -> Arc<ProxyOperationManager>;
}

impl<F> ProxyFactory for F
where
    F: Fn() -> Arc<ProxyOperationManager> + Send + Sync,
{
    fn create(&self) -> Arc<ProxyOperationManager> {
        self()
    }
}
