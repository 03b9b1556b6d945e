//! Registry of started sessions and their checked-out workers.

use super::{ProxyFactory, SessionCriteria, SessionId, SessionStartedEvent, SettingsFingerprint};
use crate::error::CrossrunError;
use crate::proxy::{ProxyId, ProxyOperationManager};
use crate::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};

struct PooledProxy {
    source: PathBuf,
    fingerprint: SettingsFingerprint,
    proxy: Arc<ProxyOperationManager>,
    dequeued: bool,
}

struct TestSession {
    proxies: Vec<PooledProxy>,
}

/// Explicit registry, constructed once and passed by reference into
/// every component that checks workers in or out. Dequeue and enqueue
/// mutate under a single lock, so no two callers can hold the same
/// worker.
#[derive(Default)]
pub struct SessionPool {
    sessions: Mutex<HashMap<SessionId, TestSession>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Eagerly launch and connect one worker per source, then register
    /// the session. Fail-fast by default; under
    /// `allow_setup_failures`, per-source failures are tolerated while
    /// at least one worker connected. On a failed start every
    /// partially-started worker is closed before the error returns.
    pub async fn start_session(
        &self,
        criteria: &SessionCriteria,
        factory: &dyn ProxyFactory,
    ) -> Result<SessionStartedEvent> {
        let started = Instant::now();
        let fingerprint = SettingsFingerprint::of(&criteria.run_settings);

        let mut connected: Vec<PooledProxy> = Vec::new();
        let mut first_failure: Option<CrossrunError> = None;

        for source in &criteria.sources {
            let proxy = factory.create();
            match proxy
                .setup_channel(std::slice::from_ref(source), &criteria.run_settings)
                .await
            {
                Ok(()) => connected.push(PooledProxy {
                    source: source.clone(),
                    fingerprint: fingerprint.clone(),
                    proxy,
                    dequeued: false,
                }),
                Err(e) => {
                    let failure = CrossrunError::ProxySetupFailure {
                        source_path: source.clone(),
                        message: e.to_string(),
                    };
                    if !criteria.allow_setup_failures {
                        Self::close_all(&connected).await;
                        return Err(failure);
                    }
                    warn!("session start tolerating failed source {:?}: {}", source, e);
                    first_failure.get_or_insert(failure);
                }
            }
        }

        if connected.is_empty() {
            return Err(first_failure.unwrap_or_else(|| {
                CrossrunError::Validation {
                    field: "sources".to_string(),
                    message: "session requires at least one source".to_string(),
                }
            }));
        }

        let event = SessionStartedEvent {
            session_id: SessionId::generate(),
            worker_count: connected.len(),
            spawn_duration: started.elapsed(),
        };
        info!(
            "session {} started: {} workers in {:?}",
            event.session_id, event.worker_count, event.spawn_duration
        );

        self.sessions
            .lock()
            .unwrap()
            .insert(event.session_id, TestSession { proxies: connected });
        Ok(event)
    }

    /// Check out the worker pre-warmed for exactly this source and
    /// settings identity. Fails immediately when no available worker
    /// matches; it never blocks and never spawns a replacement.
    pub fn dequeue_proxy(
        &self,
        session_id: SessionId,
        source: &Path,
        run_settings: &str,
    ) -> Result<Arc<ProxyOperationManager>> {
        let fingerprint = SettingsFingerprint::of(run_settings);
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| CrossrunError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        let entry = session
            .proxies
            .iter_mut()
            .find(|p| !p.dequeued && p.source == source && p.fingerprint == fingerprint)
            .ok_or_else(|| CrossrunError::SessionIdentityMismatch {
                source_path: source.to_path_buf(),
            })?;
        entry.dequeued = true;
        Ok(entry.proxy.clone())
    }

    /// Return a checked-out worker. Enqueuing a worker that is not
    /// currently dequeued, or an unknown id, is a programming error.
    pub fn enqueue_proxy(&self, session_id: SessionId, proxy_id: ProxyId) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| CrossrunError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        let entry = session
            .proxies
            .iter_mut()
            .find(|p| p.proxy.id() == proxy_id)
            .ok_or_else(|| CrossrunError::OwnershipViolation {
                message: format!("{} does not belong to session {}", proxy_id, session_id),
            })?;
        if !entry.dequeued {
            return Err(CrossrunError::OwnershipViolation {
                message: format!("{} is not dequeued", proxy_id),
            });
        }
        entry.dequeued = false;
        Ok(())
    }

    /// Close every worker and drop the session. Honored once; a second
    /// call fails with `SessionNotFound`.
    pub async fn stop_session(&self, session_id: SessionId) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .remove(&session_id)
            .ok_or_else(|| CrossrunError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        Self::close_all(&session.proxies).await;
        info!("session {} stopped", session_id);
        Ok(())
    }

    async fn close_all(proxies: &[PooledProxy]) {
        for entry in proxies {
            entry.proxy.close().await;
        }
    }
}
