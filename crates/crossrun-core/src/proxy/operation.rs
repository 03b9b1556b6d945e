//! Single-worker lifecycle manager.
//!
//! Owns exactly one worker process and one request sender for one
//! logical pipeline. Channel setup is idempotent; teardown is safe to
//! repeat and always re-sends the end-of-session signal (attempted even
//! when never connected, with dead-stream failures swallowed — see
//! DESIGN.md for the recorded decision).

use crate::cancel::CancellationToken;
use crate::comm::sender::{listener_connection_info, ConnectionState, RequestSender};
use crate::config::ConnectionConfig;
use crate::hosting::{DiagOptions, RuntimeProvider, WorkerHandle};
use crate::{CrossrunError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Identity of one lifecycle manager, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId(u64);

impl ProxyId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy-{}", self.0)
    }
}

/// Owns one worker process, its channel, and its request sender.
pub struct ProxyOperationManager {
    id: ProxyId,
    provider: Arc<dyn RuntimeProvider>,
    sender: RequestSender,
    connection_timeout: Duration,
    worker_env: BTreeMap<String, String>,
    diag_dir: Option<PathBuf>,
    trace_level: u8,
    worker: Mutex<Option<Box<dyn WorkerHandle>>>,
    connected: Mutex<bool>,
    cancellation: CancellationToken,
}

impl fmt::Debug for ProxyOperationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOperationManager")
            .field("id", &self.id)
            .field("connection_timeout", &self.connection_timeout)
            .field("worker_env", &self.worker_env)
            .field("diag_dir", &self.diag_dir)
            .field("trace_level", &self.trace_level)
            .finish_non_exhaustive()
    }
}

impl ProxyOperationManager {
    pub fn new(provider: Arc<dyn RuntimeProvider>) -> Self {
        Self {
            id: ProxyId::next(),
            provider,
            sender: RequestSender::new(),
            connection_timeout: ConnectionConfig::WORKER_CONNECTION_TIMEOUT,
            worker_env: BTreeMap::new(),
            diag_dir: None,
            trace_level: 0,
            worker: Mutex::new(None),
            connected: Mutex::new(false),
            cancellation: CancellationToken::new(),
        }
    }

    /// Override the window the worker gets to dial back.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Environment the worker process must be launched with (for
    /// example, variables requested by the data collector).
    pub fn with_worker_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.worker_env = env;
        self
    }

    /// Enable worker diagnostics: each launch gets a fresh log file
    /// under `dir`.
    pub fn with_diagnostics(mut self, dir: impl AsRef<Path>, trace_level: u8) -> Self {
        self.diag_dir = Some(dir.as_ref().to_path_buf());
        self.trace_level = trace_level;
        self
    }

    pub fn id(&self) -> ProxyId {
        self.id
    }

    pub fn provider(&self) -> &Arc<dyn RuntimeProvider> {
        &self.provider
    }

    pub fn sender(&self) -> &RequestSender {
        &self.sender
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.child_token()
    }

    /// Whether a worker is currently connected.
    pub async fn is_connected(&self) -> bool {
        *self.connected.lock().await
    }

    /// Whether the channel died mid-request while the manager still
    /// holds its worker. A faulted manager accepts no further requests
    /// until it is closed.
    pub async fn is_faulted(&self) -> bool {
        *self.connected.lock().await && self.sender.state() == ConnectionState::Closed
    }

    /// Launch the worker and wait for it to connect back; idempotent.
    /// A second call while already connected is a no-op returning the
    /// prior result. After `close`, a subsequent call relaunches a
    /// fresh worker.
    pub async fn setup_channel(&self, sources: &[PathBuf], run_settings: &str) -> Result<()> {
        let mut connected = self.connected.lock().await;
        if *connected {
            debug!("{}: channel already set up, skipping relaunch", self.id);
            return Ok(());
        }

        debug!(
            "{}: setting up channel for {} sources ({} bytes of settings)",
            self.id,
            sources.len(),
            run_settings.len()
        );

        let listener = TcpListener::bind((ConnectionConfig::LOOPBACK, 0)).await?;
        let connection = listener_connection_info(&listener)?;

        let diag = self.diag_dir.as_ref().map(|dir| DiagOptions {
            log_file: dir.join(format!("crossrun.{}.log", self.id)),
            trace_level: self.trace_level,
        });

        let start_info = self.provider.get_process_start_info(
            sources,
            &self.worker_env,
            &connection,
            diag.as_ref(),
        )?;
        let handle = self.provider.launch(&start_info).await?;
        let pid = handle.pid();
        *self.worker.lock().await = Some(handle);

        let wait = self
            .sender
            .wait_for_connection(&listener, self.connection_timeout)
            .await;
        if let Err(e) = wait {
            warn!("{}: worker pid {} failed to connect: {}", self.id, pid, e);
            self.terminate_worker().await;
            return Err(e);
        }

        // A cancel that raced the launch still lets the worker finish
        // connecting, then tears it down here instead of orphaning it.
        if self.cancellation.is_cancelled() {
            info!("{}: cancelled during launch, tearing down worker", self.id);
            self.sender.send_session_end().await;
            self.sender.close().await;
            self.terminate_worker().await;
            return Err(CrossrunError::Cancelled);
        }

        info!(
            "{}: worker pid {} connected, protocol version {}",
            self.id,
            pid,
            self.sender.version()
        );
        *connected = true;
        Ok(())
    }

    /// Send the end-of-session signal and stop the channel. Never
    /// errors; callable any number of times, and each call re-sends the
    /// signal. State is fully reset so `setup_channel` relaunches.
    pub async fn close(&self) {
        self.sender.send_session_end().await;
        self.sender.close().await;
        self.terminate_worker().await;
        *self.connected.lock().await = false;
    }

    async fn terminate_worker(&self) {
        if let Some(mut handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.terminate().await {
                warn!("{}: worker terminate failed: {}", self.id, e);
            }
        }
    }
}
