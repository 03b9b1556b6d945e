//! Runtime provider: the collaborator that turns a source list and a
//! connection descriptor into a launchable worker process.
//!
//! The engine never builds a worker command line itself and never calls
//! `std::process` directly; everything goes through [`RuntimeProvider`]
//! so tests can substitute in-process workers and deployments can
//! substitute exotic hosts.

use crate::protocol::ConnectionInfo;
use crate::{CrossrunError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Diagnostics requested for a worker: a log file and a trace level.
#[derive(Debug, Clone)]
pub struct DiagOptions {
    pub log_file: PathBuf,
    pub trace_level: u8,
}

/// Process-start descriptor for one worker.
#[derive(Debug, Clone)]
pub struct StartInfo {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// Handle to a launched worker process.
#[async_trait]
pub trait WorkerHandle: Send {
    /// OS process id, or 0 when the worker is not an OS process.
    fn pid(&self) -> u32;

    /// Terminate the worker. Idempotent; terminating an already-dead
    /// worker is not an error.
    async fn terminate(&mut self) -> Result<()>;
}

/// Collaborator that describes and launches worker processes.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Build the process-start descriptor for the given sources, seeded
    /// with a fresh connection descriptor and optional diagnostics.
    fn get_process_start_info(
        &self,
        sources: &[PathBuf],
        env: &BTreeMap<String, String>,
        connection: &ConnectionInfo,
        diag: Option<&DiagOptions>,
    ) -> Result<StartInfo>;

    /// The source paths the provider will actually execute. Sources may
    /// be transformed (a package reference resolved to a concrete
    /// binary); criteria must carry the resolved values before dispatch.
    fn get_resolved_sources(&self, sources: &[PathBuf]) -> Vec<PathBuf> {
        sources.to_vec()
    }

    /// Launch the described worker.
    async fn launch(&self, start_info: &StartInfo) -> Result<Box<dyn WorkerHandle>>;
}

/// Handle to a spawned OS worker process.
pub struct ProcessWorkerHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl WorkerHandle for ProcessWorkerHandle {
    fn pid(&self) -> u32 {
        self.child.id().unwrap_or(0)
    }

    async fn terminate(&mut self) -> Result<()> {
        // Kill on an already-exited child reports an error; swallow it.
        if let Err(e) = self.child.kill().await {
            debug!("suppressed worker kill error: {}", e);
        }
        Ok(())
    }
}

/// Provider that launches a real worker executable, passing the
/// standard worker command line:
///
/// ```text
/// --port <n> --endpoint <host:port> --role client
/// --parentprocessid <pid> [--diag <logfile> --tracelevel <n>]
/// ```
pub struct DefaultRuntimeProvider {
    executable: PathBuf,
}

impl DefaultRuntimeProvider {
    pub fn new(executable: impl AsRef<Path>) -> Self {
        Self {
            executable: executable.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl RuntimeProvider for DefaultRuntimeProvider {
    fn get_process_start_info(
        &self,
        sources: &[PathBuf],
        env: &BTreeMap<String, String>,
        connection: &ConnectionInfo,
        diag: Option<&DiagOptions>,
    ) -> Result<StartInfo> {
        let port = connection.port().ok_or_else(|| CrossrunError::Validation {
            field: "connection.endpoint".to_string(),
            message: format!("endpoint has no port: {}", connection.endpoint),
        })?;

        let mut args = vec![
            "--port".to_string(),
            port.to_string(),
            "--endpoint".to_string(),
            connection.endpoint.clone(),
            "--role".to_string(),
            "client".to_string(),
            "--parentprocessid".to_string(),
            std::process::id().to_string(),
        ];
        if let Some(diag) = diag {
            args.push("--diag".to_string());
            args.push(diag.log_file.display().to_string());
            args.push("--tracelevel".to_string());
            args.push(diag.trace_level.to_string());
        }

        debug!(
            "start info for {} sources: {} {:?}",
            sources.len(),
            self.executable.display(),
            args
        );

        Ok(StartInfo {
            executable: self.executable.clone(),
            args,
            env: env.clone(),
            working_dir: None,
        })
    }

    async fn launch(&self, start_info: &StartInfo) -> Result<Box<dyn WorkerHandle>> {
        let mut command = tokio::process::Command::new(&start_info.executable);
        command
            .args(&start_info.args)
            .envs(&start_info.env)
            .kill_on_drop(true);
        if let Some(dir) = &start_info.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| CrossrunError::LaunchFailed {
            message: format!("{}: {}", start_info.executable.display(), e),
        })?;

        debug!(
            "launched worker pid {} ({})",
            child.id().unwrap_or(0),
            start_info.executable.display()
        );

        Ok(Box::new(ProcessWorkerHandle { child }))
    }
}
