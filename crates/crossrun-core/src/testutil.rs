//! Shared test support: an in-process "worker" that dials back over a
//! real socket and speaks the protocol, plus a runtime provider that
//! launches it as a tokio task instead of an OS process.

use crate::comm::handler::{HostSession, ProgressPublisher, RequestHandler};
use crate::config::ProtocolConfig;
use crate::hosting::{DiagOptions, RuntimeProvider, StartInfo, WorkerHandle};
use crate::protocol::{
    message_type, ConnectionInfo, DiscoveryCompletePayload, DiscoveryCriteria, Message,
    MessageChannel, RunCompletePayload, RunCriteria, RunStats, VersionCheckPayload,
};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Session fabricating one found test and one passed result per source.
pub struct ScriptedSession;

#[async_trait]
impl HostSession for ScriptedSession {
    async fn discover(
        &self,
        criteria: DiscoveryCriteria,
        progress: &ProgressPublisher,
    ) -> DiscoveryCompletePayload {
        let names: Vec<String> = criteria
            .sources
            .iter()
            .map(|s| format!("{}::test_case", s.display()))
            .collect();
        let total = names.len() as i64;
        progress
            .tests_found(serde_json::json!(names))
            .await
            .unwrap();
        DiscoveryCompletePayload {
            total_tests: total,
            is_aborted: false,
            last_chunk: vec![],
        }
    }

    async fn run(
        &self,
        criteria: RunCriteria,
        progress: &ProgressPublisher,
    ) -> RunCompletePayload {
        let count = criteria.sources().map(|s| s.len()).unwrap_or(1) as u64;
        progress
            .run_stats(serde_json::json!({"executed": count}))
            .await
            .unwrap();
        RunCompletePayload {
            stats: RunStats {
                total: count,
                passed: count,
                failed: 0,
                skipped: 0,
            },
            elapsed_ms: 10,
            ..Default::default()
        }
    }
}

pub struct NullWorkerHandle;

#[async_trait]
impl WorkerHandle for NullWorkerHandle {
    fn pid(&self) -> u32 {
        0
    }
    async fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Pull the `--endpoint` value out of a worker command line.
pub fn endpoint_from_args(args: &[String]) -> String {
    let at = args
        .iter()
        .position(|a| a == "--endpoint")
        .expect("start info missing --endpoint");
    args[at + 1].clone()
}

/// Worker that answers the handshake, reads the first request frame,
/// then drops the connection without a terminal frame.
async fn crashing_worker(endpoint: String) {
    let stream = TcpStream::connect(&endpoint).await.unwrap();
    let channel = MessageChannel::new(stream);

    let check = channel.receive().await.unwrap().unwrap();
    assert_eq!(check.message_type, message_type::VERSION_CHECK);
    channel
        .send(
            &Message::new(
                message_type::VERSION_CHECK,
                VersionCheckPayload {
                    version: ProtocolConfig::VERSION_MAX,
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();

    // First real request arrives, then the "process" dies.
    let _request = channel.receive().await.unwrap();
    channel.close().await;
}

/// Provider whose "worker" is an in-process task dialing back with a
/// [`ScriptedSession`]. Sources whose file name contains `crash` get a
/// worker that drops the connection mid-request instead.
pub struct LoopbackProvider {
    launches: AtomicUsize,
    connect_back: bool,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            connect_back: true,
        }
    }

    /// A provider whose workers never dial back, for timeout tests.
    pub fn never_connecting() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            connect_back: false,
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeProvider for LoopbackProvider {
    fn get_process_start_info(
        &self,
        sources: &[PathBuf],
        env: &BTreeMap<String, String>,
        connection: &ConnectionInfo,
        _diag: Option<&DiagOptions>,
    ) -> Result<StartInfo> {
        let mut args = vec!["--endpoint".to_string(), connection.endpoint.clone()];
        if sources
            .iter()
            .any(|s| s.to_string_lossy().contains("crash"))
        {
            args.push("--crash".to_string());
        }
        Ok(StartInfo {
            executable: PathBuf::from("loopback"),
            args,
            env: env.clone(),
            working_dir: None,
        })
    }

    async fn launch(&self, start_info: &StartInfo) -> Result<Box<dyn WorkerHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.connect_back {
            let endpoint = endpoint_from_args(&start_info.args);
            if start_info.args.iter().any(|a| a == "--crash") {
                tokio::spawn(crashing_worker(endpoint));
            } else {
                tokio::spawn(async move {
                    let mut handler =
                        RequestHandler::connect(&endpoint, Duration::from_secs(5))
                            .await
                            .expect("loopback worker failed to dial");
                    let _ = handler.serve(&ScriptedSession).await;
                });
            }
        }
        Ok(Box::new(NullWorkerHandle))
    }
}

/// A provider that resolves every source through a fixed mapping, for
/// source-reconciliation tests.
pub struct ResolvingProvider {
    pub inner: LoopbackProvider,
    pub mapping: BTreeMap<PathBuf, PathBuf>,
}

#[async_trait]
impl RuntimeProvider for ResolvingProvider {
    fn get_process_start_info(
        &self,
        sources: &[PathBuf],
        env: &BTreeMap<String, String>,
        connection: &ConnectionInfo,
        diag: Option<&DiagOptions>,
    ) -> Result<StartInfo> {
        self.inner
            .get_process_start_info(sources, env, connection, diag)
    }

    fn get_resolved_sources(&self, sources: &[PathBuf]) -> Vec<PathBuf> {
        sources
            .iter()
            .map(|s| self.mapping.get(s).cloned().unwrap_or_else(|| s.clone()))
            .collect()
    }

    async fn launch(&self, start_info: &StartInfo) -> Result<Box<dyn WorkerHandle>> {
        self.inner.launch(start_info).await
    }
}

pub fn loopback_provider() -> Arc<LoopbackProvider> {
    Arc::new(LoopbackProvider::new())
}
