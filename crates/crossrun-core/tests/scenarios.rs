//! End-to-end scenarios driven through the public API, with in-process
//! workers dialing back over real loopback sockets behind a fake
//! runtime provider.

use async_trait::async_trait;
use crossrun_core::comm::{HostSession, ProgressPublisher, RequestHandler};
use crossrun_core::events::{DiscoveryCompleteEvent, DiscoveryEventSink, RunCompleteEvent, RunEventSink};
use crossrun_core::hosting::{
    DiagOptions, ExtensionCache, RuntimeProvider, StartInfo, WorkerHandle,
};
use crossrun_core::parallel::{ParallelDiscoveryManager, ParallelExecutionManager};
use crossrun_core::protocol::{
    message_type, ConnectionInfo, DiscoveryCompletePayload, DiscoveryCriteria, Message,
    MessageChannel, RunCompletePayload, RunCriteria, RunStats, VersionCheckPayload,
};
use crossrun_core::proxy::ProxyOperationManager;
use crossrun_core::session::{SessionCriteria, SessionPool};
use crossrun_core::{CrossrunError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

struct EchoSession;

#[async_trait]
impl HostSession for EchoSession {
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
        progress.tests_found(serde_json::json!(names)).await.unwrap();
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
            .run_stats(serde_json::json!({ "executed": count }))
            .await
            .unwrap();
        RunCompletePayload {
            stats: RunStats {
                total: count,
                passed: count,
                failed: 0,
                skipped: 0,
            },
            elapsed_ms: 5,
            ..Default::default()
        }
    }
}

/// Answers the handshake, then drops the connection on the first real
/// request, like a worker dying mid-exchange.
async fn crash_after_first_request(endpoint: String) {
    let stream = TcpStream::connect(&endpoint).await.unwrap();
    let channel = MessageChannel::new(stream);
    while let Ok(Some(message)) = channel.receive().await {
        if message.message_type == message_type::VERSION_CHECK {
            let payload: VersionCheckPayload = message.deserialize_payload().unwrap();
            channel
                .send(&Message::new(message_type::VERSION_CHECK, payload).unwrap())
                .await
                .unwrap();
        } else {
            break;
        }
    }
    channel.close().await;
}

struct NoopHandle;

#[async_trait]
impl WorkerHandle for NoopHandle {
    fn pid(&self) -> u32 {
        0
    }
    async fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}

/// "Launches" workers as tokio tasks that dial back to the coordinator.
/// Sources whose path contains "crash" get a worker that dies after its
/// first request; with `connect_back` off, nothing ever dials in.
struct InProcessProvider {
    launches: AtomicUsize,
    connect_back: bool,
}

impl InProcessProvider {
    fn new() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            connect_back: true,
        }
    }

    fn never_connecting() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            connect_back: false,
        }
    }

    fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeProvider for InProcessProvider {
    fn get_process_start_info(
        &self,
        sources: &[PathBuf],
        env: &BTreeMap<String, String>,
        connection: &ConnectionInfo,
        _diag: Option<&DiagOptions>,
    ) -> Result<StartInfo> {
        let mut args = vec!["--endpoint".to_string(), connection.endpoint.clone()];
        if sources.iter().any(|s| s.display().to_string().contains("crash")) {
            args.push("--crash".to_string());
        }
        Ok(StartInfo {
            executable: PathBuf::from("in-process"),
            args,
            env: env.clone(),
            working_dir: None,
        })
    }

    async fn launch(&self, start_info: &StartInfo) -> Result<Box<dyn WorkerHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.connect_back {
            let endpoint = start_info.args[1].clone();
            if start_info.args.iter().any(|a| a == "--crash") {
                tokio::spawn(crash_after_first_request(endpoint));
            } else {
                tokio::spawn(async move {
                    let stream = TcpStream::connect(&endpoint).await.unwrap();
                    let mut handler = RequestHandler::from_stream(stream);
                    let _ = handler.serve(&EchoSession).await;
                });
            }
        }
        Ok(Box::new(NoopHandle))
    }
}

#[derive(Default)]
struct DiscoverySink {
    found: AtomicUsize,
    complete: Mutex<Vec<DiscoveryCompleteEvent>>,
}

impl DiscoveryEventSink for DiscoverySink {
    fn on_tests_found(&self, _tests: serde_json::Value) {
        self.found.fetch_add(1, Ordering::SeqCst);
    }
    fn on_complete(&self, event: DiscoveryCompleteEvent) {
        self.complete.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct RunSink {
    complete: Mutex<Vec<RunCompleteEvent>>,
}

impl RunEventSink for RunSink {
    fn on_run_stats(&self, _stats: serde_json::Value) {}
    fn on_complete(&self, event: RunCompleteEvent) {
        self.complete.lock().unwrap().push(event);
    }
}

const ONE_VAR: &str = r#"{"environment":{"AAA":"Test1"}}"#;
const TWO_VARS: &str = r#"{"environment":{"AAA":"Test1","BBB":"2"}}"#;

#[tokio::test]
async fn test_session_dequeue_requires_identity_match() {
    let pool = SessionPool::new();
    let factory = || Arc::new(ProxyOperationManager::new(Arc::new(InProcessProvider::new())));

    let criteria = SessionCriteria::new(vec!["a.dll".into()], ONE_VAR);
    let event = pool.start_session(&criteria, &factory).await.unwrap();
    assert_eq!(event.worker_count, 1);

    let proxy = pool
        .dequeue_proxy(event.session_id, Path::new("a.dll"), ONE_VAR)
        .unwrap();
    assert!(proxy.is_connected().await);
    pool.enqueue_proxy(event.session_id, proxy.id()).unwrap();

    // Same source, one extra environment variable: no match.
    let err = pool
        .dequeue_proxy(event.session_id, Path::new("a.dll"), TWO_VARS)
        .unwrap_err();
    assert!(matches!(err, CrossrunError::SessionIdentityMismatch { .. }));

    // The original worker is still available under its own identity.
    let again = pool
        .dequeue_proxy(event.session_id, Path::new("a.dll"), ONE_VAR)
        .unwrap();
    assert_eq!(again.id(), proxy.id());

    pool.enqueue_proxy(event.session_id, again.id()).unwrap();
    pool.stop_session(event.session_id).await.unwrap();
}

#[tokio::test]
async fn test_parallel_discovery_survives_one_crashed_worker() {
    let provider = Arc::new(InProcessProvider::new());
    let manager =
        ParallelDiscoveryManager::new(provider.clone(), Arc::new(ExtensionCache::new()), 8);

    let sources: Vec<PathBuf> = [
        "s1.dll", "s2.dll", "crash3.dll", "s4.dll", "s5.dll", "s6.dll", "s7.dll", "s8.dll",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();

    let sink = DiscoverySink::default();
    manager
        .discover_tests(DiscoveryCriteria::new(sources, "{}"), &sink)
        .await;

    assert_eq!(provider.launch_count(), 8);
    let complete = sink.complete.lock().unwrap();
    assert_eq!(complete.len(), 1);
    assert!(complete[0].is_aborted);
    assert_eq!(complete[0].total_tests, 7);
    assert_eq!(sink.found.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn test_parallel_run_aggregates_stats() {
    let provider = Arc::new(InProcessProvider::new());
    let manager =
        ParallelExecutionManager::new(provider.clone(), Arc::new(ExtensionCache::new()), 3);

    let sink = RunSink::default();
    let criteria = RunCriteria::from_sources(
        vec!["a.dll".into(), "b.dll".into(), "c.dll".into(), "d.dll".into(), "e.dll".into()],
        "{}",
    );
    manager.start_test_run(criteria, &sink).await;

    assert_eq!(provider.launch_count(), 3);
    let complete = sink.complete.lock().unwrap();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].stats.total, 5);
    assert_eq!(complete[0].stats.passed, 5);
    assert!(!complete[0].is_aborted);
}

#[tokio::test]
async fn test_repeated_setup_launches_worker_once() {
    let provider = Arc::new(InProcessProvider::new());
    let manager = ProxyOperationManager::new(provider.clone());

    manager.setup_channel(&["a.dll".into()], "{}").await.unwrap();
    manager.setup_channel(&["a.dll".into()], "{}").await.unwrap();

    assert_eq!(provider.launch_count(), 1);
    manager.close().await;
}

#[tokio::test]
async fn test_connection_timeout_is_bounded() {
    let provider = Arc::new(InProcessProvider::never_connecting());
    let manager = ProxyOperationManager::new(provider)
        .with_connection_timeout(Duration::from_millis(400));

    let started = Instant::now();
    let err = manager.setup_channel(&["a.dll".into()], "{}").await.unwrap_err();

    assert!(matches!(err, CrossrunError::ConnectionTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
}
