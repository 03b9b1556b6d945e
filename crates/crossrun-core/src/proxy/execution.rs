//! Execution proxy: run-request behavior over one lifecycle manager.

use super::operation::ProxyOperationManager;
use crate::config::SessionConfig;
use crate::events::{RunCompleteEvent, RunEventSink};
use crate::hosting::ExtensionCache;
use crate::protocol::RunCriteria;
use crate::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Wraps a lifecycle manager for "run tests" requests.
pub struct ProxyExecutionManager {
    operation: Arc<ProxyOperationManager>,
    extensions: Arc<ExtensionCache>,
    extensions_pushed: AtomicBool,
}

impl ProxyExecutionManager {
    pub fn new(operation: Arc<ProxyOperationManager>, extensions: Arc<ExtensionCache>) -> Self {
        Self {
            operation,
            extensions,
            extensions_pushed: AtomicBool::new(false),
        }
    }

    pub fn operation(&self) -> &Arc<ProxyOperationManager> {
        &self.operation
    }

    /// Set up the channel (idempotent) and forward any cached extension
    /// paths to the worker, once per connection, before any request.
    /// A worker that died mid-request is torn down here first, so the
    /// setup relaunches a fresh one.
    pub async fn initialize(&self, sources: &[PathBuf], run_settings: &str) -> Result<()> {
        if self.operation.is_faulted().await {
            warn!("{}: replacing dead worker", self.operation.id());
            self.close().await;
        }

        self.operation.setup_channel(sources, run_settings).await?;

        if !self.extensions_pushed.swap(true, Ordering::SeqCst) {
            let paths = self
                .extensions
                .get_extension_paths(SessionConfig::ADAPTER_SUFFIX);
            if !paths.is_empty() {
                debug!(
                    "{}: forwarding {} extension paths",
                    self.operation.id(),
                    paths.len()
                );
                self.operation.sender().initialize_extensions(&paths).await?;
            }
        }
        Ok(())
    }

    /// Run tests under `criteria`, delivering events to `sink`. The
    /// sink receives exactly one terminal event: a synchronous failure
    /// while initiating the request becomes a synthetic aborted
    /// completion instead of a propagated error.
    pub async fn start_test_run(&self, mut criteria: RunCriteria, sink: &dyn RunEventSink) {
        if let Err(e) = self.try_run(&mut criteria, sink).await {
            error!("{}: run failed to start: {}", self.operation.id(), e);
            sink.on_complete(RunCompleteEvent::aborted(e.to_string()));
        }
    }

    async fn try_run(&self, criteria: &mut RunCriteria, sink: &dyn RunEventSink) -> Result<()> {
        let sources = criteria.sources().map(<[PathBuf]>::to_vec).unwrap_or_default();
        self.initialize(&sources, &criteria.run_settings).await?;

        // Source-based runs carry the provider's resolved view on the
        // wire; test-case-based runs already reference resolved sources
        // embedded in each case.
        if criteria.sources().is_some() {
            let resolved = self.operation.provider().get_resolved_sources(&sources);
            criteria.set_sources(resolved);
        }

        self.operation.sender().run(criteria, sink).await
    }

    /// Request a cooperative cancel of the in-flight run. The run still
    /// finishes through its terminal event.
    pub async fn cancel(&self) -> Result<()> {
        self.operation.sender().send_cancel().await
    }

    /// Abort the in-flight run, best effort.
    pub async fn abort(&self) {
        self.operation.cancellation().cancel();
        self.operation.sender().send_abort().await;
    }

    pub async fn close(&self) {
        self.operation.close().await;
        // The next connection is a fresh worker and needs the
        // extension paths again.
        self.extensions_pushed.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{LoopbackProvider, ResolvingProvider};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        stats: Mutex<Vec<serde_json::Value>>,
        complete: Mutex<Vec<RunCompleteEvent>>,
    }

    impl RunEventSink for RecordingSink {
        fn on_run_stats(&self, stats: serde_json::Value) {
            self.stats.lock().unwrap().push(stats);
        }
        fn on_complete(&self, event: RunCompleteEvent) {
            self.complete.lock().unwrap().push(event);
        }
    }

    fn manager_with(provider: Arc<dyn crate::hosting::RuntimeProvider>) -> ProxyExecutionManager {
        ProxyExecutionManager::new(
            Arc::new(ProxyOperationManager::new(provider)),
            Arc::new(ExtensionCache::new()),
        )
    }

    #[tokio::test]
    async fn test_run_completes_with_stats() {
        let provider = Arc::new(LoopbackProvider::new());
        let manager = manager_with(provider.clone());

        let sink = RecordingSink::default();
        let criteria = RunCriteria::from_sources(vec!["a.dll".into()], "{}");
        manager.start_test_run(criteria, &sink).await;

        assert_eq!(provider.launch_count(), 1);
        assert!(!sink.stats.lock().unwrap().is_empty());
        let complete = sink.complete.lock().unwrap();
        assert_eq!(complete.len(), 1);
        assert!(!complete[0].is_aborted);
        assert_eq!(complete[0].stats.passed, 1);
    }

    #[tokio::test]
    async fn test_source_run_reconciles_sources() {
        let mut mapping = BTreeMap::new();
        mapping.insert(PathBuf::from("pkg.ref"), PathBuf::from("pkg.bin"));
        let provider = Arc::new(ResolvingProvider {
            inner: LoopbackProvider::new(),
            mapping,
        });
        let manager = manager_with(provider);

        let sink = RecordingSink::default();
        let criteria = RunCriteria::from_sources(vec!["pkg.ref".into()], "{}");
        manager.start_test_run(criteria, &sink).await;

        let complete = sink.complete.lock().unwrap();
        assert_eq!(complete.len(), 1);
        assert!(!complete[0].is_aborted);
    }

    #[tokio::test]
    async fn test_dead_worker_replaced_on_next_request() {
        let provider = Arc::new(LoopbackProvider::new());
        let manager = manager_with(provider.clone());

        let sink = RecordingSink::default();
        let criteria = RunCriteria::from_sources(vec!["crash.dll".into()], "{}");
        manager.start_test_run(criteria, &sink).await;
        assert!(sink.complete.lock().unwrap()[0].is_aborted);

        // The same manager must relaunch a fresh worker for the next
        // request instead of failing it against the dead channel.
        let sink = RecordingSink::default();
        let criteria = RunCriteria::from_sources(vec!["a.dll".into()], "{}");
        manager.start_test_run(criteria, &sink).await;

        let complete = sink.complete.lock().unwrap();
        assert_eq!(complete.len(), 1);
        assert!(!complete[0].is_aborted);
        assert_eq!(complete[0].stats.passed, 1);
        assert_eq!(provider.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_setup_failure_becomes_single_aborted_completion() {
        let provider = Arc::new(LoopbackProvider::never_connecting());
        let operation = Arc::new(
            ProxyOperationManager::new(provider)
                .with_connection_timeout(std::time::Duration::from_millis(200)),
        );
        let manager = ProxyExecutionManager::new(operation, Arc::new(ExtensionCache::new()));

        let sink = RecordingSink::default();
        let criteria = RunCriteria::from_sources(vec!["a.dll".into()], "{}");
        manager.start_test_run(criteria, &sink).await;

        let complete = sink.complete.lock().unwrap();
        assert_eq!(complete.len(), 1);
        assert!(complete[0].is_aborted);
        assert!(complete[0].error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_outside_run_is_rejected() {
        let provider = Arc::new(LoopbackProvider::new());
        let manager = manager_with(provider);

        assert!(manager.cancel().await.is_err());
    }
}
