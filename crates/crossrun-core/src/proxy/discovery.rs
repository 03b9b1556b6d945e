//! Discovery proxy: criteria-specific behavior over one lifecycle
//! manager.

use super::operation::ProxyOperationManager;
use crate::config::SessionConfig;
use crate::events::{DiscoveryCompleteEvent, DiscoveryEventSink};
use crate::hosting::ExtensionCache;
use crate::protocol::DiscoveryCriteria;
use crate::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Wraps a lifecycle manager for "find tests" requests.
pub struct ProxyDiscoveryManager {
    operation: Arc<ProxyOperationManager>,
    extensions: Arc<ExtensionCache>,
    extensions_pushed: AtomicBool,
}

impl ProxyDiscoveryManager {
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

    /// Discover tests under `criteria`, delivering events to `sink`.
    /// The sink receives exactly one terminal event: a synchronous
    /// failure while initiating the request becomes a synthetic aborted
    /// completion instead of a propagated error.
    pub async fn discover_tests(
        &self,
        mut criteria: DiscoveryCriteria,
        sink: &dyn DiscoveryEventSink,
    ) {
        if let Err(e) = self.try_discover(&mut criteria, sink).await {
            error!("{}: discovery failed to start: {}", self.operation.id(), e);
            sink.on_complete(DiscoveryCompleteEvent::aborted(e.to_string()));
        }
    }

    async fn try_discover(
        &self,
        criteria: &mut DiscoveryCriteria,
        sink: &dyn DiscoveryEventSink,
    ) -> Result<()> {
        self.initialize(&criteria.sources, &criteria.run_settings)
            .await?;

        // The provider may execute a transformed view of the sources
        // (e.g. a package reference resolved to a concrete binary);
        // the criteria must carry the resolved values on the wire.
        criteria.sources = self
            .operation
            .provider()
            .get_resolved_sources(&criteria.sources);

        self.operation.sender().discover(criteria, sink).await
    }

    /// Abort the in-flight discovery, best effort.
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
