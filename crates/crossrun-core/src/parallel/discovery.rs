//! Parallel discovery: one discovery request fanned out across a pool
//! of workers, one source per unit of work.

use super::slot_count;
use crate::config::ConnectionConfig;
use crate::events::{DiscoveryCompleteEvent, DiscoveryEventSink};
use crate::hosting::{ExtensionCache, RuntimeProvider};
use crate::protocol::{message_type, DiscoveryCriteria, Message};
use crate::proxy::{ProxyDiscoveryManager, ProxyOperationManager};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Pool-internal completion record. Slot completions write into it;
/// the last slot to drain builds the external event from it.
#[derive(Default)]
struct Aggregate {
    total_tests: i64,
    is_aborted: bool,
    error: Option<String>,
    pending_slots: usize,
    fired: bool,
}

/// Per-slot sink: forwards progress verbatim, suppresses the slot's
/// terminal completion frame, and folds the terminal event into the
/// shared aggregate instead of surfacing it.
struct SlotSink<'a> {
    outer: &'a dyn DiscoveryEventSink,
    aggregate: &'a Mutex<Aggregate>,
}

impl DiscoveryEventSink for SlotSink<'_> {
    fn on_tests_found(&self, tests: serde_json::Value) {
        self.outer.on_tests_found(tests);
    }

    fn on_raw_message(&self, message: &Message) {
        if message.message_type != message_type::DISCOVERY_COMPLETE {
            self.outer.on_raw_message(message);
        }
    }

    fn on_complete(&self, event: DiscoveryCompleteEvent) {
        let mut agg = self.aggregate.lock().unwrap();
        if event.total_tests > 0 {
            agg.total_tests += event.total_tests;
        }
        agg.is_aborted |= event.is_aborted;
        if agg.error.is_none() {
            agg.error = event.error;
        }
    }
}

pub struct ParallelDiscoveryManager {
    provider: Arc<dyn RuntimeProvider>,
    extensions: Arc<ExtensionCache>,
    parallelism: usize,
    connection_timeout: Duration,
    proxies: Mutex<Vec<Arc<ProxyDiscoveryManager>>>,
}

impl ParallelDiscoveryManager {
    pub fn new(
        provider: Arc<dyn RuntimeProvider>,
        extensions: Arc<ExtensionCache>,
        parallelism: usize,
    ) -> Self {
        Self {
            provider,
            extensions,
            parallelism,
            connection_timeout: ConnectionConfig::WORKER_CONNECTION_TIMEOUT,
            proxies: Mutex::new(Vec::new()),
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Discover tests across all of `criteria.sources`, one source per
    /// unit of work. Returns once the external sink has received its
    /// single aggregated terminal event.
    pub async fn discover_tests(&self, criteria: DiscoveryCriteria, sink: &dyn DiscoveryEventSink) {
        let DiscoveryCriteria {
            sources,
            run_settings,
            stats_event_frequency,
        } = criteria;

        if sources.is_empty() {
            sink.on_complete(DiscoveryCompleteEvent::default());
            return;
        }

        let slots = slot_count(self.parallelism, sources.len());
        debug!("parallel discovery: {} sources over {} slots", sources.len(), slots);

        let queue = Mutex::new(VecDeque::from(sources));
        let aggregate = Mutex::new(Aggregate {
            pending_slots: slots,
            ..Default::default()
        });

        let proxies: Vec<Arc<ProxyDiscoveryManager>> = (0..slots)
            .map(|_| {
                let operation = ProxyOperationManager::new(self.provider.clone())
                    .with_connection_timeout(self.connection_timeout);
                Arc::new(ProxyDiscoveryManager::new(
                    Arc::new(operation),
                    self.extensions.clone(),
                ))
            })
            .collect();
        *self.proxies.lock().unwrap() = proxies.clone();

        let tasks = proxies.iter().map(|proxy| {
            self.slot_loop(
                proxy.clone(),
                &queue,
                &aggregate,
                &run_settings,
                stats_event_frequency,
                sink,
            )
        });
        futures::future::join_all(tasks).await;

        self.proxies.lock().unwrap().clear();
    }

    async fn slot_loop(
        &self,
        proxy: Arc<ProxyDiscoveryManager>,
        queue: &Mutex<VecDeque<PathBuf>>,
        aggregate: &Mutex<Aggregate>,
        run_settings: &str,
        stats_event_frequency: u64,
        sink: &dyn DiscoveryEventSink,
    ) {
        loop {
            let next = queue.lock().unwrap().pop_front();
            let Some(source) = next else { break };

            let slot_sink = SlotSink {
                outer: sink,
                aggregate,
            };
            let criteria = DiscoveryCriteria {
                sources: vec![source],
                run_settings: run_settings.to_string(),
                stats_event_frequency,
            };
            proxy.discover_tests(criteria, &slot_sink).await;
        }

        proxy.close().await;

        // Check-and-fire happens under the aggregate lock; the callback
        // itself runs after release.
        let fire = {
            let mut agg = aggregate.lock().unwrap();
            agg.pending_slots -= 1;
            if agg.pending_slots == 0 && !agg.fired {
                agg.fired = true;
                Some(DiscoveryCompleteEvent {
                    total_tests: agg.total_tests,
                    is_aborted: agg.is_aborted,
                    error: agg.error.take(),
                })
            } else {
                None
            }
        };
        if let Some(event) = fire {
            sink.on_complete(event);
        }
    }

    /// Broadcast an abort to every currently-owned slot.
    pub async fn abort(&self) {
        let proxies: Vec<_> = self.proxies.lock().unwrap().clone();
        for proxy in proxies {
            proxy.abort().await;
        }
    }
}
