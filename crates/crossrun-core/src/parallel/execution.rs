//! Parallel execution: one run request fanned out across a pool of
//! workers. Source-based runs split one source per unit; test-case runs
//! are dispatched as a single unit.

use super::slot_count;
use crate::config::ConnectionConfig;
use crate::events::{merge_attachment_sets, RunCompleteEvent, RunEventSink};
use crate::hosting::{ExtensionCache, RuntimeProvider};
use crate::protocol::{message_type, AttachmentSet, Message, RunCriteria, RunItems, RunStats};
use crate::proxy::{ProxyExecutionManager, ProxyOperationManager};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct Aggregate {
    stats: RunStats,
    is_aborted: bool,
    is_canceled: bool,
    error: Option<String>,
    attachments: Vec<AttachmentSet>,
    executor_ids: Vec<String>,
    elapsed: Duration,
    pending_slots: usize,
    fired: bool,
}

impl Aggregate {
    fn record(&mut self, event: RunCompleteEvent) {
        self.stats.merge(&event.stats);
        self.is_aborted |= event.is_aborted;
        self.is_canceled |= event.is_canceled;
        if self.error.is_none() {
            self.error = event.error;
        }
        merge_attachment_sets(&mut self.attachments, event.attachments);
        for id in event.executor_ids {
            if !self.executor_ids.contains(&id) {
                self.executor_ids.push(id);
            }
        }
        self.elapsed = self.elapsed.max(event.elapsed);
    }

    fn take_event(&mut self) -> RunCompleteEvent {
        RunCompleteEvent {
            stats: self.stats.clone(),
            is_aborted: self.is_aborted,
            is_canceled: self.is_canceled,
            error: self.error.take(),
            attachments: std::mem::take(&mut self.attachments),
            executor_ids: std::mem::take(&mut self.executor_ids),
            elapsed: self.elapsed,
        }
    }
}

/// Per-slot sink: forwards progress verbatim, suppresses the slot's
/// terminal completion frame, and folds the terminal event into the
/// shared aggregate instead of surfacing it.
struct SlotSink<'a> {
    outer: &'a dyn RunEventSink,
    aggregate: &'a Mutex<Aggregate>,
}

impl RunEventSink for SlotSink<'_> {
    fn on_run_stats(&self, stats: serde_json::Value) {
        self.outer.on_run_stats(stats);
    }

    fn on_raw_message(&self, message: &Message) {
        if message.message_type != message_type::EXECUTION_COMPLETE {
            self.outer.on_raw_message(message);
        }
    }

    fn on_complete(&self, event: RunCompleteEvent) {
        self.aggregate.lock().unwrap().record(event);
    }
}

pub struct ParallelExecutionManager {
    provider: Arc<dyn RuntimeProvider>,
    extensions: Arc<ExtensionCache>,
    parallelism: usize,
    connection_timeout: Duration,
    proxies: Mutex<Vec<Arc<ProxyExecutionManager>>>,
}

impl ParallelExecutionManager {
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

    /// Run the tests described by `criteria`. Returns once the external
    /// sink has received its single aggregated terminal event.
    pub async fn start_test_run(&self, criteria: RunCriteria, sink: &dyn RunEventSink) {
        let RunCriteria {
            items,
            run_settings,
            stats_event_frequency,
        } = criteria;

        let units: Vec<RunItems> = match items {
            RunItems::Sources(sources) if sources.is_empty() => Vec::new(),
            RunItems::Sources(sources) => sources
                .into_iter()
                .map(|s| RunItems::Sources(vec![s]))
                .collect(),
            // Test cases are opaque to the engine and cannot be
            // regrouped by source, so they travel as one unit.
            RunItems::TestCases(cases) => vec![RunItems::TestCases(cases)],
        };

        if units.is_empty() {
            sink.on_complete(RunCompleteEvent::default());
            return;
        }

        let slots = slot_count(self.parallelism, units.len());
        debug!("parallel run: {} units over {} slots", units.len(), slots);

        let queue = Mutex::new(VecDeque::from(units));
        let aggregate = Mutex::new(Aggregate {
            pending_slots: slots,
            ..Default::default()
        });

        let proxies: Vec<Arc<ProxyExecutionManager>> = (0..slots)
            .map(|_| {
                let operation = ProxyOperationManager::new(self.provider.clone())
                    .with_connection_timeout(self.connection_timeout);
                Arc::new(ProxyExecutionManager::new(
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
        proxy: Arc<ProxyExecutionManager>,
        queue: &Mutex<VecDeque<RunItems>>,
        aggregate: &Mutex<Aggregate>,
        run_settings: &str,
        stats_event_frequency: u64,
        sink: &dyn RunEventSink,
    ) {
        loop {
            let next = queue.lock().unwrap().pop_front();
            let Some(items) = next else { break };

            let slot_sink = SlotSink {
                outer: sink,
                aggregate,
            };
            let criteria = RunCriteria {
                items,
                run_settings: run_settings.to_string(),
                stats_event_frequency,
            };
            proxy.start_test_run(criteria, &slot_sink).await;
        }

        proxy.close().await;

        // Check-and-fire happens under the aggregate lock; the callback
        // itself runs after release.
        let fire = {
            let mut agg = aggregate.lock().unwrap();
            agg.pending_slots -= 1;
            if agg.pending_slots == 0 && !agg.fired {
                agg.fired = true;
                Some(agg.take_event())
            } else {
                None
            }
        };
        if let Some(event) = fire {
            sink.on_complete(event);
        }
    }

    /// Broadcast a cooperative cancel to every currently-owned slot.
    /// Slots with no request in flight reject the signal; that is not
    /// an error at the pool level.
    pub async fn cancel(&self) {
        let proxies: Vec<_> = self.proxies.lock().unwrap().clone();
        for proxy in proxies {
            if let Err(e) = proxy.cancel().await {
                debug!("cancel skipped for idle slot: {}", e);
            }
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
