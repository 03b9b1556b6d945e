//! Centralized configuration constants for the orchestration engine.

use std::time::Duration;

/// Wire protocol parameters.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Highest protocol version this coordinator speaks.
    pub const VERSION_MAX: i32 = 7;
    /// Lowest protocol version still accepted from a worker.
    pub const VERSION_MIN: i32 = 1;
    /// Upper bound on a single wire frame.
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
}

/// Connection establishment parameters.
pub struct ConnectionConfig;

impl ConnectionConfig {
    /// Default window a freshly launched worker gets to dial back.
    pub const WORKER_CONNECTION_TIMEOUT: Duration = Duration::from_millis(90_000);
    /// Window for the auxiliary data collector to dial back.
    pub const COLLECTOR_CONNECTION_TIMEOUT: Duration = Duration::from_millis(30_000);
    /// Collector connection window when a debugger attach is requested.
    pub const DEBUG_ATTACH_TIMEOUT: Duration = Duration::from_secs(300);
    /// Environment variable that requests the extended collector window.
    pub const DEBUG_ENV_VAR: &'static str = "CROSSRUN_COLLECTOR_DEBUG";
    /// All worker channels listen on loopback only.
    pub const LOOPBACK: &'static str = "127.0.0.1";
    /// Timeout a worker-side handler uses when dialing the coordinator.
    pub const HANDLER_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Request and session defaults.
pub struct SessionConfig;

impl SessionConfig {
    /// How many progress events a worker batches before pushing stats.
    pub const DEFAULT_STATS_EVENT_FREQUENCY: u64 = 10;
    /// File-name suffix the extension cache matches test adapters by.
    pub const ADAPTER_SUFFIX: &'static str = ".adapter.json";
}
