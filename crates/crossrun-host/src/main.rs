//! Crossrun reference test host.
//!
//! A minimal worker that dials the coordinator, answers the version
//! handshake, and fabricates one test per source. It exists so the
//! engine can be exercised end to end with a real OS process; real test
//! frameworks supply their own host implementing the same protocol.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use crossrun_core::comm::{HostSession, ProgressPublisher, RequestHandler};
use crossrun_core::protocol::{
    DiscoveryCompletePayload, DiscoveryCriteria, RunCompletePayload, RunCriteria, RunStats,
};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "crossrun-host")]
#[command(about = "Reference test host for the crossrun engine")]
struct Args {
    /// Port the coordinator is listening on
    #[arg(long, default_value = "0")]
    port: u16,

    /// Coordinator endpoint to dial, host:port
    #[arg(long)]
    endpoint: String,

    /// Connection role; the reference host always dials out
    #[arg(long, default_value = "client")]
    role: String,

    /// Coordinator process id, recorded in diagnostics
    #[arg(long, default_value = "0")]
    parentprocessid: u32,

    /// Write diagnostics to this file instead of stderr
    #[arg(long)]
    diag: Option<PathBuf>,

    /// Diagnostic verbosity, 0 (errors only) to 4 (debug)
    #[arg(long, default_value = "3")]
    tracelevel: u8,
}

/// Fabricates one test per source. Discovery reports
/// `<source>::test_case`; execution passes every test.
struct LoopbackSession;

#[async_trait]
impl HostSession for LoopbackSession {
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

        if let Err(e) = progress.tests_found(serde_json::json!(names)).await {
            warn!("failed to stream discovered tests: {}", e);
            return DiscoveryCompletePayload {
                total_tests: -1,
                is_aborted: true,
                last_chunk: vec![],
            };
        }

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
        let started = Instant::now();
        let count = criteria.sources().map(|s| s.len()).unwrap_or(1) as u64;

        if let Err(e) = progress
            .run_stats(serde_json::json!({ "executed": count }))
            .await
        {
            warn!("failed to stream run stats: {}", e);
        }

        RunCompletePayload {
            stats: RunStats {
                total: count,
                passed: count,
                failed: 0,
                skipped: 0,
            },
            elapsed_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        }
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.tracelevel {
        0 | 1 => Level::ERROR,
        2 => Level::WARN,
        3 => Level::INFO,
        _ => Level::DEBUG,
    };
    // RUST_LOG overrides --tracelevel when set.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    match &args.diag {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open diag file {}", path.display()))?;
            FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .compact()
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    if args.role != "client" {
        bail!("unsupported role '{}': this host only dials out", args.role);
    }

    info!(
        "crossrun-host starting: endpoint={} port={} parent={}",
        args.endpoint, args.port, args.parentprocessid
    );

    let mut handler = RequestHandler::connect(&args.endpoint, Duration::from_secs(30))
        .await
        .context("failed to reach coordinator")?;

    tokio::select! {
        result = handler.serve(&LoopbackSession) => {
            result.context("session ended abnormally")?;
            info!("session complete");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }

    Ok(())
}
