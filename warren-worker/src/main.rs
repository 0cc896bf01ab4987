//! warren-worker: one pool member.
//!
//! Serves HTTP/1.1 on `--addr`, answers liveness on `--health-path` and
//! writes its access log to `<log-dir>/worker-<pid>-<started_ms>.log`.

use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use warren_core::WorkerKey;
use warren_core::config::BackpressurePolicy;
use warren_observability::{AccessLogSink, MetricsCollector, SinkOptions};
use warren_worker::{EchoApp, WorkerOptions, WorkerServer};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backpressure {
    DropOldest,
    Block,
}

impl From<Backpressure> for BackpressurePolicy {
    fn from(b: Backpressure) -> Self {
        match b {
            Backpressure::DropOldest => BackpressurePolicy::DropOldest,
            Backpressure::Block => BackpressurePolicy::Block,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "warren-worker", version, about = "Warren application worker")]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:8001")]
    addr: SocketAddr,

    /// Directory holding per-worker access log streams
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Recycle after this many requests (0 = never)
    #[arg(long, default_value_t = 0)]
    max_requests: u64,

    /// Liveness endpoint
    #[arg(long, default_value = "/healthz")]
    health_path: String,

    /// Serve this worker's own metrics here
    #[arg(long)]
    metrics_path: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Access log queue capacity
    #[arg(long, default_value_t = 8192)]
    buffer_capacity: usize,

    /// What a full access log queue does
    #[arg(long, value_enum, default_value = "drop-oldest")]
    backpressure: Backpressure,

    /// Grace period for the `block` policy
    #[arg(long, default_value_t = 50)]
    block_timeout_ms: u64,

    /// Use the peer address even when X-Real-IP / X-Forwarded-For are present
    #[arg(long)]
    ignore_forwarded_headers: bool,

    /// Write access log records for liveness probes
    #[arg(long)]
    log_health_checks: bool,

    /// Upper bound on draining in-flight requests at shutdown
    #[arg(long, default_value_t = 30_000)]
    drain_timeout_ms: u64,

    /// Tokio worker threads (0 = number of CPU cores)
    #[arg(long, default_value_t = 0)]
    threads: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    let threads = if cli.threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        cli.threads
    };

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let key = WorkerKey {
        pid: std::process::id(),
        started_at_ms: Utc::now().timestamp_millis(),
    };

    let sink = Arc::new(AccessLogSink::open(
        &cli.log_dir,
        key,
        SinkOptions {
            capacity: cli.buffer_capacity.max(1),
            policy: cli.backpressure.into(),
            block_timeout: Duration::from_millis(cli.block_timeout_ms),
        },
    )?);
    let metrics = Arc::new(MetricsCollector::new(cli.metrics_path.is_some())?);

    let options = WorkerOptions {
        pid: key.pid,
        health_path: cli.health_path,
        metrics_path: cli.metrics_path,
        max_requests: cli.max_requests,
        trust_forwarded_headers: !cli.ignore_forwarded_headers,
        log_health_checks: cli.log_health_checks,
        drain_timeout: Duration::from_millis(cli.drain_timeout_ms),
    };

    let listener = TcpListener::bind(cli.addr).await?;
    info!(worker = key.pid, log = %sink.path().display(), "Worker ready");

    let server = WorkerServer::new(options, Arc::new(EchoApp::new(key.pid)), Arc::clone(&sink), metrics);
    server.serve(listener, shutdown_signal()).await?;

    sink.close();
    Ok(())
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
