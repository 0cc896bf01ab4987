// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Warren: worker-attributed reverse proxy
//
//  Data plane:    monoio thread-per-core proxy threads
//  Control plane: health checks, supervisor, admin API on tokio
//  Logs:          one append-only stream per worker process
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use warren_admin::{AdminServer, AdminState};
use warren_core::{WarrenConfig, WorkerPool};
use warren_observability::{LogAggregator, LogQuery, MetricsCollector};
use warren_proxy::health_check::HealthChecker;
use warren_proxy::supervisor::{ProcessLauncher, Supervisor};
use warren_proxy::worker::{self, SharedState};

/// Set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "warren", version, about = "Warren: worker-attributed reverse proxy")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/warren/warren.yaml", global = true)]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Diagnostic log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy, health checker, supervisor and admin API (default)
    Serve,
    /// Print access log records, oldest first
    Logs {
        /// Only records handled by this worker pid
        #[arg(long)]
        worker: Option<u32>,
        /// Inclusive lower bound (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        since: Option<DateTime<Utc>>,
        /// Inclusive upper bound (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        until: Option<DateTime<Utc>>,
        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
        /// Keep following the streams for new records
        #[arg(short, long)]
        follow: bool,
        /// Override access_log.dir
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Print the number of requests recorded per worker pid
    Counts {
        /// Override access_log.dir
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected RFC 3339 timestamp: {e}"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init(),
    }

    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config),
        Command::Logs {
            worker,
            since,
            until,
            limit,
            follow,
            log_dir,
        } => {
            let mut query = LogQuery {
                worker,
                since,
                until,
                limit,
            };
            if let (Some(s), Some(u)) = (query.since, query.until) {
                if s > u {
                    anyhow::bail!("--since is later than --until");
                }
            }
            let dir = log_dir.unwrap_or(config.access_log.dir);
            let aggregator = LogAggregator::new(dir);
            let out = io::stdout().lock();
            if follow {
                query.until = None;
                print_records(out, aggregator.tail(query))
            } else {
                print_records(out, aggregator.query(&query)?)
            }
        }
        Command::Counts { log_dir } => {
            let dir = log_dir.unwrap_or(config.access_log.dir);
            let counts = LogAggregator::new(dir).count_by_worker()?;
            let mut out = BufWriter::new(io::stdout().lock());
            let mut total = 0u64;
            for (pid, n) in &counts {
                writeln!(out, "{pid}\t{n}")?;
                total += n;
            }
            writeln!(out, "total\t{total}")?;
            out.flush()?;
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<WarrenConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config file");
        WarrenConfig::load(path)
    } else {
        info!("No config file found, using defaults");
        let config = WarrenConfig::default();
        config.validate()?;
        Ok(config)
    }
}

fn print_records(
    out: impl Write,
    records: impl Iterator<Item = warren_observability::RequestRecord>,
) -> anyhow::Result<()> {
    let mut out = BufWriter::new(out);
    for record in records {
        match writeln!(out, "{}", record.to_line()).and_then(|_| out.flush()) {
            Ok(()) => {}
            // Reader went away, e.g. `warren logs | head`.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn serve(config: WarrenConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Warren starting (monoio thread-per-core proxy)"
    );

    // ── Raise file-descriptor limit (EMFILE guard) ──
    #[cfg(unix)]
    raise_fd_limit();

    std::fs::create_dir_all(&config.access_log.dir)?;
    setup_signal_handler();

    let threads = config.effective_threads();
    let pool = Arc::new(WorkerPool::new());
    let metrics = Arc::new(MetricsCollector::new(config.observability.prometheus.enabled)?);
    let shared = SharedState::new(Arc::clone(&pool), config.clone(), Arc::clone(&metrics));

    // ── Spawn monoio proxy threads ──
    let proxy_handles = worker::spawn_workers(Arc::clone(&shared), threads)?;

    // ── Control plane on a dedicated tokio runtime ──
    let (stop_tx, stop_rx) = watch::channel(false);
    let control = {
        let config = config.clone();
        let pool = Arc::clone(&pool);
        let metrics = Arc::clone(&metrics);
        std::thread::Builder::new()
            .name("warren-control".to_string())
            .spawn(move || -> anyhow::Result<()> {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("warren-control-rt")
                    .enable_all()
                    .build()?;
                rt.block_on(control_plane(config, pool, metrics, stop_rx))
            })?
    };

    info!(
        threads,
        proxy_addr = %config.proxy.listen_addr,
        admin_addr = %config.admin.addr,
        pool_size = config.pool.size,
        "Warren is ready, serving traffic"
    );

    // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
    while !SHUTDOWN.load(Ordering::Relaxed) && !control.is_finished() {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("Shutdown signal received, draining workers");

    // Workers drain while the proxy still relays their in-flight responses.
    let _ = stop_tx.send(true);
    let control_result = match control.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("control plane thread panicked")),
    };

    shared.stopping.store(true, Ordering::Release);
    for handle in proxy_handles {
        if handle.join().is_err() {
            error!("Proxy thread panicked");
        }
    }

    control_result?;
    info!("Warren stopped");
    Ok(())
}

/// Resolves once the shutdown flag flips.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn control_plane(
    config: WarrenConfig,
    pool: Arc<WorkerPool>,
    metrics: Arc<MetricsCollector>,
    stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let launcher = Arc::new(ProcessLauncher::from_config(&config));
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&pool),
        launcher,
        config.pool.clone(),
    ));
    let checker = Arc::new(HealthChecker::new(
        Arc::clone(&pool),
        config.health_check.clone(),
        Arc::clone(&metrics),
    )?);

    let admin_state = Arc::new(AdminState {
        pool: Arc::clone(&pool),
        supervisor: Some(Arc::clone(&supervisor)),
        aggregator: LogAggregator::new(config.access_log.dir.clone()),
        metrics,
        metrics_path: config.observability.prometheus.path.clone(),
    });
    let admin = AdminServer::new(config.admin.clone(), admin_state);
    let admin_task = tokio::spawn(admin.start(stopped(stop.clone())));
    let health_task = tokio::spawn(Arc::clone(&checker).run(stopped(stop.clone())));

    // Returns after every worker has been drained and stopped.
    supervisor.run(stopped(stop)).await;

    if let Err(e) = health_task.await {
        warn!(error = %e, "Health checker task failed");
    }
    match admin_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Admin API failed"),
        Err(e) => warn!(error = %e, "Admin API task failed"),
    }
    Ok(())
}

/// Raise RLIMIT_NOFILE to min(hard_limit, 65536): every client connection
/// holds a worker connection too, plus the idle keepalive pools.
#[cfg(unix)]
fn raise_fd_limit() {
    // SAFETY: getrlimit/setrlimit only read and write the local struct.
    unsafe {
        let mut rl = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) != 0 {
            warn!("getrlimit(RLIMIT_NOFILE) failed, fd limit unchanged");
            return;
        }
        let hard = rl.rlim_max;
        let target: libc::rlim_t = if hard == libc::RLIM_INFINITY || hard > 65536 {
            65536
        } else {
            hard
        };
        if rl.rlim_cur >= target {
            tracing::debug!(limit = rl.rlim_cur, "fd limit already sufficient");
            return;
        }
        rl.rlim_cur = target;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &rl) != 0 {
            warn!(
                tried = target,
                "setrlimit(RLIMIT_NOFILE) failed; run 'ulimit -n 65536' \
                 or lower proxy.keepalive_pool_size"
            );
        } else {
            info!(limit = target, "File descriptor limit raised");
        }
    }
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
