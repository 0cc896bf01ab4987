//! Worker lifecycle: launch, replace, scale and drain.
//!
//! The supervisor owns the mapping from pool members to OS processes. It
//! never routes traffic; membership changes reach the proxy threads only
//! through the pool's published snapshot.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use warren_core::config::{BackpressurePolicy, PoolConfig};
use warren_core::{WarrenConfig, WarrenError, WorkerKey, WorkerPool, WorkerProcess};

/// Starts and stops worker processes.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Start a worker listening on `addr`. Returns its pid.
    async fn launch(&self, addr: &str) -> Result<u32, WarrenError>;
    /// Ask the worker to finish in-flight work and exit.
    fn terminate(&self, pid: u32);
    /// Stop the worker immediately.
    fn kill(&self, pid: u32);
    /// True once the process is gone (or was never ours).
    fn has_exited(&self, pid: u32) -> bool;
}

/// Launches `warren-worker` child processes.
pub struct ProcessLauncher {
    bin: PathBuf,
    args: Vec<String>,
    children: std::sync::Mutex<HashMap<u32, Child>>,
}

impl ProcessLauncher {
    pub fn new(bin: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            bin: bin.into(),
            args,
            children: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Worker command line derived from the server configuration. Operator
    /// supplied `pool.worker_args` come last so they can override.
    pub fn from_config(config: &WarrenConfig) -> Self {
        let log = &config.access_log;
        let mut args = vec![
            "--log-dir".to_string(),
            log.dir.display().to_string(),
            "--health-path".to_string(),
            config.health_check.path.clone(),
            "--max-requests".to_string(),
            config.pool.max_requests.to_string(),
            "--buffer-capacity".to_string(),
            log.buffer_capacity.to_string(),
            "--backpressure".to_string(),
            match log.backpressure {
                BackpressurePolicy::DropOldest => "drop-oldest".to_string(),
                BackpressurePolicy::Block => "block".to_string(),
            },
            "--block-timeout-ms".to_string(),
            log.block_timeout_ms.to_string(),
            "--drain-timeout-ms".to_string(),
            config.pool.drain_timeout_ms.to_string(),
        ];
        if !log.trust_forwarded_headers {
            args.push("--ignore-forwarded-headers".to_string());
        }
        if log.log_health_checks {
            args.push("--log-health-checks".to_string());
        }
        args.extend(config.pool.worker_args.iter().cloned());
        Self::new(config.pool.worker_bin.clone(), args)
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, addr: &str) -> Result<u32, WarrenError> {
        let child = Command::new(&self.bin)
            .arg("--addr")
            .arg(addr)
            .args(&self.args)
            .spawn()
            .map_err(|e| WarrenError::LaunchFailed(format!("{}: {e}", self.bin.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| WarrenError::LaunchFailed("worker exited immediately".into()))?;
        self.children().insert(pid, child);
        Ok(pid)
    }

    fn terminate(&self, pid: u32) {
        if !self.children().contains_key(&pid) {
            return;
        }
        // SAFETY: plain signal delivery to a child we spawned and have not reaped.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
        }
    }

    fn kill(&self, pid: u32) {
        if let Some(child) = self.children().get_mut(&pid) {
            if let Err(e) = child.start_kill() {
                debug!(pid, error = %e, "SIGKILL failed");
            }
        }
    }

    fn has_exited(&self, pid: u32) -> bool {
        let mut children = self.children();
        let Some(child) = children.get_mut(&pid) else {
            return true;
        };
        match child.try_wait() {
            Ok(None) => false,
            Ok(Some(status)) => {
                debug!(pid, %status, "Worker process exited");
                children.remove(&pid);
                true
            }
            Err(e) => {
                warn!(pid, error = %e, "Cannot query worker status");
                children.remove(&pid);
                true
            }
        }
    }
}

#[derive(Debug)]
struct Tracked {
    /// Launch order, newest highest.
    seq: u64,
    key: WorkerKey,
    addr: String,
    port: u16,
    draining_since: Option<Instant>,
}

/// A worker that has left the pool and was asked to exit.
#[derive(Debug)]
struct Stopping {
    pid: u32,
    port: u16,
    kill_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    workers: Vec<Tracked>,
    stopping: Vec<Stopping>,
    launches: u64,
}

/// Keeps the pool at its target size.
pub struct Supervisor {
    pool: Arc<WorkerPool>,
    launcher: Arc<dyn Launcher>,
    config: PoolConfig,
    target: AtomicUsize,
    wake: Notify,
    state: Mutex<State>,
}

impl Supervisor {
    pub fn new(pool: Arc<WorkerPool>, launcher: Arc<dyn Launcher>, config: PoolConfig) -> Self {
        Self {
            target: AtomicUsize::new(config.size),
            pool,
            launcher,
            config,
            wake: Notify::new(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    /// Change the number of live workers. Growth launches new members,
    /// shrinking drains the newest ones. Returns the previous target.
    pub fn set_pool_size(&self, n: usize) -> usize {
        let prev = self.target.swap(n, Ordering::AcqRel);
        if prev != n {
            info!(from = prev, to = n, "Pool size changed");
        }
        self.wake.notify_one();
        prev
    }

    /// Workers currently owned by the supervisor, including draining ones.
    pub async fn managed(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    /// Reconcile on `reconcile_interval` (or when the target changes) until
    /// `shutdown` resolves, then stop every worker.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(self.config.reconcile_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(size = self.target(), base_port = self.config.base_port, "Supervisor started");
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
                _ = &mut shutdown => break,
            }
            self.reconcile().await;
        }
        self.shutdown().await;
    }

    /// Drain and stop every worker, bounded by twice the drain timeout.
    pub async fn shutdown(&self) {
        self.target.store(0, Ordering::Release);
        let limit = Instant::now() + self.config.drain_timeout() * 2 + Duration::from_secs(1);
        loop {
            self.reconcile().await;
            {
                let mut state = self.state.lock().await;
                if state.workers.is_empty() && state.stopping.is_empty() {
                    break;
                }
                if Instant::now() >= limit {
                    for w in state.workers.drain(..) {
                        self.pool.remove(&w.addr);
                        self.launcher.kill(w.key.pid);
                    }
                    for s in state.stopping.drain(..) {
                        self.launcher.kill(s.pid);
                    }
                    warn!("Shutdown deadline reached, workers killed");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("All workers stopped");
    }

    /// One pass: retire exited and drained workers, then launch or drain to
    /// meet the target.
    pub async fn reconcile(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let drain_timeout = self.config.drain_timeout();

        // Exited on their own: crash or request budget spent.
        let launcher = &self.launcher;
        let pool = &self.pool;
        state.workers.retain(|w| {
            if !launcher.has_exited(w.key.pid) {
                return true;
            }
            if w.draining_since.is_none() {
                warn!(worker = %w.key, addr = %w.addr, "Worker exited, replacing");
            }
            pool.remove(&w.addr);
            false
        });

        // Drained to zero in-flight: remove and stop.
        for reaped in self.pool.reap_drained() {
            if let Some(i) = state.workers.iter().position(|w| w.addr == reaped.addr) {
                let w = state.workers.swap_remove(i);
                self.launcher.terminate(w.key.pid);
                state.stopping.push(Stopping {
                    pid: w.key.pid,
                    port: w.port,
                    kill_at: now + drain_timeout,
                });
            }
        }

        // Drain overran its bound.
        let mut i = 0;
        while i < state.workers.len() {
            let overdue = state.workers[i]
                .draining_since
                .is_some_and(|t| now.duration_since(t) >= drain_timeout);
            if overdue {
                let w = state.workers.swap_remove(i);
                warn!(worker = %w.key, addr = %w.addr, "Drain timeout, removing worker");
                self.pool.remove(&w.addr);
                self.launcher.terminate(w.key.pid);
                state.stopping.push(Stopping {
                    pid: w.key.pid,
                    port: w.port,
                    kill_at: now + drain_timeout,
                });
            } else {
                i += 1;
            }
        }

        // Stragglers that ignored SIGTERM.
        state.stopping.retain(|s| {
            if launcher.has_exited(s.pid) {
                return false;
            }
            if now >= s.kill_at {
                warn!(pid = s.pid, "Worker ignored SIGTERM, killing");
                launcher.kill(s.pid);
                return false;
            }
            true
        });

        let target = self.target();
        let active = state.workers.iter().filter(|w| w.draining_since.is_none()).count();

        if active < target {
            for _ in active..target {
                let port = lowest_free_port(self.config.base_port, &state);
                let addr = format!("{}:{}", self.config.host, port);
                let pid = match self.launcher.launch(&addr).await {
                    Ok(pid) => pid,
                    Err(e) => {
                        error!(addr = %addr, error = %e, "Worker launch failed");
                        break;
                    }
                };
                let process = WorkerProcess::new(pid, addr.clone());
                let key = process.key();
                if let Err(e) = self.pool.insert(process) {
                    error!(addr = %addr, error = %e, "Cannot register worker");
                    self.launcher.kill(pid);
                    continue;
                }
                state.launches += 1;
                let seq = state.launches;
                state.workers.push(Tracked {
                    seq,
                    key,
                    addr,
                    port,
                    draining_since: None,
                });
            }
        } else if active > target {
            let mut surplus: Vec<usize> = state
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.draining_since.is_none())
                .map(|(i, _)| i)
                .collect();
            // newest first
            surplus.sort_by_key(|&i| std::cmp::Reverse(state.workers[i].seq));
            for i in surplus.into_iter().take(active - target) {
                let w = &mut state.workers[i];
                self.pool.begin_drain(&w.addr);
                w.draining_since = Some(now);
            }
        }
    }
}

/// Lowest port at or above `base` not held by a live or stopping worker.
fn lowest_free_port(base: u16, state: &State) -> u16 {
    let mut port = base;
    while state.workers.iter().any(|w| w.port == port) || state.stopping.iter().any(|s| s.port == port) {
        port = port.saturating_add(1);
    }
    port
}
