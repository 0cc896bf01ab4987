use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use warren_core::config::HealthCheckConfig;
use warren_core::{Health, WorkerKey, WorkerPool, WorkerProcess};
use warren_observability::MetricsCollector;

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    successes: u32,
    failures: u32,
}

/// Consecutive probe outcomes per worker, and the health transitions they
/// imply. Holds no I/O so the thresholds are testable on their own.
#[derive(Debug)]
pub struct HealthTracker {
    counts: HashMap<WorkerKey, Counts>,
    unhealthy_failures: u32,
    healthy_successes: u32,
}

impl HealthTracker {
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self {
            counts: HashMap::new(),
            unhealthy_failures: config.unhealthy_failures.max(1),
            healthy_successes: config.healthy_successes.max(1),
        }
    }

    /// Record one probe. Returns the state the worker should move to, if
    /// any. Draining workers never transition.
    pub fn record(&mut self, process: &WorkerProcess, ok: bool) -> Option<Health> {
        let c = self.counts.entry(process.key()).or_default();
        if ok {
            c.successes = c.successes.saturating_add(1);
            c.failures = 0;
        } else {
            c.failures = c.failures.saturating_add(1);
            c.successes = 0;
        }
        match process.health {
            Health::Unhealthy if c.successes >= self.healthy_successes => Some(Health::Healthy),
            Health::Healthy if c.failures >= self.unhealthy_failures => Some(Health::Unhealthy),
            _ => None,
        }
    }

    /// Forget workers that are no longer in the pool.
    pub fn retain(&mut self, live: impl Fn(&WorkerKey) -> bool) {
        self.counts.retain(|k, _| live(k));
    }

    pub fn tracked(&self) -> usize {
        self.counts.len()
    }
}

/// Periodically probes every non-draining pool member's liveness endpoint
/// and applies the resulting health transitions to the pool.
///
/// Runs on the control-plane tokio runtime, never on a proxy thread.
pub struct HealthChecker {
    pool: Arc<WorkerPool>,
    config: HealthCheckConfig,
    client: reqwest::Client,
    metrics: Arc<MetricsCollector>,
    tracker: Mutex<HealthTracker>,
}

impl HealthChecker {
    pub fn new(
        pool: Arc<WorkerPool>,
        config: HealthCheckConfig,
        metrics: Arc<MetricsCollector>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .no_proxy()
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self {
            tracker: Mutex::new(HealthTracker::new(&config)),
            pool,
            config,
            client,
            metrics,
        })
    }

    /// Probe every non-draining member once, concurrently. Returns the
    /// transitions that were applied.
    pub async fn probe_once(&self) -> Vec<(WorkerKey, Health)> {
        let snapshot = self.pool.snapshot();
        let mut probes = JoinSet::new();
        for member in snapshot.members() {
            if member.process.health == Health::Draining {
                continue;
            }
            let client = self.client.clone();
            let url = format!("http://{}{}", member.process.addr, self.config.path);
            let addr = member.process.addr.clone();
            let key = member.process.key();
            probes.spawn(async move {
                let ok = match client.get(&url).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        debug!(addr = %addr, error = %e, "Health probe failed");
                        false
                    }
                };
                (addr, key, ok)
            });
        }

        let mut results = Vec::with_capacity(probes.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => warn!(error = %e, "Health probe task failed"),
            }
        }

        let mut applied = Vec::new();
        {
            let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
            for (addr, key, ok) in results {
                // Re-read: the member may have been drained or replaced
                // while the probe was in flight.
                let current = self.pool.snapshot();
                let Some(member) = current.get(&addr).filter(|m| m.process.key() == key) else {
                    continue;
                };
                let Some(next) = tracker.record(&member.process, ok) else {
                    continue;
                };
                if self.pool.set_health(&addr, next).is_some() {
                    match next {
                        Health::Healthy => info!(worker = %key, addr = %addr, "Worker healthy"),
                        _ => warn!(worker = %key, addr = %addr, "Worker marked unhealthy"),
                    }
                    applied.push((key, next));
                }
            }
            let live = self.pool.snapshot();
            tracker.retain(|k| live.members().iter().any(|m| m.process.key() == *k));
        }

        let snapshot = self.pool.snapshot();
        self.metrics
            .set_pool(snapshot.healthy_count(), snapshot.len());
        applied
    }

    /// Probe on a fixed interval until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let mut tick = interval(self.config.interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(
            interval_ms = self.config.interval_ms,
            path = %self.config.path,
            "Health checker started"
        );
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.probe_once().await;
                }
                _ = &mut shutdown => break,
            }
        }
        debug!("Health checker stopped");
    }
}
