use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::WarrenError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarrenConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub access_log: AccessLogConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Data plane proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Number of proxy threads. 0 = number of CPU cores.
    #[serde(default)]
    pub threads: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// End-to-end bound on one forwarded request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Dispatch attempts per request, across distinct workers.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Max idle keepalive connections per worker, per proxy thread.
    #[serde(default = "default_keepalive_pool")]
    pub keepalive_pool_size: usize,
}

/// Worker pool and supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Target number of live workers at startup.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Worker executable launched per member.
    #[serde(default = "default_worker_bin")]
    pub worker_bin: PathBuf,
    /// Extra arguments passed to every worker.
    #[serde(default)]
    pub worker_args: Vec<String>,
    #[serde(default = "default_worker_host")]
    pub host: String,
    /// First port handed to workers; later workers take the next free slot.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Upper bound on waiting for a draining worker's in-flight requests.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,
    /// Requests after which a worker recycles itself. 0 = never.
    #[serde(default)]
    pub max_requests: u64,
}

/// Active health probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_hc_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_hc_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_hc_path")]
    pub path: String,
    #[serde(default = "default_unhealthy_failures")]
    pub unhealthy_failures: u32,
    #[serde(default = "default_healthy_successes")]
    pub healthy_successes: u32,
}

/// What a full access-log queue does with the next record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the oldest queued record to make room.
    DropOldest,
    /// Wait up to `block_timeout_ms`, then drop the new record.
    Block,
}

/// Per-worker access log sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_backpressure")]
    pub backpressure: BackpressurePolicy,
    #[serde(default = "default_block_timeout")]
    pub block_timeout_ms: u64,
    /// Take the client address from proxy-supplied headers.
    #[serde(default = "default_true")]
    pub trust_forwarded_headers: bool,
    /// Record liveness probes as requests.
    #[serde(default)]
    pub log_health_checks: bool,
}

/// Admin API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub addr: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Observability settings. Disabled by default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// When false, no prometheus counters are updated on the hot path.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

// ── Defaults ──────────────────────────────────────────────────

fn default_listen_addr() -> String { "0.0.0.0:9080".into() }
fn default_connect_timeout() -> u64 { 2000 }
fn default_request_timeout() -> u64 { 30_000 }
fn default_max_attempts() -> u32 { 3 }
fn default_keepalive_pool() -> usize { 64 }
fn default_pool_size() -> usize { 2 }
fn default_worker_bin() -> PathBuf { PathBuf::from("warren-worker") }
fn default_worker_host() -> String { "127.0.0.1".into() }
fn default_base_port() -> u16 { 8001 }
fn default_drain_timeout() -> u64 { 30_000 }
fn default_reconcile_interval() -> u64 { 1000 }
fn default_hc_interval() -> u64 { 2000 }
fn default_hc_timeout() -> u64 { 1000 }
fn default_hc_path() -> String { "/healthz".into() }
fn default_unhealthy_failures() -> u32 { 3 }
fn default_healthy_successes() -> u32 { 1 }
fn default_log_dir() -> PathBuf { PathBuf::from("logs") }
fn default_buffer_capacity() -> usize { 8192 }
fn default_backpressure() -> BackpressurePolicy { BackpressurePolicy::DropOldest }
fn default_block_timeout() -> u64 { 50 }
fn default_admin_addr() -> String { "127.0.0.1:9180".into() }
fn default_true() -> bool { true }
fn default_metrics_path() -> String { "/metrics".into() }

// ── Impls ─────────────────────────────────────────────────────

impl Default for WarrenConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            pool: PoolConfig::default(),
            health_check: HealthCheckConfig::default(),
            access_log: AccessLogConfig::default(),
            admin: AdminConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            threads: 0,
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            max_attempts: default_max_attempts(),
            keepalive_pool_size: default_keepalive_pool(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            worker_bin: default_worker_bin(),
            worker_args: Vec::new(),
            host: default_worker_host(),
            base_port: default_base_port(),
            drain_timeout_ms: default_drain_timeout(),
            reconcile_interval_ms: default_reconcile_interval(),
            max_requests: 0,
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_hc_interval(),
            timeout_ms: default_hc_timeout(),
            path: default_hc_path(),
            unhealthy_failures: default_unhealthy_failures(),
            healthy_successes: default_healthy_successes(),
        }
    }
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            buffer_capacity: default_buffer_capacity(),
            backpressure: default_backpressure(),
            block_timeout_ms: default_block_timeout(),
            trust_forwarded_headers: true,
            log_health_checks: false,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            addr: default_admin_addr(),
            enabled: true,
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_metrics_path(),
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl PoolConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AccessLogConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

impl WarrenConfig {
    /// Load configuration from YAML file + env overrides.
    ///
    /// Environment keys use `__` as the section separator, e.g.
    /// `WARREN_POOL__SIZE=4`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: WarrenConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("WARREN_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the proxy unable to fail closed.
    pub fn validate(&self) -> Result<(), WarrenError> {
        let invalid = |msg: &str| Err(WarrenError::ConfigError(msg.to_string()));
        if self.proxy.max_attempts == 0 {
            return invalid("proxy.max_attempts must be at least 1");
        }
        if self.proxy.request_timeout_ms == 0 {
            return invalid("proxy.request_timeout_ms must be non-zero");
        }
        if self.health_check.unhealthy_failures == 0 || self.health_check.healthy_successes == 0 {
            return invalid("health_check thresholds must be at least 1");
        }
        if self.access_log.buffer_capacity == 0 {
            return invalid("access_log.buffer_capacity must be at least 1");
        }
        Ok(())
    }

    /// Effective proxy thread count (0 → available CPUs).
    pub fn effective_threads(&self) -> usize {
        if self.proxy.threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.proxy.threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ── Default values ────────────────────────────────────────────

    #[test]
    fn default_proxy_config_has_expected_values() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9080");
        assert_eq!(cfg.threads, 0);
        assert_eq!(cfg.connect_timeout_ms, 2000);
        assert_eq!(cfg.request_timeout_ms, 30_000);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.keepalive_pool_size, 64);
    }

    #[test]
    fn default_health_check_uses_three_strikes() {
        let cfg = HealthCheckConfig::default();
        assert_eq!(cfg.unhealthy_failures, 3);
        assert_eq!(cfg.healthy_successes, 1);
        assert_eq!(cfg.path, "/healthz");
    }

    #[test]
    fn default_access_log_drops_oldest() {
        let cfg = AccessLogConfig::default();
        assert_eq!(cfg.backpressure, BackpressurePolicy::DropOldest);
        assert!(cfg.trust_forwarded_headers);
        assert!(!cfg.log_health_checks);
    }

    #[test]
    fn default_config_validates() {
        WarrenConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut cfg = WarrenConfig::default();
        cfg.proxy.max_attempts = 0;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, WarrenError::ConfigError(ref m) if m.contains("max_attempts")));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn zero_buffer_capacity_rejected() {
        let mut cfg = WarrenConfig::default();
        cfg.access_log.buffer_capacity = 0;
        assert!(matches!(cfg.validate(), Err(WarrenError::ConfigError(_))));
    }

    // ── effective_threads() ───────────────────────────────────────

    #[test]
    fn effective_threads_returns_explicit_value_when_nonzero() {
        let mut cfg = WarrenConfig::default();
        cfg.proxy.threads = 4;
        assert_eq!(cfg.effective_threads(), 4);
    }

    #[test]
    fn effective_threads_with_zero_returns_at_least_one() {
        let cfg = WarrenConfig::default();
        assert!(cfg.effective_threads() >= 1);
    }

    // ── Serde ─────────────────────────────────────────────────────

    #[test]
    fn backpressure_policy_snake_case() {
        let json = serde_json::to_string(&BackpressurePolicy::DropOldest).unwrap();
        assert_eq!(json, "\"drop_oldest\"");
        let p: BackpressurePolicy = serde_json::from_str("\"block\"").unwrap();
        assert_eq!(p, BackpressurePolicy::Block);
    }

    // ── WarrenConfig::load() ──────────────────────────────────────

    #[test]
    fn load_from_valid_yaml_overrides_defaults() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "proxy:\n  listen_addr: \"0.0.0.0:8888\"\n  threads: 2\npool:\n  size: 5\n").unwrap();
        let cfg = WarrenConfig::load(tmpfile.path()).unwrap();
        assert_eq!(cfg.proxy.listen_addr, "0.0.0.0:8888");
        assert_eq!(cfg.proxy.threads, 2);
        assert_eq!(cfg.pool.size, 5);
        // Defaults still apply for unspecified fields
        assert_eq!(cfg.proxy.max_attempts, 3);
        assert_eq!(cfg.health_check.interval_ms, 2000);
    }

    #[test]
    fn load_yaml_with_access_log_block_policy() {
        let yaml = r#"
access_log:
  dir: "/var/log/warren"
  backpressure: block
  block_timeout_ms: 10
health_check:
  path: "/ready"
  unhealthy_failures: 5
"#;
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "{yaml}").unwrap();
        let cfg = WarrenConfig::load(tmpfile.path()).unwrap();
        assert_eq!(cfg.access_log.dir, PathBuf::from("/var/log/warren"));
        assert_eq!(cfg.access_log.backpressure, BackpressurePolicy::Block);
        assert_eq!(cfg.access_log.block_timeout(), Duration::from_millis(10));
        assert_eq!(cfg.health_check.path, "/ready");
        assert_eq!(cfg.health_check.unhealthy_failures, 5);
    }

    #[test]
    fn load_rejects_invalid_thresholds() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "health_check:\n  healthy_successes: 0\n").unwrap();
        assert!(WarrenConfig::load(tmpfile.path()).is_err());
    }
}
