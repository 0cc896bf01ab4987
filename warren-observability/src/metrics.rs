use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Metrics collector. Every field is `None` when disabled, so recording on
/// the proxy hot path costs a single branch.
pub struct MetricsCollector {
    enabled: bool,
    registry: Option<Registry>,
    /// Requests answered, by worker pid and status class.
    pub requests_total: Option<IntCounterVec>,
    pub upstream_duration: Option<Histogram>,
    pub retries_total: Option<IntCounter>,
    /// Requests that never reached a worker response: `exhausted`,
    /// `timeout`, `bad_gateway`.
    pub failures_total: Option<IntCounterVec>,
    pub healthy_workers: Option<IntGauge>,
    pub pool_members: Option<IntGauge>,
    pub log_records_dropped: Option<IntCounter>,
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> anyhow::Result<Self> {
        if !enabled {
            return Ok(Self {
                enabled: false,
                registry: None,
                requests_total: None,
                upstream_duration: None,
                retries_total: None,
                failures_total: None,
                healthy_workers: None,
                pool_members: None,
                log_records_dropped: None,
            });
        }

        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Requests answered through the proxy").namespace("warren"),
            &["worker", "status"],
        )?;
        let upstream_duration = Histogram::with_opts(
            HistogramOpts::new("upstream_duration_seconds", "Time from dispatch to worker response")
                .namespace("warren")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
        )?;
        let retries_total = IntCounter::with_opts(
            Opts::new("retries_total", "Dispatch attempts retried on another worker")
                .namespace("warren"),
        )?;
        let failures_total = IntCounterVec::new(
            Opts::new("failures_total", "Requests failed by the proxy").namespace("warren"),
            &["kind"],
        )?;
        let healthy_workers = IntGauge::with_opts(
            Opts::new("healthy_workers", "Pool members eligible for selection").namespace("warren"),
        )?;
        let pool_members = IntGauge::with_opts(
            Opts::new("pool_members", "Pool members in any state").namespace("warren"),
        )?;
        let log_records_dropped = IntCounter::with_opts(
            Opts::new("log_records_dropped_total", "Access log records lost to backpressure")
                .namespace("warren"),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(upstream_duration.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(failures_total.clone()))?;
        registry.register(Box::new(healthy_workers.clone()))?;
        registry.register(Box::new(pool_members.clone()))?;
        registry.register(Box::new(log_records_dropped.clone()))?;

        Ok(Self {
            enabled: true,
            registry: Some(registry),
            requests_total: Some(requests_total),
            upstream_duration: Some(upstream_duration),
            retries_total: Some(retries_total),
            failures_total: Some(failures_total),
            healthy_workers: Some(healthy_workers),
            pool_members: Some(pool_members),
            log_records_dropped: Some(log_records_dropped),
        })
    }

    /// Record a relayed worker response.
    #[inline]
    pub fn record_request(&self, worker: u32, status: u16, duration_secs: f64) {
        if !self.enabled {
            return;
        }
        if let Some(ref counter) = self.requests_total {
            let mut buf = itoa::Buffer::new();
            counter
                .with_label_values(&[buf.format(worker), status_class(status)])
                .inc();
        }
        if let Some(ref hist) = self.upstream_duration {
            hist.observe(duration_secs);
        }
    }

    #[inline]
    pub fn record_retry(&self) {
        if let Some(ref c) = self.retries_total {
            c.inc();
        }
    }

    #[inline]
    pub fn record_failure(&self, kind: &str) {
        if let Some(ref c) = self.failures_total {
            c.with_label_values(&[kind]).inc();
        }
    }

    pub fn set_pool(&self, healthy: usize, members: usize) {
        if let Some(ref g) = self.healthy_workers {
            g.set(healthy as i64);
        }
        if let Some(ref g) = self.pool_members {
            g.set(members as i64);
        }
    }

    /// Bring the drop counter up to `total`, the sink's running count.
    pub fn sync_log_drops(&self, total: u64) {
        if let Some(ref c) = self.log_records_dropped {
            let seen = c.get();
            if total > seen {
                c.inc_by(total - seen);
            }
        }
    }

    /// Render prometheus text exposition format.
    pub fn render(&self) -> String {
        if let Some(ref registry) = self.registry {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();
            encoder.encode(&metric_families, &mut buffer).unwrap_or(());
            String::from_utf8(buffer).unwrap_or_default()
        } else {
            String::new()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Disabled collector ───────────────────────────────────────

    #[test]
    fn disabled_collector_has_no_fields() {
        let mc = MetricsCollector::new(false).unwrap();
        assert!(!mc.is_enabled());
        assert!(mc.requests_total.is_none());
        assert!(mc.upstream_duration.is_none());
        assert!(mc.log_records_dropped.is_none());
        assert_eq!(mc.render(), "");
    }

    #[test]
    fn disabled_collector_records_are_noops() {
        let mc = MetricsCollector::new(false).unwrap();
        mc.record_request(42, 200, 0.001);
        mc.record_retry();
        mc.record_failure("timeout");
        mc.set_pool(1, 2);
        mc.sync_log_drops(10);
    }

    // ── Enabled collector ────────────────────────────────────────

    #[test]
    fn requests_counted_by_worker_and_status_class() {
        let mc = MetricsCollector::new(true).unwrap();
        mc.record_request(42, 200, 0.01);
        mc.record_request(42, 204, 0.01);
        mc.record_request(43, 503, 0.01);

        let counter = mc.requests_total.as_ref().unwrap();
        assert_eq!(counter.with_label_values(&["42", "2xx"]).get(), 2);
        assert_eq!(counter.with_label_values(&["43", "5xx"]).get(), 1);
        assert_eq!(mc.upstream_duration.as_ref().unwrap().get_sample_count(), 3);
    }

    #[test]
    fn render_contains_all_families() {
        let mc = MetricsCollector::new(true).unwrap();
        mc.record_request(1, 200, 0.01);
        mc.record_retry();
        mc.record_failure("exhausted");
        mc.set_pool(2, 3);
        mc.sync_log_drops(1);
        let output = mc.render();
        for name in [
            "warren_requests_total",
            "warren_upstream_duration_seconds",
            "warren_retries_total",
            "warren_failures_total",
            "warren_healthy_workers 2",
            "warren_pool_members 3",
            "warren_log_records_dropped_total 1",
        ] {
            assert!(output.contains(name), "missing {name} in:\n{output}");
        }
    }

    #[test]
    fn log_drop_sync_is_monotonic() {
        let mc = MetricsCollector::new(true).unwrap();
        mc.sync_log_drops(5);
        mc.sync_log_drops(3);
        mc.sync_log_drops(8);
        assert_eq!(mc.log_records_dropped.as_ref().unwrap().get(), 8);
    }

    #[test]
    fn status_classes() {
        assert_eq!(status_class(101), "1xx");
        assert_eq!(status_class(302), "3xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(599), "5xx");
    }
}
