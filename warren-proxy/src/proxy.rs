use monoio::net::TcpStream;
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use warren_core::config::ProxyConfig;
use warren_core::{Lease, WarrenError, WorkerKey, WorkerPool};
use warren_observability::MetricsCollector;

// ── Pre-built static error responses (zero heap alloc) ────────

pub const RESP_400: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-type: application/json\r\ncontent-length: 36\r\nconnection: close\r\n\r\n{\"error\":\"bad request\",\"status\":400}";

pub const RESP_411: &[u8] =
    b"HTTP/1.1 411 Length Required\r\ncontent-type: application/json\r\ncontent-length: 40\r\nconnection: close\r\n\r\n{\"error\":\"length required\",\"status\":411}";

pub const RESP_413: &[u8] =
    b"HTTP/1.1 413 Payload Too Large\r\ncontent-type: application/json\r\ncontent-length: 42\r\nconnection: close\r\n\r\n{\"error\":\"payload too large\",\"status\":413}";

pub const RESP_431: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\ncontent-type: application/json\r\ncontent-length: 56\r\nconnection: close\r\n\r\n{\"error\":\"request header fields too large\",\"status\":431}";

pub const RESP_502: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\ncontent-type: application/json\r\ncontent-length: 36\r\nconnection: keep-alive\r\n\r\n{\"error\":\"bad gateway\",\"status\":502}";

pub const RESP_503: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\ncontent-type: application/json\r\ncontent-length: 44\r\nconnection: keep-alive\r\n\r\n{\"error\":\"service unavailable\",\"status\":503}";

pub const RESP_504: &[u8] =
    b"HTTP/1.1 504 Gateway Timeout\r\ncontent-type: application/json\r\ncontent-length: 40\r\nconnection: keep-alive\r\n\r\n{\"error\":\"gateway timeout\",\"status\":504}";

pub const RESP_100_CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Static response for a routing failure.
pub fn error_response(err: &WarrenError) -> &'static [u8] {
    match err.status_code() {
        502 => RESP_502,
        504 => RESP_504,
        _ => RESP_503,
    }
}

// ── ProxyWorker ───────────────────────────────────────────────

/// Per-thread dispatch state. Created ONCE per proxy thread and shared by
/// all of its connections via `Rc`.
///
/// Worker selection reads the shared pool snapshot; nothing here takes a
/// lock on the hot path.
pub struct ProxyWorker {
    pool: Arc<WorkerPool>,
    metrics: Arc<MetricsCollector>,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_attempts: u32,
    /// Pool version the connection pool was last pruned against.
    seen_version: Cell<u64>,
}

impl ProxyWorker {
    pub fn new(pool: Arc<WorkerPool>, config: &ProxyConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            pool,
            metrics,
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            max_attempts: config.max_attempts.max(1),
            seen_version: Cell::new(0),
        }
    }

    #[inline]
    pub fn select(&self, exclude: &[WorkerKey]) -> Result<Lease, WarrenError> {
        self.pool.select(exclude)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drop idle connections to workers that have left the pool. Cheap when
    /// membership has not changed since the last call.
    pub fn prune_connections<S>(&self, conns: &mut ConnPool<S>) {
        let snapshot = self.pool.snapshot();
        if snapshot.version() == self.seen_version.get() {
            return;
        }
        self.seen_version.set(snapshot.version());
        conns.retain(|key| snapshot.members().iter().any(|m| m.process.key() == key));
    }
}

// ── Connection pool ───────────────────────────────────────────

/// Thread-local idle connection pool, keyed by worker identity so a new
/// worker that inherits an address never receives a predecessor's socket.
pub struct ConnPool<S = TcpStream> {
    pools: HashMap<WorkerKey, VecDeque<S>>,
    max_idle: usize,
}

impl<S> ConnPool<S> {
    pub fn new(max_idle_per_worker: usize) -> Self {
        Self {
            pools: HashMap::with_capacity(16),
            max_idle: max_idle_per_worker,
        }
    }

    #[inline]
    pub fn take(&mut self, key: WorkerKey) -> Option<S> {
        self.pools.get_mut(&key).and_then(|q| q.pop_front())
    }

    #[inline]
    pub fn put(&mut self, key: WorkerKey, stream: S) {
        if self.max_idle == 0 {
            return;
        }
        let queue = self
            .pools
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(4));
        if queue.len() < self.max_idle {
            queue.push_back(stream);
        }
        // else: drop stream (closes fd)
    }

    pub fn retain(&mut self, mut live: impl FnMut(WorkerKey) -> bool) {
        self.pools.retain(|key, _| live(*key));
    }

    pub fn idle(&self, key: WorkerKey) -> usize {
        self.pools.get(&key).map_or(0, VecDeque::len)
    }
}

// ── Request / response building helpers ───────────────────────

/// Headers owned by a single hop, never forwarded.
fn is_hop_by_hop(name: &str) -> bool {
    const HOP: [&str; 8] = [
        "connection",
        "keep-alive",
        "proxy-connection",
        "transfer-encoding",
        "te",
        "trailer",
        "upgrade",
        "expect",
    ];
    HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Build the request sent to a worker. The original request line, headers
/// and body pass through; hop-by-hop headers are dropped and the
/// `X-Forwarded-For`, `X-Real-IP` and `X-Forwarded-Proto` headers are set
/// from the client connection.
pub fn build_upstream_request(
    buf: &mut Vec<u8>,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
    client_ip: &str,
) {
    buf.clear();
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    let mut had_length = false;
    let mut prior_forwarded: Option<String> = None;
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("x-real-ip")
            || name.eq_ignore_ascii_case("x-forwarded-proto")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            had_length = true;
            continue;
        }
        if name.eq_ignore_ascii_case("x-forwarded-for") {
            let value = value.trim();
            if !value.is_empty() {
                match prior_forwarded {
                    Some(ref mut p) => {
                        p.push_str(", ");
                        p.push_str(value);
                    }
                    None => prior_forwarded = Some(value.to_string()),
                }
            }
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"x-forwarded-for: ");
    if let Some(prior) = prior_forwarded {
        buf.extend_from_slice(prior.as_bytes());
        buf.extend_from_slice(b", ");
    }
    buf.extend_from_slice(client_ip.as_bytes());
    buf.extend_from_slice(b"\r\nx-real-ip: ");
    buf.extend_from_slice(client_ip.as_bytes());
    buf.extend_from_slice(b"\r\nx-forwarded-proto: http\r\n");

    buf.extend_from_slice(b"connection: keep-alive\r\n");
    if had_length || !body.is_empty() {
        buf.extend_from_slice(b"content-length: ");
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
}
