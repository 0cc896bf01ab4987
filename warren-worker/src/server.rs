use crate::app::{AppRequest, AppResponse, Application};
use bytes::Bytes;
use chrono::Utc;
use http::header::{CONTENT_TYPE, REFERER, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use warren_core::WarrenError;
use warren_observability::{AccessLogSink, MetricsCollector, RequestRecord};

/// Per-process serving options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Identity written into every access log record.
    pub pid: u32,
    pub health_path: String,
    /// Serve this process's own metrics at this path.
    pub metrics_path: Option<String>,
    /// Recycle after this many client requests. 0 = never.
    pub max_requests: u64,
    pub trust_forwarded_headers: bool,
    pub log_health_checks: bool,
    /// Upper bound on finishing in-flight requests at shutdown.
    pub drain_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            pid: std::process::id(),
            health_path: "/healthz".into(),
            metrics_path: None,
            max_requests: 0,
            trust_forwarded_headers: true,
            log_health_checks: false,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// One worker process: serves HTTP, answers probes and writes exactly one
/// access log record per completed request.
pub struct WorkerServer {
    options: WorkerOptions,
    app: Arc<dyn Application>,
    sink: Arc<AccessLogSink>,
    metrics: Arc<MetricsCollector>,
    served: AtomicU64,
    draining: AtomicBool,
    recycle: Notify,
}

enum Kind {
    Probe,
    Metrics,
    Client,
}

impl WorkerServer {
    pub fn new(
        options: WorkerOptions,
        app: Arc<dyn Application>,
        sink: Arc<AccessLogSink>,
        metrics: Arc<MetricsCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            app,
            sink,
            metrics,
            served: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            recycle: Notify::new(),
        })
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Client requests served so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Accept connections until `shutdown` resolves or the request budget is
    /// spent, then drain in-flight requests and flush the access log.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);

        info!(
            worker = self.options.pid,
            addr = %listener.local_addr()?,
            max_requests = self.options.max_requests,
            "Worker listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let server = Arc::clone(&self);
                    let svc = service_fn(move |req| {
                        let server = Arc::clone(&server);
                        async move { Ok::<_, Infallible>(server.handle(req, peer).await) }
                    });
                    let conn = http1::Builder::new()
                        .keep_alive(true)
                        .serve_connection(io, svc);
                    let conn = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!(worker = self.options.pid, "Shutdown requested");
                    break;
                }
                _ = self.recycle.notified() => {
                    info!(worker = self.options.pid, served = self.served(), "Request budget reached, recycling");
                    break;
                }
            }
        }

        self.draining.store(true, Ordering::Release);
        drop(listener);

        tokio::select! {
            _ = graceful.shutdown() => {
                debug!(worker = self.options.pid, "All connections drained");
            }
            _ = tokio::time::sleep(self.options.drain_timeout) => {
                warn!(worker = self.options.pid, "Drain timeout reached, abandoning open connections");
            }
        }

        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.flush()).await??;
        self.metrics.sync_log_drops(self.sink.dropped());

        info!(
            worker = self.options.pid,
            served = self.served(),
            dropped_records = self.sink.dropped(),
            "Worker stopped"
        );
        Ok(())
    }

    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        let started = Instant::now();
        let kind = self.classify(&req);

        if let Kind::Metrics = kind {
            self.metrics.sync_log_drops(self.sink.dropped());
            return plain(StatusCode::OK, "text/plain; version=0.0.4", self.metrics.render());
        }

        let method = req.method().as_str().to_string();
        let target = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let client = client_address(req.headers(), peer, self.options.trust_forwarded_headers);
        let referer = header_string(req.headers(), REFERER.as_str());
        let user_agent = header_string(req.headers(), USER_AGENT.as_str());

        let response = match kind {
            Kind::Probe => self.probe_response(),
            _ => self.dispatch(req).await,
        };

        let is_probe = matches!(kind, Kind::Probe);
        if !is_probe || self.options.log_health_checks {
            let size = response.body().size_hint().exact().unwrap_or(0);
            self.record(RequestRecord {
                worker_id: self.options.pid,
                client_address: client,
                timestamp: Utc::now(),
                method,
                path: target,
                status_code: response.status().as_u16(),
                response_size_bytes: size,
                referer,
                user_agent,
                duration_micros: started.elapsed().as_micros() as u64,
            })
            .await;
        }

        if !is_probe {
            let n = self.served.fetch_add(1, Ordering::Relaxed) + 1;
            if self.options.max_requests > 0 && n == self.options.max_requests {
                self.recycle.notify_one();
            }
        }

        response
    }

    fn classify(&self, req: &Request<Incoming>) -> Kind {
        if req.method() != Method::GET {
            return Kind::Client;
        }
        let path = req.uri().path();
        if path == self.options.health_path {
            Kind::Probe
        } else if self.options.metrics_path.as_deref() == Some(path) {
            Kind::Metrics
        } else {
            Kind::Client
        }
    }

    fn probe_response(&self) -> Response<Full<Bytes>> {
        if self.draining.load(Ordering::Acquire) {
            plain(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "draining")
        } else {
            plain(StatusCode::OK, "text/plain", "ok")
        }
    }

    async fn dispatch(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "Failed to read request body");
                return plain(StatusCode::BAD_REQUEST, "text/plain", "bad request");
            }
        };

        let request = AppRequest {
            method: parts.method,
            target: parts
                .uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            headers: parts.headers,
            body,
        };

        match self.app.handle(request).await {
            Ok(AppResponse { status, headers, body }) => {
                let mut resp = Response::new(Full::new(body));
                *resp.status_mut() = status;
                *resp.headers_mut() = headers;
                resp
            }
            Err(e) => {
                error!(worker = self.options.pid, error = %e, "Application error");
                let err = WarrenError::Internal(e.to_string());
                plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "application/json",
                    err.to_json_body(),
                )
            }
        }
    }

    /// Append the record and hold the response until it is flushed to the
    /// stream file, bounded by the sink's grace period.
    async fn record(&self, record: RequestRecord) {
        let durable = match self.sink.append_durable(record) {
            Ok(durable) => durable,
            Err(e) => {
                debug!(worker = self.options.pid, error = %e, "Access log record not queued");
                return;
            }
        };
        if let Err(e) = durable.wait().await {
            debug!(worker = self.options.pid, error = %e, "Access log record not confirmed on disk");
        }
    }
}

fn plain(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Address of the end client. Behind the proxy the peer is the proxy
/// itself, so the forwarded headers win when trusted.
pub fn client_address(headers: &HeaderMap, peer: SocketAddr, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && !v.contains(char::is_whitespace));
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty() && !v.contains(char::is_whitespace));
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.1.2.3:5555".parse().unwrap()
    }

    #[test]
    fn client_address_prefers_real_ip() {
        let mut h = HeaderMap::new();
        h.insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));
        h.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1, 10.0.0.1"));
        assert_eq!(client_address(&h, peer(), true), "203.0.113.7");
    }

    #[test]
    fn client_address_falls_back_to_first_forwarded_hop() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static(" 198.51.100.1 , 10.0.0.1"));
        assert_eq!(client_address(&h, peer(), true), "198.51.100.1");
    }

    #[test]
    fn client_address_ignores_headers_when_untrusted() {
        let mut h = HeaderMap::new();
        h.insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_address(&h, peer(), false), "10.1.2.3");
    }

    #[test]
    fn client_address_uses_peer_without_headers() {
        assert_eq!(client_address(&HeaderMap::new(), peer(), true), "10.1.2.3");
    }

    #[test]
    fn client_address_rejects_values_with_spaces() {
        let mut h = HeaderMap::new();
        h.insert("x-real-ip", HeaderValue::from_static("not an ip"));
        assert_eq!(client_address(&h, peer(), true), "10.1.2.3");
    }
}
