use crate::proxy::{
    ConnPool, ProxyWorker, RESP_100_CONTINUE, RESP_400, RESP_411, RESP_413, RESP_431,
    build_upstream_request, error_response,
};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use warren_core::{Lease, WarrenError, WorkerKey};

/// Largest accepted request or response head.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

// ── Upstream connect ──────────────────────────────────────────

/// Resolve `host:port`, IPv4 candidates first.
///
/// Blocking lookup; only reached for names, worker addresses are normally
/// IP literals.
fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    use std::net::ToSocketAddrs;
    let Ok(iter) = addr.to_socket_addrs() else {
        return Vec::new();
    };
    let mut all: Vec<SocketAddr> = iter.collect();
    all.sort_by_key(|a| a.is_ipv6());
    all
}

async fn connect_upstream(addr: &str, connect_timeout: Duration) -> Result<TcpStream, Failure> {
    let candidates = resolve_addrs(addr);
    if candidates.is_empty() {
        return Err(Failure::Transport(format!("cannot resolve {addr}")));
    }
    let mut last = String::new();
    for sa in candidates {
        match monoio::time::timeout(connect_timeout, TcpStream::connect(sa)).await {
            Ok(Ok(s)) => {
                let _ = s.set_nodelay(true);
                return Ok(s);
            }
            Ok(Err(e)) => last = e.to_string(),
            Err(_) => last = "connect timed out".to_string(),
        }
        debug!(addr = %addr, resolved = %sa, error = %last, "Upstream candidate failed");
    }
    Err(Failure::Transport(last))
}

// ── Request head ──────────────────────────────────────────────

/// Parsed client request head, owned so the read buffer can keep growing
/// while the body arrives.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub head_len: usize,
    pub content_length: usize,
    pub keep_alive: bool,
    pub expect_continue: bool,
}

#[derive(Debug)]
pub enum HeadParse {
    Partial,
    Complete(RequestHead),
    /// Answer with this static response and close.
    Reject(&'static [u8]),
}

pub fn parse_request_head(buf: &[u8]) -> HeadParse {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return if buf.len() > MAX_HEAD_BYTES {
                HeadParse::Reject(RESP_431)
            } else {
                HeadParse::Partial
            };
        }
        Err(httparse::Error::TooManyHeaders) => return HeadParse::Reject(RESP_431),
        Err(e) => {
            debug!(error = %e, "HTTP parse error");
            return HeadParse::Reject(RESP_400);
        }
    };
    if head_len > MAX_HEAD_BYTES {
        return HeadParse::Reject(RESP_431);
    }

    let (Some(method), Some(path)) = (req.method, req.path) else {
        return HeadParse::Reject(RESP_400);
    };
    let http10 = req.version == Some(0);
    let mut keep_alive = !http10;
    let mut content_length: Option<usize> = None;
    let mut expect_continue = false;
    let mut headers = Vec::with_capacity(req.headers.len());

    for h in req.headers.iter() {
        let Ok(value) = std::str::from_utf8(h.value) else {
            return HeadParse::Reject(RESP_400);
        };
        let name = h.name;
        if name.eq_ignore_ascii_case("content-length") {
            let Ok(n) = value.trim().parse::<usize>() else {
                return HeadParse::Reject(RESP_400);
            };
            if content_length.is_some_and(|prev| prev != n) {
                return HeadParse::Reject(RESP_400);
            }
            content_length = Some(n);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            return HeadParse::Reject(RESP_411);
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    keep_alive = false;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
        } else if name.eq_ignore_ascii_case("expect") {
            expect_continue = value.trim().eq_ignore_ascii_case("100-continue");
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let content_length = content_length.unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return HeadParse::Reject(RESP_413);
    }

    HeadParse::Complete(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        headers,
        head_len,
        content_length,
        keep_alive,
        expect_continue,
    })
}

// ── Response head ─────────────────────────────────────────────

/// How the end of a worker response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
    /// Delimited by the worker closing the connection.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub head_len: usize,
    pub framing: Framing,
    pub keep_alive: bool,
}

/// Parse a worker response head. `Ok(None)` means more bytes are needed.
pub fn parse_response_head(buf: &[u8], head_request: bool) -> Result<Option<ResponseHead>, String> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut raw);
    let head_len = match resp.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_BYTES => {
            return Err("response head too large".into());
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };

    let status = resp.code.unwrap_or(0);
    let mut keep_alive = resp.version == Some(1);
    let mut length: Option<u64> = None;
    let mut chunked = false;
    for h in resp.headers.iter() {
        let value = std::str::from_utf8(h.value).unwrap_or("").trim();
        if h.name.eq_ignore_ascii_case("content-length") {
            length = Some(value.parse().map_err(|_| format!("bad content-length {value:?}"))?);
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("chunked"));
        } else if h.name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    keep_alive = false;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
        }
    }

    let framing = if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
        Framing::Empty
    } else if chunked {
        Framing::Chunked
    } else if let Some(n) = length {
        Framing::Length(n)
    } else {
        keep_alive = false;
        Framing::Eof
    };

    Ok(Some(ResponseHead {
        status,
        head_len,
        framing,
        keep_alive,
    }))
}

// ── Chunked relay ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Ext,
    SizeLf,
    Data(u64),
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
    Done,
}

/// Finds the end of a chunked body without decoding it, so the bytes can be
/// relayed unmodified.
#[derive(Debug)]
pub struct ChunkedScanner {
    state: ChunkState,
    size: u64,
    digits: u8,
}

impl Default for ChunkedScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedScanner {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            size: 0,
            digits: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume bytes belonging to the body. Returns how many were consumed;
    /// less than `data.len()` only once the body is complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, String> {
        let mut i = 0;
        while i < data.len() {
            let b = data[i];
            self.state = match self.state {
                ChunkState::Done => return Ok(i),
                ChunkState::Data(left) => {
                    let take = left.min((data.len() - i) as u64);
                    i += take as usize;
                    self.state = if take == left {
                        ChunkState::DataCr
                    } else {
                        ChunkState::Data(left - take)
                    };
                    continue;
                }
                ChunkState::Size => match b {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let d = (b as char).to_digit(16).unwrap_or(0) as u64;
                        self.digits += 1;
                        if self.digits > 15 {
                            return Err("chunk size too large".into());
                        }
                        self.size = self.size * 16 + d;
                        ChunkState::Size
                    }
                    b';' | b' ' | b'\t' if self.digits > 0 => ChunkState::Ext,
                    b'\r' if self.digits > 0 => ChunkState::SizeLf,
                    _ => return Err("invalid chunk size".into()),
                },
                ChunkState::Ext => match b {
                    b'\r' => ChunkState::SizeLf,
                    _ => ChunkState::Ext,
                },
                ChunkState::SizeLf => {
                    if b != b'\n' {
                        return Err("expected LF after chunk size".into());
                    }
                    let size = std::mem::take(&mut self.size);
                    self.digits = 0;
                    if size == 0 {
                        ChunkState::TrailerStart
                    } else {
                        ChunkState::Data(size)
                    }
                }
                ChunkState::DataCr => {
                    if b != b'\r' {
                        return Err("expected CR after chunk data".into());
                    }
                    ChunkState::DataLf
                }
                ChunkState::DataLf => {
                    if b != b'\n' {
                        return Err("expected LF after chunk data".into());
                    }
                    ChunkState::Size
                }
                ChunkState::TrailerStart => match b {
                    b'\r' => ChunkState::TrailerLf,
                    _ => ChunkState::TrailerLine,
                },
                ChunkState::TrailerLine => match b {
                    b'\n' => ChunkState::TrailerStart,
                    _ => ChunkState::TrailerLine,
                },
                ChunkState::TrailerLf => {
                    if b != b'\n' {
                        return Err("expected LF after trailers".into());
                    }
                    ChunkState::Done
                }
            };
            i += 1;
        }
        Ok(i)
    }
}

// ── Dispatch ──────────────────────────────────────────────────

/// Why one exchange with a worker failed.
#[derive(Debug)]
enum Failure {
    /// Nothing was received; another worker may be tried.
    Transport(String),
    /// The worker answered with something that is not HTTP.
    Malformed(String),
}

/// A worker connection with a parsed response head in `buf`.
struct Exchange {
    upstream: TcpStream,
    head: ResponseHead,
}

/// One round trip up to and including the response head. A pooled
/// connection that fails before any response byte is retried once on a
/// fresh connection to the same worker.
async fn exchange(
    proxy: &ProxyWorker,
    conns: &RefCell<ConnPool>,
    key: WorkerKey,
    addr: &str,
    request: &mut Vec<u8>,
    buf: &mut Vec<u8>,
    head_request: bool,
) -> Result<Exchange, Failure> {
    let pooled = conns.borrow_mut().take(key);
    if let Some(stream) = pooled {
        match round_trip(stream, request, buf, head_request).await {
            Err(Failure::Transport(e)) => {
                debug!(worker = %key, error = %e, "Pooled connection stale, reconnecting");
            }
            other => return other,
        }
    }
    let stream = connect_upstream(addr, proxy.connect_timeout()).await?;
    round_trip(stream, request, buf, head_request).await
}

async fn round_trip(
    mut upstream: TcpStream,
    request: &mut Vec<u8>,
    buf: &mut Vec<u8>,
    head_request: bool,
) -> Result<Exchange, Failure> {
    let (res, data) = upstream.write_all(std::mem::take(request)).await;
    *request = data;
    res.map_err(|e| Failure::Transport(e.to_string()))?;

    buf.clear();
    let mut chunk = Vec::with_capacity(READ_CHUNK);
    loop {
        let (res, data) = upstream.read(chunk).await;
        chunk = data;
        let n = match res {
            Ok(0) if buf.is_empty() => return Err(Failure::Transport("closed before response".into())),
            Ok(0) => return Err(Failure::Malformed("truncated response head".into())),
            Ok(n) => n,
            Err(e) if buf.is_empty() => return Err(Failure::Transport(e.to_string())),
            Err(e) => return Err(Failure::Malformed(e.to_string())),
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match parse_response_head(buf, head_request) {
                // interim response to a request already sent in full
                Ok(Some(head)) if head.status == 100 => {
                    buf.drain(..head.head_len);
                }
                Ok(Some(head)) => return Ok(Exchange { upstream, head }),
                Ok(None) => break,
                Err(e) => return Err(Failure::Malformed(e)),
            }
        }
    }
}

/// What happens to the client connection after a relay.
enum After {
    KeepOpen,
    Close,
}

/// Stream the response to the client unmodified. Returns whether the
/// worker connection may be reused.
async fn relay(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    head: ResponseHead,
    buf: &mut Vec<u8>,
) -> anyhow::Result<(bool, After)> {
    let mut scanner = ChunkedScanner::new();
    let mut remaining: u64 = match head.framing {
        Framing::Length(n) => n,
        _ => 0,
    };

    // What arrived with the head.
    let mut end = head.head_len;
    let mut reusable = head.keep_alive;
    let mut complete = match head.framing {
        Framing::Empty => true,
        Framing::Length(_) => {
            let take = remaining.min((buf.len() - end) as u64);
            end += take as usize;
            remaining -= take;
            remaining == 0
        }
        Framing::Chunked => {
            end += scanner.feed(&buf[end..]).map_err(anyhow::Error::msg)?;
            scanner.is_done()
        }
        Framing::Eof => {
            end = buf.len();
            false
        }
    };
    if end < buf.len() {
        // bytes past the response; the connection is out of sync
        reusable = false;
    }
    buf.truncate(end);
    let (res, data) = client.write_all(std::mem::take(buf)).await;
    *buf = data;
    res?;

    let mut chunk = Vec::with_capacity(READ_CHUNK);
    while !complete {
        let (res, data) = upstream.read(chunk).await;
        chunk = data;
        let n = match res {
            Ok(0) if head.framing == Framing::Eof => return Ok((false, After::Close)),
            Ok(0) => {
                warn!(status = head.status, "Worker closed connection mid-body");
                return Ok((false, After::Close));
            }
            Ok(n) => n,
            Err(e) => {
                warn!(status = head.status, error = %e, "Worker read failed mid-body");
                return Ok((false, After::Close));
            }
        };
        let used = match head.framing {
            Framing::Length(_) => {
                let take = remaining.min(n as u64) as usize;
                remaining -= take as u64;
                complete = remaining == 0;
                take
            }
            Framing::Chunked => {
                let used = scanner.feed(&chunk[..n]).map_err(anyhow::Error::msg)?;
                complete = scanner.is_done();
                used
            }
            _ => n,
        };
        if used < n {
            reusable = false;
        }
        chunk.truncate(used);
        let (res, data) = client.write_all(chunk).await;
        chunk = data;
        res?;
    }

    let after = if head.framing == Framing::Eof {
        After::Close
    } else {
        After::KeepOpen
    };
    Ok((reusable, after))
}

/// Handle one client connection (HTTP/1.1 keepalive and pipelining).
///
/// The `ProxyWorker` and `ConnPool` are shared with every other connection
/// on this thread. `RefCell` borrows never span an `.await`.
pub async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    proxy: Rc<ProxyWorker>,
    conns: Rc<RefCell<ConnPool>>,
) -> anyhow::Result<()> {
    let client_ip = peer_addr.ip().to_string();

    // ── Buffers reused across keepalive requests ──
    let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut upstream_req = Vec::with_capacity(2048);
    let mut resp_buf = Vec::with_capacity(READ_CHUNK);
    let mut tried: Vec<WorkerKey> = Vec::with_capacity(proxy.max_attempts() as usize);

    loop {
        // ── Request head ──
        let head = loop {
            if !pending.is_empty() {
                match parse_request_head(&pending) {
                    HeadParse::Complete(head) => break head,
                    HeadParse::Reject(resp) => {
                        let (res, _) = client.write_all(resp.to_vec()).await;
                        res?;
                        return Ok(());
                    }
                    HeadParse::Partial => {}
                }
            }
            let (res, data) = client.read(chunk).await;
            chunk = data;
            match res? {
                0 => return Ok(()),
                n => pending.extend_from_slice(&chunk[..n]),
            }
        };

        // ── Request body ──
        let total = head.head_len + head.content_length;
        if head.expect_continue && pending.len() < total {
            let (res, _) = client.write_all(RESP_100_CONTINUE.to_vec()).await;
            res?;
        }
        while pending.len() < total {
            let (res, data) = client.read(chunk).await;
            chunk = data;
            match res? {
                0 => return Ok(()),
                n => pending.extend_from_slice(&chunk[..n]),
            }
        }

        let headers: Vec<(&str, &str)> = head
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        build_upstream_request(
            &mut upstream_req,
            &head.method,
            &head.path,
            &headers,
            &pending[head.head_len..total],
            &client_ip,
        );
        pending.drain(..total);

        let head_request = head.method.eq_ignore_ascii_case("HEAD");
        let started = Instant::now();
        let deadline = started + proxy.request_timeout();

        // ── Dispatch with bounded retry ──
        tried.clear();
        let mut last_err = WarrenError::PoolExhausted;
        let outcome: Result<(Lease, Exchange), WarrenError> = loop {
            if tried.len() >= proxy.max_attempts() as usize {
                break Err(last_err);
            }
            let lease = match proxy.select(&tried) {
                Ok(lease) => lease,
                Err(e) if tried.is_empty() => break Err(e),
                Err(_) => break Err(last_err),
            };
            tried.push(lease.key());
            if tried.len() > 1 {
                proxy.metrics().record_retry();
            }

            let left = deadline.saturating_duration_since(Instant::now());
            let attempt = exchange(
                &proxy,
                &conns,
                lease.key(),
                lease.addr(),
                &mut upstream_req,
                &mut resp_buf,
                head_request,
            );
            match monoio::time::timeout(left, attempt).await {
                Ok(Ok(ex)) => break Ok((lease, ex)),
                Ok(Err(Failure::Transport(e))) => {
                    warn!(worker = %lease.key(), addr = %lease.addr(), error = %e, "Dispatch failed, trying next worker");
                    last_err = WarrenError::Transport(e);
                }
                Ok(Err(Failure::Malformed(e))) => {
                    warn!(worker = %lease.key(), addr = %lease.addr(), error = %e, "Malformed worker response");
                    break Err(WarrenError::BadGateway(e));
                }
                Err(_) => {
                    warn!(worker = %lease.key(), addr = %lease.addr(), "Worker timed out");
                    break Err(WarrenError::UpstreamTimeout);
                }
            }
        };

        let (lease, Exchange { mut upstream, head: resp_head }) = match outcome {
            Ok(ok) => ok,
            Err(e) => {
                let kind = match e.status_code() {
                    504 => "timeout",
                    502 => "bad_gateway",
                    _ => "exhausted",
                };
                proxy.metrics().record_failure(kind);
                debug!(error = %e, attempts = tried.len(), "Request failed");
                let (res, _) = client.write_all(error_response(&e).to_vec()).await;
                res?;
                if !head.keep_alive {
                    return Ok(());
                }
                continue;
            }
        };

        // ── Relay, bounded by what is left of the deadline ──
        let left = deadline.saturating_duration_since(Instant::now());
        let relayed =
            monoio::time::timeout(left, relay(&mut client, &mut upstream, resp_head, &mut resp_buf)).await;
        proxy.metrics().record_request(
            lease.process().pid,
            resp_head.status,
            started.elapsed().as_secs_f64(),
        );
        let after = match relayed {
            Ok(Ok((reusable, after))) => {
                if reusable {
                    conns.borrow_mut().put(lease.key(), upstream);
                }
                after
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(worker = %lease.key(), "Deadline reached while relaying response");
                proxy.metrics().record_failure("timeout");
                After::Close
            }
        };
        drop(lease);

        if matches!(after, After::Close) || !head.keep_alive {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(buf: &[u8]) -> RequestHead {
        match parse_request_head(buf) {
            HeadParse::Complete(h) => h,
            other => panic!("expected complete head, got {other:?}"),
        }
    }

    fn rejected(buf: &[u8]) -> &'static [u8] {
        match parse_request_head(buf) {
            HeadParse::Reject(r) => r,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    // ── Request heads ────────────────────────────────────────────

    #[test]
    fn request_head_with_body_length() {
        let h = complete(b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(h.method, "POST");
        assert_eq!(h.path, "/x");
        assert_eq!(h.content_length, 5);
        assert!(h.keep_alive);
        assert_eq!(h.head_len, 48);
    }

    #[test]
    fn request_head_connection_semantics() {
        assert!(!complete(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").keep_alive);
        assert!(!complete(b"GET / HTTP/1.0\r\n\r\n").keep_alive);
        assert!(complete(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").keep_alive);
    }

    #[test]
    fn request_head_partial() {
        assert!(matches!(parse_request_head(b"GET / HTTP/1.1\r\nHost:"), HeadParse::Partial));
    }

    #[test]
    fn request_head_rejections() {
        assert_eq!(rejected(b"\x00\x01garbage\r\n\r\n"), RESP_400);
        assert_eq!(rejected(b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n"), RESP_400);
        assert_eq!(
            rejected(b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n"),
            RESP_400
        );
        assert_eq!(rejected(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"), RESP_411);
        assert_eq!(rejected(b"POST / HTTP/1.1\r\nContent-Length: 99999999999\r\n\r\n"), RESP_413);
    }

    #[test]
    fn oversized_head_is_431() {
        let mut buf = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        buf.extend(std::iter::repeat_n(b'a', MAX_HEAD_BYTES + 1));
        assert_eq!(rejected(&buf), RESP_431);
    }

    #[test]
    fn too_many_headers_is_431() {
        let mut buf = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..(MAX_HEADERS + 1) {
            buf.extend_from_slice(format!("X-H{i}: v\r\n").as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        assert_eq!(rejected(&buf), RESP_431);
    }

    #[test]
    fn expect_continue_detected() {
        let h = complete(b"PUT / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n");
        assert!(h.expect_continue);
    }

    // ── Response heads ───────────────────────────────────────────

    fn resp(buf: &[u8], head: bool) -> ResponseHead {
        parse_response_head(buf, head).unwrap().unwrap()
    }

    #[test]
    fn response_framing() {
        let r = resp(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\n", false);
        assert_eq!(r.framing, Framing::Length(12));
        assert!(r.keep_alive);

        let r = resp(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n", false);
        assert_eq!(r.framing, Framing::Chunked);

        let r = resp(b"HTTP/1.1 200 OK\r\n\r\n", false);
        assert_eq!(r.framing, Framing::Eof);
        assert!(!r.keep_alive);

        let r = resp(b"HTTP/1.1 204 No Content\r\n\r\n", false);
        assert_eq!(r.framing, Framing::Empty);

        let r = resp(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\n", true);
        assert_eq!(r.framing, Framing::Empty);
    }

    #[test]
    fn response_keepalive_rules() {
        assert!(!resp(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n", false).keep_alive);
        assert!(!resp(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n", false).keep_alive);
    }

    #[test]
    fn response_partial_and_garbage() {
        assert_eq!(parse_response_head(b"HTTP/1.1 200 OK\r\nCont", false), Ok(None));
        assert!(parse_response_head(b"this is not http\r\n\r\n", false).is_err());
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: x\r\n\r\n", false).is_err());
    }

    // ── ChunkedScanner ───────────────────────────────────────────

    #[test]
    fn chunked_body_in_one_piece() {
        let body = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\nNEXT";
        let mut s = ChunkedScanner::new();
        let used = s.feed(body).unwrap();
        assert!(s.is_done());
        assert_eq!(&body[used..], b"NEXT");
    }

    #[test]
    fn chunked_body_byte_by_byte() {
        let body = b"A\r\n0123456789\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut s = ChunkedScanner::new();
        for (i, b) in body.iter().enumerate() {
            assert!(!s.is_done(), "done early at {i}");
            assert_eq!(s.feed(std::slice::from_ref(b)).unwrap(), 1);
        }
        assert!(s.is_done());
    }

    #[test]
    fn chunked_body_split_inside_data() {
        let mut s = ChunkedScanner::new();
        assert_eq!(s.feed(b"8\r\nabc").unwrap(), 6);
        assert_eq!(s.feed(b"defgh\r\n").unwrap(), 7);
        assert!(!s.is_done());
        assert_eq!(s.feed(b"0\r\n\r\n").unwrap(), 5);
        assert!(s.is_done());
    }

    #[test]
    fn chunked_rejects_garbage() {
        assert!(ChunkedScanner::new().feed(b"zz\r\n").is_err());
        assert!(ChunkedScanner::new().feed(b"\r\n").is_err());
        assert!(ChunkedScanner::new().feed(b"2\r\nabX").is_err());
    }

    #[test]
    fn resolve_prefers_literal() {
        let addrs = resolve_addrs("127.0.0.1:8001");
        assert_eq!(addrs, vec!["127.0.0.1:8001".parse::<SocketAddr>().unwrap()]);
        assert!(resolve_addrs("not an address").is_empty());
    }
}
