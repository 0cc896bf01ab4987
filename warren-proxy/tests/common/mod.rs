#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use warren_core::{Health, WarrenConfig, WorkerPool, WorkerProcess};
use warren_observability::MetricsCollector;
use warren_proxy::worker::{SharedState, spawn_workers};

/// How a fake worker answers.
#[derive(Clone, Copy, Debug)]
pub enum Mode {
    /// 200 with its name as the body, keep-alive.
    Named(&'static str),
    /// 200 echoing the full request it received.
    EchoRequest,
    /// Accepts and never answers.
    Hang,
    /// Answers with bytes that are not HTTP.
    Garbage,
    /// 200 with a chunked body.
    Chunked,
    /// 200 claiming keep-alive, then closes the socket.
    CloseAfterResponse(&'static str),
}

/// A plain-thread HTTP responder standing in for a worker process.
pub fn fake_worker(mode: Mode) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            thread::spawn(move || serve_fake(stream, mode));
        }
    });
    addr
}

/// An address nothing listens on.
pub fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn serve_fake(mut stream: TcpStream, mode: Mode) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let request = loop {
            if let Some(end) = find(&pending, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&pending[..end + 4]).to_string();
                let body_len = header_value(&head, "content-length")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                if pending.len() >= end + 4 + body_len {
                    let req: Vec<u8> = pending.drain(..end + 4 + body_len).collect();
                    break req;
                }
            }
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        };

        let response = match mode {
            Mode::Named(name) => ok_response(name.as_bytes(), "keep-alive"),
            Mode::EchoRequest => ok_response(&request, "keep-alive"),
            Mode::Hang => {
                thread::sleep(Duration::from_secs(30));
                return;
            }
            Mode::Garbage => b"NOT HTTP AT ALL\r\n\r\n".to_vec(),
            Mode::Chunked => b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n".to_vec(),
            Mode::CloseAfterResponse(name) => ok_response(name.as_bytes(), "keep-alive"),
        };
        if stream.write_all(&response).is_err() {
            return;
        }
        match mode {
            Mode::Garbage | Mode::CloseAfterResponse(_) => {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            _ => {}
        }
    }
}

fn ok_response(body: &[u8], connection: &str) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: {connection}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
    })
}

/// Value of an unlabelled sample in prometheus text output.
pub fn metric_value(text: &str, name: &str) -> f64 {
    text.lines()
        .find_map(|l| l.strip_prefix(name)?.strip_prefix(' ')?.parse().ok())
        .unwrap_or(0.0)
}

// ── Proxy ─────────────────────────────────────────────────────

pub struct Proxy {
    pub addr: String,
    pub pool: Arc<WorkerPool>,
    pub metrics: Arc<MetricsCollector>,
    shared: Arc<SharedState>,
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
    }
}

pub fn free_port_addr() -> String {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().to_string()
}

/// Pool with every address registered and marked healthy.
pub fn healthy_pool(addrs: &[(u32, &str)]) -> Arc<WorkerPool> {
    let pool = Arc::new(WorkerPool::new());
    for (pid, addr) in addrs {
        pool.insert(WorkerProcess::new(*pid, *addr)).unwrap();
        pool.set_health(addr, Health::Healthy);
    }
    pool
}

pub fn start_proxy(pool: Arc<WorkerPool>, tweak: impl FnOnce(&mut WarrenConfig)) -> Proxy {
    let mut config = WarrenConfig::default();
    config.proxy.listen_addr = free_port_addr();
    config.proxy.request_timeout_ms = 5_000;
    config.proxy.connect_timeout_ms = 500;
    tweak(&mut config);
    let addr = config.proxy.listen_addr.clone();
    let metrics = Arc::new(MetricsCollector::new(true).unwrap());
    let shared = SharedState::new(Arc::clone(&pool), config, Arc::clone(&metrics));
    spawn_workers(Arc::clone(&shared), 1).unwrap();
    Proxy {
        addr,
        pool,
        metrics,
        shared,
    }
}

// ── Client ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

pub fn connect(addr: &str) -> TcpStream {
    let s = TcpStream::connect(addr).unwrap();
    s.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    s
}

/// Read one response off a keep-alive connection. Chunked bodies are
/// returned raw.
pub fn read_response(stream: &mut TcpStream, pending: &mut Vec<u8>) -> Response {
    let mut buf = [0u8; 8192];
    let head_end = loop {
        if let Some(end) = find(pending, b"\r\n\r\n") {
            break end + 4;
        }
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before response head");
        pending.extend_from_slice(&buf[..n]);
    };
    let head = String::from_utf8_lossy(&pending[..head_end]).to_string();
    let status: u16 = head[9..12].parse().unwrap();
    pending.drain(..head_end);

    let chunked = header_value(&head, "transfer-encoding").is_some_and(|v| v.contains("chunked"));
    let body = if chunked {
        loop {
            if let Some(end) = find(pending, b"0\r\n\r\n") {
                break pending.drain(..end + 5).collect();
            }
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed mid chunked body");
            pending.extend_from_slice(&buf[..n]);
        }
    } else {
        let len: usize = header_value(&head, "content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while pending.len() < len {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed mid body");
            pending.extend_from_slice(&buf[..n]);
        }
        pending.drain(..len).collect()
    };
    Response { status, head, body }
}

/// One request on a fresh connection.
pub fn get(addr: &str, path: &str) -> Response {
    let mut s = connect(addr);
    let req = format!("GET {path} HTTP/1.1\r\nhost: test\r\n\r\n");
    s.write_all(req.as_bytes()).unwrap();
    read_response(&mut s, &mut Vec::new())
}
