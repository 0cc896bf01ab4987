use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};
use warren_core::{WarrenConfig, WorkerPool};
use warren_observability::MetricsCollector;

use crate::proxy::{ConnPool, ProxyWorker};

/// State shared by every proxy thread.
///
/// The pool snapshot is the only shared mutable state; proxy threads read
/// it with an atomic load per selection.
pub struct SharedState {
    pub pool: Arc<WorkerPool>,
    pub config: Arc<WarrenConfig>,
    pub metrics: Arc<MetricsCollector>,
    /// Set to stop accepting; open connections finish on their own.
    pub stopping: Arc<AtomicBool>,
}

impl SharedState {
    pub fn new(pool: Arc<WorkerPool>, config: WarrenConfig, metrics: Arc<MetricsCollector>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config: Arc::new(config),
            metrics,
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Spawn monoio proxy threads, one per core.
///
/// Each thread runs an independent runtime with its own listener on the
/// same address (SO_REUSEPORT), event loop and upstream connection pool.
/// Binding happens before this returns, so a taken port is reported here.
pub fn spawn_workers(
    shared: Arc<SharedState>,
    num_threads: usize,
) -> anyhow::Result<Vec<std::thread::JoinHandle<()>>> {
    let listen_addr = shared.config.proxy.listen_addr.clone();
    let mut handles = Vec::with_capacity(num_threads);

    for thread_id in 0..num_threads {
        let shared = Arc::clone(&shared);
        let addr = listen_addr.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<anyhow::Result<()>>();

        let handle = std::thread::Builder::new()
            .name(format!("warren-proxy-{thread_id}"))
            .spawn(move || {
                let mut rt = match monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
                    .enable_timer()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                rt.block_on(worker_loop(thread_id, shared, addr, ready_tx));
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => handles.push(handle),
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e.context(format!("proxy thread {thread_id} failed to start")));
            }
            Err(_) => anyhow::bail!("proxy thread {thread_id} exited during startup"),
        }
    }

    info!(threads = num_threads, addr = %listen_addr, "Proxy threads spawned");
    Ok(handles)
}

/// Accept loop of one proxy thread.
///
/// Creates ONE `ProxyWorker` and ONE `ConnPool` for the thread; all of its
/// connections share them via `Rc`.
async fn worker_loop(
    thread_id: usize,
    shared: Arc<SharedState>,
    addr: String,
    ready: std::sync::mpsc::Sender<anyhow::Result<()>>,
) {
    use monoio::net::TcpListener;

    let listener = match TcpListener::bind(addr.as_str()) {
        Ok(l) => l,
        Err(e) => {
            let _ = ready.send(Err(anyhow::anyhow!("bind {addr}: {e}")));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    debug!(thread = thread_id, addr = %addr, "Proxy thread listening");

    let proxy = Rc::new(ProxyWorker::new(
        Arc::clone(&shared.pool),
        &shared.config.proxy,
        Arc::clone(&shared.metrics),
    ));
    let conns = Rc::new(RefCell::new(ConnPool::new(shared.config.proxy.keepalive_pool_size)));

    while !shared.stopping.load(Ordering::Acquire) {
        // wake periodically so a stop request is noticed without traffic
        let accepted =
            match monoio::time::timeout(Duration::from_millis(200), listener.accept()).await {
                Ok(res) => res,
                Err(_) => continue,
            };
        match accepted {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);

                // Forget sockets of workers that left the pool.
                proxy.prune_connections(&mut *conns.borrow_mut());

                let proxy = Rc::clone(&proxy);
                let conns = Rc::clone(&conns);
                monoio::spawn(async move {
                    if let Err(e) =
                        crate::connection::handle_connection(stream, peer_addr, proxy, conns).await
                    {
                        debug!(error = %e, "Connection closed");
                    }
                });
            }
            Err(e) => {
                error!(thread = thread_id, error = %e, "Accept error");
            }
        }
    }
    info!(thread = thread_id, "Proxy thread stopped accepting");
}
