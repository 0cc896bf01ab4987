//! Per-worker access log sink.
//!
//! `append` hands a record to a bounded queue and returns. A dedicated
//! writer thread drains the queue into the worker's stream file, flushing
//! whenever the queue runs empty and at least every [`FLUSH_BATCH`] records
//! while it stays busy. When the queue is full the configured
//! [`BackpressurePolicy`] decides which record is lost.
//!
//! `append_durable` additionally returns a [`Durable`] handle that resolves
//! once the record has been flushed to the stream file, so a worker can hold
//! the response until its record survives the process.
//!
//! The writer is the only producer of the stream file and never writes a
//! timestamp lower than the previous line's, so every stream file is in
//! non-decreasing timestamp order.

use crate::access_log::RequestRecord;
use crate::file_writer::LogFileWriter;
use chrono::{DateTime, Utc};
use crossbeam_channel::{
    bounded, select, unbounded, Receiver, SendTimeoutError, Sender, TrySendError,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use warren_core::config::{AccessLogConfig, BackpressurePolicy};
use warren_core::WorkerKey;

/// Minimum spacing between two "records dropped" warnings.
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Records written between two flushes while the queue never runs empty.
pub const FLUSH_BATCH: usize = 256;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("record for worker {got} appended to the sink of worker {expected}")]
    WrongWorker { expected: u32, got: u32 },

    #[error("access log queue full, record dropped")]
    Backpressure,

    #[error("access log record lost before reaching the stream file")]
    Lost,

    #[error("access log record not flushed within {0:?}")]
    AckTimeout(Duration),

    #[error("access log sink closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Queue sizing and overflow behaviour.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub capacity: usize,
    pub policy: BackpressurePolicy,
    /// Grace period for `block` enqueues and for [`Durable::wait`].
    pub block_timeout: Duration,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self::from(&AccessLogConfig::default())
    }
}

impl From<&AccessLogConfig> for SinkOptions {
    fn from(cfg: &AccessLogConfig) -> Self {
        Self {
            capacity: cfg.buffer_capacity.max(1),
            policy: cfg.backpressure,
            block_timeout: cfg.block_timeout(),
        }
    }
}

/// Queued record plus the flush acknowledgement its producer waits on.
struct Entry {
    record: RequestRecord,
    ack: Option<oneshot::Sender<()>>,
}

enum Control {
    Flush(Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct SinkStats {
    written: AtomicU64,
    dropped: AtomicU64,
    /// Millis since `AccessLogSink::epoch` of the last drop warning, +1.
    last_warn: AtomicU64,
}

/// Completion handle of [`AccessLogSink::append_durable`].
#[must_use = "the record is only known to be on disk once `wait` returns Ok"]
#[derive(Debug)]
pub struct Durable {
    ack: oneshot::Receiver<()>,
    timeout: Duration,
}

impl Durable {
    /// Resolve once the record is flushed to the stream file.
    ///
    /// `Lost` means the record was evicted by `drop_oldest` or could not be
    /// written. `AckTimeout` means the writer did not get to it within the
    /// sink's grace period; it may still be written later.
    pub async fn wait(self) -> Result<(), SinkError> {
        match tokio::time::timeout(self.timeout, self.ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SinkError::Lost),
            Err(_) => Err(SinkError::AckTimeout(self.timeout)),
        }
    }
}

/// Append-only access log stream owned by one worker process.
pub struct AccessLogSink {
    key: WorkerKey,
    path: PathBuf,
    options: SinkOptions,
    records: Sender<Entry>,
    /// Second receiver used to evict the oldest queued record.
    evict: Receiver<Entry>,
    control: Sender<Control>,
    stats: Arc<SinkStats>,
    /// `true` once closed. Enqueues hold the read side until the record is
    /// in the queue, so nothing lands behind the writer's final drain.
    gate: RwLock<bool>,
    epoch: Instant,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AccessLogSink {
    /// Open the stream file for `key` under `dir` and start the writer thread.
    pub fn open(dir: &Path, key: WorkerKey, options: SinkOptions) -> Result<Self, SinkError> {
        let file = LogFileWriter::open(dir, key)?;
        let path = file.path().to_path_buf();

        let (records, rx) = bounded(options.capacity.max(1));
        let (control, control_rx) = unbounded();
        let stats = Arc::new(SinkStats::default());

        let writer = {
            let rx = rx.clone();
            let stream = StreamWriter::new(file, Arc::clone(&stats));
            std::thread::Builder::new()
                .name(format!("warren-access-log-{}", key.pid))
                .spawn(move || write_loop(stream, rx, control_rx))?
        };

        debug!(worker = key.pid, path = %path.display(), capacity = options.capacity, "Access log sink started");

        Ok(Self {
            key,
            path,
            options,
            records,
            evict: rx,
            control,
            stats,
            gate: RwLock::new(false),
            epoch: Instant::now(),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Enqueue one record. Never blocks longer than the configured grace
    /// period; with `drop_oldest` it never blocks at all.
    pub fn append(&self, record: RequestRecord) -> Result<(), SinkError> {
        self.enqueue(Entry { record, ack: None })
    }

    /// Enqueue one record and get a handle that resolves once it is flushed.
    pub fn append_durable(&self, record: RequestRecord) -> Result<Durable, SinkError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Entry {
            record,
            ack: Some(tx),
        })?;
        Ok(Durable {
            ack: rx,
            timeout: self.options.block_timeout,
        })
    }

    fn enqueue(&self, entry: Entry) -> Result<(), SinkError> {
        if entry.record.worker_id != self.key.pid {
            return Err(SinkError::WrongWorker {
                expected: self.key.pid,
                got: entry.record.worker_id,
            });
        }
        let closed = self.gate();
        if *closed {
            return Err(SinkError::Closed);
        }

        match self.options.policy {
            BackpressurePolicy::DropOldest => {
                let mut entry = entry;
                loop {
                    match self.records.try_send(entry) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Full(back)) => {
                            entry = back;
                            // Dropping the evicted entry releases its waiter with `Lost`.
                            if self.evict.try_recv().is_ok() {
                                self.note_drop();
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => return Err(SinkError::Closed),
                    }
                }
            }
            BackpressurePolicy::Block => {
                match self.records.send_timeout(entry, self.options.block_timeout) {
                    Ok(()) => Ok(()),
                    Err(SendTimeoutError::Timeout(_)) => {
                        self.note_drop();
                        Err(SinkError::Backpressure)
                    }
                    Err(SendTimeoutError::Disconnected(_)) => Err(SinkError::Closed),
                }
            }
        }
    }

    /// Block until every record appended before this call is on disk.
    pub fn flush(&self) -> Result<(), SinkError> {
        let done = {
            let closed = self.gate();
            if *closed {
                return Ok(());
            }
            let (ack, done) = bounded(1);
            self.control
                .send(Control::Flush(ack))
                .map_err(|_| SinkError::Closed)?;
            done
        };
        done.recv().map_err(|_| SinkError::Closed)
    }

    /// Write out everything queued and stop the writer thread.
    pub fn close(&self) {
        {
            let mut closed = self.gate.write().unwrap_or_else(|e| e.into_inner());
            if *closed {
                return;
            }
            *closed = true;
        }
        let _ = self.control.send(Control::Shutdown);
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(worker = self.key.pid, "Access log writer thread panicked");
            }
        }
        debug!(
            worker = self.key.pid,
            written = self.written(),
            dropped = self.dropped(),
            "Access log sink closed"
        );
    }

    pub fn key(&self) -> WorkerKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written to the stream file so far.
    pub fn written(&self) -> u64 {
        self.stats.written.load(Ordering::Relaxed)
    }

    /// Records lost to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    fn gate(&self) -> RwLockReadGuard<'_, bool> {
        self.gate.read().unwrap_or_else(|e| e.into_inner())
    }

    fn note_drop(&self) {
        let total = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;

        let now = self.epoch.elapsed().as_millis() as u64 + 1;
        let last = self.stats.last_warn.load(Ordering::Relaxed);
        let due = last == 0 || now.saturating_sub(last) >= DROP_WARN_INTERVAL.as_millis() as u64;
        if due
            && self
                .stats
                .last_warn
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(
                worker = self.key.pid,
                dropped_total = total,
                policy = ?self.options.policy,
                "Access log queue full, dropping records"
            );
        }
    }
}

impl Drop for AccessLogSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writer-thread side of the stream file.
struct StreamWriter {
    file: LogFileWriter,
    line: String,
    /// Timestamp of the last line written.
    last: Option<DateTime<Utc>>,
    /// Acks released by the next successful flush.
    pending: Vec<oneshot::Sender<()>>,
    unflushed: usize,
    stats: Arc<SinkStats>,
}

impl StreamWriter {
    fn new(file: LogFileWriter, stats: Arc<SinkStats>) -> Self {
        Self {
            file,
            line: String::with_capacity(256),
            last: None,
            pending: Vec::new(),
            unflushed: 0,
            stats,
        }
    }

    fn write(&mut self, entry: Entry) {
        let Entry { mut record, ack } = entry;
        // Timestamps are taken before enqueueing, so concurrent handlers can
        // arrive slightly out of order.
        if let Some(last) = self.last {
            if record.timestamp < last {
                record.timestamp = last;
            }
        }

        self.line.clear();
        record.write_line(&mut self.line);
        match self.file.write_line(&self.line) {
            Ok(()) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
                self.last = Some(record.timestamp);
                self.unflushed += 1;
                if let Some(ack) = ack {
                    self.pending.push(ack);
                }
            }
            Err(e) => {
                error!(path = %self.file.path().display(), error = %e, "Failed to write access log record");
            }
        }
    }

    fn flush(&mut self) {
        self.unflushed = 0;
        match self.file.flush() {
            Ok(()) => {
                for ack in self.pending.drain(..) {
                    let _ = ack.send(());
                }
            }
            Err(e) => {
                error!(path = %self.file.path().display(), error = %e, "Failed to flush access log");
                self.pending.clear();
            }
        }
    }
}

fn write_loop(mut stream: StreamWriter, records: Receiver<Entry>, control: Receiver<Control>) {
    loop {
        select! {
            recv(records) -> msg => {
                let Ok(entry) = msg else { break };
                stream.write(entry);
                if records.is_empty() || stream.unflushed >= FLUSH_BATCH {
                    stream.flush();
                }
            }
            recv(control) -> msg => {
                while let Ok(entry) = records.try_recv() {
                    stream.write(entry);
                }
                stream.flush();
                match msg {
                    Ok(Control::Flush(ack)) => {
                        let _ = ack.send(());
                    }
                    Ok(Control::Shutdown) | Err(_) => break,
                }
            }
        }
    }
    stream.flush();
}

// ── Tests ────────────────────────────────────────────────────────────────────
