//! Read side of the per-worker access log streams.
//!
//! [`LogAggregator::query`] merges every stream file in the log directory
//! into one lazy, ascending-timestamp sequence. Ties are broken by stream
//! start time, then by append order inside a stream. The sink writes each
//! stream in non-decreasing timestamp order, so merging the stream heads is
//! enough to order the whole directory. Each query reopens the
//! files and reads at most the length they had when opened, so the same
//! directory contents always produce the same sequence and a query started
//! while workers are writing still terminates.

use crate::access_log::RequestRecord;
use crate::file_writer::parse_stream_file_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use warren_core::WorkerKey;

/// Filter over access log records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    pub worker: Option<u32>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LogQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn worker(mut self, pid: u32) -> Self {
        self.worker = Some(pid);
        self
    }

    pub fn since(mut self, t: DateTime<Utc>) -> Self {
        self.since = Some(t);
        self
    }

    pub fn until(mut self, t: DateTime<Utc>) -> Self {
        self.until = Some(t);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Whether `record` passes the worker and time filters.
    pub fn matches(&self, record: &RequestRecord) -> bool {
        if self.worker.is_some_and(|pid| pid != record.worker_id) {
            return false;
        }
        if self.since.is_some_and(|t| record.timestamp < t) {
            return false;
        }
        if self.until.is_some_and(|t| record.timestamp > t) {
            return false;
        }
        true
    }

    fn wants_stream(&self, key: WorkerKey) -> bool {
        self.worker.is_none_or(|pid| pid == key.pid)
    }
}

/// One stream file found in the log directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub key: WorkerKey,
    pub path: PathBuf,
    pub len: u64,
}

/// Query surface over a directory of worker log streams.
#[derive(Debug, Clone)]
pub struct LogAggregator {
    dir: PathBuf,
}

impl LogAggregator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stream files ordered by start time, then PID. A missing directory
    /// holds no streams.
    pub fn streams(&self) -> io::Result<Vec<StreamInfo>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut streams = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(parse_stream_file_name) else {
                continue;
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            streams.push(StreamInfo {
                key,
                path: entry.path(),
                len: meta.len(),
            });
        }
        streams.sort_by_key(|s| (s.key.started_at_ms, s.key.pid));
        Ok(streams)
    }

    /// Lazy merged sequence of every record matching `query`.
    pub fn query(&self, query: &LogQuery) -> io::Result<MergedRecords> {
        let mut cursors = Vec::new();
        for stream in self.streams()? {
            if !query.wants_stream(stream.key) {
                continue;
            }
            match StreamCursor::open(&stream) {
                Ok(cursor) => cursors.push(cursor),
                // Removed between listing and opening.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        debug!(dir = %self.dir.display(), streams = cursors.len(), "Log query opened");
        Ok(MergedRecords::new(cursors, query.clone()))
    }

    /// Every record produced by worker `pid`, across all its lifetimes.
    pub fn query_by_worker(&self, pid: u32) -> io::Result<MergedRecords> {
        self.query(&LogQuery::all().worker(pid))
    }

    /// Record count per worker PID over everything retained on disk.
    pub fn count_by_worker(&self) -> io::Result<BTreeMap<u32, u64>> {
        let mut counts = BTreeMap::new();
        for stream in self.streams()? {
            let mut cursor = match StreamCursor::open(&stream) {
                Ok(cursor) => cursor,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            while let Some(record) = cursor.next_record() {
                *counts.entry(record.worker_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Follow the streams: yields existing matching records, then blocks
    /// polling for new ones.
    pub fn tail(&self, query: LogQuery) -> Tail {
        Tail::new(self.dir.clone(), query)
    }
}

// ── Merge ────────────────────────────────────────────────────────────────────

struct StreamCursor {
    path: PathBuf,
    reader: BufReader<io::Take<File>>,
    line: String,
}

impl StreamCursor {
    fn open(stream: &StreamInfo) -> io::Result<Self> {
        let file = File::open(&stream.path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: stream.path.clone(),
            reader: BufReader::new(file.take(len)),
            line: String::with_capacity(256),
        })
    }

    /// Next well-formed record. Malformed lines are skipped, and so is a
    /// trailing line the writer has not finished.
    fn next_record(&mut self) -> Option<RequestRecord> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) if !self.line.ends_with('\n') => return None,
                Ok(_) => match RequestRecord::parse(&self.line) {
                    Ok(record) => return Some(record),
                    Err(e) => {
                        debug!(path = %self.path.display(), error = %e, "Skipping malformed access log line");
                    }
                },
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Access log read failed");
                    return None;
                }
            }
        }
    }
}

/// Lazy k-way merge over stream cursors. See [`LogAggregator::query`].
pub struct MergedRecords {
    cursors: Vec<StreamCursor>,
    heads: Vec<Option<RequestRecord>>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, usize)>>,
    query: LogQuery,
    emitted: usize,
}

impl MergedRecords {
    fn new(cursors: Vec<StreamCursor>, query: LogQuery) -> Self {
        let mut merged = Self {
            heads: (0..cursors.len()).map(|_| None).collect(),
            cursors,
            heap: BinaryHeap::new(),
            query,
            emitted: 0,
        };
        for idx in 0..merged.cursors.len() {
            merged.advance(idx);
        }
        merged
    }

    fn advance(&mut self, idx: usize) {
        while let Some(record) = self.cursors[idx].next_record() {
            if self.query.matches(&record) {
                self.heap.push(Reverse((record.timestamp, idx)));
                self.heads[idx] = Some(record);
                return;
            }
        }
    }
}

impl Iterator for MergedRecords {
    type Item = RequestRecord;

    fn next(&mut self) -> Option<RequestRecord> {
        if self.query.limit.is_some_and(|n| self.emitted >= n) {
            return None;
        }
        let Reverse((_, idx)) = self.heap.pop()?;
        let record = self.heads[idx].take()?;
        self.advance(idx);
        self.emitted += 1;
        Some(record)
    }
}

// ── Tail ─────────────────────────────────────────────────────────────────────

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Default)]
struct TailFile {
    offset: u64,
    partial: Vec<u8>,
}

/// Streaming tail over all worker streams. Iteration blocks between polls
/// and ends only when the query's `limit` is reached.
pub struct Tail {
    dir: PathBuf,
    query: LogQuery,
    files: HashMap<PathBuf, TailFile>,
    ready: VecDeque<RequestRecord>,
    emitted: usize,
    poll_interval: Duration,
}

impl Tail {
    fn new(dir: PathBuf, query: LogQuery) -> Self {
        Self {
            dir,
            query,
            files: HashMap::new(),
            ready: VecDeque::new(),
            emitted: 0,
            poll_interval: TAIL_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Read whatever was appended since the last poll. Records complete in
    /// this poll are returned in timestamp order.
    pub fn poll(&mut self) -> io::Result<Vec<RequestRecord>> {
        let streams = LogAggregator::new(self.dir.clone()).streams()?;
        let mut batch: Vec<(DateTime<Utc>, usize, RequestRecord)> = Vec::new();

        for (order, stream) in streams.iter().enumerate() {
            if !self.query.wants_stream(stream.key) {
                continue;
            }
            let state = self.files.entry(stream.path.clone()).or_default();
            if stream.len <= state.offset {
                continue;
            }
            let mut file = match File::open(&stream.path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            file.seek(SeekFrom::Start(state.offset))?;
            let mut bytes = Vec::new();
            file.take(stream.len - state.offset).read_to_end(&mut bytes)?;
            state.offset += bytes.len() as u64;

            state.partial.extend_from_slice(&bytes);
            let Some(last_nl) = state.partial.iter().rposition(|b| *b == b'\n') else {
                continue;
            };
            let rest = state.partial.split_off(last_nl + 1);
            let complete = std::mem::replace(&mut state.partial, rest);

            for line in complete.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                match RequestRecord::parse(&String::from_utf8_lossy(line)) {
                    Ok(record) if self.query.matches(&record) => {
                        batch.push((record.timestamp, order, record));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(path = %stream.path.display(), error = %e, "Skipping malformed access log line");
                    }
                }
            }
        }

        batch.sort_by_key(|(ts, order, _)| (*ts, *order));
        Ok(batch.into_iter().map(|(_, _, r)| r).collect())
    }
}

impl Iterator for Tail {
    type Item = RequestRecord;

    fn next(&mut self) -> Option<RequestRecord> {
        loop {
            if self.query.limit.is_some_and(|n| self.emitted >= n) {
                return None;
            }
            if let Some(record) = self.ready.pop_front() {
                self.emitted += 1;
                return Some(record);
            }
            match self.poll() {
                Ok(batch) if !batch.is_empty() => self.ready.extend(batch),
                Ok(_) => std::thread::sleep(self.poll_interval),
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Access log tail poll failed");
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_writer::LogFileWriter;
    use chrono::TimeZone;
    use std::io::Write;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_122_645 + secs, 0).unwrap()
    }

    fn rec(pid: u32, secs: i64, path: &str) -> RequestRecord {
        RequestRecord {
            worker_id: pid,
            client_address: "10.0.0.1".into(),
            timestamp: at(secs),
            method: "GET".into(),
            path: path.into(),
            status_code: 200,
            response_size_bytes: 5,
            referer: String::new(),
            user_agent: "curl/8".into(),
            duration_micros: 100,
        }
    }

    fn write_stream(dir: &Path, key: WorkerKey, records: &[RequestRecord]) -> PathBuf {
        let mut w = LogFileWriter::open(dir, key).unwrap();
        for r in records {
            w.write_line(&r.to_line()).unwrap();
        }
        w.flush().unwrap();
        w.path().to_path_buf()
    }

    fn key(pid: u32, started: i64) -> WorkerKey {
        WorkerKey { pid, started_at_ms: started }
    }

    fn paths(records: impl Iterator<Item = RequestRecord>) -> Vec<String> {
        records.map(|r| r.path).collect()
    }

    #[test]
    fn missing_directory_has_no_streams() {
        let agg = LogAggregator::new("/nonexistent/warren/logs");
        assert!(agg.streams().unwrap().is_empty());
        assert_eq!(agg.query(&LogQuery::all()).unwrap().count(), 0);
        assert!(agg.count_by_worker().unwrap().is_empty());
    }

    #[test]
    fn merge_is_ascending_with_start_time_tie_break() {
        let dir = tempfile::tempdir().unwrap();
        write_stream(dir.path(), key(20, 2), &[rec(20, 0, "/b0"), rec(20, 2, "/b2")]);
        write_stream(dir.path(), key(10, 1), &[rec(10, 0, "/a0"), rec(10, 1, "/a1"), rec(10, 3, "/a3")]);

        let agg = LogAggregator::new(dir.path());
        let all = paths(agg.query(&LogQuery::all()).unwrap());
        assert_eq!(all, vec!["/a0", "/b0", "/a1", "/b2", "/a3"]);
    }

    #[test]
    fn query_by_worker_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_stream(dir.path(), key(1, 1), &[rec(1, 0, "/x"), rec(1, 1, "/y")]);
        write_stream(dir.path(), key(2, 2), &[rec(2, 0, "/z")]);

        let agg = LogAggregator::new(dir.path());
        let first: Vec<_> = agg.query_by_worker(1).unwrap().collect();
        let second: Vec<_> = agg.query_by_worker(1).unwrap().collect();
        assert_eq!(first, second);
        assert_eq!(paths(first.into_iter()), vec!["/x", "/y"]);
    }

    #[test]
    fn counts_sum_to_total_records() {
        let dir = tempfile::tempdir().unwrap();
        write_stream(dir.path(), key(1, 1), &(0..7).map(|i| rec(1, i, "/")).collect::<Vec<_>>());
        write_stream(dir.path(), key(2, 2), &(0..5).map(|i| rec(2, i, "/")).collect::<Vec<_>>());
        write_stream(dir.path(), key(3, 3), &[]);

        let counts = LogAggregator::new(dir.path()).count_by_worker().unwrap();
        assert_eq!(counts.get(&1), Some(&7));
        assert_eq!(counts.get(&2), Some(&5));
        assert_eq!(counts.get(&3), None);
        assert_eq!(counts.values().sum::<u64>(), 12);
    }

    #[test]
    fn reused_pid_spans_both_lifetimes() {
        let dir = tempfile::tempdir().unwrap();
        write_stream(dir.path(), key(77, 1_000), &[rec(77, 0, "/first-life")]);
        write_stream(dir.path(), key(77, 9_000), &[rec(77, 10, "/second-life")]);

        let agg = LogAggregator::new(dir.path());
        assert_eq!(agg.streams().unwrap().len(), 2);
        assert_eq!(
            paths(agg.query_by_worker(77).unwrap()),
            vec!["/first-life", "/second-life"]
        );
        assert_eq!(agg.count_by_worker().unwrap()[&77], 2);
    }

    #[test]
    fn time_range_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        write_stream(dir.path(), key(1, 1), &(0..10).map(|i| rec(1, i, &format!("/{i}"))).collect::<Vec<_>>());

        let agg = LogAggregator::new(dir.path());
        let q = LogQuery::all().since(at(3)).until(at(6));
        assert_eq!(paths(agg.query(&q).unwrap()), vec!["/3", "/4", "/5", "/6"]);

        let q = LogQuery::all().since(at(3)).limit(2);
        assert_eq!(paths(agg.query(&q).unwrap()), vec!["/3", "/4"]);
    }

    #[test]
    fn malformed_and_unfinished_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stream(dir.path(), key(1, 1), &[rec(1, 0, "/ok")]);
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "garbage line").unwrap();
        writeln!(f, "{}", rec(1, 1, "/also-ok").to_line()).unwrap();
        write!(f, "{}", rec(1, 2, "/half").to_line()).unwrap();

        let agg = LogAggregator::new(dir.path());
        assert_eq!(paths(agg.query(&LogQuery::all()).unwrap()), vec!["/ok", "/also-ok"]);
        assert_eq!(agg.count_by_worker().unwrap()[&1], 2);
    }

    #[test]
    fn unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "hello\n").unwrap();
        write_stream(dir.path(), key(1, 1), &[rec(1, 0, "/")]);
        assert_eq!(LogAggregator::new(dir.path()).streams().unwrap().len(), 1);
    }

    #[test]
    fn tail_follows_appends_and_new_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stream(dir.path(), key(1, 1), &[rec(1, 0, "/a")]);

        let mut tail = LogAggregator::new(dir.path()).tail(LogQuery::all());
        assert_eq!(paths(tail.poll().unwrap().into_iter()), vec!["/a"]);
        assert!(tail.poll().unwrap().is_empty());

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        let line = rec(1, 1, "/b").to_line();
        let (head, rest) = line.split_at(20);
        write!(f, "{head}").unwrap();
        f.flush().unwrap();
        assert!(tail.poll().unwrap().is_empty());
        writeln!(f, "{rest}").unwrap();
        f.flush().unwrap();
        write_stream(dir.path(), key(2, 2), &[rec(2, 2, "/c")]);

        assert_eq!(paths(tail.poll().unwrap().into_iter()), vec!["/b", "/c"]);
    }

    #[test]
    fn tail_iterator_stops_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        write_stream(dir.path(), key(1, 1), &(0..5).map(|i| rec(1, i, &format!("/{i}"))).collect::<Vec<_>>());

        let tail = LogAggregator::new(dir.path())
            .tail(LogQuery::all().worker(1).limit(3))
            .with_poll_interval(Duration::from_millis(1));
        assert_eq!(paths(tail), vec!["/0", "/1", "/2"]);
    }
}
