//! Append-only access log stream files.
//!
//! Every worker owns exactly one stream file per lifetime, named after its
//! [`WorkerKey`]: `worker-<pid>-<started_at_ms>.log`. The start time in the
//! name keeps a recycled PID from appending to its predecessor's stream.
//! Rotation and retention are left to external tooling.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use warren_core::WorkerKey;

const PREFIX: &str = "worker-";
const SUFFIX: &str = ".log";

/// File name of the stream owned by `key`.
pub fn stream_file_name(key: WorkerKey) -> String {
    let mut buf = itoa::Buffer::new();
    let mut name = String::with_capacity(40);
    name.push_str(PREFIX);
    name.push_str(buf.format(key.pid));
    name.push('-');
    name.push_str(buf.format(key.started_at_ms));
    name.push_str(SUFFIX);
    name
}

/// Inverse of [`stream_file_name`]. `None` for unrelated files.
pub fn parse_stream_file_name(name: &str) -> Option<WorkerKey> {
    let stem = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let (pid, started) = stem.split_once('-')?;
    Some(WorkerKey {
        pid: pid.parse().ok()?,
        started_at_ms: started.parse().ok()?,
    })
}

/// Writer for one stream file. Owned by a single sink thread.
pub struct LogFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl LogFileWriter {
    /// Open (or create) the stream file for `key` inside `dir`.
    pub fn open(dir: &Path, key: WorkerKey) -> io::Result<Self> {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
        let path = dir.join(stream_file_name(key));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();

        info!(path = %path.display(), "Access log stream opened");

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            bytes_written,
        })
    }

    /// Buffer one line. Call [`LogFileWriter::flush`] to make it visible.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.bytes_written += line.len() as u64 + 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
