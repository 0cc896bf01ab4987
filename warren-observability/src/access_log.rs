//! Worker-attributed access log records.
//!
//! One [`RequestRecord`] is written per completed request, as a single line:
//!
//! ```text
//! [Worker PID:42] 172.18.0.1 - - [25/Dec/2024:10:30:45 +0000] "GET /api/endpoint HTTP/1.1" 200 1234 "-" "Mozilla/5.0" 12345
//! ```
//!
//! Operator tooling greps this format, so the layout is fixed. Empty
//! referer / user agent / client fields render as `-`; `"` and `\` inside
//! quoted fields are backslash-escaped.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// strftime layout of the bracketed timestamp.
pub const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Structured access log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// PID of the process that executed the handler.
    pub worker_id: u32,
    pub client_address: String,
    /// Completion time, second precision on the wire.
    pub timestamp: DateTime<Utc>,
    pub method: String,
    /// Request target: path plus query string.
    pub path: String,
    pub status_code: u16,
    pub response_size_bytes: u64,
    pub referer: String,
    pub user_agent: String,
    pub duration_micros: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LogParseError {
    #[error("not an access log line: {0}")]
    Malformed(String),

    #[error("invalid {field}: {value}")]
    Field { field: &'static str, value: String },
}

impl RequestRecord {
    /// Render the access log line (no trailing newline).
    pub fn to_line(&self) -> String {
        let mut out = String::with_capacity(160);
        self.write_line(&mut out);
        out
    }

    /// Append the access log line to `out`.
    pub fn write_line(&self, out: &mut String) {
        let mut num = itoa::Buffer::new();
        out.push_str("[Worker PID:");
        out.push_str(num.format(self.worker_id));
        out.push_str("] ");
        out.push_str(dash_if_empty(&self.client_address));
        out.push_str(" - - [");
        out.push_str(&self.timestamp.format(TIMESTAMP_FORMAT).to_string());
        out.push_str("] \"");
        out.push_str(&self.method);
        out.push(' ');
        out.push_str(&self.path);
        out.push_str(" HTTP/1.1\" ");
        out.push_str(num.format(self.status_code));
        out.push(' ');
        out.push_str(num.format(self.response_size_bytes));
        out.push_str(" \"");
        out.push_str(&escape(dash_if_empty(&self.referer)));
        out.push_str("\" \"");
        out.push_str(&escape(dash_if_empty(&self.user_agent)));
        out.push_str("\" ");
        out.push_str(num.format(self.duration_micros));
    }

    /// Parse one access log line.
    pub fn parse(line: &str) -> Result<Self, LogParseError> {
        let caps = line_regex()
            .captures(line.trim_end_matches(['\r', '\n']))
            .ok_or_else(|| LogParseError::Malformed(truncate(line)))?;

        let field = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or("");

        let timestamp = DateTime::parse_from_str(field(3), TIMESTAMP_FORMAT)
            .map_err(|_| LogParseError::Field {
                field: "timestamp",
                value: field(3).to_string(),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            worker_id: parse_num(field(1), "worker_id")?,
            client_address: undash(field(2)),
            timestamp,
            method: field(4).to_string(),
            path: field(5).to_string(),
            status_code: parse_num(field(6), "status_code")?,
            response_size_bytes: parse_num(field(7), "response_size_bytes")?,
            referer: undash(&unescape(field(8))),
            user_agent: undash(&unescape(field(9))),
            duration_micros: parse_num(field(10), "duration_micros")?,
        })
    }
}

impl fmt::Display for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

impl FromStr for RequestRecord {
    type Err = LogParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^\[Worker PID:(\d+)\] (\S+) - - \[([^\]]+)\] "(\S+) (\S+) HTTP/1\.1" (\d{3}) (\d+) "((?:[^"\\]|\\.)*)" "((?:[^"\\]|\\.)*)" (\d+)$"#,
        )
        .expect("access log pattern is valid")
    })
}

fn parse_num<T: FromStr>(value: &str, field: &'static str) -> Result<T, LogParseError> {
    value.parse().map_err(|_| LogParseError::Field {
        field,
        value: value.to_string(),
    })
}

fn dash_if_empty(s: &str) -> &str {
    if s.is_empty() { "-" } else { s }
}

fn undash(s: &str) -> String {
    if s == "-" { String::new() } else { s.to_string() }
}

fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(['"', '\\']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 4);
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    Cow::Owned(out)
}

fn unescape(s: &str) -> Cow<'_, str> {
    if !s.contains('\\') {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

fn truncate(line: &str) -> String {
    line.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> RequestRecord {
        RequestRecord {
            worker_id: 42,
            client_address: "172.18.0.1".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 12, 25, 10, 30, 45).unwrap(),
            method: "GET".into(),
            path: "/api/endpoint".into(),
            status_code: 200,
            response_size_bytes: 1234,
            referer: String::new(),
            user_agent: "Mozilla/5.0".into(),
            duration_micros: 12345,
        }
    }

    #[test]
    fn formats_exact_line() {
        assert_eq!(
            sample().to_line(),
            r#"[Worker PID:42] 172.18.0.1 - - [25/Dec/2024:10:30:45 +0000] "GET /api/endpoint HTTP/1.1" 200 1234 "-" "Mozilla/5.0" 12345"#
        );
    }

    #[test]
    fn parses_exact_line() {
        let line = r#"[Worker PID:42] 172.18.0.1 - - [25/Dec/2024:10:30:45 +0000] "GET /api/endpoint HTTP/1.1" 200 1234 "-" "Mozilla/5.0" 12345"#;
        assert_eq!(RequestRecord::parse(line).unwrap(), sample());
    }

    #[test]
    fn parses_non_utc_offset() {
        let line = r#"[Worker PID:7] 10.0.0.1 - - [25/Dec/2024:12:30:45 +0200] "POST /x HTTP/1.1" 500 0 "-" "-" 9"#;
        let rec = RequestRecord::parse(line).unwrap();
        assert_eq!(rec.timestamp, Utc.with_ymd_and_hms(2024, 12, 25, 10, 30, 45).unwrap());
        assert_eq!(rec.user_agent, "");
        assert_eq!(rec.status_code, 500);
    }

    #[test]
    fn quotes_in_user_agent_survive() {
        let mut rec = sample();
        rec.user_agent = r#"evil "agent" \ v1"#.into();
        rec.referer = "https://example.com/?q=\"x\"".into();
        let line = rec.to_line();
        assert!(line.contains(r#""evil \"agent\" \\ v1""#));
        assert_eq!(RequestRecord::parse(&line).unwrap(), rec);
    }

    #[test]
    fn query_string_kept_in_path() {
        let mut rec = sample();
        rec.path = "/search?q=rust&page=2".into();
        let parsed: RequestRecord = rec.to_line().parse().unwrap();
        assert_eq!(parsed.path, "/search?q=rust&page=2");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            RequestRecord::parse("GET / 200"),
            Err(LogParseError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_bad_timestamp() {
        let line = r#"[Worker PID:42] 1.2.3.4 - - [yesterday] "GET / HTTP/1.1" 200 1 "-" "-" 1"#;
        assert!(matches!(
            RequestRecord::parse(line),
            Err(LogParseError::Field { field: "timestamp", .. })
        ));
    }

    #[test]
    fn rejects_pid_overflow() {
        let line = r#"[Worker PID:99999999999] 1.2.3.4 - - [25/Dec/2024:10:30:45 +0000] "GET / HTTP/1.1" 200 1 "-" "-" 1"#;
        assert!(matches!(
            RequestRecord::parse(line),
            Err(LogParseError::Field { field: "worker_id", .. })
        ));
    }

    #[test]
    fn trailing_newline_ignored() {
        let line = format!("{}\n", sample().to_line());
        assert_eq!(RequestRecord::parse(&line).unwrap(), sample());
    }
}
