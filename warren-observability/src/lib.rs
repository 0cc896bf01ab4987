pub mod access_log;
pub mod aggregator;
pub mod file_writer;
pub mod sink;

#[cfg(feature = "prometheus")]
pub mod metrics;

pub use access_log::{LogParseError, RequestRecord};
pub use aggregator::{LogAggregator, LogQuery, MergedRecords, StreamInfo, Tail};
pub use sink::{AccessLogSink, Durable, SinkError, SinkOptions};

#[cfg(feature = "prometheus")]
pub use metrics::MetricsCollector;
