//! Application-server harness run once per pool member.
//!
//! A worker serves HTTP/1.1 with hyper, answers liveness probes and appends
//! one [`RequestRecord`](warren_observability::RequestRecord) per completed
//! request to its own access log stream.

pub mod app;
pub mod server;

pub use app::{AppRequest, AppResponse, Application, EchoApp};
pub use server::{WorkerOptions, WorkerServer, client_address};
