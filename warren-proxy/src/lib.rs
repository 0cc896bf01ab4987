//! Warren data plane.
//!
//! Proxy threads run monoio thread-per-core and forward client requests to
//! the healthy members of a [`warren_core::WorkerPool`]. Health probing and
//! worker supervision run on tokio next to the admin API and only touch the
//! pool through its copy-on-write update methods.

pub mod connection;
pub mod health_check;
pub mod proxy;
pub mod supervisor;
pub mod worker;
