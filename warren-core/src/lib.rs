pub mod config;
pub mod error;
pub mod pool;
pub mod worker;

pub use config::WarrenConfig;
pub use error::WarrenError;
pub use pool::{Lease, PoolSnapshot, WorkerPool};
pub use worker::{Health, WorkerKey, WorkerProcess};
