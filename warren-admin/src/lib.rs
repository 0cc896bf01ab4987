//! Control-plane HTTP surface: pool inspection, scaling, worker log
//! queries and the Prometheus scrape endpoint.

pub mod handlers;
pub mod server;

pub use server::{AdminServer, AdminState, build_admin_router};
