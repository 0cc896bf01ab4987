use crate::server::AdminState;
use axum::extract::State;
use axum::response::Json;
use serde_json::{Value, json};
use std::sync::Arc;
use warren_core::Health;

pub async fn health_check(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let snapshot = state.pool.snapshot();
    let mut healthy = 0usize;
    let mut unhealthy = 0usize;
    let mut draining = 0usize;
    for m in snapshot.members() {
        match m.process.health {
            Health::Healthy => healthy += 1,
            Health::Unhealthy => unhealthy += 1,
            Health::Draining => draining += 1,
        }
    }

    // No routable worker means every client request is answered 503.
    let status = if healthy > 0 { "ok" } else { "degraded" };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "pool": {
            "members": snapshot.len(),
            "healthy": healthy,
            "unhealthy": unhealthy,
            "draining": draining,
            "target": state.supervisor.as_ref().map(|s| s.target()),
            "version": snapshot.version(),
        },
    }))
}
