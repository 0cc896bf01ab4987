use crate::server::AdminState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{Value, json};
use std::sync::Arc;

/// Upper bound accepted by `PUT /pool/size`. Each worker takes one port
/// above `pool.base_port`.
pub const MAX_POOL_SIZE: usize = 1024;

pub async fn list_members(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let snapshot = state.pool.snapshot();
    let members: Vec<Value> = snapshot
        .members()
        .iter()
        .map(|m| {
            json!({
                "pid": m.process.pid,
                "addr": m.process.addr,
                "health": m.process.health,
                "weight": m.process.weight,
                "started_at": m.process.started_at.to_rfc3339(),
                "in_flight": m.stats().in_flight(),
                "dispatched": m.stats().dispatched(),
            })
        })
        .collect();

    Json(json!({"list": members, "total": members.len()}))
}

pub async fn set_pool_size(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(supervisor) = state.supervisor.as_ref() else {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "pool membership is not supervised"})),
        );
    };

    let size = match body.get("size").and_then(Value::as_u64) {
        Some(n) if n <= MAX_POOL_SIZE as u64 => n as usize,
        Some(n) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("size {n} exceeds maximum {MAX_POOL_SIZE}")})),
            );
        }
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "body must be {\"size\": <non-negative integer>}"})),
            );
        }
    };

    let previous = supervisor.set_pool_size(size);
    (
        StatusCode::OK,
        Json(json!({"size": size, "previous": previous})),
    )
}
