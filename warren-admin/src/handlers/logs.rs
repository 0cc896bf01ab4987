use crate::server::AdminState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;
use warren_observability::{LogQuery, RequestRecord};

/// Records returned when the caller gives no `limit`.
pub const DEFAULT_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct LogParams {
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, (StatusCode, Json<Value>)> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid {field}: {e}")})),
            )
        })
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    warn!(error = %e, "Access log query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "access log query failed"})),
    )
}

/// Records handled by one worker pid, oldest first.
pub async fn worker_logs(
    State(state): State<Arc<AdminState>>,
    Path(pid): Path<u32>,
    Query(params): Query<LogParams>,
) -> (StatusCode, Json<Value>) {
    let mut query = LogQuery::all()
        .worker(pid)
        .limit(params.limit.unwrap_or(DEFAULT_LIMIT));
    if let Some(since) = params.since.as_deref() {
        match parse_time("since", since) {
            Ok(t) => query = query.since(t),
            Err(resp) => return resp,
        }
    }
    if let Some(until) = params.until.as_deref() {
        match parse_time("until", until) {
            Ok(t) => query = query.until(t),
            Err(resp) => return resp,
        }
    }

    // Stream files are read with blocking I/O.
    let aggregator = state.aggregator.clone();
    let result = tokio::task::spawn_blocking(move || {
        aggregator
            .query(&query)
            .map(|records| records.collect::<Vec<RequestRecord>>())
    })
    .await;

    let records = match result {
        Ok(Ok(records)) => records,
        Ok(Err(e)) => return internal(e),
        Err(e) => return internal(e),
    };
    let lines: Vec<String> = records.iter().map(RequestRecord::to_line).collect();

    (
        StatusCode::OK,
        Json(json!({
            "worker": pid,
            "total": records.len(),
            "list": records,
            "lines": lines,
        })),
    )
}

/// Request count per worker pid over every retained stream.
pub async fn counts(State(state): State<Arc<AdminState>>) -> (StatusCode, Json<Value>) {
    let aggregator = state.aggregator.clone();
    let counts = match tokio::task::spawn_blocking(move || aggregator.count_by_worker()).await {
        Ok(Ok(counts)) => counts,
        Ok(Err(e)) => return internal(e),
        Err(e) => return internal(e),
    };
    let total: u64 = counts.values().sum();
    (StatusCode::OK, Json(json!({"counts": counts, "total": total})))
}
