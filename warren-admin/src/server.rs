use crate::handlers;
use axum::{
    Router as AxumRouter,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use warren_core::WorkerPool;
use warren_core::config::AdminConfig;
use warren_observability::{LogAggregator, MetricsCollector};
use warren_proxy::supervisor::Supervisor;

/// Shared state for the Admin API.
pub struct AdminState {
    pub pool: Arc<WorkerPool>,
    /// `None` when membership is managed externally; scaling is refused.
    pub supervisor: Option<Arc<Supervisor>>,
    pub aggregator: LogAggregator,
    pub metrics: Arc<MetricsCollector>,
    pub metrics_path: String,
}

/// Build the Axum router with all admin routes.
pub fn build_admin_router(state: Arc<AdminState>) -> AxumRouter {
    let admin_api = AxumRouter::new()
        .route("/health", get(handlers::health::health_check))
        .route("/pool", get(handlers::pool::list_members))
        .route("/pool/size", put(handlers::pool::set_pool_size))
        .route("/logs/workers/{pid}", get(handlers::logs::worker_logs))
        .route("/logs/counts", get(handlers::logs::counts));

    let metrics_path = if state.metrics_path.starts_with('/') {
        state.metrics_path.clone()
    } else {
        format!("/{}", state.metrics_path)
    };

    AxumRouter::new()
        .nest("/warren/admin", admin_api)
        .route(&metrics_path, get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admin REST API server.
pub struct AdminServer {
    config: AdminConfig,
    state: Arc<AdminState>,
}

impl AdminServer {
    pub fn new(config: AdminConfig, state: Arc<AdminState>) -> Self {
        Self { config, state }
    }

    /// Serve until `shutdown` resolves.
    pub async fn start(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("Admin API disabled");
            return Ok(());
        }

        let app = build_admin_router(self.state);
        let listener = tokio::net::TcpListener::bind(self.config.addr.as_str()).await?;
        info!(addr = %listener.local_addr()?, "Starting Admin API server");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<AdminState>>) -> Response {
    if !state.metrics.is_enabled() {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
