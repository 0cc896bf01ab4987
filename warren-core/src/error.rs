use thiserror::Error;

/// Unified error type for Warren.
#[derive(Error, Debug)]
pub enum WarrenError {
    #[error("No healthy worker available")]
    PoolExhausted,

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upstream timed out")]
    UpstreamTimeout,

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Internal: {0}")]
    Internal(String),
}

impl WarrenError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            WarrenError::PoolExhausted => 503,
            WarrenError::Transport(_) => 503,
            WarrenError::UpstreamTimeout => 504,
            WarrenError::BadGateway(_) => 502,
            WarrenError::DuplicateWorker(_) => 409,
            WarrenError::ConfigError(_) => 400,
            _ => 500,
        }
    }

    /// JSON error body for clients.
    ///
    /// Only the status class is described; worker addresses and health
    /// state never leave the proxy.
    pub fn to_json_body(&self) -> Vec<u8> {
        let status = self.status_code();
        let msg = match status {
            502 => "bad gateway",
            503 => "service unavailable",
            504 => "gateway timeout",
            409 => "conflict",
            400 => "bad request",
            _ => "internal error",
        };
        format!(r#"{{"error":"{}","status":{}}}"#, msg, status).into_bytes()
    }
}
