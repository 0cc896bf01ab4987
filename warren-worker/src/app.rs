//! The application behind a worker.
//!
//! The harness owns HTTP, liveness and access logging. Business logic
//! plugs in through [`Application`]; an `Err` becomes a logged 500.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};

/// A fully buffered request handed to the application.
#[derive(Debug, Clone)]
pub struct AppRequest {
    pub method: Method,
    /// Path plus query string.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct AppResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl AppResponse {
    pub fn new(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::new(status, "text/plain", body)
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, "application/json", value.to_string())
    }
}

#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn handle(&self, request: AppRequest) -> anyhow::Result<AppResponse>;
}

/// Default application: reports which worker answered.
pub struct EchoApp {
    pid: u32,
}

impl EchoApp {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

#[async_trait]
impl Application for EchoApp {
    async fn handle(&self, request: AppRequest) -> anyhow::Result<AppResponse> {
        Ok(AppResponse::json(
            StatusCode::OK,
            &serde_json::json!({
                "worker": self.pid,
                "method": request.method.as_str(),
                "path": request.target,
                "received_bytes": request.body.len(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_reports_worker_and_request() {
        let app = EchoApp::new(42);
        let resp = app
            .handle(AppRequest {
                method: Method::POST,
                target: "/items?x=1".into(),
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"hello"),
            })
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers[CONTENT_TYPE], "application/json");
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["worker"], 42);
        assert_eq!(body["method"], "POST");
        assert_eq!(body["path"], "/items?x=1");
        assert_eq!(body["received_bytes"], 5);
    }
}
