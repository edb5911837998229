//! Strata HTTP API.
//!
//! Exposes the synchronization operations over HTTP with bearer-token
//! authentication, the JSON response envelope and a TUS endpoint for
//! resumable pack uploads.

pub mod handlers;
pub mod tus;

use bytes::Bytes;
use handlers::RequestHeaders;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{DatabaseRegistry, Orchestrator, SyncError, TokenAuthProvider};
use tus::TusStore;

/// HTTP API configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the database store.
    pub store_root: PathBuf,
    /// Maximum request body size (bytes).
    pub max_body_size: usize,
    /// Token used for server-to-server requests (fetch/pull against an
    /// upstream), if any.
    pub service_token: Option<String>,
    /// Payload size above which outbound transfers use TUS resumable upload.
    pub tus_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("./strata-store"),
            max_body_size: 1024 * 1024 * 1024, // 1 GB; TUS covers anything larger
            service_token: None,
            tus_threshold: strata_core::DEFAULT_TUS_THRESHOLD,
        }
    }
}

/// Shared state behind the API handlers.
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub auth: Arc<dyn TokenAuthProvider>,
    pub uploads: TusStore,
    pub service_token: Option<String>,
    pub tus_threshold: usize,
}

impl ApiState {
    pub fn new(config: &Config, auth: Arc<dyn TokenAuthProvider>) -> Result<Self, SyncError> {
        let registry = Arc::new(DatabaseRegistry::open(&config.store_root)?);
        let uploads = TusStore::open(&config.store_root.join("_tus"))
            .map_err(|e| SyncError::Internal(format!("failed to open upload spool: {}", e)))?;
        Ok(Self {
            orchestrator: Orchestrator::new(registry),
            auth,
            uploads,
            service_token: config.service_token.clone(),
            tus_threshold: config.tus_threshold,
        })
    }
}

/// Hyper-facing request handler.
pub struct ApiHandler {
    state: Arc<ApiState>,
    max_body_size: usize,
}

impl ApiHandler {
    pub fn new(config: Config, auth: Arc<dyn TokenAuthProvider>) -> Result<Self, SyncError> {
        let max_body_size = config.max_body_size;
        Ok(Self {
            state: Arc::new(ApiState::new(&config, auth)?),
            max_body_size,
        })
    }

    pub fn state(&self) -> &Arc<ApiState> {
        &self.state
    }

    /// Handle one HTTP request end to end.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let headers = extract_headers(&req);

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read request body");
                return error_response(400, &format!("failed to read request body: {}", e));
            }
        };
        if body.len() > self.max_body_size {
            return error_response(413, "request body too large; use the TUS upload endpoint");
        }

        tracing::debug!(%method, %path, bytes = body.len(), "api request");
        handlers::handle_api_request(&self.state, &method, &path, &headers, body.as_ref()).await
    }
}

fn extract_headers(req: &Request<Incoming>) -> RequestHeaders {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    RequestHeaders {
        bearer_token: header("Authorization")
            .and_then(|v| v.strip_prefix("Bearer ").map(|t| t.trim().to_string())),
        protocol_version: header("Strata-Version"),
        upload_length: header("Upload-Length").and_then(|v| v.parse().ok()),
        upload_offset: header("Upload-Offset").and_then(|v| v.parse().ok()),
    }
}

fn error_response(status: u16, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "api:status": "api:failure",
        "api:message": message,
    });
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response must build")
}
