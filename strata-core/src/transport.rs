//! Transport capabilities for pack exchange.
//!
//! A transport answers two questions: "give me a pack newer than this
//! baseline" and "deliver this payload". Three implementations are provided:
//! HTTP (with TUS-resumable upload for large payloads), same-process
//! store-to-store, and an in-memory buffer used by bundle/unbundle.

use crate::db::{DatabaseRegistry, DatabaseSpec};
use crate::error::SyncError;
use crate::exchange::{pack_from_head, receive_payload};
use crate::layer::LayerId;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Synthetic remote url used by bundle/unbundle.
pub const BUNDLE_URL: &str = "strata:///bundle";

/// Protocol version header sent on every request.
pub const PROTOCOL_VERSION: &str = "1";
const VERSION_HEADER: &str = "Strata-Version";

/// Direct POST is held fully in memory on both ends; payloads above this
/// threshold go through TUS-resumable upload instead.
pub const DEFAULT_TUS_THRESHOLD: usize = 100 * 1024 * 1024;
const TUS_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Capability for requesting and delivering packs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask the remote for a payload containing everything newer than
    /// `baseline`. `None` means the remote has nothing new.
    async fn request_pack(
        &self,
        url: &str,
        baseline: Option<LayerId>,
    ) -> Result<Option<Bytes>, SyncError>;

    /// Deliver a payload to the remote.
    async fn send_pack(&self, url: &str, payload: Bytes) -> Result<(), SyncError>;
}

/// Split a remote database url into (server root, org, db).
fn split_remote_url(url: &str) -> Result<(String, String, String), SyncError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| SyncError::NetworkError(format!("invalid remote url {}", url)))?;
    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(host), Some(org), Some(db), None) => Ok((
            format!("{}://{}", scheme, host),
            org.to_string(),
            db.to_string(),
        )),
        _ => Err(SyncError::NetworkError(format!(
            "remote url {} does not name an org/db",
            url
        ))),
    }
}

// ─────────────────────────────────────────────────────
// HTTP transport
// ─────────────────────────────────────────────────────

/// HTTP transport speaking the `/api/pack` and `/api/unpack` endpoints.
pub struct HttpTransport {
    http: reqwest::Client,
    token: Option<String>,
    tus_threshold: usize,
}

impl HttpTransport {
    pub fn new(token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            tus_threshold: DEFAULT_TUS_THRESHOLD,
        }
    }

    pub fn with_tus_threshold(mut self, threshold: usize) -> Self {
        self.tus_threshold = threshold;
        self
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(VERSION_HEADER, PROTOCOL_VERSION);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn tus_upload(&self, root: &str, payload: &[u8]) -> Result<String, SyncError> {
        let create_url = format!("{}/api/files", root);
        let resp = self
            .request(self.http.post(&create_url))
            .header("Tus-Resumable", "1.0.0")
            .header("Upload-Length", payload.len().to_string())
            .send()
            .await
            .map_err(|e| SyncError::NetworkError(e.to_string()))?;
        if resp.status().as_u16() != 201 {
            return Err(SyncError::NetworkError(format!(
                "TUS creation failed with status {}",
                resp.status()
            )));
        }
        let location = resp
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| SyncError::NetworkError("TUS creation returned no location".into()))?;
        let resource = if location.starts_with("http") {
            location
        } else {
            format!("{}{}", root, location)
        };

        let mut offset = 0usize;
        while offset < payload.len() {
            let end = (offset + TUS_CHUNK_SIZE).min(payload.len());
            let chunk = payload[offset..end].to_vec();
            let resp = self
                .request(self.http.patch(&resource))
                .header("Tus-Resumable", "1.0.0")
                .header("Upload-Offset", offset.to_string())
                .header("Content-Type", "application/offset+octet-stream")
                .body(chunk)
                .send()
                .await;
            match resp {
                Ok(resp) if resp.status().is_success() => {
                    offset = end;
                }
                Ok(resp) => {
                    // Abandon the partial upload; the delete is best-effort.
                    let status = resp.status().as_u16();
                    let _ = self.request(self.http.delete(&resource)).send().await;
                    return Err(SyncError::NetworkError(format!(
                        "TUS chunk upload failed with status {}",
                        status
                    )));
                }
                Err(e) => {
                    let _ = self.request(self.http.delete(&resource)).send().await;
                    return Err(SyncError::NetworkError(e.to_string()));
                }
            }
        }
        Ok(resource)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_pack(
        &self,
        url: &str,
        baseline: Option<LayerId>,
    ) -> Result<Option<Bytes>, SyncError> {
        let (root, org, db) = split_remote_url(url)?;
        let endpoint = format!("{}/api/pack/{}/{}", root, org, db);
        let body = match baseline {
            Some(id) => serde_json::json!({ "repository_head": id.to_hex() }),
            None => serde_json::json!({}),
        };

        let resp = self
            .request(self.http.post(&endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::NetworkError(e.to_string()))?;

        match resp.status().as_u16() {
            200 => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| SyncError::NetworkError(e.to_string()))?;
                Ok(Some(bytes))
            }
            204 => Ok(None),
            401 | 403 => Err(SyncError::Unauthorized(format!("remote {}", url))),
            404 => Err(SyncError::NotFound(format!("remote database {}", url))),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(SyncError::NetworkError(format!(
                    "pack request failed ({}): {}",
                    status, body
                )))
            }
        }
    }

    async fn send_pack(&self, url: &str, payload: Bytes) -> Result<(), SyncError> {
        let (root, org, db) = split_remote_url(url)?;
        let endpoint = format!("{}/api/unpack/{}/{}", root, org, db);

        let resp = if payload.len() > self.tus_threshold {
            let resource = self.tus_upload(&root, &payload).await?;
            self.request(self.http.post(&endpoint))
                .json(&serde_json::json!({ "resource_uri": resource }))
                .send()
                .await
        } else {
            self.request(self.http.post(&endpoint))
                .header("Content-Type", "application/octets")
                .body(payload.to_vec())
                .send()
                .await
        }
        .map_err(|e| SyncError::NetworkError(e.to_string()))?;

        let status = resp.status().as_u16();
        match status {
            s if (200..300).contains(&s) => Ok(()),
            401 | 403 => Err(SyncError::Unauthorized(format!("remote {}", url))),
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(SyncError::RemoteUnpackFailed { status, body })
            }
        }
    }
}

// ─────────────────────────────────────────────────────
// Local store transport
// ─────────────────────────────────────────────────────

/// Same-process transport against another database in a local registry.
/// Urls look like `local:///org/db`.
pub struct LocalStoreTransport {
    registry: Arc<DatabaseRegistry>,
}

impl LocalStoreTransport {
    pub fn new(registry: Arc<DatabaseRegistry>) -> Self {
        Self { registry }
    }

    fn resolve(&self, url: &str) -> Result<DatabaseSpec, SyncError> {
        let path = url
            .strip_prefix("local://")
            .ok_or_else(|| SyncError::NetworkError(format!("invalid local url {}", url)))?;
        DatabaseSpec::parse(path.trim_matches('/'))
    }
}

#[async_trait]
impl Transport for LocalStoreTransport {
    async fn request_pack(
        &self,
        url: &str,
        baseline: Option<LayerId>,
    ) -> Result<Option<Bytes>, SyncError> {
        let spec = self.resolve(url)?;
        let ctx = self.registry.open_db(&spec)?;
        let head = ctx.meta.snapshot().await.local_head;
        pack_from_head(ctx.store.as_ref(), head, baseline).await
    }

    async fn send_pack(&self, url: &str, payload: Bytes) -> Result<(), SyncError> {
        let spec = self.resolve(url)?;
        let ctx = self.registry.open_db(&spec)?;
        receive_payload(ctx.store.as_ref(), ctx.meta.as_ref(), &payload).await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────
// In-memory payload transport
// ─────────────────────────────────────────────────────

/// Capture/replay buffer used to build bundles (push side) and apply them
/// (pull side) without a network peer.
#[derive(Default)]
pub struct InMemoryPayloadTransport {
    supplied: Option<Bytes>,
    captured: Mutex<Option<Bytes>>,
}

impl InMemoryPayloadTransport {
    /// A transport that records whatever is sent to it.
    pub fn capture() -> Self {
        Self::default()
    }

    /// A transport that serves `payload` to any pack request.
    pub fn replay(payload: Bytes) -> Self {
        Self {
            supplied: Some(payload),
            captured: Mutex::new(None),
        }
    }

    /// The payload captured by the last `send_pack`, if any.
    pub async fn captured(&self) -> Option<Bytes> {
        self.captured.lock().await.clone()
    }
}

#[async_trait]
impl Transport for InMemoryPayloadTransport {
    async fn request_pack(
        &self,
        _url: &str,
        _baseline: Option<LayerId>,
    ) -> Result<Option<Bytes>, SyncError> {
        Ok(self.supplied.clone())
    }

    async fn send_pack(&self, _url: &str, payload: Bytes) -> Result<(), SyncError> {
        *self.captured.lock().await = Some(payload);
        Ok(())
    }
}

/// Pick a transport for a remote url. `tus_threshold` bounds the payload
/// size an HTTP transport will send as a direct POST.
pub fn transport_for_url(
    url: &str,
    registry: &Arc<DatabaseRegistry>,
    token: Option<String>,
    tus_threshold: usize,
) -> Result<Box<dyn Transport>, SyncError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Box::new(
            HttpTransport::new(token).with_tus_threshold(tus_threshold),
        ))
    } else if url.starts_with("local://") {
        Ok(Box::new(LocalStoreTransport::new(Arc::clone(registry))))
    } else {
        Err(SyncError::NetworkError(format!(
            "unsupported remote url scheme: {}",
            url
        )))
    }
}
