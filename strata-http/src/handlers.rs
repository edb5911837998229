//! HTTP API handlers for the synchronization endpoints.
//!
//! Endpoints:
//!   POST /api/pack/{org}/{db}                         → pack payload or 204
//!   POST /api/unpack/{org}/{db}                       → apply payload (raw or TUS resource)
//!   POST /api/fetch/{org}/{db}                        → fetch from a registered remote
//!   POST /api/push/{org}/{db}                         → push a branch to a remote
//!   POST /api/pull/{org}/{db}/local/branch/{branch}   → pull into a branch
//!   POST /api/clone/{org}/{db}                        → clone from a remote url
//!   POST /api/bundle/{org}/{db}                       → bundle payload or 204
//!   POST /api/unbundle/{org}/{db}                     → apply a bundle
//!   POST/HEAD/PATCH/DELETE /api/files[/{id}]          → TUS resumable upload
//!
//! Failures are wrapped in the JSON envelope
//! `{ "api:status": "api:failure", "api:message": …, "api:error_term": … }`.

use crate::tus::{TusError, TUS_VERSION};
use crate::ApiState;
use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;
use serde_json::{json, Value};
use strata_core::{
    transport_for_url, AuthContext, DatabaseSpec, LayerId, PullOutcome, PushResult, SyncError,
};

/// Request metadata the handlers care about, independent of the HTTP stack.
#[derive(Debug, Default, Clone)]
pub struct RequestHeaders {
    pub bearer_token: Option<String>,
    pub protocol_version: Option<String>,
    pub upload_length: Option<u64>,
    pub upload_offset: Option<u64>,
}

// ─────────────────────────────────────────────────────
// Response helpers
// ─────────────────────────────────────────────────────

fn response(status: u16, content_type: &str, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("static response must build")
}

fn json_ok(mut extra: Value) -> Response<Full<Bytes>> {
    let obj = extra.as_object_mut().expect("envelope extras are an object");
    obj.insert("api:status".into(), json!("api:success"));
    response(200, "application/json", extra.to_string().into_bytes())
}

fn json_failure(err: &SyncError) -> Response<Full<Bytes>> {
    let body = json!({
        "api:status": "api:failure",
        "api:message": err.to_string(),
        "api:error_term": err.error_term(),
    });
    response(
        err.http_status(),
        "application/json",
        body.to_string().into_bytes(),
    )
}

fn bad_request(message: &str) -> Response<Full<Bytes>> {
    let body = json!({
        "api:status": "api:failure",
        "api:message": message,
        "api:error_term": "api:BadRequest",
    });
    response(400, "application/json", body.to_string().into_bytes())
}

fn no_content() -> Response<Full<Bytes>> {
    Response::builder()
        .status(204)
        .body(Full::new(Bytes::new()))
        .expect("static response must build")
}

fn octets(payload: Bytes) -> Response<Full<Bytes>> {
    response(200, "application/octets", payload.to_vec())
}

fn body_json(body: &[u8]) -> Result<Value, Response<Full<Bytes>>> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| bad_request(&format!("invalid JSON body: {}", e)))
}

fn str_field<'a>(body: &'a Value, field: &str) -> Option<&'a str> {
    body.get(field).and_then(|v| v.as_str())
}

// ─────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────

/// Route an `/api/...` request. `path` is the full request path.
pub async fn handle_api_request(
    state: &ApiState,
    method: &str,
    path: &str,
    headers: &RequestHeaders,
    body: &[u8],
) -> Response<Full<Bytes>> {
    if let Some(version) = &headers.protocol_version {
        if version != strata_core::PROTOCOL_VERSION {
            return bad_request(&format!("unsupported protocol version {}", version));
        }
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first() != Some(&"api") {
        return json_failure(&SyncError::NotFound(format!("no such endpoint {}", path)));
    }

    // TUS endpoints are routed before authentication-per-database; they still
    // require a valid token.
    if segments.get(1) == Some(&"files") {
        return match authenticate(state, headers).await {
            Ok(_) => handle_files(state, method, &segments[2..], headers, body).await,
            Err(resp) => resp,
        };
    }

    let auth = match authenticate(state, headers).await {
        Ok(auth) => auth,
        Err(resp) => return resp,
    };

    let (op, rest) = match segments.split_first() {
        Some((_, rest)) if !rest.is_empty() => (rest[0], &rest[1..]),
        _ => return json_failure(&SyncError::NotFound(format!("no such endpoint {}", path))),
    };

    let spec = match rest {
        [org, db, ..] => DatabaseSpec::new(*org, *db),
        _ => return bad_request("endpoint requires /{org}/{db}"),
    };

    let result = match (method, op) {
        ("POST", "pack") => handle_pack(state, &auth, &spec, body).await,
        ("POST", "unpack") => handle_unpack(state, &auth, &spec, body).await,
        ("POST", "fetch") => handle_fetch(state, &auth, &spec, body).await,
        ("POST", "push") => handle_push(state, &auth, &spec, body).await,
        ("POST", "pull") => {
            // /api/pull/{org}/{db}/local/branch/{branch}
            let branch = match &rest[2..] {
                ["local", "branch", branch] => (*branch).to_string(),
                [] => "main".to_string(),
                _ => return bad_request("pull target must be local/branch/{branch}"),
            };
            handle_pull(state, &auth, &spec, &branch, body).await
        }
        ("POST", "clone") => handle_clone(state, &auth, &spec, body).await,
        ("POST", "bundle") => handle_bundle(state, &auth, &spec, body).await,
        ("POST", "unbundle") => handle_unbundle(state, &auth, &spec, body).await,
        _ => {
            return json_failure(&SyncError::NotFound(format!(
                "no such endpoint {} {}",
                method, path
            )))
        }
    };

    result.unwrap_or_else(|err| json_failure(&err))
}

async fn authenticate(
    state: &ApiState,
    headers: &RequestHeaders,
) -> Result<AuthContext, Response<Full<Bytes>>> {
    let token = headers.bearer_token.as_deref().unwrap_or("");
    match state.auth.authenticate(token).await {
        Some(auth) => Ok(auth),
        None => Err(json_failure(&SyncError::Unauthorized(
            "missing or invalid bearer token".into(),
        ))),
    }
}

// ─────────────────────────────────────────────────────
// Sync endpoints
// ─────────────────────────────────────────────────────

async fn handle_pack(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, SyncError> {
    let body = match body_json(body) {
        Ok(v) => v,
        Err(resp) => return Ok(resp),
    };
    let baseline = match str_field(&body, "repository_head") {
        Some(hex) => match LayerId::from_hex(hex) {
            Ok(id) => Some(id),
            Err(_) => return Ok(bad_request("repository_head is not a valid layer id")),
        },
        None => None,
    };

    match state.orchestrator.pack(auth, spec, baseline).await? {
        Some(payload) => Ok(octets(payload)),
        None => Ok(no_content()),
    }
}

async fn handle_unpack(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, SyncError> {
    // A JSON body references a completed TUS upload; anything else is the
    // payload itself.
    let resource_id = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("resource_uri").and_then(|u| u.as_str()).map(String::from));

    let head = match resource_id {
        Some(uri) => {
            let id = uri.rsplit('/').next().unwrap_or_default().to_string();
            let complete = state
                .uploads
                .is_complete(&id)
                .map_err(|e| SyncError::NotFound(format!("upload {}: {}", id, e)))?;
            if !complete {
                return Ok(bad_request("referenced upload is incomplete"));
            }
            let payload = state
                .uploads
                .read(&id)
                .map_err(|e| SyncError::Internal(format!("upload {}: {}", id, e)))?;
            let head = state.orchestrator.unpack(auth, spec, &payload).await?;
            let _ = state.uploads.delete(&id);
            head
        }
        None => state.orchestrator.unpack(auth, spec, body).await?,
    };

    Ok(json_ok(json!({ "api:repository_head": head.to_hex() })))
}

async fn handle_fetch(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, SyncError> {
    let body = match body_json(body) {
        Ok(v) => v,
        Err(resp) => return Ok(resp),
    };
    let remote_name = resolve_remote_name(state, auth, spec, &body).await?;
    let url = remote_url(state, auth, spec, &remote_name).await?;
    let transport = transport_for_url(
        &url,
        state.orchestrator.registry(),
        state.service_token.clone(),
        state.tus_threshold,
    )?;

    let outcome = state
        .orchestrator
        .fetch(auth, spec, &remote_name, transport.as_ref())
        .await?;
    Ok(json_ok(json!({
        "api:head_has_updated": outcome.head_advanced,
        "api:head": outcome.head.map(|h| h.to_hex()),
    })))
}

async fn handle_push(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, SyncError> {
    let body = match body_json(body) {
        Ok(v) => v,
        Err(resp) => return Ok(resp),
    };
    let remote_name = str_field(&body, "remote_name").unwrap_or("origin").to_string();
    let branch = str_field(&body, "branch").unwrap_or("main").to_string();
    let url = remote_url(state, auth, spec, &remote_name).await?;
    let transport = transport_for_url(
        &url,
        state.orchestrator.registry(),
        state.service_token.clone(),
        state.tus_threshold,
    )?;

    let result = state
        .orchestrator
        .push(auth, spec, &branch, &remote_name, transport.as_ref())
        .await?;
    let envelope = match result {
        PushResult::New(head) => json!({
            "api:push_status": "api:new",
            "api:repository_head": head.to_hex(),
        }),
        PushResult::Same(head) => json!({
            "api:push_status": "api:same",
            "api:repository_head": head.map(|h| h.to_hex()),
        }),
    };
    Ok(json_ok(envelope))
}

async fn handle_pull(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    local_branch: &str,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, SyncError> {
    let body = match body_json(body) {
        Ok(v) => v,
        Err(resp) => return Ok(resp),
    };
    let remote_name = str_field(&body, "remote_name").unwrap_or("origin").to_string();
    let remote_branch = str_field(&body, "remote_branch")
        .unwrap_or(local_branch)
        .to_string();
    let url = remote_url(state, auth, spec, &remote_name).await?;
    let transport = transport_for_url(
        &url,
        state.orchestrator.registry(),
        state.service_token.clone(),
        state.tus_threshold,
    )?;

    let report = state
        .orchestrator
        .pull(
            auth,
            spec,
            local_branch,
            &remote_name,
            &remote_branch,
            transport.as_ref(),
        )
        .await?;
    Ok(json_ok(pull_envelope(&report.outcome)))
}

async fn handle_clone(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, SyncError> {
    let body = match body_json(body) {
        Ok(v) => v,
        Err(resp) => return Ok(resp),
    };
    let Some(remote_url) = str_field(&body, "remote_url") else {
        return Ok(bad_request("clone requires remote_url"));
    };
    let label = str_field(&body, "label").unwrap_or(&spec.db).to_string();
    let comment = str_field(&body, "comment").unwrap_or("").to_string();
    let public = body.get("public").and_then(|v| v.as_bool()).unwrap_or(false);
    let transport = transport_for_url(
        remote_url,
        state.orchestrator.registry(),
        state.service_token.clone(),
        state.tus_threshold,
    )?;

    let report = state
        .orchestrator
        .clone_db(auth, spec, &label, &comment, public, remote_url, transport.as_ref())
        .await?;
    Ok(json_ok(json!({
        "api:applied_commits": report
            .applied_commits
            .iter()
            .map(|c| c.to_hex())
            .collect::<Vec<_>>(),
    })))
}

async fn handle_bundle(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, SyncError> {
    let body = match body_json(body) {
        Ok(v) => v,
        Err(resp) => return Ok(resp),
    };
    let branch = str_field(&body, "branch");
    match state.orchestrator.bundle(auth, spec, branch).await? {
        Some(payload) => Ok(octets(payload)),
        None => Ok(no_content()),
    }
}

async fn handle_unbundle(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, SyncError> {
    if body.is_empty() {
        return Ok(bad_request("unbundle requires a payload body"));
    }
    let report = state
        .orchestrator
        .unbundle(auth, spec, Bytes::from(body.to_vec()))
        .await?;
    Ok(json_ok(pull_envelope(&report.outcome)))
}

fn pull_envelope(outcome: &PullOutcome) -> Value {
    let (status, applied, common) = match outcome {
        PullOutcome::Unchanged => ("api:pull_unchanged", Vec::new(), None),
        PullOutcome::FastForwarded(ids) => (
            "api:pull_fast_forwarded",
            ids.iter().map(|c| c.to_hex()).collect(),
            None,
        ),
        PullOutcome::Ahead => ("api:pull_ahead", Vec::new(), None),
        PullOutcome::DivergentHistory(common) => (
            "api:pull_divergent_history",
            Vec::new(),
            common.map(|c| c.to_hex()),
        ),
        PullOutcome::NoCommonHistory => ("api:pull_no_common_history", Vec::new(), None),
    };
    json!({
        "api:pull_status": status,
        "api:applied_commits": applied,
        "api:common_commit": common,
    })
}

/// Resolve the remote named in a fetch body, accepting either `remote_name`
/// or a `remote_url` matching a registered remote.
async fn resolve_remote_name(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    body: &Value,
) -> Result<String, SyncError> {
    if let Some(name) = str_field(body, "remote_name") {
        return Ok(name.to_string());
    }
    if let Some(url) = str_field(body, "remote_url") {
        let remotes = state.orchestrator.list_remotes(auth, spec).await?;
        return remotes
            .into_iter()
            .find(|(_, remote_url, _)| remote_url == url)
            .map(|(name, _, _)| name)
            .ok_or_else(|| SyncError::NotFound(format!("no remote registered for {}", url)));
    }
    Ok("origin".to_string())
}

async fn remote_url(
    state: &ApiState,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    remote_name: &str,
) -> Result<String, SyncError> {
    let remotes = state.orchestrator.list_remotes(auth, spec).await?;
    remotes
        .into_iter()
        .find(|(name, _, _)| name == remote_name)
        .map(|(_, url, _)| url)
        .ok_or_else(|| SyncError::NotFound(format!("remote {}", remote_name)))
}

// ─────────────────────────────────────────────────────
// TUS endpoints
// ─────────────────────────────────────────────────────

async fn handle_files(
    state: &ApiState,
    method: &str,
    rest: &[&str],
    headers: &RequestHeaders,
    body: &[u8],
) -> Response<Full<Bytes>> {
    match (method, rest) {
        ("POST", []) => {
            let Some(length) = headers.upload_length else {
                return bad_request("TUS creation requires Upload-Length");
            };
            match state.uploads.create(length) {
                Ok(id) => Response::builder()
                    .status(201)
                    .header("Tus-Resumable", TUS_VERSION)
                    .header("Location", format!("/api/files/{}", id))
                    .body(Full::new(Bytes::new()))
                    .expect("static response must build"),
                Err(e) => tus_failure(&e),
            }
        }
        ("HEAD", [id]) => match (state.uploads.offset(id), state.uploads.length(id)) {
            (Ok(offset), Ok(length)) => Response::builder()
                .status(200)
                .header("Tus-Resumable", TUS_VERSION)
                .header("Upload-Offset", offset.to_string())
                .header("Upload-Length", length.to_string())
                .header("Cache-Control", "no-store")
                .body(Full::new(Bytes::new()))
                .expect("static response must build"),
            _ => tus_failure(&TusError::NotFound),
        },
        ("PATCH", [id]) => {
            let Some(offset) = headers.upload_offset else {
                return bad_request("TUS patch requires Upload-Offset");
            };
            match state.uploads.patch(id, offset, body) {
                Ok(new_offset) => Response::builder()
                    .status(204)
                    .header("Tus-Resumable", TUS_VERSION)
                    .header("Upload-Offset", new_offset.to_string())
                    .body(Full::new(Bytes::new()))
                    .expect("static response must build"),
                Err(e) => tus_failure(&e),
            }
        }
        ("DELETE", [id]) => match state.uploads.delete(id) {
            Ok(()) => no_content(),
            Err(e) => tus_failure(&e),
        },
        _ => json_failure(&SyncError::NotFound("no such TUS endpoint".into())),
    }
}

fn tus_failure(err: &TusError) -> Response<Full<Bytes>> {
    let status = match err {
        TusError::NotFound => 404,
        TusError::OffsetMismatch { .. } => 409,
        TusError::LengthExceeded => 400,
        TusError::Io(_) => 500,
    };
    let body = json!({
        "api:status": "api:failure",
        "api:message": err.to_string(),
    });
    response(status, "application/json", body.to_string().into_bytes())
}
