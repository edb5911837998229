//! Integration tests for the HTTP API handlers.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use strata_core::{
    AuthContext, DatabaseSpec, GraphKind, OpenAuthProvider, StaticTokenProvider, Triple,
    TripleDelta,
};
use strata_http::handlers::{handle_api_request, RequestHeaders};
use strata_http::{ApiState, Config};
use tempfile::TempDir;

fn open_state(tmp: &TempDir) -> ApiState {
    let config = Config {
        store_root: tmp.path().to_path_buf(),
        ..Config::default()
    };
    ApiState::new(&config, Arc::new(OpenAuthProvider)).unwrap()
}

fn headers() -> RequestHeaders {
    RequestHeaders {
        bearer_token: Some("anything".into()),
        ..Default::default()
    }
}

async fn seed_db(state: &ApiState, org: &str, db: &str, commits: &[&str]) {
    let auth = AuthContext::superuser("seed");
    let spec = DatabaseSpec::new(org, db);
    state
        .orchestrator
        .create_db(&auth, &spec, db, "", false)
        .await
        .unwrap();
    for message in commits {
        state
            .orchestrator
            .commit(
                &auth,
                &spec,
                "main",
                message,
                &[(
                    GraphKind::Instance,
                    TripleDelta::additions(vec![Triple::new("s", *message, "o")]),
                )],
                Some(1000),
            )
            .await
            .unwrap();
    }
}

async fn body_bytes(resp: hyper::Response<Full<Bytes>>) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(resp: hyper::Response<Full<Bytes>>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

#[tokio::test]
async fn test_pack_and_unpack_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);
    seed_db(&state, "hub", "app", &["c1", "c2"]).await;

    let resp = handle_api_request(&state, "POST", "/api/pack/hub/app", &headers(), b"{}").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("Content-Type").unwrap(),
        "application/octets"
    );
    let payload = body_bytes(resp).await;
    assert!(!payload.is_empty());

    // Unpacking a database's own payload back into it is an idempotent no-op.
    let resp =
        handle_api_request(&state, "POST", "/api/unpack/hub/app", &headers(), &payload).await;
    assert_eq!(resp.status(), 200);
    let envelope = body_json(resp).await;
    assert_eq!(envelope["api:status"], "api:success");
    assert!(envelope["api:repository_head"].is_string());
}

#[tokio::test]
async fn test_pack_up_to_date_is_204() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);
    seed_db(&state, "hub", "app", &["c1"]).await;

    // Grab the full payload to learn the head.
    let resp = handle_api_request(&state, "POST", "/api/pack/hub/app", &headers(), b"{}").await;
    let payload = body_bytes(resp).await;
    let (head, _) = strata_core::payload_repository_head_and_pack(&payload).unwrap();

    let body = serde_json::json!({ "repository_head": head.to_hex() }).to_string();
    let resp = handle_api_request(
        &state,
        "POST",
        "/api/pack/hub/app",
        &headers(),
        body.as_bytes(),
    )
    .await;
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn test_clone_fetch_pull_endpoints() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);
    seed_db(&state, "hub", "app", &["c1"]).await;

    let body = serde_json::json!({
        "label": "App",
        "comment": "clone",
        "remote_url": "local:///hub/app",
    })
    .to_string();
    let resp = handle_api_request(
        &state,
        "POST",
        "/api/clone/alice/app",
        &headers(),
        body.as_bytes(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let envelope = body_json(resp).await;
    assert_eq!(envelope["api:applied_commits"].as_array().unwrap().len(), 1);

    // Nothing new on the hub: fetch reports no update, pull is unchanged.
    let resp =
        handle_api_request(&state, "POST", "/api/fetch/alice/app", &headers(), b"{}").await;
    assert_eq!(resp.status(), 200);
    let envelope = body_json(resp).await;
    assert_eq!(envelope["api:head_has_updated"], false);

    let resp = handle_api_request(
        &state,
        "POST",
        "/api/pull/alice/app/local/branch/main",
        &headers(),
        b"{}",
    )
    .await;
    assert_eq!(resp.status(), 200);
    let envelope = body_json(resp).await;
    assert_eq!(envelope["api:pull_status"], "api:pull_unchanged");
}

#[tokio::test]
async fn test_push_endpoint() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);
    seed_db(&state, "hub", "app", &["c1"]).await;

    let body = serde_json::json!({
        "label": "App",
        "remote_url": "local:///hub/app",
    })
    .to_string();
    handle_api_request(
        &state,
        "POST",
        "/api/clone/alice/app",
        &headers(),
        body.as_bytes(),
    )
    .await;

    let auth = AuthContext::superuser("alice");
    state
        .orchestrator
        .commit(
            &auth,
            &DatabaseSpec::new("alice", "app"),
            "main",
            "c2",
            &[(
                GraphKind::Instance,
                TripleDelta::additions(vec![Triple::new("s", "c2", "o")]),
            )],
            Some(2000),
        )
        .await
        .unwrap();

    let body = serde_json::json!({ "remote_name": "origin", "branch": "main" }).to_string();
    let resp = handle_api_request(
        &state,
        "POST",
        "/api/push/alice/app",
        &headers(),
        body.as_bytes(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let envelope = body_json(resp).await;
    assert_eq!(envelope["api:push_status"], "api:new");

    let log = state
        .orchestrator
        .log(&auth, &DatabaseSpec::new("hub", "app"), "main", 10)
        .await
        .unwrap();
    assert_eq!(log[0].message, "c2");
}

#[tokio::test]
async fn test_bundle_unbundle_endpoints() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);
    seed_db(&state, "hub", "app", &["c1", "c2"]).await;
    seed_db(&state, "mirror", "app", &[]).await;

    let resp =
        handle_api_request(&state, "POST", "/api/bundle/hub/app", &headers(), b"{}").await;
    assert_eq!(resp.status(), 200);
    let bundle = body_bytes(resp).await;

    let resp = handle_api_request(
        &state,
        "POST",
        "/api/unbundle/mirror/app",
        &headers(),
        &bundle,
    )
    .await;
    assert_eq!(resp.status(), 200);
    let envelope = body_json(resp).await;
    assert_eq!(envelope["api:pull_status"], "api:pull_fast_forwarded");
    assert_eq!(envelope["api:applied_commits"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_bundle_of_empty_database_is_204() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);
    seed_db(&state, "hub", "empty", &[]).await;

    let resp =
        handle_api_request(&state, "POST", "/api/bundle/hub/empty", &headers(), b"{}").await;
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn test_tus_upload_then_unpack() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);
    seed_db(&state, "hub", "app", &["c1"]).await;

    let resp = handle_api_request(&state, "POST", "/api/pack/hub/app", &headers(), b"{}").await;
    let payload = body_bytes(resp).await;

    // Create the upload.
    let mut create_headers = headers();
    create_headers.upload_length = Some(payload.len() as u64);
    let resp = handle_api_request(&state, "POST", "/api/files", &create_headers, b"").await;
    assert_eq!(resp.status(), 201);
    let location = resp
        .headers()
        .get("Location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Upload in two chunks.
    let mid = payload.len() / 2;
    for (offset, chunk) in [(0usize, &payload[..mid]), (mid, &payload[mid..])] {
        let mut patch_headers = headers();
        patch_headers.upload_offset = Some(offset as u64);
        let resp = handle_api_request(&state, "PATCH", &location, &patch_headers, chunk).await;
        assert_eq!(resp.status(), 204);
    }

    // Probe the offset.
    let resp = handle_api_request(&state, "HEAD", &location, &headers(), b"").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("Upload-Offset").unwrap().to_str().unwrap(),
        payload.len().to_string()
    );

    // Unpack by resource uri.
    let body = serde_json::json!({ "resource_uri": location }).to_string();
    let resp = handle_api_request(
        &state,
        "POST",
        "/api/unpack/hub/app",
        &headers(),
        body.as_bytes(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    // The spool entry is gone once consumed.
    let resp = handle_api_request(&state, "HEAD", &location, &headers(), b"").await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_incomplete_tus_upload_rejected_by_unpack() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);
    seed_db(&state, "hub", "app", &[]).await;

    let mut create_headers = headers();
    create_headers.upload_length = Some(100);
    let resp = handle_api_request(&state, "POST", "/api/files", &create_headers, b"").await;
    let location = resp
        .headers()
        .get("Location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let body = serde_json::json!({ "resource_uri": location }).to_string();
    let resp = handle_api_request(
        &state,
        "POST",
        "/api/unpack/hub/app",
        &headers(),
        body.as_bytes(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_unauthorized_without_valid_token() {
    let tmp = TempDir::new().unwrap();
    let config = Config {
        store_root: tmp.path().to_path_buf(),
        ..Config::default()
    };
    let provider = StaticTokenProvider::parse("s3cret:alice:read,push,commit_write\n").unwrap();
    let state = ApiState::new(&config, Arc::new(provider)).unwrap();

    let resp = handle_api_request(
        &state,
        "POST",
        "/api/pack/hub/app",
        &RequestHeaders::default(),
        b"{}",
    )
    .await;
    assert_eq!(resp.status(), 401);
    let envelope = body_json(resp).await;
    assert_eq!(envelope["api:error_term"], "api:Unauthorized");
}

#[tokio::test]
async fn test_unsupported_protocol_version_rejected() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);

    let mut h = headers();
    h.protocol_version = Some("99".into());
    let resp = handle_api_request(&state, "POST", "/api/pack/hub/app", &h, b"{}").await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_unknown_database_is_404() {
    let tmp = TempDir::new().unwrap();
    let state = open_state(&tmp);

    let resp =
        handle_api_request(&state, "POST", "/api/pack/ghost/app", &headers(), b"{}").await;
    assert_eq!(resp.status(), 404);
    let envelope = body_json(resp).await;
    assert_eq!(envelope["api:status"], "api:failure");
    assert_eq!(envelope["api:error_term"], "api:NotFound");
}
