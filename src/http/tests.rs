use std::{net::SocketAddr, time::Duration};

use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use super::*;
use crate::{
    join::tests::{CLUSTER_TOKEN, Fixture, JOINER_IP, LOCAL_IP, fixture, issue_second_token},
    node_state::BackendMode,
};

fn app(f: Fixture, peer: &str) -> (axum::Router, Fixture) {
    app_with_timeout(f, peer, Duration::from_secs(30))
}

fn app_with_timeout(f: Fixture, peer: &str, join_timeout: Duration) -> (axum::Router, Fixture) {
    let state = AppState {
        negotiator: f.negotiator.clone(),
        join_timeout,
    };
    let peer: SocketAddr = format!("{peer}:40000").parse().unwrap();
    (build_router(state).layer(MockConnectInfo(peer)), f)
}

fn join_req(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::HOST, format!("{LOCAL_IP}:25000"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn join_body(worker: bool) -> Value {
    json!({
        "token": CLUSTER_TOKEN,
        "hostname": "node-2",
        "port": 25000,
        "worker": worker,
    })
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn replicated_store_join_returns_member_bundle() {
    let (app, f) = app(fixture(BackendMode::Dqlite), JOINER_IP);
    let res = app
        .oneshot(join_req(JOIN_PATH, join_body(false)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body = body_json(res).await;
    assert_eq!(body["ca"], "CA CERT");
    assert_eq!(body["apiport"], "16443");
    assert_eq!(body["api_authz_mode"], "RBAC,Node");
    assert_eq!(body["voters"], json!([format!("{LOCAL_IP}:19001")]));
    assert_eq!(body["cluster_cert"], "CLUSTER CERT");
    assert_eq!(body["hostname_override"], Value::Null);
    assert_eq!(f.daemon.restarts.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn worker_join_returns_control_plane_nodes() {
    let (app, _f) = app(fixture(BackendMode::Dqlite), JOINER_IP);
    let res = app
        .oneshot(join_req(JOIN_PATH, join_body(true)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body = body_json(res).await;
    assert_eq!(body["control_plane_nodes"], json!([LOCAL_IP]));
    assert!(body.get("ca_key").is_none());
    assert!(body.get("admin_token").is_none());
}

#[tokio::test]
async fn bad_token_is_unauthorized() {
    let (app, _f) = app(fixture(BackendMode::Dqlite), JOINER_IP);
    let mut body = join_body(false);
    body["token"] = json!("not-a-valid-token-000000000000000");
    let res = app.oneshot(join_req(JOIN_PATH, body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(res).await;
    assert_eq!(body["code"], "invalid_token");
    assert!(body["error"].as_str().unwrap().contains("cluster token"));
}

#[tokio::test]
async fn wrong_protocol_is_bad_request() {
    let (app, _f) = app(fixture(BackendMode::Dqlite), JOINER_IP);
    let res = app
        .oneshot(join_req(ETCD_JOIN_PATH, join_body(false)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(res).await["code"], "backend_mismatch");
}

#[tokio::test]
async fn self_join_uses_transport_peer_address() {
    let (app, _f) = app(fixture(BackendMode::Dqlite), LOCAL_IP);
    let res = app
        .oneshot(join_req(JOIN_PATH, join_body(false)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(res).await["code"], "self_join");
}

#[tokio::test]
async fn known_member_is_conflict() {
    let f = fixture(BackendMode::Etcd);
    crate::node_state::write_atomic(
        &f.paths.service_args("kube-apiserver"),
        format!("--etcd-servers=https://{LOCAL_IP}:12379,https://{JOINER_IP}:12379\n").as_bytes(),
    )
    .unwrap();
    let (app, _f) = app(f, JOINER_IP);
    let res = app
        .oneshot(join_req(ETCD_JOIN_PATH, join_body(false)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(res).await["code"], "already_member");
}

#[tokio::test]
async fn elapsed_join_timeout_is_service_unavailable() {
    let f = fixture(BackendMode::Dqlite);
    let (app, _f) = app_with_timeout(f, JOINER_IP, Duration::from_nanos(1));
    let res = app
        .oneshot(join_req(JOIN_PATH, join_body(false)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(res).await["code"], "join_timeout");
}

#[tokio::test]
async fn join_blocked_on_membership_lock_fails_at_deadline() {
    let f = fixture(BackendMode::Dqlite);
    let (blocked, f) = app_with_timeout(f, JOINER_IP, Duration::from_millis(100));

    let guard = f.membership.lock().await;
    let res = blocked
        .oneshot(join_req(JOIN_PATH, join_body(false)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(res).await["code"], "join_timeout");
    assert_eq!(f.daemon.restarts.load(std::sync::atomic::Ordering::SeqCst), 0);
    drop(guard);

    let second_token = "zyxwvutsrqponmlkjihgfedcba543210";
    issue_second_token(&f.paths, second_token);
    let mut body = join_body(false);
    body["token"] = json!(second_token);
    let (app, f) = app(f, JOINER_IP);
    let res = app.oneshot(join_req(JOIN_PATH, body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(f.daemon.restarts.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_body_is_invalid_request() {
    let (app, _f) = app(fixture(BackendMode::Dqlite), JOINER_IP);
    let res = app
        .oneshot(join_req(JOIN_PATH, json!({"hostname": "node-2"})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(res).await["code"], "invalid_request");
}

#[tokio::test]
async fn missing_host_header_is_invalid_request() {
    let (app, _f) = app(fixture(BackendMode::Dqlite), JOINER_IP);
    let req = Request::builder()
        .method("POST")
        .uri(JOIN_PATH)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(join_body(false).to_string()))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(res).await["code"], "invalid_request");
}

#[tokio::test]
async fn health_reports_backend_and_version() {
    let (app, _f) = app(fixture(BackendMode::Dqlite), JOINER_IP);
    let req = Request::builder()
        .uri(HEALTH_PATH)
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "dqlite");
    assert_eq!(body["version"], crate::version::VERSION);
}
