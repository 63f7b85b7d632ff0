//! End-to-end API scenarios over the in-memory store and mock adapters

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use sandbox_daemon::auth::AuthVerifier;
use sandbox_daemon::cloud::ObjectStorageIam;
use sandbox_daemon::config::Configuration;
use sandbox_daemon::db::{MemoryStore, Store};
use sandbox_daemon::docker::ContainerRuntime;
use sandbox_daemon::lifecycle::LifecycleController;
use sandbox_daemon::registry::ImageRegistry;
use sandbox_daemon::router::{build_router, AppState};
use sandbox_daemon::snapshot::SnapshotEngine;
use sandbox_daemon::tenant::TenantProvisioner;
use sandbox_daemon::testing::{MockRegistry, MockRuntime, MockStorageIam};

const INTERNAL_SECRET: &str = "internal-test-secret";

struct TestApp {
    app: Router,
    store: Arc<MemoryStore>,
    runtime: Arc<MockRuntime>,
    storage: Arc<MockStorageIam>,
    _credentials: tempfile::NamedTempFile,
}

fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let runtime = MockRuntime::shared();
    let storage = MockStorageIam::shared();
    let registry = MockRegistry::shared();

    let credentials = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(credentials.path(), "{\"type\":\"service_account\"}").unwrap();

    let mut config = Configuration::from_env();
    config.auth.internal_secret = Some(INTERNAL_SECRET.to_string());
    config.network.host_ip = "10.0.0.5".to_string();
    let config = Arc::new(config);

    let snapshots = SnapshotEngine::new(
        runtime.clone(),
        registry.clone(),
        &config.sandbox.registry_root,
        credentials.path().to_str().unwrap(),
    );
    let provisioner = TenantProvisioner::new(
        store.clone() as Arc<dyn Store>,
        storage.clone() as Arc<dyn ObjectStorageIam>,
        &config.tenant.gcp_project,
    );
    let controller = Arc::new(LifecycleController::new(
        store.clone() as Arc<dyn Store>,
        runtime.clone() as Arc<dyn ContainerRuntime>,
        storage.clone() as Arc<dyn ObjectStorageIam>,
        registry.clone() as Arc<dyn ImageRegistry>,
        snapshots,
        provisioner,
        config.clone(),
    ));
    let auth = Arc::new(AuthVerifier::new(
        &config.auth.jwt_secret,
        store.clone() as Arc<dyn Store>,
    ));

    let app = build_router(AppState {
        controller,
        auth,
        config,
    });

    TestApp {
        app,
        store,
        runtime,
        storage,
        _credentials: credentials,
    }
}

async fn request(app: &Router, builder: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(builder).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn authed_json(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn register_and_login(app: &Router, email: &str) -> (String, String) {
    let (status, _) = request(
        app,
        post_json("/auth/register", json!({"email": email, "password": "P@ss1234!"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = request(
        app,
        post_json("/auth/login", json!({"email": email, "password": "P@ss1234!"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    (
        body["access_token"].as_str().unwrap().to_string(),
        body["refresh_token"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn register_login_and_rotate_refresh_token() {
    let t = test_app();

    let (status, body) = request(
        &t.app,
        post_json("/auth/register", json!({"email": "a@ex.com", "password": "P@ss1234!"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["user_id"].as_str().is_some());

    // Duplicate email conflicts
    let (status, _) = request(
        &t.app,
        post_json("/auth/register", json!({"email": "a@ex.com", "password": "other"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = request(
        &t.app,
        post_json("/auth/login", json!({"email": "a@ex.com", "password": "P@ss1234!"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Access token is a compact JWS; refresh token is opaque
    let access = body["access_token"].as_str().unwrap();
    let refresh = body["refresh_token"].as_str().unwrap();
    assert_eq!(access.matches('.').count(), 2);
    assert_eq!(refresh.matches('.').count(), 0);

    // Wrong password is rejected
    let (status, _) = request(
        &t.app,
        post_json("/auth/login", json!({"email": "a@ex.com", "password": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Refresh rotates: the new pair works, the consumed token does not
    let (status, rotated) = request(
        &t.app,
        post_json("/auth/refresh", json!({"refresh_token": refresh})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(rotated["access_token"].as_str().is_some());

    let (status, _) = request(
        &t.app,
        post_json("/auth/refresh", json!({"refresh_token": refresh})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_project_returns_running_detail() {
    let t = test_app();
    t.runtime.set_container_id("C1");
    t.runtime.set_port(30001);

    let (access, _) = register_and_login(&t.app, "a@ex.com").await;

    let (status, body) = request(
        &t.app,
        authed_json("POST", "/projects", &access, json!({"name": "X"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "running");
    assert_eq!(body["name"], "X");
    assert_eq!(body["ssh_port"], 30001);
    assert_eq!(body["ssh_user"], "agent");
    assert_eq!(body["ssh_host"], "10.0.0.5");
    let terminal_url = body["terminal_url"].as_str().unwrap();
    assert!(terminal_url.starts_with("ws://10.0.0.5:"));
    assert!(terminal_url.contains("/terminal/"));
    assert!(body["ssh_private_key"].as_str().is_some());
}

#[tokio::test]
async fn second_project_does_not_reprovision_tenant() {
    let t = test_app();
    let (access, _) = register_and_login(&t.app, "a@ex.com").await;

    let (status, _) = request(
        &t.app,
        authed_json("POST", "/projects", &access, json!({"name": "first"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    t.storage.clear_calls();

    let (status, _) = request(
        &t.app,
        authed_json("POST", "/projects", &access, json!({"name": "second"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    assert!(!t.storage.called("create_bucket"));
    assert!(!t.storage.called("create_identity"));
    assert!(!t.storage.called("create_credential"));
}

#[tokio::test]
async fn failed_create_persists_error_and_keeps_tenant() {
    let t = test_app();
    t.runtime.set_fail_run(true);

    let (access, _) = register_and_login(&t.app, "a@ex.com").await;

    let (status, _) = request(
        &t.app,
        authed_json("POST", "/projects", &access, json!({"name": "X"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    // The row persists in error status
    let (status, list) = request(&t.app, authed("GET", "/projects", &access)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["status"], "error");

    // Tenant material survives the failure
    assert!(!t.storage.called("delete_bucket"));
    assert!(!t.storage.called("delete_identity"));
}

#[tokio::test]
async fn foreign_projects_are_indistinguishable_from_missing() {
    let t = test_app();
    let (owner, _) = register_and_login(&t.app, "owner@ex.com").await;
    let (other, _) = register_and_login(&t.app, "other@ex.com").await;

    let (_, body) = request(
        &t.app,
        authed_json("POST", "/projects", &owner, json!({"name": "X"})),
    )
    .await;
    let project_id = body["id"].as_str().unwrap().to_string();

    for (method, uri) in [
        ("GET", format!("/projects/{}", project_id)),
        ("POST", format!("/projects/{}/stop", project_id)),
        ("POST", format!("/projects/{}/start", project_id)),
        ("DELETE", format!("/projects/{}", project_id)),
        ("GET", format!("/projects/{}/backup-status", project_id)),
    ] {
        let (status, _) = request(&t.app, authed(method, &uri, &other)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
    }

    // The other user's listing stays empty regardless of owner activity
    let (_, list) = request(&t.app, authed("GET", "/projects", &other)).await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn stop_snapshot_restore_cycle() {
    let t = test_app();
    let (access, _) = register_and_login(&t.app, "a@ex.com").await;

    let (_, body) = request(
        &t.app,
        authed_json("POST", "/projects", &access, json!({"name": "X"})),
    )
    .await;
    let project_id = body["id"].as_str().unwrap().to_string();

    let (status, stopped) = request(
        &t.app,
        authed("POST", &format!("/projects/{}/stop", project_id), &access),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], "stopped");
    assert!(stopped["last_backup_at"].as_str().is_some());
    assert!(stopped["terminal_url"].is_null());
    assert!(stopped["ssh_port"].is_null());

    // Stop only applies to running projects
    let (status, _) = request(
        &t.app,
        authed("POST", &format!("/projects/{}/stop", project_id), &access),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = request(
        &t.app,
        authed("GET", &format!("/projects/{}/backup-status", project_id), &access),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["snapshot_image"].as_str().unwrap().ends_with(":latest"));
    assert!(body["last_snapshot_at"].as_str().is_some());

    // Restore is an alias of start
    let (status, restored) = request(
        &t.app,
        authed("POST", &format!("/projects/{}/restore", project_id), &access),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restored["status"], "running");
    assert!(restored["ssh_port"].as_i64().is_some());

    let (status, deleted) = request(
        &t.app,
        authed("DELETE", &format!("/projects/{}", project_id), &access),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["status"], "deleted");

    let (status, _) = request(
        &t.app,
        authed("GET", &format!("/projects/{}", project_id), &access),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn internal_validate_requires_secret_and_binds_project() {
    let t = test_app();
    let (access, _) = register_and_login(&t.app, "a@ex.com").await;

    let (_, body) = request(
        &t.app,
        authed_json("POST", "/projects", &access, json!({"name": "X"})),
    )
    .await;
    let project_id = body["id"].as_str().unwrap().to_string();

    // No secret header: the route does not exist as far as callers know
    let (status, _) = request(
        &t.app,
        post_json(
            "/internal/validate",
            json!({"token": access, "project_id": project_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // With the secret and a valid token: the owner comes back and the
    // connection instant is recorded
    let with_secret = |token: &str| {
        Request::builder()
            .method("POST")
            .uri("/internal/validate")
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-Internal-Secret", INTERNAL_SECRET)
            .body(Body::from(
                serde_json::to_vec(&json!({"token": token, "project_id": project_id})).unwrap(),
            ))
            .unwrap()
    };

    let (status, body) = request(&t.app, with_secret(&access)).await;
    assert_eq!(status, StatusCode::OK);
    let user_id = body["user_id"].as_str().unwrap();

    let project = t
        .store
        .get_project(project_id.parse().unwrap())
        .unwrap();
    assert_eq!(project.user_id.to_string(), user_id);
    assert!(project.last_connection_at.is_some());

    // Garbage token: unauthorized
    let (status, _) = request(&t.app, with_secret("not.a.token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bearer_auth_is_required_for_project_routes() {
    let t = test_app();

    let unauthenticated = Request::builder()
        .method("GET")
        .uri("/projects")
        .body(Body::empty())
        .unwrap();
    let (status, _) = request(&t.app, unauthenticated).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = request(&t.app, authed("GET", "/projects", "bogus.token.here")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_endpoint_is_public() {
    let t = test_app();
    let (status, body) = request(
        &t.app,
        Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
