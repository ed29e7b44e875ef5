//! Driver API driven through the router with a mock runtime.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use devlab_host_agent::api::{create_router, AppState};
use devlab_host_agent::config::PoolConfig;
use devlab_host_agent::driver::MockRuntime;
use devlab_host_agent::pool::PoolManager;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestAgent {
    router: Router,
    runtime: Arc<MockRuntime>,
    logs: TempDir,
}

fn agent(port_count: u16) -> TestAgent {
    let runtime = Arc::new(MockRuntime::new());
    let pool = PoolManager::new(
        "10.0.0.5",
        PoolConfig {
            port_start: 4723,
            port_count,
            startup_timeout: Duration::from_millis(500),
            health_poll_interval: Duration::from_millis(20),
        },
        runtime.clone(),
    )
    .unwrap();
    let logs = TempDir::new().unwrap();
    let state = AppState::new(Arc::new(pool), logs.path().to_path_buf());
    TestAgent {
        router: create_router(state),
        runtime,
        logs,
    }
}

async fn send(agent: &TestAgent, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = agent.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(agent: &TestAgent, request: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send(agent, request).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn start(device_id: &str) -> Request<Body> {
    post(
        "/driver/start",
        json!({"device_id": device_id, "is_android": true, "request_id": format!("req-{device_id}")}),
    )
}

#[tokio::test]
async fn test_start_stop_and_bindings() {
    let agent = agent(5);

    let (status, body) = send_json(&agent, start("R5CR")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_url"], "http://10.0.0.5:4723/wd/hub");

    let (status, body) = send_json(
        &agent,
        Request::get("/driver/bindings").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["host"], "10.0.0.5");
    assert_eq!(
        body["bindings"],
        json!([{"device_id": "R5CR", "port": 4723, "state": "ready"}])
    );

    let (status, body) = send_json(&agent, post("/driver/stop", json!({"device_id": "R5CR"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], true);

    let (status, body) = send_json(&agent, post("/driver/stop", json!({"device_id": "R5CR"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], true);
    assert_eq!(agent.runtime.kills(), 1);
}

#[tokio::test]
async fn test_start_restarts_existing_driver() {
    let agent = agent(5);
    send_json(&agent, start("R5CR")).await;

    let (status, body) = send_json(&agent, start("R5CR")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_url"], "http://10.0.0.5:4724/wd/hub");
    assert_eq!(agent.runtime.launches(), 2);
    assert_eq!(agent.runtime.kills(), 1);
}

#[tokio::test]
async fn test_exhausted_pool_is_service_unavailable() {
    let agent = agent(1);
    let (status, _) = send_json(&agent, start("a")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(&agent, start("b")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "ports_exhausted");
    assert_eq!(body["detail"], "no free ports available in range 4723 - 4723");

    let (_, body) = send_json(
        &agent,
        Request::get("/driver/bindings").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(body["bindings"][0]["device_id"], "a");
}

#[tokio::test]
async fn test_unhealthy_driver_is_service_unavailable() {
    let agent = agent(2);
    agent.runtime.set_healthy(false);

    let (status, body) = send_json(&agent, start("a")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "driver_unhealthy");

    let (_, body) = send_json(&agent, Request::get("/healthz").body(Body::empty()).unwrap()).await;
    assert_eq!(body["available_ports"], 2);
}

#[tokio::test]
async fn test_blank_device_id_is_rejected() {
    let agent = agent(2);
    let (status, _) = send_json(&agent, start(" ")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_log_file_is_served() {
    let agent = agent(2);
    let dir = agent.logs.path().join("R5CR");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("req-1.log"), "driver started\n").unwrap();

    let (status, body) = send(
        &agent,
        Request::get("/driver/logs/R5CR/req-1.log")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"driver started\n");

    let (status, _) = send(
        &agent,
        Request::get("/driver/logs/R5CR/missing.log")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &agent,
        Request::get("/driver/logs/R5CR/..%2F..%2Fsecret")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
