//! HTTP surface of the master, driven through the router without a socket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use devlab_master::allocation::{AllocationCoordinator, Allocator};
use devlab_master::api::create_router;
use devlab_master::config::AllocationConfig;
use devlab_master::hosts::MockDriverControl;
use devlab_master::state::AppState;
use devlab_master::store::{DeviceStore, InMemoryDeviceStore, TeamDirectory};
use devlab_master::usage::InMemoryUsage;
use devlab_model::{headers, Device, DeviceInfo};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    store: Arc<InMemoryDeviceStore>,
    drivers: Arc<MockDriverControl>,
}

fn info(id: &str, manufacturer: &str, is_android: bool) -> DeviceInfo {
    DeviceInfo {
        device_id: id.to_string(),
        sdk_version: "14.1".to_string(),
        model: format!("{manufacturer} X"),
        market_name: None,
        manufacturer: manufacturer.to_string(),
        is_android,
        is_real_device: true,
        browser_version: None,
    }
}

fn test_app(devices: Vec<Device>) -> TestApp {
    let store = Arc::new(InMemoryDeviceStore::with_devices(devices));
    let coordinator = Arc::new(AllocationCoordinator::new(
        store.clone(),
        Arc::new(InMemoryUsage::new()),
    ));
    let drivers = Arc::new(MockDriverControl::new());
    let allocator = Arc::new(Allocator::new(
        coordinator,
        drivers.clone(),
        Arc::new(TeamDirectory::default()),
        AllocationConfig {
            poll_interval: Duration::from_millis(100),
            ..Default::default()
        },
    ));
    TestApp {
        router: create_router(AppState::new(allocator)),
        store,
        drivers,
    }
}

fn pool() -> Vec<Device> {
    let now = Utc::now();
    vec![
        Device::from_info("10.0.0.5", &info("S1", "samsung", true), now),
        Device::from_info("10.0.0.5", &info("P1", "google", true), now),
        Device::from_info("10.0.0.6", &info("I1", "apple", false), now),
    ]
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(headers::REQUEST_ID, "req-api")
        .header(headers::USER, "qa-bot")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = test_app(vec![]);
    for path in ["/healthz", "/livez", "/readyz"] {
        let (status, _) = send(&app, Request::get(path).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK, "{path}");
    }
}

#[tokio::test]
async fn test_allocate_endpoint() {
    let app = test_app(pool());

    let (status, body) = send(
        &app,
        post_json(
            "/v1/devices/allocate?timeout_seconds=2",
            json!({"is_android": true, "brand": "google"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "P1");
    assert_eq!(body["host"], "10.0.0.5");
    assert_eq!(body["session_url"], "http://10.0.0.5:4723/wd/hub");
    assert_eq!(
        body["logs_url"],
        "http://10.0.0.5:5252/driver/logs/P1/req-api.log"
    );

    let device = app.store.find("P1", "10.0.0.5").await.unwrap().unwrap();
    assert_eq!(
        device.allocated_to.and_then(|a| a.user).as_deref(),
        Some("qa-bot")
    );
}

#[tokio::test]
async fn test_allocate_timeout_is_gateway_timeout() {
    let app = test_app(pool());

    let (status, body) = send(
        &app,
        post_json(
            "/v1/devices/allocate?timeout_seconds=1",
            json!({"brand": "nokia"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["code"], "allocation_timeout");
    assert_eq!(body["request_id"], "req-api");
    assert!(body["detail"].as_str().unwrap().contains("brand=nokia"));
}

#[tokio::test]
async fn test_allocate_validation_is_bad_request() {
    let app = test_app(pool());

    let (status, body) = send(
        &app,
        post_json("/v1/devices/allocate", json!({"clear_user_data": true})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn test_blacklisted_device_is_not_allocated() {
    let app = test_app(pool());

    let (status, body) = send(
        &app,
        post_json("/v1/devices/blacklist", json!({"device_ids": ["P1"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    let (status, _) = send(
        &app,
        post_json(
            "/v1/devices/allocate?timeout_seconds=1",
            json!({"brand": "google"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

    let (status, _) = send(
        &app,
        post_json("/v1/devices/whitelist", json!({"device_ids": ["P1"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        post_json(
            "/v1/devices/allocate?timeout_seconds=1",
            json!({"brand": "google"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "P1");
}

#[tokio::test]
async fn test_blacklist_requires_a_restriction() {
    let app = test_app(pool());
    let (status, _) = send(&app, post_json("/v1/devices/blacklist", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unallocate_with_and_without_body() {
    let app = test_app(pool());
    for _ in 0..3 {
        let (status, _) = send(
            &app,
            post_json("/v1/devices/allocate?timeout_seconds=2", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(
        &app,
        post_json("/v1/devices/unallocate", json!({"host": "10.0.0.6"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["id"], "I1");

    let (status, body) = send(
        &app,
        Request::post("/v1/devices/unallocate")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(app.drivers.stopped().await.len(), 3);

    let (status, _) = send(&app, post_json("/v1/devices/unallocate", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unallocate_unreachable_host_reports_partial_release() {
    let app = test_app(pool());
    for _ in 0..3 {
        let (status, _) = send(
            &app,
            post_json("/v1/devices/allocate?timeout_seconds=2", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    app.drivers.set_unreachable("10.0.0.6").await;

    let (status, body) = send(
        &app,
        Request::post("/v1/devices/unallocate")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "host_unreachable");
    assert_eq!(body["retryable"], true);

    let mut released: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["id"].as_str().unwrap())
        .collect();
    released.sort_unstable();
    assert_eq!(released, vec!["P1", "S1"]);

    assert!(app.store.find("S1", "10.0.0.5").await.unwrap().unwrap().free);
    assert!(!app.store.find("I1", "10.0.0.6").await.unwrap().unwrap().free);
}

#[tokio::test]
async fn test_status_update_remove() {
    let app = test_app(pool());

    let (status, body) = send(
        &app,
        post_json(
            "/v1/hosts/10.0.0.5/devices/S1/status",
            json!({"action": "REMOVE"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], true);
    assert!(app.store.find("S1", "10.0.0.5").await.unwrap().is_none());

    let (_, body) = send(
        &app,
        post_json(
            "/v1/hosts/10.0.0.5/devices/S1/status",
            json!({"action": "REMOVE"}),
        ),
    )
    .await;
    assert_eq!(body["updated"], false);
}

#[tokio::test]
async fn test_status_update_free_on_free_device_is_noop() {
    let app = test_app(pool());
    let (status, body) = send(
        &app,
        post_json(
            "/v1/hosts/10.0.0.5/devices/P1/status",
            json!({"action": "FREE"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], false);
}

#[tokio::test]
async fn test_inventory_report() {
    let app = test_app(pool());

    let (status, body) = send(
        &app,
        post_json(
            "/v1/inventory",
            json!({
                "host": "10.0.0.5",
                "android_devices": [
                    {"device_id": "S1", "sdk_version": "14.2", "model": "samsung X",
                     "manufacturer": "samsung", "is_android": true},
                    {"device_id": "N1", "sdk_version": "13", "model": "nokia G",
                     "manufacturer": "nokia", "is_android": true}
                ]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"added": 1, "refreshed": 1, "removed": 1}));
    assert!(app.store.find("P1", "10.0.0.5").await.unwrap().is_none());
    assert_eq!(
        app.store.find("S1", "10.0.0.5").await.unwrap().unwrap().os_version,
        "14.2"
    );

    let (status, body) = send(&app, Request::get("/v1/devices").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_get_device() {
    let app = test_app(pool());

    let (status, body) = send(
        &app,
        Request::get("/v1/devices/10.0.0.6/I1").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_android"], false);

    let (status, body) = send(
        &app,
        Request::get("/v1/devices/10.0.0.6/missing").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "device_not_found");
}

#[tokio::test]
async fn test_grid_match_does_not_claim() {
    let app = test_app(pool());

    let (status, body) = send(
        &app,
        post_json(
            "/v1/grid/match",
            json!({"capability": {"platform": "iOS"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node"]["device_id"], "I1");
    assert_eq!(body["node"]["platform"], "ios");
    assert!(app.store.find("I1", "10.0.0.6").await.unwrap().unwrap().free);

    let (status, body) = send(
        &app,
        post_json(
            "/v1/grid/match",
            json!({"capability": {"platform": "android", "udid": "nope"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["node"].is_null());

    let (status, _) = send(
        &app,
        post_json(
            "/v1/grid/match",
            json!({"capability": {"platform": "windows"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
