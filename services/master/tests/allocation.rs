//! Integration tests for the polling allocator.
//!
//! Uses the in-memory store and `MockDriverControl` in place of host agents.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use devlab_master::allocation::{AllocationCoordinator, AllocationError, Allocator, SessionContext};
use devlab_master::config::AllocationConfig;
use devlab_master::hosts::MockDriverControl;
use devlab_master::store::{DeviceStore, InMemoryDeviceStore, TeamDirectory, TeamPool};
use devlab_master::usage::InMemoryUsage;
use devlab_model::{Device, DeviceInfo, DeviceRequest, DeviceRestrictionRequest};

struct Harness {
    store: Arc<InMemoryDeviceStore>,
    usage: Arc<InMemoryUsage>,
    drivers: Arc<MockDriverControl>,
    allocator: Arc<Allocator>,
}

fn test_config() -> AllocationConfig {
    AllocationConfig {
        poll_interval: Duration::from_millis(100),
        default_timeout: Duration::from_secs(5),
        max_timeout: Duration::from_secs(30),
        agent_port: 5252,
    }
}

fn android(id: &str, host: &str, manufacturer: &str, version: &str) -> Device {
    let info = DeviceInfo {
        device_id: id.to_string(),
        sdk_version: version.to_string(),
        model: format!("{manufacturer}-model"),
        market_name: Some(format!("{manufacturer} phone")),
        manufacturer: manufacturer.to_string(),
        is_android: true,
        is_real_device: true,
        browser_version: None,
    };
    Device::from_info(host, &info, Utc::now())
}

fn harness_with(devices: Vec<Device>, drivers: MockDriverControl, teams: TeamDirectory) -> Harness {
    let store = Arc::new(InMemoryDeviceStore::with_devices(devices));
    let usage = Arc::new(InMemoryUsage::new());
    let coordinator = Arc::new(AllocationCoordinator::new(store.clone(), usage.clone()));
    let drivers = Arc::new(drivers);
    let allocator = Arc::new(Allocator::new(
        coordinator,
        drivers.clone(),
        Arc::new(teams),
        test_config(),
    ));
    Harness {
        store,
        usage,
        drivers,
        allocator,
    }
}

fn harness(devices: Vec<Device>) -> Harness {
    harness_with(devices, MockDriverControl::new(), TeamDirectory::default())
}

fn ctx(request_id: &str) -> SessionContext {
    SessionContext {
        request_id: request_id.to_string(),
        user: Some("qa-bot".to_string()),
        requestor_ip: Some("10.1.1.1".to_string()),
        team: None,
        job_link: None,
    }
}

fn by_brand(brand: &str) -> DeviceRequest {
    DeviceRequest {
        brand: Some(brand.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_allocate_returns_session_descriptor() {
    let h = harness(vec![android("R5CR", "10.0.0.5", "samsung", "11.2")]);

    let session = h
        .allocator
        .allocate(by_brand("samsung"), Some(5), ctx("req-1"))
        .await
        .unwrap();

    assert_eq!(session.device_id, "R5CR");
    assert_eq!(session.device_name, "samsung phone");
    assert_eq!(session.host, "10.0.0.5");
    assert_eq!(session.os_version, "11.2");
    assert_eq!(session.session_url, "http://10.0.0.5:4723/wd/hub");
    assert_eq!(
        session.logs_url,
        "http://10.0.0.5:5252/driver/logs/R5CR/req-1.log"
    );

    let device = h.store.find("R5CR", "10.0.0.5").await.unwrap().unwrap();
    assert!(!device.free);
    let holder = device.allocated_to.unwrap();
    assert_eq!(holder.user.as_deref(), Some("qa-bot"));
    assert_eq!(holder.ip.as_deref(), Some("10.1.1.1"));
    assert_eq!(holder.team.as_deref(), Some("common"));

    let started = h.drivers.started().await;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].1.request_id, "req-1");
    assert_eq!(h.usage.summary("common").await.sessions, 1);
}

#[tokio::test]
async fn test_concurrent_requests_for_one_device() {
    let h = harness(vec![android("R5CR", "10.0.0.5", "samsung", "11.2")]);

    let mut handles = Vec::new();
    for i in 0..8 {
        let allocator = Arc::clone(&h.allocator);
        handles.push(tokio::spawn(async move {
            allocator
                .allocate(by_brand("samsung"), Some(1), ctx(&format!("req-{i}")))
                .await
        }));
    }

    let mut successes = 0;
    let mut timeouts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(session) => {
                assert_eq!(session.device_id, "R5CR");
                successes += 1;
            }
            Err(AllocationError::Timeout { .. }) => timeouts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(timeouts, 7);
    assert!(!h.store.find("R5CR", "10.0.0.5").await.unwrap().unwrap().free);
    assert_eq!(h.drivers.started().await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_spread_over_devices() {
    let h = harness(vec![
        android("a", "10.0.0.5", "samsung", "11"),
        android("b", "10.0.0.5", "samsung", "11"),
        android("c", "10.0.0.6", "samsung", "11"),
    ]);

    let mut handles = Vec::new();
    for i in 0..3 {
        let allocator = Arc::clone(&h.allocator);
        handles.push(tokio::spawn(async move {
            allocator
                .allocate(by_brand("samsung"), Some(3), ctx(&format!("req-{i}")))
                .await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().device_id);
    }
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_impossible_request_times_out_on_schedule() {
    let h = harness(vec![android("R5CR", "10.0.0.5", "samsung", "11.2")]);

    let started = Instant::now();
    let err = h
        .allocator
        .allocate(by_brand("nokia"), Some(2), ctx("req-timeout"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match &err {
        AllocationError::Timeout {
            request,
            elapsed_secs,
        } => {
            assert!(request.contains("brand=nokia"));
            assert_eq!(*elapsed_secs, 2);
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert!(err.to_string().contains("even after 2 seconds"));
    assert!(elapsed >= Duration::from_secs(2), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "returned late: {elapsed:?}");
}

#[tokio::test]
async fn test_device_freed_while_polling_is_picked_up() {
    let h = harness(vec![android("R5CR", "10.0.0.5", "samsung", "11.2")]);

    h.allocator
        .allocate(by_brand("samsung"), Some(1), ctx("first"))
        .await
        .unwrap();

    let waiting = tokio::spawn({
        let allocator = Arc::clone(&h.allocator);
        async move {
            allocator
                .allocate(by_brand("samsung"), Some(5), ctx("second"))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let released = h
        .allocator
        .unallocate(None, &SessionContext::system("test"))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);

    let session = waiting.await.unwrap().unwrap();
    assert_eq!(session.device_id, "R5CR");
}

#[tokio::test]
async fn test_validation_fails_before_polling() {
    let h = harness(vec![android("R5CR", "10.0.0.5", "samsung", "11.2")]);

    let request = DeviceRequest {
        clear_user_data: true,
        ..Default::default()
    };
    let started = Instant::now();
    let err = h
        .allocator
        .allocate(request, Some(10), ctx("req-invalid"))
        .await
        .unwrap_err();

    assert!(matches!(err, AllocationError::Validation(_)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(h.store.find("R5CR", "10.0.0.5").await.unwrap().unwrap().free);
}

#[tokio::test]
async fn test_rejected_driver_start_surfaces_and_keeps_device_busy() {
    let drivers = MockDriverControl::new();
    drivers.set_reject_starts(true);
    let h = harness_with(
        vec![android("R5CR", "10.0.0.5", "samsung", "11.2")],
        drivers,
        TeamDirectory::default(),
    );

    let err = h
        .allocator
        .allocate(by_brand("samsung"), Some(5), ctx("req-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, AllocationError::Host(_)));
    assert!(!h.store.find("R5CR", "10.0.0.5").await.unwrap().unwrap().free);
}

#[tokio::test]
async fn test_unreachable_host_is_skipped_for_next_device() {
    let drivers = MockDriverControl::new();
    drivers.set_unreachable("10.0.0.5").await;
    let h = harness_with(
        vec![
            android("a", "10.0.0.5", "samsung", "11"),
            android("b", "10.0.0.6", "samsung", "11"),
        ],
        drivers,
        TeamDirectory::default(),
    );

    let session = h
        .allocator
        .allocate(by_brand("samsung"), Some(5), ctx("req-1"))
        .await
        .unwrap();

    assert_eq!(session.device_id, "b");
    // The device on the dead host stays busy until the reaper removes it.
    assert!(!h.store.find("a", "10.0.0.5").await.unwrap().unwrap().free);
}

#[tokio::test]
async fn test_claim_after_timeout_is_released() {
    let h = harness_with(
        vec![android("R5CR", "10.0.0.5", "samsung", "11.2")],
        MockDriverControl::with_start_delay(Duration::from_millis(1500)),
        TeamDirectory::default(),
    );

    let err = h
        .allocator
        .allocate(by_brand("samsung"), Some(1), ctx("req-slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::Timeout { .. }));

    // Let the poll task finish its driver start and notice it lost.
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let device = h.store.find("R5CR", "10.0.0.5").await.unwrap().unwrap();
    assert!(device.free, "late claim should have been rolled back");
    assert!(device.allocated_to.is_none());
    assert_eq!(
        h.drivers.stopped().await,
        vec![("10.0.0.5".to_string(), "R5CR".to_string())]
    );
}

#[tokio::test]
async fn test_team_request_prefers_team_pool() {
    let teams = TeamDirectory::new(vec![
        TeamPool {
            name: "payments".to_string(),
            android: vec!["p1".to_string()],
            ..Default::default()
        },
        TeamPool {
            name: "search".to_string(),
            android: vec!["s1".to_string()],
            ..Default::default()
        },
    ]);
    let h = harness_with(
        vec![
            android("s1", "10.0.0.5", "samsung", "11"),
            android("x1", "10.0.0.5", "samsung", "11"),
            android("p1", "10.0.0.5", "samsung", "11"),
        ],
        MockDriverControl::new(),
        teams,
    );

    let mut context = ctx("req-team");
    context.team = Some("payments".to_string());
    let session = h
        .allocator
        .allocate(by_brand("samsung"), Some(2), context)
        .await
        .unwrap();
    assert_eq!(session.device_id, "p1");

    let device = h.store.find("p1", "10.0.0.5").await.unwrap().unwrap();
    assert_eq!(device.holder_team(), Some("payments"));
    assert_eq!(h.usage.summary("payments").await.sessions, 1);
}

#[tokio::test]
async fn test_unallocate_requires_a_field_when_restricted() {
    let h = harness(vec![android("R5CR", "10.0.0.5", "samsung", "11.2")]);
    let err = h
        .allocator
        .unallocate(
            Some(&DeviceRestrictionRequest::default()),
            &SessionContext::system("test"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::Validation(_)));
}

#[tokio::test]
async fn test_unallocate_by_host_stops_drivers() {
    let h = harness(vec![
        android("a", "10.0.0.5", "samsung", "11"),
        android("b", "10.0.0.6", "samsung", "11"),
    ]);
    for i in 0..2 {
        h.allocator
            .allocate(by_brand("samsung"), Some(2), ctx(&format!("req-{i}")))
            .await
            .unwrap();
    }

    let restriction = DeviceRestrictionRequest {
        host: Some("10.0.0.6".to_string()),
        ..Default::default()
    };
    let released = h
        .allocator
        .unallocate(Some(&restriction), &SessionContext::system("test"))
        .await
        .unwrap();

    assert_eq!(released.len(), 1);
    assert_eq!(released[0].id, "b");
    assert!(released[0].free);
    assert!(released[0].last_session_duration_ms.is_some());
    assert_eq!(
        h.drivers.stopped().await,
        vec![("10.0.0.6".to_string(), "b".to_string())]
    );
    assert!(!h.store.find("a", "10.0.0.5").await.unwrap().unwrap().free);
}

#[tokio::test]
async fn test_unallocate_releases_around_unreachable_host() {
    let h = harness(vec![
        android("a", "10.0.0.5", "samsung", "11"),
        android("b", "10.0.0.6", "samsung", "11"),
        android("c", "10.0.0.7", "samsung", "11"),
    ]);
    for i in 0..3 {
        h.allocator
            .allocate(by_brand("samsung"), Some(2), ctx(&format!("req-{i}")))
            .await
            .unwrap();
    }
    h.drivers.set_unreachable("10.0.0.6").await;

    let err = h
        .allocator
        .unallocate(None, &SessionContext::system("test"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    let AllocationError::PartialRelease { released, failures } = err else {
        panic!("expected a partial release, got {err:?}");
    };
    let ids: Vec<&str> = released.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].host(), "10.0.0.6");

    assert!(h.store.find("a", "10.0.0.5").await.unwrap().unwrap().free);
    assert!(!h.store.find("b", "10.0.0.6").await.unwrap().unwrap().free);
    assert!(h.store.find("c", "10.0.0.7").await.unwrap().unwrap().free);
    assert_eq!(
        h.drivers.stopped().await,
        vec![
            ("10.0.0.5".to_string(), "a".to_string()),
            ("10.0.0.7".to_string(), "c".to_string()),
        ]
    );
}
