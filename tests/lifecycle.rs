//! Lifecycle tests: start, stop, rollback, admission and rotation against
//! real sockets.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{routing::get, Router};
use edge_listener::config::InsecureRequests;
use edge_listener::lifecycle::{LifecycleError, LifecyclePhase, RotationOutcome, StartResult};
use edge_listener::net::{BindError, ListenerSet, ListenerSpec, TlsMaterial};
use edge_listener::{ServerApp, ServerLifecycleManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

fn hello_app() -> ServerApp {
    ServerApp::new(Router::new().route("/", get(|| async { "hello" })))
}

fn fixture_material() -> TlsMaterial {
    TlsMaterial::from_files(common::fixture("cert.pem"), common::fixture("key.pem"))
}

fn addr_of(started: &StartResult, name: &str) -> SocketAddr {
    let port = started.listener(name).unwrap().port().unwrap();
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[tokio::test]
async fn serves_plain_tls_and_domain_socket_then_stops() {
    let socket = common::socket_path("all");
    let listeners = ListenerSet::new()
        .with(ListenerSpec::tcp("http", "127.0.0.1", 0))
        .with(ListenerSpec::tls("https", "127.0.0.1", 0, fixture_material()))
        .with(ListenerSpec::unix("domain-socket", &socket));

    let manager = ServerLifecycleManager::new();
    let started = manager.start(listeners, hello_app()).await.unwrap();
    assert_eq!(started.listeners.len(), 3);

    let http = addr_of(&started, "http");
    let https = addr_of(&started, "https");

    let response = common::http_get(http, "/", &[("Host", "localhost")]).await.unwrap();
    assert_eq!(common::body(&response), "hello");

    let (response, presented) = common::https_get(https, "/").await.unwrap();
    assert_eq!(common::body(&response), "hello");
    assert_eq!(presented, common::fixture_cert_der("cert.pem"));

    let response = common::unix_get(&socket, "/", &[("Host", "localhost")]).await.unwrap();
    assert_eq!(common::body(&response), "hello");

    manager.stop().await.unwrap();
    assert_eq!(manager.phase(), LifecyclePhase::Stopped);
    assert!(TcpStream::connect(http).await.is_err());
    assert!(TcpStream::connect(https).await.is_err());
    assert!(!socket.exists());
}

#[tokio::test]
async fn occupied_tls_port_fails_start_and_rolls_back_plain_listener() {
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tls_port = occupied.local_addr().unwrap().port();
    let plain_port = common::free_port();

    let listeners = ListenerSet::new()
        .with(ListenerSpec::tcp("http", "127.0.0.1", plain_port))
        .with(ListenerSpec::tls("https", "127.0.0.1", tls_port, fixture_material()));

    let manager = ServerLifecycleManager::new();
    let err = manager.start(listeners, hello_app()).await.unwrap_err();

    match &err {
        LifecycleError::Bind(BindError::AddressInUse { port, listeners, .. }) => {
            assert_eq!(*port, tls_port);
            assert_eq!(listeners, &vec!["https".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains(&tls_port.to_string()));
    assert_eq!(manager.phase(), LifecyclePhase::Stopped);
    assert!(manager.current_generation().is_none());

    // The plain listener was bound and must be closed again.
    let rebound = tokio::net::TcpListener::bind(("127.0.0.1", plain_port)).await;
    assert!(rebound.is_ok());
}

#[tokio::test]
async fn bad_tls_material_leaves_no_port_bound() {
    let plain_port = common::free_port();
    let listeners = ListenerSet::new()
        .with(ListenerSpec::tcp("http", "127.0.0.1", plain_port))
        .with(ListenerSpec::tls(
            "https",
            "127.0.0.1",
            0,
            TlsMaterial::from_files("/nonexistent/cert.pem", "/nonexistent/key.pem"),
        ));

    let manager = ServerLifecycleManager::new();
    let err = manager.start(listeners, hello_app()).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Bind(BindError::Tls { ref listener, .. }) if listener == "https"));
    assert!(tokio::net::TcpListener::bind(("127.0.0.1", plain_port)).await.is_ok());
}

#[tokio::test]
async fn concurrent_stops_share_one_shutdown() {
    let manager = ServerLifecycleManager::new();
    let started = manager
        .start(
            ListenerSet::new().with(ListenerSpec::tcp("http", "127.0.0.1", 0)),
            hello_app(),
        )
        .await
        .unwrap();
    let http = addr_of(&started, "http");
    let generation = manager.current_generation().unwrap();

    let stops: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.stop().await })
        })
        .collect();
    for stop in stops {
        stop.await.unwrap().unwrap();
    }

    assert_eq!(manager.phase(), LifecyclePhase::Stopped);
    assert!(TcpStream::connect(http).await.is_err());
    assert_eq!(generation.close_count(), 1);

    manager.stop().await.unwrap();
    assert_eq!(generation.close_count(), 1);
}

#[tokio::test]
async fn start_during_stop_is_rejected_or_waits() {
    let manager = ServerLifecycleManager::new();
    manager
        .start(
            ListenerSet::new().with(ListenerSpec::tcp("http", "127.0.0.1", 0)),
            hello_app(),
        )
        .await
        .unwrap();

    let stopping = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.stop().await })
    };
    let restarted = manager
        .start(
            ListenerSet::new().with(ListenerSpec::tcp("http", "127.0.0.1", 0)),
            hello_app(),
        )
        .await;
    stopping.await.unwrap().unwrap();

    match restarted {
        Err(LifecycleError::AlreadyRunning) | Err(LifecycleError::ShuttingDown) => {}
        // Stop finished first, so this start brought up a new generation.
        Ok(_) => {}
        Err(other) => panic!("unexpected error: {other}"),
    }
    manager.stop().await.unwrap();
    assert_eq!(manager.phase(), LifecyclePhase::Stopped);
}

#[tokio::test]
async fn connection_limit_spares_domain_sockets() {
    let socket = common::socket_path("limit");
    let listeners = ListenerSet::new()
        .with(ListenerSpec::tcp("http", "127.0.0.1", 0))
        .with(ListenerSpec::unix("domain-socket", &socket));

    let manager = ServerLifecycleManager::new();
    let started = manager
        .start(listeners, hello_app().with_connection_limit(Some(1)))
        .await
        .unwrap();
    let http = addr_of(&started, "http");

    // Keep-alive connection holding the only slot.
    let mut held = TcpStream::connect(http).await.unwrap();
    held.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 512];
    assert!(held.read(&mut buf).await.unwrap() > 0);

    let rejected = common::http_get(http, "/", &[("Host", "localhost")]).await;
    assert!(rejected.map(|r| r.is_empty()).unwrap_or(true));

    let response = common::unix_get(&socket, "/", &[("Host", "localhost")]).await.unwrap();
    assert_eq!(common::body(&response), "hello");

    let generation = manager.current_generation().unwrap();
    assert_eq!(generation.admission().active(), 1);
    assert!(generation.admission().rejected() >= 1);

    drop(held);
    manager.stop().await.unwrap();
    assert_eq!(generation.admission().active(), 0);
}

#[tokio::test]
async fn plain_requests_redirect_to_tls_listener() {
    let listeners = ListenerSet::new()
        .with(ListenerSpec::tcp("http", "127.0.0.1", 0))
        .with(ListenerSpec::tls("https", "127.0.0.1", 0, fixture_material()));

    let manager = ServerLifecycleManager::new();
    let started = manager
        .start(listeners, hello_app().with_insecure_requests(InsecureRequests::Redirect))
        .await
        .unwrap();
    let http = addr_of(&started, "http");
    let https_port = started.listener("https").unwrap().port().unwrap();

    let response = common::http_get(http, "/a?b=c", &[("Host", "localhost:8080")]).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 301"));
    assert!(response
        .to_ascii_lowercase()
        .contains(&format!("location: https://localhost:{}/a?b=c", https_port)));

    let (response, _) = common::https_get(addr_of(&started, "https"), "/").await.unwrap();
    assert_eq!(common::body(&response), "hello");

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn certificate_rotation_applies_to_new_handshakes() {
    let listeners = ListenerSet::new().with(ListenerSpec::tls("https", "127.0.0.1", 0, fixture_material()));

    let manager = ServerLifecycleManager::new();
    let started = manager.start(listeners, hello_app()).await.unwrap();
    let https = addr_of(&started, "https");

    let (_, before) = common::https_get(https, "/").await.unwrap();
    assert_eq!(before, common::fixture_cert_der("cert.pem"));

    let rotated = TlsMaterial::from_files(common::fixture("rotated-cert.pem"), common::fixture("rotated-key.pem"));
    let outcome = manager.rotate_certificate("https", rotated.clone()).await.unwrap();
    assert_eq!(outcome, RotationOutcome::Applied);

    let (response, after) = common::https_get(https, "/").await.unwrap();
    assert_eq!(after, common::fixture_cert_der("rotated-cert.pem"));
    assert_eq!(common::body(&response), "hello");

    manager.stop().await.unwrap();
    let outcome = manager.rotate_certificate("https", rotated).await.unwrap();
    assert_eq!(outcome, RotationOutcome::Skipped);
}

#[tokio::test]
async fn rotation_racing_stop_never_fails() {
    let listeners = ListenerSet::new().with(ListenerSpec::tls("https", "127.0.0.1", 0, fixture_material()));
    let manager = ServerLifecycleManager::new();
    manager.start(listeners, hello_app()).await.unwrap();

    let rotations: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.rotate_certificate("https", fixture_material()).await })
        })
        .collect();
    manager.stop().await.unwrap();

    for rotation in rotations {
        let outcome = rotation.await.unwrap().unwrap();
        assert!(matches!(outcome, RotationOutcome::Applied | RotationOutcome::Skipped));
    }
}

#[tokio::test]
async fn reload_tasks_are_closed_by_stop() {
    let listeners = ListenerSet::new().with(
        ListenerSpec::tls("https", "127.0.0.1", 0, fixture_material()).with_reload_period(Duration::from_millis(20)),
    );
    let manager = ServerLifecycleManager::new();
    manager.start(listeners, hello_app()).await.unwrap();

    let generation = manager.current_generation().unwrap();
    assert_eq!(generation.reload_task_count(), 1);

    // Let a few reloads happen.
    tokio::time::sleep(Duration::from_millis(80)).await;

    manager.stop().await.unwrap();
    assert_eq!(generation.reload_task_count(), 0);
    assert!(generation.is_closing());
}

#[tokio::test]
async fn drain_timeout_aborts_stuck_connections() {
    let app = ServerApp::new(Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "late"
        }),
    ))
    .with_drain_timeout(Some(Duration::from_millis(100)));

    let manager = ServerLifecycleManager::new();
    let started = manager
        .start(ListenerSet::new().with(ListenerSpec::tcp("http", "127.0.0.1", 0)), app)
        .await
        .unwrap();
    let http = addr_of(&started, "http");

    let pending = tokio::spawn(async move { common::http_get(http, "/slow", &[("Host", "localhost")]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), manager.stop()).await;
    assert!(matches!(stopped, Ok(Ok(()))));

    let response = pending.await.unwrap();
    assert!(response.map(|r| !r.contains("late")).unwrap_or(true));
}

#[tokio::test]
async fn empty_listener_set_is_rejected() {
    let manager = ServerLifecycleManager::new();
    let err = manager.start(ListenerSet::new(), hello_app()).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NoListeners));
    assert_eq!(manager.phase(), LifecyclePhase::Stopped);
}

#[tokio::test]
async fn management_listener_serves_its_own_router() {
    let listeners = ListenerSet::new()
        .with(ListenerSpec::tcp("http", "127.0.0.1", 0))
        .with(
            ListenerSpec::tcp("management", "127.0.0.1", 0)
                .with_role(edge_listener::net::ListenerRole::Management),
        );
    let app = hello_app().with_management(Router::new().route("/health", get(|| async { "UP" })));

    let manager = ServerLifecycleManager::new();
    let started = manager.start(listeners, app).await.unwrap();

    let response = common::http_get(addr_of(&started, "management"), "/health", &[("Host", "localhost")])
        .await
        .unwrap();
    assert_eq!(common::body(&response), "UP");

    let response = common::http_get(addr_of(&started, "http"), "/health", &[("Host", "localhost")])
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));

    manager.stop().await.unwrap();
    assert!(manager.current_generation().is_none());
}
