//! Integration tests for the CDP connection manager and cookie bridge,
//! driven against a mock Chrome WebSocket endpoint.

mod mock_chrome;

use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;

use mock_chrome::MockChrome;
use tabfleet::cdp::{
    CdpConfig, CdpConnection, CdpError, ConnectionEvent, ConnectionState, CookieBridge,
};

fn test_config() -> CdpConfig {
    CdpConfig {
        verify_ttl: Duration::from_secs(10),
        probe_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_millis(500),
        // Effectively disabled unless a test spawns the heartbeat.
        heartbeat_interval: Duration::from_millis(100),
        max_reconnect_attempts: 3,
        reconnect_initial_backoff: Duration::from_millis(20),
        reconnect_max_backoff: Duration::from_millis(100),
        ..CdpConfig::default()
    }
}

async fn connected(mock: &MockChrome, config: CdpConfig) -> CdpConnection {
    let conn = CdpConnection::with_ws_url(&mock.ws_url(), config);
    conn.connect().await.unwrap();
    conn
}

// =============================================================================
// Connect / coalescing
// =============================================================================

#[tokio::test]
async fn connect_transitions_to_connected() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock, test_config()).await;
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(conn.last_verified().is_some());
    assert_eq!(mock.calls("Target.setDiscoverTargets"), 1);
}

#[tokio::test]
async fn concurrent_connects_share_one_attach() {
    let mock = MockChrome::start().await;
    let conn = CdpConnection::with_ws_url(&mock.ws_url(), test_config());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move { conn.connect().await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(mock.connection_count(), 1);
    assert_eq!(mock.calls("Target.setDiscoverTargets"), 1);
}

#[tokio::test]
async fn fresh_connection_skips_the_probe() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock, test_config()).await;

    // Well within verify_ttl: no probe traffic.
    conn.connect().await.unwrap();
    conn.connect().await.unwrap();
    assert_eq!(mock.calls("Browser.getVersion"), 0);
}

#[tokio::test]
async fn stale_connection_probes_before_returning() {
    let mock = MockChrome::start().await;
    let config = CdpConfig {
        verify_ttl: Duration::from_millis(50),
        ..test_config()
    };
    let conn = connected(&mock, config).await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    conn.connect().await.unwrap();
    assert_eq!(mock.calls("Browser.getVersion"), 1);
    // And the verification is fresh again.
    conn.connect().await.unwrap();
    assert_eq!(mock.calls("Browser.getVersion"), 1);
}

#[tokio::test]
async fn connect_times_out_against_a_stalled_endpoint() {
    // Accepts TCP but never completes the WebSocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = CdpConfig {
        connect_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let conn = CdpConnection::with_ws_url(&format!("ws://{addr}"), config);
    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, CdpError::ConnectTimeout));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

// =============================================================================
// Commands and attachment
// =============================================================================

#[tokio::test]
async fn send_attaches_once_per_target() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock, test_config()).await;

    conn.send("T1", "Page.navigate", Some(json!({ "url": "https://a.test/" })))
        .await
        .unwrap();
    conn.send("T1", "Page.navigate", Some(json!({ "url": "https://b.test/" })))
        .await
        .unwrap();

    assert_eq!(mock.calls("Target.attachToTarget"), 1);
    assert_eq!(conn.attached_count(), 1);
}

#[tokio::test]
async fn silent_method_times_out() {
    let mock = MockChrome::start().await;
    mock.set_silent("Page.navigate");
    let conn = connected(&mock, test_config()).await;

    let err = conn
        .send("T1", "Page.navigate", Some(json!({ "url": "https://x.test/" })))
        .await
        .unwrap_err();
    assert!(matches!(err, CdpError::CommandTimeout { method } if method == "Page.navigate"));
}

#[tokio::test]
async fn create_page_applies_default_viewport() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock, test_config()).await;

    let page = conn.create_page(None, None, true).await.unwrap();
    assert!(!page.target_id().is_empty());

    let viewports = mock.call_params("Emulation.setDeviceMetricsOverride");
    assert_eq!(viewports.len(), 1);
    assert_eq!(viewports[0]["width"], 1920);
    assert_eq!(viewports[0]["height"], 1080);
    // skip_cookie_bridge: no target scan happened.
    assert_eq!(mock.calls("Target.getTargets"), 0);
}

// =============================================================================
// Reconnection
// =============================================================================

#[tokio::test]
async fn force_reconnect_discards_socket_state() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock, test_config()).await;

    conn.send("T1", "Page.navigate", Some(json!({ "url": "https://a.test/" })))
        .await
        .unwrap();
    assert_eq!(conn.attached_count(), 1);

    conn.force_reconnect().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    // Attachment map bound to the old socket is gone.
    assert_eq!(conn.attached_count(), 0);
    assert_eq!(conn.cookie_bridge().in_flight_len(), 0);
    assert_eq!(mock.connection_count(), 2);

    // Commands transparently re-attach on the new socket.
    conn.send("T1", "Page.navigate", Some(json!({ "url": "https://b.test/" })))
        .await
        .unwrap();
    assert_eq!(mock.calls("Target.attachToTarget"), 2);
}

#[tokio::test]
async fn dropped_socket_triggers_automatic_reconnect() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock, test_config()).await;
    let mut events = conn.events();

    mock.drop_connections();

    // Disconnected → Reconnecting → Connected, in order.
    let mut seen = Vec::new();
    while seen.len() < 3 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(event)) => seen.push(event),
            _ => break,
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionEvent::Disconnected,
            ConnectionEvent::Reconnecting,
            ConnectionEvent::Connected,
        ]
    );
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(mock.connection_count() >= 2);
}

#[tokio::test]
async fn heartbeat_probe_failure_forces_reconnect() {
    let mock = MockChrome::start().await;
    let config = CdpConfig {
        verify_ttl: Duration::from_millis(10),
        probe_timeout: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(100),
        ..test_config()
    };
    let conn = connected(&mock, config).await;
    let mut events = conn.events();

    conn.start_heartbeat();
    // Future probes go unanswered; the heartbeat must reconnect.
    mock.set_silent("Browser.getVersion");

    let mut reconnecting_seen = false;
    for _ in 0..5 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ConnectionEvent::Reconnecting)) => {
                reconnecting_seen = true;
                break;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert!(reconnecting_seen, "heartbeat failure should trigger reconnect");
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let config = CdpConfig {
        connect_timeout: Duration::from_millis(200),
        max_reconnect_attempts: 2,
        ..test_config()
    };

    // A port with nothing listening: every attempt is refused.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let conn = CdpConnection::with_ws_url(&format!("ws://127.0.0.1:{dead_port}"), config);
    let mut events = conn.events();

    let err = conn.force_reconnect().await.unwrap_err();
    assert!(matches!(err, CdpError::ReconnectFailed { attempts: 2, .. }));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let mut saw_failure = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        if event == ConnectionEvent::ReconnectFailed {
            saw_failure = true;
            break;
        }
    }
    assert!(saw_failure);
}

// =============================================================================
// Cookie bridge
// =============================================================================

fn auth_cookies() -> serde_json::Value {
    json!([{
        "name": "sid",
        "value": "secret",
        "domain": ".shop.test",
        "path": "/",
        "secure": true,
        "httpOnly": true,
        "session": true,
        "size": 9
    }])
}

#[tokio::test]
async fn authenticated_target_is_found_and_cached() {
    let mock = MockChrome::start().await;
    mock.add_target("AUTH", "https://app.shop.test/account");
    mock.set_cookies("AUTH", auth_cookies());
    let conn = connected(&mock, test_config()).await;

    let bridge = conn.cookie_bridge();
    let found = bridge
        .find_authenticated_target(&conn, Some("shop.test"))
        .await;
    assert_eq!(found.as_deref(), Some("AUTH"));
    assert_eq!(mock.calls("Target.getTargets"), 1);

    // Source-cache hit: no further CDP traffic.
    let again = bridge
        .find_authenticated_target(&conn, Some("shop.test"))
        .await;
    assert_eq!(again.as_deref(), Some("AUTH"));
    assert_eq!(mock.calls("Target.getTargets"), 1);
}

#[tokio::test]
async fn expired_cookie_cache_reprobes() {
    let mock = MockChrome::start().await;
    mock.add_target("AUTH", "https://app.shop.test/account");
    mock.set_cookies("AUTH", auth_cookies());
    let conn = connected(&mock, test_config()).await;

    let bridge = CookieBridge::with_ttl(Duration::from_millis(50));
    assert!(
        bridge
            .find_authenticated_target(&conn, Some("shop.test"))
            .await
            .is_some()
    );
    assert_eq!(mock.calls("Target.getTargets"), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(
        bridge
            .find_authenticated_target(&conn, Some("shop.test"))
            .await
            .is_some()
    );
    assert_eq!(mock.calls("Target.getTargets"), 2);
}

#[tokio::test]
async fn concurrent_probes_coalesce_per_domain() {
    let mock = MockChrome::start().await;
    mock.add_target("AUTH", "https://app.shop.test/account");
    mock.set_cookies("AUTH", auth_cookies());
    let conn = connected(&mock, test_config()).await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            conn.cookie_bridge()
                .find_authenticated_target(&conn, Some("shop.test"))
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().as_deref(), Some("AUTH"));
    }
    assert_eq!(mock.calls("Target.getTargets"), 1);
}

#[tokio::test]
async fn create_page_bridges_cookies_into_default_context() {
    let mock = MockChrome::start().await;
    mock.add_target("AUTH", "https://app.shop.test/account");
    mock.set_cookies("AUTH", auth_cookies());
    let conn = connected(&mock, test_config()).await;

    let _page = conn
        .create_page(Some("https://shop.test/cart"), None, false)
        .await
        .unwrap();

    let set_calls = mock.call_params("Network.setCookies");
    assert_eq!(set_calls.len(), 1);
    let cookie = &set_calls[0]["cookies"][0];
    assert_eq!(cookie["name"], "sid");
    // Fields setCookies does not accept were stripped.
    assert!(cookie.get("size").is_none());
}

#[tokio::test]
async fn internal_and_auth_pages_are_not_cookie_sources() {
    let mock = MockChrome::start().await;
    mock.add_target("SETTINGS", "chrome://settings");
    mock.add_target("LOGIN", "https://shop.test/login");
    mock.add_target("BLANK", "about:blank");
    let conn = connected(&mock, test_config()).await;

    let found = conn
        .cookie_bridge()
        .find_authenticated_target(&conn, Some("shop.test"))
        .await;
    assert!(found.is_none());
    // None of the filtered candidates was probed for cookies.
    assert_eq!(mock.calls("Network.getAllCookies"), 0);
}

#[tokio::test]
async fn target_destroyed_purges_cookie_caches_and_attachments() {
    let mock = MockChrome::start().await;
    mock.add_target("AUTH", "https://app.shop.test/account");
    mock.set_cookies("AUTH", auth_cookies());
    let conn = connected(&mock, test_config()).await;

    let bridge = conn.cookie_bridge();
    bridge
        .find_authenticated_target(&conn, Some("shop.test"))
        .await
        .unwrap();
    assert_eq!(bridge.source_cache_len(), 1);
    assert_eq!(bridge.data_cache_len(), 1);
    assert!(conn.attached_count() >= 1);

    let mut destroyed = conn.target_destroyed();
    mock.send_event("Target.targetDestroyed", json!({ "targetId": "AUTH" }));
    let pruned = tokio::time::timeout(Duration::from_secs(1), destroyed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pruned, "AUTH");

    assert_eq!(bridge.source_cache_len(), 0);
    assert_eq!(bridge.data_cache_len(), 0);
    assert_eq!(conn.attached_count(), 0);
}
