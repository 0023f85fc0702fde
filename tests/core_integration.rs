//! Integration tests for the pool, session manager, screenshot
//! scheduler, workflow engine, and the RPC server loop, all running
//! against the mock Chrome endpoint.

mod mock_chrome;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use mock_chrome::MockChrome;
use tabfleet::cdp::{CdpConfig, CdpConnection};
use tabfleet::dispatch::ToolDispatch;
use tabfleet::error::ServerError;
use tabfleet::policy::DomainPolicy;
use tabfleet::pool::{PagePool, PoolConfig};
use tabfleet::rpc::{Framing, RpcServer};
use tabfleet::screenshot::{ScreenshotOptions, ScreenshotScheduler};
use tabfleet::sessions::{SessionConfig, SessionManager};
use tabfleet::workflow::{WorkerSpec, WorkerStatus, WorkflowEngine};

async fn connected(mock: &MockChrome) -> CdpConnection {
    let conn = CdpConnection::with_ws_url(
        &mock.ws_url(),
        CdpConfig {
            command_timeout: Duration::from_secs(2),
            ..CdpConfig::default()
        },
    );
    conn.connect().await.unwrap();
    conn
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// Page pool
// =============================================================================

#[tokio::test]
async fn pool_prewarm_reuse_and_overflow() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let pool = PagePool::new(
        conn.clone(),
        PoolConfig {
            min_size: 5,
            max_size: 10,
            pre_warm: true,
            ..PoolConfig::default()
        },
    );
    pool.start();
    wait_until("pre-warm to reach 5 pages", || pool.stats().available == 5).await;

    // 15 simultaneous acquires: 5 reused, 10 created on demand.
    let mut handles = Vec::new();
    for _ in 0..15 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.acquire().await.unwrap() }));
    }
    let mut pages = Vec::new();
    for handle in handles {
        pages.push(handle.await.unwrap());
    }

    let ids: HashSet<String> = pages.iter().map(|p| p.target_id().to_owned()).collect();
    assert_eq!(ids.len(), 15, "acquired pages must be unique");

    // 5 pre-warmed pages were reused; the rest came on demand or from
    // replenishment racing the acquires. Either way the sum holds.
    let stats = pool.stats();
    assert_eq!(stats.in_use, 15);
    assert!(stats.reused >= 5, "reused {}", stats.reused);
    assert_eq!(stats.reused + stats.on_demand, 15);

    for page in &pages {
        pool.release(page);
    }
    wait_until("all releases to settle", || pool.stats().in_use == 0).await;

    // Never more than max pooled pages; the rest were closed.
    wait_until("available to settle under max", || {
        pool.stats().available <= 10
    })
    .await;
    pool.run_maintenance().await;
    let stats = pool.stats();
    assert!(stats.available <= 10);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn released_page_is_reset_with_specific_origins() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let pool = PagePool::new(
        conn.clone(),
        PoolConfig {
            max_size: 2,
            ..PoolConfig::default()
        },
    );

    let page = pool.acquire().await.unwrap();
    let target_id = page.target_id().to_owned();
    page.navigate("https://example.com/path").await.unwrap();

    pool.release(&page);
    wait_until("release cleanup to finish", || pool.stats().available == 1).await;

    assert_eq!(mock.url_of(&target_id).as_deref(), Some("about:blank"));
    assert!(mock.calls("Network.clearBrowserCookies") >= 1);

    let clears = mock.call_params("Storage.clearDataForOrigin");
    assert!(!clears.is_empty());
    assert!(clears.iter().any(|c| c["origin"] == "https://example.com"));
    // Wildcard clearing is a silent no-op in Chrome and must never be used.
    assert!(clears.iter().all(|c| c["origin"] != "*"));
}

#[tokio::test]
async fn zero_max_pool_closes_every_release() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let pool = PagePool::new(conn.clone(), PoolConfig::default());

    let page = pool.acquire().await.unwrap();
    pool.release(&page);
    wait_until("page to be closed", || mock.calls("Target.closeTarget") == 1).await;
    assert_eq!(pool.stats().available, 0);
}

#[tokio::test]
async fn batch_acquire_does_not_replenish() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let pool = PagePool::new(
        conn.clone(),
        PoolConfig {
            min_size: 2,
            max_size: 5,
            ..PoolConfig::default()
        },
    );

    let pages = pool.acquire_batch(4).await.unwrap();
    assert_eq!(pages.len(), 4);
    assert_eq!(pool.stats().in_use, 4);

    // No replenishment was scheduled by the batch.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.stats().available, 0);
}

// =============================================================================
// Screenshot scheduler
// =============================================================================

#[tokio::test]
async fn screenshot_concurrency_is_bounded() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    mock.set_capture_delay(Duration::from_millis(100));
    let scheduler = ScreenshotScheduler::new(2);

    let mut pages = Vec::new();
    for _ in 0..4 {
        pages.push(conn.create_page(None, None, true).await.unwrap());
    }

    let started = Instant::now();
    let mut handles = Vec::new();
    for page in pages {
        let scheduler = Arc::clone(&scheduler);
        handles.push(tokio::spawn(async move {
            scheduler
                .capture(&page, &ScreenshotOptions::default())
                .await
                .unwrap()
        }));
    }
    let mut captures = Vec::new();
    for handle in handles {
        captures.push(handle.await.unwrap());
    }
    let elapsed = started.elapsed();

    // 4 captures of ~100ms at concurrency 2: at least two waves.
    assert!(elapsed >= Duration::from_millis(180), "elapsed {elapsed:?}");
    assert!(captures.iter().all(|c| !c.data.is_empty()));
    assert!(captures.iter().all(|c| c.capture_ms >= 90));
    // Someone had to wait for a slot; the first wave did not.
    assert!(captures.iter().any(|c| c.wait_ms >= 50));
    assert!(captures.iter().any(|c| c.wait_ms < 50));
    assert_eq!(scheduler.available_slots(), 2);
}

// =============================================================================
// Session manager
// =============================================================================

#[tokio::test]
async fn sessions_are_isolated_and_tracked() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let manager = SessionManager::new(conn.clone(), SessionConfig::default());

    let a = manager.get_or_create(Some("a")).await.unwrap();
    let b = manager.get_or_create(Some("b")).await.unwrap();
    assert_ne!(a.context_id(), b.context_id());
    assert_eq!(manager.active_count(), 2);

    let tab = manager.create_target("a", None).await.unwrap();
    let page = manager.get_page("a", &tab).unwrap();
    assert_eq!(page.target_id(), tab);

    // The tab belongs to session a only.
    assert!(matches!(
        manager.get_page("b", &tab),
        Err(ServerError::TargetNotFound { .. })
    ));

    manager.delete("a").await.unwrap();
    assert!(matches!(
        manager.get("a"),
        Err(ServerError::SessionNotFound(_))
    ));
    // Context disposal closed the session's tabs.
    assert_eq!(mock.calls("Target.disposeBrowserContext"), 1);
}

#[tokio::test]
async fn idle_sessions_are_cleaned_up_and_touch_resets_the_clock() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let manager = SessionManager::new(conn.clone(), SessionConfig::default());

    manager.get_or_create(Some("stale")).await.unwrap();
    manager.get_or_create(Some("busy")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    manager.touch("busy").unwrap();

    let cleaned = manager.cleanup_inactive(Duration::from_millis(100)).await;
    assert_eq!(cleaned, vec!["stale".to_string()]);
    assert!(manager.get("busy").is_ok());
}

#[tokio::test]
async fn session_limit_reclaims_idle_before_failing() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let manager = SessionManager::new(
        conn.clone(),
        SessionConfig {
            max_sessions: 1,
            session_ttl: Duration::from_millis(100),
            ..SessionConfig::default()
        },
    );

    manager.get_or_create(Some("first")).await.unwrap();

    // The only session is fresh: nothing to reclaim, creation fails.
    let err = manager.get_or_create(Some("second")).await.unwrap_err();
    assert!(matches!(err, ServerError::SessionLimitReached { max: 1 }));

    // Once it has idled past the TTL, creation reclaims it.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = manager.get_or_create(Some("second")).await.unwrap();
    assert_eq!(second.id, "second");
    assert!(matches!(
        manager.get("first"),
        Err(ServerError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn destroyed_targets_are_pruned_from_sessions() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let manager = SessionManager::new(conn.clone(), SessionConfig::default());
    manager.start();

    manager.get_or_create(Some("s")).await.unwrap();
    let tab = manager.create_target("s", None).await.unwrap();
    assert!(manager.get_page("s", &tab).is_ok());

    mock.send_event("Target.targetDestroyed", json!({ "targetId": tab }));
    wait_until("tab record to be pruned", || {
        manager.get_page("s", &tab).is_err()
    })
    .await;
}

// =============================================================================
// Workflow engine
// =============================================================================

struct Rig {
    mock: MockChrome,
    engine: WorkflowEngine,
}

async fn workflow_rig() -> Rig {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let sessions = SessionManager::new(conn.clone(), SessionConfig::default());
    let pool = PagePool::new(
        conn.clone(),
        PoolConfig {
            max_size: 30,
            ..PoolConfig::default()
        },
    );
    let engine = WorkflowEngine::new(pool, sessions.clone());
    sessions.get_or_create(Some("wf")).await.unwrap();
    Rig { mock, engine }
}

fn specs(urls: &[&str]) -> Vec<WorkerSpec> {
    urls.iter()
        .map(|url| WorkerSpec {
            id: None,
            url: (*url).to_owned(),
        })
        .collect()
}

#[tokio::test]
async fn workflow_fans_out_and_collects_in_order() {
    let rig = workflow_rig().await;
    let workflow = rig
        .engine
        .init(
            "wf",
            specs(&["https://a.test/", "https://b.test/", "https://c.test/"]),
            None,
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(workflow.worker_count(), 3);

    // Navigation fan-out reaches all three tabs.
    wait_until("fan-out navigations", || {
        rig.mock.calls("Page.navigate") == 3
    })
    .await;

    for worker in ["worker-1", "worker-2", "worker-3"] {
        rig.engine
            .complete_worker(&workflow.id, worker, Some("payload"))
            .unwrap();
    }

    let results = rig.engine.collect(&workflow.id).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(
        results.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
        vec!["worker-1", "worker-2", "worker-3"]
    );
    assert!(results.iter().all(|r| r.status == WorkerStatus::Completed));
    assert!(results.iter().all(|r| r.data.as_deref() == Some("payload")));
}

#[tokio::test]
async fn worker_deadline_fires_and_partial_data_survives() {
    let rig = workflow_rig().await;
    let workflow = rig
        .engine
        .init(
            "wf",
            specs(&["https://fast.test/", "https://hung.test/"]),
            None,
            Some(Duration::from_millis(300)),
            None,
        )
        .await
        .unwrap();

    // worker-2 reports partial progress, then hangs.
    rig.engine
        .on_worker_update(&workflow.id, "worker-2", "partial extraction")
        .unwrap();
    rig.engine
        .complete_worker(&workflow.id, "worker-1", Some("done"))
        .unwrap();

    let started = Instant::now();
    let results = rig.engine.collect(&workflow.id).await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(2), "collect took {elapsed:?}");

    assert_eq!(results[0].status, WorkerStatus::Completed);
    assert_eq!(results[1].status, WorkerStatus::Timeout);
    assert_eq!(results[1].completion_reason.as_deref(), Some("timeout"));
    assert_eq!(results[1].data.as_deref(), Some("partial extraction"));

    // The timed-out worker's tab was released, not closed.
    assert_eq!(rig.mock.calls("Target.closeTarget"), 0);
    let snapshot = rig
        .engine
        .collect_partial(&workflow.id, None)
        .await
        .unwrap();
    assert!(snapshot.is_fully_complete);
    // Timeout with data counts as a partial completion.
    assert_eq!(snapshot.completed.len(), 2);
    assert!(snapshot.failed.is_empty());
}

#[tokio::test]
async fn stale_watchdog_terminates_unprogressing_worker() {
    let rig = workflow_rig().await;
    let workflow = rig
        .engine
        .init(
            "wf",
            specs(&["https://looping.test/"]),
            None,
            None,
            Some(3),
        )
        .await
        .unwrap();

    let mut last = WorkerStatus::Running;
    for _ in 0..4 {
        last = rig
            .engine
            .on_worker_update(&workflow.id, "worker-1", "same content every time")
            .unwrap();
    }
    assert_eq!(last, WorkerStatus::Stale);

    let results = rig.engine.collect(&workflow.id).await.unwrap();
    assert_eq!(results[0].status, WorkerStatus::Stale);
    assert_eq!(results[0].completion_reason.as_deref(), Some("stale"));
    assert_eq!(results[0].data.as_deref(), Some("same content every time"));
}

#[tokio::test]
async fn changing_data_resets_the_stale_counter() {
    let rig = workflow_rig().await;
    let workflow = rig
        .engine
        .init("wf", specs(&["https://progress.test/"]), None, None, Some(2))
        .await
        .unwrap();

    // Alternating content never accumulates enough stale iterations.
    for round in 0..6 {
        let data = format!("content version {round}");
        let status = rig
            .engine
            .on_worker_update(&workflow.id, "worker-1", &data)
            .unwrap();
        assert_eq!(status, WorkerStatus::Running);
    }

    let snapshot = rig
        .engine
        .collect_partial(&workflow.id, None)
        .await
        .unwrap();
    assert_eq!(snapshot.running.len(), 1);
    assert!(!snapshot.is_fully_complete);
}

#[tokio::test]
async fn global_deadline_times_out_all_remaining_workers() {
    let rig = workflow_rig().await;
    let workflow = rig
        .engine
        .init(
            "wf",
            specs(&["https://one.test/", "https://two.test/"]),
            Some(Duration::from_millis(250)),
            Some(Duration::from_secs(30)),
            None,
        )
        .await
        .unwrap();

    let results = rig.engine.collect(&workflow.id).await.unwrap();
    assert!(results.iter().all(|r| r.status == WorkerStatus::Timeout));
    assert!(
        results
            .iter()
            .all(|r| r.completion_reason.as_deref() == Some("global-timeout"))
    );
}

#[tokio::test]
async fn twenty_parallel_workers_with_one_hung() {
    let rig = workflow_rig().await;
    let urls: Vec<String> = (1..=20).map(|i| format!("https://site{i}.test/")).collect();
    let specs: Vec<WorkerSpec> = urls
        .iter()
        .map(|url| WorkerSpec {
            id: None,
            url: url.clone(),
        })
        .collect();

    let workflow = rig
        .engine
        .init(
            "wf",
            specs,
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
            None,
        )
        .await
        .unwrap();
    assert_eq!(workflow.worker_count(), 20);

    // Everyone but worker-7 reports results; worker-7 hangs.
    for i in 1..=20 {
        if i == 7 {
            continue;
        }
        rig.engine
            .complete_worker(&workflow.id, &format!("worker-{i}"), Some("extracted"))
            .unwrap();
    }

    // Poll the partial collection until the deadline fells worker-7.
    let started = Instant::now();
    loop {
        let snapshot = rig
            .engine
            .collect_partial(&workflow.id, None)
            .await
            .unwrap();
        if snapshot.is_fully_complete {
            break;
        }
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "workflow never completed"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Collect returns promptly once everyone is terminal.
    let collect_started = Instant::now();
    let results = rig.engine.collect(&workflow.id).await.unwrap();
    assert!(collect_started.elapsed() < Duration::from_millis(500));

    assert_eq!(results.len(), 20);
    let completed = results
        .iter()
        .filter(|r| r.status == WorkerStatus::Completed)
        .count();
    assert_eq!(completed, 19);
    let hung = results.iter().find(|r| r.id == "worker-7").unwrap();
    assert_eq!(hung.status, WorkerStatus::Timeout);
}

#[tokio::test]
async fn screenshot_survives_connection_loss_after_reconnect() {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let scheduler = ScreenshotScheduler::new(5);
    let page = conn.create_page(None, None, true).await.unwrap();

    // A slow capture that will be in flight when the socket dies.
    mock.set_capture_delay(Duration::from_secs(5));
    let capture_page = page.clone();
    let capture_scheduler = Arc::clone(&scheduler);
    let in_flight = tokio::spawn(async move {
        capture_scheduler
            .capture(&capture_page, &ScreenshotOptions::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    mock.drop_connections();

    // The in-flight capture fails with a recoverable error.
    let err = in_flight.await.unwrap().unwrap_err();
    assert!(err.is_recoverable(), "unexpected error: {err}");

    // The connection heals itself; a fresh capture then succeeds.
    wait_until("reconnect", || {
        conn.state() == tabfleet::cdp::ConnectionState::Connected
    })
    .await;
    mock.set_capture_delay(Duration::from_millis(10));
    let capture = scheduler
        .capture(&page, &ScreenshotOptions::default())
        .await
        .unwrap();
    assert!(!capture.data.is_empty());
}

#[tokio::test]
async fn collect_partial_can_wait_for_completion() {
    let rig = workflow_rig().await;
    let workflow = rig
        .engine
        .init("wf", specs(&["https://slow.test/"]), None, None, None)
        .await
        .unwrap();

    let engine = rig.engine.clone();
    let workflow_id = workflow.id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine
            .complete_worker(&workflow_id, "worker-1", Some("late"))
            .unwrap();
    });

    let snapshot = rig
        .engine
        .collect_partial(&workflow.id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(snapshot.is_fully_complete);
    assert_eq!(snapshot.completed.len(), 1);
}

// =============================================================================
// RPC server loop
// =============================================================================

async fn rpc_rig() -> (CdpConnection, RpcServer, MockChrome) {
    let mock = MockChrome::start().await;
    let conn = connected(&mock).await;
    let sessions = SessionManager::new(conn.clone(), SessionConfig::default());
    let pool = PagePool::new(conn.clone(), PoolConfig::default());
    let screenshots = ScreenshotScheduler::new(5);
    let policy = Arc::new(DomainPolicy::new(&["blocked.test".to_owned()]));
    let dispatch = Arc::new(ToolDispatch::new(
        conn.clone(),
        sessions.clone(),
        pool.clone(),
        screenshots,
        policy,
    ));
    let engine = WorkflowEngine::new(pool, sessions);
    let server = RpcServer::new(dispatch, engine, Framing::Newline, None);
    (conn, server, mock)
}

async fn roundtrip(
    client: &mut tokio::io::DuplexStream,
    request: Value,
) -> Value {
    client
        .write_all(format!("{request}\n").as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        client.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\n' {
            break;
        }
        response.push(byte[0]);
    }
    serde_json::from_slice(&response).unwrap()
}

#[tokio::test]
async fn rpc_lifecycle_initialize_list_call() {
    let (_conn, server, _mock) = rpc_rig().await;
    let (mut client, server_io) = tokio::io::duplex(256 * 1024);
    let (read_half, write_half) = tokio::io::split(server_io);
    let server_task = tokio::spawn(async move { server.run(read_half, write_half).await });

    let init = roundtrip(
        &mut client,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
    )
    .await;
    assert_eq!(init["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(init["result"]["serverInfo"]["name"], "tabfleet");
    assert!(init["result"]["instructions"].as_str().is_some());

    // `initialized` is a notification: no response; next reply must be
    // for the following request.
    client
        .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"initialized\"}\n")
        .await
        .unwrap();

    let list = roundtrip(
        &mut client,
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    assert_eq!(list["id"], 2);
    let tools = list["result"]["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["name"] == "navigate"));

    let call = roundtrip(
        &mut client,
        json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {
                "name": "navigate",
                "arguments": { "url": "https://example.com/" }
            }
        }),
    )
    .await;
    assert!(call["result"]["isError"].is_null());
    let text = call["result"]["content"][0]["text"].as_str().unwrap();
    let body: Value = serde_json::from_str(text).unwrap();
    assert_eq!(body["url"], "https://example.com/");

    let sessions = roundtrip(
        &mut client,
        json!({ "jsonrpc": "2.0", "id": 4, "method": "sessions/list" }),
    )
    .await;
    let ids = sessions["result"]["sessions"].as_array().unwrap();
    assert!(ids.iter().any(|id| id == "default"));

    let unknown = roundtrip(
        &mut client,
        json!({ "jsonrpc": "2.0", "id": 5, "method": "no/such" }),
    )
    .await;
    assert_eq!(unknown["error"]["code"], -32601);

    let shutdown = roundtrip(
        &mut client,
        json!({
            "jsonrpc": "2.0",
            "id": 6,
            "method": "tools/call",
            "params": { "name": "shutdown", "arguments": {} }
        }),
    )
    .await;
    assert_eq!(shutdown["result"]["content"][0]["type"], "text");

    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn blocked_domain_is_refused_as_tool_error() {
    let (_conn, server, mock) = rpc_rig().await;
    let (mut client, server_io) = tokio::io::duplex(256 * 1024);
    let (read_half, write_half) = tokio::io::split(server_io);
    let _server_task = tokio::spawn(async move { server.run(read_half, write_half).await });

    let call = roundtrip(
        &mut client,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {
                "name": "navigate",
                "arguments": { "url": "https://blocked.test/page" }
            }
        }),
    )
    .await;
    assert_eq!(call["result"]["isError"], true);
    let text = call["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("blocked by policy"));
    // The refusal happened before any navigation was attempted.
    assert_eq!(mock.calls("Page.navigate"), 0);
}

#[tokio::test]
async fn tool_failures_do_not_tear_down_the_server() {
    let (_conn, server, _mock) = rpc_rig().await;
    let (mut client, server_io) = tokio::io::duplex(256 * 1024);
    let (read_half, write_half) = tokio::io::split(server_io);
    let _server_task = tokio::spawn(async move { server.run(read_half, write_half).await });

    let bad = roundtrip(
        &mut client,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "tab_close", "arguments": { "tabId": "nope" } }
        }),
    )
    .await;
    assert_eq!(bad["result"]["isError"], true);

    // The server is still serving.
    let list = roundtrip(
        &mut client,
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    assert!(list["result"]["tools"].as_array().is_some());
}
