//! A mock Chrome CDP endpoint for integration tests.
//!
//! Speaks just enough of the protocol: target lifecycle, attach
//! multiplexing, cookies, navigation bookkeeping, and screenshots with
//! a configurable delay. Tests can inject browser-level events and
//! drop live connections to exercise reconnection.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

/// Control messages pushed from tests into live connections.
#[derive(Debug, Clone)]
enum Control {
    /// Send a CDP event frame to the client.
    Event(String),
    /// Close every open WebSocket.
    DropConnections,
}

#[derive(Default)]
struct MockState {
    /// Monotonic target counter.
    next_target: usize,
    next_context: usize,
    /// target id → current URL (tracked through Page.navigate).
    urls: HashMap<String, String>,
    /// Extra entries reported by Target.getTargets.
    extra_targets: Vec<Value>,
    /// target id → cookie array returned by Network.getAllCookies.
    cookies: HashMap<String, Value>,
    /// Every method received, in order.
    log: Vec<(String, Value)>,
    /// Delay applied to Page.captureScreenshot.
    capture_delay: Duration,
    /// Methods that receive no response (timeout injection).
    silent_methods: Vec<String>,
}

pub struct MockChrome {
    pub addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    control: broadcast::Sender<Control>,
    connections: Arc<AtomicUsize>,
}

impl MockChrome {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(MockState::default()));
        let (control, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_state = Arc::clone(&state);
        let accept_control = control.clone();
        let accept_connections = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                let control = accept_control.subscribe();
                tokio::spawn(serve_connection(stream, state, control));
            }
        });

        Self {
            addr,
            state,
            control,
            connections,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of WebSocket connections ever accepted.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// How many times a method was received.
    pub fn calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Params of every call to a method.
    pub fn call_params(&self, method: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// The URL last navigated to on a target.
    pub fn url_of(&self, target_id: &str) -> Option<String> {
        self.state.lock().unwrap().urls.get(target_id).cloned()
    }

    /// Register an existing tab for Target.getTargets.
    pub fn add_target(&self, target_id: &str, url: &str) {
        let mut state = self.state.lock().unwrap();
        state.extra_targets.push(json!({
            "targetId": target_id,
            "type": "page",
            "title": "",
            "url": url,
            "attached": false,
        }));
        state.urls.insert(target_id.to_owned(), url.to_owned());
    }

    /// Set the cookie jar a target reports.
    pub fn set_cookies(&self, target_id: &str, cookies: Value) {
        self.state
            .lock()
            .unwrap()
            .cookies
            .insert(target_id.to_owned(), cookies);
    }

    pub fn set_capture_delay(&self, delay: Duration) {
        self.state.lock().unwrap().capture_delay = delay;
    }

    /// Stop responding to a method (commands hit their timeout).
    pub fn set_silent(&self, method: &str) {
        self.state
            .lock()
            .unwrap()
            .silent_methods
            .push(method.to_owned());
    }

    /// Emit a browser-level CDP event to every live connection.
    pub fn send_event(&self, method: &str, params: Value) {
        let frame = json!({ "method": method, "params": params }).to_string();
        let _ = self.control.send(Control::Event(frame));
    }

    /// Close every open WebSocket (clients observe a disconnect).
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::DropConnections);
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    state: Arc<Mutex<MockState>>,
    mut control: broadcast::Receiver<Control>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut sink, mut source) = ws.split();
    // Delayed responses (slow screenshots) must not block the loop, or
    // disconnect injection could never interrupt an in-flight command.
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            msg = source.next() => {
                let Some(Ok(Message::Text(text))) = msg else { return };
                let Ok(cmd) = serde_json::from_str::<Value>(&text) else { continue };
                let Some((response, delay)) = handle_command(&state, &cmd) else {
                    continue;
                };
                if delay.is_zero() {
                    let _ = out_tx.send(response.to_string());
                } else {
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = out_tx.send(response.to_string());
                    });
                }
            }
            frame = out_rx.recv() => {
                let Some(frame) = frame else { return };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            ctl = control.recv() => {
                match ctl {
                    Ok(Control::Event(frame)) => {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                    Ok(Control::DropConnections) => {
                        let _ = sink.close().await;
                        return;
                    }
                    Err(_) => return,
                }
            }
        }
    }
}

/// Compute the response for a command, plus a delivery delay. `None`
/// means stay silent.
fn handle_command(
    state: &Arc<Mutex<MockState>>,
    cmd: &Value,
) -> Option<(Value, Duration)> {
    let method = cmd["method"].as_str().unwrap_or_default().to_owned();
    let params = cmd["params"].clone();
    let session_id = cmd["sessionId"].as_str().map(ToOwned::to_owned);

    let capture_delay = {
        let mut state = state.lock().unwrap();
        state.log.push((method.clone(), params.clone()));
        if state.silent_methods.iter().any(|m| m == &method) {
            return None;
        }
        state.capture_delay
    };

    let result = match method.as_str() {
        "Browser.getVersion" => json!({ "product": "Chrome/Mock", "protocolVersion": "1.3" }),
        "Target.setDiscoverTargets"
        | "Target.detachFromTarget"
        | "Target.closeTarget"
        | "Target.disposeBrowserContext"
        | "Emulation.setDeviceMetricsOverride"
        | "Network.clearBrowserCookies"
        | "Network.setCookies"
        | "Storage.clearDataForOrigin"
        | "Input.dispatchMouseEvent" => json!({}),
        "Target.createTarget" => {
            let mut state = state.lock().unwrap();
            state.next_target += 1;
            let target_id = format!("T{}", state.next_target);
            let url = params["url"].as_str().unwrap_or("about:blank").to_owned();
            state.urls.insert(target_id.clone(), url);
            json!({ "targetId": target_id })
        }
        "Target.createBrowserContext" => {
            let mut state = state.lock().unwrap();
            state.next_context += 1;
            json!({ "browserContextId": format!("CTX{}", state.next_context) })
        }
        "Target.attachToTarget" => {
            let target_id = params["targetId"].as_str().unwrap_or_default();
            json!({ "sessionId": format!("S-{target_id}") })
        }
        "Target.getTargets" => {
            let state = state.lock().unwrap();
            json!({ "targetInfos": state.extra_targets.clone() })
        }
        "Network.getAllCookies" => {
            let target_id = session_target(session_id.as_deref());
            let state = state.lock().unwrap();
            let cookies = target_id
                .and_then(|tid| state.cookies.get(&tid).cloned())
                .unwrap_or_else(|| json!([]));
            json!({ "cookies": cookies })
        }
        "Page.navigate" => {
            if let Some(tid) = session_target(session_id.as_deref()) {
                let url = params["url"].as_str().unwrap_or_default().to_owned();
                state.lock().unwrap().urls.insert(tid, url);
            }
            json!({ "frameId": "F1" })
        }
        "Runtime.evaluate" => {
            let expression = params["expression"].as_str().unwrap_or_default();
            let value = if expression.contains("location.href") {
                let tid = session_target(session_id.as_deref());
                let state = state.lock().unwrap();
                let url = tid
                    .and_then(|t| state.urls.get(&t).cloned())
                    .unwrap_or_else(|| "about:blank".to_owned());
                json!(url)
            } else if expression.contains("document.title") {
                json!("Mock Page")
            } else if expression.starts_with("JSON.stringify") {
                json!("{\"title\":\"Mock Page\",\"url\":\"about:blank\",\"text\":\"hello\"}")
            } else {
                Value::Null
            };
            json!({ "result": { "value": value } })
        }
        "Page.captureScreenshot" => json!({ "data": "bW9jay1pbWFnZQ==" }),
        _ => json!({}),
    };

    let delay = if method == "Page.captureScreenshot" {
        capture_delay
    } else {
        Duration::ZERO
    };

    let mut response = json!({ "id": cmd["id"], "result": result });
    if let Some(session_id) = session_id {
        response["sessionId"] = json!(session_id);
    }
    Some((response, delay))
}

/// Attach sessions are minted as `S-<targetId>`.
fn session_target(session_id: Option<&str>) -> Option<String> {
    session_id?.strip_prefix("S-").map(ToOwned::to_owned)
}
