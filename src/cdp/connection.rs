use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use super::cookies::CookieBridge;
use super::error::CdpError;
use super::page::{Page, Viewport};
use super::transport::{TransportCommand, TransportHandle, spawn_transport};
use super::types::result_str;
use crate::chrome::query_version;

/// Configuration for the CDP connection manager.
#[derive(Debug, Clone)]
pub struct CdpConfig {
    /// How long a successful probe keeps the connection "verified";
    /// connect calls within this window return immediately (default: 10s).
    pub verify_ttl: Duration,
    /// Timeout for the lightweight `Browser.getVersion` probe (default: 5s).
    pub probe_timeout: Duration,
    /// Overall bound on connection establishment (default: 15s).
    pub connect_timeout: Duration,
    /// Timeout for individual CDP commands (default: 30s).
    pub command_timeout: Duration,
    /// Interval between heartbeat probes (default: 5s).
    pub heartbeat_interval: Duration,
    /// Maximum reconnection attempts before giving up (default: 5).
    pub max_reconnect_attempts: u32,
    /// Initial reconnect backoff, doubled per attempt (default: 100ms).
    pub reconnect_initial_backoff: Duration,
    /// Reconnect backoff ceiling (default: 5s).
    pub reconnect_max_backoff: Duration,
    /// Capacity of internal channels (default: 256).
    pub channel_capacity: usize,
    /// Viewport applied to pages created through this connection.
    pub default_viewport: Viewport,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            verify_ttl: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            reconnect_initial_backoff: Duration::from_millis(100),
            reconnect_max_backoff: Duration::from_secs(5),
            channel_capacity: 256,
            default_viewport: Viewport::default(),
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Lifecycle events emitted to subscribers.
///
/// `Connected` fires on every (re)establishment so observers can
/// refresh cached page handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnecting,
    ReconnectFailed,
}

/// How the browser WebSocket endpoint is obtained.
#[derive(Debug, Clone)]
enum Endpoint {
    /// Re-discover via HTTP `GET /json/version` on each (re)connect.
    /// Survives a browser restart, where the endpoint path changes.
    Discover { host: String, port: u16 },
    /// A fixed WebSocket URL (tests, pre-resolved endpoints).
    WsUrl(String),
}

type ConnectOutcome = Result<(), CdpError>;

struct ConnInner {
    state: ConnectionState,
    transport: Option<TransportHandle>,
    /// Target id → attached sub-session id. All per-page commands are
    /// multiplexed through these; no second WebSocket is ever opened.
    attached: HashMap<String, String>,
    last_verified: Option<Instant>,
    /// Coalescing channel: the first connect (or the active reconnect)
    /// installs it; every concurrent requester awaits the same outcome.
    pending: Option<broadcast::Sender<ConnectOutcome>>,
    /// Bumped on every successful establishment; stale socket-loss pumps
    /// compare against it and stand down.
    generation: u64,
}

struct Shared {
    endpoint: Endpoint,
    config: CdpConfig,
    inner: Mutex<ConnInner>,
    /// Serializes force-reconnect attempts from the heartbeat, the
    /// socket-loss pump, and failed probes.
    reconnect_gate: tokio::sync::Mutex<()>,
    event_subs: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
    destroyed_subs: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    cookies: CookieBridge,
}

/// Manager of the single logical CDP connection to the browser.
///
/// Owns the WebSocket (through its transport task), the target
/// attachment map, the heartbeat, and the cookie bridge caches. All
/// traffic to the browser is arbitrated here. The handle is cheap to
/// clone; every clone drives the same connection.
#[derive(Clone)]
pub struct CdpConnection {
    shared: Arc<Shared>,
}

impl CdpConnection {
    /// Create a manager that discovers the endpoint from the debug port.
    #[must_use]
    pub fn discover(host: &str, port: u16, config: CdpConfig) -> Self {
        Self::build(
            Endpoint::Discover {
                host: host.to_owned(),
                port,
            },
            config,
        )
    }

    /// Create a manager bound to a fixed WebSocket URL.
    #[must_use]
    pub fn with_ws_url(url: &str, config: CdpConfig) -> Self {
        Self::build(Endpoint::WsUrl(url.to_owned()), config)
    }

    fn build(endpoint: Endpoint, config: CdpConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                config,
                inner: Mutex::new(ConnInner {
                    state: ConnectionState::Disconnected,
                    transport: None,
                    attached: HashMap::new(),
                    last_verified: None,
                    pending: None,
                    generation: 0,
                }),
                reconnect_gate: tokio::sync::Mutex::new(()),
                event_subs: Mutex::new(Vec::new()),
                destroyed_subs: Mutex::new(Vec::new()),
                cookies: CookieBridge::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnInner> {
        self.shared.inner.lock().expect("connection mutex poisoned")
    }

    fn config(&self) -> &CdpConfig {
        &self.shared.config
    }

    /// Spawn the heartbeat task. Call once after construction.
    ///
    /// The heartbeat probes every `heartbeat_interval` while connected;
    /// a failed probe triggers a capped reconnect. After a terminal
    /// `ReconnectFailed` the heartbeat idles until the next explicit
    /// `connect`.
    pub fn start_heartbeat(&self) {
        let conn = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conn.config().heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let handle = {
                    let inner = conn.lock();
                    if inner.state == ConnectionState::Connected {
                        inner.transport.clone()
                    } else {
                        None
                    }
                };
                let Some(handle) = handle else { continue };
                match conn.probe(&handle).await {
                    Ok(()) => {
                        conn.lock().last_verified = Some(Instant::now());
                    }
                    Err(e) => {
                        warn!(error = %e, "heartbeat probe failed, reconnecting");
                        let _ = conn.force_reconnect().await;
                    }
                }
            }
        });
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// When the connection was last verified alive, if ever.
    #[must_use]
    pub fn last_verified(&self) -> Option<Instant> {
        self.lock().last_verified
    }

    /// Number of targets with live sub-session attachments.
    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.lock().attached.len()
    }

    /// The cookie bridge caches owned by this connection.
    #[must_use]
    pub fn cookie_bridge(&self) -> &CookieBridge {
        &self.shared.cookies
    }

    /// Subscribe to connection lifecycle events.
    #[must_use]
    pub fn events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .event_subs
            .lock()
            .expect("events mutex poisoned")
            .push(tx);
        rx
    }

    /// Subscribe to target-destroyed notifications (target ids).
    #[must_use]
    pub fn target_destroyed(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .destroyed_subs
            .lock()
            .expect("destroyed mutex poisoned")
            .push(tx);
        rx
    }

    fn emit(&self, event: ConnectionEvent) {
        let mut subs = self
            .shared
            .event_subs
            .lock()
            .expect("events mutex poisoned");
        subs.retain(|tx| tx.send(event).is_ok());
    }

    /// Ensure the connection is established and fresh.
    ///
    /// Concurrent callers are coalesced onto one underlying attach. A
    /// connection verified within `verify_ttl` returns immediately;
    /// otherwise a lightweight probe runs first, and a failed probe
    /// falls through to a full reconnect.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::ConnectTimeout` if establishment exceeds its
    /// bound, `CdpError::ReconnectFailed` after exhausted retries, or
    /// `CdpError::Connection` on handshake failure.
    pub async fn connect(&self) -> Result<(), CdpError> {
        enum Plan {
            Ready,
            Wait(broadcast::Receiver<ConnectOutcome>),
            Probe(TransportHandle, broadcast::Sender<ConnectOutcome>),
            Establish(broadcast::Sender<ConnectOutcome>),
        }

        let plan = {
            let mut inner = self.lock();
            if let Some(tx) = &inner.pending {
                Plan::Wait(tx.subscribe())
            } else if inner.state == ConnectionState::Connected {
                let fresh = inner
                    .last_verified
                    .is_some_and(|at| at.elapsed() < self.config().verify_ttl);
                if fresh {
                    Plan::Ready
                } else {
                    let (tx, _) = broadcast::channel(1);
                    inner.pending = Some(tx.clone());
                    let handle = inner
                        .transport
                        .clone()
                        .expect("connected state without transport");
                    Plan::Probe(handle, tx)
                }
            } else {
                let (tx, _) = broadcast::channel(1);
                inner.pending = Some(tx.clone());
                inner.state = ConnectionState::Connecting;
                Plan::Establish(tx)
            }
        };

        match plan {
            Plan::Ready => Ok(()),
            Plan::Wait(mut rx) => rx
                .recv()
                .await
                .map_err(|_| CdpError::Internal("pending connect dropped".into()))?,
            Plan::Probe(handle, tx) => {
                let outcome = match self.probe(&handle).await {
                    Ok(()) => {
                        self.lock().last_verified = Some(Instant::now());
                        Ok(())
                    }
                    Err(e) => {
                        debug!(error = %e, "verify probe failed, forcing reconnect");
                        self.clear_pending_if_same(&tx);
                        self.force_reconnect().await
                    }
                };
                self.clear_pending_if_same(&tx);
                let _ = tx.send(outcome.clone());
                outcome
            }
            Plan::Establish(tx) => {
                let outcome = self.establish().await;
                if outcome.is_err() {
                    self.lock().state = ConnectionState::Disconnected;
                }
                self.clear_pending_if_same(&tx);
                if outcome.is_ok() {
                    self.emit(ConnectionEvent::Connected);
                }
                let _ = tx.send(outcome.clone());
                outcome
            }
        }
    }

    /// Drop the pending-connect channel only if it is still ours; a
    /// concurrent force-reconnect may have installed its own.
    fn clear_pending_if_same(&self, tx: &broadcast::Sender<ConnectOutcome>) {
        let mut inner = self.lock();
        if inner.pending.as_ref().is_some_and(|p| p.same_channel(tx)) {
            inner.pending = None;
        }
    }

    async fn probe(&self, handle: &TransportHandle) -> Result<(), CdpError> {
        handle
            .command("Browser.getVersion", None, None, self.config().probe_timeout)
            .await
            .map(|_| ())
    }

    /// Resolve the endpoint, open the socket, attach browser-level
    /// listeners, and install the transport. Bounded by
    /// `connect_timeout` overall.
    fn establish(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CdpError>> + Send + '_>>
    {
        Box::pin(async move {
        let config = self.config();
        let setup = async {
            let ws_url = match &self.shared.endpoint {
                Endpoint::WsUrl(url) => url.clone(),
                Endpoint::Discover { host, port } => {
                    let version = query_version(host, *port)
                        .await
                        .map_err(|e| CdpError::Connection(e.to_string()))?;
                    version.ws_debugger_url
                }
            };

            let (handle, lost_rx) =
                spawn_transport(&ws_url, config.channel_capacity, config.connect_timeout)
                    .await?;

            // Browser-level listeners: target lifecycle events arrive on
            // the root sub-session.
            handle
                .command(
                    "Target.setDiscoverTargets",
                    Some(json!({ "discover": true })),
                    None,
                    config.command_timeout,
                )
                .await?;
            let destroyed_rx = handle
                .subscribe("Target.targetDestroyed", None, config.channel_capacity)
                .await?;

            Ok::<_, CdpError>((handle, lost_rx, destroyed_rx))
        };

        let (handle, mut lost_rx, mut destroyed_rx) =
            tokio::time::timeout(config.connect_timeout, setup)
                .await
                .map_err(|_| CdpError::ConnectTimeout)??;

        let generation = {
            let mut inner = self.lock();
            inner.transport = Some(handle);
            inner.state = ConnectionState::Connected;
            inner.last_verified = Some(Instant::now());
            inner.generation += 1;
            inner.generation
        };

        // Socket-loss pump: one notification per transport, ignored if a
        // newer transport has already replaced this one.
        let conn = self.clone();
        tokio::spawn(async move {
            if lost_rx.recv().await.is_some() {
                if conn.lock().generation != generation {
                    return;
                }
                conn.emit(ConnectionEvent::Disconnected);
                let _ = conn.force_reconnect().await;
            }
        });

        // Target-destroyed pump: prunes attachments and cookie caches,
        // then fans out to subscribers. Dies with its transport.
        let conn = self.clone();
        tokio::spawn(async move {
            while let Some(event) = destroyed_rx.recv().await {
                if let Some(target_id) = event.params["targetId"].as_str() {
                    conn.on_target_destroyed(target_id);
                }
            }
        });

        Ok(())
        })
    }

    /// Tear down the current socket and rebuild from scratch.
    ///
    /// Any pending-connect promise is failed, the attachment map and
    /// in-flight cookie probes are dropped, and the verification
    /// timestamp is cleared before the new socket comes up — nothing
    /// bound to the old WebSocket survives.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::ReconnectFailed` after `max_reconnect_attempts`
    /// consecutive failures.
    pub async fn force_reconnect(&self) -> Result<(), CdpError> {
        let entry_generation = self.lock().generation;
        let _gate = self.shared.reconnect_gate.lock().await;

        // A competing reconnect finished while we waited on the gate;
        // its fresh socket supersedes this request.
        {
            let inner = self.lock();
            if inner.generation != entry_generation && inner.state == ConnectionState::Connected
            {
                return Ok(());
            }
        }

        let reconnect_tx = {
            let mut inner = self.lock();
            if let Some(old) = inner.pending.take() {
                let _ = old.send(Err(CdpError::ConnectionClosed));
            }
            inner.attached.clear();
            inner.last_verified = None;
            if let Some(old_transport) = inner.transport.take() {
                tokio::spawn(async move {
                    let _ = old_transport.send(TransportCommand::Shutdown).await;
                });
            }
            inner.state = ConnectionState::Reconnecting;
            let (tx, _) = broadcast::channel(1);
            inner.pending = Some(tx.clone());
            tx
        };
        self.shared.cookies.clear_in_flight();
        self.emit(ConnectionEvent::Reconnecting);

        let mut backoff = self.config().reconnect_initial_backoff;
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.config().max_reconnect_attempts {
            tokio::time::sleep(backoff).await;
            match self.establish().await {
                Ok(()) => {
                    debug!(attempt, "reconnected");
                    self.clear_pending_if_same(&reconnect_tx);
                    let _ = reconnect_tx.send(Ok(()));
                    self.emit(ConnectionEvent::Connected);
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    backoff = (backoff * 2).min(self.config().reconnect_max_backoff);
                }
            }
        }

        self.lock().state = ConnectionState::Disconnected;
        let err = CdpError::ReconnectFailed {
            attempts: self.config().max_reconnect_attempts,
            last_error,
        };
        self.clear_pending_if_same(&reconnect_tx);
        let _ = reconnect_tx.send(Err(err.clone()));
        self.emit(ConnectionEvent::ReconnectFailed);
        Err(err)
    }

    fn on_target_destroyed(&self, target_id: &str) {
        self.lock().attached.remove(target_id);
        self.shared.cookies.purge_target(target_id);
        let mut subs = self
            .shared
            .destroyed_subs
            .lock()
            .expect("destroyed mutex poisoned");
        subs.retain(|tx| tx.send(target_id.to_owned()).is_ok());
    }

    fn transport(&self) -> Result<TransportHandle, CdpError> {
        let inner = self.lock();
        match (&inner.state, &inner.transport) {
            (ConnectionState::Connected, Some(handle)) => Ok(handle.clone()),
            _ => Err(CdpError::NotConnected),
        }
    }

    /// Send a browser-level CDP command (no sub-session).
    ///
    /// # Errors
    ///
    /// Returns `CdpError::NotConnected` when no socket is up, plus any
    /// transport error.
    pub async fn send_browser(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, CdpError> {
        let handle = self.transport()?;
        handle
            .command(method, params, None, self.config().command_timeout)
            .await
    }

    /// Attach to a target, reusing an existing sub-session if present.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Protocol` if the target cannot be attached.
    pub async fn attach_to_target(&self, target_id: &str) -> Result<String, CdpError> {
        if let Some(session_id) = self.lock().attached.get(target_id) {
            return Ok(session_id.clone());
        }

        let result = self
            .send_browser(
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id, "flatten": true })),
            )
            .await?;
        let session_id = result_str(&result, "sessionId", "Target.attachToTarget")?;

        self.lock()
            .attached
            .insert(target_id.to_owned(), session_id.clone());
        Ok(session_id)
    }

    /// Detach from a target and drop its sub-session mapping.
    ///
    /// # Errors
    ///
    /// Returns any transport error from `Target.detachFromTarget`.
    pub async fn detach_from_target(&self, target_id: &str) -> Result<(), CdpError> {
        let session_id = self.lock().attached.remove(target_id);
        if let Some(session_id) = session_id {
            self.send_browser(
                "Target.detachFromTarget",
                Some(json!({ "sessionId": session_id })),
            )
            .await?;
        }
        Ok(())
    }

    /// Dispatch a CDP command on the target's sub-session, attaching on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::NotConnected` when no socket is up; callers
    /// observing that should retry after the next reconnect.
    pub async fn send(
        &self,
        target_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, CdpError> {
        let session_id = self.attach_to_target(target_id).await?;
        let handle = self.transport()?;
        handle
            .command(
                method,
                params,
                Some(session_id),
                self.config().command_timeout,
            )
            .await
    }

    /// Create an isolated browser context and return its id.
    ///
    /// # Errors
    ///
    /// Returns any transport error from `Target.createBrowserContext`.
    pub async fn create_browser_context(&self) -> Result<String, CdpError> {
        self.connect().await?;
        let result = self
            .send_browser("Target.createBrowserContext", Some(json!({})))
            .await?;
        result_str(&result, "browserContextId", "Target.createBrowserContext")
    }

    /// Dispose an isolated browser context (closes its pages).
    ///
    /// # Errors
    ///
    /// Returns any transport error from `Target.disposeBrowserContext`.
    pub async fn dispose_browser_context(&self, context_id: &str) -> Result<(), CdpError> {
        self.send_browser(
            "Target.disposeBrowserContext",
            Some(json!({ "browserContextId": context_id })),
        )
        .await
        .map(|_| ())
    }

    /// Open a new tab, apply the default viewport, and — for default-
    /// context pages, unless skipped — bridge cookies from an
    /// authenticated target. Cookie bridging is best-effort and never
    /// fails the call.
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from target creation or attachment.
    pub async fn create_page(
        &self,
        url: Option<&str>,
        browser_context_id: Option<&str>,
        skip_cookie_bridge: bool,
    ) -> Result<Page, CdpError> {
        self.connect().await?;

        let target_url = url.unwrap_or("about:blank");
        let mut params = json!({ "url": target_url });
        if let Some(context_id) = browser_context_id {
            params["browserContextId"] = json!(context_id);
        }

        let result = self
            .send_browser("Target.createTarget", Some(params))
            .await?;
        let target_id = result_str(&result, "targetId", "Target.createTarget")?;
        self.attach_to_target(&target_id).await?;

        let page = Page::new(target_id, self.clone());
        if let Err(e) = page.set_viewport(self.config().default_viewport).await {
            debug!(target = page.target_id(), error = %e, "viewport setup failed");
        }

        if !skip_cookie_bridge && browser_context_id.is_none() {
            let domain = url
                .and_then(|u| url::Url::parse(u).ok())
                .and_then(|u| u.host_str().map(ToOwned::to_owned));
            if let Some(source) = self
                .shared
                .cookies
                .find_authenticated_target(self, domain.as_deref())
                .await
            {
                if let Err(e) = self
                    .shared
                    .cookies
                    .copy_cookies(self, &source, &page)
                    .await
                {
                    debug!(source = %source, error = %e, "cookie bridge failed");
                }
            }
        }

        Ok(page)
    }

    /// Close a tab via `Target.closeTarget`.
    ///
    /// # Errors
    ///
    /// Returns any transport error from `Target.closeTarget`.
    pub async fn close_target(&self, target_id: &str) -> Result<(), CdpError> {
        self.lock().attached.remove(target_id);
        self.send_browser("Target.closeTarget", Some(json!({ "targetId": target_id })))
            .await
            .map(|_| ())
    }

    /// The configured per-command timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        self.config().command_timeout
    }

    /// Tear the connection down for good (server shutdown). No
    /// reconnect is attempted.
    pub async fn shutdown(&self) {
        let transport = {
            let mut inner = self.lock();
            inner.state = ConnectionState::Disconnected;
            inner.attached.clear();
            inner.last_verified = None;
            if let Some(pending) = inner.pending.take() {
                let _ = pending.send(Err(CdpError::ConnectionClosed));
            }
            // Invalidate the socket-loss pump so it does not reconnect.
            inner.generation += 1;
            inner.transport.take()
        };
        self.shared.cookies.clear_in_flight();
        if let Some(transport) = transport {
            let _ = transport.send(TransportCommand::Shutdown).await;
        }
        self.emit(ConnectionEvent::Disconnected);
    }
}
