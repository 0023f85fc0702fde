use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::error::CdpError;
use super::types::{CdpCommand, CdpEvent, MessageKind, RawCdpMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Key for the subscriber map: (`method_name`, `session_id`).
type SubscriberKey = (String, Option<String>);

/// Command sent from a handle to the transport task.
pub enum TransportCommand {
    /// Send a CDP command and deliver the response via the oneshot channel.
    SendCommand {
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    },
    /// Subscribe to events matching a method name (and optional sub-session).
    Subscribe {
        method: String,
        session_id: Option<String>,
        event_tx: mpsc::Sender<CdpEvent>,
    },
    /// Shut down the transport gracefully.
    Shutdown,
}

/// Tracks an in-flight command awaiting its response.
struct PendingRequest {
    response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
    method: String,
    deadline: Instant,
}

/// Clonable handle for communicating with a transport task.
///
/// One transport owns exactly one WebSocket. When the socket dies the
/// task drains its pending commands with `ConnectionClosed`, notifies
/// the disconnect channel, and exits; the connection manager then builds
/// a fresh transport, so no state can leak across sockets.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<TransportCommand>,
    connected: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Send a transport command to the background task.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::ConnectionClosed` if the transport task has
    /// exited.
    pub async fn send(&self, cmd: TransportCommand) -> Result<(), CdpError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| CdpError::ConnectionClosed)
    }

    /// Whether the underlying socket is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Generate the next unique message ID for this connection.
    pub fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Dispatch a CDP command and await its response.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::CommandTimeout` if Chrome does not respond in
    /// time, `CdpError::Protocol` on a protocol error, or
    /// `CdpError::ConnectionClosed` if the socket died.
    pub async fn command(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        session_id: Option<String>,
        timeout: Duration,
    ) -> Result<serde_json::Value, CdpError> {
        let command = CdpCommand {
            id: self.next_message_id(),
            method: method.to_owned(),
            params,
            session_id,
        };

        let (response_tx, response_rx) = oneshot::channel();
        self.send(TransportCommand::SendCommand {
            command,
            response_tx,
            deadline: Instant::now() + timeout,
        })
        .await?;

        response_rx
            .await
            .map_err(|_| CdpError::ConnectionClosed)?
    }

    /// Register an event subscription.
    ///
    /// Events stop when the receiver is dropped or the socket dies.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::ConnectionClosed` if the transport task has
    /// exited.
    pub async fn subscribe(
        &self,
        method: &str,
        session_id: Option<String>,
        capacity: usize,
    ) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        self.send(TransportCommand::Subscribe {
            method: method.to_owned(),
            session_id,
            event_tx,
        })
        .await?;
        Ok(event_rx)
    }
}

/// Establish a WebSocket to `url` and spawn the transport task for it.
///
/// Returns the handle plus a receiver that fires once when the socket
/// is lost (not on graceful shutdown).
///
/// # Errors
///
/// Returns `CdpError::Connection` if the handshake fails or
/// `CdpError::ConnectTimeout` if it exceeds `connect_timeout`.
pub async fn spawn_transport(
    url: &str,
    channel_capacity: usize,
    connect_timeout: Duration,
) -> Result<(TransportHandle, mpsc::Receiver<()>), CdpError> {
    let ws_stream = connect_ws(url, connect_timeout).await?;
    let connected = Arc::new(AtomicBool::new(true));
    let next_id = Arc::new(AtomicU64::new(1));
    let (command_tx, command_rx) = mpsc::channel(channel_capacity);
    let (lost_tx, lost_rx) = mpsc::channel(1);

    let handle = TransportHandle {
        command_tx,
        connected: Arc::clone(&connected),
        next_id,
    };

    tokio::spawn(async move {
        let mut task = TransportTask {
            ws_stream,
            command_rx,
            pending: HashMap::new(),
            subscribers: HashMap::new(),
            connected,
            lost_tx,
        };
        task.run().await;
    });

    Ok((handle, lost_rx))
}

/// Establish a WebSocket connection with a timeout.
async fn connect_ws(url: &str, timeout: Duration) -> Result<WsStream, CdpError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(CdpError::Connection(e.to_string())),
        Err(_) => Err(CdpError::ConnectTimeout),
    }
}

/// The background task that owns one WebSocket connection.
struct TransportTask {
    ws_stream: WsStream,
    command_rx: mpsc::Receiver<TransportCommand>,
    pending: HashMap<u64, PendingRequest>,
    subscribers: HashMap<SubscriberKey, Vec<mpsc::Sender<CdpEvent>>>,
    connected: Arc<AtomicBool>,
    lost_tx: mpsc::Sender<()>,
}

impl TransportTask {
    async fn run(&mut self) {
        loop {
            let next_deadline = self.earliest_deadline();
            let timeout_sleep = async {
                if let Some(deadline) = next_deadline {
                    tokio::time::sleep_until(deadline).await;
                } else {
                    // No pending requests; parked until a select branch wins.
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                ws_msg = self.ws_stream.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text_message(&text);
                        }
                        Some(Ok(Message::Close(_)) | Err(_)) | None => {
                            self.handle_socket_lost();
                            return;
                        }
                        Some(Ok(_)) => {
                            // Binary, Ping, Pong, Frame — ignore
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::SendCommand { command, response_tx, deadline }) => {
                            self.handle_send_command(command, response_tx, deadline).await;
                        }
                        Some(TransportCommand::Subscribe { method, session_id, event_tx }) => {
                            self.subscribers
                                .entry((method, session_id))
                                .or_default()
                                .push(event_tx);
                        }
                        Some(TransportCommand::Shutdown) | None => {
                            self.drain_pending();
                            let _ = self.ws_stream.close(None).await;
                            self.connected.store(false, Ordering::Relaxed);
                            return;
                        }
                    }
                }

                () = timeout_sleep => {
                    self.sweep_timeouts();
                }
            }
        }
    }

    fn handle_text_message(&mut self, text: &str) {
        let Ok(raw) = serde_json::from_str::<RawCdpMessage>(text) else {
            // Malformed JSON — ignore and continue
            return;
        };

        match raw.classify() {
            Some(MessageKind::Response(response)) => {
                if let Some(pending) = self.pending.remove(&response.id) {
                    let result = match response.result {
                        Ok(value) => Ok(value),
                        Err(proto_err) => Err(CdpError::Protocol {
                            code: proto_err.code,
                            message: proto_err.message,
                        }),
                    };
                    let _ = pending.response_tx.send(result);
                }
            }
            Some(MessageKind::Event(event)) => {
                self.dispatch_event(&event);
            }
            None => {}
        }
    }

    fn dispatch_event(&mut self, event: &CdpEvent) {
        let key = (event.method.clone(), event.session_id.clone());
        if let Some(senders) = self.subscribers.get_mut(&key) {
            senders.retain(|tx| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
            if senders.is_empty() {
                self.subscribers.remove(&key);
            }
        }
    }

    async fn handle_send_command(
        &mut self,
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    ) {
        let id = command.id;
        let method = command.method.clone();

        let json = match serde_json::to_string(&command) {
            Ok(j) => j,
            Err(e) => {
                let _ =
                    response_tx.send(Err(CdpError::Internal(format!("serialization error: {e}"))));
                return;
            }
        };

        if let Err(e) = self.ws_stream.send(Message::Text(json.into())).await {
            let _ = response_tx.send(Err(CdpError::Connection(format!(
                "WebSocket write error: {e}"
            ))));
            return;
        }

        self.pending.insert(
            id,
            PendingRequest {
                response_tx,
                method,
                deadline,
            },
        );
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in timed_out {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.response_tx.send(Err(CdpError::CommandTimeout {
                    method: pending.method,
                }));
            }
        }
    }

    fn drain_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_, req) in pending {
            let _ = req.response_tx.send(Err(CdpError::ConnectionClosed));
        }
    }

    fn handle_socket_lost(&mut self) {
        self.connected.store(false, Ordering::Relaxed);
        self.drain_pending();
        self.subscribers.clear();
        let _ = self.lost_tx.try_send(());
    }
}
