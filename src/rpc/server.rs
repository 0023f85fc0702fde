use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{error, info, warn};

use super::framing::{FrameError, Framing, read_frame, write_frame};
use super::tools::{self, ToolOutput};
use super::types::{self, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, RpcRequest};
use crate::chrome::ChromeProcess;
use crate::dispatch::ToolDispatch;
use crate::workflow::WorkflowEngine;

/// Protocol version reported by `initialize`.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Session id used when `tools/call` carries none.
const DEFAULT_SESSION: &str = "default";

/// Instructions block handed to the language-model client.
const INSTRUCTIONS: &str = "This server drives a local Chrome browser. Tool calls carry an \
optional sessionId; calls sharing a session run strictly in order, while separate sessions run \
in parallel. For many-page extraction, start a workflow (workflow_init) to fan tabs out and \
collect results with workflow_status / workflow_collect.";

/// The stdio JSON-RPC server: reads frames, routes methods, writes
/// responses. Tool handler failures become `isError` tool results and
/// never tear the server down.
pub struct RpcServer {
    dispatch: Arc<ToolDispatch>,
    engine: WorkflowEngine,
    framing: Framing,
    /// Chrome spawned on behalf of this server, terminated on shutdown
    /// unless the shutdown tool says otherwise.
    chrome: std::sync::Mutex<Option<ChromeProcess>>,
    shutdown_requested: AtomicBool,
}

impl RpcServer {
    #[must_use]
    pub fn new(
        dispatch: Arc<ToolDispatch>,
        engine: WorkflowEngine,
        framing: Framing,
        chrome: Option<ChromeProcess>,
    ) -> Self {
        Self {
            dispatch,
            engine,
            framing,
            chrome: std::sync::Mutex::new(chrome),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    /// Serve until EOF, a framing error, or a shutdown request.
    ///
    /// # Errors
    ///
    /// Returns `FrameError` when the stream breaks; clean EOF and
    /// shutdown return `Ok`.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<(), FrameError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);

        loop {
            let frame = match read_frame(&mut reader, self.framing).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("client closed the stream");
                    return Ok(());
                }
                Err(FrameError::TooLarge(len)) => {
                    error!(len, "oversized frame, terminating connection");
                    return Err(FrameError::TooLarge(len));
                }
                Err(e) => return Err(e),
            };

            let response = match serde_json::from_str::<RpcRequest>(&frame) {
                Ok(request) => self.handle(request).await,
                Err(e) => Some(types::error(
                    &Value::Null,
                    PARSE_ERROR,
                    &format!("parse error: {e}"),
                )),
            };

            if let Some(response) = response {
                write_frame(&mut writer, self.framing, &response.to_string()).await?;
            }

            if self.shutdown_requested.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping server loop");
                return Ok(());
            }
        }
    }

    /// Handle one request. Notifications return `None`.
    async fn handle(&self, request: RpcRequest) -> Option<Value> {
        if request.is_notification() {
            // `initialized` is the only notification we expect; all are
            // acknowledged by silence.
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "initialize" => Ok(self.initialize_result()),
            "tools/list" => Ok(json!({ "tools": tools::descriptors() })),
            "tools/call" => self.handle_tool_call(&request.params).await,
            "sessions/list" => Ok(json!({
                "sessions": self.dispatch.sessions.session_ids(),
            })),
            "sessions/create" => self.handle_session_create(&request.params).await,
            "sessions/delete" => self.handle_session_delete(&request.params).await,
            other => {
                return Some(types::error(
                    &id,
                    METHOD_NOT_FOUND,
                    &format!("method not found: {other}"),
                ));
            }
        };

        Some(match result {
            Ok(value) => types::success(&id, value),
            Err((code, message)) => types::error(&id, code, &message),
        })
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "instructions": INSTRUCTIONS,
        })
    }

    async fn handle_tool_call(&self, params: &Value) -> Result<Value, (i64, String)> {
        let Some(name) = params["name"].as_str() else {
            return Err((INVALID_PARAMS, "missing tool name".into()));
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let session_id = params["sessionId"].as_str().unwrap_or(DEFAULT_SESSION);

        // The session must exist before the call lands on its queue.
        if let Err(e) = self
            .dispatch
            .sessions
            .get_or_create(Some(session_id))
            .await
        {
            return Ok(ToolOutput::error(e.to_string()).into_value());
        }

        if name == "shutdown" {
            let keep_browser = arguments["keepBrowser"].as_bool().unwrap_or(false);
            self.shutdown(keep_browser).await;
            return Ok(ToolOutput::text(json!({ "stopped": true }).to_string()).into_value());
        }

        let output =
            match tools::call(&self.dispatch, &self.engine, session_id, name, arguments).await {
                Ok(output) => output,
                // Tool failures are results, not protocol errors.
                Err(e) => ToolOutput::error(e.to_string()),
            };
        Ok(output.into_value())
    }

    async fn handle_session_create(&self, params: &Value) -> Result<Value, (i64, String)> {
        let requested = params["sessionId"].as_str();
        match self.dispatch.sessions.get_or_create(requested).await {
            Ok(session) => Ok(json!({ "sessionId": session.id })),
            Err(e) => Err((e.rpc_code(), e.to_string())),
        }
    }

    async fn handle_session_delete(&self, params: &Value) -> Result<Value, (i64, String)> {
        let Some(session_id) = params["sessionId"].as_str() else {
            return Err((INVALID_PARAMS, "missing sessionId".into()));
        };
        self.engine.remove_session(session_id);
        match self.dispatch.sessions.delete(session_id).await {
            Ok(()) => Ok(json!({ "deleted": session_id })),
            Err(e) => Err((e.rpc_code(), e.to_string())),
        }
    }

    /// Orderly teardown: sessions (with their workflows), pool, CDP
    /// connection, and the spawned browser.
    pub async fn shutdown(&self, keep_browser: bool) {
        self.shutdown_requested.store(true, Ordering::Relaxed);

        for session_id in self.dispatch.sessions.session_ids() {
            self.engine.remove_session(&session_id);
        }
        self.dispatch.sessions.stop();
        self.dispatch.sessions.cleanup_all().await;
        self.dispatch.pool.shutdown().await;
        self.dispatch.conn.shutdown().await;

        let chrome = self
            .chrome
            .lock()
            .expect("chrome handle mutex poisoned")
            .take();
        if let Some(mut chrome) = chrome {
            if keep_browser {
                let (pid, port) = chrome.detach();
                info!(pid, port, "leaving spawned Chrome running");
            } else {
                info!(pid = chrome.pid(), "terminating spawned Chrome");
                chrome.kill();
            }
        } else if keep_browser {
            warn!("keepBrowser requested but no Chrome was spawned by this server");
        }
    }
}
