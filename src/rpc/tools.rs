use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::dispatch::ToolDispatch;
use crate::error::ServerError;
use crate::screenshot::{Clip, ImageFormat, ScreenshotOptions};
use crate::workflow::{WorkerSpec, WorkerStatus, WorkflowEngine};

/// Result of one tool invocation, shaped for the `tools/call` response.
#[derive(Debug)]
pub struct ToolOutput {
    pub content: Vec<Value>,
    pub is_error: bool,
}

impl ToolOutput {
    /// A successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": text.into() })],
            is_error: false,
        }
    }

    /// A successful image result with a trailing text annotation.
    #[must_use]
    pub fn image(data: String, mime_type: &str, note: String) -> Self {
        Self {
            content: vec![
                json!({ "type": "image", "data": data, "mimeType": mime_type }),
                json!({ "type": "text", "text": note }),
            ],
            is_error: false,
        }
    }

    /// A failed invocation with a human-readable message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": message.into() })],
            is_error: true,
        }
    }

    /// The `tools/call` result object.
    #[must_use]
    pub fn into_value(self) -> Value {
        let mut result = json!({ "content": self.content });
        if self.is_error {
            result["isError"] = json!(true);
        }
        result
    }
}

/// Descriptors for `tools/list`.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn descriptors() -> Vec<Value> {
    vec![
        json!({
            "name": "navigate",
            "description": "Navigate a tab to a URL, creating a tab if the session has none.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "url": { "type": "string" },
                    "tabId": { "type": "string" }
                },
                "required": ["url"]
            }
        }),
        json!({
            "name": "click",
            "description": "Click an element by CSS selector or a point in viewport coordinates.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tabId": { "type": "string" },
                    "selector": { "type": "string" },
                    "x": { "type": "number" },
                    "y": { "type": "number" }
                }
            }
        }),
        json!({
            "name": "read_page",
            "description": "Read the tab's title, URL, and visible text.",
            "inputSchema": {
                "type": "object",
                "properties": { "tabId": { "type": "string" } }
            }
        }),
        json!({
            "name": "screenshot",
            "description": "Capture a screenshot of a tab (webp by default).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tabId": { "type": "string" },
                    "format": { "type": "string", "enum": ["webp", "png", "jpeg"] },
                    "quality": { "type": "integer" },
                    "fullPage": { "type": "boolean" },
                    "clip": {
                        "type": "object",
                        "properties": {
                            "x": { "type": "number" },
                            "y": { "type": "number" },
                            "width": { "type": "number" },
                            "height": { "type": "number" }
                        },
                        "required": ["x", "y", "width", "height"]
                    }
                }
            }
        }),
        json!({
            "name": "tabs_list",
            "description": "List the session's open tabs.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "tab_new",
            "description": "Open a new tab in the session.",
            "inputSchema": {
                "type": "object",
                "properties": { "url": { "type": "string" } }
            }
        }),
        json!({
            "name": "tab_close",
            "description": "Close one of the session's tabs.",
            "inputSchema": {
                "type": "object",
                "properties": { "tabId": { "type": "string" } },
                "required": ["tabId"]
            }
        }),
        json!({
            "name": "workflow_init",
            "description": "Start a parallel extraction workflow: one worker tab per URL.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workers": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": { "type": "string" },
                                "url": { "type": "string" }
                            },
                            "required": ["url"]
                        }
                    },
                    "globalTimeoutMs": { "type": "integer" },
                    "workerTimeoutMs": { "type": "integer" },
                    "maxStaleIterations": { "type": "integer" }
                },
                "required": ["workers"]
            }
        }),
        json!({
            "name": "workflow_update",
            "description": "Report a worker's extracted data, completion, or failure.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workerId": { "type": "string" },
                    "extractedData": { "type": "string" },
                    "complete": { "type": "boolean" },
                    "error": { "type": "string" }
                },
                "required": ["workerId"]
            }
        }),
        json!({
            "name": "workflow_status",
            "description": "Snapshot of completed, running, and failed workers.",
            "inputSchema": {
                "type": "object",
                "properties": { "waitMs": { "type": "integer" } }
            }
        }),
        json!({
            "name": "workflow_collect",
            "description": "Wait for all workers to finish and return ordered results.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "stats",
            "description": "Server, session, and pool statistics.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "shutdown",
            "description": "Clean up sessions, close the pool, disconnect, and stop the server.",
            "inputSchema": {
                "type": "object",
                "properties": { "keepBrowser": { "type": "boolean" } }
            }
        }),
    ]
}

fn require_str(args: &Value, key: &str) -> Result<String, ServerError> {
    args[key]
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| ServerError::InvalidParams(format!("missing required string '{key}'")))
}

fn optional_str(args: &Value, key: &str) -> Option<String> {
    args[key].as_str().map(ToOwned::to_owned)
}

/// Dispatch one tool call. Page-touching tools run on the session's
/// FIFO queue; workflow bookkeeping and stats are queue-free (their
/// state is internally synchronized, and `workflow_collect` must not
/// hold the queue that `workflow_update` calls arrive on).
///
/// # Errors
///
/// Returns `ServerError` for addressing and validation failures; the
/// caller renders those as `isError` tool results.
pub async fn call(
    dispatch: &Arc<ToolDispatch>,
    engine: &WorkflowEngine,
    session_id: &str,
    name: &str,
    args: Value,
) -> Result<ToolOutput, ServerError> {
    match name {
        "navigate" => navigate(dispatch, session_id, args).await,
        "click" => click(dispatch, session_id, args).await,
        "read_page" => read_page(dispatch, session_id, args).await,
        "screenshot" => screenshot(dispatch, session_id, args).await,
        "tabs_list" => tabs_list(dispatch, session_id),
        "tab_new" => tab_new(dispatch, session_id, args).await,
        "tab_close" => tab_close(dispatch, session_id, args).await,
        "workflow_init" => workflow_init(engine, session_id, args).await,
        "workflow_update" => workflow_update(engine, session_id, &args),
        "workflow_status" => workflow_status(engine, session_id, args).await,
        "workflow_collect" => workflow_collect(engine, session_id).await,
        "stats" => stats(dispatch),
        other => Err(ServerError::InvalidParams(format!(
            "unknown tool '{other}'"
        ))),
    }
}

/// Resolve the target tab: explicit id, else the session's first tab,
/// else a freshly created one.
async fn resolve_page(
    dispatch: &Arc<ToolDispatch>,
    session_id: &str,
    tab_id: Option<&str>,
) -> Result<crate::cdp::Page, ServerError> {
    if let Some(tab_id) = tab_id {
        return dispatch.get_page(session_id, tab_id);
    }
    let session = dispatch.sessions.get(session_id)?;
    if let Some(first) = session.tab_ids().into_iter().next() {
        return dispatch.get_page(session_id, &first);
    }
    let target_id = dispatch.create_target(session_id, None).await?;
    dispatch.get_page(session_id, &target_id)
}

async fn navigate(
    dispatch: &Arc<ToolDispatch>,
    session_id: &str,
    args: Value,
) -> Result<ToolOutput, ServerError> {
    let url = require_str(&args, "url")?;
    // Policy is checked before any tab is created or queued.
    dispatch.policy.check(&url)?;

    let dispatch = Arc::clone(dispatch);
    let session_id = session_id.to_owned();
    let tab_id = optional_str(&args, "tabId");
    let inner_dispatch = Arc::clone(&dispatch);
    dispatch
        .with_session_queue(&session_id.clone(), move || async move {
            let page = resolve_page(&inner_dispatch, &session_id, tab_id.as_deref()).await?;
            inner_dispatch.navigate(&page, &url).await?;
            let title = page.evaluate("document.title").await.ok();
            let summary = json!({
                "tabId": page.target_id(),
                "url": url,
                "title": title.as_ref().and_then(Value::as_str).unwrap_or_default(),
            });
            Ok(ToolOutput::text(summary.to_string()))
        })
        .await
}

async fn click(
    dispatch: &Arc<ToolDispatch>,
    session_id: &str,
    args: Value,
) -> Result<ToolOutput, ServerError> {
    let selector = optional_str(&args, "selector");
    let point = match (args["x"].as_f64(), args["y"].as_f64()) {
        (Some(x), Some(y)) => Some((x, y)),
        _ => None,
    };
    if selector.is_none() && point.is_none() {
        return Err(ServerError::InvalidParams(
            "click needs a selector or x/y coordinates".into(),
        ));
    }

    let dispatch = Arc::clone(dispatch);
    let session_id = session_id.to_owned();
    let tab_id = optional_str(&args, "tabId");
    let inner_dispatch = Arc::clone(&dispatch);
    dispatch
        .with_session_queue(&session_id.clone(), move || async move {
            let page = resolve_page(&inner_dispatch, &session_id, tab_id.as_deref()).await?;

            let (x, y) = match (point, selector) {
                (Some((x, y)), _) => (x, y),
                (None, Some(selector)) => selector_center(&page, &selector).await?,
                (None, None) => {
                    return Err(ServerError::InvalidParams(
                        "click needs a selector or x/y coordinates".into(),
                    ));
                }
            };

            for event_type in ["mousePressed", "mouseReleased"] {
                page.send(
                    "Input.dispatchMouseEvent",
                    Some(json!({
                        "type": event_type,
                        "x": x,
                        "y": y,
                        "button": "left",
                        "clickCount": 1,
                    })),
                )
                .await?;
            }

            Ok(ToolOutput::text(
                json!({ "clicked": true, "x": x, "y": y }).to_string(),
            ))
        })
        .await
}

/// Center of the first element matching a CSS selector.
async fn selector_center(
    page: &crate::cdp::Page,
    selector: &str,
) -> Result<(f64, f64), ServerError> {
    let doc = page.send("DOM.getDocument", Some(json!({ "depth": 0 }))).await?;
    let root = doc["root"]["nodeId"].as_i64().ok_or_else(|| {
        ServerError::Internal("DOM.getDocument returned no root node".into())
    })?;

    let found = page
        .send(
            "DOM.querySelector",
            Some(json!({ "nodeId": root, "selector": selector })),
        )
        .await?;
    let node_id = found["nodeId"].as_i64().filter(|&id| id > 0).ok_or_else(|| {
        ServerError::InvalidParams(format!("selector matched nothing: {selector}"))
    })?;

    let model = page
        .send("DOM.getBoxModel", Some(json!({ "nodeId": node_id })))
        .await?;
    let content = model["model"]["content"].as_array().ok_or_else(|| {
        ServerError::InvalidParams(format!("element has no box model: {selector}"))
    })?;
    if content.len() < 8 {
        return Err(ServerError::InvalidParams(format!(
            "element has no visible box: {selector}"
        )));
    }
    let x1 = content[0].as_f64().unwrap_or(0.0);
    let y1 = content[1].as_f64().unwrap_or(0.0);
    let x3 = content[4].as_f64().unwrap_or(0.0);
    let y3 = content[5].as_f64().unwrap_or(0.0);
    Ok(((x1 + x3) / 2.0, (y1 + y3) / 2.0))
}

async fn read_page(
    dispatch: &Arc<ToolDispatch>,
    session_id: &str,
    args: Value,
) -> Result<ToolOutput, ServerError> {
    let dispatch = Arc::clone(dispatch);
    let session_id = session_id.to_owned();
    let tab_id = optional_str(&args, "tabId");
    let inner_dispatch = Arc::clone(&dispatch);
    dispatch
        .with_session_queue(&session_id.clone(), move || async move {
            let page = resolve_page(&inner_dispatch, &session_id, tab_id.as_deref()).await?;
            let value = page
                .evaluate(
                    "JSON.stringify({ title: document.title, url: location.href, \
                     text: document.body ? document.body.innerText : '' })",
                )
                .await?;
            let text = value.as_str().unwrap_or("{}").to_owned();
            Ok(ToolOutput::text(text))
        })
        .await
}

async fn screenshot(
    dispatch: &Arc<ToolDispatch>,
    session_id: &str,
    args: Value,
) -> Result<ToolOutput, ServerError> {
    let format = match optional_str(&args, "format") {
        Some(name) => ImageFormat::parse(&name)
            .ok_or_else(|| ServerError::InvalidParams(format!("unknown format '{name}'")))?,
        None => ImageFormat::default(),
    };
    #[allow(clippy::cast_possible_truncation)]
    let quality = args["quality"].as_u64().map(|q| q as u32);
    let full_page = args["fullPage"].as_bool().unwrap_or(false);
    let clip = args["clip"].as_object().map(|c| Clip {
        x: c.get("x").and_then(Value::as_f64).unwrap_or(0.0),
        y: c.get("y").and_then(Value::as_f64).unwrap_or(0.0),
        width: c.get("width").and_then(Value::as_f64).unwrap_or(0.0),
        height: c.get("height").and_then(Value::as_f64).unwrap_or(0.0),
    });
    let options = ScreenshotOptions {
        format,
        quality,
        clip,
        full_page,
    };

    let dispatch = Arc::clone(dispatch);
    let session_id = session_id.to_owned();
    let tab_id = optional_str(&args, "tabId");
    let inner_dispatch = Arc::clone(&dispatch);
    dispatch
        .with_session_queue(&session_id.clone(), move || async move {
            let page = resolve_page(&inner_dispatch, &session_id, tab_id.as_deref()).await?;
            let capture = inner_dispatch.capture_screenshot(&page, &options).await?;
            let note = format!(
                "captured in {}ms (waited {}ms)",
                capture.capture_ms, capture.wait_ms
            );
            Ok(ToolOutput::image(
                capture.data,
                capture.format.mime_type(),
                note,
            ))
        })
        .await
}

fn tabs_list(dispatch: &Arc<ToolDispatch>, session_id: &str) -> Result<ToolOutput, ServerError> {
    let session = dispatch.sessions.get(session_id)?;
    session.touch();
    Ok(ToolOutput::text(
        json!({ "tabs": session.tab_ids() }).to_string(),
    ))
}

async fn tab_new(
    dispatch: &Arc<ToolDispatch>,
    session_id: &str,
    args: Value,
) -> Result<ToolOutput, ServerError> {
    let url = optional_str(&args, "url");
    let dispatch = Arc::clone(dispatch);
    let session_id = session_id.to_owned();
    let inner_dispatch = Arc::clone(&dispatch);
    dispatch
        .with_session_queue(&session_id.clone(), move || async move {
            let target_id = inner_dispatch
                .create_target(&session_id, url.as_deref())
                .await?;
            Ok(ToolOutput::text(json!({ "tabId": target_id }).to_string()))
        })
        .await
}

async fn tab_close(
    dispatch: &Arc<ToolDispatch>,
    session_id: &str,
    args: Value,
) -> Result<ToolOutput, ServerError> {
    let target_id = require_str(&args, "tabId")?;
    let dispatch = Arc::clone(dispatch);
    let session_id = session_id.to_owned();
    let inner_dispatch = Arc::clone(&dispatch);
    dispatch
        .with_session_queue(&session_id.clone(), move || async move {
            inner_dispatch.close_target(&session_id, &target_id).await?;
            Ok(ToolOutput::text(json!({ "closed": target_id }).to_string()))
        })
        .await
}

async fn workflow_init(
    engine: &WorkflowEngine,
    session_id: &str,
    args: Value,
) -> Result<ToolOutput, ServerError> {
    let specs: Vec<WorkerSpec> = args["workers"]
        .as_array()
        .ok_or_else(|| ServerError::InvalidParams("missing 'workers' array".into()))?
        .iter()
        .map(|w| {
            Ok(WorkerSpec {
                id: w["id"].as_str().map(ToOwned::to_owned),
                url: w["url"]
                    .as_str()
                    .map(ToOwned::to_owned)
                    .ok_or_else(|| {
                        ServerError::InvalidParams("worker entry missing 'url'".into())
                    })?,
            })
        })
        .collect::<Result<_, ServerError>>()?;

    let global_timeout = args["globalTimeoutMs"].as_u64().map(Duration::from_millis);
    let worker_timeout = args["workerTimeoutMs"].as_u64().map(Duration::from_millis);
    #[allow(clippy::cast_possible_truncation)]
    let max_stale = args["maxStaleIterations"].as_u64().map(|v| v as u32);

    let workflow = engine
        .init(session_id, specs, global_timeout, worker_timeout, max_stale)
        .await?;
    Ok(ToolOutput::text(
        json!({
            "workflowId": workflow.id,
            "workers": workflow.worker_count(),
        })
        .to_string(),
    ))
}

fn workflow_update(
    engine: &WorkflowEngine,
    session_id: &str,
    args: &Value,
) -> Result<ToolOutput, ServerError> {
    let workflow = engine
        .for_session(session_id)
        .ok_or_else(|| ServerError::WorkflowNotFound(format!("session {session_id}")))?;
    let worker_id = require_str(args, "workerId")?;

    if let Some(error) = args["error"].as_str() {
        engine.force_complete(
            &workflow.id,
            &worker_id,
            WorkerStatus::Error,
            Some("error"),
            Some(error),
        );
        return Ok(ToolOutput::text(
            json!({ "workerId": worker_id, "status": "error" }).to_string(),
        ));
    }

    if args["complete"].as_bool() == Some(true) {
        engine.complete_worker(&workflow.id, &worker_id, args["extractedData"].as_str())?;
        return Ok(ToolOutput::text(
            json!({ "workerId": worker_id, "status": "completed" }).to_string(),
        ));
    }

    let data = args["extractedData"].as_str().unwrap_or_default();
    let status = engine.on_worker_update(&workflow.id, &worker_id, data)?;
    Ok(ToolOutput::text(
        json!({ "workerId": worker_id, "status": status }).to_string(),
    ))
}

async fn workflow_status(
    engine: &WorkflowEngine,
    session_id: &str,
    args: Value,
) -> Result<ToolOutput, ServerError> {
    let workflow = engine
        .for_session(session_id)
        .ok_or_else(|| ServerError::WorkflowNotFound(format!("session {session_id}")))?;
    let wait = args["waitMs"].as_u64().map(Duration::from_millis);
    let snapshot = engine.collect_partial(&workflow.id, wait).await?;
    Ok(ToolOutput::text(
        serde_json::to_string(&snapshot)
            .map_err(|e| ServerError::Internal(e.to_string()))?,
    ))
}

async fn workflow_collect(
    engine: &WorkflowEngine,
    session_id: &str,
) -> Result<ToolOutput, ServerError> {
    let workflow = engine
        .for_session(session_id)
        .ok_or_else(|| ServerError::WorkflowNotFound(format!("session {session_id}")))?;
    let results = engine.collect(&workflow.id).await?;
    Ok(ToolOutput::text(
        serde_json::to_string(&json!({ "results": results }))
            .map_err(|e| ServerError::Internal(e.to_string()))?,
    ))
}

fn stats(dispatch: &Arc<ToolDispatch>) -> Result<ToolOutput, ServerError> {
    let stats = dispatch.sessions.stats(Some(dispatch.pool.stats()));
    Ok(ToolOutput::text(
        serde_json::to_string(&stats).map_err(|e| ServerError::Internal(e.to_string()))?,
    ))
}
