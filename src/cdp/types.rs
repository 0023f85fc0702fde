use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing CDP command (server to Chrome).
#[derive(Debug, Serialize)]
pub struct CdpCommand {
    /// Unique message ID for response correlation.
    pub id: u64,
    /// CDP method name (e.g., `Target.attachToTarget`).
    pub method: String,
    /// Optional parameters for the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Sub-session ID for target-scoped commands; browser-level commands
    /// omit it.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Raw incoming CDP message before classification.
///
/// Every incoming WebSocket message deserializes into this union of
/// response and event fields, then is classified via
/// [`classify`](Self::classify).
#[derive(Debug, Deserialize)]
pub struct RawCdpMessage {
    /// Present for responses; absent for events.
    pub id: Option<u64>,
    /// Present for events.
    pub method: Option<String>,
    /// Event parameters.
    pub params: Option<Value>,
    /// Successful response payload.
    pub result: Option<Value>,
    /// Protocol error payload.
    pub error: Option<CdpProtocolError>,
    /// Sub-session ID for session-scoped messages.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// CDP protocol error payload returned by Chrome.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpProtocolError {
    /// The CDP error code (e.g., -32000).
    pub code: i64,
    /// Human-readable error description.
    pub message: String,
}

/// Parsed CDP response (has an `id`).
#[derive(Debug)]
pub struct CdpResponse {
    /// The message ID correlating to the sent command.
    pub id: u64,
    /// The result: either a successful value or a protocol error.
    pub result: Result<Value, CdpProtocolError>,
    /// Sub-session ID if this response is session-scoped.
    pub session_id: Option<String>,
}

/// Parsed CDP event (no `id`, has `method`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// The CDP event method name (e.g., `Target.targetDestroyed`).
    pub method: String,
    /// Event parameters.
    pub params: Value,
    /// Sub-session ID if this event is session-scoped.
    pub session_id: Option<String>,
}

/// Classification of a raw CDP message.
pub enum MessageKind {
    /// A response to a previously sent command.
    Response(CdpResponse),
    /// An asynchronous event from Chrome.
    Event(CdpEvent),
}

impl RawCdpMessage {
    /// Classify this raw message as either a response or an event.
    ///
    /// Messages with an `id` field are responses; messages with a
    /// `method` field but no `id` are events. Returns `None` if neither
    /// field is present.
    #[must_use]
    pub fn classify(self) -> Option<MessageKind> {
        if let Some(id) = self.id {
            let result = if let Some(error) = self.error {
                Err(error)
            } else {
                Ok(self.result.unwrap_or(Value::Null))
            };
            Some(MessageKind::Response(CdpResponse {
                id,
                result,
                session_id: self.session_id,
            }))
        } else if let Some(method) = self.method {
            Some(MessageKind::Event(CdpEvent {
                method,
                params: self.params.unwrap_or(Value::Null),
                session_id: self.session_id,
            }))
        } else {
            None
        }
    }
}

/// Extract a required string field from a CDP result value.
///
/// # Errors
///
/// Returns `CdpError::InvalidResponse` naming the missing field.
pub fn result_str(value: &Value, field: &str, method: &str) -> Result<String, super::CdpError> {
    value[field]
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| {
            super::CdpError::InvalidResponse(format!("{method} response missing {field}"))
        })
}
