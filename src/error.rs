use std::fmt;

use crate::cdp::CdpError;
use crate::chrome::ChromeError;
use crate::queue::QueueError;

/// Top-level error type surfaced to tool handlers and the RPC layer.
///
/// The core recovers locally only from connection loss (via reconnect);
/// everything else propagates here, where the RPC layer turns it into a
/// tool result with `isError: true` or a JSON-RPC error object.
#[derive(Debug)]
pub enum ServerError {
    /// CDP-level failure (connection, command, protocol).
    Cdp(CdpError),

    /// Chrome discovery or launch failure.
    Chrome(ChromeError),

    /// A queued closure was cancelled or the queue is gone.
    Queue(QueueError),

    /// The named session does not exist.
    SessionNotFound(String),

    /// Session creation was refused because the limit is reached and no
    /// idle session could be reclaimed.
    SessionLimitReached {
        /// The configured maximum number of sessions.
        max: usize,
    },

    /// The named tab does not exist within the session.
    TargetNotFound {
        /// The owning session id.
        session: String,
        /// The missing target id.
        target: String,
    },

    /// No workflow is registered under the given id.
    WorkflowNotFound(String),

    /// No worker is registered under the given id.
    WorkerNotFound(String),

    /// A navigation was refused by the domain policy.
    DomainBlocked {
        /// The host that matched a blocked pattern.
        host: String,
    },

    /// Tool arguments failed validation.
    InvalidParams(String),

    /// Internal invariant violation (task died, channel closed, …).
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cdp(e) => write!(f, "{e}"),
            Self::Chrome(e) => write!(f, "{e}"),
            Self::Queue(e) => write!(f, "{e}"),
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::SessionLimitReached { max } => {
                write!(f, "session limit reached ({max} active)")
            }
            Self::TargetNotFound { session, target } => {
                write!(f, "target {target} not found in session {session}")
            }
            Self::WorkflowNotFound(id) => write!(f, "workflow not found: {id}"),
            Self::WorkerNotFound(id) => write!(f, "worker not found: {id}"),
            Self::DomainBlocked { host } => {
                write!(f, "navigation to {host} is blocked by policy")
            }
            Self::InvalidParams(msg) => write!(f, "invalid params: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cdp(e) => Some(e),
            Self::Chrome(e) => Some(e),
            Self::Queue(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CdpError> for ServerError {
    fn from(e: CdpError) -> Self {
        Self::Cdp(e)
    }
}

impl From<ChromeError> for ServerError {
    fn from(e: ChromeError) -> Self {
        Self::Chrome(e)
    }
}

impl From<QueueError> for ServerError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

impl ServerError {
    /// JSON-RPC 2.0 error code for this error when it must surface as a
    /// protocol-level error rather than a tool result.
    #[must_use]
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::InvalidParams(_) => -32602,
            Self::SessionNotFound(_)
            | Self::TargetNotFound { .. }
            | Self::WorkflowNotFound(_)
            | Self::WorkerNotFound(_) => -32001,
            Self::SessionLimitReached { .. } => -32002,
            Self::DomainBlocked { .. } => -32003,
            Self::Cdp(_) | Self::Chrome(_) | Self::Queue(_) | Self::Internal(_) => -32603,
        }
    }
}
