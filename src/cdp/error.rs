use std::fmt;

/// Errors that can occur during CDP communication.
///
/// `Clone` lets a single connect outcome fan out to every coalesced
/// waiter.
#[derive(Debug, Clone)]
pub enum CdpError {
    /// No connection is established and no reconnect is in progress.
    /// Callers should retry after the next successful connect.
    NotConnected,

    /// The WebSocket connection could not be established.
    Connection(String),

    /// Connection establishment exceeded its overall bound.
    ConnectTimeout,

    /// A command did not receive a response within the configured timeout.
    CommandTimeout {
        /// The CDP method that timed out.
        method: String,
    },

    /// Chrome returned a CDP protocol-level error.
    Protocol {
        /// The CDP error code (e.g., -32000).
        code: i64,
        /// The CDP error message.
        message: String,
    },

    /// The WebSocket connection was closed while the command was in flight.
    ConnectionClosed,

    /// Failed to parse a message received from Chrome.
    InvalidResponse(String),

    /// Reconnection failed after all retry attempts were exhausted.
    ReconnectFailed {
        /// Number of reconnection attempts made.
        attempts: u32,
        /// The error from the last reconnection attempt.
        last_error: String,
    },

    /// Internal error (transport task died, channel closed, …).
    Internal(String),
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected to the browser"),
            Self::Connection(msg) => write!(f, "CDP connection error: {msg}"),
            Self::ConnectTimeout => write!(f, "CDP connect timed out"),
            Self::CommandTimeout { method } => {
                write!(f, "CDP command timed out: {method}")
            }
            Self::Protocol { code, message } => {
                write!(f, "CDP protocol error ({code}): {message}")
            }
            Self::ConnectionClosed => write!(f, "CDP connection closed"),
            Self::InvalidResponse(msg) => {
                write!(f, "CDP invalid response: {msg}")
            }
            Self::ReconnectFailed {
                attempts,
                last_error,
            } => {
                write!(
                    f,
                    "CDP reconnection failed after {attempts} attempts: {last_error}"
                )
            }
            Self::Internal(msg) => write!(f, "CDP internal error: {msg}"),
        }
    }
}

impl std::error::Error for CdpError {}

impl CdpError {
    /// Whether retrying the command after a reconnect is reasonable.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Connection(_) | Self::ConnectionClosed
        )
    }
}
