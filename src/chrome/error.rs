use std::fmt;

/// Errors that can occur during Chrome discovery, launch, and restart.
#[derive(Debug)]
pub enum ChromeError {
    /// No Chrome executable could be located on the system.
    NotFound(String),

    /// No running Chrome instance with remote debugging was found and
    /// auto-launch is disabled.
    NotRunning(String),

    /// The Chrome process failed to spawn.
    LaunchFailed(String),

    /// Chrome did not start accepting connections within the timeout.
    StartupTimeout {
        /// The port Chrome was expected to listen on.
        port: u16,
    },

    /// The profile is locked by another live Chrome process.
    ProfileLocked {
        /// PID holding the lock.
        pid: u32,
    },

    /// A profile lock exists but its owner is dead; treated as unlocked
    /// by launch paths, surfaced by diagnostics.
    StaleLock {
        /// PID recorded in the stale lock.
        pid: u32,
    },

    /// HTTP request to Chrome's debug endpoint failed.
    HttpError(String),

    /// Failed to parse a response from Chrome.
    ParseError(String),

    /// The `DevToolsActivePort` file was not found.
    NoActivePort,

    /// An I/O error occurred.
    Io(std::io::Error),
}

impl fmt::Display for ChromeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "Chrome not found: {msg}"),
            Self::NotRunning(detail) => {
                write!(
                    f,
                    "no running Chrome instance with remote debugging: {detail}"
                )
            }
            Self::LaunchFailed(msg) => write!(f, "Chrome launch failed: {msg}"),
            Self::StartupTimeout { port } => {
                write!(
                    f,
                    "Chrome startup timed out on port {port}; increase the start timeout or check the profile"
                )
            }
            Self::ProfileLocked { pid } => {
                write!(f, "Chrome profile is locked by running process {pid}")
            }
            Self::StaleLock { pid } => {
                write!(f, "stale Chrome profile lock left by dead process {pid}")
            }
            Self::HttpError(msg) => write!(f, "Chrome HTTP error: {msg}"),
            Self::ParseError(msg) => write!(f, "Chrome parse error: {msg}"),
            Self::NoActivePort => write!(f, "DevToolsActivePort file not found"),
            Self::Io(e) => write!(f, "Chrome I/O error: {e}"),
        }
    }
}

impl std::error::Error for ChromeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChromeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
