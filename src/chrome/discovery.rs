use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::ChromeError;
use super::platform;

/// Overall bound on one debug-endpoint probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Browser version information returned by `/json/version`.
#[derive(Debug, Deserialize)]
pub struct BrowserVersion {
    /// The browser name and version (e.g. "Chrome/126.0.6478.61").
    #[serde(rename = "Browser")]
    pub browser: String,

    /// The CDP protocol version (e.g. "1.3").
    #[serde(rename = "Protocol-Version")]
    pub protocol_version: String,

    /// The browser-level WebSocket debugger URL.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: String,
}

/// Query Chrome's `/json/version` endpoint.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on connection failure or
/// `ChromeError::ParseError` if the response cannot be deserialized.
pub async fn query_version(host: &str, port: u16) -> Result<BrowserVersion, ChromeError> {
    let body = http_get(host, port, "/json/version").await?;
    serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Read the `DevToolsActivePort` file from a user data directory.
///
/// The file has two lines: a port number and a WebSocket path.
///
/// # Errors
///
/// Returns `ChromeError::NoActivePort` if the file is missing, or
/// `ChromeError::ParseError` if its contents are malformed.
pub fn read_devtools_active_port(
    data_dir: &std::path::Path,
) -> Result<(u16, String), ChromeError> {
    let path = data_dir.join("DevToolsActivePort");
    let contents = std::fs::read_to_string(&path).map_err(|_| ChromeError::NoActivePort)?;
    parse_devtools_active_port(&contents)
}

fn parse_devtools_active_port(contents: &str) -> Result<(u16, String), ChromeError> {
    let mut lines = contents.lines();
    let port_str = lines.next().ok_or(ChromeError::NoActivePort)?;
    let port: u16 = port_str.trim().parse().map_err(|_| {
        ChromeError::ParseError(format!("invalid port in DevToolsActivePort: {port_str}"))
    })?;
    let ws_path = lines
        .next()
        .ok_or(ChromeError::NoActivePort)?
        .trim()
        .to_string();
    Ok((port, ws_path))
}

/// Attempt to discover a running Chrome with remote debugging enabled.
///
/// Tries the default profile's `DevToolsActivePort` file first, then the
/// given host/port. Returns the browser WebSocket URL and port.
///
/// # Errors
///
/// Returns `ChromeError::NotRunning` if no instance can be discovered.
pub async fn discover(host: &str, port: u16) -> Result<(String, u16), ChromeError> {
    if let Some(data_dir) = platform::default_user_data_dir() {
        if let Ok((file_port, _ws_path)) = read_devtools_active_port(&data_dir) {
            if let Ok(version) = query_version("127.0.0.1", file_port).await {
                return Ok((version.ws_debugger_url, file_port));
            }
        }
    }

    query_version(host, port)
        .await
        .map(|version| (version.ws_debugger_url, port))
        .map_err(|e| ChromeError::NotRunning(format!("discovery failed on {host}:{port}: {e}")))
}

/// Minimal HTTP/1.1 GET against the local debug endpoint. The responses
/// are small JSON documents; a full HTTP client would be overkill here.
async fn http_get(host: &str, port: u16, path: &str) -> Result<String, ChromeError> {
    let probe = async {
        let mut stream = TcpStream::connect((host, port)).await.map_err(|e| {
            ChromeError::HttpError(format!("connect to {host}:{port} failed: {e}"))
        })?;

        let request =
            format!("GET {path} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: close\r\n\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ChromeError::HttpError(format!("request write failed: {e}")))?;

        // Chrome may hold the connection open past the body, so stop as
        // soon as Content-Length is satisfied rather than waiting for EOF.
        let mut raw = Vec::with_capacity(2048);
        let mut chunk = [0u8; 2048];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| ChromeError::HttpError(format!("response read failed: {e}")))?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            if response_complete(&raw) {
                break;
            }
        }

        extract_body(&raw)
    };

    tokio::time::timeout(PROBE_TIMEOUT, probe)
        .await
        .map_err(|_| ChromeError::HttpError(format!("probe of {host}:{port} timed out")))?
}

/// Split a raw response into its header section and body bytes.
fn split_response(raw: &[u8]) -> Option<(&str, &[u8])> {
    let cut = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&raw[..cut]).ok()?;
    Some((head, &raw[cut + 4..]))
}

fn content_length(head: &str) -> Option<usize> {
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Whether the buffered bytes already hold the whole response. Without a
/// Content-Length the headers alone count as complete.
fn response_complete(raw: &[u8]) -> bool {
    match split_response(raw) {
        Some((head, body)) => content_length(head).is_none_or(|len| body.len() >= len),
        None => false,
    }
}

/// Validate the status line and return the response body.
fn extract_body(raw: &[u8]) -> Result<String, ChromeError> {
    let (head, body) = split_response(raw)
        .ok_or_else(|| ChromeError::HttpError("truncated HTTP response".into()))?;

    let status = head.lines().next().unwrap_or_default();
    if !status.contains(" 200 ") {
        return Err(ChromeError::HttpError(format!(
            "debug endpoint answered: {status}"
        )));
    }

    let body = match content_length(head) {
        Some(len) => &body[..len.min(body.len())],
        None => body,
    };
    String::from_utf8(body.to_vec())
        .map_err(|e| ChromeError::HttpError(format!("non-UTF-8 body: {e}")))
}
