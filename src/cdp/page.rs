use serde_json::{Value, json};

use super::CdpError;
use super::connection::CdpConnection;

/// Viewport dimensions applied to newly created pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// A lightweight handle to one browser tab.
///
/// Cloning is cheap; the handle does not own the tab. Tab death is
/// observed through the connection's target-destroyed events, never
/// inferred from handle drops.
#[derive(Clone)]
pub struct Page {
    target_id: String,
    conn: CdpConnection,
}

impl Page {
    pub(crate) fn new(target_id: String, conn: CdpConnection) -> Self {
        Self { target_id, conn }
    }

    /// The CDP target id this page is bound to.
    #[must_use]
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Send a CDP command on this page's sub-session.
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from the connection manager.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, CdpError> {
        self.conn.send(&self.target_id, method, params).await
    }

    /// Navigate this page.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Protocol` when Chrome refuses the navigation,
    /// or `CdpError::InvalidResponse` when the navigation reports a net
    /// error (e.g. DNS failure).
    pub async fn navigate(&self, url: &str) -> Result<(), CdpError> {
        let result = self
            .send("Page.navigate", Some(json!({ "url": url })))
            .await?;
        if let Some(error_text) = result["errorText"].as_str() {
            if !error_text.is_empty() {
                return Err(CdpError::InvalidResponse(format!(
                    "navigation to {url} failed: {error_text}"
                )));
            }
        }
        Ok(())
    }

    /// Evaluate a JavaScript expression, returning its value by value.
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from the connection manager.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, CdpError> {
        let result = self
            .send(
                "Runtime.evaluate",
                Some(json!({ "expression": expression, "returnByValue": true })),
            )
            .await?;
        Ok(result["result"]["value"].clone())
    }

    /// The page's current URL (via `location.href`).
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from the connection manager.
    pub async fn current_url(&self) -> Result<String, CdpError> {
        let value = self.evaluate("location.href").await?;
        value
            .as_str()
            .map(ToOwned::to_owned)
            .ok_or_else(|| CdpError::InvalidResponse("location.href was not a string".into()))
    }

    /// The page's current origin, if it has a clearable one.
    ///
    /// Returns `None` for `about:blank` and other non-http(s) schemes.
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from the connection manager.
    pub async fn current_origin(&self) -> Result<Option<String>, CdpError> {
        let url = self.current_url().await?;
        Ok(clearable_origin(&url))
    }

    /// Apply viewport dimensions via `Emulation.setDeviceMetricsOverride`.
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from the connection manager.
    pub async fn set_viewport(&self, viewport: Viewport) -> Result<(), CdpError> {
        self.send(
            "Emulation.setDeviceMetricsOverride",
            Some(json!({
                "width": viewport.width,
                "height": viewport.height,
                "deviceScaleFactor": 1,
                "mobile": false,
            })),
        )
        .await?;
        Ok(())
    }

    /// Close the underlying tab.
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from the connection manager.
    pub async fn close(&self) -> Result<(), CdpError> {
        self.conn.close_target(&self.target_id).await
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("target_id", &self.target_id)
            .finish_non_exhaustive()
    }
}

/// Extract the origin of a URL when it is meaningful to clear storage
/// for it. Only http(s) origins qualify; `Storage.clearDataForOrigin`
/// must never be called with a wildcard.
#[must_use]
pub fn clearable_origin(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    match parsed.scheme() {
        "http" | "https" => {
            let host = parsed.host_str()?;
            let origin = match parsed.port() {
                Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
                None => format!("{}://{host}", parsed.scheme()),
            };
            Some(origin)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_viewport_is_full_hd() {
        let vp = Viewport::default();
        assert_eq!(vp.width, 1920);
        assert_eq!(vp.height, 1080);
    }

    #[test]
    fn origin_of_https_url() {
        assert_eq!(
            clearable_origin("https://example.com/path?q=1"),
            Some("https://example.com".into())
        );
    }

    #[test]
    fn origin_preserves_explicit_port() {
        assert_eq!(
            clearable_origin("http://localhost:8080/app"),
            Some("http://localhost:8080".into())
        );
    }

    #[test]
    fn origin_of_blank_is_none() {
        assert_eq!(clearable_origin("about:blank"), None);
    }

    #[test]
    fn origin_of_chrome_scheme_is_none() {
        assert_eq!(clearable_origin("chrome://newtab/"), None);
    }

    #[test]
    fn origin_of_garbage_is_none() {
        assert_eq!(clearable_origin("not a url"), None);
    }
}
