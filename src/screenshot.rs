use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::cdp::{CdpError, Page};

/// Default cap on concurrent captures. Chrome serializes
/// `Page.captureScreenshot` inside the renderer anyway; deep queues
/// there produce multi-minute captures at high parallelism.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Image formats accepted by `Page.captureScreenshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Webp,
    Png,
    Jpeg,
}

impl ImageFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }

    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Webp => "image/webp",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    /// Parse a user-supplied format name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "webp" => Some(Self::Webp),
            "png" => Some(Self::Png),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            _ => None,
        }
    }
}

/// A clip rectangle in CSS pixels.
#[derive(Debug, Clone, Copy)]
pub struct Clip {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Capture options.
#[derive(Debug, Clone, Default)]
pub struct ScreenshotOptions {
    pub format: ImageFormat,
    /// Lossy-format quality; defaults to 80 and is ignored for PNG.
    pub quality: Option<u32>,
    pub clip: Option<Clip>,
    /// Capture the full scrollable page (`captureBeyondViewport`).
    pub full_page: bool,
}

/// A completed capture with its timing breakdown.
#[derive(Debug)]
pub struct Capture {
    /// Base64-encoded image data.
    pub data: String,
    /// Milliseconds spent waiting for a capture slot.
    pub wait_ms: u64,
    /// Milliseconds spent inside the CDP capture call.
    pub capture_ms: u64,
    pub format: ImageFormat,
}

/// Process-wide bounded-concurrency screenshot scheduler.
///
/// At capacity, new captures wait; slots are granted in FIFO order.
pub struct ScreenshotScheduler {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl ScreenshotScheduler {
    #[must_use]
    pub fn new(concurrency: usize) -> Arc<Self> {
        let concurrency = concurrency.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        })
    }

    /// The configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Currently free capture slots.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Capture a screenshot of `page`, waiting for a slot if the
    /// scheduler is at capacity.
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from `Page.captureScreenshot`, or
    /// `CdpError::InvalidResponse` when the reply has no image data.
    pub async fn capture(
        &self,
        page: &Page,
        options: &ScreenshotOptions,
    ) -> Result<Capture, CdpError> {
        let queued_at = Instant::now();
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CdpError::Internal("screenshot scheduler closed".into()))?;
        #[allow(clippy::cast_possible_truncation)]
        let wait_ms = queued_at.elapsed().as_millis() as u64;

        let started_at = Instant::now();
        let result = page
            .send(
                "Page.captureScreenshot",
                Some(capture_params(options)),
            )
            .await;
        drop(permit);
        #[allow(clippy::cast_possible_truncation)]
        let capture_ms = started_at.elapsed().as_millis() as u64;

        let data = result?["data"]
            .as_str()
            .map(ToOwned::to_owned)
            .ok_or_else(|| CdpError::InvalidResponse("no image data in response".into()))?;

        debug!(wait_ms, capture_ms, format = options.format.as_str(), "captured screenshot");
        Ok(Capture {
            data,
            wait_ms,
            capture_ms,
            format: options.format,
        })
    }
}

/// Build the `Page.captureScreenshot` parameter object.
#[must_use]
fn capture_params(options: &ScreenshotOptions) -> serde_json::Value {
    let mut params = json!({ "format": options.format.as_str() });

    if options.format != ImageFormat::Png {
        params["quality"] = json!(options.quality.unwrap_or(80));
    }

    if let Some(clip) = &options.clip {
        params["clip"] = json!({
            "x": clip.x,
            "y": clip.y,
            "width": clip.width,
            "height": clip.height,
            "scale": 1,
        });
    }

    if options.full_page {
        params["captureBeyondViewport"] = json!(true);
    }

    params
}
