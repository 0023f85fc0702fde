use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::cdp::{CdpConnection, Page};
use crate::error::ServerError;
use crate::policy::DomainPolicy;
use crate::pool::PagePool;
use crate::screenshot::{Capture, ScreenshotOptions, ScreenshotScheduler};
use crate::sessions::SessionManager;

/// The typed contract tool handlers consume from the core.
pub struct ToolDispatch {
    pub conn: CdpConnection,
    pub sessions: SessionManager,
    pub pool: PagePool,
    pub screenshots: Arc<ScreenshotScheduler>,
    pub policy: Arc<DomainPolicy>,
}

impl ToolDispatch {
    #[must_use]
    pub fn new(
        conn: CdpConnection,
        sessions: SessionManager,
        pool: PagePool,
        screenshots: Arc<ScreenshotScheduler>,
        policy: Arc<DomainPolicy>,
    ) -> Self {
        Self {
            conn,
            sessions,
            pool,
            screenshots,
            policy,
        }
    }

    /// Resolve a session's tab to a live page handle.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SessionNotFound` or
    /// `ServerError::TargetNotFound`.
    pub fn get_page(&self, session_id: &str, target_id: &str) -> Result<Page, ServerError> {
        self.sessions.get_page(session_id, target_id)
    }

    /// Issue a CDP command against a page.
    ///
    /// # Errors
    ///
    /// Returns any CDP error, wrapped in `ServerError::Cdp`.
    pub async fn send(
        &self,
        page: &Page,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ServerError> {
        Ok(page.send(method, params).await?)
    }

    /// Open a new tab in the session's context.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SessionNotFound` or a CDP error.
    pub async fn create_target(
        &self,
        session_id: &str,
        url: Option<&str>,
    ) -> Result<String, ServerError> {
        if let Some(url) = url {
            self.policy.check(url)?;
        }
        self.sessions.create_target(session_id, url).await
    }

    /// Close a session's tab.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::TargetNotFound` or a CDP error.
    pub async fn close_target(&self, session_id: &str, target_id: &str) -> Result<(), ServerError> {
        self.sessions.close_target(session_id, target_id).await
    }

    /// Run a closure on the session's FIFO queue and await its result.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SessionNotFound`, `ServerError::Queue` when
    /// the closure is discarded, or the closure's own error.
    pub async fn with_session_queue<F, Fut, T>(
        &self,
        session_id: &str,
        f: F,
    ) -> Result<T, ServerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ServerError>> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.sessions.get(session_id)?.queue().clone();
        queue.enqueue(f).await?
    }

    /// Navigate a page, honoring the domain policy and recording the
    /// origin for pool cleanup.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::DomainBlocked` or a CDP error.
    pub async fn navigate(&self, page: &Page, url: &str) -> Result<(), ServerError> {
        self.policy.check(url)?;
        page.navigate(url).await?;
        self.pool.note_origin(page.target_id(), url);
        Ok(())
    }

    /// Capture a screenshot through the global scheduler.
    ///
    /// # Errors
    ///
    /// Returns any CDP error from the capture.
    pub async fn capture_screenshot(
        &self,
        page: &Page,
        options: &ScreenshotOptions,
    ) -> Result<Capture, ServerError> {
        Ok(self.screenshots.capture(page, options).await?)
    }

    /// Acquire one page from the pool.
    ///
    /// # Errors
    ///
    /// Returns any CDP error from on-demand creation.
    pub async fn acquire_pool_page(&self) -> Result<Page, ServerError> {
        Ok(self.pool.acquire().await?)
    }

    /// Acquire `n` pages from the pool.
    ///
    /// # Errors
    ///
    /// Returns any CDP error from batch creation.
    pub async fn acquire_pool_batch(&self, n: usize) -> Result<Vec<Page>, ServerError> {
        Ok(self.pool.acquire_batch(n).await?)
    }

    /// Return a page to the pool.
    pub fn release_pool_page(&self, page: &Page) {
        self.pool.release(page);
    }
}
