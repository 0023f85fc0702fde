use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cdp::{CdpConnection, Page, Viewport};
use crate::error::ServerError;
use crate::pool::PoolStats;
use crate::queue::{QueueManager, SessionQueue};

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum concurrently active sessions.
    pub max_sessions: usize,
    /// Idle age after which a session is reclaimed.
    pub session_ttl: Duration,
    /// Interval of the auto-cleanup sweep.
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 20,
            session_ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// One tab owned by a session.
#[derive(Clone)]
pub struct TabRecord {
    pub target_id: String,
    pub page: Page,
    pub viewport: Viewport,
    /// Pool-owned tabs (workflow workers) are released back to the pool
    /// rather than closed with the session.
    pub pooled: bool,
}

/// A logical client session: isolated browser context, tab registry,
/// and a FIFO queue. Tabs of a session never leave its context (pooled
/// worker tabs are the exception and are tracked as such).
pub struct Session {
    pub id: String,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    /// Isolated browser context backing this session's own tabs.
    context_id: Option<String>,
    tabs: Mutex<HashMap<String, TabRecord>>,
    queue: SessionQueue,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Session {
    /// Update the last-activity timestamp.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("session mutex poisoned") = Instant::now();
    }

    /// How long this session has been idle.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("session mutex poisoned")
            .elapsed()
    }

    /// Age of the session.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// The session's isolated browser context id, if it owns one.
    #[must_use]
    pub fn context_id(&self) -> Option<&str> {
        self.context_id.as_deref()
    }

    /// This session's FIFO queue.
    #[must_use]
    pub fn queue(&self) -> &SessionQueue {
        &self.queue
    }

    /// Resolve a tab to its live page handle.
    #[must_use]
    pub fn page(&self, target_id: &str) -> Option<Page> {
        self.tabs
            .lock()
            .expect("session mutex poisoned")
            .get(target_id)
            .map(|tab| tab.page.clone())
    }

    /// All tab ids, in no particular order.
    #[must_use]
    pub fn tab_ids(&self) -> Vec<String> {
        self.tabs
            .lock()
            .expect("session mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Register a tab. At most one record exists per target.
    pub fn register_tab(&self, record: TabRecord) {
        self.tabs
            .lock()
            .expect("session mutex poisoned")
            .insert(record.target_id.clone(), record);
    }

    /// Remove a tab record, returning it if present.
    pub fn remove_tab(&self, target_id: &str) -> Option<TabRecord> {
        self.tabs
            .lock()
            .expect("session mutex poisoned")
            .remove(target_id)
    }

    fn drain_tabs(&self) -> Vec<TabRecord> {
        self.tabs
            .lock()
            .expect("session mutex poisoned")
            .drain()
            .map(|(_, record)| record)
            .collect()
    }
}

/// Aggregate statistics for observability.
#[derive(Debug, Serialize)]
pub struct SessionStats {
    pub active: usize,
    pub total_created: u64,
    pub total_cleaned: u64,
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}

struct Shared {
    conn: CdpConnection,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    queues: QueueManager,
    total_created: AtomicU64,
    total_cleaned: AtomicU64,
    started_at: Instant,
    stopped: AtomicBool,
}

/// Owns all sessions: creation with limit enforcement, TTL cleanup,
/// and teardown. The handle is cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    #[must_use]
    pub fn new(conn: CdpConnection, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                conn,
                config,
                sessions: Mutex::new(HashMap::new()),
                queues: QueueManager::new(),
                total_created: AtomicU64::new(0),
                total_cleaned: AtomicU64::new(0),
                started_at: Instant::now(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.shared.sessions.lock().expect("session map poisoned")
    }

    fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Spawn the periodic TTL sweep and the target-destroyed pruner.
    pub fn start(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config().cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if manager.shared.stopped.load(Ordering::Relaxed) {
                    break;
                }
                let cleaned = manager
                    .cleanup_inactive(manager.config().session_ttl)
                    .await;
                if !cleaned.is_empty() {
                    info!(count = cleaned.len(), "reclaimed idle sessions");
                }
            }
        });

        // Chrome is the source of truth for tab death: prune records on
        // its target-destroyed events, never by handle drops.
        let manager = self.clone();
        let mut destroyed = self.shared.conn.target_destroyed();
        tokio::spawn(async move {
            while let Some(target_id) = destroyed.recv().await {
                manager.prune_target(&target_id);
            }
        });
    }

    /// Stop the periodic sweep.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Relaxed);
    }

    /// Look up an existing session.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SessionNotFound`.
    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, ServerError> {
        self.lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ServerError::SessionNotFound(session_id.to_owned()))
    }

    /// Get an existing session or create one, with a generated id when
    /// none is supplied.
    ///
    /// At the session limit, idle sessions are reclaimed first; only if
    /// none can be reclaimed does creation fail.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SessionLimitReached` or any CDP error from
    /// browser-context creation.
    pub async fn get_or_create(
        &self,
        session_id: Option<&str>,
    ) -> Result<Arc<Session>, ServerError> {
        if let Some(id) = session_id {
            if let Ok(session) = self.get(id) {
                session.touch();
                return Ok(session);
            }
        }

        let active = self.lock().len();
        if active >= self.config().max_sessions {
            let reclaimed = self.cleanup_inactive(self.config().session_ttl).await;
            let still_active = self.lock().len();
            if reclaimed.is_empty() || still_active >= self.config().max_sessions {
                return Err(ServerError::SessionLimitReached {
                    max: self.config().max_sessions,
                });
            }
        }

        let id = session_id
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let context_id = self.shared.conn.create_browser_context().await?;
        let queue = self.shared.queues.get_or_create(&id);

        let session = Arc::new(Session {
            id: id.clone(),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            context_id: Some(context_id),
            tabs: Mutex::new(HashMap::new()),
            queue,
        });

        self.lock().insert(id.clone(), Arc::clone(&session));
        self.shared.total_created.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %id, "session created");
        Ok(session)
    }

    /// Open a new tab inside the session's context and register it.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SessionNotFound` or any CDP error.
    pub async fn create_target(
        &self,
        session_id: &str,
        url: Option<&str>,
    ) -> Result<String, ServerError> {
        let session = self.get(session_id)?;
        session.touch();
        let page = self
            .shared
            .conn
            .create_page(url, session.context_id(), true)
            .await?;
        let target_id = page.target_id().to_owned();
        session.register_tab(TabRecord {
            target_id: target_id.clone(),
            page,
            viewport: Viewport::default(),
            pooled: false,
        });
        Ok(target_id)
    }

    /// Resolve a session's tab to a live page handle.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SessionNotFound` or
    /// `ServerError::TargetNotFound`.
    pub fn get_page(&self, session_id: &str, target_id: &str) -> Result<Page, ServerError> {
        let session = self.get(session_id)?;
        session.touch();
        session
            .page(target_id)
            .ok_or_else(|| ServerError::TargetNotFound {
                session: session_id.to_owned(),
                target: target_id.to_owned(),
            })
    }

    /// Close a session's tab and drop its record.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::TargetNotFound` if the tab is not registered.
    pub async fn close_target(
        &self,
        session_id: &str,
        target_id: &str,
    ) -> Result<(), ServerError> {
        let session = self.get(session_id)?;
        session.touch();
        let record = session
            .remove_tab(target_id)
            .ok_or_else(|| ServerError::TargetNotFound {
                session: session_id.to_owned(),
                target: target_id.to_owned(),
            })?;
        record.page.close().await?;
        Ok(())
    }

    /// Update a session's last-activity timestamp.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SessionNotFound`.
    pub fn touch(&self, session_id: &str) -> Result<(), ServerError> {
        self.get(session_id)?.touch();
        Ok(())
    }

    /// Delete sessions idle beyond `max_idle`; returns the ids deleted.
    pub async fn cleanup_inactive(&self, max_idle: Duration) -> Vec<String> {
        let idle_ids: Vec<String> = {
            let sessions = self.lock();
            sessions
                .iter()
                .filter(|(_, session)| session.idle_for() > max_idle)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut deleted = Vec::with_capacity(idle_ids.len());
        for id in idle_ids {
            if self.delete(&id).await.is_ok() {
                deleted.push(id);
            }
        }
        deleted
    }

    /// Delete every session.
    pub async fn cleanup_all(&self) {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.delete(&id).await;
        }
    }

    /// Delete one session: clear its queue, close its tabs, dispose its
    /// browser context, and drop all references.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SessionNotFound`.
    pub async fn delete(&self, session_id: &str) -> Result<(), ServerError> {
        let session = self
            .lock()
            .remove(session_id)
            .ok_or_else(|| ServerError::SessionNotFound(session_id.to_owned()))?;

        // Pending work fails with QueueCleared.
        self.shared.queues.remove(session_id);

        for record in session.drain_tabs() {
            // Pool-owned tabs are the pool's to recycle or close.
            if !record.pooled {
                let _ = record.page.close().await;
            }
        }

        if let Some(context_id) = session.context_id() {
            let _ = self.shared.conn.dispose_browser_context(context_id).await;
        }

        self.shared.total_cleaned.fetch_add(1, Ordering::Relaxed);
        debug!(session_id, "session deleted");
        Ok(())
    }

    /// Drop the tab record for a destroyed target, whichever session
    /// holds it.
    pub fn prune_target(&self, target_id: &str) {
        let sessions: Vec<Arc<Session>> = self.lock().values().cloned().collect();
        for session in sessions {
            if session.remove_tab(target_id).is_some() {
                debug!(session_id = %session.id, target_id, "pruned destroyed target");
            }
        }
    }

    /// Ids of all active sessions.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of active sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self, pool: Option<PoolStats>) -> SessionStats {
        #[allow(clippy::cast_possible_truncation)]
        let uptime_ms = self.shared.started_at.elapsed().as_millis() as u64;
        SessionStats {
            active: self.active_count(),
            total_created: self.shared.total_created.load(Ordering::Relaxed),
            total_cleaned: self.shared.total_cleaned.load(Ordering::Relaxed),
            uptime_ms,
            memory_rss_bytes: memory_rss_bytes(),
            pool,
        }
    }
}

/// Resident set size of this process, when the platform exposes it.
#[cfg(target_os = "linux")]
fn memory_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    #[allow(clippy::cast_sign_loss)]
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    Some(rss_pages * page_size)
}

#[cfg(not(target_os = "linux"))]
fn memory_rss_bytes() -> Option<u64> {
    None
}
