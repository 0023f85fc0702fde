use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::cdp::{CdpConnection, CdpError, Page, clearable_origin};

/// Page pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pages to keep pre-warmed.
    pub min_size: usize,
    /// Cap on pooled (available) pages. `0` disables recycling: every
    /// release closes the page.
    pub max_size: usize,
    /// Idle age after which maintenance closes a page.
    pub idle_timeout: Duration,
    /// Create `min_size` pages at startup.
    pub pre_warm: bool,
    /// Concurrency cap for batch creation.
    pub batch_concurrency: usize,
    /// Maintenance sweep interval.
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 0,
            idle_timeout: Duration::from_secs(300),
            pre_warm: false,
            batch_concurrency: 10,
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

/// Pool counters. `available`/`in_use` reflect the sets; the totals are
/// monotonic.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub total_created: u64,
    pub reused: u64,
    pub on_demand: u64,
}

struct IdlePage {
    page: Page,
    last_used: Instant,
}

struct ActivePage {
    page: Page,
    visited_origins: HashSet<String>,
}

#[derive(Default)]
struct PoolState {
    available: Vec<IdlePage>,
    in_use: HashMap<String, ActivePage>,
}

struct Shared {
    conn: CdpConnection,
    config: PoolConfig,
    state: Mutex<PoolState>,
    total_created: AtomicU64,
    reused: AtomicU64,
    on_demand: AtomicU64,
    /// Batch acquisition sets this so the singles it contains do not
    /// each schedule replenishment.
    suppress_replenish: AtomicBool,
    replenishing: AtomicBool,
    shut_down: AtomicBool,
}

/// Pre-allocates and recycles tabs to hide tab-open latency for
/// parallel workflows.
///
/// Invariant: a page is in the available list or the in-use map, never
/// both. Released pages are reset (blank URL, empty cookie jar, storage
/// cleared per specific origin) before re-use. The handle is cheap to
/// clone.
#[derive(Clone)]
pub struct PagePool {
    shared: Arc<Shared>,
}

impl PagePool {
    #[must_use]
    pub fn new(conn: CdpConnection, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                conn,
                config,
                state: Mutex::new(PoolState::default()),
                total_created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                on_demand: AtomicU64::new(0),
                suppress_replenish: AtomicBool::new(false),
                replenishing: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.shared.state.lock().expect("pool mutex poisoned")
    }

    fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Spawn the maintenance task and, when configured, pre-warm.
    pub fn start(&self) {
        if self.config().pre_warm && self.config().min_size > 0 {
            let pool = self.clone();
            tokio::spawn(async move {
                pool.replenish_to_min().await;
            });
        }

        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config().maintenance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if pool.shared.shut_down.load(Ordering::Relaxed) {
                    break;
                }
                pool.run_maintenance().await;
            }
        });
    }

    /// Acquire one page, reusing a pooled one when possible.
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from on-demand page creation.
    pub async fn acquire(&self) -> Result<Page, CdpError> {
        let pooled = {
            let mut state = self.lock();
            state.available.pop().map(|idle| {
                state.in_use.insert(
                    idle.page.target_id().to_owned(),
                    ActivePage {
                        page: idle.page.clone(),
                        visited_origins: HashSet::new(),
                    },
                );
                idle.page
            })
        };

        if let Some(page) = pooled {
            self.shared.reused.fetch_add(1, Ordering::Relaxed);
            self.maybe_replenish();
            return Ok(page);
        }

        let page = self.create_page().await?;
        self.shared.on_demand.fetch_add(1, Ordering::Relaxed);
        self.lock().in_use.insert(
            page.target_id().to_owned(),
            ActivePage {
                page: page.clone(),
                visited_origins: HashSet::new(),
            },
        );
        self.maybe_replenish();
        Ok(page)
    }

    /// Acquire up to `n` pooled pages and create the rest concurrently
    /// (capped by `batch_concurrency`). No replenishment is scheduled:
    /// the caller releases the pages back when done.
    ///
    /// # Errors
    ///
    /// On any creation failure, already-acquired pages are released and
    /// the first error is returned.
    pub async fn acquire_batch(&self, n: usize) -> Result<Vec<Page>, CdpError> {
        self.shared.suppress_replenish.store(true, Ordering::Relaxed);
        let result = self.acquire_batch_inner(n).await;
        self.shared
            .suppress_replenish
            .store(false, Ordering::Relaxed);
        result
    }

    async fn acquire_batch_inner(&self, n: usize) -> Result<Vec<Page>, CdpError> {
        let mut pages = {
            let mut state = self.lock();
            let take = n.min(state.available.len());
            let mut taken = Vec::with_capacity(take);
            for _ in 0..take {
                let idle = state.available.pop().expect("len checked");
                state.in_use.insert(
                    idle.page.target_id().to_owned(),
                    ActivePage {
                        page: idle.page.clone(),
                        visited_origins: HashSet::new(),
                    },
                );
                taken.push(idle.page);
            }
            taken
        };
        self.shared
            .reused
            .fetch_add(pages.len() as u64, Ordering::Relaxed);

        let need = n - pages.len();
        if need > 0 {
            let results: Vec<Result<Page, CdpError>> =
                futures_util::stream::iter((0..need).map(|_| self.create_page()))
                    .buffer_unordered(self.config().batch_concurrency.max(1))
                    .collect()
                    .await;

            let mut first_err = None;
            for result in results {
                match result {
                    Ok(page) => {
                        self.shared.on_demand.fetch_add(1, Ordering::Relaxed);
                        self.lock().in_use.insert(
                            page.target_id().to_owned(),
                            ActivePage {
                                page: page.clone(),
                                visited_origins: HashSet::new(),
                            },
                        );
                        pages.push(page);
                    }
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }

            if let Some(err) = first_err {
                for page in pages {
                    self.release(&page);
                }
                return Err(err);
            }
        }

        Ok(pages)
    }

    /// Record that an in-use page visited a URL, so its origin's storage
    /// can be cleared on release.
    pub fn note_origin(&self, target_id: &str, url: &str) {
        if let Some(origin) = clearable_origin(url) {
            let mut state = self.lock();
            if let Some(active) = state.in_use.get_mut(target_id) {
                active.visited_origins.insert(origin);
            }
        }
    }

    /// Return a page to the pool.
    ///
    /// At capacity (or with recycling disabled) the page is closed
    /// immediately. Otherwise cleanup runs fire-and-forget: blank
    /// navigation, cookie clear, and `Storage.clearDataForOrigin` for
    /// each specific visited origin; a failed cleanup closes the page,
    /// and capacity is re-checked after cleanup.
    pub fn release(&self, page: &Page) {
        let visited = self
            .lock()
            .in_use
            .remove(page.target_id())
            .map(|active| active.visited_origins)
            .unwrap_or_default();

        let at_capacity = {
            let state = self.lock();
            self.config().max_size == 0 || state.available.len() >= self.config().max_size
        };

        let pool = self.clone();
        let page = page.clone();
        tokio::spawn(async move {
            if at_capacity || pool.shared.shut_down.load(Ordering::Relaxed) {
                let _ = page.close().await;
                return;
            }

            match pool.reset_page(&page, visited).await {
                Ok(()) => {
                    let overflow_page = {
                        let mut state = pool.lock();
                        if state.available.len() < pool.config().max_size
                            && !pool.shared.shut_down.load(Ordering::Relaxed)
                        {
                            state.available.push(IdlePage {
                                page,
                                last_used: Instant::now(),
                            });
                            None
                        } else {
                            Some(page)
                        }
                    };
                    if let Some(page) = overflow_page {
                        let _ = page.close().await;
                    }
                }
                Err(e) => {
                    debug!(target = page.target_id(), error = %e, "page reset failed, closing");
                    let _ = page.close().await;
                }
            }
        });
    }

    async fn reset_page(&self, page: &Page, mut visited: HashSet<String>) -> Result<(), CdpError> {
        // Observe the final origin before blanking; wildcard clears are
        // a no-op in Chrome so each origin is cleared individually.
        if let Ok(Some(origin)) = page.current_origin().await {
            visited.insert(origin);
        }

        page.navigate("about:blank").await?;
        page.send("Network.clearBrowserCookies", None).await?;

        for origin in visited {
            page.send(
                "Storage.clearDataForOrigin",
                Some(json!({ "origin": origin, "storageTypes": "all" })),
            )
            .await?;
        }
        Ok(())
    }

    fn maybe_replenish(&self) {
        if self.shared.suppress_replenish.load(Ordering::Relaxed)
            || self.config().min_size == 0
            || self.shared.shut_down.load(Ordering::Relaxed)
        {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            pool.replenish_to_min().await;
        });
    }

    async fn replenish_to_min(&self) {
        // Single replenisher at a time.
        if self
            .shared
            .replenishing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        loop {
            let deficit = {
                let state = self.lock();
                self.config().min_size.saturating_sub(state.available.len())
            };
            if deficit == 0 || self.shared.shut_down.load(Ordering::Relaxed) {
                break;
            }
            match self.create_page().await {
                Ok(page) => {
                    let cap = self.config().max_size.max(self.config().min_size);
                    let overflow_page = {
                        let mut state = self.lock();
                        if state.available.len() < cap {
                            state.available.push(IdlePage {
                                page,
                                last_used: Instant::now(),
                            });
                            None
                        } else {
                            Some(page)
                        }
                    };
                    if let Some(page) = overflow_page {
                        let _ = page.close().await;
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "pool replenishment failed");
                    break;
                }
            }
        }

        self.shared.replenishing.store(false, Ordering::Release);
    }

    /// Ensure at least `count` pages exist between the available list
    /// and the in-use set; used by workflow init before batch
    /// acquisition.
    pub async fn pre_warm(&self, count: usize) {
        if self.config().max_size == 0 {
            // Recycling disabled: batch acquisition creates on demand.
            return;
        }
        let target = count.min(self.config().max_size);
        loop {
            let deficit = {
                let state = self.lock();
                target.saturating_sub(state.available.len() + state.in_use.len())
            };
            if deficit == 0 {
                break;
            }
            match self.create_page().await {
                Ok(page) => {
                    self.lock().available.push(IdlePage {
                        page,
                        last_used: Instant::now(),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "pre-warm failed");
                    break;
                }
            }
        }
    }

    async fn create_page(&self) -> Result<Page, CdpError> {
        let page = self.shared.conn.create_page(None, None, true).await?;
        self.shared.total_created.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }

    /// Close pages idle beyond the timeout, never dropping the available
    /// list below `min_size`.
    pub async fn run_maintenance(&self) {
        let closable: Vec<Page> = {
            let mut state = self.lock();
            let mut budget = state.available.len().saturating_sub(self.config().min_size);
            let mut keep = Vec::with_capacity(state.available.len());
            let mut close = Vec::new();
            for idle in state.available.drain(..) {
                if budget > 0 && idle.last_used.elapsed() > self.config().idle_timeout {
                    budget -= 1;
                    close.push(idle.page);
                } else {
                    keep.push(idle);
                }
            }
            state.available = keep;
            close
        };

        for page in closable {
            debug!(target = page.target_id(), "closing idle pooled page");
            let _ = page.close().await;
        }
    }

    /// Close every page, available and in use, and stop maintenance.
    pub async fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Relaxed);
        let pages: Vec<Page> = {
            let mut state = self.lock();
            let mut pages: Vec<Page> = state.available.drain(..).map(|idle| idle.page).collect();
            pages.extend(state.in_use.drain().map(|(_, active)| active.page));
            pages
        };
        for page in pages {
            let _ = page.close().await;
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            available: state.available.len(),
            in_use: state.in_use.len(),
            total_created: self.shared.total_created.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            on_demand: self.shared.on_demand.load(Ordering::Relaxed),
        }
    }
}
