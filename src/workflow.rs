use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ServerError;
use crate::pool::PagePool;
use crate::sessions::{SessionManager, TabRecord};

/// Default absolute deadline per worker.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(60);
/// Default bound on the whole workflow.
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(300);
/// Default number of unchanged extraction rounds before a worker is
/// declared stale.
pub const DEFAULT_MAX_STALE_ITERATIONS: u32 = 5;

/// Worker lifecycle status. Transitions are monotonic along
/// PENDING → RUNNING → one terminal state; nothing leaves a terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Pending,
    Running,
    Completed,
    Error,
    Timeout,
    Stale,
}

impl WorkerStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Timeout | Self::Stale
        )
    }
}

/// One requested worker: a URL to extract from, with an optional caller-
/// supplied id.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: Option<String>,
    pub url: String,
}

/// Terminal (or snapshot) record of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerResult {
    pub id: String,
    pub url: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Snapshot returned by `collect_partial`.
#[derive(Debug, Serialize)]
pub struct PartialCollection {
    pub completed: Vec<WorkerResult>,
    pub running: Vec<WorkerResult>,
    pub failed: Vec<WorkerResult>,
    pub is_fully_complete: bool,
}

struct WorkerState {
    id: String,
    target_id: String,
    url: String,
    status: WorkerStatus,
    started_at: Instant,
    updated_at: Instant,
    fingerprint: Option<String>,
    stale_count: u32,
    data: Option<String>,
    completion_reason: Option<String>,
    error: Option<String>,
    deadline_task: Option<tokio::task::JoinHandle<()>>,
}

impl WorkerState {
    #[allow(clippy::cast_possible_truncation)]
    fn result(&self) -> WorkerResult {
        WorkerResult {
            id: self.id.clone(),
            url: self.url.clone(),
            status: self.status,
            data: self.data.clone(),
            completion_reason: self.completion_reason.clone(),
            error: self.error.clone(),
            duration_ms: self.updated_at.duration_since(self.started_at).as_millis() as u64,
        }
    }
}

/// A bounded multi-worker job owned by one session.
pub struct Workflow {
    pub id: String,
    pub session_id: String,
    worker_timeout: Duration,
    max_stale_iterations: u32,
    order: Vec<String>,
    workers: Mutex<HashMap<String, WorkerState>>,
    terminal_tx: watch::Sender<usize>,
}

impl Workflow {
    /// Total number of workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.order.len()
    }

    /// Whether every worker has reached a terminal state.
    #[must_use]
    pub fn is_fully_complete(&self) -> bool {
        *self.terminal_tx.borrow() == self.order.len()
    }

    /// Apply a status transition. Returns the worker's tab for release
    /// when this call made it terminal; `None` if it already was.
    fn transition(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        reason: Option<&str>,
        error: Option<&str>,
    ) -> Option<String> {
        let mut workers = self.workers.lock().expect("workflow mutex poisoned");
        let worker = workers.get_mut(worker_id)?;
        if worker.status.is_terminal() {
            return None;
        }

        worker.status = status;
        worker.updated_at = Instant::now();
        if let Some(reason) = reason {
            worker.completion_reason = Some(reason.to_owned());
        }
        if let Some(error) = error {
            worker.error = Some(error.to_owned());
        }

        if status.is_terminal() {
            if let Some(task) = worker.deadline_task.take() {
                task.abort();
            }
            let target_id = worker.target_id.clone();
            drop(workers);
            self.terminal_tx.send_modify(|count| *count += 1);
            return Some(target_id);
        }
        None
    }

    fn snapshot(&self) -> PartialCollection {
        let workers = self.workers.lock().expect("workflow mutex poisoned");
        let mut completed = Vec::new();
        let mut running = Vec::new();
        let mut failed = Vec::new();

        for id in &self.order {
            let Some(worker) = workers.get(id) else { continue };
            let result = worker.result();
            match worker.status {
                WorkerStatus::Completed | WorkerStatus::Stale => completed.push(result),
                // A timed-out worker with partial data still counts as a
                // (partial) completion; without data it failed.
                WorkerStatus::Timeout => {
                    if worker.data.as_ref().is_some_and(|d| !d.is_empty()) {
                        completed.push(result);
                    } else {
                        failed.push(result);
                    }
                }
                WorkerStatus::Error => failed.push(result),
                WorkerStatus::Pending | WorkerStatus::Running => running.push(result),
            }
        }

        let is_fully_complete = running.is_empty();
        PartialCollection {
            completed,
            running,
            failed,
            is_fully_complete,
        }
    }

    fn ordered_results(&self) -> Vec<WorkerResult> {
        let workers = self.workers.lock().expect("workflow mutex poisoned");
        self.order
            .iter()
            .filter_map(|id| workers.get(id).map(WorkerState::result))
            .collect()
    }
}

/// Compute a stable fingerprint of extracted data: length plus a short
/// prefix is enough to detect "nothing changed" across iterations.
#[must_use]
pub fn data_fingerprint(data: &str) -> String {
    let prefix: String = data.chars().take(64).collect();
    format!("{}:{prefix}", data.len())
}

struct Shared {
    pool: PagePool,
    sessions: SessionManager,
    workflows: Mutex<HashMap<String, Arc<Workflow>>>,
    /// session id → its single active workflow.
    by_session: Mutex<HashMap<String, String>>,
}

/// Supervises workflows: fan-out, per-worker deadlines, the stale-
/// progress watchdog, and collection. The handle is cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    shared: Arc<Shared>,
}

impl WorkflowEngine {
    #[must_use]
    pub fn new(pool: PagePool, sessions: SessionManager) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                sessions,
                workflows: Mutex::new(HashMap::new()),
                by_session: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Look up a workflow.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::WorkflowNotFound`.
    pub fn get(&self, workflow_id: &str) -> Result<Arc<Workflow>, ServerError> {
        self.shared
            .workflows
            .lock()
            .expect("workflow map poisoned")
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| ServerError::WorkflowNotFound(workflow_id.to_owned()))
    }

    /// The session's active workflow, if any.
    #[must_use]
    pub fn for_session(&self, session_id: &str) -> Option<Arc<Workflow>> {
        let id = self
            .shared
            .by_session
            .lock()
            .expect("session index poisoned")
            .get(session_id)
            .cloned()?;
        self.get(&id).ok()
    }

    /// Initialize a workflow: pre-warm the pool, batch-acquire one tab
    /// per worker, register everything PENDING, then fan out navigation
    /// and arm per-worker deadlines.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::InvalidParams` for an empty worker list or
    /// a session that already has an unfinished workflow, plus any pool
    /// or CDP error.
    pub async fn init(
        &self,
        session_id: &str,
        specs: Vec<WorkerSpec>,
        global_timeout: Option<Duration>,
        worker_timeout: Option<Duration>,
        max_stale_iterations: Option<u32>,
    ) -> Result<Arc<Workflow>, ServerError> {
        if specs.is_empty() {
            return Err(ServerError::InvalidParams("no workers given".into()));
        }
        let session = self.shared.sessions.get(session_id)?;

        if let Some(existing) = self.for_session(session_id) {
            if existing.is_fully_complete() {
                self.remove_workflow(&existing.id);
            } else {
                return Err(ServerError::InvalidParams(format!(
                    "session {session_id} already has an active workflow ({})",
                    existing.id
                )));
            }
        }

        self.shared.pool.pre_warm(specs.len()).await;
        let pages = self
            .shared
            .pool
            .acquire_batch(specs.len())
            .await
            .map_err(ServerError::Cdp)?;

        let workflow_id = Uuid::new_v4().to_string();
        let (terminal_tx, _) = watch::channel(0usize);
        let mut order = Vec::with_capacity(specs.len());
        let mut workers = HashMap::with_capacity(specs.len());
        let now = Instant::now();

        for (index, (spec, page)) in specs.into_iter().zip(pages.into_iter()).enumerate() {
            let worker_id = spec.id.unwrap_or_else(|| format!("worker-{}", index + 1));
            // Worker tabs are pool pages adopted into the owning session
            // for their lifetime.
            session.register_tab(TabRecord {
                target_id: page.target_id().to_owned(),
                page: page.clone(),
                viewport: crate::cdp::Viewport::default(),
                pooled: true,
            });
            order.push(worker_id.clone());
            workers.insert(
                worker_id.clone(),
                WorkerState {
                    id: worker_id,
                    target_id: page.target_id().to_owned(),
                    url: spec.url,
                    status: WorkerStatus::Pending,
                    started_at: now,
                    updated_at: now,
                    fingerprint: None,
                    stale_count: 0,
                    data: None,
                    completion_reason: None,
                    error: None,
                    deadline_task: None,
                },
            );
        }

        let workflow = Arc::new(Workflow {
            id: workflow_id.clone(),
            session_id: session_id.to_owned(),
            worker_timeout: worker_timeout.unwrap_or(DEFAULT_WORKER_TIMEOUT),
            max_stale_iterations: max_stale_iterations.unwrap_or(DEFAULT_MAX_STALE_ITERATIONS),
            order,
            workers: Mutex::new(workers),
            terminal_tx,
        });

        self.shared
            .workflows
            .lock()
            .expect("workflow map poisoned")
            .insert(workflow_id.clone(), Arc::clone(&workflow));
        self.shared
            .by_session
            .lock()
            .expect("session index poisoned")
            .insert(session_id.to_owned(), workflow_id.clone());

        self.arm_deadlines(&workflow);
        self.fan_out_navigation(&workflow);
        self.arm_global_deadline(&workflow, global_timeout.unwrap_or(DEFAULT_GLOBAL_TIMEOUT));

        info!(
            workflow_id = %workflow.id,
            session_id,
            workers = workflow.worker_count(),
            "workflow initialized"
        );
        Ok(workflow)
    }

    fn arm_deadlines(&self, workflow: &Arc<Workflow>) {
        let mut workers = workflow.workers.lock().expect("workflow mutex poisoned");
        for worker in workers.values_mut() {
            let engine = self.clone();
            let workflow_id = workflow.id.clone();
            let worker_id = worker.id.clone();
            let deadline = tokio::time::Instant::from_std(
                worker.started_at + workflow.worker_timeout,
            );
            worker.deadline_task = Some(tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                warn!(workflow_id = %workflow_id, worker_id = %worker_id, "worker deadline expired");
                engine.force_complete(
                    &workflow_id,
                    &worker_id,
                    WorkerStatus::Timeout,
                    Some("timeout"),
                    None,
                );
            }));
        }
    }

    fn fan_out_navigation(&self, workflow: &Arc<Workflow>) {
        let targets: Vec<(String, String, String)> = {
            let workers = workflow.workers.lock().expect("workflow mutex poisoned");
            workflow
                .order
                .iter()
                .filter_map(|id| {
                    workers
                        .get(id)
                        .map(|w| (w.id.clone(), w.target_id.clone(), w.url.clone()))
                })
                .collect()
        };

        for (worker_id, target_id, url) in targets {
            let engine = self.clone();
            let workflow = Arc::clone(workflow);
            tokio::spawn(async move {
                let page = engine
                    .shared
                    .sessions
                    .get(&workflow.session_id)
                    .ok()
                    .and_then(|session| session.page(&target_id));
                let Some(page) = page else {
                    engine.force_complete(
                        &workflow.id,
                        &worker_id,
                        WorkerStatus::Error,
                        Some("error"),
                        Some("worker tab disappeared before navigation"),
                    );
                    return;
                };

                workflow.transition(&worker_id, WorkerStatus::Running, None, None);
                match page.navigate(&url).await {
                    Ok(()) => {
                        engine.shared.pool.note_origin(&target_id, &url);
                        debug!(workflow_id = %workflow.id, worker_id = %worker_id, url = %url, "worker navigating");
                    }
                    Err(e) => {
                        engine.force_complete(
                            &workflow.id,
                            &worker_id,
                            WorkerStatus::Error,
                            Some("error"),
                            Some(&e.to_string()),
                        );
                    }
                }
            });
        }
    }

    fn arm_global_deadline(&self, workflow: &Arc<Workflow>, timeout: Duration) {
        let engine = self.clone();
        let workflow = Arc::clone(workflow);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if workflow.is_fully_complete() {
                return;
            }
            warn!(workflow_id = %workflow.id, "global workflow deadline expired");
            for worker_id in workflow.order.clone() {
                engine.force_complete(
                    &workflow.id,
                    &worker_id,
                    WorkerStatus::Timeout,
                    Some("global-timeout"),
                    None,
                );
            }
        });
    }

    /// Feed the stale-progress watchdog with a worker's latest extracted
    /// data. Unchanged fingerprints increment the stale counter; hitting
    /// the limit force-completes the worker as STALE (its partial data
    /// is kept). Terminal workers ignore updates.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::WorkflowNotFound` or
    /// `ServerError::WorkerNotFound`.
    pub fn on_worker_update(
        &self,
        workflow_id: &str,
        worker_id: &str,
        extracted_data: &str,
    ) -> Result<WorkerStatus, ServerError> {
        let workflow = self.get(workflow_id)?;

        let went_stale = {
            let mut workers = workflow.workers.lock().expect("workflow mutex poisoned");
            let worker = workers
                .get_mut(worker_id)
                .ok_or_else(|| ServerError::WorkerNotFound(worker_id.to_owned()))?;

            if worker.status.is_terminal() {
                return Ok(worker.status);
            }

            worker.status = WorkerStatus::Running;
            worker.updated_at = Instant::now();

            let fingerprint = data_fingerprint(extracted_data);
            if worker.fingerprint.as_deref() == Some(fingerprint.as_str()) {
                worker.stale_count += 1;
                worker.stale_count >= workflow.max_stale_iterations
            } else {
                worker.fingerprint = Some(fingerprint);
                worker.stale_count = 0;
                worker.data = Some(extracted_data.to_owned());
                false
            }
        };

        if went_stale {
            self.force_complete(
                workflow_id,
                worker_id,
                WorkerStatus::Stale,
                Some("stale"),
                None,
            );
            return Ok(WorkerStatus::Stale);
        }

        let workers = workflow.workers.lock().expect("workflow mutex poisoned");
        Ok(workers
            .get(worker_id)
            .map_or(WorkerStatus::Running, |w| w.status))
    }

    /// Mark a worker terminal: clear its timer, record the reason, and
    /// release its tab back to the pool (the tab is reset, not closed —
    /// it may be useful to later work).
    pub fn force_complete(
        &self,
        workflow_id: &str,
        worker_id: &str,
        status: WorkerStatus,
        reason: Option<&str>,
        error: Option<&str>,
    ) {
        debug_assert!(status.is_terminal());
        let Ok(workflow) = self.get(workflow_id) else {
            return;
        };
        if let Some(target_id) = workflow.transition(worker_id, status, reason, error) {
            self.release_worker_tab(&workflow.session_id, &target_id);
        }
    }

    /// Record a worker's successful completion with its final data.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::WorkflowNotFound` or
    /// `ServerError::WorkerNotFound`.
    pub fn complete_worker(
        &self,
        workflow_id: &str,
        worker_id: &str,
        data: Option<&str>,
    ) -> Result<(), ServerError> {
        let workflow = self.get(workflow_id)?;
        {
            let mut workers = workflow.workers.lock().expect("workflow mutex poisoned");
            let worker = workers
                .get_mut(worker_id)
                .ok_or_else(|| ServerError::WorkerNotFound(worker_id.to_owned()))?;
            if let Some(data) = data {
                if !worker.status.is_terminal() {
                    worker.data = Some(data.to_owned());
                }
            }
        }
        self.force_complete(
            workflow_id,
            worker_id,
            WorkerStatus::Completed,
            Some("completed"),
            None,
        );
        Ok(())
    }

    fn release_worker_tab(&self, session_id: &str, target_id: &str) {
        if let Ok(session) = self.shared.sessions.get(session_id) {
            if let Some(record) = session.remove_tab(target_id) {
                self.shared.pool.release(&record.page);
            }
        }
    }

    /// Block until every worker is terminal, then return results in
    /// registration order.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::WorkflowNotFound`.
    pub async fn collect(&self, workflow_id: &str) -> Result<Vec<WorkerResult>, ServerError> {
        let workflow = self.get(workflow_id)?;
        let total = workflow.worker_count();
        let mut rx = workflow.terminal_tx.subscribe();
        // wait_for also checks the current value first.
        rx.wait_for(|count| *count >= total)
            .await
            .map_err(|_| ServerError::Internal("workflow dropped while collecting".into()))?;
        Ok(workflow.ordered_results())
    }

    /// Snapshot of completed / running / failed workers, optionally
    /// polling up to `wait` for completions before returning.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::WorkflowNotFound`.
    pub async fn collect_partial(
        &self,
        workflow_id: &str,
        wait: Option<Duration>,
    ) -> Result<PartialCollection, ServerError> {
        let workflow = self.get(workflow_id)?;

        if let Some(wait) = wait {
            let total = workflow.worker_count();
            let mut rx = workflow.terminal_tx.subscribe();
            let _ = tokio::time::timeout(wait, rx.wait_for(|count| *count >= total)).await;
        }

        Ok(workflow.snapshot())
    }

    fn remove_workflow(&self, workflow_id: &str) {
        let removed = self
            .shared
            .workflows
            .lock()
            .expect("workflow map poisoned")
            .remove(workflow_id);
        if let Some(workflow) = removed {
            self.shared
                .by_session
                .lock()
                .expect("session index poisoned")
                .retain(|_, id| id != workflow_id);
            // Abort any armed timers.
            let mut workers = workflow.workers.lock().expect("workflow mutex poisoned");
            for worker in workers.values_mut() {
                if let Some(task) = worker.deadline_task.take() {
                    task.abort();
                }
            }
        }
    }

    /// Tear down the session's workflow (session deletion, shutdown).
    /// Non-terminal workers are errored out and their tabs released.
    pub fn remove_session(&self, session_id: &str) {
        let Some(workflow) = self.for_session(session_id) else {
            return;
        };
        for worker_id in workflow.order.clone() {
            self.force_complete(
                &workflow.id,
                &worker_id,
                WorkerStatus::Error,
                Some("session-deleted"),
                None,
            );
        }
        self.remove_workflow(&workflow.id);
    }
}
