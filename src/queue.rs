use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Notify, oneshot};

/// Errors produced by the session queue.
#[derive(Debug)]
pub enum QueueError {
    /// The closure was discarded before it ran (queue cleared or deleted).
    Cleared,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleared => write!(f, "queue cleared before the operation ran"),
        }
    }
}

impl std::error::Error for QueueError {}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueueInner {
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
    processing: AtomicBool,
    closed: AtomicBool,
}

/// A strict-FIFO asynchronous work queue for one session.
///
/// Closures enqueued on the same queue run one at a time, in enqueue
/// order, regardless of whether the running closure suspends on I/O.
/// There is no ordering guarantee across queues.
#[derive(Clone)]
pub struct SessionQueue {
    inner: Arc<QueueInner>,
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionQueue {
    /// Create a queue and spawn its single consumer task.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(QueueInner {
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            processing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let consumer = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                let notified = consumer.notify.notified();
                let job = consumer
                    .jobs
                    .lock()
                    .expect("queue mutex poisoned")
                    .pop_front();
                match job {
                    Some(job) => {
                        consumer.processing.store(true, Ordering::Relaxed);
                        job().await;
                        consumer.processing.store(false, Ordering::Relaxed);
                    }
                    None if consumer.closed.load(Ordering::Relaxed) => break,
                    None => notified.await,
                }
            }
        });

        Self { inner }
    }

    /// Enqueue a closure and await its result.
    ///
    /// The returned future resolves once the closure has run to
    /// completion on the queue's consumer task.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Cleared` if the queue was cleared or closed
    /// before the closure ran.
    pub async fn enqueue<F, Fut, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Cleared);
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let out = f().await;
                // Receiver may have been dropped; nothing to do then.
                let _ = tx.send(out);
            }
            .boxed()
        });

        {
            let mut jobs = self.inner.jobs.lock().expect("queue mutex poisoned");
            jobs.push_back(job);
        }
        self.inner.notify.notify_one();

        // A dropped sender means the job was discarded without running.
        rx.await.map_err(|_| QueueError::Cleared)
    }

    /// Discard every queued closure. Their callers receive
    /// `QueueError::Cleared`. The currently running closure (if any) is
    /// not interrupted.
    pub fn clear(&self) {
        let drained: Vec<Job> = {
            let mut jobs = self.inner.jobs.lock().expect("queue mutex poisoned");
            jobs.drain(..).collect()
        };
        // Dropping the jobs drops their result senders, failing the callers.
        drop(drained);
    }

    /// Clear the queue and stop the consumer task once it drains.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.clear();
        self.inner.notify.notify_one();
    }

    /// Number of closures waiting to run (excludes the running one).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.jobs.lock().expect("queue mutex poisoned").len()
    }

    /// Whether a closure is currently running.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Relaxed)
    }
}

/// Maps session ids to their queues, creating lazily and destroying on
/// session deletion.
#[derive(Default)]
pub struct QueueManager {
    queues: Mutex<HashMap<String, SessionQueue>>,
}

impl QueueManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the queue for a session, creating it if absent.
    #[must_use]
    pub fn get_or_create(&self, session_id: &str) -> SessionQueue {
        let mut queues = self.queues.lock().expect("queue map mutex poisoned");
        queues
            .entry(session_id.to_owned())
            .or_insert_with(SessionQueue::new)
            .clone()
    }

    /// Look up an existing queue without creating one.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionQueue> {
        self.queues
            .lock()
            .expect("queue map mutex poisoned")
            .get(session_id)
            .cloned()
    }

    /// Remove and close a session's queue. Pending closures fail with
    /// `QueueError::Cleared`.
    pub fn remove(&self, session_id: &str) {
        let queue = self
            .queues
            .lock()
            .expect("queue map mutex poisoned")
            .remove(session_id);
        if let Some(queue) = queue {
            queue.close();
        }
    }

    /// Number of live queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.lock().expect("queue map mutex poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
