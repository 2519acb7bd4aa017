//! Fixed-size worker pool draining one shared task queue.
//!
//! Workers pull [`Task`]s from a shared queue, run them through a
//! [`TaskProcessor`] and report a [`TaskResult`] on the result channel. They
//! never touch record state; the pipeline controller owns every transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use enrichkit_shared::{LookupError, LookupKind, Payload, RecordId, RecordInput};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Task types
// ---------------------------------------------------------------------------

/// One lookup for one record.
#[derive(Debug, Clone)]
pub struct Task {
    pub batch_id: String,
    pub record_id: RecordId,
    pub kind: LookupKind,
    pub input: RecordInput,
    /// Attempts already made before this one.
    pub attempt: u32,
    /// Earliest instant the task may run. [`Pipeline`](crate::Pipeline)
    /// holds retries back itself and always submits with `Instant::now()`;
    /// the worker-side wait is for callers driving the pool directly.
    pub not_before: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(Payload),
    Failed(LookupError),
    /// Dropped from the queue by `shutdown(false)` without running.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    pub outcome: TaskOutcome,
    pub worker: usize,
    pub elapsed: Duration,
}

/// The work a pool runs for each task.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    async fn process(&self, task: &Task) -> Result<Payload, LookupError>;
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Executing,
    Reporting,
}

struct Shared {
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>,
    state: Mutex<PoolState>,
    workers: Mutex<Vec<WorkerState>>,
    /// Set by `shutdown(false)`: queued tasks are reported as cancelled.
    cancel_queued: AtomicBool,
}

impl Shared {
    fn set_worker(&self, id: usize, state: WorkerState) {
        if let Some(slot) = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(id)
        {
            *slot = state;
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool {
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers reporting to `results`.
    pub fn spawn(
        size: usize,
        processor: Arc<dyn TaskProcessor>,
        results: mpsc::Sender<TaskResult>,
    ) -> Self {
        let size = size.max(1);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            queue: tokio::sync::Mutex::new(queue_rx),
            state: Mutex::new(PoolState::Running),
            workers: Mutex::new(vec![WorkerState::Idle; size]),
            cancel_queued: AtomicBool::new(false),
        });

        let handles = (0..size)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    shared.clone(),
                    processor.clone(),
                    results.clone(),
                ))
            })
            .collect();

        debug!(size, "worker pool started");
        Self {
            queue_tx: Mutex::new(Some(queue_tx)),
            shared,
            handles,
        }
    }

    /// Queue a task. Hands the task back if the pool no longer accepts work.
    pub fn submit(&self, task: Task) -> Result<(), Task> {
        let guard = self.queue_tx.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(task).map_err(|e| e.0),
            None => Err(task),
        }
    }

    /// Stop accepting tasks. With `drain_pending`, queued tasks still run;
    /// otherwise they are reported as [`TaskOutcome::Cancelled`]. Tasks already
    /// executing always finish.
    pub fn shutdown(&self, drain_pending: bool) {
        if !drain_pending {
            self.shared.cancel_queued.store(true, Ordering::SeqCst);
        }
        self.queue_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let mut state = self.shared.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == PoolState::Running {
            *state = PoolState::Draining;
        }
        debug!(drain_pending, "worker pool shutting down");
    }

    /// Wait for every worker to exit. Returns once the pool is shut down and
    /// the queue is empty.
    pub async fn run(&mut self) {
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker task ended abnormally");
            }
        }
        *self.shared.state.lock().unwrap_or_else(|p| p.into_inner()) = PoolState::Stopped;
    }

    pub fn state(&self) -> PoolState {
        *self.shared.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // An abandoned pool must not keep running queued work.
        self.shared.cancel_queued.store(true, Ordering::SeqCst);
    }
}

async fn worker_loop(
    id: usize,
    shared: Arc<Shared>,
    processor: Arc<dyn TaskProcessor>,
    results: mpsc::Sender<TaskResult>,
) {
    loop {
        shared.set_worker(id, WorkerState::Idle);
        let next = { shared.queue.lock().await.recv().await };
        let Some(task) = next else {
            break;
        };

        let started = Instant::now();
        let outcome = if shared.cancel_queued.load(Ordering::SeqCst) {
            TaskOutcome::Cancelled
        } else {
            shared.set_worker(id, WorkerState::Executing);
            tokio::time::sleep_until(task.not_before).await;
            trace!(worker = id, record_id = %task.record_id, attempt = task.attempt, "executing task");
            match processor.process(&task).await {
                Ok(payload) => TaskOutcome::Succeeded(payload),
                Err(e) => TaskOutcome::Failed(e),
            }
        };

        shared.set_worker(id, WorkerState::Reporting);
        let result = TaskResult {
            task,
            outcome,
            worker: id,
            elapsed: started.elapsed(),
        };
        if results.send(result).await.is_err() {
            debug!(worker = id, "result channel closed, worker exiting");
            break;
        }
    }
    shared.set_worker(id, WorkerState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{Notify, Semaphore};

    struct Counting {
        calls: AtomicUsize,
        gate: Semaphore,
        started: Notify,
    }

    impl Counting {
        fn open() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                started: Notify::new(),
            })
        }

        fn closed() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                started: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl TaskProcessor for Counting {
        async fn process(&self, task: &Task) -> Result<Payload, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            let _permit = self.gate.acquire().await;
            if task.record_id.as_str() == "bad" {
                return Err(LookupError::NotFound("bad".into()));
            }
            Ok(Payload::default())
        }
    }

    fn task(id: &str) -> Task {
        Task {
            batch_id: "b".into(),
            record_id: id.into(),
            kind: LookupKind::EmailClass,
            input: RecordInput::default(),
            attempt: 0,
            not_before: Instant::now(),
        }
    }

    #[tokio::test]
    async fn drains_all_tasks_on_graceful_shutdown() {
        let processor = Counting::open();
        let (tx, mut rx) = mpsc::channel(16);
        let mut pool = WorkerPool::spawn(3, processor.clone(), tx);
        assert_eq!(pool.state(), PoolState::Running);

        for id in ["a", "b", "c", "bad", "e"] {
            pool.submit(task(id)).unwrap();
        }
        pool.shutdown(true);
        assert_eq!(pool.state(), PoolState::Draining);
        assert!(pool.submit(task("late")).is_err());

        let mut succeeded = 0;
        let mut failed = 0;
        for _ in 0..5 {
            match rx.recv().await.unwrap().outcome {
                TaskOutcome::Succeeded(_) => succeeded += 1,
                TaskOutcome::Failed(_) => failed += 1,
                TaskOutcome::Cancelled => panic!("nothing should be cancelled"),
            }
        }
        pool.run().await;

        assert_eq!((succeeded, failed), (4, 1));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 5);
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(pool.worker_states().iter().all(|s| *s == WorkerState::Idle));
    }

    #[tokio::test]
    async fn abrupt_shutdown_cancels_queued_tasks() {
        let processor = Counting::closed();
        let (tx, mut rx) = mpsc::channel(16);
        let mut pool = WorkerPool::spawn(1, processor.clone(), tx);

        for id in ["a", "b", "c", "d"] {
            pool.submit(task(id)).unwrap();
        }
        // Wait for the single worker to pick up "a".
        processor.started.notified().await;
        assert_eq!(pool.worker_states(), vec![WorkerState::Executing]);

        pool.shutdown(false);
        processor.gate.add_permits(10);

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let result = rx.recv().await.unwrap();
            outcomes.push((result.task.record_id.0.clone(), result.outcome));
        }
        pool.run().await;

        assert_eq!(outcomes[0], ("a".to_string(), TaskOutcome::Succeeded(Payload::default())));
        assert!(
            outcomes[1..]
                .iter()
                .all(|(_, o)| *o == TaskOutcome::Cancelled)
        );
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn honours_not_before() {
        let processor = Counting::open();
        let (tx, mut rx) = mpsc::channel(4);
        let mut pool = WorkerPool::spawn(1, processor, tx);

        let start = Instant::now();
        let mut delayed = task("a");
        delayed.not_before = start + Duration::from_secs(2);
        pool.submit(delayed).unwrap();
        pool.shutdown(true);

        rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        pool.run().await;
    }
}
