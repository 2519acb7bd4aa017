//! Batch pipeline: the single writer of record state.
//!
//! A [`Pipeline`] walks the pending records of a batch, submits one task per
//! record to a [`WorkerPool`] and applies every [`TaskResult`] to the state
//! store from one controller loop. Transient failures wait on a delay queue
//! inside the controller and are resubmitted when due; workers never sleep on
//! backoff.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use enrichkit_shared::{
    BatchCounts, EnrichError, FailureReason, LookupKind, RecordId, RecordStatus, Result, RunId,
    StackItem, StateRecord, mask_email,
};
use enrichkit_storage::RunStatus;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::context::PipelineContext;
use crate::pool::{Task, TaskOutcome, TaskResult, WorkerPool};
use crate::processor::LookupProcessor;

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for batch runs.
pub trait ProgressReporter: Send + Sync {
    /// Called once before any task is submitted.
    fn started(&self, batch_id: &str, counts: &BatchCounts);
    /// Called when a record reaches a terminal status.
    fn record_finished(&self, record_id: &RecordId, status: RecordStatus);
    /// Called when a transient failure is queued for another attempt.
    fn retry_scheduled(&self, record_id: &RecordId, attempt: u32, delay: Duration);
    /// Called when the run ends, interrupted or not.
    fn done(&self, report: &BatchReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn started(&self, _batch_id: &str, _counts: &BatchCounts) {}
    fn record_finished(&self, _record_id: &RecordId, _status: RecordStatus) {}
    fn retry_scheduled(&self, _record_id: &RecordId, _attempt: u32, _delay: Duration) {}
    fn done(&self, _report: &BatchReport) {}
}

/// Outcome of one [`Pipeline::run`].
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: String,
    pub run_id: RunId,
    /// Counts read back from the store after the run.
    pub counts: BatchCounts,
    /// Tasks handed to the pool, retries included.
    pub submitted: u64,
    pub retries_scheduled: u64,
    /// Discovered URLs that were new to the work stack.
    pub stack_pushed: u64,
    /// The stop signal ended the run before the batch was exhausted.
    pub interrupted: bool,
    pub elapsed: Duration,
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`,
/// capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    kind: LookupKind,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(ctx: Arc<PipelineContext>, kind: LookupKind) -> Self {
        Self {
            ctx,
            kind,
            progress: Arc::new(SilentProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn kind(&self) -> LookupKind {
        self.kind
    }

    /// Process every pending record of `batch_id` until the batch is done or
    /// the context's stop signal fires.
    ///
    /// Records left `InProgress` or `Failed` by an earlier run are picked up
    /// again. Storage failures end the run with an error; a failing record
    /// never does.
    #[instrument(skip_all, fields(batch_id = %batch_id, kind = %self.kind))]
    pub async fn run(&self, batch_id: &str) -> Result<BatchReport> {
        self.ctx.require_adapter(self.kind)?;

        let storage = &self.ctx.storage;
        let initial = storage.batch_counts(batch_id).await?;
        let run_id = RunId::new();
        storage.insert_run(&run_id, batch_id, self.kind).await?;

        let start = Instant::now();
        info!(%run_id, total = initial.total(), pending = initial.pending, "starting batch run");
        self.progress.started(batch_id, &initial);

        let settled = match self.drive(batch_id).await {
            Ok(stats) => storage
                .batch_counts(batch_id)
                .await
                .map(|counts| (stats, counts)),
            Err(e) => Err(e),
        };
        let (stats, counts) = match settled {
            Ok(settled) => settled,
            Err(e) => {
                warn!(%run_id, error = %e, "batch run failed");
                let stats = serde_json::json!({ "error": e.to_string() }).to_string();
                if let Err(finish_err) = storage
                    .finish_run(&run_id, RunStatus::Failed, Some(&stats))
                    .await
                {
                    warn!(error = %finish_err, "could not record failed run");
                }
                return Err(e);
            }
        };

        let report = BatchReport {
            batch_id: batch_id.to_string(),
            run_id,
            counts,
            submitted: stats.submitted,
            retries_scheduled: stats.retries_scheduled,
            stack_pushed: stats.stack_pushed,
            interrupted: stats.interrupted,
            elapsed: start.elapsed(),
        };

        let status = if report.interrupted {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        };
        let stats_json = serde_json::json!({
            "counts": report.counts,
            "submitted": report.submitted,
            "retries_scheduled": report.retries_scheduled,
            "stack_pushed": report.stack_pushed,
            "elapsed_ms": report.elapsed.as_millis() as u64,
        })
        .to_string();
        storage
            .finish_run(&report.run_id, status, Some(&stats_json))
            .await?;

        info!(
            run_id = %report.run_id,
            succeeded = counts.succeeded,
            failed_permanently = counts.failed_permanently,
            failed_exhausted = counts.failed_exhausted,
            pending = counts.pending,
            interrupted = report.interrupted,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch run finished"
        );
        self.progress.done(&report);
        Ok(report)
    }

    async fn drive(&self, batch_id: &str) -> Result<RunStats> {
        let workers = self.ctx.config.workers.max(1);
        let (results_tx, mut results_rx) = mpsc::channel(workers * 2);
        let processor = Arc::new(LookupProcessor::new(self.ctx.clone()));
        let mut pool = WorkerPool::spawn(workers, processor, results_tx);

        let mut controller = Controller::new(&self.ctx, batch_id, self.kind, &*self.progress);
        let outcome = controller.drive(&pool, &mut results_rx).await;

        // After an error, tasks still running are abandoned; their records stay
        // `InProgress` and are recovered by the next run.
        pool.shutdown(outcome.is_ok());
        drop(results_rx);
        pool.run().await;

        outcome.map(|()| controller.stats)
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RunStats {
    submitted: u64,
    retries_scheduled: u64,
    stack_pushed: u64,
    interrupted: bool,
}

/// A `Failed` record waiting for its retry.
struct Delayed {
    due: Instant,
    seq: u64,
    record: StateRecord,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

struct Controller<'a> {
    ctx: &'a PipelineContext,
    batch_id: &'a str,
    kind: LookupKind,
    progress: &'a dyn ProgressReporter,
    /// `Pending` records ready for submission.
    buffer: VecDeque<StateRecord>,
    /// Every record this run has taken from the cursor.
    claimed: HashSet<RecordId>,
    /// Submitted records at their saved `InProgress` version.
    in_flight: HashMap<RecordId, StateRecord>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    delay_seq: u64,
    stopping: bool,
    stats: RunStats,
}

impl<'a> Controller<'a> {
    fn new(
        ctx: &'a PipelineContext,
        batch_id: &'a str,
        kind: LookupKind,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            ctx,
            batch_id,
            kind,
            progress,
            buffer: VecDeque::new(),
            claimed: HashSet::new(),
            in_flight: HashMap::new(),
            delayed: BinaryHeap::new(),
            delay_seq: 0,
            stopping: false,
            stats: RunStats::default(),
        }
    }

    /// Outstanding task cap; keeps the pool busy without flooding its queue.
    fn capacity(&self) -> usize {
        self.ctx.config.workers.max(1) * 2
    }

    async fn drive(
        &mut self,
        pool: &WorkerPool,
        results: &mut mpsc::Receiver<TaskResult>,
    ) -> Result<()> {
        let ctx = self.ctx;
        let stop = ctx.stop_signal();
        // Records staged for another kind belong to another pipeline.
        let mut cursor = ctx
            .storage
            .list_pending(self.batch_id, ctx.config.page_size)
            .of_kind(self.kind);
        let mut rechecked = false;

        loop {
            if stop.is_triggered() {
                return self.wind_down(pool, results).await;
            }

            self.release_due().await?;

            // Refill from the cursor.
            while self.buffer.len() < self.capacity() && !cursor.is_exhausted() {
                for record in cursor.next_page().await? {
                    if !self.claimed.insert(record.record_id.clone()) {
                        continue;
                    }
                    if let Some(ready) = self.reclaim(record).await? {
                        self.buffer.push_back(ready);
                        rechecked = false;
                    }
                }
            }

            self.submit_ready(pool).await?;

            let idle = self.in_flight.is_empty() && self.buffer.is_empty();
            if idle && self.delayed.is_empty() && cursor.is_exhausted() {
                if rechecked {
                    return Ok(());
                }
                // Look once more for records written since the cursor passed.
                debug!("pending cursor exhausted, re-checking");
                cursor.restart();
                rechecked = true;
                continue;
            }
            if self.in_flight.is_empty() && self.delayed.is_empty() {
                continue;
            }

            let next_due = self.delayed.peek().map(|Reverse(d)| d.due);
            tokio::select! {
                result = results.recv(), if !self.in_flight.is_empty() => match result {
                    Some(result) => self.apply(result).await?,
                    None => return Err(EnrichError::config("worker pool exited with tasks outstanding")),
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {}
                _ = stop.triggered() => {}
            }
        }
    }

    /// Stop submitting, cancel queued work and apply results of tasks that
    /// were already running.
    async fn wind_down(
        &mut self,
        pool: &WorkerPool,
        results: &mut mpsc::Receiver<TaskResult>,
    ) -> Result<()> {
        info!(
            in_flight = self.in_flight.len(),
            delayed = self.delayed.len(),
            "stop requested, winding down"
        );
        self.stopping = true;
        self.stats.interrupted = true;
        pool.shutdown(false);

        // Buffered records are still `Pending`; delayed ones stay `Failed` and
        // are picked up by the next run.
        self.buffer.clear();
        self.delayed.clear();

        while !self.in_flight.is_empty() {
            match results.recv().await {
                Some(result) => self.apply(result).await?,
                None => break,
            }
        }
        Ok(())
    }

    /// Bring a record left over from an earlier run back to `Pending`.
    ///
    /// Returns `None` when the record needs no more work.
    async fn reclaim(&mut self, record: StateRecord) -> Result<Option<StateRecord>> {
        let storage = &self.ctx.storage;
        match record.status {
            RecordStatus::Pending => Ok(Some(record)),
            RecordStatus::InProgress => {
                debug!(record_id = %record.record_id, "recovering interrupted attempt");
                let saved = storage
                    .save_state(&record.with_status(RecordStatus::Pending))
                    .await?;
                Ok(Some(saved.into_record()))
            }
            RecordStatus::Failed if record.attempt_count > self.ctx.config.max_retries => {
                let mut next = record.with_status(RecordStatus::FailedPermanently);
                next.failure = Some(FailureReason::Exhausted);
                storage.save_state(&next).await?;
                self.progress
                    .record_finished(&record.record_id, RecordStatus::FailedPermanently);
                Ok(None)
            }
            RecordStatus::Failed => {
                let saved = storage
                    .save_state(&record.with_status(RecordStatus::Pending))
                    .await?;
                Ok(Some(saved.into_record()))
            }
            RecordStatus::Succeeded | RecordStatus::FailedPermanently => Ok(None),
        }
    }

    /// Move due retries back to `Pending` and into the buffer.
    async fn release_due(&mut self) -> Result<()> {
        let now = Instant::now();
        while self.delayed.peek().is_some_and(|Reverse(d)| d.due <= now) {
            let Some(Reverse(due)) = self.delayed.pop() else {
                break;
            };
            let saved = self
                .ctx
                .storage
                .save_state(&due.record.with_status(RecordStatus::Pending))
                .await?;
            self.buffer.push_back(saved.into_record());
        }
        Ok(())
    }

    async fn submit_ready(&mut self, pool: &WorkerPool) -> Result<()> {
        while self.in_flight.len() < self.capacity() {
            let Some(record) = self.buffer.pop_front() else {
                break;
            };

            let started = match self
                .ctx
                .storage
                .save_state(&record.with_status(RecordStatus::InProgress))
                .await
            {
                Ok(saved) => saved.into_record(),
                Err(e @ (EnrichError::StaleVersion { .. } | EnrichError::InvalidTransition { .. })) => {
                    // Changed under us; leave it for a later run.
                    warn!(record_id = %record.record_id, error = %e, "skipping record");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let task = Task {
                batch_id: self.batch_id.to_string(),
                record_id: started.record_id.clone(),
                kind: self.kind,
                input: started.input.clone(),
                attempt: started.attempt_count,
                not_before: Instant::now(),
            };
            if pool.submit(task).is_err() {
                return Err(EnrichError::config("worker pool stopped accepting tasks"));
            }
            self.stats.submitted += 1;
            self.in_flight.insert(started.record_id.clone(), started);
        }
        Ok(())
    }

    /// Apply one task result to the state store.
    async fn apply(&mut self, result: TaskResult) -> Result<()> {
        let record_id = result.task.record_id;
        let Some(current) = self.in_flight.remove(&record_id) else {
            warn!(%record_id, "result for a task that is not in flight");
            return Ok(());
        };
        let storage = &self.ctx.storage;
        let attempts = current.attempt_count + 1;

        match result.outcome {
            TaskOutcome::Succeeded(payload) => {
                let mut next = current.with_status(RecordStatus::Succeeded);
                next.attempt_count = attempts;
                next.last_error = None;
                next.failure = None;

                let item = payload.discovered_url.as_ref().map(|url| StackItem {
                    url: url.clone(),
                    record_id: record_id.clone(),
                    batch_id: self.batch_id.to_string(),
                    email: current.input.email.clone(),
                    pushed_at: Utc::now(),
                    consumed: false,
                });
                next.payload = Some(payload);

                let push = item
                    .as_ref()
                    .map(|item| (self.ctx.config.stack_name.as_str(), item));
                let (_, pushed) = storage.commit_success(&next, push).await?;
                if pushed == Some(true) {
                    self.stats.stack_pushed += 1;
                }
                debug!(
                    %record_id,
                    attempts,
                    worker = result.worker,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "record succeeded"
                );
                self.progress
                    .record_finished(&record_id, RecordStatus::Succeeded);
            }

            TaskOutcome::Failed(err) if err.is_transient() && attempts <= self.ctx.config.max_retries => {
                let mut next = current.with_status(RecordStatus::Failed);
                next.attempt_count = attempts;
                next.last_error = Some(err.to_string());
                let saved = storage.save_state(&next).await?.into_record();

                if self.stopping {
                    debug!(%record_id, attempts, "transient failure while stopping, retry deferred");
                    return Ok(());
                }
                let delay = backoff_delay(
                    self.ctx.config.base_delay,
                    self.ctx.config.max_delay,
                    attempts,
                );
                debug!(%record_id, attempts, delay_ms = delay.as_millis() as u64, error = %err, "retry scheduled");
                self.delay_seq += 1;
                self.delayed.push(Reverse(Delayed {
                    due: Instant::now() + delay,
                    seq: self.delay_seq,
                    record: saved,
                }));
                self.stats.retries_scheduled += 1;
                self.progress.retry_scheduled(&record_id, attempts, delay);
            }

            TaskOutcome::Failed(err) => {
                let reason = if err.is_transient() {
                    FailureReason::Exhausted
                } else {
                    FailureReason::Permanent
                };
                let mut next = current.with_status(RecordStatus::FailedPermanently);
                next.attempt_count = attempts;
                next.last_error = Some(err.to_string());
                next.failure = Some(reason);
                storage.save_state(&next).await?;

                let email = current.input.email.as_deref().map(mask_email);
                warn!(
                    %record_id,
                    email = email.as_deref().unwrap_or("-"),
                    attempts,
                    reason = reason.as_str(),
                    error = %err,
                    "record failed permanently"
                );
                self.progress
                    .record_finished(&record_id, RecordStatus::FailedPermanently);
            }

            TaskOutcome::Cancelled => {
                storage
                    .save_state(&current.with_status(RecordStatus::Pending))
                    .await?;
                debug!(%record_id, "task cancelled before it ran");
            }
        }
        Ok(())
    }
}
