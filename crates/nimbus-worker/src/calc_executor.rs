//! Delete bitmap calculation executor.
//!
//! One [`CalcDeleteBitmapExecutor`] per worker owns a fixed pool of
//! calculation slots shared by every load. Each load opens a
//! [`CalcDeleteBitmapToken`]: a lane that caps how many of the pool's slots
//! its tasks may occupy, collects the first task failure as its terminal
//! status, and lets the load wait for all of its tasks.
//!
//! ```text
//! submit ─▶ lane permit ─▶ pool permit ─▶ blocking calc ─▶ merge ─▶ completion
//!              │                │
//!              └── cancel ──────┴──▶ abandoned
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use nimbus_core::id::{RowsetId, SegmentId, TabletId};
use nimbus_core::observability::calc_span;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, oneshot};
use tracing::{Instrument, debug, error, info};

use crate::calculator::{CalcTask, CrossRowsetTask, DeleteBitmapCalculator, IntraRowsetTask};
use crate::config::WorkerConfig;
use crate::error::{CalcError, Result};
use crate::metrics::{TaskResult, WorkerMetrics};

/// Terminal result of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Tablet of the task.
    pub tablet: TabletId,
    /// Rowset being loaded.
    pub rowset: RowsetId,
    /// Segment the task was about.
    pub segment: SegmentId,
    /// `Ok` once the marks were merged into the destination bitmap.
    pub result: Result<()>,
}

/// Receives a task's [`TaskOutcome`] exactly once.
#[derive(Debug)]
pub struct CompletionHandle {
    tablet: TabletId,
    rowset: RowsetId,
    segment: SegmentId,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl CompletionHandle {
    /// Waits for the task to finish.
    pub async fn outcome(self) -> TaskOutcome {
        // The sender is dropped without sending only if the runtime is
        // torn down under the task.
        let Self {
            tablet,
            rowset,
            segment,
            rx,
        } = self;
        rx.await.unwrap_or_else(|_| TaskOutcome {
            tablet,
            rowset,
            segment,
            result: Err(CalcError::runtime("task dropped before completing")),
        })
    }
}

struct ExecutorInner {
    pool: Arc<Semaphore>,
    calculator: Arc<dyn DeleteBitmapCalculator>,
    config: WorkerConfig,
    metrics: Arc<WorkerMetrics>,
    runtime: Handle,
    next_token: AtomicU64,
    shut_down: AtomicBool,
}

/// Fixed-size pool running delete bitmap calculations for many loads.
#[derive(Clone)]
pub struct CalcDeleteBitmapExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for CalcDeleteBitmapExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalcDeleteBitmapExecutor")
            .field("config", &self.inner.config)
            .field("available", &self.inner.pool.available_permits())
            .field("shut_down", &self.inner.shut_down.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl CalcDeleteBitmapExecutor {
    /// Creates the executor on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid configuration and `Runtime` when
    /// called outside a tokio runtime.
    pub fn new(
        config: WorkerConfig,
        calculator: Arc<dyn DeleteBitmapCalculator>,
        metrics: Arc<WorkerMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| CalcError::runtime(e.to_string()))?;
        info!(
            calc_threads = config.calc_threads,
            max_token_concurrency = config.max_token_concurrency,
            "starting delete bitmap calculation executor"
        );
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                pool: Arc::new(Semaphore::new(config.calc_threads)),
                calculator,
                config,
                metrics,
                runtime,
                next_token: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Opens a token on its own lane.
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`Self::shutdown`].
    pub fn create_token(&self) -> Result<CalcDeleteBitmapToken> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(CalcError::ShutDown);
        }
        let id = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.token_opened();
        debug!(token = id, "opened delete bitmap calculation token");
        Ok(CalcDeleteBitmapToken {
            id,
            executor: Arc::clone(&self.inner),
            state: Arc::new(TokenState {
                lane: Arc::new(Semaphore::new(self.inner.config.max_token_concurrency)),
                status: RwLock::new(None),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                cancelled: AtomicBool::new(false),
            }),
        })
    }

    /// Stops accepting work.
    ///
    /// Running tasks finish; queued tasks are abandoned with `ShutDown`.
    pub fn shutdown(&self) {
        if !self.inner.shut_down.swap(true, Ordering::AcqRel) {
            self.inner.pool.close();
            info!("delete bitmap calculation executor shut down");
        }
    }

    /// Returns true after [`Self::shutdown`].
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

struct TokenState {
    lane: Arc<Semaphore>,
    status: RwLock<Option<CalcError>>,
    pending: AtomicUsize,
    idle: Notify,
    cancelled: AtomicBool,
}

impl TokenState {
    fn status(&self) -> Result<()> {
        match &*self.status.read().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Records `err` unless a failure is already recorded.
    fn fail(&self, err: &CalcError) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if status.is_some() {
            return false;
        }
        *status = Some(err.clone());
        true
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A load's handle on the executor.
pub struct CalcDeleteBitmapToken {
    id: u64,
    executor: Arc<ExecutorInner>,
    state: Arc<TokenState>,
}

impl std::fmt::Debug for CalcDeleteBitmapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalcDeleteBitmapToken")
            .field("id", &self.id)
            .field("pending", &self.state.pending.load(Ordering::Acquire))
            .field("status", &self.state.status())
            .finish_non_exhaustive()
    }
}

impl CalcDeleteBitmapToken {
    /// Lane id, unique within the executor.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current status: the first failure, or `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the token's first recorded failure.
    pub fn status(&self) -> Result<()> {
        self.state.status()
    }

    /// Queues a cross-rowset comparison.
    ///
    /// # Errors
    ///
    /// Fails without queueing if the token already failed or was cancelled,
    /// or if the executor is shut down.
    pub fn submit_cross(&self, task: CrossRowsetTask) -> Result<CompletionHandle> {
        self.submit(CalcTask::Cross(task))
    }

    /// Queues a comparison of sibling segments.
    ///
    /// # Errors
    ///
    /// Same as [`Self::submit_cross`].
    pub fn submit_intra(&self, task: IntraRowsetTask) -> Result<CompletionHandle> {
        self.submit(CalcTask::Intra(task))
    }

    /// Queues either kind of task.
    ///
    /// # Errors
    ///
    /// Same as [`Self::submit_cross`].
    pub fn submit(&self, task: CalcTask) -> Result<CompletionHandle> {
        self.state.status()?;
        if self.state.cancelled.load(Ordering::Acquire) {
            return Err(CalcError::Cancelled);
        }
        if self.executor.shut_down.load(Ordering::Acquire) {
            return Err(CalcError::ShutDown);
        }

        let (tx, rx) = oneshot::channel();
        let handle = CompletionHandle {
            tablet: task.tablet(),
            rowset: task.rowset().clone(),
            segment: task.segment(),
            rx,
        };
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        self.executor.metrics.task_submitted(task.kind());

        let span = calc_span(
            task.kind(),
            task.tablet().get(),
            task.rowset().as_str(),
            task.segment().get(),
        );
        let executor = Arc::clone(&self.executor);
        let state = Arc::clone(&self.state);
        self.executor
            .runtime
            .spawn(run_task(executor, state, task, tx).instrument(span));
        Ok(handle)
    }

    /// Waits until every submitted task has finished and returns the
    /// token's terminal status.
    ///
    /// Calling it again returns the same status.
    ///
    /// # Errors
    ///
    /// Returns the first failure among the token's tasks, or `Cancelled`.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let idle = self.state.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.state.pending.load(Ordering::Acquire) == 0 {
                break;
            }
            idle.await;
        }
        self.state.status()
    }

    /// Abandons queued tasks and rejects further submissions.
    ///
    /// Running tasks still complete. A token with no failure yet ends with
    /// status `Cancelled`.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.lane.close();
        self.state.fail(&CalcError::Cancelled);
        info!(
            token = self.id,
            pending = self.state.pending.load(Ordering::Acquire),
            "cancelled delete bitmap calculation token"
        );
    }
}

impl Drop for CalcDeleteBitmapToken {
    fn drop(&mut self) {
        self.executor.metrics.token_closed();
    }
}

async fn run_task(
    executor: Arc<ExecutorInner>,
    state: Arc<TokenState>,
    task: CalcTask,
    tx: oneshot::Sender<TaskOutcome>,
) {
    let kind = task.kind();
    let started = Instant::now();
    let (result, task_result) = match execute(&executor, &state, &task).await {
        Ok(()) => (Ok(()), TaskResult::Succeeded),
        Err(err @ (CalcError::Cancelled | CalcError::ShutDown)) => {
            debug!(error = %err, "abandoned delete bitmap calculation");
            state.fail(&err);
            (Err(err), TaskResult::Abandoned)
        }
        Err(err) => {
            error!(
                tablet = task.tablet().get(),
                rowset = %task.rowset(),
                segment = task.segment().get(),
                error = %err,
                "delete bitmap calculation failed"
            );
            state.fail(&err);
            (Err(err), TaskResult::Failed)
        }
    };
    executor.metrics.task_finished(kind, task_result, started.elapsed());

    let _ = tx.send(TaskOutcome {
        tablet: task.tablet(),
        rowset: task.rowset().clone(),
        segment: task.segment(),
        result,
    });
    state.finish_one();
}

async fn execute(executor: &ExecutorInner, state: &TokenState, task: &CalcTask) -> Result<()> {
    let _lane = Arc::clone(&state.lane)
        .acquire_owned()
        .await
        .map_err(|_| CalcError::Cancelled)?;
    let _slot = Arc::clone(&executor.pool)
        .acquire_owned()
        .await
        .map_err(|_| CalcError::ShutDown)?;
    if state.cancelled.load(Ordering::Acquire) {
        return Err(CalcError::Cancelled);
    }

    let calculator = Arc::clone(&executor.calculator);
    let job = task.clone();
    let marks = executor
        .runtime
        .spawn_blocking(move || job.compute(calculator.as_ref()))
        .await
        .map_err(|e| CalcError::runtime(format!("calculation task panicked: {e}")))??;

    task.destination()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .merge(&marks);
    debug!(marks = marks.cardinality(), "merged delete bitmap marks");
    Ok(())
}
