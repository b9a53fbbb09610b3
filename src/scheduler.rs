// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bounded parallel task execution.
//!
//! The scheduler takes a batch of [`SyncTask`]s and runs each one on a
//! worker, never more than `parallel` at a time. Results come back through a
//! [`ResultStream`] in completion order.
//!
//! # Worker Lifecycle
//!
//! 1. Acquire a permit. The permit is held across every retry attempt.
//! 2. Inspect local state, then resolve an action. Repeat before each attempt.
//! 3. Execute action on the Git backend, off the async runtime.
//! 4. Retry transient failures with exponential backoff.
//! 5. Send terminal result to the checkpoint recorder.
//!
//! # Cancellation
//!
//! Once the run token is raised, nothing new gets dispatched. Tasks that
//! never started produce no result at all, so a resumed run picks them up.
//! In-flight tasks get a grace period, after which they are aborted and
//! reported as cancelled.
//!
//! Blocking Git work cannot be dropped mid-flight. A task that times out or
//! gets aborted raises its operation token, then keeps its permit until the
//! blocking call returns. Parallelism never exceeds the bound, and nothing
//! touches a repository after its result went out.

use crate::{
    checkpoint::CheckpointStore,
    config::RunConfig,
    git::{ActionRequest, GitBackend, OperationError},
    inspect::InspectError,
    model::{Action, RepoKey, Status, SyncResult, SyncTask},
    resolve::{resolve, resolve_unmanaged, Resolution},
};

use futures::Stream;
use std::{
    collections::BTreeSet,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Instant,
};
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        Mutex, Semaphore,
    },
    task::{spawn_blocking, JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Reason given to tasks skipped because an earlier run settled them.
pub const CHECKPOINT_SKIP_REASON: &str = "already synced per checkpoint";

/// Parallel task scheduler.
pub struct Scheduler<B: GitBackend> {
    backend: Arc<B>,
    config: Arc<RunConfig>,
    checkpoint: CheckpointStore,
    cancel: CancellationToken,
}

impl<B: GitBackend> Scheduler<B> {
    /// Construct new scheduler.
    pub fn new(
        backend: Arc<B>,
        config: Arc<RunConfig>,
        checkpoint: CheckpointStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            config,
            checkpoint,
            cancel,
        }
    }

    /// Start running tasks in the background.
    ///
    /// Must be called from inside a Tokio runtime. Every dispatched task
    /// yields exactly one result on the returned stream, and the stream ends
    /// once all of them are in.
    pub fn submit(self, tasks: Vec<SyncTask>) -> ResultStream {
        let total = tasks.len();
        let peak = Arc::new(AtomicUsize::new(0));
        let (completion_tx, completion_rx) = unbounded_channel();
        let (result_tx, result_rx) = unbounded_channel();

        let settled = if self.config.force {
            BTreeSet::new()
        } else {
            self.checkpoint.settled_keys()
        };

        let persist = !self.config.dry_run;
        let store = self.checkpoint;
        spawn_blocking(move || record(store, persist, completion_rx, result_tx));

        let context = Arc::new(WorkerContext {
            backend: self.backend,
            config: self.config,
            cancel: self.cancel,
            abort: CancellationToken::new(),
            running: AtomicUsize::new(0),
            peak: peak.clone(),
        });
        tokio::spawn(dispatch(context, tasks, settled, completion_tx));

        ResultStream {
            inner: result_rx,
            peak,
            total,
        }
    }
}

/// Stream of terminal task results, in completion order.
#[derive(Debug)]
pub struct ResultStream {
    inner: UnboundedReceiver<SyncResult>,
    peak: Arc<AtomicUsize>,
    total: usize,
}

impl ResultStream {
    /// Highest number of tasks observed running at the same time so far.
    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of tasks submitted.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Stream for ResultStream {
    type Item = SyncResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_recv(cx)
    }
}

/// Result on its way to the checkpoint recorder.
struct Completion {
    result: SyncResult,
    record: bool,
}

struct WorkerContext<B> {
    backend: Arc<B>,
    config: Arc<RunConfig>,
    cancel: CancellationToken,

    /// Raised once the grace period after cancellation runs out.
    abort: CancellationToken,
    running: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

/// Single writer of the checkpoint file.
///
/// Runs on its own blocking thread. Records and flushes completions before
/// forwarding them, so a result is never observed before it is durable.
/// Completions that queued up during a write share the next one.
fn record(
    mut store: CheckpointStore,
    persist: bool,
    mut completions: UnboundedReceiver<Completion>,
    results: UnboundedSender<SyncResult>,
) {
    if persist {
        if let Err(err) = store.persist() {
            warn!("cannot create checkpoint {}: {err}", store.path().display());
        }
    }

    while let Some(first) = completions.blocking_recv() {
        let mut batch = vec![first];
        while let Ok(next) = completions.try_recv() {
            batch.push(next);
        }

        if persist && batch.iter().any(|completion| completion.record) {
            for completion in batch.iter().filter(|completion| completion.record) {
                store.record_result(&completion.result);
            }

            debug!("checkpoint {} completions", batch.len());
            if let Err(err) = store.persist() {
                warn!("cannot update checkpoint {}: {err}", store.path().display());
            }
        }

        for Completion { result, .. } in batch {
            if results.send(result).is_err() {
                debug!("result stream dropped, discarding result");
            }
        }
    }
}

async fn dispatch<B: GitBackend>(
    context: Arc<WorkerContext<B>>,
    tasks: Vec<SyncTask>,
    settled: BTreeSet<RepoKey>,
    completions: UnboundedSender<Completion>,
) {
    let semaphore = Arc::new(Semaphore::new(context.config.parallel.max(1)));
    let mut workers = JoinSet::new();
    let done = CancellationToken::new();
    tokio::spawn(abort_after_grace(
        context.cancel.clone(),
        context.abort.clone(),
        done.clone(),
        context.config.grace_period,
    ));

    for task in tasks {
        if context.cancel.is_cancelled() {
            break;
        }

        if settled.contains(&task.key) {
            debug!("{} settled by checkpoint", task.key);
            let result = SyncResult {
                key: task.key,
                path: task.path,
                status: Status::Skipped,
                action: None,
                reason: CHECKPOINT_SKIP_REASON.into(),
                duration: Default::default(),
                retries: 0,
            };
            let _ = completions.send(Completion {
                result,
                record: false,
            });
            continue;
        }

        let permit = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // INVARIANT: Cancellation wins over a permit that became free at
        // the same moment.
        if context.cancel.is_cancelled() {
            break;
        }

        let context = context.clone();
        let completions = completions.clone();
        workers.spawn(async move {
            let result = run_task(&context, task).await;
            drop(permit);
            let _ = completions.send(Completion {
                result,
                record: true,
            });
        });
    }

    if context.cancel.is_cancelled() {
        info!("cancellation requested, no further tasks dispatched");
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            warn!("worker ended abnormally: {err}");
        }
    }
    done.cancel();
}

async fn abort_after_grace(
    cancel: CancellationToken,
    abort: CancellationToken,
    done: CancellationToken,
    grace: std::time::Duration,
) {
    tokio::select! {
        _ = done.cancelled() => {}
        _ = cancel.cancelled() => {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    warn!("grace period of {grace:?} over, aborting in-flight tasks");
                    abort.cancel();
                }
            }
        }
    }
}

/// Attempt bookkeeping that survives a timed out attempt loop.
#[derive(Debug, Default)]
struct Progress {
    action: Option<Action>,
    retries: u32,
}

struct Outcome {
    status: Status,
    reason: String,
}

impl Outcome {
    fn new(status: Status, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self::new(Status::Failed, reason)
    }
}

#[instrument(skip(context, task), fields(key = %task.key), level = "debug")]
async fn run_task<B: GitBackend>(context: &WorkerContext<B>, task: SyncTask) -> SyncResult {
    let started = Instant::now();
    let running = context.running.fetch_add(1, Ordering::SeqCst) + 1;
    context.peak.fetch_max(running, Ordering::SeqCst);

    let operation = context.abort.child_token();
    let busy = Arc::new(Mutex::new(()));
    let mut progress = Progress::default();
    let attempts = attempt_loop(context, &task, &operation, &busy, &mut progress);

    let outcome = tokio::select! {
        biased;
        _ = context.abort.cancelled() => Outcome::failed("cancelled"),
        outcome = with_deadline(context.config.task_timeout, attempts) => match outcome {
            Some(outcome) => outcome,
            None => Outcome::failed(format!(
                "timeout after {}s",
                context.config.task_timeout.unwrap_or_default().as_secs_f64()
            )),
        },
    };

    // INVARIANT: Task holds its slot until detached Git work has stopped.
    operation.cancel();
    let idle = busy.lock().await;
    drop(idle);

    context.running.fetch_sub(1, Ordering::SeqCst);
    match outcome.status {
        Status::Failed | Status::Conflict => warn!("{} {}: {}", task.key, outcome.status, outcome.reason),
        Status::Success | Status::Skipped => info!("{} {}: {}", task.key, outcome.status, outcome.reason),
    }

    SyncResult {
        key: task.key,
        path: task.path,
        status: outcome.status,
        action: progress.action,
        reason: outcome.reason,
        duration: started.elapsed(),
        retries: progress.retries,
    }
}

async fn with_deadline<F: std::future::Future>(
    limit: Option<std::time::Duration>,
    future: F,
) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

/// Run blocking work off the runtime while holding the task's busy lock.
///
/// The lock guard moves into the blocking closure, so it stays held after
/// the awaiting future gets dropped by a timeout or abort.
async fn off_runtime<T, F>(busy: &Arc<Mutex<()>>, work: F) -> Result<T, JoinError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let guard = busy.clone().lock_owned().await;
    spawn_blocking(move || {
        let output = work();
        drop(guard);
        output
    })
    .await
}

async fn attempt_loop<B: GitBackend>(
    context: &WorkerContext<B>,
    task: &SyncTask,
    operation: &CancellationToken,
    busy: &Arc<Mutex<()>>,
    progress: &mut Progress,
) -> Outcome {
    let policy = context.config.retry;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let resolution = match resolve_task(context, task, busy).await {
            Ok(resolution) => resolution,
            Err(outcome) => return outcome,
        };
        progress.action = Some(resolution.action);

        match resolution.action {
            Action::Skip => return Outcome::new(Status::Skipped, resolution.rationale),
            Action::ConflictManualRequired => {
                return Outcome::new(Status::Conflict, resolution.rationale)
            }
            Action::Clone | Action::Reset | Action::Pull | Action::Fetch | Action::Rebase => {}
        }

        if context.config.dry_run {
            return Outcome::new(
                Status::Skipped,
                format!("dry run: would {}", resolution.action),
            );
        }

        let request = ActionRequest {
            action: resolution.action,
            path: task.path.clone(),
            clone_url: task.descriptor.clone_url.clone(),
            default_branch: task.descriptor.default_branch.clone(),
        };
        let backend = context.backend.clone();
        let token = operation.clone();
        let executed = off_runtime(busy, move || backend.execute(&request, &token)).await;

        let error = match executed {
            Ok(Ok(summary)) => return Outcome::new(Status::Success, summary),
            Ok(Err(error)) => error,
            Err(err) => return Outcome::failed(format!("worker panicked: {err}")),
        };

        match error {
            OperationError::Conflict(reason) => return Outcome::new(Status::Conflict, reason),
            OperationError::Cancelled => return Outcome::failed("cancelled"),
            OperationError::Permanent(reason) => return Outcome::failed(reason),
            OperationError::Transient(reason) if attempt >= policy.max_attempts => {
                return Outcome::failed(format!("{reason} (gave up after {attempt} attempts)"))
            }
            OperationError::Transient(reason) => {
                let delay = policy.delay(attempt);
                warn!(
                    "{} attempt {attempt} failed, retrying in {delay:?}: {reason}",
                    task.key
                );
                progress.retries += 1;

                tokio::select! {
                    _ = context.cancel.cancelled() => return Outcome::failed("cancelled"),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn resolve_task<B: GitBackend>(
    context: &WorkerContext<B>,
    task: &SyncTask,
    busy: &Arc<Mutex<()>>,
) -> Result<Resolution, Outcome> {
    let backend = context.backend.clone();
    let path = task.path.clone();
    let inspected = off_runtime(busy, move || backend.inspect(&path))
        .await
        .map_err(|err| Outcome::failed(format!("worker panicked: {err}")))?;

    match inspected {
        Ok(state) => Ok(resolve(task.strategy, &state)),
        Err(InspectError::NotAGitRepository(_)) => resolve_unmanaged(task.strategy)
            .ok_or_else(|| Outcome::failed("path exists but is not a git repository")),
        Err(err) => Err(Outcome::failed(format!("cannot inspect local state: {err}"))),
    }
}
