//! ---
//! kiln_section: "01-core-functionality"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Bounded-concurrency job scheduler with lazily scaled workers."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
//! Supervisor/worker job scheduler.
//!
//! Jobs are queued FIFO and handed to worker tasks by a single supervisor
//! task. Workers are only spawned while there is queued work and the ceiling
//! has not been reached; a worker that asks for work and finds the queue empty
//! retires, so an idle scheduler holds no workers at all.
use std::collections::hash_map;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Identifier of a scheduled job.
pub type JobId = String;

/// Final outcome recorded for a single job.
pub type JobOutcome<E> = Result<(), JobFailure<E>>;

/// Errors returned by [`JobScheduler`] itself, as opposed to job failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A job with the same id is still queued or running.
    #[error("job '{0}' is already queued or running")]
    DuplicateJob(JobId),
    /// `wait` has been called; the scheduler accepts no further jobs.
    #[error("scheduler no longer accepts jobs")]
    Closed,
}

/// Why a job did not complete successfully.
#[derive(Debug, Error)]
pub enum JobFailure<E> {
    /// The job returned an error.
    #[error("{0}")]
    Failed(E),
    /// The job panicked; the payload message is preserved when it is a string.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl<E> JobFailure<E> {
    /// Borrow the job's own error, if it returned one.
    pub fn error(&self) -> Option<&E> {
        match self {
            JobFailure::Failed(err) => Some(err),
            JobFailure::Panicked(_) => None,
        }
    }
}

struct Job<E> {
    id: JobId,
    task: BoxFuture<'static, Result<(), E>>,
}

struct QueueState<E> {
    pending: VecDeque<Job<E>>,
    live: HashSet<JobId>,
    closed: bool,
}

struct Shared<E> {
    state: Mutex<QueueState<E>>,
    results: Mutex<HashMap<JobId, JobOutcome<E>>>,
    outstanding: watch::Sender<usize>,
    active_workers: AtomicUsize,
    peak_workers: AtomicUsize,
}

impl<E> Shared<E> {
    fn pop_next(&self) -> Option<Job<E>> {
        self.state.lock().pending.pop_front()
    }

    fn complete(&self, id: JobId, outcome: JobOutcome<E>) {
        self.results.lock().insert(id.clone(), outcome);
        self.state.lock().live.remove(&id);
        self.outstanding.send_modify(|count| *count = count.saturating_sub(1));
    }
}

enum Signal<E> {
    /// A job was pushed onto the queue.
    Submitted,
    /// A worker finished its job and asks for the next one.
    Ready(oneshot::Sender<Option<Job<E>>>),
}

/// Aggregated results returned by [`JobScheduler::wait`].
#[derive(Debug)]
pub struct JobResults<E> {
    outcomes: HashMap<JobId, JobOutcome<E>>,
}

impl<E> JobResults<E> {
    /// Outcome for a single job id.
    pub fn get(&self, id: &str) -> Option<&JobOutcome<E>> {
        self.outcomes.get(id)
    }

    /// Number of recorded outcomes.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True when no job was submitted.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// True when every job completed without error.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }

    /// Failed jobs, sorted by id so reports are stable.
    pub fn failures(&self) -> Vec<(&str, &JobFailure<E>)> {
        let mut failed: Vec<_> = self
            .outcomes
            .iter()
            .filter_map(|(id, outcome)| outcome.as_ref().err().map(|err| (id.as_str(), err)))
            .collect();
        failed.sort_by(|a, b| a.0.cmp(b.0));
        failed
    }
}

impl<E> IntoIterator for JobResults<E> {
    type Item = (JobId, JobOutcome<E>);
    type IntoIter = hash_map::IntoIter<JobId, JobOutcome<E>>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}

/// Bounded-concurrency job scheduler.
///
/// Must be created inside a tokio runtime; the supervisor task is spawned on
/// construction.
pub struct JobScheduler<E> {
    shared: Arc<Shared<E>>,
    signals: Mutex<Option<mpsc::UnboundedSender<Signal<E>>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    max_concurrency: usize,
}

impl<E> std::fmt::Debug for JobScheduler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("max_concurrency", &self.max_concurrency)
            .field(
                "active_workers",
                &self.shared.active_workers.load(Ordering::SeqCst),
            )
            .finish()
    }
}

impl<E> JobScheduler<E>
where
    E: Send + 'static,
{
    /// Create a scheduler running at most `max_concurrency` jobs at once.
    /// A ceiling of zero is raised to one.
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = if max_concurrency == 0 {
            warn!("job scheduler ceiling of 0 requested; using 1");
            1
        } else {
            max_concurrency
        };
        let (outstanding, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                live: HashSet::new(),
                closed: false,
            }),
            results: Mutex::new(HashMap::new()),
            outstanding,
            active_workers: AtomicUsize::new(0),
            peak_workers: AtomicUsize::new(0),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        // Workers hold strong senders; the supervisor keeps a weak one so the
        // channel closes once the scheduler and every worker are gone.
        let supervisor = tokio::spawn(supervise(
            shared.clone(),
            rx,
            tx.downgrade(),
            max_concurrency,
        ));
        Self {
            shared,
            signals: Mutex::new(Some(tx)),
            supervisor: Mutex::new(Some(supervisor)),
            max_concurrency,
        }
    }

    /// Concurrency ceiling for this scheduler.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of worker tasks currently alive.
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously alive workers observed so far.
    pub fn peak_workers(&self) -> usize {
        self.shared.peak_workers.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Queue a job under `id`.
    ///
    /// Fails with [`SchedulerError::DuplicateJob`] while another job with the
    /// same id is queued or running, and with [`SchedulerError::Closed`] once
    /// [`wait`](Self::wait) has started.
    pub fn submit<F>(&self, id: impl Into<JobId>, job: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let id = id.into();
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SchedulerError::Closed);
            }
            if !state.live.insert(id.clone()) {
                return Err(SchedulerError::DuplicateJob(id));
            }
            state.pending.push_back(Job {
                id: id.clone(),
                task: job.boxed(),
            });
            self.shared.outstanding.send_modify(|count| *count += 1);
        }

        let sent = self
            .signals
            .lock()
            .as_ref()
            .map(|tx| tx.send(Signal::Submitted).is_ok())
            .unwrap_or(false);
        if !sent {
            // The supervisor is gone: undo the bookkeeping so wait() cannot hang.
            let mut state = self.shared.state.lock();
            state.pending.retain(|queued| queued.id != id);
            state.live.remove(&id);
            self.shared
                .outstanding
                .send_modify(|count| *count = count.saturating_sub(1));
            return Err(SchedulerError::Closed);
        }
        debug!(job = %id, "job queued");
        Ok(())
    }

    /// Stop accepting jobs, wait for every submitted job to finish and return
    /// one outcome per job id. A second call returns [`SchedulerError::Closed`].
    pub async fn wait(&self) -> Result<JobResults<E>, SchedulerError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SchedulerError::Closed);
            }
            state.closed = true;
        }

        let mut outstanding = self.shared.outstanding.subscribe();
        let _ = outstanding.wait_for(|count| *count == 0).await;

        // Dropping our sender lets the supervisor exit once every worker retired.
        let signals = self.signals.lock().take();
        drop(signals);
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(err) = handle.await {
                warn!(error = %err, "job supervisor join error");
            }
        }

        let outcomes = std::mem::take(&mut *self.shared.results.lock());
        debug!(jobs = outcomes.len(), "job scheduler drained");
        Ok(JobResults { outcomes })
    }
}

async fn supervise<E>(
    shared: Arc<Shared<E>>,
    mut signals: mpsc::UnboundedReceiver<Signal<E>>,
    worker_tx: mpsc::WeakUnboundedSender<Signal<E>>,
    max_concurrency: usize,
) where
    E: Send + 'static,
{
    let mut active = 0usize;

    while let Some(signal) = signals.recv().await {
        match signal {
            Signal::Submitted => {
                while active < max_concurrency {
                    let Some(job) = shared.pop_next() else {
                        break;
                    };
                    let Some(tx) = worker_tx.upgrade() else {
                        shared.state.lock().pending.push_front(job);
                        break;
                    };
                    active += 1;
                    shared.active_workers.store(active, Ordering::SeqCst);
                    shared.peak_workers.fetch_max(active, Ordering::SeqCst);
                    trace!(active, "spawning worker");
                    tokio::spawn(work(shared.clone(), tx, job));
                }
            }
            Signal::Ready(reply) => match shared.pop_next() {
                Some(job) => {
                    if let Err(Some(job)) = reply.send(Some(job)) {
                        shared.state.lock().pending.push_front(job);
                        active = active.saturating_sub(1);
                        shared.active_workers.store(active, Ordering::SeqCst);
                    }
                }
                None => {
                    active = active.saturating_sub(1);
                    shared.active_workers.store(active, Ordering::SeqCst);
                    trace!(active, "worker retired");
                    let _ = reply.send(None);
                }
            },
        }
    }
    debug!("job supervisor stopped");
}

async fn work<E>(shared: Arc<Shared<E>>, signals: mpsc::UnboundedSender<Signal<E>>, first: Job<E>)
where
    E: Send + 'static,
{
    let mut job = first;
    loop {
        let Job { id, task } = job;
        trace!(job = %id, "job started");
        let outcome = match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(JobFailure::Failed(err)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(job = %id, panic = %message, "job panicked");
                Err(JobFailure::Panicked(message))
            }
        };
        debug!(job = %id, success = outcome.is_ok(), "job finished");
        shared.complete(id, outcome);

        let (reply_tx, reply_rx) = oneshot::channel();
        if signals.send(Signal::Ready(reply_tx)).is_err() {
            break;
        }
        match reply_rx.await {
            Ok(Some(next)) => job = next,
            _ => break,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
