/// Execution Scheduler - Bounded Pool with FIFO Admission
///
/// **State machine per submission:**
/// `Queued → Running → {Completed, Cancelled, Failed}`
///
/// **Guarantees:**
/// - At most `max_concurrent` submissions run at once; excess waits in FIFO order
/// - Cancelling a queued submission dequeues it immediately
/// - Cancelling a running submission signals every in-flight execution; the
///   verdict still arrives, with the interrupted test cases marked `Cancelled`
/// - A panic while executing marks the submission `Failed` and frees its slot
/// - Finished submissions stay queryable for the retention window
use codelab_common::{Challenge, ErrorKind, Language, Submission, SubmissionStatus, Verdict};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::executor::{execute_submission, ExecutionContext};
use crate::runner::LanguageRunner;

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionState {
    Queued,
    Running,
    Completed(Arc<Verdict>),
    /// Carries the partial verdict when cancelled while running
    Cancelled(Option<Arc<Verdict>>),
    Failed(String),
}

impl SubmissionState {
    pub fn status(&self) -> SubmissionStatus {
        match self {
            SubmissionState::Queued => SubmissionStatus::Queued,
            SubmissionState::Running => SubmissionStatus::Running,
            SubmissionState::Completed(_) => SubmissionStatus::Completed,
            SubmissionState::Cancelled(_) => SubmissionStatus::Cancelled,
            SubmissionState::Failed(_) => SubmissionStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn verdict(&self) -> Option<Arc<Verdict>> {
        match self {
            SubmissionState::Completed(verdict) => Some(verdict.clone()),
            SubmissionState::Cancelled(verdict) => verdict.clone(),
            _ => None,
        }
    }
}

/// Receiver side of one submission's state
#[derive(Debug, Clone)]
pub struct VerdictHandle {
    pub id: Uuid,
    pub language: Language,
    rx: watch::Receiver<SubmissionState>,
}

impl VerdictHandle {
    pub fn state(&self) -> SubmissionState {
        self.rx.borrow().clone()
    }

    pub fn status(&self) -> SubmissionStatus {
        self.rx.borrow().status()
    }

    /// Resolve once the submission reaches a terminal state
    pub async fn wait(mut self) -> SubmissionState {
        loop {
            let state = self.rx.borrow_and_update().clone();
            if state.is_terminal() {
                return state;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub active_executions: usize,
    pub peak_executions: usize,
    pub retained: usize,
}

struct Entry {
    submission: Arc<Submission>,
    challenge: Arc<Challenge>,
    state: watch::Sender<SubmissionState>,
    cancel: Option<CancelHandle>,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct PoolState {
    running: usize,
    queue: VecDeque<Uuid>,
    entries: HashMap<Uuid, Entry>,
}

struct Inner {
    ctx: ExecutionContext,
    max_concurrent: usize,
    retain: Duration,
    pool: Mutex<PoolState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // State transitions never panic midway; a poisoned lock still holds consistent data
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move queued submissions into free slots, oldest first
    fn admit(&self, pool: &mut PoolState) -> Vec<Start> {
        let mut starts = Vec::new();
        while pool.running < self.max_concurrent {
            let Some(id) = pool.queue.pop_front() else {
                break;
            };
            let Some(entry) = pool.entries.get_mut(&id) else {
                continue;
            };
            let (handle, signal) = cancel_pair();
            entry.cancel = Some(handle);
            entry.state.send_replace(SubmissionState::Running);
            pool.running += 1;
            starts.push(Start {
                id,
                submission: entry.submission.clone(),
                challenge: entry.challenge.clone(),
                signal,
            });
        }
        starts
    }

    fn prune(&self, pool: &mut PoolState) {
        let retain = self.retain;
        pool.entries
            .retain(|_, entry| entry.finished_at.map_or(true, |at| at.elapsed() < retain));
    }
}

struct Start {
    id: Uuid,
    submission: Arc<Submission>,
    challenge: Arc<Challenge>,
    signal: CancelSignal,
}

/// Holds a pool slot; releasing it publishes the final state and admits the next submission
struct SlotGuard {
    inner: Arc<Inner>,
    id: Uuid,
    outcome: Option<SubmissionState>,
}

impl SlotGuard {
    fn finish(mut self, state: SubmissionState) {
        self.outcome = Some(state);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| SubmissionState::Failed("execution aborted".to_string()));

        let starts = {
            let mut pool = self.inner.lock();
            if let Some(entry) = pool.entries.get_mut(&self.id) {
                entry.state.send_replace(outcome);
                entry.finished_at = Some(Instant::now());
                entry.cancel = None;
            }
            pool.running = pool.running.saturating_sub(1);
            self.inner.admit(&mut pool)
        };

        match Handle::try_current() {
            Ok(runtime) => {
                for start in starts {
                    spawn_run(&runtime, self.inner.clone(), start);
                }
            }
            Err(_) if starts.is_empty() => {}
            Err(_) => error!(count = starts.len(), "No runtime to start admitted submissions"),
        }
    }
}

fn spawn_run(runtime: &Handle, inner: Arc<Inner>, start: Start) {
    let inner_task = runtime.clone();
    runtime.spawn(async move {
        let guard = SlotGuard {
            inner: inner.clone(),
            id: start.id,
            outcome: None,
        };
        let ctx = inner.ctx.clone();
        let Start {
            id,
            submission,
            challenge,
            signal,
        } = start;
        let cancelled = signal.clone();

        // Inner task so a panic surfaces as a JoinError instead of tearing down this one
        let result = inner_task
            .spawn(async move { execute_submission(&ctx, &submission, &challenge, signal).await })
            .await;

        let state = match result {
            Ok(verdict) => settled_state(id, verdict, cancelled.is_cancelled()),
            Err(e) => {
                error!(submission_id = %id, error = %e, "Submission execution failed");
                SubmissionState::Failed(format!("execution failed: {}", e))
            }
        };
        guard.finish(state);
    });
}

/// A late cancel request does not relabel a verdict whose test cases all ran
fn settled_state(id: Uuid, verdict: Verdict, cancel_requested: bool) -> SubmissionState {
    let interrupted = verdict
        .results
        .iter()
        .any(|r| r.error == Some(ErrorKind::Cancelled));
    if cancel_requested && interrupted {
        info!(submission_id = %id, "Submission cancelled while running");
        SubmissionState::Cancelled(Some(Arc::new(verdict)))
    } else {
        SubmissionState::Completed(Arc::new(verdict))
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(ctx: ExecutionContext, max_concurrent: usize, retain: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                max_concurrent: max_concurrent.max(1),
                retain,
                pool: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Queue a submission; it starts as soon as a slot is free.
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(&self, submission: Submission, challenge: Arc<Challenge>) -> VerdictHandle {
        let id = submission.id;
        let language = submission.language;
        let (tx, rx) = watch::channel(SubmissionState::Queued);

        let starts = {
            let mut pool = self.inner.lock();
            self.inner.prune(&mut pool);
            pool.entries.insert(
                id,
                Entry {
                    submission: Arc::new(submission),
                    challenge,
                    state: tx,
                    cancel: None,
                    finished_at: None,
                },
            );
            pool.queue.push_back(id);
            info!(submission_id = %id, queued = pool.queue.len(), running = pool.running, "Submission queued");
            self.inner.admit(&mut pool)
        };

        let runtime = Handle::current();
        for start in starts {
            spawn_run(&runtime, self.inner.clone(), start);
        }

        VerdictHandle { id, language, rx }
    }

    pub fn state(&self, id: Uuid) -> Option<SubmissionState> {
        let pool = self.inner.lock();
        pool.entries.get(&id).map(|entry| entry.state.borrow().clone())
    }

    pub fn subscribe(&self, id: Uuid) -> Option<VerdictHandle> {
        let pool = self.inner.lock();
        pool.entries.get(&id).map(|entry| VerdictHandle {
            id,
            language: entry.submission.language,
            rx: entry.state.subscribe(),
        })
    }

    /// Request cancellation; returns the state right after the request,
    /// or `None` for an unknown submission
    pub fn cancel(&self, id: Uuid) -> Option<SubmissionState> {
        let mut pool = self.inner.lock();
        let current = pool.entries.get(&id)?.state.borrow().clone();

        match current {
            SubmissionState::Queued => {
                pool.queue.retain(|queued| *queued != id);
                let entry = pool.entries.get_mut(&id)?;
                let state = SubmissionState::Cancelled(None);
                entry.state.send_replace(state.clone());
                entry.finished_at = Some(Instant::now());
                info!(submission_id = %id, "Queued submission cancelled");
                Some(state)
            }
            SubmissionState::Running => {
                if let Some(handle) = &pool.entries.get(&id)?.cancel {
                    handle.cancel();
                }
                info!(submission_id = %id, "Cancellation requested for running submission");
                Some(SubmissionState::Running)
            }
            terminal => Some(terminal),
        }
    }

    /// Cancel everything queued or running
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<Uuid> = {
            let pool = self.inner.lock();
            pool.entries
                .iter()
                .filter(|(_, entry)| !entry.state.borrow().is_terminal())
                .map(|(id, _)| *id)
                .collect()
        };
        if !ids.is_empty() {
            warn!(count = ids.len(), "Cancelling all outstanding submissions");
        }
        for id in &ids {
            self.cancel(*id);
        }
        ids.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let pool = self.inner.lock();
        SchedulerStats {
            queued: pool.queue.len(),
            running: pool.running,
            active_executions: self.inner.ctx.gauge.active(),
            peak_executions: self.inner.ctx.gauge.peak(),
            retained: pool.entries.len(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn runner_for(&self, language: Language) -> Option<Arc<dyn LanguageRunner>> {
        self.inner.ctx.runners.get(language)
    }

    /// Languages with a registered runner
    pub fn languages(&self) -> Vec<Language> {
        self.inner.ctx.runners.languages()
    }

    pub fn isolation_backend(&self) -> &'static str {
        self.inner.ctx.boundary.name()
    }
}
