//! Bounded pool of warm compilers plus per-request subtask tracking.
//!
//! Workers are created lazily up to `poolsize` and then recycled; a caller
//! asking for one while all are busy blocks until another is released. The
//! pool also keeps the request counters the server's lifecycle checks rely on.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compiler::{Compiler, CompilerFactory};
use crate::worker::CompilerThread;

pub(crate) const POOL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::pool");

/// Errors reported by the pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool no longer hands out workers.
    #[error("compiler pool has been shut down")]
    ShutDown,
}

/// Identifies the request that owns a set of subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "request-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct SubtaskState {
    pending: usize,
    failures: Vec<String>,
}

struct PoolState {
    idle: Vec<(usize, Box<dyn Compiler>)>,
    created: usize,
    next_worker: usize,
    next_request: u64,
    active_requests: usize,
    requests_served: u64,
    last_finished: Instant,
    subtasks: HashMap<RequestId, SubtaskState>,
    shut_down: bool,
}

impl PoolState {
    fn pending_subtasks(&self) -> usize {
        self.subtasks.values().map(|state| state.pending).sum()
    }
}

/// Fixed-size pool of [`CompilerThread`]s.
pub struct CompilerPool {
    factory: Arc<dyn CompilerFactory>,
    poolsize: usize,
    state: Mutex<PoolState>,
    worker_released: Condvar,
    subtask_finished: Condvar,
}

impl std::fmt::Debug for CompilerPool {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CompilerPool")
            .field("poolsize", &self.poolsize)
            .finish_non_exhaustive()
    }
}

impl CompilerPool {
    /// Creates an empty pool; no compiler is built until the first `grab`.
    #[must_use]
    pub fn new(factory: Arc<dyn CompilerFactory>, poolsize: usize) -> Arc<Self> {
        Arc::new(Self {
            factory,
            poolsize: poolsize.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                created: 0,
                next_worker: 0,
                next_request: 0,
                active_requests: 0,
                requests_served: 0,
                last_finished: Instant::now(),
                subtasks: HashMap::new(),
                shut_down: false,
            }),
            worker_released: Condvar::new(),
            subtask_finished: Condvar::new(),
        })
    }

    /// Maximum number of workers.
    #[must_use]
    pub const fn poolsize(&self) -> usize {
        self.poolsize
    }

    /// Returns an idle worker, creating one while below the cap and blocking
    /// at the cap until a worker is released.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShutDown`] once [`CompilerPool::shutdown`] ran,
    /// including for callers that were blocked when it did.
    pub fn grab(self: &Arc<Self>) -> Result<CompilerThread, PoolError> {
        let mut state = self.lock();
        loop {
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            if let Some((id, compiler)) = state.idle.pop() {
                return Ok(CompilerThread::new(id, compiler, Arc::clone(self)));
            }
            if state.created < self.poolsize {
                state.created += 1;
                let id = state.next_worker;
                state.next_worker += 1;
                drop(state);
                debug!(target: POOL_TARGET, worker = id, "creating compiler");
                let compiler = self.factory.create();
                return Ok(CompilerThread::new(id, compiler, Arc::clone(self)));
            }
            state = self
                .worker_released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns a worker to the pool.
    ///
    /// A worker whose compiler panicked is discarded so that its slot can be
    /// filled by a fresh compiler.
    pub fn release(&self, worker: CompilerThread) {
        let (id, compiler, poisoned) = worker.into_parts();
        let mut state = self.lock();
        if poisoned {
            state.created = state.created.saturating_sub(1);
            warn!(target: POOL_TARGET, worker = id, "discarding compiler after panic");
        } else if !state.shut_down {
            state.idle.push((id, compiler));
        }
        drop(state);
        self.worker_released.notify_one();
    }

    /// Records the start of a request.
    pub fn start_request(&self) {
        self.lock().active_requests += 1;
    }

    /// Records the end of a request.
    pub fn finish_request(&self) {
        let mut state = self.lock();
        state.active_requests = state.active_requests.saturating_sub(1);
        state.requests_served += 1;
        state.last_finished = Instant::now();
    }

    /// Records the end of a connection that carried no request.
    ///
    /// Neither the served count nor the idle clock changes.
    pub fn abandon_request(&self) {
        let mut state = self.lock();
        state.active_requests = state.active_requests.saturating_sub(1);
    }

    /// Number of requests currently being served.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().active_requests
    }

    /// When the most recent request finished, or when the pool was created.
    #[must_use]
    pub fn last_request_finished(&self) -> Instant {
        self.lock().last_finished
    }

    /// Total number of finished requests.
    #[must_use]
    pub fn requests_served(&self) -> u64 {
        self.lock().requests_served
    }

    /// Opens a subtask scope for a new request.
    #[must_use]
    pub fn subtask_scope(self: &Arc<Self>) -> SubtaskScope {
        let mut state = self.lock();
        let owner = RequestId(state.next_request);
        state.next_request += 1;
        SubtaskScope {
            owner,
            pool: Arc::clone(self),
        }
    }

    /// Runs `task` on its own thread on behalf of `owner`.
    ///
    /// A task returning `Err` or panicking is recorded as a failure that
    /// [`CompilerPool::wait_for_subtasks`] reports.
    pub fn submit_subtask<F>(self: &Arc<Self>, owner: RequestId, task: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        self.lock().subtasks.entry(owner).or_default().pending += 1;
        let pool = Arc::clone(self);
        thread::spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(outcome) => outcome,
                Err(payload) => Err(format!("subtask panicked: {}", panic_message(&*payload))),
            };
            pool.finish_subtask(owner, outcome);
        });
    }

    /// Blocks until every subtask of `owner` finished and returns their
    /// failures in completion order.
    #[must_use]
    pub fn wait_for_subtasks(&self, owner: RequestId) -> Vec<String> {
        let mut state = self.lock();
        while state
            .subtasks
            .get(&owner)
            .is_some_and(|subtasks| subtasks.pending > 0)
        {
            state = self
                .subtask_finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
            .subtasks
            .remove(&owner)
            .map(|subtasks| subtasks.failures)
            .unwrap_or_default()
    }

    /// Stops handing out workers, wakes blocked callers of `grab` and waits
    /// for outstanding subtasks.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if !state.shut_down {
            state.shut_down = true;
            state.idle.clear();
            info!(
                target: POOL_TARGET,
                served = state.requests_served,
                created = state.created,
                "compiler pool shutting down"
            );
        }
        self.worker_released.notify_all();
        while state.pending_subtasks() > 0 {
            state = self
                .subtask_finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish_subtask(&self, owner: RequestId, outcome: Result<(), String>) {
        let mut state = self.lock();
        let subtasks = state.subtasks.entry(owner).or_default();
        subtasks.pending = subtasks.pending.saturating_sub(1);
        if let Err(failure) = outcome {
            debug!(target: POOL_TARGET, %owner, %failure, "subtask failed");
            subtasks.failures.push(failure);
        }
        drop(state);
        self.subtask_finished.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle through which a compiler schedules work tied to its request.
#[derive(Clone)]
pub struct SubtaskScope {
    owner: RequestId,
    pool: Arc<CompilerPool>,
}

impl std::fmt::Debug for SubtaskScope {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SubtaskScope")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl SubtaskScope {
    /// Request owning the subtasks spawned through this scope.
    #[must_use]
    pub const fn owner(&self) -> RequestId {
        self.owner
    }

    /// Runs `task` on its own thread; the request waits for it to finish.
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        self.pool.submit_subtask(self.owner, task);
    }

    /// Blocks until every subtask spawned so far finished.
    #[must_use]
    pub fn wait(&self) -> Vec<String> {
        self.pool.wait_for_subtasks(self.owner)
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic")
    }
}
