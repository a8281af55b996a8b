//! Flush state machine and session fan-out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::services::PipelineExecutor;
use super::Structs::SessionId;
use crate::Core::error::{EngineError, EngineResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushStatus {
    NotFlushing,
    IsFlushing,
    /// Teardown began. Terminal.
    HasFlushed,
}

/// What a flush worker is doing, for the timeout status table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Flushing(SessionId),
    Done(SessionId),
}

struct WorkState {
    tasks: VecDeque<SessionId>,
    outstanding: usize,
    status: Vec<WorkerStatus>,
    should_continue: bool,
}

struct WorkShared {
    state: Mutex<WorkState>,
    work_ready: Condvar,
    all_done: Condvar,
    executor: Arc<dyn PipelineExecutor>,
}

/// Persistent workers, one per session slot, pulling from a shared task queue.
pub(crate) struct FlushWorkerPool {
    shared: Arc<WorkShared>,
    workers: Vec<JoinHandle<()>>,
}

impl FlushWorkerPool {
    pub(crate) fn new(count: usize, executor: Arc<dyn PipelineExecutor>) -> EngineResult<Self> {
        let shared = Arc::new(WorkShared {
            state: Mutex::new(WorkState {
                tasks: VecDeque::new(),
                outstanding: 0,
                status: vec![WorkerStatus::Idle; count],
                should_continue: true,
            }),
            work_ready: Condvar::new(),
            all_done: Condvar::new(),
            executor,
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(count),
        };
        for index in 0..count {
            let shared = Arc::clone(&pool.shared);
            let handle = std::thread::Builder::new()
                .name(format!("flush-worker-{}", index))
                .spawn(move || Self::worker_loop(index, &shared))?;
            pool.workers.push(handle);
        }
        Ok(pool)
    }

    fn worker_loop(index: usize, shared: &WorkShared) {
        let mut state = shared.state.lock();
        while state.should_continue {
            let Some(session) = state.tasks.pop_front() else {
                shared.work_ready.wait(&mut state);
                continue;
            };

            state.status[index] = WorkerStatus::Flushing(session);
            MutexGuard::unlocked(&mut state, || {
                debug!("Worker {} flushing session {}", index, session);
                shared.executor.flush_session(session);
            });
            state.status[index] = WorkerStatus::Done(session);
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.outstanding == 0 {
                shared.all_done.notify_all();
            }
        }
        debug!("Flush worker {} exiting", index);
    }

    /// Flushes `sessions` in parallel. Waits half the timeout, logs the worker table, then
    /// waits the other half once. Gives up after that.
    pub(crate) fn flush_all(&self, sessions: &[SessionId], timeout: Duration) -> EngineResult<()> {
        if sessions.is_empty() {
            return Ok(());
        }

        let mut state = self.shared.state.lock();
        for status in state.status.iter_mut() {
            *status = WorkerStatus::Idle;
        }
        state.tasks.extend(sessions.iter().copied());
        state.outstanding += sessions.len();
        self.shared.work_ready.notify_all();

        let half = timeout / 2;
        if self.wait_done(&mut state, half) {
            return Ok(());
        }

        warn!(
            "Parallel flush still has {} session(s) outstanding after {:?}",
            state.outstanding, half
        );
        for (index, status) in state.status.iter().enumerate() {
            warn!("  worker {:>2}: {:?}", index, status);
        }

        if self.wait_done(&mut state, half) {
            return Ok(());
        }
        // sessions nobody picked up are dropped, in-flight ones still count down
        let abandoned = state.tasks.len();
        state.tasks.clear();
        state.outstanding = state.outstanding.saturating_sub(abandoned);
        Err(EngineError::FlushTimeout {
            outstanding: state.outstanding,
        })
    }

    fn wait_done(&self, state: &mut MutexGuard<'_, WorkState>, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        while state.outstanding > 0 {
            if self.shared.all_done.wait_until(state, deadline).timed_out() {
                return state.outstanding == 0;
            }
        }
        true
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops and joins every worker. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.should_continue = false;
        }
        self.shared.work_ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("A flush worker panicked");
            }
        }
    }
}

impl Drop for FlushWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serializes flushes: one teardown sequence at a time, concurrent callers wait for it.
pub struct FlushCoordinator {
    status: Mutex<FlushStatus>,
    finished: Condvar,
    workers: Mutex<Option<FlushWorkerPool>>,
    executor: Arc<dyn PipelineExecutor>,
    timeout: Duration,
    completed: CachePadded<AtomicU64>,
}

impl FlushCoordinator {
    /// With `parallel`, spawns one worker per session slot.
    pub fn new(
        executor: Arc<dyn PipelineExecutor>,
        parallel: bool,
        max_sessions: usize,
        timeout: Duration,
    ) -> EngineResult<Self> {
        let workers = if parallel {
            Some(FlushWorkerPool::new(max_sessions, Arc::clone(&executor))?)
        } else {
            None
        };
        Ok(Self {
            status: Mutex::new(FlushStatus::NotFlushing),
            finished: Condvar::new(),
            workers: Mutex::new(workers),
            executor,
            timeout,
            completed: CachePadded::new(AtomicU64::new(0)),
        })
    }

    pub fn status(&self) -> FlushStatus {
        *self.status.lock()
    }

    /// Teardown sequences run so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_parallel(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Live flush workers. Zero in serial mode and after teardown.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .as_ref()
            .map(FlushWorkerPool::worker_count)
            .unwrap_or(0)
    }

    /// Runs one flush: sessions first, then `after` (pending-result cleanup).
    ///
    /// A caller arriving while another flush runs blocks until it finishes and returns
    /// without flushing again. After teardown every call is rejected.
    pub fn flush<F>(&self, sessions: &[SessionId], after: F) -> EngineResult<()>
    where
        F: FnOnce(),
    {
        if !self.begin()? {
            return Ok(());
        }
        self.execute(sessions, after);
        self.end(FlushStatus::NotFlushing);
        Ok(())
    }

    /// Final flush before teardown. Leaves the coordinator in `HasFlushed`.
    pub fn teardown<F>(&self, sessions: &[SessionId], after: F)
    where
        F: FnOnce(),
    {
        let mut after = Some(after);
        loop {
            match self.begin() {
                Ok(true) => {
                    if let Some(after) = after.take() {
                        self.execute(sessions, after);
                    }
                    self.end(FlushStatus::HasFlushed);
                    break;
                }
                // another flush just finished, requests may have arrived since
                Ok(false) => continue,
                Err(_) => {
                    debug!("Teardown already done");
                    break;
                }
            }
        }
        if let Some(mut workers) = self.workers.lock().take() {
            workers.shutdown();
        }
    }

    /// Returns true if the caller owns the flush, false if it waited for another one.
    fn begin(&self) -> EngineResult<bool> {
        let mut status = self.status.lock();
        match *status {
            FlushStatus::NotFlushing => {
                *status = FlushStatus::IsFlushing;
                Ok(true)
            }
            FlushStatus::IsFlushing => {
                debug!("Flush already in progress, waiting for it");
                while *status == FlushStatus::IsFlushing {
                    self.finished.wait(&mut status);
                }
                if *status == FlushStatus::HasFlushed {
                    return Err(EngineError::AlreadyFlushed);
                }
                Ok(false)
            }
            FlushStatus::HasFlushed => Err(EngineError::AlreadyFlushed),
        }
    }

    fn execute<F>(&self, sessions: &[SessionId], after: F)
    where
        F: FnOnce(),
    {
        let started = Instant::now();
        info!("Flush started for {} session(s)", sessions.len());

        let workers = self.workers.lock();
        match workers.as_ref() {
            Some(pool) => {
                if let Err(e) = pool.flush_all(sessions, self.timeout) {
                    error!("Parallel flush gave up: {}", e);
                }
            }
            None => {
                for &session in sessions {
                    debug!("Flushing session {}", session);
                    self.executor.flush_session(session);
                }
            }
        }
        drop(workers);

        after();
        self.completed.fetch_add(1, Ordering::AcqRel);
        info!("Flush finished in {:?}", started.elapsed());
    }

    fn end(&self, next: FlushStatus) {
        let mut status = self.status.lock();
        *status = next;
        self.finished.notify_all();
    }
}

impl Drop for FlushCoordinator {
    fn drop(&mut self) {
        if let Some(mut workers) = self.workers.get_mut().take() {
            workers.shutdown();
        }
    }
}
