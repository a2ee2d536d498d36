//! A single worker's local task queue and its run loop.
//!
//! Grounded on `TaskScheduler::Context` (`task_scheduler.hpp`/`.cpp`): one
//! `Context` per OS thread that has entered a scheduler, each owning one
//! end of a work-stealing deque. [`Context::run`] is a direct port of
//! `Context::Run(Throttler&)`'s state machine: drain the local queue,
//! then refresh the cached neighbor list only when the scheduler's
//! registered-context set has actually changed (`mContextsVersion`),
//! then attempt one steal from a uniformly random neighbor.

use crate::deque::{StealResult, Stealer, Worker};
use crate::task::{self, TaskHeader, TaskPtr};
use std::cell::{Cell as StdCell, RefCell};
use std::collections::VecDeque;
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ContextId(pub(crate) u64);

/// Outcome of one call to [`Context::run`], telling the caller whether to
/// keep calling it immediately, back off briefly, or go to sleep on the
/// scheduler's work-available semaphore. This is spec.md §6's `State`
/// returned by the scheduler-context interface's `Run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Dispatched at least one task and yielded back because the
    /// throttler asked to.
    Working,
    /// Found no local work and a steal attempt failed, but not enough
    /// consecutive failures yet to call it idle.
    Polling,
    /// No local work, no neighbors, or enough consecutive failed steals
    /// to stop spinning.
    Idle,
}

/// Lets a caller bound how many tasks [`Context::run`] dispatches before
/// returning, so a single call never blocks a thread indefinitely even
/// while work keeps arriving. The trivial [`NullThrottler`] never yields.
/// Matches spec.md §6's `Throttler` external interface.
pub trait Throttler {
    fn should_yield(&self) -> bool;
}

pub struct NullThrottler;

impl Throttler for NullThrottler {
    fn should_yield(&self) -> bool {
        false
    }
}

/// Yields after a fixed number of dispatches, for `run_forever` workers so
/// they periodically check neighbor-list freshness and idle state even
/// under continuous local work.
pub(crate) struct CountingThrottler {
    remaining: StdCell<u32>,
}

impl CountingThrottler {
    pub(crate) fn new(budget: u32) -> Self {
        Self {
            remaining: StdCell::new(budget),
        }
    }
}

impl Throttler for CountingThrottler {
    fn should_yield(&self) -> bool {
        let remaining = self.remaining.get();
        if remaining == 0 {
            true
        } else {
            self.remaining.set(remaining - 1);
            false
        }
    }
}

#[derive(Debug, Clone)]
enum RunEvent {
    Dispatched,
    StoleFrom,
    StealFailed,
    WentIdle,
}

/// One worker thread's local scheduling state: its deque, cached neighbor
/// snapshot, steal-attempt counter, and run log. Also the concrete instance
/// of spec.md §6's "scheduler context interface" exposed to an external
/// meta-scheduler: [`Context::run`], [`Context::can_re_enter`], and
/// [`Context::can_orphan`].
pub struct Context {
    id: ContextId,
    worker: Worker<TaskPtr>,
    neighbors: RefCell<Vec<Stealer<TaskPtr>>>,
    neighbors_version: StdCell<u64>,
    steal_attempt_count: StdCell<u32>,
    run_log_capacity: usize,
    run_log: RefCell<VecDeque<RunEvent>>,
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        initial_log_size: u32,
        shrink_fraction: u32,
        run_log_capacity: usize,
    ) -> Self {
        let (worker, _stealer) = Worker::new_with_shrink_fraction(initial_log_size, shrink_fraction);
        Self {
            id,
            worker,
            neighbors: RefCell::new(Vec::new()),
            neighbors_version: StdCell::new(0),
            steal_attempt_count: StdCell::new(0),
            run_log_capacity,
            run_log: RefCell::new(VecDeque::new()),
        }
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    /// spec.md §6's `CanReEnter()`: a thread that has entered a scheduler
    /// may not enter it again on the same context (see
    /// [`crate::scheduler::Scheduler::enter`]'s `AlreadyEntered` error).
    pub fn can_re_enter(&self) -> bool {
        false
    }

    /// spec.md §6's `CanOrphan()`: tasks left on this context's deque may
    /// outlive the context itself (they are picked up by other contexts'
    /// `steal`, or, once this context leaves, simply stop being stolen from
    /// — the scheduler does not require a context to drain before leaving).
    pub fn can_orphan(&self) -> bool {
        true
    }

    pub(crate) fn stealer(&self) -> Stealer<TaskPtr> {
        self.worker.stealer()
    }

    pub(crate) fn push(&self, header: NonNull<TaskHeader>) {
        self.worker.push(TaskPtr(header));
    }

    fn record(&self, event: RunEvent) {
        if self.run_log_capacity == 0 {
            return;
        }
        let mut log = self.run_log.borrow_mut();
        if log.len() >= self.run_log_capacity {
            log.pop_front();
        }
        log.push_back(event);
    }

    /// Run one round: drain local work, then try one steal. Mirrors
    /// `TaskScheduler::Context::Run`; this is spec.md §6's `Run(throttler)`.
    pub fn run(&self, scheduler: &crate::scheduler::Scheduler, throttler: &dyn Throttler) -> RunState {
        let _span = tracing::trace_span!("context_run", context_id = self.id.0).entered();
        // Outer loop: a successful steal falls through to re-drain this
        // context's own local deque before trying another steal, mirroring
        // the original's `Context::Run` falling back to the top of its
        // `for(;;)` after dispatching a stolen task, rather than returning
        // straight to the caller.
        loop {
            loop {
                match self.worker.pop() {
                    StealResult::Success(TaskPtr(header)) => {
                        tracing::trace!(context_id = self.id.0, "dispatching local task");
                        unsafe { task::dispatch_header(header) };
                        self.record(RunEvent::Dispatched);
                        if throttler.should_yield() {
                            return RunState::Working;
                        }
                    }
                    StealResult::Retry => continue,
                    StealResult::Empty => break,
                }
            }

            let current_version = scheduler.contexts_version();
            if self.neighbors_version.get() != current_version {
                *self.neighbors.borrow_mut() = scheduler.stealers_excluding(self.id);
                self.neighbors_version.set(current_version);
            }

            let victim = {
                let neighbors = self.neighbors.borrow();
                if neighbors.is_empty() {
                    tracing::debug!(context_id = self.id.0, "no neighbors to steal from, going idle");
                    return RunState::Idle;
                }
                neighbors[fastrand::usize(..neighbors.len())].clone()
            };

            match victim.steal() {
                StealResult::Success(TaskPtr(header)) => {
                    self.steal_attempt_count.set(0);
                    self.record(RunEvent::StoleFrom);
                    tracing::trace!(context_id = self.id.0, "dispatching stolen task");
                    unsafe { task::dispatch_header(header) };
                    if throttler.should_yield() {
                        return RunState::Working;
                    }
                    // Loop back: re-drain the local deque before stealing
                    // again, so a stolen task that spawns local children
                    // gets local priority over a fresh steal.
                }
                StealResult::Empty | StealResult::Retry => {
                    self.record(RunEvent::StealFailed);
                    let attempts = self.steal_attempt_count.get() + 1;
                    self.steal_attempt_count.set(attempts);
                    if attempts > scheduler.config().max_steal_attempts_before_idle {
                        self.record(RunEvent::WentIdle);
                        scheduler.note_idle();
                        tracing::debug!(context_id = self.id.0, attempts, "steal budget exhausted, going idle");
                        return RunState::Idle;
                    }
                    return RunState::Polling;
                }
            }
        }
    }
}

// Safety: `Context` is only ever pushed to by its owning thread (via
// `Worker::push`, never shared); stealing and neighbor lookups from other
// threads go through `Stealer`, which is already `Sync`. The `RefCell`s
// here (`neighbors`, `run_log`) are likewise only ever touched from the
// owning thread, ambient-stack bookkeeping for steal diagnostics.
unsafe impl Sync for Context {}
