//! The scheduler: a registry of per-thread [`Context`]s, a shared fallback
//! context for threads that haven't entered it, and the entry points that
//! schedule tasks and run them.
//!
//! Grounded on `TaskScheduler` (`task_scheduler.hpp`/`.cpp`). Two
//! deliberate departures from the original, both already called out in
//! the expanded specification:
//!
//! - `Enter`/`Leave` use a thread-local map keyed by scheduler id rather
//!   than a single global thread-local pointer, so a thread can enter more
//!   than one independent `Scheduler` at once without one clobbering the
//!   other's slot.
//! - Tasks added from a thread that has never entered this scheduler land
//!   on a `mSharedContext`-equivalent, whose `push` is additionally
//!   guarded by a mutex: the original's deque assumes a single producer
//!   thread, which the shared context cannot promise on its own.

use crate::config::Config;
use crate::context::{Context, ContextId, CountingThrottler, NullThrottler, RunState};
use crate::deque::Stealer;
use crate::error::EnterError;
use crate::future::{Future, Waitable};
use crate::semaphore::Semaphore;
use crate::task::{self, IntoTaskBody, TaskHeader, TaskPtr};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(0);

struct ContextsInner {
    version: u64,
    contexts: Vec<Arc<Context>>,
}

pub struct Scheduler {
    id: u64,
    config: Config,
    contexts: Mutex<ContextsInner>,
    shared_context: Arc<Context>,
    shared_push_lock: Mutex<()>,
    work_available: Semaphore,
    idle_count: AtomicUsize,
    next_context_id: AtomicU64,
    shutdown: std::sync::atomic::AtomicBool,
}

thread_local! {
    static ENTERED_CONTEXTS: RefCell<HashMap<u64, Arc<Context>>> = RefCell::new(HashMap::new());
    static SCHEDULER_STACK: RefCell<Vec<Weak<Scheduler>>> = RefCell::new(Vec::new());
}

/// The `Scheduler` most recently entered (and not yet left) by the calling
/// thread, if any. Lets a running task reach its own scheduler to add
/// children without having to capture it explicitly.
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER_STACK.with(|stack| stack.borrow().last().and_then(Weak::upgrade))
}

impl Scheduler {
    pub fn new(config: Config) -> Arc<Self> {
        let shared_context = Arc::new(Context::new(
            ContextId(0),
            config.initial_deque_log_size,
            config.shrink_fraction,
            config.run_log_capacity,
        ));
        Arc::new(Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            contexts: Mutex::new(ContextsInner {
                version: 1,
                contexts: vec![shared_context.clone()],
            }),
            shared_context,
            shared_push_lock: Mutex::new(()),
            work_available: Semaphore::new(),
            idle_count: AtomicUsize::new(0),
            next_context_id: AtomicU64::new(1),
            shutdown: std::sync::atomic::AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a fresh [`Context`] for the calling thread. Must be
    /// balanced by a matching [`Scheduler::leave`]. Returns
    /// [`EnterError::AlreadyEntered`] if this thread has already entered
    /// this particular scheduler.
    pub fn enter(self: &Arc<Self>) -> Result<(), EnterError> {
        ENTERED_CONTEXTS.with(|map| {
            if map.borrow().contains_key(&self.id) {
                return Err(EnterError::AlreadyEntered);
            }
            let context_id = ContextId(self.next_context_id.fetch_add(1, Ordering::Relaxed));
            let context = Arc::new(Context::new(
                context_id,
                self.config.initial_deque_log_size,
                self.config.shrink_fraction,
                self.config.run_log_capacity,
            ));
            {
                let mut inner = self.contexts.lock().unwrap();
                inner.contexts.push(context.clone());
                inner.version += 1;
            }
            tracing::debug!(scheduler_id = self.id, context_id = context_id.0, "context entered");
            map.borrow_mut().insert(self.id, context);
            Ok(())
        })?;
        SCHEDULER_STACK.with(|stack| stack.borrow_mut().push(Arc::downgrade(self)));
        Ok(())
    }

    /// Unregister the calling thread's [`Context`]. Panics if this thread
    /// never entered this scheduler, matching the original's debug-assert
    /// on unbalanced `Enter`/`Leave`.
    pub fn leave(self: &Arc<Self>) {
        let context = ENTERED_CONTEXTS
            .with(|map| map.borrow_mut().remove(&self.id))
            .expect("leave called without a matching enter");
        {
            let mut inner = self.contexts.lock().unwrap();
            inner.contexts.retain(|c| c.id() != context.id());
            inner.version += 1;
        }
        tracing::debug!(scheduler_id = self.id, context_id = context.id().0, "context left");
        SCHEDULER_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|w| w.upgrade().map(|s| s.id) == Some(self.id)) {
                stack.remove(pos);
            }
        });
    }

    /// spec.md §6's `GetContext()`: the calling thread's own [`Context`],
    /// if it has entered this scheduler.
    pub fn get_context(&self) -> Option<Arc<Context>> {
        ENTERED_CONTEXTS.with(|map| map.borrow().get(&self.id).cloned())
    }

    /// spec.md §6's `GetHasWorkCondition()`: the `Waitable` a meta-scheduler
    /// can register against to be woken when this scheduler has work for an
    /// idle context to steal.
    pub fn has_work_condition(&self) -> &Semaphore {
        &self.work_available
    }

    pub(crate) fn contexts_version(&self) -> u64 {
        self.contexts.lock().unwrap().version
    }

    pub(crate) fn stealers_excluding(&self, id: ContextId) -> Vec<Stealer<TaskPtr>> {
        self.contexts
            .lock()
            .unwrap()
            .contexts
            .iter()
            .filter(|c| c.id() != id)
            .map(|c| c.stealer())
            .collect()
    }

    pub(crate) fn note_idle(&self) {
        self.idle_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total number of times any context on this scheduler has gone idle
    /// (exhausted its steal budget). A diagnostic counter, not used for
    /// control flow.
    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::Relaxed)
    }

    /// Route a just-ready (or brand new, dependency-free) task to the
    /// calling thread's context if it has one, otherwise to the shared
    /// fallback context. Mirrors `TaskScheduler::AddTask`.
    pub(crate) fn enqueue_from_current_thread(&self, header: NonNull<TaskHeader>) {
        let local = ENTERED_CONTEXTS.with(|map| map.borrow().get(&self.id).cloned());
        match local {
            Some(context) => context.push(header),
            None => {
                let _guard = self.shared_push_lock.lock().unwrap();
                self.shared_context.push(header);
            }
        }
        self.work_available.post();
    }

    /// Schedule `f` with no dependencies; it becomes runnable immediately.
    pub fn add<Marker, T, F>(self: &Arc<Self>, f: F) -> Future<T>
    where
        F: IntoTaskBody<Marker, T>,
        T: Send + Clone + 'static,
    {
        task::schedule(f.into_task_body(), self, &[])
    }

    /// Schedule `f` to run once every future in `dependencies` has
    /// resolved (immediately, if the list is empty or already resolved).
    pub fn add_with_dependencies<Marker, T, F>(
        self: &Arc<Self>,
        f: F,
        dependencies: &[Arc<dyn Waitable>],
    ) -> Future<T>
    where
        F: IntoTaskBody<Marker, T>,
        T: Send + Clone + 'static,
    {
        task::schedule(f.into_task_body(), self, dependencies)
    }

    /// Drive the calling thread's own context until it reports `Idle`.
    /// Intended for single-threaded use (tests, or a scheduler run with
    /// `num_workers == 1`); a context never reports idle permanently, so
    /// this is not suitable as the steady-state loop for a multi-worker
    /// scheduler — see [`Scheduler::run_forever`] for that.
    pub fn run_until_idle(self: &Arc<Self>) {
        let context = ENTERED_CONTEXTS
            .with(|map| map.borrow().get(&self.id).cloned())
            .expect("run_until_idle called without entering the scheduler on this thread");
        loop {
            if matches!(context.run(self, &NullThrottler), RunState::Idle) {
                break;
            }
        }
    }

    /// Block until `future` resolves, like [`Future::get`], but if the
    /// calling thread has entered this scheduler it helps drain its own
    /// context's work while waiting instead of sitting idle — otherwise a
    /// single-worker scheduler would deadlock waiting on a child task only
    /// its own thread could ever dispatch. A thread that hasn't entered
    /// just blocks, trusting other workers to make progress.
    pub fn wait_for<T: Send + Clone + 'static>(self: &Arc<Self>, future: &Future<T>) -> T {
        let context = ENTERED_CONTEXTS.with(|map| map.borrow().get(&self.id).cloned());
        if let Some(context) = context {
            while !future.is_ready() {
                if matches!(context.run(self, &NullThrottler), RunState::Idle) && !future.is_ready() {
                    self.work_available.wait_timeout(std::time::Duration::from_millis(1));
                }
            }
        }
        future.get()
    }

    /// Spawn `config.num_workers` OS threads, each entering this scheduler
    /// and running until [`Scheduler::shutdown`] is called. Returns the
    /// join handles so a caller can wait for a clean stop.
    pub fn run_forever(self: &Arc<Self>) -> Vec<thread::JoinHandle<()>> {
        (0..self.config.num_workers)
            .map(|index| {
                let scheduler = Arc::clone(self);
                thread::Builder::new()
                    .name(format!("taskloom-worker-{index}"))
                    .spawn(move || {
                        tracing::debug!(worker_index = index, "worker thread starting");
                        scheduler.enter().expect("fresh worker thread cannot already be entered");
                        let throttler = CountingThrottler::new(256);
                        while !scheduler.shutdown.load(Ordering::Acquire) {
                            let context = ENTERED_CONTEXTS
                                .with(|map| map.borrow().get(&scheduler.id).cloned())
                                .unwrap();
                            match context.run(&scheduler, &throttler) {
                                RunState::Working | RunState::Polling => {}
                                RunState::Idle => {
                                    scheduler
                                        .work_available
                                        .wait_timeout(std::time::Duration::from_millis(10));
                                }
                            }
                        }
                        scheduler.leave();
                    })
                    .expect("failed to spawn scheduler worker thread")
            })
            .collect()
    }

    /// Ask every `run_forever` worker to stop after its current task and
    /// wake any that are parked waiting for work.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.work_available.post_all();
    }
}
