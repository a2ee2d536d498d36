//! Type-erased task records, dispatch, and the in-task continuation
//! protocol (`ExecutionContext::extend_with`).
//!
//! This module is the Rust counterpart of `Detail::ScheduledTask<F>` plus
//! the `TaskResultClass`/`TaskCallClass` compile-time dispatch table the
//! original builds with template overload resolution. Two redesigns
//! replace that C++-only trick:
//!
//! - [`TaskOutput<T>`] is a plain enum a task body returns, inspected at
//!   runtime, standing in for `TaskResultClassGeneric`/`Void`/`Future`
//!   (the original's Design Notes already recommend a tagged variant over
//!   virtual dispatch for exactly this kind of dimension).
//! - [`IntoTaskBody`], a marker-trait pattern keyed by the zero-sized
//!   [`Plain`]/[`WithContext`] marker types, lets a single generic
//!   `add`/`extend_with` entry point accept both a `FnOnce() -> TaskOutput<T>`
//!   and a `FnOnce(&mut ExecutionContext<T>) -> TaskOutput<T>` without
//!   nightly specialization, standing in for `TaskCallClass`.
//!
//! The task record itself is type-erased by hand — `TaskHeader` is
//! `repr(C)` and always sits at offset 0 of a `Cell<Body, T>`, so code
//! that only knows `NonNull<TaskHeader>` (the work-stealing deque, the
//! barrier-ready callback) can still locate and invoke the right
//! destructor/dispatch function through the header's vtable. This mirrors
//! `ScheduledTaskBase`/`ScheduledTask<F>`'s base-class/vtable split, and
//! the allocation reuse in [`replace_cell_in_place`] mirrors
//! `ScheduledTaskExecutionContext::AllocateContinuation`'s
//! placement-destroy-then-placement-construct trick exactly, without
//! requiring unstable Rust features.

use crate::barrier::Barrier;
use crate::future::{Future, FutureData, Waitable};
use crate::scheduler::Scheduler;
use std::alloc::Layout;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// What a task body produces: either the final result, or a future whose
/// eventual value should become this task's result (installing an
/// automatic continuation), matching `ResultClass` from spec.md §3.
pub enum TaskOutput<T> {
    Ready(T),
    Continuation(Future<T>),
}

/// Marker for a task body taking no arguments.
pub struct Plain;
/// Marker for a task body taking `&mut ExecutionContext<T>`, i.e. one that
/// may call [`ExecutionContext::extend_with`].
pub struct WithContext;

/// Implemented by anything a task cell can store and invoke. Not `FnOnce`
/// itself — implementing the real `FnOnce` trait for a custom adapter type
/// requires the unstable `fn_traits` feature, so task bodies are called
/// through this crate-local trait instead.
pub trait TaskBody<T>: Send + 'static {
    fn call(self, ctx: &mut ExecutionContext<T>) -> TaskOutput<T>;
}

/// Adapts a plain `FnOnce() -> TaskOutput<T>` into a [`TaskBody<T>`] that
/// ignores the execution context.
pub struct PlainBody<F>(F);

impl<F, T> TaskBody<T> for PlainBody<F>
where
    F: FnOnce() -> TaskOutput<T> + Send + 'static,
    T: Send + 'static,
{
    fn call(self, _ctx: &mut ExecutionContext<T>) -> TaskOutput<T> {
        (self.0)()
    }
}

impl<F, T> TaskBody<T> for F
where
    F: FnOnce(&mut ExecutionContext<T>) -> TaskOutput<T> + Send + 'static,
    T: Send + 'static,
{
    fn call(self, ctx: &mut ExecutionContext<T>) -> TaskOutput<T> {
        self(ctx)
    }
}

/// Converts a caller-supplied closure of either arity into a [`TaskBody<T>`].
/// `Marker` selects which blanket impl below applies; callers never name it
/// explicitly, it's inferred from the closure's own signature.
pub trait IntoTaskBody<Marker, T> {
    type Body: TaskBody<T>;
    fn into_task_body(self) -> Self::Body;
}

impl<F, T> IntoTaskBody<Plain, T> for F
where
    F: FnOnce() -> TaskOutput<T> + Send + 'static,
    T: Send + 'static,
{
    type Body = PlainBody<F>;
    fn into_task_body(self) -> PlainBody<F> {
        PlainBody(self)
    }
}

impl<F, T> IntoTaskBody<WithContext, T> for F
where
    F: FnOnce(&mut ExecutionContext<T>) -> TaskOutput<T> + Send + 'static,
    T: Send + 'static,
{
    type Body = F;
    fn into_task_body(self) -> F {
        self
    }
}

struct Vtable {
    dispatch: unsafe fn(NonNull<TaskHeader>),
}

/// A task pointer that can sit in the work-stealing deque. `NonNull` is
/// deliberately not `Send` on its own (to stop accidental raw-pointer
/// races); this wrapper asserts that moving a task handle between threads
/// is fine as long as it's only ever dereferenced through the header's
/// vtable and the barrier's atomics, which is all the deque and scheduler
/// ever do with one.
#[derive(Clone, Copy)]
pub(crate) struct TaskPtr(pub(crate) NonNull<TaskHeader>);

unsafe impl Send for TaskPtr {}

/// Fixed, `F`/`T`-independent prefix of every task cell, relied on by the
/// deque (which only ever handles `NonNull<TaskHeader>`) and by the
/// barrier-ready callback. Always at offset 0 thanks to `repr(C)`.
#[repr(C)]
pub(crate) struct TaskHeader {
    barrier: Barrier,
    vtable: &'static Vtable,
    /// Raw pointer to the owning scheduler, used to re-enqueue this task
    /// (from whichever thread satisfies its last dependency) once ready.
    /// Valid as long as the scheduler that created this task is alive —
    /// the same lifetime contract the original has via its plain
    /// `TaskScheduler& mOwner` reference member.
    scheduler: *const Scheduler,
    /// Size/align of the allocation currently backing this header, used
    /// to decide whether a continuation can reuse it in place.
    allocation_layout: Layout,
}

#[repr(C)]
struct Cell<Body, T> {
    header: TaskHeader,
    future_data: Arc<FutureData<T>>,
    body: Body,
}

fn vtable_for<Body, T>() -> &'static Vtable
where
    Body: TaskBody<T>,
    T: Send + Clone + 'static,
{
    &Vtable {
        dispatch: dispatch::<Body, T>,
    }
}

/// Wraps a raw task pointer so it can cross a `Send` boundary inside a
/// waiter callback. Sound because the pointee is only ever touched through
/// `notify_dependency_ready`, which uses nothing but atomics and the
/// scheduler's own thread-safe enqueue path.
struct SendHeaderPtr(NonNull<TaskHeader>);
unsafe impl Send for SendHeaderPtr {}

/// Allocate a fresh task cell and return its type-erased header pointer.
pub(crate) fn new_task<Body, T>(
    body: Body,
    future_data: Arc<FutureData<T>>,
    barrier_count: u32,
    scheduler: *const Scheduler,
) -> NonNull<TaskHeader>
where
    Body: TaskBody<T>,
    T: Send + Clone + 'static,
{
    let layout = Layout::new::<Cell<Body, T>>();
    // Safety: layout is non-zero sized (a Cell always has a header).
    let block = unsafe { std::alloc::alloc(layout) };
    if block.is_null() {
        std::alloc::handle_alloc_error(layout);
    }
    let cell_ptr = block as *mut Cell<Body, T>;
    unsafe {
        ptr::write(
            &mut (*cell_ptr).header,
            TaskHeader {
                barrier: Barrier::new(barrier_count),
                vtable: vtable_for::<Body, T>(),
                scheduler,
                allocation_layout: layout,
            },
        );
        ptr::write(&mut (*cell_ptr).future_data, future_data);
        ptr::write(&mut (*cell_ptr).body, body);
    }
    NonNull::new(cell_ptr as *mut TaskHeader).unwrap()
}

/// Schedule `body` to run once every dependency in `dependencies` has
/// completed (immediately, if `dependencies` is empty or all of them have
/// already completed by the time this call registers its waiters).
pub(crate) fn schedule<Body, T>(
    body: Body,
    scheduler: &Scheduler,
    dependencies: &[Arc<dyn Waitable>],
) -> Future<T>
where
    Body: TaskBody<T>,
    T: Send + Clone + 'static,
{
    let future_data = FutureData::new();
    let header = new_task(
        body,
        future_data.clone(),
        dependencies.len() as u32,
        scheduler as *const Scheduler,
    );

    let mut added_count = 0u32;
    for dependency in dependencies {
        let target = SendHeaderPtr(header);
        let callback: Box<dyn FnOnce() + Send> = Box::new(move || unsafe {
            notify_dependency_ready(target.0);
        });
        if dependency.add_waiter(callback) {
            added_count += 1;
        }
    }
    let ready_count = dependencies.len() as u32 - added_count;

    let already_ready =
        added_count == 0 || (ready_count > 0 && unsafe { header.as_ref().barrier.subtract(ready_count) });
    if already_ready {
        unsafe { enqueue_ready_task(header) };
    }

    Future::from_data(future_data)
}

/// # Safety
/// `header` must point at a live `TaskHeader` whose barrier has just
/// reached zero for the first time.
unsafe fn enqueue_ready_task(header: NonNull<TaskHeader>) {
    // Safety: the scheduler that created this task outlives it (see the
    // contract documented on `TaskHeader::scheduler`).
    let scheduler = unsafe { &*header.as_ref().scheduler };
    scheduler.enqueue_from_current_thread(header);
}

/// Decrement a task's dependency barrier; enqueue it once it reaches zero.
///
/// # Safety
/// `header` must point at a live `TaskHeader`.
pub(crate) unsafe fn notify_dependency_ready(header: NonNull<TaskHeader>) {
    let crossed_zero = unsafe { header.as_ref().barrier.notify_ready() };
    if crossed_zero {
        unsafe { enqueue_ready_task(header) };
    }
}

/// Dispatch the task at `header`: run its body, then either resolve its
/// future, store a panic, or install a continuation.
///
/// # Safety
/// `header` must point at a live `Cell<Body, T>` whose body has not yet
/// been run, and `Body`/`T` must be the exact types it was constructed
/// with.
pub(crate) unsafe fn dispatch_header(header: NonNull<TaskHeader>) {
    unsafe { (header.as_ref().vtable.dispatch)(header) }
}

unsafe fn dispatch<Body, T>(header: NonNull<TaskHeader>)
where
    Body: TaskBody<T>,
    T: Send + Clone + 'static,
{
    let cell_ptr = header.as_ptr() as *mut Cell<Body, T>;
    let old_layout = unsafe { (*cell_ptr).header.allocation_layout };
    let scheduler = unsafe { (*cell_ptr).header.scheduler };
    // Safety: this is the only place that ever reads these fields, and it
    // runs at most once per cell (the deque hands each task pointer out
    // exactly once).
    let body = unsafe { ptr::read(&(*cell_ptr).body) };
    let future_data = unsafe { ptr::read(&(*cell_ptr).future_data) };

    let mut exec_ctx: ExecutionContext<T> = ExecutionContext {
        scheduler,
        future_data: future_data.clone(),
        has_continuation: false,
        cell_ptr: cell_ptr as *mut u8,
        old_layout,
        _marker: PhantomData,
    };

    let result = catch_unwind(AssertUnwindSafe(|| body.call(&mut exec_ctx)));

    if exec_ctx.has_continuation {
        // `extend_with` already placement-constructed and wired a
        // replacement cell at this address. A task must not panic after
        // calling it ("must be the last call in the task"); if one does,
        // surface it rather than silently swallowing it.
        if let Err(panic) = result {
            resume_unwind(panic);
        }
        return;
    }

    match result {
        Err(panic) => {
            tracing::trace!("task body panicked");
            future_data.set_failed(panic);
            unsafe { std::alloc::dealloc(cell_ptr as *mut u8, old_layout) };
        }
        Ok(TaskOutput::Ready(value)) => {
            future_data.set_value(value);
            unsafe { std::alloc::dealloc(cell_ptr as *mut u8, old_layout) };
        }
        Ok(TaskOutput::Continuation(future)) => {
            let dependency = future.as_waitable();
            let continuation = PlainBody(move || TaskOutput::Ready(future.get()));
            let new_header = unsafe {
                replace_cell_in_place(cell_ptr as *mut u8, old_layout, continuation, future_data, Barrier::new(1), scheduler)
            };
            tracing::trace!(reused_allocation = new_header.as_ptr() as *const u8 == cell_ptr as *const u8, "continuation installed");
            test_support::record(cell_ptr as *const u8, new_header.as_ptr() as *const u8);
            wire_single_dependency(new_header, dependency);
        }
    }
}

fn wire_single_dependency(header: NonNull<TaskHeader>, dependency: Arc<dyn Waitable>) {
    let target = SendHeaderPtr(header);
    let callback: Box<dyn FnOnce() + Send> = Box::new(move || unsafe {
        notify_dependency_ready(target.0);
    });
    if !dependency.add_waiter(callback) {
        unsafe { notify_dependency_ready(header) };
    }
}

/// Construct a new cell in place of an old one, reusing its allocation
/// when the new cell fits, otherwise freeing it and allocating fresh.
/// Mirrors `ScheduledTaskExecutionContext::AllocateContinuation`.
///
/// # Safety
/// `old_ptr` must point at `old_layout` live, unshared bytes that no
/// longer hold a value needing its destructor run (the caller must have
/// already moved out anything `Drop`-significant).
unsafe fn replace_cell_in_place<Body, T>(
    old_ptr: *mut u8,
    old_layout: Layout,
    body: Body,
    future_data: Arc<FutureData<T>>,
    barrier: Barrier,
    scheduler: *const Scheduler,
) -> NonNull<TaskHeader>
where
    Body: TaskBody<T>,
    T: Send + Clone + 'static,
{
    let new_layout = Layout::new::<Cell<Body, T>>();
    let block = if new_layout.size() <= old_layout.size() && new_layout.align() <= old_layout.align() {
        old_ptr
    } else {
        unsafe { std::alloc::dealloc(old_ptr, old_layout) };
        let fresh = unsafe { std::alloc::alloc(new_layout) };
        if fresh.is_null() {
            std::alloc::handle_alloc_error(new_layout);
        }
        fresh
    };

    let cell_ptr = block as *mut Cell<Body, T>;
    unsafe {
        ptr::write(
            &mut (*cell_ptr).header,
            TaskHeader {
                barrier,
                vtable: vtable_for::<Body, T>(),
                scheduler,
                allocation_layout: new_layout,
            },
        );
        ptr::write(&mut (*cell_ptr).future_data, future_data);
        ptr::write(&mut (*cell_ptr).body, body);
    }
    NonNull::new(cell_ptr as *mut TaskHeader).unwrap()
}

/// Passed to a task body registered via the `WithContext` marker, letting
/// it install a continuation in place instead of returning a
/// [`TaskOutput::Continuation`]. Counterpart of `TaskExecutionContext<T>`.
pub struct ExecutionContext<T> {
    scheduler: *const Scheduler,
    future_data: Arc<FutureData<T>>,
    has_continuation: bool,
    cell_ptr: *mut u8,
    old_layout: Layout,
    _marker: PhantomData<T>,
}

impl<T: Send + Clone + 'static> ExecutionContext<T> {
    /// Replace this task with a continuation that runs once every future
    /// in `dependencies` has resolved. Must be the last thing the task
    /// body does (its own return value, if any, is ignored). Calling this
    /// twice on the same task is a programming error, surfaced as
    /// [`crate::error::ExtendError::AlreadyExtended`] rather than a panic.
    pub fn extend_with<F>(
        &mut self,
        f: F,
        dependencies: &[Arc<dyn Waitable>],
    ) -> Result<(), crate::error::ExtendError>
    where
        F: FnOnce() -> TaskOutput<T> + Send + 'static,
    {
        if self.has_continuation {
            return Err(crate::error::ExtendError::AlreadyExtended);
        }
        self.has_continuation = true;

        let barrier_count = dependencies.len() as u32;
        let new_header = unsafe {
            replace_cell_in_place(
                self.cell_ptr,
                self.old_layout,
                PlainBody(f),
                self.future_data.clone(),
                Barrier::new(barrier_count),
                self.scheduler,
            )
        };
        tracing::trace!(dependency_count = barrier_count, "extend_with installed continuation");
        test_support::record(self.cell_ptr as *const u8, new_header.as_ptr() as *const u8);

        let mut added_count = 0u32;
        for dependency in dependencies {
            let target = SendHeaderPtr(new_header);
            let callback: Box<dyn FnOnce() + Send> = Box::new(move || unsafe {
                notify_dependency_ready(target.0);
            });
            if dependency.add_waiter(callback) {
                added_count += 1;
            }
        }
        let ready_count = barrier_count - added_count;
        let already_ready = added_count == 0
            || (ready_count > 0 && unsafe { new_header.as_ref().barrier.subtract(ready_count) });
        if already_ready {
            unsafe { enqueue_ready_task(new_header) };
        }
        Ok(())
    }
}

/// Observation hook onto [`replace_cell_in_place`]'s reuse-or-reallocate
/// decision, so integration tests can assert on it directly instead of
/// relying on the `reused_allocation` trace field. Not part of the crate's
/// public API surface (hidden from docs); a test dependency, not a feature.
#[doc(hidden)]
pub mod test_support {
    use std::cell::RefCell;

    thread_local! {
        static LOG: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn record(old_ptr: *const u8, new_ptr: *const u8) {
        LOG.with(|log| log.borrow_mut().push((old_ptr as usize, new_ptr as usize)));
    }

    /// Drain and return every `(old_address, new_address)` pair recorded by
    /// continuation installs on the calling thread since the last call.
    pub fn take_continuation_allocation_log() -> Vec<(usize, usize)> {
        LOG.with(|log| std::mem::take(&mut *log.borrow_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ready_task_completes_immediately() {
        let scheduler = Scheduler::new(Config::new().with_num_workers(1));
        scheduler.enter().unwrap();
        let future = scheduler.add(|| TaskOutput::Ready(7));
        scheduler.run_until_idle();
        assert_eq!(future.get(), 7);
        scheduler.leave();
    }

    #[test]
    fn continuation_via_return_value_resolves_to_inner_future() {
        let scheduler = Scheduler::new(Config::new().with_num_workers(1));
        scheduler.enter().unwrap();
        let future = scheduler.add(|| {
            let inner = crate::scheduler::current_scheduler()
                .unwrap()
                .add(|| TaskOutput::Ready(5));
            TaskOutput::Continuation(inner)
        });
        scheduler.run_until_idle();
        assert_eq!(future.get(), 5);
        scheduler.leave();
    }

    #[test]
    fn extend_with_reruns_after_dependency_resolves() {
        let scheduler = Scheduler::new(Config::new().with_num_workers(1));
        scheduler.enter().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let dep = scheduler.add(|| TaskOutput::Ready(3));
        let dep_waitable: Arc<dyn Waitable> = dep.as_waitable();
        let future = scheduler.add(move |ctx: &mut ExecutionContext<i32>| {
            ran2.fetch_add(1, Ordering::SeqCst);
            ctx.extend_with(move || TaskOutput::Ready(dep.get() + 1), &[dep_waitable])
                .unwrap();
            TaskOutput::Ready(0) // ignored
        });
        scheduler.run_until_idle();
        assert_eq!(future.get(), 4);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        scheduler.leave();
    }
}
