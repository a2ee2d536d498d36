//! Single-assignment future cell and the `Waitable` registration contract.
//!
//! `FutureData<T>` is the shared cell behind both a `Task`'s `Future<T>`
//! handle and its internal continuation-barrier wiring — the same cell a
//! chain of continuations writes into exactly once, matching the
//! original's `Detail::FutureData<T>` with its `Unset`/`Value`/`Void`
//! states. Dual ownership (one handle kept by the scheduled task, one
//! returned to the caller as `Future<T>`) is expressed with a plain
//! `Arc` rather than the original's hand-rolled intrusive refcount
//! starting at 2 — `Arc`'s own refcounting already implements "freed when
//! the last of exactly these two owners drops it".

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};

type Waiter = Box<dyn FnOnce() + Send>;

enum Outcome<T> {
    Value(T),
    Failed,
}

enum State<T> {
    Pending(Vec<Waiter>),
    Ready(Outcome<T>),
}

/// Registers a one-shot callback to run when something completes.
///
/// Implemented by `FutureData<T>` (type-erased as `Arc<dyn Waitable>` when
/// a task needs to depend on futures of differing result types) and by
/// [`crate::semaphore::WorkAvailable`].
pub trait Waitable: Send + Sync {
    /// Queue `callback` to run on completion. Returns `true` if the
    /// callback was queued because this waitable was not yet resolved;
    /// returns `false` (without running `callback`) if it had already
    /// resolved — the caller is expected to treat that as "already
    /// ready" and proceed immediately instead.
    fn add_waiter(&self, callback: Waiter) -> bool;
}

pub struct FutureData<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
    failure: Mutex<Option<Box<dyn Any + Send>>>,
}

impl<T> FutureData<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Pending(Vec::new())),
            condvar: Condvar::new(),
            failure: Mutex::new(None),
        })
    }

    pub fn set_value(&self, value: T) {
        self.resolve(Outcome::Value(value));
    }

    pub fn set_failed(&self, payload: Box<dyn Any + Send>) {
        *self.failure.lock().unwrap() = Some(payload);
        self.resolve(Outcome::Failed);
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), State::Ready(_))
    }

    fn resolve(&self, outcome: Outcome<T>) {
        let waiters = {
            let mut guard = self.state.lock().unwrap();
            let prev = std::mem::replace(&mut *guard, State::Ready(outcome));
            match prev {
                State::Pending(waiters) => waiters,
                State::Ready(_) => unreachable!("future cell set more than once"),
            }
        };
        self.condvar.notify_all();
        for waiter in waiters {
            waiter();
        }
    }
}

impl<T: Clone> FutureData<T> {
    /// Block the calling thread until a value is available, then return
    /// it. If the producing task panicked, re-raises that panic on this
    /// thread via `resume_unwind` (the first caller gets the original
    /// payload; later callers get a fresh panic referencing the same
    /// failure, since a panic payload can only be resumed once).
    pub fn get(&self) -> T {
        let mut guard = self.state.lock().unwrap();
        loop {
            match &*guard {
                State::Ready(Outcome::Value(value)) => return value.clone(),
                State::Ready(Outcome::Failed) => {
                    drop(guard);
                    match self.failure.lock().unwrap().take() {
                        Some(payload) => std::panic::resume_unwind(payload),
                        None => panic!("dependency task panicked"),
                    }
                }
                State::Pending(_) => {
                    guard = self.condvar.wait(guard).unwrap();
                }
            }
        }
    }
}

impl<T: Send + 'static> Waitable for FutureData<T> {
    fn add_waiter(&self, callback: Waiter) -> bool {
        let mut guard = self.state.lock().unwrap();
        match &mut *guard {
            State::Pending(waiters) => {
                waiters.push(callback);
                true
            }
            State::Ready(_) => false,
        }
    }
}

/// Caller-facing handle to a task's eventual result.
pub struct Future<T> {
    data: Arc<FutureData<T>>,
}

impl<T> Future<T> {
    pub fn from_data(data: Arc<FutureData<T>>) -> Self {
        Self { data }
    }

    pub fn is_ready(&self) -> bool {
        self.data.is_ready()
    }
}

impl<T: Clone> Future<T> {
    pub fn get(&self) -> T {
        self.data.get()
    }
}

impl<T: Send + 'static> Future<T> {
    /// Type-erase this future's completion as a `Waitable`, for use as a
    /// dependency of another task.
    pub fn as_waitable(&self) -> Arc<dyn Waitable> {
        self.data.clone()
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_after_set_returns_value() {
        let data = FutureData::new();
        data.set_value(42);
        let future = Future::from_data(data);
        assert_eq!(future.get(), 42);
    }

    #[test]
    fn get_blocks_until_set_from_another_thread() {
        let data = FutureData::<i32>::new();
        let future = Future::from_data(data.clone());
        let handle = thread::spawn(move || future.get());
        thread::sleep(std::time::Duration::from_millis(20));
        data.set_value(7);
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn add_waiter_after_resolution_returns_false() {
        let data = FutureData::new();
        data.set_value(1);
        assert!(!data.add_waiter(Box::new(|| {})));
    }

    #[test]
    fn add_waiter_before_resolution_runs_on_set() {
        let data = FutureData::<i32>::new();
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        assert!(data.add_waiter(Box::new(move || *ran2.lock().unwrap() = true)));
        data.set_value(1);
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn failed_future_resumes_panic_on_get() {
        let data = FutureData::<i32>::new();
        data.set_failed(Box::new("boom"));
        let future = Future::from_data(data);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| future.get()));
        assert!(result.is_err());
    }
}
