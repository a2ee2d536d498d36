//! [`Task<T>`]: a caller-facing, chainable handle around a [`Future<T>`].
//!
//! The original lets callers chain continuations with an overloaded
//! `operator>>` (`Future<T> >> (T) -> U`). Operator overloading for
//! control flow isn't idiomatic Rust, so [`Task::then`] is a plain method
//! doing the same thing: schedule a new task depending on this one's
//! completion.

use crate::future::{Future, Waitable};
use crate::scheduler::Scheduler;
use crate::task::{ExecutionContext, TaskOutput};
use std::sync::Arc;

/// A task's result, with ergonomic chaining. Cheap to clone — it's a
/// thin wrapper over the same [`Future<T>`] every clone shares.
pub struct Task<T> {
    future: Future<T>,
}

impl<T: Send + Clone + 'static> Task<T> {
    pub(crate) fn from_future(future: Future<T>) -> Self {
        Self { future }
    }

    /// Block the calling thread until the result is available.
    pub fn get(&self) -> T {
        self.future.get()
    }

    pub fn is_ready(&self) -> bool {
        self.future.is_ready()
    }

    /// Borrow the underlying future, e.g. to pass as a dependency to
    /// [`Scheduler::add_with_dependencies`].
    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    /// Schedule `g` on `scheduler` to run once this task's value is ready,
    /// receiving that value by clone. Returns a new `Task` for the
    /// continuation's own result.
    pub fn then<U, F>(&self, scheduler: &Arc<Scheduler>, g: F) -> Task<U>
    where
        F: FnOnce(T) -> TaskOutput<U> + Send + 'static,
        U: Send + Clone + 'static,
    {
        let dependency: Arc<dyn Waitable> = self.future.as_waitable();
        let value_future = self.future.clone();
        let body = move |_ctx: &mut ExecutionContext<U>| g(value_future.get());
        let result = scheduler.add_with_dependencies(body, &[dependency]);
        Task::from_future(result)
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
        }
    }
}

impl<T> From<Future<T>> for Task<T> {
    fn from(future: Future<T>) -> Self {
        Self { future }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::task::TaskOutput;

    #[test]
    fn then_chains_onto_completion_value() {
        let scheduler = Scheduler::new(Config::new().with_num_workers(1));
        scheduler.enter().unwrap();
        let first: Task<i32> = Task::from_future(scheduler.add(|| TaskOutput::Ready(3)));
        let second = first.then(&scheduler, |value| TaskOutput::Ready(value * 2));
        scheduler.run_until_idle();
        assert_eq!(second.get(), 6);
        scheduler.leave();
    }
}
