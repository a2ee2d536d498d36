//! taskloom — a work-stealing task scheduler with futures, dependency
//! barriers, and task continuations.
//!
//! A [`scheduler::Scheduler`] owns one [`context::Context`] per thread
//! that has entered it (via [`scheduler::Scheduler::enter`]), each backed
//! by its own half of a growable Chase-Lev [`deque`]. Tasks are scheduled
//! with [`scheduler::Scheduler::add`]/[`scheduler::Scheduler::add_with_dependencies`],
//! run once every dependency [`future::Future`] has resolved, and may
//! install a continuation in place of returning — either by returning
//! [`task::TaskOutput::Continuation`], or, for multi-dependency joins, by
//! calling [`task::ExecutionContext::extend_with`].
//!
//! [`parallel_for::parallel_for`] builds a recursive fork-join loop on top
//! of the same primitives: split a [`range::SplittableRange`] down to a
//! grain size, run the leaves as tasks, and join pairs of siblings with
//! an `extend_with`-installed continuation.

pub mod barrier;
pub mod config;
pub mod context;
pub mod deque;
pub mod error;
pub mod future;
pub mod handle;
pub mod parallel_for;
pub mod range;
pub mod scheduler;
pub mod semaphore;
pub mod task;

pub use config::Config;
pub use future::Future;
pub use handle::Task;
pub use scheduler::Scheduler;
pub use task::{ExecutionContext, TaskOutput};
