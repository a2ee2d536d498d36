//! Recursive fork-join `parallel_for`, grounded on `parallel_for.hpp`.
//!
//! Splits a [`SplittableRange`] down to `grain_size`, runs `body` serially
//! on each leaf, and joins siblings the same way any other continuation
//! does in this crate: spawn two child tasks, then use
//! [`ExecutionContext::extend_with`] to replace the splitting task with a
//! continuation that depends on both and completes once they have.

use crate::future::{Future, Waitable};
use crate::range::SplittableRange;
use crate::scheduler::Scheduler;
use crate::task::{ExecutionContext, TaskOutput};
use smallvec::SmallVec;
use std::sync::Arc;

/// Run `body` over every piece of `range` on `scheduler`, recursively
/// splitting down to `grain_size`. Blocks the calling thread until the
/// whole range has been processed.
pub fn parallel_for<R, F>(scheduler: &Arc<Scheduler>, range: R, grain_size: usize, body: F)
where
    R: SplittableRange,
    F: Fn(R) + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let future = spawn(scheduler, range, grain_size, body);
    scheduler.wait_for(&future);
}

fn spawn<R, F>(scheduler: &Arc<Scheduler>, range: R, grain_size: usize, body: Arc<F>) -> Future<()>
where
    R: SplittableRange,
    F: Fn(R) + Send + Sync + 'static,
{
    if !range.is_splittable(grain_size) {
        return scheduler.add(move || {
            body(range);
            TaskOutput::Ready(())
        });
    }

    let (left, right) = range.split();
    let scheduler_for_children = Arc::clone(scheduler);
    let left_body = body.clone();
    let right_body = body.clone();

    scheduler.add_with_dependencies(
        move |ctx: &mut ExecutionContext<()>| {
            let left_future = spawn(&scheduler_for_children, left, grain_size, left_body);
            let right_future = spawn(&scheduler_for_children, right, grain_size, right_body);
            let dependencies: SmallVec<[Arc<dyn Waitable>; 2]> =
                SmallVec::from_iter([left_future.as_waitable(), right_future.as_waitable()]);
            ctx.extend_with(|| TaskOutput::Ready(()), &dependencies)
                .expect("a splitting task never calls extend_with more than once");
            TaskOutput::Ready(())
        },
        &[],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::range::IndexRange;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn visits_every_index_exactly_once() {
        let scheduler = Scheduler::new(Config::new().with_num_workers(1));
        scheduler.enter().unwrap();
        let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..23).map(|_| AtomicUsize::new(0)).collect());
        for grain_size in 1..=23 {
            for counter in hits.iter() {
                counter.store(0, Ordering::SeqCst);
            }
            let hits_for_body = hits.clone();
            parallel_for(&scheduler, IndexRange::new(0, 23), grain_size, move |range: IndexRange| {
                for i in range {
                    hits_for_body[i].fetch_add(1, Ordering::SeqCst);
                }
            });
            for counter in hits.iter() {
                assert_eq!(counter.load(Ordering::SeqCst), 1);
            }
        }
        scheduler.leave();
    }

    #[test]
    fn empty_range_completes_immediately() {
        let scheduler = Scheduler::new(Config::new().with_num_workers(1));
        scheduler.enter().unwrap();
        parallel_for(&scheduler, IndexRange::new(0, 0), 4, |_range: IndexRange| {
            panic!("body must not run over an empty range");
        });
        scheduler.leave();
    }
}
