//! Throughput of the growable work-stealing deque under a single owner
//! thread with no contention, and under one owner plus one thief.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::thread;
use taskloom::deque::{StealResult, Worker};

fn push_pop_single_thread(c: &mut Criterion) {
    c.bench_function("push_pop_single_thread_64k", |b| {
        b.iter(|| {
            let (worker, _stealer): (Worker<i64>, _) = Worker::new(6);
            for i in 0..65536i64 {
                worker.push(i);
            }
            for _ in 0..65536i64 {
                black_box(worker.pop());
            }
        });
    });
}

fn push_while_stolen(c: &mut Criterion) {
    c.bench_function("push_while_one_thief_steals", |b| {
        b.iter(|| {
            let (worker, stealer) = Worker::new(10);
            let thief = thread::spawn(move || {
                let mut stolen = 0u64;
                while stolen < 100_000 {
                    match stealer.steal() {
                        StealResult::Success(_) => stolen += 1,
                        StealResult::Empty | StealResult::Retry => thread::yield_now(),
                    }
                }
            });
            for i in 0..200_000i64 {
                worker.push(i);
            }
            while !worker.is_empty() {
                worker.pop();
            }
            thief.join().unwrap();
        });
    });
}

criterion_group!(benches, push_pop_single_thread, push_while_stolen);
criterion_main!(benches);
