//! Counting semaphore used as the scheduler's "work available" signal.
//!
//! Grounded on `axeberg::kernel::work_stealing::SharedState`'s
//! `park_mutex`/`park_condvar` pair, generalized from a single-bit park
//! flag into a counting semaphore so posts are never lost between a
//! context deciding to idle and it actually parking (mirrors the
//! original's `Semaphore mWorkAvailable`, which `Context::Run`'s idle path
//! waits on and `Add`/`Push` post to).

use crate::future::Waitable;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

type Waiter = Box<dyn FnOnce() + Send>;

struct State {
    count: u32,
    /// Number of callers currently blocked inside `condvar.wait`/
    /// `condvar.wait_timeout`, tracked so `post_all` can grant enough
    /// permits that every one of them actually wakes up holding one,
    /// instead of most of them spuriously waking, seeing `count == 0`,
    /// and parking again.
    parked: u32,
}

pub struct Semaphore {
    state: Mutex<State>,
    condvar: Condvar,
    waiters: Mutex<Vec<Waiter>>,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { count: 0, parked: 0 }),
            condvar: Condvar::new(),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn post(&self) {
        let mut state = self.state.lock().unwrap();
        state.count += 1;
        self.condvar.notify_one();
        drop(state);
        self.drain_waiters();
    }

    /// Wake every context currently parked in `wait`/`wait_timeout`, and
    /// ensure each of them actually consumes a permit and proceeds rather
    /// than just spuriously waking — grants one permit per currently
    /// parked waiter (at least one, so a `post_all` with nobody parked
    /// still behaves like a normal `post`).
    pub fn post_all(&self) {
        let mut state = self.state.lock().unwrap();
        let permits = state.parked.max(1);
        state.count = state.count.saturating_add(permits);
        self.condvar.notify_all();
        drop(state);
        self.drain_waiters();
    }

    fn drain_waiters(&self) {
        let pending: Vec<Waiter> = std::mem::take(&mut *self.waiters.lock().unwrap());
        for waiter in pending {
            waiter();
        }
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while state.count == 0 {
            state.parked += 1;
            state = self.condvar.wait(state).unwrap();
            state.parked -= 1;
        }
        state.count -= 1;
    }

    /// Block until a permit is available or `timeout` elapses. Returns
    /// `true` if a permit was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if state.count > 0 {
                state.count -= 1;
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            state.parked += 1;
            let (guard, _timeout_result) = self.condvar.wait_timeout(state, remaining).unwrap();
            state = guard;
            state.parked -= 1;
        }
    }
}

/// The concrete `Waitable` spec.md's `GetHasWorkCondition()` returns: a
/// one-shot callback is queued and fires on the next `post`/`post_all`,
/// rather than the single-assignment semantics `FutureData` implements.
impl Waitable for Semaphore {
    fn add_waiter(&self, callback: Waiter) -> bool {
        self.waiters.lock().unwrap().push(callback);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_then_wait_does_not_block() {
        let sem = Semaphore::new();
        sem.post();
        sem.wait();
    }

    #[test]
    fn wait_blocks_until_posted() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = sem.clone();
        let handle = thread::spawn(move || sem2.wait());
        thread::sleep(std::time::Duration::from_millis(20));
        sem.post();
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_returns_false_when_unposted() {
        let sem = Semaphore::new();
        assert!(!sem.wait_timeout(std::time::Duration::from_millis(5)));
    }

    #[test]
    fn waiter_registered_before_post_runs_on_post() {
        let sem = Semaphore::new();
        let ran = Arc::new(std::sync::Mutex::new(false));
        let ran2 = ran.clone();
        assert!(sem.add_waiter(Box::new(move || *ran2.lock().unwrap() = true)));
        sem.post();
        assert!(*ran.lock().unwrap());
    }

    /// `post_all` must actually wake every currently-parked waiter with a
    /// permit, not just the one thread lucky enough to win the race for a
    /// single granted permit.
    #[test]
    fn post_all_wakes_every_parked_waiter() {
        const WAITERS: usize = 8;
        let sem = Arc::new(Semaphore::new());
        let proceeded = Arc::new(AtomicAll::new());
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let proceeded = Arc::clone(&proceeded);
                thread::spawn(move || {
                    sem.wait();
                    proceeded.mark();
                })
            })
            .collect();

        // Give every thread a chance to actually park before posting.
        thread::sleep(std::time::Duration::from_millis(50));
        sem.post_all();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(proceeded.count(), WAITERS);
    }

    struct AtomicAll {
        count: std::sync::atomic::AtomicUsize,
    }

    impl AtomicAll {
        fn new() -> Self {
            Self { count: std::sync::atomic::AtomicUsize::new(0) }
        }

        fn mark(&self) {
            self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        fn count(&self) -> usize {
            self.count.load(std::sync::atomic::Ordering::SeqCst)
        }
    }
}
