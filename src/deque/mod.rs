//! Growable Chase-Lev work-stealing deque.
//!
//! Port of the original `WorkStealingQueue<T>` (Chase & Lev, "Dynamic
//! Circular Work-Stealing Deque"): the owner pushes and pops from the
//! bottom (LIFO), thieves steal from the top (FIFO), and the backing
//! circular buffer grows on push when full and shrinks on pop once
//! occupancy drops below `1 / ShrinkFraction` of capacity. Grown buffers
//! form a parent chain so a concurrent thief holding a stale buffer
//! pointer can still read from it safely; buffers are recycled through a
//! per-deque, size-indexed [`pool::BufferPool`] rather than released to
//! the allocator on every resize.
//!
//! Elements are required to be `Copy` and pointer-sized in spirit — this
//! crate instantiates the deque over raw task pointers, never over owned
//! task values, matching the original's `T*` element type.

mod pool;

use pool::{BufferPool, Slots};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};

/// Outcome of a pop or steal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealResult<T> {
    /// An item was retrieved.
    Success(T),
    /// The deque was (and remains) empty.
    Empty,
    /// Lost a race with another thief or the owner; caller may retry.
    Retry,
}

struct CircularBuffer<T> {
    parent: Option<std::ptr::NonNull<CircularBuffer<T>>>,
    log_size: u32,
    slots: Slots<T>,
}

impl<T: Copy> CircularBuffer<T> {
    fn create(log_size: u32, pool: &mut BufferPool<T>) -> *mut CircularBuffer<T> {
        let slots = pool.acquire(log_size);
        Box::into_raw(Box::new(CircularBuffer {
            parent: None,
            log_size,
            slots,
        }))
    }

    #[inline]
    fn mask(&self) -> i64 {
        (self.slots.len() - 1) as i64
    }

    #[inline]
    fn size(&self) -> i64 {
        self.slots.len() as i64
    }

    #[inline]
    fn size_minus_one(&self) -> i64 {
        self.mask()
    }

    #[inline]
    fn can_shrink(&self) -> bool {
        self.parent.is_some()
    }

    /// # Safety
    /// `index` must be a slot this buffer currently owns exclusive write
    /// access to (enforced by the owner/thief index protocol above).
    #[inline]
    unsafe fn set(&self, index: i64, value: T) {
        let slot = &self.slots[(index & self.mask()) as usize];
        unsafe {
            (*slot.get()).write(value);
        }
    }

    /// # Safety
    /// The slot at `index` must have been written and not concurrently
    /// mutated.
    #[inline]
    unsafe fn get(&self, index: i64) -> T {
        let slot = &self.slots[(index & self.mask()) as usize];
        unsafe { (*slot.get()).assume_init() }
    }

    /// Allocate a buffer one log-size larger, copying `[front, back)`.
    ///
    /// # Safety
    /// `this` must be a live `CircularBuffer<T>` and `[front, back)` must
    /// be within the range currently owned by the caller.
    unsafe fn grow(
        this: *mut CircularBuffer<T>,
        pool: &mut BufferPool<T>,
        front: i64,
        back: i64,
    ) -> *mut CircularBuffer<T> {
        let log_size = unsafe { (*this).log_size } + 1;
        let slots = pool.acquire(log_size);
        let new_buf = Box::into_raw(Box::new(CircularBuffer {
            parent: std::ptr::NonNull::new(this),
            log_size,
            slots,
        }));
        let mut i = front;
        while i < back {
            unsafe {
                (*new_buf).set(i, (*this).get(i));
            }
            i += 1;
        }
        new_buf
    }

    /// Copy `[front, back)` down into the parent buffer and return it.
    ///
    /// # Safety
    /// `this` must be live and `can_shrink()` (have a parent).
    unsafe fn shrink(
        this: *mut CircularBuffer<T>,
        front: i64,
        back: i64,
    ) -> *mut CircularBuffer<T> {
        let parent = unsafe { (*this).parent.expect("shrink requires a parent buffer") };
        let parent_ptr = parent.as_ptr();
        let mut i = front;
        while i < back {
            unsafe {
                (*parent_ptr).set(i, (*this).get(i));
            }
            i += 1;
        }
        parent_ptr
    }

    /// Release `this` back to the pool. Any values still nominally "live"
    /// in its slots are simply forgotten, which is sound because `T` is
    /// `Copy` and therefore owns no resource that needs dropping.
    ///
    /// # Safety
    /// `this` must be a live, uniquely-owned buffer produced by `create`
    /// or `grow`, not reachable through any other pointer afterwards.
    unsafe fn destroy(this: *mut CircularBuffer<T>, pool: &mut BufferPool<T>) {
        let boxed = unsafe { Box::from_raw(this) };
        pool.release(boxed.log_size, boxed.slots);
    }
}

struct Inner<T> {
    front: AtomicI64,
    back: AtomicI64,
    array: AtomicPtr<CircularBuffer<T>>,
    pool: RefCell<BufferPool<T>>,
    /// Fraction of capacity used below which a pop triggers a shrink.
    shrink_fraction: i64,
}

// Safety: `pool` and buffer-chain mutation (grow/shrink/destroy) only ever
// happen from `push`/`pop`, which only the single owning thread calls.
// Stealers only ever call `steal`, which never touches `pool`.
unsafe impl<T: Send> Sync for Inner<T> {}

/// Default fraction of capacity used below which a pop triggers a shrink,
/// matching the original's `ShrinkFraction` literal.
pub const DEFAULT_SHRINK_FRACTION: u32 = 3;

/// Owner's handle: push and pop from the bottom.
pub struct Worker<T> {
    inner: Arc<Inner<T>>,
}

/// Thief's handle: steal from the top.
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Copy + Send> Worker<T> {
    /// Create a new deque. `initial_log_size` is the log2 of the starting
    /// buffer capacity (the original defaults this to 6, i.e. 64 slots).
    /// `shrink_fraction` is the occupancy fraction below which `Pop` shrinks
    /// the buffer back down (the original's `ShrinkFraction`, asserted `>= 3`).
    pub fn new_with_shrink_fraction(
        initial_log_size: u32,
        shrink_fraction: u32,
    ) -> (Worker<T>, Stealer<T>) {
        assert!(
            shrink_fraction >= 3,
            "shrink_fraction must be at least 3 to avoid growing and shrinking on alternating pushes/pops"
        );
        let mut pool = BufferPool::new();
        let array = CircularBuffer::create(initial_log_size, &mut pool);
        let inner = Arc::new(Inner {
            front: AtomicI64::new(0),
            back: AtomicI64::new(0),
            array: AtomicPtr::new(array),
            pool: RefCell::new(pool),
            shrink_fraction: shrink_fraction as i64,
        });
        (
            Worker {
                inner: inner.clone(),
            },
            Stealer { inner },
        )
    }

    /// Create a new deque using [`DEFAULT_SHRINK_FRACTION`].
    pub fn new(initial_log_size: u32) -> (Worker<T>, Stealer<T>) {
        Self::new_with_shrink_fraction(initial_log_size, DEFAULT_SHRINK_FRACTION)
    }

    /// Push a value onto the bottom. Always succeeds — the buffer grows
    /// rather than rejecting the push.
    pub fn push(&self, value: T) {
        let back = self.inner.back.load(Ordering::Acquire);
        let front = self.inner.front.load(Ordering::Acquire);
        let mut array = self.inner.array.load(Ordering::Acquire);
        let size = back - front;

        // Safety: `array` is the live buffer and [front, back) is owned by
        // the caller (the single owner thread).
        if size >= unsafe { (*array).size_minus_one() } {
            let mut pool = self.inner.pool.borrow_mut();
            let grown = unsafe { CircularBuffer::grow(array, &mut pool, front, back) };
            self.inner.array.store(grown, Ordering::Release);
            array = grown;
            tracing::trace!(new_log_size = unsafe { (*array).log_size }, "deque grew");
        }

        unsafe {
            (*array).set(back, value);
        }
        self.inner.back.store(back + 1, Ordering::Release);
    }

    /// Pop from the bottom (LIFO).
    pub fn pop(&self) -> StealResult<T> {
        let back = self.inner.back.load(Ordering::Acquire) - 1;
        // The back-store and the front-load below must be SeqCst, not just
        // Release/Acquire: they're what serializes this call against a
        // concurrent `Steal`'s own front CAS (spec.md §4.1).
        self.inner.back.store(back, Ordering::SeqCst);

        let front = self.inner.front.load(Ordering::SeqCst);
        let array = self.inner.array.load(Ordering::Acquire);
        let size = back - front;

        if size < 0 {
            self.inner.back.store(front, Ordering::Release);
            return StealResult::Empty;
        }

        // Safety: we own slot `back` until we either commit or roll back.
        let value = unsafe { (*array).get(back) };

        if size > 0 {
            let (can_shrink, arr_size) = unsafe { ((*array).can_shrink(), (*array).size()) };
            if can_shrink && size < arr_size / self.inner.shrink_fraction {
                let mut pool = self.inner.pool.borrow_mut();
                let new_array = unsafe { CircularBuffer::shrink(array, front, back) };
                self.inner.array.store(new_array, Ordering::Release);
                let new_size = unsafe { (*new_array).size() };
                self.inner.back.store(back + new_size, Ordering::Release);

                let reloaded_front = self.inner.front.load(Ordering::Acquire);
                if self
                    .inner
                    .front
                    .compare_exchange(
                        reloaded_front,
                        reloaded_front + new_size,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_err()
                {
                    self.inner.back.store(back, Ordering::Release);
                }

                unsafe { CircularBuffer::destroy(array, &mut pool) };
                tracing::trace!(new_log_size = unsafe { (*new_array).log_size }, "deque shrank");
            }
            return StealResult::Success(value);
        }

        // Exactly one element left: race with stealers for it.
        let claimed = self
            .inner
            .front
            .compare_exchange(front, front + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.inner.back.store(front + 1, Ordering::Release);
        if claimed {
            StealResult::Success(value)
        } else {
            StealResult::Empty
        }
    }

    /// Approximate length; may be stale the instant it's observed.
    pub fn len(&self) -> usize {
        let back = self.inner.back.load(Ordering::Acquire);
        let front = self.inner.front.load(Ordering::Acquire);
        (back - front).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// log2 of the active buffer's current capacity, for tests that assert
    /// the buffer chain collapses back to its initial size after a drain.
    #[cfg(test)]
    pub(crate) fn current_log_size(&self) -> u32 {
        let array = self.inner.array.load(Ordering::Acquire);
        unsafe { (*array).log_size }
    }

    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Copy + Send> Stealer<T> {
    /// Steal from the top (FIFO).
    pub fn steal(&self) -> StealResult<T> {
        let front = self.inner.front.load(Ordering::Acquire);
        let old_array = self.inner.array.load(Ordering::Acquire);
        let back = self.inner.back.load(Ordering::Acquire);
        let array = self.inner.array.load(Ordering::Acquire);
        let size = back - front;

        if size <= 0 {
            return StealResult::Empty;
        }

        // Safety: size > 0 proves there is at least one readable slot, and
        // an ambiguous race (buffer changed under us) is checked below
        // before the value is trusted.
        if size & unsafe { (*array).size_minus_one() } == 0 {
            return if std::ptr::eq(array, old_array) && front == self.inner.front.load(Ordering::Acquire) {
                StealResult::Empty
            } else {
                StealResult::Retry
            };
        }

        let value = unsafe { (*array).get(front) };
        match self.inner.front.compare_exchange(
            front,
            front + 1,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => StealResult::Success(value),
            Err(_) => StealResult::Retry,
        }
    }

    pub fn is_empty(&self) -> bool {
        let front = self.inner.front.load(Ordering::Acquire);
        let back = self.inner.back.load(Ordering::Acquire);
        back - front <= 0
    }
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Stealer {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Copy> Drop for Inner<T> {
    fn drop(&mut self) {
        let mut pool = self.pool.borrow_mut();
        let mut current = *self.array.get_mut();
        loop {
            // Safety: this is the last owner of the buffer chain (Inner's
            // Arc refcount just hit zero), so nothing else can be reading
            // through `current` or any of its parents concurrently.
            let parent = unsafe { (*current).parent };
            unsafe { CircularBuffer::destroy(current, &mut pool) };
            match parent {
                Some(p) => current = p.as_ptr(),
                None => break,
            }
        }
    }
}

// Safety: all mutation is synchronized through the atomics above, plus the
// owner-thread-only invariant documented on `Inner`.
unsafe impl<T: Send> Send for Worker<T> {}
unsafe impl<T: Send> Send for Stealer<T> {}
unsafe impl<T: Send> Sync for Stealer<T> {}
