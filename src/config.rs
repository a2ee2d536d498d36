//! Scheduler configuration.
//!
//! Grounded on `axeberg::kernel::work_stealing::Config`'s shape (a plain
//! struct with chained setters) but carrying the tunables this crate's
//! scheduler actually needs, with defaults lifted from the original
//! `WorkStealingQueue`/`TaskScheduler` literals (`initialLogSize = 6`,
//! `ShrinkFraction = 3`, `MaxStealAttemptsBeforeIdle = 20`).

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads `Scheduler::run_forever` spawns.
    pub num_workers: usize,
    /// log2 of each context's deque's starting capacity.
    pub initial_deque_log_size: u32,
    /// Occupancy fraction (`1 / shrink_fraction`) below which a context's
    /// deque shrinks its buffer back down on `Pop`. Must be `>= 3`.
    pub shrink_fraction: u32,
    /// Consecutive failed steal rounds before a context reports `Idle`.
    pub max_steal_attempts_before_idle: u32,
    /// Capacity of the optional per-context run log (0 disables it).
    pub run_log_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            initial_deque_log_size: 6,
            shrink_fraction: crate::deque::DEFAULT_SHRINK_FRACTION,
            max_steal_attempts_before_idle: 20,
            run_log_capacity: 0,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        assert!(num_workers > 0, "a scheduler needs at least one worker");
        self.num_workers = num_workers;
        self
    }

    pub fn with_initial_deque_log_size(mut self, log_size: u32) -> Self {
        self.initial_deque_log_size = log_size;
        self
    }

    pub fn with_shrink_fraction(mut self, shrink_fraction: u32) -> Self {
        assert!(shrink_fraction >= 3, "shrink_fraction must be at least 3");
        self.shrink_fraction = shrink_fraction;
        self
    }

    pub fn with_max_steal_attempts_before_idle(mut self, attempts: u32) -> Self {
        self.max_steal_attempts_before_idle = attempts;
        self
    }

    pub fn with_run_log_capacity(mut self, capacity: usize) -> Self {
        self.run_log_capacity = capacity;
        self
    }
}
