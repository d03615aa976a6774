//! What the harness runs on every worker

use std::sync::atomic::{AtomicU64, Ordering};

/// Progress counter of a single worker.
///
/// Each counter has exactly one writer, so bumping it is a plain load and
/// store rather than a locked read-modify-write. The measurement side only
/// ever reads it.
pub struct Counter<'a> {
    slot: &'a AtomicU64,
}

impl<'a> Counter<'a> {
    pub fn new(slot: &'a AtomicU64) -> Self {
        Counter { slot }
    }

    /// Record one completed unit of work
    #[inline(always)]
    pub fn incr(&self) {
        self.add(1);
    }

    /// Record `n` completed units of work
    #[inline(always)]
    pub fn add(&self, n: u64) {
        let val = self.slot.load(Ordering::Relaxed);
        self.slot.store(val.wrapping_add(n), Ordering::Relaxed);
    }

    /// Units recorded so far
    pub fn get(&self) -> u64 {
        self.slot.load(Ordering::Relaxed)
    }
}

/// A micro-benchmark the harness scales across workers
///
/// `run` never returns: the harness stops a workload by killing the
/// execution context it runs in, possibly in the middle of an iteration.
pub trait Workload: Send + Sync {
    /// One line summary printed at the top of the report
    fn description(&self) -> &str;

    /// Called once, before any worker exists
    fn prepare(&self, _workers: usize) {}

    /// Called once, after every worker is gone
    fn cleanup(&self) {}

    /// Loop forever, bumping `counter` once per unit of work. `index` is the
    /// worker's 0-based number
    fn run(&self, counter: &Counter<'_>, index: usize) -> !;
}
