//! Once-a-second sampling of the worker counters and the report built from it

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::HarnessError;
use crate::shared::SharedArea;

/// Ticks discarded before measurement starts
pub const WARMUP_TICKS: u64 = 5;

/// Time between two samples
pub const TICK: Duration = Duration::from_secs(1);

/// Anything the per-worker counters can be read from
pub trait CounterSource {
    /// Number of counters
    fn workers(&self) -> usize;

    /// Copy the current value of every counter into `into`
    fn snapshot(&self, into: &mut [u64]);
}

impl CounterSource for SharedArea {
    fn workers(&self) -> usize {
        self.slots()
    }

    fn snapshot(&self, into: &mut [u64]) {
        SharedArea::snapshot(self, into)
    }
}

/// Per-worker progress between two snapshots
#[derive(Debug, Default)]
pub struct Sampler {
    prev: Vec<u64>,
    cur: Vec<u64>,
    deltas: Vec<u64>,
}

impl Sampler {
    /// Start from a zero baseline for `workers` counters
    pub fn new(workers: usize) -> Self {
        Sampler {
            prev: vec![0; workers],
            cur: vec![0; workers],
            deltas: vec![0; workers],
        }
    }

    /// Take a snapshot and return how far each worker got since the last one
    pub fn sample<S: CounterSource + ?Sized>(&mut self, source: &S)
            -> Result<&[u64], HarnessError> {
        source.snapshot(&mut self.cur);

        for (worker, (&cur, prev)) in
                self.cur.iter().zip(self.prev.iter_mut()).enumerate() {
            self.deltas[worker] = cur.checked_sub(*prev).ok_or(
                HarnessError::CounterRegression {
                    worker,
                    previous: *prev,
                    current: cur,
                })?;
            *prev = cur;
        }

        Ok(&self.deltas)
    }
}

/// Spread of the deltas of one tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickStats {
    pub min: u64,
    pub max: u64,
    pub total: u64,
}

impl TickStats {
    pub fn from_deltas(deltas: &[u64]) -> Self {
        let mut ret = TickStats { min: u64::MAX, max: 0, total: 0 };
        for &delta in deltas {
            ret.min = ret.min.min(delta);
            ret.max = ret.max.max(delta);
            ret.total += delta;
        }
        if deltas.is_empty() {
            ret.min = 0;
        }
        ret
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Measuring,
    Done,
}

/// What a recorded tick changed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Nothing worth announcing
    None,

    /// The last warmup tick was recorded
    MeasurementStarted,

    /// The target was reached, with the per-tick average
    Finished { average: u64 },
}

/// Running totals across ticks
#[derive(Debug)]
pub struct RunStatistics {
    target: u64,
    ticks: u64,
    accumulated: u64,
    phase: Phase,
}

impl RunStatistics {
    /// `target` measured ticks, 0 for no limit
    pub fn new(target: u64) -> Self {
        RunStatistics { target, ticks: 0, accumulated: 0, phase: Phase::Warmup }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Ticks recorded so far, warmup included
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Sum of the totals of every measured tick
    pub fn accumulated(&self) -> u64 {
        self.accumulated
    }

    /// Account for one more tick
    pub fn record(&mut self, tick: &TickStats) -> Event {
        assert!(self.phase != Phase::Done, "tick recorded after the run ended");
        self.ticks += 1;

        if self.ticks <= WARMUP_TICKS {
            if self.ticks == WARMUP_TICKS {
                self.phase = Phase::Measuring;
                return Event::MeasurementStarted;
            }
            return Event::None;
        }

        self.accumulated = self.accumulated.saturating_add(tick.total);

        // Past warmup here, so the subtraction cannot underflow
        if self.target != 0 && self.ticks - WARMUP_TICKS >= self.target {
            self.phase = Phase::Done;
            return Event::Finished { average: self.accumulated / self.target };
        }

        Event::None
    }
}

/// How a measurement loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Report {
    /// The target tick count was reached
    Finished { ticks: u64, average: u64 },

    /// The stop flag was raised first
    Stopped { ticks: u64 },
}

/// Samples the counters every tick and prints the report
pub struct MeasurementLoop {
    period: Duration,
    verbose: bool,
    sampler: Sampler,
    stats: RunStatistics,
}

impl MeasurementLoop {
    pub fn new(workers: usize, target: u64, verbose: bool) -> Self {
        MeasurementLoop {
            period: TICK,
            verbose,
            sampler: Sampler::new(workers),
            stats: RunStatistics::new(target),
        }
    }

    /// Use a different tick length
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn stats(&self) -> &RunStatistics {
        &self.stats
    }

    /// Sample `source` until the target is reached or `stop` is raised
    pub fn run<S, W>(&mut self, source: &S, stop: &AtomicBool, out: &mut W)
            -> Result<Report, HarnessError>
        where S: CounterSource + ?Sized, W: Write
    {
        writeln!(out, "warmup")?;
        out.flush()?;

        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(Report::Stopped { ticks: self.stats.ticks() });
            }

            thread::sleep(self.period);

            if stop.load(Ordering::Relaxed) {
                return Ok(Report::Stopped { ticks: self.stats.ticks() });
            }

            let deltas = self.sampler.sample(source)?;
            if self.verbose {
                for (index, delta) in deltas.iter().enumerate() {
                    writeln!(out, "{:4} -> {}", index, delta)?;
                }
            }

            let tick = TickStats::from_deltas(deltas);
            writeln!(out, "min:{} max:{} total:{}",
                     tick.min, tick.max, tick.total)?;

            match self.stats.record(&tick) {
                Event::None => {}
                Event::MeasurementStarted => writeln!(out, "measurement")?,
                Event::Finished { average } => {
                    writeln!(out, "average:{}", average)?;
                    out.flush()?;
                    return Ok(Report::Finished {
                        ticks: self.stats.ticks(),
                        average,
                    });
                }
            }

            out.flush()?;
        }
    }
}
