//! Will it scale?
//!
//! Runs a workload on many workers at once, samples every worker's progress
//! once a second and reports the spread and total of their throughput after
//! a short warmup.

pub mod affinity;
pub mod barrier;
pub mod config;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod measure;
pub mod shared;
pub mod topology;
pub mod watchdog;
pub mod workload;
pub mod workloads;

pub use config::{Affinity, Model, RunConfig, MAX_TASKS};
pub use error::HarnessError;
pub use lifecycle::{run, RunOutcome};
pub use workload::{Counter, Workload};
