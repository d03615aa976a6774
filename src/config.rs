use std::fmt;

use clap::ValueEnum;

use crate::error::HarnessError;
use crate::topology::Granularity;

/// Maximum number of workers a single run may use
pub const MAX_TASKS: usize = 2048;

/// How workers are pinned to hardware
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affinity {
    /// Workers float wherever the scheduler puts them
    None,

    /// One worker per physical core (round robin past the core count)
    Core,

    /// One worker per SMT thread (round robin past the thread count)
    Smt,
}

impl Affinity {
    /// Combine the `-m` and `-n` command line switches
    pub fn from_flags(smt: bool, no_affinity: bool)
            -> Result<Self, HarnessError> {
        match (smt, no_affinity) {
            (true, true) => Err(HarnessError::Config(
                "--smt-affinitize and --no-affinity are mutually exclusive"
                    .into())),
            (true, false) => Ok(Affinity::Smt),
            (false, true) => Ok(Affinity::None),
            (false, false) => Ok(Affinity::Core),
        }
    }

    /// Topology granularity to bind at, `None` when affinity is disabled
    pub fn granularity(self) -> Option<Granularity> {
        match self {
            Affinity::None => None,
            Affinity::Core => Some(Granularity::Core),
            Affinity::Smt => Some(Granularity::Thread),
        }
    }
}

/// What kind of execution context each worker is
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Model {
    /// One forked process per worker
    Process,

    /// One thread per worker, inside a forked controller process
    Thread,
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Model::Process => f.write_str("process"),
            Model::Thread => f.write_str("thread"),
        }
    }
}

/// Parameters of one run
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Number of workers
    pub tasks: usize,

    /// Measured ticks to run after warmup, 0 runs until interrupted
    pub iterations: u64,

    pub affinity: Affinity,
    pub model: Model,

    /// Print every worker's delta on every tick
    pub verbose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            tasks: 1,
            iterations: 0,
            affinity: Affinity::Core,
            model: Model::Process,
            verbose: false,
        }
    }
}

impl RunConfig {
    /// Reject configurations that must not start any worker
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.tasks == 0 {
            return Err(HarnessError::Config("tasks cannot be 0".into()));
        }

        if self.tasks > MAX_TASKS {
            return Err(HarnessError::Config(
                format!("tasks cannot exceed {}", MAX_TASKS)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_bounds() {
        let mut config = RunConfig::default();
        assert!(config.validate().is_ok());

        config.tasks = 0;
        assert_eq!(config.validate().unwrap_err().to_string(),
                   "tasks cannot be 0");

        config.tasks = MAX_TASKS;
        assert!(config.validate().is_ok());

        config.tasks = MAX_TASKS + 1;
        assert_eq!(config.validate().unwrap_err().to_string(),
                   "tasks cannot exceed 2048");
    }

    #[test]
    fn affinity_flags() {
        assert_eq!(Affinity::from_flags(false, false).unwrap(), Affinity::Core);
        assert_eq!(Affinity::from_flags(true, false).unwrap(), Affinity::Smt);
        assert_eq!(Affinity::from_flags(false, true).unwrap(), Affinity::None);
        assert!(matches!(Affinity::from_flags(true, true),
                         Err(HarnessError::Config(_))));
    }

    #[test]
    fn granularity_follows_affinity() {
        assert_eq!(Affinity::None.granularity(), None);
        assert_eq!(Affinity::Core.granularity(), Some(Granularity::Core));
        assert_eq!(Affinity::Smt.granularity(), Some(Granularity::Thread));
    }
}
