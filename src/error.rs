use std::io;

use thiserror::Error;

/// Everything that can stop a run short
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The run configuration was rejected before anything was started
    #[error("{0}")]
    Config(String),

    /// An OS resource the run depends on could not be created or used
    #[error("{what} failed")]
    Resource {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// The topology had no unit of the requested kind
    #[error("No {kind} found. Try {hint} the -m flag")]
    NoUnits {
        kind: &'static str,
        hint: &'static str,
    },

    /// A worker's counter is lower than it was on the previous tick
    #[error("counter of worker {worker} went backwards ({previous} -> {current})")]
    CounterRegression {
        worker: usize,
        previous: u64,
        current: u64,
    },

    /// A worker process died on its own instead of by our termination signal
    #[error("worker {index} exited unexpectedly ({status})")]
    WorkerExited { index: usize, status: String },

    /// The thread controller process did not shut down cleanly
    #[error("thread controller exited with status {0}")]
    ControllerExited(i32),

    /// The report could not be written
    #[error("failed to write report")]
    Output(#[from] io::Error),
}

impl HarnessError {
    /// Wrap the current `errno` as a resource error for `what`
    pub fn last_os_error(what: &'static str) -> Self {
        HarnessError::Resource { what, source: io::Error::last_os_error() }
    }

    /// Wrap an I/O error as a resource error for `what`
    pub fn resource(what: &'static str, source: io::Error) -> Self {
        HarnessError::Resource { what, source }
    }
}
