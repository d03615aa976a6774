//! Creating, stopping and reaping workers
//!
//! Workers are either threads or forked processes. Both run the same body:
//! wait for the start barrier, then hand the worker's counter to the
//! workload forever.

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error};

use crate::barrier::StartBarrier;
use crate::error::HarnessError;
use crate::lifecycle::RunContext;
use crate::shared::SharedArea;
use crate::watchdog;
use crate::workload::{Counter, Workload};

/// One running worker
#[derive(Debug)]
pub struct Worker<H> {
    /// 0-based worker number, also its counter slot
    pub index: usize,

    /// Hardware unit it was created on, if affinity is enabled
    pub unit: Option<usize>,

    pub handle: H,
}

/// A way of running workers concurrently
pub trait ExecutionStrategy {
    /// Create worker `index`, running on `unit`
    fn spawn(&mut self, ctx: &RunContext, index: usize, unit: Option<usize>)
        -> Result<(), HarnessError>;

    /// Ask every worker to stop
    fn cancel(&mut self);

    /// Wait until every worker is gone
    fn join(&mut self) -> Result<(), HarnessError>;

    /// Number of workers created so far
    fn workers(&self) -> usize;
}

/// Body of every worker, threads and processes alike. Never returns: any
/// failure ends the whole process with status 1
fn worker_main(workload: &dyn Workload, area: &SharedArea,
               barrier: &StartBarrier, index: usize) -> ! {
    // Nothing may be measured before every worker exists
    if let Err(err) = barrier.wait() {
        error!(index, %err, "start barrier failed");
        unsafe { libc::_exit(1); }
    }

    let counter = Counter::new(area.slot(index));
    let _: Result<(), _> = panic::catch_unwind(AssertUnwindSafe(|| {
        workload.run(&counter, index)
    }));

    // `run` only comes back by unwinding
    error!(index, "workload panicked");
    unsafe { libc::_exit(1); }
}

/// Make sure nothing buffered gets printed twice by a forked child
fn flush_stdio() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Wait for `pid` to exit, retrying when a signal interrupts the wait
pub(crate) fn wait_pid(pid: libc::pid_t) -> io::Result<libc::c_int> {
    let mut status = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == pid {
            return Ok(status);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Human readable form of a `waitpid` status
pub(crate) fn describe_status(status: libc::c_int) -> String {
    if libc::WIFEXITED(status) {
        format!("exit status {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        format!("killed by signal {}", libc::WTERMSIG(status))
    } else {
        format!("wait status {:#x}", status)
    }
}

/// Workers as threads of the current process.
///
/// Threads cannot be cancelled at an arbitrary instruction, so the fleet is
/// only torn down by the exit of the process hosting it. `cancel` and `join`
/// therefore only let go of the handles.
#[derive(Default)]
pub struct ThreadStrategy {
    workers: Vec<Worker<thread::JoinHandle<()>>>,
}

impl ThreadStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStrategy for ThreadStrategy {
    fn spawn(&mut self, ctx: &RunContext, index: usize, unit: Option<usize>)
            -> Result<(), HarnessError> {
        let workload: Arc<dyn Workload> = ctx.workload.clone();
        let area = ctx.area.clone();
        let barrier = ctx.barrier.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{}", index))
            .spawn(move || worker_main(&*workload, &area, &barrier, index))
            .map_err(|err| HarnessError::resource("thread spawn", err))?;

        debug!(index, ?unit, "spawned worker thread");
        self.workers.push(Worker { index, unit, handle });
        Ok(())
    }

    fn cancel(&mut self) {}

    fn join(&mut self) -> Result<(), HarnessError> {
        // Detach, the threads die with the controller process
        self.workers.clear();
        Ok(())
    }

    fn workers(&self) -> usize {
        self.workers.len()
    }
}

/// Workers as forked processes, each guarded by a watchdog
#[derive(Default)]
pub struct ProcessStrategy {
    workers: Vec<Worker<libc::pid_t>>,
}

impl ProcessStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStrategy for ProcessStrategy {
    fn spawn(&mut self, ctx: &RunContext, index: usize, unit: Option<usize>)
            -> Result<(), HarnessError> {
        let parent = unsafe { libc::getpid() };

        flush_stdio();
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(HarnessError::last_os_error("fork"));
        }

        if pid == 0 {
            // We're the worker
            if let Err(err) = watchdog::install(parent) {
                error!(index, %err, "failed to arm watchdog");
                unsafe { libc::_exit(1); }
            }

            worker_main(&*ctx.workload, &ctx.area, &ctx.barrier, index);
        }

        debug!(index, pid, ?unit, "spawned worker process");
        self.workers.push(Worker { index, unit, handle: pid });
        Ok(())
    }

    fn cancel(&mut self) {
        for worker in &self.workers {
            unsafe { libc::kill(worker.handle, libc::SIGTERM); }
        }
    }

    fn join(&mut self) -> Result<(), HarnessError> {
        let mut ret = Ok(());

        // Reap everyone even if someone misbehaved
        for worker in self.workers.drain(..) {
            let status = match wait_pid(worker.handle) {
                Ok(status) => status,
                Err(err) => {
                    if ret.is_ok() {
                        ret = Err(HarnessError::resource("waitpid", err));
                    }
                    continue;
                }
            };

            let terminated = libc::WIFSIGNALED(status)
                && libc::WTERMSIG(status) == libc::SIGTERM;
            if !terminated && ret.is_ok() {
                ret = Err(HarnessError::WorkerExited {
                    index: worker.index,
                    status: describe_status(status),
                });
            }
        }

        ret
    }

    fn workers(&self) -> usize {
        self.workers.len()
    }
}
