//! End to end control of a run

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::affinity::AffinityPlanner;
use crate::barrier::StartBarrier;
use crate::config::{Model, RunConfig};
use crate::error::HarnessError;
use crate::launcher::{self, ExecutionStrategy, ProcessStrategy, ThreadStrategy};
use crate::measure::{MeasurementLoop, Report};
use crate::shared::SharedArea;
use crate::workload::Workload;

/// Everything workers and the measurement loop share for one run
pub struct RunContext {
    pub config: RunConfig,
    pub workload: Arc<dyn Workload>,
    pub area: Arc<SharedArea>,
    pub barrier: Arc<StartBarrier>,

    /// Raised by the interrupt handler to end an unbounded run
    pub stop: Arc<AtomicBool>,
}

impl RunContext {
    /// Allocate the shared resources of a run
    pub fn new(config: RunConfig, workload: Arc<dyn Workload>)
            -> Result<Self, HarnessError> {
        let area = Arc::new(SharedArea::allocate(config.tasks)?);
        let barrier = Arc::new(StartBarrier::open()?);

        Ok(RunContext {
            config,
            workload,
            area,
            barrier,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// How a run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The target tick count was reached
    Finished { average: u64 },

    /// The operator interrupted the run
    Interrupted,
}

impl From<Report> for RunOutcome {
    fn from(report: Report) -> Self {
        match report {
            Report::Finished { average, .. } => RunOutcome::Finished { average },
            Report::Stopped { .. } => RunOutcome::Interrupted,
        }
    }
}

/// Exit status of a thread controller that was stopped before the target
const CONTROLLER_STOPPED: i32 = 2;

/// Run `workload` as described by `config`, from setup to cleanup
pub fn run(config: RunConfig, workload: Arc<dyn Workload>)
        -> Result<RunOutcome, HarnessError> {
    config.validate()?;

    info!(tasks = config.tasks, model = %config.model,
          affinity = ?config.affinity, iterations = config.iterations,
          "starting run");

    workload.prepare(config.tasks);

    let ret = RunContext::new(config, workload.clone()).and_then(|ctx| {
        let controller = Arc::new(AtomicI32::new(0));
        handle_interrupt(&ctx.stop, &controller)?;

        match ctx.config.model {
            Model::Process => run_processes(&ctx),
            Model::Thread => run_threads(&ctx, &controller),
        }
    });

    workload.cleanup();
    ret
}

/// Raise `stop` on an interrupt, and relay it as `SIGTERM` to the thread
/// controller once `controller` holds its pid
fn handle_interrupt(stop: &Arc<AtomicBool>, controller: &Arc<AtomicI32>)
        -> Result<(), HarnessError> {
    let stop = stop.clone();
    let controller = controller.clone();

    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
        let pid = controller.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe { libc::kill(pid, libc::SIGTERM); }
        }
    }).map_err(|err| HarnessError::resource("signal handler",
        io::Error::new(io::ErrorKind::Other, err)))?;

    debug!("interrupt handler installed");
    Ok(())
}

/// Process model: workers are our children, the measurement loop watches
/// the stop flag
fn run_processes(ctx: &RunContext) -> Result<RunOutcome, HarnessError> {
    let planner = AffinityPlanner::new(ctx.config.affinity)?;
    drive(ctx, planner, ProcessStrategy::new(), &mut io::stdout())
        .map(RunOutcome::from)
}

/// Thread model: a forked controller process hosts the worker threads so the
/// whole fleet can be torn down at once by ending it
fn run_threads(ctx: &RunContext, controller: &AtomicI32)
        -> Result<RunOutcome, HarnessError> {
    // The controller leaves its average here
    let result = SharedArea::allocate(1)?;

    let _ = io::stdout().flush();
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(HarnessError::last_os_error("fork"));
    }

    if pid == 0 {
        // The terminal sends SIGINT to the whole process group, only the
        // original process reacts to it
        unsafe { libc::signal(libc::SIGINT, libc::SIG_IGN); }

        let code = match AffinityPlanner::new(ctx.config.affinity).and_then(
                |planner| drive(ctx, planner, ThreadStrategy::new(),
                                &mut io::stdout())) {
            Ok(Report::Finished { average, .. }) => {
                result.slot(0).store(average, Ordering::SeqCst);
                0
            }
            Ok(Report::Stopped { .. }) => CONTROLLER_STOPPED,
            Err(err) => {
                eprintln!("Error: {:#}", anyhow::Error::new(err));
                1
            }
        };

        let _ = io::stdout().flush();
        unsafe { libc::_exit(code); }
    }

    controller.store(pid, Ordering::SeqCst);
    debug!(pid, "spawned thread controller");

    // An interrupt that came before the pid was stored was not relayed
    if ctx.stop.load(Ordering::SeqCst) {
        unsafe { libc::kill(pid, libc::SIGTERM); }
    }

    let status = launcher::wait_pid(pid)
        .map_err(|err| HarnessError::resource("waitpid", err))?;
    controller.store(0, Ordering::SeqCst);

    controller_outcome(status, &result)
}

/// Turn the wait status of the thread controller into the run's outcome
fn controller_outcome(status: libc::c_int, result: &SharedArea)
        -> Result<RunOutcome, HarnessError> {
    if libc::WIFEXITED(status) {
        return match libc::WEXITSTATUS(status) {
            0 => Ok(RunOutcome::Finished {
                average: result.slot(0).load(Ordering::SeqCst),
            }),
            CONTROLLER_STOPPED => Ok(RunOutcome::Interrupted),
            code => Err(HarnessError::ControllerExited(code)),
        };
    }

    if libc::WIFSIGNALED(status) && libc::WTERMSIG(status) == libc::SIGTERM {
        return Ok(RunOutcome::Interrupted);
    }

    error!(status = %launcher::describe_status(status),
           "thread controller died");
    Err(HarnessError::ControllerExited(status))
}

/// Create every worker, each bound through `planner`. A partial fleet is
/// never left running
fn spawn_all<S>(ctx: &RunContext, planner: &AffinityPlanner, strategy: &mut S)
        -> Result<(), HarnessError>
    where S: ExecutionStrategy + ?Sized
{
    for index in 0..ctx.config.tasks {
        if let Err(err) = planner.with_binding(index,
                |unit| strategy.spawn(ctx, index, unit)) {
            strategy.cancel();
            let _ = strategy.join();
            return Err(err);
        }
    }

    Ok(())
}

/// Start all workers, measure until done, then stop them all
pub fn drive<S, W>(ctx: &RunContext, planner: AffinityPlanner,
                   mut strategy: S, out: &mut W)
        -> Result<Report, HarnessError>
    where S: ExecutionStrategy, W: Write
{
    spawn_all(ctx, &planner, &mut strategy)?;

    // Only open the gate once the last worker exists and is bound
    if let Err(err) = ctx.barrier.release() {
        strategy.cancel();
        let _ = strategy.join();
        return Err(err);
    }
    debug!(workers = strategy.workers(), "start barrier released");

    // Topology is only needed while spawning
    drop(planner);

    let mut measure = MeasurementLoop::new(ctx.config.tasks,
        ctx.config.iterations, ctx.config.verbose);
    let ret = writeln!(out, "testcase:{}", ctx.workload.description())
        .map_err(HarnessError::from)
        .and_then(|()| measure.run(&*ctx.area, &ctx.stop, out));

    strategy.cancel();
    let joined = strategy.join();
    debug!("workers stopped");

    let report = ret?;
    joined?;
    Ok(report)
}
