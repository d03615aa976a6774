use std::io::IsTerminal;
use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use willitscale::workloads::Builtin;
use willitscale::{Affinity, Model, RunConfig};

/// Default diagnostics filter when `RUST_LOG` is not set
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "willitscale",
          about = "Run a workload on many cores at once and report how its \
                   throughput scales")]
struct Cli {
    /// Number of iterations to run, 0 runs until interrupted
    #[arg(short = 's', long, default_value_t = 0)]
    iterations: u64,

    /// Number of threads or processes to run
    #[arg(short = 't', long, default_value_t = 1)]
    tasks: usize,

    /// Affinitize tasks on SMT threads (default cores)
    #[arg(short = 'm', long = "smt-affinitize", conflicts_with = "no_affinity")]
    smt_affinitize: bool,

    /// No affinity
    #[arg(short = 'n', long)]
    no_affinity: bool,

    /// Print every task's progress on every tick
    #[arg(short, long)]
    verbose: bool,

    /// Run tasks as processes or as threads
    #[arg(long, value_enum, default_value_t = Model::Process)]
    model: Model,

    /// Workload to run
    #[arg(short, long, value_enum, default_value_t = Builtin::Getppid)]
    workload: Builtin,
}

/// Diagnostics go to stderr, stdout only carries the report
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(filter)
        .try_init();
}

fn try_main(cli: Cli) -> anyhow::Result<()> {
    let config = RunConfig {
        tasks: cli.tasks,
        iterations: cli.iterations,
        affinity: Affinity::from_flags(cli.smt_affinitize, cli.no_affinity)?,
        model: cli.model,
        verbose: cli.verbose,
    };

    let outcome = willitscale::run(config, cli.workload.workload())
        .context("run failed")?;
    debug!(?outcome, "run complete");

    Ok(())
}

fn main() {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Usage errors are configuration errors, help is not
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            process::exit(code);
        }
    };

    if let Err(err) = try_main(cli) {
        eprintln!("Error: {:#}", err);
        process::exit(1);
    }
}
