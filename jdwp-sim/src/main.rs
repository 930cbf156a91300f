// JDWP simulated debuggee
//
// Hosts the JDWP agent inside a tiny scripted "VM" so debuggers and tests have
// something real to talk to over the wire.

use anyhow::{Context, Result};
use clap::Parser;
use jdwp_agent::controller::EXIT_BAD_OPTIONS;
use jdwp_agent::{ConfigError, DebuggerController, DebuggerOptions, StartupError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod handlers;
mod program;
mod vm;
mod worker;

use vm::SimulatedVm;
use worker::Worker;

const EXIT_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "jdwp-sim", version, about = "Simulated debuggee hosting the JDWP agent")]
struct Args {
    /// Agent options, e.g. transport=dt_socket,server=y,suspend=y,address=8000
    #[arg(long, conflicts_with = "config")]
    agent: Option<String>,

    /// JSON file with the agent options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Calls of `run()` per worker
    #[arg(long, default_value_t = 1000)]
    iterations: u64,

    /// Pause between two instructions, in milliseconds
    #[arg(long, default_value_t = 20)]
    pace_ms: u64,
}

fn load_options(args: &Args) -> Result<DebuggerOptions> {
    match (&args.agent, &args.config) {
        (Some(agent), _) => Ok(DebuggerOptions::parse(agent)?),
        (None, Some(path)) => load_options_file(path),
        (None, None) => Err(ConfigError::Missing("address").into()),
    }
}

fn load_options_file(path: &Path) -> Result<DebuggerOptions> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let options: DebuggerOptions = serde_json::from_str(&text)
        .with_context(|| format!("Invalid agent options in {}", path.display()))?;
    if options.transport != "dt_socket" {
        return Err(ConfigError::UnsupportedTransport(options.transport).into());
    }
    Ok(options)
}

fn fatal(err: StartupError) -> ! {
    let code = err.exit_code();
    error!("{:#}", anyhow::Error::from(err));
    std::process::exit(code)
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the listening address
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("jdwp_agent=info,jdwp_sim=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let options = match load_options(&args) {
        Ok(options) => options,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(EXIT_BAD_OPTIONS);
        }
    };
    info!("Starting simulated debuggee with {} worker(s)", args.threads);

    let vm = Arc::new(SimulatedVm::new(args.threads));
    let mut controller = DebuggerController::new(vm.clone(), options.clone()).unwrap_or_else(|e| fatal(e));
    handlers::register(&controller);

    if options.server {
        let addr = controller.listen().unwrap_or_else(|e| fatal(e));
        let mut stdout = std::io::stdout();
        writeln!(stdout, "Listening for transport dt_socket at address: {}", addr.port())?;
        stdout.flush()?;
    }
    if let Err(e) = controller.start() {
        fatal(e);
    }

    let workers = vm
        .thread_ids()
        .into_iter()
        .enumerate()
        .map(|(n, thread)| {
            Worker {
                vm: vm.clone(),
                ctx: controller.context().clone(),
                thread,
                iterations: args.iterations,
                pace: Duration::from_millis(args.pace_ms),
                loads_classes: n == 0,
            }
            .spawn()
        })
        .collect::<std::io::Result<Vec<_>>>()
        .context("Failed to start worker threads")?;

    let exit_code = loop {
        if let Some(code) = vm.wait_for_exit(EXIT_POLL) {
            break code;
        }
        if workers.iter().all(|worker| worker.is_finished()) {
            break 0;
        }
    };

    info!("Simulated debuggee exiting with code {}", exit_code);
    controller.on_vm_death();
    controller.dispose();
    std::process::exit(exit_code)
}
