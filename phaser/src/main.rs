//! Phase-sequenced build engine CLI.
//!
//! Every subcommand operates on one plan directory (`--plan`, default `.`),
//! whose engine state lives in `<plan>/.phaser/`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use phaser::control::{self, StopOutcome};
use phaser::controller::RunStop;
use phaser::error::EngineError;
use phaser::exit_codes;
use phaser::io::paths::PhaserPaths;
use phaser::logging;

#[derive(Parser)]
#[command(
    name = "phaser",
    version,
    about = "Drive a code-generation agent through an ordered plan of verified phases"
)]
struct Cli {
    /// Plan directory holding the phase files.
    #[arg(long, global = true, default_value = ".")]
    plan: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create run state, resolving build/typecheck/lint/test commands once.
    Init {
        /// Work area the agent modifies and the checks run in.
        #[arg(long)]
        work: PathBuf,
        /// TOML config copied into `.phaser/config.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run remaining phases until done or a phase exhausts its retries.
    Start,
    /// Terminate the running controller and its in-flight child.
    Stop,
    /// Show progress.
    Status {
        /// Print the status document as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Discard all progress.
    Reset,
    /// Forget completion and failures of one phase.
    ResetPhase { id: String },
    /// Mark a phase completed without running it.
    SkipPhase { id: String },
    /// Clear the current phase's failure count.
    Retry,
    /// Print the controller log, or all logs of one phase.
    Logs { phase: Option<String> },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    // Only an initialized plan gets a controller log; `start` rejects the rest.
    let controller_log = match cli.command {
        Command::Start => {
            let paths = PhaserPaths::new(&cli.plan);
            paths
                .run_state_path
                .is_file()
                .then_some(paths.controller_log_path)
        }
        _ => None,
    };
    logging::init(controller_log.as_deref())?;

    let plan = cli.plan.as_path();
    match cli.command {
        Command::Init { work, config } => cmd_init(plan, &work, config.as_deref()),
        Command::Start => cmd_start(plan),
        Command::Stop => cmd_stop(plan),
        Command::Status { json } => cmd_status(plan, json),
        Command::Reset => {
            control::reset(plan)?;
            println!("run reset");
            Ok(exit_codes::OK)
        }
        Command::ResetPhase { id } => {
            control::reset_phase(plan, &id)?;
            println!("phase {id} reset");
            Ok(exit_codes::OK)
        }
        Command::SkipPhase { id } => {
            if control::skip_phase(plan, &id)? {
                println!("phase {id} marked completed");
            } else {
                println!("phase {id} was already completed");
            }
            Ok(exit_codes::OK)
        }
        Command::Retry => {
            let (id, cleared) = control::retry_current(plan)?;
            match cleared {
                Some(record) => println!("cleared {} failed attempts of {id}", record.attempts),
                None => println!("{id} had no recorded failures"),
            }
            Ok(exit_codes::OK)
        }
        Command::Logs { phase } => {
            print!("{}", control::logs(plan, phase.as_deref())?);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(plan: &Path, work: &Path, config: Option<&Path>) -> Result<i32> {
    let outcome = control::init(plan, work, config)?;
    println!(
        "initialized {} ({} phases)",
        outcome.paths.plan_dir.display(),
        outcome.phase_count
    );
    for (kind, command) in outcome.state.tools.configured() {
        println!("  {kind}: {command}");
    }
    Ok(exit_codes::OK)
}

fn cmd_start(plan: &Path) -> Result<i32> {
    let outcome = control::start(plan)?;
    for id in &outcome.completed {
        println!("completed {id}");
    }
    match &outcome.stop {
        RunStop::Completed => {
            println!("all phases completed");
            Ok(exit_codes::OK)
        }
        RunStop::Failed { .. } => {
            if let Some(err) = outcome.failure() {
                eprintln!("error: {err}");
            }
            Ok(exit_codes::PHASE_FAILED)
        }
    }
}

fn cmd_stop(plan: &Path) -> Result<i32> {
    match control::stop(plan)? {
        StopOutcome::NotRunning => println!("no controller running"),
        StopOutcome::Stopped { pid } => println!("stopped controller (pid {pid})"),
        StopOutcome::OrphanKilled { pgid } => {
            println!("no controller running; killed leftover child process group {pgid}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_status(plan: &Path, json: bool) -> Result<i32> {
    let report = control::status(plan)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(exit_codes::OK)
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::ControllerAlreadyRunning { .. }) => exit_codes::ALREADY_RUNNING,
        Some(EngineError::RetryBudgetExhausted { .. }) => exit_codes::PHASE_FAILED,
        _ => exit_codes::INVALID,
    }
}
