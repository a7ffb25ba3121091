// src/main.rs
//
// =============================================================================
// NNPAL: COMMANDER & ENTRY POINT
// =============================================================================
//
// `nnpal <step> <phase>` runs exactly one phase of the active-learning loop
// and exits. Jobs submitted by a launch phase are picked up by a later
// `check` invocation; nothing stays resident.
//
// Exit status: 0 on success, 1 on any failure (after an error log).

use anyhow::Result;
use clap::Parser;
use nnpal::logs::PhaseLogger;
use nnpal::phases::{self, Step, Workspace};
use nnpal::settings::UserInput;
use std::path::PathBuf;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "nnpal",
    version,
    about = "Active-learning orchestrator for neural-network potentials"
)]
struct Cli {
    /// Step of the iteration.
    #[arg(value_enum)]
    step: Step,

    /// Phase of the step (e.g. prepare, launch, check).
    phase: String,

    /// Verbosity: 0 = info, 1 = debug.
    #[arg(short = 'v', long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    verbose: u8,

    /// Optional phase input, relative to the workspace root.
    #[arg(short = 'i', long, default_value = "input.json")]
    input: PathBuf,

    /// Cluster profile from machine.json (default: detected from hostname).
    #[arg(short = 'c', long)]
    cluster: Option<String>,

    /// Workspace root.
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_path = cli.root.join(format!("{}_{}.log", cli.step.as_str(), cli.phase));
    if let Err(e) = PhaseLogger::init(Some(&log_path), cli.verbose > 0) {
        eprintln!("logger init failed: {:#}", e);
    }

    if let Err(e) = execute(cli).await {
        log::error!("{:#}", e);
        log::logger().flush();
        std::process::exit(1);
    }
    log::logger().flush();
}

async fn execute(cli: Cli) -> Result<()> {
    let input_path = if cli.input.is_absolute() {
        cli.input.clone()
    } else {
        cli.root.join(&cli.input)
    };
    let input = UserInput::load(&input_path)?;
    let ws = Workspace::new(&cli.root, input, cli.cluster);
    phases::run(cli.step, &cli.phase, &ws).await?;
    log::info!("{} {} done", cli.step.as_str(), cli.phase);
    Ok(())
}
