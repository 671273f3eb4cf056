use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use anvil::exit_codes;

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Drive an agent through a tiered build plan, one governed patch at a time")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new anvil project
    Init,
    /// Ingest a plan and execute it, resuming an unfinished run of the same plan
    Run {
        /// Plan file (JSON or YAML)
        #[arg(short, long)]
        plan: PathBuf,

        /// Stop after this many loop iterations. Overrides anvil.toml.
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Stop once the run has used this many tokens. Overrides anvil.toml.
        #[arg(long)]
        token_cap: Option<u64>,
    },
    /// Continue a paused or interrupted run
    Resume {
        run_id: String,

        /// Stop after this many loop iterations. Overrides anvil.toml.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Show a run's tiers and phases (latest run by default)
    Status { run_id: Option<String> },
    /// List all runs
    List,
    /// Requeue a phase with a fresh retry budget
    Reset { run_id: String, phase_id: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default anvil.toml file
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            exit_codes::STARTUP_ERROR
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = anvil::init::is_initialized(&project_dir)
        .then(|| anvil::init::get_anvil_dir(&project_dir).join("logs"));
    let _log_guard = anvil::logging::init(log_dir.as_deref(), cli.verbose);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run {
            plan,
            max_iterations,
            token_cap,
        } => {
            return cmd::cmd_run(
                &project_dir,
                plan,
                cli.verbose,
                *max_iterations,
                *token_cap,
                interrupt_token(),
            )
            .await;
        }
        Commands::Resume {
            run_id,
            max_iterations,
        } => {
            return cmd::cmd_resume(
                &project_dir,
                run_id,
                cli.verbose,
                *max_iterations,
                interrupt_token(),
            )
            .await;
        }
        Commands::Status { run_id } => cmd::cmd_status(&project_dir, run_id.as_deref())?,
        Commands::List => cmd::cmd_list(&project_dir)?,
        Commands::Reset { run_id, phase_id } => cmd::cmd_reset(&project_dir, run_id, phase_id)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(exit_codes::SUCCESS)
}

/// A token cancelled by Ctrl-C. The run pauses at the next await point.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{} Interrupt received, pausing the run...",
                style("⏸").yellow().bold()
            );
            trigger.cancel();
        }
    });
    token
}
