//! Thin front-end over `ralph-core` (§6.6, §10.6).
//!
//! Keeps the teacher's `clap`-derive `Parser`/`Subcommand` shape
//! (`gator-cli::main`) but shrinks the command surface to exactly the
//! five entries named in §6.6: `status`, `reset`, `cleanup`, `run`,
//! `worker`. Argument-parsing ergonomics, help text, and colourised
//! output beyond clap's derive defaults are explicitly out of scope.

mod cleanup_cmd;
mod reset_cmd;
mod run_cmd;
mod status_cmd;
mod worker_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ralph", about = "Fresh-context autonomous development loop")]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue status: pending/current/complete counts and names.
    Status,
    /// Move the current plan back to pending, optionally removing its worktree.
    Reset {
        /// Plan name to reset (defaults to whatever is in current/).
        name: Option<String>,
        /// Also remove the plan's worktree.
        #[arg(long)]
        remove_worktree: bool,
    },
    /// Remove orphaned worktrees that no longer correspond to a queued plan.
    Cleanup {
        /// Report what would be removed without touching anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a single plan file to completion in the current checkout.
    Run {
        /// Path to a plan file or bundle directory.
        plan_file: PathBuf,
        /// Maximum iterations before giving up.
        #[arg(long, default_value_t = 50)]
        max_iterations: u32,
    },
    /// Drain the queue: pick up plans one at a time until it is empty.
    Worker {
        /// Process exactly one plan, then exit.
        #[arg(long)]
        once: bool,
        /// Finalise completed plans by opening a pull request (default).
        #[arg(long)]
        pr: bool,
        /// Finalise completed plans by merging into the base branch.
        #[arg(long)]
        merge: bool,
        /// Poll interval in seconds when the queue is empty.
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after completing this many plans.
        #[arg(long)]
        max: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let repo_root = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    // Nominal outcomes and user cancellation both exit 0; an engine
    // failure maps to a non-zero exit code (§6.6).
    let result = match cli.command {
        Commands::Status => status_cmd::run(&repo_root),
        Commands::Reset { name, remove_worktree } => reset_cmd::run(&repo_root, name.as_deref(), remove_worktree).await,
        Commands::Cleanup { dry_run } => cleanup_cmd::run(&repo_root, dry_run).await,
        Commands::Run { plan_file, max_iterations } => run_cmd::run(&repo_root, &plan_file, max_iterations).await,
        Commands::Worker { once, pr, merge, interval, max } => {
            worker_cmd::run(&repo_root, once, pr, merge, interval, max).await
        }
    };

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
