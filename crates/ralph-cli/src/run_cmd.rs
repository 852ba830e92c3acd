//! `ralph run <plan-file>`: a single Iteration Loop invocation against
//! one plan file, run directly in the current checkout with no
//! worktree isolation (§6.6).

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use ralph_core::Config;
use ralph_core::iteration::{IterationLoop, LoopOutcome, TemplateSubstitutionPromptBuilder};
use ralph_core::plan::Plan;
use ralph_core::runner::ClaudeCodeRunner;
use ralph_core::vcs::GitVcs;

/// The embedded default prompt template (§6.4): loading templates from
/// a configured directory or per-project override files is a front-end
/// concern left unimplemented here.
static DEFAULT_TEMPLATE: &str = include_str!("default_template.md");

pub async fn run(repo_root: &Path, plan_file: &Path, max_iterations: u32) -> Result<()> {
    let plan = Plan::load(plan_file)?;

    let mut cfg = Config::default();
    cfg.max_iterations = max_iterations;

    let runner = Arc::new(ClaudeCodeRunner::new());
    let vcs = Arc::new(GitVcs::new(repo_root));
    let prompt_builder = Arc::new(TemplateSubstitutionPromptBuilder);

    let iteration_loop = IterationLoop::new(runner, vcs, prompt_builder);
    let context_path = repo_root.join(".ralph").join("context.json");
    let base_branch = "main";

    let cancel = CancellationToken::new();
    let watch = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        watch.cancel();
    });

    let (outcome, plan) = iteration_loop
        .run(&cancel, &cfg, plan, repo_root, DEFAULT_TEMPLATE, base_branch, &context_path, None, None)
        .await?;

    match outcome {
        LoopOutcome::Completed => {
            info!(plan = %plan.name, "completed");
        }
        LoopOutcome::Cancelled => {
            info!("cancelled");
        }
        LoopOutcome::MaxIterationsExceeded { iterations } => {
            anyhow::bail!("max iterations ({iterations}) exceeded without verified completion");
        }
        LoopOutcome::FinalBlocker { blocker, iterations } => {
            anyhow::bail!("blocked after {iterations} iterations: {}", blocker.description);
        }
    }
    Ok(())
}
