//! `ralph worker`: drain the queue, one plan at a time, until empty
//! (§4.K, §6.6).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ralph_core::Config;
use ralph_core::config::CompletionMode;
use ralph_core::iteration::TemplateSubstitutionPromptBuilder;
use ralph_core::plan::Queue;
use ralph_core::runner::ClaudeCodeRunner;
use ralph_core::vcs::{GitVcs, GitVcsFactory, Vcs};
use ralph_core::worker::{GhPullRequestOpener, Worker, WorkerObservers, WorkerOptions};
use ralph_core::worktree::WorktreeManager;

static DEFAULT_TEMPLATE: &str = include_str!("default_template.md");

#[allow(clippy::too_many_arguments)]
pub async fn run(
    repo_root: &Path,
    once: bool,
    pr: bool,
    merge: bool,
    interval: Option<u64>,
    max: Option<u32>,
) -> Result<()> {
    let mut cfg = Config::default();
    if let Some(interval) = interval {
        cfg.poll_interval = Duration::from_secs(interval);
    }
    if merge {
        cfg.completion.mode = CompletionMode::Merge;
    } else if pr {
        cfg.completion.mode = CompletionMode::Pr;
    }

    let queue = Queue::new(repo_root.join("plans"));
    let main_vcs = Arc::new(GitVcs::new(repo_root));
    let vcs_factory = Arc::new(GitVcsFactory);
    let worktree = WorktreeManager::new(main_vcs.clone(), vcs_factory.clone(), cfg.worktree.base_override.clone());
    let runner = Arc::new(ClaudeCodeRunner::new());
    let prompt_builder = Arc::new(TemplateSubstitutionPromptBuilder);
    let pr_opener = Arc::new(GhPullRequestOpener::new(repo_root));
    let base_branch = main_vcs.current_branch().await.unwrap_or_else(|_| "main".to_string());

    let worker = Worker::new(
        queue,
        worktree,
        vcs_factory,
        main_vcs,
        runner,
        prompt_builder,
        pr_opener,
        cfg,
        DEFAULT_TEMPLATE.to_string(),
        base_branch,
        repo_root.to_path_buf(),
    );

    let cancel = CancellationToken::new();
    let watch = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        watch.cancel();
    });

    let observers = WorkerObservers {
        on_plan_start: Some(Box::new(|plan: &ralph_core::Plan| info!(plan = %plan.name, "starting plan"))),
        on_plan_complete: Some(Box::new(|plan: &ralph_core::Plan| info!(plan = %plan.name, "completed plan"))),
        on_plan_error: Some(Box::new(|plan: &ralph_core::Plan, reason: &str| {
            warn!(plan = %plan.name, %reason, "plan needs attention")
        })),
        on_blocker: Some(Box::new(|plan: &ralph_core::Plan, blocker: &ralph_core::markers::Blocker| {
            warn!(plan = %plan.name, description = %blocker.description, "plan blocked")
        })),
        on_iteration: Some(Box::new(|plan: &ralph_core::Plan, n: u32| info!(plan = %plan.name, iteration = n, "finished iteration"))),
    };

    let opts = WorkerOptions { once, completion_mode: None, max_plans: max };
    worker.run(&cancel, &observers, &opts).await?;
    Ok(())
}
