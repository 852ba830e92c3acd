//! `ralph reset`: move the current plan back to pending, optionally
//! tearing down its worktree (§4.F `Queue::reset`, §4.I
//! `WorktreeManager::remove`).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::info;

use ralph_core::plan::Queue;
use ralph_core::vcs::{GitVcs, GitVcsFactory};
use ralph_core::worktree::WorktreeManager;

pub async fn run(repo_root: &Path, name: Option<&str>, remove_worktree: bool) -> Result<()> {
    let queue = Queue::new(repo_root.join("plans"));
    let plan = queue.current()?.context("no plan is currently active")?;

    if let Some(name) = name {
        if plan.name != name {
            bail!("current plan is {:?}, not {name:?}", plan.name);
        }
    }

    let main_vcs = Arc::new(GitVcs::new(repo_root));
    let worktree = WorktreeManager::new(main_vcs, Arc::new(GitVcsFactory), None);

    if remove_worktree && worktree.exists(&plan) {
        worktree.remove(&plan, false).await?;
    }

    let reset = queue.reset(&plan)?;
    info!(plan = %reset.name, "reset back to pending/");
    Ok(())
}
