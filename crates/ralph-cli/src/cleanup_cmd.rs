//! `ralph cleanup`: remove orphaned worktrees (§4.I
//! `WorktreeManager::cleanup`).

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use ralph_core::plan::Queue;
use ralph_core::vcs::{GitVcs, GitVcsFactory};
use ralph_core::worktree::WorktreeManager;

pub async fn run(repo_root: &Path, dry_run: bool) -> Result<()> {
    let queue = Queue::new(repo_root.join("plans"));
    let main_vcs = Arc::new(GitVcs::new(repo_root));
    let worktree = WorktreeManager::new(main_vcs, Arc::new(GitVcsFactory), None);

    if dry_run {
        let mut active = std::collections::HashSet::new();
        for plan in queue.pending()? {
            active.insert(plan.branch.trim_start_matches("feat/").to_string());
        }
        if let Some(plan) = queue.current()? {
            active.insert(plan.branch.trim_start_matches("feat/").to_string());
        }

        let base = worktree.base();
        if !base.exists() {
            info!(base = %base.display(), "no worktrees present");
            return Ok(());
        }
        for entry in std::fs::read_dir(base)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if active.contains(name) {
                continue;
            }
            info!(path = %path.display(), "would inspect orphan candidate");
        }
        return Ok(());
    }

    let results = worktree.cleanup(&queue).await?;
    if results.is_empty() {
        info!("nothing to clean up");
        return Ok(());
    }
    for entry in &results {
        if entry.removed {
            info!(path = %entry.path.display(), plan = %entry.plan_name, "removed");
        } else {
            info!(
                path = %entry.path.display(),
                plan = %entry.plan_name,
                reason = entry.skip_reason.as_deref().unwrap_or("unknown reason"),
                "skipped"
            );
        }
    }
    Ok(())
}
