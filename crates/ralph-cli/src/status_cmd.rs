//! `ralph status`: show queue counts and names (§4.F `Queue::status`).

use std::path::Path;

use anyhow::Result;
use tracing::info;

use ralph_core::plan::Queue;

pub fn run(repo_root: &Path) -> Result<()> {
    let queue = Queue::new(repo_root.join("plans"));
    let status = queue.status()?;

    info!(current = status.current_name.as_deref().unwrap_or("(none)"), "current plan");
    info!(count = status.pending_count, "pending plans");
    for name in &status.pending_names {
        info!(plan = %name, "pending");
    }
    info!(count = status.complete_count, "complete plans");

    Ok(())
}
