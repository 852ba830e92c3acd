//! Filesystem queue over `plans/{pending,current,complete}/` (§4.F).
//!
//! Grounded in `state/mod.rs`'s explicit-transition-table style (detailed
//! `bail!`-equivalent error messages citing the offending state), adapted
//! from an in-memory state machine to one backed by directory renames.

use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;

use super::{Plan, PlanParseError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse plan: {0}")]
    Parse(#[from] PlanParseError),

    #[error("cannot activate {name}: current/ already holds {existing}")]
    CurrentOccupied { name: String, existing: String },

    #[error("more than one plan present in current/: {0:?}")]
    MultipleCurrent(Vec<String>),

    #[error("plan {0} not found in pending/")]
    NotPending(String),

    #[error("plan {0} not found in current/")]
    NotCurrent(String),
}

/// Snapshot returned by [`Queue::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub current_count: usize,
    pub complete_count: usize,
    pub current_name: Option<String>,
    pub pending_names: Vec<String>,
}

/// The three-directory plan queue rooted at `<repo>/plans/`.
#[derive(Debug, Clone)]
pub struct Queue {
    root: PathBuf,
}

impl Queue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    fn current_dir(&self) -> PathBuf {
        self.root.join("current")
    }

    fn complete_dir(&self) -> PathBuf {
        self.root.join("complete")
    }

    /// `{pending_count, current_count, complete_count, current_name?,
    /// pending_names[]}`, `pending_names` sorted lexicographically.
    pub fn status(&self) -> Result<QueueStatus, QueueError> {
        let mut pending_names = list_entry_names(&self.pending_dir())?;
        pending_names.sort();
        let current_names = list_entry_names(&self.current_dir())?;
        let complete_names = list_entry_names(&self.complete_dir())?;

        if current_names.len() > 1 {
            return Err(QueueError::MultipleCurrent(current_names));
        }

        Ok(QueueStatus {
            pending_count: pending_names.len(),
            current_count: current_names.len(),
            complete_count: complete_names.len(),
            current_name: current_names.into_iter().next(),
            pending_names,
        })
    }

    /// All pending plans, sorted lexicographically by stem.
    pub fn pending(&self) -> Result<Vec<Plan>, QueueError> {
        let mut names = list_entry_names(&self.pending_dir())?;
        names.sort();
        names
            .into_iter()
            .map(|name| Plan::load(&entry_path(&self.pending_dir(), &name)).map_err(QueueError::from))
            .collect()
    }

    /// The single plan in `current/`, or `None` if empty. Errors if more
    /// than one entry is present.
    pub fn current(&self) -> Result<Option<Plan>, QueueError> {
        let names = list_entry_names(&self.current_dir())?;
        if names.len() > 1 {
            return Err(QueueError::MultipleCurrent(names));
        }
        match names.into_iter().next() {
            Some(name) => Ok(Some(Plan::load(&entry_path(&self.current_dir(), &name))?)),
            None => Ok(None),
        }
    }

    /// Move a pending plan into `current/`. Requires `current/` to be
    /// empty. Returns the plan re-loaded from its new location.
    pub fn activate(&self, plan: &Plan) -> Result<Plan, QueueError> {
        if let Some(existing) = self.current()? {
            return Err(QueueError::CurrentOccupied { name: plan.name.clone(), existing: existing.name });
        }

        let src = entry_path(&self.pending_dir(), &entry_name(plan));
        if !src.exists() {
            return Err(QueueError::NotPending(plan.name.clone()));
        }

        std::fs::create_dir_all(self.current_dir())?;
        let dest = entry_path(&self.current_dir(), &entry_name(plan));
        std::fs::rename(&src, &dest)?;

        Ok(Plan::load(&dest)?)
    }

    /// Move the plan in `current/` into `complete/<name>-<YYYYMMDD>`,
    /// appending `-k` (k>=2) on collision.
    pub fn complete(&self, plan: &Plan) -> Result<Plan, QueueError> {
        let src = entry_path(&self.current_dir(), &entry_name(plan));
        if !src.exists() {
            return Err(QueueError::NotCurrent(plan.name.clone()));
        }

        std::fs::create_dir_all(self.complete_dir())?;
        let date = Local::now().format("%Y%m%d").to_string();
        let base_name = format!("{}-{date}", plan.name);
        let is_bundle = plan.bundle_dir.is_some();

        let mut candidate = base_name.clone();
        let mut suffix = 2;
        loop {
            let dest = if is_bundle {
                self.complete_dir().join(&candidate)
            } else {
                self.complete_dir().join(format!("{candidate}.md"))
            };
            if !dest.exists() {
                std::fs::rename(&src, &dest)?;
                return Ok(Plan::load(&dest)?);
            }
            candidate = format!("{base_name}-{suffix}");
            suffix += 1;
        }
    }

    /// Move the plan in `current/` back into `pending/<name>`.
    pub fn reset(&self, plan: &Plan) -> Result<Plan, QueueError> {
        let src = entry_path(&self.current_dir(), &entry_name(plan));
        if !src.exists() {
            return Err(QueueError::NotCurrent(plan.name.clone()));
        }

        std::fs::create_dir_all(self.pending_dir())?;
        let dest = entry_path(&self.pending_dir(), &entry_name(plan));
        std::fs::rename(&src, &dest)?;

        Ok(Plan::load(&dest)?)
    }
}

/// The on-disk entry name for a plan: a bundle directory name, or the
/// flat `<name>.md` filename.
fn entry_name(plan: &Plan) -> String {
    if plan.bundle_dir.is_some() {
        plan.name.clone()
    } else {
        format!("{}.md", plan.name)
    }
}

fn entry_path(dir: &Path, entry_name: &str) -> PathBuf {
    dir.join(entry_name)
}

/// List the plan stems present in `dir`: bundle directory names, and
/// `.md` file stems, excluding progress/feedback sidecar files.
fn list_entry_names(dir: &Path) -> Result<Vec<String>, QueueError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if !file_name.ends_with(".md") {
            continue;
        }
        if file_name.ends_with(".progress.md") || file_name.ends_with(".feedback.md") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_flat_plan(dir: &Path, name: &str) {
        std::fs::write(dir.join(format!("{name}.md")), format!("**Status:** pending\n- [ ] task for {name}\n")).unwrap();
    }

    fn setup() -> (tempfile::TempDir, Queue) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("pending")).unwrap();
        std::fs::create_dir_all(tmp.path().join("current")).unwrap();
        std::fs::create_dir_all(tmp.path().join("complete")).unwrap();
        (tmp, Queue::new(tmp.path()))
    }

    #[test]
    fn status_reports_sorted_pending_names() {
        let (tmp, queue) = setup();
        write_flat_plan(&tmp.path().join("pending"), "zeta");
        write_flat_plan(&tmp.path().join("pending"), "alpha");

        let status = queue.status().unwrap();
        assert_eq!(status.pending_count, 2);
        assert_eq!(status.pending_names, vec!["alpha", "zeta"]);
        assert_eq!(status.current_count, 0);
        assert!(status.current_name.is_none());
    }

    #[test]
    fn activate_moves_pending_into_current() {
        let (tmp, queue) = setup();
        write_flat_plan(&tmp.path().join("pending"), "my-plan");
        let plan = queue.pending().unwrap().into_iter().next().unwrap();

        let activated = queue.activate(&plan).unwrap();
        assert_eq!(activated.name, "my-plan");
        assert!(tmp.path().join("current/my-plan.md").exists());
        assert!(!tmp.path().join("pending/my-plan.md").exists());
    }

    #[test]
    fn activate_fails_when_current_occupied() {
        let (tmp, queue) = setup();
        write_flat_plan(&tmp.path().join("pending"), "first");
        write_flat_plan(&tmp.path().join("pending"), "second");

        let plans = queue.pending().unwrap();
        queue.activate(&plans[0]).unwrap();

        let err = queue.activate(&plans[1]).unwrap_err();
        assert!(matches!(err, QueueError::CurrentOccupied { .. }));
    }

    #[test]
    fn current_errors_on_multiple_entries() {
        let (tmp, queue) = setup();
        write_flat_plan(&tmp.path().join("current"), "a");
        write_flat_plan(&tmp.path().join("current"), "b");

        let err = queue.current().unwrap_err();
        assert!(matches!(err, QueueError::MultipleCurrent(_)));
    }

    #[test]
    fn complete_appends_date_and_resolves_collisions() {
        let (tmp, queue) = setup();
        write_flat_plan(&tmp.path().join("current"), "done-plan");
        let plan = Plan::load(&tmp.path().join("current/done-plan.md")).unwrap();

        let completed = queue.complete(&plan).unwrap();
        let today = Local::now().format("%Y%m%d").to_string();
        assert!(completed.path.to_string_lossy().contains(&format!("done-plan-{today}.md")));

        // A second plan with the same name completing the same day collides.
        write_flat_plan(&tmp.path().join("current"), "done-plan");
        let plan2 = Plan::load(&tmp.path().join("current/done-plan.md")).unwrap();
        let completed2 = queue.complete(&plan2).unwrap();
        assert!(completed2.path.to_string_lossy().contains(&format!("done-plan-{today}-2.md")));
    }

    #[test]
    fn reset_moves_current_back_to_pending() {
        let (tmp, queue) = setup();
        write_flat_plan(&tmp.path().join("current"), "stuck-plan");
        let plan = Plan::load(&tmp.path().join("current/stuck-plan.md")).unwrap();

        queue.reset(&plan).unwrap();
        assert!(tmp.path().join("pending/stuck-plan.md").exists());
        assert!(!tmp.path().join("current/stuck-plan.md").exists());
    }

    #[test]
    fn bundle_directories_are_listed_and_activated() {
        let (tmp, queue) = setup();
        let bundle = tmp.path().join("pending/my-bundle");
        std::fs::create_dir(&bundle).unwrap();
        std::fs::write(bundle.join("plan.md"), "- [ ] task\n").unwrap();

        let plans = queue.pending().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].name, "my-bundle");

        let activated = queue.activate(&plans[0]).unwrap();
        assert_eq!(activated.name, "my-bundle");
        assert!(tmp.path().join("current/my-bundle/plan.md").exists());
    }
}
