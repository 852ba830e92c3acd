//! Progress and feedback file maintenance (§4.G).
//!
//! Grounded in the temp-file + rename atomic-write convention used
//! throughout the worktree module, generalised into a standalone helper
//! since no single teacher module owns append-only markdown logs.

use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;

use crate::plan::Plan;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("feedback entry not found: {0}")]
    EntryNotFound(String),
}

const SCAFFOLD_MARKER_START: &str = "<!--";
const SCAFFOLD_MARKER_END: &str = "-->";

/// Path to `plan`'s progress file: `<bundle>/progress.md` for bundles,
/// else `<planpath without .md>.progress.md`.
pub fn progress_path(plan: &Plan) -> PathBuf {
    match &plan.bundle_dir {
        Some(dir) => dir.join("progress.md"),
        None => sidecar_path(&plan.path, "progress"),
    }
}

/// Path to `plan`'s feedback file, analogous to [`progress_path`].
pub fn feedback_path(plan: &Plan) -> PathBuf {
    match &plan.bundle_dir {
        Some(dir) => dir.join("feedback.md"),
        None => sidecar_path(&plan.path, "feedback"),
    }
}

fn sidecar_path(plan_path: &Path, kind: &str) -> PathBuf {
    let stem = plan_path.file_stem().and_then(|s| s.to_str()).unwrap_or("plan");
    plan_path.with_file_name(format!("{stem}.{kind}.md"))
}

/// Append an iteration's progress entry, stripping the scaffolded
/// instructional comment block on the first real entry (`iteration ==
/// 1`). Writes atomically via temp file + rename.
pub fn append_progress(plan: &Plan, iteration: u32, body: &str) -> Result<(), ProgressError> {
    let path = progress_path(plan);
    let existing = read_existing(&path)?;
    let existing = if iteration == 1 { strip_scaffold_comment(&existing) } else { existing };

    let (completed, total) = plan.task_counts();
    let percent = if total == 0 { 0 } else { (completed * 100) / total };
    let timestamp = Local::now().format("%Y-%m-%d %H:%M").to_string();

    let entry = format!(
        "\n## Iteration {iteration} ({timestamp}) - {completed}/{total} ({percent}%)\n{body}\n"
    );

    write_atomic(&path, &format!("{existing}{entry}"))
}

/// Append a new feedback entry under `## Pending`, with source
/// attribution. Creates the `## Pending`/`## Processed` section headers
/// if absent.
pub fn append_feedback(plan: &Plan, source: &str, text: &str) -> Result<(), ProgressError> {
    let path = feedback_path(plan);
    let existing = read_existing(&path)?;
    let timestamp = Local::now().format("%Y-%m-%d %H:%M").to_string();
    let entry = format!("- ({timestamp}) [{source}] {text}\n");

    let updated = insert_under_pending(&existing, &entry);
    write_atomic(&path, &updated)
}

/// Move a feedback entry's exact text from `## Pending` to `## Processed`.
pub fn mark_processed(plan: &Plan, entry: &str) -> Result<(), ProgressError> {
    let path = feedback_path(plan);
    let existing = read_existing(&path)?;

    if !existing.contains(entry) {
        return Err(ProgressError::EntryNotFound(entry.to_string()));
    }

    let without = remove_line_containing(&existing, entry);
    let updated = insert_under_processed(&without, entry);
    write_atomic(&path, &updated)
}

fn read_existing(path: &Path) -> Result<String, ProgressError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ProgressError::Read { path: path.to_path_buf(), source: e }),
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<(), ProgressError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ProgressError::Write { path: path.to_path_buf(), source: e })?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content).map_err(|e| ProgressError::Write { path: tmp_path.clone(), source: e })?;
    std::fs::rename(&tmp_path, path).map_err(|e| ProgressError::Write { path: path.to_path_buf(), source: e })
}

/// Strip a leading `<!-- ... -->` scaffold comment block, if present at
/// the very start of the file (after optional leading whitespace).
fn strip_scaffold_comment(content: &str) -> String {
    let trimmed_start = content.trim_start();
    if !trimmed_start.starts_with(SCAFFOLD_MARKER_START) {
        return content.to_string();
    }
    match trimmed_start.find(SCAFFOLD_MARKER_END) {
        Some(end) => trimmed_start[end + SCAFFOLD_MARKER_END.len()..].trim_start().to_string(),
        None => content.to_string(),
    }
}

fn insert_under_pending(existing: &str, entry: &str) -> String {
    if let Some(idx) = existing.find("## Pending") {
        let insert_at = existing[idx..].find('\n').map(|n| idx + n + 1).unwrap_or(existing.len());
        let mut updated = existing[..insert_at].to_string();
        updated.push_str(entry);
        updated.push_str(&existing[insert_at..]);
        updated
    } else {
        format!("{existing}\n## Pending\n{entry}")
    }
}

fn insert_under_processed(existing: &str, entry: &str) -> String {
    if let Some(idx) = existing.find("## Processed") {
        let insert_at = existing[idx..].find('\n').map(|n| idx + n + 1).unwrap_or(existing.len());
        let mut updated = existing[..insert_at].to_string();
        updated.push_str(entry);
        updated.push_str(&existing[insert_at..]);
        updated
    } else {
        format!("{existing}\n## Processed\n{entry}")
    }
}

fn remove_line_containing(content: &str, needle: &str) -> String {
    content
        .lines()
        .filter(|line| !line.contains(needle.trim()))
        .collect::<Vec<_>>()
        .join("\n")
        + if content.ends_with('\n') { "\n" } else { "" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use std::path::PathBuf;

    fn flat_plan(dir: &Path, name: &str) -> Plan {
        let path = dir.join(format!("{name}.md"));
        std::fs::write(&path, "- [x] a\n- [ ] b\n").unwrap();
        Plan::load(&path).unwrap()
    }

    fn bundle_plan(dir: &Path, name: &str) -> Plan {
        let bundle = dir.join(name);
        std::fs::create_dir(&bundle).unwrap();
        std::fs::write(bundle.join("plan.md"), "- [x] a\n").unwrap();
        Plan::load(&bundle).unwrap()
    }

    #[test]
    fn progress_path_for_flat_plan() {
        let dir = tempfile::tempdir().unwrap();
        let plan = flat_plan(dir.path(), "widget");
        assert_eq!(progress_path(&plan), dir.path().join("widget.progress.md"));
    }

    #[test]
    fn progress_path_for_bundle_plan() {
        let dir = tempfile::tempdir().unwrap();
        let plan = bundle_plan(dir.path(), "widget");
        assert_eq!(progress_path(&plan), dir.path().join("widget/progress.md"));
    }

    #[test]
    fn append_progress_creates_file_with_entry() {
        let dir = tempfile::tempdir().unwrap();
        let plan = flat_plan(dir.path(), "widget");

        append_progress(&plan, 1, "did some work").unwrap();
        let content = std::fs::read_to_string(progress_path(&plan)).unwrap();
        assert!(content.contains("## Iteration 1"));
        assert!(content.contains("1/2 (50%)"));
        assert!(content.contains("did some work"));
    }

    #[test]
    fn append_progress_strips_scaffold_only_on_first_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let plan = flat_plan(dir.path(), "widget");
        let path = progress_path(&plan);
        std::fs::write(&path, "<!-- scaffold instructions -->\nreal content\n").unwrap();

        append_progress(&plan, 1, "first").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("scaffold instructions"));
        assert!(content.contains("real content"));
    }

    #[test]
    fn append_feedback_then_mark_processed() {
        let dir = tempfile::tempdir().unwrap();
        let plan = flat_plan(dir.path(), "widget");

        append_feedback(&plan, "verification", "missing edge case").unwrap();
        let content = std::fs::read_to_string(feedback_path(&plan)).unwrap();
        assert!(content.contains("## Pending"));
        assert!(content.contains("missing edge case"));

        mark_processed(&plan, "missing edge case").unwrap();
        let content = std::fs::read_to_string(feedback_path(&plan)).unwrap();
        assert!(content.contains("## Processed"));
    }

    #[test]
    fn mark_processed_errors_when_entry_absent() {
        let dir = tempfile::tempdir().unwrap();
        let plan = flat_plan(dir.path(), "widget");
        append_feedback(&plan, "verification", "something").unwrap();

        let err = mark_processed(&plan, "nonexistent entry").unwrap_err();
        assert!(matches!(err, ProgressError::EntryNotFound(_)));
    }

    #[test]
    fn writes_are_atomic_via_temp_rename() {
        let dir = tempfile::tempdir().unwrap();
        let plan = flat_plan(dir.path(), "widget");
        append_progress(&plan, 1, "body").unwrap();
        let tmp = progress_path(&plan).with_extension("tmp");
        assert!(!tmp.exists());
        let _ = PathBuf::from(&tmp);
    }
}
