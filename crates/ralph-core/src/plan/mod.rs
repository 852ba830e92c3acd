//! Plan markdown parsing, checkbox mutation, and the task tree (§4.F).
//!
//! Grounded in `plan/parser.rs`'s error-enum-per-failure style
//! (`thiserror`, one variant per distinguishable parse failure) and
//! inline-literal test fixtures, generalised from TOML to the
//! markdown+checkbox format this engine actually reads.

mod queue;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

pub use queue::{Queue, QueueError, QueueStatus};

/// Errors encountered while reading or mutating a plan file.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("failed to read plan file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plan content is not valid UTF-8: {path}")]
    InvalidUtf8 { path: PathBuf },

    #[error("line {line} has no checkbox to update")]
    NoCheckboxOnLine { line: usize },
}

/// A single checkbox item, possibly with nested subtasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// 1-indexed line number within the plan's raw content.
    pub line_number: usize,
    pub text: String,
    pub complete: bool,
    pub requires: Vec<String>,
    pub children: Vec<Task>,
}

/// A parsed plan, either a legacy flat `<name>.md` file or a
/// `<name>/plan.md` bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub name: String,
    pub branch: String,
    pub status: String,
    pub content: String,
    pub tasks: Vec<Task>,
    /// Path to the markdown file itself (`plan.md` for a bundle, or the
    /// flat `<name>.md`).
    pub path: PathBuf,
    /// Set when this plan lives in `<name>/plan.md` bundle form.
    pub bundle_dir: Option<PathBuf>,
}

impl Plan {
    /// Load a plan from either a bundle directory or a flat markdown file.
    pub fn load(path: &Path) -> Result<Self, PlanParseError> {
        let (bundle_dir, md_path) = if path.is_dir() {
            (Some(path.to_path_buf()), path.join("plan.md"))
        } else {
            (None, path.to_path_buf())
        };

        let bytes = std::fs::read(&md_path).map_err(|e| PlanParseError::Io { path: md_path.clone(), source: e })?;
        let content = String::from_utf8(bytes).map_err(|_| PlanParseError::InvalidUtf8 { path: md_path.clone() })?;

        Ok(Self::parse(&content, bundle_dir, md_path))
    }

    /// Parse already-read plan content. `bundle_dir` carries the bundle
    /// directory when present; `md_path` is the path to the markdown
    /// file itself (used for the flat-name fallback).
    pub fn parse(content: &str, bundle_dir: Option<PathBuf>, md_path: PathBuf) -> Self {
        let name = match &bundle_dir {
            Some(dir) => dir.file_name().and_then(|n| n.to_str()).unwrap_or("plan").to_string(),
            None => md_path.file_stem().and_then(|n| n.to_str()).unwrap_or("plan").to_string(),
        };
        let branch = format!("feat/{}", sanitize_branch_suffix(&name));
        let status = parse_status(content);
        let tasks = parse_tasks(content);

        Self {
            name,
            branch,
            status,
            content: content.to_string(),
            tasks,
            path: md_path,
            bundle_dir,
        }
    }

    /// Rewrite a single checkbox marker, preserving every other byte of
    /// `self.content`.
    pub fn with_checkbox(&self, line_number: usize, complete: bool) -> Result<String, PlanParseError> {
        rewrite_checkbox(&self.content, line_number, complete)
    }

    /// Flattened count of `(completed, total)` tasks across the whole tree.
    pub fn task_counts(&self) -> (usize, usize) {
        fn walk(tasks: &[Task], completed: &mut usize, total: &mut usize) {
            for t in tasks {
                *total += 1;
                if t.complete {
                    *completed += 1;
                }
                walk(&t.children, completed, total);
            }
        }
        let (mut completed, mut total) = (0, 0);
        walk(&self.tasks, &mut completed, &mut total);
        (completed, total)
    }
}

/// Sanitise a plan name into a branch-safe suffix: lowercase, strip
/// characters outside `[a-z0-9 _-]`, collapse whitespace runs to a
/// single `-`, collapse repeated `-`, trim leading/trailing `-`.
pub fn sanitize_branch_suffix(name: &str) -> String {
    let lower = name.to_lowercase();
    let filtered: String = lower
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-' { c } else { ' ' })
        .collect();

    let mut result = String::new();
    let mut last_was_dash = false;
    for c in filtered.chars() {
        if c.is_whitespace() {
            if !last_was_dash {
                result.push('-');
                last_was_dash = true;
            }
        } else if c == '-' {
            if !last_was_dash {
                result.push('-');
                last_was_dash = true;
            }
        } else {
            result.push(c);
            last_was_dash = false;
        }
    }

    result.trim_matches('-').to_string()
}

fn status_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*\*\*status:\*\*\s*(.+?)\s*$").expect("valid status regex"))
}

fn parse_status(content: &str) -> String {
    status_regex()
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "pending".to_string())
}

fn checkbox_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\s*)[-*] \[([ xX])\] (.+)$").expect("valid checkbox regex"))
}

fn requires_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)requires:\s*([a-z0-9_, .-]+)").expect("valid requires regex"))
}

/// Leading-indent width in spaces, treating each tab as 4 spaces.
fn indent_width(indent: &str) -> usize {
    indent.chars().map(|c| if c == '\t' { 4 } else { 1 }).sum()
}

fn parse_requires(text: &str) -> Vec<String> {
    requires_regex()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| {
            m.as_str()
                .split(',')
                .map(|s| s.trim().trim_end_matches('.').to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse all checkbox lines into a nested task tree. A task strictly
/// more indented than the preceding top-level task becomes its child
/// (recursively).
fn parse_tasks(content: &str) -> Vec<Task> {
    struct Flat {
        indent: usize,
        task: Task,
    }

    let mut flat = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let Some(caps) = checkbox_line_regex().captures(line) else { continue };
        let indent = indent_width(&caps[1]);
        let complete = matches!(&caps[2], "x" | "X");
        let text = caps[3].to_string();
        let requires = parse_requires(&text);
        flat.push(Flat {
            indent,
            task: Task { line_number: idx + 1, text, complete, requires, children: Vec::new() },
        });
    }

    build_tree(flat.into_iter().map(|f| (f.indent, f.task)).collect())
}

/// Fold a flat `(indent, task)` sequence into a nested tree: any run of
/// entries strictly more indented than the current top-level entry
/// becomes that entry's (recursively nested) children.
fn build_tree(items: Vec<(usize, Task)>) -> Vec<Task> {
    fn build(items: &[(usize, Task)], pos: &mut usize, min_indent: usize) -> Vec<Task> {
        let mut result = Vec::new();
        while *pos < items.len() && items[*pos].0 >= min_indent {
            let (indent, mut task) = items[*pos].clone();
            *pos += 1;
            task.children = build(items, pos, indent + 1);
            result.push(task);
        }
        result
    }

    let mut pos = 0;
    build(&items, &mut pos, 0)
}

/// Rewrite exactly the `[ ]`/`[x]` marker on `line_number` (1-indexed),
/// preserving every other byte of `content`.
fn rewrite_checkbox(content: &str, line_number: usize, complete: bool) -> Result<String, PlanParseError> {
    let mut out = String::with_capacity(content.len());
    let mut found = false;

    // Preserve the exact line-ending structure by splitting on '\n' and
    // re-joining, which keeps embedded '\r' (if any) attached to each line.
    let lines: Vec<&str> = content.split('\n').collect();
    for (idx, line) in lines.iter().enumerate() {
        if idx + 1 == line_number {
            match checkbox_line_regex().captures(line) {
                Some(caps) => {
                    let indent = &caps[1];
                    let rest = &caps[3];
                    let marker = if complete { 'x' } else { ' ' };
                    let bullet_start = line.trim_start().chars().next().unwrap_or('-');
                    out.push_str(indent);
                    out.push(bullet_start);
                    out.push_str(&format!(" [{marker}] {rest}"));
                    found = true;
                }
                None => return Err(PlanParseError::NoCheckboxOnLine { line: line_number }),
            }
        } else {
            out.push_str(line);
        }
        if idx + 1 != lines.len() {
            out.push('\n');
        }
    }

    if !found {
        return Err(PlanParseError::NoCheckboxOnLine { line: line_number });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_branch_suffix() {
        assert_eq!(sanitize_branch_suffix("Add Auth!!"), "add-auth");
        assert_eq!(sanitize_branch_suffix("  multi   space  "), "multi-space");
        assert_eq!(sanitize_branch_suffix("--leading-and-trailing--"), "leading-and-trailing");
        assert_eq!(sanitize_branch_suffix("snake_case_ok"), "snake_case_ok");
    }

    #[test]
    fn parses_status_case_insensitively() {
        assert_eq!(parse_status("**Status:** in-progress\n"), "in-progress");
        assert_eq!(parse_status("**STATUS:**   done\n"), "done");
        assert_eq!(parse_status("no status line here\n"), "pending");
    }

    #[test]
    fn parses_flat_task_list() {
        let content = "# Plan\n- [ ] first task\n- [x] second task\n";
        let tasks = parse_tasks(content);
        assert_eq!(tasks.len(), 2);
        assert!(!tasks[0].complete);
        assert!(tasks[1].complete);
        assert_eq!(tasks[0].line_number, 2);
    }

    #[test]
    fn nests_indented_subtasks() {
        let content = "- [ ] parent\n  - [ ] child one\n  - [x] child two\n- [ ] sibling\n";
        let tasks = parse_tasks(content);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].children.len(), 2);
        assert!(tasks[0].children[1].complete);
        assert!(tasks[1].children.is_empty());
    }

    #[test]
    fn tab_indent_counts_as_four_spaces() {
        let content = "- [ ] parent\n\t- [ ] child\n";
        let tasks = parse_tasks(content);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].children.len(), 1);
    }

    #[test]
    fn extracts_requires_clause() {
        let content = "- [ ] do thing (requires: setup, config)\n";
        let tasks = parse_tasks(content);
        assert_eq!(tasks[0].requires, vec!["setup", "config"]);
    }

    #[test]
    fn rewrite_checkbox_preserves_other_bytes() {
        let content = "- [ ] task one\r\nsecond line\n- [ ] task two\n";
        let rewritten = rewrite_checkbox(content, 1, true).unwrap();
        assert!(rewritten.starts_with("- [x] task one\r"));
        assert!(rewritten.contains("second line\n- [ ] task two"));
    }

    #[test]
    fn rewrite_checkbox_errors_without_checkbox_on_line() {
        let content = "just text\n- [ ] task\n";
        let err = rewrite_checkbox(content, 1, true).unwrap_err();
        assert!(matches!(err, PlanParseError::NoCheckboxOnLine { line: 1 }));
    }

    #[test]
    fn task_counts_include_nested_children() {
        let content = "- [x] parent\n  - [x] child one\n  - [ ] child two\n";
        let plan = Plan::parse(content, None, PathBuf::from("plan.md"));
        assert_eq!(plan.task_counts(), (2, 3));
    }

    #[test]
    fn load_derives_name_from_bundle_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("my-plan");
        std::fs::create_dir(&bundle).unwrap();
        std::fs::write(bundle.join("plan.md"), "**Status:** pending\n- [ ] a\n").unwrap();

        let plan = Plan::load(&bundle).unwrap();
        assert_eq!(plan.name, "my-plan");
        assert_eq!(plan.branch, "feat/my-plan");
        assert_eq!(plan.bundle_dir, Some(bundle));
    }

    #[test]
    fn load_derives_name_from_flat_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fix-bug.md");
        std::fs::write(&path, "- [ ] a\n").unwrap();

        let plan = Plan::load(&path).unwrap();
        assert_eq!(plan.name, "fix-bug");
        assert!(plan.bundle_dir.is_none());
    }
}
