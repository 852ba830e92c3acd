//! Abstract version-control interface and its production `git` backend
//! (§4.H, §6.2).
//!
//! Grounded in `worktree/mod.rs`'s existing porcelain-output parsing and
//! subprocess-wrapping conventions, lifted out of the worktree manager
//! and made `async` (via `tokio::process::Command`) so it can sit behind
//! the same `tokio::select!`/cancellation idioms used by the Runner.
//! The worktree manager now depends on this trait instead of shelling
//! out to `git` directly.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

/// Parsed `git status --porcelain=v1 -b` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsStatus {
    pub branch: String,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
    pub is_clean: bool,
}

/// A single entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub commit: String,
}

/// Errors a [`Vcs`] implementation may return. The three typed variants
/// named in §4.H/§6.2 must stay distinguishable from a generic command
/// failure so callers can pattern-match on them.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("branch already checked out elsewhere: {0}")]
    BranchAlreadyCheckedOut(String),

    #[error("worktree not found: {0}")]
    WorktreeNotFound(PathBuf),

    #[error("merge conflict: {details}")]
    MergeConflict { details: String },

    #[error("failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },
}

/// Abstract interface to the version-control tool (§4.H). Implementations
/// shell out to whatever VCS binary is configured; the engine only ever
/// talks to this trait.
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn status(&self) -> Result<VcsStatus, VcsError>;
    async fn add(&self, files: &[String]) -> Result<(), VcsError>;
    async fn commit(&self, message: &str, files: &[String]) -> Result<(), VcsError>;
    async fn current_branch(&self) -> Result<String, VcsError>;
    async fn branch_exists(&self, name: &str) -> Result<bool, VcsError>;
    async fn create_branch(&self, name: &str) -> Result<(), VcsError>;
    async fn delete_branch(&self, name: &str, force: bool) -> Result<(), VcsError>;
    async fn checkout(&self, name: &str) -> Result<(), VcsError>;
    async fn merge(&self, name: &str, no_ff: bool) -> Result<(), VcsError>;
    async fn push(&self, branch: &str) -> Result<(), VcsError>;
    async fn delete_remote_branch(&self, branch: &str) -> Result<(), VcsError>;
    async fn create_worktree(&self, path: &Path, branch: &str) -> Result<(), VcsError>;
    async fn remove_worktree(&self, path: &Path) -> Result<(), VcsError>;
    async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, VcsError>;
    fn repo_root(&self) -> &Path;
    async fn is_clean(&self) -> Result<bool, VcsError> {
        Ok(self.status().await?.is_clean)
    }
}

/// `git`-backed production [`Vcs`] implementation, bound to a single
/// repository checkout.
#[derive(Debug, Clone)]
pub struct GitVcs {
    repo_path: PathBuf,
}

impl GitVcs {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self { repo_path: repo_path.into() }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, VcsError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| VcsError::Spawn { command: format!("git {}", args.join(" ")), source: e })
    }

    async fn run_ok(&self, args: &[&str]) -> Result<(), VcsError> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(VcsError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn status(&self) -> Result<VcsStatus, VcsError> {
        let output = self.run(&["status", "--porcelain=v1", "-b"]).await?;
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: "git status".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_status(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn add(&self, files: &[String]) -> Result<(), VcsError> {
        let mut args = vec!["add"];
        if files.is_empty() {
            args.push("-A");
        } else {
            args.extend(files.iter().map(String::as_str));
        }
        self.run_ok(&args).await
    }

    async fn commit(&self, message: &str, files: &[String]) -> Result<(), VcsError> {
        if !files.is_empty() {
            self.add(files).await?;
        }
        self.run_ok(&["commit", "-m", message]).await
    }

    async fn current_branch(&self) -> Result<String, VcsError> {
        let output = self.run(&["branch", "--show-current"]).await?;
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: "git branch --show-current".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, VcsError> {
        let output = self
            .run(&["rev-parse", "--verify", &format!("refs/heads/{name}")])
            .await?;
        Ok(output.status.success())
    }

    async fn create_branch(&self, name: &str) -> Result<(), VcsError> {
        self.run_ok(&["branch", name]).await
    }

    async fn delete_branch(&self, name: &str, force: bool) -> Result<(), VcsError> {
        let flag = if force { "-D" } else { "-d" };
        let output = self.run(&["branch", flag, name]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("not found") {
            return Err(VcsError::BranchNotFound(name.to_string()));
        }
        Err(VcsError::CommandFailed {
            command: format!("git branch {flag} {name}"),
            code: output.status.code(),
            stderr,
        })
    }

    async fn checkout(&self, name: &str) -> Result<(), VcsError> {
        let output = self.run(&["checkout", name]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("did not match any") || stderr.contains("pathspec") {
            return Err(VcsError::BranchNotFound(name.to_string()));
        }
        Err(VcsError::CommandFailed {
            command: "git checkout".to_string(),
            code: output.status.code(),
            stderr,
        })
    }

    async fn merge(&self, name: &str, no_ff: bool) -> Result<(), VcsError> {
        let mut args = vec!["merge"];
        if no_ff {
            args.push("--no-ff");
        }
        args.push(name);
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stdout.contains("CONFLICT") || stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = self.run(&["merge", "--abort"]).await;
            return Err(VcsError::MergeConflict { details: format!("{stdout}\n{stderr}").trim().to_string() });
        }
        Err(VcsError::CommandFailed {
            command: "git merge".to_string(),
            code: output.status.code(),
            stderr,
        })
    }

    async fn push(&self, branch: &str) -> Result<(), VcsError> {
        self.run_ok(&["push", "-u", "origin", branch]).await
    }

    async fn delete_remote_branch(&self, branch: &str) -> Result<(), VcsError> {
        let output = self.run(&["push", "origin", "--delete", branch]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("remote ref does not exist") {
            return Err(VcsError::BranchNotFound(branch.to_string()));
        }
        Err(VcsError::CommandFailed {
            command: "git push origin --delete".to_string(),
            code: output.status.code(),
            stderr,
        })
    }

    async fn create_worktree(&self, path: &Path, branch: &str) -> Result<(), VcsError> {
        let exists = self.branch_exists(branch).await?;
        let path_str = path.to_string_lossy().to_string();
        let output = if exists {
            self.run(&["worktree", "add", &path_str, branch]).await?
        } else {
            self.run(&["worktree", "add", "-b", branch, &path_str]).await?
        };
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("is already checked out") || stderr.contains("already used by worktree") {
            return Err(VcsError::BranchAlreadyCheckedOut(branch.to_string()));
        }
        Err(VcsError::CommandFailed {
            command: "git worktree add".to_string(),
            code: output.status.code(),
            stderr,
        })
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), VcsError> {
        let path_str = path.to_string_lossy().to_string();
        let output = self.run(&["worktree", "remove", "--force", &path_str]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("is not a working tree") || stderr.contains("not a working tree") {
            return Err(VcsError::WorktreeNotFound(path.to_path_buf()));
        }
        Err(VcsError::CommandFailed {
            command: "git worktree remove".to_string(),
            code: output.status.code(),
            stderr,
        })
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, VcsError> {
        let output = self.run(&["worktree", "list", "--porcelain"]).await?;
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: "git worktree list".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_worktree_list(&String::from_utf8_lossy(&output.stdout)))
    }

    fn repo_root(&self) -> &Path {
        &self.repo_path
    }
}

/// Parse `git status --porcelain=v1 -b` output. Tolerant of an absent
/// branch header line and of trailing whitespace (§6.2).
fn parse_status(output: &str) -> VcsStatus {
    let mut status = VcsStatus { is_clean: true, ..Default::default() };

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("## ") {
            status.branch = rest.split("...").next().unwrap_or(rest).trim().to_string();
            continue;
        }
        if line.len() < 3 {
            continue;
        }
        status.is_clean = false;
        let (code, path) = line.split_at(2);
        let path = path.trim_start().to_string();
        match code {
            "??" => status.untracked.push(path),
            _ => {
                let (index, worktree) = (
                    code.chars().next().unwrap_or(' '),
                    code.chars().nth(1).unwrap_or(' '),
                );
                if index != ' ' && index != '?' {
                    status.staged.push(path.clone());
                }
                if worktree != ' ' && worktree != '?' {
                    status.unstaged.push(path);
                }
            }
        }
    }

    status
}

/// Parse `git worktree list --porcelain` output. Blocks are separated by
/// a blank line; the main worktree may carry `bare` instead of `branch`,
/// detached worktrees carry `detached`.
fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut commit: Option<String> = None;
    let mut branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>, commit: &mut Option<String>, branch: &mut Option<String>, entries: &mut Vec<WorktreeEntry>| {
        if let (Some(p), Some(c)) = (path.take(), commit.take()) {
            entries.push(WorktreeEntry { path: p, branch: branch.take(), commit: c });
        } else {
            *branch = None;
        }
    };

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            flush(&mut path, &mut commit, &mut branch, &mut entries);
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            commit = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        }
    }
    flush(&mut path, &mut commit, &mut branch, &mut entries);

    entries
}

/// Production [`crate::worktree::VcsFactory`]: binds a fresh [`GitVcs`]
/// to whatever path the caller asks for. Used by the Worktree Manager's
/// orphan-cleanup pass (§4.I `Cleanup`), which needs a `Vcs` scoped to
/// each candidate orphan directory rather than the main repo root.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitVcsFactory;

impl crate::worktree::VcsFactory for GitVcsFactory {
    fn at(&self, path: &Path) -> std::sync::Arc<dyn Vcs> {
        std::sync::Arc::new(GitVcs::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_status_with_branch() {
        let status = parse_status("## main...origin/main\n");
        assert_eq!(status.branch, "main");
        assert!(status.is_clean);
    }

    #[test]
    fn parses_staged_unstaged_and_untracked() {
        let output = "## feat/thing\nM  staged.txt\n M unstaged.txt\n?? new.txt\n";
        let status = parse_status(output);
        assert_eq!(status.branch, "feat/thing");
        assert!(!status.is_clean);
        assert_eq!(status.staged, vec!["staged.txt"]);
        assert_eq!(status.unstaged, vec!["unstaged.txt"]);
        assert_eq!(status.untracked, vec!["new.txt"]);
    }

    #[test]
    fn tolerates_trailing_whitespace_and_missing_branch_line() {
        let output = "M  file.txt   \n";
        let status = parse_status(output);
        assert_eq!(status.branch, "");
        assert!(!status.is_clean);
    }

    #[test]
    fn parses_worktree_list_with_detached_entry() {
        let input = "\
worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\nworktree /repo/.ralph/worktrees/x\nHEAD def456\ndetached\n";
        let entries = parse_worktree_list(input);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch, None);
    }

    #[test]
    fn parses_worktree_list_without_trailing_blank_line() {
        let input = "worktree /repo\nHEAD abc123\nbranch refs/heads/main";
        let entries = parse_worktree_list(input);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].commit, "abc123");
    }

    #[test]
    fn parses_empty_worktree_list() {
        assert!(parse_worktree_list("").is_empty());
    }
}
