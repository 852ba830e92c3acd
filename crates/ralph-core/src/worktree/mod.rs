//! Per-plan worktree lifecycle: creation, lookup, removal, orphan
//! cleanup, file synchronisation, and init hooks (§4.I).
//!
//! This supersedes the teacher's `isolation/worktree.rs`, which shelled
//! out to `git` directly from inside the manager. Git invocation now
//! lives entirely behind the [`crate::vcs::Vcs`] trait; this module
//! keeps the teacher's idempotent-create/fallback-remove/prune-orphans
//! shape and its `git_lock`-free async style, but is rebuilt around
//! that injected abstraction plus the file-sync and init-hook behaviour
//! the teacher's isolation layer never needed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;

use crate::plan::{Plan, Queue, QueueError};
use crate::vcs::{Vcs, VcsError};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("worktree already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A live worktree: its filesystem path and checked-out branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
}

/// Outcome of removing or skipping one orphaned worktree during
/// [`WorktreeManager::cleanup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupEntry {
    pub path: PathBuf,
    pub plan_name: String,
    pub removed: bool,
    pub skip_reason: Option<String>,
}

/// Produces a [`Vcs`] bound to an arbitrary path, used by
/// [`WorktreeManager::cleanup`] to inspect each orphan's own working
/// tree state without assuming anything about the main repo's `Vcs`
/// implementation.
pub trait VcsFactory: Send + Sync {
    fn at(&self, path: &Path) -> Arc<dyn Vcs>;
}

/// Which of the three init-hook mechanisms ran (§4.I).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitMethod {
    Hook,
    InitCommands,
    AutoDetect(String),
    None,
}

#[derive(Debug, Clone)]
pub struct InitHookOutcome {
    pub method: InitMethod,
    pub output: String,
}

#[derive(Debug, Error)]
pub enum InitHookError {
    #[error("installer command not found: {0}")]
    CommandNotFound(String),

    #[error("init command failed: {0}")]
    Failed(String),

    #[error("failed to run init hook: {0}")]
    Spawn(#[from] std::io::Error),
}

const LOCKFILE_INSTALLERS: &[(&str, &[&str])] = &[
    ("pnpm-lock.yaml", &["pnpm", "install", "--frozen-lockfile"]),
    ("bun.lockb", &["bun", "install", "--frozen-lockfile"]),
    ("yarn.lock", &["yarn", "install", "--frozen-lockfile"]),
    ("package-lock.json", &["npm", "ci"]),
    ("composer.lock", &["composer", "install"]),
    ("poetry.lock", &["poetry", "install"]),
    ("requirements.txt", &["pip", "install", "-r", "requirements.txt"]),
    ("Gemfile.lock", &["bundle", "install"]),
    ("go.sum", &["go", "mod", "download"]),
    ("Cargo.lock", &["cargo", "fetch"]),
];

/// Owns `<repo>/.ralph/worktrees/`.
pub struct WorktreeManager {
    vcs: Arc<dyn Vcs>,
    vcs_factory: Arc<dyn VcsFactory>,
    base: PathBuf,
}

impl WorktreeManager {
    pub fn new(vcs: Arc<dyn Vcs>, vcs_factory: Arc<dyn VcsFactory>, base_override: Option<PathBuf>) -> Self {
        let base = base_override.unwrap_or_else(|| vcs.repo_root().join(".ralph").join("worktrees"));
        Self { vcs, vcs_factory, base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `Path(plan) = base/<branch-without-"feat/"-prefix>`.
    pub fn path_for(&self, plan: &Plan) -> PathBuf {
        let suffix = plan.branch.strip_prefix("feat/").unwrap_or(&plan.branch);
        self.base.join(suffix)
    }

    pub fn exists(&self, plan: &Plan) -> bool {
        self.path_for(plan).is_dir()
    }

    /// Refuse if [`Self::exists`]; else `mkdir -p base` and delegate to
    /// the VCS. Propagates `branch_already_checked_out`.
    pub async fn create(&self, plan: &Plan) -> Result<WorktreeHandle, WorktreeError> {
        if self.exists(plan) {
            return Err(WorktreeError::AlreadyExists(self.path_for(plan)));
        }

        std::fs::create_dir_all(&self.base).map_err(|e| WorktreeError::Io { path: self.base.clone(), source: e })?;

        let path = self.path_for(plan);
        self.vcs.create_worktree(&path, &plan.branch).await?;

        Ok(WorktreeHandle { path, branch: plan.branch.clone() })
    }

    /// Resolve via `ListWorktrees`, matching by resolved path. `None` if
    /// the directory exists but no matching registration was found --
    /// a salvageable leftover.
    pub async fn get(&self, plan: &Plan) -> Result<Option<WorktreeHandle>, WorktreeError> {
        let target_path = self.path_for(plan);
        let target = target_path.canonicalize().unwrap_or(target_path);

        for entry in self.vcs.list_worktrees().await? {
            let canon = entry.path.canonicalize().unwrap_or_else(|_| entry.path.clone());
            if canon == target {
                return Ok(Some(WorktreeHandle { path: entry.path, branch: entry.branch.unwrap_or_default() }));
            }
        }
        Ok(None)
    }

    /// Remove via VCS; fall back to recursive directory removal on
    /// `worktree_not_found`; optionally delete the branch, ignoring
    /// `branch_not_found`.
    pub async fn remove(&self, plan: &Plan, delete_branch: bool) -> Result<(), WorktreeError> {
        let path = self.path_for(plan);

        match self.vcs.remove_worktree(&path).await {
            Ok(()) => {}
            Err(VcsError::WorktreeNotFound(_)) => {
                if path.exists() {
                    std::fs::remove_dir_all(&path).map_err(|e| WorktreeError::Io { path: path.clone(), source: e })?;
                }
            }
            Err(e) => return Err(e.into()),
        }

        if delete_branch {
            match self.vcs.delete_branch(&plan.branch, true).await {
                Ok(()) => {}
                Err(VcsError::BranchNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            match self.vcs.delete_remote_branch(&plan.branch).await {
                Ok(()) => {}
                Err(VcsError::BranchNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// List subdirectories of `base`; any whose directory name matches
    /// no active plan's branch (minus `feat/`) is orphaned. Orphans
    /// with uncommitted changes are skipped (reported, not touched).
    pub async fn cleanup(&self, queue: &Queue) -> Result<Vec<CleanupEntry>, WorktreeError> {
        let mut active_suffixes = std::collections::HashSet::new();
        for plan in queue.pending()? {
            active_suffixes.insert(plan.branch.trim_start_matches("feat/").to_string());
        }
        if let Some(plan) = queue.current()? {
            active_suffixes.insert(plan.branch.trim_start_matches("feat/").to_string());
        }

        let mut results = Vec::new();
        if !self.base.exists() {
            return Ok(results);
        }

        let entries = std::fs::read_dir(&self.base).map_err(|e| WorktreeError::Io { path: self.base.clone(), source: e })?;
        for entry in entries {
            let entry = entry.map_err(|e| WorktreeError::Io { path: self.base.clone(), source: e })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if active_suffixes.contains(name) {
                continue;
            }

            results.push(self.cleanup_one(name, &path).await?);
        }

        Ok(results)
    }

    async fn cleanup_one(&self, name: &str, path: &Path) -> Result<CleanupEntry, WorktreeError> {
        let orphan_vcs = self.vcs_factory.at(path);
        match orphan_vcs.is_clean().await {
            Ok(true) => {}
            Ok(false) => {
                return Ok(CleanupEntry {
                    path: path.to_path_buf(),
                    plan_name: name.to_string(),
                    removed: false,
                    skip_reason: Some("uncommitted changes".to_string()),
                });
            }
            Err(_) => {
                // Status couldn't be read (e.g. directory is not a registered
                // worktree). Fall through and let remove_worktree decide.
            }
        }

        match self.vcs.remove_worktree(path).await {
            Ok(()) => Ok(CleanupEntry { path: path.to_path_buf(), plan_name: name.to_string(), removed: true, skip_reason: None }),
            Err(VcsError::WorktreeNotFound(_)) => {
                std::fs::remove_dir_all(path).map_err(|e| WorktreeError::Io { path: path.to_path_buf(), source: e })?;
                Ok(CleanupEntry { path: path.to_path_buf(), plan_name: name.to_string(), removed: true, skip_reason: None })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copy plan.md, progress.md, feedback.md (and any
    /// `cfg.worktree.copy_env_files`) from the main checkout into the
    /// worktree, preserving the relative path under `main_root`.
    /// Missing sources are silently skipped.
    pub fn sync_to_worktree(&self, main_root: &Path, worktree: &Path, plan: &Plan, copy_env_files: &[String]) -> Result<(), WorktreeError> {
        let progress = crate::progress::progress_path(plan);
        let feedback = crate::progress::feedback_path(plan);

        for src in [plan.path.clone(), progress, feedback] {
            copy_relative(main_root, worktree, &src)?;
        }
        for name in copy_env_files {
            copy_relative(main_root, worktree, &main_root.join(name))?;
        }
        Ok(())
    }

    /// Copy plan.md and progress.md back into the main checkout.
    /// Feedback is never synced back.
    pub fn sync_from_worktree(&self, main_root: &Path, worktree: &Path, plan: &Plan) -> Result<(), WorktreeError> {
        let progress = crate::progress::progress_path(plan);
        for src in [plan.path.clone(), progress] {
            copy_relative_reverse(main_root, worktree, &src)?;
        }
        Ok(())
    }

    /// Run the init-hook chain after [`Self::create`] (§4.I).
    pub async fn run_init_hooks(&self, main_root: &Path, worktree: &Path, init_commands: &str) -> Result<InitHookOutcome, InitHookError> {
        let hook_path = main_root.join(".ralph").join("hooks").join("worktree-init");
        if is_executable(&hook_path) {
            let output = Command::new(&hook_path)
                .current_dir(worktree)
                .env("MAIN_WORKTREE", main_root)
                .output()
                .await?;
            return finish(InitMethod::Hook, output);
        }

        if !init_commands.trim().is_empty() {
            let output = Command::new("sh")
                .arg("-c")
                .arg(init_commands)
                .current_dir(worktree)
                .env("MAIN_WORKTREE", main_root)
                .output()
                .await?;
            return finish(InitMethod::InitCommands, output);
        }

        for (lockfile, command) in LOCKFILE_INSTALLERS {
            if worktree.join(lockfile).exists() {
                let (bin, args) = command.split_first().expect("non-empty installer command");
                let output = Command::new(bin).args(args).current_dir(worktree).output().await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        InitHookError::CommandNotFound(bin.to_string())
                    } else {
                        InitHookError::Spawn(e)
                    }
                })?;
                return finish(InitMethod::AutoDetect(lockfile.to_string()), output);
            }
        }

        Ok(InitHookOutcome { method: InitMethod::None, output: String::new() })
    }
}

fn finish(method: InitMethod, output: std::process::Output) -> Result<InitHookOutcome, InitHookError> {
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !output.status.success() {
        return Err(InitHookError::Failed(combined));
    }
    Ok(InitHookOutcome { method, output: combined })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn copy_relative(main_root: &Path, worktree: &Path, src: &Path) -> Result<(), WorktreeError> {
    if !src.exists() {
        return Ok(());
    }
    let rel = src.strip_prefix(main_root).unwrap_or(src);
    let dest = worktree.join(rel);
    copy_preserving_permissions(src, &dest)
}

fn copy_relative_reverse(main_root: &Path, worktree: &Path, main_src: &Path) -> Result<(), WorktreeError> {
    let rel = main_src.strip_prefix(main_root).unwrap_or(main_src);
    let worktree_src = worktree.join(rel);
    if !worktree_src.exists() {
        return Ok(());
    }
    copy_preserving_permissions(&worktree_src, main_src)
}

fn copy_preserving_permissions(src: &Path, dest: &Path) -> Result<(), WorktreeError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| WorktreeError::Io { path: parent.to_path_buf(), source: e })?;
    }
    std::fs::copy(src, dest).map_err(|e| WorktreeError::Io { path: dest.to_path_buf(), source: e })?;
    if let Ok(meta) = std::fs::metadata(src) {
        let _ = std::fs::set_permissions(dest, meta.permissions());
    }
    Ok(())
}
