//! Drives one or more plans from the queue to completion (§4.K).
//!
//! Grounded in `orchestrator/mod.rs`'s `run_once`/`run` split (pop next
//! unit of work, process it end to end, loop with a poll sleep when
//! idle) and its typed-observer-struct-of-optional-callbacks pattern,
//! generalised from a single DB-backed job table to the three-directory
//! plan queue plus per-plan worktree isolation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CompletionMode, Config};
use crate::iteration::{IterationLoop, LoopOutcome, PromptBuilder};
use crate::markers::Blocker;
use crate::plan::{Plan, Queue, QueueError};
use crate::vcs::{Vcs, VcsError};
use crate::worktree::{VcsFactory, WorktreeError, WorktreeManager};

/// Opens a pull request for a pushed branch (§6.3 "pr" mode). No
/// teacher precedent shells out to a review tool; the production
/// implementation below wraps the `gh` CLI the way `GitVcs` wraps `git`.
#[async_trait::async_trait]
pub trait PullRequestOpener: Send + Sync {
    async fn open(&self, branch: &str, base: &str, title: &str) -> Result<String, PrError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PrError {
    #[error("failed to spawn pull request tool: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("pull request tool exited with status {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },
}

/// `gh pr create --head <branch> --base <base> --title <title> --fill`,
/// run from the main repository root.
pub struct GhPullRequestOpener {
    repo_root: std::path::PathBuf,
}

impl GhPullRequestOpener {
    pub fn new(repo_root: impl Into<std::path::PathBuf>) -> Self {
        Self { repo_root: repo_root.into() }
    }
}

#[async_trait::async_trait]
impl PullRequestOpener for GhPullRequestOpener {
    async fn open(&self, branch: &str, base: &str, title: &str) -> Result<String, PrError> {
        let output = tokio::process::Command::new("gh")
            .args(["pr", "create", "--head", branch, "--base", base, "--title", title, "--fill"])
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(PrError::Spawn)?;

        if !output.status.success() {
            return Err(PrError::CommandFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Vcs(#[from] VcsError),
    #[error("pull request creation failed: {0}")]
    PullRequest(#[from] PrError),
    #[error("iteration loop failed: {0}")]
    Iteration(String),
}

/// Outcome of a single [`Worker::run_once`] call.
#[derive(Debug)]
pub enum RunOnceOutcome {
    QueueEmpty,
    Completed { plan: Plan },
    NeedsIntervention { plan: Plan, reason: String },
}

/// Optional synchronous callbacks fired at well-defined points (§4.K).
/// Never invoked re-entrantly.
#[derive(Default)]
pub struct WorkerObservers {
    pub on_plan_start: Option<Box<dyn Fn(&Plan) + Send + Sync>>,
    pub on_plan_complete: Option<Box<dyn Fn(&Plan) + Send + Sync>>,
    pub on_plan_error: Option<Box<dyn Fn(&Plan, &str) + Send + Sync>>,
    pub on_blocker: Option<Box<dyn Fn(&Plan, &Blocker) + Send + Sync>>,
    pub on_iteration: Option<Box<dyn Fn(&Plan, u32) + Send + Sync>>,
}

/// Finalisation mode override for a single `Run`/`RunOnce` invocation,
/// taking priority over `cfg.completion.mode` when set.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub once: bool,
    pub completion_mode: Option<CompletionMode>,
    pub max_plans: Option<u32>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self { once: false, completion_mode: None, max_plans: None }
    }
}

pub struct Worker {
    queue: Queue,
    worktree: WorktreeManager,
    vcs_factory: Arc<dyn VcsFactory>,
    main_vcs: Arc<dyn Vcs>,
    prompt_builder: Arc<dyn PromptBuilder>,
    runner: Arc<dyn crate::runner::Runner>,
    pr_opener: Arc<dyn PullRequestOpener>,
    config: Config,
    template: String,
    base_branch: String,
    main_root: std::path::PathBuf,
}

impl Worker {
    pub fn new(
        queue: Queue,
        worktree: WorktreeManager,
        vcs_factory: Arc<dyn VcsFactory>,
        main_vcs: Arc<dyn Vcs>,
        runner: Arc<dyn crate::runner::Runner>,
        prompt_builder: Arc<dyn PromptBuilder>,
        pr_opener: Arc<dyn PullRequestOpener>,
        config: Config,
        template: String,
        base_branch: String,
        main_root: std::path::PathBuf,
    ) -> Self {
        Self { queue, worktree, vcs_factory, main_vcs, prompt_builder, runner, pr_opener, config, template, base_branch, main_root }
    }

    /// Pick the first pending plan and drive it to a terminal outcome.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
        observers: &WorkerObservers,
        opts: &WorkerOptions,
    ) -> Result<RunOnceOutcome, WorkerError> {
        let pending = self.queue.pending()?;
        let Some(plan) = pending.into_iter().next() else {
            return Ok(RunOnceOutcome::QueueEmpty);
        };

        let plan = self.queue.activate(&plan)?;
        if let Some(cb) = &observers.on_plan_start {
            cb(&plan);
        }

        match self.process_plan(cancel, &plan, observers, opts).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(plan = %plan.name, error = %e, "plan processing failed");
                if let Some(cb) = &observers.on_plan_error {
                    cb(&plan, &e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn process_plan(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        observers: &WorkerObservers,
        opts: &WorkerOptions,
    ) -> Result<RunOnceOutcome, WorkerError> {
        let handle = match self.worktree.create(plan).await {
            Ok(handle) => handle,
            Err(WorktreeError::Vcs(VcsError::BranchAlreadyCheckedOut(branch))) => {
                warn!(%branch, "branch already checked out elsewhere, reusing existing worktree");
                match self.worktree.get(plan).await? {
                    Some(handle) => handle,
                    None => return Err(WorktreeError::Vcs(VcsError::BranchAlreadyCheckedOut(branch)).into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.worktree
            .sync_to_worktree(&self.main_root, &handle.path, plan, &self.config.worktree.copy_env_files)?;

        if let Err(e) = self
            .worktree
            .run_init_hooks(&self.main_root, &handle.path, &self.config.worktree.init_commands)
            .await
        {
            warn!(plan = %plan.name, error = %e, "init hook failed (non-fatal)");
        }

        let worktree_vcs = self.vcs_factory.at(&handle.path);
        let iteration_loop = IterationLoop::new(self.runner.clone(), worktree_vcs.clone(), self.prompt_builder.clone());
        let context_path = handle.path.join(".ralph").join("context.json");

        let on_blocker = observers.on_blocker.as_ref().map(|cb| {
            let plan = plan.clone();
            move |b: &Blocker| cb(&plan, b)
        });
        let on_iteration = observers.on_iteration.as_ref().map(|cb| {
            let plan = plan.clone();
            move |n: u32| cb(&plan, n)
        });
        let on_blocker_ref = on_blocker.as_ref().map(|f| f as &(dyn Fn(&Blocker) + Send + Sync));
        let on_iteration_ref = on_iteration.as_ref().map(|f| f as &(dyn Fn(u32) + Send + Sync));

        let (outcome, plan) = iteration_loop
            .run(
                cancel,
                &self.config,
                plan.clone(),
                &handle.path,
                &self.template,
                &self.base_branch,
                &context_path,
                on_blocker_ref,
                on_iteration_ref,
            )
            .await
            .map_err(|e| WorkerError::Iteration(format!("{e:#}")))?;

        self.worktree.sync_from_worktree(&self.main_root, &handle.path, &plan)?;

        let mode = self.completion_mode(opts);

        match outcome {
            LoopOutcome::Completed => {
                self.finalise(&plan, &handle.path, worktree_vcs.as_ref(), mode).await?;
                let completed = self.queue.complete(&plan)?;
                self.worktree.remove(&plan, mode == CompletionMode::Merge).await?;
                if let Some(cb) = &observers.on_plan_complete {
                    cb(&completed);
                }
                Ok(RunOnceOutcome::Completed { plan: completed })
            }
            LoopOutcome::Cancelled => {
                info!(plan = %plan.name, "cancelled, leaving plan in current/ for resumption");
                Ok(RunOnceOutcome::NeedsIntervention { plan, reason: "cancelled".to_string() })
            }
            LoopOutcome::MaxIterationsExceeded { iterations } => {
                let reason = format!("max iterations ({iterations}) exceeded without verified completion");
                Ok(RunOnceOutcome::NeedsIntervention { plan, reason })
            }
            LoopOutcome::FinalBlocker { blocker, iterations } => {
                let reason = format!("blocked after {iterations} iterations: {}", blocker.description);
                Ok(RunOnceOutcome::NeedsIntervention { plan, reason })
            }
        }
    }

    /// `opts.completion_mode` overrides `cfg.completion.mode` when set.
    fn completion_mode(&self, opts: &WorkerOptions) -> CompletionMode {
        opts.completion_mode.unwrap_or(self.config.completion.mode)
    }

    async fn finalise(&self, plan: &Plan, worktree_path: &Path, worktree_vcs: &dyn Vcs, mode: CompletionMode) -> Result<(), WorkerError> {
        match mode {
            CompletionMode::Pr => {
                worktree_vcs.push(&plan.branch).await?;
                let title = format!("ralph: {}", plan.name);
                match self.pr_opener.open(&plan.branch, &self.base_branch, &title).await {
                    Ok(url) => info!(plan = %plan.name, pr_url = %url, "opened pull request"),
                    Err(e) => warn!(plan = %plan.name, error = %e, "pull request creation failed (branch retained)"),
                }
                Ok(())
            }
            CompletionMode::Merge => {
                self.main_vcs.checkout(&self.base_branch).await?;
                self.main_vcs.merge(&plan.branch, true).await?;
                self.main_vcs.push(&self.base_branch).await?;
                debug!(plan = %plan.name, worktree = %worktree_path.display(), "merged feature branch into base");
                Ok(())
            }
        }
    }

    /// Loop [`Self::run_once`], sleeping `poll_interval` on `QueueEmpty`.
    /// Cancellation-responsive; stops after `opts.max_plans` completions
    /// when set, or after the first call when `opts.once`.
    pub async fn run(&self, cancel: &CancellationToken, observers: &WorkerObservers, opts: &WorkerOptions) -> Result<(), WorkerError> {
        let mut completed = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.run_once(cancel, observers, opts).await? {
                RunOnceOutcome::QueueEmpty => {
                    if opts.once {
                        return Ok(());
                    }
                    if cancel_sleep(cancel, self.config.poll_interval).await {
                        return Ok(());
                    }
                }
                RunOnceOutcome::Completed { .. } => {
                    completed += 1;
                    if opts.once {
                        return Ok(());
                    }
                    if let Some(max) = opts.max_plans {
                        if completed >= max {
                            return Ok(());
                        }
                    }
                }
                RunOnceOutcome::NeedsIntervention { .. } => {
                    if opts.once {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn cancel_sleep(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
