//! The per-plan iteration loop: prompt, run, reload, commit, verify,
//! repeat (§4.J).
//!
//! Grounded in `lifecycle/mod.rs`'s `run_agent_lifecycle` shape (a
//! numbered sequence of fallible steps threaded through `anyhow::Context`,
//! with a `commit_agent_work`-style stage-all-then-commit-if-dirty helper
//! that treats commit failure as non-fatal) and its `LifecycleResult`
//! enum-of-terminal-outcomes pattern.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::markers::Blocker;
use crate::plan::Plan;
use crate::progress::{append_feedback, append_progress};
use crate::runner::{RunOptions, Runner};
use crate::vcs::Vcs;
use crate::verifier::Verifier;

/// `Build(template_name, overrides) -> text` (§6.4). The core ships only
/// the minimal `{{NAME}}`-substitution implementation below; loading
/// templates from a directory or per-project override files is a
/// front-end concern exercised only through this trait.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, template: &str, overrides: &HashMap<String, String>) -> String;
}

/// Substitutes `{{NAME}}` placeholders against `overrides`; names with no
/// matching override are left verbatim.
pub struct TemplateSubstitutionPromptBuilder;

impl PromptBuilder for TemplateSubstitutionPromptBuilder {
    fn build(&self, template: &str, overrides: &HashMap<String, String>) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            result.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            match after_open.find("}}") {
                Some(end) => {
                    let name = after_open[..end].trim();
                    match overrides.get(name) {
                        Some(value) => result.push_str(value),
                        None => {
                            result.push_str("{{");
                            result.push_str(name);
                            result.push_str("}}");
                        }
                    }
                    rest = &after_open[end + 2..];
                }
                None => {
                    result.push_str("{{");
                    rest = after_open;
                }
            }
        }
        result.push_str(rest);
        result
    }
}

/// Terminal outcome of [`IterationLoop::run`] (§4.J). A blocker never
/// terminates the loop on its own, even reported identically on
/// consecutive iterations (§4.J step 7; Testable Scenario S3) — the
/// `on_blocker` observer fires and the loop continues. `FinalBlocker`
/// is retained as a terminal-outcome variant for callers (e.g. the
/// Worker) that need one, but `IterationLoop::run` never constructs it.
#[derive(Debug, Clone)]
pub enum LoopOutcome {
    Completed,
    Cancelled,
    MaxIterationsExceeded { iterations: u32 },
    FinalBlocker { blocker: Blocker, iterations: u32 },
}

/// Per-plan execution counter, persisted atomically to
/// `<worktree>/.ralph/context.json`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ExecutionContext {
    pub iteration: u32,
}

impl ExecutionContext {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn persist(&self, path: &Path) {
        let Ok(json) = serde_json::to_string_pretty(self) else { return };
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let tmp = path.with_extension("tmp");
        if std::fs::write(&tmp, json).is_err() {
            return;
        }
        let _ = std::fs::rename(&tmp, path);
    }
}

pub struct IterationLoop {
    runner: Arc<dyn Runner>,
    vcs: Arc<dyn Vcs>,
    prompt_builder: Arc<dyn PromptBuilder>,
    verifier: Verifier,
}

impl IterationLoop {
    pub fn new(runner: Arc<dyn Runner>, vcs: Arc<dyn Vcs>, prompt_builder: Arc<dyn PromptBuilder>) -> Self {
        let verifier = Verifier::new(runner.clone());
        Self { runner, vcs, prompt_builder, verifier }
    }

    /// Drive `plan` to completion, cancellation, or exhaustion.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        cfg: &Config,
        mut plan: Plan,
        worktree_path: &Path,
        template: &str,
        base_branch: &str,
        context_path: &Path,
        on_blocker: Option<&(dyn Fn(&Blocker) + Send + Sync)>,
        on_iteration: Option<&(dyn Fn(u32) + Send + Sync)>,
    ) -> Result<(LoopOutcome, Plan)> {
        let mut context = ExecutionContext::load(context_path);

        loop {
            if cancel.is_cancelled() {
                return Ok((LoopOutcome::Cancelled, plan));
            }

            if context.iteration >= cfg.max_iterations {
                return Ok((LoopOutcome::MaxIterationsExceeded { iterations: context.iteration }, plan));
            }

            let iteration = context.iteration + 1;
            let prompt = self.build_prompt(template, &plan, iteration, cfg.max_iterations, base_branch);

            let opts = RunOptions { work_dir: Some(worktree_path.to_path_buf()), timeout: Some(cfg.iteration_timeout), ..Default::default() };
            let run_result = self.runner.run(cancel, &prompt, &opts).await.context("runner invocation failed")?;

            plan = self.reload_plan(&plan, worktree_path);

            append_progress(&plan, iteration, &progress_body(&run_result.duration, run_result.is_complete, run_result.blocker.as_ref()))
                .unwrap_or_else(|e| warn!(error = %e, "failed to append progress (non-fatal)"));

            self.commit_if_dirty(iteration).await;

            if let Some(blocker) = &run_result.blocker {
                if let Some(cb) = on_blocker {
                    cb(blocker);
                }
            }

            if run_result.is_complete {
                match self.verifier.verify(cancel, &plan).await {
                    Ok(verification) if verification.verified => {
                        return Ok((LoopOutcome::Completed, plan));
                    }
                    Ok(verification) => {
                        append_feedback(&plan, "verification", &verification.reason)
                            .unwrap_or_else(|e| warn!(error = %e, "failed to append verification feedback (non-fatal)"));
                    }
                    Err(e) => {
                        warn!(error = %e, "verifier run failed (non-fatal)");
                    }
                }
            }

            context.iteration = iteration;
            context.persist(context_path);

            if let Some(cb) = on_iteration {
                cb(iteration);
            }

            if cancel_sleep(cancel, cfg.cooldown).await {
                return Ok((LoopOutcome::Cancelled, plan));
            }
        }
    }

    fn build_prompt(&self, template: &str, plan: &Plan, iteration: u32, max_iterations: u32, base_branch: &str) -> String {
        let mut overrides = HashMap::new();
        overrides.insert("ITERATION".to_string(), iteration.to_string());
        overrides.insert("MAX_ITERATIONS".to_string(), max_iterations.to_string());
        overrides.insert("FEATURE_BRANCH".to_string(), plan.branch.clone());
        overrides.insert("BASE_BRANCH".to_string(), base_branch.to_string());
        overrides.insert("PLAN_FILE".to_string(), plan.path.to_string_lossy().to_string());
        self.prompt_builder.build(template, &overrides)
    }

    fn reload_plan(&self, previous: &Plan, _worktree_path: &Path) -> Plan {
        let load_path = previous.bundle_dir.clone().unwrap_or_else(|| previous.path.clone());
        match Plan::load(&load_path) {
            Ok(plan) => plan,
            Err(e) => {
                debug!(error = %e, "plan reload failed, keeping previous in-memory plan");
                previous.clone()
            }
        }
    }

    async fn commit_if_dirty(&self, iteration: u32) {
        let status = match self.vcs.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "failed to read vcs status before commit (non-fatal)");
                return;
            }
        };
        if status.is_clean {
            return;
        }
        let message = format!("ralph: iteration {iteration}");
        if let Err(e) = self.vcs.commit(&message, &[]).await {
            warn!(error = %e, "commit failed (non-fatal)");
        }
    }
}

fn progress_body(duration: &Duration, is_complete: bool, blocker: Option<&Blocker>) -> String {
    let mut body = format!("Duration: {:.1}s. Completion marker: {}.", duration.as_secs_f64(), is_complete);
    if let Some(b) = blocker {
        body.push_str(&format!(" Blocker: {}", b.description));
    }
    body
}

/// Sleep for `duration`, cancellation-responsive. Returns `true` if
/// cancellation won the race.
async fn cancel_sleep(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{ScriptedError, ScriptedRunner, ScriptedStep};
    use crate::vcs::{GitVcs, VcsStatus, WorktreeEntry};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn substitutes_known_placeholders_and_preserves_unknown() {
        let builder = TemplateSubstitutionPromptBuilder;
        let mut overrides = HashMap::new();
        overrides.insert("ITERATION".to_string(), "3".to_string());
        let out = builder.build("iter {{ITERATION}} of {{MAX_ITERATIONS}}", &overrides);
        assert_eq!(out, "iter 3 of {{MAX_ITERATIONS}}");
    }

    struct FakeCleanVcs {
        repo: PathBuf,
        commits: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Vcs for FakeCleanVcs {
        async fn status(&self) -> Result<VcsStatus, crate::vcs::VcsError> {
            Ok(VcsStatus { is_clean: true, ..Default::default() })
        }
        async fn add(&self, _files: &[String]) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn commit(&self, message: &str, _files: &[String]) -> Result<(), crate::vcs::VcsError> {
            self.commits.lock().unwrap().push(message.to_string());
            Ok(())
        }
        async fn current_branch(&self) -> Result<String, crate::vcs::VcsError> {
            Ok("main".to_string())
        }
        async fn branch_exists(&self, _name: &str) -> Result<bool, crate::vcs::VcsError> {
            Ok(true)
        }
        async fn create_branch(&self, _name: &str) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn delete_branch(&self, _name: &str, _force: bool) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn checkout(&self, _name: &str) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn merge(&self, _name: &str, _no_ff: bool) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn push(&self, _branch: &str) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn delete_remote_branch(&self, _branch: &str) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn create_worktree(&self, _path: &Path, _branch: &str) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn remove_worktree(&self, _path: &Path) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, crate::vcs::VcsError> {
            Ok(Vec::new())
        }
        fn repo_root(&self) -> &Path {
            &self.repo
        }
    }

    fn flat_plan(dir: &Path, name: &str) -> Plan {
        let path = dir.join(format!("{name}.md"));
        std::fs::write(&path, "- [ ] do the thing\n").unwrap();
        Plan::load(&path).unwrap()
    }

    #[tokio::test]
    async fn completes_on_verified_completion_marker() {
        let dir = TempDir::new().unwrap();
        let plan = flat_plan(dir.path(), "widget");

        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedStep::Text("<promise>COMPLETE</promise>".to_string()),
            ScriptedStep::Text("YES".to_string()),
        ]));
        let vcs = Arc::new(FakeCleanVcs { repo: dir.path().to_path_buf(), commits: Default::default() });
        let loop_ = IterationLoop::new(runner, vcs, Arc::new(TemplateSubstitutionPromptBuilder));

        let cfg = Config::default();
        let cancel = CancellationToken::new();
        let context_path = dir.path().join(".ralph/context.json");

        let (outcome, _) = loop_
            .run(&cancel, &cfg, plan, dir.path(), "do work", "main", &context_path, None, None)
            .await
            .unwrap();

        assert!(matches!(outcome, LoopOutcome::Completed));
    }

    #[tokio::test]
    async fn unverified_completion_continues_with_feedback() {
        let dir = TempDir::new().unwrap();
        let plan = flat_plan(dir.path(), "widget");

        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedStep::Text("<promise>COMPLETE</promise>".to_string()),
            ScriptedStep::Text("NO: still missing tests".to_string()),
            ScriptedStep::Text("<promise>COMPLETE</promise>".to_string()),
            ScriptedStep::Text("YES".to_string()),
        ]));
        let vcs = Arc::new(FakeCleanVcs { repo: dir.path().to_path_buf(), commits: Default::default() });
        let loop_ = IterationLoop::new(runner, vcs, Arc::new(TemplateSubstitutionPromptBuilder));

        let mut cfg = Config::default();
        cfg.cooldown = Duration::from_millis(1);
        let cancel = CancellationToken::new();
        let context_path = dir.path().join(".ralph/context.json");

        let (outcome, plan) = loop_
            .run(&cancel, &cfg, plan, dir.path(), "do work", "main", &context_path, None, None)
            .await
            .unwrap();

        assert!(matches!(outcome, LoopOutcome::Completed));
        let feedback = std::fs::read_to_string(dir.path().join(format!("{}.feedback.md", plan.name))).unwrap();
        assert!(feedback.contains("still missing tests"));
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_next_iteration() {
        let dir = TempDir::new().unwrap();
        let plan = flat_plan(dir.path(), "widget");

        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedStep::Text("still working".to_string())]));
        let vcs = Arc::new(FakeCleanVcs { repo: dir.path().to_path_buf(), commits: Default::default() });
        let loop_ = IterationLoop::new(runner, vcs, Arc::new(TemplateSubstitutionPromptBuilder));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cfg = Config::default();
        let context_path = dir.path().join(".ralph/context.json");

        let (outcome, _) = loop_
            .run(&cancel, &cfg, plan, dir.path(), "do work", "main", &context_path, None, None)
            .await
            .unwrap();

        assert!(matches!(outcome, LoopOutcome::Cancelled));
    }

    #[tokio::test]
    async fn max_iterations_exceeded_when_never_completing() {
        let dir = TempDir::new().unwrap();
        let plan = flat_plan(dir.path(), "widget");

        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedStep::Text("still working".to_string())]));
        let vcs = Arc::new(FakeCleanVcs { repo: dir.path().to_path_buf(), commits: Default::default() });
        let loop_ = IterationLoop::new(runner, vcs, Arc::new(TemplateSubstitutionPromptBuilder));

        let mut cfg = Config::default();
        cfg.max_iterations = 2;
        cfg.cooldown = Duration::from_millis(1);
        let cancel = CancellationToken::new();
        let context_path = dir.path().join(".ralph/context.json");

        let (outcome, _) = loop_
            .run(&cancel, &cfg, plan, dir.path(), "do work", "main", &context_path, None, None)
            .await
            .unwrap();

        assert!(matches!(outcome, LoopOutcome::MaxIterationsExceeded { iterations: 2 }));
    }

    #[tokio::test]
    async fn blocker_invokes_observer_without_terminating() {
        let dir = TempDir::new().unwrap();
        let plan = flat_plan(dir.path(), "widget");

        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedStep::Text("<blocker>need credentials\nAction: set SECRET</blocker>".to_string()),
            ScriptedStep::Text("<promise>COMPLETE</promise>".to_string()),
            ScriptedStep::Text("YES".to_string()),
        ]));
        let vcs = Arc::new(FakeCleanVcs { repo: dir.path().to_path_buf(), commits: Default::default() });
        let loop_ = IterationLoop::new(runner, vcs, Arc::new(TemplateSubstitutionPromptBuilder));

        let mut cfg = Config::default();
        cfg.cooldown = Duration::from_millis(1);
        let cancel = CancellationToken::new();
        let context_path = dir.path().join(".ralph/context.json");

        let seen = std::sync::Mutex::new(Vec::new());
        let on_blocker = |b: &Blocker| seen.lock().unwrap().push(b.hash.clone());

        let (outcome, _) = loop_
            .run(&cancel, &cfg, plan, dir.path(), "do work", "main", &context_path, Some(&on_blocker), None)
            .await
            .unwrap();

        assert!(matches!(outcome, LoopOutcome::Completed));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn identical_blocker_twice_then_resolved_still_completes() {
        let dir = TempDir::new().unwrap();
        let plan = flat_plan(dir.path(), "widget");

        let stuck = "<blocker>Need key\nAction: set SECRET\nResume: retry</blocker>".to_string();
        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedStep::Text(stuck.clone()),
            ScriptedStep::Text(stuck),
            ScriptedStep::Text("<promise>COMPLETE</promise>".to_string()),
            ScriptedStep::Text("YES".to_string()),
        ]));
        let vcs = Arc::new(FakeCleanVcs { repo: dir.path().to_path_buf(), commits: Default::default() });
        let loop_ = IterationLoop::new(runner, vcs, Arc::new(TemplateSubstitutionPromptBuilder));

        let mut cfg = Config::default();
        cfg.cooldown = Duration::from_millis(1);
        let cancel = CancellationToken::new();
        let context_path = dir.path().join(".ralph/context.json");

        let seen = std::sync::Mutex::new(Vec::new());
        let on_blocker = |b: &Blocker| seen.lock().unwrap().push(b.hash.clone());

        let (outcome, _) = loop_
            .run(&cancel, &cfg, plan, dir.path(), "do work", "main", &context_path, Some(&on_blocker), None)
            .await
            .unwrap();

        match outcome {
            LoopOutcome::Completed => {}
            other => panic!("expected Completed, got {other:?}"),
        }
        let hashes = seen.lock().unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], hashes[1]);
    }

    #[tokio::test]
    async fn runner_failure_propagates_as_error() {
        let dir = TempDir::new().unwrap();
        let plan = flat_plan(dir.path(), "widget");

        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedStep::Fail(ScriptedError::NonRetryable("boom".to_string()))]));
        let vcs = Arc::new(FakeCleanVcs { repo: dir.path().to_path_buf(), commits: Default::default() });
        let loop_ = IterationLoop::new(runner, vcs, Arc::new(TemplateSubstitutionPromptBuilder));

        let cfg = Config::default();
        let cancel = CancellationToken::new();
        let context_path = dir.path().join(".ralph/context.json");

        let result = loop_.run(&cancel, &cfg, plan, dir.path(), "do work", "main", &context_path, None, None).await;
        assert!(result.is_err());
    }

    #[test]
    fn context_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("context.json");
        let ctx = ExecutionContext { iteration: 5 };
        ctx.persist(&path);
        let reloaded = ExecutionContext::load(&path);
        assert_eq!(reloaded.iteration, 5);
    }

    #[test]
    fn missing_context_file_defaults_to_zero() {
        let dir = TempDir::new().unwrap();
        let ctx = ExecutionContext::load(&dir.path().join("missing.json"));
        assert_eq!(ctx.iteration, 0);
    }

    // Keep GitVcs referenced so the production VCS path stays exercised
    // from this module's perspective even though the scripted tests above
    // use a fake.
    #[test]
    fn git_vcs_constructs_with_repo_root() {
        let dir = TempDir::new().unwrap();
        let vcs = GitVcs::new(dir.path());
        assert_eq!(vcs.repo_root(), dir.path());
    }
}
