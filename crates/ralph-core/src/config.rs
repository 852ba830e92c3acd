//! Engine-wide tunables (§9 "global mutable state -> explicit config",
//! §10.3).
//!
//! Grounded in the teacher's `GatorConfig`/`ConfigFile` resolution-chain
//! pattern (`gator-cli/src/config.rs`): a plain struct, `Default`
//! impl carrying the numeric defaults stated throughout §4, and
//! `serde::Deserialize` so a front-end can populate it from whatever
//! source it chooses. Loading `.ralph/config.yaml` itself is out of
//! scope (§1) -- only the resolved struct lives here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retrier::RetrierConfig;

/// How a verified-complete plan is finalised (§6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Push the feature branch and open a pull request; retain the branch.
    #[default]
    Pr,
    /// Merge the feature branch into the base branch with `--no-ff`, then
    /// delete it locally and remotely.
    Merge,
}

/// Worktree-related tunables (§4.I).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeConfig {
    /// Override for `<repo>/.ralph/worktrees`; `None` uses the default.
    #[serde(default)]
    pub base_override: Option<std::path::PathBuf>,
    /// Extra filenames copied into the worktree alongside plan/progress/
    /// feedback (e.g. `.env`, `.env.local`).
    #[serde(default)]
    pub copy_env_files: Vec<String>,
    /// Shell command run via `init_commands` when no executable
    /// `.ralph/hooks/worktree-init` is present (§4.I step 2).
    #[serde(default)]
    pub init_commands: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_override: None,
            copy_env_files: Vec::new(),
            init_commands: String::new(),
        }
    }
}

/// Completion-related tunables (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub mode: CompletionMode,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            mode: CompletionMode::default(),
        }
    }
}

/// Every tunable named across §4, aggregated into one struct handed to
/// the Worker at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retry/backoff defaults for the Retrier (§4.A) and any Runner built
    /// on top of it.
    pub retrier: RetrierConfig,
    /// Per-iteration Runner timeout (§4.J step 3). Default 30 minutes.
    #[serde(with = "duration_secs")]
    pub iteration_timeout: Duration,
    /// Verifier Runner timeout (§4.E). Default 60 seconds.
    #[serde(with = "duration_secs")]
    pub verifier_timeout: Duration,
    /// Model override passed to the Verifier's Runner invocation (§4.E).
    pub verifier_model: String,
    /// Grace period between SIGTERM and SIGKILL (§4.C).
    #[serde(with = "duration_secs")]
    pub terminate_grace_period: Duration,
    /// Sleep between iterations (§4.J step 10).
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
    /// Sleep between `RunOnce` polls when the queue is empty (§4.K).
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Maximum iterations before a plan's loop gives up (§4.J).
    pub max_iterations: u32,
    pub completion: CompletionConfig,
    pub worktree: WorktreeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retrier: RetrierConfig::default(),
            iteration_timeout: Duration::from_secs(30 * 60),
            verifier_timeout: Duration::from_secs(60),
            verifier_model: "claude-3-5-haiku-latest".to_string(),
            terminate_grace_period: Duration::from_secs(5),
            cooldown: Duration::from_secs(3),
            poll_interval: Duration::from_secs(30),
            max_iterations: 50,
            completion: CompletionConfig::default(),
            worktree: WorktreeConfig::default(),
        }
    }
}

/// `serde` helper: (de)serialise a [`Duration`] as whole seconds, so the
/// resulting config file shape stays human-editable (`iteration_timeout:
/// 1800` rather than a nested struct).
mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
