//! The abstract interface to the external LM tool (§4.C).
//!
//! Grounded in `harness/claude_code.rs`'s subprocess lifecycle (spawn,
//! stream stdout, SIGTERM-then-SIGKILL kill), but restructured around a
//! single `run` call that owns the whole process lifetime instead of a
//! separate `spawn`/`events`/`kill` trio — this engine never needs to
//! hold a live handle across iterations, so there is nothing to gain
//! from splitting spawn from consumption.

mod claude_code;
mod scripted;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::markers::Blocker;
use crate::retrier::{RetryClassify, classify_message};

pub use claude_code::ClaudeCodeRunner;
pub use scripted::{ScriptedError, ScriptedRunner, ScriptedStep};

/// Options accepted by a [`Runner::run`] invocation. Every field is
/// optional; a production implementation omits the corresponding
/// command-line flag when a field is left at its default.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub allowed_tools: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub print: bool,
    pub output_format: Option<String>,
    pub system_prompt: Option<String>,
    pub no_permissions: bool,
    /// Bounds a single attempt; `None` means no deadline beyond cancellation.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn allowed_tools_arg(&self) -> Option<String> {
        if self.allowed_tools.is_empty() {
            None
        } else {
            Some(self.allowed_tools.join(","))
        }
    }
}

/// The outcome of a completed `Run` call.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub raw_output: Vec<u8>,
    pub text: String,
    pub duration: Duration,
    pub attempts: u32,
    pub is_complete: bool,
    pub blocker: Option<Blocker>,
}

/// Errors a [`Runner`] implementation may return.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn external tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("external tool exited with status {exit_code:?}: {stderr}")]
    ExitFailure { exit_code: Option<i32>, stderr: String },

    #[error("run deadline exceeded")]
    DeadlineExceeded,

    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    NonRetryable(String),
}

impl RetryClassify for RunnerError {
    fn is_retryable(&self) -> bool {
        match self {
            RunnerError::DeadlineExceeded => true,
            RunnerError::Cancelled => false,
            RunnerError::Spawn(_) => false,
            RunnerError::NonRetryable(_) => false,
            RunnerError::ExitFailure { exit_code, stderr } => {
                if stderr.trim().is_empty() && *exit_code == Some(1) {
                    true
                } else {
                    classify_message(stderr)
                }
            }
        }
    }
}

/// Abstract interface to the external LM tool. Implementations own the
/// full subprocess lifecycle for a single logical `Run` invocation,
/// including the internal retry loop (`RunResult::attempts` reports how
/// many invocations were actually made).
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<RunResult, RunnerError>;
}
