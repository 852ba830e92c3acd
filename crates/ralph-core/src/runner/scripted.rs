//! A scripted, in-memory [`Runner`] used to drive iteration-loop and
//! worker tests without a real subprocess.
//!
//! Grounded in the teacher's `NoopHarness` pattern (the other pack
//! repos' fake-trait-implementation test doubles follow the same
//! shape): a queue of canned outcomes consumed one call at a time.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{RunOptions, RunResult, Runner, RunnerError};
use crate::markers::{extract_blocker, has_completion_marker};

/// A single canned response for one `run` call.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Succeed, extracting completion/blocker markers from `text` the
    /// same way a real run would.
    Text(String),
    /// Fail with the given error.
    Fail(ScriptedError),
}

/// A cloneable stand-in for [`RunnerError`] (which is not `Clone`
/// because it wraps `std::io::Error`).
#[derive(Debug, Clone)]
pub enum ScriptedError {
    ExitFailure { exit_code: Option<i32>, stderr: String },
    DeadlineExceeded,
    Cancelled,
    NonRetryable(String),
}

impl From<ScriptedError> for RunnerError {
    fn from(e: ScriptedError) -> Self {
        match e {
            ScriptedError::ExitFailure { exit_code, stderr } => {
                RunnerError::ExitFailure { exit_code, stderr }
            }
            ScriptedError::DeadlineExceeded => RunnerError::DeadlineExceeded,
            ScriptedError::Cancelled => RunnerError::Cancelled,
            ScriptedError::NonRetryable(msg) => RunnerError::NonRetryable(msg),
        }
    }
}

/// Replays a fixed sequence of [`ScriptedStep`]s, one per `run` call.
/// Calling past the end of the script repeats the final step.
pub struct ScriptedRunner {
    steps: Mutex<Vec<ScriptedStep>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// The prompts passed to every `run` call so far, in order.
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.calls.lock().expect("scripted runner mutex poisoned").clone()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(
        &self,
        _cancel: &CancellationToken,
        prompt: &str,
        _opts: &RunOptions,
    ) -> Result<RunResult, RunnerError> {
        self.calls
            .lock()
            .expect("scripted runner mutex poisoned")
            .push(prompt.to_string());

        let step = {
            let mut steps = self.steps.lock().expect("scripted runner mutex poisoned");
            if steps.is_empty() {
                ScriptedStep::Text(String::new())
            } else if steps.len() == 1 {
                steps[0].clone()
            } else {
                steps.remove(0)
            }
        };

        match step {
            ScriptedStep::Fail(e) => Err(e.into()),
            ScriptedStep::Text(text) => Ok(RunResult {
                is_complete: has_completion_marker(&text),
                blocker: extract_blocker(&text),
                raw_output: text.as_bytes().to_vec(),
                text,
                duration: Duration::from_millis(0),
                attempts: 1,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_steps_in_order_then_repeats_last() {
        let runner = ScriptedRunner::new(vec![
            ScriptedStep::Text("first".to_string()),
            ScriptedStep::Text("<promise>COMPLETE</promise>".to_string()),
        ]);
        let cancel = CancellationToken::new();
        let opts = RunOptions::default();

        let r1 = runner.run(&cancel, "p1", &opts).await.unwrap();
        assert_eq!(r1.text, "first");
        assert!(!r1.is_complete);

        let r2 = runner.run(&cancel, "p2", &opts).await.unwrap();
        assert!(r2.is_complete);

        let r3 = runner.run(&cancel, "p3", &opts).await.unwrap();
        assert!(r3.is_complete);

        assert_eq!(runner.recorded_prompts(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_runner_error() {
        let runner = ScriptedRunner::new(vec![ScriptedStep::Fail(ScriptedError::Cancelled)]);
        let cancel = CancellationToken::new();
        let err = runner.run(&cancel, "p", &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled));
    }
}
