//! Subprocess-backed [`Runner`] for an external, Claude-Code-shaped LM
//! CLI tool.
//!
//! Grounded in `ClaudeCodeAdapter` (`harness/claude_code.rs` in the
//! teacher): the flag set (`-p --output-format stream-json --verbose
//! --allowedTools ... --append-system-prompt ...`), the
//! spawn-with-piped-stdio setup, and the SIGTERM-then-grace-period-
//! then-SIGKILL shutdown sequence all carry over. What changes is the
//! shape of the call: instead of a separate `spawn`/`events`/`kill`
//! trio returning a live handle, a single `run` owns the process end to
//! end and feeds stdout through the new mutex-guarded [`StreamParser`]
//! instead of an `async_stream` event stream.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{RunOptions, RunResult, Runner, RunnerError};
use crate::markers::{extract_blocker, has_completion_marker};
use crate::retrier::Retrier;
use crate::stream_parser::StreamParser;

/// Grace period between SIGTERM and SIGKILL during termination.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Runs an external LM CLI tool (default binary name `claude`) as a
/// subprocess, one invocation per `run` call, retried internally.
pub struct ClaudeCodeRunner {
    binary_path: String,
    retrier: Retrier,
    grace_period: Duration,
}

impl std::fmt::Debug for ClaudeCodeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeCodeRunner")
            .field("binary_path", &self.binary_path)
            .finish()
    }
}

impl ClaudeCodeRunner {
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            retrier: Retrier::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = retrier;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn build_command(&self, prompt_via_stdin: bool, opts: &RunOptions) -> Command {
        let mut cmd = Command::new(&self.binary_path);

        if opts.print {
            cmd.arg("-p");
        }
        if let Some(format) = &opts.output_format {
            cmd.arg("--output-format").arg(format);
            if format == "stream-json" {
                cmd.arg("--verbose");
            }
        }
        if let Some(model) = &opts.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(max_tokens) = opts.max_tokens {
            cmd.arg("--max-tokens").arg(max_tokens.to_string());
        }
        if let Some(tools) = opts.allowed_tools_arg() {
            cmd.arg("--allowedTools").arg(tools);
        }
        if let Some(system_prompt) = &opts.system_prompt {
            cmd.arg("--append-system-prompt").arg(system_prompt);
        }
        if opts.no_permissions {
            cmd.arg("--dangerously-skip-permissions");
        }
        if let Some(work_dir) = &opts.work_dir {
            cmd.current_dir(work_dir);
        }

        cmd.stdin(if prompt_via_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    /// A single subprocess invocation: spawn, write the prompt to stdin,
    /// stream stdout through the parser, honour cancellation/timeout
    /// with the SIGTERM/SIGKILL protocol, and classify the outcome.
    async fn run_once(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<RunResult, RunnerError> {
        let start = Instant::now();
        let mut cmd = self.build_command(true, opts);

        let mut child = cmd.spawn().map_err(RunnerError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(error = %e, "failed writing prompt to child stdin");
            }
            drop(stdin);
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let parser = Arc::new(StreamParser::new());
        let parser_for_task = Arc::clone(&parser);
        let stdout_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => parser_for_task.feed(&chunk[..n]),
                    Err(_) => break,
                }
            }
            parser_for_task.finish();
        });

        let stderr_task = tokio::spawn(async move {
            let mut reader = stderr;
            let mut buf = String::new();
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let timeout_fut = async {
            match opts.timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let status: Result<std::process::ExitStatus, RunnerError> = tokio::select! {
            status = child.wait() => status.map_err(RunnerError::Spawn),
            _ = timeout_fut => {
                self.terminate(&mut child).await;
                Err(RunnerError::DeadlineExceeded)
            }
            _ = cancel.cancelled() => {
                self.terminate(&mut child).await;
                Err(RunnerError::Cancelled)
            }
        };

        let stderr_text = stderr_task.await.unwrap_or_default();
        let _ = stdout_task.await;

        let duration = start.elapsed();
        let status = status?;

        if !status.success() {
            return Err(RunnerError::ExitFailure {
                exit_code: status.code(),
                stderr: stderr_text,
            });
        }

        let text = parser.full_text();
        let is_complete = has_completion_marker(&text);
        let blocker = extract_blocker(&text);

        Ok(RunResult {
            raw_output: parser.raw_bytes(),
            text,
            duration,
            attempts: 1,
            is_complete,
            blocker,
        })
    }

    /// SIGTERM, wait up to `grace_period`, then SIGKILL if still alive.
    async fn terminate(&self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid is a live child we spawned and have not yet reaped.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding straight to SIGKILL");
            }
        }

        let exited = tokio::time::timeout(self.grace_period, child.wait()).await;
        match exited {
            Ok(Ok(_status)) => debug!("child exited after SIGTERM"),
            _ => {
                debug!("child did not exit within grace period, sending SIGKILL");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

impl Default for ClaudeCodeRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for ClaudeCodeRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<RunResult, RunnerError> {
        let mut attempts: u32 = 0;
        let result = self
            .retrier
            .do_with(cancel, || {
                attempts += 1;
                self.run_once(cancel, prompt, opts)
            })
            .await?;

        Ok(RunResult { attempts, ..result })
    }
}
