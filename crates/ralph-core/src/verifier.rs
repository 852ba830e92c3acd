//! Independent re-verification of an agent's completion claim (§4.E).
//!
//! Grounded in the Runner trait's `run` contract; the Verifier is just
//! another caller of it with a fixed prompt shape, a cheaper model
//! override, and a narrow parsing step over plain-text output.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::plan::Plan;
use crate::runner::{RunOptions, Runner, RunnerError};

const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a verification pass.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub verified: bool,
    pub reason: String,
    pub raw_response: String,
}

pub struct Verifier {
    runner: Arc<dyn Runner>,
    model: String,
    timeout: Duration,
}

impl Verifier {
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self { runner, model: DEFAULT_MODEL.to_string(), timeout: DEFAULT_TIMEOUT }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn verify(&self, cancel: &CancellationToken, plan: &Plan) -> Result<VerificationResult, RunnerError> {
        let prompt = build_prompt(plan);
        let opts = RunOptions {
            model: Some(self.model.clone()),
            print: true,
            output_format: Some("text".to_string()),
            timeout: Some(self.timeout),
            ..Default::default()
        };

        let result = self.runner.run(cancel, &prompt, &opts).await?;
        Ok(parse_reply(&result.text))
    }
}

fn build_prompt(plan: &Plan) -> String {
    format!(
        "You are verifying whether the following plan has been fully completed.\n\
         Review the plan body below and answer with exactly one of:\n\
         YES\n\
         NO: <reason>\n\n\
         --- PLAN BODY ---\n{}\n--- END PLAN BODY ---\n",
        plan.content
    )
}

/// Parse the verifier's reply per §4.E's exact rules.
fn parse_reply(text: &str) -> VerificationResult {
    let trimmed = text.trim();
    let stripped = trimmed.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '_' | '"' | '\''));

    if let Some(rest) = strip_leading_yes(stripped) {
        let _ = rest;
        return VerificationResult { verified: true, reason: String::new(), raw_response: text.to_string() };
    }

    if let Some(rest) = strip_leading_no(stripped) {
        let reason = rest.trim().trim_start_matches(':').trim();
        let reason = if reason.is_empty() { "no reason given".to_string() } else { reason.to_string() };
        return VerificationResult { verified: false, reason, raw_response: text.to_string() };
    }

    let snippet: String = trimmed.chars().take(200).collect();
    VerificationResult {
        verified: false,
        reason: format!("unclear response: {snippet}"),
        raw_response: text.to_string(),
    }
}

fn strip_leading_yes(text: &str) -> Option<&str> {
    if text.len() >= 3 && text[..3].eq_ignore_ascii_case("yes") {
        let rest = &text[3..];
        if rest.is_empty() || !rest.starts_with(|c: char| c.is_alphanumeric()) {
            return Some(rest);
        }
    }
    None
}

fn strip_leading_no(text: &str) -> Option<&str> {
    if text.len() >= 2 && text[..2].eq_ignore_ascii_case("no") {
        let rest = &text[2..];
        if rest.is_empty() || !rest.starts_with(|c: char| c.is_alphanumeric()) {
            return Some(rest);
        }
    }
    None
}
