//! The script repair loop: generate → validate → execute → correct.
//!
//! The script agent gets up to `max_fix_attempts + 1` tries per turn.  Each
//! candidate reply is normalized (code fences, comments, duplicate `using`
//! lines, excess blank lines), validated, composed with the generated proxy
//! prelude plus the live-instance declarations, and dispatched to the
//! runner.  Failures come back as a corrective user turn; errors whose text
//! starts with `"Cannot"` are policy refusals that surface verbatim without
//! another attempt.

use std::error::Error;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::scriptor::agent::{AgentThread, ChatAgent};
use crate::scriptor::dispatcher::RunnerError;
use crate::scriptor::operator::HandleTable;
use crate::scriptor::proxy::{compose_script, ProxyBundle};
use crate::scriptor::runner::ScriptRunner;
use crate::scriptor::validator::ScriptValidator;

/// Outcome of one run of the repair loop.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub success: bool,
    /// Raw JSON result of the last successful execution.
    pub raw_result: Option<Value>,
    /// Last validator or runner error when the budget ran out.
    pub error: Option<String>,
    /// Last script the agent produced (normalized body, without prelude).
    pub script: Option<String>,
    /// Number of script-agent calls made (initial + repairs).
    pub attempts: u32,
}

/// Errors whose text starts with this prefix are user-visible policy
/// refusals: surfaced verbatim, never retried.
const POLICY_REFUSAL_PREFIX: &str = "Cannot";

pub fn is_policy_refusal(error: &str) -> bool {
    error.trim_start().starts_with(POLICY_REFUSAL_PREFIX)
}

/// Drives the script agent through bounded generate/repair attempts.
pub struct RepairLoop {
    /// Retry budget; total attempts can reach `max_fix_attempts + 1`.
    max_fix_attempts: u32,
}

impl RepairLoop {
    pub fn new(max_fix_attempts: u32) -> Self {
        RepairLoop { max_fix_attempts }
    }

    /// Run the loop for one task.
    ///
    /// Chat-service failures and cancellation propagate as errors; validator
    /// and runner failures are recovered locally until the budget is spent.
    pub async fn run(
        &self,
        task: &str,
        thread: &mut AgentThread,
        script_agent: &ChatAgent,
        bundle: &ProxyBundle,
        handles: &HandleTable,
        runner: &dyn ScriptRunner,
        validator: &dyn ScriptValidator,
        cancel: &CancellationToken,
    ) -> Result<RepairOutcome, Box<dyn Error + Send + Sync>> {
        let mut attempts: u32 = 0;
        let mut last_error: Option<String> = None;
        let mut last_script: Option<String> = None;

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("RepairLoop: task: {}", task);
        }

        loop {
            attempts += 1;
            let reply = script_agent.complete(thread).await?;
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("RepairLoop: attempt {} reply: {}", attempts, reply);
            }

            let script = normalize_script(&reply, &bundle.runtime_text);
            last_script = Some(script.clone());

            match validator.validate(&script) {
                Some(rejection) => {
                    log::warn!("Validation failed: {}", rejection);
                    last_error = Some(rejection);
                }
                None => {
                    let code = compose_script(bundle, &handles.live(), &script);
                    match runner.execute(&code, cancel).await {
                        Ok(value) => {
                            return Ok(RepairOutcome {
                                success: true,
                                raw_result: Some(value),
                                error: None,
                                script: last_script,
                                attempts,
                            });
                        }
                        Err(RunnerError::Cancelled) => {
                            return Err(Box::new(RunnerError::Cancelled));
                        }
                        Err(RunnerError::Transport(reason)) => {
                            // Terminal for the turn: record and return.
                            log::warn!("Execution error: transport closed: {}", reason);
                            return Ok(RepairOutcome {
                                success: false,
                                raw_result: None,
                                error: Some(format!("Transport closed: {}", reason)),
                                script: last_script,
                                attempts,
                            });
                        }
                        Err(RunnerError::Execution(message)) => {
                            log::warn!("Execution error: {}", message);
                            last_error = Some(message);
                        }
                    }
                }
            }

            let error = last_error.clone().unwrap_or_default();
            if is_policy_refusal(&error) {
                return Ok(RepairOutcome {
                    success: false,
                    raw_result: None,
                    error: Some(error.trim().to_string()),
                    script: last_script,
                    attempts,
                });
            }

            if attempts > self.max_fix_attempts {
                return Ok(RepairOutcome {
                    success: false,
                    raw_result: None,
                    error: last_error,
                    script: last_script,
                    attempts,
                });
            }

            thread.push(
                crate::scriptor::client_wrapper::Role::User,
                format!(
                    "Regenerate the script to accomplish the task, correcting the previous failure: {}",
                    error
                ),
            );
        }
    }
}

/// Normalize a script agent reply into an executable body.
///
/// Strips code fences, removes block and line comments, drops `using` lines
/// already present in the prelude, and collapses runs of blank lines.
pub fn normalize_script(reply: &str, prelude: &str) -> String {
    let mut text = String::with_capacity(reply.len());

    // Code fences: drop the fence lines, keep their content.
    for line in reply.lines() {
        if line.trim_start().starts_with("```") {
            continue;
        }
        text.push_str(line);
        text.push('\n');
    }

    let text = strip_block_comments(&text);

    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for raw in text.lines() {
        let line = strip_line_comment(raw);
        let trimmed = line.trim();

        if trimmed.starts_with("using ") && prelude.contains(trimmed) {
            continue;
        }

        if trimmed.is_empty() {
            if !raw.trim().is_empty() {
                // Comment-only line; drop it without leaving a blank behind.
                continue;
            }
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
            continue;
        }

        blank_run = 0;
        out.push_str(line.trim_end());
        out.push('\n');
    }

    out.trim().to_string()
}

fn strip_block_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(end) => rest = &rest[start + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Remove a trailing `//` comment, leaving URL-style `://` sequences alone.
fn strip_line_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'/' && bytes[i + 1] == b'/' && (i == 0 || bytes[i - 1] != b':') {
            return &line[..i];
        }
        i += 1;
    }
    line
}
