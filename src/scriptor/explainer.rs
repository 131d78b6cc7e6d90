//! Result explanation: raw script output → user-facing prose.
//!
//! The explainer agent receives `<task>…</task><result>…</result>` and
//! renders the answer.  An empty reply falls back to the raw result verbatim;
//! agent exceptions propagate to the caller.

use std::error::Error;

use tokio::sync::mpsc;

use crate::scriptor::agent::{AgentThread, ChatAgent};
use crate::scriptor::client_wrapper::Role;

/// Prompt material handed to the explainer agent.
pub fn build_prompt(task: &str, raw_result: &str) -> String {
    format!(
        "<task>\n{}\n</task>\n<result>\n{}\n</result>",
        task, raw_result
    )
}

/// Ask the explainer agent to render the raw result.
pub async fn explain(
    agent: &ChatAgent,
    thread: &mut AgentThread,
    task: &str,
    raw_result: &str,
) -> Result<String, Box<dyn Error + Send + Sync>> {
    thread.push(Role::User, build_prompt(task, raw_result));
    let reply = agent.complete(thread).await?;
    if reply.trim().is_empty() {
        log::info!("Explainer returned an empty reply; falling back to the raw result.");
        return Ok(raw_result.to_string());
    }
    Ok(reply)
}

/// Streaming variant: tokens go to `sink` as they arrive and the full reply
/// is returned for the closing assistant turn.
///
/// Degrades to the non-streaming call when the client cannot stream.
pub async fn explain_stream(
    agent: &ChatAgent,
    thread: &mut AgentThread,
    task: &str,
    raw_result: &str,
    sink: &mpsc::UnboundedSender<String>,
) -> Result<String, Box<dyn Error + Send + Sync>> {
    thread.push(Role::User, build_prompt(task, raw_result));

    match agent.stream(thread).await? {
        Some(mut chunks) => {
            use futures_util::StreamExt;
            let mut accumulated = String::new();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                if !chunk.content.is_empty() {
                    accumulated.push_str(&chunk.content);
                    let _ = sink.send(chunk.content);
                }
            }
            if accumulated.trim().is_empty() {
                log::info!("Explainer returned an empty reply; falling back to the raw result.");
                let _ = sink.send(raw_result.to_string());
                return Ok(raw_result.to_string());
            }
            Ok(accumulated)
        }
        None => {
            let reply = agent.complete(thread).await?;
            let rendered = if reply.trim().is_empty() {
                log::info!("Explainer returned an empty reply; falling back to the raw result.");
                raw_result.to_string()
            } else {
                reply
            };
            let _ = sink.send(rendered.clone());
            Ok(rendered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_wraps_task_and_result() {
        assert_eq!(
            build_prompt("some task description", "5"),
            "<task>\nsome task description\n</task>\n<result>\n5\n</result>"
        );
    }
}
