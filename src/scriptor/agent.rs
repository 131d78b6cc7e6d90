//! Agents and the shared conversation thread.
//!
//! The orchestration pipeline is driven by three cooperating agents — the
//! reception agent that routes a request, the script agent that writes
//! candidate scripts, and the explainer agent that renders raw results into
//! prose.  All three are instances of [`ChatAgent`]: a named system prompt
//! bound to a [`ClientWrapper`].  Within one user turn they share a single
//! [`AgentThread`], an append-only list of `(role, text)` turns that is
//! created per turn and discarded afterwards.

use std::error::Error;
use std::sync::{Arc, RwLock};

use crate::scriptor::client_wrapper::{ClientWrapper, Message, MessageChunkStream, Role};

/// Append-only conversation shared by the three agents within one user turn.
///
/// The latest user turn is the "effective task" unless the reception agent
/// emits an explicit rewritten task.
#[derive(Clone, Default)]
pub struct AgentThread {
    turns: Vec<Message>,
}

impl AgentThread {
    /// Create an empty thread.
    pub fn new() -> Self {
        AgentThread { turns: Vec::new() }
    }

    /// Seed a thread from caller-supplied history.
    pub fn from_messages(messages: &[Message]) -> Self {
        AgentThread {
            turns: messages.to_vec(),
        }
    }

    /// Append a turn.
    pub fn push(&mut self, role: Role, text: impl AsRef<str>) {
        self.turns.push(Message::new(role, text));
    }

    /// Borrow the turns in order.
    pub fn turns(&self) -> &[Message] {
        &self.turns
    }

    /// The content of the most recent user turn, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }
}

/// A named agent: a system prompt bound to a chat-completion client.
///
/// Unlike a full conversational session there is no token budgeting or
/// history trimming here; threads live for a single user turn and stay small.
pub struct ChatAgent {
    /// Stable identifier used in log records (e.g. `"reception"`, `"script"`).
    pub name: String,
    /// System prompt sent ahead of the thread on every call.  Behind a lock so
    /// the orchestrator can append prompt material (the proxy signatures) that
    /// only becomes available after the asynchronous proxy build completes.
    instructions: RwLock<String>,
    client: Arc<dyn ClientWrapper>,
}

impl ChatAgent {
    /// Create an agent with the given name, system prompt, and client.
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        client: Arc<dyn ClientWrapper>,
    ) -> Self {
        ChatAgent {
            name: name.into(),
            instructions: RwLock::new(instructions.into()),
            client,
        }
    }

    /// Replace the system prompt.
    pub fn set_instructions(&self, instructions: impl Into<String>) {
        *self.instructions.write().unwrap() = instructions.into();
    }

    /// Append prompt material to the system prompt, separated by a blank line.
    pub fn append_instructions(&self, extra: &str) {
        let mut guard = self.instructions.write().unwrap();
        if !guard.is_empty() {
            guard.push_str("\n\n");
        }
        guard.push_str(extra);
    }

    /// Snapshot of the current system prompt.
    pub fn instructions(&self) -> String {
        self.instructions.read().unwrap().clone()
    }

    fn compose(&self, thread: &AgentThread) -> Vec<Message> {
        let mut messages = Vec::with_capacity(thread.len() + 1);
        let instructions = self.instructions.read().unwrap();
        if !instructions.is_empty() {
            messages.push(Message::new(Role::System, instructions.as_str()));
        }
        messages.extend_from_slice(thread.turns());
        messages
    }

    /// Ask the agent for a full reply given the thread so far.
    pub async fn complete(
        &self,
        thread: &AgentThread,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let messages = self.compose(thread);
        if log::log_enabled!(log::Level::Debug) {
            if let Some(last) = messages.last() {
                log::debug!("ChatAgent[{}] input: {}", self.name, last.content);
            }
        }
        let reply = self.client.send_message(&messages).await?;
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("ChatAgent[{}] output: {}", self.name, reply.content);
        }
        Ok(reply.content.to_string())
    }

    /// Ask the agent for a streaming reply given the thread so far.
    ///
    /// Falls back to `None` when the underlying client does not stream; the
    /// caller is expected to degrade to [`ChatAgent::complete`].
    pub async fn stream(
        &self,
        thread: &AgentThread,
    ) -> Result<Option<MessageChunkStream>, Box<dyn Error + Send + Sync>> {
        let messages = self.compose(thread);
        self.client.send_message_stream(&messages).await
    }
}
