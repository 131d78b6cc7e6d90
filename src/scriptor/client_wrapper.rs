//! Shared primitives for provider-agnostic chat-completion clients.
//!
//! The orchestration engine talks to its three agents (reception, script,
//! explainer) exclusively through the [`ClientWrapper`] trait and the
//! lightweight data types defined in this module.  The trait abstracts over
//! concrete vendor implementations while the supporting structs describe chat
//! messages, streaming chunks, and token accounting.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use scriptor::client_wrapper::{ClientWrapper, Message, Role};
//! use scriptor::clients::openai::{Model, OpenAIClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let key = std::env::var("OPEN_AI_SECRET")?;
//!     let client = OpenAIClient::new_with_model_enum(&key, Model::GPT41Nano);
//!
//!     let response = client
//!         .send_message(&[Message {
//!             role: Role::User,
//!             content: Arc::from("Who are you?"),
//!         }])
//!         .await?;
//!
//!     println!("Assistant: {}", response.content);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (frequently mirror of a human end-user request).
    User,
    /// An assistant authored message (model responses or corrective exemplars).
    Assistant,
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Clone, Debug)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

/// Represents a generic message to be sent to an LLM.
#[derive(Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.  Stored as `Arc<str>` so that agent threads can be
    /// cheaply cloned by the orchestrator and downstream components.
    pub content: Arc<str>,
}

impl Message {
    /// Convenience constructor for a message with the given role and body.
    pub fn new(role: Role, content: impl AsRef<str>) -> Self {
        Message {
            role,
            content: Arc::from(content.as_ref()),
        }
    }
}

/// Represents a chunk of content in a streaming response.
/// Each chunk contains a delta (incremental piece) of the assistant's response.
#[derive(Clone, Debug)]
pub struct MessageChunk {
    /// The incremental content delta in this chunk.
    /// May be empty for chunks that don't contain content (e.g., finish_reason chunks).
    pub content: String,
    /// Optional finish reason mirroring the provider specific completion status (e.g. `"stop"`).
    pub finish_reason: Option<String>,
}

/// Type alias for a stream of message chunks compatible with `Send` executors.
pub type MessageChunkStream =
    Pin<Box<dyn Stream<Item = Result<MessageChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Type alias for the future returned by [`ClientWrapper::send_message_stream`].
pub type MessageStreamFuture<'a> = Pin<
    Box<
        dyn std::future::Future<
                Output = Result<Option<MessageChunkStream>, Box<dyn Error + Send + Sync>>,
            > + Send
            + 'a,
    >,
>;

/// Trait defining the interface to interact with various LLM services.
///
/// A [`ClientWrapper`] instance is responsible for translating requests into
/// the provider specific wire format and for returning provider responses in a
/// uniform shape.  The abstraction deliberately excludes any conversation
/// bookkeeping: for that functionality see
/// [`AgentThread`](crate::scriptor::agent::AgentThread).
///
/// All implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks.  Where a provider exposes token accounting
/// information, wrappers should capture it and make it visible via
/// [`ClientWrapper::get_last_usage`].
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Send a full request/response style chat completion.
    ///
    /// The `messages` slice must include any system priming messages the
    /// caller wishes to send.
    async fn send_message(
        &self,
        messages: &[Message],
    ) -> Result<Message, Box<dyn Error + Send + Sync>>;

    /// Request a streaming response from the provider.
    ///
    /// Implementors that sit in front of providers without streaming support
    /// can inherit the default implementation which simply resolves to
    /// `Ok(None)`.  A `Some(MessageChunkStream)` return value must yield
    /// [`MessageChunk`] instances that mirror the incremental tokens supplied
    /// by the upstream service.
    fn send_message_stream<'a>(&'a self, _messages: &'a [Message]) -> MessageStreamFuture<'a> {
        Box::pin(async { Ok(None) })
    }

    /// Return the identifier used to select the upstream model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;

    /// Hook to retrieve usage from the most recent [`ClientWrapper::send_message`] call.
    ///
    /// Wrappers that propagate token accounting should override [`ClientWrapper::usage_slot`].
    async fn get_last_usage(&self) -> Option<TokenUsage> {
        if let Some(slot) = self.usage_slot() {
            slot.lock().await.clone()
        } else {
            None
        }
    }

    /// Expose a shared mutable slot where the implementation can persist token usage.
    ///
    /// By default wrappers report no usage data.  Providers that expose billing
    /// information should return `Some(&Mutex<Option<TokenUsage>>)` so that
    /// [`ClientWrapper::get_last_usage`] can surface the recorded values.
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}
