use std::collections::VecDeque;
use std::error::Error;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use scriptor::client_wrapper::{
    ClientWrapper, Message, MessageChunk, MessageChunkStream, MessageStreamFuture, Role,
};
use scriptor::config::OrchestratorOptions;
use scriptor::dispatcher::RunnerError;
use scriptor::operator::CatalogBuilder;
use scriptor::orchestrator::{OrchestratorBuilder, TurnRoute};
use scriptor::runner::ScriptRunner;

struct ScriptedClient {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedClient {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(ScriptedClient {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn send_message(
        &self,
        messages: &[Message],
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(Message::new(Role::Assistant, reply))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Streams a fixed reply one character at a time.
struct CharStreamClient {
    reply: String,
}

#[async_trait]
impl ClientWrapper for CharStreamClient {
    async fn send_message(
        &self,
        _messages: &[Message],
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        Ok(Message::new(Role::Assistant, self.reply.as_str()))
    }

    fn send_message_stream<'a>(&'a self, _messages: &'a [Message]) -> MessageStreamFuture<'a> {
        let chunks: Vec<String> = self.reply.chars().map(|c| c.to_string()).collect();
        Box::pin(async move {
            let stream = futures_util::stream::iter(chunks.into_iter().map(|content| {
                Ok::<MessageChunk, Box<dyn Error + Send + Sync>>(MessageChunk {
                    content,
                    finish_reason: None,
                })
            }));
            Ok(Some(Box::pin(stream) as MessageChunkStream))
        })
    }

    fn model_name(&self) -> &str {
        "char-stream"
    }
}

struct MockRunner {
    outcomes: Mutex<VecDeque<Result<Value, RunnerError>>>,
    executed: Mutex<Vec<String>>,
}

impl MockRunner {
    fn new(outcomes: Vec<Result<Value, RunnerError>>) -> Arc<Self> {
        Arc::new(MockRunner {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            executed: Mutex::new(Vec::new()),
        })
    }

    fn executions(&self) -> usize {
        self.executed.lock().unwrap().len()
    }
}

#[async_trait]
impl ScriptRunner for MockRunner {
    async fn execute(
        &self,
        code: &str,
        _cancel: &CancellationToken,
    ) -> Result<Value, RunnerError> {
        self.executed.lock().unwrap().push(code.to_string());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Value::Null))
    }
}

#[tokio::test]
async fn answer_replies_are_emitted_and_never_executed() {
    let reception = ScriptedClient::new(&["The capital of France is Paris."]);
    let runner = MockRunner::new(vec![]);

    let orchestrator = OrchestratorBuilder::new()
        .with_client(ScriptedClient::new(&[]))
        .with_reception_client(reception.clone())
        .with_catalog(CatalogBuilder::new().build().unwrap())
        .with_runner(runner.clone())
        .build()
        .unwrap();

    let result = orchestrator
        .send_detailed(
            &[Message::new(Role::User, "What's the capital of France?")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.route, TurnRoute::Answer);
    assert_eq!(result.response, "The capital of France is Paris.");
    assert_eq!(runner.executions(), 0);
}

#[tokio::test]
async fn disabled_reception_always_takes_the_script_route() {
    let reception = ScriptedClient::new(&["this would be an answer"]);
    let script = ScriptedClient::new(&["return 1;", "return 2;"]);
    let runner = MockRunner::new(vec![Ok(json!(1)), Ok(json!(2))]);

    let orchestrator = OrchestratorBuilder::new()
        .with_client(ScriptedClient::new(&[]))
        .with_reception_client(reception.clone())
        .with_script_client(script.clone())
        .with_catalog(CatalogBuilder::new().build().unwrap())
        .with_runner(runner.clone())
        .with_options(OrchestratorOptions {
            skip_reception: true,
            skip_explainer: true,
            ..OrchestratorOptions::default()
        })
        .build()
        .unwrap();

    for expected in &["1", "2"] {
        let result = orchestrator
            .send_detailed(
                &[Message::new(Role::User, "do something")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.route, TurnRoute::Script);
        assert_eq!(&result.response, expected);
    }

    // The reception agent was never consulted.
    assert_eq!(reception.calls(), 0);
    assert_eq!(runner.executions(), 2);
}

#[tokio::test]
async fn script_reply_without_task_block_keeps_the_original_task() {
    let reception = ScriptedClient::new(&["script"]);
    let script = ScriptedClient::new(&["return 42;"]);
    let runner = MockRunner::new(vec![Ok(json!(42))]);

    let orchestrator = OrchestratorBuilder::new()
        .with_client(ScriptedClient::new(&[]))
        .with_reception_client(reception)
        .with_script_client(script.clone())
        .with_catalog(CatalogBuilder::new().build().unwrap())
        .with_runner(runner)
        .with_options(OrchestratorOptions {
            skip_explainer: true,
            ..OrchestratorOptions::default()
        })
        .build()
        .unwrap();

    let result = orchestrator
        .send_detailed(
            &[Message::new(Role::User, "add the numbers")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.response, "42");

    // The script agent still saw the original user task.
    let requests = script.requests.lock().unwrap();
    let saw_task = requests[0]
        .iter()
        .any(|m| m.role == Role::User && m.content.as_ref() == "add the numbers");
    assert!(saw_task);
}

#[tokio::test]
async fn streamed_routing_keyword_never_reaches_the_user() {
    let script = ScriptedClient::new(&["return \"done\";"]);
    let runner = MockRunner::new(vec![Ok(json!("done"))]);

    let orchestrator = OrchestratorBuilder::new()
        .with_client(ScriptedClient::new(&[]))
        .with_reception_client(Arc::new(CharStreamClient {
            reply: "script\n<task>do the thing</task>".to_string(),
        }))
        .with_script_client(script)
        .with_catalog(CatalogBuilder::new().build().unwrap())
        .with_runner(runner)
        .with_options(OrchestratorOptions {
            skip_explainer: true,
            ..OrchestratorOptions::default()
        })
        .build()
        .unwrap();

    let mut stream = orchestrator.stream_messages(
        &[Message::new(Role::User, "do the thing")],
        &CancellationToken::new(),
    );

    let mut chunks = Vec::new();
    while let Some(item) = stream.next().await {
        chunks.push(item.unwrap());
    }

    // The only visible output is the script result; no fragment of the
    // routing keyword leaked.
    assert_eq!(chunks, vec!["done".to_string()]);
}

#[tokio::test]
async fn streamed_answers_pass_through_verbatim() {
    let orchestrator = OrchestratorBuilder::new()
        .with_client(ScriptedClient::new(&[]))
        .with_reception_client(Arc::new(CharStreamClient {
            reply: "Salt dissolves in water.".to_string(),
        }))
        .with_catalog(CatalogBuilder::new().build().unwrap())
        .with_runner(MockRunner::new(vec![]))
        .build()
        .unwrap();

    let mut stream = orchestrator.stream_messages(
        &[Message::new(Role::User, "does salt dissolve?")],
        &CancellationToken::new(),
    );

    let mut text = String::new();
    while let Some(item) = stream.next().await {
        text.push_str(&item.unwrap());
    }
    assert_eq!(text, "Salt dissolves in water.");
}
