//! Script runners.
//!
//! A [`ScriptRunner`] executes one composed script (generated prelude plus
//! user body) and yields the raw JSON result.  Two families exist:
//!
//! - [`TransportRunner`] drives a runner process over a
//!   [`RunnerTransport`]: it owns the receive-side demultiplexer that
//!   completes pending executions, answers `invoke-request` /
//!   `mcp-invoke-request` callbacks concurrently, and fans transport closes
//!   into every waiting execution.
//! - [`InProcessRunner`] evaluates scripts inside the host process with the
//!   embedded `evalexpr` engine — no transport, direct function calls.  Host
//!   operator calls surface as `invoke(target, method, [handle,] args...)`
//!   and tool calls as `invoke_tool(server, tool, json_args)`.  The script
//!   dialect of this mode is whatever `evalexpr` accepts.

use std::sync::Arc;

use async_trait::async_trait;
use evalexpr::{
    eval_with_context_mut, ContextWithMutableFunctions, ContextWithMutableVariables,
    EvalexprError, Function, HashMapContext, Value as EvalValue,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::scriptor::dispatcher::{ExecutionDispatcher, RunnerError};
use crate::scriptor::invocation::{OperatorInvoker, ToolInvoker};
use crate::scriptor::protocol::{self, Decoded, RunnerMessage};
use crate::scriptor::proxy::ProxyBundle;
use crate::scriptor::transport::{RunnerTransport, TransportError, TransportEvent};

/// Executes composed scripts and returns their raw result.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn execute(&self, code: &str, cancel: &CancellationToken)
        -> Result<Value, RunnerError>;

    /// Tear down any underlying transport.  In-process runners have nothing
    /// to stop.
    async fn stop(&self) {}
}

// ---------------------------------------------------------------------------
// Transport-backed runner
// ---------------------------------------------------------------------------

/// Runner reached through a wire transport.
pub struct TransportRunner {
    transport: Arc<dyn RunnerTransport>,
    dispatcher: Arc<ExecutionDispatcher>,
    operators: Arc<OperatorInvoker>,
    tools: Arc<ToolInvoker>,
}

impl TransportRunner {
    pub fn new(
        transport: Arc<dyn RunnerTransport>,
        operators: Arc<OperatorInvoker>,
        tools: Arc<ToolInvoker>,
    ) -> Self {
        TransportRunner {
            transport,
            dispatcher: Arc::new(ExecutionDispatcher::new()),
            operators,
            tools,
        }
    }

    pub fn dispatcher(&self) -> &Arc<ExecutionDispatcher> {
        &self.dispatcher
    }

    /// Start the transport and the receive-side demultiplexer.
    ///
    /// Idempotent: when the transport is already running nothing changes.
    pub async fn start(&self) -> Result<(), RunnerError> {
        match self.transport.start().await {
            Ok(Some(events)) => {
                tokio::spawn(receive_loop(
                    events,
                    self.transport.clone(),
                    self.dispatcher.clone(),
                    self.operators.clone(),
                    self.tools.clone(),
                ));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(RunnerError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl ScriptRunner for TransportRunner {
    async fn execute(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, RunnerError> {
        self.start().await?;
        let transport = self.transport.clone();
        self.dispatcher
            .dispatch(
                code.to_string(),
                move |message| {
                    Box::pin(async move {
                        let line = protocol::encode_line(&message)
                            .map_err(|e| TransportError::Failed(e.to_string()))?;
                        transport.send_line(line).await
                    })
                },
                cancel,
            )
            .await
    }

    async fn stop(&self) {
        self.transport.stop().await;
        self.dispatcher.fail_all("transport stopped");
    }
}

/// Receive-side demultiplexer.
///
/// `exec-result` frames complete pending dispatcher slots inline; invoke
/// callbacks are handled on spawned tasks so a running script can issue
/// parallel host calls without deadlocking against its own result.
async fn receive_loop(
    mut events: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    transport: Arc<dyn RunnerTransport>,
    dispatcher: Arc<ExecutionDispatcher>,
    operators: Arc<OperatorInvoker>,
    tools: Arc<ToolInvoker>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Line(line) => {
                handle_line(&line, &transport, &dispatcher, &operators, &tools);
            }
            TransportEvent::Closed(reason) => {
                dispatcher.fail_all(&reason);
                return;
            }
        }
    }
    // Event stream ended without an explicit close.
    dispatcher.fail_all("transport event stream ended");
}

fn handle_line(
    line: &str,
    transport: &Arc<dyn RunnerTransport>,
    dispatcher: &Arc<ExecutionDispatcher>,
    operators: &Arc<OperatorInvoker>,
    tools: &Arc<ToolInvoker>,
) {
    match protocol::decode_line(line) {
        Ok(Decoded::Empty) => {}
        Ok(Decoded::Unknown(kind)) => {
            log::warn!("runner protocol: ignoring unknown frame kind '{}'", kind);
        }
        Err(e) => {
            // Malformed frames are logged; the session continues.
            log::error!("runner protocol: {} (line: {})", e, line);
        }
        Ok(Decoded::Message(message)) => match message {
            RunnerMessage::Log {
                level,
                message,
                exception,
                source,
            } => {
                protocol::forward_log(&level, &message, exception.as_deref(), source.as_deref());
            }
            RunnerMessage::ExecResult { id, result, error } => {
                let completion = match error {
                    Some(error) => Err(RunnerError::Execution(error)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                if !dispatcher.complete(&id, completion) {
                    log::debug!("runner protocol: exec-result for unknown id {}", id);
                }
            }
            RunnerMessage::InvokeRequest {
                id,
                target,
                method,
                handle_id,
                args,
            } => {
                let transport = transport.clone();
                let operators = operators.clone();
                tokio::spawn(async move {
                    let outcome = operators
                        .invoke(&target, &method, handle_id.as_deref(), args)
                        .await;
                    reply_invoke(&transport, id, outcome.map_err(|e| e.to_string())).await;
                });
            }
            RunnerMessage::McpInvokeRequest {
                id,
                server,
                tool,
                arguments,
            } => {
                let transport = transport.clone();
                let tools = tools.clone();
                tokio::spawn(async move {
                    let outcome = tools.invoke(&server, &tool, arguments).await;
                    reply_invoke(&transport, id, outcome.map_err(|e| e.to_string())).await;
                });
            }
            RunnerMessage::ExecRequest { id, .. } | RunnerMessage::InvokeResult { id, .. } => {
                log::warn!(
                    "runner protocol: ignoring client-bound frame arriving inbound (id {})",
                    id
                );
            }
        },
    }
}

async fn reply_invoke(
    transport: &Arc<dyn RunnerTransport>,
    id: String,
    outcome: Result<Value, String>,
) {
    let reply = match outcome {
        Ok(result) => RunnerMessage::InvokeResult {
            id,
            result: Some(result),
            error: None,
        },
        Err(error) => RunnerMessage::InvokeResult {
            id,
            result: None,
            error: Some(error),
        },
    };
    match protocol::encode_line(&reply) {
        Ok(line) => {
            if let Err(e) = transport.send_line(line).await {
                log::warn!("runner protocol: failed to deliver invoke-result: {}", e);
            }
        }
        Err(e) => log::error!("runner protocol: {}", e),
    }
}

// ---------------------------------------------------------------------------
// In-process runner
// ---------------------------------------------------------------------------

/// Embedded evaluator used by the in-process execution mode.
pub struct InProcessRunner {
    bundle: Arc<ProxyBundle>,
    operators: Arc<OperatorInvoker>,
    tools: Arc<ToolInvoker>,
}

impl InProcessRunner {
    pub fn new(
        bundle: Arc<ProxyBundle>,
        operators: Arc<OperatorInvoker>,
        tools: Arc<ToolInvoker>,
    ) -> Self {
        InProcessRunner {
            bundle,
            operators,
            tools,
        }
    }

    /// Split a composed script into handle bindings and the user body.
    ///
    /// The generated prelude is recognized by prefix (it is foreign dialect
    /// the evaluator does not parse); the auto-generated instance
    /// declarations that follow it become variable bindings, one per live
    /// instance.
    fn split_composed<'a>(&self, code: &'a str) -> (Vec<(String, String)>, &'a str) {
        let rest = code
            .strip_prefix(self.bundle.runtime_text.as_str())
            .unwrap_or(code);

        let mut bindings = Vec::new();
        let mut offset = 0;
        for line in rest.split_inclusive('\n') {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                offset += line.len();
                continue;
            }
            match parse_declaration(trimmed) {
                Some(binding) => {
                    bindings.push(binding);
                    offset += line.len();
                }
                None => break,
            }
        }
        (bindings, &rest[offset..])
    }
}

/// Parse `<Type> <name> = new <Type>("<handle>");` / `… = new <Type>();`.
fn parse_declaration(line: &str) -> Option<(String, String)> {
    let line = line.strip_suffix(';')?;
    let (left, right) = {
        let mut parts = line.splitn(2, '=');
        (parts.next()?.trim(), parts.next()?.trim())
    };
    let mut left_parts = left.split_whitespace();
    let type_name = left_parts.next()?;
    let var_name = left_parts.next()?;
    if left_parts.next().is_some() {
        return None;
    }

    let ctor = right.strip_prefix("new ")?.trim();
    let open = ctor.find('(')?;
    if &ctor[..open] != type_name || !ctor.ends_with(')') {
        return None;
    }
    let inner = &ctor[open + 1..ctor.len() - 1];
    let handle = if inner.is_empty() {
        // Parameterless construction binds the root handle.
        type_name.to_string()
    } else {
        inner.trim_matches('"').to_string()
    };
    Some((var_name.to_string(), handle))
}

fn eval_to_json(value: &EvalValue) -> Value {
    match value {
        EvalValue::String(s) => Value::String(s.clone()),
        EvalValue::Int(i) => Value::from(*i),
        EvalValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        EvalValue::Boolean(b) => Value::Bool(*b),
        EvalValue::Tuple(items) => Value::Array(items.iter().map(eval_to_json).collect()),
        EvalValue::Empty => Value::Null,
    }
}

fn json_to_eval(value: &Value) -> EvalValue {
    match value {
        Value::Null => EvalValue::Empty,
        Value::Bool(b) => EvalValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                EvalValue::Int(i)
            } else {
                EvalValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => EvalValue::String(s.clone()),
        Value::Array(items) => EvalValue::Tuple(items.iter().map(json_to_eval).collect()),
        // The expression dialect has no maps; objects travel as JSON text.
        Value::Object(_) => EvalValue::String(value.to_string()),
    }
}

fn flatten_arguments(argument: &EvalValue) -> Vec<EvalValue> {
    match argument {
        EvalValue::Tuple(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn expect_string(value: &EvalValue, what: &str) -> Result<String, EvalexprError> {
    match value {
        EvalValue::String(s) => Ok(s.clone()),
        other => Err(EvalexprError::CustomMessage(format!(
            "{} must be a string, got {:?}",
            what, other
        ))),
    }
}

#[async_trait]
impl ScriptRunner for InProcessRunner {
    async fn execute(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, RunnerError> {
        let (bindings, body) = self.split_composed(code);
        let body = body.trim().to_string();

        let operators = self.operators.clone();
        let tools = self.tools.clone();
        let catalog = self.bundle.method_cache().clone();
        let runtime = tokio::runtime::Handle::current();

        let evaluation = tokio::task::spawn_blocking(move || {
            let mut context: HashMapContext = HashMapContext::new();

            for (name, handle) in bindings {
                context
                    .set_value(name, EvalValue::String(handle))
                    .map_err(|e| format!("binding failed: {}", e))?;
            }

            // invoke(target, method, [handle,] args...); whether a handle is
            // expected follows from the target's handle policy.
            {
                let operators = operators.clone();
                let catalog = catalog.clone();
                let runtime = runtime.clone();
                context
                    .set_function(
                        "invoke".to_string(),
                        Function::new(move |argument| {
                            let parts = flatten_arguments(argument);
                            if parts.len() < 2 {
                                return Err(EvalexprError::CustomMessage(
                                    "invoke needs a target and a method".to_string(),
                                ));
                            }
                            let target = expect_string(&parts[0], "target")?;
                            let method = expect_string(&parts[1], "method")?;

                            let is_static = catalog
                                .descriptor(&target)
                                .map(|d| {
                                    d.handle_policy
                                        == crate::scriptor::operator::HandlePolicy::Static
                                })
                                .unwrap_or(true);

                            let (handle, rest) = if is_static {
                                (None, &parts[2..])
                            } else {
                                if parts.len() < 3 {
                                    return Err(EvalexprError::CustomMessage(format!(
                                        "invoke on instance operator {} needs a handle",
                                        target
                                    )));
                                }
                                (Some(expect_string(&parts[2], "handle")?), &parts[3..])
                            };

                            let args: Vec<Value> = rest.iter().map(eval_to_json).collect();
                            let invocation = operators.invoke(
                                &target,
                                &method,
                                handle.as_deref(),
                                args,
                            );
                            match runtime.block_on(invocation) {
                                Ok(result) => Ok(json_to_eval(&result)),
                                Err(e) => Err(EvalexprError::CustomMessage(e.to_string())),
                            }
                        }),
                    )
                    .map_err(|e| format!("context setup failed: {}", e))?;
            }

            // invoke_tool(server, tool, json_args)
            {
                let tools = tools.clone();
                let runtime = runtime.clone();
                context
                    .set_function(
                        "invoke_tool".to_string(),
                        Function::new(move |argument| {
                            let parts = flatten_arguments(argument);
                            if parts.len() != 3 {
                                return Err(EvalexprError::CustomMessage(
                                    "invoke_tool needs a server, a tool, and a JSON argument object"
                                        .to_string(),
                                ));
                            }
                            let server = expect_string(&parts[0], "server")?;
                            let tool = expect_string(&parts[1], "tool")?;
                            let raw = expect_string(&parts[2], "arguments")?;
                            let arguments = match serde_json::from_str::<Value>(&raw) {
                                Ok(Value::Object(map)) => map,
                                _ => {
                                    return Err(EvalexprError::CustomMessage(
                                        "arguments must be a JSON object string".to_string(),
                                    ))
                                }
                            };
                            match runtime.block_on(tools.invoke(&server, &tool, arguments)) {
                                Ok(result) => Ok(json_to_eval(&result)),
                                Err(e) => Err(EvalexprError::CustomMessage(e.to_string())),
                            }
                        }),
                    )
                    .map_err(|e| format!("context setup failed: {}", e))?;
            }

            eval_with_context_mut(&body, &mut context)
                .map(|value| eval_to_json(&value))
                .map_err(|e| e.to_string())
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
            joined = evaluation => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(RunnerError::Execution(message)),
                Err(e) => Err(RunnerError::Execution(format!("evaluation panicked: {}", e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scriptor::invocation::PassThroughScheduler;
    use crate::scriptor::operator::{
        CatalogBuilder, HandleTable, InvokeOutcome, MethodEntry, OperatorDescriptor, ParamKind,
    };
    use crate::scriptor::proxy::{compose_script, ProxyBuilder};
    use crate::scriptor::tool_server::{ToolServerRegistry, ToolSpec};
    use crate::scriptor::tool_servers::LocalToolServer;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn math_catalog() -> Arc<crate::scriptor::operator::OperatorCatalog> {
        let mut builder = CatalogBuilder::new();
        builder
            .operator(
                OperatorDescriptor::static_facade("Math").method(
                    MethodEntry::new(
                        "Add",
                        &[("a", ParamKind::Integer), ("b", ParamKind::Integer)],
                    )
                    .returns(ParamKind::Integer)
                    .handler(Arc::new(|_recv, args| {
                        Box::pin(async move {
                            let a = args[0].as_i64().unwrap_or(0);
                            let b = args[1].as_i64().unwrap_or(0);
                            Ok(InvokeOutcome::Value(json!(a + b)))
                        })
                    })),
                ),
            )
            .unwrap();
        builder
            .operator(
                OperatorDescriptor::self_rooted("Store").method(
                    MethodEntry::new("Describe", &[])
                        .returns(ParamKind::String)
                        .handler(Arc::new(|recv, _args| {
                            Box::pin(async move {
                                let label = recv
                                    .and_then(|r| r.downcast::<String>().ok())
                                    .map(|s| s.as_ref().clone())
                                    .unwrap_or_default();
                                Ok(InvokeOutcome::Value(json!(label)))
                            })
                        })),
                ),
            )
            .unwrap();
        Arc::new(builder.build().unwrap())
    }

    async fn in_process_runner() -> (InProcessRunner, Arc<ProxyBundle>) {
        let catalog = math_catalog();
        let handles = Arc::new(HandleTable::new());
        handles.register_root("Store", Arc::new("a labeled store".to_string()));

        let mut registry = ToolServerRegistry::new();
        let local = LocalToolServer::new();
        local.register_fn(ToolSpec::new("shout", "Uppercases text"), |args| {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(json!(text.to_uppercase()))
        });
        registry.register("local", Arc::new(local));
        let registry = Arc::new(registry);

        let bundle = Arc::new(
            ProxyBuilder::build(catalog.clone(), registry.clone())
                .await
                .unwrap(),
        );
        let operators = Arc::new(OperatorInvoker::new(
            catalog,
            handles,
            Arc::new(PassThroughScheduler),
        ));
        let tools = Arc::new(ToolInvoker::new(registry));
        (
            InProcessRunner::new(bundle.clone(), operators, tools),
            bundle,
        )
    }

    #[test]
    fn declaration_lines_parse_into_bindings() {
        assert_eq!(
            parse_declaration("SimpleOperator simpleoperator = new SimpleOperator(\"h-1\");"),
            Some(("simpleoperator".to_string(), "h-1".to_string()))
        );
        assert_eq!(
            parse_declaration("Store store = new Store();"),
            Some(("store".to_string(), "Store".to_string()))
        );
        assert_eq!(parse_declaration("return store.Describe();"), None);
        assert_eq!(parse_declaration("Store store = new Other(\"x\");"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn evaluates_static_operator_calls() {
        let (runner, _bundle) = in_process_runner().await;
        let cancel = CancellationToken::new();
        let result = runner
            .execute("invoke(\"Math\", \"Add\", 2, 3)", &cancel)
            .await
            .unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn composed_prelude_binds_instance_handles() {
        let (runner, bundle) = in_process_runner().await;
        let cancel = CancellationToken::new();
        let live = vec![("Store".to_string(), "Store".to_string())];
        let code = compose_script(&bundle, &live, "invoke(\"Store\", \"Describe\", store)");
        let result = runner.execute(&code, &cancel).await.unwrap();
        assert_eq!(result, json!("a labeled store"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tool_calls_run_through_the_registry() {
        let (runner, _bundle) = in_process_runner().await;
        let cancel = CancellationToken::new();
        let result = runner
            .execute(
                "invoke_tool(\"local\", \"shout\", \"{\\\"text\\\": \\\"quiet\\\"}\")",
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(result, json!("QUIET"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn evaluation_errors_surface_as_runner_errors() {
        let (runner, _bundle) = in_process_runner().await;
        let cancel = CancellationToken::new();
        let err = runner
            .execute("invoke(\"Math\", \"Missing\", 1)", &cancel)
            .await
            .unwrap_err();
        match err {
            RunnerError::Execution(message) => assert!(message.contains("Method not found")),
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    // -- transport runner demux ------------------------------------------------

    struct ScriptedTransport {
        events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<TransportEvent>, Arc<Mutex<Vec<String>>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Arc::new(ScriptedTransport {
                    events: Mutex::new(Some(rx)),
                    sent: sent.clone(),
                }),
                tx,
                sent,
            )
        }
    }

    #[async_trait]
    impl RunnerTransport for ScriptedTransport {
        async fn start(
            &self,
        ) -> Result<Option<mpsc::UnboundedReceiver<TransportEvent>>, TransportError> {
            Ok(self.events.lock().unwrap().take())
        }

        async fn stop(&self) {}

        async fn send_line(&self, line: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(line);
            Ok(())
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn transport_runner(
        transport: Arc<ScriptedTransport>,
    ) -> TransportRunner {
        let catalog = math_catalog();
        let handles = Arc::new(HandleTable::new());
        let operators = Arc::new(OperatorInvoker::new(
            catalog,
            handles,
            Arc::new(PassThroughScheduler),
        ));
        let tools = Arc::new(ToolInvoker::new(Arc::new(ToolServerRegistry::new())));
        TransportRunner::new(transport, operators, tools)
    }

    #[tokio::test]
    async fn exec_round_trip_through_the_demux() {
        let (transport, feed, sent) = ScriptedTransport::new();
        let runner = Arc::new(transport_runner(transport));
        runner.start().await.unwrap();

        let cancel = CancellationToken::new();
        let execution = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.execute("return 1;", &cancel).await })
        };

        // Pick the id off the sent exec-request and answer it.
        let request = loop {
            if let Some(line) = sent.lock().unwrap().first().cloned() {
                break line;
            }
            tokio::task::yield_now().await;
        };
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed["type"], "exec-request");
        let id = parsed["id"].as_str().unwrap().to_string();

        feed.send(TransportEvent::Line(format!(
            "{{\"type\":\"exec-result\",\"id\":\"{}\",\"result\":7}}",
            id
        )))
        .unwrap();

        let value = execution.await.unwrap().unwrap();
        assert_eq!(value, json!(7));
    }

    #[tokio::test]
    async fn invoke_requests_are_answered_with_invoke_results() {
        let (transport, feed, sent) = ScriptedTransport::new();
        let runner = transport_runner(transport);
        runner.start().await.unwrap();

        feed.send(TransportEvent::Line(
            r#"{"type":"invoke-request","id":"inv-1","target":"Math","method":"Add","args":[20,22]}"#
                .to_string(),
        ))
        .unwrap();

        let reply = loop {
            if let Some(line) = sent.lock().unwrap().first().cloned() {
                break line;
            }
            tokio::task::yield_now().await;
        };
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["type"], "invoke-result");
        assert_eq!(parsed["id"], "inv-1");
        assert_eq!(parsed["result"], json!(42));
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_do_not_kill_the_session() {
        let (transport, feed, sent) = ScriptedTransport::new();
        let runner = transport_runner(transport);
        runner.start().await.unwrap();

        feed.send(TransportEvent::Line("{broken".to_string())).unwrap();
        feed.send(TransportEvent::Line(
            r#"{"type":"telemetry","id":"x"}"#.to_string(),
        ))
        .unwrap();
        feed.send(TransportEvent::Line(
            r#"{"type":"invoke-request","id":"inv-2","target":"Math","method":"Add","args":[1,1]}"#
                .to_string(),
        ))
        .unwrap();

        let reply = loop {
            if let Some(line) = sent.lock().unwrap().first().cloned() {
                break line;
            }
            tokio::task::yield_now().await;
        };
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["result"], json!(2));
    }

    #[tokio::test]
    async fn transport_close_fails_the_waiting_execution() {
        let (transport, feed, _sent) = ScriptedTransport::new();
        let runner = Arc::new(transport_runner(transport));
        runner.start().await.unwrap();

        let cancel = CancellationToken::new();
        let execution = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.execute("return 1;", &cancel).await })
        };
        while runner.dispatcher().pending_count() < 1 {
            tokio::task::yield_now().await;
        }

        feed.send(TransportEvent::Closed("peer went away".to_string()))
            .unwrap();

        match execution.await.unwrap() {
            Err(RunnerError::Transport(reason)) => assert!(reason.contains("peer went away")),
            other => panic!("expected transport error, got {:?}", other),
        }
    }
}
