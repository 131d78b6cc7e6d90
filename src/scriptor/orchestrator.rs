//! The orchestrator: public facade over the three-agent pipeline.
//!
//! A user turn flows through a small state machine:
//!
//! ```text
//! Start → BuildReady? → ReceptionDecide
//!        ReceptionDecide --answer--> EmitAnswer → End
//!        ReceptionDecide --script--> RepairLoop(attempts=0)
//!        RepairLoop --ok,result=∅--> EmitCompleted → End
//!        RepairLoop --ok,result≠∅ + skipExplainer--> EmitRaw → End
//!        RepairLoop --ok,result≠∅--> Explain → EmitExplained → End
//!        RepairLoop --fail--> EmitError → End
//! ```
//!
//! The proxy bundle is built asynchronously at construction and awaited
//! lazily before the first turn; the runner transport starts on first use.
//! Every emission appends an assistant turn to the thread.  Turns are
//! offloaded to background workers, and the streaming API delivers chunks
//! through an unbounded channel with a single reader.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scriptor::operator::CatalogBuilder;
//! use scriptor::orchestrator::OrchestratorBuilder;
//! use scriptor::clients::openai::{Model, OpenAIClient};
//!
//! # async {
//! let client = Arc::new(OpenAIClient::new_with_model_enum("key", Model::GPT41Mini));
//! let orchestrator = OrchestratorBuilder::new()
//!     .with_client(client)
//!     .with_catalog(CatalogBuilder::new().build().unwrap())
//!     .build()
//!     .unwrap();
//! let reply = orchestrator.send_message("What can you do?").await.unwrap();
//! println!("{}", reply);
//! # };
//! ```

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::scriptor::agent::{AgentThread, ChatAgent};
use crate::scriptor::client_wrapper::{ClientWrapper, Message, Role};
use crate::scriptor::config::{
    ExecutionMode, OrchestratorOptions, DEFAULT_CONTAINER_IMAGE, DEFAULT_RUNNER_EXECUTABLE,
};
use crate::scriptor::explainer;
use crate::scriptor::invocation::{
    InvocationScheduler, OperatorInvoker, PassThroughScheduler, ToolInvoker,
};
use crate::scriptor::operator::{
    BuildError, HandlePolicy, HandleTable, MethodEntry, OperatorCatalog, OperatorInstanceRef,
};
use crate::scriptor::proxy::{compose_script, ProxyBuilder, ProxyBundle};
use crate::scriptor::reception::{interpret_reply, Route, StreamingRouteDecider};
use crate::scriptor::repair::RepairLoop;
use crate::scriptor::runner::{InProcessRunner, ScriptRunner, TransportRunner};
use crate::scriptor::tool_server::{ToolServer, ToolServerRegistry};
use crate::scriptor::transport::{RemoteTransport, RunnerTransport, StdioTransport};
use crate::scriptor::validator::{KeywordValidator, ScriptValidator};

const DEFAULT_RECEPTION_INSTRUCTIONS: &str = "You are the reception agent of a task automation \
system. Decide whether the user's request needs the system's operations. If it does, reply with \
the word 'script' on the first line followed by the task restated inside <task></task> tags. If \
the request is conversational or can be answered directly, just answer it.";

const DEFAULT_SCRIPT_INSTRUCTIONS: &str = "You are the script agent of a task automation system. \
Write a short imperative script that accomplishes the task using only the operations listed \
below. Return the result as the final expression. Output only the script, no commentary.";

const DEFAULT_EXPLAINER_INSTRUCTIONS: &str = "You are the explainer agent of a task automation \
system. You receive a task and the raw result of executing it. Reply with a short, clear answer \
for the user based on that result.";

/// Which branch a turn took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRoute {
    Answer,
    Script,
}

/// Everything a turn produced.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub success: bool,
    pub route: TurnRoute,
    /// The user-facing text that was emitted.
    pub response: String,
    /// Raw JSON result of the executed script, when one ran.
    pub raw_result: Option<Value>,
    /// The last generated script body.
    pub script: Option<String>,
    /// Script-agent calls made this turn.
    pub attempts: u32,
}

/// Per-turn bookkeeping.
struct TurnContext {
    original_task: String,
    consolidated_task: Option<String>,
    direct_route_reason: Option<&'static str>,
}

/// Orchestrator-level failures.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    /// Invalid options (e.g. remote runner enabled without a URL).
    Configuration(String),
    /// The proxy bundle failed to build; script turns cannot run.
    ProxiesNotInitialized,
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OrchestratorError::ProxiesNotInitialized => write!(f, "Proxies not initialized"),
        }
    }
}

impl Error for OrchestratorError {}

enum ProxySlot {
    Building(tokio::task::JoinHandle<Result<ProxyBundle, BuildError>>),
    Ready(Arc<ProxyBundle>),
    Failed(String),
}

struct Inner {
    options: OrchestratorOptions,
    reception: Arc<ChatAgent>,
    script: Arc<ChatAgent>,
    explainer: Arc<ChatAgent>,
    handles: Arc<HandleTable>,
    operators: Arc<OperatorInvoker>,
    tool_invoker: Arc<ToolInvoker>,
    validator: Arc<dyn ScriptValidator>,
    proxy_slot: Mutex<ProxySlot>,
    runner_slot: Mutex<Option<Arc<dyn ScriptRunner>>>,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    client: Option<Arc<dyn ClientWrapper>>,
    reception_client: Option<Arc<dyn ClientWrapper>>,
    script_client: Option<Arc<dyn ClientWrapper>>,
    explainer_client: Option<Arc<dyn ClientWrapper>>,
    catalog: Option<OperatorCatalog>,
    roots: Vec<(String, OperatorInstanceRef)>,
    tool_servers: ToolServerRegistry,
    options: OrchestratorOptions,
    validator: Option<Arc<dyn ScriptValidator>>,
    scheduler: Option<Arc<dyn InvocationScheduler>>,
    method_filter: Option<Arc<dyn Fn(&MethodEntry) -> bool + Send + Sync>>,
    runner: Option<Arc<dyn ScriptRunner>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        OrchestratorBuilder {
            client: None,
            reception_client: None,
            script_client: None,
            explainer_client: None,
            catalog: None,
            roots: Vec::new(),
            tool_servers: ToolServerRegistry::new(),
            options: OrchestratorOptions::default(),
            validator: None,
            scheduler: None,
            method_filter: None,
            runner: None,
        }
    }

    /// Chat client shared by all three agents unless overridden per agent.
    pub fn with_client(mut self, client: Arc<dyn ClientWrapper>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_reception_client(mut self, client: Arc<dyn ClientWrapper>) -> Self {
        self.reception_client = Some(client);
        self
    }

    pub fn with_script_client(mut self, client: Arc<dyn ClientWrapper>) -> Self {
        self.script_client = Some(client);
        self
    }

    pub fn with_explainer_client(mut self, client: Arc<dyn ClientWrapper>) -> Self {
        self.explainer_client = Some(client);
        self
    }

    /// The frozen operator catalog for this session.
    pub fn with_catalog(mut self, catalog: OperatorCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Provide the live instance behind a self-rooted operator type.
    pub fn with_root_instance(
        mut self,
        type_name: impl Into<String>,
        instance: OperatorInstanceRef,
    ) -> Self {
        self.roots.push((type_name.into(), instance));
        self
    }

    /// Register an external tool server.
    pub fn with_tool_server(
        mut self,
        name: impl Into<String>,
        server: Arc<dyn ToolServer>,
    ) -> Self {
        self.tool_servers.register(name, server);
        self
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the default keyword validator.
    pub fn with_validator(mut self, validator: Arc<dyn ScriptValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Capture a single-threaded execution context for host invocations.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn InvocationScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Bring your own runner, bypassing the configured execution mode.
    pub fn with_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Overlay a predicate on the method cache as a filter view.
    pub fn with_method_filter(
        mut self,
        filter: Arc<dyn Fn(&MethodEntry) -> bool + Send + Sync>,
    ) -> Self {
        self.method_filter = Some(filter);
        self
    }

    /// Assemble the orchestrator and kick off the asynchronous proxy build.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        if self.options.use_remote_runner && self.options.remote_runner_base_url.is_none() {
            return Err(OrchestratorError::Configuration(
                "remote runner enabled without remote_runner_base_url".to_string(),
            ));
        }
        let client = self.client.clone().ok_or_else(|| {
            OrchestratorError::Configuration("no chat client configured".to_string())
        })?;

        let mut catalog = self.catalog.ok_or_else(|| {
            OrchestratorError::Configuration("no operator catalog configured".to_string())
        })?;
        if let Some(filter) = self.method_filter {
            catalog = catalog.with_method_filter(filter);
        }
        let catalog = Arc::new(catalog);

        // Root instances: explicit registrations first, then implicit units
        // for self-rooted descriptors the host did not bind.
        let handles = Arc::new(HandleTable::new());
        for (type_name, instance) in self.roots {
            handles.register_root(&type_name, instance);
        }
        for descriptor in catalog.descriptors() {
            if descriptor.handle_policy == HandlePolicy::SelfRooted
                && handles.get(&descriptor.type_name).is_none()
            {
                handles.register_root(&descriptor.type_name, Arc::new(()));
            }
        }

        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(PassThroughScheduler));
        let operators = Arc::new(OperatorInvoker::new(
            catalog.clone(),
            handles.clone(),
            scheduler,
        ));
        let tool_servers = Arc::new(self.tool_servers);
        let tool_invoker = Arc::new(ToolInvoker::new(tool_servers.clone()));

        let validator: Arc<dyn ScriptValidator> = match self.validator {
            Some(validator) => validator,
            None => match &self.options.forbidden_script_keywords {
                Some(keywords) => Arc::new(KeywordValidator::new(keywords.clone())),
                None => Arc::new(KeywordValidator::default_keywords()),
            },
        };

        let reception = Arc::new(ChatAgent::new(
            "reception",
            self.options
                .reception_instructions
                .clone()
                .unwrap_or_else(|| DEFAULT_RECEPTION_INSTRUCTIONS.to_string()),
            self.reception_client.unwrap_or_else(|| client.clone()),
        ));
        let script = Arc::new(ChatAgent::new(
            "script",
            self.options
                .script_instructions
                .clone()
                .unwrap_or_else(|| DEFAULT_SCRIPT_INSTRUCTIONS.to_string()),
            self.script_client.unwrap_or_else(|| client.clone()),
        ));
        let explainer = Arc::new(ChatAgent::new(
            "explainer",
            self.options
                .explainer_instructions
                .clone()
                .unwrap_or_else(|| DEFAULT_EXPLAINER_INSTRUCTIONS.to_string()),
            self.explainer_client.unwrap_or_else(|| client.clone()),
        ));

        // Proxy build starts now; the first turn awaits it.
        let build_task = tokio::spawn(ProxyBuilder::build(catalog, tool_servers));

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                options: self.options,
                reception,
                script,
                explainer,
                handles,
                operators,
                tool_invoker,
                validator,
                proxy_slot: Mutex::new(ProxySlot::Building(build_task)),
                runner_slot: Mutex::new(self.runner),
            }),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Public facade owning agents, transport lifecycle, and the turn state
/// machine.  Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// One-shot request/response for a single user message.
    pub async fn send_message(
        &self,
        user_message: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        self.send_message_with_cancel(user_message, &CancellationToken::new())
            .await
    }

    /// [`Orchestrator::send_message`] with caller-provided cancellation.
    pub async fn send_message_with_cancel(
        &self,
        user_message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let messages = vec![Message::new(Role::User, user_message)];
        Ok(self.send_detailed(&messages, cancel).await?.response)
    }

    /// Request/response over caller-supplied history.
    pub async fn send_messages(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(self.send_detailed(messages, cancel).await?.response)
    }

    /// Full turn outcome, including the raw result and attempt count.
    pub async fn send_detailed(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<OrchestrationResult, Box<dyn Error + Send + Sync>> {
        let inner = self.inner.clone();
        let thread = AgentThread::from_messages(messages);
        let cancel = cancel.clone();
        // Offload the whole turn so callers on event loops never block.
        tokio::spawn(async move { run_turn(inner, thread, cancel).await })
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> {
                format!("turn worker failed: {}", e).into()
            })?
    }

    /// Streaming variant: incremental text chunks with a single reader.
    pub fn stream_messages(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> UnboundedReceiverStream<Result<String, Box<dyn Error + Send + Sync>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        let thread = AgentThread::from_messages(messages);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_turn_streaming(inner, thread, cancel, tx.clone()).await {
                let _ = tx.send(Err(e));
            }
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Execute a script without any agent involvement.
    ///
    /// The script still runs through the validator when `validate` is set,
    /// and always through the runner.
    pub async fn execute_script_direct(
        &self,
        script: &str,
        validate: bool,
        cancel: &CancellationToken,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let bundle = self.inner.ensure_ready().await?;
        if validate {
            if let Some(rejection) = self.inner.validator.validate(script) {
                log::warn!("Validation failed: {}", rejection);
                return Err(rejection.into());
            }
        }
        let runner = self.inner.ensure_runner(&bundle).await?;
        let code = compose_script(&bundle, &self.inner.handles.live(), script);
        let value = runner.execute(&code, cancel).await?;
        Ok(value_to_text(&value))
    }

    /// Re-point execution at a remote runner, restarting the transport and
    /// failing any in-flight executions.
    pub async fn enable_remote(&self, base_url: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut slot = self.inner.runner_slot.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }
        let transport: Arc<dyn RunnerTransport> = Arc::new(RemoteTransport::new(base_url));
        let runner = Arc::new(TransportRunner::new(
            transport,
            self.inner.operators.clone(),
            self.inner.tool_invoker.clone(),
        ));
        runner.start().await?;
        *slot = Some(runner);
        log::info!("Orchestrator: execution re-pointed at remote runner {}", base_url);
        Ok(())
    }

    /// The generated signatures text, once the proxy build completes.
    pub async fn signatures(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        let bundle = self.inner.ensure_ready().await?;
        Ok(bundle.signatures_text.clone())
    }

    /// Stop the runner transport; in-flight executions fail.
    pub async fn shutdown(&self) {
        let mut slot = self.inner.runner_slot.lock().await;
        if let Some(runner) = slot.take() {
            runner.stop().await;
        }
    }
}

impl Inner {
    /// Await the proxy build exactly once and cache its outcome.
    async fn ensure_ready(&self) -> Result<Arc<ProxyBundle>, OrchestratorError> {
        let mut slot = self.proxy_slot.lock().await;
        match &*slot {
            ProxySlot::Ready(bundle) => return Ok(bundle.clone()),
            ProxySlot::Failed(_) => return Err(OrchestratorError::ProxiesNotInitialized),
            ProxySlot::Building(_) => {}
        }

        let building = std::mem::replace(
            &mut *slot,
            ProxySlot::Failed("proxy build interrupted".to_string()),
        );
        let handle = match building {
            ProxySlot::Building(handle) => handle,
            _ => unreachable!("checked above"),
        };

        match handle.await {
            Ok(Ok(bundle)) => {
                let bundle = Arc::new(bundle);
                // The signatures become prompt material for the script agent.
                if !bundle.signatures_text.is_empty() {
                    self.script.append_instructions(&format!(
                        "Available operations:\n{}",
                        bundle.signatures_text
                    ));
                }
                *slot = ProxySlot::Ready(bundle.clone());
                Ok(bundle)
            }
            Ok(Err(e)) => {
                log::error!("Proxy build failed: {}", e);
                *slot = ProxySlot::Failed(e.to_string());
                Err(OrchestratorError::ProxiesNotInitialized)
            }
            Err(e) => {
                log::error!("Proxy build task failed: {}", e);
                *slot = ProxySlot::Failed(e.to_string());
                Err(OrchestratorError::ProxiesNotInitialized)
            }
        }
    }

    /// Create (and memoize) the runner selected by configuration.
    async fn ensure_runner(
        &self,
        bundle: &Arc<ProxyBundle>,
    ) -> Result<Arc<dyn ScriptRunner>, OrchestratorError> {
        let mut slot = self.runner_slot.lock().await;
        if let Some(runner) = &*slot {
            return Ok(runner.clone());
        }

        let runner: Arc<dyn ScriptRunner> = if self.options.use_remote_runner {
            let url = self
                .options
                .remote_runner_base_url
                .as_ref()
                .ok_or_else(|| {
                    OrchestratorError::Configuration(
                        "remote runner enabled without remote_runner_base_url".to_string(),
                    )
                })?;
            Arc::new(TransportRunner::new(
                Arc::new(RemoteTransport::new(url.clone())),
                self.operators.clone(),
                self.tool_invoker.clone(),
            ))
        } else {
            match self.options.execution_mode {
                ExecutionMode::InProcess => Arc::new(InProcessRunner::new(
                    bundle.clone(),
                    self.operators.clone(),
                    self.tool_invoker.clone(),
                )),
                ExecutionMode::ExternalProcess => {
                    let program = self
                        .options
                        .runner_executable_path
                        .clone()
                        .unwrap_or_else(|| DEFAULT_RUNNER_EXECUTABLE.to_string());
                    Arc::new(TransportRunner::new(
                        Arc::new(StdioTransport::child_process(program, Vec::new())),
                        self.operators.clone(),
                        self.tool_invoker.clone(),
                    ))
                }
                ExecutionMode::Container => {
                    let image = self
                        .options
                        .container_image
                        .clone()
                        .unwrap_or_else(|| DEFAULT_CONTAINER_IMAGE.to_string());
                    Arc::new(TransportRunner::new(
                        Arc::new(StdioTransport::container(&image, &[])),
                        self.operators.clone(),
                        self.tool_invoker.clone(),
                    ))
                }
            }
        };

        *slot = Some(runner.clone());
        Ok(runner)
    }
}

/// Render a raw JSON result for the user.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One non-streaming turn through the state machine.
async fn run_turn(
    inner: Arc<Inner>,
    mut thread: AgentThread,
    cancel: CancellationToken,
) -> Result<OrchestrationResult, Box<dyn Error + Send + Sync>> {
    let bundle = inner.ensure_ready().await?;

    let original_task = thread.last_user_text().unwrap_or_default().to_string();
    let mut ctx = TurnContext {
        original_task,
        consolidated_task: None,
        direct_route_reason: None,
    };

    let route = if inner.options.skip_reception {
        log::info!("Skipping ReceptionAgent; routing directly to ScriptAgent.");
        ctx.direct_route_reason = Some("reception disabled by configuration");
        Route::Script {
            task: ctx.original_task.clone(),
            rewritten: false,
        }
    } else {
        let reply = inner.reception.complete(&thread).await?;
        interpret_reply(&reply, &ctx.original_task)
    };

    match route {
        Route::Answer(text) => {
            thread.push(Role::Assistant, &text);
            Ok(OrchestrationResult {
                success: true,
                route: TurnRoute::Answer,
                response: text,
                raw_result: None,
                script: None,
                attempts: 0,
            })
        }
        Route::Script { task, rewritten } => {
            if rewritten {
                ctx.consolidated_task = Some(task.clone());
                thread.push(Role::User, &task);
            }
            if log::log_enabled!(log::Level::Debug) {
                log::debug!(
                    "Orchestrator: script route (consolidated: {}, direct: {})",
                    ctx.consolidated_task.is_some(),
                    ctx.direct_route_reason.unwrap_or("no")
                );
            }
            let result =
                run_script_route(&inner, &bundle, &mut thread, &task, &cancel, None).await?;
            Ok(result)
        }
    }
}

/// The script half of the state machine, shared by both delivery modes.
///
/// When `chunk_sink` is present the explainer streams through it; otherwise
/// the explained text only lands in the returned result.
async fn run_script_route(
    inner: &Arc<Inner>,
    bundle: &Arc<ProxyBundle>,
    thread: &mut AgentThread,
    task: &str,
    cancel: &CancellationToken,
    chunk_sink: Option<&mpsc::UnboundedSender<Result<String, Box<dyn Error + Send + Sync>>>>,
) -> Result<OrchestrationResult, Box<dyn Error + Send + Sync>> {
    let runner = inner.ensure_runner(bundle).await?;
    let repair = RepairLoop::new(inner.options.max_fix_attempts);
    let outcome = repair
        .run(
            task,
            thread,
            &inner.script,
            bundle,
            &inner.handles,
            runner.as_ref(),
            inner.validator.as_ref(),
            cancel,
        )
        .await?;

    if !outcome.success {
        let response = outcome
            .error
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| "Task could not be executed.".to_string());
        thread.push(Role::Assistant, &response);
        if let Some(sink) = chunk_sink {
            let _ = sink.send(Ok(response.clone()));
        }
        return Ok(OrchestrationResult {
            success: false,
            route: TurnRoute::Script,
            response,
            raw_result: None,
            script: outcome.script,
            attempts: outcome.attempts,
        });
    }

    let raw = outcome.raw_result.clone().unwrap_or(Value::Null);
    let raw_text = value_to_text(&raw);

    let response = if raw_text.trim().is_empty() {
        let completed = "Task completed.".to_string();
        if let Some(sink) = chunk_sink {
            let _ = sink.send(Ok(completed.clone()));
        }
        completed
    } else if inner.options.skip_explainer {
        if let Some(sink) = chunk_sink {
            let _ = sink.send(Ok(raw_text.clone()));
        }
        raw_text.clone()
    } else {
        match chunk_sink {
            Some(sink) => {
                // Bridge the explainer's plain-text stream into the turn's
                // chunk channel.
                let (text_tx, mut text_rx) = mpsc::unbounded_channel::<String>();
                let sink = sink.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(text) = text_rx.recv().await {
                        let _ = sink.send(Ok(text));
                    }
                });
                let explained =
                    explainer::explain_stream(&inner.explainer, thread, task, &raw_text, &text_tx)
                        .await;
                drop(text_tx);
                let _ = forwarder.await;
                explained?
            }
            None => explainer::explain(&inner.explainer, thread, task, &raw_text).await?,
        }
    };

    thread.push(Role::Assistant, &response);
    Ok(OrchestrationResult {
        success: true,
        route: TurnRoute::Script,
        response,
        raw_result: Some(raw),
        script: outcome.script,
        attempts: outcome.attempts,
    })
}

/// One streaming turn: routed tokens flow to the chunk channel as soon as
/// the route is decided; the thread gets its assistant turn after the stream
/// completes.
async fn run_turn_streaming(
    inner: Arc<Inner>,
    mut thread: AgentThread,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Result<String, Box<dyn Error + Send + Sync>>>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let bundle = inner.ensure_ready().await?;
    let original_task = thread.last_user_text().unwrap_or_default().to_string();

    let route = if inner.options.skip_reception {
        log::info!("Skipping ReceptionAgent; routing directly to ScriptAgent.");
        Route::Script {
            task: original_task.clone(),
            rewritten: false,
        }
    } else {
        stream_reception(&inner, &thread, &original_task, &cancel, &tx).await?
    };

    match route {
        Route::Answer(text) => {
            // Chunks were already delivered while streaming; close the turn.
            thread.push(Role::Assistant, &text);
            Ok(())
        }
        Route::Script { task, rewritten } => {
            if rewritten {
                thread.push(Role::User, &task);
            }
            run_script_route(&inner, &bundle, &mut thread, &task, &cancel, Some(&tx)).await?;
            Ok(())
        }
    }
}

/// Drive the reception agent token by token, leaking nothing until the route
/// is decided.
async fn stream_reception(
    inner: &Arc<Inner>,
    thread: &AgentThread,
    original_task: &str,
    cancel: &CancellationToken,
    tx: &mpsc::UnboundedSender<Result<String, Box<dyn Error + Send + Sync>>>,
) -> Result<Route, Box<dyn Error + Send + Sync>> {
    use futures_util::StreamExt;

    match inner.reception.stream(thread).await? {
        Some(mut chunks) => {
            let mut decider = StreamingRouteDecider::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Box::new(crate::scriptor::dispatcher::RunnerError::Cancelled));
                    }
                    next = chunks.next() => match next {
                        Some(chunk) => {
                            let chunk = chunk?;
                            if chunk.content.is_empty() {
                                continue;
                            }
                            if let Some(visible) = decider.push(&chunk.content) {
                                let _ = tx.send(Ok(visible));
                            }
                        }
                        None => break,
                    }
                }
            }
            let (route, leftover) = decider.finish(original_task);
            if let Some(text) = leftover {
                let _ = tx.send(Ok(text));
            }
            Ok(route)
        }
        None => {
            // Client cannot stream; fall back to a full completion and emit
            // answers as one chunk.
            let reply = inner.reception.complete(thread).await?;
            let route = interpret_reply(&reply, original_task);
            if let Route::Answer(text) = &route {
                let _ = tx.send(Ok(text.clone()));
            }
            Ok(route)
        }
    }
}
