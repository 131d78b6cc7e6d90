//! Invocation pipeline: operator and tool invokers.
//!
//! While a script is running it calls back into the host through
//! `invoke-request` (operator methods) and `mcp-invoke-request` (external
//! tools).  Both paths land here: the [`OperatorInvoker`] resolves
//! `(type, method, arity)` against the catalog, coerces JSON arguments into
//! the declared parameter shapes, resolves the receiver through the handle
//! table, and runs the host implementation; the [`ToolInvoker`] forwards
//! `(server, tool, named args)` to the registered tool server client.
//!
//! Where the invocation actually runs is a capability: the default
//! [`PassThroughScheduler`] executes inline on whatever worker dispatched the
//! frame, while the [`AffinityScheduler`] queues work onto a captured
//! single-threaded context for hosts that require it, executing reentrant
//! calls inline to avoid deadlock.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::scriptor::operator::{
    HandlePolicy, InvokeOutcome, MethodFuture, OperatorCatalog, HandleTable, ParamKind,
};
use crate::scriptor::tool_server::ToolServerRegistry;

/// Errors produced by the invocation pipeline.
///
/// The rendered text is what travels back to the runner in the `error` field
/// of an `invoke-result`.
#[derive(Debug, Clone)]
pub enum InvokeError {
    /// No operator descriptor with the requested type name.
    TypeNotFound(String),
    /// `(type, method, arity)` missed the method cache.
    MethodNotFound {
        type_name: String,
        method: String,
        arity: usize,
    },
    /// An instance method was called without a handle.
    MissingHandle { type_name: String, method: String },
    /// The supplied handle resolves to no live instance.
    UnknownHandle(String),
    /// An argument could not be coerced into its declared shape.
    Argument(String),
    /// The host implementation failed.
    Execution(String),
    /// Tool-server lookup or execution failed.
    Tool(String),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::TypeNotFound(name) => write!(f, "Operator type not found: {}", name),
            InvokeError::MethodNotFound {
                type_name,
                method,
                arity,
            } => write!(
                f,
                "Method not found: {}.{} with {} argument(s)",
                type_name, method, arity
            ),
            InvokeError::MissingHandle { type_name, method } => write!(
                f,
                "Instance method {}.{} requires a handle",
                type_name, method
            ),
            InvokeError::UnknownHandle(handle) => write!(f, "Unknown handle: {}", handle),
            InvokeError::Argument(msg) => write!(f, "Argument error: {}", msg),
            InvokeError::Execution(msg) => write!(f, "{}", msg),
            InvokeError::Tool(msg) => write!(f, "Tool invocation failed: {}", msg),
        }
    }
}

impl Error for InvokeError {}

/// Coerce one JSON argument into its declared shape.
///
/// Object parameters also accept a JSON-encoded string, which covers script
/// dialects without object literals.
fn coerce_value(value: Value, kind: &ParamKind, catalog: &OperatorCatalog) -> Result<Value, InvokeError> {
    match kind {
        ParamKind::Json | ParamKind::Generic(_) => Ok(value),
        ParamKind::Integer => match &value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
            Value::Number(n) => {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.fract() == 0.0 && f.is_finite() {
                    Ok(Value::from(f as i64))
                } else {
                    Err(InvokeError::Argument(format!(
                        "expected an integer, got {}",
                        value
                    )))
                }
            }
            _ => Err(InvokeError::Argument(format!(
                "expected an integer, got {}",
                value
            ))),
        },
        ParamKind::Float => match &value {
            Value::Number(_) => Ok(value),
            _ => Err(InvokeError::Argument(format!(
                "expected a number, got {}",
                value
            ))),
        },
        ParamKind::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            _ => Err(InvokeError::Argument(format!(
                "expected a boolean, got {}",
                value
            ))),
        },
        ParamKind::String => match value {
            Value::String(_) => Ok(value),
            other => Err(InvokeError::Argument(format!(
                "expected a string, got {}",
                other
            ))),
        },
        ParamKind::Array(inner) => {
            let items = match value {
                Value::Array(items) => items,
                Value::String(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Array(items)) => items,
                    _ => {
                        return Err(InvokeError::Argument(
                            "expected an array or a JSON array string".to_string(),
                        ))
                    }
                },
                other => {
                    return Err(InvokeError::Argument(format!(
                        "expected an array, got {}",
                        other
                    )))
                }
            };
            let coerced: Result<Vec<Value>, InvokeError> = items
                .into_iter()
                .map(|item| coerce_value(item, inner, catalog))
                .collect();
            Ok(Value::Array(coerced?))
        }
        ParamKind::Object(dto_name) => {
            let object = match value {
                Value::Object(map) => map,
                Value::String(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(map)) => map,
                    _ => {
                        return Err(InvokeError::Argument(format!(
                            "expected a {} object or a JSON object string",
                            dto_name
                        )))
                    }
                },
                other => {
                    return Err(InvokeError::Argument(format!(
                        "expected a {} object, got {}",
                        dto_name, other
                    )))
                }
            };
            let mut coerced = Map::new();
            match catalog.dto_model(dto_name) {
                Some(model) => {
                    for (prop, prop_kind) in &model.properties {
                        match object.get(prop) {
                            Some(v) => {
                                coerced.insert(
                                    prop.clone(),
                                    coerce_value(v.clone(), prop_kind, catalog)?,
                                );
                            }
                            None => {
                                coerced.insert(prop.clone(), Value::Null);
                            }
                        }
                    }
                    // Unknown properties pass through untouched.
                    for (prop, v) in object {
                        coerced.entry(prop).or_insert(v);
                    }
                }
                None => coerced = object,
            }
            Ok(Value::Object(coerced))
        }
    }
}

/// Future handed to an [`InvocationScheduler`].
pub type ScheduledInvocation = MethodFuture;

/// Capability deciding where host method invocations execute.
#[async_trait]
pub trait InvocationScheduler: Send + Sync {
    async fn run(&self, task: ScheduledInvocation) -> Result<InvokeOutcome, InvokeError>;
}

/// Runs the invocation inline on the dispatching worker thread.
pub struct PassThroughScheduler;

#[async_trait]
impl InvocationScheduler for PassThroughScheduler {
    async fn run(&self, task: ScheduledInvocation) -> Result<InvokeOutcome, InvokeError> {
        task.await
    }
}

type QueuedInvocation = (
    ScheduledInvocation,
    oneshot::Sender<Result<InvokeOutcome, InvokeError>>,
);

/// Queues invocations onto a captured single-threaded context.
///
/// Hosts with thread-affine state (typically UI shells) construct one of
/// these; every host invocation is marshaled onto the dedicated thread.
/// Reentrant invocations issued from that thread run inline, otherwise a
/// queued reentrant call would wait on itself.
pub struct AffinityScheduler {
    thread_id: ThreadId,
    queue: mpsc::UnboundedSender<QueuedInvocation>,
}

impl AffinityScheduler {
    /// Spawn the dedicated invocation thread and return the scheduler bound
    /// to it.
    pub fn spawn() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedInvocation>();
        let join = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to build affinity runtime");
            runtime.block_on(async move {
                while let Some((task, reply)) = rx.recv().await {
                    let _ = reply.send(task.await);
                }
            });
        });
        let thread_id = join.thread().id();
        Arc::new(AffinityScheduler {
            thread_id,
            queue: tx,
        })
    }
}

#[async_trait]
impl InvocationScheduler for AffinityScheduler {
    async fn run(&self, task: ScheduledInvocation) -> Result<InvokeOutcome, InvokeError> {
        if std::thread::current().id() == self.thread_id {
            // Already on the captured context; queuing would deadlock.
            return task.await;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send((task, reply_tx))
            .map_err(|_| InvokeError::Execution("invocation scheduler is gone".to_string()))?;
        reply_rx
            .await
            .unwrap_or_else(|_| Err(InvokeError::Execution("invocation was dropped".to_string())))
    }
}

/// Resolves and runs operator method calls issued by running scripts.
pub struct OperatorInvoker {
    catalog: Arc<OperatorCatalog>,
    handles: Arc<HandleTable>,
    scheduler: Arc<dyn InvocationScheduler>,
}

impl OperatorInvoker {
    pub fn new(
        catalog: Arc<OperatorCatalog>,
        handles: Arc<HandleTable>,
        scheduler: Arc<dyn InvocationScheduler>,
    ) -> Self {
        OperatorInvoker {
            catalog,
            handles,
            scheduler,
        }
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    /// Run one `invoke-request`.
    pub async fn invoke(
        &self,
        target: &str,
        method: &str,
        handle: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Value, InvokeError> {
        let descriptor = self
            .catalog
            .descriptor(target)
            .ok_or_else(|| InvokeError::TypeNotFound(target.to_string()))?;

        let entry = self
            .catalog
            .lookup(target, method, args.len())
            .ok_or_else(|| InvokeError::MethodNotFound {
                type_name: target.to_string(),
                method: method.to_string(),
                arity: args.len(),
            })?;

        // Closing a generic definition fixes the parameter kinds for this
        // call and warms the memo table.
        let kinds: Vec<ParamKind> = if entry.is_generic {
            self.catalog.close_generic(&entry, &args).as_ref().clone()
        } else {
            entry.params.iter().map(|p| p.kind.clone()).collect()
        };

        let mut coerced = Vec::with_capacity(args.len());
        for (arg, kind) in args.into_iter().zip(kinds.iter()) {
            coerced.push(coerce_value(arg, kind, &self.catalog)?);
        }

        let receiver = match descriptor.handle_policy {
            HandlePolicy::Static => None,
            HandlePolicy::SelfRooted | HandlePolicy::HandleAssigned => {
                let handle = handle.ok_or_else(|| InvokeError::MissingHandle {
                    type_name: target.to_string(),
                    method: method.to_string(),
                })?;
                Some(
                    self.handles
                        .get(handle)
                        .ok_or_else(|| InvokeError::UnknownHandle(handle.to_string()))?,
                )
            }
        };

        let outcome = self.scheduler.run(entry.invoke(receiver, coerced)).await?;

        match outcome {
            InvokeOutcome::Value(value) => Ok(value),
            InvokeOutcome::Instance(type_name, instance) => {
                let handle = self.handles.register(&type_name, instance);
                Ok(Value::String(handle))
            }
        }
    }
}

/// Forwards `mcp-invoke-request` frames to registered tool servers.
pub struct ToolInvoker {
    registry: Arc<ToolServerRegistry>,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolServerRegistry>) -> Self {
        ToolInvoker { registry }
    }

    /// Run one tool call.  Argument names are preserved as given by the runner.
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, InvokeError> {
        let client = self
            .registry
            .get(server)
            .ok_or_else(|| InvokeError::Tool(format!("unknown tool server '{}'", server)))?;

        client
            .invoke(tool, arguments)
            .await
            .map_err(|e| InvokeError::Tool(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scriptor::operator::{
        CatalogBuilder, DtoModel, MethodEntry, OperatorDescriptor,
    };
    use serde_json::json;

    fn test_catalog() -> Arc<OperatorCatalog> {
        let mut builder = CatalogBuilder::new();
        builder.dto(DtoModel::new(
            "Pair",
            &[("A", ParamKind::Integer), ("B", ParamKind::Integer)],
        ));
        builder
            .operator(
                OperatorDescriptor::static_facade("Math")
                    .method(
                        MethodEntry::new("Add", &[("pair", ParamKind::Object("Pair".to_string()))])
                            .handler(Arc::new(|_recv, args| {
                                Box::pin(async move {
                                    let a = args[0]["A"].as_i64().unwrap_or(0);
                                    let b = args[0]["B"].as_i64().unwrap_or(0);
                                    Ok(InvokeOutcome::Value(json!(a + b)))
                                })
                            })),
                    )
                    .method(
                        MethodEntry::new("Sum", &[("items", ParamKind::Array(Box::new(ParamKind::Integer)))])
                            .handler(Arc::new(|_recv, args| {
                                Box::pin(async move {
                                    let total: i64 = args[0]
                                        .as_array()
                                        .unwrap()
                                        .iter()
                                        .filter_map(|v| v.as_i64())
                                        .sum();
                                    Ok(InvokeOutcome::Value(json!(total)))
                                })
                            })),
                    ),
            )
            .unwrap();
        builder
            .operator(
                OperatorDescriptor::self_rooted("Root").method(
                    MethodEntry::new("WhoAmI", &[]).handler(Arc::new(|recv, _args| {
                        Box::pin(async move {
                            let me = recv
                                .and_then(|r| r.downcast::<String>().ok())
                                .map(|s| s.as_ref().clone())
                                .unwrap_or_default();
                            Ok(InvokeOutcome::Value(json!(me)))
                        })
                    })),
                ),
            )
            .unwrap();
        Arc::new(builder.build().unwrap())
    }

    fn invoker(catalog: Arc<OperatorCatalog>) -> (OperatorInvoker, Arc<HandleTable>) {
        let handles = Arc::new(HandleTable::new());
        handles.register_root("Root", Arc::new("the root".to_string()));
        (
            OperatorInvoker::new(catalog, handles.clone(), Arc::new(PassThroughScheduler)),
            handles,
        )
    }

    #[tokio::test]
    async fn dto_arguments_are_coerced_and_summed() {
        let (invoker, _handles) = invoker(test_catalog());
        let result = invoker
            .invoke("Math", "Add", None, vec![json!({"A": 2, "B": 3})])
            .await
            .unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn object_parameters_accept_json_strings() {
        let (invoker, _handles) = invoker(test_catalog());
        let result = invoker
            .invoke("Math", "Add", None, vec![json!("{\"A\": 20, \"B\": 1}")])
            .await
            .unwrap();
        assert_eq!(result, json!(21));
    }

    #[tokio::test]
    async fn method_miss_reports_type_method_arity() {
        let (invoker, _handles) = invoker(test_catalog());
        let err = invoker
            .invoke("Math", "Add", None, vec![json!(1), json!(2)])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Method not found: Math.Add with 2 argument(s)"
        );
    }

    #[tokio::test]
    async fn instance_method_requires_a_live_handle() {
        let (invoker, _handles) = invoker(test_catalog());
        let err = invoker.invoke("Root", "WhoAmI", None, vec![]).await.unwrap_err();
        assert!(matches!(err, InvokeError::MissingHandle { .. }));

        let err = invoker
            .invoke("Root", "WhoAmI", Some("stale"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UnknownHandle(_)));

        let result = invoker
            .invoke("Root", "WhoAmI", Some("Root"), vec![])
            .await
            .unwrap();
        assert_eq!(result, json!("the root"));
    }

    #[tokio::test]
    async fn float_argument_is_rejected_for_integer_array() {
        let (invoker, _handles) = invoker(test_catalog());
        let err = invoker
            .invoke("Math", "Sum", None, vec![json!([1, 2.5])])
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Argument(_)));
    }

    #[tokio::test]
    async fn affinity_scheduler_runs_and_replies() {
        let scheduler = AffinityScheduler::spawn();
        let outcome = scheduler
            .run(Box::pin(async { Ok(InvokeOutcome::Value(json!(42))) }))
            .await
            .unwrap();
        match outcome {
            InvokeOutcome::Value(v) => assert_eq!(v, json!(42)),
            _ => panic!("unexpected outcome"),
        }
    }
}
