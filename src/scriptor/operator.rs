//! Operator catalog: descriptors, method entries, and the handle table.
//!
//! An *operator* is a host-owned object exposing methods to running scripts.
//! Instead of reflecting over an inheritance hierarchy, hosts register a
//! tagged set of [`OperatorDescriptor`]s; each descriptor carries the type
//! name, its handle policy, and its method entries.  Method entries are keyed
//! by `(declaring type, method name, arity)` and duplicate keys fail the
//! catalog build.
//!
//! Script-side references to operator instances cross the runner boundary as
//! opaque string *handles* resolved through the [`HandleTable`].  The root
//! instance's handle is its type name; instances returned by host methods are
//! inserted under fresh 128-bit hex handles.
//!
//! # Registering an operator
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use scriptor::operator::{
//!     CatalogBuilder, InvokeOutcome, MethodEntry, OperatorDescriptor, ParamKind,
//! };
//!
//! let mut builder = CatalogBuilder::new();
//! builder
//!     .operator(
//!         OperatorDescriptor::static_facade("MathOperator")
//!             .with_description("Arithmetic helpers")
//!             .method(
//!                 MethodEntry::new("Add", &[("a", ParamKind::Integer), ("b", ParamKind::Integer)])
//!                     .with_description("Adds two integers")
//!                     .handler(Arc::new(|_recv, args| {
//!                         Box::pin(async move {
//!                             let a = args[0].as_i64().unwrap_or(0);
//!                             let b = args[1].as_i64().unwrap_or(0);
//!                             Ok(InvokeOutcome::Value(json!(a + b)))
//!                         })
//!                     })),
//!             ),
//!     )
//!     .unwrap();
//! let catalog = builder.build().unwrap();
//! assert!(catalog.lookup("MathOperator", "Add", 2).is_some());
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use crate::scriptor::invocation::InvokeError;

/// How instances of an operator type come into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePolicy {
    /// A facade with no instances; every method is receiver-less.
    Static,
    /// A root operator: one implicit instance whose handle equals the type name.
    SelfRooted,
    /// Instances are created by host methods and addressed by assigned handles.
    HandleAssigned,
}

/// Declared shape of a parameter or property, used for JSON coercion and for
/// proxy/signature emission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Integer,
    Float,
    Boolean,
    String,
    /// Any JSON value, passed through untouched.
    Json,
    /// An object coerced against the named DTO model.
    Object(String),
    /// An array whose elements are coerced to the inner kind.
    Array(Box<ParamKind>),
    /// A generic slot; the concrete kind is inferred from the runtime
    /// arguments and memoized per closed signature.
    Generic(usize),
}

impl ParamKind {
    /// Dialect type name used in generated proxy and signature text.
    pub fn dialect_name(&self) -> String {
        match self {
            ParamKind::Integer => "long".to_string(),
            ParamKind::Float => "double".to_string(),
            ParamKind::Boolean => "bool".to_string(),
            ParamKind::String => "string".to_string(),
            ParamKind::Json => "object".to_string(),
            ParamKind::Object(name) => name.clone(),
            ParamKind::Array(inner) => format!("List<{}>", inner.dialect_name()),
            ParamKind::Generic(slot) => format!("T{}", slot),
        }
    }
}

/// A named, typed parameter of a method entry.
#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: ParamKind,
}

/// Reference to a live operator instance stored in the handle table.
pub type OperatorInstanceRef = Arc<dyn Any + Send + Sync>;

/// What a method handler produced.
pub enum InvokeOutcome {
    /// A plain JSON value (null for void methods).
    Value(Value),
    /// A new operator instance of the named type; the invoker registers it
    /// and answers the script with the assigned handle.
    Instance(String, OperatorInstanceRef),
}

/// Future returned by method handlers.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<InvokeOutcome, InvokeError>> + Send>>;

/// Host implementation of one method: receives the resolved receiver (None
/// for static entries) and the coerced arguments.
pub type MethodFn = Arc<dyn Fn(Option<OperatorInstanceRef>, Vec<Value>) -> MethodFuture + Send + Sync>;

/// Lookup key for the method cache.
pub type MethodKey = (String, String, usize);

/// One annotated host method.
pub struct MethodEntry {
    /// Declaring operator type; filled in when the descriptor is registered.
    pub type_name: String,
    /// Raw host method name (may carry an `Async` suffix that the proxy
    /// surface trims).
    pub name: String,
    /// Human description surfaced in the signatures text.
    pub description: Option<String>,
    pub params: Vec<ParameterDescriptor>,
    /// Whether the entry is an open generic definition.
    pub is_generic: bool,
    /// Whether the host method completes asynchronously.  Affects only the
    /// emitted surface; every handler is awaited either way.
    pub returns_async: bool,
    /// Dialect name of the declared return, for signature emission.
    pub return_kind: Option<ParamKind>,
    /// Set when the method returns an operator instance of the named type.
    pub returns_operator: Option<String>,
    handler: Option<MethodFn>,
}

impl std::fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodEntry")
            .field("type_name", &self.type_name)
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params", &self.params)
            .field("is_generic", &self.is_generic)
            .field("returns_async", &self.returns_async)
            .field("return_kind", &self.return_kind)
            .field("returns_operator", &self.returns_operator)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl MethodEntry {
    /// Start a method entry with the given raw name and parameters.
    pub fn new(name: impl Into<String>, params: &[(&str, ParamKind)]) -> Self {
        MethodEntry {
            type_name: String::new(),
            name: name.into(),
            description: None,
            params: params
                .iter()
                .map(|(n, k)| ParameterDescriptor {
                    name: (*n).to_string(),
                    kind: k.clone(),
                })
                .collect(),
            is_generic: false,
            returns_async: false,
            return_kind: None,
            returns_operator: None,
            handler: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the entry as an open generic definition.
    pub fn generic(mut self) -> Self {
        self.is_generic = true;
        self
    }

    /// Mark the host method as asynchronous; the proxy surface trims the
    /// `Async` name suffix.
    pub fn asynchronous(mut self) -> Self {
        self.returns_async = true;
        self
    }

    /// Declare the return shape for signature emission.
    pub fn returns(mut self, kind: ParamKind) -> Self {
        self.return_kind = Some(kind);
        self
    }

    /// Declare that the method returns an operator instance of `type_name`.
    pub fn returns_operator(mut self, type_name: impl Into<String>) -> Self {
        self.returns_operator = Some(type_name.into());
        self
    }

    /// Attach the host implementation.
    pub fn handler(mut self, handler: MethodFn) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn key(&self) -> MethodKey {
        (self.type_name.clone(), self.name.clone(), self.arity())
    }

    /// Surface name with the `Async` suffix trimmed.
    pub fn surface_name(&self) -> &str {
        if self.returns_async && self.name.len() > 5 && self.name.ends_with("Async") {
            &self.name[..self.name.len() - 5]
        } else {
            &self.name
        }
    }

    /// Run the host implementation.
    pub fn invoke(&self, receiver: Option<OperatorInstanceRef>, args: Vec<Value>) -> MethodFuture {
        match &self.handler {
            Some(handler) => handler(receiver, args),
            None => {
                let key = format!("{}.{}", self.type_name, self.name);
                Box::pin(async move {
                    Err(InvokeError::Execution(format!(
                        "method {} has no handler",
                        key
                    )))
                })
            }
        }
    }
}

/// A data-transfer model mirrored into the proxy text as a data class and used
/// to coerce object arguments.
#[derive(Debug, Clone)]
pub struct DtoModel {
    pub name: String,
    pub properties: Vec<(String, ParamKind)>,
}

impl DtoModel {
    pub fn new(name: impl Into<String>, properties: &[(&str, ParamKind)]) -> Self {
        DtoModel {
            name: name.into(),
            properties: properties
                .iter()
                .map(|(n, k)| ((*n).to_string(), k.clone()))
                .collect(),
        }
    }
}

/// One operator type: name, handle policy, methods.
#[derive(Debug)]
pub struct OperatorDescriptor {
    pub type_name: String,
    pub description: Option<String>,
    pub handle_policy: HandlePolicy,
    pub methods: Vec<Arc<MethodEntry>>,
}

impl OperatorDescriptor {
    fn with_policy(type_name: impl Into<String>, handle_policy: HandlePolicy) -> Self {
        OperatorDescriptor {
            type_name: type_name.into(),
            description: None,
            handle_policy,
            methods: Vec::new(),
        }
    }

    /// A facade of receiver-less methods.
    pub fn static_facade(type_name: impl Into<String>) -> Self {
        Self::with_policy(type_name, HandlePolicy::Static)
    }

    /// A root operator with one implicit self-handled instance.
    pub fn self_rooted(type_name: impl Into<String>) -> Self {
        Self::with_policy(type_name, HandlePolicy::SelfRooted)
    }

    /// An operator whose instances are created by host methods.
    pub fn handle_assigned(type_name: impl Into<String>) -> Self {
        Self::with_policy(type_name, HandlePolicy::HandleAssigned)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a method entry; the declaring type is stamped here.
    pub fn method(mut self, mut entry: MethodEntry) -> Self {
        entry.type_name = self.type_name.clone();
        self.methods.push(Arc::new(entry));
        self
    }
}

/// Error raised while assembling the catalog or the proxy surface.
#[derive(Debug, Clone)]
pub struct BuildError {
    message: String,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        BuildError {
            message: message.into(),
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Build error: {}", self.message)
    }
}

impl Error for BuildError {}

/// Accumulates operator descriptors and DTO models before the catalog is
/// frozen.
#[derive(Default)]
pub struct CatalogBuilder {
    descriptors: Vec<OperatorDescriptor>,
    dto_models: Vec<DtoModel>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator descriptor.
    pub fn operator(&mut self, descriptor: OperatorDescriptor) -> Result<&mut Self, BuildError> {
        if self
            .descriptors
            .iter()
            .any(|d| d.type_name == descriptor.type_name)
        {
            return Err(BuildError::new(format!(
                "duplicate operator type '{}'",
                descriptor.type_name
            )));
        }
        self.descriptors.push(descriptor);
        Ok(self)
    }

    /// Register a DTO model mirrored into the proxy surface.
    pub fn dto(&mut self, model: DtoModel) -> &mut Self {
        self.dto_models.push(model);
        self
    }

    /// Freeze the catalog.  Duplicate `(type, name, arity)` keys fail here.
    pub fn build(self) -> Result<OperatorCatalog, BuildError> {
        let mut methods: HashMap<MethodKey, Arc<MethodEntry>> = HashMap::new();
        for descriptor in &self.descriptors {
            for entry in &descriptor.methods {
                let key = entry.key();
                if methods.insert(key.clone(), entry.clone()).is_some() {
                    return Err(BuildError::new(format!(
                        "duplicate method entry {}.{}/{}",
                        key.0, key.1, key.2
                    )));
                }
            }
        }
        let mut descriptors = HashMap::new();
        for descriptor in self.descriptors {
            descriptors.insert(descriptor.type_name.clone(), descriptor);
        }
        Ok(OperatorCatalog {
            descriptors,
            methods,
            dto_models: self.dto_models,
            generic_memo: Mutex::new(HashMap::new()),
            method_filter: None,
        })
    }
}

/// Immutable, session-wide method cache plus descriptor/DTO registry.
pub struct OperatorCatalog {
    descriptors: HashMap<String, OperatorDescriptor>,
    methods: HashMap<MethodKey, Arc<MethodEntry>>,
    dto_models: Vec<DtoModel>,
    /// Memoized closed generic signatures, keyed by `(entry key, ordered
    /// argument kinds)`.
    generic_memo: Mutex<HashMap<(MethodKey, Vec<ParamKind>), Arc<Vec<ParamKind>>>>,
    method_filter: Option<Arc<dyn Fn(&MethodEntry) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for OperatorCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorCatalog")
            .field("descriptors", &self.descriptors)
            .field("methods", &self.methods)
            .field("dto_models", &self.dto_models)
            .field("generic_memo", &self.generic_memo)
            .field("method_filter", &self.method_filter.is_some())
            .finish()
    }
}

impl OperatorCatalog {
    /// Overlay a predicate as a filter view over the method cache.
    pub fn with_method_filter(
        mut self,
        filter: Arc<dyn Fn(&MethodEntry) -> bool + Send + Sync>,
    ) -> Self {
        self.method_filter = Some(filter);
        self
    }

    pub fn descriptor(&self, type_name: &str) -> Option<&OperatorDescriptor> {
        self.descriptors.get(type_name)
    }

    /// Descriptors sorted by type name for deterministic emission.
    pub fn descriptors(&self) -> Vec<&OperatorDescriptor> {
        let mut all: Vec<&OperatorDescriptor> = self.descriptors.values().collect();
        all.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        all
    }

    pub fn dto_models(&self) -> &[DtoModel] {
        &self.dto_models
    }

    pub fn dto_model(&self, name: &str) -> Option<&DtoModel> {
        self.dto_models.iter().find(|m| m.name == name)
    }

    /// Resolve `(type, name, arity)` through the filter view.
    pub fn lookup(&self, type_name: &str, method: &str, arity: usize) -> Option<Arc<MethodEntry>> {
        let entry = self
            .methods
            .get(&(type_name.to_string(), method.to_string(), arity))?;
        if let Some(filter) = &self.method_filter {
            if !filter(entry) {
                return None;
            }
        }
        Some(entry.clone())
    }

    /// Whether a method entry passes the filter view (used at emission time).
    pub fn is_visible(&self, entry: &MethodEntry) -> bool {
        match &self.method_filter {
            Some(filter) => filter(entry),
            None => true,
        }
    }

    /// Close a generic entry over the runtime kinds of the provided
    /// arguments, memoizing the result.
    pub fn close_generic(&self, entry: &MethodEntry, args: &[Value]) -> Arc<Vec<ParamKind>> {
        let inferred: Vec<ParamKind> = entry
            .params
            .iter()
            .zip(args.iter())
            .map(|(param, arg)| match &param.kind {
                ParamKind::Generic(_) => kind_of_value(arg),
                concrete => concrete.clone(),
            })
            .collect();

        let memo_key = (entry.key(), inferred.clone());
        let mut memo = self.generic_memo.lock().unwrap();
        memo.entry(memo_key)
            .or_insert_with(|| Arc::new(inferred))
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn generic_memo_len(&self) -> usize {
        self.generic_memo.lock().unwrap().len()
    }
}

/// Infer the concrete [`ParamKind`] of a runtime JSON value.
pub fn kind_of_value(value: &Value) -> ParamKind {
    match value {
        Value::Bool(_) => ParamKind::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => ParamKind::Integer,
        Value::Number(_) => ParamKind::Float,
        Value::String(_) => ParamKind::String,
        Value::Array(items) => match items.first() {
            Some(first) => ParamKind::Array(Box::new(kind_of_value(first))),
            None => ParamKind::Array(Box::new(ParamKind::Json)),
        },
        _ => ParamKind::Json,
    }
}

/// Thread-safe map from opaque handle strings to live operator instances.
///
/// Insertion order is preserved so that generated instance declarations are
/// deterministic within a session.
#[derive(Default)]
pub struct HandleTable {
    inner: RwLock<HandleTableInner>,
}

#[derive(Default)]
struct HandleTableInner {
    entries: HashMap<String, (String, OperatorInstanceRef)>,
    order: Vec<String>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the root instance of a self-rooted operator; its handle is
    /// the type name itself.
    pub fn register_root(&self, type_name: &str, instance: OperatorInstanceRef) {
        self.insert(type_name.to_string(), type_name.to_string(), instance);
    }

    /// Register an instance under a fresh 128-bit hex handle and return it.
    pub fn register(&self, type_name: &str, instance: OperatorInstanceRef) -> String {
        let handle = uuid::Uuid::new_v4().simple().to_string();
        self.insert(handle.clone(), type_name.to_string(), instance);
        handle
    }

    fn insert(&self, handle: String, type_name: String, instance: OperatorInstanceRef) {
        let mut inner = self.inner.write().unwrap();
        if !inner.entries.contains_key(&handle) {
            inner.order.push(handle.clone());
        }
        inner.entries.insert(handle, (type_name, instance));
    }

    /// Resolve a handle to its live instance.
    pub fn get(&self, handle: &str) -> Option<OperatorInstanceRef> {
        self.inner
            .read()
            .unwrap()
            .entries
            .get(handle)
            .map(|(_, instance)| instance.clone())
    }

    /// Drop a handle; later references fail to resolve.
    pub fn release(&self, handle: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.entries.remove(handle);
        inner.order.retain(|h| h != handle);
    }

    /// Snapshot of `(handle, type name)` pairs in insertion order.
    pub fn live(&self) -> Vec<(String, String)> {
        let inner = self.inner.read().unwrap();
        inner
            .order
            .iter()
            .filter_map(|h| inner.entries.get(h).map(|(t, _)| (h.clone(), t.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> MethodFn {
        Arc::new(|_recv, _args| Box::pin(async { Ok(InvokeOutcome::Value(Value::Null)) }))
    }

    #[test]
    fn duplicate_method_key_fails_the_build() {
        let mut builder = CatalogBuilder::new();
        builder
            .operator(
                OperatorDescriptor::static_facade("Ops")
                    .method(
                        MethodEntry::new("Do", &[("x", ParamKind::Integer)])
                            .handler(noop_handler()),
                    )
                    .method(
                        MethodEntry::new("Do", &[("y", ParamKind::String)]).handler(noop_handler()),
                    ),
            )
            .unwrap();
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("duplicate method entry Ops.Do/1"));
    }

    #[test]
    fn same_name_different_arity_both_resolve() {
        let mut builder = CatalogBuilder::new();
        builder
            .operator(
                OperatorDescriptor::static_facade("Ops")
                    .method(
                        MethodEntry::new("Do", &[("x", ParamKind::Integer)])
                            .handler(noop_handler()),
                    )
                    .method(
                        MethodEntry::new(
                            "Do",
                            &[("x", ParamKind::Integer), ("y", ParamKind::Integer)],
                        )
                        .handler(noop_handler()),
                    ),
            )
            .unwrap();
        let catalog = builder.build().unwrap();
        assert!(catalog.lookup("Ops", "Do", 1).is_some());
        assert!(catalog.lookup("Ops", "Do", 2).is_some());
        assert!(catalog.lookup("Ops", "Do", 3).is_none());
    }

    #[test]
    fn generic_closure_is_memoized_per_argument_kinds() {
        let mut builder = CatalogBuilder::new();
        builder
            .operator(OperatorDescriptor::static_facade("Ops").method(
                MethodEntry::new("First", &[("items", ParamKind::Generic(0))])
                    .generic()
                    .handler(noop_handler()),
            ))
            .unwrap();
        let catalog = builder.build().unwrap();
        let entry = catalog.lookup("Ops", "First", 1).unwrap();

        let closed_ints = catalog.close_generic(&entry, &[json!([1, 2, 3])]);
        let closed_ints_again = catalog.close_generic(&entry, &[json!([9])]);
        let closed_strings = catalog.close_generic(&entry, &[json!(["a"])]);

        assert_eq!(closed_ints, closed_ints_again);
        assert_ne!(closed_ints, closed_strings);
        assert_eq!(catalog.generic_memo_len(), 2);
    }

    #[test]
    fn method_filter_hides_entries_from_lookup() {
        let mut builder = CatalogBuilder::new();
        builder
            .operator(
                OperatorDescriptor::static_facade("Ops")
                    .method(MethodEntry::new("Keep", &[]).handler(noop_handler()))
                    .method(MethodEntry::new("Hide", &[]).handler(noop_handler())),
            )
            .unwrap();
        let catalog = builder
            .build()
            .unwrap()
            .with_method_filter(Arc::new(|entry| entry.name != "Hide"));
        assert!(catalog.lookup("Ops", "Keep", 0).is_some());
        assert!(catalog.lookup("Ops", "Hide", 0).is_none());
    }

    #[test]
    fn handle_table_preserves_order_and_releases() {
        let table = HandleTable::new();
        table.register_root("RootOp", Arc::new(()));
        let h1 = table.register("ChildOp", Arc::new(()));
        let h2 = table.register("ChildOp", Arc::new(()));
        assert_ne!(h1, h2);
        assert_eq!(h1.len(), 32);

        let live = table.live();
        assert_eq!(live[0].0, "RootOp");
        assert_eq!(live[1].1, "ChildOp");
        assert_eq!(live.len(), 3);

        table.release(&h1);
        assert!(table.get(&h1).is_none());
        assert_eq!(table.live().len(), 2);
    }

    #[test]
    fn async_suffix_is_trimmed_on_the_surface() {
        let entry = MethodEntry::new("FetchAsync", &[]).asynchronous();
        assert_eq!(entry.surface_name(), "Fetch");
        let entry = MethodEntry::new("Fetch", &[]);
        assert_eq!(entry.surface_name(), "Fetch");
    }
}
