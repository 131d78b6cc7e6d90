//! Tool servers: the external collaborators running scripts reach through
//! `mcp-invoke-request` frames.
//!
//! The engine consumes exactly two operations from a server: a catalog
//! listing (tool names, prose descriptions, and the JSON schema of each
//! tool's named arguments; the proxy builder turns these into script-side
//! stubs) and the invocation of one named tool with named JSON arguments.
//! Servers register under a name in the [`ToolServerRegistry`]; the
//! invocation pipeline resolves the `server` field of each frame against it.
//!
//! ```text
//! Script → Runner → mcp-invoke-request → ToolServerRegistry → ToolServer
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// One tool as a server advertises it.
///
/// The argument shape travels as a JSON Schema object rather than a typed
/// parameter list: that is what remote servers publish, and the proxy
/// builder only needs names, requiredness, and prose out of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the named arguments (an object schema).
    #[serde(default = "ToolSpec::empty_schema")]
    pub input_schema: Value,
}

impl ToolSpec {
    /// A spec with the given identity and an empty argument schema.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            input_schema: Self::empty_schema(),
        }
    }

    fn empty_schema() -> Value {
        json!({"type": "object", "properties": {}})
    }

    /// Attach the argument schema.
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Argument names declared in the schema, paired with whether the
    /// schema's `required` list names them.  Sorted for stable emission.
    pub fn argument_summary(&self) -> Vec<(String, bool)> {
        let required: Vec<&str> = self
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        let mut names: Vec<String> = self
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let is_required = required.contains(&name.as_str());
                (name, is_required)
            })
            .collect()
    }
}

/// Why a tool-server operation failed.
///
/// The rendered text travels back to the running script in the `error` field
/// of an `invoke-result`, so the wording is addressed to the script author.
#[derive(Debug, Clone)]
pub enum ToolServerError {
    /// The server advertises no tool with that name.
    UnknownTool(String),
    /// The server understood the call and refused or failed it.
    CallFailed { tool: String, reason: String },
    /// The server could not be reached, or answered something unparseable.
    Unreachable(String),
}

impl fmt::Display for ToolServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolServerError::UnknownTool(name) => {
                write!(f, "no tool named '{}' on this server", name)
            }
            ToolServerError::CallFailed { tool, reason } => {
                write!(f, "tool '{}' failed: {}", tool, reason)
            }
            ToolServerError::Unreachable(msg) => write!(f, "tool server unreachable: {}", msg),
        }
    }
}

impl Error for ToolServerError {}

/// The contract the engine consumes from an external tool server.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// The advertised tool catalog.  Read by the proxy builder while the
    /// session bundle is assembled.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolServerError>;

    /// Invoke one named tool.  Argument names are preserved exactly as the
    /// runner sent them; the payload comes back as plain JSON.
    async fn invoke(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolServerError>;
}

/// Named tool servers available to running scripts.
///
/// The invocation pipeline resolves the `server` field of an
/// `mcp-invoke-request` here; the proxy builder reads every registered
/// server's catalog to emit script-side stubs.
#[derive(Default)]
pub struct ToolServerRegistry {
    servers: HashMap<String, Arc<dyn ToolServer>>,
}

impl ToolServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            servers: HashMap::new(),
        }
    }

    /// Register a server under a unique name.  Re-registering a name replaces
    /// the previous client.
    pub fn register(&mut self, name: impl Into<String>, server: Arc<dyn ToolServer>) {
        let name = name.into();
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("ToolServerRegistry: registered server '{}'", name);
        }
        self.servers.insert(name, server);
    }

    /// Resolve a server client by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolServer>> {
        self.servers.get(name).cloned()
    }

    /// Iterate over `(name, client)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn ToolServer>)> {
        self.servers.iter()
    }

    /// Registered server names, sorted for deterministic output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_summary_reads_properties_and_required() {
        let spec = ToolSpec::new("forecast", "Weather forecast").with_schema(json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "days": {"type": "integer"}
            },
            "required": ["city"]
        }));
        assert_eq!(
            spec.argument_summary(),
            vec![("city".to_string(), true), ("days".to_string(), false)]
        );
    }

    #[test]
    fn missing_schema_deserializes_to_an_empty_object_schema() {
        let spec: ToolSpec =
            serde_json::from_str(r#"{"name":"noop","description":"does nothing"}"#).unwrap();
        assert_eq!(spec.input_schema["type"], "object");
        assert!(spec.argument_summary().is_empty());
    }

    #[test]
    fn error_text_is_addressed_to_the_script_author() {
        assert_eq!(
            ToolServerError::UnknownTool("frobnicate".to_string()).to_string(),
            "no tool named 'frobnicate' on this server"
        );
        assert_eq!(
            ToolServerError::CallFailed {
                tool: "forecast".to_string(),
                reason: "city not found".to_string()
            }
            .to_string(),
            "tool 'forecast' failed: city not found"
        );
    }
}
