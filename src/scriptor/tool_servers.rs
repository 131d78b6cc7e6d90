//! Built-in [`ToolServer`] implementations.
//!
//! - [`LocalToolServer`]: tools hosted inside the orchestration process as
//!   closures over the named-argument map.  Used for host-local tools and
//!   for deterministic tests.
//! - [`HttpToolServer`]: client for a remote relay speaking plain HTTP.  The
//!   catalog is fetched once and held for the session, mirroring the
//!   once-per-session proxy bundle it feeds into.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::scriptor::tool_server::{ToolServer, ToolServerError, ToolSpec};

/// Host implementation of one local tool: named arguments in, JSON out.
pub type ToolHandler = Arc<
    dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value, ToolServerError>>
        + Send
        + Sync,
>;

struct LocalTool {
    spec: ToolSpec,
    handler: ToolHandler,
}

/// A tool server living inside the orchestration process.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use scriptor::tool_server::ToolSpec;
/// use scriptor::tool_servers::LocalToolServer;
///
/// let server = LocalToolServer::new();
/// server.register_fn(
///     ToolSpec::new("shout", "Uppercases the given text").with_schema(json!({
///         "type": "object",
///         "properties": {"text": {"type": "string"}},
///         "required": ["text"]
///     })),
///     |args| {
///         let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
///         Ok(json!(text.to_uppercase()))
///     },
/// );
/// ```
#[derive(Default)]
pub struct LocalToolServer {
    tools: RwLock<HashMap<String, LocalTool>>,
}

impl LocalToolServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its spec name.  Re-registering a name replaces
    /// the previous tool.
    pub fn register(&self, spec: ToolSpec, handler: ToolHandler) {
        let name = spec.name.clone();
        self.tools
            .write()
            .unwrap()
            .insert(name, LocalTool { spec, handler });
    }

    /// Register a synchronous tool.  A `Err(reason)` from the closure is
    /// reported as a failed call of that tool.
    pub fn register_fn<F>(&self, spec: ToolSpec, f: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        let tool_name = spec.name.clone();
        let f = Arc::new(f);
        self.register(
            spec,
            Arc::new(move |arguments| {
                let f = f.clone();
                let tool_name = tool_name.clone();
                Box::pin(async move {
                    f(&arguments).map_err(|reason| ToolServerError::CallFailed {
                        tool: tool_name,
                        reason,
                    })
                })
            }),
        );
    }

    /// Remove a tool; later calls fail with an unknown-tool error.
    pub fn deregister(&self, name: &str) {
        self.tools.write().unwrap().remove(name);
    }
}

#[async_trait]
impl ToolServer for LocalToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolServerError> {
        let tools = self.tools.read().unwrap();
        let mut specs: Vec<ToolSpec> = tools.values().map(|t| t.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }

    async fn invoke(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolServerError> {
        let handler = {
            let tools = self.tools.read().unwrap();
            tools.get(tool).map(|t| t.handler.clone())
        };
        match handler {
            Some(handler) => handler(arguments).await,
            None => Err(ToolServerError::UnknownTool(tool.to_string())),
        }
    }
}

/// Upper bound on one tool call over HTTP.  A running script blocks on the
/// call, so this also bounds how long a single script statement can stall.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for a remote tool relay over plain HTTP.
///
/// Wire contract: `GET {base}/catalog` returns a [`ToolSpec`] array;
/// `POST {base}/call/{tool}` takes the named-argument object as its body and
/// answers with the JSON payload, or a non-success status whose body is the
/// failure text (404 means the tool does not exist).
///
/// The catalog is fetched on first listing and then held for the session;
/// [`HttpToolServer::refresh_catalog`] drops the snapshot when the relay is
/// known to have changed.
pub struct HttpToolServer {
    base_url: String,
    http: reqwest::Client,
    catalog: RwLock<Option<Vec<ToolSpec>>>,
}

impl HttpToolServer {
    /// Connect to a relay with the default per-call timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_call_timeout(base_url, DEFAULT_CALL_TIMEOUT)
    }

    /// Connect to a relay with an explicit per-call timeout.
    pub fn with_call_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        HttpToolServer {
            base_url,
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build tool relay HTTP client"),
            catalog: RwLock::new(None),
        }
    }

    /// Drop the cached catalog; the next listing re-fetches it.
    pub fn refresh_catalog(&self) {
        *self.catalog.write().unwrap() = None;
    }

    async fn fetch_catalog(&self) -> Result<Vec<ToolSpec>, ToolServerError> {
        let response = self
            .http
            .get(format!("{}/catalog", self.base_url))
            .send()
            .await
            .map_err(|e| ToolServerError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ToolServerError::Unreachable(format!(
                "catalog request returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ToolServerError::Unreachable(format!("bad catalog payload: {}", e)))
    }
}

#[async_trait]
impl ToolServer for HttpToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolServerError> {
        if let Some(cached) = self.catalog.read().unwrap().clone() {
            return Ok(cached);
        }
        let fetched = self.fetch_catalog().await?;
        *self.catalog.write().unwrap() = Some(fetched.clone());
        Ok(fetched)
    }

    async fn invoke(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolServerError> {
        let response = self
            .http
            .post(format!("{}/call/{}", self.base_url, tool))
            .json(&Value::Object(arguments))
            .send()
            .await
            .map_err(|e| ToolServerError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ToolServerError::UnknownTool(tool.to_string()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ToolServerError::Unreachable(e.to_string()))?;
        if !status.is_success() {
            let reason = if body.trim().is_empty() {
                status.to_string()
            } else {
                body
            };
            return Err(ToolServerError::CallFailed {
                tool: tool.to_string(),
                reason,
            });
        }
        serde_json::from_str(&body)
            .map_err(|e| ToolServerError::Unreachable(format!("bad call payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_server() -> LocalToolServer {
        let server = LocalToolServer::new();
        server.register_fn(
            ToolSpec::new("echo", "Echoes the 'text' argument"),
            |args| {
                args.get("text")
                    .cloned()
                    .ok_or_else(|| "missing 'text'".to_string())
            },
        );
        server
    }

    #[tokio::test]
    async fn local_server_runs_registered_tools() {
        let server = echo_server();
        let mut arguments = Map::new();
        arguments.insert("text".to_string(), json!("hi"));
        let payload = server.invoke("echo", arguments).await.unwrap();
        assert_eq!(payload, json!("hi"));
    }

    #[tokio::test]
    async fn local_server_reports_call_failures_with_the_tool_name() {
        let server = echo_server();
        let err = server.invoke("echo", Map::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "tool 'echo' failed: missing 'text'");
    }

    #[tokio::test]
    async fn unknown_tools_and_deregistered_tools_fail_to_resolve() {
        let server = echo_server();
        assert!(matches!(
            server.invoke("missing", Map::new()).await.unwrap_err(),
            ToolServerError::UnknownTool(_)
        ));

        server.deregister("echo");
        assert!(matches!(
            server.invoke("echo", Map::new()).await.unwrap_err(),
            ToolServerError::UnknownTool(_)
        ));
    }

    #[tokio::test]
    async fn catalog_listing_is_sorted_by_name() {
        let server = LocalToolServer::new();
        server.register_fn(ToolSpec::new("zeta", "z"), |_| Ok(json!(null)));
        server.register_fn(ToolSpec::new("alpha", "a"), |_| Ok(json!(null)));
        let names: Vec<String> = server
            .list_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[tokio::test]
    async fn re_registering_a_name_replaces_the_tool() {
        let server = LocalToolServer::new();
        server.register_fn(ToolSpec::new("greet", "v1"), |_| Ok(json!("hello")));
        server.register_fn(ToolSpec::new("greet", "v2"), |_| Ok(json!("hej")));
        let payload = server.invoke("greet", Map::new()).await.unwrap();
        assert_eq!(payload, json!("hej"));
        assert_eq!(server.list_tools().await.unwrap().len(), 1);
    }
}
