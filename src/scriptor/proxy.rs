//! Proxy surface generation.
//!
//! Once per session the [`ProxyBuilder`] turns the operator catalog and the
//! registered tool servers into an immutable [`ProxyBundle`]:
//!
//! - **runtime text** — script-dialect stubs prepended to every user script.
//!   It starts with the host-binding stub, then one data class per DTO model,
//!   then one proxy class per operator type whose method bodies forward to
//!   the host-call primitive and block on the returned value.
//! - **signatures text** — the same declarations without bodies, annotated
//!   with the human descriptions; this is the prompt material shown to the
//!   script agent.
//! - **method cache** — the catalog the invocation pipeline resolves against.
//!
//! Tool augmentation is asynchronous (`list_tools()` per registered server)
//! and its completion gates the first user turn.
//!
//! The engine itself never parses the generated dialect; it is opaque text
//! the runner understands.

use std::sync::Arc;

use crate::scriptor::operator::{
    BuildError, DtoModel, HandlePolicy, MethodEntry, OperatorCatalog, OperatorDescriptor,
};
use crate::scriptor::tool_server::{ToolServerRegistry, ToolSpec};

/// The immutable triple produced once per session.
#[derive(Debug)]
pub struct ProxyBundle {
    /// Script-dialect stubs prepended to every user script.
    pub runtime_text: String,
    /// Documentary form of the proxy surface, shown to the script agent.
    pub signatures_text: String,
    catalog: Arc<OperatorCatalog>,
}

impl ProxyBundle {
    /// The method cache backing the runtime text.
    pub fn method_cache(&self) -> &Arc<OperatorCatalog> {
        &self.catalog
    }
}

/// Builds the [`ProxyBundle`] from host metadata.
pub struct ProxyBuilder;

impl ProxyBuilder {
    /// Assemble the session bundle.
    ///
    /// Fails when two methods on one type collapse onto the same surface name
    /// and arity after `Async` suffix trimming, or when a registered tool
    /// server cannot be listed.
    pub async fn build(
        catalog: Arc<OperatorCatalog>,
        tools: Arc<ToolServerRegistry>,
    ) -> Result<ProxyBundle, BuildError> {
        let mut runtime = String::new();
        let mut signatures = String::new();

        // Host-binding stub comes first; user scripts are concatenated
        // strictly after the runtime text.
        runtime.push_str("ProxyRuntime.Host = Host;\n");

        for model in catalog.dto_models() {
            runtime.push('\n');
            emit_dto(&mut runtime, model);
        }

        for descriptor in catalog.descriptors() {
            runtime.push('\n');
            emit_operator_runtime(&mut runtime, &catalog, descriptor)?;
            if !signatures.is_empty() {
                signatures.push('\n');
            }
            emit_operator_signatures(&mut signatures, &catalog, descriptor);
        }

        // Asynchronous augmentation: one proxy class per tool server.
        for server in tools.names() {
            let client = tools.get(&server).expect("registry names are live");
            let listed = client.list_tools().await.map_err(|e| {
                log::error!("ProxyBuilder: listing tools of server '{}' failed: {}", server, e);
                BuildError::new(format!("tool server '{}' could not be listed: {}", server, e))
            })?;
            runtime.push('\n');
            emit_tool_runtime(&mut runtime, &server, &listed);
            if !signatures.is_empty() {
                signatures.push('\n');
            }
            emit_tool_signatures(&mut signatures, &server, &listed);
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "ProxyBuilder: generated {} runtime chars, {} signature chars",
                runtime.len(),
                signatures.len()
            );
        }

        Ok(ProxyBundle {
            runtime_text: runtime,
            signatures_text: signatures,
            catalog,
        })
    }
}

fn emit_dto(out: &mut String, model: &DtoModel) {
    out.push_str(&format!("class {} {{\n", model.name));
    for (name, kind) in &model.properties {
        out.push_str(&format!(
            "    public {} {} {{ get; set; }}\n",
            kind.dialect_name(),
            name
        ));
    }
    out.push_str("}\n");
}

fn return_dialect(entry: &MethodEntry) -> String {
    if let Some(op) = &entry.returns_operator {
        return op.clone();
    }
    match &entry.return_kind {
        Some(kind) => kind.dialect_name(),
        None => "object".to_string(),
    }
}

fn params_dialect(entry: &MethodEntry) -> String {
    entry
        .params
        .iter()
        .map(|p| format!("{} {}", p.kind.dialect_name(), p.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn args_dialect(entry: &MethodEntry) -> String {
    entry
        .params
        .iter()
        .map(|p| p.name.clone())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Visible entries of a descriptor, with surface-collision detection.
fn visible_entries<'a>(
    catalog: &OperatorCatalog,
    descriptor: &'a OperatorDescriptor,
) -> Result<Vec<&'a Arc<MethodEntry>>, BuildError> {
    let mut seen: Vec<(String, usize)> = Vec::new();
    let mut entries = Vec::new();
    for entry in &descriptor.methods {
        if !catalog.is_visible(entry) {
            continue;
        }
        let surface = (entry.surface_name().to_string(), entry.arity());
        if seen.contains(&surface) {
            return Err(BuildError::new(format!(
                "surface name collision on {}.{}/{} after Async suffix trimming",
                descriptor.type_name, surface.0, surface.1
            )));
        }
        seen.push(surface);
        entries.push(entry);
    }
    Ok(entries)
}

fn emit_operator_runtime(
    out: &mut String,
    catalog: &OperatorCatalog,
    descriptor: &OperatorDescriptor,
) -> Result<(), BuildError> {
    let entries = visible_entries(catalog, descriptor)?;
    let is_static = descriptor.handle_policy == HandlePolicy::Static;

    if is_static {
        out.push_str(&format!("static class {} {{\n", descriptor.type_name));
    } else {
        out.push_str(&format!("class {} {{\n", descriptor.type_name));
        out.push_str("    string handle;\n");
        if descriptor.handle_policy == HandlePolicy::SelfRooted {
            out.push_str(&format!(
                "    public {}() {{ handle = \"{}\"; }}\n",
                descriptor.type_name, descriptor.type_name
            ));
        }
        out.push_str(&format!(
            "    public {}(string handle) {{ this.handle = handle; }}\n",
            descriptor.type_name
        ));
    }

    for entry in entries {
        let modifier = if is_static { "public static" } else { "public" };
        let handle_arg = if is_static { "" } else { ", handle" };
        let call = format!(
            "Host.Invoke(\"{}\", \"{}\", new object[] {{ {} }}{})",
            descriptor.type_name,
            entry.name,
            args_dialect(entry),
            handle_arg
        );
        // Operator-returning methods wrap the received handle in a fresh
        // script-side proxy instance.
        let body = match &entry.returns_operator {
            Some(op) => format!("return new {}({});", op, call),
            None => format!("return {};", call),
        };
        out.push_str(&format!(
            "    {} {} {}({}) {{ {} }}\n",
            modifier,
            return_dialect(entry),
            entry.surface_name(),
            params_dialect(entry),
            body
        ));
    }
    out.push_str("}\n");
    Ok(())
}

fn emit_operator_signatures(
    out: &mut String,
    catalog: &OperatorCatalog,
    descriptor: &OperatorDescriptor,
) {
    if let Some(description) = &descriptor.description {
        out.push_str(&format!("// {}\n", description));
    }
    let keyword = if descriptor.handle_policy == HandlePolicy::Static {
        "static class"
    } else {
        "class"
    };
    out.push_str(&format!("{} {} {{\n", keyword, descriptor.type_name));
    for entry in &descriptor.methods {
        if !catalog.is_visible(entry) {
            continue;
        }
        if let Some(description) = &entry.description {
            out.push_str(&format!("    // {}\n", description));
        }
        out.push_str(&format!(
            "    {} {}({});\n",
            return_dialect(entry),
            entry.surface_name(),
            params_dialect(entry)
        ));
    }
    out.push_str("}\n");
}

/// Proxy class name for a tool server (`weather` → `WeatherTools`).
fn tool_class_name(server: &str) -> String {
    let mut name = String::new();
    let mut upper_next = true;
    for ch in server.chars() {
        if ch.is_alphanumeric() {
            if upper_next {
                name.extend(ch.to_uppercase());
                upper_next = false;
            } else {
                name.push(ch);
            }
        } else {
            upper_next = true;
        }
    }
    name.push_str("Tools");
    name
}

fn emit_tool_runtime(out: &mut String, server: &str, tools: &[ToolSpec]) {
    out.push_str(&format!("static class {} {{\n", tool_class_name(server)));
    for tool in tools {
        out.push_str(&format!(
            "    public static object {}(object args) {{ return Host.InvokeTool(\"{}\", \"{}\", args); }}\n",
            tool.name, server, tool.name
        ));
    }
    out.push_str("}\n");
}

fn emit_tool_signatures(out: &mut String, server: &str, tools: &[ToolSpec]) {
    out.push_str(&format!("// Tools provided by server '{}'\n", server));
    out.push_str(&format!("static class {} {{\n", tool_class_name(server)));
    for tool in tools {
        let args = tool
            .argument_summary()
            .into_iter()
            .map(|(name, required)| {
                if required {
                    format!("{} (required)", name)
                } else {
                    name
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        if args.is_empty() {
            out.push_str(&format!("    // {}\n", tool.description));
        } else {
            out.push_str(&format!("    // {} (args: {})\n", tool.description, args));
        }
        out.push_str(&format!("    object {}(object args);\n", tool.name));
    }
    out.push_str("}\n");
}

/// Concatenate the runtime text, the live-instance declarations, and the
/// user script into the final execution payload.
///
/// Each live non-root instance becomes `<Type> <name> = new <Type>("<handle>");`
/// named by its lower-cased type name (duplicates suffixed with an index);
/// root instances (handle equal to the type name) are constructed
/// parameterless.  The user script follows after a blank line.
pub fn compose_script(bundle: &ProxyBundle, live: &[(String, String)], body: &str) -> String {
    let mut text = bundle.runtime_text.clone();
    if !text.ends_with('\n') {
        text.push('\n');
    }

    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for (handle, type_name) in live {
        let base = type_name.to_lowercase();
        let n = counts.entry(base.clone()).or_insert(0);
        *n += 1;
        let name = if *n == 1 {
            base
        } else {
            format!("{}{}", base, n)
        };
        if handle == type_name {
            text.push_str(&format!("{} {} = new {}();\n", type_name, name, type_name));
        } else {
            text.push_str(&format!(
                "{} {} = new {}(\"{}\");\n",
                type_name, name, type_name, handle
            ));
        }
    }

    text.push('\n');
    text.push_str(body);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scriptor::operator::{CatalogBuilder, InvokeOutcome, MethodFn, ParamKind};
    use serde_json::Value;

    fn noop() -> MethodFn {
        Arc::new(|_recv, _args| Box::pin(async { Ok(InvokeOutcome::Value(Value::Null)) }))
    }

    fn sample_catalog() -> Arc<OperatorCatalog> {
        let mut builder = CatalogBuilder::new();
        builder.dto(DtoModel::new(
            "TestModel",
            &[("A", ParamKind::Integer), ("B", ParamKind::Integer)],
        ));
        builder
            .operator(
                OperatorDescriptor::self_rooted("TestRootOperator")
                    .with_description("Entry point operator")
                    .method(
                        MethodEntry::new("GetSimpleOperator", &[])
                            .returns_operator("SimpleOperator")
                            .with_description("Creates the simple operator"),
                    ),
            )
            .unwrap();
        builder
            .operator(
                OperatorDescriptor::handle_assigned("SimpleOperator")
                    .method(
                        MethodEntry::new(
                            "AddNumbers",
                            &[("model", ParamKind::Object("TestModel".to_string()))],
                        )
                        .returns(ParamKind::Integer)
                        .handler(noop()),
                    )
                    .method(
                        MethodEntry::new(
                            "ConcatenateAsync",
                            &[("a", ParamKind::String), ("b", ParamKind::String)],
                        )
                        .asynchronous()
                        .returns(ParamKind::String)
                        .handler(noop()),
                    ),
            )
            .unwrap();
        Arc::new(builder.build().unwrap())
    }

    #[tokio::test]
    async fn runtime_text_starts_with_the_host_binding_stub() {
        let bundle = ProxyBuilder::build(sample_catalog(), Arc::new(ToolServerRegistry::new()))
            .await
            .unwrap();
        assert!(bundle.runtime_text.starts_with("ProxyRuntime.Host = Host;"));
        assert!(bundle.runtime_text.contains("class TestModel {"));
        assert!(bundle
            .runtime_text
            .contains("public long A { get; set; }"));
    }

    #[tokio::test]
    async fn async_suffix_is_trimmed_but_raw_name_is_forwarded() {
        let bundle = ProxyBuilder::build(sample_catalog(), Arc::new(ToolServerRegistry::new()))
            .await
            .unwrap();
        // Surface name has no Async suffix...
        assert!(bundle.runtime_text.contains("public string Concatenate(string a, string b)"));
        assert!(!bundle.signatures_text.contains("ConcatenateAsync"));
        // ...but the forwarded raw method name keeps it.
        assert!(bundle.runtime_text.contains("\"ConcatenateAsync\""));
    }

    #[tokio::test]
    async fn operator_returning_method_wraps_the_handle() {
        let bundle = ProxyBuilder::build(sample_catalog(), Arc::new(ToolServerRegistry::new()))
            .await
            .unwrap();
        assert!(bundle.runtime_text.contains(
            "public SimpleOperator GetSimpleOperator() { return new SimpleOperator("
        ));
    }

    #[tokio::test]
    async fn signatures_and_runtime_declare_the_same_method_names() {
        let bundle = ProxyBuilder::build(sample_catalog(), Arc::new(ToolServerRegistry::new()))
            .await
            .unwrap();
        for name in &["GetSimpleOperator", "AddNumbers", "Concatenate"] {
            assert!(bundle.runtime_text.contains(name), "runtime lacks {}", name);
            assert!(
                bundle.signatures_text.contains(name),
                "signatures lack {}",
                name
            );
        }
    }

    #[tokio::test]
    async fn async_trim_collision_fails_the_build() {
        let mut builder = CatalogBuilder::new();
        builder
            .operator(
                OperatorDescriptor::static_facade("Ops")
                    .method(MethodEntry::new("Fetch", &[]).handler(noop()))
                    .method(
                        MethodEntry::new("FetchAsync", &[])
                            .asynchronous()
                            .handler(noop()),
                    ),
            )
            .unwrap();
        let catalog = Arc::new(builder.build().unwrap());
        let err = ProxyBuilder::build(catalog, Arc::new(ToolServerRegistry::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("surface name collision"));
    }

    #[tokio::test]
    async fn composed_script_declares_live_instances() {
        let bundle = ProxyBuilder::build(sample_catalog(), Arc::new(ToolServerRegistry::new()))
            .await
            .unwrap();
        let live = vec![
            ("TestRootOperator".to_string(), "TestRootOperator".to_string()),
            ("a1b2".to_string(), "SimpleOperator".to_string()),
            ("c3d4".to_string(), "SimpleOperator".to_string()),
        ];
        let text = compose_script(&bundle, &live, "return 1;");
        assert!(text.contains("TestRootOperator testrootoperator = new TestRootOperator();"));
        assert!(text.contains("SimpleOperator simpleoperator = new SimpleOperator(\"a1b2\");"));
        assert!(text.contains("SimpleOperator simpleoperator2 = new SimpleOperator(\"c3d4\");"));
        assert!(text.ends_with("\nreturn 1;"));
        // User text comes after a blank line.
        assert!(text.contains(";\n\nreturn 1;"));
    }
}
