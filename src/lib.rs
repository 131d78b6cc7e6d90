// src/lib.rs

// Import the top-level `scriptor` module.
pub mod scriptor;

// Re-export the submodules at the crate root so callers don't have to
// navigate the whole hierarchy (scriptor::agent::... instead of
// scriptor::scriptor::agent::...).
pub use scriptor::{
    agent, client_wrapper, clients, config, dispatcher, explainer, invocation, operator,
    orchestrator, protocol, proxy, reception, repair, runner, tool_server, tool_servers,
    transport, validator,
};

// Re-exporting key items for easier external access.
pub use scriptor::agent::{AgentThread, ChatAgent};
pub use scriptor::client_wrapper::{ClientWrapper, Message, Role};
pub use scriptor::config::{ExecutionMode, OrchestratorOptions};
pub use scriptor::orchestrator::{Orchestrator, OrchestratorBuilder};

/// Initialize the process-wide logger from the `RUST_LOG` environment.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
