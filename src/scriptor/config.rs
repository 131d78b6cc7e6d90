//! Configuration for the orchestrator.
//!
//! Options are plain structs constructed in code — no config-file parsing
//! dependencies are introduced.
//!
//! # Example
//!
//! ```rust
//! use scriptor::config::{ExecutionMode, OrchestratorOptions};
//!
//! let options = OrchestratorOptions {
//!     max_fix_attempts: 2,
//!     skip_explainer: true,
//!     execution_mode: ExecutionMode::InProcess,
//!     ..OrchestratorOptions::default()
//! };
//! assert!(!options.skip_reception);
//! ```

/// Where scripts execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Embedded evaluator; no transport, direct function calls.
    InProcess,
    /// Runner executable launched as a child process over stdio.
    ExternalProcess,
    /// Runner launched inside a container image over stdio.
    Container,
}

/// Default container image used by [`ExecutionMode::Container`].
pub const DEFAULT_CONTAINER_IMAGE: &str = "scriptor/runner:latest";

/// Default executable launched by [`ExecutionMode::ExternalProcess`].
pub const DEFAULT_RUNNER_EXECUTABLE: &str = "scriptor-runner";

/// Options recognized by the orchestrator.
#[derive(Clone)]
pub struct OrchestratorOptions {
    /// Retry budget for the repair loop; total attempts = value + 1.
    pub max_fix_attempts: u32,
    /// Bypass the reception agent; every turn takes the script route.
    pub skip_reception: bool,
    /// Return raw results to the user instead of explaining them.
    pub skip_explainer: bool,
    /// Isolation mode for script execution.
    pub execution_mode: ExecutionMode,
    /// Route execution to a remote runner instead of a local one.
    pub use_remote_runner: bool,
    /// Base URL of the remote runner; required when `use_remote_runner` is set.
    pub remote_runner_base_url: Option<String>,
    /// Override the container image for [`ExecutionMode::Container`].
    pub container_image: Option<String>,
    /// Override the launch path for [`ExecutionMode::ExternalProcess`].
    pub runner_executable_path: Option<String>,
    /// Substrings denied by the default script validator.
    pub forbidden_script_keywords: Option<Vec<String>>,
    /// Override the reception agent's prompt template.
    pub reception_instructions: Option<String>,
    /// Override the script agent's prompt template.
    pub script_instructions: Option<String>,
    /// Override the explainer agent's prompt template.
    pub explainer_instructions: Option<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        OrchestratorOptions {
            max_fix_attempts: 2,
            skip_reception: false,
            skip_explainer: false,
            execution_mode: ExecutionMode::InProcess,
            use_remote_runner: false,
            remote_runner_base_url: None,
            container_image: None,
            runner_executable_path: None,
            forbidden_script_keywords: None,
            reception_instructions: None,
            script_instructions: None,
            explainer_instructions: None,
        }
    }
}
