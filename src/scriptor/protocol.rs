//! Runner wire protocol codec.
//!
//! The orchestration process and the script runner exchange newline-delimited
//! UTF-8 JSON frames, one logical message per line, in both directions.  Each
//! frame is an object carrying a `type` discriminator:
//!
//! | `type` | direction | payload |
//! |---|---|---|
//! | `log` | runner → client | `{level, message, exception?, source?}` |
//! | `exec-request` | client → runner | `{id, code}` |
//! | `exec-result` | runner → client | `{id, result?, error?}` |
//! | `invoke-request` | runner → client | `{id, target, method, handleId?, args}` |
//! | `mcp-invoke-request` | runner → client | `{id, server, tool, arguments}` |
//! | `invoke-result` | client → runner | `{id, result?, error?}` |
//!
//! Unknown discriminators are surfaced as [`Decoded::Unknown`] so callers can
//! log and ignore them; malformed JSON raises a [`ProtocolError`] that is
//! logged while the session continues.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt;

/// Error raised for frames that cannot be decoded at all.
///
/// Protocol errors are never fatal: the demultiplexer logs them and keeps
/// reading the next line.
#[derive(Debug, Clone)]
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        ProtocolError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protocol error: {}", self.message)
    }
}

impl Error for ProtocolError {}

/// One logical frame of the runner protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RunnerMessage {
    /// Diagnostic record forwarded onto the host's log sink.
    #[serde(rename = "log")]
    Log {
        level: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },

    /// Ask the runner to execute a script.
    #[serde(rename = "exec-request")]
    ExecRequest { id: String, code: String },

    /// The runner's answer to an [`RunnerMessage::ExecRequest`].
    ///
    /// Exactly one of `result` (a JSON value, possibly null) or `error` is
    /// present; absence of both means a null result.
    #[serde(rename = "exec-result")]
    ExecResult {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A running script calling back into a host operator method.
    #[serde(rename = "invoke-request")]
    InvokeRequest {
        id: String,
        target: String,
        method: String,
        #[serde(rename = "handleId", default, skip_serializing_if = "Option::is_none")]
        handle_id: Option<String>,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// A running script calling an external tool server.
    #[serde(rename = "mcp-invoke-request")]
    McpInvokeRequest {
        id: String,
        server: String,
        tool: String,
        #[serde(default)]
        arguments: Map<String, Value>,
    },

    /// The host's answer to either invoke request kind.
    #[serde(rename = "invoke-result")]
    InvokeResult {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// The discriminators this codec understands.
const KNOWN_KINDS: [&str; 6] = [
    "log",
    "exec-request",
    "exec-result",
    "invoke-request",
    "mcp-invoke-request",
    "invoke-result",
];

/// Outcome of decoding one line.
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed frame of a known kind.
    Message(RunnerMessage),
    /// Valid JSON with an unrecognized `type`; callers log and ignore it.
    Unknown(String),
    /// A blank or whitespace-only line.
    Empty,
}

/// Decode one wire line.
pub fn decode_line(line: &str) -> Result<Decoded, ProtocolError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return Ok(Decoded::Empty);
    }

    let value: Value = serde_json::from_str(line)
        .map_err(|e| ProtocolError::new(format!("malformed frame: {}", e)))?;

    let kind = match value.get("type").and_then(|t| t.as_str()) {
        Some(kind) => kind.to_string(),
        None => return Err(ProtocolError::new("frame has no `type` discriminator")),
    };

    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Ok(Decoded::Unknown(kind));
    }

    let message: RunnerMessage = serde_json::from_value(value)
        .map_err(|e| ProtocolError::new(format!("bad `{}` payload: {}", kind, e)))?;
    Ok(Decoded::Message(message))
}

/// Encode one frame as a `\n`-terminated wire line.
pub fn encode_line(message: &RunnerMessage) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| ProtocolError::new(format!("unencodable frame: {}", e)))?;
    line.push('\n');
    Ok(line)
}

/// Forward a decoded `log` frame onto the `log` facade at the matching level.
pub fn forward_log(level: &str, message: &str, exception: Option<&str>, source: Option<&str>) {
    let rendered = match (exception, source) {
        (Some(e), Some(s)) => format!("[runner:{}] {} ({})", s, message, e),
        (Some(e), None) => format!("[runner] {} ({})", message, e),
        (None, Some(s)) => format!("[runner:{}] {}", s, message),
        (None, None) => format!("[runner] {}", message),
    };
    match level.to_ascii_lowercase().as_str() {
        "error" | "critical" | "fatal" => log::error!("{}", rendered),
        "warn" | "warning" => log::warn!("{}", rendered),
        "debug" | "trace" | "verbose" => log::debug!("{}", rendered),
        _ => log::info!("{}", rendered),
    }
}
