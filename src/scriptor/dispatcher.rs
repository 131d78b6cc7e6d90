//! Execution dispatcher: the request/response correlator between the
//! orchestrator and the runner.
//!
//! Every `exec-request` gets a fresh 128-bit random hex id and a one-shot
//! completion slot in the correlation table.  The matching `exec-result`
//! resolves the slot; cancellation removes the slot and fails the waiting
//! caller; transport close fails every outstanding slot at once.  Slots are
//! owned one-shot senders, so a late `exec-result` for a cancelled id finds
//! no slot and is simply discarded.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::scriptor::protocol::RunnerMessage;
use crate::scriptor::transport::TransportError;

/// Failure modes of a dispatched execution.
#[derive(Debug, Clone)]
pub enum RunnerError {
    /// The runner answered with a non-empty `error` field, or the in-process
    /// evaluation raised.
    Execution(String),
    /// The transport failed or closed while the execution was in flight.
    Transport(String),
    /// The caller cancelled the execution.
    Cancelled,
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::Execution(msg) => write!(f, "{}", msg),
            RunnerError::Transport(msg) => write!(f, "Transport closed: {}", msg),
            RunnerError::Cancelled => write!(f, "Execution cancelled"),
        }
    }
}

impl Error for RunnerError {}

type CompletionSlot = oneshot::Sender<Result<Value, RunnerError>>;

/// Correlation table of in-flight executions.
#[derive(Default)]
pub struct ExecutionDispatcher {
    pending: Mutex<HashMap<String, CompletionSlot>>,
}

impl ExecutionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an opaque request id: 128 bits of randomness as hex.
    pub fn new_request_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Number of outstanding slots (diagnostics and tests).
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Send an `exec-request` through `send` and await its `exec-result`.
    ///
    /// Cancellation removes the slot before failing the caller, so a late
    /// result for the same id is discarded rather than delivered twice.
    pub async fn dispatch<F>(
        &self,
        code: String,
        send: F,
        cancel: &CancellationToken,
    ) -> Result<Value, RunnerError>
    where
        F: FnOnce(RunnerMessage) -> BoxFuture<'static, Result<(), TransportError>>,
    {
        let id = Self::new_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let request = RunnerMessage::ExecRequest {
            id: id.clone(),
            code,
        };
        if let Err(e) = send(request).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(RunnerError::Transport(e.to_string()));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.pending.lock().unwrap().remove(&id);
                Err(RunnerError::Cancelled)
            }
            completed = rx => match completed {
                Ok(result) => result,
                // The slot was dropped without completing; treat it like a
                // transport failure.
                Err(_) => Err(RunnerError::Transport("completion slot dropped".to_string())),
            }
        }
    }

    /// Resolve the slot registered for `id`, if it still exists.
    ///
    /// Returns `false` when no slot matched (already completed, cancelled, or
    /// never issued); the result is discarded in that case.
    pub fn complete(&self, id: &str, result: Result<Value, RunnerError>) -> bool {
        let slot = self.pending.lock().unwrap().remove(id);
        match slot {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding slot with a transport-closed error.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(String, CompletionSlot)> =
            self.pending.lock().unwrap().drain().collect();
        if !drained.is_empty() && log::log_enabled!(log::Level::Warn) {
            log::warn!(
                "ExecutionDispatcher: failing {} pending execution(s): {}",
                drained.len(),
                reason
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(RunnerError::Transport(reason.to_string())));
        }
    }
}
