//! Transports carrying runner protocol frames.
//!
//! A transport moves newline-delimited JSON lines between the orchestration
//! process and a script runner, in both directions.  Three wire variants are
//! provided:
//!
//! - [`StdioTransport`] launched as a **child process** with piped stdio;
//! - [`StdioTransport`] launched as a **container** subprocess (`docker run
//!   -i`) — same wire format, different launcher;
//! - [`RemoteTransport`] over a persistent WebSocket connection.  Reconnect
//!   is out of scope: a close is terminal for the session.
//!
//! In-process execution has no transport at all; see
//! [`InProcessRunner`](crate::scriptor::runner::InProcessRunner).
//!
//! `start` is idempotent and serialized by a lifecycle mutex.  After the peer
//! closes, `send_line` fails with [`TransportError::Closed`] until `start`
//! succeeds again.

use std::error::Error;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Transport failure modes.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The transport is not running (never started, stopped, or the peer
    /// went away).
    Closed,
    /// An I/O or connection-level failure.
    Failed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport is closed"),
            TransportError::Failed(msg) => write!(f, "transport failure: {}", msg),
        }
    }
}

impl Error for TransportError {}

/// Events delivered by a running transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// One logical wire line, without its trailing newline.
    Line(String),
    /// The transport closed; carries a human reason.  Terminal until the next
    /// `start`.
    Closed(String),
}

/// A bidirectional line carrier.
#[async_trait]
pub trait RunnerTransport: Send + Sync {
    /// Bring the transport up.
    ///
    /// Returns `Some(receiver)` with the event stream when this call actually
    /// started the transport, `None` when it was already running (idempotent).
    async fn start(
        &self,
    ) -> Result<Option<mpsc::UnboundedReceiver<TransportEvent>>, TransportError>;

    /// Tear the transport down, failing in-flight traffic.
    async fn stop(&self);

    /// Write one `\n`-terminated line to the peer.
    async fn send_line(&self, line: String) -> Result<(), TransportError>;

    /// Human-readable identifier used in log records.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Child-process / container transport
// ---------------------------------------------------------------------------

struct StdioState {
    child: Child,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

/// Runner launched as a subprocess with piped stdio.
///
/// The same transport serves two launchers: a plain child process running the
/// runner executable, and a container subprocess where the wire runs through
/// `docker run -i`.
pub struct StdioTransport {
    program: String,
    args: Vec<String>,
    lifecycle: Mutex<Option<StdioState>>,
}

impl StdioTransport {
    /// Launch the runner executable directly.
    pub fn child_process(program: impl Into<String>, args: Vec<String>) -> Self {
        StdioTransport {
            program: program.into(),
            args,
            lifecycle: Mutex::new(None),
        }
    }

    /// Launch the runner inside a container image.
    pub fn container(image: &str, command: &[String]) -> Self {
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            image.to_string(),
        ];
        args.extend_from_slice(command);
        StdioTransport {
            program: "docker".to_string(),
            args,
            lifecycle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RunnerTransport for StdioTransport {
    async fn start(
        &self,
    ) -> Result<Option<mpsc::UnboundedReceiver<TransportEvent>>, TransportError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Ok(None);
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::Failed(format!("failed to spawn {}: {}", self.program, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Failed("runner stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Failed("runner stderr unavailable".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Failed("runner stdin unavailable".to_string()))?;

        let stdin = Arc::new(Mutex::new(Some(stdin)));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Stdout pump: one event per line, Closed on EOF.
        {
            let event_tx = event_tx.clone();
            let stdin = stdin.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if event_tx.send(TransportEvent::Line(line)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            *stdin.lock().await = None;
                            let _ = event_tx.send(TransportEvent::Closed(
                                "runner process closed its output stream".to_string(),
                            ));
                            break;
                        }
                        Err(e) => {
                            *stdin.lock().await = None;
                            let _ = event_tx.send(TransportEvent::Closed(format!(
                                "runner stdout read failed: {}",
                                e
                            )));
                            break;
                        }
                    }
                }
            });
        }

        // Stderr pump: forwarded onto the log sink.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::warn!("[runner stderr] {}", line);
            }
        });

        if log::log_enabled!(log::Level::Info) {
            log::info!("StdioTransport: started {} {}", self.program, self.args.join(" "));
        }

        *lifecycle = Some(StdioState { child, stdin });
        Ok(Some(event_rx))
    }

    async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(mut state) = lifecycle.take() {
            *state.stdin.lock().await = None;
            if let Err(e) = state.child.start_kill() {
                log::debug!("StdioTransport: kill failed (already gone?): {}", e);
            }
            let _ = state.child.wait().await;
            log::info!("StdioTransport: stopped {}", self.program);
        }
    }

    async fn send_line(&self, line: String) -> Result<(), TransportError> {
        let lifecycle = self.lifecycle.lock().await;
        let state = lifecycle.as_ref().ok_or(TransportError::Closed)?;
        let mut stdin = state.stdin.lock().await;
        let sink = stdin.as_mut().ok_or(TransportError::Closed)?;
        sink.write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Failed(format!("stdin write failed: {}", e)))?;
        sink.flush()
            .await
            .map_err(|e| TransportError::Failed(format!("stdin flush failed: {}", e)))
    }

    fn describe(&self) -> String {
        format!("stdio:{}", self.program)
    }
}

// ---------------------------------------------------------------------------
// Remote transport
// ---------------------------------------------------------------------------

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Runner reached over a persistent WebSocket connection.
///
/// One text frame carries one wire line.  The connection does not reconnect:
/// when the server goes away the session is over.
pub struct RemoteTransport {
    url: String,
    lifecycle: Mutex<Option<Arc<Mutex<Option<WsSink>>>>>,
}

impl RemoteTransport {
    pub fn new(url: impl Into<String>) -> Self {
        RemoteTransport {
            url: url.into(),
            lifecycle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RunnerTransport for RemoteTransport {
    async fn start(
        &self,
    ) -> Result<Option<mpsc::UnboundedReceiver<TransportEvent>>, TransportError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Ok(None);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| {
                TransportError::Failed(format!("failed to connect to {}: {}", self.url, e))
            })?;
        let (sink, mut source) = ws_stream.split();
        let sink = Arc::new(Mutex::new(Some(sink)));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        {
            let sink = sink.clone();
            tokio::spawn(async move {
                loop {
                    match source.next().await {
                        Some(Ok(WsMessage::Text(text))) => {
                            for line in text.lines() {
                                if event_tx
                                    .send(TransportEvent::Line(line.to_string()))
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            *sink.lock().await = None;
                            let _ = event_tx.send(TransportEvent::Closed(
                                "remote runner closed the connection".to_string(),
                            ));
                            return;
                        }
                        Some(Ok(_)) => {
                            // Ping/pong and binary frames are not part of the
                            // wire contract.
                        }
                        Some(Err(e)) => {
                            *sink.lock().await = None;
                            let _ = event_tx.send(TransportEvent::Closed(format!(
                                "remote connection failed: {}",
                                e
                            )));
                            return;
                        }
                    }
                }
            });
        }

        log::info!("RemoteTransport: connected to {}", self.url);
        *lifecycle = Some(sink);
        Ok(Some(event_rx))
    }

    async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(sink) = lifecycle.take() {
            if let Some(mut ws) = sink.lock().await.take() {
                let _ = ws.send(WsMessage::Close(None)).await;
            }
            log::info!("RemoteTransport: disconnected from {}", self.url);
        }
    }

    async fn send_line(&self, line: String) -> Result<(), TransportError> {
        let lifecycle = self.lifecycle.lock().await;
        let sink = lifecycle.as_ref().ok_or(TransportError::Closed)?;
        let mut guard = sink.lock().await;
        let ws = guard.as_mut().ok_or(TransportError::Closed)?;
        ws.send(WsMessage::Text(line))
            .await
            .map_err(|e| TransportError::Failed(format!("websocket send failed: {}", e)))
    }

    fn describe(&self) -> String {
        format!("remote:{}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_before_start_is_a_closed_error() {
        let transport = StdioTransport::child_process("definitely-missing-runner", vec![]);
        match transport.send_line("{}\n".to_string()).await {
            Err(TransportError::Closed) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn spawning_a_missing_program_fails_to_start() {
        let transport = StdioTransport::child_process("definitely-missing-runner", vec![]);
        match transport.start().await {
            Err(TransportError::Failed(msg)) => assert!(msg.contains("failed to spawn")),
            other => panic!("expected a spawn failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cat_child_echoes_lines_and_closes_on_stop() {
        let transport = StdioTransport::child_process("cat", vec![]);
        let mut events = transport.start().await.unwrap().unwrap();

        // Idempotent: a second start while running yields no new receiver.
        assert!(transport.start().await.unwrap().is_none());

        transport.send_line("hello runner\n".to_string()).await.unwrap();
        match events.recv().await {
            Some(TransportEvent::Line(line)) => assert_eq!(line, "hello runner"),
            other => panic!("expected echoed line, got {:?}", other),
        }

        transport.stop().await;
        // The pump observes EOF and reports a terminal close.
        loop {
            match events.recv().await {
                Some(TransportEvent::Closed(_)) | None => break,
                Some(TransportEvent::Line(_)) => continue,
            }
        }
        match transport.send_line("late\n".to_string()).await {
            Err(TransportError::Closed) => {}
            other => panic!("expected Closed after stop, got {:?}", other),
        }
    }
}
