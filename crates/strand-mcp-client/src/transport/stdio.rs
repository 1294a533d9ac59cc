//! Stdio transport: spawn an MCP server as a child process and frame
//! newline-delimited JSON over its standard streams.
//!
//! Three workers cooperate so that reading, writing, and stderr draining
//! never block each other: an inbound task reads and classifies stdout
//! lines, an outbound task serializes queued messages to stdin, and an
//! error task republishes stderr lines to a sink the user may consume.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use strand_mcp_protocol::JsonRpcMessage;
use strand_mcp_session::{InboundHandler, Transport, TransportError};

/// Outbound messages buffered before writers block.
const OUTBOUND_QUEUE: usize = 64;

/// How long a graceful close waits for the child to exit after stdin closes.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

/// How to launch the server process.
#[derive(Debug, Clone)]
pub struct StdioServerParameters {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl StdioServerParameters {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Transport over a child process's standard streams.
pub struct StdioTransport {
    params: StdioServerParameters,
    started: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    stderr_lines: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl StdioTransport {
    pub fn new(params: StdioServerParameters) -> Self {
        Self {
            params,
            started: AtomicBool::new(false),
            outbound: Mutex::new(None),
            stderr_lines: Mutex::new(None),
            writer_task: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
        }
    }

    /// Take the stream of stderr lines emitted by the server process.
    /// Returns `None` if the transport has not started or the stream was
    /// already taken.
    pub fn stderr_lines(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.stderr_lines.lock().take()
    }

    /// Destroy the server process without draining.
    pub async fn close_forcibly(&self) -> Result<(), TransportError> {
        let _ = self.outbound.lock().take();
        if let Some(mut child) = self.child.lock().await.take() {
            child.kill().await.map_err(TransportError::Io)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self, handler: InboundHandler) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "stdio transport already started".to_string(),
            ));
        }

        let mut command = Command::new(&self.params.command);
        command
            .args(&self.params.args)
            .envs(&self.params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.params.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(TransportError::Io)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stdout unavailable".to_string())
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stdin unavailable".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stderr unavailable".to_string())
        })?;

        // Inbound worker: one line, one message. The handler future is
        // awaited per message, so session routing backpressures the read.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match JsonRpcMessage::from_json(line) {
                            Ok(message) => handler(message).await,
                            Err(err) => {
                                warn!(error = %err, "dropping malformed frame from server stdout")
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("server stdout reached EOF");
                        break;
                    }
                    Err(err) => {
                        error!(error = %err, "failed reading server stdout");
                        break;
                    }
                }
            }
        });

        // Outbound worker: serialize, terminate with \n, flush per message.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<JsonRpcMessage>(OUTBOUND_QUEUE);
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = outbound_rx.recv().await {
                let mut line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        error!(error = %err, "failed to serialize outbound message");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(err) = stdin.write_all(line.as_bytes()).await {
                    error!(error = %err, "failed writing to server stdin");
                    break;
                }
                if let Err(err) = stdin.flush().await {
                    error!(error = %err, "failed flushing server stdin");
                    break;
                }
            }
            // Dropping stdin closes the pipe: EOF is the shutdown signal the
            // server sees.
        });

        // Error worker: drain stderr so the child never blocks on it.
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(line = %line, "server stderr");
                let _ = stderr_tx.send(line);
            }
        });

        *self.outbound.lock() = Some(outbound_tx);
        *self.stderr_lines.lock() = Some(stderr_rx);
        *self.writer_task.lock() = Some(writer);
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let sender = self
            .outbound
            .lock()
            .as_ref()
            .cloned()
            .ok_or(TransportError::Closed)?;
        sender
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close_gracefully(&self) -> Result<(), TransportError> {
        // Stop accepting sends; the writer drains what is queued, then drops
        // the child's stdin.
        let _ = self.outbound.lock().take();
        let writer = self.writer_task.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        let mut child_slot = self.child.lock().await;
        if let Some(mut child) = child_slot.take() {
            match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(status = %status, "server process exited"),
                Ok(Err(err)) => return Err(TransportError::Io(err)),
                Err(_) => {
                    warn!("server process did not exit in time, killing it");
                    child.kill().await.map_err(TransportError::Io)?;
                }
            }
        }
        Ok(())
    }
}
