//! Newline-delimited JSON transport over a pair of byte streams.
//!
//! Works for child-process pipes, a worker's own stdin/stdout and in-memory
//! duplex streams alike. Writes go through a per-link queue drained by a
//! writer task, so [`PeerLink::send`] never blocks. The reader task forwards
//! each decoded message to the process's [`MessagePump`](super::MessagePump)
//! and reports end of stream there, after the peer's last message.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::link::{PeerLink, TransportError};
use super::pump::{Inbound, InboundSender};
use super::wire::WireMessage;
use crate::bus::{Dispatcher, PeerId};

pub struct StreamLink {
    label: String,
    outbound: mpsc::UnboundedSender<WireMessage>,
    closed: Arc<watch::Sender<bool>>,
}

impl StreamLink {
    /// Create a link writing to `writer` and spawn its writer task.
    pub fn new<W>(label: impl Into<String>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let (outbound, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        tokio::spawn(write_loop(label.clone(), writer, rx, closed.clone()));

        Arc::new(Self {
            label,
            outbound,
            closed,
        })
    }

    /// Stop accepting messages; resolves [`PeerLink::closed`].
    pub fn shutdown(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl PeerLink for StreamLink {
    fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.label.clone()));
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed(self.label.clone()))
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn write_loop<W>(
    label: String,
    writer: W,
    mut rx: mpsc::UnboundedReceiver<WireMessage>,
    closed: Arc<watch::Sender<bool>>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = writer;
    while let Some(message) = rx.recv().await {
        if *closed.borrow() {
            break;
        }
        if let Err(e) = write_message(&mut writer, &message).await {
            warn!("writing to {label} failed, closing link: {e}");
            closed.send_replace(true);
            break;
        }
    }
    debug!("writer for {label} stopped");
}

async fn write_message<W>(writer: &mut W, message: &WireMessage) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(message).map_err(TransportError::serialization)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await.map_err(TransportError::io)?;
    writer.flush().await.map_err(TransportError::io)?;
    trace!("wrote {} bytes", line.len());
    Ok(())
}

/// Spawn the reader task for an attached peer.
pub fn spawn_reader<R>(peer: PeerId, label: String, reader: R, inbound: InboundSender)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let message: WireMessage = match serde_json::from_str(line) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("dropping malformed message from {label}: {e}");
                            continue;
                        }
                    };
                    let item = Inbound::Message {
                        from: peer.clone(),
                        message,
                    };
                    if inbound.send(item).is_err() {
                        debug!("inbound queue gone, reader for {label} stopping");
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("reading from {label} failed: {e}");
                    break;
                }
            }
        }
        debug!("stream from {label} ended");
        let _ = inbound.send(Inbound::Closed { peer });
    });
}

/// Wire a stream pair into `dispatcher` as a new peer.
pub fn attach_stream<R, W>(
    dispatcher: &Dispatcher,
    label: impl Into<String>,
    reader: R,
    writer: W,
    inbound: &InboundSender,
) -> PeerId
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let label = label.into();
    let link = StreamLink::new(label.clone(), writer);
    let peer = dispatcher.attach_peer(link);
    spawn_reader(peer.clone(), label, reader, inbound.clone());
    peer
}

/// Connect a worker process to its coordinator over stdin/stdout.
///
/// Stdout carries the protocol from here on, so logs must go to stderr.
pub fn connect_parent(dispatcher: &Dispatcher, inbound: &InboundSender) -> PeerId {
    attach_stream(
        dispatcher,
        "coordinator",
        tokio::io::stdin(),
        tokio::io::stdout(),
        inbound,
    )
}

/// A worker launched with piped stdio.
#[derive(Debug)]
pub struct WorkerProcess {
    pub label: String,
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl WorkerProcess {
    /// Attach the worker to `dispatcher`, returning the child for lifecycle
    /// management.
    pub fn attach(self, dispatcher: &Dispatcher, inbound: &InboundSender) -> (PeerId, Child) {
        let peer = attach_stream(dispatcher, self.label, self.stdout, self.stdin, inbound);
        (peer, self.child)
    }
}

/// Launch `program` as a worker. Its stderr is forwarded to our log.
pub fn spawn_worker(
    label: impl Into<String>,
    program: &Path,
    args: &[String],
) -> Result<WorkerProcess, TransportError> {
    let label = label.into();
    info!("spawning worker {label}: {} {}", program.display(), args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TransportError::Process(format!("failed to spawn worker '{label}': {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::Process("failed to capture stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Process("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TransportError::Process("failed to capture stderr".to_string()))?;

    let stderr_label = label.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("[{stderr_label}] {line}");
        }
    });

    Ok(WorkerProcess {
        label,
        child,
        stdin,
        stdout,
    })
}
