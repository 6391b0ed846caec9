//! Per-generation communication loop.
//!
//! One engine task owns every descriptor of a worker generation: the
//! worker's stdout and stderr, the response pipe, and the request pipe. It
//! multiplexes readiness across all of them with `tokio::select!`, so a
//! single slow channel can never starve the others:
//!
//! - diagnostic bytes are fed to the per-channel log demultiplexers,
//! - response bytes are assembled into frames and matched against the
//!   pending-request table by id,
//! - at most one outgoing request is in flight; while it drains, new
//!   commands stay queued on the command channel.
//!
//! Any hangup, read/write failure or protocol violation is fatal to the
//! generation: the loop returns to the supervisor, which fails every
//! outstanding request with a synthetic crash response, reaps the worker and
//! (if the client is still open) starts the next generation.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::error::IoprocError;
use crate::logdemux::LogDemultiplexer;
use crate::protocol::{decode_response, encode_request, Response, ResponseBuffer};
use crate::supervisor::WorkerHandle;
use crate::writer::OutgoingMessage;

/// Read chunk size for the diagnostic channels.
const LOG_READ_SIZE: usize = 1024;

/// Read chunk size for the response channel.
const RESPONSE_READ_SIZE: usize = 64 * 1024;

/// A unit of work enqueued by the client facade.
#[derive(Debug)]
pub(crate) enum Command {
    /// Send a request and route its response to `reply`. The id was
    /// allocated by the client before enqueueing.
    Invoke {
        id: u64,
        method: String,
        args: Value,
        reply: oneshot::Sender<Response>,
    },
    /// Drop the pending entry for a request whose caller timed out; a late
    /// response for it will be discarded.
    Forget { id: u64 },
}

/// Why the loop stopped.
pub(crate) enum LoopExit {
    /// The client was closed or dropped; clean shutdown.
    Closed,
    /// Transport or protocol failure; the supervisor decides on a restart.
    Fatal(IoprocError),
}

/// State of one worker generation, owned exclusively by the engine task.
pub(crate) struct Engine {
    name: Arc<str>,
    pid: u32,
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    response_rx: pipe::Receiver,
    request_tx: pipe::Sender,
    pending: HashMap<u64, oneshot::Sender<Response>>,
    responses: ResponseBuffer,
    outgoing: Option<OutgoingMessage>,
    stdout_logs: LogDemultiplexer,
    stderr_logs: LogDemultiplexer,
}

impl Engine {
    pub fn new(handle: WorkerHandle, name: Arc<str>) -> Self {
        let WorkerHandle {
            child,
            stdout,
            stderr,
            response_rx,
            request_tx,
            pid,
        } = handle;
        Self {
            name,
            pid,
            child,
            stdout,
            stderr,
            response_rx,
            request_tx,
            pending: HashMap::new(),
            responses: ResponseBuffer::new(),
            outgoing: None,
            stdout_logs: LogDemultiplexer::new("stdout"),
            stderr_logs: LogDemultiplexer::new("stderr"),
        }
    }

    /// Run the loop until the client closes or the generation dies.
    pub async fn run(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<Command>,
        closed_rx: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        debug!(client = %self.name, pid = self.pid, "communication loop started");

        let mut stdout_buf = [0u8; LOG_READ_SIZE];
        let mut stderr_buf = [0u8; LOG_READ_SIZE];
        let mut response_buf = vec![0u8; RESPONSE_READ_SIZE];

        loop {
            let writing = self.outgoing.is_some();

            tokio::select! {
                biased;

                changed = closed_rx.changed() => {
                    if changed.is_err() || *closed_rx.borrow_and_update() {
                        info!(client = %self.name, "shutdown requested");
                        return LoopExit::Closed;
                    }
                }

                read = self.stdout.read(&mut stdout_buf) => {
                    match read {
                        Ok(0) => return LoopExit::Fatal(channel_closed("stdout")),
                        Ok(n) => {
                            for record in self.stdout_logs.feed(&stdout_buf[..n]) {
                                record.emit(&self.name);
                            }
                        }
                        Err(e) => return LoopExit::Fatal(e.into()),
                    }
                }

                read = self.stderr.read(&mut stderr_buf) => {
                    match read {
                        Ok(0) => return LoopExit::Fatal(channel_closed("stderr")),
                        Ok(n) => {
                            for record in self.stderr_logs.feed(&stderr_buf[..n]) {
                                record.emit(&self.name);
                            }
                        }
                        Err(e) => return LoopExit::Fatal(e.into()),
                    }
                }

                read = self.response_rx.read(&mut response_buf) => {
                    match read {
                        Ok(0) => return LoopExit::Fatal(channel_closed("response channel")),
                        Ok(n) => {
                            let payloads = match self.responses.push(&response_buf[..n]) {
                                Ok(payloads) => payloads,
                                Err(e) => return LoopExit::Fatal(e),
                            };
                            for payload in payloads {
                                if let Err(e) = self.resolve(&payload) {
                                    return LoopExit::Fatal(e);
                                }
                            }
                        }
                        Err(e) => return LoopExit::Fatal(e.into()),
                    }
                }

                written = drain(&mut self.request_tx, &mut self.outgoing), if writing => {
                    if let Err(e) = written {
                        return LoopExit::Fatal(e.into());
                    }
                    // On completion the command branch re-arms next
                    // iteration, picking up the next queued request.
                }

                command = cmd_rx.recv(), if !writing => {
                    match command {
                        None => {
                            info!(client = %self.name, "client gone");
                            return LoopExit::Closed;
                        }
                        Some(Command::Invoke { id, method, args, reply }) => {
                            if let Err(e) = self.dispatch(id, &method, &args, reply) {
                                return LoopExit::Fatal(e);
                            }
                        }
                        Some(Command::Forget { id }) => {
                            if self.pending.remove(&id).is_some() {
                                debug!(client = %self.name, id, "request forgotten after caller timeout");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Insert the pending entry and start writing the serialized request.
    fn dispatch(
        &mut self,
        id: u64,
        method: &str,
        args: &Value,
        reply: oneshot::Sender<Response>,
    ) -> crate::Result<()> {
        let frame = encode_request(id, method, args)?;
        debug!(client = %self.name, id, method, "dispatching request");
        self.pending.insert(id, reply);
        self.outgoing = Some(OutgoingMessage::new(frame));
        Ok(())
    }

    /// Decode one complete response payload and wake its caller.
    fn resolve(&mut self, payload: &[u8]) -> crate::Result<()> {
        let response = decode_response(payload)?;
        let id = response.id;
        match self.pending.remove(&id) {
            Some(reply) => {
                if reply.send(response).is_err() {
                    debug!(client = %self.name, id, "response for abandoned request dropped");
                }
            }
            None => {
                warn!(client = %self.name, id, "response for unknown request id");
            }
        }
        Ok(())
    }

    /// Tear the generation down: fail outstanding requests on a crash,
    /// close this generation's descriptors, terminate and reap the worker.
    pub async fn teardown(mut self, crashed: bool, graceful: bool) {
        if crashed && !self.pending.is_empty() {
            warn!(
                client = %self.name,
                outstanding = self.pending.len(),
                "failing outstanding requests"
            );
            for (id, reply) in self.pending.drain() {
                let _ = reply.send(Response::crashed(id));
            }
        }

        drop(self.request_tx);
        drop(self.response_rx);

        if graceful {
            if let Some(pid) = self.child.id() {
                // SAFETY: plain signal delivery to the worker we spawned.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        } else {
            let _ = self.child.start_kill();
        }

        match self.child.wait().await {
            Ok(status) => debug!(client = %self.name, pid = self.pid, %status, "worker reaped"),
            Err(e) => warn!(client = %self.name, pid = self.pid, error = %e, "failed to reap worker"),
        }
    }
}

fn channel_closed(channel: &str) -> IoprocError {
    IoprocError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("worker {channel} closed"),
    ))
}

/// Drive the active outgoing message by one write, clearing it once fully
/// sent. Only ever polled while a message is active; the `None` arm exists
/// so constructing the future is harmless when the branch is disabled.
async fn drain(
    request_tx: &mut pipe::Sender,
    outgoing: &mut Option<OutgoingMessage>,
) -> std::io::Result<bool> {
    match outgoing.as_mut() {
        Some(message) => {
            let done = message.advance(request_tx).await?;
            if done {
                *outgoing = None;
            } else {
                trace!(remaining = message.remaining(), "partial request write");
            }
            Ok(done)
        }
        None => std::future::pending().await,
    }
}
