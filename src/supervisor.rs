//! Worker process supervision: spawning, crash detection, restart.
//!
//! A generation is one spawned worker plus its engine loop and descriptor
//! set. The supervisor owns the generation lifecycle as an explicit loop:
//! spawn, run the engine, tear down, and, if the client is still open,
//! spawn the next generation. Restart reuses the same command channel, so
//! commands enqueued while a generation was dying are delivered to the next
//! one in order. A failed respawn is not retried: queued commands are failed
//! with the crash error and the client behaves as closed from then on.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::engine::{Command, Engine, LoopExit};
use crate::error::{IoprocError, Result};
use crate::protocol::Response;

/// Launch parameters for the worker executable.
#[derive(Debug, Clone)]
pub(crate) struct WorkerConfig {
    pub worker_path: PathBuf,
    /// Maximum concurrent worker threads; 0 means unlimited.
    pub max_threads: u32,
    /// Maximum queued requests beyond the running ones; -1 means unlimited.
    pub max_queued_requests: i64,
    /// Terminate the worker with SIGTERM instead of SIGKILL.
    pub graceful_shutdown: bool,
}

/// One live worker generation's process and descriptors.
///
/// Replaced wholesale on restart, never mutated field-by-field.
pub(crate) struct WorkerHandle {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub response_rx: pipe::Receiver,
    pub request_tx: pipe::Sender,
    pub pid: u32,
}

pub(crate) struct Supervisor {
    config: WorkerConfig,
    name: Arc<str>,
    /// Pid of the current generation, shared with the client facade.
    pid: Arc<AtomicU32>,
}

impl Supervisor {
    pub fn new(config: WorkerConfig, name: Arc<str>, pid: Arc<AtomicU32>) -> Self {
        Self { config, name, pid }
    }

    /// Spawn a worker process wired up over fresh pipe pairs.
    ///
    /// The worker's pipe ends are left inheritable and their descriptor
    /// numbers passed on the command line; the client's ends are marked
    /// close-on-exec and put into non-blocking mode for the engine loop.
    pub fn spawn_worker(&self) -> Result<WorkerHandle> {
        debug!(client = %self.name, "spawning worker");

        // Request channel: engine writes, worker reads.
        let (worker_read, client_write) = anon_pipe().map_err(IoprocError::Spawn)?;
        // Response channel: worker writes, engine reads.
        let (client_read, worker_write) = anon_pipe().map_err(IoprocError::Spawn)?;

        set_cloexec(&client_write, true).map_err(IoprocError::Spawn)?;
        set_cloexec(&client_read, true).map_err(IoprocError::Spawn)?;
        set_nonblocking(&client_write).map_err(IoprocError::Spawn)?;
        set_nonblocking(&client_read).map_err(IoprocError::Spawn)?;

        let mut child = tokio::process::Command::new(&self.config.worker_path)
            .arg("--read-pipe-fd")
            .arg(fd_arg(&worker_read))
            .arg("--write-pipe-fd")
            .arg(fd_arg(&worker_write))
            .arg("--max-threads")
            .arg(self.config.max_threads.to_string())
            // `=` form so a negative (unlimited) value is not read as a flag
            .arg(format!(
                "--max-queued-requests={}",
                self.config.max_queued_requests
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(IoprocError::Spawn)?;

        // The worker inherited its ends; close our copies of them.
        drop(worker_read);
        drop(worker_write);

        let pid = child.id().unwrap_or(0);
        let stdout = child.stdout.take().ok_or_else(|| stdio_gone("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| stdio_gone("stderr"))?;

        let response_rx = pipe::Receiver::from_owned_fd(client_read).map_err(IoprocError::Spawn)?;
        let request_tx = pipe::Sender::from_owned_fd(client_write).map_err(IoprocError::Spawn)?;

        info!(client = %self.name, pid, "worker started");
        self.pid.store(pid, Ordering::Relaxed);

        Ok(WorkerHandle {
            child,
            stdout,
            stderr,
            response_rx,
            request_tx,
            pid,
        })
    }

    /// Generation loop. `ready_tx` fires when the first engine loop is up,
    /// unblocking the client constructor's readiness wait.
    pub async fn run(
        self,
        mut handle: WorkerHandle,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut closed_rx: watch::Receiver<bool>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let mut ready = Some(ready_tx);

        loop {
            let mut engine = Engine::new(handle, self.name.clone());
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }

            let exit = engine.run(&mut cmd_rx, &mut closed_rx).await;
            let crashed = matches!(exit, LoopExit::Fatal(_));
            if let LoopExit::Fatal(ref e) = exit {
                error!(client = %self.name, error = %e, "worker communication failed");
            }
            engine
                .teardown(crashed, self.config.graceful_shutdown)
                .await;

            match exit {
                LoopExit::Closed => break,
                LoopExit::Fatal(_) => {
                    if self.is_closed(&closed_rx) {
                        break;
                    }
                    info!(client = %self.name, "restarting worker");
                    handle = match self.spawn_worker() {
                        Ok(handle) => handle,
                        Err(e) => {
                            error!(client = %self.name, error = %e, "respawn failed, giving up");
                            fail_queued(&mut cmd_rx);
                            break;
                        }
                    };
                }
            }
        }

        debug!(client = %self.name, "supervisor finished");
    }

    fn is_closed(&self, closed_rx: &watch::Receiver<bool>) -> bool {
        closed_rx.has_changed().is_err() || *closed_rx.borrow()
    }
}

/// Fail every command still queued with the crash error so no caller is
/// left waiting after the supervisor gives up.
fn fail_queued(cmd_rx: &mut mpsc::Receiver<Command>) {
    while let Ok(command) = cmd_rx.try_recv() {
        if let Command::Invoke { id, reply, .. } = command {
            let _ = reply.send(Response::crashed(id));
        }
    }
}

fn anon_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: pipe(2) fills `fds` with two fresh descriptors we take
    // ownership of; they are not close-on-exec, so the worker inherits its
    // ends across exec.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

fn set_cloexec(fd: &OwnedFd, enabled: bool) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let new_flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(raw, libc::F_SETFD, new_flags) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn fd_arg(fd: &OwnedFd) -> String {
    use std::os::fd::AsRawFd;
    fd.as_raw_fd().to_string()
}

fn stdio_gone(channel: &str) -> IoprocError {
    IoprocError::Spawn(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("worker {channel} unavailable"),
    ))
}
