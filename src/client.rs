//! Client builder and facade.
//!
//! The [`ClientBuilder`] configures and launches a worker; the [`Client`]
//! exposes the single RPC primitive [`Client::invoke`] that every named
//! filesystem operation is built on, plus an idempotent [`Client::close`].
//! The lifecycle is:
//! 1. Spawn the worker over fresh pipe pairs
//! 2. Hand the generation to a supervisor task
//! 3. Wait (bounded) for the engine loop to signal readiness
//! 4. Serve `invoke` calls until closed or dropped
//!
//! Any number of tasks may call `invoke` concurrently; each waits on its own
//! completion signal, and responses are correlated by id, not arrival order.
//! The engine never holds a reference to the `Client`, so dropping the last
//! handle reclaims everything: the supervisor observes the close flag and
//! the command channel closing, terminates the worker and reaps it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::Command;
use crate::error::{IoprocError, Result};
use crate::supervisor::{Supervisor, WorkerConfig};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on how long construction waits for the engine loop.
pub const DEFAULT_WAIT_UNTIL_READY: Duration = Duration::from_secs(2);

/// Default command channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Process-wide sequence for default client names.
static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Builder for configuring and starting an ioproc client.
pub struct ClientBuilder {
    worker_path: PathBuf,
    name: Option<String>,
    timeout: Duration,
    max_threads: u32,
    max_queued_requests: i64,
    wait_until_ready: Duration,
    channel_capacity: usize,
    graceful_shutdown: bool,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            worker_path: PathBuf::from("ioproc-worker"),
            name: None,
            timeout: DEFAULT_TIMEOUT,
            max_threads: 0,
            max_queued_requests: -1,
            wait_until_ready: DEFAULT_WAIT_UNTIL_READY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            graceful_shutdown: false,
        }
    }

    /// Path of the worker executable to spawn.
    pub fn worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = path.into();
        self
    }

    /// Client name used in logs. Defaults to `ioproc-<seq>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Default timeout applied by the convenience operations.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Maximum concurrent worker threads, enforced by the worker.
    /// 0 means unlimited. Default: 0.
    pub fn max_threads(mut self, max_threads: u32) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Maximum requests queued in the worker beyond the running ones;
    /// exhaustion is reported per-request as an `EAGAIN`-class error.
    /// -1 means unlimited. Default: -1.
    pub fn max_queued_requests(mut self, max_queued_requests: i64) -> Self {
        self.max_queued_requests = max_queued_requests;
        self
    }

    /// How long `start()` waits for the engine loop before warning.
    pub fn wait_until_ready(mut self, wait: Duration) -> Self {
        self.wait_until_ready = wait;
        self
    }

    /// Command channel capacity. Default: 1024.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Terminate the worker with SIGTERM instead of SIGKILL, giving an
    /// instrumented worker a chance to flush (e.g. under valgrind).
    pub fn graceful_shutdown(mut self, graceful: bool) -> Self {
        self.graceful_shutdown = graceful;
        self
    }

    /// Spawn the worker and start the client.
    pub async fn start(self) -> Result<Client> {
        Client::start(self).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running ioproc client.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Client {
    name: Arc<str>,
    timeout: Duration,
    next_request_id: AtomicU64,
    cmd_tx: mpsc::Sender<Command>,
    closed: watch::Sender<bool>,
    pid: Arc<AtomicU32>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    async fn start(builder: ClientBuilder) -> Result<Self> {
        let name: Arc<str> = builder
            .name
            .unwrap_or_else(|| format!("ioproc-{}", CLIENT_SEQ.fetch_add(1, Ordering::Relaxed)))
            .into();
        info!(client = %name, "starting client");

        let config = WorkerConfig {
            worker_path: builder.worker_path,
            max_threads: builder.max_threads,
            max_queued_requests: builder.max_queued_requests,
            graceful_shutdown: builder.graceful_shutdown,
        };

        let pid = Arc::new(AtomicU32::new(0));
        let supervisor = Supervisor::new(config, name.clone(), pid.clone());
        let handle = supervisor.spawn_worker()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(builder.channel_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(supervisor.run(handle, cmd_rx, closed_rx, ready_tx));

        if tokio::time::timeout(builder.wait_until_ready, ready_rx)
            .await
            .is_err()
        {
            warn!(client = %name, "timeout waiting for communication loop to start");
        }

        Ok(Client {
            name,
            timeout: builder.timeout,
            next_request_id: AtomicU64::new(1),
            cmd_tx,
            closed: closed_tx,
            pid,
            supervisor: Mutex::new(Some(task)),
        })
    }

    /// The client's name, as used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid of the current worker generation.
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    /// The default timeout applied by the convenience operations.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one request to the worker and wait for its response.
    ///
    /// Fails with [`IoprocError::Closed`] if the client was closed, with
    /// [`IoprocError::Timeout`] if no response arrived within `timeout`
    /// (the request slot is then released; a late answer is discarded), and
    /// with [`IoprocError::Operation`] if the worker answered with a
    /// non-zero error code, including the synthetic crash code when the
    /// worker died while the request was in flight. Requests complete in
    /// whatever order the worker finishes them.
    pub async fn invoke(&self, method: &str, args: Value, timeout: Duration) -> Result<Value> {
        if *self.closed.borrow() {
            return Err(IoprocError::Closed);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Invoke {
                id,
                method: method.to_string(),
                args,
                reply: reply_tx,
            })
            .await
            .map_err(|_| IoprocError::Closed)?;

        let response = match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => {
                // Best-effort: frees the pending slot so the table cannot
                // grow without bound; a full channel just means the engine
                // is busy and the entry dies with the generation instead.
                let _ = self.cmd_tx.try_send(Command::Forget { id });
                return Err(IoprocError::Timeout);
            }
            // The engine dropped the entry without answering; only happens
            // on clean shutdown.
            Ok(Err(_)) => return Err(IoprocError::Closed),
            Ok(Ok(response)) => response,
        };

        if response.errcode != 0 {
            let errstr = response.errstr.unwrap_or_else(|| {
                std::io::Error::from_raw_os_error(response.errcode).to_string()
            });
            return Err(IoprocError::Operation {
                errcode: response.errcode,
                errstr,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Close the client. Idempotent: the first call flips the closed flag
    /// and wakes the engine; with `sync` it also waits until the supervisor
    /// task (and with it the worker process) is gone. Requests still in
    /// flight fail with [`IoprocError::Closed`].
    pub async fn close(&self, sync: bool) {
        if self.closed.send_replace(true) {
            return;
        }
        info!(client = %self.name, "closing client");

        if sync {
            let task = self.supervisor.lock().await.take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Best-effort close; the supervisor also notices the command
        // channel closing, so the worker is reclaimed either way.
        self.closed.send_replace(true);
    }
}
