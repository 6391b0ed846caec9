//! Named filesystem operations.
//!
//! Each method is a thin request builder over [`Client::invoke`] using the
//! client's default timeout; the worker does the actual syscall. File
//! contents travel base64-encoded inside the JSON payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::Client;
use crate::error::{IoprocError, Result};
use crate::protocol::ERR_WORKER_CRASH;

/// Default mode for [`Client::mkdir`] (rwxrwxr-x).
pub const DEFAULT_MKDIR_MODE: u32 = 0o775;

/// Result of [`Client::stat`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StatResult {
    pub st_mode: u32,
    pub st_ino: u64,
    pub st_dev: u64,
    pub st_nlink: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_atime: i64,
    pub st_mtime: i64,
    pub st_ctime: i64,
    pub st_blocks: u64,
}

/// Result of [`Client::memstat`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MemStat {
    /// Resident set size of the worker, in KiB.
    pub rss: u64,
}

impl Client {
    async fn call<T: DeserializeOwned>(&self, method: &str, args: Value) -> Result<T> {
        let result = self.invoke(method, args, self.timeout()).await?;
        serde_json::from_value(result).map_err(|e| {
            IoprocError::Protocol(format!("unexpected result type for {method}: {e}"))
        })
    }

    /// Round-trip check; the worker answers `"pong"`.
    pub async fn ping(&self) -> Result<String> {
        self.call("ping", json!({})).await
    }

    /// Echo `text` back after the worker slept for `sleep` seconds.
    pub async fn echo(&self, text: &str, sleep: f64) -> Result<String> {
        self.call("echo", json!({ "text": text, "sleep": sleep }))
            .await
    }

    /// Ask the worker to abort itself. Returns whether the call failed with
    /// the expected crash error (the client restarts transparently either
    /// way).
    pub async fn crash(&self) -> bool {
        match self.invoke("crash", json!({}), self.timeout()).await {
            Err(IoprocError::Operation { errcode, .. }) => errcode == ERR_WORKER_CRASH,
            _ => false,
        }
    }

    /// Memory statistics of the worker process.
    pub async fn memstat(&self) -> Result<MemStat> {
        self.call("memstat", json!({})).await
    }

    /// `stat(2)` on `path`, following symlinks.
    pub async fn stat(&self, path: &str) -> Result<StatResult> {
        self.call("stat", json!({ "path": path })).await
    }

    /// Whether `path` exists, without following a final symlink.
    pub async fn lexists(&self, path: &str) -> Result<bool> {
        self.call("lexists", json!({ "path": path })).await
    }

    /// `access(2)` with `mode`; any failure reads as not accessible.
    pub async fn access(&self, path: &str, mode: i32) -> bool {
        self.call("access", json!({ "path": path, "mode": mode }))
            .await
            .unwrap_or(false)
    }

    /// Whether `path` is readable (and writable, if requested).
    pub async fn path_exists(&self, path: &str, writable: bool) -> bool {
        let mut check = libc::R_OK;
        if writable {
            check |= libc::W_OK;
        }
        self.access(path, check).await
    }

    /// Create a directory with the given mode (see [`DEFAULT_MKDIR_MODE`]).
    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.call("mkdir", json!({ "path": path, "mode": mode }))
            .await
    }

    /// Remove an empty directory.
    pub async fn rmdir(&self, path: &str) -> Result<()> {
        self.call("rmdir", json!({ "path": path })).await
    }

    /// List the entries of a directory.
    pub async fn listdir(&self, path: &str) -> Result<Vec<String>> {
        self.call("listdir", json!({ "path": path })).await
    }

    /// Remove a file.
    pub async fn unlink(&self, path: &str) -> Result<()> {
        self.call("unlink", json!({ "path": path })).await
    }

    /// Rename `oldpath` to `newpath`.
    pub async fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        self.call("rename", json!({ "oldpath": oldpath, "newpath": newpath }))
            .await
    }

    /// Create a symlink at `newpath` pointing to `oldpath`.
    pub async fn symlink(&self, oldpath: &str, newpath: &str) -> Result<()> {
        self.call("symlink", json!({ "oldpath": oldpath, "newpath": newpath }))
            .await
    }

    /// Change the mode of `path`.
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.call("chmod", json!({ "path": path, "mode": mode }))
            .await
    }

    /// Read a whole file. `direct` asks the worker to bypass the page
    /// cache.
    pub async fn readfile(&self, path: &str, direct: bool) -> Result<Vec<u8>> {
        let encoded: String = self
            .call("readfile", json!({ "path": path, "direct": direct }))
            .await?;
        BASE64
            .decode(encoded)
            .map_err(|e| IoprocError::Protocol(format!("undecodable readfile payload: {e}")))
    }

    /// Read a whole file split into lines.
    pub async fn readlines(&self, path: &str, direct: bool) -> Result<Vec<Vec<u8>>> {
        let data = self.readfile(path, direct).await?;
        let mut lines: Vec<Vec<u8>> = data
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line).to_vec())
            .collect();
        // A trailing newline is a terminator, not an empty last line.
        if lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        Ok(lines)
    }

    /// Write `data` to a file, replacing its contents.
    pub async fn writefile(&self, path: &str, data: &[u8], direct: bool) -> Result<()> {
        self.call(
            "writefile",
            json!({
                "path": path,
                "data": BASE64.encode(data),
                "direct": direct,
            }),
        )
        .await
    }
}
