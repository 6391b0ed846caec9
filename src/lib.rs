//! # ioproc
//!
//! Client for running filesystem I/O in a separate, supervised worker
//! process, so a single stuck or crashing syscall cannot block or kill the
//! caller.
//!
//! ## Architecture
//!
//! - **Wire protocol** (two anonymous pipes): length-prefixed JSON frames,
//!   requests one way, responses the other, correlated by id
//! - **Diagnostics** (worker stdout/stderr): `LEVEL|domain|message` lines,
//!   demultiplexed into `tracing` events
//! - **Engine**: one task per worker generation owns all descriptors and
//!   multiplexes them; crashes fail outstanding requests and trigger a
//!   transparent restart
//!
//! ## Example
//!
//! ```ignore
//! use ioproc::Client;
//!
//! #[tokio::main]
//! async fn main() -> ioproc::Result<()> {
//!     let client = Client::builder()
//!         .worker_path("/usr/libexec/ioproc-worker")
//!         .max_threads(4)
//!         .start()
//!         .await?;
//!
//!     let stat = client.stat("/var/lib/data").await?;
//!     println!("mode {:o}", stat.st_mode);
//!
//!     client.close(true).await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logdemux;
pub mod protocol;

mod client;
mod engine;
mod ops;
mod supervisor;
mod writer;

pub use client::{Client, ClientBuilder, DEFAULT_TIMEOUT};
pub use error::{IoprocError, Result};
pub use ops::{MemStat, StatResult, DEFAULT_MKDIR_MODE};
pub use protocol::ERR_WORKER_CRASH;
