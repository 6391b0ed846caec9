//! Bundled worker process.
//!
//! Speaks the ioproc wire protocol over two inherited pipe descriptors whose
//! numbers arrive on the command line, and executes a subset of filesystem
//! operations with plain blocking syscalls. Capacity limits are enforced
//! here, not in the client: when all worker threads are busy and the request
//! queue is full, the request is answered immediately with `EAGAIN`.
//!
//! Diagnostics go to stderr as `LEVEL|domain|message` lines, which the
//! client demultiplexes into its structured log.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::sync::mpsc::{Receiver, Sender, SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use serde_json::{json, Value};

use ioproc::protocol::{decode_request, encode_response, Request, Response, LENGTH_SIZE};

#[derive(Parser)]
#[command(name = "ioproc-worker", about = "ioproc filesystem worker")]
struct Args {
    /// Inherited descriptor to read requests from.
    #[arg(long)]
    read_pipe_fd: i32,

    /// Inherited descriptor to write responses to.
    #[arg(long)]
    write_pipe_fd: i32,

    /// Maximum concurrent worker threads; 0 = unlimited.
    #[arg(long, default_value_t = 0)]
    max_threads: u32,

    /// Maximum queued requests beyond the running ones; -1 = unlimited.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_queued_requests: i64,
}

fn log(level: &str, domain: &str, message: &str) {
    eprintln!("{level}|{domain}|{message}");
}

type SharedWriter = Arc<Mutex<File>>;

/// An operation either yields a JSON result or an OS-style error pair.
type OpResult = Result<Value, (i32, String)>;

enum Pool {
    /// No thread limit: one thread per request.
    Unlimited,
    /// Fixed pool fed through a bounded queue.
    Bounded(SyncSender<Request>),
    /// Fixed pool fed through an unbounded queue.
    Unbounded(Sender<Request>),
}

fn main() {
    let args = Args::parse();

    // SAFETY: the client created these descriptors for us and passed their
    // numbers on the command line; we take sole ownership of both.
    let mut reader = unsafe { File::from_raw_fd(args.read_pipe_fd) };
    let writer: SharedWriter = Arc::new(Mutex::new(unsafe { File::from_raw_fd(args.write_pipe_fd) }));

    log(
        "INFO",
        "server",
        &format!(
            "worker started (pid {}, max threads {}, max queued {})",
            std::process::id(),
            args.max_threads,
            args.max_queued_requests
        ),
    );

    let pool = start_pool(args.max_threads, args.max_queued_requests, writer.clone());

    loop {
        let payload = match read_frame(&mut reader) {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                log("ERROR", "server", &format!("request read failed: {e}"));
                break;
            }
        };

        let request = match decode_request(&payload) {
            Ok(request) => request,
            Err(e) => {
                log("ERROR", "server", &format!("bad request frame: {e}"));
                break;
            }
        };

        log(
            "DEBUG",
            "server",
            &format!("request {} {}", request.id, request.method),
        );

        // Crashing must not be deferred to a pool thread: the point is to
        // take the whole process down mid-protocol.
        if request.method == "crash" {
            log("ERROR", "server", "crash requested");
            std::process::abort();
        }

        submit(&pool, request, &writer);
    }

    log("INFO", "server", "request pipe closed, exiting");
}

/// Read one length-prefixed frame. `None` on clean EOF before a frame.
fn read_frame(reader: &mut File) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LENGTH_SIZE];
    if let Err(e) = reader.read_exact(&mut len_buf) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }

    let len = u64::from_ne_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn start_pool(max_threads: u32, max_queued: i64, writer: SharedWriter) -> Pool {
    if max_threads == 0 {
        return Pool::Unlimited;
    }

    let (pool, rx) = if max_queued < 0 {
        let (tx, rx) = mpsc::channel();
        (Pool::Unbounded(tx), rx)
    } else {
        let (tx, rx) = mpsc::sync_channel(max_queued as usize);
        (Pool::Bounded(tx), rx)
    };

    let rx = Arc::new(Mutex::new(rx));
    for i in 0..max_threads {
        let rx: Arc<Mutex<Receiver<Request>>> = rx.clone();
        let writer = writer.clone();
        let _ = thread::Builder::new()
            .name(format!("ioproc-worker-{i}"))
            .spawn(move || loop {
                let request = {
                    let guard = rx.lock().unwrap_or_else(|e| e.into_inner());
                    guard.recv()
                };
                match request {
                    Ok(request) => handle(request, &writer),
                    Err(_) => break,
                }
            });
    }
    pool
}

fn submit(pool: &Pool, request: Request, writer: &SharedWriter) {
    match pool {
        Pool::Unlimited => {
            let writer = writer.clone();
            let _ = thread::Builder::new()
                .name("ioproc-worker-req".to_string())
                .spawn(move || handle(request, &writer));
        }
        Pool::Unbounded(tx) => {
            if let Err(mpsc::SendError(request)) = tx.send(request) {
                reject(request, writer);
            }
        }
        Pool::Bounded(tx) => match tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) | Err(TrySendError::Disconnected(request)) => {
                reject(request, writer);
            }
        },
    }
}

/// Capacity exhausted: answer with EAGAIN right away.
fn reject(request: Request, writer: &SharedWriter) {
    log(
        "WARNING",
        "server",
        &format!("request {} rejected, queue full", request.id),
    );
    respond(
        writer,
        &Response {
            id: request.id,
            errcode: libc::EAGAIN,
            errstr: Some("Resource temporarily unavailable".to_string()),
            result: None,
        },
    );
}

fn handle(request: Request, writer: &SharedWriter) {
    let response = match execute(&request.method, &request.args) {
        Ok(result) => Response {
            id: request.id,
            errcode: 0,
            errstr: None,
            result: Some(result),
        },
        Err((errcode, errstr)) => {
            log(
                "DEBUG",
                "server",
                &format!("request {} failed: {errstr}", request.id),
            );
            Response {
                id: request.id,
                errcode,
                errstr: Some(errstr),
                result: None,
            }
        }
    };
    respond(writer, &response);
}

fn respond(writer: &SharedWriter, response: &Response) {
    let frame = match encode_response(response) {
        Ok(frame) => frame,
        Err(e) => {
            log("ERROR", "server", &format!("unencodable response: {e}"));
            return;
        }
    };
    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = writer.write_all(&frame) {
        log("ERROR", "server", &format!("response write failed: {e}"));
    }
}

fn execute(method: &str, args: &Value) -> OpResult {
    match method {
        "ping" => Ok(json!("pong")),

        "echo" => {
            let text = str_arg(args, "text")?;
            let sleep = args.get("sleep").and_then(Value::as_f64).unwrap_or(0.0);
            if sleep > 0.0 {
                thread::sleep(Duration::from_secs_f64(sleep));
            }
            Ok(json!(text))
        }

        "memstat" => memstat(),

        "stat" => {
            let meta = fs::metadata(str_arg(args, "path")?).map_err(os_error)?;
            Ok(stat_value(&meta))
        }

        "lexists" => {
            let path = str_arg(args, "path")?;
            Ok(json!(fs::symlink_metadata(path).is_ok()))
        }

        "access" => {
            let path = str_arg(args, "path")?;
            let mode = args.get("mode").and_then(Value::as_i64).unwrap_or(0) as i32;
            let cpath = CString::new(path.as_bytes())
                .map_err(|_| (libc::EINVAL, "path contains NUL".to_string()))?;
            // SAFETY: cpath is a valid NUL-terminated string.
            let rc = unsafe { libc::access(cpath.as_ptr(), mode) };
            Ok(json!(rc == 0))
        }

        "mkdir" => {
            let path = str_arg(args, "path")?;
            let mode = args.get("mode").and_then(Value::as_u64).unwrap_or(0o775) as u32;
            fs::DirBuilder::new()
                .mode(mode)
                .create(path)
                .map_err(os_error)?;
            Ok(Value::Null)
        }

        "rmdir" => {
            fs::remove_dir(str_arg(args, "path")?).map_err(os_error)?;
            Ok(Value::Null)
        }

        "listdir" => {
            let mut names = Vec::new();
            for entry in fs::read_dir(str_arg(args, "path")?).map_err(os_error)? {
                let entry = entry.map_err(os_error)?;
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            Ok(json!(names))
        }

        "unlink" => {
            fs::remove_file(str_arg(args, "path")?).map_err(os_error)?;
            Ok(Value::Null)
        }

        "rename" => {
            fs::rename(str_arg(args, "oldpath")?, str_arg(args, "newpath")?)
                .map_err(os_error)?;
            Ok(Value::Null)
        }

        "symlink" => {
            std::os::unix::fs::symlink(str_arg(args, "oldpath")?, str_arg(args, "newpath")?)
                .map_err(os_error)?;
            Ok(Value::Null)
        }

        "chmod" => {
            let path = str_arg(args, "path")?;
            let mode = args.get("mode").and_then(Value::as_u64).unwrap_or(0) as u32;
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(os_error)?;
            Ok(Value::Null)
        }

        "readfile" => {
            let data = fs::read(str_arg(args, "path")?).map_err(os_error)?;
            Ok(json!(BASE64.encode(data)))
        }

        "writefile" => {
            let path = str_arg(args, "path")?;
            let encoded = str_arg(args, "data")?;
            let data = BASE64
                .decode(encoded)
                .map_err(|e| (libc::EINVAL, format!("undecodable data: {e}")))?;
            fs::write(path, data).map_err(os_error)?;
            Ok(Value::Null)
        }

        _ => Err((libc::EINVAL, format!("unknown method {method}"))),
    }
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, (i32, String)> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| (libc::EINVAL, format!("missing argument {name}")))
}

fn os_error(e: std::io::Error) -> (i32, String) {
    (e.raw_os_error().unwrap_or(libc::EIO), e.to_string())
}

fn stat_value(meta: &fs::Metadata) -> Value {
    json!({
        "st_mode": meta.mode(),
        "st_ino": meta.ino(),
        "st_dev": meta.dev(),
        "st_nlink": meta.nlink(),
        "st_uid": meta.uid(),
        "st_gid": meta.gid(),
        "st_size": meta.size(),
        "st_atime": meta.atime(),
        "st_mtime": meta.mtime(),
        "st_ctime": meta.ctime(),
        "st_blocks": meta.blocks(),
    })
}
