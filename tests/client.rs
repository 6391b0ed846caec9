//! End-to-end tests against the bundled worker binary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ioproc::{Client, ClientBuilder, IoprocError, DEFAULT_MKDIR_MODE, ERR_WORKER_CRASH};

fn worker_path() -> &'static str {
    env!("CARGO_BIN_EXE_ioproc-worker")
}

async fn start_client(configure: impl FnOnce(ClientBuilder) -> ClientBuilder) -> Client {
    configure(
        Client::builder()
            .worker_path(worker_path())
            .timeout(Duration::from_secs(10)),
    )
    .start()
    .await
    .expect("failed to start client")
}

fn worker_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only probes for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

async fn wait_worker_gone(pid: u32) {
    for _ in 0..100 {
        if !worker_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("worker process {pid} still in the process table");
}

#[tokio::test]
async fn test_ping() {
    let client = start_client(|b| b.max_threads(5)).await;
    assert_eq!(client.ping().await.unwrap(), "pong");
    client.close(true).await;
}

#[tokio::test]
async fn test_two_subsequent_calls() {
    let client = start_client(|b| b.max_threads(5)).await;
    assert_eq!(client.ping().await.unwrap(), "pong");
    assert_eq!(client.ping().await.unwrap(), "pong");
    client.close(true).await;
}

#[tokio::test]
async fn test_echo() {
    let data = "a multi line\npayload with\ttabs and spaces";
    let client = start_client(|b| b.max_threads(5)).await;
    assert_eq!(client.echo(data, 0.0).await.unwrap(), data);
    client.close(true).await;
}

#[tokio::test]
async fn test_unicode_echo() {
    let data = "\u{5e9}\u{5dc}\u{5d5}\u{5dd}";
    let client = start_client(|b| b.max_threads(5)).await;
    assert_eq!(client.echo(data, 0.0).await.unwrap(), data);
    client.close(true).await;
}

/// N concurrent requests each get exactly the response matching their own
/// id, regardless of completion order.
#[tokio::test]
async fn test_concurrent_requests_correlate() {
    let count = 10usize;
    let client = Arc::new(start_client(|b| b.max_threads(count as u32)).await);

    let mut handles = Vec::new();
    for i in 0..count {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            // Staggered sleeps so completions come back out of send order.
            let sleep = 0.2 + (count - i) as f64 * 0.05;
            client.echo(&i.to_string(), sleep).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), i.to_string());
    }
    client.close(true).await;
}

#[tokio::test]
async fn test_recover_after_crash() {
    let data = "still here after the restart";
    let client = start_client(|b| b.max_threads(5)).await;

    assert_eq!(client.echo(data, 0.0).await.unwrap(), data);
    assert!(client.crash().await);
    assert_eq!(client.echo(data, 0.0).await.unwrap(), data);

    client.close(true).await;
}

/// A request in flight when the worker dies fails with the crash error
/// code, within a bounded time, not its full timeout.
#[tokio::test]
async fn test_pending_request_invalidated_on_crash() {
    let client = Arc::new(start_client(|b| b.max_threads(5).timeout(Duration::from_secs(12))).await);

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.echo("never answered", 10.0).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(client.crash().await);

    let err = slow.await.unwrap().unwrap_err();
    match err {
        IoprocError::Operation { errcode, .. } => assert_eq!(errcode, ERR_WORKER_CRASH),
        other => panic!("expected crash error, got {other:?}"),
    }

    client.close(true).await;
}

/// The caller-side timeout cancels only the wait; the client stays usable.
#[tokio::test]
async fn test_timeout() {
    let client = start_client(|b| b.max_threads(5)).await;

    let result = client
        .invoke(
            "echo",
            json!({ "text": "slow", "sleep": 5 }),
            Duration::from_millis(300),
        )
        .await;
    assert!(matches!(result, Err(IoprocError::Timeout)));

    // The forgotten request resolves later inside the worker; this call
    // must be unaffected.
    assert_eq!(client.ping().await.unwrap(), "pong");

    client.close(true).await;
}

#[tokio::test]
async fn test_closed_after_close() {
    let client = start_client(|b| b.max_threads(5)).await;
    let pid = client.pid();

    client.close(true).await;
    client.close(true).await; // idempotent

    assert!(matches!(client.ping().await, Err(IoprocError::Closed)));
    wait_worker_gone(pid).await;
}

#[tokio::test]
async fn test_drop_reaps_worker() {
    let client = start_client(|b| b.max_threads(5)).await;
    let pid = client.pid();
    assert!(worker_alive(pid));

    drop(client);
    wait_worker_gone(pid).await;
}

/// With one worker thread and a one-slot queue, two slow echoes saturate
/// the worker; a quick ping gets an immediate resource-exhaustion error
/// while both echoes still complete.
#[tokio::test]
async fn test_capacity_exhaustion() {
    let client = Arc::new(start_client(|b| b.max_threads(1).max_queued_requests(1)).await);

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.echo("hello", 2.0).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.echo("hello", 2.0).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ping = client.ping().await;
    match ping {
        Err(IoprocError::Operation { errcode, .. }) => assert_eq!(errcode, libc::EAGAIN),
        other => panic!("expected EAGAIN, got {other:?}"),
    }

    assert_eq!(first.await.unwrap().unwrap(), "hello");
    assert_eq!(second.await.unwrap().unwrap(), "hello");
    client.close(true).await;
}

#[tokio::test]
async fn test_filesystem_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_str().unwrap().to_string();
    let client = start_client(|b| b.max_threads(5)).await;

    let subdir = format!("{base}/sub");
    client.mkdir(&subdir, DEFAULT_MKDIR_MODE).await.unwrap();
    let stat = client.stat(&subdir).await.unwrap();
    assert_eq!(stat.st_mode & libc::S_IFMT, libc::S_IFDIR);

    let file = format!("{base}/sub/data.bin");
    let content = b"first line\nsecond line\n".to_vec();
    client.writefile(&file, &content, false).await.unwrap();
    assert_eq!(client.readfile(&file, false).await.unwrap(), content);

    let lines = client.readlines(&file, false).await.unwrap();
    assert_eq!(lines, vec![b"first line".to_vec(), b"second line".to_vec()]);

    let stat = client.stat(&file).await.unwrap();
    assert_eq!(stat.st_size, content.len() as u64);

    assert_eq!(client.listdir(&subdir).await.unwrap(), vec!["data.bin"]);
    assert!(client.lexists(&file).await.unwrap());
    assert!(client.path_exists(&file, true).await);

    let renamed = format!("{base}/sub/renamed.bin");
    client.rename(&file, &renamed).await.unwrap();
    assert!(!client.lexists(&file).await.unwrap());

    client.unlink(&renamed).await.unwrap();
    assert!(!client.lexists(&renamed).await.unwrap());
    client.rmdir(&subdir).await.unwrap();

    client.close(true).await;
}

#[tokio::test]
async fn test_operation_error_carries_os_code() {
    let dir = tempfile::tempdir().unwrap();
    let missing = format!("{}/does-not-exist", dir.path().display());
    let client = start_client(|b| b.max_threads(5)).await;

    let err = client.stat(&missing).await.unwrap_err();
    match err {
        IoprocError::Operation { errcode, .. } => assert_eq!(errcode, libc::ENOENT),
        other => panic!("expected ENOENT, got {other:?}"),
    }

    client.close(true).await;
}

#[tokio::test]
async fn test_memstat_reports_rss() {
    let client = start_client(|b| b.max_threads(2)).await;
    let memstat = client.memstat().await.unwrap();
    assert!(memstat.rss > 0);
    client.close(true).await;
}

#[tokio::test]
async fn test_graceful_shutdown_mode() {
    let client = start_client(|b| b.max_threads(2).graceful_shutdown(true)).await;
    let pid = client.pid();

    assert_eq!(client.ping().await.unwrap(), "pong");
    client.close(true).await;
    wait_worker_gone(pid).await;
}
