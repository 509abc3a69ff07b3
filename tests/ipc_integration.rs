//! Integration tests for the worker transport.
//!
//! These tests drive real child processes: small bash scripts standing in
//! for the memoria worker, written to a temporary directory. They exercise
//! spawning, the handshake, request routing over real pipes, stderr
//! draining, timeouts and worker exit.
//!
//! # Running
//!
//! ```bash
//! cargo test --test ipc_integration -- --nocapture
//! ```

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memoria::config::WorkerConfig;
use memoria::ipc::{ConnectionState, IpcError, RpcClient};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use tokio::time::timeout;

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared prologue: read requests line by line and pull out the id.
///
/// The request id is the last member of every envelope, so the greedy
/// match lands on it even when params carry an `id` of their own.
const READ_LOOP: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
"#;

const INIT_REPLY: &str = r#"
    *'"method":"initialize"'*)
      printf '{"protocol":"2.0","id":%s,"result":{"serverInfo":{"name":"mock-worker"}}}\n' "$id" ;;
"#;

const READ_LOOP_END: &str = r#"
  esac
done
"#;

/// Write a mock worker whose `case` arms are `arms`.
fn write_worker(dir: &TempDir, arms: &str) -> WorkerConfig {
    let script = format!("{}{}{}{}", READ_LOOP, INIT_REPLY, arms, READ_LOOP_END);
    script_config(dir, "worker.sh", &script)
}

/// Config that runs `body` with bash.
fn script_config(dir: &TempDir, name: &str, body: &str) -> WorkerConfig {
    let path = dir.path().join(name);
    std::fs::write(&path, body).expect("Failed to write mock worker");
    bash_config(&path)
}

fn bash_config(script: &Path) -> WorkerConfig {
    WorkerConfig {
        command: "bash".to_string(),
        args: vec![script.display().to_string()],
        handshake_timeout_ms: 5_000,
        request_timeout_ms: 5_000,
        shutdown_grace_ms: 200,
        ..WorkerConfig::default()
    }
}

/// A worker that answers every memory method.
fn memory_worker(dir: &TempDir) -> WorkerConfig {
    write_worker(
        dir,
        r#"
    *'"method":"memory_search"'*)
      printf '{"protocol":"2.0","id":%s,"result":{"content":[{"text":"[{\\"id\\":\\"1\\",\\"content\\":\\"foo\\",\\"doc_type\\":\\"note\\",\\"source\\":\\"x\\"}]"}]}}\n' "$id" ;;
    *'"method":"memory_list"'*)
      printf '{"protocol":"2.0","id":%s,"result":[]}\n' "$id" ;;
    *'"method":"memory_store"'*)
      printf '{"protocol":"2.0","id":%s,"result":{"id":"m-1"}}\n' "$id" ;;
    *'"method":"memory_stats"'*)
      printf '{"protocol":"2.0","id":%s,"result":{"total_documents":1,"components":{"fts":"ok"}}}\n' "$id" ;;
    *'"method":"memory_recall"'*)
      printf '{"protocol":"2.0","id":%s,"result":null}\n' "$id" ;;
    *'"method":"memory_delete"'*)
      printf '{"protocol":"2.0","id":%s,"result":{"deleted":true}}\n' "$id" ;;
    *)
      printf '{"protocol":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
"#,
    )
}

async fn connected(config: WorkerConfig) -> RpcClient {
    let client = RpcClient::new(config);
    timeout(TEST_TIMEOUT, client.connect())
        .await
        .expect("Test timed out")
        .expect("Failed to connect to mock worker");
    client
}

#[tokio::test]
async fn test_search_roundtrip_over_stdio() {
    let dir = TempDir::new().unwrap();
    let client = connected(memory_worker(&dir)).await;

    assert_eq!(client.state(), ConnectionState::Ready);
    assert!(client.worker_pid().is_some());
    assert_eq!(
        client.capabilities(),
        Some(json!({"serverInfo": {"name": "mock-worker"}}))
    );

    let entries = timeout(TEST_TIMEOUT, client.search("foo", 20))
        .await
        .expect("Test timed out");

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "1");
    assert_eq!(entries[0].doc_type, "note");

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_every_typed_method_against_worker() {
    let dir = TempDir::new().unwrap();
    let client = connected(memory_worker(&dir)).await;

    let run = async {
        assert!(client.list(10).await.is_empty());
        assert_eq!(client.recall("nope").await, None);

        let id = client
            .store(&memoria::models::NewMemory::new("hello").with_tags(["greeting"]))
            .await
            .unwrap();
        assert_eq!(id, "m-1");

        let stats = client.get_stats().await.unwrap();
        assert_eq!(stats.total_documents, 1);
        assert_eq!(stats.components["fts"], json!("ok"));

        client.delete("m-1").await.unwrap();
    };
    timeout(TEST_TIMEOUT, run).await.expect("Test timed out");

    let err = client
        .call_default("memory_compact", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::Remote { code: -32601, .. }));

    client.disconnect().await;
}

#[tokio::test]
async fn test_concurrent_callers_share_one_worker() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(connected(memory_worker(&dir)).await);

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client.search(&format!("query {}", i), 5).await.len()
        }));
    }

    for handle in handles {
        let found = timeout(TEST_TIMEOUT, handle)
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(found, 1);
    }
    assert_eq!(client.pending_count(), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn test_noise_on_stdout_and_stderr_is_tolerated() {
    let dir = TempDir::new().unwrap();
    let config = write_worker(
        &dir,
        r#"
    *'"method":"memory_stats"'*)
      echo "loading index..." >&2
      echo "DeprecationWarning: something old"
      printf '{"protocol":"2.0","method":"log","params":{"msg":"hi"}}\n'
      printf '{"protocol":"2.0","id":9999,"result":"stray"}\n'
      printf '{"protocol":"2.0","id":%s,' "$id"
      sleep 0.05
      printf '"result":{"total_documents":7}}\n' ;;
"#,
    );
    let client = connected(config).await;

    let stats = timeout(TEST_TIMEOUT, client.get_stats())
        .await
        .expect("Test timed out")
        .unwrap();

    assert_eq!(stats.total_documents, 7);
    assert!(client.is_ready());

    client.disconnect().await;
}

#[tokio::test]
async fn test_spawn_failure_is_connection_error() {
    let client = RpcClient::new(
        WorkerConfig::from_command_line("/nonexistent/memoria-worker --stdio").unwrap(),
    );

    let err = client.connect().await.unwrap_err();

    assert!(matches!(err, IpcError::Spawn { .. }));
    assert!(err.is_connection_error());
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_connect_with_retry_reports_last_error() {
    let client = RpcClient::new(WorkerConfig::from_command_line("/nonexistent/worker").unwrap());

    let started = Instant::now();
    let err = timeout(TEST_TIMEOUT, client.connect_with_retry(3))
        .await
        .expect("Test timed out")
        .unwrap_err();

    assert!(matches!(err, IpcError::Spawn { .. }));
    // Two backoff sleeps: 100ms + 200ms.
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_worker_exiting_before_handshake() {
    let dir = TempDir::new().unwrap();
    let config = script_config(&dir, "crash.sh", "echo 'worker failed to start' >&2\nexit 1\n");
    let client = RpcClient::new(config);

    let err = timeout(TEST_TIMEOUT, client.connect())
        .await
        .expect("Test timed out")
        .unwrap_err();

    assert!(matches!(err, IpcError::Handshake(_)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.call_default("memory_stats", json!({})).await,
        Err(IpcError::NotConnected)
    ));
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let dir = TempDir::new().unwrap();
    // Ignores everything but the handshake.
    let client = connected(write_worker(&dir, "")).await;

    let started = Instant::now();
    let err = client
        .call("memory_stats", json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, IpcError::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < TEST_TIMEOUT);
    assert_eq!(client.pending_count(), 0);
    assert!(client.is_ready());

    client.disconnect().await;
}

#[tokio::test]
async fn test_worker_crash_fails_in_flight_call() {
    let dir = TempDir::new().unwrap();
    let config = write_worker(
        &dir,
        r#"
    *'"method":"memory_list"'*)
      exit 3 ;;
"#,
    );
    let client = connected(config).await;

    let err = timeout(
        TEST_TIMEOUT,
        client.call("memory_list", json!({"limit": 5}), Duration::from_secs(5)),
    )
    .await
    .expect("Test timed out")
    .unwrap_err();

    assert!(matches!(err, IpcError::ConnectionClosed));
    assert_eq!(client.state(), ConnectionState::Closed);

    // The typed read path stays non-fatal.
    assert!(client.list(5).await.is_empty());
}

#[tokio::test]
async fn test_disconnect_kills_worker_ignoring_stdin_close() {
    let dir = TempDir::new().unwrap();
    let script = r#"
IFS= read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
printf '{"protocol":"2.0","id":%s,"result":{}}\n' "$id"
trap '' TERM
while true; do sleep 1; done
"#;
    let client = connected(script_config(&dir, "stubborn.sh", script)).await;
    assert!(client.worker_pid().is_some());

    let started = Instant::now();
    timeout(TEST_TIMEOUT, client.disconnect())
        .await
        .expect("disconnect should not hang");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_reconnect_after_worker_exit() {
    let dir = TempDir::new().unwrap();
    let client = connected(memory_worker(&dir)).await;
    let first_pid = client.worker_pid();

    client.disconnect().await;
    timeout(TEST_TIMEOUT, client.connect())
        .await
        .expect("Test timed out")
        .unwrap();

    assert!(client.is_ready());
    assert_ne!(client.worker_pid(), first_pid);
    assert_eq!(client.search("foo", 1).await.len(), 1);

    client.disconnect().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_worker_exiting_on_its_own_is_reaped() {
    let dir = TempDir::new().unwrap();
    let config = write_worker(
        &dir,
        r#"
    *'"method":"memory_list"'*)
      exit 0 ;;
"#,
    );
    let client = connected(config).await;
    let pid = client.worker_pid().expect("spawned worker has a pid");

    assert!(client.list(5).await.is_empty());
    assert_eq!(client.state(), ConnectionState::Closed);

    // A zombie keeps its /proc entry until the parent waits on it.
    let proc_entry = Path::new("/proc").join(pid.to_string());
    let reaped = async {
        while proc_entry.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    timeout(TEST_TIMEOUT, reaped)
        .await
        .expect("Exited worker was never reaped");
}
