//! Integration tests for the server lifecycle over real FIFOs.
//!
//! A small `/bin/sh` script stands in for the yues server: it opens the two
//! pipes it is given, sends `INIT`, and answers requests with canned results.
//!
//! # Running
//!
//! ```bash
//! cargo test --test process_lifecycle -- --nocapture
//! ```
//!
//! # CI Configuration
//!
//! Tests can be skipped in environments that cannot spawn processes by
//! setting `YUES_BRIDGE_SKIP_PROCESS_TESTS=1`.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::timeout;

use yues_bridge::{
    BridgeError, Server, ServerConfig, ServerState, ShutdownAction, ShutdownPolicy, StoppedBy,
};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Answers IIFE/CREATE/CALL/REMOVE and exits on the quit script.
const COOPERATIVE_SERVER: &str = r#"
exec 3<"$1"
exec 4>"$2"
printf '{"type":"INIT"}\n' >&4
while IFS= read -r line <&3; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *MessageLoop.quit*) exit 0 ;;
    *notify*)
      printf '{"type":"POSTMESSAGE","val":"hello"}\n' >&4
      printf '{"type":"IIFE_R","id":"%s","res":null}\n' "$id" >&4 ;;
    *fail*) printf '{"type":"IIFE_R","id":"%s","err":"boom"}\n' "$id" >&4 ;;
    *'"type":"IIFE"'*) printf '{"type":"IIFE_R","id":"%s","res":42}\n' "$id" >&4 ;;
    *'"type":"CREATE"'*) printf '{"type":"CREATE_R","id":"%s","res":"h1"}\n' "$id" >&4 ;;
    *'"type":"CALL"'*) printf '{"type":"CALL_R","id":"%s","res":2}\n' "$id" >&4 ;;
    *'"type":"REMOVE"'*) printf '{"type":"REMOVE_R","id":"%s","res":null}\n' "$id" >&4 ;;
  esac
done
"#;

/// Signals readiness, then ignores every request and SIGTERM.
const STUBBORN_SERVER: &str = r#"
trap '' TERM
exec 3<"$1"
exec 4>"$2"
printf '{"type":"INIT"}\n' >&4
while :; do sleep 0.05 3<&- 4>&-; done
"#;

/// Signals readiness, then ignores requests but dies on SIGTERM.
const TERMINABLE_SERVER: &str = r#"
exec 3<"$1"
exec 4>"$2"
printf '{"type":"INIT"}\n' >&4
while :; do sleep 0.05 3<&- 4>&-; done
"#;

/// Check if process tests should be skipped.
fn should_skip_process_tests() -> bool {
    std::env::var("YUES_BRIDGE_SKIP_PROCESS_TESTS").is_ok() || !Path::new("/bin/sh").exists()
}

fn sh_config(script: &str, dir: &TempDir) -> ServerConfig {
    ServerConfig::default()
        .with_program("/bin/sh")
        .with_args(["-c", script, "yues-mock"])
        .with_pipe_dir(dir.path())
        .with_startup_timeout(Some(Duration::from_secs(5)))
}

fn pipe_dir_is_empty(dir: &TempDir) -> bool {
    std::fs::read_dir(dir.path()).unwrap().next().is_none()
}

/// Test: Start, evaluate, and stop cooperatively.
#[tokio::test]
async fn test_exec_and_cooperative_shutdown() {
    if should_skip_process_tests() {
        println!("Skipping process test (YUES_BRIDGE_SKIP_PROCESS_TESTS set)");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(sh_config(COOPERATIVE_SERVER, &dir));

    timeout(TEST_TIMEOUT, server.start())
        .await
        .expect("Test timed out")
        .expect("Server should start");
    assert_eq!(server.state(), ServerState::Running);

    let pipes = server.pipe_paths().await.expect("Running server has pipes");
    assert!(pipes.inbound.exists() && pipes.outbound.exists());
    assert!(server.pid().await.is_some());

    let value = timeout(TEST_TIMEOUT, server.exec("return 40 + 2", &[], vec![]))
        .await
        .expect("Test timed out")
        .expect("Exec should succeed");
    assert_eq!(value, json!(42));

    let err = timeout(TEST_TIMEOUT, server.exec("fail()", &[], vec![]))
        .await
        .expect("Test timed out")
        .unwrap_err();
    match err {
        BridgeError::Application(text) => assert_eq!(text, "boom"),
        other => panic!("Expected Application error, got {:?}", other),
    }

    let outcome = timeout(TEST_TIMEOUT, server.shutdown_with_timeout(Duration::from_secs(4)))
        .await
        .expect("Test timed out")
        .expect("Shutdown should succeed")
        .expect("First shutdown reports an outcome");

    assert_eq!(outcome.stopped_by, StoppedBy::Tier(0, ShutdownAction::Quit));
    assert!(outcome.status.success());
    assert_eq!(server.state(), ServerState::Terminated);
    assert!(!pipes.inbound.exists() && !pipes.outbound.exists());
    assert!(pipe_dir_is_empty(&dir));

    // Shutdown is idempotent and the server refuses further work.
    assert!(server.shutdown().await.unwrap().is_none());
    assert!(matches!(
        server.exec("return 1", &[], vec![]).await,
        Err(BridgeError::Lifecycle(_))
    ));
}

/// Test: Remote function proxy against a live process.
#[tokio::test]
async fn test_remote_function_lifecycle() {
    if should_skip_process_tests() {
        println!("Skipping process test (YUES_BRIDGE_SKIP_PROCESS_TESTS set)");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(sh_config(COOPERATIVE_SERVER, &dir));
    timeout(TEST_TIMEOUT, server.start())
        .await
        .expect("Test timed out")
        .expect("Server should start");

    let func = timeout(TEST_TIMEOUT, server.create_function("return 1+1", &[]))
        .await
        .expect("Test timed out")
        .expect("Function should register");
    assert_eq!(func.handle().map(|h| h.as_str()), Some("h1"));
    assert_eq!(func.describe(), "function ()\nreturn 1+1\nend");

    let value = timeout(TEST_TIMEOUT, func.invoke(vec![]))
        .await
        .expect("Test timed out")
        .expect("Invoke should succeed");
    assert_eq!(value, json!(2));

    timeout(TEST_TIMEOUT, func.dispose())
        .await
        .expect("Test timed out")
        .expect("Dispose should succeed");
    assert!(matches!(
        func.invoke(vec![]).await,
        Err(BridgeError::Initialization(_))
    ));

    timeout(TEST_TIMEOUT, server.shutdown())
        .await
        .expect("Test timed out")
        .expect("Shutdown should succeed");
}

/// Test: Posted messages reach subscribers.
#[tokio::test]
async fn test_notifications_from_process() {
    if should_skip_process_tests() {
        println!("Skipping process test (YUES_BRIDGE_SKIP_PROCESS_TESTS set)");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(sh_config(COOPERATIVE_SERVER, &dir));
    timeout(TEST_TIMEOUT, server.start())
        .await
        .expect("Test timed out")
        .expect("Server should start");

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = server
        .on_notification(move |value| sink.lock().unwrap().push(value.clone()))
        .expect("Running server accepts subscribers");

    // The notification is written before the result, so it is dispatched first.
    timeout(TEST_TIMEOUT, server.exec("notify()", &[], vec![]))
        .await
        .expect("Test timed out")
        .expect("Exec should succeed");
    assert_eq!(*seen.lock().unwrap(), vec![json!("hello")]);

    assert!(server.remove_notification(subscription).unwrap());

    timeout(TEST_TIMEOUT, server.shutdown())
        .await
        .expect("Test timed out")
        .expect("Shutdown should succeed");
}

/// Test: A child ignoring quit and SIGTERM is killed within the budget.
#[tokio::test]
async fn test_shutdown_escalates_to_kill() {
    if should_skip_process_tests() {
        println!("Skipping process test (YUES_BRIDGE_SKIP_PROCESS_TESTS set)");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(sh_config(STUBBORN_SERVER, &dir));
    timeout(TEST_TIMEOUT, server.start())
        .await
        .expect("Test timed out")
        .expect("Server should start");
    let pipes = server.pipe_paths().await.unwrap();

    let budget = Duration::from_millis(1000);
    let outcome = timeout(TEST_TIMEOUT, server.shutdown_with_timeout(budget))
        .await
        .expect("Test timed out")
        .expect("Shutdown should succeed")
        .unwrap();

    assert_eq!(outcome.stopped_by, StoppedBy::Kill);
    assert_eq!(outcome.status.signal(), Some(Signal::SIGKILL as i32));
    assert!(outcome.elapsed >= budget, "Killed too early: {:?}", outcome.elapsed);
    assert!(
        outcome.elapsed < budget + Duration::from_secs(2),
        "Shutdown exceeded budget: {:?}",
        outcome.elapsed
    );
    assert!(!pipes.inbound.exists() && !pipes.outbound.exists());
    assert_eq!(server.state(), ServerState::Terminated);
}

/// Test: SIGTERM tier stops a child that ignores only the quit request.
#[tokio::test]
async fn test_shutdown_stops_at_sigterm() {
    if should_skip_process_tests() {
        println!("Skipping process test (YUES_BRIDGE_SKIP_PROCESS_TESTS set)");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let policy = ShutdownPolicy::split(Duration::from_millis(600));
    let server = Server::new(sh_config(TERMINABLE_SERVER, &dir).with_shutdown_policy(policy));
    timeout(TEST_TIMEOUT, server.start())
        .await
        .expect("Test timed out")
        .expect("Server should start");

    let outcome = timeout(TEST_TIMEOUT, server.shutdown())
        .await
        .expect("Test timed out")
        .expect("Shutdown should succeed")
        .unwrap();

    assert_eq!(
        outcome.stopped_by,
        StoppedBy::Tier(1, ShutdownAction::Signal(Signal::SIGTERM))
    );
    assert_eq!(outcome.status.signal(), Some(Signal::SIGTERM as i32));
    assert!(pipe_dir_is_empty(&dir));
}

/// Test: A child exiting before it opens the pipes fails startup cleanly.
#[tokio::test]
async fn test_early_exit_fails_start() {
    if should_skip_process_tests() {
        println!("Skipping process test (YUES_BRIDGE_SKIP_PROCESS_TESTS set)");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(sh_config("exit 3", &dir));

    let err = timeout(TEST_TIMEOUT, server.start())
        .await
        .expect("Test timed out")
        .unwrap_err();
    assert!(matches!(err, BridgeError::Lifecycle(_)), "got {:?}", err);
    assert_eq!(server.state(), ServerState::Terminated);
    assert!(pipe_dir_is_empty(&dir));
}

/// Test: A child that never signals readiness hits the startup timeout.
#[tokio::test]
async fn test_startup_timeout() {
    if should_skip_process_tests() {
        println!("Skipping process test (YUES_BRIDGE_SKIP_PROCESS_TESTS set)");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let config = sh_config("exec sleep 5", &dir).with_startup_timeout(Some(Duration::from_millis(300)));
    let server = Server::new(config);

    let err = timeout(TEST_TIMEOUT, server.start())
        .await
        .expect("Test timed out")
        .unwrap_err();
    match err {
        BridgeError::Lifecycle(msg) => assert!(msg.contains("did not become ready"), "{}", msg),
        other => panic!("Expected Lifecycle error, got {:?}", other),
    }
    assert!(pipe_dir_is_empty(&dir));
}

/// Test: A server waiting for INIT reports `Starting` and refuses requests.
#[tokio::test]
async fn test_state_is_starting_until_ready() {
    if should_skip_process_tests() {
        println!("Skipping process test (YUES_BRIDGE_SKIP_PROCESS_TESTS set)");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let config = sh_config("exec sleep 5", &dir).with_startup_timeout(Some(Duration::from_secs(1)));
    let server = Arc::new(Server::new(config));

    let starting = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    timeout(TEST_TIMEOUT, async {
        while server.state() != ServerState::Starting {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Server never reported Starting");

    match server.exec("return 1", &[], vec![]).await {
        Err(BridgeError::Lifecycle(msg)) => assert!(msg.contains("not running"), "{}", msg),
        other => panic!("Expected Lifecycle error, got {:?}", other),
    }
    assert!(server.on_notification(|_| {}).is_err());

    let result = timeout(TEST_TIMEOUT, starting)
        .await
        .expect("Test timed out")
        .expect("Task panicked");
    assert!(matches!(result, Err(BridgeError::Lifecycle(_))));
    assert_eq!(server.state(), ServerState::Terminated);
    assert!(pipe_dir_is_empty(&dir));
}
