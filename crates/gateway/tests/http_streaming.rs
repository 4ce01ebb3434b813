//! End-to-end tests for the HTTP surface.
//!
//! These tests run the real server on an ephemeral port with `/bin/sh`
//! standing in for the container CLI:
//! - Interactive terminals over websockets
//! - One-shot exec as NDJSON
//! - Log follow as server-sent events
//! - Session listing, cancellation, limits and shutdown

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gateway::server::{self, AppState, ErrorBody, StatusResponse};
use gateway::transport::terminal::LAUNCH_ERROR_PREFIX;
use gateway::{ActionLogEntry, Config};
use protocol::{EnvelopeKind, ExecEnvelope, SessionMode, SessionSummary, SseDecoder, StatusFrame};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(config);
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server::serve(listener, state.clone(), async move {
            let _ = rx.await;
        }));
        Self {
            addr,
            state,
            shutdown: Some(tx),
            handle,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn sessions(&self) -> Vec<SessionSummary> {
        self.client
            .get(self.url("/api/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Configuration running every target through `/bin/sh`.
fn sh_config() -> Config {
    let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let mut config = Config::default();
    config.targets.program = "/bin/sh".to_string();
    config.targets.terminal = args(&["-c", "exec /bin/sh", "{id}"]);
    config.targets.exec = args(&["-c", "{command}", "{id}"]);
    config.targets.follow = args(&["-c", "echo one; echo two; echo three", "{id}"]);
    config.targets.status = args(&["-c", "exit 0"]);
    config.session.terminate_grace_ms = 500;
    config.session.drain_timeout_ms = 500;
    config.server.keep_alive_secs = 1;
    config
}

fn follow_config(script: &str) -> Config {
    let mut config = sh_config();
    config.targets.follow = vec!["-c".to_string(), script.to_string(), "{id}".to_string()];
    config
}

fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn parse_envelopes(body: &str) -> Vec<ExecEnvelope> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| ExecEnvelope::from_ndjson_line(line).unwrap())
        .collect()
}

// =============================================================================
// Status and action log
// =============================================================================

#[tokio::test]
async fn test_status_reports_ok() {
    let server = TestServer::start(sh_config()).await;

    let status: StatusResponse = server
        .client
        .get(server.url("/api/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.status, "ok");
    assert!(!status.timestamp.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_action_log_read_and_clear() {
    let server = TestServer::start(sh_config()).await;

    let body = server
        .client
        .post(server.url("/api/containers/exec-stream/box"))
        .json(&serde_json::json!({"command": "echo logged"}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("logged"));

    wait_until("action log entry", || async {
        let entries: Vec<ActionLogEntry> = server
            .client
            .get(server.url("/api/logs"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        entries
            .iter()
            .any(|e| e.command == "/bin/sh -c echo logged box" && !e.is_error)
    })
    .await;

    let response = server
        .client
        .delete(server.url("/api/logs"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(server.state.action_log.is_empty());

    server.stop().await;
}

// =============================================================================
// One-shot exec
// =============================================================================

#[tokio::test]
async fn test_exec_streams_both_outputs_in_order() {
    let server = TestServer::start(sh_config()).await;

    let response = server
        .client
        .post(server.url("/api/containers/exec-stream/box"))
        .json(&serde_json::json!({
            "command": "echo a; echo x >&2; echo b; echo y >&2; echo c"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-ndjson"
    );

    let envelopes = parse_envelopes(&response.text().await.unwrap());
    let texts = |kind: EnvelopeKind| -> Vec<String> {
        envelopes
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.text.clone())
            .collect()
    };
    assert_eq!(texts(EnvelopeKind::Out), vec!["a", "b", "c"]);
    assert_eq!(texts(EnvelopeKind::Err), vec!["x", "y"]);
    assert_eq!(texts(EnvelopeKind::Sys), vec!["Command finished"]);
    assert_eq!(envelopes.last(), Some(&ExecEnvelope::sys("Command finished")));

    server.stop().await;
}

#[tokio::test]
async fn test_exec_reports_failure_status() {
    let server = TestServer::start(sh_config()).await;

    let body = server
        .client
        .post(server.url("/api/containers/exec-stream/box"))
        .json(&serde_json::json!({"command": "echo partial; exit 3"}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let envelopes = parse_envelopes(&body);
    assert_eq!(envelopes[0], ExecEnvelope::out("partial"));
    assert_eq!(
        envelopes.last(),
        Some(&ExecEnvelope::sys("Command exited with error: exit status 3"))
    );
    assert_eq!(
        envelopes.iter().filter(|e| e.kind == EnvelopeKind::Sys).count(),
        1
    );

    server.stop().await;
}

#[tokio::test]
async fn test_exec_lines_arrive_before_exit() {
    let server = TestServer::start(sh_config()).await;

    let mut response = server
        .client
        .post(server.url("/api/containers/exec-stream/box"))
        .json(&serde_json::json!({"command": "echo early; sleep 5; echo late"}))
        .send()
        .await
        .unwrap();

    let chunk = tokio::time::timeout(Duration::from_secs(3), response.chunk())
        .await
        .expect("first line was buffered until exit")
        .unwrap()
        .unwrap();
    let first = String::from_utf8_lossy(&chunk);
    assert_eq!(
        parse_envelopes(&first).first(),
        Some(&ExecEnvelope::out("early"))
    );

    drop(response);
    wait_until("exec session to close", || async {
        server.sessions().await.is_empty()
    })
    .await;

    server.stop().await;
}

#[tokio::test]
async fn test_exec_launch_failure_is_500() {
    let mut config = sh_config();
    config.targets.program = "/nonexistent/streamgate-cli".to_string();
    let server = TestServer::start(config).await;

    let response = server
        .client
        .post(server.url("/api/containers/exec-stream/box"))
        .json(&serde_json::json!({"command": "ls"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: ErrorBody = response.json().await.unwrap();
    assert!(body.error.starts_with("spawn failed"));

    let entries = server.state.action_log.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_error);
    assert!(server.sessions().await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_exec_rejects_bad_requests() {
    let server = TestServer::start(sh_config()).await;

    let response = server
        .client
        .post(server.url("/api/containers/exec-stream/a%20b"))
        .json(&serde_json::json!({"command": "ls"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = server
        .client
        .post(server.url("/api/containers/exec-stream/box"))
        .json(&serde_json::json!({"command": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    server.stop().await;
}

// =============================================================================
// Log follow
// =============================================================================

#[tokio::test]
async fn test_follow_delivers_each_line_as_event() {
    let server = TestServer::start(sh_config()).await;

    let response = server
        .client
        .get(server.url("/api/containers/logs/stream/box"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = response.bytes().await.unwrap();
    let events = SseDecoder::new().push(&body);
    let data: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(data, vec!["one", "two", "three"]);
    assert!(events.iter().all(|e| !e.is_error()));

    server.stop().await;
}

#[tokio::test]
async fn test_follow_disconnect_terminates_process() {
    let server = TestServer::start(follow_config("echo started; exec sleep 30")).await;

    let mut response = server
        .client
        .get(server.url("/api/containers/logs/stream/box"))
        .send()
        .await
        .unwrap();
    let chunk = response.chunk().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&chunk).contains("started"));

    let sessions = server.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].mode, SessionMode::LogFollow);
    let pid = sessions[0].pid.unwrap();
    assert!(process_alive(pid));

    drop(response);
    wait_until("follow process to exit", || async { !process_alive(pid) }).await;
    wait_until("session to unregister", || async {
        server.sessions().await.is_empty()
    })
    .await;

    server.stop().await;
}

#[tokio::test]
async fn test_cancel_session_via_api() {
    let server = TestServer::start(follow_config("exec sleep 30")).await;

    let response = server
        .client
        .get(server.url("/api/containers/logs/stream/box"))
        .send()
        .await
        .unwrap();

    let id = server.sessions().await[0].id.clone();
    let cancel = server
        .client
        .delete(server.url(&format!("/api/sessions/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(cancel.status(), 202);

    let body = tokio::time::timeout(Duration::from_secs(10), response.bytes())
        .await
        .expect("stream did not end after cancel")
        .unwrap();
    assert!(SseDecoder::new().push(&body).is_empty());

    let missing = server
        .client
        .delete(server.url("/api/sessions/no-such-session"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_session_limit() {
    let mut config = follow_config("exec sleep 30");
    config.session.max_sessions = 1;
    let server = TestServer::start(config).await;

    let first = server
        .client
        .get(server.url("/api/containers/logs/stream/box"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = server
        .client
        .get(server.url("/api/containers/logs/stream/box"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 503);

    drop(first);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_sessions() {
    let server = TestServer::start(follow_config("exec sleep 30")).await;

    let response = server
        .client
        .get(server.url("/api/containers/logs/stream/box"))
        .send()
        .await
        .unwrap();
    let pid = server.sessions().await[0].pid.unwrap();

    let state = server.state.clone();
    server.stop().await;

    assert!(!process_alive(pid));
    assert_eq!(state.sessions.count(), 0);
    drop(response);
}

// =============================================================================
// Interactive terminal
// =============================================================================

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Reads binary output until it contains `needle`.
async fn read_until(socket: &mut Socket, needle: &str) -> String {
    let mut output = String::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(message) = socket.next().await {
            if let WsMessage::Binary(data) = message.unwrap() {
                output.push_str(&String::from_utf8_lossy(&data));
                if output.contains(needle) {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "never saw {needle:?} in {output:?}");
    output
}

/// Reads until the final status frame.
async fn read_status(socket: &mut Socket) -> StatusFrame {
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(message) = socket.next().await {
            if let Ok(WsMessage::Text(text)) = message {
                if let Ok(status) = serde_json::from_str::<StatusFrame>(&text) {
                    return status;
                }
            }
        }
        panic!("socket closed without a status frame");
    })
    .await
    .expect("no status frame")
}

#[tokio::test]
async fn test_terminal_runs_input_and_reports_exit() {
    let server = TestServer::start(sh_config()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(server.ws_url("/api/containers/ws/box"))
        .await
        .unwrap();

    socket
        .send(WsMessage::Binary(b"echo $((40+2))\n".to_vec()))
        .await
        .unwrap();
    read_until(&mut socket, "42").await;

    socket
        .send(WsMessage::Binary(b"exit 0\n".to_vec()))
        .await
        .unwrap();
    let status = read_status(&mut socket).await;
    assert_eq!(status.kind, "exit");
    assert_eq!(status.code, Some(0));
    assert_eq!(status.reason, "process exited");

    server.stop().await;
}

#[tokio::test]
async fn test_terminal_resize_applies_before_next_input() {
    let server = TestServer::start(sh_config()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(
        server.ws_url("/api/containers/ws/box?rows=24&cols=80"),
    )
    .await
    .unwrap();

    for (rows, cols) in [(30, 100), (50, 160), (40, 120)] {
        let resize = format!(r#"{{"type":"resize","rows":{rows},"cols":{cols}}}"#);
        socket.send(WsMessage::Text(resize)).await.unwrap();
    }
    socket
        .send(WsMessage::Binary(b"stty size\n".to_vec()))
        .await
        .unwrap();
    read_until(&mut socket, "40 120").await;

    let sessions = server.sessions().await;
    assert_eq!(sessions[0].mode, SessionMode::Interactive);
    assert_eq!((sessions[0].rows, sessions[0].cols), (Some(40), Some(120)));

    socket.close(None).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_terminal_text_input_is_forwarded() {
    let server = TestServer::start(sh_config()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(server.ws_url("/api/containers/ws/box"))
        .await
        .unwrap();

    socket
        .send(WsMessage::Text("echo text_$((6*7))\n".to_string()))
        .await
        .unwrap();
    read_until(&mut socket, "text_42").await;

    socket.close(None).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_terminal_close_kills_shell() {
    let server = TestServer::start(sh_config()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(server.ws_url("/api/containers/ws/box"))
        .await
        .unwrap();

    socket
        .send(WsMessage::Binary(b"echo ready\n".to_vec()))
        .await
        .unwrap();
    read_until(&mut socket, "ready").await;

    let pid = server.sessions().await[0].pid.unwrap();
    assert!(process_alive(pid));

    socket.close(None).await.unwrap();
    drop(socket);

    wait_until("shell to exit", || async { !process_alive(pid) }).await;
    wait_until("session to unregister", || async {
        server.sessions().await.is_empty()
    })
    .await;

    server.stop().await;
}

#[tokio::test]
async fn test_terminal_launch_failure_reports_error_frame() {
    let mut config = sh_config();
    config.targets.program = "/nonexistent/streamgate-cli".to_string();
    let server = TestServer::start(config).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(server.ws_url("/api/containers/ws/box"))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(10), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match first {
        WsMessage::Text(text) => assert!(text.starts_with(LAUNCH_ERROR_PREFIX), "{text}"),
        other => panic!("expected error text frame, got {other:?}"),
    }

    server.stop().await;
}

// =============================================================================
// Complete delivery of large outputs
// =============================================================================

fn numbered(prefix: &str, count: usize) -> Vec<String> {
    (1..=count).map(|n| format!("{prefix}{n}")).collect()
}

#[tokio::test]
async fn test_exec_delivers_every_line_to_slow_client() {
    let server = TestServer::start(sh_config()).await;

    let response = server
        .client
        .post(server.url("/api/containers/exec-stream/box"))
        .json(&serde_json::json!({"command": "seq 1 5000"}))
        .send()
        .await
        .unwrap();
    // Read well after the process has exited and the drain idle limit passed.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let envelopes = parse_envelopes(&response.text().await.unwrap());
    let out: Vec<String> = envelopes
        .iter()
        .filter(|e| e.kind == EnvelopeKind::Out)
        .map(|e| e.text.clone())
        .collect();
    assert_eq!(out, numbered("", 5000));
    assert_eq!(
        envelopes.iter().filter(|e| e.kind == EnvelopeKind::Sys).count(),
        1
    );
    assert_eq!(envelopes.last(), Some(&ExecEnvelope::sys("Command finished")));

    server.stop().await;
}

#[tokio::test]
async fn test_follow_delivers_every_line_to_slow_client() {
    let server = TestServer::start(follow_config("seq 1 3000")).await;

    let response = server
        .client
        .get(server.url("/api/containers/logs/stream/box"))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let body = response.bytes().await.unwrap();
    let events = SseDecoder::new().push(&body);
    let data: Vec<String> = events.iter().map(|e| e.data.clone()).collect();
    assert_eq!(data, numbered("", 3000));
    assert!(events.iter().all(|e| !e.is_error()));

    server.stop().await;
}

#[tokio::test]
async fn test_follow_short_source_is_complete_every_time() {
    let server = TestServer::start(sh_config()).await;

    for run in 0..25 {
        let body = server
            .client
            .get(server.url("/api/containers/logs/stream/box"))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let events = SseDecoder::new().push(&body);
        let data: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["one", "two", "three"], "run {run}");
        assert!(events.iter().all(|e| !e.is_error()), "run {run}");
    }

    server.stop().await;
}

/// Reads terminal output until the final status frame.
async fn read_to_status(socket: &mut Socket) -> (String, StatusFrame) {
    let mut output = String::new();
    let status = tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(message) = socket.next().await {
            match message {
                Ok(WsMessage::Binary(data)) => output.push_str(&String::from_utf8_lossy(&data)),
                Ok(WsMessage::Text(text)) => {
                    if let Ok(status) = serde_json::from_str::<StatusFrame>(&text) {
                        return status;
                    }
                }
                _ => {}
            }
        }
        panic!("socket closed without a status frame");
    })
    .await
    .expect("no status frame");
    (output, status)
}

/// Terminal output lines made of `prefix` followed by digits.
fn numbered_lines(output: &str, prefix: &str) -> Vec<String> {
    output
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| {
            line.strip_prefix(prefix)
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        })
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_terminal_delivers_all_output_before_exit_status() {
    let server = TestServer::start(sh_config()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(server.ws_url("/api/containers/ws/box"))
        .await
        .unwrap();

    socket
        .send(WsMessage::Binary(b"seq 1 3000; exit 0\n".to_vec()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let (output, status) = read_to_status(&mut socket).await;
    assert_eq!(numbered_lines(&output, ""), numbered("", 3000));
    assert_eq!(status.code, Some(0));
    assert_eq!(status.reason, "process exited");

    server.stop().await;
}

#[tokio::test]
async fn test_terminal_resizes_do_not_lose_or_repeat_output() {
    let server = TestServer::start(sh_config()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(
        server.ws_url("/api/containers/ws/box?rows=24&cols=80"),
    )
    .await
    .unwrap();

    socket
        .send(WsMessage::Binary(
            b"stty -echo; seq 1 2000 | while read n; do echo \"n$n\"; done\n".to_vec(),
        ))
        .await
        .unwrap();

    // Resize while the loop is still printing.
    for i in 0..20u16 {
        let (rows, cols) = if i == 19 { (33, 99) } else { (20 + i, 60 + i * 3) };
        let resize = format!(r#"{{"type":"resize","rows":{rows},"cols":{cols}}}"#);
        socket.send(WsMessage::Text(resize)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    socket
        .send(WsMessage::Binary(b"stty size; exit 0\n".to_vec()))
        .await
        .unwrap();

    let (output, status) = read_to_status(&mut socket).await;
    assert_eq!(numbered_lines(&output, "n"), numbered("n", 2000));
    assert!(output.contains("33 99"), "final size missing from {output:?}");
    assert_eq!(status.code, Some(0));

    server.stop().await;
}
