//! End-to-end tests against a real executor: actual HTTP listener, actual
//! WebSocket upgrade, actual pty children.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use catty_exec::config::ExecConfig;
use catty_exec::server::{router, ExecState};
use catty_protocol::ControlFrame;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN: &str = "test-capability-token";
const DEADLINE: Duration = Duration::from_secs(10);

async fn start_executor(command: &[&str], workspace: PathBuf) -> SocketAddr {
    let config = ExecConfig {
        listen_addr: "127.0.0.1:0".into(),
        connect_token: Some(TOKEN.into()),
        command: command.iter().map(|part| part.to_string()).collect(),
        workspace_dir: workspace,
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let app = router(ExecState::new(config));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn ws_connect(addr: SocketAddr, token: &str) -> Result<WsStream, WsError> {
    let mut request = format!("ws://{addr}/connect")
        .into_client_request()
        .expect("client request");
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {token}")).expect("bearer header"),
    );
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn expect_ready(ws: &mut WsStream) {
    let message = timeout(DEADLINE, ws.next())
        .await
        .expect("first frame before deadline")
        .expect("stream open")
        .expect("frame");
    match message {
        Message::Text(text) => {
            let frame = ControlFrame::parse(&text).expect("parse first frame");
            assert_eq!(frame, ControlFrame::Ready, "first frame must be ready");
        }
        other => panic!("expected ready text frame first, got {other:?}"),
    }
}

/// Accumulate binary output (lossily decoded) until `needle` appears.
/// Control frames arriving in between are collected separately.
async fn read_output_until(ws: &mut WsStream, needle: &str) -> String {
    let mut output = String::new();
    let result = timeout(DEADLINE, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    output.push_str(&String::from_utf8_lossy(&bytes));
                    if output.contains(needle) {
                        return;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => panic!("socket error while waiting for {needle:?}: {err}"),
                None => panic!("socket closed while waiting for {needle:?}"),
            }
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "timed out waiting for {needle:?}; output so far: {output:?}"
    );
    output
}

async fn read_until_exit(ws: &mut WsStream) -> (i32, Option<String>) {
    timeout(DEADLINE, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ControlFrame::Exit { code, signal }) = ControlFrame::parse(&text) {
                        return (code, signal);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => panic!("socket error while waiting for exit: {err}"),
                None => panic!("socket closed before exit frame"),
            }
        }
    })
    .await
    .expect("exit frame before deadline")
}

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(&mut cursor);
    for (name, contents) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(contents.as_bytes()).expect("write entry");
    }
    writer.finish().expect("finish zip");
    cursor.into_inner()
}

/// Pull the number out of a `PID=<digits>=DIP` marker. The echoed command
/// line contains the unexpanded `$$`, so only real output matches.
fn marked_pid(output: &str) -> Option<u64> {
    for (index, _) in output.match_indices("PID=") {
        let rest = &output[index + 4..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if !digits.is_empty() && rest[digits.len()..].starts_with("=DIP") {
            return digits.parse().ok();
        }
    }
    None
}

#[tokio::test]
async fn healthz_is_public() {
    let workspace = tempfile::tempdir().expect("workspace");
    let addr = start_executor(&["/bin/cat"], workspace.path().into()).await;

    let response = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .expect("healthz request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "ok");
}

#[tokio::test]
async fn upload_rejects_bad_bearers_before_any_side_effect() {
    let workspace = tempfile::tempdir().expect("workspace");
    let addr = start_executor(&["/bin/cat"], workspace.path().into()).await;
    let client = reqwest::Client::new();

    for auth in [None, Some("Bearer wrong"), Some("Basic dXNlcjpwdw==")] {
        let mut request = client
            .post(format!("http://{addr}/upload"))
            .body(zip_bytes(&[("a.txt", "hi")]));
        if let Some(auth) = auth {
            request = request.header("authorization", auth);
        }
        let response = request.send().await.expect("upload request");
        assert_eq!(response.status(), 401, "auth header {auth:?}");
    }
    assert!(
        std::fs::read_dir(workspace.path())
            .expect("read workspace")
            .next()
            .is_none(),
        "rejected uploads must not write anything"
    );
}

#[tokio::test]
async fn upload_extracts_once_then_conflicts() {
    let workspace = tempfile::tempdir().expect("workspace");
    let addr = start_executor(&["/bin/cat"], workspace.path().into()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/upload"))
        .bearer_auth(TOKEN)
        .body(zip_bytes(&[("src/hello.txt", "snapshot")]))
        .send()
        .await
        .expect("first upload");
    assert_eq!(response.status(), 200);
    assert_eq!(
        std::fs::read_to_string(workspace.path().join("src/hello.txt")).expect("extracted file"),
        "snapshot"
    );

    let response = client
        .post(format!("http://{addr}/upload"))
        .bearer_auth(TOKEN)
        .body(zip_bytes(&[("other.txt", "again")]))
        .send()
        .await
        .expect("second upload");
    assert_eq!(response.status(), 409, "snapshots are one-shot");
}

#[tokio::test]
async fn zip_slip_fails_and_workspace_stays_not_ready() {
    let parent = tempfile::tempdir().expect("parent");
    let workspace = parent.path().join("workspace");
    std::fs::create_dir(&workspace).expect("create workspace");
    let addr = start_executor(&["/bin/cat"], workspace.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/upload"))
        .bearer_auth(TOKEN)
        .body(zip_bytes(&[("../escape.txt", "root:x:0:0")]))
        .send()
        .await
        .expect("malicious upload");
    assert_eq!(response.status(), 500);
    assert!(
        !parent.path().join("escape.txt").exists(),
        "nothing may be written outside the workspace root"
    );

    // The ready flag must not have been set: a corrected upload still works.
    let response = client
        .post(format!("http://{addr}/upload"))
        .bearer_auth(TOKEN)
        .body(zip_bytes(&[("ok.txt", "fine")]))
        .send()
        .await
        .expect("follow-up upload");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn connect_requires_the_capability_token() {
    let workspace = tempfile::tempdir().expect("workspace");
    let addr = start_executor(&["/bin/cat"], workspace.path().into()).await;

    let err = ws_connect(addr, "wrong-token")
        .await
        .err()
        .expect("handshake must fail");
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected http 401 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn ready_precedes_output_and_bytes_round_trip() {
    let workspace = tempfile::tempdir().expect("workspace");
    let addr = start_executor(&["/bin/cat"], workspace.path().into()).await;

    let mut ws = ws_connect(addr, TOKEN).await.expect("connect");
    expect_ready(&mut ws).await;

    ws.send(Message::Binary(b"hello, pty\n".to_vec()))
        .await
        .expect("send stdin");
    let output = read_output_until(&mut ws, "hello, pty").await;
    assert!(output.contains("hello, pty"));
}

#[tokio::test]
async fn resize_is_applied_to_the_pty() {
    let workspace = tempfile::tempdir().expect("workspace");
    let addr = start_executor(&["/bin/sh"], workspace.path().into()).await;

    let mut ws = ws_connect(addr, TOKEN).await.expect("connect");
    expect_ready(&mut ws).await;

    ws.send(Message::Text(ControlFrame::resize(120, 40).encode()))
        .await
        .expect("send resize");
    ws.send(Message::Binary(b"stty size\n".to_vec()))
        .await
        .expect("send command");

    let output = read_output_until(&mut ws, "40 120").await;
    assert!(output.contains("40 120"), "stty must report rows cols");
}

#[tokio::test]
async fn protocol_ping_is_answered_with_pong() {
    let workspace = tempfile::tempdir().expect("workspace");
    let addr = start_executor(&["/bin/cat"], workspace.path().into()).await;

    let mut ws = ws_connect(addr, TOKEN).await.expect("connect");
    expect_ready(&mut ws).await;

    ws.send(Message::Text(ControlFrame::Ping.encode()))
        .await
        .expect("send ping");

    let pong = timeout(DEADLINE, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ControlFrame::Pong) = ControlFrame::parse(&text) {
                        return;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended before pong: {other:?}"),
            }
        }
    })
    .await;
    assert!(pong.is_ok(), "no pong within deadline");
}

#[tokio::test]
async fn child_exit_emits_an_exit_frame() {
    let workspace = tempfile::tempdir().expect("workspace");
    let addr = start_executor(&["/bin/sh", "-c", "exit 3"], workspace.path().into()).await;

    let mut ws = ws_connect(addr, TOKEN).await.expect("connect");
    expect_ready(&mut ws).await;

    let (code, signal) = read_until_exit(&mut ws).await;
    assert_eq!(code, 3);
    assert_eq!(signal, None);
}

#[tokio::test]
async fn reconnect_attaches_to_the_same_child() {
    let workspace = tempfile::tempdir().expect("workspace");
    let addr = start_executor(&["/bin/sh"], workspace.path().into()).await;

    let mut first = ws_connect(addr, TOKEN).await.expect("first connect");
    expect_ready(&mut first).await;
    first
        .send(Message::Binary(b"echo PID=$$=DIP\n".to_vec()))
        .await
        .expect("send pid probe");
    let output = read_output_until(&mut first, "=DIP").await;
    let first_pid = marked_pid(&output).expect("pid in output");
    drop(first);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = ws_connect(addr, TOKEN).await.expect("reconnect");
    expect_ready(&mut second).await;
    second
        .send(Message::Binary(b"echo PID=$$=DIP\n".to_vec()))
        .await
        .expect("send pid probe");
    let output = read_output_until(&mut second, "=DIP").await;
    let second_pid = marked_pid(&output).expect("pid in output");

    assert_eq!(first_pid, second_pid, "reconnect must reuse the live child");
}

#[test]
fn marked_pid_ignores_the_echoed_command_line() {
    assert_eq!(marked_pid("echo PID=$$=DIP\r\nPID=4321=DIP\r\n"), Some(4321));
    assert_eq!(marked_pid("echo PID=$$=DIP"), None);
}
