//! The local end of the duplex channel: raw terminal in, WebSocket out,
//! and back again. Bytes cross this module untouched in both directions.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use catty_protocol::ControlFrame;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::terminal::{self, RawModeGuard};

type WsSink = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;

/// Everything needed to dial one session's executor.
pub struct ConnectInfo {
    pub connect_url: String,
    pub connect_token: String,
    /// Instance-pin headers from the control plane; sent verbatim.
    pub headers: HashMap<String, String>,
}

/// Attach the local terminal to the remote pty and pump until the remote
/// child exits or the connection drops. Terminal state is restored on every
/// exit path.
pub async fn run(info: &ConnectInfo) -> Result<()> {
    if !terminal::is_terminal() {
        bail!("stdin is not a terminal");
    }

    let mut request = info
        .connect_url
        .as_str()
        .into_client_request()
        .context("build connect request")?;
    {
        let headers = request.headers_mut();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", info.connect_token))
                .context("encode bearer header")?,
        );
        for (name, value) in &info.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).context("encode pin header name")?,
                HeaderValue::from_str(value).context("encode pin header value")?,
            );
        }
    }

    let (socket, _) = connect_async(request).await.context("connect to session")?;
    let (sink, mut stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    let mut raw = RawModeGuard::enable()?;

    // Tell the pty how big we are before any input flows.
    if let Ok((cols, rows)) = terminal::terminal_size() {
        let _ = send_control(&sink, &ControlFrame::resize(cols, rows)).await;
    }

    let stdin_task = tokio::spawn(pump_stdin(sink.clone()));
    let resize_task = tokio::spawn(pump_resizes(sink.clone()));

    let mut stdout = std::io::stdout();
    let result = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(bytes))) => {
                if let Err(err) = stdout.write_all(&bytes).and_then(|_| stdout.flush()) {
                    break Err(anyhow!(err).context("write to stdout"));
                }
            }
            Some(Ok(Message::Text(text))) => {
                let Ok(frame) = ControlFrame::parse(&text) else {
                    continue;
                };
                match frame {
                    ControlFrame::Exit { code, signal } => {
                        raw.restore();
                        match signal {
                            Some(signal) => {
                                eprintln!("\nProcess killed by {signal} (code {code})")
                            }
                            None => eprintln!("\nProcess exited with code {code}"),
                        }
                        break Ok(());
                    }
                    ControlFrame::Ping => {
                        let _ = send_control(&sink, &ControlFrame::Pong).await;
                    }
                    ControlFrame::Error { message } => {
                        // Still in raw mode, so carriage returns are explicit.
                        eprint!("\r\nError: {message}\r\n");
                    }
                    _ => {}
                }
            }
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => {}
            Some(Err(err)) => break Err(anyhow!(err).context("connection lost")),
        }
    };

    stdin_task.abort();
    resize_task.abort();
    raw.restore();
    result
}

/// stdin → binary frames, byte-for-byte. Raw mode means we see every
/// keystroke, control characters included.
async fn pump_stdin(sink: WsSink) {
    let mut stdin = tokio::io::stdin();
    let mut buffer = [0u8; 1024];
    loop {
        match stdin.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let frame = Message::Binary(buffer[..n].to_vec());
                if sink.lock().await.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// SIGWINCH → fresh `resize` frames.
async fn pump_resizes(sink: WsSink) {
    let Ok(mut winch) = signal(SignalKind::window_change()) else {
        return;
    };
    while winch.recv().await.is_some() {
        if let Ok((cols, rows)) = terminal::terminal_size() {
            if send_control(&sink, &ControlFrame::resize(cols, rows))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

async fn send_control(sink: &WsSink, frame: &ControlFrame) -> Result<()> {
    sink.lock()
        .await
        .send(Message::Text(frame.encode()))
        .await
        .context("send control frame")
}
