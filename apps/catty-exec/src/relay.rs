//! Bidirectional byte relay between one WebSocket client and the pty.
//!
//! Three activities cooperate per connection: pty output → binary frames,
//! client frames → pty input / control handling, and a keepalive ping on an
//! idle channel. The write half of the socket sits behind one mutex because
//! both the relay and the keepalive emit frames.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use catty_protocol::{ControlFrame, PING_INTERVAL_SECS};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::pty::{ChildExit, PtySession};

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Drive one connection until the child exits, the socket closes, or an I/O
/// error unwinds it.
pub async fn run(socket: WebSocket, pty: Arc<PtySession>) {
    let (sink, stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    // `ready` must be the first text frame, ahead of any pty output.
    if send_control(&sink, &ControlFrame::Ready).await.is_err() {
        return;
    }

    let output = tokio::spawn(pump_pty_output(pty.clone(), sink.clone()));
    let keepalive = tokio::spawn(keepalive_loop(sink.clone()));

    let mut exit_rx = pty.exit_watch();
    tokio::select! {
        exit = wait_for_exit(&mut exit_rx) => {
            if let Some(exit) = exit {
                debug!(code = exit.code, "child exited, closing relay");
                let _ = send_control(&sink, &ControlFrame::exit(exit.code, exit.signal)).await;
                let _ = sink.lock().await.send(Message::Close(None)).await;
            }
        }
        _ = pump_client_input(stream, pty.clone(), sink.clone()) => {
            debug!("client connection closed");
        }
    }

    output.abort();
    keepalive.abort();
}

/// Wait until the child exit status is published, then copy it out.
/// The watch guard must not be held across an await, so it is dropped
/// (via `.clone()`) before this future resolves.
async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ChildExit>>) -> Option<ChildExit> {
    let _ = exit_rx.wait_for(|status| status.is_some()).await;
    exit_rx.borrow().clone()
}

/// pty → socket: every chunk becomes one binary frame, byte-for-byte.
async fn pump_pty_output(pty: Arc<PtySession>, sink: WsSink) {
    loop {
        match pty.read_chunk().await {
            Ok(Some(chunk)) => {
                if sink
                    .lock()
                    .await
                    .send(Message::Binary(chunk))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "pty read ended");
                return;
            }
        }
    }
}

/// socket → pty: binary frames are raw stdin; text frames are control.
async fn pump_client_input(mut stream: SplitStream<WebSocket>, pty: Arc<PtySession>, sink: WsSink) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(bytes)) => {
                if let Err(err) = pty.write(&bytes) {
                    warn!(error = %err, "pty write failed");
                    return;
                }
            }
            Ok(Message::Text(text)) => handle_control(&text, &pty, &sink).await,
            Ok(Message::Close(_)) => return,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "socket read failed");
                return;
            }
        }
    }
}

async fn handle_control(text: &str, pty: &PtySession, sink: &WsSink) {
    let frame = match ControlFrame::parse(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "ignoring malformed control frame");
            return;
        }
    };
    match frame {
        ControlFrame::Resize { cols, rows } => {
            if let Err(err) = pty.resize(cols, rows) {
                warn!(error = %err, cols, rows, "resize failed");
            }
        }
        ControlFrame::Signal { name } => {
            if let Err(err) = pty.signal(&name) {
                warn!(error = %err, %name, "signal delivery failed");
            }
        }
        ControlFrame::Ping => {
            let _ = send_control(sink, &ControlFrame::Pong).await;
        }
        // Server-originated frames arriving here are a confused client;
        // drop them.
        _ => {}
    }
}

async fn keepalive_loop(sink: WsSink) {
    let mut ticker = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if send_control(&sink, &ControlFrame::Ping).await.is_err() {
            return;
        }
    }
}

async fn send_control(
    sink: &WsSink,
    frame: &ControlFrame,
) -> Result<(), axum::Error> {
    sink.lock().await.send(Message::Text(frame.encode())).await
}
