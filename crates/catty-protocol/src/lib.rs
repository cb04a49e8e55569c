//! Control frames for the client ↔ executor duplex channel.
//!
//! The channel carries two frame kinds: binary frames are opaque bytes
//! (stdin one way, pty output the other) and are never inspected here;
//! text frames are JSON objects with a `type` discriminant, defined below.
//! Keeping this in a dedicated crate lets the CLI and the executor agree
//! on the wire shape without sharing any runtime code.

use serde::{Deserialize, Serialize};

/// Interval between keepalive pings on an otherwise idle channel.
pub const PING_INTERVAL_SECS: u64 = 25;

/// A text frame on the duplex channel.
///
/// Client → server: `Resize`, `Signal`, `Ping`.
/// Server → client: `Ready`, `Exit`, `Pong`, `Error`.
/// Both sides ignore frames they do not expect rather than tearing the
/// connection down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Apply a new pty window size. Out-of-range values are clamped by
    /// the receiver, never rejected.
    Resize { cols: u16, rows: u16 },
    /// Deliver a signal to the remote child's process group. `name` is a
    /// string rather than an enum so that unknown names can be ignored.
    Signal { name: String },
    Ping,
    Pong,
    /// Sent once by the server as the first text frame on every connect,
    /// before any pty output.
    Ready,
    /// The child process exited. `signal` carries the terminating signal
    /// name when the child was killed, otherwise null.
    Exit {
        code: i32,
        signal: Option<String>,
    },
    Error { message: String },
}

#[derive(Debug, thiserror::Error)]
#[error("malformed control frame: {0}")]
pub struct FrameError(#[from] serde_json::Error);

impl ControlFrame {
    /// Serialize for transmission as a text frame.
    pub fn encode(&self) -> String {
        // All variants serialize infallibly: no maps with non-string keys,
        // no custom Serialize impls.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a received text frame. Unknown `type` values are an error;
    /// callers treat that as a frame to skip.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn resize(cols: u16, rows: u16) -> Self {
        ControlFrame::Resize { cols, rows }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        ControlFrame::Signal { name: name.into() }
    }

    pub fn exit(code: i32, signal: Option<String>) -> Self {
        ControlFrame::Exit { code, signal }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlFrame::Error {
            message: message.into(),
        }
    }
}

/// Signals a client may ask the executor to deliver. Anything outside this
/// set is dropped on the floor by the executor.
pub const ALLOWED_SIGNALS: [&str; 4] = ["SIGINT", "SIGTERM", "SIGKILL", "SIGHUP"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_frame_kind() {
        let frames = [
            ControlFrame::resize(120, 40),
            ControlFrame::signal("SIGINT"),
            ControlFrame::Ping,
            ControlFrame::Pong,
            ControlFrame::Ready,
            ControlFrame::exit(0, None),
            ControlFrame::exit(137, Some("SIGKILL".into())),
            ControlFrame::error("pty spawn failed"),
        ];
        for frame in frames {
            let parsed = ControlFrame::parse(&frame.encode()).expect("parse");
            assert_eq!(parsed, frame);
        }
    }

    #[test]
    fn wire_shape_matches_protocol() {
        assert_eq!(
            ControlFrame::resize(120, 40).encode(),
            r#"{"type":"resize","cols":120,"rows":40}"#
        );
        assert_eq!(ControlFrame::Ready.encode(), r#"{"type":"ready"}"#);
        assert_eq!(
            ControlFrame::exit(1, None).encode(),
            r#"{"type":"exit","code":1,"signal":null}"#
        );
    }

    #[test]
    fn parses_frames_from_other_implementations() {
        // Field order and extra whitespace must not matter.
        let frame = ControlFrame::parse("{ \"rows\": 24, \"cols\": 80, \"type\": \"resize\" }")
            .expect("parse");
        assert_eq!(frame, ControlFrame::resize(80, 24));
    }

    #[test]
    fn unknown_type_is_an_error_not_a_panic() {
        assert!(ControlFrame::parse(r#"{"type":"scroll","lines":3}"#).is_err());
        assert!(ControlFrame::parse("not json").is_err());
    }

    #[test]
    fn signal_names_are_not_validated_at_parse_time() {
        // The executor ignores unknown names; the wire layer passes them through.
        let frame = ControlFrame::parse(r#"{"type":"signal","name":"SIGUSR1"}"#).expect("parse");
        assert_eq!(frame, ControlFrame::signal("SIGUSR1"));
    }
}
