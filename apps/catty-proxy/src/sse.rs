//! Out-of-band scanner for Anthropic streaming responses.
//!
//! The proxy tees response bytes through [`UsageScanner`] to pick token
//! counts out of the SSE events without ever delaying or altering the bytes
//! handed back to the caller. `message_start` carries the input count;
//! each `message_delta` carries the output running total, so the last
//! observed value wins.

use serde::Deserialize;

#[derive(Debug, Default)]
pub struct UsageScanner {
    buffer: Vec<u8>,
    input_tokens: i64,
    output_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct EventKind {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartBody,
}

#[derive(Debug, Deserialize)]
struct MessageStartBody {
    usage: InputUsage,
}

#[derive(Debug, Deserialize)]
struct InputUsage {
    #[serde(default)]
    input_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    usage: OutputUsage,
}

#[derive(Debug, Deserialize)]
struct OutputUsage {
    #[serde(default)]
    output_tokens: i64,
}

impl UsageScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed response bytes through the scanner. Complete events are parsed
    /// immediately; a partial event stays buffered for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some((event_end, sep_len)) = find_event_boundary(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..event_end + sep_len).collect();
            self.scan_event(&event[..event_end]);
        }
    }

    /// Counts observed so far: (input, output).
    pub fn totals(&self) -> (i64, i64) {
        (self.input_tokens, self.output_tokens)
    }

    fn scan_event(&mut self, event: &[u8]) {
        for line in event.split(|&b| b == b'\n') {
            let line = strip_suffix(line, b'\r');
            let Some(data) = line.strip_prefix(b"data: ") else {
                continue;
            };
            if data == b"[DONE]" {
                continue;
            }
            self.scan_data(data);
        }
    }

    fn scan_data(&mut self, data: &[u8]) {
        let Ok(kind) = serde_json::from_slice::<EventKind>(data) else {
            return;
        };
        match kind.kind.as_str() {
            "message_start" => {
                if let Ok(start) = serde_json::from_slice::<MessageStart>(data) {
                    self.input_tokens = start.message.usage.input_tokens;
                }
            }
            "message_delta" => {
                if let Ok(delta) = serde_json::from_slice::<MessageDelta>(data) {
                    if delta.usage.output_tokens > 0 {
                        self.output_tokens = delta.usage.output_tokens;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Locate the earliest complete event, under either `\n\n` or `\r\n\r\n`
/// separators. Returns (end of event body, separator length).
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find_subslice(buffer, b"\n\n");
    let crlf = find_subslice(buffer, b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((b, 4)),
        (Some(a), _) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn strip_suffix(line: &[u8], suffix: u8) -> &[u8] {
    match line.split_last() {
        Some((last, rest)) if *last == suffix => rest,
        _ => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(scanner: &mut UsageScanner, text: &str) {
        scanner.push(text.as_bytes());
    }

    #[test]
    fn tracks_input_and_final_output_total() {
        let mut scanner = UsageScanner::new();
        feed(
            &mut scanner,
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12}}}\n\n",
        );
        for total in [5, 10, 17] {
            feed(
                &mut scanner,
                &format!(
                    "event: message_delta\ndata: {{\"type\":\"message_delta\",\"usage\":{{\"output_tokens\":{total}}}}}\n\n"
                ),
            );
        }
        feed(&mut scanner, "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
        feed(&mut scanner, "data: [DONE]\n\n");
        assert_eq!(scanner.totals(), (12, 17));
    }

    #[test]
    fn handles_events_split_across_chunks() {
        let mut scanner = UsageScanner::new();
        let event = "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":99}}}\n\n";
        let (first, second) = event.split_at(30);
        feed(&mut scanner, first);
        assert_eq!(scanner.totals(), (0, 0));
        feed(&mut scanner, second);
        assert_eq!(scanner.totals(), (99, 0));
    }

    #[test]
    fn tolerates_crlf_separators() {
        let mut scanner = UsageScanner::new();
        feed(
            &mut scanner,
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3}}}\r\n\r\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":8}}\r\n\r\n",
        );
        assert_eq!(scanner.totals(), (3, 8));
    }

    #[test]
    fn ignores_unparseable_data_lines() {
        let mut scanner = UsageScanner::new();
        feed(&mut scanner, "data: not json at all\n\n");
        feed(&mut scanner, ": comment line\n\n");
        assert_eq!(scanner.totals(), (0, 0));
    }

    #[test]
    fn zero_output_delta_does_not_clobber_a_real_total() {
        let mut scanner = UsageScanner::new();
        feed(
            &mut scanner,
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":0}}\n\n",
        );
        assert_eq!(scanner.totals(), (0, 42));
    }
}
