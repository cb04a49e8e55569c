//! Session-addressed reverse proxy in front of the Anthropic API.
//!
//! Every request arrives as `/s/{label}{upstream-path}`: the label is both
//! routing key and credential, because the child process inside the executor
//! can only be pointed at a base URL. Accounting wraps the response body and
//! never sits between the upstream and the caller.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HeaderValue;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use catty_store::{QuotaDecision, Store, StoreError};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sse::UsageScanner;

#[derive(Clone)]
pub struct ProxyState {
    pub store: Store,
    pub http: reqwest::Client,
    pub upstream_base: String,
    /// Pre-validated `x-api-key` value for the upstream.
    pub api_key: HeaderValue,
}

/// Split `/s/{label}{rest}` into (label, rest-with-leading-slash).
pub fn split_session_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/s/")?;
    let slash = rest.find('/')?;
    let (label, upstream) = rest.split_at(slash);
    if label.is_empty() {
        return None;
    }
    Some((label, upstream))
}

pub async fn handle(State(state): State<ProxyState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let Some((label, upstream_path)) = split_session_path(&path) else {
        warn!(%path, "malformed proxy path");
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid path format, expected /s/{label}/...",
        );
    };

    // The path is the caller's credential: an unknown label is an auth
    // failure, not a missing resource.
    let session = match state.store.live_session_by_label(label).await {
        Ok(session) => session,
        Err(StoreError::NotFound) => {
            warn!(%label, "unknown session label");
            return error_response(StatusCode::UNAUTHORIZED, "session not found");
        }
        Err(err) => {
            warn!(error = %err, "session lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    match state.store.check_quota(session.user_id).await {
        Ok(QuotaDecision::Allowed { remaining }) => {
            debug!(session = %session.id, ?remaining, %upstream_path, "proxying request");
        }
        Ok(QuotaDecision::Denied) => {
            warn!(user = %session.user_id, "quota exceeded");
            return error_response(
                StatusCode::PAYMENT_REQUIRED,
                "quota exceeded - upgrade to pro for unlimited usage",
            );
        }
        Err(err) => {
            warn!(error = %err, "quota check failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    }

    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let url = format!("{}{}{}", state.upstream_base, upstream_path, query);

    let method = req.method().clone();
    let mut headers = req.headers().clone();
    headers.remove(header::HOST);
    headers.remove(header::AUTHORIZATION);
    headers.remove(header::CONTENT_LENGTH);
    headers.insert("x-api-key", state.api_key.clone());

    let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());
    let upstream = match state
        .http
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, %url, "upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, "upstream unavailable");
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    // The body is re-framed locally; hop-by-hop headers must not leak through.
    response_headers.remove(header::TRANSFER_ENCODING);
    response_headers.remove(header::CONNECTION);
    response_headers.remove(header::CONTENT_LENGTH);

    let recorder = UsageRecorder {
        store: state.store.clone(),
        user_id: session.user_id,
        session_id: session.id,
    };

    let is_stream = response_headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/event-stream"))
        .unwrap_or(false);

    let body = if is_stream {
        let stream = MeteredStream::new(upstream.bytes_stream().boxed(), move |input, output| {
            recorder.record(input, output)
        });
        Body::from_stream(stream)
    } else if status.is_success() && upstream_path.contains("/messages") {
        match upstream.bytes().await {
            Ok(bytes) => {
                record_unary_usage(&bytes, recorder);
                Body::from(bytes)
            }
            Err(err) => {
                warn!(error = %err, "failed to read upstream body");
                return error_response(StatusCode::BAD_GATEWAY, "upstream unavailable");
            }
        }
    } else {
        Body::from_stream(upstream.bytes_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// Anything outside `/s/{label}/...` (and `/healthz`) is a malformed path.
pub async fn reject_unknown_path(req: Request) -> Response {
    warn!(path = %req.uri().path(), "request outside the /s/ namespace");
    error_response(
        StatusCode::BAD_REQUEST,
        "invalid path format, expected /s/{label}/...",
    )
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = if status == StatusCode::PAYMENT_REQUIRED {
        json!({ "error": "quota_exceeded", "message": message })
    } else {
        json!({ "error": message })
    };
    (status, Json(body)).into_response()
}

#[derive(Clone)]
struct UsageRecorder {
    store: Store,
    user_id: Uuid,
    session_id: Uuid,
}

impl UsageRecorder {
    /// Fire-and-forget: accounting must never turn a successful upstream
    /// call into a client-visible failure.
    fn record(self, input_tokens: i64, output_tokens: i64) {
        if input_tokens == 0 && output_tokens == 0 {
            return;
        }
        tokio::spawn(async move {
            match self
                .store
                .record_usage(
                    self.user_id,
                    Some(self.session_id),
                    input_tokens,
                    output_tokens,
                )
                .await
            {
                Ok(()) => info!(
                    session = %self.session_id,
                    input_tokens,
                    output_tokens,
                    "recorded usage"
                ),
                Err(err) => warn!(
                    error = %err,
                    session = %self.session_id,
                    "failed to record usage"
                ),
            }
        });
    }
}

/// Parse the unary response shape and account for it; the caller re-serves
/// the exact bytes regardless.
fn record_unary_usage(bytes: &[u8], recorder: UsageRecorder) {
    match parse_unary_usage(bytes) {
        Some((input_tokens, output_tokens)) => recorder.record(input_tokens, output_tokens),
        None => debug!("response carried no parseable usage"),
    }
}

fn parse_unary_usage(bytes: &[u8]) -> Option<(i64, i64)> {
    #[derive(Deserialize)]
    struct MessageResponse {
        usage: Usage,
    }
    #[derive(Deserialize)]
    struct Usage {
        #[serde(default)]
        input_tokens: i64,
        #[serde(default)]
        output_tokens: i64,
    }

    let parsed: MessageResponse = serde_json::from_slice(bytes).ok()?;
    Some((parsed.usage.input_tokens, parsed.usage.output_tokens))
}

/// Tees a streaming body through the usage scanner. The wrapped stream is
/// handed to the caller untouched; `on_finish` fires with the final counts
/// exactly once, at EOF or when the stream is dropped, whichever comes
/// first.
struct MeteredStream<E, F: FnOnce(i64, i64)> {
    inner: BoxStream<'static, Result<Bytes, E>>,
    scanner: Option<UsageScanner>,
    on_finish: Option<F>,
}

impl<E, F: FnOnce(i64, i64)> MeteredStream<E, F> {
    fn new(inner: BoxStream<'static, Result<Bytes, E>>, on_finish: F) -> Self {
        Self {
            inner,
            scanner: Some(UsageScanner::new()),
            on_finish: Some(on_finish),
        }
    }

    fn finish(&mut self) {
        if let (Some(scanner), Some(on_finish)) = (self.scanner.take(), self.on_finish.take()) {
            let (input, output) = scanner.totals();
            on_finish(input, output);
        }
    }
}

impl<E, F: FnOnce(i64, i64) + Unpin> Stream for MeteredStream<E, F> {
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(scanner) = this.scanner.as_mut() {
                    scanner.push(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<E, F: FnOnce(i64, i64)> Drop for MeteredStream<E, F> {
    fn drop(&mut self) {
        // Covers the caller hanging up before the upstream finishes.
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    #[test]
    fn splits_label_and_upstream_path() {
        assert_eq!(
            split_session_path("/s/brave-tiger-1234/v1/messages"),
            Some(("brave-tiger-1234", "/v1/messages"))
        );
        assert_eq!(
            split_session_path("/s/calm-owl-9999/v1/messages/count_tokens"),
            Some(("calm-owl-9999", "/v1/messages/count_tokens"))
        );
    }

    #[test]
    fn rejects_paths_without_label_or_prefix() {
        assert_eq!(split_session_path("/v1/messages"), None);
        assert_eq!(split_session_path("/s/"), None);
        assert_eq!(split_session_path("/s//v1/messages"), None);
        assert_eq!(split_session_path("/s/label-only"), None);
    }

    #[test]
    fn parses_unary_usage_and_tolerates_garbage() {
        let body = br#"{"id":"msg_1","usage":{"input_tokens":42,"output_tokens":9}}"#;
        assert_eq!(parse_unary_usage(body), Some((42, 9)));
        assert_eq!(parse_unary_usage(b"{\"id\":\"msg_1\"}"), None);
        assert_eq!(parse_unary_usage(b"not json"), None);
    }

    fn sse_chunks() -> Vec<Result<Bytes, Infallible>> {
        vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12}}}\n\n",
            )),
            Ok(Bytes::from_static(
                b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":17}}\n\n",
            )),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]
    }

    fn counting_sink() -> (Arc<Mutex<Vec<(i64, i64)>>>, impl FnOnce(i64, i64)) {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let recorded = recorded.clone();
            move |input, output| recorded.lock().unwrap().push((input, output))
        };
        (recorded, sink)
    }

    #[tokio::test]
    async fn metered_stream_records_once_at_eof() {
        let (recorded, sink) = counting_sink();
        let stream = MeteredStream::new(futures_util::stream::iter(sse_chunks()).boxed(), sink);

        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 3, "bytes pass through unchanged");
        assert_eq!(*recorded.lock().unwrap(), vec![(12, 17)]);
    }

    #[tokio::test]
    async fn metered_stream_records_on_early_drop() {
        let (recorded, sink) = counting_sink();
        let mut stream = MeteredStream::new(futures_util::stream::iter(sse_chunks()).boxed(), sink);

        // Only the first event arrives before the caller hangs up.
        let first = stream.next().await.expect("first chunk").expect("ok");
        assert!(first.starts_with(b"data: "));
        drop(stream);

        assert_eq!(*recorded.lock().unwrap(), vec![(12, 0)]);
    }

    #[tokio::test]
    async fn metered_stream_never_records_twice() {
        let (recorded, sink) = counting_sink();
        let mut stream = MeteredStream::new(futures_util::stream::iter(sse_chunks()).boxed(), sink);
        while stream.next().await.is_some() {}
        // EOF already recorded; the drop that follows must not.
        drop(stream);
        assert_eq!(recorded.lock().unwrap().len(), 1);
    }
}
