//! Shared HTTP client, SSE parsing, and auth utilities.

use std::sync::OnceLock;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::error::TurnstileError;

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
///
/// No overall request timeout: streams can legitimately run for minutes.
/// Stalls are caught by the worker's per-fragment idle deadline instead.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Build default headers for a Bearer-token API.
pub fn bearer_headers(api_key: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(api_key) = api_key {
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
            headers.insert(AUTHORIZATION, val);
        }
    }
    headers
}

/// Build Anthropic-style headers (x-api-key).
pub fn anthropic_headers(api_key: &str, version: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(api_key) {
        headers.insert("x-api-key", val);
    }
    if let Ok(val) = HeaderValue::from_str(version) {
        headers.insert("anthropic-version", val);
    }
    headers
}

/// Parse an SSE "data:" line, returning None for "[DONE]" and non-data lines.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Extract a retryable error from an HTTP status code.
pub fn status_to_error(status: u16, body: &str) -> TurnstileError {
    match status {
        401 | 403 => TurnstileError::Authentication(body.to_string()),
        429 => TurnstileError::RateLimited {
            retry_after_ms: extract_retry_after(body),
        },
        _ => TurnstileError::api(status, body),
    }
}

fn extract_retry_after(body: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|r| r.as_f64())
                .map(|s| (s * 1000.0) as u64)
        })
}

/// Send a prepared request and fail on a non-200 status.
pub async fn open_stream(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, TurnstileError> {
    let resp = request.send().await?;
    let status = resp.status().as_u16();
    if status != 200 {
        let body_text = resp.text().await.unwrap_or_default();
        return Err(status_to_error(status, &body_text));
    }
    Ok(resp)
}

/// One item read from an SSE body.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Data(String),
    /// The `[DONE]` sentinel. Nothing follows it.
    Done,
}

/// The error a provider yields when the body closes before its terminator.
pub fn stream_ended_early() -> TurnstileError {
    TurnstileError::UpstreamStream("stream ended before completion".to_string())
}

/// Split a streaming response body into SSE frames.
///
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across network chunks decode correctly. The stream ends
/// after `[DONE]` or when the body closes; callers decide whether a close
/// without their terminator is an error. A transport failure mid-body is
/// yielded as `UpstreamStream` and ends the stream.
pub fn sse_data(resp: reqwest::Response) -> BoxStream<'static, Result<SseFrame, TurnstileError>> {
    let byte_stream = resp.bytes_stream();
    let stream = async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        futures::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(TurnstileError::UpstreamStream(format!("stream interrupted: {e}")));
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(line_end) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=line_end).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if line.trim_start_matches("data:").trim() == "[DONE]" {
                    yield Ok(SseFrame::Done);
                    return;
                }
                if let Some(data) = parse_sse_data(line) {
                    yield Ok(SseFrame::Data(data.to_string()));
                }
            }
        }

        let line = String::from_utf8_lossy(&buffer);
        let line = line.trim();
        if line.trim_start_matches("data:").trim() == "[DONE]" {
            yield Ok(SseFrame::Done);
        } else if let Some(data) = parse_sse_data(line) {
            yield Ok(SseFrame::Data(data.to_string()));
        }
    };
    stream.boxed()
}
