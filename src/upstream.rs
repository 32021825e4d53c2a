use eventsource_stream::{Event, EventStreamError, Eventsource};
use eyre::{eyre, Result};
use futures::{stream::BoxStream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::history::Turn;

/// Hard deadline for one upstream request, headers through last byte.
/// Hitting it mid-stream surfaces as a transport error.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream returned HTTP {0}")]
    Http(u16),
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// Client for the model's `streamGenerateContent` SSE endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    base_url: String,
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| eyre!("failed to build upstream HTTP client: {e}"))?;
        Ok(Self { base_url, http })
    }

    /// Open a streaming generation request with the given key.
    ///
    /// Returns once response headers are in: a non-2xx status is
    /// `UpstreamError::Http`, a body that is not an event stream is
    /// `UpstreamError::Protocol`.
    pub async fn stream_generate(
        &self,
        model: &str,
        key: &str,
        contents: &[Turn],
        enable_search: bool,
    ) -> Result<FragmentStream, UpstreamError> {
        let url = format!(
            "{}{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, key
        );

        let mut payload = serde_json::json!({ "contents": contents });
        if enable_search {
            payload["tools"] = serde_json::json!([{ "google_search": {} }]);
        }

        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Http(status.as_u16()));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.contains("text/event-stream") {
            return Err(UpstreamError::Protocol(format!(
                "response is not an event stream (content-type: {content_type})"
            )));
        }

        Ok(FragmentStream {
            events: resp.bytes_stream().eventsource().boxed(),
        })
    }
}

/// Decoded upstream SSE stream, reduced to text fragments.
pub struct FragmentStream {
    events: BoxStream<'static, Result<Event, EventStreamError<reqwest::Error>>>,
}

impl FragmentStream {
    /// Next text fragment, `None` on clean end of stream.
    ///
    /// Events that carry no extractable text (metadata, malformed chunks)
    /// are skipped, matching the tolerance of the upstream API's own
    /// client libraries.
    pub async fn next_fragment(&mut self) -> Option<Result<String, UpstreamError>> {
        while let Some(event) = self.events.next().await {
            match event {
                Ok(event) => match extract_text(&event.data) {
                    Some(text) => return Some(Ok(text)),
                    None => {
                        tracing::debug!(bytes = event.data.len(), "skipping non-text event");
                    }
                },
                Err(e) => {
                    return Some(Err(UpstreamError::Transport(e.to_string())));
                }
            }
        }
        None
    }
}

/// Pull `candidates[0].content.parts[0].text` out of one event payload.
fn extract_text(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(str::to_string)
}
