//! llama.cpp server completion channel
//!
//! Speaks the `/completion` endpoint of the llama.cpp HTTP server with
//! `stream: true`. The server answers with server-sent events whose `data:`
//! payloads are JSON objects carrying a `content` delta; the last event has
//! `stop: true` and the generation timings.

use crate::error::{ChannelError, Result};
use crate::providers::base::{
    ChannelOptions, CompletionChannel, CompletionResult, ModelRef, PartialSink,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Stop sequence that keeps the model from writing the user's next turn
const USER_TURN_STOP: &str = "\nuser:";

/// Request body for `POST /completion`
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_predict: Option<i32>,
    stop: Vec<&'static str>,
    cache_prompt: bool,
}

/// One streamed `data:` payload
#[derive(Debug, Default, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tokens_predicted: Option<i64>,
    #[serde(default)]
    timings: Option<Timings>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Timings {
    #[serde(default)]
    predicted_per_second: Option<f64>,
    #[serde(default)]
    predicted_n: Option<i64>,
}

/// Incremental splitter for server-sent events
///
/// Bytes are buffered until a blank line closes an event, so payloads split
/// across network chunks (including inside a UTF-8 sequence) are reassembled
/// before decoding.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    /// Feed raw bytes and return the `data:` payloads of completed events
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = find_event_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos.end).collect();
            if let Some(data) = event_data(&block[..pos.start]) {
                events.push(data);
            }
        }
        events
    }

    /// Payload of a trailing event the server did not terminate
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        event_data(&rest)
    }
}

/// Range of the first event terminator (`\n\n` or `\r\n\r\n`)
fn find_event_end(buffer: &[u8]) -> Option<std::ops::Range<usize>> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| p..p + 2);
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p..p + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Joined `data:` lines of one event block; comments and other fields are skipped
fn event_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .collect();

    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

fn classify_request_error(e: reqwest::Error) -> ChannelError {
    if e.is_timeout() {
        ChannelError::Timeout(e.to_string())
    } else {
        ChannelError::Unreachable(e.to_string())
    }
}

/// Completion channel backed by a llama.cpp HTTP server
///
/// # Examples
///
/// ```
/// use llamachat::providers::{LlamaServerChannel, ModelRef};
/// use std::path::PathBuf;
/// use std::time::Duration;
///
/// let channel = LlamaServerChannel::new(
///     "http://127.0.0.1:8690",
///     ModelRef::Local(PathBuf::from("/models/llama.gguf")),
///     Duration::from_secs(120),
/// )
/// .unwrap();
/// assert_eq!(channel.base_url(), "http://127.0.0.1:8690");
/// ```
#[derive(Debug, Clone)]
pub struct LlamaServerChannel {
    client: Client,
    base_url: String,
    model: ModelRef,
    chunk_timeout: Duration,
}

impl LlamaServerChannel {
    /// Create a channel for the server at `base_url`
    ///
    /// # Arguments
    ///
    /// * `base_url` - Server root, e.g. `http://127.0.0.1:8690`
    /// * `model` - Model the server is expected to serve
    /// * `chunk_timeout` - Longest wait for the next streamed chunk
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails
    pub fn new(base_url: &str, model: ModelRef, chunk_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("llamachat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChannelError::Unreachable(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!("Initialized llama.cpp channel: url={}, model={}", base_url, model);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            chunk_timeout,
        })
    }

    /// Server root URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl CompletionChannel for LlamaServerChannel {
    async fn stream(
        &self,
        prompt: &str,
        options: &ChannelOptions,
        on_partial: &PartialSink<'_>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        let request = CompletionRequest {
            prompt,
            stream: true,
            temperature: options.temperature,
            n_predict: options.n_predict,
            stop: vec![USER_TURN_STOP],
            cache_prompt: true,
        };

        tracing::debug!(
            "Sending completion request to {}: {} prompt chars, n_predict={:?}",
            self.model,
            prompt.len(),
            options.n_predict
        );

        let started = Instant::now();
        let send = self
            .client
            .post(format!("{}/completion", self.base_url))
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Completion cancelled before the server answered");
                return Ok(CompletionResult::interrupted(String::new()));
            }
            response = send => response.map_err(|e| {
                tracing::error!("Completion request failed: {}", e);
                classify_request_error(e)
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Server returned error {}: {}", status, body);
            return Err(ChannelError::Http {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let mut bytes = response.bytes_stream();
        let mut sse = SseBuffer::default();
        let mut result = CompletionResult::default();

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    result.interrupted = true;
                    break 'read;
                }
                next = tokio::time::timeout(self.chunk_timeout, bytes.next()) => next,
            };

            let stream_ended = matches!(next, Ok(None));
            let events = match next {
                Err(_) => {
                    return Err(ChannelError::Timeout(format!(
                        "no data for {} seconds",
                        self.chunk_timeout.as_secs()
                    ))
                    .into())
                }
                Ok(None) => sse.finish().into_iter().collect(),
                Ok(Some(Err(e))) => return Err(classify_request_error(e).into()),
                Ok(Some(Ok(chunk))) => sse.push(&chunk),
            };

            for data in events {
                let chunk: CompletionChunk = serde_json::from_str(&data).map_err(|e| {
                    ChannelError::MalformedResponse(format!("{}: {}", e, data))
                })?;

                if let Some(error) = chunk.error {
                    return Err(ChannelError::MalformedResponse(format!(
                        "server reported an error: {}",
                        error
                    ))
                    .into());
                }

                if !chunk.content.is_empty() {
                    if result.response_start_seconds.is_none() {
                        result.response_start_seconds = Some(started.elapsed().as_secs_f64());
                    }
                    result.text.push_str(&chunk.content);
                    on_partial(&chunk.content);
                }

                if chunk.stop {
                    let timings = chunk.timings.unwrap_or_default();
                    result.predicted_per_second = timings.predicted_per_second;
                    result.n_predicted = timings.predicted_n.or(chunk.tokens_predicted);
                    result.model_name = chunk.model;
                    break 'read;
                }
            }

            if stream_ended {
                tracing::warn!(
                    "Completion stream ended without a stop event after {} chars",
                    result.text.len()
                );
                return Err(ChannelError::MalformedResponse(
                    "stream ended before stop event".to_string(),
                )
                .into());
            }
        }

        tracing::debug!(
            "Completion finished: {} chars, interrupted={}",
            result.text.len(),
            result.interrupted
        );

        Ok(result)
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.chunk_timeout)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::Http {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(())
    }
}
