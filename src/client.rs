//! HTTP side of the normalizer: endpoint probing, request dispatch, and
//! turning a response body into a [`ChunkStream`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::adapter::{adapter_for, GenerationParams, ProtocolAdapter};
use crate::config::ModelTarget;
use crate::error::{BridgeError, Result};
use crate::logging::{LogEntry, LogLevel, SharedLogger};
use crate::translate::openai_types::ChatMessage;
use crate::translate::streaming::{error_message, Decoded, SseLines, StreamChunk};

/// Normalized chunks of one stream attempt.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

const ERROR_BODY_MAX: usize = 500;

/// Shared HTTP client plus the per-session endpoint cache.
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct BridgeClient {
    http: reqwest::Client,
    logger: SharedLogger,
    /// (protocol, base URL, path override) -> candidate URL that last worked.
    endpoints: Arc<Mutex<HashMap<String, String>>>,
}

impl BridgeClient {
    pub fn new(http: reqwest::Client, logger: SharedLogger) -> Self {
        Self {
            http,
            logger,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn logger(&self) -> &SharedLogger {
        &self.logger
    }

    /// Forget every remembered endpoint.
    pub fn reset(&self) {
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.clear();
        }
    }

    /// Stream one request. Nothing is sent until the stream is first polled.
    ///
    /// Cancelling `token` ends the stream with `BridgeError::Aborted` at the
    /// next suspension point (send or body read).
    pub fn stream(
        &self,
        target: ModelTarget,
        params: GenerationParams,
        messages: Vec<ChatMessage>,
        token: CancellationToken,
    ) -> ChunkStream {
        let client = self.clone();

        Box::pin(async_stream::stream! {
            let adapter = adapter_for(target.protocol);

            let body = match adapter.request_body(&target, &params, &messages) {
                Ok(b) => b,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let response = match client.send(adapter, &target, &body, &token).await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase();

            if content_type.contains("json") && !content_type.contains("event-stream") {
                let bytes = tokio::select! {
                    biased;
                    () = token.cancelled() => Err(BridgeError::Aborted),
                    b = response.bytes() => b.map_err(BridgeError::Network),
                };
                match bytes {
                    Ok(b) if b.iter().all(u8::is_ascii_whitespace) => {}
                    Ok(b) => match serde_json::from_slice::<serde_json::Value>(&b) {
                        Ok(value) => match adapter.decode_complete(value) {
                            Ok(Some(chunk)) => {
                                yield Ok(chunk);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                yield Err(e);
                            }
                        },
                        Err(e) => client.logger.model(
                            LogLevel::Warn,
                            "stream",
                            &target.key,
                            format!("Unparseable JSON response: {e}"),
                        ),
                    },
                    Err(e) => {
                        yield Err(e);
                    }
                }
                return;
            }

            let mut decoder = adapter.decoder();
            let mut lines = SseLines::new();
            let mut body = response.bytes_stream();

            loop {
                let next = tokio::select! {
                    biased;
                    () = token.cancelled() => Err(BridgeError::Aborted),
                    n = body.next() => Ok(n),
                };

                let at_end = match next {
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        yield Err(BridgeError::Network(e));
                        return;
                    }
                    Ok(Some(Ok(bytes))) => {
                        lines.push(&bytes);
                        false
                    }
                    Ok(None) => true,
                };

                let mut payloads = Vec::new();
                while let Some(data) = lines.next_data() {
                    payloads.push(data);
                }
                if at_end {
                    payloads.extend(lines.finish());
                }

                for data in payloads {
                    match decoder.decode(&data) {
                        Ok(Decoded::Chunks(chunks)) => {
                            for chunk in chunks {
                                yield Ok(chunk);
                            }
                        }
                        Ok(Decoded::End) => return,
                        Err(BridgeError::Protocol { message }) => client.logger.model(
                            LogLevel::Warn,
                            "stream",
                            &target.key,
                            format!("Skipping malformed line: {message}"),
                        ),
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }

                if at_end {
                    break;
                }
            }
        })
    }

    /// Try each endpoint candidate in order. Only a 404 with another
    /// candidate left moves on; every other failure is final.
    async fn send(
        &self,
        adapter: &dyn ProtocolAdapter,
        target: &ModelTarget,
        body: &serde_json::Value,
        token: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let cache_key = format!(
            "{}|{}|{}",
            adapter.protocol(),
            target.api_url,
            target.anthropic_api_path.as_deref().unwrap_or("")
        );
        let candidates = self.ordered_candidates(&cache_key, adapter.endpoint_candidates(target));

        let last = candidates.len().saturating_sub(1);
        for (i, url) in candidates.iter().enumerate() {
            self.logger.model(
                LogLevel::Info,
                "client",
                &target.key,
                format!("POST {} model={} protocol={}", url, target.model, adapter.protocol()),
            );

            if let Some(response) = self
                .try_candidate(adapter, target, url, body, token, i < last)
                .await?
            {
                self.logger.log(
                    LogEntry::new(LogLevel::Info, "client", "Endpoint selected")
                        .for_model(&target.key)
                        .with_context(serde_json::json!({
                            "url": url,
                            "status": response.status().as_u16(),
                            "content_type": response
                                .headers()
                                .get(reqwest::header::CONTENT_TYPE)
                                .and_then(|v| v.to_str().ok()),
                        })),
                );
                if let Ok(mut endpoints) = self.endpoints.lock() {
                    endpoints.insert(cache_key, url.clone());
                }
                return Ok(response);
            }

            self.logger.model(
                LogLevel::Debug,
                "client",
                &target.key,
                format!("404 from {url}, trying next candidate"),
            );
        }

        Err(BridgeError::config(format!(
            "Model '{}' has no usable endpoint for {}",
            target.key, target.api_url
        )))
    }

    /// `Ok(None)` means "404, try the next candidate".
    async fn try_candidate(
        &self,
        adapter: &dyn ProtocolAdapter,
        target: &ModelTarget,
        url: &str,
        body: &serde_json::Value,
        token: &CancellationToken,
        more_candidates: bool,
    ) -> Result<Option<reqwest::Response>> {
        let request = adapter
            .apply_headers(self.http.post(url), &target.api_key)
            .json(body);

        let response = tokio::select! {
            biased;
            () = token.cancelled() => return Err(BridgeError::Aborted),
            r = request.send() => r?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }
        if status == StatusCode::NOT_FOUND && more_candidates {
            return Ok(None);
        }

        let text = tokio::select! {
            biased;
            () = token.cancelled() => return Err(BridgeError::Aborted),
            t = response.text() => t.unwrap_or_default(),
        };

        let message = http_error_message(status.as_u16(), &text);
        self.logger.model(
            LogLevel::Warn,
            "client",
            &target.key,
            format!("{url} returned {status}: {message}"),
        );
        Err(BridgeError::http(status.as_u16(), message))
    }

    fn ordered_candidates(&self, cache_key: &str, mut candidates: Vec<String>) -> Vec<String> {
        let known = self
            .endpoints
            .lock()
            .ok()
            .and_then(|e| e.get(cache_key).cloned());
        if let Some(url) = known {
            if let Some(pos) = candidates.iter().position(|c| *c == url) {
                let preferred = candidates.remove(pos);
                candidates.insert(0, preferred);
            }
        }
        candidates
    }
}

/// `error.message`, then top-level `message`, then the raw text, then `HTTP {status}`.
fn http_error_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let message = error_message(&value).or_else(|| {
            value
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        });
        if let Some(m) = message.filter(|m| !m.is_empty()) {
            return m;
        }
    }

    let text = body.trim();
    if text.is_empty() {
        format!("HTTP {status}")
    } else {
        truncate(text, ERROR_BODY_MAX).to_string()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// One model's request, replayable with different message encodings.
#[derive(Clone)]
pub struct ModelSession {
    pub client: BridgeClient,
    pub target: ModelTarget,
    pub params: GenerationParams,
}

impl crate::retry::AttemptSource for ModelSession {
    fn open(&self, messages: Vec<ChatMessage>, token: CancellationToken) -> ChunkStream {
        self.client
            .stream(self.target.clone(), self.params.clone(), messages, token)
    }
}
