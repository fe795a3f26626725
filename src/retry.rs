//! Resilient streaming: idle timeout, fallback-format retry, empty-response retry.
//!
//! ```text
//! STANDARD --ok, non-empty--------------------------> DONE
//!          --ok, empty----> FALLBACK (failure logged) -> DONE
//!          --error--------> FALLBACK (failure raised) -> DONE
//! any state --caller abort--> Err(Aborted), no DONE
//! ```

use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::client::ChunkStream;
use crate::error::BridgeError;
use crate::logging::{LogLevel, SharedLogger};
use crate::translate::accumulator::merge_tool_calls;
use crate::translate::openai_types::{ChatMessage, ToolCall};
use crate::translate::streaming::{StreamChunk, StreamOutcome};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can run one stream attempt for a given message encoding.
pub trait AttemptSource: Send + Sync {
    /// The returned stream must stop with `BridgeError::Aborted` once `token` is cancelled.
    fn open(&self, messages: Vec<ChatMessage>, token: CancellationToken) -> ChunkStream;
}

pub type OnRetry = Box<dyn FnMut() + Send>;

#[derive(Clone)]
pub struct RetryOptions {
    /// Gap between chunks after which the attempt is abandoned.
    pub idle_timeout: Duration,
    /// Used to attribute log entries.
    pub model_key: String,
    pub logger: SharedLogger,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            model_key: String::new(),
            logger: SharedLogger::in_memory(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Standard,
    FallbackAfterError,
    FallbackAfterEmpty,
}

/// Stream `standard`, falling back to `fallback` once on failure or empty output.
///
/// Yields every chunk as it arrives, then exactly one `StreamChunk::Done`
/// summarizing the attempts that ran. `on_retry` fires before a retry caused
/// by an error so the caller can discard what it has shown. Cancelling
/// `cancel` ends the stream with `Err(BridgeError::Aborted)` and no `Done`.
pub fn stream_with_fallback<S>(
    source: S,
    options: RetryOptions,
    standard: Vec<ChatMessage>,
    fallback: Vec<ChatMessage>,
    cancel: CancellationToken,
    mut on_retry: Option<OnRetry>,
) -> ChunkStream
where
    S: AttemptSource + 'static,
{
    Box::pin(async_stream::stream! {
        let RetryOptions { idle_timeout, model_key, logger } = options;
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut phase = Phase::Standard;

        loop {
            let messages = if phase == Phase::Standard {
                standard.clone()
            } else {
                fallback.clone()
            };

            // Child of the caller's token: the idle timer cancels only this attempt.
            let attempt_token = cancel.child_token();
            let mut attempt = source.open(messages, attempt_token.clone());
            let mut failure: Option<BridgeError> = None;

            loop {
                let step = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(BridgeError::Aborted),
                    step = tokio::time::timeout(idle_timeout, attempt.next()) => {
                        step.map_err(|_| BridgeError::IdleTimeout { after: idle_timeout })
                    }
                };

                match step {
                    Ok(Some(Ok(chunk))) => {
                        match chunk {
                            StreamChunk::Content { content: ref text } => content.push_str(text),
                            StreamChunk::ToolCalls { tool_calls: ref fragments } => {
                                tool_calls = merge_tool_calls(std::mem::take(&mut tool_calls), fragments);
                            }
                            StreamChunk::Reasoning { .. } | StreamChunk::Done { .. } => {}
                        }
                        yield Ok(chunk);
                    }
                    Ok(Some(Err(e))) if e.is_abort() && !cancel.is_cancelled() => {
                        failure = Some(BridgeError::IdleTimeout { after: idle_timeout });
                        break;
                    }
                    Ok(Some(Err(e))) | Err(e) => {
                        failure = Some(e);
                        break;
                    }
                    Ok(None) => break,
                }
            }

            if matches!(failure, Some(BridgeError::IdleTimeout { .. })) {
                attempt_token.cancel();
            }
            drop(attempt);

            match (phase, failure) {
                (_, Some(e)) if e.is_abort() => {
                    logger.model(LogLevel::Info, "retry", &model_key, "Aborted by caller");
                    yield Err(e);
                    return;
                }
                (Phase::Standard, Some(e)) => {
                    logger.model(
                        LogLevel::Warn,
                        "retry",
                        &model_key,
                        format!("Attempt failed, retrying with fallback messages: {e}"),
                    );
                    content.clear();
                    tool_calls.clear();
                    if let Some(ref mut callback) = on_retry {
                        callback();
                    }
                    phase = Phase::FallbackAfterError;
                }
                (Phase::Standard, None) if content.is_empty() && tool_calls.is_empty() => {
                    logger.model(
                        LogLevel::Info,
                        "retry",
                        &model_key,
                        "Empty response, retrying with fallback messages",
                    );
                    phase = Phase::FallbackAfterEmpty;
                }
                (Phase::FallbackAfterError, Some(e)) => {
                    yield Err(e);
                    return;
                }
                (Phase::FallbackAfterEmpty, Some(e)) => {
                    logger.model(
                        LogLevel::Warn,
                        "retry",
                        &model_key,
                        format!("Fallback after empty response failed: {e}"),
                    );
                    break;
                }
                (_, None) => break,
            }
        }

        yield Ok(StreamChunk::Done {
            result: StreamOutcome { content, tool_calls },
        });
    })
}
