//! Fan one request out to several models and interleave their events.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapter::GenerationParams;
use crate::client::{BridgeClient, ChunkStream, ModelSession};
use crate::config::ModelResolver;
use crate::error::Result;
use crate::logging::LogLevel;
use crate::retry::{stream_with_fallback, OnRetry, RetryOptions, DEFAULT_IDLE_TIMEOUT};
use crate::translate::accumulator::merge_tool_calls;
use crate::translate::fallback::simplify_messages;
use crate::translate::openai_types::{ChatMessage, ToolCall};
use crate::translate::streaming::StreamChunk;

/// The request shared by every model of one fan-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Alternate encoding for the retry. Derived from `messages` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_messages: Option<Vec<ChatMessage>>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    fn fallback(&self) -> Vec<ChatMessage> {
        self.fallback_messages
            .clone()
            .unwrap_or_else(|| simplify_messages(&self.messages))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub model_key: String,
    #[serde(flatten)]
    pub event: ModelEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    Content {
        content: String,
    },
    Reasoning {
        reasoning: String,
    },
    /// Every tool call merged so far, not just the latest fragment.
    ToolCalls {
        tool_calls: Vec<ToolCall>,
    },
    /// The model's first attempt failed; discard what it produced.
    Retry,
    Done {
        content: String,
        reasoning: String,
        tool_calls: Vec<ToolCall>,
    },
    Error {
        message: String,
    },
}

impl ModelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ModelEvent::Content { .. } => "content",
            ModelEvent::Reasoning { .. } => "reasoning",
            ModelEvent::ToolCalls { .. } => "tool_calls",
            ModelEvent::Retry => "retry",
            ModelEvent::Done { .. } => "done",
            ModelEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelEvent::Done { .. } | ModelEvent::Error { .. })
    }
}

/// Per-model race-loop state.
#[derive(Default)]
struct ModelState {
    key: String,
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    retried: Arc<AtomicBool>,
}

impl ModelState {
    fn update(&self, event: ModelEvent) -> ModelUpdate {
        ModelUpdate {
            model_key: self.key.clone(),
            event,
        }
    }

    /// Terminal `Done` carrying everything accumulated, leaving the state empty.
    fn finish(&mut self) -> ModelUpdate {
        let event = ModelEvent::Done {
            content: std::mem::take(&mut self.content),
            reasoning: std::mem::take(&mut self.reasoning),
            tool_calls: std::mem::take(&mut self.tool_calls),
        };
        self.update(event)
    }
}

type Step = (usize, Option<Result<StreamChunk>>, ChunkStream);

fn next_step(idx: usize, stream: ChunkStream) -> impl Future<Output = Step> + Send {
    stream.into_future().map(move |(item, rest)| (idx, item, rest))
}

pub struct Orchestrator<R> {
    resolver: Arc<R>,
    client: BridgeClient,
    idle_timeout: Duration,
}

impl<R: ModelResolver> Orchestrator<R> {
    pub fn new(resolver: Arc<R>, client: BridgeClient) -> Self {
        Self {
            resolver,
            client,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }

    /// Forget per-session state such as remembered endpoints.
    pub fn reset(&self) {
        self.client.reset();
    }

    /// Stream `request` to every model in `model_keys`.
    ///
    /// Keys that fail to resolve produce an `Error` update up front and are
    /// never started. Each started model ends with exactly one `Done` or
    /// `Error`. Updates of one model keep their order; models interleave
    /// in whatever order their chunks arrive.
    pub fn stream_many(
        &self,
        model_keys: &[String],
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = ModelUpdate> + Send + 'static {
        let logger = self.client.logger().clone();
        let fallback = request.fallback();

        let mut rejected = Vec::new();
        let mut states = Vec::new();
        let mut streams = Vec::new();

        for key in model_keys {
            let target = match self.resolver.resolve(key) {
                Ok(t) => t,
                Err(e) => {
                    logger.model(LogLevel::Error, "orchestrator", key, e.to_string());
                    rejected.push(ModelUpdate {
                        model_key: key.clone(),
                        event: ModelEvent::Error {
                            message: e.to_string(),
                        },
                    });
                    continue;
                }
            };

            let retried = Arc::new(AtomicBool::new(false));
            let flag = retried.clone();
            let on_retry: OnRetry = Box::new(move || flag.store(true, Ordering::SeqCst));

            let session = ModelSession {
                client: self.client.clone(),
                target,
                params: request.params.clone(),
            };
            let options = RetryOptions {
                idle_timeout: self.idle_timeout,
                model_key: key.clone(),
                logger: logger.clone(),
            };
            streams.push(stream_with_fallback(
                session,
                options,
                request.messages.clone(),
                fallback.clone(),
                cancel.clone(),
                Some(on_retry),
            ));
            states.push(ModelState {
                key: key.clone(),
                retried,
                ..ModelState::default()
            });
        }

        async_stream::stream! {
            for update in rejected {
                yield update;
            }

            let mut pending = FuturesUnordered::new();
            for (idx, stream) in streams.into_iter().enumerate() {
                pending.push(next_step(idx, stream));
            }

            while let Some((idx, item, rest)) = pending.next().await {
                let state = &mut states[idx];

                if state.retried.swap(false, Ordering::SeqCst) {
                    state.content.clear();
                    state.reasoning.clear();
                    state.tool_calls.clear();
                    yield state.update(ModelEvent::Retry);
                }

                let event = match item {
                    Some(Ok(StreamChunk::Content { content })) => {
                        state.content.push_str(&content);
                        ModelEvent::Content { content }
                    }
                    Some(Ok(StreamChunk::Reasoning { reasoning })) => {
                        state.reasoning.push_str(&reasoning);
                        ModelEvent::Reasoning { reasoning }
                    }
                    Some(Ok(StreamChunk::ToolCalls { tool_calls })) => {
                        state.tool_calls = merge_tool_calls(std::mem::take(&mut state.tool_calls), &tool_calls);
                        ModelEvent::ToolCalls {
                            tool_calls: state.tool_calls.clone(),
                        }
                    }
                    Some(Ok(StreamChunk::Done { result })) => {
                        state.content = result.content;
                        state.tool_calls = result.tool_calls;
                        let done = state.finish();
                        logger.model(LogLevel::Info, "orchestrator", &state.key, "Stream complete");
                        yield done;
                        continue;
                    }
                    Some(Err(e)) => {
                        logger.model(LogLevel::Error, "orchestrator", &state.key, e.to_string());
                        yield state.update(ModelEvent::Error { message: e.to_string() });
                        continue;
                    }
                    None => {
                        yield state.finish();
                        continue;
                    }
                };

                yield state.update(event);
                pending.push(next_step(idx, rest));
            }
        }
    }
}
