//! Function and tool call interception.
//!
//! A model that decides to call a function streams the call as a JSON object
//! instead of prose. The interceptor looks at the first delta of a
//! generation: if it opens a `function_call` or `tool_calls` object, the whole
//! generation is captured and handed to the configured handler once complete;
//! otherwise every delta is forwarded untouched.
//!
//! Detection only inspects the first delta. A model whose first delta splits
//! the opening token (for example `{"func` then `tion_call":`) is streamed as
//! plain text.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt as _;
use futures::stream;
use serde_json::Value;
use tracing::{debug, warn};

use crate::callbacks::{StreamCallbacks, instrument};
use crate::errors::{CallbackError, StreamError};
use crate::message::{ChatMessage, Role};
use crate::part::{FunctionCall, PartKind, StreamPart, ToolCall};
use crate::pipeline::{Chunk, ChunkStream, DeltaStream};

const FUNCTION_CALL_PREFIX: &str = "{\"function_call\":";
const TOOL_CALLS_PREFIX: &str = "{\"tool_calls\":";

/// A captured function call with its arguments decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedFunctionCall {
    pub name: String,
    pub arguments: Value,
}

/// One captured tool call with its arguments decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Result of running one tool call, used to build continuation messages.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub result: Value,
}

/// What a handler wants done with a captured call.
#[derive(Clone, Debug, PartialEq)]
pub enum CallResponse {
    /// Forward this text in place of the call.
    Text(String),
    /// Generate again from these messages and splice that output in.
    Continue(Vec<ChatMessage>),
}

/// Handles captured `function_call` payloads.
///
/// Returning `Ok(None)` or an error forwards the captured payload unchanged.
#[async_trait::async_trait]
pub trait FunctionCallHandler: Send + Sync {
    async fn on_function_call(
        &self,
        call: ParsedFunctionCall,
        ctx: &CallContext,
    ) -> Result<Option<CallResponse>, CallbackError>;
}

/// Handles captured `tool_calls` payloads.
#[async_trait::async_trait]
pub trait ToolCallHandler: Send + Sync {
    async fn on_tool_calls(
        &self,
        calls: Vec<ParsedToolCall>,
        ctx: &CallContext,
    ) -> Result<Option<CallResponse>, CallbackError>;
}

/// Starts a new generation from a continuation message list.
#[async_trait::async_trait]
pub trait ContinuationSource: Send + Sync {
    async fn continue_with(&self, messages: Vec<ChatMessage>) -> Result<DeltaStream, StreamError>;
}

/// Messages recorded by calls earlier in the same turn, plus helpers that
/// extend them with the current call and its result.
pub struct CallContext {
    assistant: ChatMessage,
    recorded: Mutex<Vec<ChatMessage>>,
}

impl CallContext {
    fn new(assistant: ChatMessage, recorded: Vec<ChatMessage>) -> Self {
        Self {
            assistant,
            recorded: Mutex::new(recorded),
        }
    }

    /// Call and result messages recorded so far in this turn.
    pub fn recorded_messages(&self) -> Vec<ChatMessage> {
        self.lock().clone()
    }

    /// Records the captured function call and its `result`, returning every
    /// message recorded in this turn.
    pub fn function_call_messages(&self, result: &Value) -> Vec<ChatMessage> {
        let name = self
            .assistant
            .function_call
            .as_ref()
            .map(|call| call.name.clone());
        let mut function = ChatMessage::new(Role::Function, result.to_string());
        function.name = name;

        let mut recorded = self.lock();
        recorded.push(self.assistant.clone());
        recorded.push(function);
        recorded.clone()
    }

    /// Records the captured tool calls and one tool message per result.
    pub fn tool_call_messages(&self, results: &[ToolCallResult]) -> Vec<ChatMessage> {
        let mut recorded = self.lock();
        recorded.push(self.assistant.clone());
        for result in results {
            let mut tool = ChatMessage::new(Role::Tool, result.result.to_string());
            tool.name = Some(result.name.clone());
            tool.tool_call_id = Some(result.id.clone());
            recorded.push(tool);
        }
        recorded.clone()
    }

    fn into_recorded(self) -> Vec<ChatMessage> {
        self.recorded
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChatMessage>> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CaptureMode {
    Undecided,
    Passthrough,
    Capturing,
}

pub(crate) struct InterceptorConfig {
    pub callbacks: Option<Arc<dyn StreamCallbacks>>,
    pub function_call_handler: Option<Arc<dyn FunctionCallHandler>>,
    pub tool_call_handler: Option<Arc<dyn ToolCallHandler>>,
    pub continuation: Option<Arc<dyn ContinuationSource>>,
    pub multiplexed: bool,
    pub max_continuations: usize,
}

pub(crate) struct Interceptor {
    config: Arc<InterceptorConfig>,
}

enum Resolution {
    Forward { chunk: Chunk, text: String },
    Continue(DeltaStream),
}

struct RunState {
    config: Arc<InterceptorConfig>,
    upstream: DeltaStream,
    mode: CaptureMode,
    captured: String,
    pending: VecDeque<Chunk>,
    forwarded: String,
    recorded: Vec<ChatMessage>,
    continuations: usize,
    done: bool,
}

impl Interceptor {
    pub(crate) fn new(config: InterceptorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub(crate) fn run(self, upstream: DeltaStream) -> ChunkStream {
        let state = RunState {
            config: self.config,
            upstream,
            mode: CaptureMode::Undecided,
            captured: String::new(),
            pending: VecDeque::new(),
            forwarded: String::new(),
            recorded: Vec::new(),
            continuations: 0,
            done: false,
        };

        Box::pin(stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Ok(Some((chunk, state)));
                }
                if state.done {
                    return Ok(None);
                }
                match state.upstream.next().await {
                    Some(Ok(delta)) => state.on_delta(delta),
                    Some(Err(err)) => return Err(err),
                    None => state.on_upstream_end().await,
                }
            }
        }))
    }
}

impl RunState {
    fn on_delta(&mut self, delta: String) {
        match self.mode {
            // An empty delta carries nothing to inspect; the first non-empty
            // delta decides the mode.
            CaptureMode::Undecided if delta.is_empty() => {}
            CaptureMode::Undecided => {
                if delta.starts_with(FUNCTION_CALL_PREFIX) || delta.starts_with(TOOL_CALLS_PREFIX) {
                    debug!(depth = self.continuations, "capturing structured call payload");
                    self.mode = CaptureMode::Capturing;
                    self.captured.push_str(&delta);
                } else {
                    self.mode = CaptureMode::Passthrough;
                    self.forward(Chunk::Text(delta.clone()), &delta);
                }
            }
            CaptureMode::Passthrough => self.forward(Chunk::Text(delta.clone()), &delta),
            CaptureMode::Capturing => self.captured.push_str(&delta),
        }
    }

    async fn on_upstream_end(&mut self) {
        if self.mode != CaptureMode::Capturing {
            self.finish().await;
            return;
        }

        let raw = std::mem::take(&mut self.captured);
        match self.resolve(raw).await {
            Resolution::Forward { chunk, text } => {
                self.forward(chunk, &text);
                self.finish().await;
            }
            Resolution::Continue(next) => {
                self.continuations += 1;
                debug!(depth = self.continuations, "splicing continuation stream");
                self.upstream = match &self.config.callbacks {
                    Some(callbacks) => instrument(next, callbacks.clone(), false),
                    None => next,
                };
                self.mode = CaptureMode::Undecided;
            }
        }
    }

    async fn resolve(&mut self, raw: String) -> Resolution {
        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "captured call payload is not valid JSON; forwarding as text");
                return Resolution::Forward {
                    chunk: Chunk::Text(raw.clone()),
                    text: raw,
                };
            }
        };
        let kind = if value.get("function_call").is_some() {
            PartKind::FunctionCall
        } else {
            PartKind::ToolCalls
        };
        let part = match StreamPart::from_payload(kind, value) {
            Ok(part) => part,
            Err(err) => {
                warn!(error = %err, "captured call payload has an unexpected shape; forwarding as text");
                return Resolution::Forward {
                    chunk: Chunk::Text(raw.clone()),
                    text: raw,
                };
            }
        };

        let config = self.config.clone();
        let outcome = match &part {
            StreamPart::FunctionCall(call) => match &config.function_call_handler {
                Some(handler) => {
                    let ctx = CallContext::new(
                        assistant_with_function_call(call),
                        std::mem::take(&mut self.recorded),
                    );
                    let outcome = match parse_arguments(&call.arguments) {
                        Ok(arguments) => {
                            let parsed = ParsedFunctionCall {
                                name: call.name.clone(),
                                arguments,
                            };
                            handler.on_function_call(parsed, &ctx).await
                        }
                        Err(err) => Err(err),
                    };
                    self.recorded = ctx.into_recorded();
                    Some(outcome)
                }
                None => None,
            },
            StreamPart::ToolCalls(calls) => match &config.tool_call_handler {
                Some(handler) => {
                    let ctx = CallContext::new(
                        assistant_with_tool_calls(calls),
                        std::mem::take(&mut self.recorded),
                    );
                    let outcome = match parse_tool_calls(calls) {
                        Ok(parsed) => handler.on_tool_calls(parsed, &ctx).await,
                        Err(err) => Err(err),
                    };
                    self.recorded = ctx.into_recorded();
                    Some(outcome)
                }
                None => None,
            },
            _ => None,
        };

        match outcome {
            Some(Ok(Some(CallResponse::Text(text)))) => Resolution::Forward {
                chunk: Chunk::Text(text.clone()),
                text,
            },
            Some(Ok(Some(CallResponse::Continue(messages)))) => {
                match self.start_continuation(messages).await {
                    Some(next) => Resolution::Continue(next),
                    None => self.forward_captured(part, raw),
                }
            }
            Some(Ok(None)) | None => self.forward_captured(part, raw),
            Some(Err(err)) => {
                warn!(error = %err, kind = %kind, "call handler failed; forwarding captured payload");
                self.forward_captured(part, raw)
            }
        }
    }

    // `RunState` is not `Sync`; holding `&self` across an await makes the stream future `!Send`.
    async fn start_continuation(&mut self, messages: Vec<ChatMessage>) -> Option<DeltaStream> {
        if self.continuations >= self.config.max_continuations {
            warn!(
                limit = self.config.max_continuations,
                "continuation limit reached; forwarding captured payload"
            );
            return None;
        }
        let Some(source) = &self.config.continuation else {
            warn!("handler asked to continue but no continuation source is configured");
            return None;
        };
        match source.continue_with(messages).await {
            Ok(next) => Some(next),
            Err(err) => {
                warn!(error = %err, "continuation failed to start; forwarding captured payload");
                None
            }
        }
    }

    fn forward_captured(&self, part: StreamPart, raw: String) -> Resolution {
        let chunk = if self.config.multiplexed {
            Chunk::Part(part)
        } else {
            Chunk::Text(raw.clone())
        };
        Resolution::Forward { chunk, text: raw }
    }

    fn forward(&mut self, chunk: Chunk, text: &str) {
        self.forwarded.push_str(text);
        self.pending.push_back(chunk);
    }

    async fn finish(&mut self) {
        self.done = true;
        if let Some(callbacks) = &self.config.callbacks {
            callbacks.on_final(&self.forwarded).await;
        }
    }
}

fn parse_arguments(arguments: &str) -> Result<Value, CallbackError> {
    serde_json::from_str(arguments).map_err(|e| Box::new(e) as CallbackError)
}

fn parse_tool_calls(calls: &[ToolCall]) -> Result<Vec<ParsedToolCall>, CallbackError> {
    calls
        .iter()
        .map(|call| {
            Ok(ParsedToolCall {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: parse_arguments(&call.function.arguments)?,
            })
        })
        .collect()
}

fn assistant_with_function_call(call: &FunctionCall) -> ChatMessage {
    let mut message = ChatMessage::new(Role::Assistant, "");
    message.function_call = Some(call.clone());
    message
}

fn assistant_with_tool_calls(calls: &[ToolCall]) -> ChatMessage {
    let mut message = ChatMessage::new(Role::Assistant, "");
    message.tool_calls = Some(calls.to_vec());
    message
}
