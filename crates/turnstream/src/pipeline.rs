use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::callbacks::{StreamCallbacks, instrument};
use crate::data::StreamData;
use crate::errors::StreamError;
use crate::interceptor::{
    ContinuationSource, FunctionCallHandler, Interceptor, InterceptorConfig, ToolCallHandler,
};
use crate::multiplex::multiplex;
use crate::part::StreamPart;

/// Response header marking a body as multiplexed protocol lines.
pub const STREAM_DATA_HEADER: &str = "x-experimental-stream-data";

/// Text deltas produced by a model, before any protocol framing.
pub type DeltaStream = Pin<Box<dyn futures::Stream<Item = Result<String, StreamError>> + Send>>;

/// Units flowing from the interceptor into the multiplexer.
pub type ChunkStream = Pin<Box<dyn futures::Stream<Item = Result<Chunk, StreamError>> + Send>>;

/// Encoded output (or raw transport input) bytes.
pub type ByteStream = Pin<Box<dyn futures::Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// A unit handed to the multiplexer.
#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
    /// Generated text; framed as a `text` part when multiplexing.
    Text(String),
    /// An already structured part (function or tool calls).
    Part(StreamPart),
}

/// Builder that composes the producer-side stages:
/// instrumentation, optional call interception, and multiplexing.
///
/// ```no_run
/// use futures::stream;
/// use turnstream::{DeltaStream, StreamData, StreamPipeline};
///
/// let data = StreamData::new();
/// let deltas: DeltaStream = Box::pin(stream::iter(vec![Ok("Hi".to_string())]));
/// let body = StreamPipeline::new().stream_data(data.clone()).into_bytes(deltas);
/// data.append(serde_json::json!({"source": "kb"})).unwrap();
/// data.close().unwrap();
/// # drop(body);
/// ```
#[derive(Clone)]
pub struct StreamPipeline {
    callbacks: Option<Arc<dyn StreamCallbacks>>,
    function_call_handler: Option<Arc<dyn FunctionCallHandler>>,
    tool_call_handler: Option<Arc<dyn ToolCallHandler>>,
    continuation: Option<Arc<dyn ContinuationSource>>,
    data: Option<StreamData>,
    intercept_calls: bool,
    max_continuations: usize,
}

impl Default for StreamPipeline {
    fn default() -> Self {
        Self {
            callbacks: None,
            function_call_handler: None,
            tool_call_handler: None,
            continuation: None,
            data: None,
            intercept_calls: false,
            max_continuations: 8,
        }
    }
}

impl StreamPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets lifecycle hooks fired while the deltas stream through.
    pub fn callbacks(mut self, callbacks: Arc<dyn StreamCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Attaches a side channel; this also switches output to multiplexed lines.
    pub fn stream_data(mut self, data: StreamData) -> Self {
        self.data = Some(data);
        self
    }

    /// Enables the interceptor without any handler, so captured calls are
    /// forwarded as structured parts.
    pub fn intercept_calls(mut self) -> Self {
        self.intercept_calls = true;
        self
    }

    /// Handles captured `function_call` payloads (enables interception).
    pub fn on_function_call(mut self, handler: Arc<dyn FunctionCallHandler>) -> Self {
        self.function_call_handler = Some(handler);
        self.intercept_calls = true;
        self
    }

    /// Handles captured `tool_calls` payloads (enables interception).
    pub fn on_tool_calls(mut self, handler: Arc<dyn ToolCallHandler>) -> Self {
        self.tool_call_handler = Some(handler);
        self.intercept_calls = true;
        self
    }

    /// Starts follow-up generations when a handler asks to continue.
    pub fn continuation_source(mut self, source: Arc<dyn ContinuationSource>) -> Self {
        self.continuation = Some(source);
        self
    }

    /// Maximum number of chained continuations in one turn.
    pub fn max_continuations(mut self, limit: usize) -> Self {
        self.max_continuations = limit;
        self
    }

    /// Whether the produced body is multiplexed protocol lines.
    pub fn is_multiplexed(&self) -> bool {
        self.data.is_some()
    }

    /// Headers a server should attach to the response carrying this body.
    pub fn response_headers(&self) -> Vec<(&'static str, &'static str)> {
        let mut headers = vec![("content-type", "text/plain; charset=utf-8")];
        if self.is_multiplexed() {
            headers.push((STREAM_DATA_HEADER, "true"));
        }
        headers
    }

    /// Composes the stages around `upstream` and returns the encoded body.
    pub fn into_bytes(self, upstream: DeltaStream) -> ByteStream {
        let multiplexed = self.is_multiplexed();
        let chunks = self.into_chunks(upstream, multiplexed);
        multiplex(chunks, self.data)
    }

    fn into_chunks(&self, upstream: DeltaStream, multiplexed: bool) -> ChunkStream {
        if !self.intercept_calls {
            let instrumented = match &self.callbacks {
                Some(callbacks) => instrument(upstream, callbacks.clone(), true),
                None => upstream,
            };
            return Box::pin(futures::StreamExt::map(instrumented, |item| {
                item.map(Chunk::Text)
            }));
        }

        let upstream = match &self.callbacks {
            Some(callbacks) => instrument(upstream, callbacks.clone(), false),
            None => upstream,
        };
        let config = InterceptorConfig {
            callbacks: self.callbacks.clone(),
            function_call_handler: self.function_call_handler.clone(),
            tool_call_handler: self.tool_call_handler.clone(),
            continuation: self.continuation.clone(),
            multiplexed,
            max_continuations: self.max_continuations,
        };
        Interceptor::new(config).run(upstream)
    }
}
