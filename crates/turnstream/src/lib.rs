//! Streaming chat turns over a multiplexed line protocol.
//!
//! The producer side wraps a model's text deltas with lifecycle callbacks,
//! optionally intercepts function/tool calls, and multiplexes side-channel
//! data into `<code>:<json>\n` lines. The consumer side decodes those lines
//! and rebuilds the assistant turn incrementally.
//!
//! # Producer and consumer in one process
//!
//! ```no_run
//! use futures::stream;
//! use turnstream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let data = StreamData::new();
//! let deltas: DeltaStream = Box::pin(stream::iter(vec![
//!     Ok("Hello".to_string()),
//!     Ok(" world".to_string()),
//! ]));
//! let body = StreamPipeline::new()
//!     .stream_data(data.clone())
//!     .into_bytes(deltas);
//!
//! data.append(serde_json::json!({"source": "kb"}))?;
//! data.close()?;
//!
//! let turn = reconstruct(read_parts(body, || false), |_| {}).await?;
//! println!("{:?}", turn.text().map(|m| &m.content));
//! # Ok(())
//! # }
//! ```

/// Assistant response builder (control data, messages, data messages).
pub mod assistant;
/// Lifecycle callbacks around a stream of text deltas.
pub mod callbacks;
/// Cooperative cancellation for consumers.
pub mod cancel;
/// HTTP client that posts a chat request and reconstructs the reply.
pub mod client;
/// Byte, UTF-8 and line decoding for protocol bodies.
pub mod codec;
/// Side-channel data and message annotations.
pub mod data;
/// Public error types.
pub mod errors;
/// Function/tool call capture, handler dispatch and continuation.
pub mod interceptor;
/// Chat messages sent to and rebuilt from the wire.
pub mod message;
/// Merges side-channel data with the main stream.
pub mod multiplex;
/// Process-wide tracing setup.
pub mod observability;
/// Part kinds, payloads and the line codec.
pub mod part;
/// Producer-side stage composition.
pub mod pipeline;
/// Common imports for typical usage.
pub mod prelude;
/// Incremental reconstruction of chat turns and assistant threads.
pub mod reconstruct;

pub use assistant::{AssistantWriter, assistant_response};
pub use callbacks::{StreamCallbacks, instrument};
pub use cancel::{AbortHandle, AbortSignal, abort_pair};
pub use client::{ChatClient, ChatClientConfig, ChatRequest, ChatResponse};
pub use codec::{LineDecoder, Utf8Decoder, read_parts};
pub use data::StreamData;
pub use errors::{
    CallbackError, DecodeError, EncodeError, MisuseError, StreamError, TransportError,
};
pub use interceptor::{
    CallContext, CallResponse, ContinuationSource, FunctionCallHandler, ParsedFunctionCall,
    ParsedToolCall, ToolCallHandler, ToolCallResult,
};
pub use message::{ChatMessage, Message, Role};
pub use multiplex::multiplex;
pub use observability::{ObservabilitySettings, init_observability};
pub use part::{
    AssistantControlData, AssistantMessage, DataMessage, FunctionCall, PartKind, StreamPart,
    ToolCall, decode, encode,
};
pub use pipeline::{
    ByteStream, Chunk, ChunkStream, DeltaStream, STREAM_DATA_HEADER, StreamPipeline,
};
pub use reconstruct::{AssistantThread, Reconstruction, Reconstructor, Snapshot, reconstruct};
