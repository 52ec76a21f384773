//! Common imports for typical usage.
//!
//! Covers the producer pipeline, the consumer reader and the error type so
//! application code needs fewer import lines.
pub use crate::{
    AbortHandle, AbortSignal, ByteStream, ChatClient, ChatClientConfig, ChatMessage, ChatRequest,
    DeltaStream, Message, Reconstruction, Role, StreamCallbacks, StreamData, StreamError,
    StreamPart, StreamPipeline, abort_pair, read_parts, reconstruct,
};
