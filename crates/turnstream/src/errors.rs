use crate::part::PartKind;

/// Boxed error returned by user-supplied callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while turning a wire line back into a `StreamPart`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The line has no `:` between code and payload.
    #[error("failed to parse stream part: missing `:` separator in {line:?}")]
    MissingSeparator { line: String },
    /// The prefix is not one of the known part codes.
    #[error("failed to parse stream part: invalid code {code:?}")]
    InvalidCode { code: String },
    /// The payload after the separator is not valid JSON.
    #[error("invalid JSON in {kind} part: {message}")]
    InvalidJson { kind: PartKind, message: String },
    /// The payload is valid JSON but does not match the shape for its kind.
    #[error("malformed {kind} part: {message}")]
    MalformedPayload { kind: PartKind, message: String },
}

impl DecodeError {
    pub(crate) fn malformed(kind: PartKind, message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            kind,
            message: message.into(),
        }
    }
}

/// Errors raised while formatting a part for the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// The requested kind name is not in the part table.
    #[error("invalid stream part type: {name}")]
    InvalidKind { name: String },
    /// The payload could not be serialized.
    #[error("failed to serialize {kind} part: {message}")]
    Json { kind: PartKind, message: String },
}

/// Programmer errors on a `StreamData` side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MisuseError {
    /// `append` was called after `close`.
    #[error("data stream is already closed")]
    AppendAfterClose,
    /// `append_message_annotation` was called after `close`.
    #[error("data stream is already closed; cannot append annotation")]
    AnnotationAfterClose,
    /// `close` was called more than once.
    #[error("data stream has already been closed")]
    DoubleClose,
}

/// Failures of the HTTP request surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent.
    #[error("request failed: {0}")]
    Request(String),
    /// The server answered with a non-success status; `message` is the body.
    #[error("{message}")]
    Status { status: u16, message: String },
    /// The response has no body to stream.
    #[error("the response body is empty")]
    MissingBody,
    /// Reading the body failed mid-stream.
    #[error("failed to read response body: {0}")]
    Read(String),
}

/// Top-level error for every stream stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Misuse(#[from] MisuseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Invalid client or pipeline configuration.
    #[error("config error: {0}")]
    Config(String),
    /// The producer sent an `error` part.
    #[error("stream reported an error: {0}")]
    Remote(String),
    /// The producer stream failed for a reason outside this crate.
    #[error("upstream error: {0}")]
    Upstream(String),
    /// The receiving side went away before the stream finished.
    #[error("stream receiver dropped")]
    Disconnected,
}

impl StreamError {
    /// Wraps any displayable upstream failure.
    pub fn upstream(message: impl std::fmt::Display) -> Self {
        Self::Upstream(message.to_string())
    }

    /// Returns true for errors raised by the wire decoder.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}
