use std::time::Duration;

use futures::StreamExt as _;
use serde_json::{Map, Value};
use tracing::debug;

use crate::cancel::AbortSignal;
use crate::codec::{Utf8Decoder, read_parts};
use crate::errors::{StreamError, TransportError};
use crate::message::ChatMessage;
use crate::part::StreamPart;
use crate::pipeline::{ByteStream, STREAM_DATA_HEADER};
use crate::reconstruct::{Reconstruction, Reconstructor, Snapshot};

/// Configuration for a chat endpoint client.
#[derive(Clone, Debug)]
pub struct ChatClientConfig {
    /// Full URL of the chat endpoint (for example `http://localhost:3000/api/chat`).
    pub api_url: String,
    /// Default HTTP timeout for requests.
    pub timeout: Duration,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl ChatClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            timeout: Duration::from_secs(120),
            headers: Vec::new(),
        }
    }

    /// Builds a config from `TURNSTREAM_API_URL`.
    pub fn from_env() -> Result<Self, StreamError> {
        let api_url = std::env::var("TURNSTREAM_API_URL").unwrap_or_default();
        if api_url.trim().is_empty() {
            return Err(StreamError::Config(
                "missing TURNSTREAM_API_URL for chat client".into(),
            ));
        }
        Ok(Self::new(api_url))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Body of a chat request: the conversation plus caller-supplied fields.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            extra: Map::new(),
        }
    }

    /// Adds a top-level field to the request body.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// An open response body, classified by the transport marker header.
pub enum ChatResponse {
    /// Body is multiplexed protocol lines.
    Multiplexed(ByteStream),
    /// Body is raw generated text.
    Text(ByteStream),
}

/// Client for endpoints that stream chat turns.
pub struct ChatClient {
    client: reqwest::Client,
    config: ChatClientConfig,
}

impl ChatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, StreamError> {
        if config.api_url.trim().is_empty() {
            return Err(StreamError::Config("chat client api_url must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, StreamError> {
        Self::new(ChatClientConfig::from_env()?)
    }

    /// Posts `request` and returns the body once the status is known.
    pub async fn open(&self, request: &ChatRequest) -> Result<ChatResponse, TransportError> {
        let mut http_req = self.client.post(&self.config.api_url).json(request);
        for (name, value) in &self.config.headers {
            http_req = http_req.header(name, value);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }
        if response.content_length() == Some(0) {
            return Err(TransportError::MissingBody);
        }

        let multiplexed = response
            .headers()
            .get(STREAM_DATA_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));
        debug!(status = %status, multiplexed, "chat response opened");

        let body: ByteStream = Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| StreamError::Transport(TransportError::Read(e.to_string())))
        }));
        Ok(if multiplexed {
            ChatResponse::Multiplexed(body)
        } else {
            ChatResponse::Text(body)
        })
    }

    /// Sends `request` and reconstructs the streamed turn, handing every
    /// intermediate snapshot to `on_update`.
    ///
    /// An abort cancels the pending request or body read and returns what was
    /// reconstructed so far with `cancelled` set. `cancelled` stays false when
    /// the body was read to the end.
    pub async fn send<F>(
        &self,
        request: &ChatRequest,
        abort: AbortSignal,
        on_update: F,
    ) -> Result<Reconstruction, StreamError>
    where
        F: FnMut(Snapshot),
    {
        let response = tokio::select! {
            biased;
            () = abort.aborted() => {
                debug!("chat request aborted before the response arrived");
                return Ok(cancelled(Reconstructor::new()));
            }
            response = self.open(request) => response?,
        };
        match response {
            ChatResponse::Multiplexed(body) => read_multiplexed(body, &abort, on_update).await,
            ChatResponse::Text(body) => read_text(body, &abort, on_update).await,
        }
    }
}

fn cancelled(reconstructor: Reconstructor) -> Reconstruction {
    let mut result = reconstructor.finish();
    result.cancelled = true;
    result
}

/// Reads multiplexed protocol lines into a reconstructed turn.
async fn read_multiplexed<F>(
    body: ByteStream,
    abort: &AbortSignal,
    mut on_update: F,
) -> Result<Reconstruction, StreamError>
where
    F: FnMut(Snapshot),
{
    // Abort is raced against every read below, so the reader never stops on its own.
    let mut parts = std::pin::pin!(read_parts(body, || false));
    let mut reconstructor = Reconstructor::new();
    loop {
        tokio::select! {
            biased;
            () = abort.aborted() => {
                debug!("multiplexed read aborted by caller");
                return Ok(cancelled(reconstructor));
            }
            next = parts.next() => match next {
                Some(part) => {
                    reconstructor.apply(part?)?;
                    on_update(reconstructor.snapshot());
                }
                None => return Ok(reconstructor.finish()),
            },
        }
    }
}

/// Reads a raw text body into a single assistant message.
async fn read_text<F>(
    mut body: ByteStream,
    abort: &AbortSignal,
    mut on_update: F,
) -> Result<Reconstruction, StreamError>
where
    F: FnMut(Snapshot),
{
    let mut decoder = Utf8Decoder::default();
    let mut reconstructor = Reconstructor::new();
    loop {
        let chunk = tokio::select! {
            biased;
            () = abort.aborted() => {
                debug!("raw text read aborted by caller");
                return Ok(cancelled(reconstructor));
            }
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let text = decoder.decode(&chunk?);
        if !text.is_empty() {
            reconstructor.apply(StreamPart::Text(text))?;
            on_update(reconstructor.snapshot());
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        reconstructor.apply(StreamPart::Text(tail))?;
        on_update(reconstructor.snapshot());
    }
    Ok(reconstructor.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::abort_pair;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> ChatClient {
        ChatClient::new(ChatClientConfig::new(format!("{}/api/chat", server.uri())))
            .expect("client")
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user("hello")]).field("temperature", 0.2)
    }

    #[test]
    fn request_body_flattens_extra_fields() {
        let value = serde_json::to_value(request()).expect("serialize");
        assert_eq!(value["messages"][0]["content"], "hello");
        assert_eq!(value["temperature"], 0.2);
    }

    #[tokio::test]
    async fn multiplexed_body_is_reconstructed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"temperature": 0.2})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(STREAM_DATA_HEADER, "true")
                    .set_body_string("0:\"Hi\"\n2:[{\"a\":1}]\n0:\" there\"\n"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let mut updates = 0;
        let result = client
            .send(&request(), AbortSignal::never(), |_| updates += 1)
            .await
            .expect("send");
        assert_eq!(result.messages[0].content, "Hi there");
        assert_eq!(result.data, vec![serde_json::json!({"a": 1})]);
        assert_eq!(updates, 3);
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn raw_body_becomes_one_text_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string("0:\"not parsed\"\n"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let result = client
            .send(&request(), AbortSignal::never(), |_| {})
            .await
            .expect("send");
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].content, "0:\"not parsed\"\n");
        assert!(result.data.is_empty());
    }

    #[tokio::test]
    async fn error_status_surfaces_body_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .send(&request(), AbortSignal::never(), |_| {})
            .await
            .expect_err("status error");
        assert_eq!(
            err,
            StreamError::Transport(TransportError::Status {
                status: 429,
                message: "rate limited".into(),
            })
        );
        assert_eq!(err.to_string(), "rate limited");
    }

    #[tokio::test]
    async fn empty_body_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .send(&request(), AbortSignal::never(), |_| {})
            .await
            .expect_err("empty body");
        assert_eq!(err, StreamError::Transport(TransportError::MissingBody));
    }

    #[tokio::test]
    async fn abort_before_reading_keeps_partial_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(STREAM_DATA_HEADER, "true")
                    .set_body_string("0:\"Hi\"\n"),
            )
            .mount(&server)
            .await;

        let (handle, signal) = abort_pair();
        handle.abort();
        let client = client_for(&server).await;
        let result = client.send(&request(), signal, |_| {}).await.expect("send");
        assert!(result.cancelled);
        assert!(result.messages.is_empty());
    }

    #[tokio::test]
    async fn abort_cancels_a_request_still_waiting_for_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(STREAM_DATA_HEADER, "true")
                    .set_body_string("0:\"slow\"\n")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let (handle, signal) = abort_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.abort();
        });
        let client = client_for(&server).await;
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            client.send(&request(), signal, |_| {}),
        )
        .await
        .expect("send returns promptly after abort")
        .expect("send");
        assert!(result.cancelled);
        assert!(result.messages.is_empty());
    }

    #[tokio::test]
    async fn abort_mid_body_keeps_parts_seen_so_far() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(STREAM_DATA_HEADER, "true")
                    .set_body_string("0:\"Hi\"\n0:\" there\"\n"),
            )
            .mount(&server)
            .await;

        let (handle, signal) = abort_pair();
        let client = client_for(&server).await;
        let result = client
            .send(&request(), signal, |_| handle.abort())
            .await
            .expect("send");
        assert!(result.cancelled);
        assert_eq!(result.messages[0].content, "Hi");
    }

    #[tokio::test]
    async fn abort_after_a_complete_read_is_not_a_cancellation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(STREAM_DATA_HEADER, "true")
                    .set_body_string("0:\"done\"\n"),
            )
            .mount(&server)
            .await;

        let (handle, signal) = abort_pair();
        let client = client_for(&server).await;
        let result = client
            .send(&request(), signal.clone(), |_| {})
            .await
            .expect("send");
        handle.abort();
        assert!(signal.is_aborted());
        assert!(!result.cancelled);
        assert_eq!(result.messages[0].content, "done");
    }

    #[test]
    fn from_env_requires_api_url() {
        if std::env::var("TURNSTREAM_API_URL").is_ok() {
            return;
        }
        assert!(matches!(
            ChatClientConfig::from_env(),
            Err(StreamError::Config(message)) if message.contains("TURNSTREAM_API_URL")
        ));
    }
}
