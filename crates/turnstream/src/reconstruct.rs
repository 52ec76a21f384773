use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use serde_json::Value;
use tracing::debug;

use crate::errors::StreamError;
use crate::message::{Message, Role};
use crate::part::StreamPart;

/// Messages and data as they stand after one part has been applied.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Present messages in the order function call, tool calls, text.
    pub messages: Vec<Message>,
    pub data: Vec<Value>,
}

/// Final state of one reconstruction pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Reconstruction {
    pub messages: Vec<Message>,
    pub data: Vec<Value>,
    /// True when the caller aborted before the stream ended.
    pub cancelled: bool,
}

impl Reconstruction {
    /// The assistant text message, if any text was streamed.
    pub fn text(&self) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.function_call.is_none() && message.tool_calls.is_none())
    }
}

type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Rebuilds the assistant turn from decoded parts.
///
/// One accumulator exists per kind (text, function call, tool calls). Ids
/// and creation time are fixed when an accumulator is first created; a later
/// call part replaces the payload but keeps the id.
pub struct Reconstructor {
    created_at: DateTime<Utc>,
    generate_id: IdGenerator,
    function_call: Option<Message>,
    tool_calls: Option<Message>,
    text: Option<Message>,
    data: Vec<Value>,
    annotations: Vec<Value>,
}

impl Default for Reconstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconstructor {
    pub fn new() -> Self {
        Self::with_id_generator(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id_generator(generate_id: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            created_at: Utc::now(),
            generate_id: Box::new(generate_id),
            function_call: None,
            tool_calls: None,
            text: None,
            data: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// Applies one decoded part. An `error` part ends the pass.
    pub fn apply(&mut self, part: StreamPart) -> Result<(), StreamError> {
        match part {
            StreamPart::Text(text) => {
                let message = match self.text.take() {
                    Some(message) => message,
                    None => self.new_message(),
                };
                let message = self.text.insert(message);
                message.content.push_str(&text);
            }
            StreamPart::FunctionCall(call) => {
                let mut message = match self.function_call.take() {
                    Some(message) => message,
                    None => self.new_message(),
                };
                message.name = Some(call.name.clone());
                message.function_call = Some(call);
                self.function_call = Some(message);
            }
            StreamPart::ToolCalls(calls) => {
                let mut message = match self.tool_calls.take() {
                    Some(message) => message,
                    None => self.new_message(),
                };
                message.tool_calls = Some(calls);
                self.tool_calls = Some(message);
            }
            StreamPart::Data(items) => self.data.extend(items),
            StreamPart::MessageAnnotations(items) => {
                self.annotations.extend(items);
                let snapshot = self.annotations.clone();
                for message in [&mut self.function_call, &mut self.tool_calls, &mut self.text]
                    .into_iter()
                    .flatten()
                {
                    message.annotations = Some(snapshot.clone());
                }
            }
            StreamPart::Error(message) => return Err(StreamError::Remote(message)),
            other => debug!(kind = %other.kind(), "ignoring part outside a chat turn"),
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            messages: self.messages(),
            data: self.data.clone(),
        }
    }

    pub fn finish(self) -> Reconstruction {
        Reconstruction {
            messages: self.messages(),
            data: self.data,
            cancelled: false,
        }
    }

    /// Applies every part of `parts`, handing a snapshot to `on_update`
    /// after each one.
    pub async fn consume<S, F>(mut self, parts: S, mut on_update: F) -> Result<Reconstruction, StreamError>
    where
        S: futures::Stream<Item = Result<StreamPart, StreamError>>,
        F: FnMut(Snapshot),
    {
        let mut parts = std::pin::pin!(parts);
        while let Some(part) = parts.next().await {
            self.apply(part?)?;
            on_update(self.snapshot());
        }
        Ok(self.finish())
    }

    fn messages(&self) -> Vec<Message> {
        [&self.function_call, &self.tool_calls, &self.text]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn new_message(&self) -> Message {
        let mut message = Message::new((self.generate_id)(), Role::Assistant, self.created_at);
        if !self.annotations.is_empty() {
            message.annotations = Some(self.annotations.clone());
        }
        message
    }
}

/// Reconstructs a chat turn with a fresh `Reconstructor`.
pub async fn reconstruct<S, F>(parts: S, on_update: F) -> Result<Reconstruction, StreamError>
where
    S: futures::Stream<Item = Result<StreamPart, StreamError>>,
    F: FnMut(Snapshot),
{
    Reconstructor::new().consume(parts, on_update).await
}

/// Thread state rebuilt from an assistant response stream.
#[derive(Clone, Debug, Default)]
pub struct AssistantThread {
    thread_id: Option<String>,
    messages: Vec<Message>,
}

impl AssistantThread {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from messages already shown locally (typically the user's
    /// prompt, whose id the control part replaces).
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            thread_id: None,
            messages,
        }
    }

    pub fn apply(&mut self, part: StreamPart) -> Result<(), StreamError> {
        match part {
            StreamPart::AssistantMessage(message) => {
                let mut rebuilt = Message::new(message.id, Role::Assistant, Utc::now());
                rebuilt.content = message.content.concat();
                self.messages.push(rebuilt);
            }
            StreamPart::DataMessage(message) => {
                let id = message
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let mut rebuilt = Message::new(id, Role::Data, Utc::now());
                rebuilt.data = Some(message.data);
                self.messages.push(rebuilt);
            }
            StreamPart::AssistantControlData(control) => {
                self.thread_id = Some(control.thread_id);
                if let Some(last) = self.messages.last_mut() {
                    last.id = control.message_id;
                }
            }
            StreamPart::Error(message) => return Err(StreamError::Remote(message)),
            other => debug!(kind = %other.kind(), "ignoring part outside an assistant thread"),
        }
        Ok(())
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_parts;
    use crate::errors::DecodeError;
    use crate::part::{AssistantControlData, AssistantMessage, DataMessage, FunctionCall};
    use crate::pipeline::ByteStream;
    use bytes::Bytes;
    use futures::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_ids() -> Reconstructor {
        let next = AtomicUsize::new(0);
        Reconstructor::with_id_generator(move || {
            format!("msg_{}", next.fetch_add(1, Ordering::SeqCst))
        })
    }

    fn parts(items: Vec<StreamPart>) -> impl futures::Stream<Item = Result<StreamPart, StreamError>> {
        stream::iter(items.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn text_and_data_rebuild_the_turn() {
        let body: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from(
            "0:\"Hi\"\n2:[{\"a\":1}]\n0:\" there\"\n",
        ))]));
        let mut updates = Vec::new();
        let result = reconstruct(read_parts(body, || false), |snapshot| updates.push(snapshot))
            .await
            .expect("reconstruct");

        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].content, "Hi there");
        assert_eq!(result.messages[0].role, Role::Assistant);
        assert_eq!(result.data, vec![json!({"a": 1})]);
        assert!(!result.cancelled);

        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].messages[0].content, "Hi");
        assert!(updates[0].data.is_empty());
        assert_eq!(updates[1].data, vec![json!({"a": 1})]);
    }

    #[test]
    fn annotations_are_restamped_on_every_message() {
        let mut reconstructor = counting_ids();
        reconstructor
            .apply(StreamPart::Text("abc".into()))
            .expect("text");
        reconstructor
            .apply(StreamPart::MessageAnnotations(vec![json!("A")]))
            .expect("annotation");
        let snapshot = reconstructor.snapshot();
        assert_eq!(snapshot.messages[0].content, "abc");
        assert_eq!(snapshot.messages[0].annotations, Some(vec![json!("A")]));

        reconstructor
            .apply(StreamPart::FunctionCall(FunctionCall {
                name: "f".into(),
                arguments: "{}".into(),
            }))
            .expect("call");
        reconstructor
            .apply(StreamPart::MessageAnnotations(vec![json!("B")]))
            .expect("annotation");
        let snapshot = reconstructor.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        for message in &snapshot.messages {
            assert_eq!(message.annotations, Some(vec![json!("A"), json!("B")]));
        }
    }

    #[test]
    fn snapshot_orders_call_messages_before_text() {
        let mut reconstructor = counting_ids();
        reconstructor.apply(StreamPart::Text("t".into())).expect("text");
        reconstructor
            .apply(StreamPart::ToolCalls(vec![]))
            .expect("tools");
        reconstructor
            .apply(StreamPart::FunctionCall(FunctionCall {
                name: "f".into(),
                arguments: "{}".into(),
            }))
            .expect("call");

        let ids: Vec<_> = reconstructor
            .snapshot()
            .messages
            .into_iter()
            .map(|message| message.id)
            .collect();
        assert_eq!(ids, vec!["msg_2", "msg_1", "msg_0"]);
    }

    #[test]
    fn second_function_call_replaces_payload_and_keeps_id() {
        let mut reconstructor = counting_ids();
        for name in ["first", "second"] {
            reconstructor
                .apply(StreamPart::FunctionCall(FunctionCall {
                    name: name.into(),
                    arguments: "{}".into(),
                }))
                .expect("call");
        }
        let result = reconstructor.finish();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].id, "msg_0");
        assert_eq!(result.messages[0].name.as_deref(), Some("second"));
        assert_eq!(result.messages[0].content, "");
    }

    #[tokio::test]
    async fn decode_failure_aborts_without_partial_result() {
        let body: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from("0:\"partial\"\n")),
            Ok(Bytes::from("9:\"x\"\n")),
        ]));
        let result = reconstruct(read_parts(body, || false), |_| {}).await;
        assert!(matches!(
            result,
            Err(StreamError::Decode(DecodeError::InvalidCode { .. }))
        ));
    }

    #[tokio::test]
    async fn error_part_ends_reconstruction() {
        let result = reconstruct(
            parts(vec![
                StreamPart::Text("x".into()),
                StreamPart::Error("rate limited".into()),
            ]),
            |_| {},
        )
        .await;
        assert_eq!(result, Err(StreamError::Remote("rate limited".into())));
    }

    #[test]
    fn assistant_thread_tracks_control_data_and_messages() {
        let user = Message::new("local".into(), Role::User, Utc::now());
        let mut thread = AssistantThread::with_messages(vec![user]);

        thread
            .apply(StreamPart::AssistantControlData(AssistantControlData {
                thread_id: "thread_1".into(),
                message_id: "msg_user".into(),
            }))
            .expect("control");
        thread
            .apply(StreamPart::AssistantMessage(AssistantMessage {
                id: "msg_reply".into(),
                content: vec!["Hello".into(), " there".into()],
            }))
            .expect("message");
        thread
            .apply(StreamPart::DataMessage(DataMessage {
                id: Some("d1".into()),
                data: json!({"chart": [1, 2]}),
            }))
            .expect("data");

        assert_eq!(thread.thread_id(), Some("thread_1"));
        let messages = thread.messages();
        assert_eq!(messages[0].id, "msg_user");
        assert_eq!(messages[1].content, "Hello there");
        assert_eq!(messages[2].role, Role::Data);
        assert_eq!(messages[2].data, Some(json!({"chart": [1, 2]})));

        assert!(matches!(
            thread.apply(StreamPart::Error("run failed".into())),
            Err(StreamError::Remote(message)) if message == "run failed"
        ));
    }
}
