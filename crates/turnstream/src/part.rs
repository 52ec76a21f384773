use std::fmt;

use serde_json::{Map, Value, json};

use crate::errors::{DecodeError, EncodeError};

/// The closed set of part kinds carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartKind {
    Text,
    FunctionCall,
    Data,
    Error,
    AssistantMessage,
    AssistantControlData,
    DataMessage,
    ToolCalls,
    MessageAnnotations,
}

impl PartKind {
    /// Every kind in code order.
    pub const ALL: [PartKind; 9] = [
        PartKind::Text,
        PartKind::FunctionCall,
        PartKind::Data,
        PartKind::Error,
        PartKind::AssistantMessage,
        PartKind::AssistantControlData,
        PartKind::DataMessage,
        PartKind::ToolCalls,
        PartKind::MessageAnnotations,
    ];

    /// Single-character wire code.
    pub const fn code(self) -> char {
        match self {
            PartKind::Text => '0',
            PartKind::FunctionCall => '1',
            PartKind::Data => '2',
            PartKind::Error => '3',
            PartKind::AssistantMessage => '4',
            PartKind::AssistantControlData => '5',
            PartKind::DataMessage => '6',
            PartKind::ToolCalls => '7',
            PartKind::MessageAnnotations => '8',
        }
    }

    /// Looks up a kind by its wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(PartKind::Text),
            "1" => Some(PartKind::FunctionCall),
            "2" => Some(PartKind::Data),
            "3" => Some(PartKind::Error),
            "4" => Some(PartKind::AssistantMessage),
            "5" => Some(PartKind::AssistantControlData),
            "6" => Some(PartKind::DataMessage),
            "7" => Some(PartKind::ToolCalls),
            "8" => Some(PartKind::MessageAnnotations),
            _ => None,
        }
    }

    /// Protocol name of the kind (for example `function_call`).
    pub const fn name(self) -> &'static str {
        match self {
            PartKind::Text => "text",
            PartKind::FunctionCall => "function_call",
            PartKind::Data => "data",
            PartKind::Error => "error",
            PartKind::AssistantMessage => "assistant_message",
            PartKind::AssistantControlData => "assistant_control_data",
            PartKind::DataMessage => "data_message",
            PartKind::ToolCalls => "tool_calls",
            PartKind::MessageAnnotations => "message_annotations",
        }
    }

    /// Looks up a kind by its protocol name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for PartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A function invocation with its arguments as a JSON-encoded string.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// One entry of a `tool_calls` payload.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

/// A complete assistant message sent by the assistant response surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssistantMessage {
    pub id: String,
    /// Text values of each `{type: "text"}` content entry, in order.
    pub content: Vec<String>,
}

/// Thread bookkeeping sent ahead of an assistant response.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AssistantControlData {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

/// A `role: "data"` message carrying an arbitrary JSON value.
#[derive(Clone, Debug, PartialEq)]
pub struct DataMessage {
    pub id: Option<String>,
    pub data: Value,
}

/// One decoded unit of the multiplexed stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamPart {
    Text(String),
    FunctionCall(FunctionCall),
    Data(Vec<Value>),
    Error(String),
    AssistantMessage(AssistantMessage),
    AssistantControlData(AssistantControlData),
    DataMessage(DataMessage),
    ToolCalls(Vec<ToolCall>),
    MessageAnnotations(Vec<Value>),
}

impl StreamPart {
    pub fn kind(&self) -> PartKind {
        match self {
            StreamPart::Text(_) => PartKind::Text,
            StreamPart::FunctionCall(_) => PartKind::FunctionCall,
            StreamPart::Data(_) => PartKind::Data,
            StreamPart::Error(_) => PartKind::Error,
            StreamPart::AssistantMessage(_) => PartKind::AssistantMessage,
            StreamPart::AssistantControlData(_) => PartKind::AssistantControlData,
            StreamPart::DataMessage(_) => PartKind::DataMessage,
            StreamPart::ToolCalls(_) => PartKind::ToolCalls,
            StreamPart::MessageAnnotations(_) => PartKind::MessageAnnotations,
        }
    }

    /// Wire-shaped JSON payload of the part.
    pub fn payload(&self) -> Value {
        match self {
            StreamPart::Text(text) | StreamPart::Error(text) => Value::String(text.clone()),
            StreamPart::FunctionCall(call) => json!({ "function_call": call }),
            StreamPart::Data(items) | StreamPart::MessageAnnotations(items) => {
                Value::Array(items.clone())
            }
            StreamPart::AssistantMessage(message) => {
                let content = message
                    .content
                    .iter()
                    .map(|value| json!({ "type": "text", "text": { "value": value } }))
                    .collect::<Vec<_>>();
                json!({ "id": message.id, "role": "assistant", "content": content })
            }
            StreamPart::AssistantControlData(control) => json!(control),
            StreamPart::DataMessage(message) => {
                let mut object = Map::new();
                if let Some(id) = &message.id {
                    object.insert("id".into(), Value::String(id.clone()));
                }
                object.insert("role".into(), Value::String("data".into()));
                object.insert("data".into(), message.data.clone());
                Value::Object(object)
            }
            StreamPart::ToolCalls(calls) => json!({ "tool_calls": calls }),
        }
    }

    /// Formats the part as one wire line, newline included.
    pub fn encode(&self) -> Result<String, EncodeError> {
        format_line(self.kind(), &self.payload())
    }

    /// Validates a JSON payload against the shape required for `kind`.
    pub fn from_payload(kind: PartKind, value: Value) -> Result<Self, DecodeError> {
        match kind {
            PartKind::Text => expect_string(kind, value).map(StreamPart::Text),
            PartKind::Error => expect_string(kind, value).map(StreamPart::Error),
            PartKind::Data => expect_array(kind, value).map(StreamPart::Data),
            PartKind::MessageAnnotations => {
                expect_array(kind, value).map(StreamPart::MessageAnnotations)
            }
            PartKind::FunctionCall => {
                let call = value
                    .get("function_call")
                    .ok_or_else(|| DecodeError::malformed(kind, "missing `function_call` object"))?;
                Ok(StreamPart::FunctionCall(parse_function(kind, call)?))
            }
            PartKind::ToolCalls => {
                let calls = value
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .ok_or_else(|| DecodeError::malformed(kind, "missing `tool_calls` array"))?;
                let mut parsed = Vec::with_capacity(calls.len());
                for call in calls {
                    let id = string_field(kind, call, "id")?;
                    let call_kind = string_field(kind, call, "type")?;
                    let function = call
                        .get("function")
                        .ok_or_else(|| DecodeError::malformed(kind, "tool call without `function`"))?;
                    parsed.push(ToolCall {
                        id,
                        kind: call_kind,
                        function: parse_function(kind, function)?,
                    });
                }
                Ok(StreamPart::ToolCalls(parsed))
            }
            PartKind::AssistantMessage => {
                let id = string_field(kind, &value, "id")?;
                if value.get("role").and_then(Value::as_str) != Some("assistant") {
                    return Err(DecodeError::malformed(kind, "`role` must be \"assistant\""));
                }
                let entries = value
                    .get("content")
                    .and_then(Value::as_array)
                    .ok_or_else(|| DecodeError::malformed(kind, "missing `content` array"))?;
                let mut content = Vec::with_capacity(entries.len());
                for entry in entries {
                    if entry.get("type").and_then(Value::as_str) != Some("text") {
                        return Err(DecodeError::malformed(kind, "content entry must be text"));
                    }
                    let text = entry
                        .get("text")
                        .and_then(|text| text.get("value"))
                        .and_then(Value::as_str)
                        .ok_or_else(|| DecodeError::malformed(kind, "missing `text.value`"))?;
                    content.push(text.to_owned());
                }
                Ok(StreamPart::AssistantMessage(AssistantMessage { id, content }))
            }
            PartKind::AssistantControlData => Ok(StreamPart::AssistantControlData(
                AssistantControlData {
                    thread_id: string_field(kind, &value, "threadId")?,
                    message_id: string_field(kind, &value, "messageId")?,
                },
            )),
            PartKind::DataMessage => {
                if value.get("role").and_then(Value::as_str) != Some("data") {
                    return Err(DecodeError::malformed(kind, "`role` must be \"data\""));
                }
                let data = value
                    .get("data")
                    .cloned()
                    .ok_or_else(|| DecodeError::malformed(kind, "missing `data` field"))?;
                let id = value.get("id").and_then(Value::as_str).map(ToOwned::to_owned);
                Ok(StreamPart::DataMessage(DataMessage { id, data }))
            }
        }
    }
}

/// Formats `value` as a part of the kind named `name`.
///
/// The payload is not shape-checked; only the kind name is.
pub fn encode(name: &str, value: &Value) -> Result<String, EncodeError> {
    let kind = PartKind::from_name(name).ok_or_else(|| EncodeError::InvalidKind {
        name: name.to_owned(),
    })?;
    format_line(kind, value)
}

/// Parses one wire line (with or without its trailing newline).
pub fn decode(line: &str) -> Result<StreamPart, DecodeError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let (code, payload) = line
        .split_once(':')
        .ok_or_else(|| DecodeError::MissingSeparator {
            line: line.to_owned(),
        })?;
    let kind = PartKind::from_code(code).ok_or_else(|| DecodeError::InvalidCode {
        code: code.to_owned(),
    })?;
    let value: Value = serde_json::from_str(payload).map_err(|e| DecodeError::InvalidJson {
        kind,
        message: e.to_string(),
    })?;
    StreamPart::from_payload(kind, value)
}

fn format_line(kind: PartKind, value: &Value) -> Result<String, EncodeError> {
    let json = serde_json::to_string(value).map_err(|e| EncodeError::Json {
        kind,
        message: e.to_string(),
    })?;
    Ok(format!("{}:{json}\n", kind.code()))
}

fn expect_string(kind: PartKind, value: Value) -> Result<String, DecodeError> {
    match value {
        Value::String(text) => Ok(text),
        _ => Err(DecodeError::malformed(kind, "value must be a string")),
    }
}

fn expect_array(kind: PartKind, value: Value) -> Result<Vec<Value>, DecodeError> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(DecodeError::malformed(kind, "value must be an array")),
    }
}

fn string_field(kind: PartKind, value: &Value, field: &str) -> Result<String, DecodeError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| DecodeError::malformed(kind, format!("`{field}` must be a string")))
}

fn parse_function(kind: PartKind, value: &Value) -> Result<FunctionCall, DecodeError> {
    Ok(FunctionCall {
        name: string_field(kind, value, "name")?,
        arguments: string_field(kind, value, "arguments")?,
    })
}
