use std::sync::Arc;

use futures::stream;
use serde_json::json;
use turnstream::prelude::*;
use turnstream::{
    CallContext, CallResponse, ContinuationSource, FunctionCallHandler, ParsedFunctionCall,
};

struct WeatherTool;

#[async_trait::async_trait]
impl FunctionCallHandler for WeatherTool {
    async fn on_function_call(
        &self,
        call: ParsedFunctionCall,
        ctx: &CallContext,
    ) -> Result<Option<CallResponse>, turnstream::CallbackError> {
        let city = call.arguments["city"].as_str().unwrap_or("unknown");
        let result = json!({"city": city, "forecast": "sunny", "high_c": 24});
        Ok(Some(CallResponse::Continue(ctx.function_call_messages(&result))))
    }
}

/// Stands in for a model: answers with prose once a function result is present.
struct CannedModel;

#[async_trait::async_trait]
impl ContinuationSource for CannedModel {
    async fn continue_with(&self, messages: Vec<ChatMessage>) -> Result<DeltaStream, StreamError> {
        let result = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Function)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let deltas = vec![
            Ok("It will be ".to_string()),
            Ok(format!("nice out: {result}")),
        ];
        Ok(Box::pin(stream::iter(deltas)))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    turnstream::init_observability();

    let first_generation: DeltaStream = Box::pin(stream::iter(vec![
        Ok("{\"function_call\": {\"name\": \"get_weather\", ".to_string()),
        Ok("\"arguments\": \"{\\\"city\\\":\\\"Lisbon\\\"}\"}}".to_string()),
    ]));

    let data = StreamData::new();
    let body = StreamPipeline::new()
        .stream_data(data.clone())
        .on_function_call(Arc::new(WeatherTool))
        .continuation_source(Arc::new(CannedModel))
        .into_bytes(first_generation);

    data.append(json!({"retrieved": ["weather-kb"]}))?;
    data.append_message_annotation(json!({"model": "canned"}))?;
    data.close()?;

    let turn = reconstruct(read_parts(body, || false), |snapshot| {
        println!("update: {} message(s)", snapshot.messages.len());
    })
    .await?;

    if let Some(message) = turn.text() {
        println!("assistant: {}", message.content);
    }
    println!("data: {}", json!(turn.data));
    Ok(())
}
