use std::collections::VecDeque;

use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::data::StreamData;
use crate::errors::StreamError;
use crate::part::StreamPart;
use crate::pipeline::{ByteStream, Chunk, ChunkStream};

/// Interleaves side-channel batches ahead of each chunk and frames the
/// output as protocol lines.
///
/// Without `data` the chunks pass through as raw text.
pub fn multiplex(chunks: ChunkStream, data: Option<StreamData>) -> ByteStream {
    let Some(data) = data else {
        return Box::pin(chunks.map(|item| item.and_then(raw_bytes)));
    };

    struct State {
        chunks: ChunkStream,
        data: StreamData,
        pending: VecDeque<Bytes>,
        done: bool,
    }

    Box::pin(stream::try_unfold(
        State {
            chunks,
            data,
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(bytes) = state.pending.pop_front() {
                    return Ok(Some((bytes, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.chunks.next().await {
                    Some(Ok(chunk)) => {
                        flush_side_channel(&state.data, &mut state.pending)?;
                        let part = match chunk {
                            Chunk::Text(text) => StreamPart::Text(text),
                            Chunk::Part(part) => part,
                        };
                        state.pending.push_back(Bytes::from(part.encode()?));
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        debug!("upstream finished; waiting for stream data to close");
                        state.data.closed().await;
                        flush_side_channel(&state.data, &mut state.pending)?;
                        state.done = true;
                    }
                }
            }
        },
    ))
}

fn flush_side_channel(data: &StreamData, out: &mut VecDeque<Bytes>) -> Result<(), StreamError> {
    let batch = data.take_pending();
    if !batch.data.is_empty() {
        debug!(items = batch.data.len(), "flushing data batch");
        out.push_back(Bytes::from(StreamPart::Data(batch.data).encode()?));
    }
    if !batch.annotations.is_empty() {
        debug!(items = batch.annotations.len(), "flushing annotation batch");
        out.push_back(Bytes::from(
            StreamPart::MessageAnnotations(batch.annotations).encode()?,
        ));
    }
    Ok(())
}

fn raw_bytes(chunk: Chunk) -> Result<Bytes, StreamError> {
    match chunk {
        Chunk::Text(text) => Ok(Bytes::from(text)),
        Chunk::Part(part) => {
            let payload = serde_json::to_string(&part.payload()).map_err(|e| {
                crate::errors::EncodeError::Json {
                    kind: part.kind(),
                    message: e.to_string(),
                }
            })?;
            Ok(Bytes::from(payload))
        }
    }
}
