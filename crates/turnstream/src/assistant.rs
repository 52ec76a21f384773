use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::FutureExt as _;
use futures::stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{CallbackError, StreamError};
use crate::part::{AssistantControlData, AssistantMessage, DataMessage, StreamPart};
use crate::pipeline::ByteStream;

const ASSISTANT_BUFFER_CAPACITY: usize = 32;

#[derive(Debug)]
enum Frame {
    Line(Bytes),
    Close,
}

type SenderSlot = Arc<Mutex<Option<mpsc::Sender<Frame>>>>;

/// Sends assistant protocol parts from inside an `assistant_response` callback.
///
/// Once the callback has returned the response is closed, and every clone of
/// the writer fails with `StreamError::Disconnected`.
#[derive(Clone, Debug)]
pub struct AssistantWriter {
    slot: SenderSlot,
}

impl AssistantWriter {
    /// Sends a complete assistant message.
    pub async fn send_message(&self, message: AssistantMessage) -> Result<(), StreamError> {
        self.send(StreamPart::AssistantMessage(message)).await
    }

    /// Sends a `role: data` message.
    pub async fn send_data_message(&self, message: DataMessage) -> Result<(), StreamError> {
        self.send(StreamPart::DataMessage(message)).await
    }

    async fn send(&self, part: StreamPart) -> Result<(), StreamError> {
        let line = part.encode()?;
        let tx = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StreamError::Disconnected)?;
        tx.send(Frame::Line(Bytes::from(line)))
            .await
            .map_err(|_| StreamError::Disconnected)
    }
}

/// Builds an assistant response body.
///
/// The control part is sent first, then `process` runs with a writer for
/// further parts. An error (or panic) in `process` becomes exactly one
/// `error` part. The body ends as soon as `process` has returned, even if
/// clones of the writer are still alive elsewhere.
pub fn assistant_response<F, Fut>(control: AssistantControlData, process: F) -> ByteStream
where
    F: FnOnce(AssistantWriter) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(ASSISTANT_BUFFER_CAPACITY);
    tokio::spawn(run_process(control, tx, process));

    Box::pin(stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Some(Frame::Line(bytes)) => Some((Ok(bytes), rx)),
            Some(Frame::Close) | None => None,
        }
    }))
}

async fn run_process<F, Fut>(control: AssistantControlData, tx: mpsc::Sender<Frame>, process: F)
where
    F: FnOnce(AssistantWriter) -> Fut,
    Fut: Future<Output = Result<(), CallbackError>>,
{
    let thread_id = control.thread_id.clone();
    let control_line = match StreamPart::AssistantControlData(control).encode() {
        Ok(line) => line,
        Err(err) => {
            warn!(error = %err, "failed to encode assistant control data");
            return;
        }
    };
    if tx.send(Frame::Line(Bytes::from(control_line))).await.is_err() {
        debug!(thread_id = %thread_id, "assistant response receiver dropped before control data");
        return;
    }

    let slot: SenderSlot = Arc::new(Mutex::new(Some(tx.clone())));
    let writer = AssistantWriter { slot: slot.clone() };
    let message = match AssertUnwindSafe(process(writer)).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };
    // No new writes may start once the callback is done.
    slot.lock().unwrap_or_else(PoisonError::into_inner).take();

    if let Some(message) = message {
        warn!(thread_id = %thread_id, error = %message, "assistant process failed");
        if let Ok(line) = StreamPart::Error(message).encode() {
            let _ = tx.send(Frame::Line(Bytes::from(line))).await;
        }
    }
    let _ = tx.send(Frame::Close).await;
    debug!(thread_id = %thread_id, "assistant response closed");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "assistant process panicked".to_owned()
    }
}
