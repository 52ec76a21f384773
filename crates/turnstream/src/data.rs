use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::errors::MisuseError;

/// Side channel for attaching JSON data and message annotations to a
/// multiplexed response.
///
/// Handles are cheap to clone; every clone feeds the same stream. The body
/// produced by the multiplexer does not end until `close` has been called.
#[derive(Clone)]
pub struct StreamData {
    inner: Arc<Inner>,
}

struct Inner {
    queues: Mutex<Queues>,
    closed_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Queues {
    closed: bool,
    data: Vec<Value>,
    annotations: Vec<Value>,
}

/// Items appended since the previous flush.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct PendingBatch {
    pub data: Vec<Value>,
    pub annotations: Vec<Value>,
}

impl StreamData {
    pub fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(Queues::default()),
                closed_tx,
            }),
        }
    }

    /// Queues a value for the next `data` part.
    pub fn append(&self, value: impl Into<Value>) -> Result<(), MisuseError> {
        let mut queues = self.lock();
        if queues.closed {
            return Err(MisuseError::AppendAfterClose);
        }
        queues.data.push(value.into());
        Ok(())
    }

    /// Queues a value for the next `message_annotations` part.
    pub fn append_message_annotation(&self, value: impl Into<Value>) -> Result<(), MisuseError> {
        let mut queues = self.lock();
        if queues.closed {
            return Err(MisuseError::AnnotationAfterClose);
        }
        queues.annotations.push(value.into());
        Ok(())
    }

    /// Marks the channel finished and releases the stream's final flush.
    pub fn close(&self) -> Result<(), MisuseError> {
        {
            let mut queues = self.lock();
            if queues.closed {
                return Err(MisuseError::DoubleClose);
            }
            queues.closed = true;
        }
        self.inner.closed_tx.send_replace(true);
        debug!("stream data closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        // The sender lives in `inner`, which outlives this borrow.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn take_pending(&self) -> PendingBatch {
        let mut queues = self.lock();
        PendingBatch {
            data: std::mem::take(&mut queues.data),
            annotations: std::mem::take(&mut queues.annotations),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StreamData {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues = self.lock();
        f.debug_struct("StreamData")
            .field("closed", &queues.closed)
            .field("pending_data", &queues.data.len())
            .field("pending_annotations", &queues.annotations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn close_twice_is_misuse() {
        let data = StreamData::new();
        data.close().expect("first close");
        assert_eq!(data.close(), Err(MisuseError::DoubleClose));
    }

    #[test]
    fn append_after_close_is_misuse() {
        let data = StreamData::new();
        data.close().expect("close");
        assert_eq!(data.append(json!(1)), Err(MisuseError::AppendAfterClose));
        assert_eq!(
            data.append_message_annotation(json!("a")),
            Err(MisuseError::AnnotationAfterClose)
        );
    }

    #[test]
    fn pending_batches_keep_append_order_and_clear() {
        let data = StreamData::new();
        data.append(json!({"step": 1})).expect("append");
        data.append(json!({"step": 2})).expect("append");
        data.append_message_annotation(json!("note")).expect("annotate");

        let batch = data.take_pending();
        assert_eq!(batch.data, vec![json!({"step": 1}), json!({"step": 2})]);
        assert_eq!(batch.annotations, vec![json!("note")]);
        assert_eq!(data.take_pending(), PendingBatch::default());
    }

    #[tokio::test]
    async fn closed_waits_for_close_from_another_task() {
        let data = StreamData::new();
        let waiter = tokio::spawn({
            let data = data.clone();
            async move { data.closed().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        data.close().expect("close");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed resolves")
            .expect("join");
    }

    #[tokio::test]
    async fn closed_resolves_immediately_when_already_closed() {
        let data = StreamData::new();
        data.close().expect("close");
        tokio::time::timeout(Duration::from_millis(100), data.closed())
            .await
            .expect("already closed");
    }
}
