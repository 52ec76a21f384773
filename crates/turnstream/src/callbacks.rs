use std::sync::Arc;

use futures::StreamExt as _;
use futures::stream;

use crate::pipeline::DeltaStream;

/// Lifecycle hooks around a streamed completion. Every hook is optional.
#[async_trait::async_trait]
pub trait StreamCallbacks: Send + Sync {
    /// Called once, when the first delta arrives.
    async fn on_start(&self) {}

    /// Called for every delta after it has been forwarded.
    async fn on_token(&self, _token: &str) {}

    /// Called when the upstream completes, with the aggregated text.
    async fn on_completion(&self, _completion: &str) {}

    /// Called once per turn after everything, including continuations, is done.
    async fn on_final(&self, _completion: &str) {}
}

/// Wraps `upstream` so the hooks fire as deltas pass through.
///
/// `fire_final` is false when a downstream stage owns the final hook.
pub fn instrument(
    upstream: DeltaStream,
    callbacks: Arc<dyn StreamCallbacks>,
    fire_final: bool,
) -> DeltaStream {
    struct State {
        upstream: DeltaStream,
        callbacks: Arc<dyn StreamCallbacks>,
        aggregate: String,
        started: bool,
        fire_final: bool,
        done: bool,
    }

    Box::pin(stream::unfold(
        State {
            upstream,
            callbacks,
            aggregate: String::new(),
            started: false,
            fire_final,
            done: false,
        },
        |mut state| async move {
            if state.done {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(token)) => {
                    if !state.started {
                        state.started = true;
                        state.callbacks.on_start().await;
                    }
                    state.aggregate.push_str(&token);
                    state.callbacks.on_token(&token).await;
                    Some((Ok(token), state))
                }
                Some(Err(err)) => {
                    state.done = true;
                    Some((Err(err), state))
                }
                None => {
                    state.done = true;
                    state.callbacks.on_completion(&state.aggregate).await;
                    if state.fire_final {
                        state.callbacks.on_final(&state.aggregate).await;
                    }
                    None
                }
            }
        },
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::TryStreamExt as _;
    use std::sync::Mutex;

    /// Records every hook invocation in order.
    #[derive(Default)]
    pub(crate) struct RecordingCallbacks {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingCallbacks {
        pub(crate) fn events(&self) -> Vec<String> {
            self.events.lock().expect("events").clone()
        }

        fn push(&self, event: String) {
            self.events.lock().expect("events").push(event);
        }
    }

    #[async_trait::async_trait]
    impl StreamCallbacks for RecordingCallbacks {
        async fn on_start(&self) {
            self.push("start".into());
        }

        async fn on_token(&self, token: &str) {
            self.push(format!("token:{token}"));
        }

        async fn on_completion(&self, completion: &str) {
            self.push(format!("completion:{completion}"));
        }

        async fn on_final(&self, completion: &str) {
            self.push(format!("final:{completion}"));
        }
    }

    fn deltas(items: Vec<Result<String, crate::StreamError>>) -> DeltaStream {
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn hooks_fire_in_order_with_aggregate() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let out: Vec<String> = instrument(
            deltas(vec![Ok("a".into()), Ok("b".into())]),
            callbacks.clone(),
            true,
        )
        .try_collect()
        .await
        .expect("stream");

        assert_eq!(out, vec!["a", "b"]);
        assert_eq!(
            callbacks.events(),
            vec!["start", "token:a", "token:b", "completion:ab", "final:ab"]
        );
    }

    #[tokio::test]
    async fn final_hook_is_suppressed_when_claimed_downstream() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let _: Vec<String> = instrument(deltas(vec![Ok("x".into())]), callbacks.clone(), false)
            .try_collect()
            .await
            .expect("stream");
        assert_eq!(callbacks.events(), vec!["start", "token:x", "completion:x"]);
    }

    #[tokio::test]
    async fn upstream_error_ends_stage_without_completion() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let result: Result<Vec<String>, _> = instrument(
            deltas(vec![
                Ok("x".into()),
                Err(crate::StreamError::upstream("socket closed")),
            ]),
            callbacks.clone(),
            true,
        )
        .try_collect()
        .await;
        assert!(result.is_err());
        assert_eq!(callbacks.events(), vec!["start", "token:x"]);
    }
}
