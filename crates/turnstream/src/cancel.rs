use tokio::sync::watch;

/// Creates a connected abort handle and signal.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

/// Handle used to request cancellation of a running stream.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// Readers notice the request after the batch they are currently
    /// yielding; whatever was reconstructed so far is kept.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Returns a new signal observing this handle.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of an `AbortHandle`.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    ///
    /// Never resolves if every handle is dropped without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        let sender_gone = rx.wait_for(|aborted| *aborted).await.is_err();
        if sender_gone {
            std::future::pending::<()>().await;
        }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keeping the value readable does not require a live sender.
        drop(tx);
        Self { rx }
    }
}
