use tokio::sync::watch;

/// One cancel token per run; propagated to every in-flight stage. The reason
/// is preserved ("stopped by signal SIGINT", "budget exhausted", ...).
#[derive(Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<Option<String>>,
}

pub struct CancelHandle {
    sender: watch::Sender<Option<String>>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (sender, receiver) = watch::channel(None);
    (CancelHandle { sender }, CancelToken { receiver })
}

impl CancelHandle {
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.sender.send(Some(reason.into()));
    }
}

impl CancelToken {
    /// A token that never fires, for callers without cancellation wiring.
    pub fn never() -> Self {
        let (_handle, token) = cancel_pair();
        std::mem::forget(_handle);
        token
    }

    pub fn is_canceled(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.receiver.borrow().clone()
    }

    /// Resolves with the cancel reason once cancellation is signalled.
    pub async fn cancelled(&self) -> String {
        let mut receiver = self.receiver.clone();
        loop {
            if let Some(reason) = receiver.borrow().clone() {
                return reason;
            }
            if receiver.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "current_thread")]
    async fn cancel_resolves_waiters_with_reason() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_canceled());

        let waiter = token.clone();
        let join = tokio::spawn(async move { waiter.cancelled().await });
        handle.cancel("stopped by signal SIGINT");

        let reason = join.await.expect("waiter should resolve");
        assert_eq!(reason, "stopped by signal SIGINT");
        assert!(token.is_canceled());
        assert_eq!(token.reason().as_deref(), Some("stopped by signal SIGINT"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn never_token_does_not_fire() {
        let token = CancelToken::never();
        let raced = tokio::time::timeout(Duration::from_secs(3600), token.cancelled()).await;
        assert!(raced.is_err());
    }
}
