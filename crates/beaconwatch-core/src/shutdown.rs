//! Cooperative shutdown token.
//!
//! The binary holds the [`ShutdownTrigger`] and fires it from the signal
//! handler. Every loop that can block (scan cycles, reconnects, publish
//! retries) holds a [`Shutdown`] and checks it between iterations, so work in
//! flight finishes and the next iteration never starts.

use std::time::Duration;

use tokio::sync::watch;

/// Sending half: requests shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half: observed by long-running loops.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/token pair.
#[must_use]
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Another token observing this trigger.
    #[must_use]
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    /// A token that is never triggered.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. Pends forever if the trigger was
    /// dropped without firing.
    pub async fn requested(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the full delay elapsed, `false` if interrupted.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_requested() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.requested() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_is_observed_by_all_tokens() {
        let (trigger, token) = channel();
        let other = trigger.subscribe();
        assert!(!token.is_requested());

        trigger.trigger();
        assert!(token.is_requested());
        assert!(other.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cut_short() {
        let (trigger, mut token) = channel();
        let waiter = tokio::spawn(async move { token.sleep(Duration::from_secs(3600)).await });

        tokio::task::yield_now().await;
        trigger.trigger();

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_shutdown() {
        let mut token = Shutdown::never();
        assert!(token.sleep(Duration::from_secs(5)).await);
        assert!(!token.is_requested());
    }
}
