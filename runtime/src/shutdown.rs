//! Cooperative shutdown and cancellation signals.
//!
//! A [`ShutdownTrigger`] / [`ShutdownSignal`] pair wraps a `watch::channel(bool)`.
//! Background loops select on [`ShutdownSignal::recv`] next to their real work, so
//! a trigger interrupts sleeps and polls instead of waiting for them to finish.
//!
//! Dropping every trigger counts as a shutdown: a task whose owner is gone has
//! nobody left to report to.

use std::time::Duration;
use tokio::sync::watch;

/// Create a connected trigger/signal pair.
#[must_use]
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Sending half: fires the shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Signal every subscribed [`ShutdownSignal`].
    ///
    /// Idempotent; triggering twice is the same as triggering once.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the shutdown has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Create another signal observing this trigger.
    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half: observed by background loops.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Wait until shutdown is requested (or every trigger is dropped).
    pub async fn recv(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Sleep for `duration` unless `signal` fires first.
///
/// Returns `true` when the full duration elapsed, `false` when interrupted.
pub async fn sleep_or_shutdown(duration: Duration, signal: &mut ShutdownSignal) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = signal.recv() => false,
    }
}
