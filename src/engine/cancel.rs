//! One-shot stop requests.
//!
//! A [`CancelHandle`] is held by whoever may ask an execution to stop (the
//! CLI's Ctrl-C handler, an operator console). The engine holds the matching
//! [`CancelSignal`] and polls it. Requests are idempotent and never fail, even
//! after the engine has gone away.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Creates a connected handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Sending side of a stop request.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Requests a stop. Repeated requests and requests nobody observes are no-ops.
    pub fn request(&self) {
        let previous = self.tx.send_replace(true);
        if !previous {
            debug!(observers = self.tx.receiver_count(), "Stop requested");
        }
    }
}

/// Observing side of a stop request.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that is never raised.
    pub fn never() -> Self {
        cancel_pair().1
    }

    /// Whether a stop has been requested.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_observed_by_every_clone() {
        let (handle, signal) = cancel_pair();
        let other = signal.clone();
        assert!(!signal.is_requested());

        handle.request();
        handle.request();
        assert!(signal.is_requested());
        assert!(other.is_requested());
    }

    #[test]
    fn test_request_without_observers_is_a_no_op() {
        let (handle, signal) = cancel_pair();
        drop(signal);
        handle.request();
    }

    #[test]
    fn test_never_signal() {
        assert!(!CancelSignal::never().is_requested());
    }
}
