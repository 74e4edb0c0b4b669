//! Explicit cancellation signal.
//!
//! A `CancelToken` is cloned into every concurrent branch of a task. It is
//! carried explicitly, never through ambient state, and cancelling is
//! idempotent.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared cancellation signal for one task.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<String>>,
    tx: Arc<watch::Sender<Option<String>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            rx,
            tx: Arc::new(tx),
        }
    }

    /// Trip the signal with a diagnostic reason. Later calls are no-ops;
    /// the first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                false
            } else {
                *state = Some(reason.into());
                true
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The reason given at cancellation, if cancelled.
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve when the signal trips. Returns immediately if already
    /// cancelled.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; treat as never-cancel
                // and park forever so `select!` arms fall through.
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
