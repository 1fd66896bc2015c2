//! Cancellation hook for in-flight compilations
//!
//! A `CancelHandle` is held by whoever owns the inbound request; the matching
//! `CancelToken` travels down to the process runner, which kills the compiler
//! once cancellation is observed.

use std::sync::Arc;
use tokio::sync::watch;

/// Create a connected handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

/// Sending side of the cancellation hook
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Cancel when the returned guard is dropped
    pub fn on_drop(self) -> CancelOnDrop {
        CancelOnDrop {
            handle: Some(self),
        }
    }
}

/// Receiving side of the cancellation hook
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    ///
    /// If every handle is dropped without cancelling, this never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Fires its handle on drop unless disarmed
#[derive(Debug)]
pub struct CancelOnDrop {
    handle: Option<CancelHandle>,
}

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}
