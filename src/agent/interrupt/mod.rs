//! Global interruption signal, modeled as an explicit token threaded through
//! every suspending call (model request, process wait, user-input wait)
//! rather than an ad hoc shared boolean.

use tokio::sync::watch;

/// Clonable cancellation token backed by a watch channel. `trigger()` flips
/// all clones to interrupted; `clear()` re-arms them once the stack has
/// unwound so the root can resume taking input.
#[derive(Debug, Clone)]
pub struct InterruptFlag {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn clear(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the flag is (or becomes) triggered. Intended for
    /// `tokio::select!` against suspending operations.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped without triggering: never resolves as interrupted
        std::future::pending::<()>().await;
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}
