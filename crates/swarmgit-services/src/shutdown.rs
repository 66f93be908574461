//! Operation-scoped cancellation.
//!
//! One `Shutdown` is threaded through every task an operation spawns: peer
//! discovery, pool replenishment, batch transfers, replication streams. Any
//! holder may trigger it; every holder observes it. Children observe their
//! parent but can be triggered on their own without touching the parent.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Cancel every task holding this handle or a child of it.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the handle is triggered. Returns immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any handle, including this one.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// A handle that fires when `self` fires, or when triggered directly.
    ///
    /// Must be called inside a tokio runtime. The forwarding task exits as
    /// soon as either side fires or every child handle is dropped.
    pub fn child(&self) -> Shutdown {
        let child = Shutdown::new();
        if self.is_triggered() {
            child.trigger();
            return child;
        }

        let parent = self.clone();
        let weak = Arc::downgrade(&child.tx);
        let mut child_rx = child.rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {
                    if let Some(tx) = weak.upgrade() {
                        tx.send_replace(true);
                    }
                }
                // Err here means every child handle is gone.
                _ = child_rx.wait_for(|triggered| *triggered) => {}
            }
        });
        child
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_every_clone() {
        let shutdown = Shutdown::new();
        let waiter = {
            let s = shutdown.clone();
            tokio::spawn(async move { s.cancelled().await })
        };
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn parent_trigger_reaches_child() {
        let parent = Shutdown::new();
        let child = parent.child();
        parent.trigger();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child should observe parent");
    }

    #[tokio::test]
    async fn child_trigger_leaves_parent_alone() {
        let parent = Shutdown::new();
        let child = parent.child();
        child.trigger();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(child.is_triggered());
        assert!(!parent.is_triggered());
    }

    #[tokio::test]
    async fn child_of_triggered_parent_starts_triggered() {
        let parent = Shutdown::new();
        parent.trigger();
        assert!(parent.child().is_triggered());
    }
}
