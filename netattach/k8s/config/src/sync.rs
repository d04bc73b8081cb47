//! Tracks whether a watch's initial listing has been delivered.

use tokio::sync::watch;

/// Held by a broker; the synced state only ever moves from false to true.
#[derive(Debug)]
pub(crate) struct SyncBarrier(watch::Sender<bool>);

/// Observes a broker's synced state.
#[derive(Clone, Debug)]
pub struct Synced(watch::Receiver<bool>);

// === impl SyncBarrier ===

impl SyncBarrier {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(tx)
    }

    pub(crate) fn subscribe(&self) -> Synced {
        Synced(self.0.subscribe())
    }

    pub(crate) fn is_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// Marks the barrier as synced, returning true only the first time it is called.
    pub(crate) fn release(&self) -> bool {
        !self.0.send_replace(true)
    }
}

// === impl Synced ===

impl Synced {
    pub fn is_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits for the broker to sync.
    ///
    /// Returns false if the broker stopped before syncing.
    pub async fn wait(&mut self) -> bool {
        self.0.wait_for(|synced| *synced).await.is_ok()
    }
}
