use std::sync::Arc;

use tokio::sync::watch;

/// UI refresh signal: a generation counter bumped whenever the fleet
/// model (or a transition in flight) has something new to show.
///
/// Subscribers render on change; the counter value itself only matters
/// for detecting missed updates.
#[derive(Clone)]
pub struct RefreshSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl RefreshSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    /// Current generation, for tests and diagnostics.
    #[allow(dead_code)]
    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
}

impl Default for RefreshSignal {
    fn default() -> Self {
        Self::new()
    }
}
