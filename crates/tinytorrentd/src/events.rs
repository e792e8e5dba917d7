//! Event Bus (C2) — spec section 4, data flow: "Config changes: Dispatcher ->
//! Configuration Service -> Event Bus -> Engine reacts."
//!
//! A typed `tokio::sync::broadcast` channel, grounded in the way
//! `librqbit::session_stats` and `watch.rs` hand channels between tasks
//! instead of sharing mutable state directly, and in `Dastari-librarian`'s
//! GraphQL-subscription event bus (a single typed broadcast feeding both
//! internal reactors and external subscribers).

use tokio::sync::broadcast;

use crate::snapshot::InfoHash;

#[derive(Debug, Clone)]
pub enum DaemonEvent {
    SettingsChanged,
    TorrentsDirty(Vec<InfoHash>),
    Shutdown,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn publish(&self, event: DaemonEvent) {
        // No subscribers is not an error: the bus is fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
