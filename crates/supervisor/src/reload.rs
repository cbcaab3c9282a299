//! Unidirectional reload event bus (spec §9: "Cyclic reload notifications
//! (parent↔mount) → unidirectional event bus with weak back references:
//! mounts emit to the supervisor, supervisor fans out to observers; parents
//! never hold strong references into mount internals").
//!
//! A `ReloadBus` handle only lets its holder emit or subscribe; it never
//! exposes the supervisor's internal state, so handing one to a mount (or to
//! an external live-reload client) cannot create a reference cycle.

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadEvent {
    /// Monotonic commit counter; lets subscribers detect they missed events
    /// if the broadcast channel lagged.
    pub generation: u64,
}

#[derive(Clone)]
pub struct ReloadBus {
    tx: broadcast::Sender<ReloadEvent>,
}

impl ReloadBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.tx.subscribe()
    }

    /// Emit is a no-op (beyond the generation counter having advanced) when
    /// there are no subscribers; the sender never blocks on slow observers.
    pub fn emit(&self, generation: u64) {
        let _ = self.tx.send(ReloadEvent { generation });
    }
}

impl Default for ReloadBus {
    fn default() -> Self {
        Self::new()
    }
}
