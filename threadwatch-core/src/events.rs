//! Typed notifications for the presentation layer.

use tokio::sync::broadcast;

use crate::entity::{EntityId, OldEntitySnapshot};
use crate::notifs::NotifCounts;

const CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum RefreshEvent {
    Started { total: usize },
    Progress { completed: usize, total: usize },
    /// Name, version or status changed; carries the values before the change.
    Changed(OldEntitySnapshot),
    /// The thread answered 404/403. The user may remove it.
    RemoteNotFound { id: EntityId, name: String, status: u16 },
    ParseTimeout { id: EntityId },
    Notifications(NotifCounts),
    Finished { completed: usize, total: usize },
}

/// Broadcast fan-out of [`RefreshEvent`]s. Lagging receivers lose events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RefreshEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RefreshEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
