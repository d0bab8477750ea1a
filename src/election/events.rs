use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 128;

/// Published whenever a local state machine changes role or learns of a new leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderChangeEvent {
    pub key: String,
    pub is_leader: bool,
    pub leader_host: String,
}

pub trait LeadershipEventSink: Send + Sync {
    fn publish(&self, event: LeaderChangeEvent);
}

#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<LeaderChangeEvent>,
}

impl BroadcastEventSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaderChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LeadershipEventSink for BroadcastEventSink {
    fn publish(&self, event: LeaderChangeEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}
