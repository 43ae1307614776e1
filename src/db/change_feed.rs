//! The in-process stand-in for the excluded document database's change
//! stream: an ordered feed of insert/update/replace/delete events, each
//! carrying the full post-change document, delivered at-least-once to every
//! subscriber via a broadcast channel (grounded on `events::bus::EventBus`).

use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Applications,
    Functions,
    Tasks,
    ScheduledTasks,
    LogEntries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Replace,
    Delete,
}

/// One change-feed delivery. `updated_fields` is populated for `Update`
/// operations only (empty otherwise), matching the spec's "operation in
/// {update, replace}, with full-document lookup" contract.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub operation: Operation,
    pub id: String,
    pub document: Value,
    pub updated_fields: Vec<String>,
}

/// Broadcast fanout for change events. Capacity is generous because
/// function/env watchers across many runtimes all subscribe to the same
/// feed and must not lag behind bursts of task inserts.
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
    _receiver: broadcast::Receiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(4096);
        Self { sender, _receiver }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ChangeFeed {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}
