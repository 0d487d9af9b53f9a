use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::entity::{EntryStatus, QueueEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub id: Uuid,
    pub bar_id: String,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Payload {
    SongAdded {
        entry: QueueEntry,
    },
    SongRemoved {
        entry_id: Uuid,
    },
    SongStatusUpdated {
        entry_id: Uuid,
        from: EntryStatus,
        to: EntryStatus,
    },
    QueueReordered {
        entry_ids: Vec<Uuid>,
    },
    QueueCleared {
        count: u64,
    },
    PlayNextSong {
        next: Option<QueueEntry>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub header: Header,
    pub payload: Payload,
}

impl Event {
    pub fn new(bar_id: &str, payload: Payload, emitted_at: DateTime<Utc>) -> Self {
        Self {
            header: Header {
                id: Uuid::new_v4(),
                bar_id: bar_id.to_string(),
                emitted_at,
            },
            payload,
        }
    }

    /// Subject the event is fanned out on.
    pub fn subject(&self) -> String {
        format!("queue.events.{}", self.header.bar_id)
    }
}

/// Best-effort fan-out of committed queue changes.
///
/// Emitting never waits: slow subscribers lag and lose events, and nobody
/// listening is fine. Consumers reconcile by re-reading the queue.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    sender: broadcast::Sender<Event>,
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, bar_id: &str, payload: Payload, emitted_at: DateTime<Utc>) {
        let event = Event::new(bar_id, payload, emitted_at);
        if self.sender.send(event).is_err() {
            debug!(bar_id, "No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}
