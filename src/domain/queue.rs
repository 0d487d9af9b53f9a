use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    entity::{EntryStatus, QueueEntry, Transition},
    error::{QueueError, Result},
};

/// Which entries `clear` deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearFilter {
    /// Everything except the entry currently playing.
    #[default]
    NonPlaying,
    All,
    Pending,
    Playing,
    Played,
    Skipped,
    Rejected,
}

impl ClearFilter {
    pub fn matches(&self, status: EntryStatus) -> bool {
        match self {
            ClearFilter::NonPlaying => status != EntryStatus::Playing,
            ClearFilter::All => true,
            ClearFilter::Pending => status == EntryStatus::Pending,
            ClearFilter::Playing => status == EntryStatus::Playing,
            ClearFilter::Played => status == EntryStatus::Played,
            ClearFilter::Skipped => status == EntryStatus::Skipped,
            ClearFilter::Rejected => status == EntryStatus::Rejected,
        }
    }

    pub fn terminal_statuses(&self) -> Vec<EntryStatus> {
        EntryStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal() && self.matches(*s))
            .collect()
    }
}

/// Partial update of a single entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryPatch {
    #[serde(default)]
    pub status: Option<EntryStatus>,
    #[serde(default)]
    pub position: Option<i32>,
    #[serde(default)]
    pub played_at: Option<DateTime<Utc>>,
}

/// Rows a store must write to commit a [`BarQueue`] mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    pub inserted: Vec<QueueEntry>,
    /// Entries leaving the queue come first so a new `playing` row never
    /// coexists with the old one.
    pub updated: Vec<QueueEntry>,
    pub deleted: Vec<Uuid>,
    /// Terminal statuses whose retained rows are deleted for this bar.
    pub purge: Vec<EntryStatus>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.purge.is_empty()
    }
}

/// The locked, active part of one bar's queue.
///
/// A store loads the bar's pending and playing entries under its lock, hands
/// them to the engine as a `BarQueue`, and persists [`BarQueue::into_changes`]
/// in the same transaction. All ordering and state-machine rules live here.
#[derive(Debug, Clone)]
pub struct BarQueue {
    bar_id: String,
    entries: Vec<QueueEntry>,
    original: HashMap<Uuid, QueueEntry>,
    last_request_at: Option<DateTime<Utc>>,
    retired: Vec<QueueEntry>,
    deleted: Vec<Uuid>,
    purge: Vec<EntryStatus>,
}

impl BarQueue {
    pub fn new(
        bar_id: impl Into<String>,
        mut entries: Vec<QueueEntry>,
        last_request_at: Option<DateTime<Utc>>,
    ) -> Self {
        entries.retain(|e| e.is_active());
        entries.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then(a.requested_at.cmp(&b.requested_at))
        });
        let original = entries.iter().map(|e| (e.id, e.clone())).collect();

        Self {
            bar_id: bar_id.into(),
            entries,
            original,
            last_request_at,
            retired: Vec::new(),
            deleted: Vec::new(),
            purge: Vec::new(),
        }
    }

    pub fn bar_id(&self) -> &str {
        &self.bar_id
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn playing(&self) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.is_playing())
    }

    pub fn user_active(&self, user_id: &str) -> usize {
        self.entries.iter().filter(|e| e.user_id == user_id).count()
    }

    /// Most recent request of the user this snapshot was loaded for.
    pub fn last_request_at(&self) -> Option<DateTime<Utc>> {
        self.last_request_at
    }

    /// Inserts a new pending entry and returns it with its assigned position.
    ///
    /// Normal requests go to the tail. Priority requests go right after the
    /// playing slot, behind priority requests already waiting there.
    pub fn enqueue(&mut self, mut entry: QueueEntry) -> QueueEntry {
        entry.status = EntryStatus::Pending;

        let index = if entry.priority_play {
            let mut index = self
                .entries
                .iter()
                .position(|e| e.is_playing())
                .map_or(0, |i| i + 1);
            while index < self.entries.len()
                && self.entries[index].is_pending()
                && self.entries[index].priority_play
            {
                index += 1;
            }
            index
        } else {
            self.entries.len()
        };

        self.last_request_at = Some(entry.requested_at);
        self.entries.insert(index, entry);
        self.renumber();
        self.entries[index].clone()
    }

    pub fn remove(&mut self, id: Uuid) -> Result<QueueEntry> {
        let index = self.index_of(id)?;
        let entry = self.entries.remove(index);
        self.deleted.push(id);
        self.renumber();
        Ok(entry)
    }

    /// Deletes a retained terminal entry. It holds no slot, so nothing moves.
    pub fn forget(&mut self, id: Uuid) {
        self.deleted.push(id);
    }

    pub fn reorder(&mut self, ordered: &[Uuid]) -> Result<()> {
        let current: HashSet<Uuid> = self.entries.iter().map(|e| e.id).collect();
        let requested: HashSet<Uuid> = ordered.iter().copied().collect();

        if requested.len() != ordered.len() {
            return Err(QueueError::Validation(
                "ordered ids contain duplicates".to_string(),
            ));
        }
        if requested != current {
            return Err(QueueError::Conflict(
                "ordered ids do not match the active queue".to_string(),
            ));
        }

        let mut by_id: HashMap<Uuid, QueueEntry> =
            self.entries.drain(..).map(|e| (e.id, e)).collect();
        self.entries = ordered.iter().filter_map(|id| by_id.remove(id)).collect();
        self.renumber();
        Ok(())
    }

    /// Finishes the playing entry as `finished` and starts the first pending one.
    pub fn advance(&mut self, finished: EntryStatus, now: DateTime<Utc>) -> Transition {
        let previous = self
            .entries
            .iter()
            .position(|e| e.is_playing())
            .map(|index| {
                let mut entry = self.entries.remove(index);
                entry.status = finished;
                entry.played_at = Some(now);
                self.retired.push(entry.clone());
                entry
            });

        let current = self.entries.iter_mut().find(|e| e.is_pending()).map(|e| {
            e.status = EntryStatus::Playing;
            e.id
        });

        self.renumber();

        Transition {
            previous,
            current: current.and_then(|id| self.get(id).cloned()),
        }
    }

    pub fn update(
        &mut self,
        id: Uuid,
        patch: &EntryPatch,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        let index = self.index_of(id)?;
        let from = self.entries[index].status;
        let to = patch.status.unwrap_or(from);

        if to != from {
            if !from.can_transition_to(to) {
                return Err(QueueError::Conflict(format!(
                    "cannot move entry from {} to {}",
                    from, to
                )));
            }
            if to == EntryStatus::Playing && self.playing().is_some() {
                return Err(QueueError::Conflict(
                    "another song is already playing".to_string(),
                ));
            }
        }

        if let Some(position) = patch.position {
            if to.is_terminal() {
                return Err(QueueError::Validation(
                    "cannot reposition an entry that leaves the queue".to_string(),
                ));
            }
            if position < 1 || position as usize > self.entries.len() {
                return Err(QueueError::Validation(format!(
                    "position must be between 1 and {}",
                    self.entries.len()
                )));
            }
        }

        let mut entry = self.entries.remove(index);
        entry.status = to;
        if let Some(played_at) = patch.played_at {
            entry.played_at = Some(played_at);
        } else if to != from && matches!(to, EntryStatus::Played | EntryStatus::Skipped) {
            entry.played_at = Some(now);
        }

        let updated = entry.clone();
        if to.is_terminal() {
            self.retired.push(entry);
            self.renumber();
            return Ok(updated);
        }

        // A newly playing entry takes the head slot unless placed explicitly.
        let target = match patch.position {
            Some(p) => (p as usize - 1).min(self.entries.len()),
            None if to == EntryStatus::Playing && from != to => 0,
            None => index,
        };
        self.entries.insert(target, entry);
        self.renumber();
        Ok(self.entries[target].clone())
    }

    /// Drops matching active entries and schedules matching history for
    /// deletion. Returns how many active entries were dropped.
    pub fn clear(&mut self, filter: ClearFilter) -> usize {
        let before = self.entries.len();
        let deleted = &mut self.deleted;
        self.entries.retain(|e| {
            if filter.matches(e.status) {
                deleted.push(e.id);
                false
            } else {
                true
            }
        });
        self.purge = filter.terminal_statuses();
        self.renumber();
        before - self.entries.len()
    }

    pub fn into_changes(self) -> Changes {
        let mut inserted = Vec::new();
        let mut updated = Vec::new();

        for entry in self.retired {
            if self.original.contains_key(&entry.id) {
                updated.push(entry);
            } else {
                inserted.push(entry);
            }
        }
        for entry in self.entries {
            match self.original.get(&entry.id) {
                None => inserted.push(entry),
                Some(before) if *before != entry => updated.push(entry),
                Some(_) => {}
            }
        }

        Changes {
            inserted,
            updated,
            deleted: self.deleted,
            purge: self.purge,
        }
    }

    fn index_of(&self, id: Uuid) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| QueueError::NotFound(format!("active queue entry {}", id)))
    }

    fn renumber(&mut self) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.position = i as i32 + 1;
        }
    }
}

/// True when the active entries hold positions `1..N` exactly and at most one
/// of them is playing.
pub fn invariants_hold(entries: &[QueueEntry]) -> bool {
    let mut positions: Vec<i32> = entries
        .iter()
        .filter(|e| e.is_active())
        .map(|e| e.position)
        .collect();
    positions.sort_unstable();

    let dense = positions
        .iter()
        .enumerate()
        .all(|(i, p)| *p == i as i32 + 1);
    let playing = entries.iter().filter(|e| e.is_playing()).count();

    dense && playing <= 1
}
