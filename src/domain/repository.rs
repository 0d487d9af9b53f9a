use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    entity::{Bar, BarPolicy, EntryStatus, QueueEntry, QueuePage, QueueStats, Song},
    error::Result,
    queue::BarQueue,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueFilter {
    #[serde(default)]
    pub status: Option<EntryStatus>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
}

impl QueueFilter {
    pub fn matches(&self, entry: &QueueEntry) -> bool {
        self.status.map_or(true, |s| entry.status == s)
            && self.user_id.as_ref().map_or(true, |u| &entry.user_id == u)
            && self.date_from.map_or(true, |from| entry.requested_at >= from)
            && self.date_to.map_or(true, |to| entry.requested_at <= to)
    }
}

/// Value returned by a committed [`QueueStore::mutate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub value: T,
    /// Retained history rows deleted by a purge.
    pub purged: u64,
}

#[async_trait::async_trait]
pub trait QueueStore: Clone + Send + Sync {
    /// Runs `f` against the bar's active entries while holding the bar's lock,
    /// then persists the resulting changes atomically. Nothing is written when
    /// `f` fails. `requester` selects whose last request time is loaded.
    async fn mutate<T, F>(
        &self,
        bar_id: &str,
        requester: Option<&str>,
        f: F,
    ) -> Result<Committed<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut BarQueue) -> Result<T> + Send + 'static;

    async fn find(&self, id: Uuid) -> Result<Option<QueueEntry>>;

    /// Entries ordered by position, then request time.
    async fn page(
        &self,
        bar_id: &str,
        filter: &QueueFilter,
        page: u32,
        limit: u32,
    ) -> Result<QueuePage>;

    async fn playing(&self, bar_id: &str) -> Result<Option<QueueEntry>>;

    async fn next_pending(&self, bar_id: &str) -> Result<Option<QueueEntry>>;

    async fn stats(&self, bar_id: &str) -> Result<QueueStats>;
}

#[async_trait::async_trait]
pub trait BarDirectory: Clone + Send + Sync {
    async fn find_bar(&self, bar_id: &str) -> Result<Option<Bar>>;
}

#[async_trait::async_trait]
pub trait SongCatalog: Clone + Send + Sync {
    async fn find_song(&self, song_id: &str) -> Result<Option<Song>>;
}

#[async_trait::async_trait]
pub trait BarPolicyProvider: Clone + Send + Sync {
    /// Falls back to [`BarPolicy::default`] for bars without settings.
    async fn settings(&self, bar_id: &str) -> Result<BarPolicy>;
}
