use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    entity::{Bar, BarPolicy, QueueEntry, QueuePage, QueueStats, Song},
    error::{QueueError, Result},
    queue::{BarQueue, Changes},
    repository::{
        BarDirectory, BarPolicyProvider, Committed, QueueFilter, QueueStore, SongCatalog,
    },
};

type BarTable = Arc<Mutex<Vec<QueueEntry>>>;

/// Process-local queue storage. Each bar has its own async mutex, so bars
/// never wait on each other.
#[derive(Clone, Debug, Default)]
pub struct MemoryQueueStore {
    bars: Arc<DashMap<String, BarTable>>,
    failures: Arc<AtomicUsize>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` mutations fail as contention.
    pub fn inject_transient_failures(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every entry ever stored for the bar, in insertion order.
    pub async fn rows(&self, bar_id: &str) -> Vec<QueueEntry> {
        self.table(bar_id).lock().await.clone()
    }

    fn table(&self, bar_id: &str) -> BarTable {
        Arc::clone(&self.bars.entry(bar_id.to_string()).or_default())
    }

    fn tables(&self) -> Vec<BarTable> {
        self.bars.iter().map(|t| Arc::clone(t.value())).collect()
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn apply(rows: &mut Vec<QueueEntry>, changes: Changes) -> u64 {
    rows.retain(|e| !changes.deleted.contains(&e.id));

    let before = rows.len();
    rows.retain(|e| !changes.purge.contains(&e.status));
    let purged = (before - rows.len()) as u64;

    for entry in changes.updated {
        if let Some(row) = rows.iter_mut().find(|r| r.id == entry.id) {
            *row = entry;
        }
    }
    rows.extend(changes.inserted);

    purged
}

fn ordered(mut entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
    entries.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then(a.requested_at.cmp(&b.requested_at))
            .then(a.id.cmp(&b.id))
    });
    entries
}

#[async_trait::async_trait]
impl QueueStore for MemoryQueueStore {
    async fn mutate<T, F>(
        &self,
        bar_id: &str,
        requester: Option<&str>,
        f: F,
    ) -> Result<Committed<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut BarQueue) -> Result<T> + Send + 'static,
    {
        if self.take_failure() {
            return Err(QueueError::Transient("injected contention".to_string()));
        }

        let table = self.table(bar_id);
        let mut rows = table.lock().await;

        let last_request_at = requester.and_then(|user| {
            rows.iter()
                .filter(|e| e.user_id == user)
                .map(|e| e.requested_at)
                .max()
        });
        let active = rows.iter().filter(|e| e.is_active()).cloned().collect();
        let mut queue = BarQueue::new(bar_id, active, last_request_at);

        let value = f(&mut queue)?;
        let purged = apply(&mut rows, queue.into_changes());

        Ok(Committed { value, purged })
    }

    async fn find(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        for table in self.tables() {
            if let Some(entry) = table.lock().await.iter().find(|e| e.id == id) {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    async fn page(
        &self,
        bar_id: &str,
        filter: &QueueFilter,
        page: u32,
        limit: u32,
    ) -> Result<QueuePage> {
        let matching = ordered(
            self.table(bar_id)
                .lock()
                .await
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
        );
        let offset = (page.saturating_sub(1) as usize).saturating_mul(limit as usize);

        Ok(QueuePage {
            total: matching.len() as i64,
            entries: matching
                .into_iter()
                .skip(offset)
                .take(limit as usize)
                .collect(),
            page,
            limit,
        })
    }

    async fn playing(&self, bar_id: &str) -> Result<Option<QueueEntry>> {
        let rows = self.table(bar_id);
        let rows = rows.lock().await;
        Ok(rows.iter().find(|e| e.is_playing()).cloned())
    }

    async fn next_pending(&self, bar_id: &str) -> Result<Option<QueueEntry>> {
        let rows = self.table(bar_id);
        let rows = rows.lock().await;
        Ok(rows
            .iter()
            .filter(|e| e.is_pending())
            .min_by_key(|e| e.position)
            .cloned())
    }

    async fn stats(&self, bar_id: &str) -> Result<QueueStats> {
        let rows = self.table(bar_id);
        let rows = rows.lock().await;

        let mut stats = QueueStats::default();
        for entry in rows.iter() {
            stats.record(entry.status, 1);
            stats.points_spent += i64::from(entry.points_used);
        }
        Ok(stats)
    }
}

/// In-process stand-in for the bar directory, song catalog and settings.
#[derive(Clone, Debug, Default)]
pub struct MemoryVenues {
    bars: Arc<DashMap<String, Bar>>,
    songs: Arc<DashMap<String, Song>>,
    policies: Arc<DashMap<String, BarPolicy>>,
}

impl MemoryVenues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bar(&self, bar: Bar) {
        self.bars.insert(bar.id.clone(), bar);
    }

    pub fn add_song(&self, song: Song) {
        self.songs.insert(song.id.clone(), song);
    }

    pub fn set_policy(&self, bar_id: &str, policy: BarPolicy) {
        self.policies.insert(bar_id.to_string(), policy);
    }
}

#[async_trait::async_trait]
impl BarDirectory for MemoryVenues {
    async fn find_bar(&self, bar_id: &str) -> Result<Option<Bar>> {
        Ok(self.bars.get(bar_id).map(|b| b.value().clone()))
    }
}

#[async_trait::async_trait]
impl SongCatalog for MemoryVenues {
    async fn find_song(&self, song_id: &str) -> Result<Option<Song>> {
        Ok(self.songs.get(song_id).map(|s| s.value().clone()))
    }
}

#[async_trait::async_trait]
impl BarPolicyProvider for MemoryVenues {
    async fn settings(&self, bar_id: &str) -> Result<BarPolicy> {
        Ok(self
            .policies
            .get(bar_id)
            .map(|p| p.value().clone())
            .unwrap_or_default())
    }
}
