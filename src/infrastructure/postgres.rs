use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{
    postgres::PgRow, types::Uuid, Executor, FromRow, PgPool, Postgres, Row, Transaction,
};

use crate::domain::{
    entity::{Bar, BarPolicy, EntryStatus, QueueEntry, QueuePage, QueueStats, Song},
    error::{QueueError, Result},
    queue::{BarQueue, Changes},
    repository::{
        BarDirectory, BarPolicyProvider, Committed, QueueFilter, QueueStore, SongCatalog,
    },
};

const SCHEMA: &str = include_str!("../../migrations/0001_queue.sql");

/// SQLSTATEs worth one more attempt: serialization failure, deadlock,
/// lock timeout, statement timeout and a lost race on the playing index.
const TRANSIENT_CODES: [&str; 5] = ["40001", "40P01", "55P03", "57014", "23505"];

/// Transaction-scoped lock on a 64-bit hash of the bar id.
const BAR_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))";

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    pool.execute(SCHEMA).await?;
    Ok(())
}

trait StoreContext<T> {
    fn store_context(self, context: &'static str) -> Result<T>;
}

impl<T> StoreContext<T> for std::result::Result<T, sqlx::Error> {
    fn store_context(self, context: &'static str) -> Result<T> {
        self.map_err(|err| classify(err, context))
    }
}

fn classify(err: sqlx::Error, context: &'static str) -> QueueError {
    let transient = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map_or(false, |code| TRANSIENT_CODES.contains(&code.as_ref())),
        _ => false,
    };

    if transient {
        QueueError::Transient(format!("{}: {}", context, err))
    } else {
        QueueError::Internal(anyhow::Error::new(err).context(context))
    }
}

#[derive(Clone, Debug)]
pub struct PgQueueStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgQueueStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn persist(
        tx: &mut Transaction<'_, Postgres>,
        bar_id: &str,
        changes: Changes,
    ) -> Result<u64> {
        if !changes.deleted.is_empty() {
            sqlx::query("DELETE FROM queue.entries WHERE id = ANY($1)")
                .bind(&changes.deleted)
                .execute(&mut *tx)
                .await
                .store_context("QueueStore::persist delete")?;
        }

        let mut purged = 0;
        if !changes.purge.is_empty() {
            let statuses: Vec<String> = changes.purge.iter().map(|s| s.to_string()).collect();
            purged = sqlx::query("DELETE FROM queue.entries WHERE bar_id = $1 AND status = ANY($2)")
                .bind(bar_id)
                .bind(&statuses)
                .execute(&mut *tx)
                .await
                .store_context("QueueStore::persist purge")?
                .rows_affected();
        }

        for entry in &changes.updated {
            sqlx::query(
                r#"
                UPDATE queue.entries
                SET position = $1, status = $2, played_at = $3
                WHERE id = $4
                "#,
            )
            .bind(&entry.position)
            .bind(entry.status.as_str())
            .bind(&entry.played_at)
            .bind(&entry.id)
            .execute(&mut *tx)
            .await
            .store_context("QueueStore::persist update")?;
        }

        for entry in &changes.inserted {
            sqlx::query(
                r#"
                INSERT INTO queue.entries (id, bar_id, song_id, user_id, position, status, priority_play, points_used, requested_at, played_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.bar_id)
            .bind(&entry.song_id)
            .bind(&entry.user_id)
            .bind(&entry.position)
            .bind(entry.status.as_str())
            .bind(&entry.priority_play)
            .bind(&entry.points_used)
            .bind(&entry.requested_at)
            .bind(&entry.played_at)
            .execute(&mut *tx)
            .await
            .store_context("QueueStore::persist insert")?;
        }

        Ok(purged)
    }
}

#[async_trait::async_trait]
impl QueueStore for PgQueueStore {
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
        let mut tx = self
            .pool
            .begin()
            .await
            .store_context("QueueStore::mutate begin")?;

        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut tx)
        .await
        .store_context("QueueStore::mutate lock_timeout")?;

        // Serializes writers per bar, including while the bar has no rows yet.
        sqlx::query(BAR_LOCK)
            .bind(bar_id)
            .execute(&mut tx)
            .await
            .store_context("QueueStore::mutate lock")?;

        let active: Vec<QueueEntry> = sqlx::query_as(
            r#"
            SELECT * FROM queue.entries
            WHERE bar_id = $1 AND status IN ('pending', 'playing')
            ORDER BY position
            FOR UPDATE
            "#,
        )
        .bind(bar_id)
        .fetch_all(&mut tx)
        .await
        .store_context("QueueStore::mutate load")?;

        let last_request_at: Option<DateTime<Utc>> = match requester {
            Some(user_id) => sqlx::query_scalar(
                "SELECT MAX(requested_at) FROM queue.entries WHERE bar_id = $1 AND user_id = $2",
            )
            .bind(bar_id)
            .bind(user_id)
            .fetch_one(&mut tx)
            .await
            .store_context("QueueStore::mutate last_request")?,
            None => None,
        };

        let mut queue = BarQueue::new(bar_id, active, last_request_at);
        let value = f(&mut queue)?;

        let changes = queue.into_changes();
        let purged = if changes.is_empty() {
            0
        } else {
            Self::persist(&mut tx, bar_id, changes).await?
        };

        tx.commit().await.store_context("QueueStore::mutate commit")?;

        Ok(Committed { value, purged })
    }

    async fn find(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        let entry: Option<QueueEntry> = sqlx::query_as("SELECT * FROM queue.entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .store_context("QueueStore::find")?;

        Ok(entry)
    }

    async fn page(
        &self,
        bar_id: &str,
        filter: &QueueFilter,
        page: u32,
        limit: u32,
    ) -> Result<QueuePage> {
        const WHERE: &str = r#"
            WHERE bar_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR user_id = $3)
              AND ($4::timestamptz IS NULL OR requested_at >= $4)
              AND ($5::timestamptz IS NULL OR requested_at <= $5)
        "#;
        let status = filter.status.map(|s| s.as_str());
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);

        let entries: Vec<QueueEntry> = sqlx::query_as(&format!(
            "SELECT * FROM queue.entries {} ORDER BY position, requested_at, id LIMIT $6 OFFSET $7",
            WHERE
        ))
        .bind(bar_id)
        .bind(status)
        .bind(&filter.user_id)
        .bind(&filter.date_from)
        .bind(&filter.date_to)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .store_context("QueueStore::page")?;

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) FROM queue.entries {}", WHERE))
            .bind(bar_id)
            .bind(status)
            .bind(&filter.user_id)
            .bind(&filter.date_from)
            .bind(&filter.date_to)
            .map(|row: PgRow| row.get(0))
            .fetch_one(&self.pool)
            .await
            .store_context("QueueStore::page count")?;

        Ok(QueuePage {
            entries,
            total,
            page,
            limit,
        })
    }

    async fn playing(&self, bar_id: &str) -> Result<Option<QueueEntry>> {
        let entry: Option<QueueEntry> = sqlx::query_as(
            "SELECT * FROM queue.entries WHERE bar_id = $1 AND status = 'playing'",
        )
        .bind(bar_id)
        .fetch_optional(&self.pool)
        .await
        .store_context("QueueStore::playing")?;

        Ok(entry)
    }

    async fn next_pending(&self, bar_id: &str) -> Result<Option<QueueEntry>> {
        let entry: Option<QueueEntry> = sqlx::query_as(
            r#"
            SELECT * FROM queue.entries
            WHERE bar_id = $1 AND status = 'pending'
            ORDER BY position
            LIMIT 1
            "#,
        )
        .bind(bar_id)
        .fetch_optional(&self.pool)
        .await
        .store_context("QueueStore::next_pending")?;

        Ok(entry)
    }

    async fn stats(&self, bar_id: &str) -> Result<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*), COALESCE(SUM(points_used), 0)::BIGINT
            FROM queue.entries
            WHERE bar_id = $1
            GROUP BY status
            "#,
        )
        .bind(bar_id)
        .fetch_all(&self.pool)
        .await
        .store_context("QueueStore::stats")?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get(0).store_context("QueueStore::stats")?;
            let count: i64 = row.try_get(1).store_context("QueueStore::stats")?;
            let points: i64 = row.try_get(2).store_context("QueueStore::stats")?;

            let status: EntryStatus = status
                .parse()
                .map_err(|e: String| QueueError::Internal(anyhow::anyhow!(e)))?;
            stats.record(status, count);
            stats.points_spent += points;
        }

        Ok(stats)
    }
}

impl FromRow<'_, PgRow> for QueueEntry {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let id: Uuid = row.try_get("id")?;
        let bar_id: String = row.try_get("bar_id")?;
        let song_id: String = row.try_get("song_id")?;
        let user_id: String = row.try_get("user_id")?;
        let position: i32 = row.try_get("position")?;
        let status: String = row.try_get("status")?;
        let priority_play: bool = row.try_get("priority_play")?;
        let points_used: i32 = row.try_get("points_used")?;
        let requested_at: DateTime<Utc> = row.try_get("requested_at")?;
        let played_at: Option<DateTime<Utc>> = row.try_get("played_at")?;

        Ok(Self {
            id,
            bar_id,
            song_id,
            user_id,
            position,
            status: status.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            priority_play,
            points_used,
            requested_at,
            played_at,
        })
    }
}

impl FromRow<'_, PgRow> for Bar {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            is_active: row.try_get("is_active")?,
        })
    }
}

impl FromRow<'_, PgRow> for Song {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            artist: row.try_get("artist")?,
            is_available: row.try_get("is_available")?,
        })
    }
}

impl FromRow<'_, PgRow> for BarPolicy {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            max_songs_per_user: row.try_get("max_songs_per_user")?,
            song_request_cooldown: row.try_get("song_request_cooldown")?,
            priority_play_cost: row.try_get("priority_play_cost")?,
            max_queue_size: row.try_get("max_queue_size")?,
            auto_approve: row.try_get("auto_approve")?,
        })
    }
}

/// Bars, their settings and the song catalog, read from the shared database.
#[derive(Clone, Debug)]
pub struct PgVenues {
    pool: PgPool,
}

impl PgVenues {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl BarDirectory for PgVenues {
    async fn find_bar(&self, bar_id: &str) -> Result<Option<Bar>> {
        let bar: Option<Bar> = sqlx::query_as("SELECT id, name, is_active FROM queue.bars WHERE id = $1")
            .bind(bar_id)
            .fetch_optional(&self.pool)
            .await
            .store_context("BarDirectory::find_bar")?;

        Ok(bar)
    }
}

#[async_trait::async_trait]
impl SongCatalog for PgVenues {
    async fn find_song(&self, song_id: &str) -> Result<Option<Song>> {
        let song: Option<Song> = sqlx::query_as(
            "SELECT id, title, artist, is_available FROM catalog.songs WHERE id = $1",
        )
        .bind(song_id)
        .fetch_optional(&self.pool)
        .await
        .store_context("SongCatalog::find_song")?;

        Ok(song)
    }
}

#[async_trait::async_trait]
impl BarPolicyProvider for PgVenues {
    async fn settings(&self, bar_id: &str) -> Result<BarPolicy> {
        let policy: Option<BarPolicy> = sqlx::query_as(
            r#"
            SELECT max_songs_per_user, song_request_cooldown, priority_play_cost, max_queue_size, auto_approve
            FROM queue.bar_settings
            WHERE bar_id = $1
            "#,
        )
        .bind(bar_id)
        .fetch_optional(&self.pool)
        .await
        .store_context("BarPolicyProvider::settings")?;

        Ok(policy.unwrap_or_default())
    }
}
