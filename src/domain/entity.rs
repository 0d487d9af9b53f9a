use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Playing,
    Played,
    Skipped,
    Rejected,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        EntryStatus::Pending,
        EntryStatus::Playing,
        EntryStatus::Played,
        EntryStatus::Skipped,
        EntryStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Playing => "playing",
            EntryStatus::Played => "played",
            EntryStatus::Skipped => "skipped",
            EntryStatus::Rejected => "rejected",
        }
    }

    /// Pending and playing entries hold a slot in the queue.
    pub fn is_active(&self) -> bool {
        matches!(self, EntryStatus::Pending | EntryStatus::Playing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(&self, to: EntryStatus) -> bool {
        matches!(
            (self, to),
            (EntryStatus::Pending, EntryStatus::Playing)
                | (EntryStatus::Pending, EntryStatus::Rejected)
                | (EntryStatus::Playing, EntryStatus::Played)
                | (EntryStatus::Playing, EntryStatus::Skipped)
        )
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown entry status: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    // ID
    pub id: Uuid,
    pub bar_id: String,
    pub song_id: String,
    pub user_id: String,

    // Ordering
    pub position: i32,
    pub status: EntryStatus,
    pub priority_play: bool,

    // Billing
    pub points_used: i32,

    // Timing
    pub requested_at: DateTime<Utc>,
    pub played_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(
        bar_id: String,
        song_id: String,
        user_id: String,
        priority_play: bool,
        points_used: i32,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bar_id,
            song_id,
            user_id,
            position: 0,
            status: EntryStatus::Pending,
            priority_play,
            points_used,
            requested_at,
            played_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_playing(&self) -> bool {
        self.status == EntryStatus::Playing
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }
}

/// Per-bar limits, owned by the bar's settings and read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarPolicy {
    pub max_songs_per_user: i32,
    /// Seconds a user must wait between two requests.
    pub song_request_cooldown: i64,
    pub priority_play_cost: i32,
    pub max_queue_size: Option<i32>,
    pub auto_approve: bool,
}

impl Default for BarPolicy {
    fn default() -> Self {
        Self {
            max_songs_per_user: 3,
            song_request_cooldown: 300,
            priority_play_cost: 50,
            max_queue_size: None,
            auto_approve: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub id: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub is_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

/// Caller identity, already authenticated upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub bar_id: Option<String>,
}

impl Principal {
    /// Staff manage their own bar, admins manage every bar.
    pub fn can_manage(&self, bar_id: &str) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Staff => self.bar_id.as_deref() == Some(bar_id),
            Role::Customer => false,
        }
    }
}

/// Result of `next`/`skip`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub previous: Option<QueueEntry>,
    pub current: Option<QueueEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePage {
    pub entries: Vec<QueueEntry>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub playing: i64,
    pub played: i64,
    pub skipped: i64,
    pub rejected: i64,
    pub points_spent: i64,
}

impl QueueStats {
    pub fn record(&mut self, status: EntryStatus, count: i64) {
        match status {
            EntryStatus::Pending => self.pending += count,
            EntryStatus::Playing => self.playing += count,
            EntryStatus::Played => self.played += count,
            EntryStatus::Skipped => self.skipped += count,
            EntryStatus::Rejected => self.rejected += count,
        }
    }
}
