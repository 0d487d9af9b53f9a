use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{Bar, BarPolicy, QueueEntry, Song};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialCode {
    BarNotFound,
    BarInactive,
    SongNotFound,
    SongUnavailable,
    UserLimitReached,
    Cooldown,
    QueueFull,
    InsufficientPoints,
}

impl DenialCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialCode::BarNotFound => "bar_not_found",
            DenialCode::BarInactive => "bar_inactive",
            DenialCode::SongNotFound => "song_not_found",
            DenialCode::SongUnavailable => "song_unavailable",
            DenialCode::UserLimitReached => "user_limit_reached",
            DenialCode::Cooldown => "cooldown",
            DenialCode::QueueFull => "queue_full",
            DenialCode::InsufficientPoints => "insufficient_points",
        }
    }
}

/// Why a request may not enter the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Denial {
    pub code: DenialCode,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<i64>,
}

impl Denial {
    fn new(code: DenialCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            remaining_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed,
    Denied(Denial),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AddOutcome {
    Added(QueueEntry),
    Rejected(Denial),
}

/// Everything the gate looks at. Counts are taken from the bar's locked
/// snapshot so the decision holds for the enclosing transaction.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub bar: Option<&'a Bar>,
    pub song: Option<&'a Song>,
    pub policy: &'a BarPolicy,
    pub priority_play: bool,
    pub points_used: i32,
    /// The user's pending and playing entries in this bar.
    pub user_active: usize,
    /// All pending and playing entries in this bar.
    pub queue_active: usize,
    /// The user's most recent request in this bar, whatever its status.
    pub last_request_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Decides whether a request may enter the queue. Checks run in a fixed
/// order and the first failure wins.
pub fn can_admit(req: &AdmissionRequest<'_>) -> Admission {
    match check(req) {
        Ok(()) => Admission::Allowed,
        Err(denial) => Admission::Denied(denial),
    }
}

fn check(req: &AdmissionRequest<'_>) -> Result<(), Denial> {
    let bar = req
        .bar
        .ok_or_else(|| Denial::new(DenialCode::BarNotFound, "bar not found"))?;
    if !bar.is_active {
        return Err(Denial::new(
            DenialCode::BarInactive,
            format!("{} is not taking requests right now", bar.name),
        ));
    }

    let song = req
        .song
        .ok_or_else(|| Denial::new(DenialCode::SongNotFound, "song not found"))?;
    if !song.is_available {
        return Err(Denial::new(
            DenialCode::SongUnavailable,
            format!("{} by {} is not available", song.title, song.artist),
        ));
    }

    let max_per_user = req.policy.max_songs_per_user.max(0) as usize;
    if req.user_active >= max_per_user {
        return Err(Denial::new(
            DenialCode::UserLimitReached,
            format!(
                "limit reached: at most {} songs per user in the queue",
                max_per_user
            ),
        ));
    }

    if let Some(remaining) = cooldown_remaining(req) {
        return Err(Denial {
            code: DenialCode::Cooldown,
            reason: format!("please wait {}s before requesting another song", remaining),
            remaining_secs: Some(remaining),
        });
    }

    if let Some(max) = req.policy.max_queue_size {
        if req.queue_active >= max.max(0) as usize {
            return Err(Denial::new(
                DenialCode::QueueFull,
                format!("the queue is full ({} songs)", max),
            ));
        }
    }

    if req.priority_play && req.points_used < req.policy.priority_play_cost {
        return Err(Denial::new(
            DenialCode::InsufficientPoints,
            format!(
                "priority play costs {} points",
                req.policy.priority_play_cost
            ),
        ));
    }

    Ok(())
}

/// Whole seconds (rounded up) left before the user may request again.
fn cooldown_remaining(req: &AdmissionRequest<'_>) -> Option<i64> {
    let last = req.last_request_at?;
    let cooldown_ms = req.policy.song_request_cooldown.max(0) * 1000;
    let elapsed_ms = (req.now - last).num_milliseconds().max(0);

    if elapsed_ms >= cooldown_ms {
        return None;
    }

    let remaining_ms = cooldown_ms - elapsed_ms;
    Some((remaining_ms + 999) / 1000)
}
