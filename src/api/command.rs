use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    admission::Denial,
    entity::{EntryStatus, Principal},
    error::{QueueError, Result},
    queue::{ClearFilter, EntryPatch},
    repository::QueueFilter,
};

const MAX_ID_LEN: usize = 128;
const MAX_POINTS: i32 = 1_000_000;
const MAX_LIMIT: u32 = 100;
const MAX_REORDER: usize = 1_000;

/// Rejects a command before it reaches the engine.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn check_id(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(QueueError::Validation(format!("{} is required", field)));
    }
    if value.len() > MAX_ID_LEN {
        return Err(QueueError::Validation(format!(
            "{} must be at most {} characters",
            field, MAX_ID_LEN
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(QueueError::Validation(format!(
            "{} must not contain whitespace",
            field
        )));
    }
    Ok(())
}

/// A command together with who sent it and from where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<C> {
    pub principal: Principal,
    #[serde(default)]
    pub client_addr: Option<IpAddr>,
    pub command: C,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddToQueue {
    pub bar_id: String,
    pub song_id: String,
    pub user_id: String,
    #[serde(default)]
    pub priority_play: bool,
    #[serde(default)]
    pub points_used: i32,
}

impl Validate for AddToQueue {
    fn validate(&self) -> Result<()> {
        check_id("bar_id", &self.bar_id)?;
        check_id("song_id", &self.song_id)?;
        check_id("user_id", &self.user_id)?;
        if !(0..=MAX_POINTS).contains(&self.points_used) {
            return Err(QueueError::Validation(format!(
                "points_used must be between 0 and {}",
                MAX_POINTS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateQueueEntry {
    pub id: Uuid,
    #[serde(default)]
    pub status: Option<EntryStatus>,
    #[serde(default)]
    pub position: Option<i32>,
    #[serde(default)]
    pub played_at: Option<DateTime<Utc>>,
}

impl UpdateQueueEntry {
    pub fn patch(&self) -> EntryPatch {
        EntryPatch {
            status: self.status,
            position: self.position,
            played_at: self.played_at,
        }
    }
}

impl Validate for UpdateQueueEntry {
    fn validate(&self) -> Result<()> {
        if self.status.is_none() && self.position.is_none() && self.played_at.is_none() {
            return Err(QueueError::Validation(
                "nothing to update: set status, position or played_at".to_string(),
            ));
        }
        if matches!(self.position, Some(p) if p < 1) {
            return Err(QueueError::Validation(
                "position must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoveFromQueue {
    pub id: Uuid,
}

impl Validate for RemoveFromQueue {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RejectEntry {
    pub id: Uuid,
}

impl Validate for RejectEntry {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReorderQueue {
    pub bar_id: String,
    pub ordered_ids: Vec<Uuid>,
}

impl Validate for ReorderQueue {
    fn validate(&self) -> Result<()> {
        check_id("bar_id", &self.bar_id)?;
        if self.ordered_ids.len() > MAX_REORDER {
            return Err(QueueError::Validation(format!(
                "at most {} ids can be reordered at once",
                MAX_REORDER
            )));
        }
        let mut seen = std::collections::HashSet::new();
        if !self.ordered_ids.iter().all(|id| seen.insert(*id)) {
            return Err(QueueError::Validation(
                "ordered_ids contain duplicates".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClearQueue {
    pub bar_id: String,
    #[serde(default)]
    pub status_filter: ClearFilter,
}

impl Validate for ClearQueue {
    fn validate(&self) -> Result<()> {
        check_id("bar_id", &self.bar_id)
    }
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetQueue {
    pub bar_id: String,
    #[serde(default)]
    pub filters: QueueFilter,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl GetQueue {
    pub fn new(bar_id: impl Into<String>) -> Self {
        Self {
            bar_id: bar_id.into(),
            filters: QueueFilter::default(),
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl Validate for GetQueue {
    fn validate(&self) -> Result<()> {
        check_id("bar_id", &self.bar_id)?;
        if let Some(user_id) = &self.filters.user_id {
            check_id("user_id", user_id)?;
        }
        if self.page < 1 {
            return Err(QueueError::Validation("page must be at least 1".to_string()));
        }
        if !(1..=MAX_LIMIT).contains(&self.limit) {
            return Err(QueueError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_LIMIT
            )));
        }
        if let (Some(from), Some(to)) = (self.filters.date_from, self.filters.date_to) {
            if from > to {
                return Err(QueueError::Validation(
                    "date_from must not be after date_to".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Commands addressed to a whole bar: playing, upcoming, skip, play_next, stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForBar {
    pub bar_id: String,
}

impl Validate for ForBar {
    fn validate(&self) -> Result<()> {
        check_id("bar_id", &self.bar_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cleared {
    pub cleared_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl From<&QueueError> for ErrorBody {
    fn from(err: &QueueError) -> Self {
        Self {
            code: err.code().to_string(),
            reason: err.public_reason(),
            retry_after_seconds: match err {
                QueueError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
                _ => None,
            },
        }
    }
}

impl From<&Denial> for ErrorBody {
    fn from(denial: &Denial) -> Self {
        Self {
            code: denial.code.as_str().to_string(),
            reason: denial.reason.clone(),
            retry_after_seconds: denial.remaining_secs.map(|s| s.max(0) as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply<T> {
    Ok { data: T },
    Error(ErrorBody),
}
