use std::{future::Future, sync::Arc, time::Duration};

use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api::command::{AddToQueue, ClearQueue, GetQueue, ReorderQueue, UpdateQueueEntry},
    domain::{
        admission::{can_admit, AddOutcome, Admission, AdmissionRequest, DenialCode},
        clock::Clock,
        entity::{
            Bar, BarPolicy, EntryStatus, Principal, QueueEntry, QueuePage, QueueStats, Song,
            Transition,
        },
        error::{QueueError, Result},
        event::{EventNotifier, Payload},
        queue::{BarQueue, EntryPatch},
        repository::{BarDirectory, BarPolicyProvider, QueueStore, SongCatalog},
    },
};

/// Everything an `add` attempt needs, owned so it can run under the store's lock.
struct Request {
    bar: Option<Bar>,
    song: Option<Song>,
    policy: BarPolicy,
    entry: QueueEntry,
}

impl Request {
    fn admit(self, queue: &mut BarQueue) -> Result<AddOutcome> {
        let admission = can_admit(&AdmissionRequest {
            bar: self.bar.as_ref(),
            song: self.song.as_ref(),
            policy: &self.policy,
            priority_play: self.entry.priority_play,
            points_used: self.entry.points_used,
            user_active: queue.user_active(&self.entry.user_id),
            queue_active: queue.len(),
            last_request_at: queue.last_request_at(),
            now: self.entry.requested_at,
        });

        match admission {
            Admission::Allowed => Ok(AddOutcome::Added(queue.enqueue(self.entry))),
            Admission::Denied(denial) => Ok(AddOutcome::Rejected(denial)),
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(5..50))
}

/// Orchestrates every queue operation: permission checks, admission, the
/// per-bar transaction and event publication.
#[derive(Clone)]
pub struct QueueEngine<QS, V>
where
    QS: QueueStore,
    V: BarDirectory + SongCatalog + BarPolicyProvider,
{
    store: QS,
    venues: V,
    notifier: EventNotifier,
    clock: Arc<dyn Clock>,
    storage_timeout: Duration,
}

impl<QS, V> QueueEngine<QS, V>
where
    QS: QueueStore,
    V: BarDirectory + SongCatalog + BarPolicyProvider,
{
    pub fn new(
        store: QS,
        venues: V,
        notifier: EventNotifier,
        clock: Arc<dyn Clock>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            venues,
            notifier,
            clock,
            storage_timeout,
        }
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    fn publish(&self, bar_id: &str, payload: Payload) {
        self.notifier.emit(bar_id, payload, self.clock.now());
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.storage_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Transient(format!(
                "storage call exceeded {}ms",
                self.storage_timeout.as_millis()
            ))),
        }
    }

    /// Runs `op` once more after a transient failure. Each attempt rebuilds
    /// its mutation, so admission is judged against fresh state.
    async fn with_retry<T, Fut>(&self, name: &'static str, op: impl Fn() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match self.bounded(op()).await {
            Err(err) if err.is_transient() => {
                warn!(op = name, error = %err, "Storage contention, retrying once");
                tokio::time::sleep(jitter()).await;
                self.bounded(op()).await
            }
            other => other,
        }
    }

    async fn ensure_bar(&self, bar_id: &str) -> Result<Bar> {
        self.bounded(self.venues.find_bar(bar_id))
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("bar {}", bar_id)))
    }

    fn ensure_manager(principal: &Principal, bar_id: &str) -> Result<()> {
        if principal.can_manage(bar_id) {
            Ok(())
        } else {
            Err(QueueError::Forbidden(
                "only staff of this bar can do that".to_string(),
            ))
        }
    }

    async fn find_entry(&self, id: Uuid) -> Result<QueueEntry> {
        let store = &self.store;
        self.with_retry("find", move || store.find(id))
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("queue entry {}", id)))
    }

    pub async fn add(&self, principal: &Principal, cmd: AddToQueue) -> Result<AddOutcome> {
        info!("Add request: {:?}", cmd);

        if cmd.user_id != principal.id && !principal.can_manage(&cmd.bar_id) {
            return Err(QueueError::Forbidden(
                "cannot request songs for another user".to_string(),
            ));
        }

        let bar = self.bounded(self.venues.find_bar(&cmd.bar_id)).await?;
        let song = self.bounded(self.venues.find_song(&cmd.song_id)).await?;
        let policy = self.bounded(self.venues.settings(&cmd.bar_id)).await?;

        let (store, clock) = (&self.store, &self.clock);
        let (bar, song, policy, cmd_ref) = (&bar, &song, &policy, &cmd);
        let outcome = self
            .with_retry("add", move || {
                let request = Request {
                    bar: bar.clone(),
                    song: song.clone(),
                    policy: policy.clone(),
                    entry: QueueEntry::new(
                        cmd_ref.bar_id.clone(),
                        cmd_ref.song_id.clone(),
                        cmd_ref.user_id.clone(),
                        cmd_ref.priority_play,
                        cmd_ref.points_used,
                        clock.now(),
                    ),
                };
                store.mutate(&cmd_ref.bar_id, Some(cmd_ref.user_id.as_str()), move |q| {
                    request.admit(q)
                })
            })
            .await?
            .value;

        match outcome {
            AddOutcome::Added(entry) => {
                info!(
                    entry_id = %entry.id,
                    position = entry.position,
                    priority_play = entry.priority_play,
                    "Song added"
                );
                self.publish(
                    &entry.bar_id,
                    Payload::SongAdded {
                        entry: entry.clone(),
                    },
                );
                Ok(AddOutcome::Added(entry))
            }
            AddOutcome::Rejected(denial) => match denial.code {
                DenialCode::BarNotFound => Err(QueueError::NotFound(format!("bar {}", cmd.bar_id))),
                DenialCode::SongNotFound => {
                    Err(QueueError::NotFound(format!("song {}", cmd.song_id)))
                }
                code => {
                    info!(code = code.as_str(), user_id = %cmd.user_id, "Request denied");
                    Ok(AddOutcome::Rejected(denial))
                }
            },
        }
    }

    pub async fn remove(&self, principal: &Principal, id: Uuid) -> Result<()> {
        info!("Remove request: {}", id);

        let entry = self.find_entry(id).await?;
        let manager = principal.can_manage(&entry.bar_id);
        let owner = entry.user_id == principal.id;
        if !manager && !(owner && entry.is_pending()) {
            return Err(QueueError::Forbidden(
                "only staff or the requester of a pending song can remove it".to_string(),
            ));
        }

        let (store, bar_id, active) = (&self.store, entry.bar_id.as_str(), entry.is_active());
        self.with_retry("remove", move || {
            store.mutate(bar_id, None, move |q| {
                if !active {
                    q.forget(id);
                    return Ok(());
                }
                let pending = q.get(id).map(|e| e.is_pending()).ok_or_else(|| {
                    QueueError::Conflict("entry is no longer in the queue".to_string())
                })?;
                if !manager && !pending {
                    return Err(QueueError::Forbidden(
                        "the song has already started".to_string(),
                    ));
                }
                q.remove(id).map(|_| ())
            })
        })
        .await?;

        self.publish(&entry.bar_id, Payload::SongRemoved { entry_id: id });
        Ok(())
    }

    pub async fn reorder(&self, principal: &Principal, cmd: ReorderQueue) -> Result<()> {
        info!("Reorder request: {:?}", cmd);

        Self::ensure_manager(principal, &cmd.bar_id)?;
        self.ensure_bar(&cmd.bar_id).await?;

        let (store, cmd_ref) = (&self.store, &cmd);
        self.with_retry("reorder", move || {
            let ordered = cmd_ref.ordered_ids.clone();
            store.mutate(&cmd_ref.bar_id, None, move |q| q.reorder(&ordered))
        })
        .await?;

        self.publish(
            &cmd.bar_id,
            Payload::QueueReordered {
                entry_ids: cmd.ordered_ids,
            },
        );
        Ok(())
    }

    pub async fn play_next(&self, principal: &Principal, bar_id: &str) -> Result<Transition> {
        self.advance(principal, bar_id, EntryStatus::Played).await
    }

    pub async fn skip(&self, principal: &Principal, bar_id: &str) -> Result<Transition> {
        self.advance(principal, bar_id, EntryStatus::Skipped).await
    }

    async fn advance(
        &self,
        principal: &Principal,
        bar_id: &str,
        finished: EntryStatus,
    ) -> Result<Transition> {
        info!(bar_id, finished = %finished, "Advance request");

        Self::ensure_manager(principal, bar_id)?;
        self.ensure_bar(bar_id).await?;

        let (store, clock) = (&self.store, &self.clock);
        let transition = self
            .with_retry("advance", move || {
                let now = clock.now();
                store.mutate(bar_id, None, move |q| Ok(q.advance(finished, now)))
            })
            .await?
            .value;

        if let Some(previous) = &transition.previous {
            self.publish(
                bar_id,
                Payload::SongStatusUpdated {
                    entry_id: previous.id,
                    from: EntryStatus::Playing,
                    to: finished,
                },
            );
        }
        if let Some(current) = &transition.current {
            self.publish(
                bar_id,
                Payload::SongStatusUpdated {
                    entry_id: current.id,
                    from: EntryStatus::Pending,
                    to: EntryStatus::Playing,
                },
            );
        }
        self.publish(
            bar_id,
            Payload::PlayNextSong {
                next: transition.current.clone(),
            },
        );

        info!(
            bar_id,
            previous = ?transition.previous.as_ref().map(|e| e.id),
            current = ?transition.current.as_ref().map(|e| e.id),
            "Queue advanced"
        );
        Ok(transition)
    }

    pub async fn clear(&self, principal: &Principal, cmd: ClearQueue) -> Result<u64> {
        info!("Clear request: {:?}", cmd);

        Self::ensure_manager(principal, &cmd.bar_id)?;
        self.ensure_bar(&cmd.bar_id).await?;

        let (store, bar_id, filter) = (&self.store, cmd.bar_id.as_str(), cmd.status_filter);
        let committed = self
            .with_retry("clear", move || {
                store.mutate(bar_id, None, move |q| Ok(q.clear(filter) as u64))
            })
            .await?;

        let count = committed.value + committed.purged;
        self.publish(&cmd.bar_id, Payload::QueueCleared { count });
        Ok(count)
    }

    pub async fn update(&self, principal: &Principal, cmd: UpdateQueueEntry) -> Result<QueueEntry> {
        info!("Update request: {:?}", cmd);
        self.apply_patch(principal, cmd.id, cmd.patch()).await
    }

    /// Shortcut for moving a pending entry to `rejected`.
    pub async fn reject(&self, principal: &Principal, id: Uuid) -> Result<QueueEntry> {
        info!("Reject request: {}", id);
        let patch = EntryPatch {
            status: Some(EntryStatus::Rejected),
            ..EntryPatch::default()
        };
        self.apply_patch(principal, id, patch).await
    }

    async fn apply_patch(
        &self,
        principal: &Principal,
        id: Uuid,
        patch: EntryPatch,
    ) -> Result<QueueEntry> {
        let entry = self.find_entry(id).await?;
        Self::ensure_manager(principal, &entry.bar_id)?;
        if entry.status.is_terminal() {
            return Err(QueueError::Conflict(format!(
                "entry is already {}",
                entry.status
            )));
        }

        let (store, clock, bar_id, patch_ref) =
            (&self.store, &self.clock, entry.bar_id.as_str(), &patch);
        let (from, updated, order) = self
            .with_retry("update", move || {
                let (patch, now) = (patch_ref.clone(), clock.now());
                store.mutate(bar_id, None, move |q| {
                    let from = q.get(id).map(|e| e.status).ok_or_else(|| {
                        QueueError::Conflict("entry is no longer in the queue".to_string())
                    })?;
                    let updated = q.update(id, &patch, now)?;
                    let order: Vec<Uuid> = q.entries().iter().map(|e| e.id).collect();
                    Ok((from, updated, order))
                })
            })
            .await?
            .value;

        if updated.status != from {
            self.publish(
                bar_id,
                Payload::SongStatusUpdated {
                    entry_id: id,
                    from,
                    to: updated.status,
                },
            );
        }
        if patch.position.is_some() {
            self.publish(bar_id, Payload::QueueReordered { entry_ids: order });
        }

        Ok(updated)
    }

    pub async fn get_queue(&self, query: &GetQueue) -> Result<QueuePage> {
        self.ensure_bar(&query.bar_id).await?;

        let store = &self.store;
        self.with_retry("get_queue", move || {
            store.page(&query.bar_id, &query.filters, query.page, query.limit)
        })
        .await
    }

    pub async fn currently_playing(&self, bar_id: &str) -> Result<Option<QueueEntry>> {
        self.ensure_bar(bar_id).await?;

        let store = &self.store;
        self.with_retry("currently_playing", move || store.playing(bar_id))
            .await
    }

    pub async fn next_in_queue(&self, bar_id: &str) -> Result<Option<QueueEntry>> {
        self.ensure_bar(bar_id).await?;

        let store = &self.store;
        self.with_retry("next_in_queue", move || store.next_pending(bar_id))
            .await
    }

    pub async fn stats(&self, bar_id: &str) -> Result<QueueStats> {
        self.ensure_bar(bar_id).await?;

        let store = &self.store;
        self.with_retry("stats", move || store.stats(bar_id)).await
    }
}
