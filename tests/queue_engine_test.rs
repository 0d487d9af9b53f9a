mod common;

use bar_queue::{
    api::command::{ClearQueue, GetQueue, ReorderQueue, UpdateQueueEntry},
    domain::{
        admission::{AddOutcome, DenialCode},
        entity::{Bar, BarPolicy, EntryStatus},
        error::QueueError,
        event::Payload,
        queue::{invariants_hold, ClearFilter},
        repository::QueueFilter,
    },
};
use chrono::Duration;
use common::*;

fn songs(ns: &[u32]) -> Vec<String> {
    ns.iter().map(|n| song(*n)).collect()
}

async fn pending_songs(engine: &Engine) -> Vec<String> {
    let mut query = GetQueue::new(BAR);
    query.filters.status = Some(EntryStatus::Pending);
    engine
        .get_queue(&query)
        .await
        .unwrap()
        .entries
        .into_iter()
        .map(|e| e.song_id)
        .collect()
}

#[tokio::test]
async fn priority_requests_form_a_fifo_block_at_the_front() {
    let h = harness();

    added(&h.engine, "alice", &song(1), false).await;
    h.clock.advance(Duration::seconds(1));
    added(&h.engine, "bob", &song(2), true).await;
    assert_eq!(pending_songs(&h.engine).await, songs(&[2, 1]));

    h.clock.advance(Duration::seconds(1));
    added(&h.engine, "carol", &song(3), true).await;
    assert_eq!(pending_songs(&h.engine).await, songs(&[2, 3, 1]));

    h.clock.advance(Duration::seconds(1));
    let d = added(&h.engine, "dave", &song(4), false).await;
    assert_eq!(pending_songs(&h.engine).await, songs(&[2, 3, 1, 4]));
    assert_eq!(d.position, 4);

    assert!(invariants_hold(&h.store.rows(BAR).await));
}

#[tokio::test]
async fn cooldown_rejects_until_it_elapses() {
    let h = harness_with(BarPolicy {
        song_request_cooldown: 30,
        ..BarPolicy::default()
    });

    added(&h.engine, "alice", &song(1), false).await;

    h.clock.advance(Duration::seconds(10));
    match h
        .engine
        .add(&patron("alice"), request("alice", &song(2), false))
        .await
        .unwrap()
    {
        AddOutcome::Rejected(denial) => {
            assert_eq!(denial.code, DenialCode::Cooldown);
            assert_eq!(denial.remaining_secs, Some(20));
        }
        AddOutcome::Added(_) => panic!("cooldown ignored"),
    }

    h.clock.advance(Duration::seconds(21));
    added(&h.engine, "alice", &song(2), false).await;
}

#[tokio::test]
async fn fourth_song_hits_the_user_limit_without_mutating() {
    let h = harness();
    for n in 1..=3 {
        added(&h.engine, "alice", &song(n), false).await;
    }
    let before = h.store.rows(BAR).await;

    match h
        .engine
        .add(&patron("alice"), request("alice", &song(4), false))
        .await
        .unwrap()
    {
        AddOutcome::Rejected(denial) => {
            assert_eq!(denial.code, DenialCode::UserLimitReached);
            assert!(denial.reason.contains("limit reached"));
        }
        AddOutcome::Added(_) => panic!("limit ignored"),
    }

    assert_eq!(h.store.rows(BAR).await, before);
}

#[tokio::test]
async fn skip_advances_and_reports_both_entries() {
    let h = harness();
    let s1 = added(&h.engine, "alice", &song(1), false).await;
    let s2 = added(&h.engine, "bob", &song(2), false).await;
    added(&h.engine, "carol", &song(3), false).await;

    let started = h.engine.play_next(&staff(), BAR).await.unwrap();
    assert!(started.previous.is_none());
    assert_eq!(started.current.unwrap().id, s1.id);

    let transition = h.engine.skip(&staff(), BAR).await.unwrap();
    let previous = transition.previous.unwrap();
    let current = transition.current.unwrap();
    assert_eq!(previous.id, s1.id);
    assert_eq!(previous.status, EntryStatus::Skipped);
    assert_eq!(current.id, s2.id);
    assert_eq!(current.status, EntryStatus::Playing);
    assert_eq!(pending_songs(&h.engine).await, songs(&[3]));

    let playing = h.engine.currently_playing(BAR).await.unwrap().unwrap();
    assert_eq!(playing.id, s2.id);
    assert_eq!(playing.position, 1);
    let upcoming = h.engine.next_in_queue(BAR).await.unwrap().unwrap();
    assert_eq!(upcoming.song_id, song(3));
}

#[tokio::test]
async fn play_next_on_an_empty_queue_goes_idle() {
    let h = harness();
    added(&h.engine, "alice", &song(1), false).await;

    h.engine.play_next(&staff(), BAR).await.unwrap();
    let transition = h.engine.play_next(&staff(), BAR).await.unwrap();

    let previous = transition.previous.unwrap();
    assert_eq!(previous.status, EntryStatus::Played);
    assert_eq!(previous.played_at, Some(start()));
    assert!(transition.current.is_none());
    assert!(h.engine.currently_playing(BAR).await.unwrap().is_none());
}

#[tokio::test]
async fn add_then_remove_round_trip() {
    let h = harness();
    added(&h.engine, "alice", &song(1), false).await;
    let entry = added(&h.engine, "bob", &song(2), false).await;

    let page = h.engine.get_queue(&GetQueue::new(BAR)).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.entries[1].id, entry.id);
    assert_eq!(page.entries[1].position, 2);

    let err = h.engine.remove(&patron("alice"), entry.id).await.unwrap_err();
    assert!(matches!(err, QueueError::Forbidden(_)));

    h.engine.remove(&patron("bob"), entry.id).await.unwrap();
    let page = h.engine.get_queue(&GetQueue::new(BAR)).await.unwrap();
    assert!(page.entries.iter().all(|e| e.id != entry.id));

    let err = h.engine.remove(&staff(), entry.id).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
}

#[tokio::test]
async fn requester_cannot_remove_a_song_once_it_plays() {
    let h = harness();
    let entry = added(&h.engine, "alice", &song(1), false).await;
    h.engine.play_next(&staff(), BAR).await.unwrap();

    let err = h.engine.remove(&patron("alice"), entry.id).await.unwrap_err();
    assert!(matches!(err, QueueError::Forbidden(_)));

    h.engine.remove(&staff(), entry.id).await.unwrap();
    assert!(h.engine.currently_playing(BAR).await.unwrap().is_none());
}

#[tokio::test]
async fn repeated_reads_are_identical() {
    let h = harness();
    for (user, n, priority) in [("a", 1, false), ("b", 2, true), ("c", 3, false)] {
        added(&h.engine, user, &song(n), priority).await;
    }
    h.engine.play_next(&staff(), BAR).await.unwrap();

    let first = h.engine.get_queue(&GetQueue::new(BAR)).await.unwrap();
    let second = h.engine.get_queue(&GetQueue::new(BAR)).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn get_queue_filters_and_pages() {
    let h = harness();
    for n in 1..=3 {
        added(&h.engine, "alice", &song(n), false).await;
        h.clock.advance(Duration::minutes(1));
    }
    for n in 4..=5 {
        added(&h.engine, "bob", &song(n), false).await;
    }

    let mut query = GetQueue::new(BAR);
    query.filters = QueueFilter {
        user_id: Some("alice".into()),
        ..QueueFilter::default()
    };
    query.limit = 2;
    let page = h.engine.get_queue(&query).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.entries.len(), 2);

    query.page = 2;
    let page = h.engine.get_queue(&query).await.unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].song_id, song(3));

    let mut recent = GetQueue::new(BAR);
    recent.filters.date_from = Some(start() + Duration::minutes(2));
    let page = h.engine.get_queue(&recent).await.unwrap();
    assert_eq!(page.total, 3);
}

#[tokio::test]
async fn unknown_bar_and_song_are_not_found() {
    let h = harness();

    let mut cmd = request("alice", &song(1), false);
    cmd.bar_id = "nowhere".into();
    let err = h.engine.add(&patron("alice"), cmd).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));

    let err = h
        .engine
        .add(&patron("alice"), request("alice", "no-such-song", false))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));

    let err = h.engine.play_next(&staff(), "nowhere").await;
    assert!(err.is_err());
}

#[tokio::test]
async fn closed_bar_denies_requests() {
    let h = harness();
    h.venues.add_bar(Bar {
        id: BAR.into(),
        name: "The Anchor".into(),
        is_active: false,
    });

    match h
        .engine
        .add(&patron("alice"), request("alice", &song(1), false))
        .await
        .unwrap()
    {
        AddOutcome::Rejected(denial) => assert_eq!(denial.code, DenialCode::BarInactive),
        AddOutcome::Added(_) => panic!("closed bar accepted a request"),
    }
}

#[tokio::test]
async fn patrons_cannot_request_for_others_or_manage() {
    let h = harness();

    let err = h
        .engine
        .add(&patron("mallory"), request("alice", &song(1), false))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Forbidden(_)));

    let err = h.engine.skip(&patron("alice"), BAR).await.unwrap_err();
    assert!(matches!(err, QueueError::Forbidden(_)));

    let clear = ClearQueue {
        bar_id: BAR.into(),
        status_filter: ClearFilter::NonPlaying,
    };
    let err = h.engine.clear(&patron("alice"), clear).await.unwrap_err();
    assert!(matches!(err, QueueError::Forbidden(_)));
}

#[tokio::test]
async fn reorder_rewrites_positions() {
    let h = harness();
    let a = added(&h.engine, "a", &song(1), false).await;
    let b = added(&h.engine, "b", &song(2), false).await;
    let c = added(&h.engine, "c", &song(3), false).await;

    let stale = ReorderQueue {
        bar_id: BAR.into(),
        ordered_ids: vec![c.id, a.id],
    };
    let err = h.engine.reorder(&staff(), stale).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    let cmd = ReorderQueue {
        bar_id: BAR.into(),
        ordered_ids: vec![c.id, a.id, b.id],
    };
    let err = h.engine.reorder(&patron("a"), cmd.clone()).await.unwrap_err();
    assert!(matches!(err, QueueError::Forbidden(_)));

    h.engine.reorder(&staff(), cmd).await.unwrap();
    assert_eq!(pending_songs(&h.engine).await, songs(&[3, 1, 2]));
    assert!(invariants_hold(&h.store.rows(BAR).await));
}

#[tokio::test]
async fn clear_keeps_the_playing_song() {
    let h = harness();
    for (user, n) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
        added(&h.engine, user, &song(n), false).await;
    }
    h.engine.play_next(&staff(), BAR).await.unwrap();
    h.engine.play_next(&staff(), BAR).await.unwrap();

    let cleared = h
        .engine
        .clear(
            &staff(),
            ClearQueue {
                bar_id: BAR.into(),
                status_filter: ClearFilter::NonPlaying,
            },
        )
        .await
        .unwrap();

    // Song 1 (played) and songs 3 and 4 (pending) go, song 2 keeps playing.
    assert_eq!(cleared, 3);
    let rows = h.store.rows(BAR).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].song_id, song(2));
    assert_eq!(rows[0].position, 1);
}

#[tokio::test]
async fn reject_and_update_follow_the_state_machine() {
    let h = harness();
    let a = added(&h.engine, "a", &song(1), false).await;
    let b = added(&h.engine, "b", &song(2), false).await;
    let c = added(&h.engine, "c", &song(3), false).await;

    let rejected = h.engine.reject(&staff(), b.id).await.unwrap();
    assert_eq!(rejected.status, EntryStatus::Rejected);
    assert_eq!(pending_songs(&h.engine).await, songs(&[1, 3]));

    let err = h.engine.reject(&staff(), b.id).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    let moved = h
        .engine
        .update(
            &staff(),
            UpdateQueueEntry {
                id: c.id,
                status: None,
                position: Some(1),
                played_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.position, 1);
    assert_eq!(pending_songs(&h.engine).await, songs(&[3, 1]));

    let err = h
        .engine
        .update(
            &staff(),
            UpdateQueueEntry {
                id: a.id,
                status: Some(EntryStatus::Played),
                position: None,
                played_at: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    let stats = h.engine.stats(BAR).await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.rejected, 1);
}

#[tokio::test]
async fn events_follow_committed_changes() {
    let h = harness();
    let mut events = h.engine.notifier().subscribe();

    let entry = added(&h.engine, "alice", &song(1), false).await;
    h.engine.play_next(&staff(), BAR).await.unwrap();

    let mut payloads = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.header.bar_id, BAR);
        assert_eq!(event.header.emitted_at, start());
        payloads.push(event.payload);
    }

    assert_eq!(
        payloads[0],
        Payload::SongAdded {
            entry: entry.clone()
        }
    );
    assert_eq!(
        payloads[1],
        Payload::SongStatusUpdated {
            entry_id: entry.id,
            from: EntryStatus::Pending,
            to: EntryStatus::Playing,
        }
    );
    match &payloads[2] {
        Payload::PlayNextSong { next: Some(next) } => assert_eq!(next.id, entry.id),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(payloads.len(), 3);
}

#[tokio::test]
async fn denied_requests_emit_nothing() {
    let h = harness_with(BarPolicy {
        max_songs_per_user: 0,
        ..BarPolicy::default()
    });
    let mut events = h.engine.notifier().subscribe();

    let outcome = h
        .engine
        .add(&patron("alice"), request("alice", &song(1), false))
        .await
        .unwrap();
    assert!(matches!(outcome, AddOutcome::Rejected(_)));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn contention_is_retried_once() {
    let h = harness();

    h.store.inject_transient_failures(1);
    added(&h.engine, "alice", &song(1), false).await;

    h.store.inject_transient_failures(2);
    let err = h
        .engine
        .add(&patron("bob"), request("bob", &song(2), false))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.store.rows(BAR).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_from_one_user_respect_the_limit() {
    let h = harness();

    let attempts: Vec<_> = (1..=8)
        .map(|n| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .add(&patron("alice"), request("alice", &song(n), false))
                    .await
            })
        })
        .collect();

    let mut admitted = 0;
    for outcome in futures::future::join_all(attempts).await {
        if let AddOutcome::Added(_) = outcome.unwrap().unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 3);

    let rows = h.store.rows(BAR).await;
    assert_eq!(rows.len(), 3);
    assert!(invariants_hold(&rows));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advances_keep_one_song_playing() {
    let h = harness_with(BarPolicy {
        max_songs_per_user: 20,
        song_request_cooldown: 0,
        ..BarPolicy::default()
    });
    for n in 1..=12 {
        added(&h.engine, "alice", &song(n), n % 3 == 0).await;
    }

    let advances: Vec<_> = (0..10)
        .map(|i| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    engine.play_next(&staff(), BAR).await
                } else {
                    engine.skip(&staff(), BAR).await
                }
            })
        })
        .collect();
    for result in futures::future::join_all(advances).await {
        result.unwrap().unwrap();
    }

    let rows = h.store.rows(BAR).await;
    let active: Vec<_> = rows.iter().filter(|e| e.is_active()).cloned().collect();
    assert!(invariants_hold(&active));
    // The first advance only starts a song, the other nine retire one each.
    assert_eq!(active.len(), 3);
    assert_eq!(active.iter().filter(|e| e.is_playing()).count(), 1);
    assert_eq!(rows.iter().filter(|e| e.status.is_terminal()).count(), 9);
}

#[tokio::test]
async fn promoted_song_keeps_priority_requests_ahead_of_the_rest() {
    let h = harness();
    added(&h.engine, "a", &song(1), false).await;
    added(&h.engine, "b", &song(2), false).await;
    let c = added(&h.engine, "c", &song(3), false).await;

    let promoted = h
        .engine
        .update(
            &staff(),
            UpdateQueueEntry {
                id: c.id,
                status: Some(EntryStatus::Playing),
                position: None,
                played_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(promoted.position, 1);

    let p = added(&h.engine, "p", &song(4), true).await;
    assert_eq!(p.position, 2);

    let transition = h.engine.play_next(&staff(), BAR).await.unwrap();
    assert_eq!(transition.previous.unwrap().id, c.id);
    assert_eq!(transition.current.unwrap().id, p.id);
    assert_eq!(pending_songs(&h.engine).await, songs(&[1, 2]));
    assert!(invariants_hold(&h.store.rows(BAR).await));
}
