#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use bar_queue::{
    api::{command::AddToQueue, service::QueueEngine},
    domain::{
        admission::AddOutcome,
        clock::ManualClock,
        entity::{Bar, BarPolicy, Principal, QueueEntry, Role, Song},
        event::EventNotifier,
    },
    infrastructure::memory::{MemoryQueueStore, MemoryVenues},
};
use chrono::{DateTime, TimeZone, Utc};

pub const BAR: &str = "bar-1";

pub type Engine = QueueEngine<MemoryQueueStore, MemoryVenues>;

pub struct Harness {
    pub engine: Engine,
    pub store: MemoryQueueStore,
    pub venues: MemoryVenues,
    pub clock: ManualClock,
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 21, 0, 0).unwrap()
}

/// One active bar with twenty available songs, no cooldown and three songs
/// per user.
pub fn harness() -> Harness {
    harness_with(BarPolicy {
        max_songs_per_user: 3,
        song_request_cooldown: 0,
        priority_play_cost: 50,
        max_queue_size: None,
        auto_approve: true,
    })
}

pub fn harness_with(policy: BarPolicy) -> Harness {
    let store = MemoryQueueStore::new();
    let venues = MemoryVenues::new();
    venues.add_bar(Bar {
        id: BAR.into(),
        name: "The Anchor".into(),
        is_active: true,
    });
    for n in 1..=20 {
        venues.add_song(Song {
            id: song(n),
            title: format!("Track {}", n),
            artist: "Various".into(),
            is_available: true,
        });
    }
    venues.set_policy(BAR, policy);

    let clock = ManualClock::new(start());
    let engine = QueueEngine::new(
        store.clone(),
        venues.clone(),
        EventNotifier::new(256),
        Arc::new(clock.clone()),
        Duration::from_secs(2),
    );

    Harness {
        engine,
        store,
        venues,
        clock,
    }
}

pub fn song(n: u32) -> String {
    format!("song-{}", n)
}

pub fn staff() -> Principal {
    Principal {
        id: "staff-1".into(),
        role: Role::Staff,
        bar_id: Some(BAR.into()),
    }
}

pub fn patron(id: &str) -> Principal {
    Principal {
        id: id.into(),
        role: Role::Customer,
        bar_id: Some(BAR.into()),
    }
}

pub fn request(user: &str, song: &str, priority_play: bool) -> AddToQueue {
    AddToQueue {
        bar_id: BAR.into(),
        song_id: song.into(),
        user_id: user.into(),
        priority_play,
        points_used: if priority_play { 50 } else { 0 },
    }
}

/// Adds a song as `user` and expects it to be admitted.
pub async fn added(engine: &Engine, user: &str, song: &str, priority_play: bool) -> QueueEntry {
    match engine
        .add(&patron(user), request(user, song, priority_play))
        .await
        .unwrap()
    {
        AddOutcome::Added(entry) => entry,
        AddOutcome::Rejected(denial) => panic!("{} was rejected: {:?}", song, denial),
    }
}
