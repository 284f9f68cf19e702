// Locally remembered commit and reveal deadlines. The chain reports zero right
// after an optimistic update and stale values once a phase rotates; the
// fallback maps paper over both.
use crate::{
    room::{
        Room,
        RoomState,
    },
    storage::{
        KeyValueStore,
        SharedStore,
        write_json,
    },
};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tracing::debug;

pub const DEFAULT_COMMIT_WINDOW_SECS: i64 = 600;
pub const MIN_COMMIT_WINDOW_SECS: i64 = 60;
pub const MAX_COMMIT_WINDOW_SECS: i64 = 86_400;
pub const REVEAL_WINDOW_SECS: i64 = 900;
/// Entries are evicted this many phase durations past their deadline.
pub const EVICTION_MULTIPLIER: i64 = 6;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const COMMIT_KEY: &str = "deadlines/commit";
const REVEAL_KEY: &str = "deadlines/reveal";
const COMMIT_WINDOW_KEY: &str = "deadlines/commit_window";

pub fn clamp_commit_window(secs: i64) -> i64 {
    secs.clamp(MIN_COMMIT_WINDOW_SECS, MAX_COMMIT_WINDOW_SECS)
}

#[derive(Debug, Default)]
struct Fallbacks {
    commit: BTreeMap<u64, i64>,
    reveal: BTreeMap<u64, i64>,
    commit_windows: BTreeMap<u64, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    Commit,
    Reveal,
}

pub struct DeadlineTracker {
    store: SharedStore,
    maps: Mutex<Fallbacks>,
}

impl DeadlineTracker {
    /// Load persisted fallbacks; malformed entries are dropped.
    pub fn load(store: SharedStore) -> crate::Result<Self> {
        let maps = Fallbacks {
            commit: read_pairs(store.as_ref(), COMMIT_KEY)?,
            reveal: read_pairs(store.as_ref(), REVEAL_KEY)?,
            commit_windows: read_pairs(store.as_ref(), COMMIT_WINDOW_KEY)?,
        };
        Ok(Self {
            store,
            maps: Mutex::new(maps),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Fallbacks> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `deadline` when it is positive and later than the current entry.
    pub fn remember(
        &self,
        kind: DeadlineKind,
        room_id: u64,
        deadline: i64,
    ) -> crate::Result<bool> {
        if deadline <= 0 {
            return Ok(false);
        }
        let mut maps = self.lock();
        let map = match kind {
            DeadlineKind::Commit => &mut maps.commit,
            DeadlineKind::Reveal => &mut maps.reveal,
        };
        if map.get(&room_id).is_some_and(|current| *current >= deadline) {
            return Ok(false);
        }
        map.insert(room_id, deadline);
        self.persist(&maps, kind)?;
        Ok(true)
    }

    pub fn remember_commit(&self, room_id: u64, deadline: i64) -> crate::Result<bool> {
        self.remember(DeadlineKind::Commit, room_id, deadline)
    }

    pub fn remember_reveal(&self, room_id: u64, deadline: i64) -> crate::Result<bool> {
        self.remember(DeadlineKind::Reveal, room_id, deadline)
    }

    pub fn commit_fallback(&self, room_id: u64) -> Option<i64> {
        self.lock().commit.get(&room_id).copied()
    }

    pub fn reveal_fallback(&self, room_id: u64) -> Option<i64> {
        self.lock().reveal.get(&room_id).copied()
    }

    /// Remember the commit window a room was created with, clamped to the
    /// contract's accepted range.
    pub fn remember_commit_window(&self, room_id: u64, secs: i64) -> crate::Result<()> {
        if secs <= 0 {
            return Ok(());
        }
        let mut maps = self.lock();
        maps.commit_windows.insert(room_id, clamp_commit_window(secs));
        write_json(
            self.store.as_ref(),
            COMMIT_WINDOW_KEY,
            &pairs(&maps.commit_windows),
        )
    }

    pub fn commit_window(&self, room_id: u64) -> i64 {
        self.lock()
            .commit_windows
            .get(&room_id)
            .copied()
            .unwrap_or(DEFAULT_COMMIT_WINDOW_SECS)
    }

    /// Merge live deadlines with the fallbacks. Fresher live values are
    /// remembered first, so a later on-chain deadline always wins.
    pub fn enhance_room_deadlines(&self, room: &Room) -> crate::Result<Room> {
        let mut view = room.clone();

        if room.commit_deadline > 0 {
            self.remember_commit(room.id, room.commit_deadline)?;
        }
        if let Some(fallback) = self.commit_fallback(room.id) {
            let first_window = room.state == RoomState::Wait && !room.has_opponent();
            if fallback > room.commit_deadline
                || room.state == RoomState::Committing
                || first_window
            {
                view.commit_deadline = fallback;
            }
        }

        if room.reveal_deadline > 0 {
            self.remember_reveal(room.id, room.reveal_deadline)?;
        } else if let Some(fallback) = self.reveal_fallback(room.id) {
            view.reveal_deadline = fallback;
        }

        Ok(view)
    }

    /// Drop entries six phase durations past their deadline. Returns how many
    /// entries were evicted.
    pub fn sweep(&self, now: i64) -> crate::Result<usize> {
        let mut maps = self.lock();
        let Fallbacks {
            commit,
            reveal,
            commit_windows,
        } = &mut *maps;

        let commit_before = commit.len();
        commit.retain(|room_id, deadline| {
            let window = commit_windows
                .get(room_id)
                .copied()
                .unwrap_or(DEFAULT_COMMIT_WINDOW_SECS);
            now < deadline.saturating_add(window.saturating_mul(EVICTION_MULTIPLIER))
        });
        let commit_evicted = commit_before - commit.len();
        commit_windows.retain(|room_id, _| commit.contains_key(room_id));

        let reveal_before = reveal.len();
        reveal.retain(|_, deadline| {
            now < deadline.saturating_add(REVEAL_WINDOW_SECS.saturating_mul(EVICTION_MULTIPLIER))
        });
        let reveal_evicted = reveal_before - reveal.len();

        if commit_evicted > 0 {
            self.persist(&maps, DeadlineKind::Commit)?;
            write_json(
                self.store.as_ref(),
                COMMIT_WINDOW_KEY,
                &pairs(&maps.commit_windows),
            )?;
        }
        if reveal_evicted > 0 {
            self.persist(&maps, DeadlineKind::Reveal)?;
        }
        let evicted = commit_evicted + reveal_evicted;
        if evicted > 0 {
            debug!(commit_evicted, reveal_evicted, "evicted stale deadline fallbacks");
        }
        Ok(evicted)
    }

    pub fn clear(&self) -> crate::Result<()> {
        let mut maps = self.lock();
        *maps = Fallbacks::default();
        self.store.remove(COMMIT_KEY)?;
        self.store.remove(REVEAL_KEY)?;
        self.store.remove(COMMIT_WINDOW_KEY)?;
        Ok(())
    }

    fn persist(&self, maps: &Fallbacks, kind: DeadlineKind) -> crate::Result<()> {
        match kind {
            DeadlineKind::Commit => {
                write_json(self.store.as_ref(), COMMIT_KEY, &pairs(&maps.commit))
            }
            DeadlineKind::Reveal => {
                write_json(self.store.as_ref(), REVEAL_KEY, &pairs(&maps.reveal))
            }
        }
    }
}

fn pairs(map: &BTreeMap<u64, i64>) -> Vec<(u64, i64)> {
    map.iter().map(|(k, v)| (*k, *v)).collect()
}

/// Accepts `[[id, deadline], ...]` or `{"id": deadline}`; anything else is
/// skipped.
fn read_pairs(store: &dyn KeyValueStore, key: &str) -> crate::Result<BTreeMap<u64, i64>> {
    let Some(bytes) = store.get(key)? else {
        return Ok(BTreeMap::new());
    };
    let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
        debug!(key, "dropping unreadable deadline map");
        return Ok(BTreeMap::new());
    };
    let entries: Vec<(Option<u64>, Option<i64>)> = match value {
        Value::Array(items) => items
            .iter()
            .map(|item| (item.get(0).and_then(Value::as_u64), item.get(1).and_then(Value::as_i64)))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(id, deadline)| (id.parse().ok(), deadline.as_i64()))
            .collect(),
        _ => Vec::new(),
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| match entry {
            (Some(id), Some(deadline)) if id > 0 && deadline > 0 => Some((id, deadline)),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::{
        storage::{
            InMemoryStore,
            read_json,
        },
        test_helpers::RoomBuilder,
    };
    use std::sync::Arc;

    fn tracker() -> (DeadlineTracker, InMemoryStore) {
        let store = InMemoryStore::new();
        let tracker = DeadlineTracker::load(Arc::new(store.clone())).unwrap();
        (tracker, store)
    }

    #[test]
    fn enhance__zero_live_commit_deadline__reports_fallback() {
        // given
        let (tracker, _) = tracker();
        tracker.remember_commit(7, 1_000).unwrap();
        let room = RoomBuilder::new(7).committing().commit_deadline(0).build();

        // when
        let view = tracker.enhance_room_deadlines(&room).unwrap();

        // then
        assert_eq!(view.commit_deadline, 1_000);
    }

    #[test]
    fn enhance__later_live_commit_deadline__wins_and_overwrites_fallback() {
        // given
        let (tracker, store) = tracker();
        tracker.remember_commit(7, 1_000).unwrap();
        let room = RoomBuilder::new(7).committing().commit_deadline(1_500).build();

        // when
        let view = tracker.enhance_room_deadlines(&room).unwrap();

        // then
        assert_eq!(view.commit_deadline, 1_500);
        assert_eq!(tracker.commit_fallback(7), Some(1_500));
        let persisted: Vec<(u64, i64)> = read_json(&store, COMMIT_KEY).unwrap().unwrap();
        assert_eq!(persisted, vec![(7, 1_500)]);
    }

    #[test]
    fn enhance__revealing_room_with_smaller_fallback__keeps_live_commit_deadline() {
        let (tracker, _) = tracker();
        tracker.remember_commit(7, 900).unwrap();
        let room = RoomBuilder::new(7)
            .revealing()
            .commit_deadline(1_000)
            .reveal_deadline(2_000)
            .build();

        let view = tracker.enhance_room_deadlines(&room).unwrap();

        assert_eq!(view.commit_deadline, 1_000);
        assert_eq!(view.reveal_deadline, 2_000);
    }

    #[test]
    fn enhance__positive_live_reveal_deadline__is_never_replaced() {
        let (tracker, _) = tracker();
        tracker.remember_reveal(7, 5_000).unwrap();
        let room = RoomBuilder::new(7).revealing().reveal_deadline(3_000).build();

        let view = tracker.enhance_room_deadlines(&room).unwrap();

        assert_eq!(view.reveal_deadline, 3_000);
        assert_eq!(tracker.reveal_fallback(7), Some(5_000));
    }

    #[test]
    fn enhance__zero_live_reveal_deadline__uses_fallback() {
        let (tracker, _) = tracker();
        tracker.remember_reveal(7, 5_000).unwrap();
        let room = RoomBuilder::new(7).revealing().reveal_deadline(0).build();

        let view = tracker.enhance_room_deadlines(&room).unwrap();

        assert_eq!(view.reveal_deadline, 5_000);
    }

    #[test]
    fn remember__earlier_or_non_positive_deadline__is_ignored() {
        let (tracker, _) = tracker();

        assert!(tracker.remember_commit(3, 2_000).unwrap());
        assert!(!tracker.remember_commit(3, 1_000).unwrap());
        assert!(!tracker.remember_commit(3, 2_000).unwrap());
        assert!(!tracker.remember_commit(4, 0).unwrap());

        assert_eq!(tracker.commit_fallback(3), Some(2_000));
        assert_eq!(tracker.commit_fallback(4), None);
    }

    #[test]
    fn sweep__evicts_after_six_phase_durations() {
        // given
        let (tracker, _) = tracker();
        tracker.remember_commit(1, 1_000).unwrap();
        tracker.remember_commit(2, 1_000).unwrap();
        tracker.remember_commit_window(2, 60).unwrap();
        tracker.remember_reveal(3, 1_000).unwrap();

        // when
        let early = tracker.sweep(1_000 + 60 * 6 - 1).unwrap();
        let evicted_short_window = tracker.sweep(1_000 + 60 * 6).unwrap();
        let evicted_default_window = tracker.sweep(1_000 + 600 * 6).unwrap();
        let evicted_reveal = tracker.sweep(1_000 + 900 * 6).unwrap();

        // then
        assert_eq!(early, 0);
        assert_eq!(evicted_short_window, 1);
        assert_eq!(tracker.commit_fallback(2), None);
        assert_eq!(evicted_default_window, 1);
        assert_eq!(tracker.commit_fallback(1), None);
        assert_eq!(evicted_reveal, 1);
        assert_eq!(tracker.reveal_fallback(3), None);
    }

    #[test]
    fn sweep__deadline_near_max__is_kept_without_overflow() {
        let (tracker, _) = tracker();
        tracker.remember_commit(1, i64::MAX - 10).unwrap();
        tracker.remember_reveal(2, i64::MAX - 10).unwrap();

        let evicted = tracker.sweep(1_000).unwrap();

        assert_eq!(evicted, 0);
        assert_eq!(tracker.commit_fallback(1), Some(i64::MAX - 10));
        assert_eq!(tracker.reveal_fallback(2), Some(i64::MAX - 10));
    }

    #[test]
    fn load__malformed_entries__are_dropped() {
        // given
        let store = InMemoryStore::new();
        store
            .put(COMMIT_KEY, br#"[[7, 1000], ["x", 5], [8], [9, -4]]"#)
            .unwrap();
        store.put(REVEAL_KEY, br#"{"12": 3000, "nope": 1}"#).unwrap();

        // when
        let tracker = DeadlineTracker::load(Arc::new(store)).unwrap();

        // then
        assert_eq!(tracker.commit_fallback(7), Some(1_000));
        assert_eq!(tracker.commit_fallback(9), None);
        assert_eq!(tracker.reveal_fallback(12), Some(3_000));
    }

    #[test]
    fn commit_window__is_clamped_and_defaults() {
        let (tracker, _) = tracker();
        tracker.remember_commit_window(5, 10).unwrap();
        tracker.remember_commit_window(6, 100_000).unwrap();

        assert_eq!(tracker.commit_window(5), 60);
        assert_eq!(tracker.commit_window(6), 86_400);
        assert_eq!(tracker.commit_window(7), 600);
    }
}
