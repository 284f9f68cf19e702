// Snapshot of every room the session cares about. Fresh polls are merged over
// the cached view, which survives restarts under `rooms/cache_v1`.
use crate::{
    events::LogEvent,
    outcome::room_is_finalized,
    room::{
        ForfeitRecord,
        Room,
        RoomState,
    },
    storage::{
        SharedStore,
        read_json,
        write_json,
    },
};
use alloy_primitives::Address;
use itertools::Itertools;
use serde_json::Value;
use std::{
    cmp::Reverse,
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tracing::{
    debug,
    warn,
};

pub const ROOM_CACHE_CAP: usize = 48;
/// How many of the newest room ids are always polled.
pub const LATEST_ROOM_WINDOW: u64 = 24;
pub const JOINED_HISTORY_LIMIT: usize = 12;
pub const FORFEIT_FETCH_COOLDOWN: Duration = Duration::from_secs(25);
/// Pause between two rooms' forfeit scans.
pub const FORFEIT_FETCH_DELAY: Duration = Duration::from_millis(120);

const CACHE_KEY: &str = "rooms/cache_v1";

/// Still worth polling: not finalized and not in a terminal state.
pub fn is_active(room: &Room) -> bool {
    !room.state.is_terminal() && !room_is_finalized(room)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ForfeitFetch {
    last_attempt_ms: i64,
    settled: bool,
}

#[derive(Default)]
struct AggregatorState {
    rooms: BTreeMap<u64, Room>,
    forfeits: HashMap<u64, ForfeitRecord>,
    fetches: HashMap<u64, ForfeitFetch>,
}

pub struct RoomAggregator {
    store: SharedStore,
    state: Mutex<AggregatorState>,
}

impl RoomAggregator {
    /// Revive the cached rooms, dropping entries that no longer parse.
    pub fn load(store: SharedStore) -> crate::Result<Self> {
        let raw: Vec<Value> = match read_json(store.as_ref(), CACHE_KEY) {
            Ok(raw) => raw.unwrap_or_default(),
            Err(err) => {
                warn!(?err, "dropping unreadable room cache");
                store.remove(CACHE_KEY)?;
                Vec::new()
            }
        };
        let total = raw.len();
        let rooms: BTreeMap<u64, Room> = raw
            .into_iter()
            .filter_map(|value| serde_json::from_value::<Room>(value).ok())
            .filter(|room| !room.is_empty_slot())
            .map(|room| (room.id, room))
            .collect();
        let forfeits = rooms
            .values()
            .filter_map(|room| room.forfeit.clone().map(|record| (room.id, record)))
            .collect();
        let aggregator = Self {
            store,
            state: Mutex::new(AggregatorState {
                rooms,
                forfeits,
                fetches: HashMap::new(),
            }),
        };
        let state = aggregator.lock();
        if state.rooms.len() != total {
            debug!(kept = state.rooms.len(), total, "rewriting room cache without malformed entries");
            aggregator.persist(&state)?;
        }
        drop(state);
        Ok(aggregator)
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached rooms, newest first.
    pub fn rooms(&self) -> Vec<Room> {
        self.lock().rooms.values().rev().cloned().collect()
    }

    pub fn room(&self, room_id: u64) -> Option<Room> {
        self.lock().rooms.get(&room_id).cloned()
    }

    /// Merge one poll over the cache and return the new snapshot, newest first.
    pub fn merge_poll(&self, fresh: Vec<Room>) -> crate::Result<Vec<Room>> {
        let mut state = self.lock();
        let mut merged: BTreeMap<u64, Room> = BTreeMap::new();
        for mut room in fresh.into_iter().filter(|room| !room.is_empty_slot()) {
            if let Some(record) = state.forfeits.get(&room.id) {
                room.forfeit = Some(record.clone());
            }
            merged.insert(room.id, room);
        }
        for (id, cached) in &state.rooms {
            if !merged.contains_key(id) && is_active(cached) {
                merged.insert(*id, cached.clone());
            }
        }

        let seen: Vec<u64> = merged.keys().chain(state.rooms.keys()).copied().collect();
        let snapshot = cap_rooms(merged.into_values().collect());
        for id in seen {
            if !snapshot.iter().any(|room| room.id == id) {
                state.forfeits.remove(&id);
                state.fetches.remove(&id);
            }
        }
        let changed = snapshot.len() != state.rooms.len()
            || snapshot
                .iter()
                .any(|room| state.rooms.get(&room.id) != Some(room));
        if changed {
            state.rooms = snapshot.iter().map(|room| (room.id, room.clone())).collect();
            self.persist(&state)?;
        }
        Ok(snapshot)
    }

    /// Swap in a single freshly read room.
    pub fn replace_room(&self, mut room: Room) -> crate::Result<()> {
        if room.is_empty_slot() {
            return Ok(());
        }
        let mut state = self.lock();
        if let Some(record) = state.forfeits.get(&room.id) {
            room.forfeit = Some(record.clone());
        }
        if state.rooms.get(&room.id) == Some(&room) {
            return Ok(());
        }
        state.rooms.insert(room.id, room);
        self.persist(&state)
    }

    /// Room ids to read this cycle: the newest window below `next_room_id`,
    /// the `extra` ids and every cached active room. Active ids come first and
    /// are never dropped by the cap.
    pub fn tracked_room_ids(&self, next_room_id: u64, extra: &[u64]) -> Vec<u64> {
        let state = self.lock();
        let newest = next_room_id.saturating_sub(LATEST_ROOM_WINDOW).max(1)..next_room_id;
        let (active, idle): (Vec<u64>, Vec<u64>) = newest
            .chain(extra.iter().copied())
            .chain(
                state
                    .rooms
                    .values()
                    .filter(|room| is_active(room))
                    .map(|room| room.id),
            )
            .filter(|id| *id > 0)
            .unique()
            .sorted_by_key(|id| Reverse(*id))
            .partition(|id| state.rooms.get(id).is_none_or(is_active));
        let room_for_idle = ROOM_CACHE_CAP.saturating_sub(active.len());
        active
            .into_iter()
            .chain(idle.into_iter().take(room_for_idle))
            .collect()
    }

    /// Reduce an inbound event into the cache. Returns whether the cached view
    /// changed; the caller re-reads the room either way.
    pub fn apply_event(&self, event: &LogEvent) -> crate::Result<bool> {
        match event {
            LogEvent::RoomCreated {
                room_id,
                creator,
                stake,
            } => {
                let mut state = self.lock();
                if state.rooms.contains_key(room_id) {
                    return Ok(false);
                }
                state
                    .rooms
                    .insert(*room_id, Room::created(*room_id, *creator, *stake));
                self.persist(&state)?;
                Ok(true)
            }
            LogEvent::Joined { room_id, opponent } => {
                let mut state = self.lock();
                let Some(room) = state.rooms.get_mut(room_id) else {
                    return Ok(false);
                };
                if room.state != RoomState::Wait || room.has_opponent() {
                    return Ok(false);
                }
                room.opponent = *opponent;
                room.state = RoomState::Committing;
                self.persist(&state)?;
                Ok(true)
            }
            LogEvent::Committed { .. } | LogEvent::Revealed { .. } => Ok(false),
            LogEvent::Forfeited { room_id, record } => {
                self.record_forfeit(*room_id, record)?;
                Ok(true)
            }
        }
    }

    /// Merge `incoming` field by field over what is known for the room.
    pub fn record_forfeit(
        &self,
        room_id: u64,
        incoming: &ForfeitRecord,
    ) -> crate::Result<ForfeitRecord> {
        let mut state = self.lock();
        let merged = state
            .forfeits
            .get(&room_id)
            .map(|current| current.merged_with(incoming))
            .unwrap_or_else(|| incoming.clone());
        state.forfeits.insert(room_id, merged.clone());
        state.fetches.entry(room_id).or_default().settled = true;
        if let Some(room) = state.rooms.get_mut(&room_id) {
            room.forfeit = Some(merged.clone());
        }
        self.persist(&state)?;
        Ok(merged)
    }

    pub fn forfeit(&self, room_id: u64) -> Option<ForfeitRecord> {
        self.lock().forfeits.get(&room_id).cloned()
    }

    /// Finished rooms that may hide a forfeit: no record yet, not settled and
    /// not scanned within the cooldown. Rooms decided by two reveals never
    /// qualify.
    pub fn forfeit_candidates(&self, now_ms: i64) -> Vec<u64> {
        let state = self.lock();
        let cooldown = FORFEIT_FETCH_COOLDOWN.as_millis() as i64;
        state
            .rooms
            .values()
            .rev()
            .filter(|room| room.state == RoomState::Finished)
            .filter(|room| room.reveal_a.is_none() || room.reveal_b.is_none())
            .filter(|room| !state.forfeits.contains_key(&room.id))
            .filter(|room| match state.fetches.get(&room.id) {
                None => true,
                Some(fetch) => !fetch.settled && now_ms - fetch.last_attempt_ms >= cooldown,
            })
            .map(|room| room.id)
            .collect()
    }

    /// Note a scan attempt. `settled` rooms are never scanned again.
    pub fn mark_forfeit_attempt(&self, room_id: u64, now_ms: i64, settled: bool) {
        self.lock().fetches.insert(room_id, ForfeitFetch {
            last_attempt_ms: now_ms,
            settled,
        });
    }

    pub fn remember_joined(&self, address: &Address, room_id: u64) -> crate::Result<Vec<u64>> {
        let key = joined_key(address);
        let history: Vec<u64> = read_json(self.store.as_ref(), &key)
            .unwrap_or_default()
            .unwrap_or_default();
        let history: Vec<u64> = std::iter::once(room_id)
            .chain(history)
            .filter(|id| *id > 0)
            .unique()
            .take(JOINED_HISTORY_LIMIT)
            .collect();
        write_json(self.store.as_ref(), &key, &history)?;
        Ok(history)
    }

    /// Most recent first.
    pub fn joined_rooms(&self, address: &Address) -> Vec<u64> {
        match read_json::<Vec<u64>>(self.store.as_ref(), &joined_key(address)) {
            Ok(history) => history.unwrap_or_default(),
            Err(err) => {
                warn!(?err, "ignoring unreadable joined room history");
                Vec::new()
            }
        }
    }

    fn persist(&self, state: &AggregatorState) -> crate::Result<()> {
        let rooms: Vec<&Room> = state.rooms.values().rev().collect();
        write_json(self.store.as_ref(), CACHE_KEY, &rooms)
    }
}

fn joined_key(address: &Address) -> String {
    format!("joined/0x{}", hex::encode(address.as_slice()))
}

/// Newest first, at most [`ROOM_CACHE_CAP`] rooms unless more are active.
fn cap_rooms(rooms: Vec<Room>) -> Vec<Room> {
    if rooms.len() <= ROOM_CACHE_CAP {
        return rooms
            .into_iter()
            .sorted_by_key(|room| Reverse(room.id))
            .collect();
    }
    let (active, settled): (Vec<Room>, Vec<Room>) = rooms.into_iter().partition(is_active);
    let room_for_settled = ROOM_CACHE_CAP.saturating_sub(active.len());
    active
        .into_iter()
        .chain(
            settled
                .into_iter()
                .sorted_by_key(|room| Reverse(room.id))
                .take(room_for_settled),
        )
        .sorted_by_key(|room| Reverse(room.id))
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::{
        room::Side,
        storage::{
            InMemoryStore,
            KeyValueStore,
        },
        test_helpers::{
            CREATOR,
            OPPONENT,
            RoomBuilder,
        },
    };
    use alloy_primitives::U256;
    use std::sync::Arc;

    fn aggregator() -> (RoomAggregator, InMemoryStore) {
        let store = InMemoryStore::new();
        (RoomAggregator::load(Arc::new(store.clone())).unwrap(), store)
    }

    fn ids(rooms: &[Room]) -> Vec<u64> {
        rooms.iter().map(|room| room.id).collect()
    }

    #[test]
    fn merge_poll__drops_empty_slots_and_sorts_newest_first() {
        // given
        let (aggregator, _) = aggregator();
        let empty = Room::created(9, Address::ZERO, U256::ZERO);

        // when
        let snapshot = aggregator
            .merge_poll(vec![
                RoomBuilder::new(2).build(),
                empty,
                RoomBuilder::new(5).committing().build(),
            ])
            .unwrap();

        // then
        assert_eq!(ids(&snapshot), vec![5, 2]);
    }

    #[test]
    fn merge_poll__keeps_cached_active_rooms_missing_from_poll() {
        // given
        let (aggregator, _) = aggregator();
        aggregator
            .merge_poll(vec![
                RoomBuilder::new(3).committing().build(),
                RoomBuilder::new(4).finished().build(),
            ])
            .unwrap();

        // when
        let snapshot = aggregator
            .merge_poll(vec![RoomBuilder::new(10).build()])
            .unwrap();

        // then
        assert_eq!(ids(&snapshot), vec![10, 3]);
    }

    #[test]
    fn merge_poll__fresh_room_wins_over_cached_copy() {
        let (aggregator, _) = aggregator();
        aggregator
            .merge_poll(vec![RoomBuilder::new(3).committing().build()])
            .unwrap();

        let snapshot = aggregator
            .merge_poll(vec![RoomBuilder::new(3).revealing().build()])
            .unwrap();

        assert_eq!(snapshot[0].state, RoomState::Revealing);
    }

    #[test]
    fn merge_poll__over_cap__keeps_every_active_room() {
        // given
        let (aggregator, _) = aggregator();
        let mut fresh: Vec<Room> = (1..=40)
            .map(|id| RoomBuilder::new(id).finished().build())
            .collect();
        fresh.extend((41..=60).map(|id| RoomBuilder::new(id).committing().build()));
        fresh.push(RoomBuilder::new(2).committing().build());

        // when
        let snapshot = aggregator.merge_poll(fresh).unwrap();

        // then
        assert_eq!(snapshot.len(), ROOM_CACHE_CAP);
        assert!(snapshot.iter().any(|room| room.id == 2));
        assert_eq!(snapshot.iter().filter(|room| is_active(room)).count(), 21);
        assert_eq!(snapshot.first().map(|room| room.id), Some(60));
    }

    #[test]
    fn merge_poll__evicted_room__forfeit_bookkeeping_dropped() {
        // given
        let (aggregator, _) = aggregator();
        let record = ForfeitRecord::new(OPPONENT, CREATOR, U256::from(1u64));
        aggregator.record_forfeit(1, &record).unwrap();
        aggregator.mark_forfeit_attempt(3, 0, false);
        let mut fresh: Vec<Room> = (1..=40)
            .map(|id| RoomBuilder::new(id).finished().build())
            .collect();
        fresh.extend((41..=60).map(|id| RoomBuilder::new(id).committing().build()));

        // when
        let snapshot = aggregator.merge_poll(fresh).unwrap();

        // then
        assert!(!snapshot.iter().any(|room| room.id == 1 || room.id == 3));
        assert_eq!(aggregator.forfeit(1), None);
        let state = aggregator.lock();
        assert!(!state.fetches.contains_key(&1));
        assert!(!state.fetches.contains_key(&3));
    }

    #[test]
    fn merge_poll__unchanged_snapshot__does_not_rewrite_cache() {
        // given
        let (aggregator, store) = aggregator();
        let room = RoomBuilder::new(3).committing().build();
        aggregator.merge_poll(vec![room.clone()]).unwrap();
        store.put(CACHE_KEY, b"[]").unwrap();

        // when
        aggregator.merge_poll(vec![room]).unwrap();

        // then
        assert_eq!(store.get(CACHE_KEY).unwrap().unwrap(), b"[]".to_vec());
    }

    #[test]
    fn load__revives_cache_and_drops_malformed_entries() {
        // given
        let store = InMemoryStore::new();
        let good = serde_json::to_value(RoomBuilder::new(4).committing().build()).unwrap();
        let payload = serde_json::json!([good, { "id": "four" }, 17]);
        store
            .put(CACHE_KEY, &serde_json::to_vec(&payload).unwrap())
            .unwrap();

        // when
        let aggregator = RoomAggregator::load(Arc::new(store.clone())).unwrap();

        // then
        assert_eq!(ids(&aggregator.rooms()), vec![4]);
        let rewritten: Vec<Value> =
            serde_json::from_slice(&store.get(CACHE_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(rewritten.len(), 1);
    }

    #[test]
    fn tracked_room_ids__latest_window_extras_and_active_rooms() {
        // given
        let (aggregator, _) = aggregator();
        aggregator
            .merge_poll(vec![
                RoomBuilder::new(3).committing().build(),
                RoomBuilder::new(50).finished().build(),
            ])
            .unwrap();

        // when
        let tracked = aggregator.tracked_room_ids(100, &[7, 95]);

        // then
        assert_eq!(tracked.len(), 26);
        assert_eq!(tracked[0], 99);
        assert!(tracked.contains(&3));
        assert!(tracked.contains(&7));
        assert!(tracked.contains(&76));
        assert!(!tracked.contains(&75));
        assert!(!tracked.contains(&50));
    }

    #[test]
    fn tracked_room_ids__few_rooms__starts_at_one() {
        let (aggregator, _) = aggregator();

        assert_eq!(aggregator.tracked_room_ids(4, &[]), vec![3, 2, 1]);
        assert!(aggregator.tracked_room_ids(1, &[]).is_empty());
    }

    #[test]
    fn record_forfeit__merges_fields_and_attaches_to_room() {
        // given
        let (aggregator, _) = aggregator();
        aggregator
            .merge_poll(vec![RoomBuilder::new(6).committing().build()])
            .unwrap();
        aggregator
            .record_forfeit(6, &ForfeitRecord {
                loser: Some(OPPONENT),
                winner: None,
                payout: None,
            })
            .unwrap();

        // when
        let merged = aggregator
            .record_forfeit(6, &ForfeitRecord {
                loser: None,
                winner: Some(CREATOR),
                payout: Some(U256::from(200u64)),
            })
            .unwrap();

        // then
        assert_eq!(merged, ForfeitRecord::new(OPPONENT, CREATOR, U256::from(200u64)));
        assert_eq!(aggregator.room(6).unwrap().forfeit, Some(merged));
    }

    #[test]
    fn merge_poll__known_forfeit__attached_to_fresh_room() {
        let (aggregator, _) = aggregator();
        let record = ForfeitRecord::new(OPPONENT, CREATOR, U256::from(1u64));
        aggregator.record_forfeit(6, &record).unwrap();

        let snapshot = aggregator
            .merge_poll(vec![RoomBuilder::new(6).finished().build()])
            .unwrap();

        assert_eq!(snapshot[0].forfeit, Some(record));
    }

    #[test]
    fn forfeit_candidates__respects_cooldown_and_settled_flag() {
        // given
        let (aggregator, _) = aggregator();
        aggregator
            .merge_poll(vec![
                RoomBuilder::new(1).joined().committed(Side::Creator).finished().build(),
                RoomBuilder::new(2).joined().finished().build(),
                RoomBuilder::new(3)
                    .finished()
                    .revealed(Side::Creator, crate::room::Choice::Rock)
                    .revealed(Side::Opponent, crate::room::Choice::Rock)
                    .build(),
                RoomBuilder::new(4).committing().build(),
            ])
            .unwrap();
        let now = 1_000_000;

        // when
        aggregator.mark_forfeit_attempt(1, now, false);
        aggregator.mark_forfeit_attempt(2, now, true);
        let soon = aggregator.forfeit_candidates(now + 1_000);
        let later = aggregator.forfeit_candidates(now + 25_000);

        // then
        assert!(soon.is_empty());
        assert_eq!(later, vec![1]);
    }

    #[test]
    fn apply_event__created_then_joined__updates_cache() {
        // given
        let (aggregator, _) = aggregator();

        // when
        let created = aggregator
            .apply_event(&LogEvent::RoomCreated {
                room_id: 12,
                creator: CREATOR,
                stake: U256::from(5u64),
            })
            .unwrap();
        let joined = aggregator
            .apply_event(&LogEvent::Joined {
                room_id: 12,
                opponent: OPPONENT,
            })
            .unwrap();
        let committed = aggregator
            .apply_event(&LogEvent::Committed {
                room_id: 12,
                player: CREATOR,
            })
            .unwrap();

        // then
        assert!(created && joined && !committed);
        let room = aggregator.room(12).unwrap();
        assert_eq!(room.opponent, OPPONENT);
        assert_eq!(room.state, RoomState::Committing);
    }

    #[test]
    fn remember_joined__most_recent_first_capped_and_deduplicated() {
        let (aggregator, _) = aggregator();

        for room_id in 1..=14 {
            aggregator.remember_joined(&OPPONENT, room_id).unwrap();
        }
        let history = aggregator.remember_joined(&OPPONENT, 5).unwrap();

        assert_eq!(history.len(), JOINED_HISTORY_LIMIT);
        assert_eq!(history[..3], [5, 14, 13]);
        assert_eq!(aggregator.joined_rooms(&OPPONENT), history);
        assert!(aggregator.joined_rooms(&CREATOR).is_empty());
    }
}
