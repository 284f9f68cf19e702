use crate::{
    alerts::{
        AlertSink,
        Reminder,
        ReminderRelay,
    },
    chain::{
        ChainReader,
        ContractCall,
        ForfeitLog,
        TransactionSender,
        TxReceipt,
        u64_word,
    },
    clock::ManualClock,
    config::EngineConfig,
    engine::{
        EngineDeps,
        GameEngine,
    },
    events::LogEvent,
    room::{
        Choice,
        ForfeitRecord,
        ROOM_WORDS,
        Room,
        RoomState,
        Side,
        commit_hash,
    },
    storage::InMemoryStore,
};
use alloy_primitives::{
    Address,
    B256,
    U256,
    keccak256,
};
use anyhow::{
    anyhow,
    bail,
};
use std::{
    collections::{
        BTreeMap,
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
    },
};

pub const CREATOR: Address = Address::new([0xaa; 20]);
pub const OPPONENT: Address = Address::new([0xbb; 20]);
pub const START_SECS: i64 = 1_700_000_000;

pub struct RoomBuilder {
    room: Room,
}

impl RoomBuilder {
    pub fn new(id: u64) -> Self {
        Self {
            room: Room::created(id, CREATOR, U256::from(100u64)),
        }
    }

    pub fn stake(mut self, stake: u64) -> Self {
        self.room.stake = U256::from(stake);
        self
    }

    pub fn creator(mut self, creator: Address) -> Self {
        self.room.creator = creator;
        self
    }

    pub fn opponent(mut self, opponent: Address) -> Self {
        self.room.opponent = opponent;
        self
    }

    pub fn joined(self) -> Self {
        self.opponent(OPPONENT)
    }

    pub fn committing(self) -> Self {
        self.joined().state(RoomState::Committing)
    }

    pub fn revealing(self) -> Self {
        self.committing()
            .committed(Side::Creator)
            .committed(Side::Opponent)
            .state(RoomState::Revealing)
    }

    pub fn finished(self) -> Self {
        self.joined().state(RoomState::Finished)
    }

    pub fn canceled(self) -> Self {
        self.state(RoomState::Canceled)
    }

    pub fn state(mut self, state: RoomState) -> Self {
        self.room.state = state;
        self
    }

    pub fn committed(self, side: Side) -> Self {
        let hash = match side {
            Side::Creator => B256::repeat_byte(0xca),
            Side::Opponent => B256::repeat_byte(0xcb),
        };
        self.commit_hash(side, hash)
    }

    pub fn commit_hash(mut self, side: Side, hash: B256) -> Self {
        match side {
            Side::Creator => self.room.commit_a = hash,
            Side::Opponent => self.room.commit_b = hash,
        }
        self
    }

    pub fn revealed(mut self, side: Side, choice: Choice) -> Self {
        match side {
            Side::Creator => self.room.reveal_a = Some(choice),
            Side::Opponent => self.room.reveal_b = Some(choice),
        }
        self
    }

    pub fn forfeit(mut self, record: ForfeitRecord) -> Self {
        self.room.forfeit = Some(record);
        self
    }

    pub fn commit_deadline(mut self, deadline: i64) -> Self {
        self.room.commit_deadline = deadline;
        self
    }

    pub fn reveal_deadline(mut self, deadline: i64) -> Self {
        self.room.reveal_deadline = deadline;
        self
    }

    pub fn build(self) -> Room {
        self.room
    }
}

/// The ten getter words a contract would return for `room`.
pub fn encode_room(room: &Room) -> Vec<B256> {
    let choice = |choice: Option<Choice>| u64_word(choice.map_or(0, |c| u64::from(c.as_u8())));
    let words = vec![
        room.creator.into_word(),
        room.opponent.into_word(),
        B256::from(room.stake),
        room.commit_a,
        room.commit_b,
        choice(room.reveal_a),
        choice(room.reveal_b),
        u64_word(room.commit_deadline.max(0) as u64),
        u64_word(room.reveal_deadline.max(0) as u64),
        u64_word(u64::from(room.state.as_u8())),
    ];
    debug_assert_eq!(words.len(), ROOM_WORDS);
    words
}

#[derive(Default)]
struct ChainState {
    rooms: BTreeMap<u64, Room>,
    raw_words: HashMap<u64, Vec<B256>>,
    room_failures: HashMap<u64, String>,
    commit_windows: HashMap<u64, u64>,
    next_room_id: u64,
    block_number: u64,
    forfeit_logs: Vec<ForfeitLog>,
    forfeit_ranges: Vec<(u64, u64)>,
    forfeit_failures: VecDeque<String>,
    events: Vec<(u64, LogEvent)>,
    room_reads: usize,
}

/// In-memory room contract. Reads come from the stored rooms and the
/// `FakeWallet` executes calls against it with the contract's rules.
#[derive(Clone)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChain {
    pub fn new() -> Self {
        let state = ChainState {
            next_room_id: 1,
            block_number: 1,
            ..ChainState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn put_room(&self, room: Room) {
        let mut state = self.state.lock().unwrap();
        state.next_room_id = state.next_room_id.max(room.id + 1);
        state.rooms.insert(room.id, room);
    }

    pub fn put_raw_words(&self, room_id: u64, words: Vec<B256>) {
        let mut state = self.state.lock().unwrap();
        state.next_room_id = state.next_room_id.max(room_id + 1);
        state.raw_words.insert(room_id, words);
    }

    pub fn room(&self, room_id: u64) -> Option<Room> {
        self.state.lock().unwrap().rooms.get(&room_id).cloned()
    }

    pub fn fail_room_read(&self, room_id: u64, message: &str) {
        self.state
            .lock()
            .unwrap()
            .room_failures
            .insert(room_id, message.to_string());
    }

    pub fn room_reads(&self) -> usize {
        self.state.lock().unwrap().room_reads
    }

    pub fn set_next_room_id(&self, next_room_id: u64) {
        self.state.lock().unwrap().next_room_id = next_room_id;
    }

    pub fn set_block_number(&self, block_number: u64) {
        self.state.lock().unwrap().block_number = block_number;
    }

    pub fn push_forfeit_log(&self, log: ForfeitLog) {
        self.state.lock().unwrap().forfeit_logs.push(log);
    }

    pub fn forfeit_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().forfeit_ranges.clone()
    }

    pub fn fail_next_forfeit_scan(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .forfeit_failures
            .push_back(message.to_string());
    }

    pub fn push_event(&self, event: LogEvent) {
        let mut state = self.state.lock().unwrap();
        let block = state.block_number;
        state.events.push((block, event));
    }

    /// Apply `call` from `sender` at unix time `now` the way the contract
    /// would, reverting with an error when a rule is broken.
    pub fn execute(&self, sender: Address, call: &ContractCall, now: i64) -> crate::Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut emitted = Vec::new();
        match call {
            ContractCall::CreateRoom {
                stake,
                commit_duration_secs,
            } => {
                let room_id = state.next_room_id;
                state.next_room_id += 1;
                let mut room = Room::created(room_id, sender, *stake);
                room.commit_deadline = now + *commit_duration_secs as i64;
                state.commit_windows.insert(room_id, *commit_duration_secs);
                state.rooms.insert(room_id, room);
                emitted.push(LogEvent::RoomCreated {
                    room_id,
                    creator: sender,
                    stake: *stake,
                });
            }
            ContractCall::JoinRoom { room_id } => {
                let window = state.commit_windows.get(room_id).copied().unwrap_or(600);
                let room = room_mut(&mut state.rooms, *room_id)?;
                if room.state != RoomState::Wait || room.has_opponent() {
                    bail!("room {room_id} is not joinable");
                }
                if room.creator == sender {
                    bail!("creator cannot join own room");
                }
                if room.commit_deadline > 0 && now >= room.commit_deadline {
                    bail!("room {room_id} expired");
                }
                room.opponent = sender;
                room.state = RoomState::Committing;
                room.commit_deadline = now + window as i64;
                emitted.push(LogEvent::Joined {
                    room_id: *room_id,
                    opponent: sender,
                });
            }
            ContractCall::Commit {
                room_id,
                commit_hash,
            } => {
                let room = room_mut(&mut state.rooms, *room_id)?;
                let side = seat(room, sender)?;
                if room.state != RoomState::Committing || room.has_committed(side) {
                    bail!("cannot commit in room {room_id}");
                }
                if now >= room.commit_deadline {
                    bail!("commit window of room {room_id} closed");
                }
                match side {
                    Side::Creator => room.commit_a = *commit_hash,
                    Side::Opponent => room.commit_b = *commit_hash,
                }
                if room.has_committed(side.other()) {
                    room.state = RoomState::Revealing;
                    room.reveal_deadline = now + 900;
                }
                emitted.push(LogEvent::Committed {
                    room_id: *room_id,
                    player: sender,
                });
            }
            ContractCall::Reveal {
                room_id,
                choice,
                salt,
            } => {
                let room = room_mut(&mut state.rooms, *room_id)?;
                let side = seat(room, sender)?;
                if room.state != RoomState::Revealing || room.has_revealed(side) {
                    bail!("cannot reveal in room {room_id}");
                }
                if commit_hash(*choice, salt) != room.commit_of(side) {
                    bail!("reveal does not match commitment");
                }
                match side {
                    Side::Creator => room.reveal_a = Some(*choice),
                    Side::Opponent => room.reveal_b = Some(*choice),
                }
                if room.has_revealed(side.other()) {
                    room.state = RoomState::Finished;
                }
                emitted.push(LogEvent::Revealed {
                    room_id: *room_id,
                    player: sender,
                });
            }
            ContractCall::ClaimTimeout { room_id } => {
                let room = room_mut(&mut state.rooms, *room_id)?;
                let (deadline, a, b) = match room.state {
                    RoomState::Wait => (room.commit_deadline, false, false),
                    RoomState::Committing => (
                        room.commit_deadline,
                        room.has_committed(Side::Creator),
                        room.has_committed(Side::Opponent),
                    ),
                    RoomState::Revealing => (
                        room.reveal_deadline,
                        room.has_revealed(Side::Creator),
                        room.has_revealed(Side::Opponent),
                    ),
                    _ => bail!("room {room_id} has nothing to claim"),
                };
                if now < deadline {
                    bail!("deadline of room {room_id} not reached");
                }
                room.state = if a != b {
                    RoomState::Finished
                } else {
                    RoomState::Canceled
                };
            }
            ContractCall::Forfeit { room_id } => {
                let room = room_mut(&mut state.rooms, *room_id)?;
                let side = seat(room, sender)?;
                if !matches!(room.state, RoomState::Committing | RoomState::Revealing) {
                    bail!("room {room_id} cannot be forfeited");
                }
                room.state = RoomState::Finished;
                let record = ForfeitRecord::new(
                    sender,
                    room.address_of(side.other()),
                    room.stake * U256::from(2u64),
                );
                state.block_number += 1;
                let block_number = state.block_number;
                state.forfeit_logs.push(ForfeitLog {
                    block_number,
                    room_id: *room_id,
                    record: record.clone(),
                });
                state.events.push((block_number, LogEvent::Forfeited {
                    room_id: *room_id,
                    record,
                }));
                return Ok(block_number);
            }
        }
        state.block_number += 1;
        let block_number = state.block_number;
        state
            .events
            .extend(emitted.into_iter().map(|event| (block_number, event)));
        Ok(block_number)
    }
}

fn room_mut(rooms: &mut BTreeMap<u64, Room>, room_id: u64) -> crate::Result<&mut Room> {
    rooms
        .get_mut(&room_id)
        .ok_or_else(|| anyhow!("room {room_id} does not exist"))
}

fn seat(room: &Room, sender: Address) -> crate::Result<Side> {
    room.side_of(&sender)
        .ok_or_else(|| anyhow!("{sender} does not play in room {}", room.id))
}

impl ChainReader for FakeChain {
    async fn next_room_id(&self) -> crate::Result<u64> {
        Ok(self.state.lock().unwrap().next_room_id)
    }

    async fn room_words(&self, room_id: u64) -> crate::Result<Vec<B256>> {
        let mut state = self.state.lock().unwrap();
        state.room_reads += 1;
        if let Some(message) = state.room_failures.get(&room_id) {
            return Err(anyhow!("{message}"));
        }
        if let Some(words) = state.raw_words.get(&room_id) {
            return Ok(words.clone());
        }
        Ok(state
            .rooms
            .get(&room_id)
            .map(encode_room)
            .unwrap_or_else(|| vec![B256::ZERO; ROOM_WORDS]))
    }

    async fn block_number(&self) -> crate::Result<u64> {
        Ok(self.state.lock().unwrap().block_number)
    }

    async fn forfeit_logs(
        &self,
        room_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> crate::Result<Vec<ForfeitLog>> {
        let mut state = self.state.lock().unwrap();
        state.forfeit_ranges.push((from_block, to_block));
        if let Some(message) = state.forfeit_failures.pop_front() {
            return Err(anyhow!("{message}"));
        }
        let mut logs: Vec<ForfeitLog> = state
            .forfeit_logs
            .iter()
            .filter(|log| {
                log.room_id == room_id
                    && log.block_number >= from_block
                    && log.block_number <= to_block
            })
            .cloned()
            .collect();
        logs.sort_by_key(|log| log.block_number);
        Ok(logs)
    }

    async fn contract_events(&self, from_block: u64, to_block: u64) -> crate::Result<Vec<LogEvent>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|(block, _)| *block >= from_block && *block <= to_block)
            .map(|(_, event)| event.clone())
            .collect())
    }
}

#[derive(Default)]
struct WalletState {
    sent: Vec<ContractCall>,
    fail_next: Option<String>,
}

/// Signs as `account` and executes straight against a [`FakeChain`].
#[derive(Clone)]
pub struct FakeWallet {
    chain: FakeChain,
    account: Address,
    clock: ManualClock,
    state: Arc<Mutex<WalletState>>,
}

impl FakeWallet {
    pub fn new(chain: FakeChain, account: Address, clock: ManualClock) -> Self {
        Self {
            chain,
            account,
            clock,
            state: Arc::default(),
        }
    }

    pub fn sent_calls(&self) -> Vec<ContractCall> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn fail_next_send(&self, message: &str) {
        self.state.lock().unwrap().fail_next = Some(message.to_string());
    }

    /// Execute without going through an engine, for driving the other seat.
    pub fn execute(&self, call: ContractCall) -> crate::Result<u64> {
        let now = crate::clock::Clock::now_secs(&self.clock);
        self.chain.execute(self.account, &call, now)
    }
}

impl TransactionSender for FakeWallet {
    async fn send(&self, call: ContractCall) -> crate::Result<TxReceipt> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = state.fail_next.take() {
                return Err(anyhow!("{message}"));
            }
            state.sent.push(call.clone());
        }
        let block_number = self.execute(call.clone())?;
        Ok(TxReceipt {
            tx_hash: keccak256(call.calldata()),
            block_number: Some(block_number),
            success: true,
        })
    }

    fn account(&self) -> Option<Address> {
        Some(self.account)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Alert { key: String, pattern: Vec<u64> },
    AllClear,
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    calls: Arc<Mutex<Vec<SinkCall>>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn alerts_for(&self, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| matches!(call, SinkCall::Alert { key: k, .. } if k == key))
            .count()
    }

    pub fn all_clears(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| **call == SinkCall::AllClear)
            .count()
    }
}

impl AlertSink for RecordingSink {
    fn alert(&self, key: &str, pattern: &[u64]) {
        self.calls.lock().unwrap().push(SinkCall::Alert {
            key: key.to_string(),
            pattern: pattern.to_vec(),
        });
    }

    fn all_clear(&self) {
        self.calls.lock().unwrap().push(SinkCall::AllClear);
    }
}

#[derive(Clone, Default)]
pub struct RecordingRelay {
    reminders: Arc<Mutex<Vec<Reminder>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingRelay {
    pub fn reminders(&self) -> Vec<Reminder> {
        self.reminders.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

impl ReminderRelay for RecordingRelay {
    async fn send(&self, reminder: Reminder) -> crate::Result<()> {
        if *self.failing.lock().unwrap() {
            bail!("relay unavailable");
        }
        self.reminders.lock().unwrap().push(reminder);
        Ok(())
    }
}

pub type TestEngine = GameEngine<FakeChain, FakeWallet, RecordingSink, RecordingRelay>;

/// Engine wired to fakes, seated as `viewer`, with a second wallet for the
/// other seat.
pub struct TestContext {
    pub chain: FakeChain,
    pub clock: ManualClock,
    pub store: InMemoryStore,
    pub sink: RecordingSink,
    pub relay: RecordingRelay,
    pub wallet: FakeWallet,
    pub engine: Arc<TestEngine>,
}

impl TestContext {
    pub fn new(viewer: Address) -> Self {
        Self::with_config(viewer, EngineConfig::default())
    }

    pub fn with_config(viewer: Address, config: EngineConfig) -> Self {
        let chain = FakeChain::new();
        let clock = ManualClock::at_secs(START_SECS);
        let store = InMemoryStore::new();
        let sink = RecordingSink::default();
        let relay = RecordingRelay::default();
        let wallet = FakeWallet::new(chain.clone(), viewer, clock.clone());
        let engine = GameEngine::new(config, EngineDeps {
            chain: Arc::new(chain.clone()),
            sender: Arc::new(wallet.clone()),
            sink: Arc::new(sink.clone()),
            relay: relay.clone(),
            store: Arc::new(store.clone()),
            clock: Arc::new(clock.clone()),
        })
        .unwrap();
        Self {
            chain,
            clock,
            store,
            sink,
            relay,
            wallet,
            engine,
        }
    }

    /// A second engine over the same chain, store and clock, as after a
    /// process restart. Sinks are shared with the first engine.
    pub fn restarted_engine(&self, config: EngineConfig) -> Arc<TestEngine> {
        GameEngine::new(config, EngineDeps {
            chain: Arc::new(self.chain.clone()),
            sender: Arc::new(self.wallet.clone()),
            sink: Arc::new(self.sink.clone()),
            relay: self.relay.clone(),
            store: Arc::new(self.store.clone()),
            clock: Arc::new(self.clock.clone()),
        })
        .unwrap()
    }

    pub fn wallet_for(&self, account: Address) -> FakeWallet {
        FakeWallet::new(self.chain.clone(), account, self.clock.clone())
    }
}
