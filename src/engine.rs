use crate::{
    actions::{
        JoinCheck,
        PersonalSummary,
        actionable_conditions,
        join_check,
        personal_summary,
    },
    aggregator::{
        FORFEIT_FETCH_DELAY,
        RoomAggregator,
    },
    alerts::{
        AlertEngine,
        AlertSink,
        ReminderRelay,
    },
    autoplay::{
        AutoPlayController,
        AutoPlayHost,
        AutoPlayReport,
        RoomStatus,
        Toggle,
    },
    availability::availability,
    chain::{
        ChainReader,
        ContractCall,
        ForfeitScanner,
        TransactionSender,
        TxReceipt,
        read_room,
    },
    clock::Clock,
    config::EngineConfig,
    deadlines::{
        DeadlineTracker,
        MAX_COMMIT_WINDOW_SECS,
        MIN_COMMIT_WINDOW_SECS,
        REVEAL_WINDOW_SECS,
        SWEEP_INTERVAL,
    },
    events::{
        LogEvent,
        poll_contract_events,
    },
    outcome::{
        Outcome,
        derive_final_outcome,
        room_is_finalized,
    },
    poller::PollSchedule,
    room::{
        Choice,
        Room,
        RoomState,
        Side,
        commit_hash,
        random_salt,
    },
    scheduler::RequestScheduler,
    secrets::{
        ClearOptions,
        CommitSecret,
        CommitSecretStore,
    },
    stats::{
        UserStats,
        user_stats,
    },
    storage::SharedStore,
};
use alloy_primitives::{
    Address,
    B256,
    U256,
};
use anyhow::{
    Context,
    anyhow,
    bail,
};
use futures::{
    Stream,
    StreamExt,
    future::join_all,
    stream::BoxStream,
};
use std::{
    pin::pin,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
};
use tokio::{
    sync::{
        Notify,
        mpsc,
        watch,
    },
    time::{
        self,
        Instant,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

/// Everything the engine talks to. Tests wire fakes in here.
pub struct EngineDeps<C, S, K, R> {
    pub chain: Arc<C>,
    pub sender: Arc<S>,
    pub sink: Arc<K>,
    pub relay: R,
    pub store: SharedStore,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub tracked: usize,
    pub rooms: usize,
    pub failures: usize,
    pub alerted: Option<String>,
}

/// One mirrored view of the game contract for one wallet: keeps the room
/// cache fresh, fills in deadlines, finds forfeits, raises alerts and sends
/// the wallet's moves.
pub struct GameEngine<C, S, K, R> {
    config: EngineConfig,
    chain: Arc<C>,
    sender: Arc<S>,
    clock: Arc<dyn Clock>,
    scheduler: RequestScheduler,
    deadlines: DeadlineTracker,
    secrets: CommitSecretStore,
    rooms: RoomAggregator,
    forfeits: ForfeitScanner,
    alerts: AlertEngine<K, R>,
    auto_play: AutoPlayController,
    auto_play_reports: Mutex<Option<mpsc::UnboundedReceiver<AutoPlayReport>>>,
    schedule: Mutex<PollSchedule>,
    snapshots: watch::Sender<Vec<Room>>,
    disposed: AtomicBool,
    wake: Notify,
}

impl<C, S, K, R> GameEngine<C, S, K, R>
where
    C: ChainReader,
    S: TransactionSender,
    K: AlertSink,
    R: ReminderRelay,
{
    pub fn new(config: EngineConfig, deps: EngineDeps<C, S, K, R>) -> crate::Result<Arc<Self>> {
        let EngineDeps {
            chain,
            sender,
            sink,
            relay,
            store,
            clock,
        } = deps;
        let deadlines =
            DeadlineTracker::load(store.clone()).context("load deadline fallbacks")?;
        let rooms = RoomAggregator::load(store.clone()).context("load room cache")?;
        let alerts = AlertEngine::load(
            sink,
            relay,
            store.clone(),
            clock.clone(),
            config.alerts(),
        )
        .context("load alert records")?;
        alerts.set_enabled(config.notifications_enabled)?;
        let (auto_play, reports) = AutoPlayController::new(config.auto_play());
        let (snapshots, _) = watch::channel(rooms.rooms());
        let schedule = PollSchedule::new(config.poll(), Instant::now());
        let scheduler = RequestScheduler::new(config.scheduler());

        Ok(Arc::new(Self {
            forfeits: ForfeitScanner::new(config.log_scan(), scheduler.clone()),
            scheduler,
            secrets: CommitSecretStore::new(store),
            config,
            chain,
            sender,
            clock,
            deadlines,
            rooms,
            alerts,
            auto_play,
            auto_play_reports: Mutex::new(Some(reports)),
            schedule: Mutex::new(schedule),
            snapshots,
            disposed: AtomicBool::new(false),
            wake: Notify::new(),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connected wallet, `None` in read-only mode.
    pub fn viewer(&self) -> Option<Address> {
        self.sender.account()
    }

    pub fn alerts(&self) -> &AlertEngine<K, R> {
        &self.alerts
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn lock_schedule(&self) -> MutexGuard<'_, PollSchedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_viewer(&self) -> crate::Result<Address> {
        self.viewer()
            .ok_or_else(|| anyhow!("no wallet connected, engine is read-only"))
    }

    pub async fn block_number(&self) -> crate::Result<u64> {
        let chain = self.chain.as_ref();
        self.scheduler
            .run(|| chain.block_number())
            .await
            .context("read latest block")
    }

    /// One poll cycle: read every tracked room, merge into the cache, look for
    /// forfeits, publish the snapshot and evaluate alerts. A failed room read
    /// only affects that room.
    pub async fn poll_once(&self) -> crate::Result<PollReport> {
        let chain = self.chain.as_ref();
        let next_room_id = self
            .scheduler
            .run(|| chain.next_room_id())
            .await
            .context("read next room id")?;
        let extra = self.extra_room_ids();
        let tracked = self.rooms.tracked_room_ids(next_room_id, &extra);

        let results = join_all(
            tracked
                .iter()
                .map(|room_id| read_room(chain, &self.scheduler, *room_id)),
        )
        .await;
        let mut fresh = Vec::with_capacity(results.len());
        let mut failures = 0;
        for (room_id, result) in tracked.iter().zip(results) {
            match result {
                Ok(room) => fresh.push(room),
                Err(err) => {
                    failures += 1;
                    warn!(room_id, ?err, "room read failed, keeping cached copy");
                }
            }
        }
        self.rooms.merge_poll(fresh)?;
        self.scan_forfeits().await;

        let views = self.views();
        self.snapshots.send_replace(views.clone());
        if let Some(viewer) = self.viewer() {
            self.purge_settled_secrets(&viewer, &views);
        }
        let alerted = match self.viewer() {
            Some(viewer) if !self.is_disposed() => {
                let conditions = actionable_conditions(&views, &viewer, self.clock.now_secs());
                self.alerts.evaluate(&viewer, &conditions).await?
            }
            _ => None,
        };
        debug!(
            next_room_id,
            tracked = tracked.len(),
            rooms = views.len(),
            failures,
            "poll complete"
        );
        Ok(PollReport {
            tracked: tracked.len(),
            rooms: views.len(),
            failures,
            alerted,
        })
    }

    /// Drop the live secret of rooms that are over. The archive stays.
    fn purge_settled_secrets(&self, viewer: &Address, views: &[Room]) {
        let live = match self.secrets.live_room_ids(viewer) {
            Ok(live) => live,
            Err(err) => {
                warn!(?err, "could not list rooms with stored moves");
                return;
            }
        };
        let settled = views.iter().filter(|room| {
            live.contains(&room.id)
                && (room_is_finalized(room) || room.state == RoomState::Canceled)
        });
        for room in settled {
            let keep_archive = ClearOptions {
                preserve_archive: true,
            };
            match self.secrets.clear(viewer, room.id, keep_archive) {
                Ok(()) => debug!(room_id = room.id, state = ?room.state, "dropped live commit secret"),
                Err(err) => warn!(room_id = room.id, ?err, "could not drop settled commit secret"),
            }
        }
    }

    /// Rooms the viewer is known to play in, beyond the newest window.
    fn extra_room_ids(&self) -> Vec<u64> {
        let Some(viewer) = self.viewer() else {
            return Vec::new();
        };
        let mut extra = self.rooms.joined_rooms(&viewer);
        match self.secrets.live_room_ids(&viewer) {
            Ok(ids) => extra.extend(ids),
            Err(err) => warn!(?err, "could not list rooms with stored moves"),
        }
        extra
    }

    fn enhance(&self, room: Room) -> Room {
        match self.deadlines.enhance_room_deadlines(&room) {
            Ok(enhanced) => enhanced,
            Err(err) => {
                warn!(room_id = room.id, ?err, "could not merge deadline fallbacks");
                room
            }
        }
    }

    /// Cached rooms, newest first, with merged deadlines.
    pub fn views(&self) -> Vec<Room> {
        self.rooms
            .rooms()
            .into_iter()
            .map(|room| self.enhance(room))
            .collect()
    }

    pub fn room(&self, room_id: u64) -> Option<Room> {
        self.rooms.room(room_id).map(|room| self.enhance(room))
    }

    /// Per-room status for the viewer's rooms.
    pub fn summaries(&self) -> Vec<PersonalSummary> {
        let Some(viewer) = self.viewer() else {
            return Vec::new();
        };
        let now = self.clock.now_secs();
        self.views()
            .iter()
            .filter_map(|room| personal_summary(room, &viewer, now))
            .collect()
    }

    pub fn stats(&self) -> Option<UserStats> {
        let viewer = self.viewer()?;
        Some(user_stats(self.views().iter(), &viewer))
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Room>> {
        self.snapshots.subscribe()
    }

    /// Read one room straight from the chain and put it in the cache.
    /// `None` when the slot is empty.
    pub async fn fetch_room(&self, room_id: u64) -> crate::Result<Option<Room>> {
        let mut room = read_room(self.chain.as_ref(), &self.scheduler, room_id).await?;
        if room.is_empty_slot() {
            return Ok(None);
        }
        self.rooms.replace_room(room.clone())?;
        room.forfeit = self.rooms.forfeit(room_id);
        Ok(Some(self.enhance(room)))
    }

    pub async fn refresh_room(&self, room_id: u64) -> crate::Result<Room> {
        self.fetch_room(room_id)
            .await?
            .ok_or_else(|| anyhow!("room {room_id} does not exist"))
    }

    /// Settle the final result of a room, searching the logs for a forfeit
    /// when the room ended without both reveals.
    pub async fn resolve_outcome(&self, room_id: u64) -> crate::Result<(Room, Outcome)> {
        let mut room = self.refresh_room(room_id).await?;
        let unrevealed = !room.has_revealed(Side::Creator) || !room.has_revealed(Side::Opponent);
        if room.state == RoomState::Finished && room.forfeit.is_none() && unrevealed {
            let log = self
                .forfeits
                .latest_forfeit(self.chain.as_ref(), room_id, None)
                .await?;
            match log {
                Some(log) => room.forfeit = Some(self.rooms.record_forfeit(room_id, &log.record)?),
                None => {
                    self.rooms
                        .mark_forfeit_attempt(room_id, self.clock.now_millis(), true)
                }
            }
        }
        let outcome = derive_final_outcome(&room);
        Ok((room, outcome))
    }

    /// Look for forfeit logs of finished rooms that ended without both
    /// reveals. Returns how many records were found.
    pub async fn scan_forfeits(&self) -> usize {
        let candidates = self.rooms.forfeit_candidates(self.clock.now_millis());
        if candidates.is_empty() {
            return 0;
        }
        let latest = match self.block_number().await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(?err, "skipping forfeit scan");
                return 0;
            }
        };
        let mut found = 0;
        for (index, room_id) in candidates.into_iter().enumerate() {
            if self.is_disposed() {
                break;
            }
            if index > 0 {
                time::sleep(FORFEIT_FETCH_DELAY).await;
            }
            let now_ms = self.clock.now_millis();
            match self
                .forfeits
                .latest_forfeit(self.chain.as_ref(), room_id, Some(latest))
                .await
            {
                Ok(Some(log)) => match self.rooms.record_forfeit(room_id, &log.record) {
                    Ok(_) => {
                        info!(room_id, block = log.block_number, "forfeit found");
                        found += 1;
                    }
                    Err(err) => warn!(room_id, ?err, "could not store forfeit record"),
                },
                Ok(None) => self.rooms.mark_forfeit_attempt(room_id, now_ms, true),
                Err(err) => {
                    warn!(room_id, ?err, "forfeit scan failed");
                    self.rooms.mark_forfeit_attempt(room_id, now_ms, false);
                }
            }
        }
        found
    }

    async fn send(&self, call: ContractCall) -> crate::Result<TxReceipt> {
        let signature = call.signature();
        let room_id = call.room_id();
        let receipt = self
            .sender
            .send(call)
            .await
            .with_context(|| format!("send {signature}"))?;
        if !receipt.success {
            error!(?room_id, tx_hash = %receipt.tx_hash, signature, "transaction reverted");
            bail!("{signature} transaction {} reverted", receipt.tx_hash);
        }
        info!(?room_id, tx_hash = %receipt.tx_hash, block = ?receipt.block_number, signature, "transaction confirmed");
        Ok(receipt)
    }

    async fn after_transaction(&self, room_id: u64) {
        if let Err(err) = self.refresh_room(room_id).await {
            warn!(room_id, ?err, "refresh after transaction failed");
        }
        self.request_refresh();
    }

    /// Open a room with `stake` and a commit window of `window_secs`. Returns
    /// the new room id.
    pub async fn create_room(&self, stake: U256, window_secs: i64) -> crate::Result<u64> {
        if !(MIN_COMMIT_WINDOW_SECS..=MAX_COMMIT_WINDOW_SECS).contains(&window_secs) {
            bail!(
                "commit window must be between {MIN_COMMIT_WINDOW_SECS} and {MAX_COMMIT_WINDOW_SECS} seconds, got {window_secs}"
            );
        }
        self.require_viewer()?;
        self.send(ContractCall::CreateRoom {
            stake,
            commit_duration_secs: window_secs as u64,
        })
        .await?;
        let chain = self.chain.as_ref();
        let next_room_id = self
            .scheduler
            .run(|| chain.next_room_id())
            .await
            .context("read room id after create")?;
        let room_id = next_room_id
            .checked_sub(1)
            .filter(|id| *id > 0)
            .ok_or_else(|| anyhow!("contract reports no rooms after create"))?;
        self.deadlines.remember_commit_window(room_id, window_secs)?;
        self.deadlines
            .remember_commit(room_id, self.clock.now_secs() + window_secs)?;
        self.after_transaction(room_id).await;
        Ok(room_id)
    }

    pub async fn join_room(&self, room_id: u64) -> crate::Result<()> {
        let viewer = self.require_viewer()?;
        let room = self.refresh_room(room_id).await?;
        match join_check(&room, &viewer, self.clock.now_secs()) {
            JoinCheck::Open => {}
            refusal => bail!("cannot join room {room_id}: {refusal}"),
        }
        self.send(ContractCall::JoinRoom { room_id }).await?;
        self.rooms.remember_joined(&viewer, room_id)?;
        // estimate only when the node does not report the new deadline yet
        let joined = read_room(self.chain.as_ref(), &self.scheduler, room_id).await;
        if !joined.is_ok_and(|room| room.commit_deadline > 0) {
            let window = self.deadlines.commit_window(room_id);
            self.deadlines
                .remember_commit(room_id, self.clock.now_secs() + window)?;
        }
        self.after_transaction(room_id).await;
        Ok(())
    }

    /// Commit `choice`, or a random move when `None`. Returns the committed
    /// move.
    pub async fn commit(&self, room_id: u64, choice: Option<Choice>) -> crate::Result<Choice> {
        let choice = choice.unwrap_or_else(Choice::random);
        self.commit_with(room_id, choice, random_salt()).await?;
        Ok(choice)
    }

    /// The secret is stored before the transaction goes out. A failed send
    /// drops the live copy only, since the transaction may still have landed.
    pub async fn commit_with(&self, room_id: u64, choice: Choice, salt: B256) -> crate::Result<()> {
        let viewer = self.require_viewer()?;
        let room = self.refresh_room(room_id).await?;
        let side = room
            .side_of(&viewer)
            .ok_or_else(|| anyhow!("{viewer} does not play in room {room_id}"))?;
        if room.state != RoomState::Committing {
            bail!("room {room_id} is not accepting commits");
        }
        if room.has_committed(side) {
            bail!("already committed in room {room_id}");
        }
        let now = self.clock.now_secs();
        if room.commit_deadline > 0 && now >= room.commit_deadline {
            bail!("commit window of room {room_id} has closed");
        }

        let secret = CommitSecret {
            room_id,
            stake_human: room.stake.to_string(),
            choice,
            salt,
        };
        self.secrets
            .record_commit(&viewer, &secret)
            .context("store commit secret")?;
        let call = ContractCall::Commit {
            room_id,
            commit_hash: commit_hash(choice, &salt),
        };
        if let Err(err) = self.send(call).await {
            let keep_archive = ClearOptions {
                preserve_archive: true,
            };
            if let Err(clear_err) = self.secrets.clear(&viewer, room_id, keep_archive) {
                warn!(room_id, ?clear_err, "could not drop unused commit secret");
            }
            return Err(err);
        }
        if room.has_committed(side.other()) {
            self.deadlines
                .remember_reveal(room_id, self.clock.now_secs() + REVEAL_WINDOW_SECS)?;
        }
        self.after_transaction(room_id).await;
        Ok(())
    }

    /// Reveal the stored move. Returns the revealed move.
    pub async fn reveal(&self, room_id: u64) -> crate::Result<Choice> {
        let viewer = self.require_viewer()?;
        let secret = self
            .secrets
            .load_any(&viewer, room_id)?
            .ok_or_else(|| anyhow!("no stored move for room {room_id}"))?;
        let choice = secret.choice;
        self.reveal_with(room_id, secret).await?;
        Ok(choice)
    }

    pub async fn reveal_with(&self, room_id: u64, secret: CommitSecret) -> crate::Result<()> {
        let viewer = self.require_viewer()?;
        let room = self.refresh_room(room_id).await?;
        let side = room
            .side_of(&viewer)
            .ok_or_else(|| anyhow!("{viewer} does not play in room {room_id}"))?;
        if room.state != RoomState::Revealing {
            bail!("room {room_id} is not accepting reveals");
        }
        if room.has_revealed(side) {
            bail!("already revealed in room {room_id}");
        }
        if commit_hash(secret.choice, &secret.salt) != room.commit_of(side) {
            bail!("stored move for room {room_id} does not match the on-chain commitment");
        }
        self.send(ContractCall::Reveal {
            room_id,
            choice: secret.choice,
            salt: secret.salt,
        })
        .await?;
        let keep_archive = ClearOptions {
            preserve_archive: true,
        };
        if let Err(err) = self.secrets.clear(&viewer, room_id, keep_archive) {
            warn!(room_id, ?err, "could not clear revealed commit secret");
        }
        self.after_transaction(room_id).await;
        Ok(())
    }

    /// Settle a room whose deadline has passed.
    pub async fn claim(&self, room_id: u64) -> crate::Result<()> {
        self.require_viewer()?;
        let room = self.refresh_room(room_id).await?;
        if !availability(&room, self.clock.now_secs()).claimable {
            bail!("nothing to claim in room {room_id}");
        }
        self.send(ContractCall::ClaimTimeout { room_id }).await?;
        self.after_transaction(room_id).await;
        Ok(())
    }

    pub async fn forfeit(&self, room_id: u64) -> crate::Result<()> {
        let viewer = self.require_viewer()?;
        let room = self.refresh_room(room_id).await?;
        let summary = personal_summary(&room, &viewer, self.clock.now_secs())
            .ok_or_else(|| anyhow!("{viewer} does not play in room {room_id}"))?;
        if !summary.allow_forfeit {
            bail!("room {room_id} cannot be forfeited now");
        }
        self.send(ContractCall::Forfeit { room_id }).await?;
        self.after_transaction(room_id).await;
        Ok(())
    }

    /// Fold a contract log into the cache and re-read the room it names.
    pub async fn handle_event(&self, event: LogEvent) {
        let room_id = event.room_id();
        if let Err(err) = self.rooms.apply_event(&event) {
            warn!(room_id, ?err, "could not apply contract event");
        }
        if let Err(err) = self.fetch_room(room_id).await {
            debug!(room_id, ?err, "refresh after contract event failed");
        }
        self.request_refresh();
    }

    /// Ask for an early poll, throttled. Returns whether it was accepted.
    pub fn request_refresh(&self) -> bool {
        let accepted = self.lock_schedule().request_refresh(Instant::now());
        if accepted {
            self.wake.notify_one();
        }
        accepted
    }

    pub fn snooze_alert(&self, key: &str) -> crate::Result<()> {
        self.alerts.snooze(key)
    }

    pub fn set_notifications(&self, enabled: bool) -> crate::Result<()> {
        self.alerts.set_enabled(enabled)
    }

    /// Contract events from `from_block` on, polled at the configured pace
    /// through the shared request scheduler.
    pub fn event_stream(&self, from_block: u64) -> BoxStream<'static, LogEvent> {
        poll_contract_events(
            Arc::clone(&self.chain),
            self.scheduler.clone(),
            from_block,
            self.config.event_poll(),
        )
        .boxed()
    }

    pub fn toggle_auto_play(self: &Arc<Self>, room_id: u64) -> Toggle {
        self.auto_play.toggle(room_id, Arc::clone(self))
    }

    pub fn is_auto_playing(&self, room_id: u64) -> bool {
        self.auto_play.is_running(room_id)
    }

    /// Auto-play run results. Can be taken once.
    pub fn take_auto_play_reports(&self) -> Option<mpsc::UnboundedReceiver<AutoPlayReport>> {
        self.auto_play_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn sweep_deadlines(&self) {
        match self.deadlines.sweep(self.clock.now_secs()) {
            Ok(0) => {}
            Ok(evicted) => debug!(evicted, "evicted stale deadline fallbacks"),
            Err(err) => warn!(?err, "deadline sweep failed"),
        }
    }

    async fn run_poll(&self) {
        if !self.lock_schedule().begin() {
            return;
        }
        let success = match self.poll_once().await {
            Ok(_) => true,
            Err(err) => {
                warn!(?err, "poll failed");
                false
            }
        };
        self.lock_schedule().complete(Instant::now(), success);
    }

    /// Drive polling, deadline sweeps and `events` until [`Self::dispose`].
    pub async fn run(self: &Arc<Self>, events: impl Stream<Item = LogEvent> + Send) {
        let mut events = pin!(events);
        let mut events_open = true;
        let mut sweep = time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(viewer = ?self.viewer(), "engine started");

        while !self.is_disposed() {
            let wake = self.lock_schedule().next_wake();
            let poll_due = async move {
                match wake {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = poll_due => self.run_poll().await,
                _ = sweep.tick() => self.sweep_deadlines(),
                event = events.next(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("contract event stream ended");
                        events_open = false;
                    }
                },
                _ = self.wake.notified() => {}
            }
        }
        info!("engine stopped");
    }

    /// Stop the run loop, alert timers and auto-play. Persisted state stays.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alerts.dispose();
        self.auto_play.stop_all();
        self.wake.notify_one();
    }
}

impl<C, S, K, R> AutoPlayHost for GameEngine<C, S, K, R>
where
    C: ChainReader,
    S: TransactionSender,
    K: AlertSink,
    R: ReminderRelay,
{
    async fn room_status(&self, room_id: u64) -> crate::Result<Option<RoomStatus>> {
        let Some(viewer) = self.viewer() else {
            return Ok(None);
        };
        let Some(room) = self.fetch_room(room_id).await? else {
            return Ok(None);
        };
        Ok(
            personal_summary(&room, &viewer, self.clock.now_secs()).map(|summary| RoomStatus {
                action: summary.action,
                terminal: summary.is_terminal(),
                alert_key: summary.alert_key,
            }),
        )
    }

    async fn commit_move(&self, room_id: u64, choice: Choice, salt: B256) -> crate::Result<()> {
        self.commit_with(room_id, choice, salt).await
    }

    async fn stored_secret(&self, room_id: u64) -> crate::Result<Option<CommitSecret>> {
        let viewer = self.require_viewer()?;
        self.secrets.load_any(&viewer, room_id)
    }

    async fn reveal_move(&self, room_id: u64, secret: CommitSecret) -> crate::Result<()> {
        self.reveal_with(room_id, secret).await
    }

    async fn claim(&self, room_id: u64) -> crate::Result<()> {
        GameEngine::claim(self, room_id).await
    }

    fn clear_alert(&self, key: &str) {
        if let Err(err) = self.alerts.stop_loop(key) {
            warn!(key, ?err, "could not clear alert");
        }
    }
}
