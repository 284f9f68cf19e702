// Deduplicated alert loops plus the outbound reminder relay. Each actionable
// condition fires once per appearance: the sink is pinged on a fixed cadence
// until the condition clears, is snoozed, or alerts are disabled.
use crate::{
    actions::{
        ActionableCondition,
        AlertKind,
    },
    clock::Clock,
    storage::{
        SharedStore,
        read_json,
        write_json,
    },
};
use alloy_primitives::Address;
use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::{
        BTreeMap,
        HashMap,
        HashSet,
    },
    future::Future,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{
        self,
        Instant,
    },
};
use tracing::{
    debug,
    info,
    warn,
};
use url::Url;

pub const DEFAULT_VIBRATION_MS: u64 = 220;
pub const DEFAULT_SNOOZE_MINUTES: u64 = 2;
const RECORDS_KEY: &str = "alerts/records";

/// Where alert pulses go: a vibration motor, a tone, a terminal bell.
pub trait AlertSink: Send + Sync + 'static {
    fn alert(&self, key: &str, pattern: &[u64]);

    /// no loop is active any more
    fn all_clear(&self);
}

/// Out-of-band reminder delivery, e.g. a chat bot relay.
pub trait ReminderRelay: Send + Sync + 'static {
    fn send(&self, reminder: Reminder) -> impl Future<Output = crate::Result<()>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub address: Address,
    pub key: String,
    pub room_id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub body: String,
    pub deadline: Option<i64>,
    pub timestamp: i64,
}

impl Reminder {
    pub fn for_condition(address: Address, condition: &ActionableCondition, timestamp: i64) -> Self {
        let room_id = condition.room_id;
        let (title, body) = match condition.kind {
            AlertKind::Claim => (
                "Claim available".to_string(),
                format!("Room #{room_id}: the deadline passed, you can claim now."),
            ),
            AlertKind::NeedCommit(_) => (
                "Your move is needed".to_string(),
                format!("Room #{room_id}: commit your move before the deadline."),
            ),
            AlertKind::CommitUrgent => (
                "Commit deadline is close".to_string(),
                format!("Room #{room_id}: less than a minute left to commit."),
            ),
            AlertKind::NeedReveal(_) => (
                "Reveal your move".to_string(),
                format!("Room #{room_id}: both moves are in, reveal yours."),
            ),
        };
        Self {
            address,
            key: condition.key.clone(),
            room_id,
            kind: condition.kind.to_string(),
            title,
            body,
            deadline: condition.deadline,
            timestamp,
        }
    }
}

/// Posts reminders as JSON to a relay endpoint.
pub struct HttpReminderRelay {
    endpoint: Url,
    http: reqwest::Client,
}

impl HttpReminderRelay {
    pub fn new(endpoint: Url) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client for reminder relay")?;
        Ok(Self { endpoint, http })
    }
}

impl ReminderRelay for HttpReminderRelay {
    async fn send(&self, reminder: Reminder) -> crate::Result<()> {
        self.http
            .post(self.endpoint.clone())
            .json(&reminder)
            .send()
            .await
            .with_context(|| format!("failed to post reminder {}", reminder.key))?
            .error_for_status()
            .with_context(|| format!("relay rejected reminder {}", reminder.key))?;
        Ok(())
    }
}

/// `None` drops reminders, for sessions without a relay configured.
impl<R: ReminderRelay> ReminderRelay for Option<R> {
    async fn send(&self, reminder: Reminder) -> crate::Result<()> {
        match self {
            Some(relay) => relay.send(reminder).await,
            None => {
                debug!(key = %reminder.key, "no reminder relay configured");
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertConfig {
    pub vibration_ms: u64,
    pub snooze: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            vibration_ms: DEFAULT_VIBRATION_MS,
            snooze: Duration::from_secs(DEFAULT_SNOOZE_MINUTES * 60),
        }
    }
}

impl AlertConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis((self.vibration_ms + 600).max(1_600))
    }
}

/// Persisted per key; `fired_at` marks a key as notified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub key: String,
    pub fired_at: Option<i64>,
    pub snoozed_until: Option<i64>,
}

struct AlertState {
    enabled: bool,
    loops: HashMap<String, JoinHandle<()>>,
    records: BTreeMap<String, AlertRecord>,
}

pub struct AlertEngine<S, R> {
    sink: Arc<S>,
    relay: R,
    store: SharedStore,
    clock: Arc<dyn Clock>,
    config: AlertConfig,
    state: Mutex<AlertState>,
}

impl<S: AlertSink, R: ReminderRelay> AlertEngine<S, R> {
    /// Restore persisted records. An unreadable record list starts empty.
    pub fn load(
        sink: Arc<S>,
        relay: R,
        store: SharedStore,
        clock: Arc<dyn Clock>,
        config: AlertConfig,
    ) -> crate::Result<Self> {
        let records: Vec<AlertRecord> = match read_json(store.as_ref(), RECORDS_KEY) {
            Ok(records) => records.unwrap_or_default(),
            Err(err) => {
                warn!(?err, "dropping unreadable alert records");
                Vec::new()
            }
        };
        let records = records
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();
        Ok(Self {
            sink,
            relay,
            store,
            clock,
            config,
            state: Mutex::new(AlertState {
                enabled: true,
                loops: HashMap::new(),
                records,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> AlertConfig {
        self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn is_notified(&self, key: &str) -> bool {
        self.lock()
            .records
            .get(key)
            .is_some_and(|record| record.fired_at.is_some())
    }

    pub fn is_snoozed(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        is_snoozed(&self.lock(), key, now)
    }

    pub fn active_loops(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().loops.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Ping the sink now, then every cadence until stopped. A key whose loop is
    /// already running is left alone.
    pub fn start_loop(&self, key: &str, pattern: &[u64]) -> crate::Result<()> {
        let mut state = self.lock();
        if !state.enabled {
            return Ok(());
        }
        self.start_locked(&mut state, key, pattern);
        self.persist(&state)
    }

    fn start_locked(&self, state: &mut AlertState, key: &str, pattern: &[u64]) {
        if state.loops.get(key).is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let now = self.clock.now_millis();
        state
            .records
            .entry(key.to_string())
            .and_modify(|record| record.fired_at = Some(now))
            .or_insert_with(|| AlertRecord {
                key: key.to_string(),
                fired_at: Some(now),
                snoozed_until: None,
            });

        self.sink.alert(key, pattern);
        let cadence = self.config.cadence();
        let sink = Arc::clone(&self.sink);
        let loop_key = key.to_string();
        let pattern = pattern.to_vec();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + cadence, cadence);
            loop {
                ticker.tick().await;
                sink.alert(&loop_key, &pattern);
            }
        });
        state.loops.insert(key.to_string(), handle);
        debug!(key, ?cadence, "alert loop started");
    }

    /// Stop the loop and clear the notified mark, so the key may fire again.
    pub fn stop_loop(&self, key: &str) -> crate::Result<()> {
        let mut state = self.lock();
        self.stop_locked(&mut state, key);
        self.persist(&state)
    }

    fn stop_locked(&self, state: &mut AlertState, key: &str) {
        let had_loop = match state.loops.remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };
        let now = self.clock.now_millis();
        if let Some(record) = state.records.get_mut(key) {
            record.fired_at = None;
            if !record.snoozed_until.is_some_and(|until| until > now) {
                state.records.remove(key);
            }
        }
        if had_loop && state.loops.is_empty() {
            self.sink.all_clear();
        }
    }

    /// Silence `key` for the configured snooze period.
    pub fn snooze(&self, key: &str) -> crate::Result<()> {
        let mut state = self.lock();
        let until = self.clock.now_millis() + self.config.snooze.as_millis() as i64;
        self.stop_locked(&mut state, key);
        state
            .records
            .entry(key.to_string())
            .or_insert_with(|| AlertRecord {
                key: key.to_string(),
                fired_at: None,
                snoozed_until: None,
            })
            .snoozed_until = Some(until);
        info!(key, until, "alert snoozed");
        self.persist(&state)
    }

    /// Disabling stops every loop.
    pub fn set_enabled(&self, enabled: bool) -> crate::Result<()> {
        let mut state = self.lock();
        state.enabled = enabled;
        if !enabled {
            let keys: Vec<String> = state.loops.keys().cloned().collect();
            for key in keys {
                self.stop_locked(&mut state, &key);
            }
            let notified: Vec<String> = state
                .records
                .values()
                .filter(|record| record.fired_at.is_some())
                .map(|record| record.key.clone())
                .collect();
            for key in notified {
                self.stop_locked(&mut state, &key);
            }
        }
        self.persist(&state)
    }

    /// Fire the first condition that is neither notified nor snoozed, send its
    /// reminder, then stop every notified key that is no longer actionable.
    /// Returns the key that fired, if any.
    pub async fn evaluate(
        &self,
        viewer: &Address,
        conditions: &[ActionableCondition],
    ) -> crate::Result<Option<String>> {
        let now = self.clock.now_millis();
        let triggered = {
            let mut state = self.lock();
            if !state.enabled {
                return Ok(None);
            }
            let fresh = conditions.iter().find(|condition| {
                let notified = state
                    .records
                    .get(&condition.key)
                    .is_some_and(|record| record.fired_at.is_some());
                !notified && !is_snoozed(&state, &condition.key, now)
            });
            if let Some(condition) = fresh {
                let pattern = condition.kind.pattern(self.config.vibration_ms);
                self.start_locked(&mut state, &condition.key, &pattern);
            }
            // notified in an earlier session, no loop running in this one
            let restored: Vec<&ActionableCondition> = conditions
                .iter()
                .filter(|condition| {
                    state
                        .records
                        .get(&condition.key)
                        .is_some_and(|record| record.fired_at.is_some())
                        && !state.loops.contains_key(&condition.key)
                        && !is_snoozed(&state, &condition.key, now)
                })
                .collect();
            for condition in restored {
                debug!(key = %condition.key, "re-arming restored alert");
                let pattern = condition.kind.pattern(self.config.vibration_ms);
                self.start_locked(&mut state, &condition.key, &pattern);
            }

            let actionable: HashSet<&str> =
                conditions.iter().map(|condition| condition.key.as_str()).collect();
            let stale: Vec<String> = state
                .records
                .values()
                .filter(|record| record.fired_at.is_some())
                .map(|record| record.key.clone())
                .filter(|key| !actionable.contains(key.as_str()))
                .collect();
            for key in stale {
                debug!(key, "condition cleared, stopping alert");
                self.stop_locked(&mut state, &key);
            }
            state.records.retain(|_, record| {
                record.fired_at.is_some() || record.snoozed_until.is_some_and(|until| until > now)
            });
            self.persist(&state)?;
            fresh.cloned()
        };

        let Some(condition) = triggered else {
            return Ok(None);
        };
        let reminder = Reminder::for_condition(*viewer, &condition, now);
        if let Err(err) = self.relay.send(reminder).await {
            warn!(?err, key = %condition.key, "failed to send reminder");
        }
        Ok(Some(condition.key))
    }

    /// Abort every timer; records stay persisted.
    pub fn dispose(&self) {
        let mut state = self.lock();
        for (_, handle) in state.loops.drain() {
            handle.abort();
        }
    }

    fn persist(&self, state: &AlertState) -> crate::Result<()> {
        let records: Vec<&AlertRecord> = state.records.values().collect();
        write_json(self.store.as_ref(), RECORDS_KEY, &records)
    }
}

fn is_snoozed(state: &AlertState, key: &str, now: i64) -> bool {
    state
        .records
        .get(key)
        .and_then(|record| record.snoozed_until)
        .is_some_and(|until| until > now)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::{
        clock::ManualClock,
        room::Side,
        storage::InMemoryStore,
        test_helpers::{
            CREATOR,
            RecordingRelay,
            RecordingSink,
            START_SECS,
            SinkCall,
        },
    };

    struct Fixture {
        sink: RecordingSink,
        relay: RecordingRelay,
        clock: ManualClock,
        store: InMemoryStore,
        alerts: AlertEngine<RecordingSink, RecordingRelay>,
    }

    fn fixture() -> Fixture {
        let sink = RecordingSink::default();
        let relay = RecordingRelay::default();
        let clock = ManualClock::at_secs(START_SECS);
        let store = InMemoryStore::new();
        let alerts = AlertEngine::load(
            Arc::new(sink.clone()),
            relay.clone(),
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            AlertConfig::default(),
        )
        .unwrap();
        Fixture {
            sink,
            relay,
            clock,
            store,
            alerts,
        }
    }

    fn condition(kind: AlertKind, room_id: u64) -> ActionableCondition {
        ActionableCondition {
            key: kind.key(room_id),
            kind,
            room_id,
            deadline: Some(START_SECS + 60),
        }
    }

    #[test]
    fn cadence__never_below_1600ms() {
        let short = AlertConfig {
            vibration_ms: 100,
            ..AlertConfig::default()
        };
        let long = AlertConfig {
            vibration_ms: 1_500,
            ..AlertConfig::default()
        };

        assert_eq!(short.cadence(), Duration::from_millis(1_600));
        assert_eq!(long.cadence(), Duration::from_millis(2_100));
    }

    #[tokio::test(start_paused = true)]
    async fn start_loop__fires_immediately_then_on_cadence() {
        // given
        let f = fixture();

        // when
        f.alerts.start_loop("claim-1", &[220]).unwrap();
        let immediate = f.sink.alerts_for("claim-1");
        time::sleep(Duration::from_millis(1_650)).await;

        // then
        assert_eq!(immediate, 1);
        assert_eq!(f.sink.alerts_for("claim-1"), 2);
        f.alerts.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn start_loop__second_start_of_active_key__is_ignored() {
        let f = fixture();

        f.alerts.start_loop("claim-1", &[220]).unwrap();
        f.alerts.start_loop("claim-1", &[220]).unwrap();

        assert_eq!(f.sink.alerts_for("claim-1"), 1);
        assert_eq!(f.alerts.active_loops(), vec!["claim-1".to_string()]);
        f.alerts.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_loop__last_loop__sends_all_clear_and_stops_pulses() {
        // given
        let f = fixture();
        f.alerts.start_loop("claim-1", &[220]).unwrap();

        // when
        f.alerts.stop_loop("claim-1").unwrap();
        time::sleep(Duration::from_secs(10)).await;

        // then
        assert_eq!(f.sink.alerts_for("claim-1"), 1);
        assert_eq!(f.sink.all_clears(), 1);
        assert!(!f.alerts.is_notified("claim-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate__same_conditions_twice__alerts_and_reminds_once() {
        // given
        let f = fixture();
        let conditions = vec![condition(AlertKind::Claim, 3)];

        // when
        let first = f.alerts.evaluate(&CREATOR, &conditions).await.unwrap();
        let second = f.alerts.evaluate(&CREATOR, &conditions).await.unwrap();

        // then
        assert_eq!(first.as_deref(), Some("claim-3"));
        assert_eq!(second, None);
        assert_eq!(f.sink.alerts_for("claim-3"), 1);
        let reminders = f.relay.reminders();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].kind, "claim");
        assert_eq!(reminders[0].room_id, 3);
        f.alerts.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate__several_new_conditions__fires_one_per_cycle() {
        let f = fixture();
        let conditions = vec![
            condition(AlertKind::Claim, 1),
            condition(AlertKind::NeedReveal(Side::Creator), 2),
        ];

        let first = f.alerts.evaluate(&CREATOR, &conditions).await.unwrap();
        let second = f.alerts.evaluate(&CREATOR, &conditions).await.unwrap();
        let third = f.alerts.evaluate(&CREATOR, &conditions).await.unwrap();

        assert_eq!(first.as_deref(), Some("claim-1"));
        assert_eq!(second.as_deref(), Some("need-reveal-2-A"));
        assert_eq!(third, None);
        assert_eq!(
            f.sink.calls()[1],
            SinkCall::Alert {
                key: "need-reveal-2-A".to_string(),
                pattern: vec![220, 80, 220],
            }
        );
        f.alerts.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate__condition_cleared__stops_its_loop() {
        // given
        let f = fixture();
        let key = AlertKind::NeedCommit(Side::Creator).key(4);
        f.alerts
            .evaluate(&CREATOR, &[condition(AlertKind::NeedCommit(Side::Creator), 4)])
            .await
            .unwrap();

        // when
        f.alerts.evaluate(&CREATOR, &[]).await.unwrap();

        // then
        assert!(f.alerts.active_loops().is_empty());
        assert!(!f.alerts.is_notified(&key));
        assert_eq!(f.sink.all_clears(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snooze__suppresses_until_expiry() {
        // given
        let f = fixture();
        let conditions = vec![condition(AlertKind::Claim, 5)];
        f.alerts.evaluate(&CREATOR, &conditions).await.unwrap();

        // when
        f.alerts.snooze("claim-5").unwrap();
        let during = f.alerts.evaluate(&CREATOR, &conditions).await.unwrap();
        f.clock.advance_secs(121);
        let after = f.alerts.evaluate(&CREATOR, &conditions).await.unwrap();

        // then
        assert_eq!(during, None);
        assert_eq!(after.as_deref(), Some("claim-5"));
        assert_eq!(f.sink.alerts_for("claim-5"), 2);
        f.alerts.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn set_enabled__false__stops_everything_and_blocks_new_alerts() {
        let f = fixture();
        f.alerts.start_loop("claim-1", &[220]).unwrap();

        f.alerts.set_enabled(false).unwrap();
        let fired = f
            .alerts
            .evaluate(&CREATOR, &[condition(AlertKind::Claim, 2)])
            .await
            .unwrap();

        assert!(f.alerts.active_loops().is_empty());
        assert_eq!(fired, None);
        assert_eq!(f.sink.all_clears(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate__relay_failure__is_swallowed() {
        let f = fixture();
        f.relay.set_failing(true);

        let fired = f
            .alerts
            .evaluate(&CREATOR, &[condition(AlertKind::CommitUrgent, 6)])
            .await
            .unwrap();

        assert_eq!(fired.as_deref(), Some("commit-urgent-6"));
        assert!(f.relay.reminders().is_empty());
        f.alerts.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn load__notified_condition_still_holds__loop_rearmed_without_reminder() {
        // given
        let f = fixture();
        let conditions = vec![condition(AlertKind::Claim, 8)];
        f.alerts.evaluate(&CREATOR, &conditions).await.unwrap();
        f.alerts.dispose();
        let sink = RecordingSink::default();
        let relay = RecordingRelay::default();
        let reloaded = AlertEngine::load(
            Arc::new(sink.clone()),
            relay.clone(),
            Arc::new(f.store.clone()),
            Arc::new(f.clock.clone()),
            AlertConfig::default(),
        )
        .unwrap();

        // when
        let fired = reloaded.evaluate(&CREATOR, &conditions).await.unwrap();
        let again = reloaded.evaluate(&CREATOR, &conditions).await.unwrap();

        // then
        assert_eq!(fired, None);
        assert_eq!(again, None);
        assert_eq!(reloaded.active_loops(), vec!["claim-8".to_string()]);
        assert_eq!(sink.alerts_for("claim-8"), 1);
        assert!(relay.reminders().is_empty());
        reloaded.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn load__restores_snoozes_from_store() {
        // given
        let f = fixture();
        f.alerts.snooze("need-reveal-9-B").unwrap();

        // when
        let reloaded = AlertEngine::load(
            Arc::new(RecordingSink::default()),
            RecordingRelay::default(),
            Arc::new(f.store.clone()),
            Arc::new(f.clock.clone()),
            AlertConfig::default(),
        )
        .unwrap();

        // then
        assert!(reloaded.is_snoozed("need-reveal-9-B"));
        assert!(!reloaded.is_snoozed("claim-9"));
    }
}
