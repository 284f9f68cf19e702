// Drives a room through its remaining moves without user input. One task per
// room; toggling a running room asks it to stop at the next boundary.
use crate::{
    actions::RecommendedAction,
    room::{
        Choice,
        random_salt,
    },
    secrets::CommitSecret,
};
use alloy_primitives::B256;
use std::{
    collections::HashMap,
    future::Future,
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
    time::Duration,
};
use tokio::{
    sync::mpsc,
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStatus {
    pub action: Option<RecommendedAction>,
    pub terminal: bool,
    pub alert_key: Option<String>,
}

/// What auto-play needs from the session that owns it.
pub trait AutoPlayHost: Send + Sync + 'static {
    /// fresh status of `room_id` for the session's wallet, `None` when the room
    /// cannot be found or the wallet does not play in it
    fn room_status(
        &self,
        room_id: u64,
    ) -> impl Future<Output = crate::Result<Option<RoomStatus>>> + Send;

    fn commit_move(
        &self,
        room_id: u64,
        choice: Choice,
        salt: B256,
    ) -> impl Future<Output = crate::Result<()>> + Send;

    fn stored_secret(
        &self,
        room_id: u64,
    ) -> impl Future<Output = crate::Result<Option<CommitSecret>>> + Send;

    fn reveal_move(
        &self,
        room_id: u64,
        secret: CommitSecret,
    ) -> impl Future<Output = crate::Result<()>> + Send;

    fn claim(&self, room_id: u64) -> impl Future<Output = crate::Result<()>> + Send;

    fn clear_alert(&self, key: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoPlayOutcome {
    Stopped,
    Completed,
    NoAction,
    Stuck,
    MissingSecret,
    Failed(String),
    RoomMissing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoPlayReport {
    pub room_id: u64,
    pub outcome: AutoPlayOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Started,
    StopRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoPlayConfig {
    pub transition_poll: Duration,
    pub transition_timeout: Duration,
    pub idle_base: Duration,
    pub idle_step: Duration,
    pub idle_max: Duration,
}

impl Default for AutoPlayConfig {
    fn default() -> Self {
        Self {
            transition_poll: Duration::from_millis(650),
            transition_timeout: Duration::from_secs(45),
            idle_base: Duration::from_millis(750),
            idle_step: Duration::from_millis(250),
            idle_max: Duration::from_secs(5),
        }
    }
}

impl AutoPlayConfig {
    fn idle_backoff(&self, idle_cycles: u32) -> Duration {
        (self.idle_base + self.idle_step * idle_cycles).min(self.idle_max)
    }
}

#[derive(Clone)]
pub struct AutoPlayController {
    config: AutoPlayConfig,
    runs: Arc<Mutex<HashMap<u64, Arc<AtomicBool>>>>,
    reports: mpsc::UnboundedSender<AutoPlayReport>,
}

impl AutoPlayController {
    pub fn new(config: AutoPlayConfig) -> (Self, mpsc::UnboundedReceiver<AutoPlayReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            runs: Arc::default(),
            reports,
        };
        (controller, rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<AtomicBool>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, room_id: u64) -> bool {
        self.lock().contains_key(&room_id)
    }

    /// Start auto-play for `room_id`, or request a stop when it already runs.
    pub fn toggle<H: AutoPlayHost>(&self, room_id: u64, host: Arc<H>) -> Toggle {
        let cancel = {
            let mut runs = self.lock();
            if let Some(cancel) = runs.remove(&room_id) {
                cancel.store(true, Ordering::SeqCst);
                info!(room_id, "auto-play stop requested");
                return Toggle::StopRequested;
            }
            let cancel = Arc::new(AtomicBool::new(false));
            runs.insert(room_id, Arc::clone(&cancel));
            cancel
        };

        let controller = self.clone();
        tokio::spawn(async move {
            let outcome = controller.drive(room_id, host.as_ref(), &cancel).await;
            controller.finish(room_id, &cancel, outcome);
        });
        info!(room_id, "auto-play started");
        Toggle::Started
    }

    /// Cancel every run.
    pub fn stop_all(&self) {
        for (_, cancel) in self.lock().drain() {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    fn finish(&self, room_id: u64, cancel: &Arc<AtomicBool>, outcome: AutoPlayOutcome) {
        {
            let mut runs = self.lock();
            if runs.get(&room_id).is_some_and(|current| Arc::ptr_eq(current, cancel)) {
                runs.remove(&room_id);
            }
        }
        match &outcome {
            AutoPlayOutcome::Failed(message) => warn!(room_id, error = %message, "auto-play failed"),
            outcome => info!(room_id, ?outcome, "auto-play finished"),
        }
        // nobody listening is fine
        let _ = self.reports.send(AutoPlayReport { room_id, outcome });
    }

    async fn drive<H: AutoPlayHost>(
        &self,
        room_id: u64,
        host: &H,
        cancel: &AtomicBool,
    ) -> AutoPlayOutcome {
        let mut idle_cycles = 0u32;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return AutoPlayOutcome::Stopped;
            }
            let status = match host.room_status(room_id).await {
                Ok(Some(status)) => status,
                Ok(None) => return AutoPlayOutcome::RoomMissing,
                Err(err) => return AutoPlayOutcome::Failed(format!("{err:#}")),
            };
            if status.terminal {
                return AutoPlayOutcome::Completed;
            }
            let Some(action) = status.action else {
                let wait = self.config.idle_backoff(idle_cycles);
                idle_cycles = idle_cycles.saturating_add(1);
                debug!(room_id, ?wait, "auto-play idle");
                time::sleep(wait).await;
                continue;
            };
            if !action.is_automatable() {
                return AutoPlayOutcome::NoAction;
            }
            idle_cycles = 0;
            if cancel.load(Ordering::SeqCst) {
                return AutoPlayOutcome::Stopped;
            }
            if let Some(key) = &status.alert_key {
                host.clear_alert(key);
            }

            let performed = match action {
                RecommendedAction::Commit => {
                    host.commit_move(room_id, Choice::random(), random_salt())
                        .await
                }
                RecommendedAction::Reveal => match host.stored_secret(room_id).await {
                    Ok(Some(secret)) => host.reveal_move(room_id, secret).await,
                    Ok(None) => return AutoPlayOutcome::MissingSecret,
                    Err(err) => Err(err),
                },
                RecommendedAction::Claim => host.claim(room_id).await,
                RecommendedAction::Share => return AutoPlayOutcome::NoAction,
            };
            if let Err(err) = performed {
                return AutoPlayOutcome::Failed(format!("{err:#}"));
            }
            debug!(room_id, ?action, "auto-play action sent");

            if let Some(outcome) = self
                .wait_for_transition(room_id, host, action, cancel)
                .await
            {
                return outcome;
            }
        }
    }

    /// Poll until the room no longer asks for `action`. `Some` ends the run.
    async fn wait_for_transition<H: AutoPlayHost>(
        &self,
        room_id: u64,
        host: &H,
        action: RecommendedAction,
        cancel: &AtomicBool,
    ) -> Option<AutoPlayOutcome> {
        let deadline = Instant::now() + self.config.transition_timeout;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Some(AutoPlayOutcome::Stopped);
            }
            match host.room_status(room_id).await {
                Ok(Some(status)) if status.action == Some(action) && !status.terminal => {}
                Ok(Some(_)) => return None,
                Ok(None) => return Some(AutoPlayOutcome::RoomMissing),
                Err(err) => warn!(room_id, ?err, "auto-play status poll failed"),
            }
            if Instant::now() >= deadline {
                return Some(AutoPlayOutcome::Stuck);
            }
            time::sleep(self.config.transition_poll).await;
        }
    }
}
