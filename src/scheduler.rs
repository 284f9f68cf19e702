// FIFO request scheduler: a sliding window of start instants bounded by
// `max_requests` per `interval`, a cap on in-flight requests and a cooldown
// that rate-limit failures push forward.
use crate::rpc::RpcError;
use anyhow::anyhow;
use reqwest::StatusCode;
use std::{
    collections::VecDeque,
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
    sync::oneshot,
    time::{
        self,
        Instant,
    },
};
use tracing::warn;

const RATE_LIMIT_PATTERNS: [&str; 3] = ["429", "rate limit", "too many requests"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_requests: usize,
    pub interval: Duration,
}

impl SchedulerConfig {
    pub fn new(max_requests: usize, interval: Duration) -> Self {
        Self {
            max_requests,
            interval,
        }
    }

    /// One request at a time, starts at least `spacing` apart.
    pub fn spaced(spacing: Duration) -> Self {
        Self::new(1, spacing)
    }

    fn is_unlimited(&self) -> bool {
        self.max_requests == 0 || self.interval.is_zero()
    }
}

/// Cloning shares the quota, so independent callers cannot jointly exceed it.
#[derive(Clone)]
pub struct RequestScheduler {
    config: SchedulerConfig,
    state: Arc<Mutex<SchedulerState>>,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<oneshot::Sender<Permit>>,
    starts: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    active: usize,
    timer_armed: bool,
}

impl SchedulerState {
    fn prune(&mut self, now: Instant, interval: Duration) {
        while let Some(first) = self.starts.front() {
            if now.saturating_duration_since(*first) >= interval {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait_before_start(&self, now: Instant, config: &SchedulerConfig) -> Option<Duration> {
        let quota_wait = if self.starts.len() >= config.max_requests {
            self.starts
                .front()
                .map(|first| (*first + config.interval).saturating_duration_since(now))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };
        let cooldown_wait = self
            .cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        let wait = quota_wait.max(cooldown_wait);
        (!wait.is_zero()).then_some(wait)
    }
}

/// Slot held while a request runs. Dropping it frees the slot and advances the
/// queue, which also covers callers that are cancelled mid-request.
pub struct Permit {
    scheduler: Option<RequestScheduler>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.release();
        }
    }
}

impl RequestScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Run `task` once the window and cooldown allow it. The task's own error is
    /// returned unchanged; a rate-limit error additionally extends the cooldown
    /// by one interval.
    pub async fn run<T, F, Fut>(&self, task: F) -> crate::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let _permit = self.acquire().await?;
        let result = task().await;
        if let Err(err) = &result {
            if is_rate_limit_error(err) {
                warn!(error = %err, "rate limited, extending request cooldown");
                self.extend_cooldown(self.config.interval);
            }
        }
        result
    }

    pub async fn acquire(&self) -> crate::Result<Permit> {
        if self.config.is_unlimited() {
            return Ok(Permit { scheduler: None });
        }
        let (tx, rx) = oneshot::channel();
        self.lock().queue.push_back(tx);
        self.pump();
        rx.await
            .map_err(|_| anyhow!("request scheduler dropped a queued request"))
    }

    /// Push the cooldown to at least `duration` from now.
    pub fn extend_cooldown(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.lock();
        state.cooldown_until = Some(match state.cooldown_until {
            Some(current) if current > until => current,
            _ => until,
        });
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.pump();
    }

    fn pump(&self) {
        let mut granted = Vec::new();
        {
            let mut state = self.lock();
            loop {
                let now = Instant::now();
                state.prune(now, self.config.interval);
                while state.queue.front().is_some_and(|tx| tx.is_closed()) {
                    state.queue.pop_front();
                }
                if state.queue.is_empty() || state.active >= self.config.max_requests {
                    break;
                }
                if let Some(wait) = state.wait_before_start(now, &self.config) {
                    if !state.timer_armed {
                        state.timer_armed = true;
                        self.arm_timer(wait);
                    }
                    break;
                }
                let Some(tx) = state.queue.pop_front() else {
                    break;
                };
                state.active += 1;
                state.starts.push_back(now);
                granted.push(tx);
            }
        }
        for tx in granted {
            let permit = Permit {
                scheduler: Some(self.clone()),
            };
            // a caller that vanished hands the permit back, releasing the slot
            let _ = tx.send(permit);
        }
    }

    fn arm_timer(&self, wait: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            time::sleep(wait).await;
            scheduler.lock().timer_armed = false;
            scheduler.pump();
        });
    }
}

/// HTTP 429 anywhere in the chain, or a message that reads like a rate limit.
pub fn is_rate_limit_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(rpc) = cause.downcast_ref::<RpcError>() {
            if rpc.is_rate_limited() {
                return true;
            }
        }
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            if http.status() == Some(StatusCode::TOO_MANY_REQUESTS) {
                return true;
            }
        }
        let message = cause.to_string().to_ascii_lowercase();
        RATE_LIMIT_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
    })
}
