use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Minimum distance between two on-demand refreshes.
pub const REFRESH_THROTTLE: Duration = Duration::from_millis(1_200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub refresh_throttle: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_backoff: DEFAULT_MAX_BACKOFF,
            refresh_throttle: REFRESH_THROTTLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    Idle { next_wake: Instant },
    InFlight { refresh_pending: bool },
}

/// When the next room poll should start. Pure bookkeeping over
/// `tokio::time::Instant`, so it runs unchanged under paused test time.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    config: PollConfig,
    state: PollState,
    failures: u32,
    last_refresh: Option<Instant>,
}

impl PollSchedule {
    /// First poll is due immediately.
    pub fn new(config: PollConfig, now: Instant) -> Self {
        Self {
            config,
            state: PollState::Idle { next_wake: now },
            failures: 0,
            last_refresh: None,
        }
    }

    /// `None` while a poll is in flight.
    pub fn next_wake(&self) -> Option<Instant> {
        match self.state {
            PollState::Idle { next_wake } => Some(next_wake),
            PollState::InFlight { .. } => None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_wake().is_some_and(|wake| wake <= now)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Enter the in-flight state. Returns false when a poll is already running.
    pub fn begin(&mut self) -> bool {
        match self.state {
            PollState::Idle { .. } => {
                self.state = PollState::InFlight {
                    refresh_pending: false,
                };
                true
            }
            PollState::InFlight { .. } => false,
        }
    }

    /// Leave the in-flight state. Failures back off exponentially up to the
    /// configured cap; a refresh requested meanwhile runs right away.
    pub fn complete(&mut self, now: Instant, success: bool) {
        let refresh_pending = matches!(
            self.state,
            PollState::InFlight {
                refresh_pending: true
            }
        );
        if success {
            self.failures = 0;
        } else {
            self.failures = self.failures.saturating_add(1);
        }
        let next_wake = if refresh_pending {
            now
        } else {
            now + self.delay()
        };
        self.state = PollState::Idle { next_wake };
    }

    fn delay(&self) -> Duration {
        if self.failures == 0 {
            return self.config.interval;
        }
        let factor = 1u32 << self.failures.min(16);
        self.config
            .interval
            .saturating_mul(factor)
            .min(self.config.max_backoff.max(self.config.interval))
    }

    /// Ask for a poll as soon as possible, at most once per throttle period.
    /// Returns whether the request was accepted.
    pub fn request_refresh(&mut self, now: Instant) -> bool {
        if self
            .last_refresh
            .is_some_and(|last| now.duration_since(last) < self.config.refresh_throttle)
        {
            return false;
        }
        self.last_refresh = Some(now);
        match &mut self.state {
            PollState::Idle { next_wake } => *next_wake = (*next_wake).min(now),
            PollState::InFlight { refresh_pending } => *refresh_pending = true,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    fn schedule(now: Instant) -> PollSchedule {
        PollSchedule::new(PollConfig::default(), now)
    }

    #[tokio::test(start_paused = true)]
    async fn new__first_poll_is_due_immediately() {
        let now = Instant::now();
        let schedule = schedule(now);

        assert!(schedule.is_due(now));
    }

    #[tokio::test(start_paused = true)]
    async fn complete__success__next_wake_after_interval() {
        // given
        let now = Instant::now();
        let mut schedule = schedule(now);
        assert!(schedule.begin());
        assert_eq!(schedule.next_wake(), None);

        // when
        schedule.complete(now, true);

        // then
        assert_eq!(schedule.next_wake(), Some(now + DEFAULT_POLL_INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn complete__repeated_failures__back_off_up_to_cap() {
        let now = Instant::now();
        let mut schedule = schedule(now);
        let mut waits = Vec::new();

        for _ in 0..7 {
            schedule.begin();
            schedule.complete(now, false);
            waits.push(schedule.next_wake().unwrap() - now);
        }

        assert_eq!(
            waits,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
        schedule.begin();
        schedule.complete(now, true);
        assert_eq!(schedule.failures(), 0);
        assert_eq!(schedule.next_wake(), Some(now + DEFAULT_POLL_INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn begin__while_in_flight__is_refused() {
        let mut schedule = schedule(Instant::now());

        assert!(schedule.begin());
        assert!(!schedule.begin());
    }

    #[tokio::test(start_paused = true)]
    async fn request_refresh__throttled_to_one_per_period() {
        // given
        let start = Instant::now();
        let mut schedule = schedule(start);
        schedule.begin();
        schedule.complete(start, true);

        // when
        let first = schedule.request_refresh(start + Duration::from_millis(100));
        let second = schedule.request_refresh(start + Duration::from_millis(900));
        let third = schedule.request_refresh(start + Duration::from_millis(1_400));

        // then
        assert!(first);
        assert!(!second);
        assert!(third);
        assert_eq!(
            schedule.next_wake(),
            Some(start + Duration::from_millis(100))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn request_refresh__during_poll__runs_right_after_completion() {
        let now = Instant::now();
        let mut schedule = schedule(now);
        schedule.begin();

        schedule.request_refresh(now);
        schedule.complete(now + Duration::from_millis(300), true);

        assert_eq!(
            schedule.next_wake(),
            Some(now + Duration::from_millis(300))
        );
    }
}
