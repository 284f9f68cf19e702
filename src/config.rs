use crate::{
    alerts::{
        AlertConfig,
        DEFAULT_SNOOZE_MINUTES,
        DEFAULT_VIBRATION_MS,
    },
    autoplay::AutoPlayConfig,
    chain::LogScanConfig,
    poller::PollConfig,
    scheduler::SchedulerConfig,
};
use alloy_primitives::Address;
use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    path::Path,
    time::Duration,
};
use url::Url;

/// Engine settings. Every field has a default, so a config file only needs
/// the values it changes. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_requests: usize,
    pub request_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_backoff_ms: u64,
    pub refresh_throttle_ms: u64,
    pub event_poll_ms: u64,
    pub notifications_enabled: bool,
    pub vibration_ms: u64,
    pub snooze_minutes: u64,
    pub log_chunk_size: u64,
    pub log_max_attempts: u32,
    pub log_spacing_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub deploy_block: u64,
    pub relay_url: Option<Url>,
    pub contract: Option<Address>,
    pub data_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let scan = LogScanConfig::default();
        Self {
            max_requests: 90,
            request_interval_ms: 1_000,
            poll_interval_ms: 1_000,
            max_poll_backoff_ms: 30_000,
            refresh_throttle_ms: 1_200,
            event_poll_ms: 4_000,
            notifications_enabled: true,
            vibration_ms: DEFAULT_VIBRATION_MS,
            snooze_minutes: DEFAULT_SNOOZE_MINUTES,
            log_chunk_size: scan.chunk_size,
            log_max_attempts: scan.max_attempts,
            log_spacing_ms: scan.spacing.as_millis() as u64,
            rate_limit_cooldown_ms: scan.rate_limit_cooldown.as_millis() as u64,
            deploy_block: scan.deploy_block,
            relay_url: None,
            contract: None,
            data_dir: "~/.rps-mirror".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// `data_dir` with a leading `~` expanded.
    pub fn expanded_data_dir(&self) -> String {
        shellexpand::tilde(&self.data_dir).into_owned()
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::new(
            self.max_requests,
            Duration::from_millis(self.request_interval_ms),
        )
    }

    pub fn poll(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_backoff: Duration::from_millis(self.max_poll_backoff_ms),
            refresh_throttle: Duration::from_millis(self.refresh_throttle_ms),
        }
    }

    pub fn alerts(&self) -> AlertConfig {
        AlertConfig {
            vibration_ms: self.vibration_ms,
            snooze: Duration::from_secs(self.snooze_minutes * 60),
        }
    }

    pub fn log_scan(&self) -> LogScanConfig {
        LogScanConfig {
            chunk_size: self.log_chunk_size,
            max_attempts: self.log_max_attempts,
            deploy_block: self.deploy_block,
            spacing: Duration::from_millis(self.log_spacing_ms),
            rate_limit_cooldown: Duration::from_millis(self.rate_limit_cooldown_ms),
        }
    }

    pub fn auto_play(&self) -> AutoPlayConfig {
        AutoPlayConfig::default()
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use std::io::Write;
    use tempdir::TempDir;

    #[test]
    fn load__partial_file__fills_in_defaults() {
        // given
        let dir = TempDir::new("engine_config").unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{ "vibration_ms": 400, "deploy_block": 1234 }"#)
            .unwrap();

        // when
        let config = EngineConfig::load(&path).unwrap();

        // then
        assert_eq!(config.vibration_ms, 400);
        assert_eq!(config.alerts().cadence(), Duration::from_millis(1_600));
        assert_eq!(config.log_scan().deploy_block, 1234);
        assert_eq!(config.log_scan().chunk_size, 90);
        assert_eq!(config.scheduler().max_requests, 90);
    }

    #[test]
    fn load__missing_file__names_the_path() {
        let err = EngineConfig::load("/definitely/not/here.json").unwrap_err();

        assert!(err.to_string().contains("/definitely/not/here.json"));
    }

    #[test]
    fn alerts__snooze_minutes_become_duration() {
        let config = EngineConfig {
            snooze_minutes: 5,
            ..EngineConfig::default()
        };

        assert_eq!(config.alerts().snooze, Duration::from_secs(300));
    }
}
