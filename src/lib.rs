pub mod actions;
pub mod aggregator;
pub mod alerts;
pub mod autoplay;
pub mod availability;
pub mod chain;
pub mod clock;
pub mod config;
pub mod deadlines;
pub mod engine;
pub mod events;
pub mod outcome;
pub mod poller;
pub mod room;
pub mod rpc;
pub mod scheduler;
pub mod secrets;
pub mod stats;
pub mod storage;

pub mod test_helpers;

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
