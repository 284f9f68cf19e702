// Capabilities the engine consumes from the room contract: scheduled reads,
// opaque transaction submission and the backward forfeit log scan.
use crate::{
    events::LogEvent,
    room::{
        Choice,
        ForfeitRecord,
        Room,
    },
    scheduler::{
        RequestScheduler,
        SchedulerConfig,
        is_rate_limit_error,
    },
};
use alloy_primitives::{
    Address,
    B256,
    U256,
    keccak256,
};
use anyhow::{
    Context,
    anyhow,
};
use std::{
    future::Future,
    time::Duration,
};
use tracing::debug;

/// Upper bound on a single `eth_getLogs` range.
pub const MAX_LOG_CHUNK: u64 = 100;

pub trait ChainReader: Send + Sync + 'static {
    /// id the contract will assign to the next created room
    fn next_room_id(&self) -> impl Future<Output = crate::Result<u64>> + Send;

    /// raw ABI words returned by `rooms(room_id)`
    fn room_words(
        &self,
        room_id: u64,
    ) -> impl Future<Output = crate::Result<Vec<B256>>> + Send;

    /// latest block height
    fn block_number(&self) -> impl Future<Output = crate::Result<u64>> + Send;

    /// `Forfeited` logs of `room_id` within `from_block..=to_block`, oldest first
    fn forfeit_logs(
        &self,
        room_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = crate::Result<Vec<ForfeitLog>>> + Send;

    /// every decodable contract event within `from_block..=to_block`
    fn contract_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = crate::Result<Vec<LogEvent>>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForfeitLog {
    pub block_number: u64,
    pub room_id: u64,
    pub record: ForfeitRecord,
}

/// State-changing contract calls. The engine never signs; it hands these to a
/// [`TransactionSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    CreateRoom {
        stake: U256,
        commit_duration_secs: u64,
    },
    JoinRoom {
        room_id: u64,
    },
    Commit {
        room_id: u64,
        commit_hash: B256,
    },
    Reveal {
        room_id: u64,
        choice: Choice,
        salt: B256,
    },
    ClaimTimeout {
        room_id: u64,
    },
    Forfeit {
        room_id: u64,
    },
}

impl ContractCall {
    pub fn signature(&self) -> &'static str {
        match self {
            ContractCall::CreateRoom { .. } => "createRoom(uint256,uint64)",
            ContractCall::JoinRoom { .. } => "joinRoom(uint256)",
            ContractCall::Commit { .. } => "commit(uint256,bytes32)",
            ContractCall::Reveal { .. } => "reveal(uint256,uint8,bytes32)",
            ContractCall::ClaimTimeout { .. } => "claimTimeout(uint256)",
            ContractCall::Forfeit { .. } => "forfeit(uint256)",
        }
    }

    pub fn room_id(&self) -> Option<u64> {
        match self {
            ContractCall::CreateRoom { .. } => None,
            ContractCall::JoinRoom { room_id }
            | ContractCall::Commit { room_id, .. }
            | ContractCall::Reveal { room_id, .. }
            | ContractCall::ClaimTimeout { room_id }
            | ContractCall::Forfeit { room_id } => Some(*room_id),
        }
    }

    /// ABI-encoded calldata, selector first.
    pub fn calldata(&self) -> Vec<u8> {
        let words: Vec<B256> = match self {
            ContractCall::CreateRoom {
                stake,
                commit_duration_secs,
            } => vec![B256::from(*stake), u64_word(*commit_duration_secs)],
            ContractCall::JoinRoom { room_id }
            | ContractCall::ClaimTimeout { room_id }
            | ContractCall::Forfeit { room_id } => vec![u64_word(*room_id)],
            ContractCall::Commit {
                room_id,
                commit_hash,
            } => vec![u64_word(*room_id), *commit_hash],
            ContractCall::Reveal {
                room_id,
                choice,
                salt,
            } => vec![
                u64_word(*room_id),
                u64_word(u64::from(choice.as_u8())),
                *salt,
            ],
        };
        encode_call(self.signature(), &words)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    pub success: bool,
}

pub trait TransactionSender: Send + Sync + 'static {
    /// submit `call` and wait for its receipt
    fn send(
        &self,
        call: ContractCall,
    ) -> impl Future<Output = crate::Result<TxReceipt>> + Send;

    /// account the transactions are signed for
    fn account(&self) -> Option<Address>;
}

/// Sender for watch-only sessions. It can follow an address without being
/// able to sign for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnlySender {
    watching: Option<Address>,
}

impl ReadOnlySender {
    pub fn watching(address: Address) -> Self {
        Self {
            watching: Some(address),
        }
    }
}

impl TransactionSender for ReadOnlySender {
    async fn send(&self, call: ContractCall) -> crate::Result<TxReceipt> {
        Err(anyhow!(
            "no wallet connected, cannot send {}",
            call.signature()
        ))
    }

    fn account(&self) -> Option<Address> {
        self.watching
    }
}

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn encode_call(signature: &str, words: &[B256]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + words.len() * 32);
    data.extend_from_slice(&selector(signature));
    for word in words {
        data.extend_from_slice(word.as_slice());
    }
    data
}

pub fn u64_word(value: u64) -> B256 {
    B256::from(U256::from(value))
}

/// Read and strictly decode one room through the request scheduler.
pub async fn read_room<C: ChainReader>(
    chain: &C,
    scheduler: &RequestScheduler,
    room_id: u64,
) -> crate::Result<Room> {
    let words = scheduler
        .run(|| chain.room_words(room_id))
        .await
        .with_context(|| format!("read room {room_id}"))?;
    let room =
        Room::decode(room_id, &words).with_context(|| format!("decode room {room_id}"))?;
    Ok(room)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogScanConfig {
    pub chunk_size: u64,
    pub max_attempts: u32,
    pub deploy_block: u64,
    pub spacing: Duration,
    pub rate_limit_cooldown: Duration,
}

impl Default for LogScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: 90,
            max_attempts: 20,
            deploy_block: 0,
            spacing: Duration::from_millis(180),
            rate_limit_cooldown: Duration::from_millis(2_000),
        }
    }
}

/// Backward, chunked search for the newest `Forfeited` log of a room. Every
/// read takes a slot of the shared `scheduler`; `pacing` adds the chunk spacing
/// on top of that quota.
#[derive(Clone)]
pub struct ForfeitScanner {
    config: LogScanConfig,
    scheduler: RequestScheduler,
    pacing: RequestScheduler,
}

impl ForfeitScanner {
    pub fn new(config: LogScanConfig, scheduler: RequestScheduler) -> Self {
        Self {
            config,
            scheduler,
            pacing: RequestScheduler::new(SchedulerConfig::spaced(config.spacing)),
        }
    }

    async fn paced<T, F, Fut>(&self, task: F) -> crate::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let _spacing = self.pacing.acquire().await?;
        self.scheduler.run(task).await
    }

    pub async fn latest_forfeit<C: ChainReader>(
        &self,
        chain: &C,
        room_id: u64,
        latest_block: Option<u64>,
    ) -> crate::Result<Option<ForfeitLog>> {
        let chunk = self.config.chunk_size.clamp(1, MAX_LOG_CHUNK);
        let latest = match latest_block {
            Some(latest) => latest,
            None => self
                .paced(|| chain.block_number())
                .await
                .context("read latest block for forfeit scan")?,
        };
        let floor = self.config.deploy_block.min(latest);
        let mut to_block = latest;

        for _ in 0..self.config.max_attempts {
            let from_block = to_block.saturating_sub(chunk - 1).max(floor);
            match self
                .paced(|| chain.forfeit_logs(room_id, from_block, to_block))
                .await
            {
                Ok(logs) => {
                    if let Some(log) = logs.into_iter().last() {
                        return Ok(Some(log));
                    }
                }
                Err(err) if is_rate_limit_error(&err) => {
                    debug!(room_id, from_block, to_block, "forfeit scan rate limited");
                    self.scheduler
                        .extend_cooldown(self.config.rate_limit_cooldown);
                    continue;
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "scan forfeit logs of room {room_id} in {from_block}..={to_block}"
                    )));
                }
            }
            if from_block <= floor {
                break;
            }
            to_block = from_block - 1;
        }
        Ok(None)
    }
}
