// Contract event logs and the polling stream that feeds them to the engine.
use crate::{
    chain::ChainReader,
    room::ForfeitRecord,
    scheduler::RequestScheduler,
};
use alloy_primitives::{
    Address,
    B256,
    U256,
    keccak256,
};
use futures::{
    Stream,
    StreamExt,
    stream,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::time;
use tracing::{
    debug,
    warn,
};

pub const ROOM_CREATED: &str = "RoomCreated(uint256,address,uint256)";
pub const JOINED: &str = "Joined(uint256,address)";
pub const COMMITTED: &str = "Committed(uint256,address)";
pub const REVEALED: &str = "Revealed(uint256,address)";
pub const FORFEITED: &str = "Forfeited(uint256,address,address,uint256)";

/// Widest block range requested in one event poll.
const MAX_EVENT_SPAN: u64 = 1_000;

pub fn topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    RoomCreated {
        room_id: u64,
        creator: Address,
        stake: U256,
    },
    Joined {
        room_id: u64,
        opponent: Address,
    },
    Committed {
        room_id: u64,
        player: Address,
    },
    Revealed {
        room_id: u64,
        player: Address,
    },
    Forfeited {
        room_id: u64,
        record: ForfeitRecord,
    },
}

impl LogEvent {
    pub fn room_id(&self) -> u64 {
        match self {
            LogEvent::RoomCreated { room_id, .. }
            | LogEvent::Joined { room_id, .. }
            | LogEvent::Committed { room_id, .. }
            | LogEvent::Revealed { room_id, .. }
            | LogEvent::Forfeited { room_id, .. } => *room_id,
        }
    }

    /// Decode a raw log. Unknown signatures and malformed logs yield `None`.
    pub fn decode(topics: &[B256], data: &[u8]) -> Option<Self> {
        let signature = topics.first()?;
        let room_id = word_to_u64(topics.get(1)?)?;
        let event = if *signature == topic(ROOM_CREATED) {
            LogEvent::RoomCreated {
                room_id,
                creator: word_to_address(topics.get(2)?)?,
                stake: data_word(data, 0)?,
            }
        } else if *signature == topic(JOINED) {
            LogEvent::Joined {
                room_id,
                opponent: word_to_address(topics.get(2)?)?,
            }
        } else if *signature == topic(COMMITTED) {
            LogEvent::Committed {
                room_id,
                player: word_to_address(topics.get(2)?)?,
            }
        } else if *signature == topic(REVEALED) {
            LogEvent::Revealed {
                room_id,
                player: word_to_address(topics.get(2)?)?,
            }
        } else if *signature == topic(FORFEITED) {
            LogEvent::Forfeited {
                room_id,
                record: ForfeitRecord::new(
                    word_to_address(topics.get(2)?)?,
                    word_to_address(topics.get(3)?)?,
                    data_word(data, 0)?,
                ),
            }
        } else {
            return None;
        };
        Some(event)
    }
}

pub(crate) fn word_to_u64(word: &B256) -> Option<u64> {
    let value = U256::from_be_bytes(word.0);
    let limbs = value.as_limbs();
    limbs[1..].iter().all(|limb| *limb == 0).then_some(limbs[0])
}

fn word_to_address(word: &B256) -> Option<Address> {
    word[..12]
        .iter()
        .all(|b| *b == 0)
        .then(|| Address::from_slice(&word[12..]))
}

fn data_word(data: &[u8], index: usize) -> Option<U256> {
    let start = index * 32;
    let bytes = data.get(start..start + 32)?;
    Some(U256::from_be_slice(bytes))
}

/// Poll the contract's logs every `every`, starting at `from_block`. Failed
/// polls are logged and retried on the next tick.
pub fn poll_contract_events<C: ChainReader>(
    chain: Arc<C>,
    scheduler: RequestScheduler,
    from_block: u64,
    every: Duration,
) -> impl Stream<Item = LogEvent> + Send {
    stream::unfold(
        (chain, scheduler, from_block),
        move |(chain, scheduler, next_block)| async move {
            loop {
                time::sleep(every).await;
                let latest = match scheduler.run(|| chain.block_number()).await {
                    Ok(latest) => latest,
                    Err(err) => {
                        warn!(?err, "block number poll failed");
                        continue;
                    }
                };
                if latest < next_block {
                    continue;
                }
                let to_block = latest.min(next_block.saturating_add(MAX_EVENT_SPAN - 1));
                match scheduler
                    .run(|| chain.contract_events(next_block, to_block))
                    .await
                {
                    Ok(events) => {
                        debug!(from = next_block, to = to_block, count = events.len(), "polled contract events");
                        return Some((events, (chain, scheduler, to_block + 1)));
                    }
                    Err(err) => warn!(?err, "event log poll failed"),
                }
            }
        },
    )
    .flat_map(stream::iter)
}
