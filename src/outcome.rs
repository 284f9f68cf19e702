use crate::room::{
    Choice,
    Room,
    RoomState,
    Side,
};
use alloy_primitives::{
    Address,
    U256,
};
use serde::Serialize;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Winner {
    Creator,
    Opponent,
    Draw,
}

impl From<Side> for Winner {
    fn from(side: Side) -> Self {
        match side {
            Side::Creator => Winner::Creator,
            Side::Opponent => Winner::Opponent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OutcomeVia {
    Normal,
    CommitTimeout,
    RevealTimeout,
    BothCommitTimeout,
    BothRevealTimeout,
    Forfeit,
    Unknown,
}

impl fmt::Display for OutcomeVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeVia::Normal => "normal",
            OutcomeVia::CommitTimeout => "commit-timeout",
            OutcomeVia::RevealTimeout => "reveal-timeout",
            OutcomeVia::BothCommitTimeout => "both-commit-timeout",
            OutcomeVia::BothRevealTimeout => "both-reveal-timeout",
            OutcomeVia::Forfeit => "forfeit",
            OutcomeVia::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Outcome {
    pub winner: Option<Winner>,
    pub via: OutcomeVia,
}

impl Outcome {
    const PENDING: Outcome = Outcome {
        winner: None,
        via: OutcomeVia::Unknown,
    };

    fn won_by(side: Side, via: OutcomeVia) -> Self {
        Self {
            winner: Some(side.into()),
            via,
        }
    }

    fn draw(via: OutcomeVia) -> Self {
        Self {
            winner: Some(Winner::Draw),
            via,
        }
    }

    /// Result as seen by `viewer`, `None` for spectators and unresolved rooms.
    pub fn result_for(&self, room: &Room, viewer: &Address) -> Option<PersonalResult> {
        let side = room.side_of(viewer)?;
        match self.winner? {
            Winner::Draw => Some(PersonalResult::Draw),
            winner if winner == Winner::from(side) => Some(PersonalResult::Win),
            _ => Some(PersonalResult::Loss),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PersonalResult {
    Win,
    Loss,
    Draw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForfeitResolution {
    pub winner: Side,
    pub loser: Side,
    pub winner_address: Address,
    pub loser_address: Address,
    pub payout: Option<U256>,
}

impl ForfeitResolution {
    pub fn result_for(&self, viewer: &Address) -> Option<PersonalResult> {
        if viewer.is_zero() {
            None
        } else if *viewer == self.winner_address {
            Some(PersonalResult::Win)
        } else if *viewer == self.loser_address {
            Some(PersonalResult::Loss)
        } else {
            None
        }
    }
}

/// Match the forfeit record's addresses against the room's seats. A missing
/// side is inferred from the one that matched.
pub fn resolve_forfeit(room: &Room) -> Option<ForfeitResolution> {
    let record = room.forfeit.as_ref()?;
    let winner_side = record.winner.and_then(|address| room.side_of(&address));
    let loser_side = record.loser.and_then(|address| room.side_of(&address));
    let (winner, loser) = match (winner_side, loser_side) {
        (Some(winner), _) => (winner, winner.other()),
        (None, Some(loser)) => (loser.other(), loser),
        (None, None) => return None,
    };
    Some(ForfeitResolution {
        winner,
        loser,
        winner_address: room.address_of(winner),
        loser_address: room.address_of(loser),
        payout: record.payout,
    })
}

pub fn room_is_finalized(room: &Room) -> bool {
    if resolve_forfeit(room).is_some() {
        return true;
    }
    match room.state {
        RoomState::Finished => true,
        RoomState::Canceled => room.reveal_a.is_some() && room.reveal_b.is_some(),
        _ => false,
    }
}

pub fn winner_of(creator: Choice, opponent: Choice) -> Winner {
    if creator == opponent {
        Winner::Draw
    } else if creator.beats(opponent) {
        Winner::Creator
    } else {
        Winner::Opponent
    }
}

/// First matching rule wins. Rooms that are not finalized yield
/// `{ winner: None, via: Unknown }`.
pub fn derive_final_outcome(room: &Room) -> Outcome {
    if !room_is_finalized(room) {
        return Outcome::PENDING;
    }
    if let Some(forfeit) = resolve_forfeit(room) {
        return Outcome::won_by(forfeit.winner, OutcomeVia::Forfeit);
    }
    if let (Some(a), Some(b)) = (room.reveal_a, room.reveal_b) {
        return Outcome {
            winner: Some(winner_of(a, b)),
            via: OutcomeVia::Normal,
        };
    }

    let committed_a = room.has_committed(Side::Creator);
    let committed_b = room.has_committed(Side::Opponent);
    if committed_a != committed_b {
        let side = if committed_a {
            Side::Creator
        } else {
            Side::Opponent
        };
        return Outcome::won_by(side, OutcomeVia::CommitTimeout);
    }

    let revealed_a = room.reveal_a.is_some();
    let revealed_b = room.reveal_b.is_some();
    if committed_a && committed_b && revealed_a != revealed_b {
        let side = if revealed_a {
            Side::Creator
        } else {
            Side::Opponent
        };
        return Outcome::won_by(side, OutcomeVia::RevealTimeout);
    }
    if !committed_a && !committed_b {
        return Outcome::draw(OutcomeVia::BothCommitTimeout);
    }
    if committed_a && committed_b && !revealed_a && !revealed_b {
        return Outcome::draw(OutcomeVia::BothRevealTimeout);
    }

    warn!(room_id = room.id, state = ?room.state, "finalized room matched no outcome rule, treating as draw");
    Outcome::draw(OutcomeVia::Unknown)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CancelReason {
    /// nobody joined before the first commit window closed
    NoJoin,
    /// both players missed the commit window
    Commit,
    /// both committed, neither revealed
    Reveal,
    Unknown,
}

/// Why a canceled room was canceled, `None` for any other state.
pub fn cancel_reason(room: &Room) -> Option<CancelReason> {
    if room.state != RoomState::Canceled {
        return None;
    }
    let committed_a = room.has_committed(Side::Creator);
    let committed_b = room.has_committed(Side::Opponent);
    let reason = if !room.has_opponent() {
        CancelReason::NoJoin
    } else if !committed_a && !committed_b {
        CancelReason::Commit
    } else if committed_a && committed_b && room.reveal_a.is_none() && room.reveal_b.is_none()
    {
        CancelReason::Reveal
    } else {
        CancelReason::Unknown
    };
    Some(reason)
}
