use crate::{
    outcome::{
        resolve_forfeit,
        room_is_finalized,
    },
    room::{
        Room,
        RoomState,
    },
};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Commit,
    Reveal,
    Finished,
    Canceled,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RoomLabel {
    Joinable,
    Waiting,
    Committing,
    CommitExpired,
    Revealing,
    RevealExpired,
    Finished,
    Canceled,
    Unknown,
}

impl fmt::Display for RoomLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoomLabel::Joinable => "Joinable",
            RoomLabel::Waiting => "Wait",
            RoomLabel::Committing => "Committing",
            RoomLabel::CommitExpired => "Commit expired",
            RoomLabel::Revealing => "Revealing",
            RoomLabel::RevealExpired => "Reveal expired",
            RoomLabel::Finished => "Finished",
            RoomLabel::Canceled => "Canceled",
            RoomLabel::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Actionable phase of a room at a given instant. `claimable` only says that a
/// deadline passed and `claimTimeout` is callable, not who profits from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub label: RoomLabel,
    pub live: bool,
    pub expired: bool,
    pub claimable: bool,
    pub deadline: Option<i64>,
    pub phase: Phase,
}

impl Availability {
    /// Over for good: never live, always expired, never claimable.
    fn terminal(label: RoomLabel, phase: Phase) -> Self {
        Self {
            label,
            live: false,
            expired: true,
            claimable: false,
            deadline: None,
            phase,
        }
    }

    fn timed(deadline: i64, now: i64, labels: (RoomLabel, RoomLabel), phase: Phase) -> Self {
        let known = deadline > 0;
        let expired = known && now >= deadline;
        let (live_label, expired_label) = labels;
        Self {
            label: if expired { expired_label } else { live_label },
            live: !expired,
            expired,
            claimable: expired,
            deadline: known.then_some(deadline),
            phase,
        }
    }
}

/// Classify `room` at unix time `now` (seconds). Deadlines should already be
/// merged with the local fallbacks.
pub fn availability(room: &Room, now: i64) -> Availability {
    if resolve_forfeit(room).is_some() {
        return Availability::terminal(RoomLabel::Finished, Phase::Finished);
    }
    match room.state {
        RoomState::Wait if !room.has_opponent() => Availability::timed(
            room.commit_deadline,
            now,
            (RoomLabel::Joinable, RoomLabel::Waiting),
            Phase::Commit,
        ),
        RoomState::Committing => Availability::timed(
            room.commit_deadline,
            now,
            (RoomLabel::Committing, RoomLabel::CommitExpired),
            Phase::Commit,
        ),
        RoomState::Revealing => Availability::timed(
            room.reveal_deadline,
            now,
            (RoomLabel::Revealing, RoomLabel::RevealExpired),
            Phase::Reveal,
        ),
        RoomState::Finished => Availability::terminal(RoomLabel::Finished, Phase::Finished),
        RoomState::Canceled if room_is_finalized(room) => {
            Availability::terminal(RoomLabel::Finished, Phase::Finished)
        }
        RoomState::Canceled => Availability::terminal(RoomLabel::Canceled, Phase::Canceled),
        RoomState::Wait => Availability::terminal(RoomLabel::Unknown, Phase::Unknown),
    }
}
