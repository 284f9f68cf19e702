// What a given wallet should do next in each of its rooms, and which of those
// situations deserve an alert.
use crate::{
    availability::{
        Availability,
        Phase,
        availability,
    },
    outcome::{
        CancelReason,
        PersonalResult,
        cancel_reason,
        derive_final_outcome,
        resolve_forfeit,
        room_is_finalized,
    },
    room::{
        Room,
        RoomState,
        Side,
    },
};
use alloy_primitives::Address;
use serde::Serialize;
use std::fmt;

/// Seconds before the commit deadline at which a missing creator commit
/// escalates to an urgent alert.
pub const URGENT_COMMIT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecommendedAction {
    Share,
    Commit,
    Reveal,
    Claim,
}

impl RecommendedAction {
    /// Actions auto-play is allowed to take on its own.
    pub fn is_automatable(self) -> bool {
        matches!(
            self,
            RecommendedAction::Commit | RecommendedAction::Reveal | RecommendedAction::Claim
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PersonalStatus {
    WaitingForJoin,
    NeedCommit,
    WaitingForOpponentCommit,
    NeedReveal,
    WaitingForOpponentReveal,
    /// deadline passed in the viewer's favour
    ClaimAvailable(Phase),
    /// both players missed the phase, claiming refunds both
    DrawByTimeout(Phase),
    /// the viewer missed the phase
    LostByTimeout(Phase),
    Forfeit(Option<PersonalResult>),
    Finished(Option<PersonalResult>),
    Canceled(CancelReason),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonalSummary {
    pub room_id: u64,
    pub side: Side,
    pub status: PersonalStatus,
    pub action: Option<RecommendedAction>,
    pub alert_key: Option<String>,
    pub allow_forfeit: bool,
    pub availability: Availability,
}

impl PersonalSummary {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            PersonalStatus::Forfeit(_)
                | PersonalStatus::Finished(_)
                | PersonalStatus::Canceled(_)
                | PersonalStatus::LostByTimeout(_)
        )
    }
}

/// Summary of `room` from `viewer`'s seat, `None` when the viewer does not play
/// in it. `room` should carry merged deadlines.
pub fn personal_summary(room: &Room, viewer: &Address, now: i64) -> Option<PersonalSummary> {
    let side = room.side_of(viewer)?;
    let avail = availability(room, now);
    let forfeit = resolve_forfeit(room);
    let mut summary = PersonalSummary {
        room_id: room.id,
        side,
        status: PersonalStatus::WaitingForJoin,
        action: None,
        alert_key: None,
        allow_forfeit: forfeit.is_none()
            && matches!(room.state, RoomState::Committing | RoomState::Revealing),
        availability: avail,
    };

    if let Some(forfeit) = forfeit {
        summary.status = PersonalStatus::Forfeit(forfeit.result_for(viewer));
        return Some(summary);
    }

    match room.state {
        RoomState::Wait => {
            if avail.claimable && side == Side::Creator {
                summary.set_claim(PersonalStatus::ClaimAvailable(avail.phase));
            } else if side == Side::Creator {
                summary.action = Some(RecommendedAction::Share);
            }
        }
        RoomState::Committing => {
            let mine = room.has_committed(side);
            let theirs = room.has_committed(side.other());
            if avail.claimable {
                if !mine && !theirs {
                    summary.set_claim(PersonalStatus::DrawByTimeout(Phase::Commit));
                } else if mine && !theirs {
                    summary.set_claim(PersonalStatus::ClaimAvailable(Phase::Commit));
                } else {
                    summary.status = PersonalStatus::LostByTimeout(Phase::Commit);
                }
            } else if !mine {
                summary.status = PersonalStatus::NeedCommit;
                summary.action = Some(RecommendedAction::Commit);
                summary.alert_key = Some(AlertKind::NeedCommit(side).key(room.id));
            } else {
                summary.status = PersonalStatus::WaitingForOpponentCommit;
            }
        }
        RoomState::Revealing => {
            let mine = room.has_revealed(side);
            let theirs = room.has_revealed(side.other());
            if avail.claimable {
                if !mine && !theirs {
                    summary.set_claim(PersonalStatus::DrawByTimeout(Phase::Reveal));
                } else if mine && !theirs {
                    summary.set_claim(PersonalStatus::ClaimAvailable(Phase::Reveal));
                } else {
                    summary.status = PersonalStatus::LostByTimeout(Phase::Reveal);
                }
            } else if !mine {
                summary.status = PersonalStatus::NeedReveal;
                summary.action = Some(RecommendedAction::Reveal);
                summary.alert_key = Some(AlertKind::NeedReveal(side).key(room.id));
            } else {
                summary.status = PersonalStatus::WaitingForOpponentReveal;
            }
        }
        RoomState::Finished | RoomState::Canceled if room_is_finalized(room) => {
            let outcome = derive_final_outcome(room);
            summary.status = PersonalStatus::Finished(outcome.result_for(room, viewer));
        }
        RoomState::Canceled => {
            summary.status =
                PersonalStatus::Canceled(cancel_reason(room).unwrap_or(CancelReason::Unknown));
        }
        RoomState::Finished => summary.status = PersonalStatus::Unknown,
    }
    Some(summary)
}

impl PersonalSummary {
    fn set_claim(&mut self, status: PersonalStatus) {
        self.status = status;
        self.action = Some(RecommendedAction::Claim);
        self.alert_key = Some(AlertKind::Claim.key(self.room_id));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlertKind {
    Claim,
    NeedCommit(Side),
    CommitUrgent,
    NeedReveal(Side),
}

impl AlertKind {
    /// Deterministic dedup key, stable across polls.
    pub fn key(self, room_id: u64) -> String {
        match self {
            AlertKind::Claim => format!("claim-{room_id}"),
            AlertKind::NeedCommit(side) => format!("need-commit-{room_id}-{}", side.slot()),
            AlertKind::CommitUrgent => format!("commit-urgent-{room_id}"),
            AlertKind::NeedReveal(side) => format!("need-reveal-{room_id}-{}", side.slot()),
        }
    }

    /// Vibration pattern in milliseconds, alternating on and off.
    pub fn pattern(self, vibration_ms: u64) -> Vec<u64> {
        let v = vibration_ms;
        match self {
            AlertKind::Claim | AlertKind::NeedCommit(_) => vec![v],
            AlertKind::NeedReveal(_) => vec![v, 80, v],
            AlertKind::CommitUrgent => vec![v, 90, v, 90, v],
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertKind::Claim => "claim",
            AlertKind::NeedCommit(_) => "commit",
            AlertKind::CommitUrgent => "commit-urgent",
            AlertKind::NeedReveal(_) => "reveal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionableCondition {
    pub key: String,
    pub kind: AlertKind,
    pub room_id: u64,
    pub deadline: Option<i64>,
}

impl ActionableCondition {
    fn new(kind: AlertKind, room_id: u64, deadline: i64) -> Self {
        Self {
            key: kind.key(room_id),
            kind,
            room_id,
            deadline: (deadline > 0).then_some(deadline),
        }
    }
}

/// Conditions that need `viewer`'s attention, in room id order. Rooms are
/// expected to carry merged deadlines.
pub fn actionable_conditions(
    rooms: &[Room],
    viewer: &Address,
    now: i64,
) -> Vec<ActionableCondition> {
    let mut sorted: Vec<&Room> = rooms.iter().collect();
    sorted.sort_by_key(|room| room.id);

    let mut conditions = Vec::new();
    for room in sorted {
        let Some(side) = room.side_of(viewer) else {
            continue;
        };
        if resolve_forfeit(room).is_some() || room_is_finalized(room) {
            continue;
        }
        let avail = availability(room, now);
        if avail.claimable {
            conditions.push(ActionableCondition::new(
                AlertKind::Claim,
                room.id,
                avail.deadline.unwrap_or_default(),
            ));
        } else if room.state == RoomState::Revealing {
            if !room.has_revealed(side) {
                conditions.push(ActionableCondition::new(
                    AlertKind::NeedReveal(side),
                    room.id,
                    room.reveal_deadline,
                ));
            }
        } else if room.state == RoomState::Committing && !room.has_committed(side) {
            let remaining = room.commit_deadline - now;
            let urgent = side == Side::Creator
                && room.commit_deadline > 0
                && remaining > 0
                && remaining <= URGENT_COMMIT_SECS;
            let kind = if urgent {
                AlertKind::CommitUrgent
            } else {
                AlertKind::NeedCommit(side)
            };
            conditions.push(ActionableCondition::new(kind, room.id, room.commit_deadline));
        }
    }
    conditions
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinCheck {
    Open,
    NotWaiting,
    Taken,
    OwnRoom,
    Expired,
}

impl fmt::Display for JoinCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            JoinCheck::Open => "room is open",
            JoinCheck::NotWaiting => "room is no longer waiting for an opponent",
            JoinCheck::Taken => "room already has an opponent",
            JoinCheck::OwnRoom => "cannot join your own room",
            JoinCheck::Expired => "join window has closed",
        };
        f.write_str(reason)
    }
}

/// Whether `viewer` may join `room` right now. `room` should carry merged
/// deadlines.
pub fn join_check(room: &Room, viewer: &Address, now: i64) -> JoinCheck {
    if room.state != RoomState::Wait {
        JoinCheck::NotWaiting
    } else if room.has_opponent() {
        JoinCheck::Taken
    } else if room.creator == *viewer {
        JoinCheck::OwnRoom
    } else if room.commit_deadline > 0 && now >= room.commit_deadline {
        JoinCheck::Expired
    } else {
        JoinCheck::Open
    }
}
