use crate::{
    outcome::{
        OutcomeVia,
        PersonalResult,
        derive_final_outcome,
        room_is_finalized,
    },
    room::{
        Choice,
        Room,
    },
};
use alloy_primitives::{
    Address,
    U256,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Lifetime record of one wallet over its finalized rooms. Forfeited rooms are
/// left out, they never reached a move comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub total_winnings: U256,
    pub total_losses: U256,
    pub rock: u32,
    pub paper: u32,
    pub scissors: u32,
}

impl UserStats {
    pub fn games(&self) -> u32 {
        self.wins + self.losses + self.draws
    }

    fn count_move(&mut self, choice: Choice) {
        match choice {
            Choice::Rock => self.rock += 1,
            Choice::Paper => self.paper += 1,
            Choice::Scissors => self.scissors += 1,
        }
    }
}

pub fn user_stats<'a>(rooms: impl IntoIterator<Item = &'a Room>, viewer: &Address) -> UserStats {
    let mut stats = UserStats::default();
    for room in rooms {
        let Some(side) = room.side_of(viewer) else {
            continue;
        };
        if !room_is_finalized(room) {
            continue;
        }
        let outcome = derive_final_outcome(room);
        if outcome.via == OutcomeVia::Forfeit {
            continue;
        }
        match outcome.result_for(room, viewer) {
            Some(PersonalResult::Win) => {
                stats.wins += 1;
                stats.total_winnings += room.stake;
            }
            Some(PersonalResult::Draw) => stats.draws += 1,
            Some(PersonalResult::Loss) | None => {
                stats.losses += 1;
                stats.total_losses += room.stake;
            }
        }
        if let Some(choice) = room.reveal_of(side) {
            stats.count_move(choice);
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::{
        room::{
            ForfeitRecord,
            Side,
        },
        test_helpers::{
            CREATOR,
            OPPONENT,
            RoomBuilder,
        },
    };

    #[test]
    fn user_stats__mixed_history__counts_results_stakes_and_moves() {
        // given
        let rooms = vec![
            RoomBuilder::new(1)
                .stake(100)
                .finished()
                .revealed(Side::Creator, Choice::Rock)
                .revealed(Side::Opponent, Choice::Scissors)
                .build(),
            RoomBuilder::new(2)
                .stake(40)
                .finished()
                .revealed(Side::Creator, Choice::Rock)
                .revealed(Side::Opponent, Choice::Paper)
                .build(),
            RoomBuilder::new(3)
                .stake(7)
                .finished()
                .revealed(Side::Creator, Choice::Paper)
                .revealed(Side::Opponent, Choice::Paper)
                .build(),
            RoomBuilder::new(4).stake(1_000).committing().build(),
        ];

        // when
        let stats = user_stats(&rooms, &CREATOR);

        // then
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.draws, 1);
        assert_eq!(stats.total_winnings, U256::from(100u64));
        assert_eq!(stats.total_losses, U256::from(40u64));
        assert_eq!((stats.rock, stats.paper, stats.scissors), (2, 1, 0));
        assert_eq!(stats.games(), 3);
    }

    #[test]
    fn user_stats__forfeited_room__is_skipped() {
        let rooms = vec![
            RoomBuilder::new(1)
                .committing()
                .forfeit(ForfeitRecord::new(OPPONENT, CREATOR, U256::from(10u64)))
                .build(),
        ];

        assert_eq!(user_stats(&rooms, &CREATOR), UserStats::default());
    }

    #[test]
    fn user_stats__commit_timeout_win__counts_without_a_move() {
        let rooms = vec![
            RoomBuilder::new(7)
                .stake(5)
                .joined()
                .committed(Side::Opponent)
                .finished()
                .build(),
        ];

        let stats = user_stats(&rooms, &OPPONENT);

        assert_eq!(stats.wins, 1);
        assert_eq!(stats.total_winnings, U256::from(5u64));
        assert_eq!(stats.rock + stats.paper + stats.scissors, 0);
    }
}
