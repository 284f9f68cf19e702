// Typed room entity and strict decoding of the `rooms(uint256)` getter tuple.
use alloy_primitives::{
    Address,
    B256,
    U256,
    keccak256,
};
use rand::Rng;
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

/// Number of ABI words returned by `rooms(uint256)`.
pub const ROOM_WORDS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Choice {
    Rock,
    Paper,
    Scissors,
}

impl Choice {
    pub const ALL: [Choice; 3] = [Choice::Rock, Choice::Paper, Choice::Scissors];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Choice::Rock),
            2 => Some(Choice::Paper),
            3 => Some(Choice::Scissors),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Choice::Rock => 1,
            Choice::Paper => 2,
            Choice::Scissors => 3,
        }
    }

    pub fn beats(self, other: Choice) -> bool {
        matches!(
            (self, other),
            (Choice::Rock, Choice::Scissors)
                | (Choice::Paper, Choice::Rock)
                | (Choice::Scissors, Choice::Paper)
        )
    }

    pub fn random() -> Self {
        let index = rand::rng().random_range(0..Self::ALL.len());
        Self::ALL[index]
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Choice::Rock => "rock",
            Choice::Paper => "paper",
            Choice::Scissors => "scissors",
        };
        f.write_str(name)
    }
}

/// Seat in a room. The creator plays slot A, the opponent slot B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Creator,
    Opponent,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Side::Creator => Side::Opponent,
            Side::Opponent => Side::Creator,
        }
    }

    pub fn slot(self) -> char {
        match self {
            Side::Creator => 'A',
            Side::Opponent => 'B',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomState {
    Wait,
    Committing,
    Revealing,
    Finished,
    Canceled,
}

impl RoomState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RoomState::Wait),
            1 => Some(RoomState::Committing),
            2 => Some(RoomState::Revealing),
            3 => Some(RoomState::Finished),
            4 => Some(RoomState::Canceled),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RoomState::Wait => 0,
            RoomState::Committing => 1,
            RoomState::Revealing => 2,
            RoomState::Finished => 3,
            RoomState::Canceled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoomState::Finished | RoomState::Canceled)
    }
}

/// Forfeit resolution taken from the `Forfeited` event log. Zero addresses are
/// normalized to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForfeitRecord {
    pub loser: Option<Address>,
    pub winner: Option<Address>,
    pub payout: Option<U256>,
}

impl ForfeitRecord {
    pub fn new(loser: Address, winner: Address, payout: U256) -> Self {
        Self {
            loser: non_zero(loser),
            winner: non_zero(winner),
            payout: Some(payout),
        }
    }

    /// Incoming fields win, missing incoming fields keep the current value.
    pub fn merged_with(&self, incoming: &ForfeitRecord) -> ForfeitRecord {
        ForfeitRecord {
            loser: incoming.loser.or(self.loser),
            winner: incoming.winner.or(self.winner),
            payout: incoming.payout.or(self.payout),
        }
    }
}

fn non_zero(address: Address) -> Option<Address> {
    (!address.is_zero()).then_some(address)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: u64,
    pub creator: Address,
    pub opponent: Address,
    pub stake: U256,
    pub commit_a: B256,
    pub commit_b: B256,
    pub reveal_a: Option<Choice>,
    pub reveal_b: Option<Choice>,
    pub state: RoomState,
    pub commit_deadline: i64,
    pub reveal_deadline: i64,
    #[serde(default)]
    pub forfeit: Option<ForfeitRecord>,
}

impl Room {
    /// Room as announced by a `RoomCreated` log, before the first storage read.
    pub fn created(id: u64, creator: Address, stake: U256) -> Self {
        Self {
            id,
            creator,
            opponent: Address::ZERO,
            stake,
            commit_a: B256::ZERO,
            commit_b: B256::ZERO,
            reveal_a: None,
            reveal_b: None,
            state: RoomState::Wait,
            commit_deadline: 0,
            reveal_deadline: 0,
            forfeit: None,
        }
    }

    /// Decode the ten words of the `rooms(uint256)` getter. Malformed tuples are
    /// rejected rather than guessed at.
    pub fn decode(id: u64, words: &[B256]) -> Result<Self, RoomDecodeError> {
        if words.len() != ROOM_WORDS {
            return Err(RoomDecodeError::Arity {
                expected: ROOM_WORDS,
                actual: words.len(),
            });
        }
        let state_raw = uint_word(&words[9], 8, "state")? as u8;
        let state = RoomState::from_u8(state_raw)
            .ok_or(RoomDecodeError::UnknownState(state_raw))?;

        Ok(Self {
            id,
            creator: address_word(&words[0], "creator")?,
            opponent: address_word(&words[1], "opponent")?,
            stake: U256::from_be_bytes(words[2].0),
            commit_a: words[3],
            commit_b: words[4],
            reveal_a: choice_word(&words[5], "revealA")?,
            reveal_b: choice_word(&words[6], "revealB")?,
            state,
            commit_deadline: deadline_word(&words[7], "commitDeadline")?,
            reveal_deadline: deadline_word(&words[8], "revealDeadline")?,
            forfeit: None,
        })
    }

    /// Unallocated contract storage slot.
    pub fn is_empty_slot(&self) -> bool {
        self.id == 0
            || (self.creator.is_zero()
                && self.opponent.is_zero()
                && self.stake.is_zero()
                && self.commit_a.is_zero()
                && self.commit_b.is_zero()
                && self.reveal_a.is_none()
                && self.reveal_b.is_none()
                && self.state == RoomState::Wait)
    }

    pub fn has_opponent(&self) -> bool {
        !self.opponent.is_zero()
    }

    pub fn side_of(&self, address: &Address) -> Option<Side> {
        if address.is_zero() {
            None
        } else if *address == self.creator {
            Some(Side::Creator)
        } else if *address == self.opponent {
            Some(Side::Opponent)
        } else {
            None
        }
    }

    pub fn address_of(&self, side: Side) -> Address {
        match side {
            Side::Creator => self.creator,
            Side::Opponent => self.opponent,
        }
    }

    pub fn commit_of(&self, side: Side) -> B256 {
        match side {
            Side::Creator => self.commit_a,
            Side::Opponent => self.commit_b,
        }
    }

    pub fn has_committed(&self, side: Side) -> bool {
        !self.commit_of(side).is_zero()
    }

    pub fn reveal_of(&self, side: Side) -> Option<Choice> {
        match side {
            Side::Creator => self.reveal_a,
            Side::Opponent => self.reveal_b,
        }
    }

    pub fn has_revealed(&self, side: Side) -> bool {
        self.reveal_of(side).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomDecodeError {
    Arity { expected: usize, actual: usize },
    Length(usize),
    Address { field: &'static str },
    OutOfRange { field: &'static str, bits: u32 },
    Choice { field: &'static str, value: u8 },
    UnknownState(u8),
}

impl fmt::Display for RoomDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomDecodeError::Arity { expected, actual } => {
                write!(f, "room tuple has {actual} words, expected {expected}")
            }
            RoomDecodeError::Length(len) => {
                write!(f, "return data of {len} bytes is not word aligned")
            }
            RoomDecodeError::Address { field } => {
                write!(f, "{field} is not a canonical address word")
            }
            RoomDecodeError::OutOfRange { field, bits } => {
                write!(f, "{field} does not fit in uint{bits}")
            }
            RoomDecodeError::Choice { field, value } => {
                write!(f, "{field} holds invalid choice {value}")
            }
            RoomDecodeError::UnknownState(state) => write!(f, "unknown room state {state}"),
        }
    }
}

impl std::error::Error for RoomDecodeError {}

/// Split ABI return data into 32 byte words.
pub fn words_from_bytes(data: &[u8]) -> Result<Vec<B256>, RoomDecodeError> {
    if data.len() % 32 != 0 {
        return Err(RoomDecodeError::Length(data.len()));
    }
    Ok(data.chunks_exact(32).map(B256::from_slice).collect())
}

fn address_word(word: &B256, field: &'static str) -> Result<Address, RoomDecodeError> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(RoomDecodeError::Address { field });
    }
    Ok(Address::from_slice(&word[12..]))
}

fn uint_word(word: &B256, bits: u32, field: &'static str) -> Result<u64, RoomDecodeError> {
    let padding = 32 - (bits as usize / 8);
    if word[..padding].iter().any(|b| *b != 0) {
        return Err(RoomDecodeError::OutOfRange { field, bits });
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(tail))
}

fn choice_word(word: &B256, field: &'static str) -> Result<Option<Choice>, RoomDecodeError> {
    let value = uint_word(word, 8, field)? as u8;
    if value == 0 {
        return Ok(None);
    }
    Choice::from_u8(value)
        .map(Some)
        .ok_or(RoomDecodeError::Choice { field, value })
}

fn deadline_word(word: &B256, field: &'static str) -> Result<i64, RoomDecodeError> {
    let value = uint_word(word, 64, field)?;
    i64::try_from(value).map_err(|_| RoomDecodeError::OutOfRange { field, bits: 63 })
}

/// `keccak256(abi.encodePacked(uint8 choice, bytes32 salt))`
pub fn commit_hash(choice: Choice, salt: &B256) -> B256 {
    let mut packed = [0u8; 33];
    packed[0] = choice.as_u8();
    packed[1..].copy_from_slice(salt.as_slice());
    keccak256(packed)
}

pub fn random_salt() -> B256 {
    B256::from(rand::random::<[u8; 32]>())
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    fn address(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn word_u64(value: u64) -> B256 {
        B256::from(U256::from(value))
    }

    fn room_words() -> Vec<B256> {
        vec![
            address(0xaa).into_word(),
            address(0xbb).into_word(),
            word_u64(1_000),
            B256::repeat_byte(0x11),
            B256::ZERO,
            word_u64(1),
            word_u64(0),
            word_u64(1_700_000_000),
            word_u64(0),
            word_u64(1),
        ]
    }

    #[test]
    fn decode__well_formed_tuple__yields_typed_room() {
        // given
        let words = room_words();

        // when
        let room = Room::decode(7, &words).unwrap();

        // then
        assert_eq!(room.id, 7);
        assert_eq!(room.creator, address(0xaa));
        assert_eq!(room.opponent, address(0xbb));
        assert_eq!(room.stake, U256::from(1_000u64));
        assert_eq!(room.reveal_a, Some(Choice::Rock));
        assert_eq!(room.reveal_b, None);
        assert_eq!(room.state, RoomState::Committing);
        assert_eq!(room.commit_deadline, 1_700_000_000);
        assert!(room.has_committed(Side::Creator));
        assert!(!room.has_committed(Side::Opponent));
    }

    #[test]
    fn decode__short_tuple__is_rejected() {
        let words = room_words()[..9].to_vec();

        let err = Room::decode(1, &words).unwrap_err();

        assert_eq!(
            err,
            RoomDecodeError::Arity {
                expected: 10,
                actual: 9
            }
        );
    }

    #[test]
    fn decode__dirty_address_word__is_rejected() {
        let mut words = room_words();
        words[1] = B256::repeat_byte(0xff);

        let err = Room::decode(1, &words).unwrap_err();

        assert_eq!(err, RoomDecodeError::Address { field: "opponent" });
    }

    #[test]
    fn decode__unknown_state__is_rejected() {
        let mut words = room_words();
        words[9] = word_u64(7);

        let err = Room::decode(1, &words).unwrap_err();

        assert_eq!(err, RoomDecodeError::UnknownState(7));
    }

    #[test]
    fn decode__reveal_out_of_choice_range__is_rejected() {
        let mut words = room_words();
        words[6] = word_u64(4);

        let err = Room::decode(1, &words).unwrap_err();

        assert_eq!(
            err,
            RoomDecodeError::Choice {
                field: "revealB",
                value: 4
            }
        );
    }

    #[test]
    fn decode__deadline_wider_than_uint64__is_rejected() {
        let mut words = room_words();
        words[7] = B256::from(U256::from(u64::MAX) + U256::from(1u64));

        let err = Room::decode(1, &words).unwrap_err();

        assert_eq!(
            err,
            RoomDecodeError::OutOfRange {
                field: "commitDeadline",
                bits: 64
            }
        );
    }

    #[test]
    fn words_from_bytes__unaligned_data__is_rejected() {
        let err = words_from_bytes(&[0u8; 33]).unwrap_err();
        assert_eq!(err, RoomDecodeError::Length(33));
    }

    #[test]
    fn is_empty_slot__zeroed_tuple__true() {
        let words = vec![B256::ZERO; ROOM_WORDS];
        let room = Room::decode(3, &words).unwrap();
        assert!(room.is_empty_slot());
    }

    #[test]
    fn commit_hash__packs_choice_byte_before_salt() {
        // given
        let salt = B256::repeat_byte(0x42);
        let mut packed = vec![2u8];
        packed.extend_from_slice(salt.as_slice());

        // when
        let hash = commit_hash(Choice::Paper, &salt);

        // then
        assert_eq!(hash, keccak256(&packed));
        assert_ne!(hash, commit_hash(Choice::Rock, &salt));
    }

    #[test]
    fn beats__follows_rock_paper_scissors_cycle() {
        assert!(Choice::Rock.beats(Choice::Scissors));
        assert!(Choice::Paper.beats(Choice::Rock));
        assert!(Choice::Scissors.beats(Choice::Paper));
        assert!(!Choice::Rock.beats(Choice::Paper));
        assert!(!Choice::Rock.beats(Choice::Rock));
    }

    #[test]
    fn side_of__zero_address__never_matches_empty_opponent_slot() {
        let room = Room::created(1, address(0xaa), U256::from(5u64));
        assert_eq!(room.side_of(&Address::ZERO), None);
        assert_eq!(room.side_of(&address(0xaa)), Some(Side::Creator));
    }
}
