#![allow(non_snake_case)]
use alloy_primitives::{
    B256,
    U256,
};
use rps_mirror::{
    actions::PersonalStatus,
    chain::ContractCall,
    outcome::{
        OutcomeVia,
        PersonalResult,
        Winner,
    },
    room::{
        Choice,
        RoomState,
        Side,
        commit_hash,
    },
    secrets::CommitSecretStore,
    storage::SharedStore,
    test_helpers::*,
};
use std::sync::Arc;

fn create_call(window_secs: u64) -> ContractCall {
    ContractCall::CreateRoom {
        stake: U256::from(1_000u64),
        commit_duration_secs: window_secs,
    }
}

#[tokio::test(start_paused = true)]
async fn lifecycle__create_join_commit_reveal__creator_wins() {
    let ctx = TestContext::new(CREATOR);
    let opponent = ctx.wallet_for(OPPONENT);
    let salt = B256::repeat_byte(7);
    // given
    let room_id = ctx
        .engine
        .create_room(U256::from(1_000u64), 300)
        .await
        .unwrap();
    opponent
        .execute(ContractCall::JoinRoom { room_id })
        .unwrap();

    // when
    ctx.engine
        .commit(room_id, Some(Choice::Rock))
        .await
        .unwrap();
    opponent
        .execute(ContractCall::Commit {
            room_id,
            commit_hash: commit_hash(Choice::Scissors, &salt),
        })
        .unwrap();
    let revealed = ctx.engine.reveal(room_id).await.unwrap();
    opponent
        .execute(ContractCall::Reveal {
            room_id,
            choice: Choice::Scissors,
            salt,
        })
        .unwrap();
    let (room, outcome) = ctx.engine.resolve_outcome(room_id).await.unwrap();

    // then
    assert_eq!(room_id, 1);
    assert_eq!(revealed, Choice::Rock);
    assert_eq!(room.state, RoomState::Finished);
    assert_eq!(outcome.winner, Some(Winner::Creator));
    assert_eq!(outcome.via, OutcomeVia::Normal);
    assert_eq!(outcome.result_for(&room, &CREATOR), Some(PersonalResult::Win));
    assert_eq!(ctx.wallet.sent_calls().len(), 3);

    ctx.engine.poll_once().await.unwrap();
    let stats = ctx.engine.stats().unwrap();
    assert_eq!(stats.wins, 1);
    assert_eq!(stats.rock, 1);
    assert_eq!(stats.total_winnings, U256::from(1_000u64));
}

#[tokio::test(start_paused = true)]
async fn reveal__keeps_archived_secret_but_drops_live_copy() {
    let ctx = TestContext::new(CREATOR);
    let opponent = ctx.wallet_for(OPPONENT);
    let salt = B256::repeat_byte(3);
    let room_id = ctx
        .engine
        .create_room(U256::from(10u64), 120)
        .await
        .unwrap();
    opponent
        .execute(ContractCall::JoinRoom { room_id })
        .unwrap();
    ctx.engine
        .commit(room_id, Some(Choice::Paper))
        .await
        .unwrap();
    opponent
        .execute(ContractCall::Commit {
            room_id,
            commit_hash: commit_hash(Choice::Paper, &salt),
        })
        .unwrap();

    // when
    ctx.engine.reveal(room_id).await.unwrap();

    // then
    let store: SharedStore = Arc::new(ctx.store.clone());
    let secrets = CommitSecretStore::new(store);
    assert_eq!(secrets.load(&CREATOR, room_id).unwrap(), None);
    let archived = secrets.load_archived(&CREATOR, room_id).unwrap().unwrap();
    assert_eq!(archived.choice, Choice::Paper);
    assert_eq!(archived.stake_human, "10");
}

#[tokio::test(start_paused = true)]
async fn join_room__from_other_wallet__seats_viewer_and_asks_for_commit() {
    let ctx = TestContext::new(OPPONENT);
    let creator = ctx.wallet_for(CREATOR);
    // given
    creator.execute(create_call(120)).unwrap();

    // when
    ctx.engine.join_room(1).await.unwrap();
    ctx.engine.poll_once().await.unwrap();

    // then
    let room = ctx.engine.room(1).unwrap();
    assert_eq!(room.opponent, OPPONENT);
    assert_eq!(room.state, RoomState::Committing);
    assert_eq!(room.commit_deadline, START_SECS + 120);
    let summaries = ctx.engine.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].side, Side::Opponent);
    assert_eq!(summaries[0].status, PersonalStatus::NeedCommit);
}

#[tokio::test(start_paused = true)]
async fn join_room__own_room__is_refused_without_sending() {
    let ctx = TestContext::new(CREATOR);
    let room_id = ctx
        .engine
        .create_room(U256::from(5u64), 120)
        .await
        .unwrap();

    let err = ctx.engine.join_room(room_id).await.unwrap_err();

    assert!(err.to_string().contains("cannot join your own room"));
    assert_eq!(ctx.wallet.sent_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn join_room__after_deadline__is_refused() {
    let ctx = TestContext::new(OPPONENT);
    ctx.wallet_for(CREATOR).execute(create_call(120)).unwrap();
    ctx.clock.advance_secs(121);

    let err = ctx.engine.join_room(1).await.unwrap_err();

    assert!(err.to_string().contains("join window has closed"));
    assert!(ctx.wallet.sent_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn create_room__window_out_of_range__is_rejected() {
    let ctx = TestContext::new(CREATOR);

    let too_short = ctx.engine.create_room(U256::from(1u64), 59).await;
    let too_long = ctx.engine.create_room(U256::from(1u64), 86_401).await;

    assert!(too_short.is_err());
    assert!(too_long.is_err());
    assert!(ctx.wallet.sent_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reveal__before_revealing_phase__fails_without_sending() {
    let ctx = TestContext::new(CREATOR);
    let room_id = ctx
        .engine
        .create_room(U256::from(5u64), 120)
        .await
        .unwrap();
    ctx.wallet_for(OPPONENT)
        .execute(ContractCall::JoinRoom { room_id })
        .unwrap();
    ctx.engine
        .commit(room_id, Some(Choice::Rock))
        .await
        .unwrap();

    let err = ctx.engine.reveal(room_id).await.unwrap_err();

    assert!(err.to_string().contains("not accepting reveals"));
    assert!(
        !ctx.wallet
            .sent_calls()
            .iter()
            .any(|call| matches!(call, ContractCall::Reveal { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn commit__send_fails__live_secret_dropped_archive_kept() {
    let ctx = TestContext::new(CREATOR);
    let room_id = ctx
        .engine
        .create_room(U256::from(5u64), 120)
        .await
        .unwrap();
    ctx.wallet_for(OPPONENT)
        .execute(ContractCall::JoinRoom { room_id })
        .unwrap();
    ctx.wallet.fail_next_send("nonce too low");

    // when
    let result = ctx.engine.commit(room_id, Some(Choice::Scissors)).await;

    // then
    assert!(result.is_err());
    let store: SharedStore = Arc::new(ctx.store.clone());
    let secrets = CommitSecretStore::new(store);
    assert_eq!(secrets.load(&CREATOR, room_id).unwrap(), None);
    let archived = secrets.load_archived(&CREATOR, room_id).unwrap().unwrap();
    assert_eq!(archived.choice, Choice::Scissors);
    assert!(!ctx.chain.room(room_id).unwrap().has_committed(Side::Creator));
}

#[tokio::test(start_paused = true)]
async fn claim__after_opponent_misses_commit__creator_wins_by_timeout() {
    let ctx = TestContext::new(CREATOR);
    let room_id = ctx
        .engine
        .create_room(U256::from(50u64), 300)
        .await
        .unwrap();
    ctx.wallet_for(OPPONENT)
        .execute(ContractCall::JoinRoom { room_id })
        .unwrap();
    ctx.engine
        .commit(room_id, Some(Choice::Rock))
        .await
        .unwrap();
    // given
    ctx.clock.advance_secs(301);
    let report = ctx.engine.poll_once().await.unwrap();
    assert_eq!(report.alerted, Some(format!("claim-{room_id}")));

    // when
    ctx.engine.claim(room_id).await.unwrap();
    let (room, outcome) = ctx.engine.resolve_outcome(room_id).await.unwrap();

    // then
    assert_eq!(room.state, RoomState::Finished);
    assert_eq!(outcome.winner, Some(Winner::Creator));
    assert_eq!(outcome.via, OutcomeVia::CommitTimeout);
}

#[tokio::test(start_paused = true)]
async fn poll_once__room_claimed_by_timeout__live_secret_is_purged() {
    let ctx = TestContext::new(CREATOR);
    let room_id = ctx
        .engine
        .create_room(U256::from(50u64), 300)
        .await
        .unwrap();
    ctx.wallet_for(OPPONENT)
        .execute(ContractCall::JoinRoom { room_id })
        .unwrap();
    ctx.engine
        .commit(room_id, Some(Choice::Paper))
        .await
        .unwrap();
    let store: SharedStore = Arc::new(ctx.store.clone());
    let secrets = CommitSecretStore::new(store);
    assert_eq!(secrets.live_room_ids(&CREATOR).unwrap(), vec![room_id]);
    // given
    ctx.clock.advance_secs(301);
    ctx.engine.claim(room_id).await.unwrap();

    // when
    ctx.engine.poll_once().await.unwrap();

    // then
    assert_eq!(ctx.engine.room(room_id).unwrap().state, RoomState::Finished);
    assert!(secrets.live_room_ids(&CREATOR).unwrap().is_empty());
    let archived = secrets.load_archived(&CREATOR, room_id).unwrap().unwrap();
    assert_eq!(archived.choice, Choice::Paper);
}

#[tokio::test(start_paused = true)]
async fn claim__before_deadline__is_refused() {
    let ctx = TestContext::new(CREATOR);
    let room_id = ctx
        .engine
        .create_room(U256::from(50u64), 300)
        .await
        .unwrap();

    let err = ctx.engine.claim(room_id).await.unwrap_err();

    assert!(err.to_string().contains("nothing to claim"));
}

#[tokio::test(start_paused = true)]
async fn forfeit__by_opponent__record_found_and_creator_wins() {
    let ctx = TestContext::new(CREATOR);
    let opponent = ctx.wallet_for(OPPONENT);
    let room_id = ctx
        .engine
        .create_room(U256::from(40u64), 300)
        .await
        .unwrap();
    opponent
        .execute(ContractCall::JoinRoom { room_id })
        .unwrap();
    // given
    opponent
        .execute(ContractCall::Forfeit { room_id })
        .unwrap();

    // when
    ctx.engine.poll_once().await.unwrap();

    // then
    let room = ctx.engine.room(room_id).unwrap();
    let record = room.forfeit.clone().unwrap();
    assert_eq!(record.loser, Some(OPPONENT));
    assert_eq!(record.winner, Some(CREATOR));
    let summaries = ctx.engine.summaries();
    assert_eq!(
        summaries[0].status,
        PersonalStatus::Forfeit(Some(PersonalResult::Win))
    );
    let (_, outcome) = ctx.engine.resolve_outcome(room_id).await.unwrap();
    assert_eq!(outcome.via, OutcomeVia::Forfeit);
}

#[tokio::test(start_paused = true)]
async fn forfeit__waiting_room__is_refused() {
    let ctx = TestContext::new(CREATOR);
    let room_id = ctx
        .engine
        .create_room(U256::from(40u64), 300)
        .await
        .unwrap();

    let err = ctx.engine.forfeit(room_id).await.unwrap_err();

    assert!(err.to_string().contains("cannot be forfeited"));
}

#[tokio::test(start_paused = true)]
async fn create_room__wallet_rejects__error_carries_reason() {
    let ctx = TestContext::new(CREATOR);
    ctx.wallet.fail_next_send("user rejected");

    let err = ctx
        .engine
        .create_room(U256::from(1u64), 120)
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("user rejected"));
}
