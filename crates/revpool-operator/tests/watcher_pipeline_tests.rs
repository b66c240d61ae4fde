//! End-to-end watcher pipeline tests: scripted chain + scripted channel +
//! in-memory store, driven through replay, live polling, commits, proofs,
//! pruning, reorg handling and restart.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};

use revpool_core::{
    leaf_hash, verify_path, ChainEventKind, ChannelMessage, Error, EventPointer, MemStore,
    MessageKind, Store, FEE_SCALE,
};
use revpool_operator::{
    BlockTimestampCache, MockChainClient, MockChannel, OnChainConfig, Operator, Watcher,
    WatcherSettings,
};

const TOKEN: [u8; 20] = [0x10; 20];
const COMMUNITY: [u8; 20] = [0x20; 20];
const ADMIN: [u8; 20] = [0xAD; 20];

fn addr(byte: u8) -> Address {
    Address::from([byte; 20])
}

fn pointer(block: u64, tx: u64, log: u64) -> EventPointer {
    EventPointer {
        block_number: block,
        tx_index: tx,
        log_index: log,
    }
}

fn revenue(amount: u64) -> ChainEventKind {
    ChainEventKind::RevenueReceived {
        from: addr(0xFE),
        amount: U256::from(amount),
    }
}

fn join(ts: u64, members: &[Address]) -> ChannelMessage {
    ChannelMessage {
        kind: MessageKind::Join,
        addresses: members.to_vec(),
        timestamp: ts,
    }
}

fn part(ts: u64, members: &[Address]) -> ChannelMessage {
    ChannelMessage {
        kind: MessageKind::Part,
        addresses: members.to_vec(),
        timestamp: ts,
    }
}

fn settings() -> WatcherSettings {
    let mut s = WatcherSettings::new(Address::from(TOKEN), Address::from(COMMUNITY));
    s.poll_interval = Duration::from_millis(20);
    s
}

fn scripted_chain() -> Arc<MockChainClient> {
    let chain = Arc::new(MockChainClient::new());
    chain.set_config(OnChainConfig {
        token_address: Address::from(TOKEN),
        admin_address: Address::from(ADMIN),
        block_freeze_seconds: 1,
        admin_fee: U256::ZERO,
    });
    chain
}

async fn start_watcher(
    store: Arc<MemStore>,
    chain: Arc<MockChainClient>,
    channel: &MockChannel,
) -> Watcher {
    let dir = tempfile::TempDir::new().expect("tmpdir");
    let cache = BlockTimestampCache::open(dir.path()).await;
    Watcher::start(settings(), store, chain, channel, cache)
        .await
        .expect("watcher start")
}

// ════════════════════════════════════════════════════════════════════════
// REPLAY
// ════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn replay_merges_chain_and_channel_history() {
    let store = MemStore::new();
    let chain = scripted_chain();
    let channel = MockChannel::new();

    // A joins before the revenue, B only after it.
    channel.preload(join(1_000, &[addr(0xA1)]));
    channel.preload(join(2_500, &[addr(0xB2)]));
    chain.push_event(pointer(5, 0, 0), revenue(100), 2_000);

    let mut watcher = start_watcher(store.clone(), chain, &channel).await;

    let state = watcher.state();
    assert_eq!(state.member(&addr(0xA1)).unwrap().earnings, U256::from(100u64));
    assert_eq!(state.member(&addr(0xB2)).unwrap().earnings, U256::ZERO);
    assert_eq!(state.total_revenue(), U256::from(100u64));
    assert_eq!(watcher.last_processed_block(), 5);

    // Replay persisted its watermarks.
    let persisted = store.load_state().await.unwrap().unwrap();
    assert_eq!(persisted.last_processed_block, 5);
    assert_eq!(persisted.last_message_timestamp, 2_500);

    // Chain precedes channel at equal timestamps: a join stamped exactly at
    // the revenue's timestamp must not share in it.
    let late_join = join(2_000, &[addr(0xC3)]);
    watcher.handle_message(late_join).await.unwrap();
    assert_eq!(watcher.state().member(&addr(0xC3)).unwrap().earnings, U256::ZERO);
}

#[tokio::test]
async fn fee_change_event_applies_before_later_revenue() {
    let store = MemStore::new();
    let chain = scripted_chain();
    let channel = MockChannel::new();

    channel.preload(join(500, &[addr(0x01)]));
    chain.push_event(
        pointer(2, 0, 0),
        ChainEventKind::AdminFeeChanged {
            fee: U256::from(FEE_SCALE / 5),
        },
        1_000,
    );
    chain.push_event(pointer(3, 0, 0), revenue(1_000), 2_000);

    let watcher = start_watcher(store, chain, &channel).await;
    assert_eq!(
        watcher.state().member(&addr(0x01)).unwrap().earnings,
        U256::from(800u64)
    );
    assert_eq!(watcher.state().admin().earnings, U256::from(200u64));
}

// ════════════════════════════════════════════════════════════════════════
// COMMIT AND PROOFS
// ════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn commit_then_block_created_yields_verifiable_proofs() {
    let store = MemStore::new();
    let chain = scripted_chain();
    let channel = MockChannel::new();

    channel.preload(join(1_000, &[addr(0x0A), addr(0x0B)]));
    chain.push_event(pointer(4, 0, 0), revenue(200), 2_000);

    let mut watcher = start_watcher(store, chain.clone(), &channel).await;
    let receipt = watcher.commit().await.unwrap();
    assert_eq!(receipt.member_count, 2);
    assert_eq!(receipt.block_number, 4);

    // The (external) commit transaction lands; the BlockCreated event comes
    // back on the next poll and triggers the snapshot.
    chain.push_event(
        pointer(6, 0, 0),
        ChainEventKind::BlockCreated {
            block_number: receipt.block_number,
            root_hash: receipt.root_hash,
            ipfs_hash: String::new(),
        },
        3_000,
    );
    watcher.poll_chain().await.unwrap();

    let block = watcher.state().latest_block().unwrap().clone();
    assert_eq!(block.block_number, 4);
    assert_eq!(block.root_hash, receipt.root_hash);

    // Both members prove their share against the committed root.
    for member in [addr(0x0A), addr(0x0B)] {
        let earnings = block.member(&member).unwrap().earnings;
        assert_eq!(earnings, U256::from(100u64));
        let path = watcher.state_mut().proof_at(&member, 4).await.unwrap();
        assert!(verify_path(
            leaf_hash(None, &member, earnings),
            &path,
            receipt.root_hash
        ));
    }
}

#[tokio::test]
async fn withdrawable_block_respects_freeze_window() {
    let store = MemStore::new();
    let chain = scripted_chain();
    let channel = MockChannel::new();

    channel.preload(join(500, &[addr(0x01)]));
    chain.push_event(pointer(2, 0, 0), revenue(100), 900);
    chain.push_event(
        pointer(3, 0, 0),
        ChainEventKind::BlockCreated {
            block_number: 1,
            root_hash: Default::default(),
            ipfs_hash: String::new(),
        },
        1_000,
    );
    chain.push_event(
        pointer(5, 0, 0),
        ChainEventKind::BlockCreated {
            block_number: 2,
            root_hash: Default::default(),
            ipfs_hash: String::new(),
        },
        2_500,
    );

    let mut watcher = start_watcher(store, chain, &channel).await;

    // freeze = 1 s → cutoff at now − 1000 ms.
    let withdrawable = watcher
        .state_mut()
        .latest_withdrawable_block(3_200)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(withdrawable.block_number, 1);

    let latest = watcher.state().latest_block().unwrap();
    assert_eq!(latest.block_number, 2);
}

// ════════════════════════════════════════════════════════════════════════
// CACHE PRUNING AND PLAYBACK
// ════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn playback_from_before_pruning_horizon_is_refused() {
    let store = MemStore::new();
    let chain = scripted_chain();
    let channel = MockChannel::new();

    let mut watcher = start_watcher(store, chain, &channel).await;

    watcher.handle_message(join(4_000, &[addr(0x01)])).await.unwrap();
    watcher.handle_message(join(5_000, &[addr(0x02)])).await.unwrap();
    assert_eq!(watcher.message_cache_len(), 2);

    // State clock is at 5000; pruning evicts older messages.
    watcher.prune_cache();
    assert_eq!(watcher.cache_pruned_up_to(), 5_000);
    assert_eq!(watcher.message_cache_len(), 1);

    let err = watcher.playback(3_000).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CachePruned { pruned_up_to: 5_000, requested: 3_000 }
    ));

    // From the horizon onward playback still works.
    assert_eq!(watcher.playback(5_000).await.unwrap(), 1);
}

// ════════════════════════════════════════════════════════════════════════
// REORG HANDLING
// ════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn removed_log_policy() {
    let store = MemStore::new();
    let chain = scripted_chain();
    let channel = MockChannel::new();

    channel.preload(join(500, &[addr(0x01)]));
    chain.push_event(pointer(7, 1, 2), revenue(100), 1_000);

    let mut watcher = start_watcher(store, chain, &channel).await;

    // Never-applied (future) log: dropped silently.
    assert!(watcher.handle_removed(pointer(9, 0, 0)).is_ok());

    // Already-applied log: fatal invariant violation.
    let err = watcher.handle_removed(pointer(7, 1, 2)).unwrap_err();
    assert!(matches!(err, Error::ReorgInvariantViolated { block_number: 7, .. }));
    assert!(err.is_fatal());
}

// ════════════════════════════════════════════════════════════════════════
// RESTART AND CONFIG CROSS-CHECK
// ════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn restart_resumes_from_committed_block() {
    let store = MemStore::new();
    let chain = scripted_chain();
    let channel = MockChannel::new();

    channel.preload(join(500, &[addr(0x01)]));
    chain.push_event(pointer(2, 0, 0), revenue(100), 1_000);
    chain.push_event(
        pointer(3, 0, 0),
        ChainEventKind::BlockCreated {
            block_number: 3,
            root_hash: Default::default(),
            ipfs_hash: String::new(),
        },
        1_500,
    );

    {
        let watcher = start_watcher(store.clone(), chain.clone(), &channel).await;
        assert_eq!(watcher.state().last_committed_block_number(), Some(3));
    }

    // Second life: nothing new on the channel; one more revenue on chain.
    chain.push_event(pointer(5, 0, 0), revenue(50), 2_000);
    let fresh_channel = MockChannel::new();
    let watcher = start_watcher(store, chain, &fresh_channel).await;

    let member = watcher.state().member(&addr(0x01)).unwrap();
    assert!(member.active);
    assert_eq!(member.earnings, U256::from(150u64));
    assert_eq!(watcher.state().total_revenue(), U256::from(150u64));
    assert_eq!(watcher.last_processed_block(), 5);
}

#[tokio::test]
async fn config_divergence_is_fatal_on_restart() {
    let store = MemStore::new();
    let chain = scripted_chain();
    let channel = MockChannel::new();

    {
        let _watcher = start_watcher(store.clone(), chain.clone(), &channel).await;
    }

    // The contract now reports a different freeze window than we synced
    // against.
    chain.set_config(OnChainConfig {
        token_address: Address::from(TOKEN),
        admin_address: Address::from(ADMIN),
        block_freeze_seconds: 9_999,
        admin_fee: U256::ZERO,
    });

    let dir = tempfile::TempDir::new().expect("tmpdir");
    let cache = BlockTimestampCache::open(dir.path()).await;
    let err = Watcher::start(settings(), store.clone(), chain.clone(), &channel, cache)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigMismatch(_)));
    assert!(err.is_fatal());

    // Reset discards the persisted record and starts over.
    let dir = tempfile::TempDir::new().expect("tmpdir");
    let cache = BlockTimestampCache::open(dir.path()).await;
    let mut reset_settings = settings();
    reset_settings.reset = true;
    assert!(Watcher::start(reset_settings, store, chain, &channel, cache)
        .await
        .is_ok());
}

#[tokio::test]
async fn wrong_token_contract_is_rejected_at_startup() {
    let store = MemStore::new();
    let chain = Arc::new(MockChainClient::new());
    chain.set_config(OnChainConfig {
        token_address: addr(0x99), // not the configured token
        admin_address: Address::from(ADMIN),
        block_freeze_seconds: 1,
        admin_fee: U256::ZERO,
    });
    let channel = MockChannel::new();

    let dir = tempfile::TempDir::new().expect("tmpdir");
    let cache = BlockTimestampCache::open(dir.path()).await;
    let err = Watcher::start(settings(), store, chain, &channel, cache)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigMismatch(_)));
}

// ════════════════════════════════════════════════════════════════════════
// OPERATOR HANDLE (LIVE LOOP)
// ════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn operator_round_trip_through_the_live_loop() {
    let store = MemStore::new();
    let chain = scripted_chain();
    let channel = MockChannel::new();

    channel.preload(join(1_000, &[addr(0x0A)]));
    chain.push_event(pointer(2, 0, 0), revenue(100), 2_000);

    let dir = tempfile::TempDir::new().expect("tmpdir");
    let cache = BlockTimestampCache::open(dir.path()).await;
    let operator = Operator::spawn(settings(), store, chain.clone(), &channel, cache)
        .await
        .expect("spawn");

    let counts = operator.member_counts().await.unwrap();
    assert_eq!(counts.total, 1);

    // A live join arrives through the subscription.
    channel.push(join(3_000, &[addr(0x0B)])).await;
    let mut joined = false;
    for _ in 0..50 {
        if operator.member_counts().await.unwrap().total == 2 {
            joined = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(joined, "live join never reached state");

    let receipt = operator.commit().await.unwrap();
    assert_eq!(receipt.member_count, 2);

    // Commit lands on-chain; the loop's next poll snapshots the block.
    chain.push_event(
        pointer(4, 0, 0),
        ChainEventKind::BlockCreated {
            block_number: receipt.block_number,
            root_hash: receipt.root_hash,
            ipfs_hash: String::new(),
        },
        4_000,
    );
    let mut committed = None;
    for _ in 0..50 {
        if let Some(block_ref) = operator.latest_block().await.unwrap() {
            committed = Some(block_ref);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let committed = committed.expect("block never committed");
    assert_eq!(committed.block_number, receipt.block_number);

    let path = operator.proof(addr(0x0A), receipt.block_number).await.unwrap();
    assert!(verify_path(
        leaf_hash(None, &addr(0x0A), U256::from(100u64)),
        &path,
        receipt.root_hash
    ));

    // Unknown member surfaces the lookup error, not a crash.
    assert!(matches!(
        operator.proof(addr(0xEE), receipt.block_number).await,
        Err(Error::NotAMember(_))
    ));

    operator.shutdown().await.expect("clean shutdown");
}
