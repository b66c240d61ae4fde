//! # Watcher
//!
//! Subscribes one community to both of its sources — root-chain logs and
//! the join/part channel — and folds everything into the community's
//! [`CommunityState`]. One watcher, one community, one task: every state
//! mutation happens on the watcher's execution context, so no event is ever
//! half-applied when a read lands.
//!
//! ## Startup protocol
//!
//! 1. Load persisted state (`--reset` starts fresh) and seed the ledger
//!    with the last committed block's members.
//! 2. Read the contract configuration and cross-check it against the
//!    persisted record; divergence is a fatal `ConfigMismatch`.
//! 3. Subscribe to the channel from `last_message_timestamp`; messages
//!    buffer while replay runs.
//! 4. Fetch the log range `[last_processed_block + 1, head]`.
//! 5. Resolve block timestamps through the disk cache.
//! 6. Merge logs with buffered messages and replay onto state.
//! 7. Go live: chain polls and channel messages apply as they arrive.
//!
//! ## Reorgs
//!
//! A removed log that was never applied is silently dropped. One that was
//! already applied raises `ReorgInvariantViolated`; upstream policy is to
//! restart with `--reset`.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use revpool_core::{
    merge, Block, BlockRef, ChainEvent, ChannelMessage, CommunityState, Error, EventPointer,
    LedgerEvent, MemberCounts, PersistedState, Result, StateConfig, Store,
};

use crate::chain::{ChainClient, ChainError, RawChainEvent};
use crate::channel::{ChannelClient, ChannelError};
use crate::timestamps::BlockTimestampCache;

fn chain_err(e: ChainError) -> Error {
    Error::Chain(e.to_string())
}

fn channel_err(e: ChannelError) -> Error {
    Error::Channel(e.to_string())
}

/// Effective per-community settings the watcher runs with.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub token_address: Address,
    pub community_address: Address,
    /// Initial admin fee for a fresh sync; replayed fee-change events take
    /// over from there. 1e18-scaled.
    pub admin_fee: U256,
    pub chain_network: String,
    /// Leaf-hash salt; `None` matches the deployed verifier.
    pub tree_salt: Option<u64>,
    /// Wipe persisted state and resync from the contract's genesis.
    pub reset: bool,
    /// Live-mode chain poll cadence.
    pub poll_interval: Duration,
}

impl WatcherSettings {
    pub fn new(token_address: Address, community_address: Address) -> Self {
        Self {
            token_address,
            community_address,
            admin_fee: U256::ZERO,
            chain_network: "local".to_string(),
            tree_salt: None,
            reset: false,
            poll_interval: Duration::from_secs(4),
        }
    }
}

/// What a commit trigger returns to the operator: everything the on-chain
/// transaction needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Chain head at commit time; the block number the root is filed under.
    pub block_number: u64,
    pub root_hash: B256,
    pub member_count: usize,
}

/// Requests routed into the watcher task by the operator handle.
pub enum WatcherCommand {
    Commit {
        reply: oneshot::Sender<Result<CommitReceipt>>,
    },
    Proof {
        address: Address,
        block_number: u64,
        reply: oneshot::Sender<Result<Vec<B256>>>,
    },
    MemberCounts {
        reply: oneshot::Sender<MemberCounts>,
    },
    LatestBlock {
        reply: oneshot::Sender<Option<BlockRef>>,
    },
    WithdrawableBlock {
        now_ms: u64,
        reply: oneshot::Sender<Result<Option<Block>>>,
    },
    Playback {
        from_timestamp: u64,
        reply: oneshot::Sender<Result<usize>>,
    },
    /// A subscription transport observed a log removal (reorg).
    LogRemoved(EventPointer),
}

/// One community's event pump. Owns the state, the message cache and the
/// timestamp cache; the store and chain/channel clients are injected
/// capabilities.
pub struct Watcher {
    settings: WatcherSettings,
    admin_address: Address,
    block_freeze_seconds: u64,
    state: CommunityState,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    channel_rx: mpsc::Receiver<ChannelMessage>,
    timestamps: BlockTimestampCache,
    /// Forward-growing cache of channel messages for playback requests.
    message_cache: Vec<ChannelMessage>,
    cache_pruned_up_to: u64,
    last_processed_block: u64,
    last_message_timestamp: u64,
    /// Pointer of the newest chain event applied to state; the reorg
    /// invariant is checked against it.
    last_applied: Option<EventPointer>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("settings", &self.settings)
            .field("admin_address", &self.admin_address)
            .field("block_freeze_seconds", &self.block_freeze_seconds)
            .field("last_processed_block", &self.last_processed_block)
            .field("last_message_timestamp", &self.last_message_timestamp)
            .field("last_applied", &self.last_applied)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Run the startup protocol and return a watcher ready for live mode.
    pub async fn start(
        settings: WatcherSettings,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        channel: &dyn ChannelClient,
        timestamps: BlockTimestampCache,
    ) -> Result<Self> {
        // 1. Persisted checkpoint, unless a reset was requested.
        let persisted = if settings.reset {
            info!("reset requested, ignoring persisted state");
            None
        } else {
            store.load_state().await.map_err(Error::from)?
        };

        // 2. Contract configuration, cross-checked against what we synced
        // against last time.
        let on_chain = chain.on_chain_config().await.map_err(chain_err)?;
        if on_chain.token_address != settings.token_address {
            return Err(Error::ConfigMismatch(format!(
                "token address: configured {}, contract says {}",
                settings.token_address, on_chain.token_address
            )));
        }
        if let Some(p) = &persisted {
            if p.token_address != on_chain.token_address {
                return Err(Error::ConfigMismatch(format!(
                    "token address: persisted {}, contract says {}",
                    p.token_address, on_chain.token_address
                )));
            }
            if p.community_address != settings.community_address {
                return Err(Error::ConfigMismatch(format!(
                    "community address: persisted {}, configured {}",
                    p.community_address, settings.community_address
                )));
            }
            if p.block_freeze_seconds != on_chain.block_freeze_seconds {
                return Err(Error::ConfigMismatch(format!(
                    "block freeze: persisted {}, contract says {}",
                    p.block_freeze_seconds, on_chain.block_freeze_seconds
                )));
            }
            if p.chain_network != settings.chain_network {
                return Err(Error::ConfigMismatch(format!(
                    "chain network: persisted {:?}, configured {:?}",
                    p.chain_network, settings.chain_network
                )));
            }
        }

        // Seed the ledger: last committed block's members, or empty.
        let last_committed = persisted.as_ref().and_then(|p| p.last_committed_block);
        let (initial_members, admin_earnings, committed_block) = match last_committed {
            Some(n) => {
                let block = store
                    .load_block(n)
                    .await
                    .map_err(Error::from)?
                    .ok_or(Error::NoBlock(n))?;
                (block.members.clone(), block.admin_earnings, Some(block))
            }
            None => (Vec::new(), U256::ZERO, None),
        };

        let last_processed_block = persisted.as_ref().map_or(0, |p| p.last_processed_block);
        let last_message_timestamp = persisted.as_ref().map_or(0, |p| p.last_message_timestamp);
        let cache_pruned_up_to = persisted.as_ref().map_or(0, |p| p.cache_pruned_up_to);
        let admin_fee = persisted.as_ref().map_or(settings.admin_fee, |p| p.admin_fee);

        let mut state = CommunityState::new(
            Arc::clone(&store),
            StateConfig {
                admin_address: on_chain.admin_address,
                admin_fee,
                block_freeze_seconds: on_chain.block_freeze_seconds,
                current_block: last_processed_block,
                current_timestamp: last_message_timestamp,
                tree_salt: settings.tree_salt,
            },
            initial_members,
            admin_earnings,
        );
        if let Some(block) = committed_block {
            state.seed_committed(block);
        }

        // 3. Channel subscription; messages buffer while we replay.
        let channel_rx = channel
            .subscribe(last_message_timestamp)
            .await
            .map_err(channel_err)?;

        let mut watcher = Self {
            admin_address: on_chain.admin_address,
            block_freeze_seconds: on_chain.block_freeze_seconds,
            settings,
            state,
            store,
            chain,
            channel_rx,
            timestamps,
            message_cache: Vec::new(),
            cache_pruned_up_to,
            last_processed_block,
            last_message_timestamp,
            last_applied: None,
        };

        // 4–6. Replay the missed range merged with buffered messages.
        watcher.replay().await?;
        watcher.persist().await?;
        info!(
            community = %watcher.settings.community_address,
            block = watcher.last_processed_block,
            members = watcher.state.member_counts().total,
            "watcher synced, entering live mode"
        );
        Ok(watcher)
    }

    /// Catch up from `last_processed_block + 1` to the chain head, merging
    /// chain events with whatever the channel buffered so far.
    async fn replay(&mut self) -> Result<()> {
        let head = self.chain.head_block().await.map_err(chain_err)?;
        let from = self.last_processed_block + 1;

        let chain_events = if head >= from {
            self.resolve_events(from, head).await?
        } else {
            Vec::new()
        };

        let buffered = self.drain_buffered_messages();
        let event_count = chain_events.len() + buffered.len();
        for event in merge(chain_events, buffered) {
            self.apply(&event).await?;
        }
        if head >= from {
            self.last_processed_block = head;
        }
        self.timestamps.flush().await;
        debug!(events = event_count, head, "replay complete");
        Ok(())
    }

    /// Fetch a log range and resolve each event's block timestamp through
    /// the cache.
    async fn resolve_events(&mut self, from: u64, to: u64) -> Result<Vec<ChainEvent>> {
        let raw = self
            .chain
            .fetch_events(from, to)
            .await
            .map_err(chain_err)?;
        let mut events = Vec::with_capacity(raw.len());
        for RawChainEvent { pointer, kind } in raw {
            let timestamp = self
                .timestamps
                .resolve(self.chain.as_ref(), pointer.block_number)
                .await
                .map_err(chain_err)?;
            events.push(ChainEvent {
                pointer,
                timestamp,
                kind,
            });
        }
        Ok(events)
    }

    fn drain_buffered_messages(&mut self) -> Vec<ChannelMessage> {
        let mut buffered = Vec::new();
        while let Ok(message) = self.channel_rx.try_recv() {
            self.note_message(&message);
            buffered.push(message);
        }
        buffered
    }

    fn note_message(&mut self, message: &ChannelMessage) {
        self.last_message_timestamp = self.last_message_timestamp.max(message.timestamp);
        self.message_cache.push(message.clone());
    }

    async fn apply(&mut self, event: &LedgerEvent) -> Result<()> {
        self.state.apply(event).await?;
        if let LedgerEvent::Chain(e) = event {
            self.last_applied = Some(e.pointer);
        }
        Ok(())
    }

    // ── live-mode operations ─────────────────────────────────────────────

    /// One live poll cycle: apply any new chain logs and persist the
    /// watermarks.
    pub async fn poll_chain(&mut self) -> Result<()> {
        let head = self.chain.head_block().await.map_err(chain_err)?;
        if head <= self.last_processed_block {
            return Ok(());
        }
        let events = self
            .resolve_events(self.last_processed_block + 1, head)
            .await?;
        for event in events {
            self.apply(&LedgerEvent::Chain(event)).await?;
        }
        self.last_processed_block = head;
        self.timestamps.flush().await;
        self.persist().await
    }

    /// Apply one live channel message.
    pub async fn handle_message(&mut self, message: ChannelMessage) -> Result<()> {
        self.note_message(&message);
        self.apply(&LedgerEvent::Message(message)).await
    }

    /// A transport reported a removed log. Dropped if we never applied it;
    /// fatal if we did.
    pub fn handle_removed(&mut self, pointer: EventPointer) -> Result<()> {
        if self.last_applied.is_some_and(|applied| pointer <= applied) {
            return Err(Error::ReorgInvariantViolated {
                block_number: pointer.block_number,
                tx_index: pointer.tx_index,
                log_index: pointer.log_index,
            });
        }
        debug!(?pointer, "removed log was never applied, dropped");
        Ok(())
    }

    /// Evict cached messages older than the state's clock and advance the
    /// pruning horizon.
    pub fn prune_cache(&mut self) {
        let horizon = self.state.current_timestamp();
        let before = self.message_cache.len();
        self.message_cache.retain(|m| m.timestamp >= horizon);
        self.cache_pruned_up_to = self.cache_pruned_up_to.max(horizon);
        let evicted = before - self.message_cache.len();
        if evicted > 0 {
            debug!(evicted, horizon, "message cache pruned");
        }
    }

    /// Re-apply cached messages from a timestamp. Fails with `CachePruned`
    /// if the request reaches behind the pruning horizon, in which case the
    /// caller must resync from persisted state.
    pub async fn playback(&mut self, from_timestamp: u64) -> Result<usize> {
        if from_timestamp < self.cache_pruned_up_to {
            return Err(Error::CachePruned {
                pruned_up_to: self.cache_pruned_up_to,
                requested: from_timestamp,
            });
        }
        let replayed: Vec<ChannelMessage> = self
            .message_cache
            .iter()
            .filter(|m| m.timestamp >= from_timestamp)
            .cloned()
            .collect();
        let count = replayed.len();
        for message in replayed {
            self.apply(&LedgerEvent::Message(message)).await?;
        }
        Ok(count)
    }

    /// Build the real-time tree and hand the operator what the commit
    /// transaction needs. The block snapshot itself is taken when the
    /// corresponding `BlockCreated` event comes back from the chain.
    pub async fn commit(&mut self) -> Result<CommitReceipt> {
        let head = self.chain.head_block().await.map_err(chain_err)?;
        let tree = self.state.real_time_tree()?;
        let receipt = CommitReceipt {
            block_number: head,
            root_hash: tree.root_hash(),
            member_count: self.state.member_counts().total,
        };
        info!(
            block_number = receipt.block_number,
            root = %receipt.root_hash,
            members = receipt.member_count,
            "commit prepared"
        );
        Ok(receipt)
    }

    async fn persist(&self) -> Result<()> {
        let record = PersistedState {
            token_address: self.settings.token_address,
            community_address: self.settings.community_address,
            admin_address: self.admin_address,
            block_freeze_seconds: self.block_freeze_seconds,
            admin_fee: self.state.admin_fee(),
            chain_network: self.settings.chain_network.clone(),
            last_processed_block: self.last_processed_block,
            last_message_timestamp: self.last_message_timestamp,
            cache_pruned_up_to: self.cache_pruned_up_to,
            last_committed_block: self.state.last_committed_block_number(),
        };
        self.store.save_state(&record).await.map_err(Error::from)
    }

    // ── accessors (used by the command loop and tests) ───────────────────

    pub fn state(&self) -> &CommunityState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CommunityState {
        &mut self.state
    }

    pub fn cache_pruned_up_to(&self) -> u64 {
        self.cache_pruned_up_to
    }

    pub fn message_cache_len(&self) -> usize {
        self.message_cache.len()
    }

    pub fn last_processed_block(&self) -> u64 {
        self.last_processed_block
    }

    /// Live loop: one task consumes chain polls, channel messages and
    /// operator commands, dispatching synchronously to state. Returns on
    /// shutdown (Ok) or on the first fatal error.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<WatcherCommand>,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Move the subscription out of `self` so the recv future does not
        // hold a borrow across the other select arms.
        let (_closed_tx, closed_rx) = mpsc::channel(1);
        let mut channel_rx = std::mem::replace(&mut self.channel_rx, closed_rx);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("shutdown requested, flushing state");
                    self.timestamps.flush().await;
                    self.persist().await?;
                    return Ok(());
                }
                _ = poll.tick() => {
                    match self.poll_chain().await {
                        Ok(()) => self.prune_cache(),
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "fatal error during chain poll");
                            return Err(e);
                        }
                        // Transient: the next tick retries.
                        Err(e) => warn!(error = %e, "chain poll failed, will retry"),
                    }
                }
                message = channel_rx.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await?,
                        None => {
                            warn!("channel subscription closed");
                            self.persist().await?;
                            return Ok(());
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                error!(error = %e, "fatal error handling command");
                                return Err(e);
                            }
                        }
                        None => {
                            info!("operator handle dropped, stopping watcher");
                            self.persist().await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one operator command. Only fatal errors propagate; request
    /// failures go back through the reply channel.
    async fn handle_command(&mut self, command: WatcherCommand) -> Result<()> {
        match command {
            WatcherCommand::Commit { reply } => {
                let _ = reply.send(self.commit().await);
            }
            WatcherCommand::Proof {
                address,
                block_number,
                reply,
            } => {
                let _ = reply.send(self.state.proof_at(&address, block_number).await);
            }
            WatcherCommand::MemberCounts { reply } => {
                let _ = reply.send(self.state.member_counts());
            }
            WatcherCommand::LatestBlock { reply } => {
                let _ = reply.send(self.state.latest_block().map(Block::block_ref));
            }
            WatcherCommand::WithdrawableBlock { now_ms, reply } => {
                let _ = reply.send(self.state.latest_withdrawable_block(now_ms).await);
            }
            WatcherCommand::Playback {
                from_timestamp,
                reply,
            } => {
                let _ = reply.send(self.playback(from_timestamp).await);
            }
            WatcherCommand::LogRemoved(pointer) => {
                self.handle_removed(pointer)?;
            }
        }
        Ok(())
    }
}
