//! Thin commit-trigger handle over the watcher task.
//!
//! `Operator` owns the watcher: it spawns the task, routes requests through
//! the command channel and joins the task on shutdown. Ownership is
//! unidirectional — operator → watcher → state — with the store injected as
//! a capability.

use std::sync::Arc;

use alloy_primitives::{Address, B256};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use revpool_core::{Block, BlockRef, Error, MemberCounts, Result, Store};

use crate::chain::ChainClient;
use crate::channel::ChannelClient;
use crate::timestamps::BlockTimestampCache;
use crate::watcher::{CommitReceipt, Watcher, WatcherCommand, WatcherSettings};

const COMMAND_BUFFER: usize = 64;

/// Handle owning one community's watcher task.
pub struct Operator {
    commands: mpsc::Sender<WatcherCommand>,
    shutdown: Arc<Notify>,
    task: JoinHandle<Result<()>>,
}

impl Operator {
    /// Run the watcher's startup protocol and spawn its live loop.
    pub async fn spawn(
        settings: WatcherSettings,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        channel: &dyn ChannelClient,
        timestamps: BlockTimestampCache,
    ) -> Result<Self> {
        let watcher = Watcher::start(settings, store, chain, channel, timestamps).await?;
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(watcher.run(command_rx, Arc::clone(&shutdown)));
        Ok(Self {
            commands,
            shutdown,
            task,
        })
    }

    /// Trigger a commit: returns the block number and root for the on-chain
    /// transaction (sent by the external wallet, not by this process).
    pub async fn commit(&self) -> Result<CommitReceipt> {
        self.request(|reply| WatcherCommand::Commit { reply }).await?
    }

    /// Withdrawal proof for `address` against committed block
    /// `block_number`.
    pub async fn proof(&self, address: Address, block_number: u64) -> Result<Vec<B256>> {
        self.request(|reply| WatcherCommand::Proof {
            address,
            block_number,
            reply,
        })
        .await?
    }

    pub async fn member_counts(&self) -> Result<MemberCounts> {
        self.request(|reply| WatcherCommand::MemberCounts { reply })
            .await
    }

    pub async fn latest_block(&self) -> Result<Option<BlockRef>> {
        self.request(|reply| WatcherCommand::LatestBlock { reply })
            .await
    }

    pub async fn withdrawable_block(&self, now_ms: u64) -> Result<Option<Block>> {
        self.request(|reply| WatcherCommand::WithdrawableBlock { now_ms, reply })
            .await?
    }

    /// Replay cached channel messages from a timestamp; `CachePruned` if the
    /// request is older than the pruning horizon.
    pub async fn playback(&self, from_timestamp: u64) -> Result<usize> {
        self.request(|reply| WatcherCommand::Playback {
            from_timestamp,
            reply,
        })
        .await?
    }

    /// Report a removed log (reorg) observed by a subscription transport.
    pub async fn log_removed(&self, pointer: revpool_core::EventPointer) -> Result<()> {
        self.commands
            .send(WatcherCommand::LogRemoved(pointer))
            .await
            .map_err(|_| Error::Channel("watcher task is gone".into()))
    }

    /// Cooperative shutdown: close the loop, await the in-flight state
    /// flush, join the task and surface its exit result.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down operator");
        self.shutdown.notify_waiters();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Channel(format!("watcher task panicked: {e}"))),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WatcherCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::Channel("watcher task is gone".into()))?;
        rx.await
            .map_err(|_| Error::Channel("watcher dropped the request".into()))
    }
}
