//! Chain access abstraction.
//!
//! [`ChainClient`] decouples the watcher from any specific chain transport.
//! The JSON-RPC implementation lives in [`crate::rpc`]; [`MockChainClient`]
//! scripts chain behavior for tests. Implementations do not retry
//! internally — a failed poll surfaces and the watcher retries on its next
//! cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use revpool_core::{ChainEventKind, EventPointer};

/// Chain transport failures. Transient by default: the watcher's next poll
/// cycle is the retry.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("chain rpc error: {0}")]
    Rpc(String),

    #[error("chain response decode error: {0}")]
    Decode(String),

    #[error("block {0} not found")]
    BlockNotFound(u64),
}

/// Community configuration as read from the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainConfig {
    pub token_address: Address,
    pub admin_address: Address,
    pub block_freeze_seconds: u64,
    /// Current admin fee fraction, 1e18-scaled.
    pub admin_fee: U256,
}

/// A decoded log before its block timestamp is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChainEvent {
    pub pointer: EventPointer,
    pub kind: ChainEventKind,
}

/// Read-side chain operations the watcher depends on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block number.
    async fn head_block(&self) -> Result<u64, ChainError>;

    /// Decoded community events in the inclusive block range, ordered by
    /// (block, tx index, log index).
    async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawChainEvent>, ChainError>;

    /// Timestamp of a block, ms since epoch.
    async fn block_timestamp(&self, block_number: u64) -> Result<u64, ChainError>;

    /// Read the community contract's configuration.
    async fn on_chain_config(&self) -> Result<OnChainConfig, ChainError>;
}

/// Scripted chain for tests: events, timestamps and config are set up
/// front; fetch counters let tests assert caching behavior.
#[derive(Debug)]
pub struct MockChainClient {
    head: AtomicU64,
    events: Mutex<Vec<RawChainEvent>>,
    timestamps: Mutex<HashMap<u64, u64>>,
    config: Mutex<OnChainConfig>,
    timestamp_fetches: AtomicU64,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            timestamps: Mutex::new(HashMap::new()),
            config: Mutex::new(OnChainConfig {
                token_address: Address::ZERO,
                admin_address: Address::ZERO,
                block_freeze_seconds: 1000,
                admin_fee: U256::ZERO,
            }),
            timestamp_fetches: AtomicU64::new(0),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_config(&self, config: OnChainConfig) {
        *self.config.lock() = config;
    }

    pub fn set_block_timestamp(&self, block_number: u64, timestamp_ms: u64) {
        self.timestamps.lock().insert(block_number, timestamp_ms);
    }

    /// Script an event; the head advances to cover it.
    pub fn push_event(&self, pointer: EventPointer, kind: ChainEventKind, timestamp_ms: u64) {
        self.set_block_timestamp(pointer.block_number, timestamp_ms);
        self.head.fetch_max(pointer.block_number, Ordering::SeqCst);
        self.events.lock().push(RawChainEvent { pointer, kind });
    }

    /// How many timestamps were served over the wire (cache-miss count).
    pub fn timestamp_fetches(&self) -> u64 {
        self.timestamp_fetches.load(Ordering::SeqCst)
    }
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn head_block(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawChainEvent>, ChainError> {
        let mut hits: Vec<RawChainEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| {
                e.pointer.block_number >= from_block && e.pointer.block_number <= to_block
            })
            .cloned()
            .collect();
        hits.sort_by_key(|e| e.pointer);
        Ok(hits)
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, ChainError> {
        self.timestamp_fetches.fetch_add(1, Ordering::SeqCst);
        self.timestamps
            .lock()
            .get(&block_number)
            .copied()
            .ok_or(ChainError::BlockNotFound(block_number))
    }

    async fn on_chain_config(&self) -> Result<OnChainConfig, ChainError> {
        Ok(self.config.lock().clone())
    }
}
