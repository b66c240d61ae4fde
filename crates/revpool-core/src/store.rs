//! Narrow persistence contract consumed by the state engine and watcher.
//!
//! The core does not own a storage format; it is handed a `Store` capability
//! and calls four operations. Implementations must make `save_state` and
//! `save_block` atomic. Blocks are immutable: re-saving an existing block
//! number is allowed only when the contents match what is already stored.
//!
//! `MemStore` is the in-process implementation used by tests across both
//! crates.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::Block;
use crate::error::Error;
use crate::member::serde_decimal;

/// Persistence failures. All fatal to the owning operator.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(String),

    #[error("store serialization error: {0}")]
    Serialization(String),

    /// Attempted to overwrite block {0} with different contents.
    #[error("block {0} is already stored with different contents")]
    ImmutableBlockMismatch(u64),
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e.to_string())
    }
}

/// Everything the watcher needs to resume after a restart: the config echo
/// it cross-checks against the chain, and the replay watermarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Token whose transfers into the vault are revenue.
    pub token_address: Address,
    /// The community vault contract.
    pub community_address: Address,
    pub admin_address: Address,
    pub block_freeze_seconds: u64,
    /// Admin fee fraction at last save, 1e18-scaled.
    #[serde(with = "serde_decimal")]
    pub admin_fee: U256,
    /// Chain network name the state was synced against.
    pub chain_network: String,
    /// Last chain block whose logs were applied.
    pub last_processed_block: u64,
    /// Channel resume point, ms.
    pub last_message_timestamp: u64,
    /// Message-cache pruning horizon, ms.
    pub cache_pruned_up_to: u64,
    /// Number of the most recent committed block, if any.
    pub last_committed_block: Option<u64>,
}

/// The persistence capability injected into the core.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load the persisted operator record, or `None` on first start.
    async fn load_state(&self) -> Result<Option<PersistedState>, StoreError>;

    /// Atomically replace the persisted operator record.
    async fn save_state(&self, state: &PersistedState) -> Result<(), StoreError>;

    /// Load a committed block by number, `None` if absent.
    async fn load_block(&self, block_number: u64) -> Result<Option<Block>, StoreError>;

    /// Atomically persist a committed block. Blocks are immutable; saving an
    /// existing number with different contents must fail with
    /// [`StoreError::ImmutableBlockMismatch`].
    async fn save_block(&self, block: &Block) -> Result<(), StoreError>;
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemStore {
    state: Mutex<Option<PersistedState>>,
    blocks: Mutex<BTreeMap<u64, Block>>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Numbers of all stored blocks, ascending.
    pub fn block_numbers(&self) -> Vec<u64> {
        self.blocks.lock().keys().copied().collect()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn load_state(&self) -> Result<Option<PersistedState>, StoreError> {
        Ok(self.state.lock().clone())
    }

    async fn save_state(&self, state: &PersistedState) -> Result<(), StoreError> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    async fn load_block(&self, block_number: u64) -> Result<Option<Block>, StoreError> {
        Ok(self.blocks.lock().get(&block_number).cloned())
    }

    async fn save_block(&self, block: &Block) -> Result<(), StoreError> {
        let mut blocks = self.blocks.lock();
        if let Some(existing) = blocks.get(&block.block_number) {
            if existing != block {
                return Err(StoreError::ImmutableBlockMismatch(block.block_number));
            }
            return Ok(());
        }
        blocks.insert(block.block_number, block.clone());
        Ok(())
    }
}
