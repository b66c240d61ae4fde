//! Event model and deterministic stream merge.
//!
//! The ledger folds over one ordered stream assembled from two sources:
//! chain logs (revenue transfers into the vault, admin-fee changes, committed
//! block markers) and join/part messages from the community's channel.
//! Replay from persistence must produce identical state, so the merge order
//! is fully specified: ascending timestamp; at equal timestamps chain events
//! precede channel messages; chain-internal ties break by
//! (block, tx index, log index); channel messages keep insertion order.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::member::serde_decimal;

/// Position of a log within the chain, used for ordering and for reorg
/// bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPointer {
    pub block_number: u64,
    pub tx_index: u64,
    pub log_index: u64,
}

/// The three log kinds the watcher consumes from the root chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEventKind {
    /// Token `Transfer` into the community vault.
    RevenueReceived {
        from: Address,
        #[serde(with = "serde_decimal")]
        amount: U256,
    },
    /// `AdminFeeChanged(uint256)`; the fee is a 1e18-scaled fraction.
    AdminFeeChanged {
        #[serde(with = "serde_decimal")]
        fee: U256,
    },
    /// `BlockCreated(uint256, bytes32, string)`: a commit landed on-chain.
    BlockCreated {
        block_number: u64,
        root_hash: B256,
        ipfs_hash: String,
    },
}

/// A chain log with its resolved block timestamp (ms).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub pointer: EventPointer,
    /// Timestamp of the containing block, ms since epoch.
    pub timestamp: u64,
    pub kind: ChainEventKind,
}

impl ChainEvent {
    fn order_key(&self) -> (u64, u64, u64, u64) {
        (
            self.timestamp,
            self.pointer.block_number,
            self.pointer.tx_index,
            self.pointer.log_index,
        )
    }
}

/// Membership change kinds carried by the join/part channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Join,
    Part,
}

/// One envelope from the join/part channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub addresses: Vec<Address>,
    /// Channel server timestamp, ms since epoch.
    pub timestamp: u64,
}

/// A single element of the merged stream the state engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    Chain(ChainEvent),
    Message(ChannelMessage),
}

impl LedgerEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            LedgerEvent::Chain(e) => e.timestamp,
            LedgerEvent::Message(m) => m.timestamp,
        }
    }
}

/// Merge chain events and channel messages into the single replay stream.
///
/// Inputs need not arrive sorted; the output order is a pure function of the
/// event keys (plus channel insertion order), so shuffling inputs within
/// equal keys cannot change the result.
pub fn merge(chain: Vec<ChainEvent>, messages: Vec<ChannelMessage>) -> Vec<LedgerEvent> {
    let mut chain = chain;
    chain.sort_by_key(ChainEvent::order_key);

    let mut merged: Vec<(u64, u8, usize, LedgerEvent)> = Vec::with_capacity(chain.len() + messages.len());
    for (i, e) in chain.into_iter().enumerate() {
        merged.push((e.timestamp, 0, i, LedgerEvent::Chain(e)));
    }
    for (i, m) in messages.into_iter().enumerate() {
        merged.push((m.timestamp, 1, i, LedgerEvent::Message(m)));
    }
    merged.sort_by_key(|(ts, rank, seq, _)| (*ts, *rank, *seq));
    merged.into_iter().map(|(_, _, _, e)| e).collect()
}
