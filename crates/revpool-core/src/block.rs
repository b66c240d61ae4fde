//! Committed block snapshots.
//!
//! A block freezes the member list at commit time. Blocks are immutable once
//! stored; the Merkle tree over a block is a derived artifact, materialized
//! lazily by the state engine on the first proof request.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::member::{serde_decimal, Member};
use crate::merkle::MerkleTree;

/// Lightweight reference to a committed block, kept in the state's ordered
/// commit log for withdrawable-window queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub block_number: u64,
    /// Commit timestamp, ms since epoch.
    pub timestamp: u64,
}

/// Immutable snapshot of the ledger at commit time.
///
/// `members` is address-sorted; this ordering is what the Merkle build
/// consumes, so it is part of the committed artifact, not a presentation
/// detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_number: u64,
    /// Commit timestamp, ms since epoch.
    pub timestamp: u64,
    /// Address-sorted member snapshot.
    pub members: Vec<Member>,
    /// Σ member earnings + admin earnings at commit time.
    #[serde(with = "serde_decimal")]
    pub total_earnings: U256,
    /// Earnings accrued to the admin up to this block.
    #[serde(with = "serde_decimal")]
    pub admin_earnings: U256,
    pub admin_address: Address,
    /// Admin fee fraction, scaled by 1e18.
    #[serde(with = "serde_decimal")]
    pub admin_fee: U256,
    /// Root recorded by the on-chain BlockCreated event.
    pub root_hash: B256,
}

impl Block {
    /// Locate a member in the snapshot. The list is address-sorted, so this
    /// is a binary search.
    pub fn member(&self, address: &Address) -> Option<&Member> {
        self.members
            .binary_search_by(|m| m.address.cmp(address))
            .ok()
            .map(|i| &self.members[i])
    }

    /// Reference for the commit log.
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            block_number: self.block_number,
            timestamp: self.timestamp,
        }
    }

    /// Materialize the commitment tree for this snapshot.
    pub fn build_tree(&self, salt: Option<u64>) -> Result<MerkleTree> {
        MerkleTree::build(&self.members, salt)
    }

    /// Σ member earnings, for invariant checks against `total_earnings`.
    pub fn member_earnings_sum(&self) -> U256 {
        self.members
            .iter()
            .fold(U256::ZERO, |acc, m| acc.saturating_add(m.earnings))
    }
}
