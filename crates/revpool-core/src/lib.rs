//! # revpool-core
//!
//! Deterministic accounting core for community revenue pools: an
//! event-sourced member ledger whose snapshots are committed on-chain as
//! Merkle roots, against which members later prove and withdraw their share.
//!
//! ## Modules
//! - `member`: per-address record (address, cumulative earnings, activity)
//! - `merkle`: sibling-sorted keccak-256 commitment tree and proof paths
//! - `block`: immutable committed snapshots
//! - `events`: chain/channel event model and the deterministic stream merge
//! - `state`: the ledger fold with real-time, committed and withdrawable views
//! - `store`: narrow persistence contract plus an in-memory test store
//! - `error`: shared error taxonomy
//!
//! ## Data flow
//! ```text
//! chain logs ─┐
//!             ├─ merge ──▶ CommunityState ──▶ Block ──▶ MerkleTree ──▶ root
//! channel ────┘                                              │
//!                                member proofs ◀── path ─────┘
//! ```

pub mod block;
pub mod error;
pub mod events;
pub mod member;
pub mod merkle;
pub mod state;
pub mod store;

pub use block::{Block, BlockRef};
pub use error::{Error, Result};
pub use events::{
    merge, ChainEvent, ChainEventKind, ChannelMessage, EventPointer, LedgerEvent, MessageKind,
};
pub use member::{parse_address, Member};
pub use merkle::{hash_pair, keccak256, leaf_hash, verify_path, MerkleTree};
pub use state::{CommunityState, MemberCounts, StateConfig, FEE_SCALE};
pub use store::{MemStore, PersistedState, Store, StoreError};
