//! # revpool-operator
//!
//! The off-chain operator process around [`revpool_core`]: watches the root
//! chain and the join/part channel, folds both into the community ledger,
//! triggers Merkle commits and serves withdrawal proofs.
//!
//! ## Modules
//! - `config`: TOML + environment configuration
//! - `store`: file-backed persistence (`state.json`, `blocks/<n>.json`)
//! - `timestamps`: disk-cached block-timestamp lookups
//! - `chain` / `rpc`: chain access trait and its Ethereum JSON-RPC client
//! - `channel`: join/part channel trait and its HTTP polling client
//! - `watcher`: the per-community event pump
//! - `operator`: the commit-trigger handle owning the watcher task

pub mod chain;
pub mod channel;
pub mod config;
pub mod operator;
pub mod rpc;
pub mod store;
pub mod timestamps;
pub mod watcher;

pub use chain::{ChainClient, ChainError, MockChainClient, OnChainConfig, RawChainEvent};
pub use channel::{ChannelClient, ChannelError, HttpChannel, MockChannel};
pub use config::{parse_fee_fraction, ConfigError, OperatorConfig};
pub use operator::Operator;
pub use rpc::JsonRpcChainClient;
pub use store::FsStore;
pub use timestamps::BlockTimestampCache;
pub use watcher::{CommitReceipt, Watcher, WatcherCommand, WatcherSettings};
