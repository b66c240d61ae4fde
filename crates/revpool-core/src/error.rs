//! Error taxonomy shared across the core.
//!
//! Recoverable lookup failures (`NoBlock`, `NotAMember`) surface to read
//! endpoints as client errors. `ConfigMismatch`, `ReorgInvariantViolated`
//! and `Store` are fatal for the owning operator process, which logs and
//! exits; restart policy lives above this crate.

use alloy_primitives::Address;
use thiserror::Error;

/// Errors produced by the ledger core and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// Persisted configuration diverges from the on-chain contract.
    #[error("config mismatch: {0}")]
    ConfigMismatch(String),

    /// Playback requested from before the message-cache pruning horizon.
    /// The caller must resync from persisted state instead.
    #[error("cache pruned up to {pruned_up_to}, playback from {requested} refused")]
    CachePruned { pruned_up_to: u64, requested: u64 },

    /// A chain log that was already applied to state was removed by a reorg.
    #[error("reorg removed an already-applied event at block {block_number} (tx {tx_index}, log {log_index})")]
    ReorgInvariantViolated {
        block_number: u64,
        tx_index: u64,
        log_index: u64,
    },

    /// No block committed under this number.
    #[error("no committed block {0}")]
    NoBlock(u64),

    /// Address absent from the requested block snapshot.
    #[error("address {0} is not a member of the requested block")]
    NotAMember(Address),

    /// Merkle build over an empty member list.
    #[error("cannot build a Merkle tree over an empty member list")]
    EmptyInput,

    /// Tree would exceed the supported leaf range.
    #[error("member list too large for Merkle commitment: {0} leaves")]
    TooManyLeaves(u64),

    /// Malformed input address, rejected at ingestion.
    #[error("bad address: {0}")]
    BadAddress(String),

    /// Persistence failure. Fatal; a restart is expected to recover or halt.
    #[error("store error: {0}")]
    Store(String),

    /// Chain transport failure. Transient: surfaced to the caller and
    /// retried on the next poll cycle.
    #[error("chain client error: {0}")]
    Chain(String),

    /// Channel transport failure. Transient, like [`Error::Chain`].
    #[error("channel client error: {0}")]
    Channel(String),

    /// Arithmetic that would overflow 256 bits.
    #[error("earnings arithmetic overflow")]
    Overflow,
}

impl Error {
    /// Whether the operator process should terminate on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigMismatch(_)
                | Error::ReorgInvariantViolated { .. }
                | Error::Store(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::ConfigMismatch("token".into()).is_fatal());
        assert!(Error::Store("disk full".into()).is_fatal());
        assert!(Error::ReorgInvariantViolated {
            block_number: 1,
            tx_index: 0,
            log_index: 0
        }
        .is_fatal());
        assert!(!Error::NoBlock(7).is_fatal());
        assert!(!Error::EmptyInput.is_fatal());
        assert!(!Error::CachePruned {
            pruned_up_to: 5000,
            requested: 3000
        }
        .is_fatal());
    }

    #[test]
    fn display_carries_context() {
        let e = Error::CachePruned {
            pruned_up_to: 5000,
            requested: 3000,
        };
        let msg = e.to_string();
        assert!(msg.contains("5000"));
        assert!(msg.contains("3000"));
    }
}
