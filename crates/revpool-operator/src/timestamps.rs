//! Block-number → timestamp cache.
//!
//! Replay resolves every chain event to its block timestamp; fetching those
//! one-by-one over RPC dominates resync time, so resolved timestamps are
//! cached on disk under the store directory. For mainnet a bundled cold
//! cache can preload historic entries before the first sync.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChainError};

const CACHE_FILE: &str = "block-timestamps.json";

/// Disk-persisted map of block timestamps (ms since epoch).
#[derive(Debug)]
pub struct BlockTimestampCache {
    path: PathBuf,
    entries: HashMap<u64, u64>,
    dirty: bool,
}

impl BlockTimestampCache {
    /// Load the cache file from `dir`, starting empty if absent or
    /// unreadable (a corrupt cache only costs refetches).
    pub async fn open(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(CACHE_FILE);
        let entries = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<u64, u64>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "timestamp cache unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!(entries = entries.len(), "timestamp cache loaded");
        Self {
            path,
            entries,
            dirty: false,
        }
    }

    /// Merge a bundled cold-cache file (same JSON shape). Existing entries
    /// win; the cold cache only fills gaps.
    pub async fn preload(&mut self, cold_cache: impl AsRef<Path>) {
        match fs::read(cold_cache.as_ref()).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<u64, u64>>(&bytes) {
                Ok(map) => {
                    let before = self.entries.len();
                    for (block, ts) in map {
                        self.entries.entry(block).or_insert(ts);
                    }
                    let added = self.entries.len() - before;
                    if added > 0 {
                        self.dirty = true;
                    }
                    info!(added, "cold timestamp cache preloaded");
                }
                Err(e) => warn!(error = %e, "cold timestamp cache unreadable, skipped"),
            },
            Err(e) => debug!(error = %e, "no cold timestamp cache"),
        }
    }

    pub fn get(&self, block_number: u64) -> Option<u64> {
        self.entries.get(&block_number).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a block's timestamp, hitting the chain only on cache miss.
    pub async fn resolve(
        &mut self,
        chain: &dyn ChainClient,
        block_number: u64,
    ) -> Result<u64, ChainError> {
        if let Some(ts) = self.get(block_number) {
            return Ok(ts);
        }
        let ts = chain.block_timestamp(block_number).await?;
        self.entries.insert(block_number, ts);
        self.dirty = true;
        Ok(ts)
    }

    /// Write the cache back to disk if anything changed since the last
    /// flush. Best-effort: a failed flush only costs refetches.
    pub async fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        match serde_json::to_vec(&self.entries) {
            Ok(bytes) => {
                let tmp = self.path.with_extension("json.tmp");
                let result = async {
                    fs::write(&tmp, &bytes).await?;
                    fs::rename(&tmp, &self.path).await
                }
                .await;
                match result {
                    Ok(()) => self.dirty = false,
                    Err(e) => warn!(error = %e, "timestamp cache flush failed"),
                }
            }
            Err(e) => warn!(error = %e, "timestamp cache serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;

    #[tokio::test]
    async fn resolve_caches_and_flushes() {
        let dir = tempfile::TempDir::new().expect("tmpdir");
        let chain = MockChainClient::new();
        chain.set_block_timestamp(7, 7_000);

        let mut cache = BlockTimestampCache::open(dir.path()).await;
        assert!(cache.is_empty());
        assert_eq!(cache.resolve(&chain, 7).await.unwrap(), 7_000);
        assert_eq!(chain.timestamp_fetches(), 1);

        // Second resolve is served from memory.
        assert_eq!(cache.resolve(&chain, 7).await.unwrap(), 7_000);
        assert_eq!(chain.timestamp_fetches(), 1);

        cache.flush().await;

        // A fresh cache instance reads the flushed entry.
        let reopened = BlockTimestampCache::open(dir.path()).await;
        assert_eq!(reopened.get(7), Some(7_000));
    }

    #[tokio::test]
    async fn preload_fills_gaps_without_overwriting() {
        let dir = tempfile::TempDir::new().expect("tmpdir");
        let cold = dir.path().join("cold.json");
        let mut cold_map = HashMap::new();
        cold_map.insert(1u64, 1_000u64);
        cold_map.insert(2u64, 2_000u64);
        fs::write(&cold, serde_json::to_vec(&cold_map).unwrap())
            .await
            .unwrap();

        let chain = MockChainClient::new();
        chain.set_block_timestamp(1, 999); // divergent live value

        let mut cache = BlockTimestampCache::open(dir.path()).await;
        cache.resolve(&chain, 1).await.unwrap();
        cache.preload(&cold).await;

        // Existing entry kept, gap filled.
        assert_eq!(cache.get(1), Some(999));
        assert_eq!(cache.get(2), Some(2_000));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn missing_cache_file_starts_empty() {
        let dir = tempfile::TempDir::new().expect("tmpdir");
        let cache = BlockTimestampCache::open(dir.path()).await;
        assert!(cache.is_empty());
        assert_eq!(cache.get(1), None);
    }
}
