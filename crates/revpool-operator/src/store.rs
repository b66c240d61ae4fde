//! File-backed store: `state.json` plus one JSON file per committed block.
//!
//! Writes go through a temp file and an atomic rename so a crash mid-write
//! never leaves a torn record behind. Blocks are immutable; re-saving an
//! existing number is accepted only when the contents match what is on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use revpool_core::{Block, PersistedState, Store, StoreError};

/// Directory-backed implementation of the core's `Store` contract.
#[derive(Debug, Clone)]
pub struct FsStore {
    base: PathBuf,
    blocks_dir: PathBuf,
}

impl FsStore {
    /// Open (creating directories as needed) a store rooted at `base`.
    pub async fn open(base: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base = base.as_ref().to_path_buf();
        let blocks_dir = base.join("blocks");
        fs::create_dir_all(&blocks_dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { base, blocks_dir })
    }

    /// Delete all persisted state and blocks (`--reset` startup).
    pub async fn wipe(&self) -> Result<(), StoreError> {
        let state_path = self.state_path();
        if fs::try_exists(&state_path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            fs::remove_file(&state_path)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        fs::remove_dir_all(&self.blocks_dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        fs::create_dir_all(&self.blocks_dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    fn state_path(&self) -> PathBuf {
        self.base.join("state.json")
    }

    fn block_path(&self, block_number: u64) -> PathBuf {
        self.blocks_dir.join(format!("{block_number}.json"))
    }

    /// Write-to-temp then rename. The rename is atomic on POSIX
    /// filesystems, which is what makes `save_state`/`save_block` safe
    /// against crashes.
    async fn atomic_write(&self, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
        let tmp = dest.with_extension("json.tmp");
        fs::write(&tmp, data)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp, dest)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }
}

#[async_trait]
impl Store for FsStore {
    async fn load_state(&self) -> Result<Option<PersistedState>, StoreError> {
        self.read_json(&self.state_path()).await
    }

    async fn save_state(&self, state: &PersistedState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.atomic_write(&self.state_path(), &bytes).await
    }

    async fn load_block(&self, block_number: u64) -> Result<Option<Block>, StoreError> {
        self.read_json(&self.block_path(block_number)).await
    }

    async fn save_block(&self, block: &Block) -> Result<(), StoreError> {
        if let Some(existing) = self.load_block(block.block_number).await? {
            if &existing != block {
                return Err(StoreError::ImmutableBlockMismatch(block.block_number));
            }
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(block)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.atomic_write(&self.block_path(block.block_number), &bytes)
            .await
    }
}
