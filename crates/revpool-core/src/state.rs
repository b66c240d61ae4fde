//! # Community ledger state engine
//!
//! Deterministic fold over the merged event stream. Every mutation flows
//! through one of the `on_*` operations; the order of operations is fixed by
//! [`crate::events::merge`], so replay from persistence reproduces identical
//! state. Anything whose output depends on iteration order walks members in
//! address order (the member map is a `BTreeMap`), never in insertion order.
//!
//! The engine exposes three views:
//!
//! - **real-time** — all applied events, including unconfirmed ones;
//! - **latest committed block** — most recent snapshot committed on-chain;
//! - **latest withdrawable block** — most recent committed block older than
//!   `now − block_freeze_seconds`.
//!
//! Blocks are immutable once committed; their Merkle trees are materialized
//! lazily, at most once, on the first proof request. The real-time preview
//! tree is invalidated by any earnings- or membership-affecting mutation and
//! rebuilt on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use tracing::{debug, info, warn};

use crate::block::{Block, BlockRef};
use crate::error::{Error, Result};
use crate::events::{ChainEventKind, ChannelMessage, LedgerEvent, MessageKind};
use crate::member::Member;
use crate::merkle::MerkleTree;
use crate::store::Store;

/// Admin fee fractions are scaled by 1e18, like the on-chain event.
pub const FEE_SCALE: u64 = 1_000_000_000_000_000_000;

fn fee_scale() -> U256 {
    U256::from(FEE_SCALE)
}

/// Active / total membership counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberCounts {
    pub active: usize,
    pub total: usize,
}

/// Constructor parameters for [`CommunityState`].
#[derive(Debug, Clone)]
pub struct StateConfig {
    pub admin_address: Address,
    /// 1e18-scaled admin fee fraction; values above 1e18 are clamped.
    pub admin_fee: U256,
    pub block_freeze_seconds: u64,
    pub current_block: u64,
    /// ms since epoch.
    pub current_timestamp: u64,
    /// Block-number salt for leaf hashing; `None` matches the deployed
    /// verifier (empty-string salt).
    pub tree_salt: Option<u64>,
}

/// The event-sourced member ledger for one community.
pub struct CommunityState {
    members: BTreeMap<Address, Member>,
    /// Synthetic always-present admin bucket; receives the fee cut and all
    /// rounding dust. Kept outside the member set so it never collides with
    /// an admin address that also joins as a regular member.
    admin: Member,
    admin_fee: U256,
    block_freeze_seconds: u64,
    current_block: u64,
    current_timestamp: u64,
    /// Σ of all revenue applied so far; the conservation invariant keeps
    /// this equal to member earnings + admin earnings at all times.
    total_revenue: U256,
    /// Ordered log of committed blocks, ascending by number.
    commit_log: Vec<BlockRef>,
    latest: Option<Block>,
    store: Arc<dyn Store>,
    block_cache: HashMap<u64, Block>,
    tree_cache: HashMap<u64, Arc<MerkleTree>>,
    preview: Option<Arc<MerkleTree>>,
    tree_salt: Option<u64>,
}

impl CommunityState {
    /// Fresh state seeded with an initial member list (typically the last
    /// committed block's members on restart, empty on first start).
    pub fn new(
        store: Arc<dyn Store>,
        config: StateConfig,
        initial_members: Vec<Member>,
        admin_earnings: U256,
    ) -> Self {
        let mut members = BTreeMap::new();
        let mut total = admin_earnings;
        for m in initial_members {
            total = total.saturating_add(m.earnings);
            members.insert(m.address, m);
        }
        let mut admin = Member::new(config.admin_address);
        admin.earnings = admin_earnings;

        Self {
            members,
            admin,
            admin_fee: config.admin_fee.min(fee_scale()),
            block_freeze_seconds: config.block_freeze_seconds,
            current_block: config.current_block,
            current_timestamp: config.current_timestamp,
            total_revenue: total,
            commit_log: Vec::new(),
            latest: None,
            store,
            block_cache: HashMap::new(),
            tree_cache: HashMap::new(),
            preview: None,
            tree_salt: config.tree_salt,
        }
    }

    /// Restore the committed-block anchor after a restart. The block becomes
    /// `latest` and enters the commit log; earnings are NOT re-applied (the
    /// caller seeds members through the constructor).
    pub fn seed_committed(&mut self, block: Block) {
        self.commit_log.push(block.block_ref());
        self.current_block = self.current_block.max(block.block_number);
        self.block_cache.insert(block.block_number, block.clone());
        self.latest = Some(block);
    }

    // ── event application ────────────────────────────────────────────────

    /// Single dispatch point shared by replay and live mode.
    pub async fn apply(&mut self, event: &LedgerEvent) -> Result<()> {
        match event {
            LedgerEvent::Chain(e) => {
                self.current_block = self.current_block.max(e.pointer.block_number);
                match &e.kind {
                    ChainEventKind::RevenueReceived { amount, .. } => {
                        self.on_revenue(*amount, e.timestamp)
                    }
                    ChainEventKind::AdminFeeChanged { fee } => {
                        self.on_admin_fee_changed(*fee, e.timestamp);
                        Ok(())
                    }
                    ChainEventKind::BlockCreated {
                        block_number,
                        root_hash,
                        ..
                    } => self.on_block_created(*block_number, e.timestamp, *root_hash).await,
                }
            }
            LedgerEvent::Message(m) => {
                self.on_message(m);
                Ok(())
            }
        }
    }

    fn on_message(&mut self, message: &ChannelMessage) {
        match message.kind {
            MessageKind::Join => self.on_join(&message.addresses, message.timestamp),
            MessageKind::Part => self.on_part(&message.addresses, message.timestamp),
        }
    }

    /// Insert new members or reactivate parted ones. Idempotent on already
    /// active addresses; earnings always survive.
    pub fn on_join(&mut self, addresses: &[Address], timestamp: u64) {
        for address in addresses {
            match self.members.get_mut(address) {
                Some(member) if member.active => {
                    debug!(%address, "join for already-active member ignored");
                }
                Some(member) => {
                    member.set_active(true);
                    debug!(%address, "member rejoined");
                }
                None => {
                    self.members.insert(*address, Member::new(*address));
                    debug!(%address, "member joined");
                }
            }
        }
        self.touch(timestamp);
        self.preview = None;
    }

    /// Deactivate members. Unknown addresses are a silent no-op.
    pub fn on_part(&mut self, addresses: &[Address], timestamp: u64) {
        for address in addresses {
            if let Some(member) = self.members.get_mut(address) {
                member.set_active(false);
                debug!(%address, "member parted");
            }
        }
        self.touch(timestamp);
        self.preview = None;
    }

    /// Distribute revenue among active members.
    ///
    /// `floor(amount · fee / 1e18)` is reserved for the admin, the remainder
    /// is split `floor(remainder / active_count)` per active member, and the
    /// rounding dust accrues to the admin. With no active members the whole
    /// amount goes to the admin. Integer arithmetic throughout; the split
    /// `(amount / 1e18) · fee + (amount mod 1e18) · fee / 1e18` keeps the
    /// intermediate products inside 256 bits for any realistic amount.
    pub fn on_revenue(&mut self, amount: U256, timestamp: u64) -> Result<()> {
        let scale = fee_scale();
        let whole = (amount / scale)
            .checked_mul(self.admin_fee)
            .ok_or(Error::Overflow)?;
        let fractional = (amount % scale)
            .checked_mul(self.admin_fee)
            .ok_or(Error::Overflow)?
            / scale;
        let admin_share = whole.checked_add(fractional).ok_or(Error::Overflow)?;

        let remainder = amount - admin_share;
        let active_count = self.members.values().filter(|m| m.active).count();

        let mut to_admin = admin_share;
        if active_count == 0 {
            to_admin = amount;
        } else {
            let per_member = remainder / U256::from(active_count as u64);
            let distributed = per_member * U256::from(active_count as u64);
            to_admin = to_admin.checked_add(remainder - distributed).ok_or(Error::Overflow)?;
            // Address order: deterministic regardless of join history.
            for member in self.members.values_mut().filter(|m| m.active) {
                member.add_revenue(per_member)?;
            }
        }
        self.admin.add_revenue(to_admin)?;
        self.total_revenue = self
            .total_revenue
            .checked_add(amount)
            .ok_or(Error::Overflow)?;

        self.touch(timestamp);
        self.preview = None;
        debug!(amount = %amount, active = active_count, admin_share = %to_admin, "revenue distributed");
        Ok(())
    }

    /// Replace the admin fee. Applies to subsequent revenue only; no
    /// retro-adjustment. Fractions above 1 are clamped.
    pub fn on_admin_fee_changed(&mut self, fee: U256, timestamp: u64) {
        let clamped = fee.min(fee_scale());
        if clamped != fee {
            warn!(fee = %fee, "admin fee above 1.0 clamped");
        }
        self.admin_fee = clamped;
        self.touch(timestamp);
    }

    /// Snapshot the current member list into a committed block and persist
    /// it. Earnings are not mutated; the block becomes `latest`.
    pub async fn on_block_created(
        &mut self,
        block_number: u64,
        timestamp: u64,
        root_hash: B256,
    ) -> Result<()> {
        let block = Block {
            block_number,
            timestamp,
            members: self.members.values().cloned().collect(),
            total_earnings: self.total_revenue,
            admin_earnings: self.admin.earnings,
            admin_address: self.admin.address,
            admin_fee: self.admin_fee,
            root_hash,
        };
        self.store.save_block(&block).await?;

        self.commit_log.push(block.block_ref());
        self.block_cache.insert(block_number, block.clone());
        self.current_block = self.current_block.max(block_number);
        self.touch(timestamp);
        self.latest = Some(block);
        info!(block_number, root = %root_hash, "block committed");
        Ok(())
    }

    // ── views and proofs ─────────────────────────────────────────────────

    /// The most recent committed block, if any.
    pub fn latest_block(&self) -> Option<&Block> {
        self.latest.as_ref()
    }

    /// The most recent committed block strictly older than
    /// `now − block_freeze_seconds`. `now` is supplied by the caller (the
    /// operator passes wall-clock ms).
    pub async fn latest_withdrawable_block(&mut self, now_ms: u64) -> Result<Option<Block>> {
        let cutoff = now_ms.saturating_sub(self.block_freeze_seconds.saturating_mul(1000));
        let candidate = self
            .commit_log
            .iter()
            .rev()
            .find(|r| r.timestamp < cutoff)
            .map(|r| r.block_number);
        match candidate {
            Some(n) => Ok(Some(self.fetch_block(n).await?)),
            None => Ok(None),
        }
    }

    /// Merkle path proving `address`'s earnings in committed block
    /// `block_number`.
    ///
    /// Returns an **empty path** for a member with zero earnings (nothing to
    /// withdraw, not an error), [`Error::NoBlock`] for an uncommitted block
    /// number, and [`Error::NotAMember`] for an address outside the
    /// snapshot. The block's tree is built on the first request and cached.
    pub async fn proof_at(&mut self, address: &Address, block_number: u64) -> Result<Vec<B256>> {
        let block = self.fetch_block(block_number).await?;
        let member = block.member(address).ok_or(Error::NotAMember(*address))?;
        if member.earnings.is_zero() {
            return Ok(Vec::new());
        }

        let tree = match self.tree_cache.get(&block_number) {
            Some(tree) => Arc::clone(tree),
            None => {
                let tree = Arc::new(block.build_tree(self.tree_salt)?);
                self.tree_cache.insert(block_number, Arc::clone(&tree));
                tree
            }
        };
        tree.path(address)
    }

    /// The real-time preview tree over the current member list. Rebuilt
    /// lazily after any mutation; the returned handle stays valid across
    /// later mutations.
    pub fn real_time_tree(&mut self) -> Result<Arc<MerkleTree>> {
        if let Some(tree) = &self.preview {
            return Ok(Arc::clone(tree));
        }
        let members: Vec<Member> = self.members.values().cloned().collect();
        let tree = Arc::new(MerkleTree::build(&members, self.tree_salt)?);
        self.preview = Some(Arc::clone(&tree));
        Ok(tree)
    }

    pub fn member_counts(&self) -> MemberCounts {
        MemberCounts {
            active: self.members.values().filter(|m| m.active).count(),
            total: self.members.len(),
        }
    }

    pub fn member(&self, address: &Address) -> Option<&Member> {
        self.members.get(address)
    }

    /// Members in address order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn admin(&self) -> &Member {
        &self.admin
    }

    pub fn admin_fee(&self) -> U256 {
        self.admin_fee
    }

    pub fn block_freeze_seconds(&self) -> u64 {
        self.block_freeze_seconds
    }

    pub fn current_block(&self) -> u64 {
        self.current_block
    }

    /// ms since epoch of the newest applied event.
    pub fn current_timestamp(&self) -> u64 {
        self.current_timestamp
    }

    pub fn total_revenue(&self) -> U256 {
        self.total_revenue
    }

    pub fn last_committed_block_number(&self) -> Option<u64> {
        self.latest.as_ref().map(|b| b.block_number)
    }

    // ── internals ────────────────────────────────────────────────────────

    async fn fetch_block(&mut self, block_number: u64) -> Result<Block> {
        if let Some(block) = self.block_cache.get(&block_number) {
            return Ok(block.clone());
        }
        let block = self
            .store
            .load_block(block_number)
            .await
            .map_err(Error::from)?
            .ok_or(Error::NoBlock(block_number))?;
        self.block_cache.insert(block_number, block.clone());
        Ok(block)
    }

    fn touch(&mut self, timestamp: u64) {
        self.current_timestamp = self.current_timestamp.max(timestamp);
    }
}
