//! # Deterministic sibling-sorted Merkle tree
//!
//! Builds the commitment tree over an address-sorted member list. The root
//! is submitted on-chain; member withdrawal proofs are sibling paths from
//! this tree.
//!
//! ## Algorithm — MUST be byte-identical to the on-chain verifier
//!
//! ### Leaf
//!
//! ```text
//! leaf = keccak256( ascii(salt) ‖ ascii(address) ‖ hex64(earnings) )
//! ```
//!
//! `ascii(salt)` is the decimal rendering of the block-number salt, or the
//! empty string when no salt is used (the deployed verifier was validated
//! against the empty form). `ascii(address)` is the 42-character lowercase
//! `0x` hex form. `hex64(earnings)` is 64 lowercase hex digits of the
//! big-endian 32-byte earnings value. The verifier computes the same bytes
//! with `abi.encodePacked`.
//!
//! ### Branch
//!
//! ```text
//! parent = keccak256( min(L, R) ‖ max(L, R) )
//! ```
//!
//! Sibling-sorted hashing lets the verifier walk a path without knowing each
//! sibling's side.
//!
//! ### Odd tail
//!
//! A level's trailing lone child is hoisted verbatim; its missing sibling
//! stays all-zero in the array and contributes an identity step to paths.
//! The verifier skips zero siblings the same way.
//!
//! ## Layout
//!
//! One contiguous array of `branch_count + leaf_count` 32-byte values.
//! `hashes[0]` carries `branch_count` as a big-endian scalar (a convenience
//! sentinel, not a hash). Leaves start at `branch_count`; node `i` has
//! children `2i` and `2i + 1`; the root sits at index 1.

use std::collections::HashMap;

use alloy_primitives::{Address, B256, U256};
use sha3::{Digest, Keccak256};

use crate::error::{Error, Result};
use crate::member::Member;

/// Hard cap on the leaf range; beyond this the index arithmetic and the
/// on-chain verifier's assumptions no longer hold.
const MAX_LEAF_COUNT: u64 = 1 << 31;

/// keccak-256 of arbitrary bytes (the pre-NIST padding the EVM uses).
pub fn keccak256(data: &[u8]) -> B256 {
    let digest = Keccak256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    B256::from(out)
}

/// Sibling-sorted branch hash: `keccak256(min ‖ max)`.
pub fn hash_pair(a: &B256, b: &B256) -> B256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Keccak256::new();
    hasher.update(lo.as_slice());
    hasher.update(hi.as_slice());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    B256::from(out)
}

/// Leaf digest for a member at a given salt. Exposed so proofs can be
/// recomputed outside the tree (read API, tests, verifier parity checks).
pub fn leaf_hash(salt: Option<u64>, address: &Address, earnings: U256) -> B256 {
    let salt_part = salt.map(|s| s.to_string()).unwrap_or_default();
    let addr_part = format!("0x{}", hex::encode(address.as_slice()));
    let earnings_part = hex::encode(earnings.to_be_bytes::<32>());
    let preimage = format!("{salt_part}{addr_part}{earnings_part}");
    keccak256(preimage.as_bytes())
}

/// The verifier's walk: fold the path over the leaf, skipping zero siblings,
/// and compare against the root. This mirrors the on-chain algorithm exactly
/// and is what the conformance tests run proofs through.
pub fn verify_path(leaf: B256, path: &[B256], root: B256) -> bool {
    let mut acc = leaf;
    for sibling in path {
        if sibling.is_zero() {
            continue;
        }
        acc = hash_pair(&acc, sibling);
    }
    acc == root
}

/// Deterministic commitment tree over an ordered member sequence.
///
/// Building is a pure function: the same members in the same order with the
/// same salt produce the same hash array and index map, bit for bit.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    hashes: Vec<B256>,
    index_of: HashMap<Address, usize>,
    branch_count: usize,
    salt: Option<u64>,
}

impl MerkleTree {
    /// Build the tree. Fails with [`Error::EmptyInput`] on an empty member
    /// list. Callers are responsible for supplying members in address-sorted
    /// order; the state engine always does.
    pub fn build(members: &[Member], salt: Option<u64>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::EmptyInput);
        }

        let member_count = members.len();
        let leaf_count = member_count + (member_count & 1);
        if leaf_count as u64 > MAX_LEAF_COUNT {
            return Err(Error::TooManyLeaves(leaf_count as u64));
        }
        let branch_count = leaf_count.next_power_of_two();

        let mut hashes = vec![B256::ZERO; branch_count + leaf_count];
        // Sentinel: branch_count at slot 0, big-endian. Not a hash.
        hashes[0] = B256::from(U256::from(branch_count as u64).to_be_bytes::<32>());

        let mut index_of = HashMap::with_capacity(member_count);
        for (slot, member) in members.iter().enumerate() {
            let idx = branch_count + slot;
            hashes[idx] = leaf_hash(salt, &member.address, member.earnings);
            index_of.insert(member.address, idx);
        }

        // Reduce level by level toward the root. `count` tracks how many
        // nodes of the current level actually exist; the zero padding past
        // it is never hashed into a parent.
        let mut start = branch_count;
        let mut count = member_count;
        while start > 1 {
            let parent_start = start / 2;
            let parent_count = (count + 1) / 2;
            for k in 0..parent_count {
                let left = hashes[start + 2 * k];
                let parent = if 2 * k + 1 < count {
                    hash_pair(&left, &hashes[start + 2 * k + 1])
                } else {
                    // Lone tail child: hoisted verbatim, zero sibling.
                    left
                };
                hashes[parent_start + k] = parent;
            }
            start = parent_start;
            count = parent_count;
        }

        Ok(Self {
            hashes,
            index_of,
            branch_count,
            salt,
        })
    }

    /// The committed root: `hashes[1]`.
    pub fn root_hash(&self) -> B256 {
        self.hashes[1]
    }

    /// `0x`-prefixed lowercase hex of the root, the wire encoding used by
    /// the commit transaction.
    pub fn root_hash_hex(&self) -> String {
        format!("{}", self.root_hash())
    }

    /// Sibling digests from the member's leaf up to (but excluding) the
    /// root. Fails with [`Error::NotAMember`] for unknown addresses.
    pub fn path(&self, address: &Address) -> Result<Vec<B256>> {
        let mut i = *self
            .index_of
            .get(address)
            .ok_or(Error::NotAMember(*address))?;
        let mut path = Vec::with_capacity(self.branch_count.trailing_zeros() as usize);
        while i > 1 {
            path.push(self.hashes[i ^ 1]);
            i >>= 1;
        }
        Ok(path)
    }

    /// Number of allocated leaf slots (members rounded up to even).
    pub fn leaf_count(&self) -> usize {
        self.hashes.len() - self.branch_count
    }

    pub fn branch_count(&self) -> usize {
        self.branch_count
    }

    pub fn salt(&self) -> Option<u64> {
        self.salt
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index_of.contains_key(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    fn member(byte: u8, earnings: u64) -> Member {
        let mut m = Member::new(Address::from([byte; 20]));
        m.earnings = U256::from(earnings);
        m
    }

    fn members(entries: &[(u8, u64)]) -> Vec<Member> {
        entries.iter().map(|&(b, e)| member(b, e)).collect()
    }

    // ── leaf encoding ────────────────────────────────────────────────────

    #[test]
    fn leaf_preimage_matches_packed_encoding() {
        let addr = Address::from([0xAAu8; 20]);
        let earnings = U256::from(100u64);

        // No salt: preimage is "0x<40 hex>" + 64 hex digits of earnings.
        let expected = keccak256(
            format!(
                "0x{}{}",
                "aa".repeat(20),
                format!("{:064x}", 100u64)
            )
            .as_bytes(),
        );
        assert_eq!(leaf_hash(None, &addr, earnings), expected);

        // With salt: decimal block number prefixes the same bytes.
        let salted = keccak256(
            format!(
                "42{}{}",
                format!("0x{}", "aa".repeat(20)),
                format!("{:064x}", 100u64)
            )
            .as_bytes(),
        );
        assert_eq!(leaf_hash(Some(42), &addr, earnings), salted);
        assert_ne!(leaf_hash(Some(42), &addr, earnings), expected);
    }

    #[test]
    fn branch_hash_is_sibling_sorted() {
        let a = keccak256(b"a");
        let b = keccak256(b"b");
        assert_eq!(hash_pair(&a, &b), hash_pair(&b, &a));
        assert_ne!(hash_pair(&a, &b), hash_pair(&a, &a));
    }

    // ── build shapes ─────────────────────────────────────────────────────

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            MerkleTree::build(&[], None),
            Err(Error::EmptyInput)
        ));
    }

    #[test]
    fn single_member_root_is_the_leaf() {
        let ms = members(&[(0xAA, 100)]);
        let tree = MerkleTree::build(&ms, None).unwrap();
        assert_eq!(tree.branch_count(), 2);
        assert_eq!(tree.leaf_count(), 2);

        let leaf = leaf_hash(None, &ms[0].address, ms[0].earnings);
        // Zero sibling carries no information; the root is the leaf itself.
        assert_eq!(tree.root_hash(), leaf);

        let path = tree.path(&ms[0].address).unwrap();
        assert_eq!(path, vec![B256::ZERO]);
        assert!(verify_path(leaf, &path, tree.root_hash()));
    }

    #[test]
    fn two_members_no_padding() {
        let ms = members(&[(0x01, 10), (0x02, 20)]);
        let tree = MerkleTree::build(&ms, None).unwrap();
        assert_eq!(tree.branch_count(), 2);

        let l0 = leaf_hash(None, &ms[0].address, ms[0].earnings);
        let l1 = leaf_hash(None, &ms[1].address, ms[1].earnings);
        assert_eq!(tree.root_hash(), hash_pair(&l0, &l1));

        let p0 = tree.path(&ms[0].address).unwrap();
        assert_eq!(p0, vec![l1]);
        assert!(verify_path(l0, &p0, tree.root_hash()));
    }

    #[test]
    fn three_members_hoist_the_tail() {
        let ms = members(&[(0x01, 1), (0x02, 2), (0x03, 3)]);
        let tree = MerkleTree::build(&ms, None).unwrap();
        assert_eq!(tree.branch_count(), 4);

        let l: Vec<B256> = ms
            .iter()
            .map(|m| leaf_hash(None, &m.address, m.earnings))
            .collect();
        // Level above leaves: [H(l0,l1), l2-verbatim]; root pairs them.
        let expected_root = hash_pair(&hash_pair(&l[0], &l[1]), &l[2]);
        assert_eq!(tree.root_hash(), expected_root);

        // Middle member: one real sibling, then the pair of the hoisted tail.
        let p1 = tree.path(&ms[1].address).unwrap();
        assert_eq!(p1.len(), 2);
        assert_eq!(p1[0], l[0]);
        assert_eq!(p1[1], l[2]);
        assert!(verify_path(l[1], &p1, tree.root_hash()));

        // Tail member: zero sibling first, identity step in verification.
        let p2 = tree.path(&ms[2].address).unwrap();
        assert_eq!(p2[0], B256::ZERO);
        assert!(verify_path(l[2], &p2, tree.root_hash()));
    }

    #[test]
    fn unknown_address_is_not_a_member() {
        let ms = members(&[(0x01, 1)]);
        let tree = MerkleTree::build(&ms, None).unwrap();
        let stranger = Address::from([0xEEu8; 20]);
        assert!(matches!(
            tree.path(&stranger),
            Err(Error::NotAMember(a)) if a == stranger
        ));
    }

    // ── determinism ──────────────────────────────────────────────────────

    #[test]
    fn build_is_pure() {
        let ms = members(&[(0x05, 50), (0x01, 10), (0x03, 30), (0x02, 20), (0x04, 40)]);
        let mut sorted_a = ms.clone();
        sorted_a.sort_by_key(|m| m.address);
        // Different insertion history, identical sorted order.
        let mut sorted_b = ms;
        sorted_b.reverse();
        sorted_b.sort_by_key(|m| m.address);

        let t1 = MerkleTree::build(&sorted_a, None).unwrap();
        let t2 = MerkleTree::build(&sorted_b, None).unwrap();
        assert_eq!(t1.root_hash(), t2.root_hash());
        assert_eq!(t1.hashes, t2.hashes);
        for m in &sorted_a {
            assert_eq!(
                t1.path(&m.address).unwrap(),
                t2.path(&m.address).unwrap()
            );
        }
    }

    #[test]
    fn sentinel_slot_holds_branch_count() {
        let ms = members(&[(0x01, 1), (0x02, 2), (0x03, 3)]);
        let tree = MerkleTree::build(&ms, None).unwrap();
        assert_eq!(
            tree.hashes[0],
            B256::from(U256::from(4u64).to_be_bytes::<32>())
        );
    }

    // ── verifier conformance over tree shapes ────────────────────────────

    #[test]
    fn every_member_proves_against_the_root() {
        for n in 1usize..=17 {
            let ms: Vec<Member> = (0..n).map(|i| member(i as u8 + 1, (i as u64 + 1) * 7)).collect();
            let tree = MerkleTree::build(&ms, None).unwrap();
            for m in &ms {
                let leaf = leaf_hash(None, &m.address, m.earnings);
                let path = tree.path(&m.address).unwrap();
                assert_eq!(path.len(), tree.branch_count().trailing_zeros() as usize);
                assert!(
                    verify_path(leaf, &path, tree.root_hash()),
                    "proof failed for member {} of {}",
                    m.address,
                    n
                );
            }
        }
    }

    #[test]
    fn power_of_two_member_counts_up_to_2_15() {
        for k in [1u32, 4, 10, 15] {
            let n = 1usize << k;
            let ms: Vec<Member> = (0..n)
                .map(|i| {
                    let mut bytes = [0u8; 20];
                    bytes[12..].copy_from_slice(&(i as u64 + 1).to_be_bytes());
                    let mut m = Member::new(Address::from(bytes));
                    m.earnings = U256::from(i as u64 + 1);
                    m
                })
                .collect();
            let tree = MerkleTree::build(&ms, None).unwrap();
            assert_eq!(tree.branch_count(), n);

            // Spot-check first, middle, last.
            for probe in [0, n / 2, n - 1] {
                let m = &ms[probe];
                let leaf = leaf_hash(None, &m.address, m.earnings);
                let path = tree.path(&m.address).unwrap();
                assert_eq!(path.len(), k as usize);
                assert!(verify_path(leaf, &path, tree.root_hash()));
            }
        }
    }

    #[test]
    fn salt_changes_the_root() {
        let ms = members(&[(0x01, 1), (0x02, 2)]);
        let unsalted = MerkleTree::build(&ms, None).unwrap();
        let salted = MerkleTree::build(&ms, Some(7)).unwrap();
        assert_ne!(unsalted.root_hash(), salted.root_hash());
        assert_eq!(salted.salt(), Some(7));
    }

    #[test]
    fn root_hex_is_lowercase_prefixed() {
        let ms = members(&[(0x01, 1)]);
        let tree = MerkleTree::build(&ms, None).unwrap();
        let hex = tree.root_hash_hex();
        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 66);
        assert_eq!(hex, hex.to_lowercase());
    }
}
