//! Aggregate hash maintenance across out-of-order part completions
//!
//! The dump-wide hash is the SHA-256 of `H(p1) "\n" H(p2) "\n" ...` where
//! `H(pi)` is the lowercase hex SHA-256 of part i's uncompressed bytes, in
//! ascending part order. Workers finish parts in arbitrary order, so hashes
//! are staged in a reorder buffer and fed to a long-lived digest strictly in
//! part-number order: the only mutation is "consume in ascending order while
//! the next part is present".

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Folds part hashes into the aggregate digest in part-number order,
/// holding out-of-order arrivals until the gap fills.
pub struct HashFolder {
    digest: Sha256,
    pending: BTreeMap<u32, String>,
    next: u32,
}

impl HashFolder {
    pub fn new() -> Self {
        Self {
            digest: Sha256::new(),
            pending: BTreeMap::new(),
            next: 1,
        }
    }

    /// Stage the lowercase hex hash of `part_number` and fold every
    /// contiguous pending hash into the digest.
    pub fn add(&mut self, part_number: u32, part_hash: String) {
        self.pending.insert(part_number, part_hash);
        while let Some(hash) = self.pending.remove(&self.next) {
            self.digest.update(hash.as_bytes());
            self.digest.update(b"\n");
            self.next += 1;
        }
    }

    /// The highest contiguous part number folded so far and the hex digest
    /// over everything folded up to it.
    pub fn value(&self) -> (i64, String) {
        let folded = i64::from(self.next) - 1;
        (folded, format!("{:x}", self.digest.clone().finalize()))
    }
}

impl Default for HashFolder {
    fn default() -> Self {
        Self::new()
    }
}
