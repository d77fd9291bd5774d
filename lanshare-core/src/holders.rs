//! Which peers are believed to hold which chunks. Advisory only: a listed holder may
//! have dropped the chunk since announcing it.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

#[derive(Debug, Default)]
pub struct ChunkHolderIndex {
    holders: HashMap<(String, u32), BTreeSet<IpAddr>>,
}

impl ChunkHolderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer` as a holder of chunk `index` of `file_name`. Returns true if newly recorded.
    pub fn add(&mut self, file_name: &str, index: u32, peer: IpAddr) -> bool {
        self.holders
            .entry((file_name.to_string(), index))
            .or_default()
            .insert(peer)
    }

    /// Known holders of one chunk, in a stable order.
    pub fn holders(&self, file_name: &str, index: u32) -> Vec<IpAddr> {
        self.holders
            .get(&(file_name.to_string(), index))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_holder(&self, file_name: &str, index: u32) -> bool {
        self.holders
            .get(&(file_name.to_string(), index))
            .is_some_and(|s| !s.is_empty())
    }

    /// Drop every entry for a file, e.g. once its transfer completed.
    pub fn forget_file(&mut self, file_name: &str) {
        self.holders.retain(|(name, _), _| name != file_name);
    }
}
