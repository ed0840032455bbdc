use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
};

use hashbrown::HashMap;
use tokio::time::Instant;

use crate::message::BlockInfo;

/// The block requests in flight to a single peer, with their deadlines.
#[derive(Debug, Default)]
pub struct RequestManager {
    // min-heap of deadlines, entries of removed requests are skipped lazily
    timeouts: BinaryHeap<(Reverse<Instant>, BlockInfo)>,
    // piece index → requested blocks of that piece
    requests: BTreeMap<usize, Vec<BlockInfo>>,
    // reverse index `BlockInfo → deadline`
    index: HashMap<BlockInfo, Instant>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, block: &BlockInfo) -> bool {
        self.index.contains_key(block)
    }

    /// Forget every request, returning them grouped by piece.
    pub fn drain(&mut self) -> BTreeMap<usize, Vec<BlockInfo>> {
        self.index.clear();
        self.timeouts.clear();
        std::mem::take(&mut self.requests)
    }

    pub fn add_request(&mut self, block: BlockInfo, timeout: Instant) {
        if self.index.insert(block, timeout).is_none() {
            self.requests.entry(block.index as usize).or_default().push(block);
        }
        self.timeouts.push((Reverse(timeout), block));
    }

    /// Return true if the request exists, and false otherwise.
    pub fn remove_request(&mut self, block: &BlockInfo) -> bool {
        if self.index.remove(block).is_none() {
            return false;
        }
        let i = block.index as usize;

        if let Some(blocks) = self.requests.get_mut(&i) {
            blocks.retain(|b| b != block);
            if blocks.is_empty() {
                self.requests.remove(&i);
            }
        }

        // shrink the heap once most of it are leftovers of removed requests
        if self.timeouts.len() > 2 * self.index.len() + 16 {
            let index = &self.index;
            self.timeouts.retain(|(t, b)| index.get(b) == Some(&t.0));
        }

        true
    }

    /// Remove and return every request whose deadline is `<= now`, oldest
    /// first.
    pub fn take_timed_out(&mut self, now: Instant) -> Vec<BlockInfo> {
        let mut timed_out = Vec::new();

        while let Some((Reverse(deadline), block)) = self.timeouts.peek() {
            if *deadline > now {
                break;
            }
            let (deadline, block) = (*deadline, *block);
            self.timeouts.pop();

            // the request was removed or re-added with a new deadline
            if self.index.get(&block) != Some(&deadline) {
                continue;
            }
            self.remove_request(&block);
            timed_out.push(block);
        }

        timed_out
    }

    pub fn get_blocks_for_piece(&self, piece_index: usize) -> Option<&[BlockInfo]> {
        self.requests.get(&piece_index).map(|v| v.as_slice())
    }
}
