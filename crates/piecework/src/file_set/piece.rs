use parking_lot::Mutex;

use crate::{error::Error, message::BlockInfo};

/// Download status of a single block of a [`Piece`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    /// Nobody asked for it yet, or it was given back.
    Needed,
    /// A request is in flight to some peer.
    Requested,
    /// The block was written to storage.
    Stored,
}

#[derive(Debug)]
struct PieceState {
    blocks: Vec<BlockStatus>,
    /// Set only after the hash was verified.
    complete: bool,
}

/// A fixed-size chunk of the torrent, divided into blocks.
///
/// The block statuses are touched by the scheduler and the disk jobs at the
/// same time, so every access goes through the piece's lock and no
/// reference to the statuses ever leaves it.
#[derive(Debug)]
pub struct Piece {
    index: usize,
    hash: [u8; 20],
    size: usize,
    block_len: usize,
    state: Mutex<PieceState>,
}

impl Piece {
    pub fn new(index: usize, hash: [u8; 20], size: usize, block_len: usize) -> Self {
        let blocks = vec![BlockStatus::Needed; size.div_ceil(block_len)];
        Self {
            index,
            hash,
            size,
            block_len,
            state: Mutex::new(PieceState { blocks, complete: false }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The expected SHA-1 of the piece data.
    pub fn hash(&self) -> &[u8; 20] {
        &self.hash
    }

    /// Size of the piece in bytes, the last piece of a torrent may be
    /// smaller than the others.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn block_count(&self) -> usize {
        self.size.div_ceil(self.block_len)
    }

    /// Size of the block, only the last one may be smaller than the block
    /// length.
    pub fn block_size(&self, block: usize) -> usize {
        let begin = block * self.block_len;
        self.block_len.min(self.size.saturating_sub(begin))
    }

    pub fn block_info(&self, block: usize) -> BlockInfo {
        BlockInfo {
            index: self.index as u32,
            begin: (block * self.block_len) as u32,
            len: self.block_size(block) as u32,
        }
    }

    pub fn status(&self, block: usize) -> Option<BlockStatus> {
        self.state.lock().blocks.get(block).copied()
    }

    pub fn has_block_with_status(&self, status: BlockStatus) -> bool {
        self.state.lock().blocks.contains(&status)
    }

    pub fn count_blocks_with_status(&self, status: BlockStatus) -> usize {
        self.state.lock().blocks.iter().filter(|b| **b == status).count()
    }

    /// If some block was already requested or stored.
    pub fn is_started(&self) -> bool {
        self.state.lock().blocks.iter().any(|b| *b != BlockStatus::Needed)
    }

    /// Find the first needed block and mark it requested, in one step.
    ///
    /// Returns `None` when every block is already requested or stored,
    /// which happens when another peer took the last block between piece
    /// selection and this call.
    pub fn take_request_block(&self) -> Option<BlockInfo> {
        let mut state = self.state.lock();
        if state.complete {
            return None;
        }
        let block =
            state.blocks.iter().position(|b| *b == BlockStatus::Needed)?;
        state.blocks[block] = BlockStatus::Requested;
        drop(state);

        Some(self.block_info(block))
    }

    /// Mark a block as written to storage. Returns true when this made every
    /// block of the piece stored, the piece is then ready to be hashed.
    pub fn mark_stored(&self, block: usize) -> Result<bool, Error> {
        let mut state = self.state.lock();
        if state.complete {
            return Ok(false);
        }
        let status = state.blocks.get_mut(block).ok_or(
            Error::BlockOutOfRange {
                index: self.index,
                begin: block * self.block_len,
            },
        )?;
        let was_stored = *status == BlockStatus::Stored;
        *status = BlockStatus::Stored;

        Ok(!was_stored && state.blocks.iter().all(|b| *b == BlockStatus::Stored))
    }

    /// Give a single block back to the pool of needed blocks.
    pub fn reset_block(&self, block: usize) {
        let mut state = self.state.lock();
        if state.complete {
            return;
        }
        if let Some(status) = state.blocks.get_mut(block) {
            *status = BlockStatus::Needed;
        }
    }

    /// Give back a block that was requested but never arrived, a block that
    /// was stored in the meantime is left alone.
    pub fn release_request(&self, block: usize) -> bool {
        let mut state = self.state.lock();
        match state.blocks.get_mut(block) {
            Some(status) if *status == BlockStatus::Requested => {
                *status = BlockStatus::Needed;
                true
            }
            _ => false,
        }
    }

    /// Every block goes back to needed, used when the hash didn't match.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.complete = false;
        state.blocks.fill(BlockStatus::Needed);
    }

    /// Every block is stored, the hash may not be verified yet.
    pub fn all_blocks_stored(&self) -> bool {
        self.state.lock().blocks.iter().all(|b| *b == BlockStatus::Stored)
    }

    /// The piece was verified and will never be requested again.
    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    pub fn mark_complete(&self) {
        let mut state = self.state.lock();
        state.blocks.fill(BlockStatus::Stored);
        state.complete = true;
    }
}
