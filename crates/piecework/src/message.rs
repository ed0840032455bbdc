//! Types of the peer wire messages that the engine produces and consumes.
//!
//! Framing these on the socket is the job of the peer I/O layer that
//! receives peers after the handshake; the engine only builds the values.

/// The default length of a block, 16 KiB.
pub const BLOCK_LEN: u32 = 16_384;

/// The metadata of a block, what a `Request` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes. <= 16 KiB
    pub len: u32,
}

impl BlockInfo {
    pub fn new(index: u32, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }

    /// Index of the block inside its piece.
    pub fn block_index(&self, block_len: u32) -> usize {
        (self.begin / block_len) as usize
    }
}

/// A block downloaded from a peer, the payload of a `Piece` message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Block {
    /// The index of the piece of which this is a block.
    pub index: usize,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's data. 16 KiB most of the times,
    /// but the last block of a piece *might* be smaller.
    pub block: Vec<u8>,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            index: self.index as u32,
            begin: self.begin,
            len: self.block.len() as u32,
        }
    }
}

/// Messages the scheduler puts on a peer's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(BlockInfo),
}
