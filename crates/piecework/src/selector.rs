//! Strategies that pick the piece a peer should work on next.
use std::fmt::Debug;

use crate::{
    file_set::{BlockStatus, FileSet},
    peer::Peer,
};

/// Picks a piece for a peer.
///
/// A returned piece is a hint: by the time the scheduler asks it for a
/// block, other peers may have taken all of them.
pub trait PieceSelector: Send + Sync + Debug {
    /// Index of a needed piece that `peer` has, or `None` if there is
    /// nothing for it.
    fn select_piece(&self, files: &FileSet, peer: &Peer) -> Option<usize>;
}

/// Finish pieces before opening new ones: prefer pieces that already have
/// requested or stored blocks, then the lowest index.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullPieceSelect;

impl PieceSelector for FullPieceSelect {
    fn select_piece(&self, files: &FileSet, peer: &Peer) -> Option<usize> {
        files
            .needed_pieces()
            .filter(|p| peer.has_piece(p.index()))
            .filter(|p| p.has_block_with_status(BlockStatus::Needed))
            .min_by_key(|p| (!p.is_started(), p.index()))
            .map(|p| p.index())
    }
}
