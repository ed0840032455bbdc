//! The pieces of a torrent and the storage that backs them.
mod piece;
mod storage;

pub use piece::*;
pub use storage::*;

use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
};

use sha1_smol::Sha1;

use crate::error::Error;

#[derive(Debug)]
pub struct FileSet {
    download_dir: PathBuf,
    piece_length: usize,
    block_len: usize,
    total_size: u64,
    pieces: Vec<Piece>,
    storage: Box<dyn Storage>,
}

impl FileSet {
    /// `hashes` has one SHA-1 per piece, the number of pieces is taken from
    /// it.
    pub fn new(
        download_dir: impl Into<PathBuf>,
        piece_length: usize,
        block_len: usize,
        total_size: u64,
        hashes: Vec<[u8; 20]>,
        storage: Box<dyn Storage>,
    ) -> Self {
        let last = hashes.len().saturating_sub(1);
        let pieces = hashes
            .into_iter()
            .enumerate()
            .map(|(index, hash)| {
                let size = if index == last {
                    (total_size as usize).saturating_sub(index * piece_length)
                } else {
                    piece_length
                };
                Piece::new(index, hash, size, block_len)
            })
            .collect();

        Self {
            download_dir: download_dir.into(),
            piece_length,
            block_len,
            total_size,
            pieces,
            storage,
        }
    }

    /// The directory the files of the torrent are written to.
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Create the download dir and its parents.
    pub fn create_download_dir(&self) -> Result<(), Error> {
        create_dir_all(&self.download_dir)
            .map_err(|_| Error::DownloadDirCreate(self.download_dir.clone()))
    }

    pub fn piece_length(&self) -> usize {
        self.piece_length
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn piece(&self, index: usize) -> Result<&Piece, Error> {
        self.pieces.get(index).ok_or(Error::PieceOutOfRange(index))
    }

    /// Pieces which were not verified yet.
    pub fn needed_pieces(&self) -> impl Iterator<Item = &Piece> {
        self.pieces.iter().filter(|p| !p.is_complete())
    }

    pub fn completed_pieces(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_complete()).count()
    }

    /// True when there are no needed pieces.
    pub fn is_done(&self) -> bool {
        self.needed_pieces().next().is_none()
    }

    fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Write the payload of a block to storage, but does not change its
    /// status.
    pub fn write_block(
        &self,
        index: usize,
        block: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        let piece = self.piece(index)?;
        let begin = block * self.block_len;

        if block >= piece.block_count() || piece.block_size(block) != data.len()
        {
            return Err(Error::BlockOutOfRange { index, begin });
        }

        self.storage.write_at(self.piece_offset(index) + begin as u64, data)?;
        Ok(())
    }

    /// Read the piece back and compare its SHA-1 with the expected one.
    pub fn hash_matches(&self, index: usize) -> Result<bool, Error> {
        let piece = self.piece(index)?;
        let data = self.storage.read_at(self.piece_offset(index), piece.size())?;
        let hash = Sha1::from(&data).digest().bytes();

        Ok(hash == *piece.hash())
    }

    /// Drop whatever was written for the piece.
    pub fn discard_piece(&self, index: usize) -> Result<(), Error> {
        let piece = self.piece(index)?;
        self.storage.discard(self.piece_offset(index), piece.size())?;
        Ok(())
    }
}
