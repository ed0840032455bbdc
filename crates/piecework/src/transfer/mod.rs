//! A transfer is one torrent being downloaded: its pieces, the peers bound
//! to it and its counters.
mod types;

// re-exports
pub use types::*;

use std::{
    path::Path,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    disk::{DiskJob, DiskQueue},
    error::Error,
    file_set::{FileSet, FileStorage},
    message::{Block, BlockInfo, BLOCK_LEN},
    metainfo::Info,
    peer::{Peer, PeerId},
    selector::{FullPieceSelect, PieceSelector},
    tracker::Announcer,
};

/// A snapshot of how far a transfer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub completed_pieces: usize,
    pub pieces: usize,
    /// Bytes of blocks received from peers.
    pub downloaded: u64,
    pub total_size: u64,
}

pub struct Transfer {
    info_hash: InfoHash,
    name: String,
    files: FileSet,
    peers: RwLock<Vec<Arc<Peer>>>,
    selector: RwLock<Arc<dyn PieceSelector>>,

    /// Disk jobs enqueued for this transfer that did not finish yet.
    halting: AtomicI64,
    downloaded: AtomicU64,

    /// Verified pieces.
    bitfield: RwLock<Bitfield>,

    trackers: Vec<Arc<dyn Announcer>>,
    disk: Arc<DiskQueue>,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("info_hash", &self.info_hash)
            .field("name", &self.name)
            .field("halting", &self.halting)
            .finish_non_exhaustive()
    }
}

impl Transfer {
    pub fn new(
        info_hash: InfoHash,
        name: impl Into<String>,
        files: FileSet,
        trackers: Vec<Arc<dyn Announcer>>,
        disk: Arc<DiskQueue>,
    ) -> Self {
        let bitfield = Bitfield::from_piece(files.piece_count());
        Self {
            info_hash,
            name: name.into(),
            files,
            peers: RwLock::new(Vec::new()),
            selector: RwLock::new(Arc::new(FullPieceSelect)),
            halting: AtomicI64::new(0),
            downloaded: AtomicU64::new(0),
            bitfield: RwLock::new(bitfield),
            trackers,
            disk,
        }
    }

    /// Build a transfer that writes the files of `info` under
    /// `download_dir`.
    #[tracing::instrument(skip_all, fields(name = %info.name))]
    pub fn from_info(
        info: &Info,
        download_dir: &Path,
        trackers: Vec<Arc<dyn Announcer>>,
        disk: Arc<DiskQueue>,
    ) -> Result<Self, Error> {
        info.validate()?;
        let storage = FileStorage::new(download_dir, info.files()?);
        let files = FileSet::new(
            download_dir,
            info.piece_length,
            BLOCK_LEN as usize,
            info.total_size(),
            info.piece_hashes(),
            Box::new(storage),
        );
        debug!("{} pieces of {} bytes", files.piece_count(), info.piece_length);

        Ok(Self::new(info.info_hash, info.name.clone(), files, trackers, disk))
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    pub fn disk(&self) -> &Arc<DiskQueue> {
        &self.disk
    }

    pub fn trackers(&self) -> &[Arc<dyn Announcer>] {
        &self.trackers
    }

    /// The peers connected at this moment.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().clone()
    }

    pub fn add_peer(&self, peer: Arc<Peer>) {
        debug!("{:?} peer {} connected", self.info_hash, peer.id);
        self.peers.write().push(peer);
    }

    /// Remove the peer and give its pending requests back to the pool of
    /// needed blocks.
    pub fn remove_peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let peer = {
            let mut peers = self.peers.write();
            let i = peers.iter().position(|p| p.id == *id)?;
            peers.remove(i)
        };

        let released = peer.drain_requests();
        for block in &released {
            self.release_block(block);
        }
        debug!(
            "{:?} peer {id} removed, released {} requests",
            self.info_hash,
            released.len()
        );

        Some(peer)
    }

    pub fn selector(&self) -> Arc<dyn PieceSelector> {
        self.selector.read().clone()
    }

    pub fn set_selector(&self, selector: Arc<dyn PieceSelector>) {
        *self.selector.write() = selector;
    }

    /// Make a requested block needed again, a block stored in the meantime
    /// is left alone.
    pub fn release_block(&self, block: &BlockInfo) {
        let Ok(piece) = self.files.piece(block.index as usize) else { return };
        piece.release_request(block.block_index(self.files.block_len() as u32));
    }

    pub fn halting_work(&self) -> i64 {
        self.halting.load(Ordering::Acquire)
    }

    pub fn add_halting_work(&self) {
        self.halting.fetch_add(1, Ordering::AcqRel);
    }

    pub fn finish_halting_work(&self) {
        self.halting.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn bitfield(&self) -> Bitfield {
        self.bitfield.read().clone()
    }

    /// Record a verified piece.
    pub fn set_piece_complete(&self, index: usize) {
        if let Ok(piece) = self.files.piece(index) {
            piece.mark_complete();
            self.bitfield.write().safe_set(index);
        }
    }

    /// A peer sent a block. Returns false if the block was not requested
    /// from that peer, in which case it is dropped.
    pub fn receive_block(self: &Arc<Self>, peer: &Peer, block: Block) -> bool {
        let info = block.info();

        if !peer.remove_request(&info) {
            debug!("{:?} unrequested block {info:?} from {}", self.info_hash, peer.id);
            return false;
        }

        self.downloaded.fetch_add(block.block.len() as u64, Ordering::Relaxed);
        self.add_halting_work();
        self.disk.enqueue(DiskJob::StoreBlock { transfer: self.clone(), block });

        true
    }

    /// Hash what is already on disk and mark every piece that matches as
    /// complete. Blocking, returns how many pieces are complete.
    pub fn check_progress(&self) -> usize {
        for piece in self.files.pieces() {
            if piece.is_complete() {
                continue;
            }
            // a read error means the files were not created yet
            if let Ok(true) = self.files.hash_matches(piece.index()) {
                self.set_piece_complete(piece.index());
            }
        }

        let completed = self.files.completed_pieces();
        if completed > 0 {
            info!(
                "{} has {completed} of {} pieces on disk",
                self.name,
                self.files.piece_count()
            );
        }
        completed
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed_pieces: self.files.completed_pieces(),
            pieces: self.files.piece_count(),
            downloaded: self.downloaded(),
            total_size: self.files.total_size(),
        }
    }

    /// Log a storage fault of this transfer.
    pub fn log_storage_fault(&self, block: &BlockInfo, e: &Error) {
        warn!("{} could not store block {block:?}: {e}", self.name);
    }
}

/// Every transfer of the client, by info hash.
#[derive(Debug, Default)]
pub struct Transfers {
    inner: RwLock<HashMap<InfoHash, Arc<Transfer>>>,
}

impl Transfers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<Transfer>> {
        self.inner.read().get(info_hash).cloned()
    }

    /// Returns the transfer that had the same info hash, if any.
    pub fn insert(&self, transfer: Arc<Transfer>) -> Option<Arc<Transfer>> {
        self.inner.write().insert(transfer.info_hash(), transfer)
    }

    pub fn remove(&self, info_hash: &InfoHash) -> Option<Arc<Transfer>> {
        self.inner.write().remove(info_hash)
    }

    pub fn all(&self) -> Vec<Arc<Transfer>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
