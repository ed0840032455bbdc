//! Storage work of every transfer, executed one job at a time off the
//! network path.
//!
//! Jobs are ordered by [`Priority`] and, within a priority, by arrival. A
//! single consumer ([`DiskQueue::run`]) executes them on the blocking pool,
//! so two jobs never touch the same piece at once and the `CheckHash` of a
//! piece always runs after the `StoreBlock` that completed it.
use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    message::Block,
    transfer::Transfer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    Critical,
}

pub enum DiskJob {
    /// Write a block received from a peer.
    StoreBlock { transfer: Arc<Transfer>, block: Block },
    /// Verify a piece whose blocks are all stored.
    CheckHash { transfer: Arc<Transfer>, piece: usize },
}

impl std::fmt::Debug for DiskJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreBlock { transfer, block } => f
                .debug_struct("StoreBlock")
                .field("transfer", &transfer.info_hash())
                .field("block", &block.info())
                .finish(),
            Self::CheckHash { transfer, piece } => f
                .debug_struct("CheckHash")
                .field("transfer", &transfer.info_hash())
                .field("piece", piece)
                .finish(),
        }
    }
}

impl DiskJob {
    pub fn priority(&self) -> Priority {
        match self {
            Self::StoreBlock { .. } => Priority::Critical,
            Self::CheckHash { .. } => Priority::Normal,
        }
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        match self {
            Self::StoreBlock { transfer, .. } | Self::CheckHash { transfer, .. } => {
                transfer
            }
        }
    }

    /// Run the job, follow-up jobs go to `queue`. Blocking.
    ///
    /// Every job releases one unit of the transfer's halting work when it
    /// ends, whatever the outcome.
    pub fn execute(self, queue: &DiskQueue) {
        match self {
            Self::StoreBlock { transfer, block } => {
                Self::store_block(&transfer, block, queue);
                transfer.finish_halting_work();
            }
            Self::CheckHash { transfer, piece } => {
                Self::check_hash(&transfer, piece);
                transfer.finish_halting_work();
            }
        }
    }

    fn store_block(transfer: &Arc<Transfer>, block: Block, queue: &DiskQueue) {
        let files = transfer.files();
        let info = block.info();
        let block_len = files.block_len() as u32;
        let b = info.block_index(block_len);

        let stored = if info.begin % block_len != 0 {
            Err(Error::BlockOutOfRange {
                index: block.index,
                begin: info.begin as usize,
            })
        } else {
            files
                .write_block(block.index, b, &block.block)
                .and_then(|_| files.piece(block.index)?.mark_stored(b))
        };

        match stored {
            // the last block of the piece
            Ok(true) => {
                transfer.add_halting_work();
                queue.enqueue(DiskJob::CheckHash {
                    transfer: transfer.clone(),
                    piece: block.index,
                });
            }
            Ok(false) => {}
            Err(e) => {
                transfer.log_storage_fault(&info, &e);
                if let Ok(piece) = files.piece(block.index) {
                    piece.reset_block(b);
                }
            }
        }
    }

    fn check_hash(transfer: &Transfer, index: usize) {
        let files = transfer.files();
        let Ok(piece) = files.piece(index) else { return };

        // a piece that can't be read back is as good as a corrupted one
        if let Ok(true) = files.hash_matches(index) {
            transfer.set_piece_complete(index);
            debug!("{} piece {index} verified", transfer.name());
            return;
        }

        piece.reset();
        if let Err(e) = files.discard_piece(index) {
            debug!("{} could not discard piece {index}: {e}", transfer.name());
        }
        info!("{} piece {index}: {}", transfer.name(), Error::PieceInvalid);
    }
}

struct QueuedJob {
    priority: Priority,
    sequence: u64,
    job: DiskJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // higher priority first, then lower sequence first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// The queue of [`DiskJob`]s, shared by every transfer.
#[derive(Default)]
pub struct DiskQueue {
    jobs: Mutex<BinaryHeap<QueuedJob>>,
    sequence: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl std::fmt::Debug for DiskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskQueue")
            .field("len", &self.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl DiskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, job: DiskJob) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.jobs.lock().push(QueuedJob { priority: job.priority(), sequence, job });
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<DiskJob> {
        self.jobs.lock().pop().map(|q| q.job)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Wait for the next job. After [`DiskQueue::shutdown`] the jobs left
    /// are still returned, then `None`.
    pub async fn next_job(&self) -> Option<DiskJob> {
        loop {
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// The consumer loop, executes jobs until the queue is shut down.
    #[tracing::instrument(skip_all, name = "disk::run")]
    pub async fn run(self: Arc<Self>) {
        while let Some(job) = self.next_job().await {
            let queue = self.clone();
            let name = job.transfer().name().to_owned();

            if let Err(e) =
                tokio::task::spawn_blocking(move || job.execute(&queue)).await
            {
                warn!("disk job of {name} did not finish: {e}");
            }
        }
        debug!("disk queue closed");
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}
