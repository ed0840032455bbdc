//! A remote peer that passed the handshake and is bound to a transfer.
mod request_manager;
mod types;

// re-exports
pub use request_manager::*;
pub use types::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};

use crate::{
    bitfield::{Bitfield, BitfieldExt, Reserved},
    message::{BlockInfo, Message},
    transfer::InfoHash,
};

/// How many block requests may be in flight to a peer when nothing else was
/// configured.
pub const DEFAULT_REQUEST_LIMIT: usize = 5;

/// State of a peer shared between the scheduler, the disk jobs and the peer
/// I/O layer that owns the socket.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub reserved: Reserved,
    pub direction: Direction,
    pub info_hash: InfoHash,

    /// Pieces the peer advertised.
    pieces: RwLock<Bitfield>,

    /// Indexed by [`PeerDirection`], a new connection starts choked both
    /// ways.
    choked: [AtomicBool; 2],

    request_limit: AtomicUsize,
    requests: Mutex<RequestManager>,

    /// Outbound messages, the receiver belongs to the peer I/O layer.
    tx: UnboundedSender<Message>,
}

impl Peer {
    pub fn new(
        id: PeerId,
        reserved: Reserved,
        direction: Direction,
        info_hash: InfoHash,
        request_limit: usize,
    ) -> (Self, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Self {
            id,
            reserved,
            direction,
            info_hash,
            pieces: RwLock::new(Bitfield::new()),
            choked: [AtomicBool::new(true), AtomicBool::new(true)],
            request_limit: AtomicUsize::new(request_limit),
            requests: Mutex::new(RequestManager::new()),
            tx,
        };
        (peer, rx)
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.pieces.read().safe_get(index)
    }

    /// Called when the peer announces a piece it just got.
    pub fn set_have_piece(&self, index: usize) {
        self.pieces.write().safe_set(index);
    }

    /// Replace the whole bitfield, as after a `Bitfield` message.
    pub fn set_pieces(&self, pieces: Bitfield) {
        *self.pieces.write() = pieces;
    }

    pub fn pieces(&self) -> RwLockReadGuard<'_, Bitfield> {
        self.pieces.read()
    }

    fn choke_slot(&self, direction: PeerDirection) -> &AtomicBool {
        match direction {
            PeerDirection::Download => &self.choked[0],
            PeerDirection::Upload => &self.choked[1],
        }
    }

    pub fn is_choked(&self, direction: PeerDirection) -> bool {
        self.choke_slot(direction).load(Ordering::Acquire)
    }

    pub fn set_choked(&self, direction: PeerDirection, choked: bool) {
        self.choke_slot(direction).store(choked, Ordering::Release);
    }

    pub fn request_limit(&self) -> usize {
        self.request_limit.load(Ordering::Relaxed)
    }

    /// The peer may announce how many requests it is willing to queue.
    pub fn set_request_limit(&self, limit: usize) {
        self.request_limit.store(limit, Ordering::Relaxed);
    }

    /// Number of requests in flight.
    pub fn outstanding(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn can_request(&self) -> bool {
        self.outstanding() < self.request_limit()
    }

    pub fn add_request(&self, block: BlockInfo, deadline: Instant) {
        self.requests.lock().add_request(block, deadline);
    }

    /// Return true if the block was requested from this peer.
    pub fn remove_request(&self, block: &BlockInfo) -> bool {
        self.requests.lock().remove_request(block)
    }

    pub fn take_timed_out(&self, now: Instant) -> Vec<BlockInfo> {
        self.requests.lock().take_timed_out(now)
    }

    /// Forget every request, used when the peer goes away.
    pub fn drain_requests(&self) -> Vec<BlockInfo> {
        self.requests.lock().drain().into_values().flatten().collect()
    }

    /// Put a message on the outbound queue. Returns false when the peer I/O
    /// layer is gone.
    pub fn enqueue_message(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }
}
