//! Authenticates new connections before they reach the rest of the engine.
//!
//! Every connection, inbound or outbound, waits here until the remote's
//! handshake frame arrived and was validated against a known transfer, or
//! until it is older than the handshake timeout. The poller reads the
//! connections that the [`Selector`] reports ready, on a fixed interval.
//!
//! ```text
//! Connecting (outbound) ─┐
//!                        ├─► AwaitingFrame ─┬─► Completed  (handed to PeerIo)
//! Accepted (inbound) ────┘                  ├─► Violated   (closed)
//!                                           └─► TimedOut   (closed)
//! ```
use std::{io, sync::Arc, time::Duration};

use bytes::BytesMut;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::{
    select,
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Handshake, HANDSHAKE_LEN};
use crate::{
    bitfield::Reserved,
    error::Error,
    message::Message,
    peer::{Direction, Peer, PeerId},
    transfer::{InfoHash, Transfer, Transfers},
    transport::{Selector, Token, Transport},
};

/// A connection that passed the handshake: the peer, the receiver of its
/// outbound queue, and the transport.
pub type PeerConnection<T> = (Arc<Peer>, UnboundedReceiver<Message>, T);

/// Where connections go after the handshake, the layer that exchanges
/// messages with the peer.
pub trait PeerIo<T>: Send + Sync {
    fn register_peer(&self, peer: Arc<Peer>, messages: UnboundedReceiver<Message>, io: T);
}

impl<T: Send> PeerIo<T> for UnboundedSender<PeerConnection<T>> {
    fn register_peer(&self, peer: Arc<Peer>, messages: UnboundedReceiver<Message>, io: T) {
        if self.send((peer, messages, io)).is_err() {
            debug!("peer I/O is gone, dropping the connection");
        }
    }
}

/// Outcome of a [`HandshakeConnector::poll`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub completed: Vec<Token>,
    /// Protocol violations and transport faults.
    pub violated: Vec<Token>,
    pub timed_out: Vec<Token>,
}

impl PollSummary {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.violated.is_empty() && self.timed_out.is_empty()
    }
}

/// A connection waiting for the remote's handshake.
#[derive(Debug)]
pub struct PendingHandshake<T> {
    io: T,
    buf: BytesMut,
    /// Only known when we initiated the connection.
    expected: Option<InfoHash>,
    direction: Direction,
    started: Instant,
}

impl<T: Transport> PendingHandshake<T> {
    fn new(io: T, expected: Option<InfoHash>, direction: Direction) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(HANDSHAKE_LEN),
            expected,
            direction,
            started: Instant::now(),
        }
    }

    /// Read the bytes still missing from the frame, without ever reading
    /// past it. Returns true once the frame is complete.
    fn fill(&mut self) -> Result<bool, Error> {
        let mut tmp = [0u8; HANDSHAKE_LEN];

        while self.buf.len() < HANDSHAKE_LEN {
            let missing = HANDSHAKE_LEN - self.buf.len();
            match self.io.try_read(&mut tmp[..missing]) {
                Ok(0) => return Err(Error::PeerClosedSocket),
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(true)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn expected(&self) -> Option<InfoHash> {
        self.expected
    }

    pub fn received(&self) -> usize {
        self.buf.len()
    }
}

struct Inner<T, S> {
    selector: S,
    pending: HashMap<Token, PendingHandshake<T>>,
    next_token: usize,
}

impl<T: Transport, S: Selector<T>> Inner<T, S> {
    fn register(&mut self, io: T, expected: Option<InfoHash>, direction: Direction) -> Option<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;

        if let Err(e) = self.selector.register(token, &io) {
            debug!("could not register {token}: {e}");
            io.close();
            return None;
        }

        self.pending.insert(token, PendingHandshake::new(io, expected, direction));
        Some(token)
    }

    fn remove(&mut self, token: Token) -> Option<PendingHandshake<T>> {
        let pending = self.pending.remove(&token)?;
        self.selector.deregister(token);
        Some(pending)
    }
}

pub struct HandshakeConnector<T, S> {
    inner: Mutex<Inner<T, S>>,
    local_peer_id: PeerId,
    reserved: Reserved,
    transfers: Arc<Transfers>,
    peer_io: Arc<dyn PeerIo<T>>,
    timeout: Duration,
    request_limit: usize,
    cancel: CancellationToken,
}

impl<T: Transport, S: Selector<T>> HandshakeConnector<T, S> {
    /// The default handshake timeout.
    pub const TIMEOUT: Duration = Duration::from_secs(5);

    /// The default polling interval.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub fn new(
        selector: S,
        local_peer_id: PeerId,
        transfers: Arc<Transfers>,
        peer_io: Arc<dyn PeerIo<T>>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner { selector, pending: HashMap::new(), next_token: 0 }),
            local_peer_id,
            reserved: Reserved::supported(),
            transfers,
            peer_io,
            timeout: Self::TIMEOUT,
            request_limit: crate::peer::DEFAULT_REQUEST_LIMIT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Request limit given to the peers built here.
    pub fn with_request_limit(mut self, request_limit: usize) -> Self {
        self.request_limit = request_limit;
        self
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Connections waiting for a handshake.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn local_handshake(&self, info_hash: InfoHash) -> Result<[u8; HANDSHAKE_LEN], Error> {
        Handshake::new(info_hash, self.local_peer_id, self.reserved).serialize()
    }

    /// We connected to a peer to download `info_hash`: send our handshake
    /// and wait for theirs. A failed write closes the connection, there is
    /// no retry.
    pub fn on_outbound_connection_established(&self, mut io: T, info_hash: InfoHash) -> Option<Token> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let mut inner = self.inner.lock();

        let sent = self
            .local_handshake(info_hash)
            .and_then(|frame| io.write_all(&frame).map_err(Error::from));

        if let Err(e) = sent {
            debug!("{info_hash:?} could not send the handshake: {e}");
            io.close();
            return None;
        }

        inner.register(io, Some(info_hash), Direction::Outbound)
    }

    /// A peer connected to us, the transfer it wants is learned from its
    /// handshake.
    pub fn on_inbound_connection_accepted(&self, io: T) -> Option<Token> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.inner.lock().register(io, None, Direction::Inbound)
    }

    /// Read the ready connections, complete those with a full frame, and
    /// close the ones older than the timeout.
    pub fn poll(&self) -> PollSummary {
        let mut summary = PollSummary::default();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for token in inner.selector.select_now() {
            let Some(pending) = inner.pending.get_mut(&token) else { continue };

            // a partial frame waits for the selector to report more bytes
            let filled = match pending.fill() {
                Ok(false) => inner
                    .selector
                    .reregister(token, &pending.io)
                    .map(|()| false)
                    .map_err(Error::from),
                r => r,
            };

            match filled {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    debug!("{token} failed while reading the handshake: {e}");
                    if let Some(pending) = inner.remove(token) {
                        pending.io.close();
                    }
                    summary.violated.push(token);
                    continue;
                }
            }

            let Some(pending) = inner.remove(token) else { continue };

            match self.complete(pending) {
                Ok(peer) => {
                    debug!("{token} handshaked with {} ({:?})", peer.id, peer.direction);
                    summary.completed.push(token);
                }
                Err(e) => {
                    debug!("{token} rejected: {e}");
                    summary.violated.push(token);
                }
            }
        }

        let now = Instant::now();
        let expired: Vec<Token> = inner
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.started) > self.timeout)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(pending) = inner.remove(token) {
                debug!("{token} {}", Error::HandshakeTimeout);
                pending.io.close();
                summary.timed_out.push(token);
            }
        }

        summary
    }

    /// Validate a full frame and hand the connection over. The transport
    /// is closed on error.
    fn complete(&self, mut pending: PendingHandshake<T>) -> Result<Arc<Peer>, Error> {
        match self.bind(&mut pending) {
            Ok((peer, transfer, messages)) => {
                transfer.add_peer(peer.clone());
                self.peer_io.register_peer(peer.clone(), messages, pending.io);
                Ok(peer)
            }
            Err(e) => {
                pending.io.close();
                Err(e)
            }
        }
    }

    /// Find the transfer of the remote's handshake and build its peer.
    fn bind(
        &self,
        pending: &mut PendingHandshake<T>,
    ) -> Result<(Arc<Peer>, Arc<Transfer>, UnboundedReceiver<Message>), Error> {
        let theirs = Handshake::deserialize(&pending.buf)?;
        theirs.validate()?;

        let transfer = match pending.expected {
            Some(expected) => {
                if theirs.info_hash != expected {
                    return Err(Error::HandshakeInfoHashMismatch);
                }
                self.transfers.get(&expected).ok_or(Error::TransferNotFound(expected))?
            }
            None => {
                let transfer = self
                    .transfers
                    .get(&theirs.info_hash)
                    .ok_or(Error::TransferNotFound(theirs.info_hash))?;

                let ours = self.local_handshake(theirs.info_hash)?;
                pending.io.write_all(&ours)?;
                transfer
            }
        };

        let (peer, messages) = Peer::new(
            theirs.peer_id,
            theirs.reserved(),
            pending.direction,
            transfer.info_hash(),
            self.request_limit,
        );

        Ok((Arc::new(peer), transfer, messages))
    }

    /// Poll on `every` until [`HandshakeConnector::shutdown`].
    pub fn spawn_poller(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let connector = self.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let summary = connector.poll();
                        if !summary.is_empty() {
                            debug!(?summary, "handshake poll");
                        }
                    }
                }
            }
        })
    }

    /// Stop the poller and forget every pending connection, without
    /// writing to or closing them.
    pub fn shutdown(&self) {
        self.cancel.cancel();

        let mut inner = self.inner.lock();
        let tokens: Vec<Token> = inner.pending.keys().copied().collect();
        for token in tokens {
            inner.remove(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use tokio::sync::mpsc;

    use super::*;
    use crate::transfer::tests::transfer;

    /// Shared state of a fake transport, kept by the test after the
    /// transport was moved into the connector.
    #[derive(Debug, Default)]
    struct Wire {
        incoming: VecDeque<u8>,
        /// Largest read served at once.
        chunk: Option<usize>,
        eof: bool,
        fail_write: bool,
        written: Vec<u8>,
        closed: usize,
        reads: Vec<usize>,
    }

    #[derive(Debug, Clone, Default)]
    struct FakeTransport(Arc<Mutex<Wire>>);

    impl FakeTransport {
        fn push(&self, bytes: &[u8]) {
            self.0.lock().incoming.extend(bytes);
        }
        fn written(&self) -> Vec<u8> {
            self.0.lock().written.clone()
        }
        fn closed(&self) -> usize {
            self.0.lock().closed
        }
    }

    impl Transport for FakeTransport {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut wire = self.0.lock();
            wire.reads.push(buf.len());
            if wire.incoming.is_empty() {
                if wire.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let max = wire.chunk.unwrap_or(usize::MAX);
            let n = buf.len().min(wire.incoming.len()).min(max);
            for b in buf.iter_mut().take(n) {
                *b = wire.incoming.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            let mut wire = self.0.lock();
            if wire.fail_write {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            wire.written.extend_from_slice(buf);
            Ok(())
        }

        fn close(self) {
            self.0.lock().closed += 1;
        }
    }

    /// Like the level selector, but the test sees what is registered.
    #[derive(Debug, Clone, Default)]
    struct FakeSelector(Arc<Mutex<Vec<Token>>>);

    impl Selector<FakeTransport> for FakeSelector {
        fn register(&mut self, token: Token, _io: &FakeTransport) -> io::Result<()> {
            self.0.lock().push(token);
            Ok(())
        }

        fn deregister(&mut self, token: Token) {
            self.0.lock().retain(|t| *t != token);
        }

        fn select_now(&mut self) -> Vec<Token> {
            self.0.lock().clone()
        }
    }

    type Connector = HandshakeConnector<FakeTransport, FakeSelector>;
    type Handoffs = mpsc::UnboundedReceiver<PeerConnection<FakeTransport>>;

    const HASH: InfoHash = InfoHash([9; 20]);

    fn connector() -> (Arc<Connector>, FakeSelector, Arc<Transfer>, Handoffs) {
        let transfers = Arc::new(Transfers::new());
        let transfer = transfer(2);
        transfers.insert(transfer.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let selector = FakeSelector::default();
        let connector = HandshakeConnector::new(
            selector.clone(),
            PeerId([1; 20]),
            transfers,
            Arc::new(tx),
        )
        .with_request_limit(3);

        (Arc::new(connector), selector, transfer, rx)
    }

    fn remote_handshake(info_hash: InfoHash) -> [u8; HANDSHAKE_LEN] {
        Handshake::new(info_hash, [2; 20], Reserved::supported()).serialize().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_any_byte() {
        let (connector, selector, _, _rx) = connector();
        let io = FakeTransport::default();

        let token = connector.on_inbound_connection_accepted(io.clone()).unwrap();

        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert!(connector.poll().is_empty());
        assert_eq!(io.closed(), 0);

        // exactly at the timeout is not older than it
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(connector.poll().is_empty());
        assert_eq!(io.closed(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        let summary = connector.poll();

        assert_eq!(summary.timed_out, vec![token]);
        assert_eq!(io.closed(), 1);
        assert!(io.written().is_empty());
        assert_eq!(connector.pending(), 0);
        assert!(selector.0.lock().is_empty());
    }

    #[tokio::test]
    async fn bad_length_byte_is_a_violation() {
        let (connector, _, transfer, mut rx) = connector();
        let io = FakeTransport::default();

        let mut frame = remote_handshake(HASH);
        frame[0] = 18;
        io.push(&frame);

        let token = connector.on_inbound_connection_accepted(io.clone()).unwrap();
        let summary = connector.poll();

        assert_eq!(summary.violated, vec![token]);
        assert_eq!(io.closed(), 1);
        // no reply
        assert!(io.written().is_empty());
        assert!(transfer.peers().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_unknown_transfer() {
        let (connector, _, _, mut rx) = connector();
        let io = FakeTransport::default();
        io.push(&remote_handshake(InfoHash([7; 20])));

        let token = connector.on_inbound_connection_accepted(io.clone()).unwrap();

        assert_eq!(connector.poll().violated, vec![token]);
        assert_eq!(io.closed(), 1);
        assert!(io.written().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_handshake_in_pieces() {
        let (connector, selector, transfer, mut rx) = connector();
        let io = FakeTransport::default();
        io.0.lock().chunk = Some(30);
        let frame = remote_handshake(HASH);

        let token = connector.on_inbound_connection_accepted(io.clone()).unwrap();

        io.push(&frame[..40]);
        assert!(connector.poll().is_empty());
        assert_eq!(io.0.lock().reads, vec![68, 38, 28]);

        // bytes after the frame belong to the next protocol layer
        io.push(&frame[40..]);
        io.push(&[0, 0, 0, 1]);
        let summary = connector.poll();

        assert_eq!(summary.completed, vec![token]);
        assert_eq!(io.0.lock().incoming.len(), 4);

        // we replied with our handshake
        let ours = Handshake::deserialize(&io.written()).unwrap();
        assert_eq!(ours.info_hash, HASH);
        assert_eq!(ours.peer_id, PeerId([1; 20]));

        let (peer, _messages, handed) = rx.try_recv().unwrap();
        assert_eq!(peer.id, PeerId([2; 20]));
        assert_eq!(peer.direction, Direction::Inbound);
        assert_eq!(peer.info_hash, HASH);
        assert_eq!(peer.request_limit(), 3);
        assert!(peer.reserved.supports_extended());
        assert_eq!(handed.closed(), 0);

        assert_eq!(transfer.peers().len(), 1);
        assert_eq!(connector.pending(), 0);
        assert!(selector.0.lock().is_empty());
    }

    #[tokio::test]
    async fn inbound_failed_reply_is_a_fault() {
        let (connector, _, transfer, _rx) = connector();
        let io = FakeTransport::default();
        io.0.lock().fail_write = true;
        io.push(&remote_handshake(HASH));

        let token = connector.on_inbound_connection_accepted(io.clone()).unwrap();

        assert_eq!(connector.poll().violated, vec![token]);
        assert_eq!(io.closed(), 1);
        assert!(transfer.peers().is_empty());
    }

    #[tokio::test]
    async fn outbound_handshake() {
        let (connector, _, transfer, mut rx) = connector();
        let io = FakeTransport::default();

        let token = connector.on_outbound_connection_established(io.clone(), HASH).unwrap();
        assert_eq!(io.written().len(), HANDSHAKE_LEN);

        io.push(&remote_handshake(HASH));
        assert_eq!(connector.poll().completed, vec![token]);

        // we don't send a second handshake
        assert_eq!(io.written().len(), HANDSHAKE_LEN);
        let (peer, _, _) = rx.try_recv().unwrap();
        assert_eq!(peer.direction, Direction::Outbound);
        assert_eq!(transfer.peers()[0].id, peer.id);
    }

    #[tokio::test]
    async fn outbound_info_hash_mismatch() {
        let (connector, _, transfer, _rx) = connector();
        let io = FakeTransport::default();

        let token = connector.on_outbound_connection_established(io.clone(), HASH).unwrap();
        io.push(&remote_handshake(InfoHash([7; 20])));

        assert_eq!(connector.poll().violated, vec![token]);
        assert_eq!(io.closed(), 1);
        assert!(transfer.peers().is_empty());
    }

    #[tokio::test]
    async fn outbound_write_failure_aborts() {
        let (connector, selector, _, _rx) = connector();
        let io = FakeTransport::default();
        io.0.lock().fail_write = true;

        assert!(connector.on_outbound_connection_established(io.clone(), HASH).is_none());
        assert_eq!(io.closed(), 1);
        assert_eq!(connector.pending(), 0);
        assert!(selector.0.lock().is_empty());
    }

    #[tokio::test]
    async fn remote_closed_before_the_frame() {
        let (connector, _, _, _rx) = connector();
        let io = FakeTransport::default();
        io.push(&remote_handshake(HASH)[..10]);
        io.0.lock().eof = true;

        let token = connector.on_inbound_connection_accepted(io.clone()).unwrap();

        assert_eq!(connector.poll().violated, vec![token]);
        assert_eq!(io.closed(), 1);
    }

    #[tokio::test]
    async fn shutdown_drops_pending_without_io() {
        let (connector, selector, _, _rx) = connector();
        let a = FakeTransport::default();
        let b = FakeTransport::default();

        connector.on_inbound_connection_accepted(a.clone()).unwrap();
        connector.on_outbound_connection_established(b.clone(), HASH).unwrap();
        let written = b.written().len();

        let poller = connector.spawn_poller(Duration::from_millis(50));
        connector.shutdown();
        poller.await.unwrap();

        assert_eq!(connector.pending(), 0);
        assert!(selector.0.lock().is_empty());
        assert_eq!(a.closed() + b.closed(), 0);
        assert!(a.written().is_empty());
        assert_eq!(b.written().len(), written);

        // nothing is accepted anymore
        assert!(connector.on_inbound_connection_accepted(a.clone()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_completes_handshakes() {
        let (connector, _, transfer, mut rx) = connector();
        let io = FakeTransport::default();
        io.push(&remote_handshake(HASH));
        connector.on_inbound_connection_accepted(io).unwrap();

        let poller = connector.spawn_poller(Connector::POLL_INTERVAL);
        let (peer, _, _) = rx.recv().await.unwrap();

        assert_eq!(transfer.peers()[0].id, peer.id);
        connector.shutdown();
        poller.await.unwrap();
    }
}
