//! The phases a transfer goes through, and the scheduler of the download
//! phase.
use std::{future::Future, io, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    message::{BlockInfo, Message},
    peer::{Peer, PeerDirection},
    selector::FullPieceSelect,
    tracker::Event,
    transfer::Transfer,
};

/// How many times in a row a piece returned by the selector may have no
/// block left for the same peer, before the selector is considered broken.
pub const MAX_SELECTION_RETRIES: usize = 32;

/// What happened in a pass of [`Phase::process`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Requests put on the peers' queues.
    pub requested: usize,
    /// Requests that expired and were given back.
    pub timed_out: Vec<BlockInfo>,
}

/// A stage in the life of a transfer, driven by the scheduling tick.
pub trait Phase {
    /// Called once, before the first `process`.
    fn on_enter(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Called on every tick while the phase is active. Never waits.
    fn process(&mut self) -> ProcessReport;

    /// Called once, after `is_done` returned true.
    fn on_exit(&mut self) -> impl Future<Output = ()> + Send;

    fn is_done(&self) -> bool;
}

/// Requests the blocks of a transfer from its peers until every piece is
/// verified.
#[derive(Debug)]
pub struct DownloadPhase {
    transfer: Arc<Transfer>,
    request_timeout: Duration,
}

impl DownloadPhase {
    pub fn new(transfer: Arc<Transfer>, request_timeout: Duration) -> Self {
        Self { transfer, request_timeout }
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        &self.transfer
    }

    /// Peers that are not choking us and have at least one piece that we
    /// still need.
    pub fn select_candidate_peers(&self, peers: &[Arc<Peer>]) -> Vec<Arc<Peer>> {
        let files = self.transfer.files();

        peers
            .iter()
            .filter(|peer| !peer.is_choked(PeerDirection::Download))
            .filter(|peer| files.needed_pieces().any(|p| peer.has_piece(p.index())))
            .cloned()
            .collect()
    }

    /// Give back the requests that were not answered in time.
    fn release_timed_out(&self, peers: &[Arc<Peer>], now: Instant) -> Vec<BlockInfo> {
        let mut timed_out = Vec::new();

        for peer in peers {
            for block in peer.take_timed_out(now) {
                self.transfer.release_block(&block);
                timed_out.push(block);
            }
        }

        if !timed_out.is_empty() {
            debug!("{} requests timed out", timed_out.len());
        }
        timed_out
    }

    /// Fill the request queue of `peer`, returns how many requests were
    /// made.
    fn request_blocks(&self, peer: &Peer, now: Instant) -> usize {
        let files = self.transfer.files();
        let selector = self.transfer.selector();
        let mut requested = 0;
        let mut race_losses = 0;

        while peer.can_request() {
            let Some(index) = selector.select_piece(files, peer) else { break };

            let Ok(piece) = files.piece(index) else {
                warn!("selector returned piece {index} which does not exist");
                break;
            };

            // another peer may have taken the last block of the piece since
            // it was selected, ask again.
            let Some(block) = piece.take_request_block() else {
                race_losses += 1;
                if race_losses > MAX_SELECTION_RETRIES {
                    warn!(
                        "selector keeps returning pieces without blocks for {}, \
                         skipping it",
                        peer.id
                    );
                    break;
                }
                continue;
            };
            race_losses = 0;

            peer.add_request(block, now + self.request_timeout);

            if !peer.enqueue_message(Message::Request(block)) {
                debug!("peer {} is gone, giving back {block:?}", peer.id);
                peer.remove_request(&block);
                self.transfer.release_block(&block);
                break;
            }
            requested += 1;
        }

        requested
    }
}

impl Phase for DownloadPhase {
    #[tracing::instrument(skip(self), fields(name = %self.transfer.name()))]
    async fn on_enter(&mut self) -> Result<(), Error> {
        let transfer = self.transfer.clone();
        let completed = tokio::task::spawn_blocking(move || {
            transfer.files().create_download_dir()?;
            Ok::<_, Error>(transfer.check_progress())
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        self.transfer.set_selector(Arc::new(FullPieceSelect));

        info!(
            "downloading {}, {completed} of {} pieces complete",
            self.transfer.name(),
            self.transfer.files().piece_count()
        );
        Ok(())
    }

    fn process(&mut self) -> ProcessReport {
        let now = Instant::now();
        let peers = self.transfer.peers();

        let timed_out = self.release_timed_out(&peers, now);

        let requested: usize = self
            .select_candidate_peers(&peers)
            .iter()
            .map(|peer| self.request_blocks(peer, now))
            .sum();

        ProcessReport { requested, timed_out }
    }

    #[tracing::instrument(skip(self), fields(name = %self.transfer.name()))]
    async fn on_exit(&mut self) {
        let info_hash = self.transfer.info_hash();

        for tracker in self.transfer.trackers() {
            if let Err(e) = tracker.announce(&info_hash, Event::Completed) {
                warn!("could not announce completion to {tracker:?}: {e}");
            }
        }
        info!("downloaded {}", self.transfer.name());
    }

    fn is_done(&self) -> bool {
        self.transfer.files().is_done()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;
    use rand::{distributions::Alphanumeric, Rng};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        file_set::{BlockStatus, FileSet, MemoryStorage},
        peer::Peer,
        selector::PieceSelector,
        tracker::Announcer,
        transfer::{
            tests::{peer, transfer},
            InfoHash,
        },
    };

    const TIMEOUT: Duration = Duration::from_secs(30);

    /// Returns the scripted answers in order, then `None`.
    #[derive(Debug, Default)]
    struct ScriptedSelect {
        answers: Mutex<VecDeque<usize>>,
        calls: AtomicUsize,
    }

    impl ScriptedSelect {
        fn new(answers: impl IntoIterator<Item = usize>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into_iter().collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PieceSelector for ScriptedSelect {
        fn select_piece(&self, _files: &FileSet, _peer: &Peer) -> Option<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers.lock().pop_front()
        }
    }

    /// Always returns the same piece.
    #[derive(Debug)]
    struct StubbornSelect(usize);

    impl PieceSelector for StubbornSelect {
        fn select_piece(&self, _files: &FileSet, _peer: &Peer) -> Option<usize> {
            Some(self.0)
        }
    }

    fn unchoked(limit: usize, pieces: &[usize]) -> (Arc<Peer>, UnboundedReceiver<Message>) {
        let (peer, rx) = peer(limit);
        peer.set_choked(PeerDirection::Download, false);
        for i in pieces {
            peer.set_have_piece(*i);
        }
        (peer, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn candidate_peers() {
        let transfer = transfer(2);
        transfer.files().piece(0).unwrap().mark_complete();
        let phase = DownloadPhase::new(transfer, TIMEOUT);

        // unchoked, has a needed piece
        let (a, _ra) = unchoked(5, &[1]);
        // choked, has a needed piece
        let (b, _rb) = peer(5);
        b.set_have_piece(1);
        // unchoked, only has a complete piece
        let (c, _rc) = unchoked(5, &[0]);
        // unchoked, has nothing
        let (d, _rd) = unchoked(5, &[]);
        // unchoked, has everything
        let (e, _re) = unchoked(5, &[0, 1]);

        let peers = vec![a.clone(), b, c, d, e.clone()];
        let candidates = phase.select_candidate_peers(&peers);

        let ids: Vec<_> = candidates.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.id, e.id]);

        // independent of the order
        let reversed: Vec<_> = peers.into_iter().rev().collect();
        let ids: Vec<_> = phase
            .select_candidate_peers(&reversed)
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![e.id, a.id]);
    }

    #[test]
    fn piece_race_queries_the_selector_again() {
        let transfer = transfer(1);
        let piece = transfer.files().piece(0).unwrap();
        // another peer got every block
        piece.take_request_block();
        piece.take_request_block();

        let selector = ScriptedSelect::new([0]);
        transfer.set_selector(selector.clone());
        let (peer, mut rx) = unchoked(5, &[0]);
        transfer.add_peer(peer.clone());

        let mut phase = DownloadPhase::new(transfer, TIMEOUT);
        let report = phase.process();

        assert_eq!(selector.calls(), 2);
        assert_eq!(report.requested, 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(peer.outstanding(), 0);
    }

    #[test]
    fn broken_selector_is_cut_off() {
        let transfer = transfer(1);
        let piece = transfer.files().piece(0).unwrap();
        piece.take_request_block();
        piece.take_request_block();

        transfer.set_selector(Arc::new(StubbornSelect(0)));
        let (peer, mut rx) = unchoked(5, &[0]);
        transfer.add_peer(peer);

        let mut phase = DownloadPhase::new(transfer, TIMEOUT);
        assert_eq!(phase.process().requested, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn request_limit_of_one() {
        let transfer = transfer(1);
        transfer.set_selector(Arc::new(StubbornSelect(0)));
        let (peer, mut rx) = unchoked(1, &[0]);
        transfer.add_peer(peer.clone());

        let mut phase = DownloadPhase::new(transfer, TIMEOUT);

        assert_eq!(phase.process().requested, 1);
        assert_eq!(
            drain(&mut rx),
            vec![Message::Request(BlockInfo::new(0, 0, 4))]
        );

        // the first request is still in flight
        assert_eq!(phase.process().requested, 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(peer.outstanding(), 1);
    }

    #[test]
    fn request_limit_of_two() {
        let transfer = transfer(1);
        transfer.set_selector(Arc::new(StubbornSelect(0)));
        let (peer, mut rx) = unchoked(2, &[0]);
        transfer.add_peer(peer.clone());

        let mut phase = DownloadPhase::new(transfer.clone(), TIMEOUT);

        assert_eq!(phase.process().requested, 2);
        assert_eq!(
            drain(&mut rx),
            vec![
                Message::Request(BlockInfo::new(0, 0, 4)),
                Message::Request(BlockInfo::new(0, 4, 4)),
            ]
        );
        let piece = transfer.files().piece(0).unwrap();
        assert_eq!(piece.count_blocks_with_status(BlockStatus::Requested), 2);
    }

    #[test]
    fn empty_selector_is_idempotent() {
        let transfer = transfer(2);
        let selector = ScriptedSelect::new([]);
        transfer.set_selector(selector.clone());
        let (peer, mut rx) = unchoked(5, &[0, 1]);
        transfer.add_peer(peer.clone());

        let mut phase = DownloadPhase::new(transfer.clone(), TIMEOUT);

        for _ in 0..3 {
            assert_eq!(phase.process(), ProcessReport::default());
        }
        assert_eq!(selector.calls(), 3);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(peer.outstanding(), 0);
        for piece in transfer.files().pieces() {
            assert!(!piece.is_started());
        }
    }

    #[test]
    fn full_piece_select_spreads_blocks() {
        let transfer = transfer(2);
        let (a, mut ra) = unchoked(1, &[0, 1]);
        let (b, mut rb) = unchoked(3, &[0, 1]);
        transfer.add_peer(a);
        transfer.add_peer(b);

        let mut phase = DownloadPhase::new(transfer, TIMEOUT);
        assert_eq!(phase.process().requested, 4);

        assert_eq!(drain(&mut ra), vec![Message::Request(BlockInfo::new(0, 0, 4))]);
        assert_eq!(
            drain(&mut rb),
            vec![
                Message::Request(BlockInfo::new(0, 4, 4)),
                Message::Request(BlockInfo::new(1, 0, 4)),
                Message::Request(BlockInfo::new(1, 4, 4)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_requests_go_to_another_peer() {
        let transfer = transfer(1);
        let (a, mut ra) = unchoked(2, &[0]);
        transfer.add_peer(a.clone());

        let mut phase = DownloadPhase::new(transfer.clone(), TIMEOUT);
        assert_eq!(phase.process().requested, 2);
        drain(&mut ra);

        // a stops answering and gets choked, b shows up
        a.set_choked(PeerDirection::Download, true);
        let (b, mut rb) = unchoked(2, &[0]);
        transfer.add_peer(b);

        assert_eq!(phase.process().requested, 0);

        tokio::time::advance(TIMEOUT).await;
        let report = phase.process();

        assert_eq!(report.timed_out.len(), 2);
        assert_eq!(report.requested, 2);
        assert_eq!(a.outstanding(), 0);
        assert_eq!(drain(&mut rb).len(), 2);
    }

    fn tmp_dir() -> std::path::PathBuf {
        let name: String = rand::thread_rng()
            .sample_iter(Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        std::env::temp_dir().join(name)
    }

    fn transfer_at(dir: &std::path::Path, trackers: Vec<Arc<dyn Announcer>>) -> Arc<Transfer> {
        let files = FileSet::new(
            dir,
            8,
            4,
            8,
            vec![[0; 20]],
            Box::new(MemoryStorage::new(8)),
        );
        Arc::new(Transfer::new(
            InfoHash([3; 20]),
            "phase",
            files,
            trackers,
            Arc::new(crate::disk::DiskQueue::new()),
        ))
    }

    #[tokio::test]
    async fn enter_creates_the_download_dir() {
        let dir = tmp_dir().join("nested");
        let transfer = transfer_at(&dir, vec![]);
        transfer.set_selector(ScriptedSelect::new([]));

        let mut phase = DownloadPhase::new(transfer.clone(), TIMEOUT);
        phase.on_enter().await.unwrap();

        assert!(dir.is_dir());
        // the full piece selector is installed
        assert!(format!("{:?}", transfer.selector()).contains("FullPieceSelect"));

        std::fs::remove_dir_all(dir.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn enter_fails_when_the_dir_cannot_be_created() {
        let file = tmp_dir();
        std::fs::write(&file, b"not a dir").unwrap();
        let dir = file.join("sub");

        let mut phase = DownloadPhase::new(transfer_at(&dir, vec![]), TIMEOUT);
        let r = phase.on_enter().await;

        assert!(matches!(r, Err(Error::DownloadDirCreate(p)) if p == dir));
        std::fs::remove_file(file).unwrap();
    }

    #[tokio::test]
    async fn enter_picks_up_pieces_on_disk() {
        let transfer = transfer(2);
        let files = transfer.files();
        files.write_block(0, 0, &[1; 4]).unwrap();
        files.write_block(0, 1, &[1; 4]).unwrap();

        let mut phase = DownloadPhase::new(transfer.clone(), TIMEOUT);
        phase.on_enter().await.unwrap();

        assert!(files.piece(0).unwrap().is_complete());
        assert!(!phase.is_done());

        files.piece(1).unwrap().mark_complete();
        assert!(phase.is_done());
    }

    #[derive(Debug, Default)]
    struct Tracker {
        fail: bool,
        events: Mutex<Vec<(InfoHash, Event)>>,
    }

    impl Announcer for Tracker {
        fn announce(&self, info_hash: &InfoHash, event: Event) -> Result<(), Error> {
            self.events.lock().push((*info_hash, event));
            if self.fail {
                return Err(Error::TrackerAnnounce("udp://fail".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn exit_notifies_every_tracker() {
        let trackers = [
            Arc::new(Tracker::default()),
            Arc::new(Tracker { fail: true, ..Default::default() }),
            Arc::new(Tracker::default()),
        ];
        let dyn_trackers: Vec<Arc<dyn Announcer>> =
            trackers.iter().map(|t| t.clone() as Arc<dyn Announcer>).collect();

        let mut phase = DownloadPhase::new(transfer_at(&tmp_dir(), dyn_trackers), TIMEOUT);
        phase.on_exit().await;

        for tracker in &trackers {
            assert_eq!(
                *tracker.events.lock(),
                vec![(InfoHash([3; 20]), Event::Completed)]
            );
        }
    }
}
