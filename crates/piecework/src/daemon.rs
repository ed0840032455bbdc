//! A daemon that runs the engine over TCP: it accepts and dials peers,
//! handshakes them, and drives the download of every torrent until it is
//! complete.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::mpsc::{self, UnboundedReceiver},
    time::{interval, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    disk::DiskQueue,
    error::Error,
    handshake::connector::{HandshakeConnector, PeerConnection},
    metainfo::MetaInfo,
    peer::PeerId,
    phase::{DownloadPhase, Phase},
    transfer::{InfoHash, Transfer, Transfers},
    transport::ReactorSelector,
    utils::{percentage, to_human_readable},
};

type TcpConnector = HandshakeConnector<TcpStream, ReactorSelector>;

/// The daemon owns the [`Transfers`] and the [`DiskQueue`] shared by all of
/// them.
pub struct Daemon {
    pub config: Config,
    local_peer_id: PeerId,
    transfers: Arc<Transfers>,
    disk: Arc<DiskQueue>,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config: config.sanitized(),
            local_peer_id: PeerId::generate(),
            transfers: Arc::new(Transfers::new()),
            disk: Arc::new(DiskQueue::new()),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn transfers(&self) -> &Arc<Transfers> {
        &self.transfers
    }

    /// Add a torrent to be downloaded into the configured download dir. A
    /// torrent that was already added is returned as is.
    #[tracing::instrument(skip_all, fields(name = %meta.info.name))]
    pub fn add_torrent(&self, meta: &MetaInfo) -> Result<Arc<Transfer>, Error> {
        if let Some(transfer) = self.transfers.get(&meta.info.info_hash) {
            return Ok(transfer);
        }

        // announcing is done by the tracker client, which is not part of
        // the daemon yet.
        let transfer = Arc::new(Transfer::from_info(
            &meta.info,
            &self.config.download_dir,
            vec![],
            self.disk.clone(),
        )?);

        info!(
            "added {} ({}), {} trackers",
            transfer.name(),
            to_human_readable(meta.info.total_size()),
            meta.trackers().len()
        );
        self.transfers.insert(transfer.clone());

        Ok(transfer)
    }

    /// Run until every torrent is downloaded.
    #[tracing::instrument(skip_all, name = "daemon::run")]
    pub async fn run(self) -> Result<(), Error> {
        let disk = spawn(self.disk.clone().run());

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(
            TcpConnector::new(
                ReactorSelector::new(),
                self.local_peer_id,
                self.transfers.clone(),
                Arc::new(peer_tx),
            )
            .with_timeout(self.config.handshake_timeout())
            .with_request_limit(self.config.max_request_len),
        );
        let poller = connector.spawn_poller(self.config.handshake_poll());

        spawn(Self::handle_peers(peer_rx));

        let listener = TcpListener::bind(self.config.listen).await?;
        info!("accepting peers on {}", listener.local_addr()?);
        let acceptor = spawn(Self::accept_peers(listener, connector.clone()));

        for transfer in self.transfers.all() {
            for addr in &self.config.peers {
                spawn(Self::dial(*addr, transfer.info_hash(), connector.clone()));
            }
        }

        self.drive().await;

        acceptor.abort();
        connector.shutdown();
        if let Err(e) = poller.await {
            warn!("handshake poller did not finish: {e}");
        }
        self.disk.shutdown();
        if let Err(e) = disk.await {
            warn!("disk queue did not finish: {e}");
        }

        info!("all torrents are downloaded");
        Ok(())
    }

    /// Enter the download phase of every transfer and tick them until they
    /// are done.
    async fn drive(&self) {
        let mut phases = Vec::new();

        for transfer in self.transfers.all() {
            let mut phase =
                DownloadPhase::new(transfer, self.config.request_timeout());
            match phase.on_enter().await {
                Ok(()) => phases.push(phase),
                Err(e) => error!("{}: {e}", phase.transfer().name()),
            }
        }

        let mut tick_interval = interval(self.config.tick());
        let mut progress_interval = interval(Duration::from_secs(1));

        while !phases.is_empty() {
            select! {
                _ = tick_interval.tick() => {
                    let mut done = Vec::new();

                    for (i, phase) in phases.iter_mut().enumerate() {
                        // wait for the disk to verify the last pieces
                        if phase.is_done() && phase.transfer().halting_work() == 0 {
                            done.push(i);
                            continue;
                        }
                        let report = phase.process();
                        if !report.timed_out.is_empty() {
                            debug!(
                                "{} requests of {} timed out",
                                report.timed_out.len(),
                                phase.transfer().name()
                            );
                        }
                    }

                    for i in done.into_iter().rev() {
                        let mut phase = phases.remove(i);
                        phase.on_exit().await;
                    }
                }
                _ = progress_interval.tick() => {
                    for phase in &phases {
                        Self::log_progress(phase.transfer());
                    }
                }
            }
        }
    }

    fn log_progress(transfer: &Transfer) {
        let p = transfer.progress();
        info!(
            "{}: {}/{} pieces ({:.1}%), {} of {} downloaded, {} peers",
            transfer.name(),
            p.completed_pieces,
            p.pieces,
            percentage(p.completed_pieces as u64, p.pieces as u64),
            to_human_readable(p.downloaded),
            to_human_readable(p.total_size),
            transfer.peers().len(),
        );
    }

    /// The peer I/O side: keeps handshaked connections open and drains the
    /// requests the scheduler makes.
    async fn handle_peers(
        mut rx: UnboundedReceiver<PeerConnection<TcpStream>>,
    ) {
        while let Some((peer, mut messages, stream)) = rx.recv().await {
            info!("peer {} connected for {:?}", peer.id, peer.info_hash);

            spawn(async move {
                // framing is done by the peer wire layer, which takes the
                // stream from here.
                let _stream = stream;
                while let Some(msg) = messages.recv().await {
                    debug!(?msg, "to {}", peer.id);
                }
            });
        }
    }

    async fn accept_peers(listener: TcpListener, connector: Arc<TcpConnector>) {
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("could not accept a connection: {e}");
                    continue;
                }
            };
            debug!("received inbound connection from {addr}");
            connector.on_inbound_connection_accepted(socket);
        }
    }

    async fn dial(
        addr: SocketAddr,
        info_hash: InfoHash,
        connector: Arc<TcpConnector>,
    ) {
        let socket =
            match timeout(TcpConnector::TIMEOUT, TcpStream::connect(addr)).await
            {
                Ok(Ok(socket)) => socket,
                Ok(Err(e)) => {
                    debug!("could not connect to {addr}: {e}");
                    return;
                }
                Err(_) => {
                    debug!("connecting to {addr} timed out");
                    return;
                }
            };

        if connector
            .on_outbound_connection_established(socket, info_hash)
            .is_some()
        {
            debug!("sent handshake to {addr}");
        }
    }
}
