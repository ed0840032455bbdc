use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use tracing::Level;

/// CLI flags of the daemon binary. These values
/// take preference over values of the config file.
#[derive(Parser, Debug)]
#[clap(name = "Piecework Daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The `.torrent` files to download.
    #[clap(required = true)]
    pub torrents: Vec<PathBuf>,

    /// The directory in which torrents will be downloaded
    #[clap(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Inbound peer connections are accepted on this address.
    #[clap(long)]
    pub listen: Option<SocketAddr>,

    /// A peer to dial for every torrent, may be repeated.
    #[clap(short, long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Maximum number of requests in flight to a single peer.
    #[clap(long)]
    pub max_request_len: Option<usize>,

    #[clap(long, default_value_t = Level::INFO)]
    pub log_level: Level,
}
