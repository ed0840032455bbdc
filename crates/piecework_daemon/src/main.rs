use clap::Parser;
use piecework::{config::Config, daemon::Daemon, error::Error, metainfo::MetaInfo};
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use args::Args;

mod args;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    let mut config = Config::load().await?;

    if let Some(download_dir) = args.download_dir {
        config.download_dir = download_dir;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(max_request_len) = args.max_request_len {
        config.max_request_len = max_request_len;
    }
    config.peers.extend(args.peers);

    info!("downloading to {:?}", config.download_dir);

    let daemon = Daemon::new(config);

    for path in &args.torrents {
        let buf = tokio::fs::read(path).await?;
        let meta = match MetaInfo::from_bytes(&buf) {
            Ok(meta) => meta,
            Err(e) => {
                error!("{path:?} is not a valid torrent: {e}");
                continue;
            }
        };
        daemon.add_torrent(&meta)?;
    }

    daemon.run().await
}
