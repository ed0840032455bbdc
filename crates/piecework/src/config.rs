//! Configuration of the daemon, read from `config.toml` in the user's config
//! folder.
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    time::Duration,
};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, warn};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where the files of the torrents are written.
    pub download_dir: PathBuf,

    /// Address on which inbound peer connections are accepted.
    pub listen: SocketAddr,

    /// Peers that are dialed for every torrent on start.
    pub peers: Vec<SocketAddr>,

    /// How many block requests may be in flight to a single peer.
    pub max_request_len: usize,

    pub handshake_timeout_secs: u64,
    pub handshake_poll_ms: u64,

    /// Interval of the scheduling tick.
    pub tick_ms: u64,

    /// A block request that is not answered in this time is given to
    /// another peer.
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: Self::default_download_dir(),
            listen: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                51413,
            )),
            peers: Vec::new(),
            max_request_len: 5,
            handshake_timeout_secs: 5,
            handshake_poll_ms: 50,
            tick_ms: 100,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// The download folder of the user, or `./downloads` if the platform
    /// has none.
    pub fn default_download_dir() -> PathBuf {
        UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("downloads"))
    }

    /// Path of the configuration file, creating its folder if needed.
    ///
    /// # Errors
    ///
    /// Fails if the user does not have a home folder, or if the program
    /// can't create the config folder.
    pub async fn config_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "piecework").ok_or(Error::HomeInvalid)?;
        let config_dir = dotfile.config_dir().to_path_buf();

        if !config_dir.exists() {
            create_dir_all(&config_dir).await?;
        }

        Ok(config_dir.join("config.toml"))
    }

    /// Load the configuration file and transform it into Self.
    /// If the file does not exist or is not valid, it is overwritten with
    /// the default configuration.
    pub async fn load() -> Result<Self, Error> {
        let path = Self::config_path().await?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;

        match toml::from_str::<Config>(&dst) {
            Ok(config) => {
                debug!("loaded config from {path:?}");
                Ok(config.sanitized())
            }
            Err(e) => {
                if !dst.trim().is_empty() {
                    warn!("invalid config at {path:?}, using the default: {e}");
                }
                let config = Config::default();
                let config_str = toml::to_string(&config)?;

                file.set_len(0).await?;
                file.rewind().await?;
                file.write_all(config_str.as_bytes()).await?;

                Ok(config)
            }
        }
    }

    /// Replace the intervals that can't be zero with their default.
    pub fn sanitized(mut self) -> Self {
        let default = Self::default();

        if self.tick_ms == 0 {
            warn!("tick_ms can't be 0, using {}", default.tick_ms);
            self.tick_ms = default.tick_ms;
        }
        if self.handshake_poll_ms == 0 {
            warn!(
                "handshake_poll_ms can't be 0, using {}",
                default.handshake_poll_ms
            );
            self.handshake_poll_ms = default.handshake_poll_ms;
        }
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn handshake_poll(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
