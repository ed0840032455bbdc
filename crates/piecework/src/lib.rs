//! The download coordination engine of a BitTorrent client.
//!
//! Three parts do the heavy lifting:
//!
//! * [`handshake::connector`] authenticates new connections and binds them
//!   to a [`transfer::Transfer`].
//! * [`phase::DownloadPhase`] decides which blocks to request from which
//!   peer, within each peer's request limit.
//! * [`disk::DiskQueue`] stores received blocks and verifies pieces, putting
//!   corrupted pieces back up for download.
//!
//! [`daemon::Daemon`] wires them to TCP sockets and drives their loops.

pub mod bitfield;
pub mod config;
pub mod daemon;
pub mod disk;
pub mod error;
pub mod file_set;
pub mod handshake;
pub mod message;
pub mod metainfo;
pub mod peer;
pub mod phase;
pub mod selector;
pub mod tracker;
pub mod transfer;
pub mod transport;
pub mod utils;
