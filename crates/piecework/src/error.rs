use std::{io, path::PathBuf};

use thiserror::Error;

use crate::transfer::InfoHash;

impl From<bendy::decoding::Error> for Error {
    fn from(_value: bendy::decoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<speedy::Error> for Error {
    fn from(_value: speedy::Error) -> Self {
        Self::HandshakeInvalid
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("Failed to decode or encode the bencode buffer")]
    BencodeError,

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("Incorrect handshake length `{0}`, expected 19")]
    HandshakeLength(u8),

    #[error("The handshake does not carry the \"BitTorrent protocol\" string")]
    HandshakeProtocol,

    #[error("The peer reported a different info_hash than the one requested")]
    HandshakeInfoHashMismatch,

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("Could not find torrent for the info_hash {0}")]
    TransferNotFound(InfoHash),

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The socket accepted only {written} of {len} bytes")]
    PartialWrite { written: usize, len: usize },

    #[error("The piece {0} does not exist in this torrent")]
    PieceOutOfRange(usize),

    #[error("The block at offset {begin} does not exist in piece {index}")]
    BlockOutOfRange { index: usize, begin: usize },

    #[error("The piece downloaded does not have a valid hash")]
    PieceInvalid,

    #[error(
        "Could not create the download folder `{0}`. Please make sure the \
         program has permission to create it"
    )]
    DownloadDirCreate(PathBuf),

    #[error("The tracker `{0}` did not accept the announce")]
    TrackerAnnounce(String),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error("Could not write the default configuration")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error("The torrent does not have any file")]
    NoFiles,

    #[error("The info of the torrent is not valid: {0}")]
    InfoInvalid(&'static str),

    #[error("The torrent has a file path that leaves its folder: `{0}`")]
    FilePathInvalid(String),
}
