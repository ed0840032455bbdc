//! The handshake, the very first message exchanged on a connection.
//!
//! It has a different structure than the rest of the messages and is sent
//! exactly once by each side, preceding all other messages. A connection is
//! only handed to the rest of the engine after a valid handshake, see
//! [`connector::HandshakeConnector`].
pub mod connector;

use speedy::{BigEndian, Readable, Writable};

use crate::{bitfield::Reserved, error::Error, peer::PeerId, transfer::InfoHash};

/// The protocol string of BitTorrent V1.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// Size of the handshake frame on the wire.
pub const HANDSHAKE_LEN: usize = 68;

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// If the peer's protocol string or the info hash differs from ours, the
/// connection is severed. The reserved field tells which extensions the
/// peer supports. The peer id is usually the client name and version.
#[derive(Clone, Debug, PartialEq, Eq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(
        info_hash: impl Into<[u8; 20]>,
        peer_id: impl Into<[u8; 20]>,
        reserved: Reserved,
    ) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: reserved.into(),
            info_hash: InfoHash(info_hash.into()),
            peer_id: PeerId(peer_id.into()),
        }
    }

    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;

        if temp.len() != HANDSHAKE_LEN {
            return Err(Error::HandshakeInvalid);
        }
        buf.copy_from_slice(&temp);

        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(Error::HandshakeInvalid);
        }
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    /// Check the protocol part of the frame, the info hash is checked by
    /// whoever knows which one is expected.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pstr_len != PSTR.len() as u8 {
            return Err(Error::HandshakeLength(self.pstr_len));
        }
        if self.pstr != PSTR {
            return Err(Error::HandshakeProtocol);
        }
        Ok(())
    }

    pub fn reserved(&self) -> Reserved {
        Reserved::from(self.reserved)
    }
}
