//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], Msb0>;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl From<Reserved> for [u8; 8] {
    fn from(value: Reserved) -> Self {
        value.0.into_inner()
    }
}

impl Reserved {
    /// Reserved bits of protocols that the client supports.
    pub fn supported() -> Reserved {
        // the extension protocol is negotiated by the peer I/O layer, but we
        // advertise it so that layer can pick it up after the handshake.
        let mut reserved = Reserved::default();
        reserved.0.set(43, true);
        reserved
    }

    pub fn supports_extended(&self) -> bool {
        self.0[43]
    }
}

pub trait BitfieldExt {
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }
    /// Set the bit of `index`, growing the bitfield if needed.
    fn safe_set(&mut self, index: usize);
    /// Get the bit of `index`, out of range is `false`.
    fn safe_get(&self, index: usize) -> bool;
}

impl BitfieldExt for Bitfield {
    fn safe_set(&mut self, index: usize) {
        if self.len() <= index {
            self.resize(index + 1, false);
        }
        self.set(index, true);
    }

    fn safe_get(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert_eq!(bitfield.count_ones(), 0);
    }

    #[test]
    fn safe_set() {
        let mut bitfield = Bitfield::from_piece(2);
        bitfield.safe_set(2);
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield[2]);

        bitfield.safe_set(10);
        assert_eq!(bitfield.len(), 11);
        assert!(bitfield[10]);
        assert!(!bitfield[9]);
    }

    #[test]
    fn safe_get() {
        let mut bitfield = Bitfield::from_piece(1);
        assert!(!bitfield.safe_get(10));
        assert_eq!(bitfield.len(), 1);

        bitfield.safe_set(0);
        assert!(bitfield.safe_get(0));
    }

    #[test]
    fn supports_ext() {
        let reserved = Reserved::supported();
        assert!(reserved.supports_extended());

        let bytes: [u8; 8] = reserved.into();
        assert_eq!(bytes, [0, 0, 0, 0, 0, 0x10, 0, 0]);
        assert!(!Reserved::from([0u8; 8]).supports_extended());
    }
}
