//! Fixed-size piece possession bitmaps.
//!
//! Used both for the local completion state and for the availability a
//! remote peer announces. Bits are packed MSB-first: piece 0 is the high bit
//! of byte 0. The length in pieces is fixed at construction.

use bytes::Bytes;

use super::PieceIndex;

/// Bit-per-piece possession map over a known piece count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// Creates an all-zero bitfield for `num_pieces` pieces.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Creates a bitfield with every piece marked present.
    pub fn full(num_pieces: usize) -> Self {
        let mut bitfield = Self {
            bits: vec![0xFF; num_pieces.div_ceil(8)],
            num_pieces,
        };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Checks a bitfield payload received from a remote peer.
    ///
    /// Valid iff the payload covers at least `num_pieces` bits and every bit
    /// at index `num_pieces` or above is zero.
    pub fn validate(payload: &[u8], num_pieces: usize) -> bool {
        if payload.len() * 8 < num_pieces {
            return false;
        }

        (num_pieces..payload.len() * 8).all(|bit| payload[bit / 8] & (0x80 >> (bit % 8)) == 0)
    }

    /// Builds a bitfield from a remote payload, or `None` if it is invalid.
    ///
    /// Trailing zero bytes beyond the required length are accepted and
    /// dropped.
    pub fn from_remote(payload: &[u8], num_pieces: usize) -> Option<Self> {
        if !Self::validate(payload, num_pieces) {
            return None;
        }

        Some(Self {
            bits: payload[..num_pieces.div_ceil(8)].to_vec(),
            num_pieces,
        })
    }

    /// Returns the number of pieces this bitfield covers.
    pub fn len(&self) -> usize {
        self.num_pieces
    }

    /// Returns true if the bitfield covers zero pieces.
    pub fn is_empty(&self) -> bool {
        self.num_pieces == 0
    }

    /// Returns true if the piece is marked present. Out-of-range is false.
    pub fn has(&self, index: PieceIndex) -> bool {
        let index = index.as_usize();
        if index >= self.num_pieces {
            return false;
        }
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Marks a piece present. Returns false if the index is out of range.
    pub fn set(&mut self, index: PieceIndex) -> bool {
        let index = index.as_usize();
        if index >= self.num_pieces {
            return false;
        }
        self.bits[index / 8] |= 0x80 >> (index % 8);
        true
    }

    /// Counts pieces marked present.
    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Returns true once every bit in `[0, num_pieces)` is set.
    pub fn is_complete(&self) -> bool {
        self.count_set() == self.num_pieces
    }

    /// Iterates over the indices of present pieces in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.num_pieces as u32)
            .map(PieceIndex::new)
            .filter(|index| self.has(*index))
    }

    /// Returns the packed wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Returns the packed wire representation as owned bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.num_pieces;
        if spare > 0
            && let Some(last) = self.bits.last_mut()
        {
            *last &= 0xFF << spare;
        }
    }
}
