//! Piece and block size arithmetic.
//!
//! Every piece has `piece_length` bytes except the last, which holds the
//! remainder of `total_length`. Blocks are requested in `block_size` units
//! (`BLOCK_SIZE` unless configured) with a shorter final block when the
//! piece size is not a multiple of it.

use super::{PieceIndex, TorrentError};

/// Standard 16 KiB BitTorrent block size.
pub const BLOCK_SIZE: u32 = 16_384;

/// Size geometry of a torrent's pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    piece_length: u32,
    total_length: u64,
    num_pieces: u32,
    block_size: u32,
}

impl PieceLayout {
    /// Creates a layout after checking the piece count matches the lengths.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Zero piece length, or
    ///   `num_pieces != ceil(total_length / piece_length)`
    pub fn new(piece_length: u32, total_length: u64, num_pieces: u32) -> Result<Self, TorrentError> {
        if piece_length == 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Piece length must be non-zero".to_string(),
            });
        }

        let expected = total_length.div_ceil(piece_length as u64);
        if expected != num_pieces as u64 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Piece count {num_pieces} does not cover {total_length} bytes at {piece_length} bytes per piece"
                ),
            });
        }

        Ok(Self {
            piece_length,
            total_length,
            num_pieces,
            block_size: BLOCK_SIZE,
        })
    }

    /// Uses `block_size` bytes per request; zero keeps the current size.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        if block_size > 0 {
            self.block_size = block_size;
        }
        self
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Nominal piece length (all pieces but the last).
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Total payload length in bytes.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Number of pieces.
    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    /// Returns true if `index` is the final piece.
    pub fn is_last_piece(&self, index: PieceIndex) -> bool {
        self.num_pieces > 0 && index.as_u32() == self.num_pieces - 1
    }

    /// Length of the final piece: `total - (num_pieces - 1) * piece_length`.
    pub fn last_piece_length(&self) -> u32 {
        if self.num_pieces == 0 {
            return 0;
        }
        (self.total_length - (self.num_pieces as u64 - 1) * self.piece_length as u64) as u32
    }

    /// Length in bytes of piece `index`.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        if self.is_last_piece(index) {
            self.last_piece_length()
        } else {
            self.piece_length
        }
    }

    /// Byte offset of piece `index` within the output file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index.as_u32() as u64 * self.piece_length as u64
    }

    /// Bytes of piece `index` not yet covered when `offset` bytes are held.
    pub fn remaining_in_piece(&self, index: PieceIndex, offset: u32) -> u32 {
        self.piece_size(index).saturating_sub(offset)
    }

    /// Length of the block to request at `offset`; zero once the piece is covered.
    pub fn block_length(&self, index: PieceIndex, offset: u32) -> u32 {
        self.remaining_in_piece(index, offset).min(self.block_size)
    }

    /// Number of blocks piece `index` is split into.
    pub fn block_count(&self, index: PieceIndex) -> u32 {
        self.piece_size(index).div_ceil(self.block_size)
    }

    /// Size of the final block of piece `index`.
    pub fn last_block_size(&self, index: PieceIndex) -> u32 {
        match self.piece_size(index) % self.block_size {
            0 if self.piece_size(index) > 0 => self.block_size,
            rem => rem,
        }
    }
}
