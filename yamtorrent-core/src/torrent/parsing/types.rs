//! Core types and structures for torrent parsing

use std::path::Path;

use async_trait::async_trait;

use super::super::{InfoHash, PieceIndex, PieceLayout, TorrentError};

/// Complete metadata extracted from a torrent file.
///
/// Contains all information needed to download a torrent including
/// piece hashes, file structure, and tracker URLs. Immutable for the
/// lifetime of a download.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
    pub announce_urls: Vec<String>,
}

impl TorrentMetadata {
    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Expected SHA-1 digest of piece `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index.as_usize())
    }

    /// Piece size geometry.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Piece table does not cover `total_length`
    pub fn layout(&self) -> Result<PieceLayout, TorrentError> {
        PieceLayout::new(self.piece_length, self.total_length, self.num_pieces())
    }

    /// Primary tracker URL.
    pub fn announce(&self) -> Option<&str> {
        self.announce_urls.first().map(String::as_str)
    }

    /// Name of the single output file.
    pub fn output_name(&self) -> &str {
        &self.name
    }
}

/// Individual file within a torrent.
///
/// Represents a single file entry in multi-file torrents with its
/// relative path components and byte length.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// Abstract torrent parsing interface.
///
/// Implementations handle format-specific details while maintaining consistent
/// error handling and metadata extraction.
#[async_trait]
pub trait TorrentParser: Send + Sync {
    /// Parses torrent metadata from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentMetadata, TorrentError>;

    /// Parses torrent file from filesystem path.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Parsing failure
    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError>;
}
