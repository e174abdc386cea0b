//! BitTorrent peer wire protocol engine and piece scheduling

pub mod bitfield;
pub mod manager;
pub mod parsing;
pub mod peer_connection;
pub mod peer_session;
pub mod piece;
pub mod protocol;
pub mod scheduler;
#[cfg(test)]
pub mod test_data;
pub mod tracker;

use std::fmt;
use std::net::SocketAddr;

pub use bitfield::Bitfield;
pub use manager::{DownloadSummary, ManagerState, TorrentManager};
pub use parsing::{BencodeTorrentParser, TorrentFile, TorrentMetadata, TorrentParser};
pub use peer_connection::{ConnectionState, PeerConnection, PeerEvent};
pub use peer_session::{
    PeerCommand, PeerSessionHandle, SessionConfig, SessionEvent, SessionEventKind,
};
pub use piece::{BLOCK_SIZE, PieceLayout};
pub use protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
pub use scheduler::{PieceClaim, PieceScheduler, SchedulerCommand};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient,
    UdpTrackerClient, tracker_for_url,
};

use crate::storage::StorageError;

/// Network address of a remote peer.
///
/// Immutable and compared by value, so it doubles as the key for per-peer
/// bookkeeping in the scheduler.
pub type PeerAddress = SocketAddr;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a usize for bitfield and table lookups.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Covers all failure modes in BitTorrent protocol operations including
/// file parsing, network communication, and data verification.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Peer is choking, cannot download piece {index}")]
    PeerChoking { index: PieceIndex },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Tracker connection failed: {url}")]
    TrackerConnectionFailed { url: String },

    #[error("Tracker timeout: {url}")]
    TrackerTimeout { url: String },

    #[error("Tracker rejected announce: {reason}")]
    TrackerFailure { reason: String },

    #[error("Tracker server error {status}: {url}")]
    TrackerServerError { url: String, status: u16 },

    #[error("Malformed tracker response: {reason}")]
    MalformedTrackerResponse { reason: String },

    #[error("Unsupported tracker URL: {url}")]
    UnsupportedTracker { url: String },

    #[error("No peers available for torrent")]
    NoPeersAvailable,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
