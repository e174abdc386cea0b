//! Core types and enumerations for BitTorrent wire protocol

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol name carried in every handshake.
pub const PROTOCOL_NAME: &str = "BitTorrent protocol";

/// Length of a handshake using the standard protocol name.
pub const HANDSHAKE_LENGTH: usize = 1 + PROTOCOL_NAME.len() + 8 + 20 + 20;

/// Client identifier prefix placed at the start of generated peer ids.
pub const CLIENT_PREFIX: &[u8; 8] = b"-YT0001-";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID for this client.
    pub fn generate() -> Self {
        Self::with_prefix(CLIENT_PREFIX)
    }

    /// Generate random peer ID starting with the given client prefix.
    pub fn with_prefix(prefix: &[u8; 8]) -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(prefix);
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// BitTorrent wire protocol messages.
///
/// Identifiers are protocol-fixed (BEP 3): 0 choke through 9 port.
/// Frames with any other identifier decode to `Unknown` so the caller can
/// log and discard them without tearing the connection down.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Zero-length frame keeping the connection alive
    KeepAlive,
    /// Sender will not serve requests
    Choke,
    /// Sender will serve requests again
    Unchoke,
    /// Sender wants pieces the receiver has
    Interested,
    /// Sender no longer wants anything from the receiver
    NotInterested,
    /// Sender has acquired a piece
    Have {
        /// Index of the newly available piece
        piece_index: PieceIndex,
    },
    /// Sender's complete availability bitmap
    Bitfield {
        /// Bit-packed availability, piece 0 in the high bit
        bitfield: Bytes,
    },
    /// Request a block of data from a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// A block of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Raw block bytes
        data: Bytes,
    },
    /// Withdraw a previously sent request
    Cancel {
        /// Index of the piece to cancel
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
    /// Sender's DHT listen port
    Port {
        /// UDP port for DHT communication
        port: u16,
    },
    /// Frame with an identifier outside the supported set
    Unknown {
        /// Identifier byte as received
        message_id: u8,
    },
}

impl PeerMessage {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Port { .. } => "port",
            PeerMessage::Unknown { .. } => "unknown",
        }
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching for torrent verification.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}
