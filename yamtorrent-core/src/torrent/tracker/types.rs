//! Core types for BitTorrent tracker communication

use async_trait::async_trait;

use crate::torrent::{InfoHash, PeerAddress, TorrentError};

pub(super) type PeerList = Result<Vec<PeerAddress>, TorrentError>;

/// Tracker announce request.
///
/// Contains client statistics and torrent information sent to the tracker
/// to report progress and request a peer list.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Unique identifier for the torrent being announced
    pub info_hash: InfoHash,
    /// Client's unique 20-byte identifier
    pub peer_id: [u8; 20],
    /// TCP port reported for incoming peer connections
    pub port: u16,
    /// Total bytes uploaded to other peers
    pub uploaded: u64,
    /// Total bytes downloaded from other peers
    pub downloaded: u64,
    /// Bytes remaining to download
    pub left: u64,
    /// Current client state for this torrent
    pub event: AnnounceEvent,
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Client started downloading this torrent
    Started,
    /// Client stopped downloading this torrent
    Stopped,
    /// Client completed downloading this torrent
    Completed,
}

impl AnnounceEvent {
    /// Value of the HTTP `event` query parameter.
    pub fn as_query_value(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }

    /// Event code in a UDP announce packet.
    pub fn as_udp_code(self) -> u32 {
        match self {
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// Tracker announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next announce should be sent
    pub interval: u32,
    /// Minimum allowed interval between announces
    pub min_interval: Option<u32>,
    /// Tracker-specific identifier for subsequent requests
    pub tracker_id: Option<String>,
    /// Number of seeders in the swarm
    pub complete: u32,
    /// Number of leechers in the swarm
    pub incomplete: u32,
    /// Peer addresses for connection attempts
    pub peers: Vec<PeerAddress>,
}

/// Abstract tracker communication interface.
///
/// Implementations handle protocol-specific details (HTTP/UDP) and map every
/// failure onto a typed `TorrentError`.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces client presence to the tracker and retrieves a peer list.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - If the tracker could not be reached
    /// - `TorrentError::TrackerTimeout` - If the tracker did not answer in time
    /// - `TorrentError::TrackerFailure` - If the tracker rejected the announce
    /// - `TorrentError::MalformedTrackerResponse` - If the response could not be decoded
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError>;

    /// Returns tracker URL for debugging and logging purposes.
    fn tracker_url(&self) -> &str;
}

/// Decodes a compact peer list: 4-byte IPv4 address plus 2-byte port each.
///
/// # Errors
///
/// - `TorrentError::MalformedTrackerResponse` - If the length is not a multiple of 6
pub fn parse_compact_peers(peer_bytes: &[u8]) -> PeerList {
    if !peer_bytes.len().is_multiple_of(6) {
        return Err(TorrentError::MalformedTrackerResponse {
            reason: format!(
                "compact peer list length {} is not a multiple of 6",
                peer_bytes.len()
            ),
        });
    }

    let peers = peer_bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerAddress::from((ip, port))
        })
        .collect();

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        let peer_bytes = [127, 0, 0, 1, 26, 225, 192, 168, 1, 100, 195, 80];

        let peers = parse_compact_peers(&peer_bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "127.0.0.1:6881");
        assert_eq!(peers[1].to_string(), "192.168.1.100:50000");
    }

    #[test]
    fn test_parse_compact_peers_invalid_length() {
        let result = parse_compact_peers(&[127, 0, 0, 1, 26]);
        assert!(matches!(
            result,
            Err(TorrentError::MalformedTrackerResponse { reason }) if reason.contains("multiple of 6")
        ));
    }

    #[test]
    fn test_parse_compact_peers_empty() {
        assert!(parse_compact_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_event_encodings() {
        assert_eq!(AnnounceEvent::Started.as_query_value(), "started");
        assert_eq!(AnnounceEvent::Completed.as_query_value(), "completed");
        assert_eq!(AnnounceEvent::Started.as_udp_code(), 2);
        assert_eq!(AnnounceEvent::Stopped.as_udp_code(), 3);
    }
}
