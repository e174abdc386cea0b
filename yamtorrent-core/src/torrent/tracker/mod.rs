//! BitTorrent tracker communication.
//!
//! HTTP (BEP 3, compact peer lists) and UDP (BEP 15) announce clients behind
//! one `TrackerClient` trait.

pub mod client;
pub mod types;
pub mod udp;

pub use client::HttpTrackerClient;
pub use types::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient, parse_compact_peers,
};
pub use udp::UdpTrackerClient;

use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// Builds the tracker client matching the URL scheme.
///
/// # Errors
///
/// - `TorrentError::UrlParsing` - If the URL is not valid
/// - `TorrentError::UnsupportedTracker` - If the scheme is neither HTTP(S) nor UDP
pub fn tracker_for_url(
    announce_url: &str,
    config: &NetworkConfig,
) -> Result<Box<dyn TrackerClient>, TorrentError> {
    let parsed = url::Url::parse(announce_url)?;
    match parsed.scheme() {
        "http" | "https" => Ok(Box::new(HttpTrackerClient::new(
            announce_url.to_string(),
            config,
        )?)),
        "udp" => Ok(Box::new(UdpTrackerClient::new(
            announce_url.to_string(),
            config,
        )?)),
        _ => Err(TorrentError::UnsupportedTracker {
            url: announce_url.to_string(),
        }),
    }
}
