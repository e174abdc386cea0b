//! BitTorrent torrent file parsing.
//!
//! Torrent metadata extraction using bencode-rs, with the info hash taken
//! over the exact encoded bytes of the `info` dictionary.

pub mod bencode;
pub mod parser;
pub mod types;

// Re-export public API
pub use parser::BencodeTorrentParser;
pub use types::{TorrentFile, TorrentMetadata, TorrentParser};
