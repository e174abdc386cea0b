//! Test data creation for torrent testing.
//!
//! Builds metadata and `.torrent` bytes from known content so piece hashes
//! are real SHA-1 digests of that content.

use sha1::{Digest, Sha1};

use super::parsing::TorrentFile;
use super::{InfoHash, PieceIndex, TorrentMetadata};

/// Deterministic content of `length` bytes that differs between pieces.
pub fn create_test_content(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i % 251) as u8).collect()
}

/// SHA-1 digest of every `piece_length` chunk of `content`.
pub fn piece_hashes_for(content: &[u8], piece_length: u32) -> Vec<[u8; 20]> {
    content
        .chunks(piece_length as usize)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(chunk));
            hash
        })
        .collect()
}

/// Single-file metadata whose piece hashes match `content`.
pub fn metadata_for_content(name: &str, content: &[u8], piece_length: u32) -> TorrentMetadata {
    TorrentMetadata {
        info_hash: InfoHash::new([0xAB; 20]),
        name: name.to_string(),
        piece_length,
        piece_hashes: piece_hashes_for(content, piece_length),
        total_length: content.len() as u64,
        files: vec![TorrentFile {
            path: vec![name.to_string()],
            length: content.len() as u64,
        }],
        announce_urls: vec!["http://tracker.example.com/announce".to_string()],
    }
}

/// Bytes of piece `index` within `content`.
pub fn piece_bytes(content: &[u8], piece_length: u32, index: PieceIndex) -> &[u8] {
    let start = index.as_usize() * piece_length as usize;
    let end = (start + piece_length as usize).min(content.len());
    &content[start..end]
}

fn bencode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Bencoded info dictionary for a single-file torrent.
pub fn encode_info_dict(name: &str, content: &[u8], piece_length: u32) -> Vec<u8> {
    let mut info = Vec::new();
    info.push(b'd');
    bencode_bytes(&mut info, b"length");
    info.extend_from_slice(format!("i{}e", content.len()).as_bytes());
    bencode_bytes(&mut info, b"name");
    bencode_bytes(&mut info, name.as_bytes());
    bencode_bytes(&mut info, b"piece length");
    info.extend_from_slice(format!("i{piece_length}e").as_bytes());
    bencode_bytes(&mut info, b"pieces");
    bencode_bytes(&mut info, &piece_hashes_for(content, piece_length).concat());
    info.push(b'e');
    info
}

/// Complete `.torrent` file bytes for a single-file torrent.
pub fn encode_torrent(announce: &str, name: &str, content: &[u8], piece_length: u32) -> Vec<u8> {
    let mut torrent = Vec::new();
    torrent.push(b'd');
    bencode_bytes(&mut torrent, b"announce");
    bencode_bytes(&mut torrent, announce.as_bytes());
    bencode_bytes(&mut torrent, b"info");
    torrent.extend_from_slice(&encode_info_dict(name, content, piece_length));
    torrent.push(b'e');
    torrent
}
