//! BitTorrent handshake framing

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::types::{PROTOCOL_NAME, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Fixed bytes in a handshake besides the protocol name.
const HANDSHAKE_FIXED_LENGTH: usize = 1 + 8 + 20 + 20;

/// Handshake codec bound to the local torrent's info hash.
///
/// Decoding yields `Ok(None)` until `49 + name length` bytes are buffered,
/// then consumes exactly that many bytes. A foreign protocol name or a
/// different info hash is an error; the caller must drop the connection.
#[derive(Debug, Clone)]
pub struct HandshakeCodec {
    info_hash: InfoHash,
}

impl HandshakeCodec {
    /// Creates a codec that accepts handshakes for `info_hash` only.
    pub fn new(info_hash: InfoHash) -> Self {
        Self { info_hash }
    }

    /// Appends the wire form of `handshake` to `buf`.
    pub fn write_handshake(handshake: &PeerHandshake, buf: &mut BytesMut) {
        buf.reserve(HANDSHAKE_FIXED_LENGTH + handshake.protocol.len());
        buf.put_u8(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());
    }

    /// Returns the wire form of `handshake`.
    pub fn serialize_handshake(handshake: &PeerHandshake) -> BytesMut {
        let mut buf = BytesMut::new();
        Self::write_handshake(handshake, &mut buf);
        buf
    }
}

impl Decoder for HandshakeCodec {
    type Item = PeerHandshake;
    type Error = TorrentError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&name_length) = buf.first() else {
            return Ok(None);
        };

        let name_length = name_length as usize;
        let frame_length = HANDSHAKE_FIXED_LENGTH + name_length;
        if buf.len() < frame_length {
            return Ok(None);
        }

        let frame = buf.split_to(frame_length);
        let name = &frame[1..1 + name_length];
        if name != PROTOCOL_NAME.as_bytes() {
            return Err(TorrentError::HandshakeRejected {
                reason: format!(
                    "unexpected protocol name {:?}",
                    String::from_utf8_lossy(name)
                ),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&frame[1 + name_length..9 + name_length]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&frame[9 + name_length..29 + name_length]);
        let info_hash = InfoHash::new(info_hash);
        if info_hash != self.info_hash {
            return Err(TorrentError::HandshakeRejected {
                reason: format!("info hash {info_hash} does not match {}", self.info_hash),
            });
        }

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&frame[29 + name_length..frame_length]);

        Ok(Some(PeerHandshake {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash,
            peer_id: PeerId::new(peer_id),
        }))
    }
}

impl Encoder<PeerHandshake> for HandshakeCodec {
    type Error = TorrentError;

    fn encode(&mut self, item: PeerHandshake, buf: &mut BytesMut) -> Result<(), Self::Error> {
        Self::write_handshake(&item, buf);
        Ok(())
    }
}
