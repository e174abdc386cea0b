//! BitTorrent wire protocol framing and message types.
//!
//! BitTorrent peer-to-peer protocol implementation following BEP 3.
//! A connection carries exactly one handshake followed by length-prefixed
//! messages; `PeerWireCodec` decodes that whole stream in arrival order.

pub mod handshake;
pub mod messages;
pub mod types;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

pub use handshake::HandshakeCodec;
pub use messages::MessageCodec;
pub use types::{CLIENT_PREFIX, HANDSHAKE_LENGTH, PROTOCOL_NAME, PeerHandshake, PeerId, PeerMessage};

use super::{InfoHash, TorrentError};

/// One decoded unit of the peer wire stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// The remote handshake, always the first frame
    Handshake(PeerHandshake),
    /// Any length-prefixed message after the handshake
    Message(PeerMessage),
}

/// Stateful decoder for a full peer stream.
///
/// Decodes the handshake first, then switches to message framing.
#[derive(Debug, Clone)]
pub struct PeerWireCodec {
    handshake: HandshakeCodec,
    handshake_received: bool,
}

impl PeerWireCodec {
    /// Creates a decoder expecting a handshake for `info_hash`.
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            handshake: HandshakeCodec::new(info_hash),
            handshake_received: false,
        }
    }

    /// Returns true once the remote handshake has been decoded.
    pub fn handshake_received(&self) -> bool {
        self.handshake_received
    }
}

impl Decoder for PeerWireCodec {
    type Item = WireFrame;
    type Error = TorrentError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.handshake_received {
            return Ok(MessageCodec.decode(buf)?.map(WireFrame::Message));
        }

        match self.handshake.decode(buf)? {
            Some(handshake) => {
                self.handshake_received = true;
                Ok(Some(WireFrame::Handshake(handshake)))
            }
            None => Ok(None),
        }
    }
}
