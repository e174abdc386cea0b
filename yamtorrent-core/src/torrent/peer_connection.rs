//! Per-peer wire protocol state machine.
//!
//! `PeerConnection` performs no I/O. The session task hands it every chunk
//! read from the socket and writes whatever it queues in its outgoing
//! buffer. It tracks the handshake, the four choke/interest flags, the
//! remote bitfield, and at most one piece being assembled block by block.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio_util::codec::Decoder;

use super::protocol::{PeerWireCodec, WireFrame};
use super::{
    Bitfield, HandshakeCodec, MessageCodec, PeerAddress, PeerHandshake, PeerId, PeerMessage,
    PieceIndex, PieceLayout, TorrentError, TorrentMetadata,
};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket not yet open
    AwaitingConnect,
    /// Local handshake sent, waiting for the remote one
    AwaitingHandshake,
    /// Handshake validated, messages flowing
    Established,
}

/// Upward notifications produced while processing inbound bytes.
#[derive(Debug)]
pub enum PeerEvent {
    /// Remote handshake accepted
    HandshakeCompleted { peer_id: PeerId },
    /// A valid bitfield was installed; the peer can now be scheduled
    BitfieldReady(Bitfield),
    /// The bitfield message was malformed; the peer should be dropped
    InvalidBitfield,
    /// Remote announced a new piece
    Have(PieceIndex),
    /// Remote choked (`true`) or unchoked (`false`) us
    ChokeChanged { choking: bool },
    /// Piece assembled and its SHA-1 matched
    PieceDownloaded { piece: PieceIndex, data: Bytes },
    /// Piece assembled but could not be accepted
    PieceFailed { piece: PieceIndex, error: TorrentError },
}

/// State of the piece currently being fetched.
#[derive(Debug)]
struct InFlightPiece {
    piece: PieceIndex,
    piece_size: u32,
    offset: u32,
    requested_length: u32,
    data: BytesMut,
    started_at: u64,
}

/// Wire state for one remote peer.
pub struct PeerConnection {
    address: PeerAddress,
    metadata: Arc<TorrentMetadata>,
    layout: PieceLayout,
    local_peer_id: PeerId,
    state: ConnectionState,
    remote_peer_id: Option<PeerId>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    remote_bitfield: Option<Bitfield>,
    codec: PeerWireCodec,
    inbound: BytesMut,
    outgoing: BytesMut,
    download: Option<InFlightPiece>,
}

impl PeerConnection {
    /// Creates a connection in `AwaitingConnect` with both sides choking.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Metadata piece table is inconsistent
    pub fn new(
        address: PeerAddress,
        metadata: Arc<TorrentMetadata>,
        local_peer_id: PeerId,
    ) -> Result<Self, TorrentError> {
        let layout = metadata.layout()?;
        let codec = PeerWireCodec::new(metadata.info_hash);

        Ok(Self {
            address,
            metadata,
            layout,
            local_peer_id,
            state: ConnectionState::AwaitingConnect,
            remote_peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_bitfield: None,
            codec,
            inbound: BytesMut::new(),
            outgoing: BytesMut::new(),
            download: None,
        })
    }

    /// Requests blocks of `block_size` bytes instead of `BLOCK_SIZE`.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.layout = self.layout.with_block_size(block_size);
        self
    }

    /// Socket opened: queue the local handshake.
    pub fn on_connected(&mut self) {
        if self.state != ConnectionState::AwaitingConnect {
            return;
        }

        let handshake = PeerHandshake::new(self.metadata.info_hash, self.local_peer_id);
        HandshakeCodec::write_handshake(&handshake, &mut self.outgoing);
        self.state = ConnectionState::AwaitingHandshake;
        tracing::debug!("Peer {}: handshake sent", self.address);
    }

    /// Feeds inbound bytes and processes every complete frame they finish.
    ///
    /// Partial frames stay buffered until a later call completes them.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Bytes arrived before the socket was connected
    /// - `TorrentError::HandshakeRejected` - Protocol name or info hash mismatch
    /// - `TorrentError::ProtocolError` - Malformed frame; the connection must be dropped
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Vec<PeerEvent>, TorrentError> {
        if self.state == ConnectionState::AwaitingConnect {
            return Err(TorrentError::PeerConnectionError {
                reason: format!("data from {} before connect", self.address),
            });
        }

        self.inbound.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.inbound)? {
            match frame {
                WireFrame::Handshake(handshake) => {
                    self.state = ConnectionState::Established;
                    self.remote_peer_id = Some(handshake.peer_id);
                    tracing::debug!("Peer {}: handshake accepted", self.address);
                    events.push(PeerEvent::HandshakeCompleted {
                        peer_id: handshake.peer_id,
                    });
                }
                WireFrame::Message(message) => self.handle_message(message, &mut events),
            }
        }

        Ok(events)
    }

    fn handle_message(&mut self, message: PeerMessage, events: &mut Vec<PeerEvent>) {
        tracing::trace!("Peer {}: received {}", self.address, message.name());

        match message {
            PeerMessage::KeepAlive | PeerMessage::Port { .. } => {}
            PeerMessage::Choke => {
                self.peer_choking = true;
                events.push(PeerEvent::ChokeChanged { choking: true });
            }
            PeerMessage::Unchoke => {
                self.peer_choking = false;
                events.push(PeerEvent::ChokeChanged { choking: false });
            }
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => self.peer_interested = false,
            PeerMessage::Have { piece_index } => self.handle_have(piece_index, events),
            PeerMessage::Bitfield { bitfield } => self.handle_bitfield(&bitfield, events),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.handle_block(piece_index, offset, data, events),
            PeerMessage::Request { piece_index, .. } | PeerMessage::Cancel { piece_index, .. } => {
                tracing::debug!(
                    "Peer {}: ignoring upload-side message for piece {piece_index}",
                    self.address
                );
            }
            PeerMessage::Unknown { message_id } => {
                tracing::warn!(
                    "Peer {}: discarding message with unknown id {message_id}",
                    self.address
                );
            }
        }
    }

    fn handle_have(&mut self, piece: PieceIndex, events: &mut Vec<PeerEvent>) {
        let Some(bitfield) = self.remote_bitfield.as_mut() else {
            tracing::warn!(
                "Peer {}: have {piece} before a valid bitfield, dropping",
                self.address
            );
            return;
        };

        if bitfield.set(piece) {
            events.push(PeerEvent::Have(piece));
        } else {
            tracing::warn!("Peer {}: have {piece} out of range", self.address);
        }
    }

    fn handle_bitfield(&mut self, payload: &[u8], events: &mut Vec<PeerEvent>) {
        match Bitfield::from_remote(payload, self.layout.num_pieces() as usize) {
            Some(bitfield) => {
                tracing::debug!(
                    "Peer {}: bitfield with {} of {} pieces",
                    self.address,
                    bitfield.count_set(),
                    bitfield.len()
                );
                self.remote_bitfield = Some(bitfield.clone());
                if !self.am_interested {
                    self.queue(&PeerMessage::Interested);
                    self.am_interested = true;
                }
                events.push(PeerEvent::BitfieldReady(bitfield));
            }
            None => {
                tracing::warn!(
                    "Peer {}: invalid bitfield of {} bytes",
                    self.address,
                    payload.len()
                );
                self.remote_bitfield = None;
                events.push(PeerEvent::InvalidBitfield);
            }
        }
    }

    fn handle_block(
        &mut self,
        piece: PieceIndex,
        offset: u32,
        data: Bytes,
        events: &mut Vec<PeerEvent>,
    ) {
        let Some(download) = self.download.as_mut() else {
            tracing::debug!(
                "Peer {}: unsolicited block for piece {piece}, discarding",
                self.address
            );
            return;
        };

        if download.piece != piece || download.offset != offset {
            tracing::warn!(
                "Peer {}: stale block piece {piece} offset {offset}, expected piece {} offset {}",
                self.address,
                download.piece,
                download.offset
            );
            return;
        }

        let remaining = download.piece_size - download.offset;
        if data.is_empty() || data.len() > remaining as usize {
            tracing::warn!(
                "Peer {}: block of {} bytes for piece {piece} with {remaining} remaining, discarding",
                self.address,
                data.len()
            );
            return;
        }

        download.data.extend_from_slice(&data);
        download.offset += data.len() as u32;

        if download.offset < download.piece_size {
            if self.am_interested && !self.peer_choking {
                self.request_next_block();
            }
            return;
        }

        if let Some(download) = self.download.take() {
            events.push(self.verify_piece(download));
        }
    }

    fn verify_piece(&self, download: InFlightPiece) -> PeerEvent {
        let piece = download.piece;
        let data = download.data.freeze();
        let digest = Sha1::digest(&data);

        match self.metadata.piece_hash(piece) {
            Some(expected) if digest.as_slice() == expected.as_slice() => {
                tracing::debug!("Peer {}: piece {piece} verified", self.address);
                PeerEvent::PieceDownloaded { piece, data }
            }
            _ => {
                tracing::warn!("Peer {}: piece {piece} failed hash check", self.address);
                PeerEvent::PieceFailed {
                    piece,
                    error: TorrentError::PieceHashMismatch { index: piece },
                }
            }
        }
    }

    /// Begins fetching `piece`, one block request at a time.
    ///
    /// Returns false without sending anything when the peer is choking us or
    /// the index is out of range. A download already in flight is cancelled.
    pub fn start_piece_download(&mut self, piece: PieceIndex, start_tick: u64) -> bool {
        if self.peer_choking {
            tracing::debug!(
                "Peer {}: choking, not starting piece {piece}",
                self.address
            );
            return false;
        }

        if piece.as_u32() >= self.layout.num_pieces() {
            tracing::warn!("Peer {}: piece {piece} out of range", self.address);
            return false;
        }

        self.cancel_current_download();
        self.queue(&PeerMessage::Interested);
        self.am_interested = true;

        let piece_size = self.layout.piece_size(piece);
        self.download = Some(InFlightPiece {
            piece,
            piece_size,
            offset: 0,
            requested_length: 0,
            data: BytesMut::with_capacity(piece_size as usize),
            started_at: start_tick,
        });
        self.request_next_block();

        tracing::debug!(
            "Peer {}: downloading piece {piece} ({piece_size} bytes, {} blocks, last piece: {})",
            self.address,
            self.layout.block_count(piece),
            self.layout.is_last_piece(piece)
        );
        true
    }

    fn request_next_block(&mut self) {
        let Some(download) = self.download.as_mut() else {
            return;
        };

        let length = self.layout.block_length(download.piece, download.offset);
        if length == 0 {
            return;
        }

        download.requested_length = length;
        let request = PeerMessage::Request {
            piece_index: download.piece,
            offset: download.offset,
            length,
        };
        MessageCodec::write_message(&request, &mut self.outgoing);
    }

    /// Abandons the in-flight piece, telling the peer. No-op when idle.
    pub fn cancel_current_download(&mut self) {
        let Some(download) = self.download.take() else {
            return;
        };

        if download.requested_length > 0 {
            self.queue(&PeerMessage::Cancel {
                piece_index: download.piece,
                offset: download.offset,
                length: download.requested_length,
            });
        }
        tracing::debug!(
            "Peer {}: cancelled piece {} at offset {}",
            self.address,
            download.piece,
            download.offset
        );
    }

    /// Queues a keep-alive; ignored until the local handshake is queued.
    pub fn queue_keep_alive(&mut self) {
        if self.state != ConnectionState::AwaitingConnect {
            self.queue(&PeerMessage::KeepAlive);
        }
    }

    fn queue(&mut self, message: &PeerMessage) {
        MessageCodec::write_message(message, &mut self.outgoing);
    }

    /// Drains bytes queued for the socket.
    pub fn take_outgoing(&mut self) -> Bytes {
        self.outgoing.split().freeze()
    }

    /// Returns true if bytes are waiting to be written.
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn address(&self) -> PeerAddress {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.remote_peer_id
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    /// Availability announced by the remote, if a valid bitfield arrived.
    pub fn remote_bitfield(&self) -> Option<&Bitfield> {
        self.remote_bitfield.as_ref()
    }

    /// Piece currently being assembled.
    pub fn current_piece(&self) -> Option<PieceIndex> {
        self.download.as_ref().map(|download| download.piece)
    }

    /// Tick at which the current download started.
    pub fn download_started_at(&self) -> Option<u64> {
        self.download.as_ref().map(|download| download.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::test_data::{create_test_content, metadata_for_content, piece_bytes};
    use crate::torrent::{BLOCK_SIZE, InfoHash};

    const PIECE_LENGTH: u32 = 32_768;

    struct Fixture {
        connection: PeerConnection,
        content: Vec<u8>,
        info_hash: InfoHash,
    }

    /// Two full pieces plus a 10-byte last piece.
    fn fixture() -> Fixture {
        let content = create_test_content(2 * PIECE_LENGTH as usize + 10);
        let metadata = Arc::new(metadata_for_content("file.bin", &content, PIECE_LENGTH));
        let info_hash = metadata.info_hash;
        let address = "127.0.0.1:6881".parse().unwrap();
        let connection = PeerConnection::new(address, metadata, PeerId::new([1u8; 20])).unwrap();
        Fixture {
            connection,
            content,
            info_hash,
        }
    }

    fn wire(messages: &[PeerMessage]) -> BytesMut {
        let mut buf = BytesMut::new();
        for message in messages {
            MessageCodec::write_message(message, &mut buf);
        }
        buf
    }

    fn decode_outgoing(connection: &mut PeerConnection) -> Vec<PeerMessage> {
        let mut buf = BytesMut::from(&connection.take_outgoing()[..]);
        let mut codec = MessageCodec;
        let mut messages = Vec::new();
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            messages.push(message);
        }
        messages
    }

    /// Connects, completes the handshake, installs a full bitfield and unchokes.
    fn established(fixture: &mut Fixture) {
        let connection = &mut fixture.connection;
        connection.on_connected();
        let _ = connection.take_outgoing();

        let mut bytes = HandshakeCodec::serialize_handshake(&PeerHandshake::new(
            fixture.info_hash,
            PeerId::new([2u8; 20]),
        ));
        bytes.extend_from_slice(&wire(&[
            PeerMessage::Bitfield {
                bitfield: Bitfield::full(3).to_bytes(),
            },
            PeerMessage::Unchoke,
        ]));
        connection.receive(&bytes).unwrap();
        let _ = connection.take_outgoing();
    }

    fn block(fixture: &Fixture, piece: u32, offset: u32, length: u32) -> PeerMessage {
        let bytes = piece_bytes(&fixture.content, PIECE_LENGTH, PieceIndex::new(piece));
        PeerMessage::Piece {
            piece_index: PieceIndex::new(piece),
            offset,
            data: Bytes::copy_from_slice(&bytes[offset as usize..(offset + length) as usize]),
        }
    }

    #[test]
    fn test_initial_flags() {
        let fixture = fixture();
        let connection = &fixture.connection;
        assert_eq!(connection.state(), ConnectionState::AwaitingConnect);
        assert!(connection.am_choking());
        assert!(!connection.am_interested());
        assert!(connection.peer_choking());
        assert!(!connection.peer_interested());
        assert!(connection.remote_bitfield().is_none());
    }

    #[test]
    fn test_handshake_then_bitfield_sends_interested() {
        let mut fixture = fixture();
        let connection = &mut fixture.connection;
        connection.on_connected();
        assert_eq!(connection.state(), ConnectionState::AwaitingHandshake);
        assert_eq!(connection.take_outgoing().len(), 68);

        let handshake = HandshakeCodec::serialize_handshake(&PeerHandshake::new(
            fixture.info_hash,
            PeerId::new([2u8; 20]),
        ));
        let events = connection.receive(&handshake).unwrap();
        assert!(matches!(events[..], [PeerEvent::HandshakeCompleted { .. }]));
        assert_eq!(connection.state(), ConnectionState::Established);

        let events = connection
            .receive(&wire(&[PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000]),
            }]))
            .unwrap();
        assert!(matches!(events[..], [PeerEvent::BitfieldReady(_)]));
        assert!(connection.am_interested());
        assert_eq!(decode_outgoing(connection), vec![PeerMessage::Interested]);
        let bitfield = connection.remote_bitfield().unwrap();
        assert!(bitfield.has(PieceIndex::new(0)));
        assert!(!bitfield.has(PieceIndex::new(1)));
    }

    #[test]
    fn test_foreign_info_hash_is_fatal() {
        let mut fixture = fixture();
        let connection = &mut fixture.connection;
        connection.on_connected();

        let handshake = HandshakeCodec::serialize_handshake(&PeerHandshake::new(
            InfoHash::new([0u8; 20]),
            PeerId::new([2u8; 20]),
        ));
        let result = connection.receive(&handshake);
        assert!(matches!(result, Err(TorrentError::HandshakeRejected { .. })));
    }

    #[test]
    fn test_invalid_bitfield_clears_remote_state() {
        let mut fixture = fixture();
        established(&mut fixture);

        // Bit 3 is beyond the three pieces
        let events = fixture
            .connection
            .receive(&wire(&[PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1111_0000]),
            }]))
            .unwrap();
        assert!(matches!(events[..], [PeerEvent::InvalidBitfield]));
        assert!(fixture.connection.remote_bitfield().is_none());
    }

    #[test]
    fn test_have_without_bitfield_is_dropped() {
        let mut fixture = fixture();
        let connection = &mut fixture.connection;
        connection.on_connected();
        let mut bytes = HandshakeCodec::serialize_handshake(&PeerHandshake::new(
            fixture.info_hash,
            PeerId::new([2u8; 20]),
        ));
        bytes.extend_from_slice(&wire(&[
            PeerMessage::Have {
                piece_index: PieceIndex::new(1),
            },
            PeerMessage::Unchoke,
        ]));

        let events = connection.receive(&bytes).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], PeerEvent::ChokeChanged { choking: false }));
        assert!(connection.remote_bitfield().is_none());
    }

    #[test]
    fn test_have_updates_single_bit() {
        let mut fixture = fixture();
        let connection = &mut fixture.connection;
        connection.on_connected();
        let mut bytes = HandshakeCodec::serialize_handshake(&PeerHandshake::new(
            fixture.info_hash,
            PeerId::new([2u8; 20]),
        ));
        bytes.extend_from_slice(&wire(&[
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0]),
            },
            PeerMessage::Have {
                piece_index: PieceIndex::new(2),
            },
        ]));

        let events = connection.receive(&bytes).unwrap();
        assert!(matches!(events.last(), Some(PeerEvent::Have(piece)) if piece.as_u32() == 2));
        let bitfield = connection.remote_bitfield().unwrap();
        assert_eq!(bitfield.count_set(), 1);
        assert!(bitfield.has(PieceIndex::new(2)));
    }

    #[test]
    fn test_start_refused_while_choked() {
        let mut fixture = fixture();
        let connection = &mut fixture.connection;
        connection.on_connected();
        let _ = connection.take_outgoing();

        assert!(!connection.start_piece_download(PieceIndex::new(0), 0));
        assert!(connection.current_piece().is_none());
        assert!(!connection.has_outgoing());
    }

    #[test]
    fn test_full_piece_download_verifies_hash() {
        let mut fixture = fixture();
        established(&mut fixture);

        assert!(fixture.connection.start_piece_download(PieceIndex::new(1), 7));
        assert_eq!(fixture.connection.download_started_at(), Some(7));
        assert_eq!(
            decode_outgoing(&mut fixture.connection),
            vec![
                PeerMessage::Interested,
                PeerMessage::Request {
                    piece_index: PieceIndex::new(1),
                    offset: 0,
                    length: BLOCK_SIZE,
                },
            ]
        );

        let first = block(&fixture, 1, 0, BLOCK_SIZE);
        let events = fixture.connection.receive(&wire(&[first])).unwrap();
        assert!(events.is_empty());
        assert_eq!(
            decode_outgoing(&mut fixture.connection),
            vec![PeerMessage::Request {
                piece_index: PieceIndex::new(1),
                offset: BLOCK_SIZE,
                length: BLOCK_SIZE,
            }]
        );

        let second = block(&fixture, 1, BLOCK_SIZE, BLOCK_SIZE);
        let events = fixture.connection.receive(&wire(&[second])).unwrap();
        match &events[..] {
            [PeerEvent::PieceDownloaded { piece, data }] => {
                assert_eq!(piece.as_u32(), 1);
                assert_eq!(
                    &data[..],
                    piece_bytes(&fixture.content, PIECE_LENGTH, PieceIndex::new(1))
                );
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert!(fixture.connection.current_piece().is_none());
        assert!(!fixture.connection.has_outgoing());
    }

    #[test]
    fn test_configured_block_size_is_requested() {
        let mut fixture = fixture();
        fixture.connection = fixture.connection.with_block_size(8_192);
        established(&mut fixture);

        assert!(fixture.connection.start_piece_download(PieceIndex::new(0), 0));
        assert_eq!(
            decode_outgoing(&mut fixture.connection).last(),
            Some(&PeerMessage::Request {
                piece_index: PieceIndex::new(0),
                offset: 0,
                length: 8_192,
            })
        );

        let first = block(&fixture, 0, 0, 8_192);
        fixture.connection.receive(&wire(&[first])).unwrap();
        assert_eq!(
            decode_outgoing(&mut fixture.connection),
            vec![PeerMessage::Request {
                piece_index: PieceIndex::new(0),
                offset: 8_192,
                length: 8_192,
            }]
        );
    }

    #[test]
    fn test_keep_alive_waits_for_handshake() {
        let mut fixture = fixture();
        fixture.connection.queue_keep_alive();
        assert!(!fixture.connection.has_outgoing());

        established(&mut fixture);
        fixture.connection.queue_keep_alive();
        assert_eq!(
            decode_outgoing(&mut fixture.connection),
            vec![PeerMessage::KeepAlive]
        );
    }

    #[test]
    fn test_last_piece_requests_remaining_bytes() {
        let mut fixture = fixture();
        established(&mut fixture);

        assert!(fixture.connection.start_piece_download(PieceIndex::new(2), 0));
        let requests = decode_outgoing(&mut fixture.connection);
        assert_eq!(
            requests.last(),
            Some(&PeerMessage::Request {
                piece_index: PieceIndex::new(2),
                offset: 0,
                length: 10,
            })
        );

        let last = block(&fixture, 2, 0, 10);
        let events = fixture.connection.receive(&wire(&[last])).unwrap();
        assert!(matches!(events[..], [PeerEvent::PieceDownloaded { .. }]));
    }

    #[test]
    fn test_corrupt_byte_fails_verification() {
        let mut fixture = fixture();
        established(&mut fixture);
        fixture.connection.start_piece_download(PieceIndex::new(2), 0);

        let mut corrupted = piece_bytes(&fixture.content, PIECE_LENGTH, PieceIndex::new(2)).to_vec();
        corrupted[4] ^= 0xFF;
        let events = fixture
            .connection
            .receive(&wire(&[PeerMessage::Piece {
                piece_index: PieceIndex::new(2),
                offset: 0,
                data: Bytes::from(corrupted),
            }]))
            .unwrap();

        assert!(matches!(
            events[..],
            [PeerEvent::PieceFailed {
                error: TorrentError::PieceHashMismatch { .. },
                ..
            }]
        ));
        assert!(fixture.connection.current_piece().is_none());
    }

    #[test]
    fn test_stale_offset_is_discarded() {
        let mut fixture = fixture();
        established(&mut fixture);
        fixture.connection.start_piece_download(PieceIndex::new(0), 0);
        let _ = fixture.connection.take_outgoing();

        let first = block(&fixture, 0, 0, BLOCK_SIZE);
        fixture.connection.receive(&wire(&[first.clone()])).unwrap();
        let _ = fixture.connection.take_outgoing();

        // Duplicate delivery of block 0 neither advances nor restarts the piece
        let events = fixture.connection.receive(&wire(&[first])).unwrap();
        assert!(events.is_empty());
        assert!(!fixture.connection.has_outgoing());
        assert_eq!(fixture.connection.current_piece(), Some(PieceIndex::new(0)));

        let second = block(&fixture, 0, BLOCK_SIZE, BLOCK_SIZE);
        let events = fixture.connection.receive(&wire(&[second])).unwrap();
        assert!(matches!(events[..], [PeerEvent::PieceDownloaded { .. }]));
    }

    #[test]
    fn test_choke_pauses_requests_without_cancelling() {
        let mut fixture = fixture();
        established(&mut fixture);
        fixture.connection.start_piece_download(PieceIndex::new(0), 0);
        let _ = fixture.connection.take_outgoing();

        let first = block(&fixture, 0, 0, BLOCK_SIZE);
        let events = fixture
            .connection
            .receive(&wire(&[PeerMessage::Choke, first]))
            .unwrap();

        assert!(matches!(events[..], [PeerEvent::ChokeChanged { choking: true }]));
        assert!(fixture.connection.peer_choking());
        assert_eq!(fixture.connection.current_piece(), Some(PieceIndex::new(0)));
        assert!(!fixture.connection.has_outgoing());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut fixture = fixture();
        established(&mut fixture);

        fixture.connection.cancel_current_download();
        assert!(!fixture.connection.has_outgoing());

        fixture.connection.start_piece_download(PieceIndex::new(0), 0);
        let _ = fixture.connection.take_outgoing();
        fixture.connection.cancel_current_download();
        fixture.connection.cancel_current_download();

        assert_eq!(
            decode_outgoing(&mut fixture.connection),
            vec![PeerMessage::Cancel {
                piece_index: PieceIndex::new(0),
                offset: 0,
                length: BLOCK_SIZE,
            }]
        );
        assert!(fixture.connection.current_piece().is_none());

        // A fresh start begins at offset 0 again
        assert!(fixture.connection.start_piece_download(PieceIndex::new(0), 3));
        assert_eq!(
            decode_outgoing(&mut fixture.connection).last(),
            Some(&PeerMessage::Request {
                piece_index: PieceIndex::new(0),
                offset: 0,
                length: BLOCK_SIZE,
            })
        );
    }

    #[test]
    fn test_unknown_message_keeps_connection() {
        let mut fixture = fixture();
        established(&mut fixture);

        let mut bytes = BytesMut::from(&[0u8, 0, 0, 2, 42, 0][..]);
        bytes.extend_from_slice(&wire(&[PeerMessage::Interested]));
        let events = fixture.connection.receive(&bytes).unwrap();

        assert!(events.is_empty());
        assert!(fixture.connection.peer_interested());
    }

    #[test]
    fn test_data_before_connect_is_rejected() {
        let mut fixture = fixture();
        assert!(fixture.connection.receive(&[0, 0, 0, 0]).is_err());
    }
}
