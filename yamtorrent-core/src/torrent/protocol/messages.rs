//! Length-prefixed peer message framing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Largest frame accepted from a peer. A 16 KiB block plus headers is far
/// below this; anything bigger is treated as a corrupt length prefix.
pub const MAX_FRAME_LENGTH: usize = 1 << 21;

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;
const PORT: u8 = 9;

/// Codec for the `<u32 length><u8 id><payload>` messages following the
/// handshake.
///
/// Decoding returns `Ok(None)` while fewer than `4 + length` bytes are
/// buffered and otherwise removes exactly one frame from the front of the
/// buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Appends the wire form of `message` to `buf`.
    pub fn write_message(message: &PeerMessage, buf: &mut BytesMut) {
        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(HAVE);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(BITFIELD);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(REQUEST);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(PIECE);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(CANCEL);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(PORT);
                buf.put_u16(*port);
            }
            PeerMessage::Unknown { message_id } => {
                buf.put_u32(1);
                buf.put_u8(*message_id);
            }
        }
    }

    /// Returns the wire form of `message`.
    pub fn serialize_message(message: &PeerMessage) -> Bytes {
        let mut buf = BytesMut::new();
        Self::write_message(message, &mut buf);
        buf.freeze()
    }

    /// Parses a complete frame body (everything after the length prefix).
    fn parse_body(mut body: Bytes) -> Result<PeerMessage, TorrentError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let message_id = body.get_u8();
        let payload_length = body.len();

        let expect_length = |expected: usize, name: &str| {
            if payload_length == expected {
                Ok(())
            } else {
                Err(TorrentError::ProtocolError {
                    message: format!(
                        "Invalid {name} message length: {payload_length} payload bytes"
                    ),
                })
            }
        };

        let message = match message_id {
            CHOKE => {
                expect_length(0, "Choke")?;
                PeerMessage::Choke
            }
            UNCHOKE => {
                expect_length(0, "Unchoke")?;
                PeerMessage::Unchoke
            }
            INTERESTED => {
                expect_length(0, "Interested")?;
                PeerMessage::Interested
            }
            NOT_INTERESTED => {
                expect_length(0, "NotInterested")?;
                PeerMessage::NotInterested
            }
            HAVE => {
                expect_length(4, "Have")?;
                PeerMessage::Have {
                    piece_index: PieceIndex::new(body.get_u32()),
                }
            }
            BITFIELD => PeerMessage::Bitfield { bitfield: body },
            REQUEST | CANCEL => {
                expect_length(12, if message_id == REQUEST { "Request" } else { "Cancel" })?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                if message_id == REQUEST {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                }
            }
            PIECE => {
                if payload_length < 8 {
                    return Err(TorrentError::ProtocolError {
                        message: "Invalid Piece message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                }
            }
            PORT => {
                expect_length(2, "Port")?;
                PeerMessage::Port {
                    port: body.get_u16(),
                }
            }
            message_id => PeerMessage::Unknown { message_id },
        };

        Ok(message)
    }
}

impl Decoder for MessageCodec {
    type Item = PeerMessage;
    type Error = TorrentError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // Peek so a partial frame leaves the buffer untouched
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::ProtocolError {
                message: format!("Frame length {length} exceeds limit"),
            });
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let body = buf.split_to(length).freeze();
        Self::parse_body(body).map(Some)
    }
}

impl Encoder<PeerMessage> for MessageCodec {
    type Error = TorrentError;

    fn encode(&mut self, item: PeerMessage, buf: &mut BytesMut) -> Result<(), Self::Error> {
        Self::write_message(&item, buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<PeerMessage> {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            frames.push(message);
        }
        assert!(buf.is_empty());
        frames
    }

    #[test]
    fn test_fixed_message_layouts() {
        assert_eq!(
            &MessageCodec::serialize_message(&PeerMessage::KeepAlive)[..],
            &[0, 0, 0, 0]
        );
        assert_eq!(
            &MessageCodec::serialize_message(&PeerMessage::Interested)[..],
            &[0, 0, 0, 1, 2]
        );
        assert_eq!(
            &MessageCodec::serialize_message(&PeerMessage::Have {
                piece_index: PieceIndex::new(0x0102_0304)
            })[..],
            &[0, 0, 0, 5, 4, 1, 2, 3, 4]
        );
        assert_eq!(
            &MessageCodec::serialize_message(&PeerMessage::Request {
                piece_index: PieceIndex::new(1),
                offset: 16_384,
                length: 16_384,
            })[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(
            &MessageCodec::serialize_message(&PeerMessage::Port { port: 6881 })[..],
            &[0, 0, 0, 3, 9, 0x1A, 0xE1]
        );
    }

    #[test]
    fn test_decode_every_known_type() {
        let messages = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have {
                piece_index: PieceIndex::new(7),
            },
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000]),
            },
            PeerMessage::Request {
                piece_index: PieceIndex::new(2),
                offset: 0,
                length: 10,
            },
            PeerMessage::Piece {
                piece_index: PieceIndex::new(2),
                offset: 0,
                data: Bytes::from_static(b"0123456789"),
            },
            PeerMessage::Cancel {
                piece_index: PieceIndex::new(2),
                offset: 0,
                length: 10,
            },
            PeerMessage::Port { port: 51413 },
        ];

        let mut wire = BytesMut::new();
        for message in &messages {
            MessageCodec::write_message(message, &mut wire);
        }

        assert_eq!(decode_all(&wire), messages);
    }

    #[test]
    fn test_partial_frame_is_left_in_buffer() {
        let wire = MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(3),
        });
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(&wire[..6]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&wire[6..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(PeerMessage::Have {
                piece_index: PieceIndex::new(3)
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_identifier_consumes_frame() {
        let frames = decode_all(&[0, 0, 0, 3, 20, 0xAA, 0xBB, 0, 0, 0, 1, 1]);
        assert_eq!(
            frames,
            vec![
                PeerMessage::Unknown { message_id: 20 },
                PeerMessage::Unchoke
            ]
        );
    }

    #[test]
    fn test_malformed_known_frame_is_invalid() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, 4, 0, 1][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TorrentError::ProtocolError { .. })
        ));

        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, 7, 0, 0, 0, 1][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_length_prefix_is_invalid() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(&[0xFFu8, 0xFF, 0xFF, 0xFF][..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
