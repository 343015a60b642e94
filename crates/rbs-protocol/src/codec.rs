use std::io::{Read, Write};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Envelope, MAX_MESSAGE_SIZE};

/// Length of the frame header: 4-byte big-endian length, then a 1-byte tag.
pub const HEADER_LEN: usize = 5;

/// Codec for encoding/decoding framed protocol envelopes.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode an envelope with framing: [4 bytes len][1 byte tag][payload]
    ///
    /// `len` counts the tag byte plus the payload.
    pub fn encode(msg: &Envelope) -> ProtocolResult<Vec<u8>> {
        let payload = Self::encode_payload(msg)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(msg.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a framed envelope. Returns (envelope, bytes_consumed).
    pub fn decode(data: &[u8]) -> ProtocolResult<(Envelope, usize)> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&data[..HEADER_LEN]);
        let (payload_len, tag) = Self::parse_header(&header)?;
        let total = HEADER_LEN + payload_len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let msg = Self::decode_tagged(tag, &data[HEADER_LEN..total])?;
        Ok((msg, total))
    }

    /// Validate a frame header and return (payload length, tag).
    pub fn parse_header(header: &[u8; HEADER_LEN]) -> ProtocolResult<(usize, u8)> {
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len < 1 {
            return Err(ProtocolError::FramingError("zero-length frame".into()));
        }
        if len - 1 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len - 1,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let tag = header[4];
        if !matches!(tag, 1..=3) {
            return Err(ProtocolError::InvalidMessageType(tag));
        }
        Ok((len - 1, tag))
    }

    /// Decode a payload and check it matches the tag from its header.
    pub fn decode_tagged(tag: u8, payload: &[u8]) -> ProtocolResult<Envelope> {
        let msg = Self::decode_payload(payload)?;
        if msg.type_tag() != tag {
            return Err(ProtocolError::FramingError(format!(
                "tag {tag} does not match {} payload",
                msg.type_name()
            )));
        }
        Ok(msg)
    }

    /// Encode payload only (no framing).
    pub fn encode_payload(msg: &Envelope) -> ProtocolResult<Vec<u8>> {
        bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode payload only (no framing).
    pub fn decode_payload(data: &[u8]) -> ProtocolResult<Envelope> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Write one framed envelope to a blocking writer.
    pub fn write_to<W: Write>(writer: &mut W, msg: &Envelope) -> ProtocolResult<()> {
        let frame = Self::encode(msg)?;
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one framed envelope from a blocking reader.
    pub fn read_from<R: Read>(reader: &mut R) -> ProtocolResult<Envelope> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;
        let (payload_len, tag) = Self::parse_header(&header)?;
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;
        Self::decode_tagged(tag, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;
    use rbs_types::{BlobId, ExporterId, ObjectNum, RemoteRef};

    fn target() -> RemoteRef {
        RemoteRef::new(ExporterId::new(), ObjectNum(3), Some("127.0.0.1:9000".into()))
    }

    #[test]
    fn request_roundtrip() {
        let msg = Envelope::Request {
            seq: 9,
            target: target(),
            call: Call::Put {
                id: Some(BlobId::parse("urn:b:1").unwrap()),
                data: vec![1, 2, 3],
                overwrite: true,
            },
        };
        let encoded = FrameCodec::encode(&msg).unwrap();
        let (decoded, consumed) = FrameCodec::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn fault_kind_survives_the_wire() {
        let msg = Envelope::Response {
            seq: 1,
            reply: Reply::Fault(Fault::new(FaultKind::Unsupported, "needs a transaction")),
        };
        let encoded = FrameCodec::encode(&msg).unwrap();
        let (decoded, _) = FrameCodec::decode(&encoded).unwrap();
        match decoded {
            Envelope::Response { reply: Reply::Fault(f), .. } => {
                assert_eq!(f.kind, FaultKind::Unsupported);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn hello_frames_are_tagged_apart() {
        let hello = Envelope::Hello {
            session: rbs_types::SessionId::new(),
            version: PROTOCOL_VERSION,
        };
        let encoded = FrameCodec::encode(&hello).unwrap();
        assert_eq!(encoded[4], 3);
        let (decoded, _) = FrameCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, hello);
        assert_eq!(decoded.seq(), 0);
    }

    #[test]
    fn decode_truncated() {
        let err = FrameCodec::decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn decode_zero_length() {
        let data = [0u8, 0, 0, 0, 1];
        let err = FrameCodec::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn decode_incomplete_payload() {
        let msg = Envelope::Response { seq: 1, reply: Reply::Ok(Value::Unit) };
        let encoded = FrameCodec::encode(&msg).unwrap();
        let err = FrameCodec::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn decode_unknown_tag() {
        let msg = Envelope::Response { seq: 1, reply: Reply::Ok(Value::Unit) };
        let mut encoded = FrameCodec::encode(&msg).unwrap();
        encoded[4] = 77;
        let err = FrameCodec::decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessageType(77)));
    }

    #[test]
    fn decode_mismatched_tag() {
        let msg = Envelope::Response { seq: 1, reply: Reply::Ok(Value::Unit) };
        let mut encoded = FrameCodec::encode(&msg).unwrap();
        encoded[4] = 1;
        let err = FrameCodec::decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn stream_helpers_roundtrip() {
        let first = Envelope::Request { seq: 1, target: target(), call: Call::GetCapabilities };
        let second = Envelope::Response { seq: 1, reply: Reply::Ok(Value::Bool(false)) };
        let mut buf = Vec::new();
        FrameCodec::write_to(&mut buf, &first).unwrap();
        FrameCodec::write_to(&mut buf, &second).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(FrameCodec::read_from(&mut cursor).unwrap(), first);
        assert_eq!(FrameCodec::read_from(&mut cursor).unwrap(), second);
        assert!(matches!(
            FrameCodec::read_from(&mut cursor),
            Err(ProtocolError::Io(_))
        ));
    }
}
