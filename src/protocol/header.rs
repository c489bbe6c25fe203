//! Overlay header and transport datagram header.

use super::{NodeId, ProtocolError, Usage};
use crate::noise::TAG_SIZE;

/// Size of the overlay header inside the encrypted payload.
pub const OVERLAY_HEADER_SIZE: usize = 7;

/// Size of the clear transport header: usage + receiver index + counter.
pub const TRANSPORT_HEADER_SIZE: usize = 13;

/// Smallest valid transport datagram (keepalive: header + tag).
pub const TRANSPORT_MIN_SIZE: usize = TRANSPORT_HEADER_SIZE + TAG_SIZE;

/// 7-byte big-endian overlay header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlayHeader {
    pub dst: NodeId,
    pub src: NodeId,
    pub ttl: u8,
    /// Length of the inner packet that follows the header.
    pub length: u16,
}

impl OverlayHeader {
    pub fn new(src: NodeId, dst: NodeId, ttl: u8, length: u16) -> Self {
        Self {
            dst,
            src,
            ttl,
            length,
        }
    }

    pub fn encode(&self) -> [u8; OVERLAY_HEADER_SIZE] {
        let mut out = [0u8; OVERLAY_HEADER_SIZE];
        self.write_to(&mut out);
        out
    }

    /// Write into the first 7 bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.dst.0.to_be_bytes());
        buf[2..4].copy_from_slice(&self.src.0.to_be_bytes());
        buf[4] = self.ttl;
        buf[5..7].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < OVERLAY_HEADER_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: OVERLAY_HEADER_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            dst: NodeId(u16::from_be_bytes([buf[0], buf[1]])),
            src: NodeId(u16::from_be_bytes([buf[2], buf[3]])),
            ttl: buf[4],
            length: u16::from_be_bytes([buf[5], buf[6]]),
        })
    }

    /// Split a decrypted payload into header and inner packet, trimming
    /// any padding beyond `length`.
    pub fn split(payload: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let header = Self::decode(payload)?;
        let end = OVERLAY_HEADER_SIZE + header.length as usize;
        if payload.len() < end {
            return Err(ProtocolError::MessageTooShort {
                expected: end,
                got: payload.len(),
            });
        }
        Ok((header, &payload[OVERLAY_HEADER_SIZE..end]))
    }

    /// Header followed by `body`.
    pub fn wrap(src: NodeId, dst: NodeId, ttl: u8, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let length = u16::try_from(body.len()).map_err(|_| ProtocolError::MessageTooLong {
            max: u16::MAX as usize,
            got: body.len(),
        })?;
        let mut out = Vec::with_capacity(OVERLAY_HEADER_SIZE + body.len());
        out.extend_from_slice(&Self::new(src, dst, ttl, length).encode());
        out.extend_from_slice(body);
        Ok(out)
    }
}

/// Clear header of a transport datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportHeader {
    pub usage: Usage,
    pub receiver: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub fn encode(&self) -> [u8; TRANSPORT_HEADER_SIZE] {
        let mut out = [0u8; TRANSPORT_HEADER_SIZE];
        out[0] = self.usage.to_byte();
        out[1..5].copy_from_slice(&self.receiver.to_le_bytes());
        out[5..13].copy_from_slice(&self.counter.to_le_bytes());
        out
    }

    /// Parse the header of a transport datagram.
    ///
    /// Returns the header and the ciphertext that follows.
    pub fn parse(datagram: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if datagram.len() < TRANSPORT_MIN_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: TRANSPORT_MIN_SIZE,
                got: datagram.len(),
            });
        }
        let usage = Usage::from_byte(datagram[0])
            .filter(|u| u.is_transport())
            .ok_or(ProtocolError::InvalidUsage(datagram[0]))?;
        let mut receiver = [0u8; 4];
        receiver.copy_from_slice(&datagram[1..5]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&datagram[5..13]);
        Ok((
            Self {
                usage,
                receiver: u32::from_le_bytes(receiver),
                counter: u64::from_le_bytes(counter),
            },
            &datagram[TRANSPORT_HEADER_SIZE..],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_header_big_endian() {
        let h = OverlayHeader::new(NodeId(0x0102), NodeId(0x0304), 9, 0x0506);
        assert_eq!(h.encode(), [0x03, 0x04, 0x01, 0x02, 9, 0x05, 0x06]);
        assert_eq!(OverlayHeader::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn test_split_trims_padding() {
        let mut buf = OverlayHeader::wrap(NodeId(1), NodeId(2), 4, b"abc").unwrap();
        buf.extend_from_slice(&[0u8; 13]);
        let (h, body) = OverlayHeader::split(&buf).unwrap();
        assert_eq!(h.length, 3);
        assert_eq!(body, b"abc");
    }

    #[test]
    fn test_split_rejects_short_body() {
        let mut buf = OverlayHeader::new(NodeId(1), NodeId(2), 4, 10).encode().to_vec();
        buf.extend_from_slice(b"short");
        assert!(OverlayHeader::split(&buf).is_err());
    }

    #[test]
    fn test_transport_header_layout() {
        let h = TransportHeader {
            usage: Usage::NormalPacket,
            receiver: 0xAABBCCDD,
            counter: 1,
        };
        let bytes = h.encode();
        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[1..5], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(&bytes[5..13], &[1, 0, 0, 0, 0, 0, 0, 0]);

        let mut datagram = bytes.to_vec();
        datagram.extend_from_slice(&[0u8; TAG_SIZE]);
        let (parsed, ct) = TransportHeader::parse(&datagram).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(ct.len(), TAG_SIZE);
    }

    #[test]
    fn test_transport_header_rejects_handshake_tag() {
        let mut datagram = vec![0u8; TRANSPORT_MIN_SIZE];
        datagram[0] = Usage::Response.to_byte();
        assert!(matches!(
            TransportHeader::parse(&datagram),
            Err(ProtocolError::InvalidUsage(2))
        ));
    }
}
