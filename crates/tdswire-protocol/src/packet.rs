//! TDS packet header definitions.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Largest packet size the server negotiates.
pub const MAX_PACKET_SIZE: usize = 32767;

/// Smallest packet size the server negotiates.
pub const MIN_PACKET_SIZE: usize = 512;

/// Default TDS packet size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Tabular response.
    TabularResult = 0x04,
    /// Attention signal.
    Attention = 0x06,
    /// Bulk load data.
    BulkLoad = 0x07,
    /// Federated authentication token.
    FedAuthToken = 0x08,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// TDS7+ login packet.
    Login7 = 0x10,
    /// SSPI authentication.
    Sspi = 0x11,
    /// Pre-login packet, also carries the TLS handshake.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::SqlBatch),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::TabularResult),
            0x06 => Ok(Self::Attention),
            0x07 => Ok(Self::BulkLoad),
            0x08 => Ok(Self::FedAuthToken),
            0x0E => Ok(Self::TransactionManager),
            0x10 => Ok(Self::Login7),
            0x11 => Ok(Self::Sspi),
            0x12 => Ok(Self::PreLogin),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Normal packet, more packets to follow.
        const NORMAL = 0x00;
        /// End of message (last packet).
        const END_OF_MESSAGE = 0x01;
        /// Discard the message this packet ends. Only valid with
        /// `END_OF_MESSAGE`.
        const IGNORE = 0x02;
        /// Reset connection before processing the message.
        const RESET_CONNECTION = 0x08;
        /// Reset connection but keep transaction state.
        const RESET_CONNECTION_SKIP_TRAN = 0x10;
    }
}

/// TDS packet header.
///
/// Every TDS packet begins with an 8-byte header that describes
/// the packet type, status, and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header.
    pub length: u16,
    /// Server process ID (SPID).
    pub spid: u16,
    /// Packet sequence number (wraps at 255).
    pub packet_id: u8,
    /// Window (unused, should be 0).
    pub window: u8,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Parse a packet header from exactly [`PACKET_HEADER_SIZE`] bytes.
    ///
    /// The caller guarantees that enough bytes are buffered. A declared
    /// length below the header size or an `IGNORE` bit without
    /// `END_OF_MESSAGE` is malformed.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status_byte = src.get_u8();
        let status = PacketStatus::from_bits(status_byte)
            .ok_or(ProtocolError::InvalidPacketStatus(status_byte))?;
        if status.contains(PacketStatus::IGNORE) && !status.contains(PacketStatus::END_OF_MESSAGE) {
            return Err(ProtocolError::InvalidPacketStatus(status_byte));
        }
        let length = src.get_u16();
        if (length as usize) < PACKET_HEADER_SIZE {
            return Err(ProtocolError::InvalidPacketLength(length));
        }
        let spid = src.get_u16();
        let packet_id = src.get_u8();
        let window = src.get_u8();

        Ok(Self {
            packet_type,
            status,
            length,
            spid,
            packet_id,
            window,
        })
    }

    /// Encode the packet header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Encode the packet header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Check if the peer asked for this message to be discarded.
    #[must_use]
    pub const fn is_ignore(&self) -> bool {
        self.status.contains(PacketStatus::IGNORE)
    }

    /// Set the packet ID (sequence number).
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }
}

/// One framed packet: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Payload bytes (header excluded).
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet, fixing up the header length to match the payload.
    #[must_use]
    pub fn new(mut header: PacketHeader, payload: Bytes) -> Self {
        header.length = (PACKET_HEADER_SIZE + payload.len()) as u16;
        Self { header, payload }
    }

    /// Total encoded size.
    #[must_use]
    pub fn len(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode header and payload.
    pub fn encode(&self, dst: &mut impl BufMut) {
        self.header.encode(dst);
        dst.put_slice(&self.payload);
    }
}

/// Validate a negotiated packet size.
pub fn validate_packet_size(size: usize) -> Result<usize, ProtocolError> {
    if (MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        Ok(size)
    } else {
        Err(ProtocolError::InvalidPacketSize(size))
    }
}

/// Split a message payload into packets of at most `packet_size` bytes.
///
/// Packet ids start at 1 and wrap from 255 to 0. Only the last packet
/// carries `END_OF_MESSAGE`; `reset` sets the reset-connection bit on the
/// first packet. An empty payload still yields one packet.
#[must_use]
pub fn packetize(
    packet_type: PacketType,
    payload: &[u8],
    packet_size: usize,
    reset: bool,
) -> Vec<Packet> {
    let body = packet_size.saturating_sub(PACKET_HEADER_SIZE).max(1);
    let mut packets = Vec::with_capacity(payload.len() / body + 1);
    let mut chunks = payload.chunks(body).peekable();
    let mut packet_id: u8 = 1;

    if chunks.peek().is_none() {
        let status = if reset {
            PacketStatus::END_OF_MESSAGE | PacketStatus::RESET_CONNECTION
        } else {
            PacketStatus::END_OF_MESSAGE
        };
        let header = PacketHeader::new(packet_type, status, 0).with_packet_id(packet_id);
        packets.push(Packet::new(header, Bytes::new()));
        return packets;
    }

    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let mut status = if chunks.peek().is_none() {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        if first && reset {
            status |= PacketStatus::RESET_CONNECTION;
        }
        let header = PacketHeader::new(packet_type, status, 0).with_packet_id(packet_id);
        packets.push(Packet::new(header, Bytes::copy_from_slice(chunk)));
        packet_id = packet_id.wrapping_add(1);
        first = false;
    }
    packets
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            packet_type: PacketType::SqlBatch,
            status: PacketStatus::END_OF_MESSAGE,
            length: 100,
            spid: 54,
            packet_id: 1,
            window: 0,
        };

        let bytes = header.encode_to_bytes();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);

        let mut cursor = bytes.as_ref();
        let decoded = PacketHeader::decode(&mut cursor).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_length_shorter_than_header_is_fatal() {
        let bytes = [0x04, 0x01, 0x00, 0x07, 0, 0, 1, 0];
        assert_eq!(
            PacketHeader::decode(&mut &bytes[..]).unwrap_err(),
            ProtocolError::InvalidPacketLength(7)
        );
    }

    #[test]
    fn test_ignore_requires_end_of_message() {
        let bytes = [0x04, 0x02, 0x00, 0x08, 0, 0, 1, 0];
        assert!(matches!(
            PacketHeader::decode(&mut &bytes[..]),
            Err(ProtocolError::InvalidPacketStatus(0x02))
        ));
    }

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(0x01).unwrap(), PacketType::SqlBatch);
        assert_eq!(PacketType::from_u8(0x12).unwrap(), PacketType::PreLogin);
        assert!(PacketType::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_packetize_splits_and_flags() {
        let payload = vec![7u8; 1000];
        let packets = packetize(PacketType::SqlBatch, &payload, 512, true);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 512);
        assert_eq!(packets[0].header.packet_id, 1);
        assert_eq!(
            packets[0].header.status,
            PacketStatus::NORMAL | PacketStatus::RESET_CONNECTION
        );
        assert_eq!(packets[1].header.packet_id, 2);
        assert_eq!(packets[1].header.status, PacketStatus::END_OF_MESSAGE);
        assert_eq!(packets[1].payload.len(), 1000 - 504);
    }

    #[test]
    fn test_packetize_empty_payload() {
        let packets = packetize(PacketType::Attention, &[], 4096, false);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.length as usize, PACKET_HEADER_SIZE);
        assert!(packets[0].header.is_end_of_message());
    }

    #[test]
    fn test_packet_ids_wrap() {
        let payload = vec![0u8; 300];
        let packets = packetize(PacketType::Rpc, &payload, 9, false);
        assert_eq!(packets.len(), 300);
        assert_eq!(packets[254].header.packet_id, 255);
        assert_eq!(packets[255].header.packet_id, 0);
        assert_eq!(packets[256].header.packet_id, 1);
    }

    #[test]
    fn test_validate_packet_size() {
        assert!(validate_packet_size(4096).is_ok());
        assert!(validate_packet_size(511).is_err());
        assert!(validate_packet_size(32768).is_err());
    }
}
