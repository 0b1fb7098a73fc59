//! Message assembly and incremental framing.
//!
//! A TDS message is one or more packets of the same type ending with an
//! `END_OF_MESSAGE` packet. [`MessageAssembler`] joins inbound packets back
//! into messages; [`PacketFramer`] cuts an outbound byte stream into
//! packets without knowing its total length up front.

use bytes::{Bytes, BytesMut};
use tdswire_protocol::packet::{PACKET_HEADER_SIZE, Packet, PacketHeader, PacketStatus, PacketType};

use crate::error::CodecError;

/// A complete TDS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Packet type shared by every packet of the message.
    pub packet_type: PacketType,
    /// Concatenated packet payloads.
    pub payload: Bytes,
}

impl Message {
    /// Total payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Joins packets into messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    packet_type: Option<PacketType>,
    buffer: BytesMut,
    packet_count: usize,
}

impl MessageAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet.
    ///
    /// Returns the message once its last packet arrives. A packet with the
    /// IGNORE bit discards everything collected for the current message.
    pub fn push(&mut self, packet: Packet) -> Result<Option<Message>, CodecError> {
        let packet_type = packet.header.packet_type;
        if let Some(expected) = self.packet_type {
            if expected != packet_type {
                return Err(CodecError::UnexpectedPacketType {
                    expected,
                    actual: packet_type,
                });
            }
        }

        if packet.header.is_ignore() {
            tracing::debug!(
                ?packet_type,
                discarded = self.buffer.len() + packet.payload.len(),
                "peer cancelled message with IGNORE"
            );
            self.clear();
            return Ok(None);
        }

        self.packet_type = Some(packet_type);
        self.buffer.extend_from_slice(&packet.payload);
        self.packet_count += 1;

        if !packet.header.is_end_of_message() {
            return Ok(None);
        }

        tracing::trace!(
            ?packet_type,
            length = self.buffer.len(),
            packets = self.packet_count,
            "assembled message"
        );
        let payload = self.buffer.split().freeze();
        self.packet_type = None;
        self.packet_count = 0;
        Ok(Some(Message {
            packet_type,
            payload,
        }))
    }

    /// Whether a message is partially collected.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.packet_type.is_some()
    }

    /// Bytes collected for the current message.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop the partial message.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.packet_type = None;
        self.packet_count = 0;
    }
}

/// Cuts an outbound message into packets as its bytes arrive.
///
/// Produces the same packets as [`tdswire_protocol::packetize`] for the
/// same payload, whatever the chunking. A packet is only released once
/// more bytes follow it, so the last packet always carries data.
#[derive(Debug)]
pub struct PacketFramer {
    packet_type: PacketType,
    body_size: usize,
    buffer: BytesMut,
    next_id: u8,
    reset: bool,
}

impl PacketFramer {
    /// Create a framer for one message.
    #[must_use]
    pub fn new(packet_type: PacketType, packet_size: usize, reset: bool) -> Self {
        let body_size = packet_size.saturating_sub(PACKET_HEADER_SIZE).max(1);
        Self {
            packet_type,
            body_size,
            buffer: BytesMut::with_capacity(body_size),
            next_id: 1,
            reset,
        }
    }

    /// Append message bytes, returning any packets that are now complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Packet> {
        self.buffer.extend_from_slice(data);
        let mut packets = Vec::new();
        while self.buffer.len() > self.body_size {
            let body = self.buffer.split_to(self.body_size).freeze();
            packets.push(self.packet(PacketStatus::NORMAL, body));
        }
        packets
    }

    /// Close the message normally.
    #[must_use]
    pub fn finish(mut self) -> Packet {
        let body = self.buffer.split().freeze();
        self.packet(PacketStatus::END_OF_MESSAGE, body)
    }

    /// Close the message with the IGNORE bit so the peer discards it.
    #[must_use]
    pub fn abort(mut self) -> Packet {
        let body = self.buffer.split().freeze();
        self.packet(PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE, body)
    }

    fn packet(&mut self, mut status: PacketStatus, body: Bytes) -> Packet {
        if self.reset {
            status |= PacketStatus::RESET_CONNECTION;
            self.reset = false;
        }
        let header = PacketHeader::new(self.packet_type, status, 0).with_packet_id(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        Packet::new(header, body)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tdswire_protocol::packetize;

    fn packet(packet_type: PacketType, status: PacketStatus, payload: &'static [u8]) -> Packet {
        Packet::new(
            PacketHeader::new(packet_type, status, 0),
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn test_single_packet_message() {
        let mut assembler = MessageAssembler::new();
        let msg = assembler
            .push(packet(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, b"hello"))
            .unwrap()
            .unwrap();
        assert_eq!(&msg.payload[..], b"hello");
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_multi_packet_message() {
        let mut assembler = MessageAssembler::new();
        assert!(
            assembler
                .push(packet(PacketType::TabularResult, PacketStatus::NORMAL, b"hello "))
                .unwrap()
                .is_none()
        );
        assert!(assembler.has_partial());
        let msg = assembler
            .push(packet(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, b"world"))
            .unwrap()
            .unwrap();
        assert_eq!(&msg.payload[..], b"hello world");
    }

    #[test]
    fn test_ignore_discards_partial_message() {
        let mut assembler = MessageAssembler::new();
        assembler
            .push(packet(PacketType::SqlBatch, PacketStatus::NORMAL, b"partial"))
            .unwrap();
        let out = assembler
            .push(packet(
                PacketType::SqlBatch,
                PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE,
                b"",
            ))
            .unwrap();
        assert!(out.is_none());
        assert!(!assembler.has_partial());

        let msg = assembler
            .push(packet(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, b"next"))
            .unwrap()
            .unwrap();
        assert_eq!(&msg.payload[..], b"next");
    }

    #[test]
    fn test_mixed_types_rejected() {
        let mut assembler = MessageAssembler::new();
        assembler
            .push(packet(PacketType::TabularResult, PacketStatus::NORMAL, b"a"))
            .unwrap();
        let err = assembler
            .push(packet(PacketType::PreLogin, PacketStatus::END_OF_MESSAGE, b"b"))
            .unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedPacketType { .. }));
    }

    #[test]
    fn test_framer_matches_packetize() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let expected = packetize(PacketType::Rpc, &payload, 512, true);

        let mut framer = PacketFramer::new(PacketType::Rpc, 512, true);
        let mut packets = Vec::new();
        for chunk in payload.chunks(333) {
            packets.extend(framer.push(chunk));
        }
        packets.push(framer.finish());
        assert_eq!(packets, expected);
    }

    #[test]
    fn test_framer_exact_multiple_keeps_data_in_last_packet() {
        let mut framer = PacketFramer::new(PacketType::SqlBatch, 512, false);
        let packets = framer.push(&[1u8; 504 * 2]);
        assert_eq!(packets.len(), 1);
        let last = framer.finish();
        assert_eq!(last.payload.len(), 504);
        assert!(last.header.is_end_of_message());
        assert_eq!(last.header.packet_id, 2);
    }

    #[test]
    fn test_framer_abort_sets_ignore() {
        let mut framer = PacketFramer::new(PacketType::BulkLoad, 4096, false);
        framer.push(b"some rows");
        let last = framer.abort();
        assert!(last.header.is_ignore());
        assert!(last.header.is_end_of_message());
    }
}
