//! TDS packet codec for `tokio_util` framing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Buf, BytesMut};
use tdswire_protocol::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, Packet, PacketHeader};
use tdswire_protocol::ProtocolError;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// Packet codec.
///
/// Outbound packets are held to the negotiated packet size. Inbound
/// packets are only held to the protocol maximum, since the server may use
/// its own size before the packet-size ENVCHANGE arrives. Clones share the
/// limit, so the reader and writer halves of a split transport see a
/// packet-size change at the same time.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: Arc<AtomicUsize>,
}

impl PacketCodec {
    /// Create a codec sending packets of up to `max_packet_size` bytes.
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: Arc::new(AtomicUsize::new(max_packet_size)),
        }
    }

    /// Current outbound packet size limit.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size.load(Ordering::Acquire)
    }

    /// Change the outbound packet size limit.
    pub fn set_max_packet_size(&self, size: usize) {
        self.max_packet_size.store(size, Ordering::Release);
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::decode(&mut &src[..PACKET_HEADER_SIZE])?;
        let length = header.length as usize;
        if length > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                length,
                max: MAX_PACKET_SIZE,
            }
            .into());
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut bytes = src.split_to(length);
        bytes.advance(PACKET_HEADER_SIZE);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length,
            packet_id = header.packet_id,
            is_eom = header.is_end_of_message(),
            "decoded packet"
        );

        Ok(Some(Packet::new(header, bytes.freeze())))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.len();
        let max = self.max_packet_size();
        if length > max {
            return Err(ProtocolError::PacketTooLarge { length, max }.into());
        }
        dst.reserve(length);
        item.encode(dst);

        tracing::trace!(
            packet_type = ?item.header.packet_type,
            length,
            packet_id = item.header.packet_id,
            status = item.header.status.bits(),
            "encoded packet"
        );
        Ok(())
    }
}
