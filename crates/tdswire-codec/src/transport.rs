//! Packet transport over an async byte stream.
//!
//! The transport runs in one of two modes. In direct mode reads and writes
//! go straight through a [`Framed`] stream; this is the mode used before
//! and during the TLS handshake, because the stream can be taken back with
//! [`Transport::into_inner`]. After login the transport is switched to
//! pumped mode: a background task reads packets into a bounded channel so
//! inbound flow pauses when the consumer falls behind.

use std::fmt;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::sink::Sink;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tdswire_protocol::packet::{Packet, PacketHeader, PacketStatus, PacketType};
use tdswire_protocol::{packetize, validate_packet_size};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::error::{CodecError, SourceError};
use crate::message::{Message, MessageAssembler, PacketFramer};
use crate::packet_codec::PacketCodec;

/// Callback run after the packet size changes.
pub type PacketSizeListener = Box<dyn Fn(usize) + Send + Sync>;

type Inbound = mpsc::Receiver<Result<Packet, CodecError>>;

enum Mode<S> {
    Direct(Framed<S, PacketCodec>),
    Pumped {
        writer: SplitSink<Framed<S, PacketCodec>, Packet>,
        inbound: Inbound,
        pump: JoinHandle<()>,
    },
    Closed,
}

/// Packet-level connection to a server.
///
/// `read_packet` and `read_message` are cancel-safe: a partially assembled
/// message survives a dropped read future.
pub struct Transport<S> {
    mode: Mode<S>,
    codec: PacketCodec,
    packet_size: usize,
    assembler: MessageAssembler,
    on_packet_size: Option<PacketSizeListener>,
}

impl<S> fmt::Debug for Transport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Mode::Direct(_) => "direct",
            Mode::Pumped { .. } => "pumped",
            Mode::Closed => "closed",
        };
        f.debug_struct("Transport")
            .field("mode", &mode)
            .field("packet_size", &self.packet_size)
            .field("partial_message", &self.assembler.buffered_len())
            .finish_non_exhaustive()
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `io` in direct mode.
    pub fn new(io: S, packet_size: usize) -> Self {
        let codec = PacketCodec::new(packet_size);
        Self {
            mode: Mode::Direct(Framed::new(io, codec.clone())),
            codec,
            packet_size,
            assembler: MessageAssembler::new(),
            on_packet_size: None,
        }
    }

    /// Current packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Whether the inbound pump is running.
    #[must_use]
    pub fn is_pumped(&self) -> bool {
        matches!(self.mode, Mode::Pumped { .. })
    }

    /// Whether the transport has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.mode, Mode::Closed)
    }

    /// Register a callback for packet size changes.
    pub fn on_packet_size_change(&mut self, listener: PacketSizeListener) {
        self.on_packet_size = Some(listener);
    }

    /// Apply a negotiated packet size to both directions.
    pub fn set_packet_size(&mut self, size: usize) -> Result<(), CodecError> {
        let size = validate_packet_size(size)?;
        if size == self.packet_size {
            return Ok(());
        }
        tracing::debug!(from = self.packet_size, to = size, "packet size changed");
        self.packet_size = size;
        self.codec.set_max_packet_size(size);
        if let Some(listener) = &self.on_packet_size {
            listener(size);
        }
        Ok(())
    }

    /// Send a whole message.
    pub async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        let packets = packetize(packet_type, payload, self.packet_size, false);
        self.send_packets(packets).await
    }

    /// Send a whole message with the reset-connection bit set.
    pub async fn send_message_with_reset(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        let packets = packetize(packet_type, payload, self.packet_size, true);
        self.send_packets(packets).await
    }

    /// Send a message whose bytes come from a stream.
    ///
    /// Packets go out as soon as they fill. If the source fails, the
    /// message is closed with an IGNORE packet and the source error is
    /// returned as [`CodecError::Source`].
    pub async fn send_message_stream<St, E>(
        &mut self,
        packet_type: PacketType,
        source: St,
        reset: bool,
    ) -> Result<(), CodecError>
    where
        St: Stream<Item = Result<Bytes, E>>,
        E: Into<SourceError>,
    {
        tokio::pin!(source);
        let mut framer = PacketFramer::new(packet_type, self.packet_size, reset);
        while let Some(item) = source.next().await {
            match item {
                Ok(chunk) => {
                    let packets = framer.push(&chunk);
                    if !packets.is_empty() {
                        self.send_packets(packets).await?;
                    }
                }
                Err(e) => {
                    let e = e.into();
                    tracing::warn!(?packet_type, error = %e, "message source failed; sending IGNORE");
                    self.send_packets([framer.abort()]).await?;
                    return Err(CodecError::Source(e));
                }
            }
        }
        self.send_packets([framer.finish()]).await
    }

    /// Send an ATTENTION signal.
    pub async fn send_attention(&mut self) -> Result<(), CodecError> {
        tracing::debug!("sending attention");
        let header = PacketHeader::new(PacketType::Attention, PacketStatus::END_OF_MESSAGE, 0)
            .with_packet_id(1);
        self.send_packets([Packet::new(header, Bytes::new())]).await
    }

    /// Read the next packet, or `None` at a clean end of stream.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        match &mut self.mode {
            Mode::Direct(framed) => framed.next().await.transpose(),
            Mode::Pumped { inbound, .. } => inbound.recv().await.transpose(),
            Mode::Closed => Ok(None),
        }
    }

    /// Read the next complete message, or `None` at a clean end of stream.
    ///
    /// Messages cancelled by the peer with IGNORE are skipped.
    pub async fn read_message(&mut self) -> Result<Option<Message>, CodecError> {
        loop {
            let Some(packet) = self.read_packet().await? else {
                if self.assembler.has_partial() {
                    self.assembler.clear();
                    return Err(CodecError::ConnectionClosed);
                }
                return Ok(None);
            };
            if let Some(message) = self.assembler.push(packet)? {
                return Ok(Some(message));
            }
        }
    }

    /// Take back the underlying stream.
    ///
    /// Only possible in direct mode with nothing buffered in either
    /// direction.
    pub fn into_inner(mut self) -> Result<S, CodecError> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Direct(framed) => {
                let parts = framed.into_parts();
                if !parts.read_buf.is_empty() {
                    return Err(CodecError::BufferedData(parts.read_buf.len()));
                }
                Ok(parts.io)
            }
            Mode::Pumped { .. } => Err(CodecError::InvalidMode("pumped")),
            Mode::Closed => Err(CodecError::InvalidMode("closed")),
        }
    }

    /// Flush and shut down the stream.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Direct(mut framed) => framed.close().await,
            Mode::Pumped {
                mut writer, pump, ..
            } => {
                pump.abort();
                writer.close().await
            }
            Mode::Closed => Ok(()),
        }
    }

    async fn send_packets(
        &mut self,
        packets: impl IntoIterator<Item = Packet>,
    ) -> Result<(), CodecError> {
        match &mut self.mode {
            Mode::Direct(framed) => feed_all(framed, packets).await,
            Mode::Pumped { writer, .. } => feed_all(writer, packets).await,
            Mode::Closed => Err(CodecError::ConnectionClosed),
        }
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Switch to pumped mode.
    ///
    /// At most `depth` packets are buffered ahead of the consumer; past
    /// that the pump stops reading from the socket.
    pub fn start_pump(&mut self, depth: usize) -> Result<(), CodecError> {
        let framed = match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Direct(framed) => framed,
            other => {
                self.mode = other;
                return Err(CodecError::InvalidMode("already pumped or closed"));
            }
        };
        let (writer, mut reader) = framed.split();
        let (tx, inbound) = mpsc::channel(depth.max(1));
        let pump = tokio::spawn(async move {
            while let Some(item) = reader.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            tracing::trace!("inbound pump finished");
        });
        tracing::debug!(depth, "inbound pump started");
        self.mode = Mode::Pumped {
            writer,
            inbound,
            pump,
        };
        Ok(())
    }
}

impl<S> Drop for Transport<S> {
    fn drop(&mut self) {
        if let Mode::Pumped { pump, .. } = &self.mode {
            pump.abort();
        }
    }
}

async fn feed_all<K>(sink: &mut K, packets: impl IntoIterator<Item = Packet>) -> Result<(), CodecError>
where
    K: Sink<Packet, Error = CodecError> + Unpin,
{
    for packet in packets {
        sink.feed(packet).await?;
    }
    sink.flush().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn raw(packets: &[Packet]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for p in packets {
            p.encode(&mut buf);
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_send_message_splits_at_packet_size() {
        let (client, mut server) = duplex(64 * 1024);
        let mut transport = Transport::new(client, 512);
        let payload = vec![7u8; 1200];
        transport.send_message(PacketType::SqlBatch, &payload).await.unwrap();

        let expected = raw(&packetize(PacketType::SqlBatch, &payload, 512, false));
        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        assert_eq!(got[1], 0x00);
        assert_eq!(&got[2..4], &[0x02, 0x00]);
    }

    #[tokio::test]
    async fn test_read_message_over_small_writes() {
        let (client, mut server) = duplex(16);
        let mut transport = Transport::new(client, 4096);
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let bytes = raw(&packetize(PacketType::TabularResult, &payload, 1024, false));

        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(5) {
                server.write_all(chunk).await.unwrap();
            }
            server
        });
        let message = transport.read_message().await.unwrap().unwrap();
        assert_eq!(message.packet_type, PacketType::TabularResult);
        assert_eq!(&message.payload[..], &payload[..]);
        drop(writer.await.unwrap());
        assert!(transport.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_message_is_error() {
        let (client, mut server) = duplex(4096);
        let mut transport = Transport::new(client, 4096);
        let first = packetize(PacketType::TabularResult, &[1u8; 600], 512, false);
        server.write_all(&raw(&first[..1])).await.unwrap();
        drop(server);
        assert!(matches!(
            transport.read_message().await,
            Err(CodecError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_stream_source_failure_sends_ignore() {
        let (client, mut server) = duplex(64 * 1024);
        let mut transport = Transport::new(client, 512);
        let source = futures_util::stream::iter(vec![
            Ok(Bytes::from(vec![1u8; 700])),
            Err(std::io::Error::other("source broke")),
        ]);
        let err = transport
            .send_message_stream(PacketType::BulkLoad, source, false)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());

        let mut first = vec![0u8; 512];
        server.read_exact(&mut first).await.unwrap();
        assert_eq!(first[1], PacketStatus::NORMAL.bits());
        let mut last = vec![0u8; 8 + 700 - 504];
        server.read_exact(&mut last).await.unwrap();
        assert_eq!(
            last[1],
            (PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE).bits()
        );
    }

    #[tokio::test]
    async fn test_attention_packet() {
        let mock = tokio_test::io::Builder::new()
            .write(&[0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00])
            .build();
        let mut transport = Transport::new(mock, 4096);
        transport.send_attention().await.unwrap();
    }

    #[tokio::test]
    async fn test_pumped_mode_reads_and_writes() {
        let (client, mut server) = duplex(1024);
        let mut transport = Transport::new(client, 4096);
        transport.start_pump(2).unwrap();
        assert!(transport.is_pumped());
        assert!(matches!(transport.start_pump(2), Err(CodecError::InvalidMode(_))));

        let mut bytes = Vec::new();
        for i in 0..5u8 {
            bytes.extend(raw(&packetize(PacketType::TabularResult, &[i; 100], 4096, false)));
        }
        server.write_all(&bytes).await.unwrap();
        for i in 0..5u8 {
            let m = transport.read_message().await.unwrap().unwrap();
            assert_eq!(&m.payload[..], &[i; 100][..]);
        }

        transport.send_message(PacketType::SqlBatch, b"x").await.unwrap();
        let mut got = [0u8; 9];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got[8], b'x');
    }

    #[tokio::test]
    async fn test_packet_size_change_notifies_listener() {
        let (client, _server) = duplex(1024);
        let mut transport = Transport::new(client, 4096);
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        transport.on_packet_size_change(Box::new(move |size| sink.store(size, Ordering::SeqCst)));

        transport.set_packet_size(8000).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 8000);
        assert_eq!(transport.packet_size(), 8000);
        assert!(transport.set_packet_size(100).is_err());
        assert_eq!(transport.packet_size(), 8000);
    }

    #[tokio::test]
    async fn test_into_inner_refuses_buffered_bytes() {
        let (client, mut server) = duplex(4096);
        let mut transport = Transport::new(client, 4096);
        let mut bytes = raw(&packetize(PacketType::PreLogin, b"one", 4096, false));
        bytes.extend(raw(&packetize(PacketType::PreLogin, b"two", 4096, false)));
        server.write_all(&bytes).await.unwrap();
        transport.read_message().await.unwrap().unwrap();
        assert!(matches!(transport.into_inner(), Err(CodecError::BufferedData(11))));
    }
}
