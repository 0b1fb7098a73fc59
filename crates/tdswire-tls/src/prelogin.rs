//! PRELOGIN framing for the TLS handshake.
//!
//! TDS 7.x runs the TLS handshake inside the already-framed protocol: each
//! handshake flight travels as a PRELOGIN message and the server answers
//! the same way. [`PreloginStream`] sits between rustls and the socket,
//! wrapping outgoing flights into PRELOGIN packets and stripping packet
//! headers from incoming data. Once the handshake completes it is switched
//! to pass-through and all later TLS records go out unframed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tdswire_protocol::packet::{PACKET_HEADER_SIZE, PacketType};
use tdswire_protocol::packetize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream adapter that frames handshake bytes as PRELOGIN packets.
#[derive(Debug)]
pub struct PreloginStream<S> {
    stream: S,
    handshaking: bool,
    packet_size: usize,

    header: [u8; PACKET_HEADER_SIZE],
    header_len: usize,
    read_remaining: usize,

    pending: BytesMut,
    outgoing: BytesMut,
}

impl<S> PreloginStream<S> {
    /// Wrap `stream`, framing writes in packets of at most `packet_size`.
    pub fn new(stream: S, packet_size: usize) -> Self {
        Self {
            stream,
            handshaking: true,
            packet_size,
            header: [0; PACKET_HEADER_SIZE],
            header_len: 0,
            read_remaining: 0,
            pending: BytesMut::new(),
            outgoing: BytesMut::new(),
        }
    }

    /// Stop framing. Later reads and writes go straight to the stream.
    pub fn handshake_complete(&mut self) {
        tracing::trace!("PRELOGIN framing switched to pass-through");
        self.handshaking = false;
    }

    /// Whether the handshake framing is still active.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consume the wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> PreloginStream<S> {
    /// Read packet headers until one with payload is open.
    ///
    /// Returns `false` at a clean end of stream.
    fn poll_open_packet(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        while self.read_remaining == 0 {
            while self.header_len < PACKET_HEADER_SIZE {
                let mut buf = ReadBuf::new(&mut self.header[self.header_len..]);
                ready!(Pin::new(&mut self.stream).poll_read(cx, &mut buf))?;
                let n = buf.filled().len();
                if n == 0 {
                    if self.header_len == 0 {
                        return Poll::Ready(Ok(false));
                    }
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                self.header_len += n;
            }
            self.header_len = 0;

            if self.header[0] != PacketType::PreLogin as u8 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "expected PRELOGIN packet during TLS handshake, got 0x{:02X}",
                        self.header[0]
                    ),
                )));
            }
            let length = usize::from(u16::from_be_bytes([self.header[2], self.header[3]]));
            if length < PACKET_HEADER_SIZE {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("PRELOGIN packet length {length} below header size"),
                )));
            }
            self.read_remaining = length - PACKET_HEADER_SIZE;
            tracing::trace!(payload = self.read_remaining, "handshake packet from server");
        }
        Poll::Ready(Ok(true))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PreloginStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.handshaking {
            return Pin::new(&mut this.stream).poll_read(cx, buf);
        }

        if !ready!(this.poll_open_packet(cx))? {
            return Poll::Ready(Ok(()));
        }

        let mut scratch = [0u8; 4096];
        let max = this.read_remaining.min(buf.remaining()).min(scratch.len());
        if max == 0 {
            return Poll::Ready(Ok(()));
        }
        let mut limited = ReadBuf::new(&mut scratch[..max]);
        ready!(Pin::new(&mut this.stream).poll_read(cx, &mut limited))?;
        let n = limited.filled().len();
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.put_slice(limited.filled());
        this.read_remaining -= n;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PreloginStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.handshaking {
            return Pin::new(&mut this.stream).poll_write(cx, buf);
        }
        this.pending.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.outgoing.is_empty() && !this.pending.is_empty() {
            let flight = this.pending.split();
            let packets = packetize(PacketType::PreLogin, &flight, this.packet_size, false);
            tracing::trace!(
                bytes = flight.len(),
                packets = packets.len(),
                "handshake flight to server"
            );
            for packet in packets {
                packet.encode(&mut this.outgoing);
            }
        }

        while !this.outgoing.is_empty() {
            let n = ready!(Pin::new(&mut this.stream).poll_write(cx, &this.outgoing))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.outgoing.advance(n);
        }

        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn prelogin_packets(payload: &[u8], packet_size: usize) -> Vec<u8> {
        let mut out = BytesMut::new();
        for p in packetize(PacketType::PreLogin, payload, packet_size, false) {
            p.encode(&mut out);
        }
        out.to_vec()
    }

    #[tokio::test]
    async fn test_flight_split_by_packet_size() {
        let (client, mut server) = duplex(64 * 1024);
        let mut stream = PreloginStream::new(client, 512);
        let flight = vec![0x16u8; 1000];
        stream.write_all(&flight[..300]).await.unwrap();
        stream.write_all(&flight[300..]).await.unwrap();
        stream.flush().await.unwrap();

        let expected = prelogin_packets(&flight, 512);
        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        assert_eq!(got[0], 0x12);
        assert_eq!(got[1], 0x00);
    }

    #[tokio::test]
    async fn test_multi_packet_response_unwrapped() {
        let (client, mut server) = duplex(64 * 1024);
        let mut stream = PreloginStream::new(client, 4096);
        let reply: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        server.write_all(&prelogin_packets(&reply, 1024)).await.unwrap();

        let mut got = vec![0u8; reply.len()];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, reply);
    }

    #[tokio::test]
    async fn test_other_packet_type_rejected() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0x04, 0x01, 0x00, 0x09, 0x00, 0x00, 0x01, 0x00, 0xFF])
            .build();
        let mut stream = PreloginStream::new(mock, 4096);
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_pass_through_after_handshake() {
        let (client, mut server) = duplex(1024);
        let mut stream = PreloginStream::new(client, 4096);
        stream.handshake_complete();
        assert!(!stream.is_handshaking());

        stream.write_all(b"\x17\x03\x03record").await.unwrap();
        stream.flush().await.unwrap();
        let mut got = [0u8; 9];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"\x17\x03\x03record");

        server.write_all(b"reply").await.unwrap();
        let mut got = [0u8; 5];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"reply");
    }
}
