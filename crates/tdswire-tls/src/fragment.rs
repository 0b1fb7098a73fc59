//! Caps TLS plaintext writes to the negotiated packet size.
//!
//! The rustls `max_fragment_size` is fixed when the client config is
//! built. When the server later changes the packet size, the limiter
//! shortens each write handed to the TLS stream so no record carries more
//! than one packet's worth of plaintext.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Smallest fragment rustls accepts.
pub const MIN_FRAGMENT_SIZE: usize = 32;

/// Largest TLS record plaintext.
pub const MAX_FRAGMENT_SIZE: usize = 16384;

/// Fragment size for a packet size.
#[must_use]
pub fn fragment_size_for(packet_size: usize) -> usize {
    packet_size.clamp(MIN_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE)
}

/// Shared handle to a fragment limit.
#[derive(Debug, Clone)]
pub struct FragmentLimit(Arc<AtomicUsize>);

impl FragmentLimit {
    /// Create a limit for the given packet size.
    #[must_use]
    pub fn new(packet_size: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(fragment_size_for(packet_size))))
    }

    /// Apply a new packet size.
    pub fn set_packet_size(&self, packet_size: usize) {
        let size = fragment_size_for(packet_size);
        tracing::debug!(fragment_size = size, "TLS fragment limit updated");
        self.0.store(size, Ordering::Release);
    }

    /// Current limit in bytes.
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

pin_project! {
    /// Stream wrapper that truncates each write to the current limit.
    #[derive(Debug)]
    pub struct FragmentLimited<S> {
        #[pin]
        inner: S,
        limit: FragmentLimit,
    }
}

impl<S> FragmentLimited<S> {
    /// Wrap `inner`.
    pub fn new(inner: S, limit: FragmentLimit) -> Self {
        Self { inner, limit }
    }

    /// Handle for updating the limit.
    #[must_use]
    pub fn limit(&self) -> &FragmentLimit {
        &self.limit
    }

    /// Get a reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the wrapped stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: AsyncRead> AsyncRead for FragmentLimited<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for FragmentLimited<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = buf.len().min(this.limit.get());
        this.inner.poll_write(cx, &buf[..n])
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_fragment_size_clamped() {
        assert_eq!(fragment_size_for(4096), 4096);
        assert_eq!(fragment_size_for(32767), MAX_FRAGMENT_SIZE);
        assert_eq!(fragment_size_for(8), MIN_FRAGMENT_SIZE);
    }

    #[tokio::test]
    async fn test_writes_are_capped() {
        let mock = tokio_test::io::Builder::new()
            .write(&[1u8; 512])
            .write(&[1u8; 100])
            .build();
        let limit = FragmentLimit::new(512);
        let mut stream = FragmentLimited::new(mock, limit.clone());
        assert_eq!(stream.write(&[1u8; 612]).await.unwrap(), 512);
        stream.write_all(&[1u8; 100]).await.unwrap();
    }

    #[tokio::test]
    async fn test_limit_change_applies_to_next_write() {
        let mock = tokio_test::io::Builder::new()
            .write(&[2u8; 4096])
            .write(&[2u8; 1000])
            .build();
        let limit = FragmentLimit::new(32767);
        let mut stream = FragmentLimited::new(mock, limit.clone());
        limit.set_packet_size(4096);
        assert_eq!(stream.write(&[2u8; 5096]).await.unwrap(), 4096);
        stream.write_all(&[2u8; 1000]).await.unwrap();
    }
}
