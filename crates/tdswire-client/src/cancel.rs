//! Request cancellation.
//!
//! The connection owns the socket, so a [`CancelHandle`] does not write
//! anything itself. It trips a token that the request loop is watching;
//! the loop then sends the ATTENTION packet and waits for its
//! acknowledgment.
//!
//! ## Example
//!
//! ```rust,ignore
//! let cancel = conn.cancel_handle();
//! tokio::spawn(async move {
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     cancel.cancel();
//! });
//!
//! // Fails with ECANCEL if still running after 5 seconds.
//! let result = conn.exec_sql_batch("WAITFOR DELAY '00:01:00'").await;
//! ```
//!
//! - The handle is cloneable and can be shared across tasks
//! - Calling `cancel()` more than once has no additional effect
//! - The connection stays usable once the server acknowledges

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Handle for cancelling the in-flight request on a connection.
#[derive(Clone, Default)]
pub struct CancelHandle {
    slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Cancel the in-flight request.
    ///
    /// Returns `false` when no request is in flight; nothing is queued for
    /// later requests.
    pub fn cancel(&self) -> bool {
        match &*self.slot.lock() {
            Some(token) => {
                tracing::debug!("request cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a request is in flight and has been cancelled.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Install a fresh token for a new request.
    pub(crate) fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.slot.lock() = Some(token.clone());
        token
    }

    /// Clear the slot once the request is over.
    pub(crate) fn disarm(&self) {
        self.slot.lock().take();
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("is_cancelling", &self.is_cancelling())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CancelHandle>();
    }

    #[test]
    fn test_cancel_without_request_is_noop() {
        let handle = CancelHandle::new();
        assert!(!handle.cancel());
        assert!(!handle.is_cancelling());

        // A cancel with nothing in flight must not leak into the next request.
        let token = handle.arm();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_trips_armed_token() {
        let handle = CancelHandle::new();
        let token = handle.arm();
        let clone = handle.clone();
        assert!(clone.cancel());
        assert!(token.is_cancelled());
        assert!(handle.is_cancelling());

        handle.disarm();
        assert!(!handle.is_cancelling());
        assert!(!handle.cancel());
    }
}
