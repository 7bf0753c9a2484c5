//! Posting handle for one native connection.
//!
//! A [`NativeConnection`] is the cheap-to-clone sending half of a launched
//! native channel, tagged with the [`ConnectionTarget`] it serves so
//! incoming replies can be routed back to the right page set.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::identifiers::{Domain, PageId};
use crate::protocol::NativeEnvelope;

// ============================================================================
// ConnectionTarget
// ============================================================================

/// Who a native connection serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionTarget {
    /// Dedicated to a single page.
    Private(PageId),
    /// Shared by every page of a domain.
    Pooled(Domain),
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private(page) => write!(f, "page {page}"),
            Self::Pooled(domain) => write!(f, "domain {domain}"),
        }
    }
}

// ============================================================================
// NativeConnection
// ============================================================================

/// Sending handle to a live native host instance.
#[derive(Debug, Clone)]
pub struct NativeConnection {
    target: ConnectionTarget,
    outgoing: mpsc::UnboundedSender<NativeEnvelope>,
}

impl NativeConnection {
    /// Creates a handle over a launched channel's sender.
    #[must_use]
    pub fn new(target: ConnectionTarget, outgoing: mpsc::UnboundedSender<NativeEnvelope>) -> Self {
        Self { target, outgoing }
    }

    /// Returns the target this connection serves.
    #[inline]
    #[must_use]
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Posts an envelope to the native host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NativeDisconnected`] when the channel is closed.
    pub fn post(&self, envelope: NativeEnvelope) -> Result<()> {
        self.outgoing
            .send(envelope)
            .map_err(|_| Error::native_disconnected("Native component is not connected"))
    }

    /// Posts the shutdown probe, ignoring a closed channel.
    ///
    /// The probe invites the host to exit once it has nothing else to do;
    /// a host that is already gone needs no invitation.
    pub fn post_shutdown_probe(&self) {
        let _ = self.outgoing.send(NativeEnvelope::shutdown_probe());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_after_close_is_disconnected() {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = NativeConnection::new(ConnectionTarget::Private(PageId::next()), tx);
        drop(rx);

        let err = connection
            .post(NativeEnvelope::shutdown_probe())
            .expect_err("closed channel");
        assert_eq!(err.code(), "native_disconnected");
    }

    #[tokio::test]
    async fn test_clones_share_the_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection =
            NativeConnection::new(ConnectionTarget::Pooled(Domain::from_host("example.com")), tx);
        let clone = connection.clone();

        connection.post(NativeEnvelope::shutdown_probe()).expect("post");
        clone.post(NativeEnvelope::shutdown_probe()).expect("post");
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }
}
