//! Native channel and launcher traits.
//!
//! A [`NativeLauncher`] starts one native host instance and hands back a
//! [`NativeChannel`]: an outgoing envelope sender plus an event stream.
//! The stream ends with exactly one [`NativeEvent::Disconnected`].

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{NativeEnvelope, NativeReply};

// ============================================================================
// NativeEvent
// ============================================================================

/// Event produced by a native connection.
#[derive(Debug)]
pub enum NativeEvent {
    /// A reply arrived from the native host.
    Message(NativeReply),
    /// The connection is gone. Terminal; no further events follow.
    Disconnected {
        /// Transport diagnostic, when one is available.
        error: Option<String>,
    },
}

// ============================================================================
// NativeChannel
// ============================================================================

/// Live channel to one native host instance.
#[derive(Debug)]
pub struct NativeChannel {
    /// Envelope sink. Dropping it closes the host's stdin.
    pub outgoing: mpsc::UnboundedSender<NativeEnvelope>,
    /// Event stream, consumed by the pool's pump task.
    pub events: mpsc::UnboundedReceiver<NativeEvent>,
}

// ============================================================================
// NativeLauncher
// ============================================================================

/// Starts native host instances.
pub trait NativeLauncher: Send + Sync + 'static {
    /// Launches one native host instance.
    ///
    /// Failure here is synchronous and maps to `native_connect_failure`;
    /// failures after a successful launch arrive as
    /// [`NativeEvent::Disconnected`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NativeConnectFailure`] when the host cannot
    /// be started.
    fn launch(&self) -> Result<NativeChannel>;
}
