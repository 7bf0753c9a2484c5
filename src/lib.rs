//! WebSigner relay - Browser-to-native signing bridge.
//!
//! This library implements the background core of a digital-signature
//! browser extension: it relays commands from web pages to a native
//! signing component over native messaging, enforces authorization and
//! domain policy on the way through, and routes certificate-addressed
//! commands to paired remote devices when they hold the certificate.
//!
//! # Architecture
//!
//! The relay sits between two untrusting sides:
//!
//! - **Pages**: send commands through the content script, each tagged
//!   with a page-generated request id
//! - **Native host**: a local process speaking length-prefixed JSON over
//!   stdio, shared per domain or dedicated per page
//!
//! Key design principles:
//!
//! - One [`CommandDispatcher`] serves every page; policy lives in one place
//! - Native connections are pooled per domain with delayed shutdown
//! - Replies correlate by request id; ambiguous replies are dropped
//! - Oversized native payloads arrive as buffered streams and are
//!   reassembled transparently
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use websigner_relay::{Relay, RelayConfig};
//! use websigner_relay::transport::ProcessLauncher;
//!
//! let relay = Relay::builder(RelayConfig {
//!     extension_id: "bbafmabaelnnkondpfpjmdklbmfnbmol".into(),
//!     extension_version: "2.17.1".into(),
//!     language: "en".into(),
//!     user_os: "Linux".into(),
//!     home_endpoint: None,
//!     rest_pki_base_url: None,
//! })
//! .launcher(Arc::new(ProcessLauncher::new("/usr/bin/websigner-host", vec![])))
//! .build()
//! .expect("relay");
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`relay`] | Composition root: [`Relay`] and its builder |
//! | [`dispatch`] | Command execution, authorization, remote routing |
//! | [`router`] | Page registry and native reply correlation |
//! | [`transport`] | Page and native transports, connection pool |
//! | [`transfer`] | Buffered stream reassembly |
//! | [`protocol`] | Wire message types (page and native sides) |
//! | [`settings`] | Persistent extension settings |
//! | [`devices`] | Paired remote device registry |
//! | [`blacklist`] | Domain restriction table |
//! | [`restpki`] | REST signing service client |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Domain restriction table and its refresh.
pub mod blacklist;

/// Paired remote device registry and health tracking.
pub mod devices;

/// Command execution core.
///
/// The [`CommandDispatcher`] applies policy (licensing, authorization,
/// domain restrictions, remote routing) and runs every page command.
pub mod dispatch;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for relay entities.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire message types.
///
/// Shapes crossing the page boundary and the native-messaging boundary.
pub mod protocol;

/// Composition root wiring the relay together.
pub mod relay;

/// REST signing service client.
pub mod restpki;

/// Page registry and native reply correlation.
pub mod router;

/// Persistent extension settings.
pub mod settings;

/// Buffered stream reassembly for oversized native payloads.
pub mod transfer;

/// Page and native transport layers.
///
/// Native-messaging framing, process launching and the per-domain
/// connection pool.
pub mod transport;

/// Shared test doubles.
#[cfg(test)]
pub mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Relay types
pub use relay::{Relay, RelayBuilder, RelayConfig};

// Dispatch types
pub use dispatch::{CallOptions, CommandDispatcher, InstallationState};

// Router types
pub use router::{Page, RequestRouter};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{Domain, PageId, PathId, RequestId, StreamId, Thumbprint};

// Protocol types
pub use protocol::{ExceptionModel, NativeEnvelope, NativeReply, PageReply, PageRequest};
