//! Wire message types.
//!
//! This module defines the message formats crossing the relay's two
//! boundaries: the page boundary (content-script messages) and the
//! native boundary (native-messaging envelopes).
//!
//! # Message Flow
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | [`PageRequest`] | Page → Relay | Command request from a page |
//! | [`PageReply`] | Relay → Page | Exactly one reply per request |
//! | [`NativeEnvelope`] | Relay → Native | Enriched command envelope |
//! | [`NativeReply`] | Native → Relay | Response or structured exception |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | Native envelope, reply and exception model |
//! | `page` | Page request and reply types |
//! | `version` | Dotted version comparison |

// ============================================================================
// Submodules
// ============================================================================

/// Native envelope, reply and exception model.
pub mod envelope;

/// Page request and reply types.
pub mod page;

/// Dotted version comparison.
pub mod version;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{ExceptionModel, NativeEnvelope, NativeReply};
pub use page::{PageReply, PageRequest};
pub use version::{compare_versions, is_at_least};
