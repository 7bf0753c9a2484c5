//! Command dispatch.
//!
//! The [`CommandDispatcher`] is the relay's brain: it receives parsed page
//! requests, applies cross-cutting policy (blacklist, licensing, remote
//! device routing, signature authorization), executes the command against
//! the native host and guarantees exactly one terminal reply per request.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `dispatcher` | Dispatcher, command handlers, native exchange |
//! | `authorization` | Signature authorization ladder |
//! | `remote` | Remote device routing policy |

// ============================================================================
// Submodules
// ============================================================================

/// Dispatcher, command handlers, native exchange.
pub mod dispatcher;

/// Signature authorization ladder.
pub mod authorization;

/// Remote device routing policy.
pub mod remote;

// ============================================================================
// Re-exports
// ============================================================================

pub use dispatcher::{CallOptions, CommandDispatcher, InstallationState};
