//! Page registry and response routing.
//!
//! The router owns every connected [`Page`] and decides which pending
//! request a native reply resolves.
//!
//! # Correlation Rules
//!
//! | Reply | Resolution |
//! |-------|------------|
//! | Carries a request id | Exactly the page holding that pending entry |
//! | No request id, one pending across the target | That single entry (legacy host) |
//! | No request id, zero or many pending | Protocol error, resolves nothing |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `page` | Per-page state |
//! | `router` | Registry and dispatch |

// ============================================================================
// Submodules
// ============================================================================

/// Per-page state.
pub mod page;

/// Registry and dispatch.
#[allow(clippy::module_inception)]
pub mod router;

// ============================================================================
// Re-exports
// ============================================================================

pub use page::Page;
pub use router::RequestRouter;
