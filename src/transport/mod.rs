//! Transports on both sides of the relay.
//!
//! The relay sits between two transports: pages reach it through a
//! [`PageTransport`] (the content-script port), and it reaches the native
//! host through a [`NativeLauncher`] (one OS process per connection, using
//! native-messaging framing).
//!
//! # Connection Model
//!
//! ```text
//! page A ─┐                      ┌─ private connection (page A)
//! page B ─┼── RequestRouter ─────┼─ pooled connection (example.com)
//! page C ─┘                      └─ pooled connection (@popup)
//! ```
//!
//! Pooled connections are shared per domain and reference counted with a
//! delayed shutdown; private connections live and die with their page.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `page` | Page-side transport trait |
//! | `native` | Native channel and launcher traits |
//! | `host` | Process launcher with native-messaging framing |
//! | `connection` | Posting handle for one native connection |
//! | `pool` | Reference-counted connection pool |

// ============================================================================
// Submodules
// ============================================================================

/// Page-side transport trait.
pub mod page;

/// Native channel and launcher traits.
pub mod native;

/// Process launcher with native-messaging framing.
pub mod host;

/// Posting handle for one native connection.
pub mod connection;

/// Reference-counted connection pool.
pub mod pool;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{ConnectionTarget, NativeConnection};
pub use host::ProcessLauncher;
pub use native::{NativeChannel, NativeEvent, NativeLauncher};
pub use page::{PageSender, PageTransport};
pub use pool::NativeConnectionPool;
