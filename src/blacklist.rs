//! Server-supplied domain restriction table.
//!
//! The home endpoint publishes a map of domain patterns to restriction bit
//! flags. Flags compose: a pattern may both force licensing and redirect
//! signatures through the REST workflow. A `*.`-prefixed pattern matches
//! the bare tail and any subdomain of it.
//!
//! Refreshes are fire-and-forget: a failed or absent endpoint leaves the
//! current table in place.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::identifiers::Domain;

// ============================================================================
// Restriction Flags
// ============================================================================

/// Restriction bit flags.
pub mod restrictions {
    /// Signatures for this domain go through the REST workflow.
    pub const REST_PKI: u32 = 1;
    /// Commands for this domain always require a license.
    pub const FORCE_REQUIRE_LICENSE: u32 = 2;
    /// The domain is fully forbidden.
    pub const FORBIDDEN: u32 = 4;
}

// ============================================================================
// Blacklist
// ============================================================================

#[derive(Debug, Deserialize)]
struct HomePayload {
    /// pattern -> restriction bits.
    #[serde(default)]
    bl: FxHashMap<String, u32>,
}

/// Shared restriction table.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: RwLock<FxHashMap<String, u32>>,
}

impl Blacklist {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the table contents.
    pub fn replace(&self, entries: FxHashMap<String, u32>) {
        *self.entries.write() = entries;
    }

    /// Returns `true` if the domain carries any of the given flags.
    #[must_use]
    pub fn is_restricted(&self, domain: &Domain, flags: u32) -> bool {
        let entries = self.entries.read();
        entries
            .iter()
            .any(|(pattern, bits)| bits & flags != 0 && pattern_matches(pattern, domain.as_str()))
    }

    /// Spawns a background refresh from the home endpoint.
    ///
    /// No endpoint configured means no refresh. Failures are logged and
    /// leave the current table untouched.
    pub fn spawn_refresh(self: &Arc<Self>, client: reqwest::Client, endpoint: Option<String>) {
        let Some(endpoint) = endpoint else {
            return;
        };
        let blacklist = Arc::clone(self);
        tokio::spawn(async move {
            match fetch(&client, &endpoint).await {
                Ok(payload) => {
                    debug!(entries = payload.bl.len(), "restriction table refreshed");
                    blacklist.replace(payload.bl);
                }
                Err(e) => warn!(error = %e, "restriction table refresh failed"),
            }
        });
    }
}

async fn fetch(client: &reqwest::Client, endpoint: &str) -> reqwest::Result<HomePayload> {
    client
        .get(endpoint)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

/// Matches a restriction pattern against a domain.
///
/// `*.tail` matches `tail` itself and anything ending in `.tail`; other
/// patterns match exactly, case-insensitively.
fn pattern_matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if let Some(tail) = pattern.strip_prefix("*.") {
        domain == tail || domain.ends_with(&format!(".{tail}"))
    } else {
        domain == pattern
    }
}

// ============================================================================
// Tests
// ============================================================================
