//! Type-safe identifiers for relay entities.
//!
//! Newtype wrappers prevent mixing incompatible ids at compile time:
//! a [`RequestId`] can never be passed where a [`PathId`] is expected.
//!
//! | Type | Backing | Purpose |
//! |------|---------|---------|
//! | [`RequestId`] | UUID v4 | Request/response correlation |
//! | [`PageId`] | monotonic u64 | Connected page identity |
//! | [`PathId`] | UUID v4 | Opaque filesystem path handle |
//! | [`StreamId`] | u64 | Buffered-transfer stream |
//! | [`Thumbprint`] | string | Certificate thumbprint |
//! | [`DeviceId`] | string | Remote device identity |
//! | [`Domain`] | string | Origin domain or popup sentinel |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// RequestId
// ============================================================================

/// Unique identifier correlating a request with its response.
///
/// Generated per native call; globally unique (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh random id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// PageId
// ============================================================================

/// Stable identity of a connected page.
///
/// Assigned on transport connect, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(u64);

impl PageId {
    /// Returns the next page id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// PathId
// ============================================================================

/// Opaque handle to a registered filesystem path.
///
/// Pages never see raw paths; file and folder pickers return a [`PathId`]
/// which later commands resolve through the owning page's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathId(Uuid);

impl PathId {
    /// Generates a fresh random id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a path id from its string form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the value is not a UUID.
    pub fn parse(value: &str) -> Result<Self> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|_| Error::invalid_parameter(format!("Invalid path id: {value}")))
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// StreamId
// ============================================================================

/// Identifier of a buffered-transfer stream on the native side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Thumbprint
// ============================================================================

/// Certificate thumbprint as reported by the native host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thumbprint(String);

impl Thumbprint {
    /// Wraps a thumbprint string.
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the thumbprint as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Thumbprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// DeviceId
// ============================================================================

/// Identity of a paired remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps a device id string.
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Domain
// ============================================================================

/// Origin domain of a connected page, or the popup sentinel.
///
/// Regular pages carry the lower-cased host of the hosting tab's URL.
/// The extension's own popup uses the `@popup` sentinel so it can be
/// pooled (and licensed) separately from any web origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

/// Sentinel domain for the extension popup.
const POPUP_DOMAIN: &str = "@popup";

impl Domain {
    /// Returns the popup sentinel domain.
    #[inline]
    #[must_use]
    pub fn popup() -> Self {
        Self(POPUP_DOMAIN.to_string())
    }

    /// Creates a domain from an already-known host name (lower-cased).
    #[inline]
    #[must_use]
    pub fn from_host(host: impl AsRef<str>) -> Self {
        Self(host.as_ref().to_ascii_lowercase())
    }

    /// Parses the origin domain from a page URL.
    ///
    /// This is a fatal protocol violation when it fails: a page whose URL
    /// cannot be parsed must not be registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the URL has no parseable host.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed =
            Url::parse(url).map_err(|_| Error::protocol(format!("Unable to parse page domain: {url}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::protocol(format!("Unable to parse page domain: {url}")))?;
        Ok(Self::from_host(host))
    }

    /// Returns `true` if this is the popup sentinel.
    #[inline]
    #[must_use]
    pub fn is_popup(&self) -> bool {
        self.0 == POPUP_DOMAIN
    }

    /// Returns the domain as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Tests
// ============================================================================
