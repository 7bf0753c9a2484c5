//! Error types for the relay.
//!
//! Every error maps to a wire code (see [`Error::code`]) matching the page
//! protocol's exception taxonomy, and converts to the protocol
//! [`ExceptionModel`] via [`Error::to_exception`].
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Caller | [`Error::ParameterNotSet`], [`Error::InvalidParameter`], [`Error::PathNotFound`] |
//! | Transport | [`Error::NativeConnectFailure`], [`Error::NativeDisconnected`], [`Error::NativeNoResponse`] |
//! | Policy | [`Error::BlockedDomain`], [`Error::UserCancelled`], [`Error::Forbidden`] |
//! | REST | [`Error::RestPki`] |
//! | Passthrough | [`Error::Native`] (native or remote-device exception, forwarded verbatim) |
//! | Internal | [`Error::Protocol`], [`Error::Settings`], [`Error::PageDisconnected`] |
//! | External | [`Error::Http`], [`Error::Json`], [`Error::Io`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::protocol::ExceptionModel;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Wire Codes
// ============================================================================

/// Wire codes recognized by the page-side library.
pub mod codes {
    /// A required command parameter was missing or empty.
    pub const COMMAND_PARAMETER_NOT_SET: &str = "command_parameter_not_set";
    /// A command parameter was present but invalid.
    pub const COMMAND_INVALID_PARAMETER: &str = "command_invalid_parameter";
    /// The native host reported that it does not know a command.
    pub const COMMAND_UNKNOWN: &str = "command_unknown";
    /// Connecting to the native host failed.
    pub const NATIVE_CONNECT_FAILURE: &str = "native_connect_failure";
    /// The native host disconnected with requests outstanding.
    pub const NATIVE_DISCONNECTED: &str = "native_disconnected";
    /// The native host never produced a response.
    pub const NATIVE_NO_RESPONSE: &str = "native_no_response";
    /// The requesting domain is forbidden by the restriction table.
    pub const BLOCKED_DOMAIN: &str = "blocked_domain";
    /// The user declined the signature authorization prompt.
    pub const USER_CANCELLED: &str = "user_cancelled";
    /// The native host runs on an unsupported operating system.
    pub const OS_NOT_SUPPORTED: &str = "os_not_supported";
    /// Marker the native side uses to signal a buffered (chunked) response.
    pub const IO_ERROR: &str = "io_error";
    /// REST signing service rejected the certificate.
    pub const REST_PKI_INVALID_CERTIFICATE: &str = "rest_pki_invalid_certificate";
    /// Fetching the pending signature from the REST service failed.
    pub const REST_PKI_GET_PENDING_SIGNATURE: &str = "rest_pki_get_pending_signature";
    /// Posting the completed signature to the REST service failed.
    pub const REST_PKI_POST_SIGNATURE: &str = "rest_pki_post_signature";
    /// Remote device rejected the session key.
    pub const MOBILE_NOT_AUTHORIZED: &str = "mobile_not_authorized";
    /// Remote device did not answer in time.
    pub const MOBILE_TIMEOUT: &str = "mobile_timeout";
    /// Sending to the remote device failed.
    pub const MOBILE_SEND_MESSAGE: &str = "mobile_send_message";
    /// Fallback code for unhandled exceptions.
    pub const UNDEFINED: &str = "undefined";
}

// ============================================================================
// RestPkiErrorKind
// ============================================================================

/// Failure kinds of the REST pending-signature workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestPkiErrorKind {
    /// The posted certificate failed server-side validation.
    InvalidCertificate,
    /// The pending signature could not be fetched.
    GetPendingSignature,
    /// The completed signature could not be posted.
    PostSignature,
}

impl RestPkiErrorKind {
    /// Returns the wire code for this kind.
    #[inline]
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidCertificate => codes::REST_PKI_INVALID_CERTIFICATE,
            Self::GetPendingSignature => codes::REST_PKI_GET_PENDING_SIGNATURE,
            Self::PostSignature => codes::REST_PKI_POST_SIGNATURE,
        }
    }
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Caller Errors
    // ========================================================================
    /// Required command parameter missing or empty.
    #[error("{message}")]
    ParameterNotSet {
        /// Which parameter, phrased for the page.
        message: String,
    },

    /// Command parameter present but invalid.
    #[error("{message}")]
    InvalidParameter {
        /// Description of the invalid parameter.
        message: String,
    },

    /// A path handle was not registered by this page.
    #[error("{kind} not found: {id}")]
    PathNotFound {
        /// "File" or "Folder".
        kind: &'static str,
        /// The handle the page passed.
        id: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Launching the native host failed.
    #[error("{message}")]
    NativeConnectFailure {
        /// Description of the launch failure.
        message: String,
    },

    /// The native host disconnected while requests were outstanding.
    #[error("{message}")]
    NativeDisconnected {
        /// Best available diagnostic from the transport.
        message: String,
    },

    /// The native host never produced a response.
    #[error("Did not receive response from native component")]
    NativeNoResponse,

    // ========================================================================
    // Policy Errors
    // ========================================================================
    /// The requesting domain is on the fully-forbidden restriction list.
    #[error("{message}")]
    BlockedDomain {
        /// Description including the blocked domain.
        message: String,
    },

    /// The user declined the signature authorization prompt.
    #[error("The user cancelled the operation")]
    UserCancelled,

    /// Command restricted to the extension popup.
    #[error("Forbidden")]
    Forbidden,

    /// The native host runs on an unsupported operating system.
    #[error("Not supported OS: {os}")]
    OsNotSupported {
        /// The reported operating system.
        os: String,
    },

    // ========================================================================
    // REST Errors
    // ========================================================================
    /// REST pending-signature workflow failure.
    #[error("{message}")]
    RestPki {
        /// Description of the failure.
        message: String,
        /// Which step failed.
        kind: RestPkiErrorKind,
    },

    // ========================================================================
    // Passthrough
    // ========================================================================
    /// Structured exception from the native host or a remote device.
    ///
    /// Forwarded to the page verbatim, keeping the original message,
    /// origin and code.
    #[error("{}", .0.message)]
    Native(ExceptionModel),

    // ========================================================================
    // Internal Errors
    // ========================================================================
    /// Protocol violation (unparsable page URL, ambiguous native response).
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// Settings store failure.
    #[error("Settings error: {message}")]
    Settings {
        /// Description of the failure.
        message: String,
    },

    /// The page disconnected before a reply could be delivered.
    ///
    /// Replies carrying this error are dropped silently.
    #[error("Page disconnected")]
    PageDisconnected,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a missing-parameter error.
    #[inline]
    pub fn parameter_not_set(message: impl Into<String>) -> Self {
        Self::ParameterNotSet {
            message: message.into(),
        }
    }

    /// Creates an invalid-parameter error.
    #[inline]
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates a path-not-found error.
    #[inline]
    pub fn path_not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::PathNotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a native connect failure.
    #[inline]
    pub fn native_connect_failure(message: impl Into<String>) -> Self {
        Self::NativeConnectFailure {
            message: message.into(),
        }
    }

    /// Creates a native disconnect error.
    #[inline]
    pub fn native_disconnected(message: impl Into<String>) -> Self {
        Self::NativeDisconnected {
            message: message.into(),
        }
    }

    /// Creates a blocked-domain error.
    #[inline]
    pub fn blocked_domain(message: impl Into<String>) -> Self {
        Self::BlockedDomain {
            message: message.into(),
        }
    }

    /// Creates an unsupported-OS error.
    #[inline]
    pub fn os_not_supported(os: impl Into<String>) -> Self {
        Self::OsNotSupported { os: os.into() }
    }

    /// Creates a REST workflow error.
    #[inline]
    pub fn rest_pki(kind: RestPkiErrorKind, message: impl Into<String>) -> Self {
        Self::RestPki {
            message: message.into(),
            kind,
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a settings error.
    #[inline]
    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings {
            message: message.into(),
        }
    }
}

// ============================================================================
// Wire Mapping
// ============================================================================

impl Error {
    /// Returns the wire code for this error.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::ParameterNotSet { .. } => codes::COMMAND_PARAMETER_NOT_SET,
            Self::InvalidParameter { .. } | Self::PathNotFound { .. } => {
                codes::COMMAND_INVALID_PARAMETER
            }
            Self::NativeConnectFailure { .. } => codes::NATIVE_CONNECT_FAILURE,
            Self::NativeDisconnected { .. } => codes::NATIVE_DISCONNECTED,
            Self::NativeNoResponse => codes::NATIVE_NO_RESPONSE,
            Self::BlockedDomain { .. } => codes::BLOCKED_DOMAIN,
            Self::UserCancelled => codes::USER_CANCELLED,
            Self::OsNotSupported { .. } => codes::OS_NOT_SUPPORTED,
            Self::RestPki { kind, .. } => kind.code(),
            Self::Native(model) => &model.code,
            Self::Forbidden
            | Self::Protocol { .. }
            | Self::Settings { .. }
            | Self::PageDisconnected
            | Self::Http(_)
            | Self::Json(_)
            | Self::Io(_) => codes::UNDEFINED,
        }
    }

    /// Converts this error into the protocol exception model.
    ///
    /// [`Error::Native`] passes through verbatim. Coded errors keep their
    /// message and code. Anything else wraps as a generic unhandled
    /// exception with the `undefined` code.
    #[must_use]
    pub fn to_exception(&self) -> ExceptionModel {
        match self {
            Self::Native(model) => model.clone(),
            _ if self.code() != codes::UNDEFINED => {
                ExceptionModel::new(self.to_string(), self.code())
            }
            _ => ExceptionModel::new(
                format!("An unhandled exception occurred: {self}"),
                codes::UNDEFINED,
            ),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error is the caller's fault (never retried).
    #[inline]
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::ParameterNotSet { .. }
                | Self::InvalidParameter { .. }
                | Self::PathNotFound { .. }
        )
    }

    /// Returns `true` if this is a native-transport error.
    ///
    /// Transport errors surface to the caller as-is; the relay reconnects
    /// on the next call but never retries the failed call itself.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::NativeConnectFailure { .. }
                | Self::NativeDisconnected { .. }
                | Self::NativeNoResponse
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
