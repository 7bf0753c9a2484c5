//! Native-messaging envelope and reply types.
//!
//! Every message sent to the native host is a [`NativeEnvelope`]: the page's
//! raw request enriched with correlation id, origin domain, license and
//! configuration flags. Every message received back is a [`NativeReply`].
//!
//! A reply whose exception carries the `io_error` code together with a
//! stream id is not a failure: it marks a buffered response that must be
//! fetched in chunks (see `transfer`).

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{codes, Error, Result};
use crate::identifiers::{RequestId, StreamId};

// ============================================================================
// ExceptionModel
// ============================================================================

/// Structured exception as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionModel {
    /// Short human-readable message.
    pub message: String,
    /// Full diagnostic text, defaults to the message.
    #[serde(default)]
    pub complete: String,
    /// Component that raised the exception.
    #[serde(default)]
    pub origin: String,
    /// Machine-readable code (see [`codes`]).
    #[serde(default)]
    pub code: String,
}

impl ExceptionModel {
    /// Creates an exception raised by the relay itself.
    #[must_use]
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            complete: message.clone(),
            message,
            origin: "relay".to_string(),
            code: code.into(),
        }
    }
}

// ============================================================================
// NativeEnvelope
// ============================================================================

/// Command envelope sent to the native host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeEnvelope {
    /// Correlation id echoed back in the reply.
    pub request_id: RequestId,
    /// License token of the requesting page, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Origin domain the command executes on behalf of.
    pub domain: String,
    /// Command name.
    pub command: String,
    /// Raw command parameters, forwarded untouched.
    pub request: Value,
    /// UI language for native prompts.
    pub language: String,
    /// Whether the native host should stay resident after this command.
    pub keep_alive: bool,
    /// Whether native-side tracing is enabled.
    pub trace: bool,
    /// Extra PKCS#11 module paths configured by the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkcs11_modules: Option<Vec<String>>,
    /// Whether the native host must enforce licensing for this command.
    pub require_license: bool,
}

impl NativeEnvelope {
    /// Builds the probe sent when a pooled connection's shutdown delay
    /// elapses. The native host answers and then exits if it has no other
    /// reason to stay resident.
    #[must_use]
    pub fn shutdown_probe() -> Self {
        Self {
            request_id: RequestId::generate(),
            license: None,
            domain: "localhost".to_string(),
            command: "getInfo".to_string(),
            request: serde_json::json!({ "cancelInstances": false }),
            language: String::new(),
            keep_alive: false,
            trace: false,
            pkcs11_modules: None,
            require_license: false,
        }
    }
}

// ============================================================================
// NativeReply
// ============================================================================

/// Response received from the native host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeReply {
    /// Correlation id from the originating envelope. Legacy hosts omit it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Whether the command succeeded.
    pub success: bool,
    /// Command result when successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Structured exception when failed (or buffered, see
    /// [`NativeReply::is_buffered`]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionModel>,
    /// Stream handle for buffered responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    /// Total byte length of a buffered response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_length: Option<u64>,
}

impl NativeReply {
    /// Builds a failed reply carrying the given exception.
    #[must_use]
    pub fn failure(request_id: Option<RequestId>, exception: ExceptionModel) -> Self {
        Self {
            request_id,
            success: false,
            response: None,
            exception: Some(exception),
            stream_id: None,
            stream_length: None,
        }
    }

    /// Returns `true` if this reply announces a buffered response stream
    /// rather than an inline result.
    #[inline]
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        self.stream_id.is_some()
            && self
                .exception
                .as_ref()
                .is_some_and(|e| e.code == codes::IO_ERROR)
    }

    /// Unwraps this reply into the command result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Native`] carrying the reply's exception when the
    /// command failed, or [`Error::Protocol`] if a failed reply carries no
    /// exception at all.
    pub fn into_result(self) -> Result<Value> {
        if self.success {
            Ok(self.response.unwrap_or(Value::Null))
        } else if let Some(exception) = self.exception {
            Err(Error::Native(exception))
        } else {
            Err(Error::protocol("Native reply failed without an exception"))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serializes_camel_case() {
        let envelope = NativeEnvelope {
            request_id: RequestId::generate(),
            license: Some("lic".into()),
            domain: "example.com".into(),
            command: "listCertificates".into(),
            request: serde_json::json!({}),
            language: "en".into(),
            keep_alive: true,
            trace: false,
            pkcs11_modules: None,
            require_license: true,
        };
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert!(value.get("requestId").is_some());
        assert_eq!(value["keepAlive"], true);
        assert_eq!(value["requireLicense"], true);
        assert!(value.get("pkcs11Modules").is_none());
        assert_eq!(value["license"], "lic");
    }

    #[test]
    fn test_shutdown_probe_shape() {
        let probe = NativeEnvelope::shutdown_probe();
        assert_eq!(probe.command, "getInfo");
        assert_eq!(probe.domain, "localhost");
        assert!(!probe.keep_alive);
        assert!(!probe.require_license);
    }

    #[test]
    fn test_buffered_reply_detection() {
        let reply = NativeReply {
            request_id: None,
            success: false,
            response: None,
            exception: Some(ExceptionModel::new("chunked", codes::IO_ERROR)),
            stream_id: Some(StreamId(7)),
            stream_length: Some(387),
        };
        assert!(reply.is_buffered());

        let plain_failure = NativeReply::failure(None, ExceptionModel::new("boom", "undefined"));
        assert!(!plain_failure.is_buffered());
    }

    #[test]
    fn test_reply_deserializes_with_missing_optionals() {
        let reply: NativeReply =
            serde_json::from_str(r#"{"success":true,"response":{"os":"Windows"}}"#)
                .expect("deserialize");
        assert!(reply.request_id.is_none());
        assert!(reply.success);
        assert_eq!(reply.into_result().expect("result")["os"], "Windows");
    }

    #[test]
    fn test_failed_reply_into_result() {
        let reply = NativeReply::failure(None, ExceptionModel::new("nope", "user_cancelled"));
        let err = reply.into_result().expect_err("failure");
        assert_eq!(err.code(), "user_cancelled");
    }
}
