//! Page-boundary message types.
//!
//! Pages talk to the relay through the content script using these shapes.
//! Every [`PageRequest`] gets exactly one [`PageReply`] echoing its
//! request id, unless the page disconnects first.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

// ============================================================================
// PageRequest
// ============================================================================

/// Command request received from a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    /// Page-generated correlation id, echoed in the reply.
    pub request_id: String,
    /// License token presented by the page, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Command name.
    pub command: String,
    /// Raw command parameters.
    #[serde(default)]
    pub request: Value,
    /// Whether this page opts into the per-domain pooled native connection.
    #[serde(default, rename = "useDomainNativePool")]
    pub use_domain_native_pool: bool,
}

// ============================================================================
// PageReply
// ============================================================================

/// Reply delivered to a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageReply {
    /// Correlation id from the originating request.
    pub request_id: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Command result when successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Structured exception when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<crate::protocol::ExceptionModel>,
    /// Whether page-side tracing is enabled.
    pub trace: bool,
}

impl PageReply {
    /// Builds a success reply.
    #[must_use]
    pub fn ok(request_id: impl Into<String>, response: Value, trace: bool) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            response: Some(response),
            exception: None,
            trace,
        }
    }

    /// Builds a failure reply from an error.
    #[must_use]
    pub fn fail(request_id: impl Into<String>, error: &Error, trace: bool) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            response: None,
            exception: Some(error.to_exception()),
            trace,
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
    fn test_request_defaults() {
        let request: PageRequest = serde_json::from_str(
            r#"{"requestId":"r1","command":"getVersion"}"#,
        )
        .expect("deserialize");
        assert_eq!(request.request_id, "r1");
        assert!(request.license.is_none());
        assert!(!request.use_domain_native_pool);
        assert!(request.request.is_null());
    }

    #[test]
    fn test_pool_flag_rename() {
        let request: PageRequest = serde_json::from_str(
            r#"{"requestId":"r2","command":"signData","request":{},"useDomainNativePool":true}"#,
        )
        .expect("deserialize");
        assert!(request.use_domain_native_pool);
    }

    #[test]
    fn test_failure_reply_carries_exception() {
        let reply = PageReply::fail("r3", &Error::UserCancelled, false);
        let value = serde_json::to_value(&reply).expect("serialize");
        assert_eq!(value["requestId"], "r3");
        assert_eq!(value["success"], false);
        assert_eq!(value["exception"]["code"], "user_cancelled");
        assert!(value.get("response").is_none());
    }

    #[test]
    fn test_success_reply_shape() {
        let reply = PageReply::ok("r4", serde_json::json!({"isReady": true}), true);
        let value = serde_json::to_value(&reply).expect("serialize");
        assert_eq!(value["success"], true);
        assert_eq!(value["trace"], true);
        assert_eq!(value["response"]["isReady"], true);
    }
}
