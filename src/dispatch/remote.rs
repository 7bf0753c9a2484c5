//! Remote device routing policy.
//!
//! Certificate-addressed commands may be answered by a paired remote
//! device instead of the local native host. The pre-call check routes by
//! certificate thumbprint: when a connected, enabled device claims the
//! certificate, the whole command goes to the device and the native host
//! is never involved.
//!
//! The page's license travels with signing commands so the device can
//! enforce licensing, but identification commands are sent without it.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

use crate::devices::{record_device_failure, ConnectedDevice};
use crate::error::Result;
use crate::identifiers::Thumbprint;
use crate::protocol::NativeEnvelope;

use super::dispatcher::CommandDispatcher;

// ============================================================================
// Policy
// ============================================================================

/// Commands that route by certificate thumbprint.
const THUMBPRINT_COMMANDS: &[&str] = &[
    "readCertificate",
    "authorizeSignatures",
    "signData",
    "signHash",
    "signHashes",
    "signHashBatch",
];

/// Commands sent to a device without the page's license.
const LICENSE_STRIPPED_COMMANDS: &[&str] = &["readCertificate", "authorizeSignatures"];

/// Returns `true` if the command may route to a remote device.
#[must_use]
pub fn is_thumbprint_command(command: &str) -> bool {
    THUMBPRINT_COMMANDS.contains(&command)
}

/// Returns `true` if the page's license must be stripped before sending
/// the command to a device.
#[must_use]
pub fn strips_license(command: &str) -> bool {
    LICENSE_STRIPPED_COMMANDS.contains(&command)
}

/// Extracts the routing thumbprint from a request, if present.
#[must_use]
pub fn routing_thumbprint(request: &Value) -> Option<Thumbprint> {
    request
        .get("certificateThumbprint")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(Thumbprint::from)
}

// ============================================================================
// Device Calls
// ============================================================================

impl CommandDispatcher {
    /// Sends a command to a remote device, recording health on failure.
    ///
    /// Failures always surface here; silent absorption is only for
    /// background maintenance (see the device refresh paths).
    pub(super) async fn call_device(
        &self,
        device: &ConnectedDevice,
        mut envelope: NativeEnvelope,
    ) -> Result<Value> {
        if strips_license(&envelope.command) {
            envelope.license = None;
        }
        match device.client.send_message(&envelope).await {
            Ok(value) => Ok(value),
            Err(e) => {
                record_device_failure(&self.settings, device, &e).await;
                Err(e)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_thumbprint_command_set() {
        assert!(is_thumbprint_command("signHashBatch"));
        assert!(is_thumbprint_command("readCertificate"));
        assert!(!is_thumbprint_command("listCertificates"));
        assert!(!is_thumbprint_command("getInfo"));
    }

    #[test]
    fn test_license_strip_policy() {
        assert!(strips_license("readCertificate"));
        assert!(strips_license("authorizeSignatures"));
        assert!(!strips_license("signData"));
        assert!(!strips_license("signHashBatch"));
    }

    #[test]
    fn test_routing_thumbprint_extraction() {
        assert_eq!(
            routing_thumbprint(&json!({"certificateThumbprint": "AA"})),
            Some(Thumbprint::from("AA"))
        );
        assert_eq!(routing_thumbprint(&json!({"certificateThumbprint": ""})), None);
        assert_eq!(routing_thumbprint(&json!({})), None);
    }
}
