//! REST signing service client.
//!
//! Domains flagged with the `restPki` restriction sign through a
//! server-mediated workflow instead of handing raw data to the page: the
//! relay fetches the pending signature, lets the server validate the chosen
//! certificate, signs the server-provided digest natively and posts the
//! result back. The page only ever sees the final outcome.

// ============================================================================
// Imports
// ============================================================================

use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result, RestPkiErrorKind};

// ============================================================================
// Well-Known Endpoints
// ============================================================================

/// Service endpoints that are allowed to bypass page licensing.
pub const WELL_KNOWN_ENDPOINTS: &[&str] = &["https://restpki.lacunasoftware.com/"];

/// Returns `true` if the base URL is one of the well-known endpoints.
#[must_use]
pub fn is_well_known(base_url: &str) -> bool {
    let normalized = normalize(base_url);
    WELL_KNOWN_ENDPOINTS.iter().any(|e| *e == normalized)
}

fn normalize(base_url: &str) -> String {
    let trimmed = base_url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

// ============================================================================
// RestPkiClient
// ============================================================================

/// Client for the pending-signature API.
#[derive(Debug, Clone)]
pub struct RestPkiClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestPkiClient {
    /// Creates a client for the given base URL; `None` selects the default
    /// well-known endpoint.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: Option<String>) -> Self {
        let base_url = normalize(
            base_url
                .as_deref()
                .unwrap_or(WELL_KNOWN_ENDPOINTS[0]),
        );
        Self { http, base_url }
    }

    /// Returns the normalized base URL.
    #[inline]
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pending_url(&self, token: &str) -> String {
        format!(
            "{}Api/PendingSignatures/{}",
            self.base_url,
            urlencoding::encode(token)
        )
    }

    /// Fetches the pending signature for a token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RestPki`] with the get-pending-signature kind on any
    /// HTTP or decoding failure.
    pub async fn get_pending_signature(&self, token: &str) -> Result<Value> {
        debug!(token, "fetching pending signature");
        let result: std::result::Result<Value, reqwest::Error> = async {
            self.http
                .get(self.pending_url(token))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
        }
        .await;
        result.map_err(|e| {
            Error::rest_pki(
                RestPkiErrorKind::GetPendingSignature,
                format!("Could not get pending signature: {e}"),
            )
        })
    }

    /// Posts the chosen certificate for server-side validation.
    ///
    /// Returns the server's signature parameters (digest to sign, digest
    /// algorithm) on success.
    ///
    /// # Errors
    ///
    /// An HTTP 422 means the certificate failed validation and maps to
    /// [`Error::RestPki`] with the invalid-certificate kind carrying the
    /// joined validation messages. Other failures map to the
    /// post-signature kind.
    pub async fn post_certificate(&self, token: &str, certificate: &str) -> Result<Value> {
        let url = format!("{}/Certificate", self.pending_url(token));
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "certificate": certificate }))
            .send()
            .await
            .map_err(post_failure)?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(Error::rest_pki(
                RestPkiErrorKind::InvalidCertificate,
                validation_results_to_string(&body),
            ));
        }
        let response = response.error_for_status().map_err(post_failure)?;
        response.json().await.map_err(post_failure)
    }

    /// Posts the completed signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RestPki`] with the post-signature kind on any HTTP
    /// or decoding failure.
    pub async fn post_signature(&self, token: &str, signature: &str) -> Result<Value> {
        let url = format!("{}/Signature", self.pending_url(token));
        let result: std::result::Result<Value, reqwest::Error> = async {
            self.http
                .post(url)
                .json(&serde_json::json!({ "signature": signature }))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
        }
        .await;
        result.map_err(post_failure)
    }
}

fn post_failure(e: reqwest::Error) -> Error {
    Error::rest_pki(
        RestPkiErrorKind::PostSignature,
        format!("Could not post to signature service: {e}"),
    )
}

/// Joins the validation messages of a 422 body with ` / `.
///
/// Falls back to the top-level message, then to a generic text, when the
/// body does not carry a result list.
#[must_use]
pub fn validation_results_to_string(body: &Value) -> String {
    let messages: Vec<&str> = body
        .get("validationResults")
        .and_then(|r| r.get("errors"))
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if !messages.is_empty() {
        return messages.join(" / ");
    }
    body.get("message")
        .and_then(Value::as_str)
        .unwrap_or("The certificate failed validation")
        .to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_well_known_normalization() {
        assert!(is_well_known("https://restpki.lacunasoftware.com/"));
        assert!(is_well_known("https://restpki.lacunasoftware.com"));
        assert!(!is_well_known("https://restpki.evil.example/"));
    }

    #[test]
    fn test_default_base_url() {
        let client = RestPkiClient::new(reqwest::Client::new(), None);
        assert_eq!(client.base_url(), "https://restpki.lacunasoftware.com/");
    }

    #[test]
    fn test_pending_url_encodes_token() {
        let client = RestPkiClient::new(
            reqwest::Client::new(),
            Some("https://pki.example.com".into()),
        );
        assert_eq!(
            client.pending_url("a b/c"),
            "https://pki.example.com/Api/PendingSignatures/a%20b%2Fc"
        );
    }

    #[test]
    fn test_validation_messages_join() {
        let body = json!({
            "validationResults": {
                "errors": [
                    {"message": "Certificate expired"},
                    {"message": "Untrusted root"}
                ]
            }
        });
        assert_eq!(
            validation_results_to_string(&body),
            "Certificate expired / Untrusted root"
        );
    }

    #[test]
    fn test_validation_fallbacks() {
        assert_eq!(
            validation_results_to_string(&json!({"message": "nope"})),
            "nope"
        );
        assert_eq!(
            validation_results_to_string(&Value::Null),
            "The certificate failed validation"
        );
    }
}
