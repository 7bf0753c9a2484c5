//! Signature authorization ladder.
//!
//! Before a certificate signs anything on behalf of a page, the operation
//! must clear one rung of the ladder:
//!
//! 1. Pre-authorized quota on the page covers the requested count.
//! 2. The (domain, certificate) pair holds durable don't-ask-again trust.
//! 3. The native host shows the authorization prompt and the user approves.
//!
//! Approval with don't-ask-again persists trust for the next time; refusal
//! is `user_cancelled`. Batch signing re-runs the ladder per round, so a
//! long batch keeps asking unless quota or trust covers it.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::Thumbprint;
use crate::router::Page;
use crate::settings::CertSummary;

use super::dispatcher::{CallOptions, CommandDispatcher};

// ============================================================================
// Authorization
// ============================================================================

impl CommandDispatcher {
    /// Clears the authorization ladder for `count` signatures with the
    /// given certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UserCancelled`] when the user refuses the prompt;
    /// native or remote failures propagate verbatim.
    pub(crate) async fn authorize_signatures(
        &self,
        page: &Page,
        thumbprint: &Thumbprint,
        count: u32,
    ) -> Result<()> {
        if page.consume_preauthorizations(thumbprint, count) {
            debug!(%thumbprint, count, "authorized from pre-authorized quota");
            return Ok(());
        }

        if self
            .settings
            .site_trust(page.domain().as_str(), thumbprint)
            .await
            == Some(true)
        {
            debug!(%thumbprint, domain = %page.domain(), "authorized from site trust");
            return Ok(());
        }

        self.prompt_authorization(page, thumbprint, count).await
    }

    /// Runs the native authorization prompt, persisting don't-ask-again
    /// trust on approval.
    pub(crate) async fn prompt_authorization(
        &self,
        page: &Page,
        thumbprint: &Thumbprint,
        count: u32,
    ) -> Result<()> {
        let response = self
            .call_native(
                page,
                "authorizeSignatures",
                serde_json::json!({
                    "certificateThumbprint": thumbprint,
                    "signatureCount": count,
                }),
                CallOptions::default(),
            )
            .await?;

        if !response
            .get("authorized")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(Error::UserCancelled);
        }

        if response
            .get("dontAskAgain")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let cert = CertSummary {
                thumbprint: thumbprint.clone(),
                subject_name: nested_str(&response, "certificate", "subjectName"),
                issuer_name: nested_str(&response, "certificate", "issuerName"),
            };
            self.settings
                .set_site_trust(page.domain().as_str(), &cert, true)
                .await;
        }
        Ok(())
    }
}

fn nested_str(value: &Value, outer: &str, inner: &str) -> String {
    value
        .get(outer)
        .and_then(|v| v.get(inner))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
