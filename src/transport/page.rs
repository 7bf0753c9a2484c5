//! Page-side transport.
//!
//! Each connected page owns one long-lived port to the relay. The concrete
//! transport (an extension message port in production, a fake in tests)
//! stays behind the [`PageTransport`] trait.

// ============================================================================
// Imports
// ============================================================================

use crate::protocol::PageReply;

// ============================================================================
// PageSender
// ============================================================================

/// Identity of the page end of a transport, captured at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSender {
    /// URL of the connecting frame.
    pub url: String,
    /// URL of the hosting tab, when the frame is embedded.
    pub tab_url: Option<String>,
}

impl PageSender {
    /// Returns the URL the page's domain is derived from.
    ///
    /// The tab URL wins over the frame URL so an embedded iframe is
    /// attributed to the site the user actually sees.
    #[inline]
    #[must_use]
    pub fn origin_url(&self) -> &str {
        self.tab_url.as_deref().unwrap_or(&self.url)
    }
}

// ============================================================================
// PageTransport
// ============================================================================

/// Transport to one connected page.
pub trait PageTransport: Send + Sync + 'static {
    /// Returns the page's identity.
    fn sender(&self) -> PageSender;

    /// Posts a reply to the page. Fire-and-forget: posting to a closed
    /// port is silently dropped.
    fn post(&self, reply: PageReply);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_prefers_tab_url() {
        let sender = PageSender {
            url: "https://cdn.example.net/widget.html".into(),
            tab_url: Some("https://example.com/sign".into()),
        };
        assert_eq!(sender.origin_url(), "https://example.com/sign");

        let top_level = PageSender {
            url: "https://example.com/sign".into(),
            tab_url: None,
        };
        assert_eq!(top_level.origin_url(), "https://example.com/sign");
    }
}
