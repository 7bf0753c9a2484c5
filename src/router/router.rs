//! Page registry and native reply dispatch.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use crate::error::{codes, Result};
use crate::identifiers::{Domain, PageId};
use crate::protocol::{ExceptionModel, NativeReply};
use crate::transport::{ConnectionTarget, PageTransport};

use super::page::{Page, SinglePending};

// ============================================================================
// RequestRouter
// ============================================================================

/// Registry of connected pages plus reply routing.
pub struct RequestRouter {
    /// URL prefix identifying the extension's own pages.
    extension_origin: String,
    pages: RwLock<FxHashMap<PageId, Arc<Page>>>,
}

impl RequestRouter {
    /// Creates a router for the given extension id.
    #[must_use]
    pub fn new(extension_id: &str) -> Arc<Self> {
        Arc::new(Self {
            extension_origin: format!("chrome-extension://{extension_id}/"),
            pages: RwLock::new(FxHashMap::default()),
        })
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Registers a newly connected page.
    ///
    /// The extension's own pages (URL under the extension origin) get the
    /// popup sentinel domain; everything else derives its domain from the
    /// hosting tab's URL.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Protocol`] when the page URL has no
    /// parseable host. Such a page must not be registered.
    pub fn register_page(&self, transport: Arc<dyn PageTransport>) -> Result<Arc<Page>> {
        let sender = transport.sender();
        let domain = if sender.url.starts_with(&self.extension_origin) {
            Domain::popup()
        } else {
            Domain::parse(sender.origin_url())?
        };

        let id = PageId::next();
        let page = Page::new(id, domain.clone(), transport);
        self.pages.write().insert(id, Arc::clone(&page));
        debug!(page = %id, domain = %domain, "page connected");
        Ok(page)
    }

    /// Unregisters a disconnected page, resolving its pending requests
    /// with a disconnection error.
    pub fn unregister_page(&self, id: PageId) -> Option<Arc<Page>> {
        let page = self.pages.write().remove(&id)?;
        page.mark_disconnected();
        page.fail_all_pending(&NativeReply::failure(
            None,
            ExceptionModel::new("Page disconnected", codes::NATIVE_DISCONNECTED),
        ));
        debug!(page = %id, "page disconnected");
        Some(page)
    }

    /// Returns a registered page.
    #[must_use]
    pub fn page(&self, id: PageId) -> Option<Arc<Page>> {
        self.pages.read().get(&id).cloned()
    }

    /// Returns every registered page of a domain.
    #[must_use]
    pub fn domain_pages(&self, domain: &Domain) -> Vec<Arc<Page>> {
        self.pages
            .read()
            .values()
            .filter(|p| p.domain() == domain)
            .cloned()
            .collect()
    }

    fn target_pages(&self, target: &ConnectionTarget) -> Vec<Arc<Page>> {
        match target {
            ConnectionTarget::Private(id) => self.page(*id).into_iter().collect(),
            ConnectionTarget::Pooled(domain) => self.domain_pages(domain),
        }
    }

    // ========================================================================
    // Native Dispatch
    // ========================================================================

    /// Routes a native reply to the pending request it resolves.
    ///
    /// A reply with a request id resolves exactly that entry; without one,
    /// it resolves the single outstanding request across the target's page
    /// set, or nothing at all when that set holds zero or several.
    pub fn dispatch_native(&self, target: &ConnectionTarget, reply: NativeReply) {
        let pages = self.target_pages(target);

        if let Some(request_id) = reply.request_id {
            for page in &pages {
                if let Some(tx) = page.take_pending(&request_id) {
                    let _ = tx.send(reply);
                    return;
                }
            }
            warn!(%target, request = %request_id, "native reply matches no pending request");
            return;
        }

        // Legacy host without correlation ids: only an unambiguous match
        // may be resolved. Count across the page set before claiming, so
        // an ambiguous reply leaves every entry in place.
        let outstanding: usize = pages.iter().map(|p| p.pending_count()).sum();
        if outstanding > 1 {
            error!(%target, "uncorrelated native reply with several pending requests, dropping");
            return;
        }
        for page in &pages {
            if let SinglePending::One(tx) = page.take_single_pending() {
                let _ = tx.send(reply);
                return;
            }
        }
        warn!(%target, "uncorrelated native reply with nothing pending, dropping");
    }

    /// Handles a native transport disconnect: every page served by the
    /// target loses its handle and has its pending requests resolved with
    /// a disconnection error.
    pub fn native_disconnected(&self, target: &ConnectionTarget, error: Option<&str>) {
        let message = match error {
            Some(detail) => format!("Native component disconnected: {detail}"),
            None => "Native component disconnected".to_string(),
        };
        let failure = NativeReply::failure(
            None,
            ExceptionModel::new(message, codes::NATIVE_DISCONNECTED),
        );
        for page in self.target_pages(target) {
            page.clear_native();
            page.detach_from_pool();
            page.fail_all_pending(&failure);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
