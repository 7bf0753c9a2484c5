//! Per-page state.
//!
//! A [`Page`] tracks everything the relay knows about one connected page:
//! its origin domain, pooling preference, license, pending native requests,
//! registered path handles and pre-authorized signature quota.

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::identifiers::{Domain, PageId, PathId, RequestId, Thumbprint};
use crate::protocol::{NativeReply, PageReply};
use crate::transport::{NativeConnection, PageTransport};

// ============================================================================
// SinglePending
// ============================================================================

/// Outcome of claiming the single pending request of a page set.
pub enum SinglePending {
    /// Nothing outstanding.
    None,
    /// Exactly one entry, now claimed.
    One(oneshot::Sender<NativeReply>),
    /// More than one entry; claiming would be a guess.
    Many,
}

// ============================================================================
// Page
// ============================================================================

/// One connected page.
pub struct Page {
    id: PageId,
    domain: Domain,
    transport: Arc<dyn PageTransport>,
    disconnected: AtomicBool,
    /// Pooling preference from the page's requests.
    pooled: AtomicBool,
    /// Whether this page currently holds a pool reference.
    pool_attached: AtomicBool,
    license: Mutex<Option<String>>,
    native: Mutex<Option<NativeConnection>>,
    pending: Mutex<FxHashMap<RequestId, oneshot::Sender<NativeReply>>>,
    paths: Mutex<FxHashMap<PathId, PathBuf>>,
    preauthorized: Mutex<FxHashMap<Thumbprint, u32>>,
}

impl Page {
    /// Creates a page over its transport.
    #[must_use]
    pub fn new(id: PageId, domain: Domain, transport: Arc<dyn PageTransport>) -> Arc<Self> {
        Arc::new(Self {
            id,
            domain,
            transport,
            disconnected: AtomicBool::new(false),
            pooled: AtomicBool::new(false),
            pool_attached: AtomicBool::new(false),
            license: Mutex::new(None),
            native: Mutex::new(None),
            pending: Mutex::new(FxHashMap::default()),
            paths: Mutex::new(FxHashMap::default()),
            preauthorized: Mutex::new(FxHashMap::default()),
        })
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Returns the page id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Returns the page's origin domain.
    #[inline]
    #[must_use]
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Returns `true` if this is the extension popup.
    #[inline]
    #[must_use]
    pub fn is_popup(&self) -> bool {
        self.domain.is_popup()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Returns `true` once the page's transport is gone.
    #[inline]
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Marks the page disconnected. Idempotent.
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    // ========================================================================
    // Pooling
    // ========================================================================

    /// Records the page's pooling preference.
    pub fn set_pooled(&self, pooled: bool) {
        self.pooled.store(pooled, Ordering::Release);
    }

    /// Returns the page's pooling preference.
    #[inline]
    #[must_use]
    pub fn pooled(&self) -> bool {
        self.pooled.load(Ordering::Acquire)
    }

    /// Claims this page's pool reference. Returns `true` only on the first
    /// claim since the last detach, so a reference is counted once per page.
    pub fn attach_to_pool(&self) -> bool {
        !self.pool_attached.swap(true, Ordering::AcqRel)
    }

    /// Releases this page's pool reference. Returns `true` only if one was
    /// held, so a double release decrements nothing.
    pub fn detach_from_pool(&self) -> bool {
        self.pool_attached.swap(false, Ordering::AcqRel)
    }

    // ========================================================================
    // License
    // ========================================================================

    /// Records the license from the page's latest request.
    pub fn set_license(&self, license: Option<String>) {
        *self.license.lock() = license;
    }

    /// Returns the page's current license.
    #[must_use]
    pub fn license(&self) -> Option<String> {
        self.license.lock().clone()
    }

    // ========================================================================
    // Native Handle
    // ========================================================================

    /// Stores the connection serving this page.
    pub fn set_native(&self, connection: NativeConnection) {
        *self.native.lock() = Some(connection);
    }

    /// Returns the connection serving this page, if attached.
    #[must_use]
    pub fn native(&self) -> Option<NativeConnection> {
        self.native.lock().clone()
    }

    /// Drops the connection handle after a native disconnect.
    pub fn clear_native(&self) {
        *self.native.lock() = None;
    }

    // ========================================================================
    // Pending Requests
    // ========================================================================

    /// Registers a pending native request, returning the receiver its
    /// reply will arrive on.
    #[must_use]
    pub fn register_pending(&self, request_id: RequestId) -> oneshot::Receiver<NativeReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        rx
    }

    /// Claims the pending entry for a request id.
    #[must_use]
    pub fn take_pending(&self, request_id: &RequestId) -> Option<oneshot::Sender<NativeReply>> {
        self.pending.lock().remove(request_id)
    }

    /// Drops a pending entry without resolving it (caller timed out or
    /// gave up).
    pub fn forget_pending(&self, request_id: &RequestId) {
        self.pending.lock().remove(request_id);
    }

    /// Returns how many native requests are outstanding.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Claims the single pending entry, if there is exactly one.
    #[must_use]
    pub fn take_single_pending(&self) -> SinglePending {
        let mut pending = self.pending.lock();
        match pending.len() {
            0 => SinglePending::None,
            1 => pending
                .drain()
                .next()
                .map_or(SinglePending::None, |(_, tx)| SinglePending::One(tx)),
            _ => SinglePending::Many,
        }
    }

    /// Resolves every pending request with the given reply.
    pub fn fail_all_pending(&self, reply: &NativeReply) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (request_id, tx) in drained {
            trace!(page = %self.id, request = %request_id, "failing pending request");
            let _ = tx.send(NativeReply {
                request_id: Some(request_id),
                ..reply.clone()
            });
        }
    }

    // ========================================================================
    // Path Registry
    // ========================================================================

    /// Registers a filesystem path, returning its opaque handle.
    #[must_use]
    pub fn register_path(&self, path: PathBuf) -> PathId {
        let id = PathId::generate();
        self.paths.lock().insert(id, path);
        id
    }

    /// Resolves a handle registered by this page.
    #[must_use]
    pub fn resolve_path(&self, id: &PathId) -> Option<PathBuf> {
        self.paths.lock().get(id).cloned()
    }

    // ========================================================================
    // Pre-authorized Signatures
    // ========================================================================

    /// Grants a pre-authorized signature quota for a certificate.
    pub fn preauthorize(&self, thumbprint: Thumbprint, count: u32) {
        if count == 0 {
            self.preauthorized.lock().remove(&thumbprint);
        } else {
            self.preauthorized.lock().insert(thumbprint, count);
        }
    }

    /// Consumes one unit of pre-authorized quota. Returns `false` when the
    /// quota is exhausted or was never granted.
    pub fn consume_preauthorization(&self, thumbprint: &Thumbprint) -> bool {
        self.consume_preauthorizations(thumbprint, 1)
    }

    /// Consumes `count` units of pre-authorized quota atomically. A quota
    /// smaller than `count` is left untouched and the call returns `false`.
    pub fn consume_preauthorizations(&self, thumbprint: &Thumbprint, count: u32) -> bool {
        let mut quota = self.preauthorized.lock();
        match quota.get_mut(thumbprint) {
            Some(remaining) if *remaining >= count => {
                *remaining -= count;
                if *remaining == 0 {
                    quota.remove(thumbprint);
                }
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // Replies
    // ========================================================================

    /// Posts a reply to the page. Dropped silently once disconnected.
    pub fn post(&self, reply: PageReply) {
        if self.is_disconnected() {
            trace!(page = %self.id, request = %reply.request_id, "dropping reply to disconnected page");
            return;
        }
        self.transport.post(reply);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::PageSender;

    struct NullTransport;

    impl PageTransport for NullTransport {
        fn sender(&self) -> PageSender {
            PageSender {
                url: "https://example.com/".into(),
                tab_url: None,
            }
        }

        fn post(&self, _reply: PageReply) {}
    }

    fn page() -> Arc<Page> {
        Page::new(
            PageId::next(),
            Domain::from_host("example.com"),
            Arc::new(NullTransport),
        )
    }

    #[test]
    fn test_pool_attach_is_counted_once() {
        let page = page();
        assert!(page.attach_to_pool());
        assert!(!page.attach_to_pool());
        assert!(page.detach_from_pool());
        assert!(!page.detach_from_pool());
        assert!(page.attach_to_pool());
    }

    #[tokio::test]
    async fn test_pending_registration_and_claim() {
        let page = page();
        let id = RequestId::generate();
        let rx = page.register_pending(id);
        assert_eq!(page.pending_count(), 1);

        let tx = page.take_pending(&id).expect("claimed");
        tx.send(NativeReply {
            request_id: Some(id),
            success: true,
            response: None,
            exception: None,
            stream_id: None,
            stream_length: None,
        })
        .expect("send");
        assert!(rx.await.expect("reply").success);
        assert_eq!(page.pending_count(), 0);
    }

    #[test]
    fn test_single_pending_claim_rules() {
        let page = page();
        assert!(matches!(page.take_single_pending(), SinglePending::None));

        let _rx1 = page.register_pending(RequestId::generate());
        let _rx2 = page.register_pending(RequestId::generate());
        assert!(matches!(page.take_single_pending(), SinglePending::Many));
        assert_eq!(page.pending_count(), 2);
    }

    #[test]
    fn test_preauthorization_quota() {
        let page = page();
        let thumb = Thumbprint::from("AA");
        assert!(!page.consume_preauthorization(&thumb));

        page.preauthorize(thumb.clone(), 2);
        assert!(page.consume_preauthorization(&thumb));
        assert!(page.consume_preauthorization(&thumb));
        assert!(!page.consume_preauthorization(&thumb));
    }

    #[test]
    fn test_path_registry_is_per_page() {
        let first = page();
        let second = page();
        let id = first.register_path(PathBuf::from("/tmp/doc.pdf"));
        assert_eq!(first.resolve_path(&id), Some(PathBuf::from("/tmp/doc.pdf")));
        assert_eq!(second.resolve_path(&id), None);
    }
}
