//! Native connection pool.
//!
//! One native host instance serves either a single page (private mode) or
//! every page of a domain (pooled mode). Pooled connections are reference
//! counted per attached page; when the count reaches zero the shutdown is
//! delayed so a page reload can reuse the warm host instead of paying a
//! fresh launch.
//!
//! # Lifecycle
//!
//! ```text
//! acquire ──► launch ──► ref=1 ──► release ──► ref=0 ──► delay ──► probe+drop
//!                 ▲                                        │
//!                 └──────────── re-acquire cancels ────────┘
//! ```
//!
//! A native transport disconnect removes the pool entry immediately, fails
//! the pending requests of every served page through the router, and lets
//! the next call launch a fresh host.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::Result;
use crate::identifiers::{Domain, PageId};
use crate::router::{Page, RequestRouter};
use crate::settings::Settings;

use super::connection::{ConnectionTarget, NativeConnection};
use super::native::{NativeEvent, NativeLauncher};

// ============================================================================
// Constants
// ============================================================================

/// Shutdown delay for the popup's pooled connection. The popup closes and
/// reopens constantly; keeping the host warm longer buys nothing.
pub const POPUP_SHUTDOWN_DELAY: Duration = Duration::from_millis(100);

/// Shutdown delay for a regular domain's pooled connection, sized to
/// survive a page reload.
pub const DOMAIN_SHUTDOWN_DELAY: Duration = Duration::from_secs(30);

/// Interval of the keepalive probe that runs while any connection lives.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

// ============================================================================
// PoolEntry
// ============================================================================

struct PoolEntry {
    connection: NativeConnection,
    /// Pages currently attached to this connection.
    ref_count: usize,
    /// Scheduled delayed shutdown, present only while ref_count is zero.
    shutdown: Option<JoinHandle<()>>,
}

// ============================================================================
// NativeConnectionPool
// ============================================================================

/// Pool of live native connections.
pub struct NativeConnectionPool {
    launcher: Arc<dyn NativeLauncher>,
    router: Arc<RequestRouter>,
    settings: Arc<Settings>,
    pooled: Mutex<FxHashMap<Domain, PoolEntry>>,
    private: Mutex<FxHashMap<PageId, NativeConnection>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl NativeConnectionPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(
        launcher: Arc<dyn NativeLauncher>,
        router: Arc<RequestRouter>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            router,
            settings,
            pooled: Mutex::new(FxHashMap::default()),
            private: Mutex::new(FxHashMap::default()),
            keepalive: Mutex::new(None),
        })
    }

    // ========================================================================
    // Acquire
    // ========================================================================

    /// Returns the connection serving a page, launching the native host
    /// lazily on first use.
    ///
    /// Re-acquiring a pooled connection cancels its scheduled shutdown.
    /// Each page holds at most one pool reference regardless of how many
    /// requests it issues.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NativeConnectFailure`] when launching fails.
    /// The failed call is never retried; the next call launches again.
    pub fn handle_for(self: &Arc<Self>, page: &Page) -> Result<NativeConnection> {
        let connection = if page.pooled() {
            self.pooled_handle(page)?
        } else {
            self.private_handle(page)?
        };
        page.set_native(connection.clone());
        self.ensure_keepalive();
        Ok(connection)
    }

    fn pooled_handle(self: &Arc<Self>, page: &Page) -> Result<NativeConnection> {
        let domain = page.domain().clone();
        let mut pooled = self.pooled.lock();

        if let Some(entry) = pooled.get_mut(&domain) {
            if let Some(shutdown) = entry.shutdown.take() {
                trace!(%domain, "cancelling scheduled pool shutdown");
                shutdown.abort();
            }
            if page.attach_to_pool() {
                entry.ref_count += 1;
            }
            return Ok(entry.connection.clone());
        }

        let target = ConnectionTarget::Pooled(domain.clone());
        let connection = self.launch(target)?;
        // A stale attach flag from a dead connection still counts as this
        // page's single reference.
        let _ = page.attach_to_pool();
        pooled.insert(
            domain,
            PoolEntry {
                connection: connection.clone(),
                ref_count: 1,
                shutdown: None,
            },
        );
        Ok(connection)
    }

    fn private_handle(self: &Arc<Self>, page: &Page) -> Result<NativeConnection> {
        let mut private = self.private.lock();
        if let Some(connection) = private.get(&page.id()) {
            return Ok(connection.clone());
        }
        let connection = self.launch(ConnectionTarget::Private(page.id()))?;
        private.insert(page.id(), connection.clone());
        Ok(connection)
    }

    fn launch(self: &Arc<Self>, target: ConnectionTarget) -> Result<NativeConnection> {
        let channel = self.launcher.launch()?;
        debug!(%target, "native connection established");
        let connection = NativeConnection::new(target.clone(), channel.outgoing);
        self.spawn_pump(target, channel.events);
        Ok(connection)
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Releases a page's hold on its connection.
    ///
    /// Private connections get the shutdown probe immediately. Pooled
    /// connections decrement once per attached page; the last detach
    /// schedules the delayed shutdown.
    pub fn release(self: &Arc<Self>, page: &Page) {
        if let Some(connection) = self.private.lock().remove(&page.id()) {
            connection.post_shutdown_probe();
        }

        if page.detach_from_pool() {
            let domain = page.domain().clone();
            let mut pooled = self.pooled.lock();
            if let Some(entry) = pooled.get_mut(&domain) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    entry.shutdown = Some(self.schedule_shutdown(domain.clone()));
                }
            }
        }
    }

    fn schedule_shutdown(self: &Arc<Self>, domain: Domain) -> JoinHandle<()> {
        let delay = if domain.is_popup() {
            POPUP_SHUTDOWN_DELAY
        } else {
            DOMAIN_SHUTDOWN_DELAY
        };
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut pooled = pool.pooled.lock();
            // A page may have re-attached between the timer firing and the
            // lock being taken.
            if pooled.get(&domain).is_some_and(|e| e.ref_count == 0)
                && let Some(entry) = pooled.remove(&domain)
            {
                debug!(%domain, "shutting down idle pooled connection");
                entry.connection.post_shutdown_probe();
            }
        })
    }

    // ========================================================================
    // Disconnect Cleanup
    // ========================================================================

    /// Drops the pool's knowledge of a target whose transport is gone.
    pub fn forget(&self, target: &ConnectionTarget) {
        match target {
            ConnectionTarget::Private(id) => {
                self.private.lock().remove(id);
            }
            ConnectionTarget::Pooled(domain) => {
                if let Some(entry) = self.pooled.lock().remove(domain)
                    && let Some(shutdown) = entry.shutdown
                {
                    shutdown.abort();
                }
            }
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        target: ConnectionTarget,
        mut events: tokio::sync::mpsc::UnboundedReceiver<NativeEvent>,
    ) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let error = loop {
                match events.recv().await {
                    Some(NativeEvent::Message(reply)) => {
                        pool.router.dispatch_native(&target, reply);
                    }
                    Some(NativeEvent::Disconnected { error }) => break error,
                    None => break None,
                }
            };
            debug!(%target, ?error, "native connection closed");
            pool.forget(&target);
            pool.router.native_disconnected(&target, error.as_deref());
        });
    }

    // ========================================================================
    // Keepalive
    // ========================================================================

    /// Returns `true` while any connection is alive.
    #[must_use]
    pub fn has_connections(&self) -> bool {
        !self.pooled.lock().is_empty() || !self.private.lock().is_empty()
    }

    fn ensure_keepalive(self: &Arc<Self>) {
        let mut slot = self.keepalive.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let pool = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !pool.has_connections() {
                    break;
                }
                // The settings read keeps the extension's service worker
                // alive while a native host is still working.
                pool.settings.keepalive_probe().await;
            }
        }));
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Drops every connection, probing each so the hosts exit promptly.
    pub fn shutdown(&self) {
        for (_, entry) in self.pooled.lock().drain() {
            if let Some(shutdown) = entry.shutdown {
                shutdown.abort();
            }
            entry.connection.post_shutdown_probe();
        }
        for (_, connection) in self.private.lock().drain() {
            connection.post_shutdown_probe();
        }
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use crate::protocol::{NativeEnvelope, PageReply};
    use crate::settings::MemoryStore;
    use crate::transport::{NativeChannel, PageSender, PageTransport};

    struct NullTransport(String);

    impl PageTransport for NullTransport {
        fn sender(&self) -> PageSender {
            PageSender {
                url: self.0.clone(),
                tab_url: None,
            }
        }

        fn post(&self, _reply: PageReply) {}
    }

    /// Launcher that counts launches and keeps channel ends open.
    struct CountingLauncher {
        launches: AtomicUsize,
        keep: Mutex<Vec<(mpsc::UnboundedReceiver<NativeEnvelope>, mpsc::UnboundedSender<NativeEvent>)>>,
    }

    impl CountingLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                keep: Mutex::new(Vec::new()),
            })
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    impl NativeLauncher for CountingLauncher {
        fn launch(&self) -> Result<NativeChannel> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            self.keep.lock().push((out_rx, event_tx));
            Ok(NativeChannel {
                outgoing: out_tx,
                events: event_rx,
            })
        }
    }

    struct Fixture {
        launcher: Arc<CountingLauncher>,
        router: Arc<RequestRouter>,
        pool: Arc<NativeConnectionPool>,
    }

    async fn fixture() -> Fixture {
        let launcher = CountingLauncher::new();
        let router = RequestRouter::new("abcdefghijklmnop");
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        settings.load().await;
        let pool = NativeConnectionPool::new(
            Arc::clone(&launcher) as Arc<dyn NativeLauncher>,
            Arc::clone(&router),
            settings,
        );
        Fixture {
            launcher,
            router,
            pool,
        }
    }

    fn pooled_page(f: &Fixture, url: &str) -> Arc<Page> {
        let page = f
            .router
            .register_page(Arc::new(NullTransport(url.to_string())))
            .expect("register");
        page.set_pooled(true);
        page
    }

    #[tokio::test]
    async fn test_pooled_pages_share_one_launch() {
        let f = fixture().await;
        let a = pooled_page(&f, "https://example.com/a");
        let b = pooled_page(&f, "https://example.com/b");

        f.pool.handle_for(&a).expect("a");
        f.pool.handle_for(&b).expect("b");
        assert_eq!(f.launcher.launches(), 1);

        let other = pooled_page(&f, "https://other.com/");
        f.pool.handle_for(&other).expect("other");
        assert_eq!(f.launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_private_pages_launch_separately() {
        let f = fixture().await;
        let a = f
            .router
            .register_page(Arc::new(NullTransport("https://example.com/a".into())))
            .expect("register");
        let b = f
            .router
            .register_page(Arc::new(NullTransport("https://example.com/b".into())))
            .expect("register");

        f.pool.handle_for(&a).expect("a");
        f.pool.handle_for(&a).expect("a again");
        f.pool.handle_for(&b).expect("b");
        assert_eq!(f.launcher.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_within_delay_reuses_connection() {
        let f = fixture().await;
        let page = pooled_page(&f, "https://example.com/a");
        f.pool.handle_for(&page).expect("acquire");
        f.pool.release(&page);

        tokio::time::sleep(Duration::from_secs(29)).await;
        let again = pooled_page(&f, "https://example.com/b");
        f.pool.handle_for(&again).expect("reacquire");
        assert_eq!(f.launcher.launches(), 1);

        // The cancelled shutdown never fires.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(f.pool.has_connections());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_shuts_down_after_delay() {
        let f = fixture().await;
        let page = pooled_page(&f, "https://example.com/a");
        f.pool.handle_for(&page).expect("acquire");
        f.pool.release(&page);

        tokio::time::sleep(DOMAIN_SHUTDOWN_DELAY + Duration::from_millis(1)).await;
        assert!(!f.pool.has_connections());

        let again = pooled_page(&f, "https://example.com/b");
        f.pool.handle_for(&again).expect("relaunch");
        assert_eq!(f.launcher.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_popup_uses_short_delay() {
        let f = fixture().await;
        let popup = f
            .router
            .register_page(Arc::new(NullTransport(
                "chrome-extension://abcdefghijklmnop/popup.html".into(),
            )))
            .expect("register");
        popup.set_pooled(true);

        f.pool.handle_for(&popup).expect("acquire");
        f.pool.release(&popup);

        tokio::time::sleep(POPUP_SHUTDOWN_DELAY + Duration::from_millis(1)).await;
        assert!(!f.pool.has_connections());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_release_decrements_once() {
        let f = fixture().await;
        let a = pooled_page(&f, "https://example.com/a");
        let b = pooled_page(&f, "https://example.com/b");
        f.pool.handle_for(&a).expect("a");
        f.pool.handle_for(&b).expect("b");

        // Releasing the same page twice must not count for page b.
        f.pool.release(&a);
        f.pool.release(&a);
        tokio::time::sleep(DOMAIN_SHUTDOWN_DELAY + Duration::from_millis(1)).await;
        assert!(f.pool.has_connections());

        f.pool.release(&b);
        tokio::time::sleep(DOMAIN_SHUTDOWN_DELAY + Duration::from_millis(1)).await;
        assert!(!f.pool.has_connections());
    }

    #[tokio::test]
    async fn test_native_disconnect_clears_entry_and_fails_pending() {
        let f = fixture().await;
        let page = pooled_page(&f, "https://example.com/a");
        f.pool.handle_for(&page).expect("acquire");
        let rx = page.register_pending(crate::identifiers::RequestId::generate());

        let event_tx = f.launcher.keep.lock()[0].1.clone();
        event_tx
            .send(NativeEvent::Disconnected {
                error: Some("crashed".into()),
            })
            .expect("send");

        let reply = rx.await.expect("resolved");
        assert_eq!(
            reply.exception.expect("exception").code,
            "native_disconnected"
        );
        // Entry is gone, so the next call relaunches.
        tokio::task::yield_now().await;
        assert!(!f.pool.has_connections());
        f.pool.handle_for(&page).expect("relaunch");
        assert_eq!(f.launcher.launches(), 2);
    }
}
