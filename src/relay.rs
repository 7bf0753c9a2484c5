//! Relay composition root.
//!
//! A [`Relay`] wires the router, pool, dispatcher, settings, blacklist and
//! device manager together and exposes the three entry points the
//! extension glue calls: page connected, page message, page disconnected.
//!
//! # Example
//!
//! ```ignore
//! use websigner_relay::{Relay, RelayConfig, transport::ProcessLauncher};
//!
//! let relay = Relay::builder(RelayConfig {
//!     extension_id: "bbafmabaelnnkondpfpjmdklbmfnbmol".into(),
//!     extension_version: "2.17.1".into(),
//!     language: "en".into(),
//!     user_os: "Linux".into(),
//!     home_endpoint: None,
//!     rest_pki_base_url: None,
//! })
//! .launcher(Arc::new(ProcessLauncher::new("/usr/bin/websigner-host", vec![])))
//! .build()?;
//!
//! let page = relay.page_connected(transport)?;
//! relay.page_message(&page, request);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tracing::debug;

use crate::blacklist::Blacklist;
use crate::devices::{NullDeviceManager, RemoteDeviceManager};
use crate::dispatch::CommandDispatcher;
use crate::error::{Error, Result};
use crate::identifiers::PageId;
use crate::protocol::PageRequest;
use crate::router::{Page, RequestRouter};
use crate::settings::{MemoryStore, Settings, SettingsStore};
use crate::transport::{NativeConnectionPool, NativeLauncher, PageTransport};

// ============================================================================
// RelayConfig
// ============================================================================

/// Static relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// This extension's id, used to recognize its own pages.
    pub extension_id: String,
    /// This extension's version.
    pub extension_version: String,
    /// UI language stamped onto native envelopes.
    pub language: String,
    /// Operating system reported by the browser (`Windows`, `Linux`,
    /// `Darwin`).
    pub user_os: String,
    /// Endpoint publishing the domain restriction table, if any.
    pub home_endpoint: Option<String>,
    /// Base URL of the REST signing service; `None` selects the default
    /// well-known endpoint.
    pub rest_pki_base_url: Option<String>,
}

// ============================================================================
// RelayBuilder
// ============================================================================

/// Builder for [`Relay`].
pub struct RelayBuilder {
    config: RelayConfig,
    launcher: Option<Arc<dyn NativeLauncher>>,
    store: Option<Arc<dyn SettingsStore>>,
    devices: Option<Arc<dyn RemoteDeviceManager>>,
    http: Option<reqwest::Client>,
}

impl RelayBuilder {
    /// Sets the native host launcher. Required.
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn NativeLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Sets the settings store. Defaults to an in-memory store.
    #[must_use]
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the remote device manager. Defaults to no devices.
    #[must_use]
    pub fn device_manager(mut self, devices: Arc<dyn RemoteDeviceManager>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Sets the HTTP client shared by the blacklist and REST workflows.
    #[must_use]
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Builds the relay, spawning the settings load and the initial
    /// restriction table refresh.
    ///
    /// # Errors
    ///
    /// Returns an error when no launcher was configured.
    pub fn build(self) -> Result<Arc<Relay>> {
        let launcher = self
            .launcher
            .ok_or_else(|| Error::settings("A native launcher must be configured"))?;
        let config = Arc::new(self.config);
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let devices = self
            .devices
            .unwrap_or_else(|| Arc::new(NullDeviceManager));
        let http = self.http.unwrap_or_default();

        let settings = Settings::new(store);
        {
            let settings = Arc::clone(&settings);
            tokio::spawn(async move { settings.load().await });
        }

        let blacklist = Blacklist::new();
        blacklist.spawn_refresh(http.clone(), config.home_endpoint.clone());

        let router = RequestRouter::new(&config.extension_id);
        let pool = NativeConnectionPool::new(
            launcher,
            Arc::clone(&router),
            Arc::clone(&settings),
        );
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&config),
            Arc::clone(&pool),
            Arc::clone(&settings),
            Arc::clone(&blacklist),
            devices,
            http,
        );

        Ok(Arc::new(Relay {
            config,
            router,
            pool,
            dispatcher,
            settings,
            blacklist,
        }))
    }
}

// ============================================================================
// Relay
// ============================================================================

/// The assembled relay.
pub struct Relay {
    config: Arc<RelayConfig>,
    router: Arc<RequestRouter>,
    pool: Arc<NativeConnectionPool>,
    dispatcher: Arc<CommandDispatcher>,
    settings: Arc<Settings>,
    blacklist: Arc<Blacklist>,
}

impl Relay {
    /// Starts a builder over the given configuration.
    #[must_use]
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder {
            config,
            launcher: None,
            store: None,
            devices: None,
            http: None,
        }
    }

    /// Returns the relay configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Returns the settings manager (used by the options page glue).
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Returns the restriction table.
    #[inline]
    #[must_use]
    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    // ========================================================================
    // Page Lifecycle
    // ========================================================================

    /// Registers a newly connected page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when the page URL has no parseable
    /// host; such a page must not be served.
    pub fn page_connected(&self, transport: Arc<dyn PageTransport>) -> Result<Arc<Page>> {
        self.router.register_page(transport)
    }

    /// Handles one page request.
    ///
    /// Each request runs on its own task so a long-running command (a
    /// native PIN prompt, a poll loop) never blocks the page's other
    /// requests.
    pub fn page_message(&self, page: &Arc<Page>, request: PageRequest) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let page = Arc::clone(page);
        tokio::spawn(async move {
            dispatcher.handle_page_message(&page, request).await;
        });
    }

    /// Handles a page disconnect: pending requests resolve with a
    /// disconnection error and the page's pool reference is released.
    pub fn page_disconnected(&self, id: PageId) {
        if let Some(page) = self.router.unregister_page(id) {
            self.pool.release(&page);
        }
    }

    /// Shuts every native connection down.
    pub fn shutdown(&self) {
        debug!("relay shutting down");
        self.pool.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;

    use crate::testing::{ok_reply, FakePageTransport, ScriptedLauncher};
    use crate::transport::pool::DOMAIN_SHUTDOWN_DELAY;

    fn config() -> RelayConfig {
        RelayConfig {
            extension_id: "abcdefghijklmnop".into(),
            extension_version: "2.17.1".into(),
            language: "en".into(),
            user_os: "Linux".into(),
            home_endpoint: None,
            rest_pki_base_url: None,
        }
    }

    fn echo_relay() -> (Arc<Relay>, Arc<ScriptedLauncher>) {
        crate::testing::init_tracing();
        let launcher = ScriptedLauncher::new(|envelope| {
            ok_reply(envelope, json!({ "echo": envelope.request.clone() }))
        });
        let relay = Relay::builder(config())
            .launcher(Arc::clone(&launcher) as Arc<dyn NativeLauncher>)
            .build()
            .expect("build");
        (relay, launcher)
    }

    fn page_request(id: &str, command: &str, request: serde_json::Value) -> PageRequest {
        PageRequest {
            request_id: id.to_string(),
            license: None,
            command: command.to_string(),
            request,
            use_domain_native_pool: true,
        }
    }

    #[tokio::test]
    async fn test_builder_requires_launcher() {
        assert!(Relay::builder(config()).build().is_err());
    }

    #[tokio::test]
    async fn test_extension_version_round_trip() {
        let (relay, launcher) = echo_relay();
        let transport = FakePageTransport::new("https://example.com/sign");
        let page = relay
            .page_connected(Arc::clone(&transport) as Arc<dyn PageTransport>)
            .expect("connect");

        relay.page_message(&page, page_request("r1", "getExtensionVersion", json!({})));
        let replies = transport.wait_for_replies(1).await;
        assert!(replies[0].success);
        assert_eq!(
            replies[0].response.as_ref().expect("response")["version"],
            "2.17.1"
        );
        // Local-only command: no native host involved.
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate() {
        let (relay, _launcher) = echo_relay();
        let transport = FakePageTransport::new("https://example.com/sign");
        let page = relay
            .page_connected(Arc::clone(&transport) as Arc<dyn PageTransport>)
            .expect("connect");

        for i in 0..20 {
            relay.page_message(
                &page,
                page_request(&format!("r{i}"), "customCommand", json!({ "n": i })),
            );
        }
        let replies = transport.wait_for_replies(20).await;
        for reply in replies {
            assert!(reply.success);
            let n = reply.response.as_ref().expect("response")["echo"]["n"]
                .as_u64()
                .expect("n");
            assert_eq!(format!("r{n}"), reply.request_id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_releases_pool_reference() {
        let (relay, launcher) = echo_relay();
        let transport = FakePageTransport::new("https://example.com/sign");
        let page = relay
            .page_connected(Arc::clone(&transport) as Arc<dyn PageTransport>)
            .expect("connect");

        relay.page_message(&page, page_request("r1", "customCommand", json!({})));
        transport.wait_for_replies(1).await;
        assert_eq!(launcher.launches(), 1);

        relay.page_disconnected(page.id());
        tokio::time::sleep(DOMAIN_SHUTDOWN_DELAY + Duration::from_millis(1)).await;

        // A fresh page after the idle shutdown launches a new host.
        let transport2 = FakePageTransport::new("https://example.com/other");
        let page2 = relay
            .page_connected(Arc::clone(&transport2) as Arc<dyn PageTransport>)
            .expect("connect");
        relay.page_message(&page2, page_request("r2", "customCommand", json!({})));
        transport2.wait_for_replies(1).await;
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_unparsable_page_is_rejected() {
        let (relay, _launcher) = echo_relay();
        let transport = FakePageTransport::new("about:blank");
        assert!(relay
            .page_connected(transport as Arc<dyn PageTransport>)
            .is_err());
    }
}
