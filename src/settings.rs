//! Persistent extension settings.
//!
//! Settings live in a key/value store behind the [`SettingsStore`] trait.
//! The [`Settings`] manager loads everything once at startup; reads issued
//! before the load completes queue on a readiness barrier instead of
//! observing defaults. Writes mutate memory synchronously and persist in
//! the background, so a slow store never blocks a command.
//!
//! # Logical Keys
//!
//! | Key | Value |
//! |-----|-------|
//! | `trace` | page/native tracing flag |
//! | `pkcs11` | extra PKCS#11 module paths |
//! | `uid` | durable anonymous installation id |
//! | `remoteDevices` | paired remote device records |
//! | `trust:<domain>:<thumb>` | site granted persistent access to a certificate |
//! | `certSubject:<thumb>` / `certIssuer:<thumb>` | display names for trust entries |
//! | `certCache:<thumb>` | cached certificate metadata |

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::devices::DeviceInfo;
use crate::error::{Error, Result};
use crate::identifiers::{DeviceId, Thumbprint};

// ============================================================================
// SettingsStore
// ============================================================================

/// Backing key/value store for settings.
#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    /// Loads every stored key/value pair.
    async fn load_all(&self) -> Result<Vec<(String, Value)>>;

    /// Stores the given key/value pairs, overwriting existing keys.
    async fn set(&self, entries: Vec<(String, Value)>) -> Result<()>;

    /// Removes a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory store used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<FxHashMap<String, Value>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store preloaded with the given entries.
    #[must_use]
    pub fn with_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<(String, Value)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut guard = self.entries.write();
        for (key, value) in entries {
            guard.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

// ============================================================================
// JsonFileStore
// ============================================================================

/// Store persisting settings as a single JSON object on disk.
///
/// Writes serialize through an async mutex so concurrent persists cannot
/// interleave partial files.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    io: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Creates a store backed by the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_map(&self) -> Result<FxHashMap<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let map = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::settings(format!("Corrupt settings file: {e}")))?;
                Ok(map)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FxHashMap::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map(&self, map: &FxHashMap<String, Value>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(map)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<(String, Value)>> {
        let _guard = self.io.lock().await;
        Ok(self.read_map().await?.into_iter().collect())
    }

    async fn set(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut map = self.read_map().await?;
        for (key, value) in entries {
            map.insert(key, value);
        }
        self.write_map(&map).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut map = self.read_map().await?;
        if map.remove(key).is_some() {
            self.write_map(&map).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Typed Settings State
// ============================================================================

/// Display names of a trusted certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertSummary {
    /// Certificate thumbprint.
    pub thumbprint: Thumbprint,
    /// Subject common name.
    pub subject_name: String,
    /// Issuer common name.
    pub issuer_name: String,
}

/// Snapshot of the configuration flags stamped onto native envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Whether tracing is enabled.
    pub trace: bool,
    /// Extra PKCS#11 module paths.
    pub pkcs11_modules: Vec<String>,
}

#[derive(Debug, Default)]
struct SettingsState {
    trace: bool,
    pkcs11_modules: Vec<String>,
    /// thumbprint -> (subject, issuer).
    cert_names: FxHashMap<Thumbprint, (String, String)>,
    cert_cache: FxHashMap<Thumbprint, Value>,
    /// "trust:domain:thumbprint" -> trusted.
    site_trust: FxHashMap<String, bool>,
    devices: FxHashMap<DeviceId, DeviceInfo>,
    uid: Option<String>,
}

fn trust_key(domain: &str, thumbprint: &Thumbprint) -> String {
    format!("trust:{domain}:{thumbprint}")
}

// ============================================================================
// Settings
// ============================================================================

/// Settings manager with queued-read load semantics.
pub struct Settings {
    store: Arc<dyn SettingsStore>,
    state: RwLock<SettingsState>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Settings {
    /// Creates a settings manager over the given store.
    ///
    /// The manager starts not-ready; call [`Settings::load`] (usually from
    /// a spawned task) to populate state and release queued readers.
    #[must_use]
    pub fn new(store: Arc<dyn SettingsStore>) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            store,
            state: RwLock::new(SettingsState::default()),
            ready_tx,
            ready_rx,
        })
    }

    /// Loads all stored entries into memory and marks the manager ready.
    ///
    /// A load failure still releases queued readers; they observe defaults
    /// and the failure is logged.
    pub async fn load(&self) {
        match self.store.load_all().await {
            Ok(entries) => {
                let count = entries.len();
                let mut state = self.state.write();
                for (key, value) in entries {
                    apply_entry(&mut state, &key, value);
                }
                drop(state);
                debug!(count, "settings loaded");
            }
            Err(e) => warn!(error = %e, "settings load failed, using defaults"),
        }
        let _ = self.ready_tx.send(true);
    }

    /// Waits until the initial load has completed.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        // Load failures also flip the flag, so this cannot wedge.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    // ========================================================================
    // Config Snapshot
    // ========================================================================

    /// Returns the tracing/pkcs11 snapshot stamped onto native envelopes.
    pub async fn snapshot(&self) -> ConfigSnapshot {
        self.ready().await;
        let state = self.state.read();
        ConfigSnapshot {
            trace: state.trace,
            pkcs11_modules: state.pkcs11_modules.clone(),
        }
    }

    /// Enables or disables tracing.
    pub async fn set_trace(&self, trace: bool) {
        self.ready().await;
        self.state.write().trace = trace;
        self.persist(vec![("trace".to_string(), Value::Bool(trace))]);
    }

    /// Merges new PKCS#11 module paths into the configured set.
    ///
    /// Returns the merged list. Duplicates are ignored.
    pub async fn add_pkcs11_modules(&self, modules: Vec<String>) -> Vec<String> {
        self.ready().await;
        let merged = {
            let mut state = self.state.write();
            for module in modules {
                if !state.pkcs11_modules.contains(&module) {
                    state.pkcs11_modules.push(module);
                }
            }
            state.pkcs11_modules.clone()
        };
        self.persist(vec![(
            "pkcs11".to_string(),
            Value::from(merged.clone()),
        )]);
        merged
    }

    // ========================================================================
    // Site Trust
    // ========================================================================

    /// Returns whether a site holds persistent access to a certificate.
    ///
    /// `None` means the user has never decided; `Some(false)` means access
    /// was explicitly revoked.
    pub async fn site_trust(&self, domain: &str, thumbprint: &Thumbprint) -> Option<bool> {
        self.ready().await;
        self.state
            .read()
            .site_trust
            .get(&trust_key(domain, thumbprint))
            .copied()
    }

    /// Grants or revokes a site's persistent access to a certificate.
    ///
    /// Granting also records the certificate's display names so the
    /// options page can render the trust entry.
    pub async fn set_site_trust(&self, domain: &str, cert: &CertSummary, trusted: bool) {
        self.ready().await;
        let key = trust_key(domain, &cert.thumbprint);
        {
            let mut state = self.state.write();
            state.site_trust.insert(key.clone(), trusted);
            state.cert_names.insert(
                cert.thumbprint.clone(),
                (cert.subject_name.clone(), cert.issuer_name.clone()),
            );
        }
        self.persist(vec![
            (key, Value::Bool(trusted)),
            (
                format!("certSubject:{}", cert.thumbprint),
                Value::String(cert.subject_name.clone()),
            ),
            (
                format!("certIssuer:{}", cert.thumbprint),
                Value::String(cert.issuer_name.clone()),
            ),
        ]);
    }

    /// Removes a site trust decision entirely.
    pub async fn clear_site_trust(&self, domain: &str, thumbprint: &Thumbprint) {
        self.ready().await;
        let key = trust_key(domain, thumbprint);
        self.state.write().site_trust.remove(&key);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.remove(&key).await {
                warn!(error = %e, key, "settings remove failed");
            }
        });
    }

    /// Lists all recorded trust decisions as (domain, cert, trusted).
    pub async fn list_site_trust(&self) -> Vec<(String, CertSummary, bool)> {
        self.ready().await;
        let state = self.state.read();
        state
            .site_trust
            .iter()
            .filter_map(|(key, trusted)| {
                let rest = key.strip_prefix("trust:")?;
                let (domain, thumb) = rest.rsplit_once(':')?;
                let thumbprint = Thumbprint::new(thumb);
                let (subject, issuer) = state
                    .cert_names
                    .get(&thumbprint)
                    .cloned()
                    .unwrap_or_default();
                Some((
                    domain.to_string(),
                    CertSummary {
                        thumbprint,
                        subject_name: subject,
                        issuer_name: issuer,
                    },
                    *trusted,
                ))
            })
            .collect()
    }

    // ========================================================================
    // Certificate Cache
    // ========================================================================

    /// Returns cached certificate metadata for a thumbprint.
    pub async fn cert_cache(&self, thumbprint: &Thumbprint) -> Option<Value> {
        self.ready().await;
        self.state.read().cert_cache.get(thumbprint).cloned()
    }

    /// Caches certificate metadata for a thumbprint.
    pub async fn set_cert_cache(&self, thumbprint: Thumbprint, value: Value) {
        self.ready().await;
        let key = format!("certCache:{thumbprint}");
        self.state
            .write()
            .cert_cache
            .insert(thumbprint, value.clone());
        self.persist(vec![(key, value)]);
    }

    // ========================================================================
    // Installation Id
    // ========================================================================

    /// Returns the durable anonymous installation id, generating it on
    /// first use.
    pub async fn uid(&self) -> String {
        self.ready().await;
        if let Some(uid) = self.state.read().uid.clone() {
            return uid;
        }
        let uid = Uuid::new_v4().to_string();
        self.state.write().uid = Some(uid.clone());
        self.persist(vec![("uid".to_string(), Value::String(uid.clone()))]);
        uid
    }

    // ========================================================================
    // Remote Devices
    // ========================================================================

    /// Returns the paired remote device records.
    pub async fn devices(&self) -> Vec<DeviceInfo> {
        self.ready().await;
        self.state.read().devices.values().cloned().collect()
    }

    /// Inserts or replaces a device record and persists the registry.
    pub async fn upsert_device(&self, device: DeviceInfo) {
        self.ready().await;
        {
            let mut state = self.state.write();
            state.devices.insert(device.id.clone(), device);
        }
        self.persist_devices();
    }

    /// Removes a device record. Returns `true` if it existed.
    pub async fn remove_device(&self, id: &DeviceId) -> bool {
        self.ready().await;
        let removed = self.state.write().devices.remove(id).is_some();
        if removed {
            self.persist_devices();
        }
        removed
    }

    // ========================================================================
    // External Changes
    // ========================================================================

    /// Applies a change made behind the manager's back (another extension
    /// page writing to the same store).
    pub fn apply_external_change(&self, key: &str, value: Value) {
        apply_entry(&mut self.state.write(), key, value);
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Probe read keeping the service worker alive. The value is unused;
    /// the store round trip is the point.
    pub async fn keepalive_probe(&self) {
        if let Err(e) = self.store.load_all().await {
            warn!(error = %e, "keepalive settings probe failed");
        }
    }

    fn persist(&self, entries: Vec<(String, Value)>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.set(entries).await {
                warn!(error = %e, "settings persist failed");
            }
        });
    }

    fn persist_devices(&self) {
        let devices: Vec<Value> = self
            .state
            .read()
            .devices
            .values()
            .filter_map(|d| serde_json::to_value(d).ok())
            .collect();
        self.persist(vec![("remoteDevices".to_string(), Value::Array(devices))]);
    }
}

fn apply_entry(state: &mut SettingsState, key: &str, value: Value) {
    if key == "trace" {
        state.trace = value.as_bool().unwrap_or(false);
    } else if key == "pkcs11" {
        state.pkcs11_modules = value
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
    } else if key == "uid" {
        state.uid = value.as_str().map(str::to_string);
    } else if key == "remoteDevices" {
        state.devices = value
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| serde_json::from_value::<DeviceInfo>(v.clone()).ok())
                    .map(|d| (d.id.clone(), d))
                    .collect()
            })
            .unwrap_or_default();
    } else if key.starts_with("trust:") {
        state
            .site_trust
            .insert(key.to_string(), value.as_bool().unwrap_or(false));
    } else if let Some(thumb) = key.strip_prefix("certSubject:") {
        let thumbprint = Thumbprint::new(thumb);
        let entry = state.cert_names.entry(thumbprint).or_default();
        entry.0 = value.as_str().unwrap_or_default().to_string();
    } else if let Some(thumb) = key.strip_prefix("certIssuer:") {
        let thumbprint = Thumbprint::new(thumb);
        let entry = state.cert_names.entry(thumbprint).or_default();
        entry.1 = value.as_str().unwrap_or_default().to_string();
    } else if let Some(thumb) = key.strip_prefix("certCache:") {
        state.cert_cache.insert(Thumbprint::new(thumb), value);
    } else {
        debug!(key, "ignoring unknown settings key");
    }
}

// ============================================================================
// Tests
// ============================================================================
