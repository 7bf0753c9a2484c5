//! Paired remote signing devices.
//!
//! A remote device (typically a phone holding certificates) can answer a
//! subset of native commands. The relay only sees devices through the
//! [`RemoteDeviceManager`] trait; the concrete pairing transport lives
//! outside this crate. [`NullDeviceManager`] is the default and reports no
//! devices.
//!
//! Device failures carry `mobile_*` codes. Health bookkeeping records them
//! on the device record so the options page can prompt the user to resync.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{codes, Error, Result};
use crate::identifiers::{DeviceId, Thumbprint};
use crate::protocol::NativeEnvelope;
use crate::settings::Settings;

// ============================================================================
// DeviceInfo
// ============================================================================

/// How urgently a device needs the user's attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResyncLevel {
    /// The device rejected our session; it must be re-paired.
    Alert,
    /// The device is unreachable; it may just be offline.
    Warn,
}

/// Persisted record of a paired remote device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device identity.
    pub id: DeviceId,
    /// User-visible device name.
    pub name: String,
    /// Session id established at pairing time.
    pub session_id: String,
    /// Session key proving the pairing.
    pub key: String,
    /// Whether the device participates in command routing.
    pub enabled: bool,
    /// Milliseconds since epoch of the last certificate refresh.
    #[serde(default)]
    pub refreshed_at: Option<u64>,
    /// Pending user attention, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_level: Option<ResyncLevel>,
    /// Cached certificates the device reported, keyed by thumbprint.
    #[serde(default)]
    pub known_certificates: FxHashMap<Thumbprint, Value>,
}

impl DeviceInfo {
    /// Returns `true` if the device claims to hold the given certificate.
    #[inline]
    #[must_use]
    pub fn holds_certificate(&self, thumbprint: &Thumbprint) -> bool {
        self.known_certificates.contains_key(thumbprint)
    }
}

// ============================================================================
// DeviceClient
// ============================================================================

/// Transport to one connected remote device.
#[async_trait]
pub trait DeviceClient: Send + Sync + 'static {
    /// Sends an envelope to the device and awaits its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Native`] with a `mobile_*` code for transport and
    /// authorization failures, or with the device's own exception when the
    /// command itself failed.
    async fn send_message(&self, envelope: &NativeEnvelope) -> Result<Value>;
}

/// A paired device with a live transport.
pub struct ConnectedDevice {
    /// Mutable device record, shared with health bookkeeping.
    pub info: Mutex<DeviceInfo>,
    /// Transport to the device.
    pub client: Arc<dyn DeviceClient>,
}

impl ConnectedDevice {
    /// Creates a connected device.
    #[must_use]
    pub fn new(info: DeviceInfo, client: Arc<dyn DeviceClient>) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(info),
            client,
        })
    }
}

// ============================================================================
// RemoteDeviceManager
// ============================================================================

/// Registry of currently connected remote devices.
pub trait RemoteDeviceManager: Send + Sync + 'static {
    /// Returns the connected devices, paired order.
    fn connected_devices(&self) -> Vec<Arc<ConnectedDevice>>;
}

/// Manager reporting no devices. Used when remote devices are not set up.
#[derive(Debug, Default)]
pub struct NullDeviceManager;

impl RemoteDeviceManager for NullDeviceManager {
    fn connected_devices(&self) -> Vec<Arc<ConnectedDevice>> {
        Vec::new()
    }
}

/// Finds the enabled connected device holding the given certificate.
#[must_use]
pub fn device_for_thumbprint(
    manager: &dyn RemoteDeviceManager,
    thumbprint: &Thumbprint,
) -> Option<Arc<ConnectedDevice>> {
    manager.connected_devices().into_iter().find(|device| {
        let info = device.info.lock();
        info.enabled && info.holds_certificate(thumbprint)
    })
}

// ============================================================================
// Health Bookkeeping
// ============================================================================

/// Records a device failure on its persisted record.
///
/// Returns `true` if the failure is a health code (`mobile_*`) that silent
/// paths may absorb; any other code must always surface to the caller.
pub async fn record_device_failure(
    settings: &Settings,
    device: &ConnectedDevice,
    error: &Error,
) -> bool {
    let updated = {
        let mut info = device.info.lock();
        match error.code() {
            codes::MOBILE_NOT_AUTHORIZED => {
                info.resync_level = Some(ResyncLevel::Alert);
                info.enabled = false;
                Some(info.clone())
            }
            codes::MOBILE_TIMEOUT | codes::MOBILE_SEND_MESSAGE => {
                info.resync_level = Some(ResyncLevel::Warn);
                Some(info.clone())
            }
            _ => None,
        }
    };
    match updated {
        Some(info) => {
            warn!(device = %info.id, code = error.code(), "remote device failure recorded");
            settings.upsert_device(info).await;
            true
        }
        None => false,
    }
}

/// Replaces a device's certificate cache from a fresh `listCertificates`
/// result and stamps the refresh time.
pub async fn refresh_device_certificates(
    settings: &Settings,
    device: &ConnectedDevice,
    certificates: &Value,
) {
    let Some(list) = certificates.as_array() else {
        return;
    };
    let refreshed: FxHashMap<Thumbprint, Value> = list
        .iter()
        .filter_map(|cert| {
            let thumb = cert.get("thumbprint")?.as_str()?;
            Some((Thumbprint::from(thumb), cert.clone()))
        })
        .collect();

    let info = {
        let mut info = device.info.lock();
        info.known_certificates = refreshed;
        info.refreshed_at = Some(now_millis());
        info.resync_level = None;
        info.clone()
    };
    settings.upsert_device(info).await;
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================
