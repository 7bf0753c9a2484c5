//! Command dispatcher.
//!
//! One [`CommandDispatcher`] serves every page. It parses nothing itself;
//! it receives a typed [`PageRequest`], applies policy, runs the command
//! and posts exactly one terminal reply. Handler errors become structured
//! exception replies; replies to disconnected pages are dropped.
//!
//! # Command Surface
//!
//! | Group | Commands |
//! |-------|----------|
//! | Lifecycle | `initialize`, `getExtensionVersion`, `getVersion`, `pollNative` |
//! | Certificates | `listCertificates`, `readCertificate`, `removeCertificate` |
//! | Signing | `signData`, `signHash`, `signHashes`, `signHashBatch`, `keySignData`, `keySignHash`, `preauthorizeSignatures` |
//! | Documents | `signPdf`, `signCades`, `signXml`, `openPades`, `openCades`, `openXmlSignature` |
//! | Filesystem | `showFileBrowser`, `showFolderBrowser`, `openFile`, `openFolder`, `downloadToFolder` |
//! | Tokens | `generateTokenRsaKeyPair`, `generateSoftwareRsaKeyPair`, `importTokenCertificate`, `importCertificate` |
//! | Misc | `sendAuthenticatedRequest`, `signWithRestPki`, `refreshDevice`, passthrough |

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::blacklist::{restrictions, Blacklist};
use crate::devices::{
    device_for_thumbprint, refresh_device_certificates, RemoteDeviceManager,
};
use crate::error::{codes, Error, Result};
use crate::identifiers::{PathId, RequestId, StreamId, Thumbprint};
use crate::protocol::{is_at_least, NativeEnvelope, NativeReply, PageReply, PageRequest};
use crate::relay::RelayConfig;
use crate::restpki::{is_well_known, RestPkiClient};
use crate::router::Page;
use crate::settings::Settings;
use crate::transfer::{BufferedTransferManager, NativeCaller};
use crate::transport::NativeConnectionPool;

use super::remote;

// ============================================================================
// Constants
// ============================================================================

/// Maximum hashes per native batch round.
const BATCH_ROUND_SIZE: usize = 1000;

/// Poll backoff while the installed native component is outdated.
const POLL_OUTDATED_BACKOFF: Duration = Duration::from_secs(4);

/// Poll backoff while the native component is unreachable.
const POLL_UNREACHABLE_BACKOFF: Duration = Duration::from_secs(1);

/// Operating systems the native component supports.
const SUPPORTED_OS: &[&str] = &["Windows", "Linux", "Darwin"];

/// Device certificate caches older than this are refreshed after a
/// successful initialize.
const STALE_DEVICE_AGE: Duration = Duration::from_secs(60 * 60);

/// Apple provisioning certificates polluting the macOS keychain.
const APPLE_JUNK_SUBJECT_PREFIX: &str = "com.apple.idms";

// ============================================================================
// InstallationState
// ============================================================================

/// Installation status reported by `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstallationState {
    /// Everything present and current.
    Installed = 0,
    /// The extension itself is missing (reported by the page-side lib).
    ExtensionNotInstalled = 1,
    /// This extension is older than the page requires.
    ExtensionOutdated = 2,
    /// The native component did not answer at all.
    NativeNotInstalled = 3,
    /// The native component answered but is too old.
    NativeOutdated = 4,
}

// ============================================================================
// CallOptions
// ============================================================================

/// Per-call knobs for the native exchange.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// Whether the native host should stay resident afterwards.
    pub keep_alive: bool,
    /// Skip licensing (popup and well-known REST endpoints only).
    pub bypass_licensing: bool,
    /// Whether a remote device may answer instead of the native host.
    pub allow_remote: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            keep_alive: true,
            bypass_licensing: false,
            allow_remote: true,
        }
    }
}

// ============================================================================
// CommandDispatcher
// ============================================================================

/// The relay's command execution core.
pub struct CommandDispatcher {
    pub(super) config: Arc<RelayConfig>,
    pub(super) pool: Arc<NativeConnectionPool>,
    pub(super) transfers: BufferedTransferManager,
    pub(super) settings: Arc<Settings>,
    pub(super) blacklist: Arc<Blacklist>,
    pub(super) devices: Arc<dyn RemoteDeviceManager>,
    pub(super) rest: RestPkiClient,
    pub(super) http: reqwest::Client,
}

impl CommandDispatcher {
    /// Wires a dispatcher over its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RelayConfig>,
        pool: Arc<NativeConnectionPool>,
        settings: Arc<Settings>,
        blacklist: Arc<Blacklist>,
        devices: Arc<dyn RemoteDeviceManager>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let rest = RestPkiClient::new(http.clone(), config.rest_pki_base_url.clone());
        Arc::new(Self {
            config,
            pool,
            transfers: BufferedTransferManager::new(),
            settings,
            blacklist,
            devices,
            rest,
            http,
        })
    }

    // ========================================================================
    // Entry Point
    // ========================================================================

    /// Handles one page request end to end, posting exactly one reply.
    pub async fn handle_page_message(self: &Arc<Self>, page: &Arc<Page>, request: PageRequest) {
        page.set_license(request.license.clone());
        page.set_pooled(request.use_domain_native_pool);
        let trace_flag = self.settings.snapshot().await.trace;

        if !page.is_popup()
            && self
                .blacklist
                .is_restricted(page.domain(), restrictions::FORBIDDEN)
        {
            let err = Error::blocked_domain(format!(
                "The domain {} is blocked from using this extension",
                page.domain()
            ));
            page.post(PageReply::fail(&request.request_id, &err, trace_flag));
            // A blocked hit refreshes the table so unblocked domains
            // recover without a restart.
            self.blacklist
                .spawn_refresh(self.http.clone(), self.config.home_endpoint.clone());
            return;
        }

        debug!(page = %page.id(), command = %request.command, "dispatching command");
        match self.dispatch(page, &request.command, request.request).await {
            Ok(value) => page.post(PageReply::ok(&request.request_id, value, trace_flag)),
            Err(Error::PageDisconnected) => {
                trace!(page = %page.id(), "suppressing reply to disconnected page");
            }
            Err(e) => {
                debug!(page = %page.id(), command = %request.command, error = %e, "command failed");
                page.post(PageReply::fail(&request.request_id, &e, trace_flag));
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, page: &Arc<Page>, command: &str, request: Value) -> Result<Value> {
        match command {
            "getExtensionVersion" => Ok(json!({ "version": self.config.extension_version })),
            "initialize" => self.handle_initialize(page, request).await,
            "getVersion" => self.handle_get_version(page).await,
            "pollNative" => self.handle_poll_native(page, request).await,
            "listCertificates" => self.handle_list_certificates(page, request).await,
            "readCertificate" => self.handle_read_certificate(page, request).await,
            "removeCertificate" => self.handle_remove_certificate(page, request).await,
            "signData" | "signHash" | "signHashes" => {
                self.handle_sign(page, command, request).await
            }
            "signHashBatch" => self.handle_sign_hash_batch(page, request).await,
            "keySignData" | "keySignHash" => self.handle_key_sign(page, command, request).await,
            "preauthorizeSignatures" => self.handle_preauthorize(page, request).await,
            "signPdf" | "signCades" | "signXml" => {
                self.handle_sign_document(page, command, request).await
            }
            "openPades" | "openCades" | "openXmlSignature" => {
                self.handle_open_document(page, command, request).await
            }
            "showFileBrowser" => self.handle_browser(page, command, request, "fileId").await,
            "showFolderBrowser" => self.handle_browser(page, command, request, "folderId").await,
            "openFile" => self.handle_open_path(page, command, request, "fileId", "File").await,
            "openFolder" => {
                self.handle_open_path(page, command, request, "folderId", "Folder")
                    .await
            }
            "downloadToFolder" => self.handle_download_to_folder(page, request).await,
            "generateTokenRsaKeyPair" => {
                self.handle_generate_token_key_pair(page, request).await
            }
            "generateSoftwareRsaKeyPair" => {
                require_present(&request, "keySize")?;
                self.call_native(page, command, request, CallOptions::default())
                    .await
            }
            "importTokenCertificate" => self.handle_import_token_certificate(page, request).await,
            "importCertificate" => {
                require_str(&request, "certificateContent")?;
                self.call_native(page, command, request, CallOptions::default())
                    .await
            }
            "sendAuthenticatedRequest" => self.handle_authenticated_request(page, request).await,
            "signWithRestPki" => self.handle_sign_with_rest_pki(page, request).await,
            "refreshDevice" => self.handle_refresh_device(page, request).await,
            _ => {
                // Unknown commands pass through so a newer native host can
                // serve pages this extension does not know about yet.
                self.call_native(page, command, request, CallOptions::default())
                    .await
            }
        }
    }

    // ========================================================================
    // Native Exchange
    // ========================================================================

    /// Runs a command, letting a remote device answer thumbprint-addressed
    /// commands and decoding buffered responses transparently.
    pub(crate) async fn call_native(
        &self,
        page: &Page,
        command: &str,
        request: Value,
        options: CallOptions,
    ) -> Result<Value> {
        if options.allow_remote
            && remote::is_thumbprint_command(command)
            && let Some(thumbprint) = remote::routing_thumbprint(&request)
            && let Some(device) = device_for_thumbprint(self.devices.as_ref(), &thumbprint)
        {
            trace!(command, %thumbprint, "routing to remote device");
            let envelope = self.build_envelope(page, command, request, &options).await;
            return self.call_device(&device, envelope).await;
        }

        let reply = self.exchange(page, command, request, &options).await?;
        if reply.is_buffered() {
            let stream_id = reply.stream_id.unwrap_or(StreamId(0));
            let total = reply.stream_length.ok_or_else(|| {
                Error::protocol("Buffered response without a stream length")
            })?;
            return self
                .transfers
                .read_response(self, page, stream_id, total)
                .await;
        }
        reply.into_result()
    }

    /// Sends one envelope to the page's native connection and awaits the
    /// correlated reply. Does not interpret the reply.
    async fn exchange(
        &self,
        page: &Page,
        command: &str,
        request: Value,
        options: &CallOptions,
    ) -> Result<NativeReply> {
        let envelope = self.build_envelope(page, command, request, options).await;
        let request_id = envelope.request_id;

        let connection = match page.native() {
            Some(connection) => connection,
            None => self.pool.handle_for(page)?,
        };
        let rx = page.register_pending(request_id);
        if let Err(e) = connection.post(envelope) {
            page.forget_pending(&request_id);
            return Err(e);
        }
        match rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => Err(Error::NativeNoResponse),
        }
    }

    async fn build_envelope(
        &self,
        page: &Page,
        command: &str,
        request: Value,
        options: &CallOptions,
    ) -> NativeEnvelope {
        let snapshot = self.settings.snapshot().await;
        let mut require_license = !options.bypass_licensing;
        if self
            .blacklist
            .is_restricted(page.domain(), restrictions::FORCE_REQUIRE_LICENSE)
        {
            require_license = true;
        }
        let domain = if page.is_popup() || options.bypass_licensing {
            "localhost".to_string()
        } else {
            page.domain().to_string()
        };
        NativeEnvelope {
            request_id: RequestId::generate(),
            license: page.license(),
            domain,
            command: command.to_string(),
            request,
            language: self.config.language.clone(),
            keep_alive: options.keep_alive,
            trace: snapshot.trace,
            pkcs11_modules: (!snapshot.pkcs11_modules.is_empty())
                .then(|| snapshot.pkcs11_modules.clone()),
            require_license,
        }
    }

    // ========================================================================
    // Lifecycle Handlers
    // ========================================================================

    async fn handle_initialize(self: &Arc<Self>, page: &Arc<Page>, request: Value) -> Result<Value> {
        if let Some(required) = request.get("requiredExtensionVersion").and_then(Value::as_str)
            && !is_at_least(&self.config.extension_version, required)
        {
            return Ok(status_reply(
                InstallationState::ExtensionOutdated,
                json!({ "installedVersion": self.config.extension_version }),
            ));
        }

        let info = self
            .call_native(
                page,
                "getInfo",
                json!({ "cancelInstances": false }),
                CallOptions::default(),
            )
            .await;
        match info {
            Ok(info) => {
                let os = info.get("os").and_then(Value::as_str).unwrap_or_default();
                if !SUPPORTED_OS.contains(&os) {
                    return Err(Error::os_not_supported(os));
                }
                let installed = info.get("version").and_then(Value::as_str).unwrap_or("");
                if let Some(required) = required_native_version(&request, os)
                    && !is_at_least(installed, &required)
                {
                    return Ok(status_reply(
                        InstallationState::NativeOutdated,
                        json!({ "installedVersion": installed }),
                    ));
                }

                self.spawn_stale_device_refresh();
                Ok(json!({
                    "isReady": true,
                    "status": InstallationState::Installed as u8,
                    "nativeInfo": info,
                    "restPkiRequired": self
                        .blacklist
                        .is_restricted(page.domain(), restrictions::REST_PKI),
                }))
            }
            Err(e) if e.is_transport_error() => {
                Ok(status_reply(InstallationState::NativeNotInstalled, json!({})))
            }
            Err(e) if e.code() == codes::COMMAND_UNKNOWN => {
                Ok(status_reply(InstallationState::NativeOutdated, json!({})))
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_get_version(&self, page: &Page) -> Result<Value> {
        match self
            .call_native(page, "getInfo", json!({}), CallOptions::default())
            .await
        {
            Ok(info) => {
                let version = info
                    .get("version")
                    .and_then(Value::as_str)
                    .unwrap_or("0")
                    .to_string();
                Ok(Value::String(version))
            }
            // A host too old to know getInfo reports the legacy "0".
            Err(e) if e.code() == codes::COMMAND_UNKNOWN => Ok(Value::String("0".into())),
            Err(e) if e.is_transport_error() => Err(Error::NativeNoResponse),
            Err(e) => Err(e),
        }
    }

    async fn handle_poll_native(&self, page: &Page, request: Value) -> Result<Value> {
        loop {
            if page.is_disconnected() {
                return Err(Error::PageDisconnected);
            }
            let probe = self
                .call_native(
                    page,
                    "getInfo",
                    json!({ "cancelInstances": true }),
                    CallOptions {
                        keep_alive: false,
                        ..CallOptions::default()
                    },
                )
                .await;
            match probe {
                Ok(info) => {
                    let os = info.get("os").and_then(Value::as_str).unwrap_or_default();
                    if !SUPPORTED_OS.contains(&os) {
                        return Err(Error::os_not_supported(os));
                    }
                    let installed = info.get("version").and_then(Value::as_str).unwrap_or("");
                    if let Some(required) = required_native_version(&request, os)
                        && !is_at_least(installed, &required)
                    {
                        tokio::time::sleep(POLL_OUTDATED_BACKOFF).await;
                        continue;
                    }
                    return Ok(json!({ "isReady": true, "nativeInfo": info }));
                }
                Err(e) if e.is_transport_error() => {
                    tokio::time::sleep(POLL_UNREACHABLE_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // Certificate Handlers
    // ========================================================================

    async fn handle_list_certificates(
        self: &Arc<Self>,
        page: &Arc<Page>,
        request: Value,
    ) -> Result<Value> {
        let result = self
            .call_native(page, "listCertificates", request, CallOptions::default())
            .await?;
        let Value::Array(mut certs) = result else {
            return Ok(result);
        };

        if self.config.user_os == "Darwin" {
            certs.retain(|cert| {
                !cert
                    .get("subjectName")
                    .and_then(Value::as_str)
                    .is_some_and(|s| s.starts_with(APPLE_JUNK_SUBJECT_PREFIX))
            });
        }

        let mut seen: Vec<Thumbprint> = certs
            .iter()
            .filter_map(|c| c.get("thumbprint").and_then(Value::as_str))
            .map(Thumbprint::from)
            .collect();
        for device in self.devices.connected_devices() {
            if !device.info.lock().enabled {
                continue;
            }
            if device.info.lock().refreshed_at.is_none() {
                // Never-listed device: fetch its certificates now so the
                // page sees them on the first call. Failures are recorded
                // as device health and otherwise absorbed.
                let envelope = self
                    .build_envelope(page, "listCertificates", json!({}), &CallOptions::default())
                    .await;
                if let Ok(listed) = self.call_device(&device, envelope).await {
                    refresh_device_certificates(&self.settings, &device, &listed).await;
                }
            }
            for (thumbprint, cert) in &device.info.lock().known_certificates {
                if !seen.contains(thumbprint) {
                    seen.push(thumbprint.clone());
                    certs.push(cert.clone());
                }
            }
        }
        Ok(Value::Array(certs))
    }

    async fn handle_read_certificate(&self, page: &Page, request: Value) -> Result<Value> {
        let thumbprint = Thumbprint::from(require_str(&request, "certificateThumbprint")?);
        if let Some(cached) = self.settings.cert_cache(&thumbprint).await {
            trace!(%thumbprint, "certificate served from cache");
            return Ok(cached);
        }
        let result = self
            .call_native(page, "readCertificate", request, CallOptions::default())
            .await?;
        self.settings
            .set_cert_cache(thumbprint, result.clone())
            .await;
        Ok(result)
    }

    async fn handle_remove_certificate(&self, page: &Page, request: Value) -> Result<Value> {
        if !page.is_popup() {
            return Err(Error::Forbidden);
        }
        require_str(&request, "certificateThumbprint")?;
        self.call_native(page, "removeCertificate", request, CallOptions::default())
            .await
    }

    // ========================================================================
    // Signing Handlers
    // ========================================================================

    async fn handle_sign(&self, page: &Page, command: &str, request: Value) -> Result<Value> {
        self.reject_rest_pki_domain(page)?;
        let thumbprint = Thumbprint::from(require_str(&request, "certificateThumbprint")?);
        let count = match command {
            "signData" => {
                require_str(&request, "data")?;
                1
            }
            "signHash" => {
                require_str(&request, "hash")?;
                1
            }
            _ => {
                let hashes = require_array(&request, "hashes")?;
                u32::try_from(hashes.len())
                    .map_err(|_| Error::invalid_parameter("Too many hashes"))?
            }
        };
        self.authorize_signatures(page, &thumbprint, count).await?;
        self.call_native(page, command, request, CallOptions::default())
            .await
    }

    async fn handle_sign_hash_batch(&self, page: &Page, request: Value) -> Result<Value> {
        self.reject_rest_pki_domain(page)?;
        let thumbprint = Thumbprint::from(require_str(&request, "certificateThumbprint")?);
        let batch = require_array(&request, "batch")?.clone();
        let digest_algorithm = request.get("digestAlgorithm").cloned();
        let use_preauthorized = request
            .get("usePreauthorizedSignatures")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut signatures = Vec::with_capacity(batch.len());
        for round in batch.chunks(BATCH_ROUND_SIZE) {
            let count = u32::try_from(round.len())
                .map_err(|_| Error::invalid_parameter("Too many hashes"))?;
            if use_preauthorized {
                // The page opted into its preauthorizeSignatures quota;
                // consume what is there and never prompt.
                let _ = page.consume_preauthorizations(&thumbprint, count);
            } else {
                self.authorize_signatures(page, &thumbprint, count).await?;
            }

            let mut round_request = json!({
                "certificateThumbprint": thumbprint,
                "batch": round,
            });
            if let Some(algorithm) = &digest_algorithm {
                round_request["digestAlgorithm"] = algorithm.clone();
            }
            let result = self
                .call_native(page, "signHashBatch", round_request, CallOptions::default())
                .await?;
            let round_signatures = result
                .get("signatures")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::protocol("Batch round without signatures"))?;
            signatures.extend(round_signatures.iter().cloned());
        }
        Ok(json!({ "signatures": signatures }))
    }

    async fn handle_key_sign(&self, page: &Page, command: &str, request: Value) -> Result<Value> {
        require_str(&request, "key")?;
        match command {
            "keySignData" => require_str(&request, "data")?,
            _ => require_str(&request, "hash")?,
        };
        // Token keys were created by this extension; the certificate
        // authorization ladder does not apply.
        self.call_native(
            page,
            command,
            request,
            CallOptions {
                allow_remote: false,
                ..CallOptions::default()
            },
        )
        .await
    }

    async fn handle_preauthorize(&self, page: &Page, request: Value) -> Result<Value> {
        let thumbprint = Thumbprint::from(require_str(&request, "certificateThumbprint")?);
        let count = request
            .get("signatureCount")
            .and_then(Value::as_u64)
            .and_then(|c| u32::try_from(c).ok())
            .filter(|c| *c > 0)
            .ok_or_else(|| {
                Error::parameter_not_set("The signatureCount parameter must be a positive number")
            })?;

        if self
            .settings
            .site_trust(page.domain().as_str(), &thumbprint)
            .await
            != Some(true)
        {
            self.prompt_authorization(page, &thumbprint, count).await?;
        }
        page.preauthorize(thumbprint, count);
        Ok(json!({ "isAuthorized": true }))
    }

    // ========================================================================
    // Document Handlers
    // ========================================================================

    async fn handle_sign_document(
        &self,
        page: &Page,
        command: &str,
        mut request: Value,
    ) -> Result<Value> {
        self.reject_rest_pki_domain(page)?;
        let thumbprint = Thumbprint::from(require_str(&request, "certificateThumbprint")?);

        let has_file = take_path(page, &mut request, "fileId", "path", "File")?;
        if !has_file && require_str(&request, "content").is_err() {
            return Err(Error::parameter_not_set(
                "Either the fileId or the content parameter must be set",
            ));
        }
        take_path(page, &mut request, "outputFolderId", "outputPath", "Folder")?;

        // A certificate held by a remote device is not in any local store;
        // its cached content rides along so the native host can embed it.
        if let Some(device) = device_for_thumbprint(self.devices.as_ref(), &thumbprint)
            && let Some(content) = device
                .info
                .lock()
                .known_certificates
                .get(&thumbprint)
                .and_then(|c| c.get("content"))
                .cloned()
        {
            request["certificateContent"] = content;
        }

        self.authorize_signatures(page, &thumbprint, 1).await?;
        let result = self
            .call_native(page, command, request, CallOptions::default())
            .await?;
        self.shape_document_result(page, result).await
    }

    async fn handle_open_document(
        &self,
        page: &Page,
        command: &str,
        mut request: Value,
    ) -> Result<Value> {
        let has_file = take_path(page, &mut request, "fileId", "path", "File")?;
        if !has_file && require_str(&request, "content").is_err() {
            return Err(Error::parameter_not_set(
                "Either the fileId or the content parameter must be set",
            ));
        }
        self.call_native(page, command, request, CallOptions::default())
            .await
    }

    /// Replaces the raw path under `signatureInfo.file` with an opaque
    /// handle and pulls oversized content through the buffered transfer
    /// protocol, leaving the assembled payload at `signatureInfo.content`.
    async fn shape_document_result(&self, page: &Page, mut result: Value) -> Result<Value> {
        let mut stream = None;
        if let Some(file) = result
            .get_mut("signatureInfo")
            .and_then(|info| info.get_mut("file"))
            .and_then(Value::as_object_mut)
        {
            if let Some(path) = file.get("path").and_then(Value::as_str).map(PathBuf::from) {
                let id = page.register_path(path);
                file.remove("path");
                file.insert("id".into(), json!(id));
            }
            stream = file
                .get("streamId")
                .and_then(Value::as_u64)
                .zip(file.get("length").and_then(Value::as_u64));
        }
        if let Some((stream_id, length)) = stream {
            let content = self
                .transfers
                .read_content(self, page, StreamId(stream_id), length)
                .await?;
            if let Some(info) = result
                .get_mut("signatureInfo")
                .and_then(Value::as_object_mut)
            {
                info.remove("file");
                info.insert("content".into(), Value::String(content));
            }
        }
        Ok(result)
    }

    // ========================================================================
    // Filesystem Handlers
    // ========================================================================

    async fn handle_browser(
        &self,
        page: &Page,
        command: &str,
        request: Value,
        id_field: &str,
    ) -> Result<Value> {
        let result = self
            .call_native(page, command, request, CallOptions::default())
            .await?;
        match result.get("path").and_then(Value::as_str).filter(|p| !p.is_empty()) {
            Some(path) => {
                let id = page.register_path(PathBuf::from(path));
                let file_name = result.get("fileName").cloned();
                let mut reply = json!({ "userCancelled": false, id_field: id });
                if let Some(file_name) = file_name {
                    reply["fileName"] = file_name;
                }
                Ok(reply)
            }
            None => Ok(json!({ "userCancelled": true })),
        }
    }

    async fn handle_open_path(
        &self,
        page: &Page,
        command: &str,
        mut request: Value,
        id_field: &str,
        kind: &'static str,
    ) -> Result<Value> {
        if !take_path(page, &mut request, id_field, "path", kind)? {
            return Err(Error::parameter_not_set(format!(
                "The {id_field} parameter cannot be empty"
            )));
        }
        self.call_native(page, command, request, CallOptions::default())
            .await
    }

    async fn handle_download_to_folder(&self, page: &Page, mut request: Value) -> Result<Value> {
        require_str(&request, "url")?;
        if !take_path(page, &mut request, "folderId", "path", "Folder")? {
            return Err(Error::parameter_not_set("The folderId parameter cannot be empty"));
        }
        self.call_native(page, "downloadToFolder", request, CallOptions::default())
            .await
    }

    // ========================================================================
    // Token Handlers
    // ========================================================================

    async fn handle_generate_token_key_pair(&self, page: &Page, request: Value) -> Result<Value> {
        require_str(&request, "tokenSerialNumber")?;
        require_present(&request, "keySize")?;
        let persist_module = persist_module_enabled(&request);
        let result = self
            .call_native(page, "generateTokenRsaKeyPair", request, CallOptions::default())
            .await?;
        self.persist_used_pkcs11_module(persist_module, &result).await;
        Ok(json!({
            "csr": result.get("csr").cloned().unwrap_or(Value::Null),
            "privateKeyId": result.get("privateKeyId").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn handle_import_token_certificate(
        &self,
        page: &Page,
        request: Value,
    ) -> Result<Value> {
        require_str(&request, "tokenSerialNumber")?;
        require_str(&request, "certificateContent")?;
        let persist_module = persist_module_enabled(&request);
        let result = self
            .call_native(page, "importTokenCertificate", request, CallOptions::default())
            .await?;
        self.persist_used_pkcs11_module(persist_module, &result).await;
        Ok(json!({
            "imported": result.get("imported").cloned().unwrap_or(Value::Null),
        }))
    }

    /// Remembers the module the native host reported using, so future
    /// envelopes load it.
    async fn persist_used_pkcs11_module(&self, enabled: bool, result: &Value) {
        if !enabled {
            return;
        }
        if let Some(module) = result
            .get("pkcs11ModuleUsed")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
        {
            self.settings
                .add_pkcs11_modules(vec![module.to_string()])
                .await;
        }
    }

    async fn handle_authenticated_request(&self, page: &Page, request: Value) -> Result<Value> {
        require_str(&request, "url")?;
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        if !matches!(method, "GET" | "POST") {
            return Err(Error::invalid_parameter(format!(
                "Unsupported method for authenticated request: {method}"
            )));
        }
        self.call_native(page, "sendAuthenticatedRequest", request, CallOptions::default())
            .await
    }

    // ========================================================================
    // REST Workflow
    // ========================================================================

    async fn handle_sign_with_rest_pki(&self, page: &Page, request: Value) -> Result<Value> {
        let token = require_str(&request, "token")?.to_string();
        let thumbprint = Thumbprint::from(require_str(&request, "certificateThumbprint")?);

        let rest = match request.get("restPkiUrl").and_then(Value::as_str) {
            Some(url) if !url.is_empty() => RestPkiClient::new(self.http.clone(), Some(url.into())),
            _ => self.rest.clone(),
        };
        // Only the well-known service endpoints may bypass page licensing.
        let bypass = is_well_known(rest.base_url());
        let options = CallOptions {
            bypass_licensing: bypass,
            ..CallOptions::default()
        };

        // Fetching first validates the token before the user sees any
        // prompt.
        let _pending = rest.get_pending_signature(&token).await?;

        let certificate = self
            .call_native(
                page,
                "readCertificate",
                json!({ "certificateThumbprint": thumbprint }),
                options,
            )
            .await?;
        let certificate = certificate
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| certificate.as_str().map(str::to_string))
            .ok_or_else(|| Error::protocol("readCertificate returned no content"))?;

        let parameters = rest.post_certificate(&token, &certificate).await?;
        let to_sign_hash = parameters
            .get("toSignHash")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("Signature service returned no digest"))?;
        let digest_algorithm = parameters.get("digestAlgorithmOid").cloned();

        self.authorize_signatures(page, &thumbprint, 1).await?;
        let mut sign_request = json!({
            "certificateThumbprint": thumbprint,
            "hash": to_sign_hash,
        });
        if let Some(algorithm) = digest_algorithm {
            sign_request["digestAlgorithmOid"] = algorithm;
        }
        let signature = self
            .call_native(page, "signHash", sign_request, options)
            .await?;
        let signature = signature
            .get("signature")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| signature.as_str().map(str::to_string))
            .ok_or_else(|| Error::protocol("signHash returned no signature"))?;

        rest.post_signature(&token, &signature).await
    }

    // ========================================================================
    // Device Handlers
    // ========================================================================

    async fn handle_refresh_device(&self, page: &Page, request: Value) -> Result<Value> {
        let device_id = require_str(&request, "deviceId")?;
        let device = self
            .devices
            .connected_devices()
            .into_iter()
            .find(|d| d.info.lock().id.as_str() == device_id)
            .ok_or_else(|| {
                Error::invalid_parameter(format!("Device not connected: {device_id}"))
            })?;

        let envelope = self
            .build_envelope(page, "listCertificates", json!({}), &CallOptions::default())
            .await;
        let listed = self.call_device(&device, envelope).await?;
        refresh_device_certificates(&self.settings, &device, &listed).await;
        let info = device.info.lock().clone();
        Ok(serde_json::to_value(info)?)
    }

    /// Refreshes certificate caches of devices not listed within the last
    /// hour. Failures become device health, never page errors.
    fn spawn_stale_device_refresh(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let now = now_millis();
            for device in dispatcher.devices.connected_devices() {
                let stale = {
                    let info = device.info.lock();
                    info.enabled
                        && info.refreshed_at.is_none_or(|at| {
                            now.saturating_sub(at) > STALE_DEVICE_AGE.as_millis() as u64
                        })
                };
                if !stale {
                    continue;
                }
                let envelope = NativeEnvelope {
                    request_id: RequestId::generate(),
                    license: None,
                    domain: "localhost".to_string(),
                    command: "listCertificates".to_string(),
                    request: json!({}),
                    language: dispatcher.config.language.clone(),
                    keep_alive: false,
                    trace: false,
                    pkcs11_modules: None,
                    require_license: false,
                };
                match dispatcher.call_device(&device, envelope).await {
                    Ok(listed) => {
                        refresh_device_certificates(&dispatcher.settings, &device, &listed).await;
                    }
                    Err(e) => {
                        // Health was recorded by call_device.
                        warn!(error = %e, "background device refresh failed");
                    }
                }
            }
        });
    }

    // ========================================================================
    // Policy Helpers
    // ========================================================================

    fn reject_rest_pki_domain(&self, page: &Page) -> Result<()> {
        if self
            .blacklist
            .is_restricted(page.domain(), restrictions::REST_PKI)
        {
            return Err(Error::blocked_domain(format!(
                "The domain {} must sign through the REST signature workflow",
                page.domain()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// NativeCaller
// ============================================================================

#[async_trait]
impl NativeCaller for CommandDispatcher {
    /// Chunk reads go to the same native host that produced the stream:
    /// never to a remote device, and a buffered chunk reply would itself
    /// be a failure.
    async fn call(&self, page: &Page, command: &str, request: Value) -> Result<Value> {
        let reply = self
            .exchange(
                page,
                command,
                request,
                &CallOptions {
                    allow_remote: false,
                    ..CallOptions::default()
                },
            )
            .await?;
        reply.into_result()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn status_reply(state: InstallationState, mut extra: Value) -> Value {
    let mut reply = json!({ "isReady": false, "status": state as u8 });
    if let (Some(target), Some(source)) = (reply.as_object_mut(), extra.as_object_mut()) {
        target.append(source);
    }
    reply
}

fn required_native_version(request: &Value, os: &str) -> Option<String> {
    request
        .get("requiredNativeVersions")
        .and_then(|v| v.get(os))
        .or_else(|| request.get("requiredNativeVersion"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn require_str<'a>(request: &'a Value, field: &str) -> Result<&'a str> {
    request
        .get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::parameter_not_set(format!("The {field} parameter cannot be empty")))
}

fn require_present<'a>(request: &'a Value, field: &str) -> Result<&'a Value> {
    request
        .get(field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::parameter_not_set(format!("The {field} parameter cannot be empty")))
}

fn persist_module_enabled(request: &Value) -> bool {
    request.get("enableUsedPkcs11Module").and_then(Value::as_bool) != Some(false)
}

fn require_array<'a>(request: &'a Value, field: &str) -> Result<&'a Vec<Value>> {
    request
        .get(field)
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| Error::parameter_not_set(format!("The {field} parameter cannot be empty")))
}

/// Resolves a path handle into the request, replacing the id field with
/// the raw path. Returns `false` when the id field is absent.
fn take_path(
    page: &Page,
    request: &mut Value,
    id_field: &str,
    path_field: &str,
    kind: &'static str,
) -> Result<bool> {
    let Some(raw) = request
        .get(id_field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
    else {
        return Ok(false);
    };
    let id = PathId::parse(&raw)?;
    let path = page
        .resolve_path(&id)
        .ok_or_else(|| Error::path_not_found(kind, raw))?;
    let object = request
        .as_object_mut()
        .ok_or_else(|| Error::invalid_parameter("The request must be an object"))?;
    object.remove(id_field);
    object.insert(
        path_field.to_string(),
        Value::String(path.to_string_lossy().into_owned()),
    );
    Ok(true)
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
