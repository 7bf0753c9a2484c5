//! Shared test doubles.
//!
//! Compiled only for tests. The fakes here script both sides of the
//! relay: a page transport that records replies and a native launcher
//! whose behavior is a closure over the received envelope.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::devices::{ConnectedDevice, DeviceClient, RemoteDeviceManager};
use crate::error::{Error, Result};
use crate::protocol::{ExceptionModel, NativeEnvelope, NativeReply, PageReply};
use crate::transport::{NativeChannel, NativeEvent, NativeLauncher, PageSender, PageTransport};

/// Initializes test logging once. `RUST_LOG` controls the filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// FakePageTransport
// ============================================================================

/// Page transport recording every posted reply.
pub struct FakePageTransport {
    url: String,
    tab_url: Option<String>,
    replies: Mutex<Vec<PageReply>>,
    notify: Notify,
}

impl FakePageTransport {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            tab_url: None,
            replies: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn replies(&self) -> Vec<PageReply> {
        self.replies.lock().clone()
    }

    /// Waits until at least `count` replies have been posted.
    pub async fn wait_for_replies(&self, count: usize) -> Vec<PageReply> {
        loop {
            let notified = self.notify.notified();
            {
                let replies = self.replies.lock();
                if replies.len() >= count {
                    return replies.clone();
                }
            }
            notified.await;
        }
    }
}

impl PageTransport for FakePageTransport {
    fn sender(&self) -> PageSender {
        PageSender {
            url: self.url.clone(),
            tab_url: self.tab_url.clone(),
        }
    }

    fn post(&self, reply: PageReply) {
        self.replies.lock().push(reply);
        self.notify.notify_waiters();
    }
}

// ============================================================================
// ScriptedLauncher
// ============================================================================

/// Responder deciding each envelope's reply. `None` stays silent.
pub type Responder = dyn Fn(&NativeEnvelope) -> Option<NativeReply> + Send + Sync;

/// Launcher whose native host is a closure.
pub struct ScriptedLauncher {
    responder: Arc<Responder>,
    launches: AtomicUsize,
    fail_connect: AtomicBool,
    envelopes: Arc<Mutex<Vec<NativeEnvelope>>>,
    event_senders: Mutex<Vec<mpsc::UnboundedSender<NativeEvent>>>,
}

impl ScriptedLauncher {
    pub fn new(
        responder: impl Fn(&NativeEnvelope) -> Option<NativeReply> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Arc::new(responder),
            launches: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            envelopes: Arc::new(Mutex::new(Vec::new())),
            event_senders: Mutex::new(Vec::new()),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn envelopes(&self) -> Vec<NativeEnvelope> {
        self.envelopes.lock().clone()
    }

    pub fn calls_for(&self, command: &str) -> usize {
        self.envelopes
            .lock()
            .iter()
            .filter(|e| e.command == command)
            .count()
    }

    /// Disconnects every launched host.
    pub fn disconnect_all(&self, error: Option<String>) {
        for sender in self.event_senders.lock().drain(..) {
            let _ = sender.send(NativeEvent::Disconnected {
                error: error.clone(),
            });
        }
    }
}

impl NativeLauncher for ScriptedLauncher {
    fn launch(&self) -> Result<NativeChannel> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::native_connect_failure("scripted launch failure"));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<NativeEnvelope>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.event_senders.lock().push(event_tx.clone());

        let responder = Arc::clone(&self.responder);
        let log = Arc::clone(&self.envelopes);
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                log.lock().push(envelope.clone());
                if let Some(reply) = (responder)(&envelope)
                    && event_tx.send(NativeEvent::Message(reply)).is_err()
                {
                    break;
                }
            }
        });

        Ok(NativeChannel {
            outgoing: out_tx,
            events: event_rx,
        })
    }
}

// ============================================================================
// Reply Helpers
// ============================================================================

/// Builds a success reply correlated to an envelope.
pub fn ok_reply(envelope: &NativeEnvelope, response: Value) -> Option<NativeReply> {
    Some(NativeReply {
        request_id: Some(envelope.request_id),
        success: true,
        response: Some(response),
        exception: None,
        stream_id: None,
        stream_length: None,
    })
}

/// Builds a failure reply correlated to an envelope.
pub fn err_reply(envelope: &NativeEnvelope, code: &str, message: &str) -> Option<NativeReply> {
    Some(NativeReply::failure(
        Some(envelope.request_id),
        ExceptionModel::new(message, code),
    ))
}

// ============================================================================
// Device Fakes
// ============================================================================

/// Device client whose behavior is a closure.
pub struct ScriptedDeviceClient {
    responder: Box<dyn Fn(&NativeEnvelope) -> Result<Value> + Send + Sync>,
    pub calls: Mutex<Vec<NativeEnvelope>>,
}

impl ScriptedDeviceClient {
    pub fn new(
        responder: impl Fn(&NativeEnvelope) -> Result<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DeviceClient for ScriptedDeviceClient {
    async fn send_message(&self, envelope: &NativeEnvelope) -> Result<Value> {
        self.calls.lock().push(envelope.clone());
        (self.responder)(envelope)
    }
}

/// Manager over a fixed device list.
pub struct FixedDeviceManager(pub Vec<Arc<ConnectedDevice>>);

impl RemoteDeviceManager for FixedDeviceManager {
    fn connected_devices(&self) -> Vec<Arc<ConnectedDevice>> {
        self.0.clone()
    }
}
