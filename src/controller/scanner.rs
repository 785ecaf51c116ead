use super::field::{FieldBinding, FieldSnapshot};
use crate::config::ScanfieldConfig;
use crate::engine::{CameraDevice, RenderTarget, SharedLibrary};
use crate::error::ScanError;
use crate::events::{EventBus, FieldEvent, ScanEvent, ScanEventSink};
use crate::registry::CameraDeviceRegistry;
use crate::session::{ScanSession, ScanState};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ControllerInner {
    id: Uuid,
    library: Arc<SharedLibrary>,
    target: RenderTarget,
    placeholder: String,
    field: Arc<FieldBinding>,
    session: ScanSession,
    registry: OnceCell<CameraDeviceRegistry>,
    selected_device: Mutex<Option<String>>,
    /// Serializes toggles, so at most one start is in flight
    op_gate: tokio::sync::Mutex<()>,
}

/// Binds a scan session to a form field with the capture lock policy.
///
/// Never returns errors: every failure ends up as the field's `error`
/// message with `scanning` cleared.
#[derive(Clone)]
pub struct ScannerController {
    inner: Arc<ControllerInner>,
}

impl ScannerController {
    pub fn new(config: &ScanfieldConfig, library: Arc<SharedLibrary>) -> Self {
        let bus = EventBus::from_config(&config.system);
        let field = Arc::new(FieldBinding::new(bus));
        let sink: Arc<dyn ScanEventSink> = field.clone();
        let session = ScanSession::new(&config.scanner, sink);
        let id = Uuid::new_v4();

        debug!("Created scanner controller {}", id);

        Self {
            inner: Arc::new(ControllerInner {
                id,
                library,
                target: RenderTarget::new(config.scanner.render_target.clone()),
                placeholder: config.field.placeholder.clone(),
                field,
                session,
                registry: OnceCell::new(),
                selected_device: Mutex::new(None),
                op_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn placeholder(&self) -> &str {
        &self.inner.placeholder
    }

    pub fn snapshot(&self) -> FieldSnapshot {
        self.inner.field.snapshot()
    }

    pub fn value(&self) -> String {
        self.inner.field.snapshot().value
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FieldEvent> {
        self.inner.field.bus().subscribe()
    }

    pub fn session_state(&self) -> ScanState {
        self.inner.session.state()
    }

    /// Typed input from the user; ignored while a captured value is locked
    pub fn on_manual_edit(&self, text: &str) -> bool {
        self.inner.field.on_manual_edit(text)
    }

    pub fn on_scan_result(&self, text: &str) {
        self.inner.field.on_scan_result(text);
    }

    pub fn clear(&self) {
        self.inner.field.clear();
    }

    /// Start a scan when idle, stop the running one otherwise.
    ///
    /// Starts are serialized; a stop never waits behind a pending start.
    pub async fn toggle_scan(&self) {
        if self.inner.session.is_closed() {
            debug!("Scanner {} is torn down; ignoring toggle", self.inner.id);
            return;
        }

        if self.inner.field.is_scanning() {
            self.stop_scan().await;
            return;
        }

        let _gate = self.inner.op_gate.lock().await;
        if self.inner.session.is_closed() {
            return;
        }

        if self.inner.field.is_scanning() {
            self.stop_scan().await;
        } else {
            self.start_scan().await;
        }
    }

    async fn start_scan(&self) {
        info!("Scanner {} starting scan", self.inner.id);
        let field = &self.inner.field;
        let session = &self.inner.session;

        field.begin_scan();

        // A previous attempt may have parked the session in Error or still be
        // releasing the camera
        session.reset();
        session.wait_until_settled().await;

        let registry = match self.registry().await {
            Ok(registry) => registry,
            Err(err) => {
                // Initialization failures already reached the field via the session
                debug!("Scanner {} has no engine: {}", self.inner.id, err);
                return;
            }
        };

        let device = match self.resolve_device(registry).await {
            Ok(device) => device,
            Err(err) => {
                field.deliver(ScanEvent::Failed(err));
                return;
            }
        };

        field.set_scanning(true);
        if let Err(err) = session.start(&device).await {
            debug!("Scanner {} start failed: {}", self.inner.id, err);
            return;
        }

        // Closed while the engine was opening the stream
        if !field.is_scanning() {
            session.stop().await;
        }
    }

    async fn stop_scan(&self) {
        info!("Scanner {} stopping scan", self.inner.id);
        self.inner.session.stop().await;
        self.inner.field.set_scanning(false);
    }

    /// Registry for this controller's engine, constructing the engine on first use
    async fn registry(&self) -> Result<&CameraDeviceRegistry, ScanError> {
        self.inner
            .registry
            .get_or_try_init(|| async {
                let engine = self
                    .inner
                    .session
                    .initialize(&self.inner.library, &self.inner.target)
                    .await?;
                Ok::<_, ScanError>(CameraDeviceRegistry::new(engine))
            })
            .await
    }

    async fn resolve_device(&self, registry: &CameraDeviceRegistry) -> Result<String, ScanError> {
        let selected = self.inner.selected_device.lock().clone();
        if let Some(device) = selected {
            return Ok(device);
        }

        let devices = registry.enumerate().await?;
        let device = CameraDeviceRegistry::select_default(&devices)
            .map(|device| device.id.clone())
            .ok_or(ScanError::NoCameraFound)?;

        *self.inner.selected_device.lock() = Some(device.clone());
        Ok(device)
    }

    /// Cameras available to this scanner; empty when discovery fails
    pub async fn devices(&self) -> Vec<CameraDevice> {
        let _gate = self.inner.op_gate.lock().await;
        if self.inner.session.is_closed() {
            return Vec::new();
        }

        let registry = match self.registry().await {
            Ok(registry) => registry,
            Err(_) => return Vec::new(),
        };

        match registry.enumerate().await {
            Ok(devices) => {
                let mut selected = self.inner.selected_device.lock();
                if selected.is_none() {
                    *selected = CameraDeviceRegistry::select_default(&devices)
                        .map(|device| device.id.clone());
                }
                devices
            }
            Err(err) => {
                self.inner.field.deliver(ScanEvent::Failed(err));
                Vec::new()
            }
        }
    }

    pub fn selected_device(&self) -> Option<String> {
        self.inner.selected_device.lock().clone()
    }

    /// Switch cameras. Refused while scanning or for an unknown device.
    pub fn select_device(&self, device_id: &str) -> bool {
        if self.inner.field.is_scanning() {
            warn!("Cannot switch camera while scanning");
            return false;
        }

        let known = self
            .inner
            .registry
            .get()
            .map(|registry| registry.contains(device_id))
            .unwrap_or(false);
        if !known {
            warn!("Unknown camera device {}", device_id);
            return false;
        }

        *self.inner.selected_device.lock() = Some(device_id.to_string());
        true
    }

    /// Release the camera and the engine. Safe to call more than once.
    pub async fn teardown(&self) {
        info!("Tearing down scanner {}", self.inner.id);
        self.inner.field.close();
        self.inner.session.teardown().await;
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if self.session.is_closed() {
            return;
        }

        self.field.close();
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { session.teardown().await });
            }
            Err(_) => warn!("Scanner {} dropped outside a runtime; camera not released", self.id),
        }
    }
}
