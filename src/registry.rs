use crate::engine::{CameraDevice, DecodeEngine};
use crate::error::{EnginePhase, ScanError};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Camera discovery for one engine instance.
///
/// The device list is fetched once per engine lifetime; failed enumerations
/// are not cached, so a later call retries.
pub struct CameraDeviceRegistry {
    engine: Arc<dyn DecodeEngine>,
    devices: OnceCell<Vec<CameraDevice>>,
}

impl CameraDeviceRegistry {
    pub fn new(engine: Arc<dyn DecodeEngine>) -> Self {
        Self {
            engine,
            devices: OnceCell::new(),
        }
    }

    /// Ordered device list as reported by the engine
    pub async fn enumerate(&self) -> Result<Vec<CameraDevice>, ScanError> {
        let devices = self
            .devices
            .get_or_try_init(|| async {
                let devices = self
                    .engine
                    .enumerate_devices()
                    .await
                    .map_err(|e| ScanError::from_engine(EnginePhase::Enumerate, None, &e))?;

                if devices.is_empty() {
                    return Err(ScanError::NoCameraFound);
                }

                info!("Found {} camera device(s)", devices.len());
                for device in &devices {
                    debug!("Camera device {} ({})", device.id, device.display_label());
                }
                Ok::<_, ScanError>(devices)
            })
            .await?;

        Ok(devices.clone())
    }

    /// First device in engine order. Deliberately no ranking of cameras.
    pub fn select_default(devices: &[CameraDevice]) -> Option<&CameraDevice> {
        devices.first()
    }

    /// Devices from a previous successful enumeration
    pub fn cached(&self) -> Option<&[CameraDevice]> {
        self.devices.get().map(Vec::as_slice)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.cached()
            .map(|devices| devices.iter().any(|device| device.id == device_id))
            .unwrap_or(false)
    }
}
