use crate::config::ScannerConfig;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Camera input source reported by the decode engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDevice {
    pub id: String,
    pub label: String,
}

impl CameraDevice {
    pub fn new<I: Into<String>, L: Into<String>>(id: I, label: L) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    /// Label for display, falling back to the id when the platform hides labels
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// Stream parameters handed to the engine on every start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub fps: u32,
    pub scan_region: (u32, u32),
}

impl From<&ScannerConfig> for StreamConfig {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            fps: config.fps,
            scan_region: config.scan_region,
        }
    }
}

/// Per-frame decode result streamed by the engine while a stream is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Decoded(String),
    Failed(String),
}

pub type FrameSink = mpsc::UnboundedSender<FrameOutcome>;

/// Element id the engine binds its preview to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderTarget(String);

impl RenderTarget {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A constructed decode engine bound to one render target.
///
/// `start` resolves once the stream is open; decoded symbols and per-frame
/// errors then arrive on the supplied sink until `stop` resolves.
#[async_trait::async_trait]
pub trait DecodeEngine: Send + Sync {
    /// List the camera devices the platform exposes
    async fn enumerate_devices(&self) -> Result<Vec<CameraDevice>, EngineError>;

    /// Open a decode stream on `device_id`
    async fn start(
        &self,
        device_id: &str,
        config: &StreamConfig,
        frames: FrameSink,
    ) -> Result<(), EngineError>;

    /// Close the open stream and release the camera
    async fn stop(&self) -> Result<(), EngineError>;
}

/// The decoding library itself: loaded once, then used to construct engines
#[async_trait::async_trait]
pub trait DecoderBackend: Send + Sync {
    /// One-time asynchronous load of the library
    async fn load(&self) -> Result<(), EngineError>;

    /// Construct an engine bound to `target`
    async fn create_engine(&self, target: &RenderTarget)
        -> Result<Arc<dyn DecodeEngine>, EngineError>;

    /// Release the library after its last user is gone
    async fn unload(&self);
}
