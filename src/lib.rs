pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod session;

pub use config::ScanfieldConfig;
pub use controller::{BoundValue, FieldBinding, FieldSnapshot, ScannerController};
pub use engine::{
    CameraDevice, DecodeEngine, DecoderBackend, FrameOutcome, FrameSink, LibraryLease,
    NoiseFilter, RenderTarget, SharedLibrary, SimulatedBackend, SimulatedEngine, SimulatedStats,
    StreamConfig,
};
pub use error::{EngineError, EnginePhase, Result, ScanError, ScanErrorExt, ScanfieldError};
pub use events::{EventBus, FieldEvent, ScanEvent, ScanEventSink, ScanResult};
pub use registry::CameraDeviceRegistry;
pub use session::{ScanSession, ScanState};
