mod interface;
mod library;
mod noise;
mod simulated;

pub use interface::{
    CameraDevice, DecodeEngine, DecoderBackend, FrameOutcome, FrameSink, RenderTarget,
    StreamConfig,
};
pub use library::{LibraryLease, SharedLibrary};
pub use noise::NoiseFilter;
pub use simulated::{SimulatedBackend, SimulatedEngine, SimulatedStats};
