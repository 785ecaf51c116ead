use super::interface::{
    CameraDevice, DecodeEngine, DecoderBackend, FrameOutcome, FrameSink, RenderTarget,
    StreamConfig,
};
use crate::error::EngineError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct EngineScript {
    devices: Result<Vec<CameraDevice>, EngineError>,
    start_error: Option<EngineError>,
    stop_error: Option<EngineError>,
    start_latency: Duration,
    stop_latency: Duration,
    frames: Vec<FrameOutcome>,
    frame_interval: Duration,
    end_stream_after_frames: bool,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self {
            devices: Ok(vec![CameraDevice::new("sim-0", "Simulated camera")]),
            start_error: None,
            stop_error: None,
            start_latency: Duration::ZERO,
            stop_latency: Duration::ZERO,
            frames: Vec::new(),
            frame_interval: Duration::from_millis(5),
            end_stream_after_frames: false,
        }
    }
}

#[derive(Debug, Default)]
struct StreamSlot {
    open: bool,
    generation: u64,
    device: Option<String>,
    closed: Option<CancellationToken>,
}

/// Call counters observed on a simulated engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedStats {
    pub enumerate_calls: usize,
    pub start_calls: usize,
    pub stop_calls: usize,
    pub open_streams: usize,
    pub max_open_streams: usize,
}

/// Scriptable decode engine used by the CLI demo mode and tests.
///
/// Frames from the script are replayed on the sink after a successful
/// start, one every `frame_interval`, until the stream is stopped.
pub struct SimulatedEngine {
    script: Mutex<EngineScript>,
    stream: Arc<Mutex<StreamSlot>>,
    enumerate_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
    max_open_streams: Arc<AtomicUsize>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(EngineScript::default()),
            stream: Arc::new(Mutex::new(StreamSlot::default())),
            enumerate_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
            max_open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_devices(&self, devices: Vec<CameraDevice>) {
        self.script.lock().devices = Ok(devices);
    }

    pub fn set_enumerate_error(&self, error: EngineError) {
        self.script.lock().devices = Err(error);
    }

    pub fn set_start_error(&self, error: Option<EngineError>) {
        self.script.lock().start_error = error;
    }

    pub fn set_stop_error(&self, error: Option<EngineError>) {
        self.script.lock().stop_error = error;
    }

    pub fn set_start_latency(&self, latency: Duration) {
        self.script.lock().start_latency = latency;
    }

    pub fn set_stop_latency(&self, latency: Duration) {
        self.script.lock().stop_latency = latency;
    }

    pub fn set_frames(&self, frames: Vec<FrameOutcome>) {
        self.script.lock().frames = frames;
    }

    pub fn set_frame_interval(&self, interval: Duration) {
        self.script.lock().frame_interval = interval;
    }

    /// Drop the frame sink once the scripted frames run out, as an engine
    /// does when the camera goes away mid-stream
    pub fn set_end_stream_after_frames(&self, end: bool) {
        self.script.lock().end_stream_after_frames = end;
    }

    pub fn stats(&self) -> SimulatedStats {
        SimulatedStats {
            enumerate_calls: self.enumerate_calls.load(Ordering::SeqCst),
            start_calls: self.start_calls.load(Ordering::SeqCst),
            stop_calls: self.stop_calls.load(Ordering::SeqCst),
            open_streams: self.open_streams.load(Ordering::SeqCst),
            max_open_streams: self.max_open_streams.load(Ordering::SeqCst),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.lock().open
    }

    /// Device of the most recently opened stream
    pub fn last_device(&self) -> Option<String> {
        self.stream.lock().device.clone()
    }

    fn replay_frames(&self, generation: u64, script: EngineScript, sink: FrameSink) {
        let stream = Arc::clone(&self.stream);
        let closed = stream.lock().closed.clone().unwrap_or_default();

        tokio::spawn(async move {
            for frame in script.frames {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = tokio::time::sleep(script.frame_interval) => {}
                }

                {
                    let slot = stream.lock();
                    if !slot.open || slot.generation != generation {
                        return;
                    }
                }

                trace!("Simulated engine emitting frame: {:?}", frame);
                if sink.send(frame).is_err() {
                    return;
                }
            }

            if script.end_stream_after_frames {
                debug!("Simulated engine ending stream after scripted frames");
                return;
            }

            // A live camera keeps the stream open until it is stopped
            closed.cancelled().await;
        });
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DecodeEngine for SimulatedEngine {
    async fn enumerate_devices(&self) -> Result<Vec<CameraDevice>, EngineError> {
        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        let devices = self.script.lock().devices.clone();
        devices
    }

    async fn start(
        &self,
        device_id: &str,
        config: &StreamConfig,
        frames: FrameSink,
    ) -> Result<(), EngineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().clone();

        if !script.start_latency.is_zero() {
            tokio::time::sleep(script.start_latency).await;
        }

        if let Some(error) = script.start_error.clone() {
            return Err(error);
        }

        let generation = {
            let mut slot = self.stream.lock();
            if slot.open {
                return Err(EngineError::new(
                    "IllegalStateError",
                    "Cannot start, scan already in progress",
                ));
            }
            slot.open = true;
            slot.generation += 1;
            slot.device = Some(device_id.to_string());
            slot.closed = Some(CancellationToken::new());
            slot.generation
        };

        let open = self.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_streams.fetch_max(open, Ordering::SeqCst);

        debug!(
            "Simulated stream opened on {} ({} fps, {}x{} region)",
            device_id, config.fps, config.scan_region.0, config.scan_region.1
        );

        self.replay_frames(generation, script, frames);
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let (latency, stop_error) = {
            let script = self.script.lock();
            (script.stop_latency, script.stop_error.clone())
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let was_open = {
            let mut slot = self.stream.lock();
            if let Some(closed) = slot.closed.take() {
                closed.cancel();
            }
            std::mem::replace(&mut slot.open, false)
        };

        if !was_open {
            return Err(EngineError::new(
                "IllegalStateError",
                "Cannot stop, scanner is not running",
            ));
        }

        self.open_streams.fetch_sub(1, Ordering::SeqCst);
        debug!("Simulated stream closed");

        // The camera is released even when the engine reports a failure
        match stop_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Backend that hands out one shared `SimulatedEngine`
pub struct SimulatedBackend {
    engine: Arc<SimulatedEngine>,
    load_error: Mutex<Option<EngineError>>,
    load_latency: Mutex<Duration>,
    create_latency: Mutex<Duration>,
    load_calls: AtomicUsize,
    create_calls: AtomicUsize,
    unload_calls: AtomicUsize,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::with_engine(Arc::new(SimulatedEngine::new()))
    }

    pub fn with_engine(engine: Arc<SimulatedEngine>) -> Self {
        Self {
            engine,
            load_error: Mutex::new(None),
            load_latency: Mutex::new(Duration::ZERO),
            create_latency: Mutex::new(Duration::ZERO),
            load_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
        }
    }

    pub fn engine(&self) -> Arc<SimulatedEngine> {
        Arc::clone(&self.engine)
    }

    pub fn set_load_error(&self, error: Option<EngineError>) {
        *self.load_error.lock() = error;
    }

    pub fn set_load_latency(&self, latency: Duration) {
        *self.load_latency.lock() = latency;
    }

    pub fn set_create_latency(&self, latency: Duration) {
        *self.create_latency.lock() = latency;
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.unload_calls.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DecoderBackend for SimulatedBackend {
    async fn load(&self) -> Result<(), EngineError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.load_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let error = self.load_error.lock().clone();
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn create_engine(
        &self,
        target: &RenderTarget,
    ) -> Result<Arc<dyn DecodeEngine>, EngineError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.create_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        debug!("Simulated engine bound to render target '{}'", target);
        let engine: Arc<dyn DecodeEngine> = self.engine.clone();
        Ok(engine)
    }

    async fn unload(&self) {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated decoder library unloaded");
    }
}
