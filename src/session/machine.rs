use super::state::ScanState;
use crate::config::ScannerConfig;
use crate::engine::{
    DecodeEngine, FrameOutcome, LibraryLease, NoiseFilter, RenderTarget, SharedLibrary,
    StreamConfig,
};
use crate::error::{EnginePhase, ScanError, ScanErrorExt};
use crate::events::{ScanEvent, ScanEventSink, ScanResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

struct SessionInner {
    state: ScanState,
    /// Bumped on every start, stop and teardown. Async completions carrying
    /// an older epoch are stale and must not touch the session.
    epoch: u64,
    stream_open: bool,
    start_pending: bool,
    closed: bool,
    device: Option<String>,
    pump: Option<CancellationToken>,
    lease: Option<LibraryLease>,
}

struct SessionShared {
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<ScanState>,
    /// Mirrors `SessionInner::closed` for watchers, which must not take the
    /// session lock while holding the watch lock
    torn_down: AtomicBool,
    engine: OnceLock<Arc<dyn DecodeEngine>>,
    sink: Arc<dyn ScanEventSink>,
    stream: StreamConfig,
    noise: NoiseFilter,
}

struct StopTicket {
    epoch: u64,
    release: bool,
}

/// Start/stop state machine around a single decode engine.
///
/// Cloning yields another handle on the same session. Every event is
/// delivered to the sink while the session lock is held, after the
/// "still current" check, so nothing reaches the owner once the session is
/// torn down or superseded.
#[derive(Clone)]
pub struct ScanSession {
    shared: Arc<SessionShared>,
}

impl ScanSession {
    pub fn new(config: &ScannerConfig, sink: Arc<dyn ScanEventSink>) -> Self {
        let (state_tx, _) = watch::channel(ScanState::Idle);

        Self {
            shared: Arc::new(SessionShared {
                inner: Mutex::new(SessionInner {
                    state: ScanState::Idle,
                    epoch: 0,
                    stream_open: false,
                    start_pending: false,
                    closed: false,
                    device: None,
                    pump: None,
                    lease: None,
                }),
                state_tx,
                torn_down: AtomicBool::new(false),
                engine: OnceLock::new(),
                sink,
                stream: StreamConfig::from(config),
                noise: NoiseFilter::from_config(config),
            }),
        }
    }

    pub fn state(&self) -> ScanState {
        self.shared.inner.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ScanState> {
        self.shared.state_tx.subscribe()
    }

    pub fn engine(&self) -> Option<Arc<dyn DecodeEngine>> {
        self.shared.engine.get().cloned()
    }

    /// Device of the most recent start
    pub fn current_device(&self) -> Option<String> {
        self.shared.inner.lock().device.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Wait until the session is out of `Initializing`/`Stopping`, or closed
    pub async fn wait_until_settled(&self) -> ScanState {
        let mut rx = self.subscribe_state();
        let shared = Arc::clone(&self.shared);
        let settled = rx
            .wait_for(|state| !state.is_transient() || shared.torn_down.load(Ordering::SeqCst))
            .await
            .map(|state| *state);
        settled.unwrap_or_else(|_| self.state())
    }

    fn set_state(&self, inner: &mut SessionInner, state: ScanState) {
        if inner.state != state {
            debug!("Scan session state {} -> {}", inner.state, state);
            inner.state = state;
            self.shared.state_tx.send_replace(state);
        }
    }

    /// Load the decoder library and construct this session's engine.
    ///
    /// Valid from `Idle`. Returns the existing engine once one has been
    /// built; an engine is never constructed twice.
    pub async fn initialize(
        &self,
        library: &Arc<SharedLibrary>,
        target: &RenderTarget,
    ) -> Result<Arc<dyn DecodeEngine>, ScanError> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(ScanError::TornDown);
            }
            if let Some(engine) = self.shared.engine.get() {
                return Ok(Arc::clone(engine));
            }
            if inner.state != ScanState::Idle {
                return Err(ScanError::InvalidState {
                    expected: ScanState::Idle,
                    actual: inner.state,
                });
            }
            self.set_state(&mut inner, ScanState::Initializing);
        }

        info!("Initializing decode engine for render target '{}'", target);

        let lease = match library.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                let err = ScanError::from_engine(EnginePhase::Load, None, &e);
                self.fail_initialization(err.clone());
                return Err(err);
            }
        };

        let engine = match lease.create_engine(target).await {
            Ok(engine) => engine,
            Err(e) => {
                lease.release().await;
                let err = ScanError::from_engine(EnginePhase::Load, None, &e);
                self.fail_initialization(err.clone());
                return Err(err);
            }
        };

        let orphaned = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                Some(lease)
            } else {
                // Only this call left Idle, so the cell is still empty
                let _ = self.shared.engine.set(Arc::clone(&engine));
                inner.lease = Some(lease);
                self.set_state(&mut inner, ScanState::Ready);
                None
            }
        };

        if let Some(lease) = orphaned {
            debug!("Session torn down during initialization; releasing new engine");
            if let Err(e) = engine.stop().await {
                debug!("Ignoring engine stop failure after teardown: {}", e);
            }
            lease.release().await;
            return Err(ScanError::TornDown);
        }

        info!("Decode engine ready");
        Ok(engine)
    }

    fn fail_initialization(&self, err: ScanError) {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            debug!("Discarding initialization failure after teardown: {}", err);
            return;
        }

        error!("Decode engine initialization failed: {}", err);
        self.set_state(&mut inner, ScanState::Error);
        self.shared.sink.deliver(ScanEvent::Failed(err));
    }

    /// Leave `Error` so the user can try again: back to `Ready` when an
    /// engine exists, otherwise back to `Idle` for a fresh initialization.
    pub fn reset(&self) -> ScanState {
        let mut inner = self.shared.inner.lock();
        if inner.state == ScanState::Error && !inner.closed {
            let next = if self.shared.engine.get().is_some() {
                ScanState::Ready
            } else {
                ScanState::Idle
            };
            self.set_state(&mut inner, next);
        }
        inner.state
    }

    /// Open a decode stream on `device_id`.
    ///
    /// Valid only from `Ready`. Failures are delivered to the sink as
    /// `Failed` events and also returned.
    pub async fn start(&self, device_id: &str) -> Result<(), ScanError> {
        let (epoch, engine) = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(ScanError::TornDown);
            }

            let engine = match self.shared.engine.get() {
                Some(engine) if inner.state == ScanState::Ready && !inner.start_pending => {
                    Arc::clone(engine)
                }
                _ => {
                    let err = ScanError::InvalidState {
                        expected: ScanState::Ready,
                        actual: inner.state,
                    };
                    warn!("Rejecting scan start: {}", err);
                    self.shared.sink.deliver(ScanEvent::Failed(err.clone()));
                    return Err(err);
                }
            };

            self.set_state(&mut inner, ScanState::Scanning);
            inner.epoch += 1;
            inner.start_pending = true;
            inner.device = Some(device_id.to_string());
            (inner.epoch, engine)
        };

        info!("Starting scan on camera {}", device_id);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let result = engine.start(device_id, &self.shared.stream, frame_tx).await;

        match result {
            Ok(()) => {
                let token = CancellationToken::new();
                let current = {
                    let mut inner = self.shared.inner.lock();
                    inner.start_pending = false;
                    let current = self.is_current(&inner, epoch);
                    if current {
                        inner.stream_open = true;
                        inner.pump = Some(token.clone());
                    }
                    current
                };

                if !current {
                    // Stopped or torn down while the engine was opening the
                    // stream; nobody else will release it
                    debug!("Scan start completed after stop; releasing stream");
                    if let Err(e) = engine.stop().await {
                        debug!("Ignoring stop failure on superseded stream: {}", e);
                    }
                    return Ok(());
                }

                debug!("Camera stream open on {}", device_id);
                let session = self.clone();
                tokio::spawn(async move { session.pump_frames(epoch, frame_rx, token).await });
                Ok(())
            }
            Err(e) => {
                let err = ScanError::from_engine(EnginePhase::Start, Some(device_id), &e);
                let mut inner = self.shared.inner.lock();
                inner.start_pending = false;

                if self.is_current(&inner, epoch) {
                    let next = if err.is_terminal() {
                        error!("Scan start failed: {}", err);
                        ScanState::Error
                    } else {
                        warn!("Scan start failed: {}", err);
                        ScanState::Ready
                    };
                    self.set_state(&mut inner, next);
                    self.shared.sink.deliver(ScanEvent::Failed(err.clone()));
                } else {
                    debug!("Discarding start failure for superseded session: {}", err);
                }
                Err(err)
            }
        }
    }

    fn is_current(&self, inner: &SessionInner, epoch: u64) -> bool {
        !inner.closed && inner.epoch == epoch && inner.state == ScanState::Scanning
    }

    async fn pump_frames(
        self,
        epoch: u64,
        mut frames: mpsc::UnboundedReceiver<FrameOutcome>,
        token: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = frames.recv() => frame,
            };

            match frame {
                Some(FrameOutcome::Decoded(text)) => {
                    let ticket = {
                        let mut inner = self.shared.inner.lock();
                        if !self.is_current(&inner, epoch) {
                            break;
                        }
                        info!("Decoded symbol '{}'", text);
                        self.shared
                            .sink
                            .deliver(ScanEvent::Decoded(ScanResult::new(text)));
                        self.begin_stop(&mut inner)
                    };

                    if let Some(ticket) = ticket {
                        self.finish_stop(ticket).await;
                    }
                    break;
                }
                Some(FrameOutcome::Failed(message)) => {
                    if self.shared.noise.is_noise(&message) {
                        trace!("Frame without symbol: {}", message);
                    } else {
                        warn!("Decode engine frame error: {}", message);
                    }
                }
                None => {
                    let ticket = {
                        let mut inner = self.shared.inner.lock();
                        if !self.is_current(&inner, epoch) {
                            break;
                        }
                        warn!("Decode engine closed its frame stream");
                        self.shared
                            .sink
                            .deliver(ScanEvent::Failed(ScanError::StreamEnded));
                        self.begin_stop(&mut inner)
                    };

                    if let Some(ticket) = ticket {
                        self.finish_stop(ticket).await;
                    }
                    break;
                }
            }
        }
    }

    /// Release the camera. A no-op outside `Scanning`.
    pub async fn stop(&self) {
        let ticket = {
            let mut inner = self.shared.inner.lock();
            self.begin_stop(&mut inner)
        };

        if let Some(ticket) = ticket {
            self.finish_stop(ticket).await;
        }
    }

    fn begin_stop(&self, inner: &mut SessionInner) -> Option<StopTicket> {
        if inner.closed || inner.state != ScanState::Scanning {
            debug!("Stop requested in state {}; nothing to do", inner.state);
            return None;
        }

        self.set_state(inner, ScanState::Stopping);
        inner.epoch += 1;
        if let Some(token) = inner.pump.take() {
            token.cancel();
        }

        // With a start still pending, its completion releases the stream
        Some(StopTicket {
            epoch: inner.epoch,
            release: std::mem::take(&mut inner.stream_open),
        })
    }

    async fn finish_stop(&self, ticket: StopTicket) {
        let mut failure = None;
        if ticket.release {
            if let Some(engine) = self.shared.engine.get() {
                if let Err(e) = engine.stop().await {
                    failure = Some(ScanError::from_engine(EnginePhase::Stop, None, &e));
                }
            }
        }

        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return;
        }

        if inner.epoch == ticket.epoch && inner.state == ScanState::Stopping {
            self.set_state(&mut inner, ScanState::Ready);
        }

        if let Some(err) = failure {
            warn!("Camera stop failed; treating camera as released: {}", err);
            self.shared.sink.deliver(ScanEvent::Failed(err));
        }

        info!("Scan stopped");
        self.shared.sink.deliver(ScanEvent::Stopped);
    }

    /// Close the session for good.
    ///
    /// Always attempts an engine stop whatever the last known state, and
    /// swallows its failure. Later completions of in-flight operations see
    /// the closed flag and leave the session untouched.
    pub async fn teardown(&self) {
        let (engine, lease, last_state) = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            self.shared.torn_down.store(true, Ordering::SeqCst);
            inner.epoch += 1;
            inner.stream_open = false;
            if let Some(token) = inner.pump.take() {
                token.cancel();
            }
            (self.engine(), inner.lease.take(), inner.state)
        };

        // Wake anyone waiting for a transient state that will never resolve
        self.shared.state_tx.send_modify(|_| {});
        info!("Tearing down scan session (last state {})", last_state);

        if let Some(engine) = engine {
            match engine.stop().await {
                Ok(()) => debug!("Camera released on teardown"),
                Err(e) => debug!("Ignoring engine stop failure on teardown: {}", e),
            }
        }

        if let Some(lease) = lease {
            lease.release().await;
        }
    }
}
