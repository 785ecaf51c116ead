use super::*;
use crate::config::ScannerConfig;
use crate::engine::{
    FrameOutcome, RenderTarget, SharedLibrary, SimulatedBackend, SimulatedEngine,
};
use crate::error::{EngineError, ScanError};
use crate::events::{ScanEvent, ScanEventSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

struct Harness {
    backend: Arc<SimulatedBackend>,
    engine: Arc<SimulatedEngine>,
    library: Arc<SharedLibrary>,
    session: ScanSession,
    events: mpsc::UnboundedReceiver<ScanEvent>,
}

impl Harness {
    fn new() -> Self {
        let backend = Arc::new(SimulatedBackend::new());
        let engine = backend.engine();
        let library = SharedLibrary::new(backend.clone());
        let (tx, events) = mpsc::unbounded_channel();
        let sink: Arc<dyn ScanEventSink> = Arc::new(tx);
        let session = ScanSession::new(&ScannerConfig::default(), sink);

        Self {
            backend,
            engine,
            library,
            session,
            events,
        }
    }

    async fn ready() -> Self {
        let harness = Self::new();
        harness.initialize().await.unwrap();
        harness
    }

    async fn initialize(&self) -> Result<(), ScanError> {
        self.session
            .initialize(&self.library, &RenderTarget::new("qr-reader"))
            .await
            .map(|_| ())
    }

    async fn next_event(&mut self) -> ScanEvent {
        timeout(Duration::from_secs(1), self.events.recv())
            .await
            .expect("timed out waiting for scan event")
            .expect("event channel closed")
    }

    fn assert_no_events(&mut self) {
        assert!(self.events.try_recv().is_err(), "unexpected scan event");
    }
}

fn noise(message: &str) -> FrameOutcome {
    FrameOutcome::Failed(message.to_string())
}

fn decoded(text: &str) -> FrameOutcome {
    FrameOutcome::Decoded(text.to_string())
}

#[tokio::test]
async fn test_initialize_moves_idle_to_ready_once() {
    let harness = Harness::new();
    assert_eq!(harness.session.state(), ScanState::Idle);

    harness.initialize().await.unwrap();
    harness.initialize().await.unwrap();

    assert_eq!(harness.session.state(), ScanState::Ready);
    assert_eq!(harness.backend.create_calls(), 1);
    assert_eq!(harness.library.user_count().await, 1);
}

#[tokio::test]
async fn test_initialization_failure_parks_in_error_until_reset() {
    let mut harness = Harness::new();
    harness
        .backend
        .set_load_error(Some(EngineError::new("NetworkError", "script blocked")));

    let err = harness.initialize().await.unwrap_err();
    assert!(matches!(err, ScanError::EngineUnavailable { .. }));
    assert_eq!(harness.session.state(), ScanState::Error);
    assert!(matches!(
        harness.next_event().await,
        ScanEvent::Failed(ScanError::EngineUnavailable { .. })
    ));

    harness.backend.set_load_error(None);
    assert_eq!(harness.session.reset(), ScanState::Idle);
    harness.initialize().await.unwrap();
    assert_eq!(harness.session.state(), ScanState::Ready);
}

#[tokio::test]
async fn test_start_requires_ready() {
    let mut harness = Harness::new();

    let err = harness.session.start("sim-0").await.unwrap_err();

    assert_eq!(
        err,
        ScanError::InvalidState {
            expected: ScanState::Ready,
            actual: ScanState::Idle,
        }
    );
    assert!(matches!(
        harness.next_event().await,
        ScanEvent::Failed(ScanError::InvalidState { .. })
    ));
    assert_eq!(harness.engine.stats().start_calls, 0);
}

#[tokio::test]
async fn test_repeated_symbol_is_delivered_once() {
    let mut harness = Harness::ready().await;
    harness
        .engine
        .set_frames(vec![decoded("4006381333931"), decoded("4006381333931")]);

    harness.session.start("sim-0").await.unwrap();
    assert_eq!(harness.session.state(), ScanState::Scanning);

    match harness.next_event().await {
        ScanEvent::Decoded(result) => assert_eq!(result.text, "4006381333931"),
        other => panic!("expected decode, got {:?}", other),
    }
    assert_eq!(harness.next_event().await, ScanEvent::Stopped);

    sleep(Duration::from_millis(30)).await;
    harness.assert_no_events();
    assert_eq!(harness.session.state(), ScanState::Ready);
    assert_eq!(harness.engine.stats().open_streams, 0);
    assert_eq!(harness.engine.stats().stop_calls, 1);
}

#[tokio::test]
async fn test_decode_noise_is_never_surfaced() {
    let mut harness = Harness::ready().await;
    harness.engine.set_frames(vec![
        noise("QR code parse error, error = NotFoundException"),
        noise("No MultiFormat Readers were able to detect the code."),
        noise("Unexpected frame size"),
        decoded("ABC-123"),
    ]);

    harness.session.start("sim-0").await.unwrap();

    assert!(matches!(harness.next_event().await, ScanEvent::Decoded(_)));
    assert_eq!(harness.next_event().await, ScanEvent::Stopped);
}

#[tokio::test]
async fn test_engine_ending_stream_stops_session() {
    let mut harness = Harness::ready().await;
    harness
        .engine
        .set_frames(vec![noise("No MultiFormat Readers were able to detect the code.")]);
    harness.engine.set_end_stream_after_frames(true);

    harness.session.start("sim-0").await.unwrap();

    assert_eq!(
        harness.next_event().await,
        ScanEvent::Failed(ScanError::StreamEnded)
    );
    assert_eq!(harness.next_event().await, ScanEvent::Stopped);
    assert_eq!(harness.session.state(), ScanState::Ready);
    assert!(!harness.engine.is_streaming());
    assert_eq!(harness.engine.stats().stop_calls, 1);
}

#[tokio::test]
async fn test_stop_from_ready_is_a_no_op() {
    let mut harness = Harness::ready().await;

    harness.session.stop().await;
    harness.session.stop().await;

    assert_eq!(harness.session.state(), ScanState::Ready);
    assert_eq!(harness.engine.stats().stop_calls, 0);
    harness.assert_no_events();
}

#[tokio::test]
async fn test_stop_releases_open_stream() {
    let mut harness = Harness::ready().await;

    harness.session.start("sim-0").await.unwrap();
    assert!(harness.engine.is_streaming());

    harness.session.stop().await;

    assert_eq!(harness.session.state(), ScanState::Ready);
    assert!(!harness.engine.is_streaming());
    assert_eq!(harness.next_event().await, ScanEvent::Stopped);
}

#[tokio::test]
async fn test_stop_failure_still_forces_ready() {
    let mut harness = Harness::ready().await;
    harness
        .engine
        .set_stop_error(Some(EngineError::new("UnknownError", "track did not end")));

    harness.session.start("sim-0").await.unwrap();
    harness.session.stop().await;

    assert_eq!(harness.session.state(), ScanState::Ready);
    assert!(matches!(
        harness.next_event().await,
        ScanEvent::Failed(ScanError::StopFailed { .. })
    ));
    assert_eq!(harness.next_event().await, ScanEvent::Stopped);

    harness.engine.set_stop_error(None);
    harness.session.start("sim-0").await.unwrap();
    assert_eq!(harness.session.state(), ScanState::Scanning);
}

#[tokio::test]
async fn test_start_failure_is_recoverable() {
    let mut harness = Harness::ready().await;
    harness
        .engine
        .set_start_error(Some(EngineError::new("OverconstrainedError", "no usable mode")));

    let err = harness.session.start("sim-0").await.unwrap_err();
    assert!(matches!(err, ScanError::StartFailed { .. }));
    assert_eq!(harness.session.state(), ScanState::Ready);
    assert_eq!(harness.next_event().await, ScanEvent::Failed(err));

    harness.engine.set_start_error(None);
    harness.session.start("sim-0").await.unwrap();
    assert_eq!(harness.session.state(), ScanState::Scanning);
}

#[tokio::test]
async fn test_device_busy_is_recoverable() {
    let mut harness = Harness::ready().await;
    harness
        .engine
        .set_start_error(Some(EngineError::not_readable("Could not start video source")));

    let err = harness.session.start("sim-0").await.unwrap_err();

    assert!(matches!(err, ScanError::DeviceBusy { ref device, .. } if device == "sim-0"));
    assert_eq!(harness.session.state(), ScanState::Ready);
    assert!(matches!(
        harness.next_event().await,
        ScanEvent::Failed(ScanError::DeviceBusy { .. })
    ));
}

#[tokio::test]
async fn test_permission_denied_is_terminal() {
    let mut harness = Harness::ready().await;
    harness
        .engine
        .set_start_error(Some(EngineError::not_allowed("Permission denied")));

    let err = harness.session.start("sim-0").await.unwrap_err();
    assert!(matches!(err, ScanError::PermissionDenied { .. }));
    assert_eq!(harness.session.state(), ScanState::Error);
    assert!(matches!(
        harness.next_event().await,
        ScanEvent::Failed(ScanError::PermissionDenied { .. })
    ));

    // No automatic retry: a new start is refused until reset
    assert!(harness.session.start("sim-0").await.is_err());
    assert_eq!(harness.engine.stats().start_calls, 1);

    assert_eq!(harness.session.reset(), ScanState::Ready);
}

#[tokio::test]
async fn test_stop_while_start_pending_releases_late_stream() {
    let mut harness = Harness::ready().await;
    harness.engine.set_start_latency(Duration::from_millis(50));
    harness.engine.set_frames(vec![decoded("late")]);

    let session = harness.session.clone();
    let pending = tokio::spawn(async move { session.start("sim-0").await });
    sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.session.state(), ScanState::Scanning);

    harness.session.stop().await;
    assert_eq!(harness.session.state(), ScanState::Ready);
    assert_eq!(harness.next_event().await, ScanEvent::Stopped);

    // Superseded start resolves without touching the session
    pending.await.unwrap().unwrap();
    assert_eq!(harness.session.state(), ScanState::Ready);
    assert!(!harness.engine.is_streaming());
    assert_eq!(harness.engine.stats().stop_calls, 1);

    sleep(Duration::from_millis(30)).await;
    harness.assert_no_events();
}

#[tokio::test]
async fn test_start_refused_while_previous_start_pending() {
    let harness = Harness::ready().await;
    harness.engine.set_start_latency(Duration::from_millis(50));

    let session = harness.session.clone();
    let pending = tokio::spawn(async move { session.start("sim-0").await });
    sleep(Duration::from_millis(10)).await;
    harness.session.stop().await;

    let err = harness.session.start("sim-0").await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidState { .. }));

    pending.await.unwrap().unwrap();
    assert_eq!(harness.engine.stats().max_open_streams, 1);
    assert_eq!(harness.engine.stats().open_streams, 0);
}

#[tokio::test]
async fn test_teardown_during_initialization() {
    let mut harness = Harness::new();
    harness.backend.set_create_latency(Duration::from_millis(50));

    let session = harness.session.clone();
    let library = harness.library.clone();
    let init = tokio::spawn(async move {
        session
            .initialize(&library, &RenderTarget::new("qr-reader"))
            .await
            .map(|_| ())
    });
    sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.session.state(), ScanState::Initializing);

    harness.session.teardown().await;
    assert_eq!(init.await.unwrap(), Err(ScanError::TornDown));

    // Construction finished after teardown: state untouched, engine stopped
    assert_eq!(harness.session.state(), ScanState::Initializing);
    assert!(harness.session.engine().is_none());
    assert_eq!(harness.engine.stats().stop_calls, 1);
    assert_eq!(harness.library.user_count().await, 0);
    harness.assert_no_events();
}

#[tokio::test]
async fn test_teardown_while_scanning_releases_camera() {
    let mut harness = Harness::ready().await;

    harness.session.start("sim-0").await.unwrap();
    harness.session.teardown().await;

    assert!(harness.session.is_closed());
    assert!(!harness.engine.is_streaming());
    assert_eq!(harness.library.user_count().await, 0);
    assert_eq!(harness.backend.unload_calls(), 1);

    harness.session.stop().await;
    assert_eq!(harness.session.start("sim-0").await, Err(ScanError::TornDown));
    harness.assert_no_events();
}

#[tokio::test]
async fn test_teardown_swallows_stop_failure() {
    let harness = Harness::ready().await;

    // Nothing is streaming, so the engine rejects the stop
    harness.session.teardown().await;
    harness.session.teardown().await;

    assert_eq!(harness.engine.stats().stop_calls, 1);
    assert!(harness.session.is_closed());
}

#[tokio::test]
async fn test_wait_until_settled_observes_stop_completion() {
    let harness = Harness::ready().await;
    harness.engine.set_stop_latency(Duration::from_millis(30));
    harness.session.start("sim-0").await.unwrap();

    let session = harness.session.clone();
    let stopping = tokio::spawn(async move { session.stop().await });
    sleep(Duration::from_millis(5)).await;
    assert_eq!(harness.session.state(), ScanState::Stopping);

    let settled = timeout(Duration::from_secs(1), harness.session.wait_until_settled())
        .await
        .unwrap();
    assert_eq!(settled, ScanState::Ready);
    stopping.await.unwrap();
}
