use crate::error::{ScanError, ScanErrorExt};
use crate::events::{EventBus, FieldEvent, ScanEvent, ScanEventSink};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Text bound to the form field plus its lock flag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoundValue {
    pub value: String,
    pub locked: bool,
}

/// Everything the hosting field renders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldSnapshot {
    pub value: String,
    pub locked: bool,
    pub scanning: bool,
    pub error: Option<String>,
}

impl FieldSnapshot {
    pub fn bound(&self) -> BoundValue {
        BoundValue {
            value: self.value.clone(),
            locked: self.locked,
        }
    }

    /// Captured values are read-only until cleared
    pub fn read_only(&self) -> bool {
        self.locked
    }

    pub fn show_clear(&self) -> bool {
        !self.value.is_empty()
    }

    pub fn action_label(&self) -> &'static str {
        if self.scanning {
            "Close"
        } else {
            "Scan"
        }
    }
}

#[derive(Default)]
struct FieldInner {
    snapshot: FieldSnapshot,
    closed: bool,
}

/// Field state and lock policy; also the sink the scan session reports to
pub struct FieldBinding {
    inner: Mutex<FieldInner>,
    bus: EventBus,
}

impl FieldBinding {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(FieldInner::default()),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn snapshot(&self) -> FieldSnapshot {
        self.inner.lock().snapshot.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().snapshot.scanning
    }

    /// Apply `update` and publish the resulting events, unless closed
    fn update<F>(&self, update: F)
    where
        F: FnOnce(&mut FieldSnapshot, &mut Vec<FieldEvent>),
    {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                trace!("Field closed; ignoring update");
                return;
            }
            update(&mut inner.snapshot, &mut events);
        }

        for event in events {
            self.bus.publish(event);
        }
    }

    /// Returns whether the edit was applied
    pub fn on_manual_edit(&self, text: &str) -> bool {
        let mut applied = false;
        self.update(|field, events| {
            if field.locked {
                debug!("Ignoring manual edit of locked field");
                return;
            }
            applied = true;
            set_value(field, events, text);
        });
        applied
    }

    pub fn on_scan_result(&self, text: &str) {
        self.update(|field, events| {
            set_value(field, events, text);
            set_locked(field, events, true);
            set_scanning(field, events, false);
            set_error(field, events, None);
        });
    }

    pub fn clear(&self) {
        self.update(|field, events| {
            set_value(field, events, "");
            set_locked(field, events, false);
        });
    }

    /// An explicit scan request overrides a previous capture lock.
    /// `scanning` is raised separately, once a camera has been chosen.
    pub fn begin_scan(&self) {
        self.update(|field, events| {
            set_locked(field, events, false);
            set_error(field, events, None);
        });
    }

    pub fn set_scanning(&self, scanning: bool) {
        self.update(|field, events| set_scanning(field, events, scanning));
    }

    pub fn report_error(&self, err: &ScanError) {
        match err {
            ScanError::DecodeNoise { details } => {
                trace!("Dropping decode noise: {}", details);
            }
            ScanError::TornDown => {}
            ScanError::StopFailed { .. } => {
                warn!("Scanner stop failed: {}", err);
                self.set_scanning(false);
            }
            _ => {
                let message = err.user_message();
                self.update(|field, events| {
                    set_scanning(field, events, false);
                    set_error(field, events, Some(message));
                });
            }
        }
    }

    /// Freeze the field; later deliveries are ignored
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }
}

impl ScanEventSink for FieldBinding {
    fn deliver(&self, event: ScanEvent) {
        trace!("Field received scan event: {}", event.description());
        match event {
            ScanEvent::Decoded(result) => self.on_scan_result(&result.text),
            ScanEvent::Failed(err) => self.report_error(&err),
            ScanEvent::Stopped => self.set_scanning(false),
        }
    }
}

fn set_value(field: &mut FieldSnapshot, events: &mut Vec<FieldEvent>, value: &str) {
    if field.value != value {
        field.value = value.to_string();
        events.push(FieldEvent::ValueChanged {
            value: field.value.clone(),
        });
    }
}

fn set_locked(field: &mut FieldSnapshot, events: &mut Vec<FieldEvent>, locked: bool) {
    if field.locked != locked {
        field.locked = locked;
        events.push(FieldEvent::LockChanged { locked });
    }
}

fn set_scanning(field: &mut FieldSnapshot, events: &mut Vec<FieldEvent>, scanning: bool) {
    if field.scanning != scanning {
        field.scanning = scanning;
        events.push(FieldEvent::ScanningChanged { scanning });
    }
}

fn set_error(field: &mut FieldSnapshot, events: &mut Vec<FieldEvent>, error: Option<String>) {
    if field.error != error {
        field.error = error.clone();
        events.push(FieldEvent::ErrorChanged { error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ScanResult;

    fn binding() -> FieldBinding {
        FieldBinding::new(EventBus::new(16))
    }

    #[test]
    fn test_manual_edit_applies_when_unlocked() {
        let field = binding();

        assert!(field.on_manual_edit("12345"));
        assert_eq!(field.snapshot().value, "12345");
    }

    #[test]
    fn test_scan_result_locks_value() {
        let field = binding();
        field.begin_scan();

        field.deliver(ScanEvent::Decoded(ScanResult::new("4006381333931")));

        let snapshot = field.snapshot();
        assert_eq!(snapshot.bound(), BoundValue {
            value: "4006381333931".to_string(),
            locked: true,
        });
        assert!(!snapshot.scanning);
        assert!(snapshot.read_only());

        assert!(!field.on_manual_edit("typed over"));
        assert!(!field.on_manual_edit(""));
        assert_eq!(field.snapshot().value, "4006381333931");
    }

    #[test]
    fn test_clear_unlocks() {
        let field = binding();
        field.on_scan_result("ABC");

        field.clear();

        let snapshot = field.snapshot();
        assert_eq!(snapshot.value, "");
        assert!(!snapshot.locked);
        assert!(!snapshot.show_clear());
        assert!(field.on_manual_edit("typed"));
    }

    #[test]
    fn test_begin_scan_overrides_lock_but_keeps_value() {
        let field = binding();
        field.on_scan_result("ABC");

        field.begin_scan();

        let snapshot = field.snapshot();
        assert!(!snapshot.locked);
        assert!(!snapshot.scanning);
        assert_eq!(snapshot.value, "ABC");
        assert_eq!(snapshot.action_label(), "Scan");

        field.set_scanning(true);
        assert_eq!(field.snapshot().action_label(), "Close");
    }

    #[test]
    fn test_errors_stop_scanning_and_show_message() {
        let field = binding();
        field.begin_scan();
        field.set_scanning(true);

        field.report_error(&ScanError::StartFailed {
            details: "camera unplugged".to_string(),
        });

        let snapshot = field.snapshot();
        assert!(!snapshot.scanning);
        assert_eq!(snapshot.error.as_deref(), Some("Start failed: camera unplugged"));
        assert_eq!(snapshot.action_label(), "Scan");
    }

    #[test]
    fn test_stop_failure_is_logged_only() {
        let field = binding();
        field.begin_scan();
        field.set_scanning(true);

        field.report_error(&ScanError::StopFailed {
            details: "track did not end".to_string(),
        });

        let snapshot = field.snapshot();
        assert!(!snapshot.scanning);
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn test_closed_field_ignores_deliveries() {
        let field = binding();
        field.close();

        field.deliver(ScanEvent::Decoded(ScanResult::new("late")));

        assert_eq!(field.snapshot(), FieldSnapshot::default());
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let field = binding();
        let mut rx = field.bus().subscribe();

        field.on_scan_result("XYZ");

        assert_eq!(
            rx.recv().await.unwrap(),
            FieldEvent::ValueChanged {
                value: "XYZ".to_string()
            }
        );
        assert_eq!(rx.recv().await.unwrap(), FieldEvent::LockChanged { locked: true });
    }
}
