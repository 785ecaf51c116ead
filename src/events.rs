use crate::config::SystemConfig;
use crate::error::ScanError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// A decoded symbol, produced once per successful scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub text: String,
    pub observed_at: DateTime<Utc>,
}

impl ScanResult {
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            observed_at: Utc::now(),
        }
    }
}

/// Notifications a scan session delivers to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// The first symbol decoded in this session
    Decoded(ScanResult),
    /// An engine failure the owner has to surface or log
    Failed(ScanError),
    /// The camera stream has been released
    Stopped,
}

impl ScanEvent {
    /// Get the event type as a string for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            ScanEvent::Decoded(_) => "decoded",
            ScanEvent::Failed(_) => "failed",
            ScanEvent::Stopped => "stopped",
        }
    }

    pub fn description(&self) -> String {
        match self {
            ScanEvent::Decoded(result) => format!("Decoded '{}'", result.text),
            ScanEvent::Failed(error) => format!("Scan failed: {}", error),
            ScanEvent::Stopped => "Scan stopped".to_string(),
        }
    }
}

/// Receiver side of session notifications.
///
/// Called synchronously by the session while it holds its own state lock,
/// so implementations must not call back into the session.
pub trait ScanEventSink: Send + Sync {
    fn deliver(&self, event: ScanEvent);
}

impl ScanEventSink for mpsc::UnboundedSender<ScanEvent> {
    fn deliver(&self, event: ScanEvent) {
        if self.send(event).is_err() {
            debug!("Scan event receiver dropped");
        }
    }
}

/// Changes to the bound field, published for the hosting form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldEvent {
    ValueChanged { value: String },
    LockChanged { locked: bool },
    ScanningChanged { scanning: bool },
    ErrorChanged { error: Option<String> },
}

impl FieldEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            FieldEvent::ValueChanged { .. } => "value_changed",
            FieldEvent::LockChanged { .. } => "lock_changed",
            FieldEvent::ScanningChanged { .. } => "scanning_changed",
            FieldEvent::ErrorChanged { .. } => "error_changed",
        }
    }
}

/// Broadcast bus carrying field events to any number of observers
pub struct EventBus {
    sender: broadcast::Sender<FieldEvent>,
    debug_logging: bool,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: false,
        }
    }

    /// Create a new event bus with debug logging enabled
    pub fn with_debug_logging(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: true,
        }
    }

    pub fn from_config(config: &SystemConfig) -> Self {
        if config.debug_events {
            Self::with_debug_logging(config.event_bus_capacity)
        } else {
            Self::new(config.event_bus_capacity)
        }
    }

    pub fn is_debug_logging(&self) -> bool {
        self.debug_logging
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FieldEvent> {
        self.sender.subscribe()
    }

    /// Publish an event, returning the number of observers that received it
    pub fn publish(&self, event: FieldEvent) -> usize {
        match &event {
            FieldEvent::ValueChanged { value } => info!("Field value changed to '{}'", value),
            FieldEvent::ErrorChanged { error: Some(error) } => warn!("Field error: {}", error),
            _ => {
                if self.debug_logging {
                    debug!("Field event: {:?}", event);
                }
            }
        }

        // No observers is normal for a headless field
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            debug_logging: self.debug_logging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_fans_out() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let delivered = bus.publish(FieldEvent::ValueChanged {
            value: "4006381333931".to_string(),
        });
        assert_eq!(delivered, 2);

        for receiver in [&mut first, &mut second] {
            let event = timeout(Duration::from_millis(100), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.event_type(), "value_changed");
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(FieldEvent::LockChanged { locked: true }), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_bus_from_config() {
        let mut config = crate::config::ScanfieldConfig::default().system;
        assert!(!EventBus::from_config(&config).is_debug_logging());

        config.debug_events = true;
        let bus = EventBus::from_config(&config);
        assert!(bus.is_debug_logging());
        assert!(bus.clone().is_debug_logging());
        assert_eq!(bus.publish(FieldEvent::LockChanged { locked: false }), 0);
    }

    #[test]
    fn test_field_event_serializes_tagged() {
        let event = FieldEvent::ScanningChanged { scanning: true };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"scanning_changed","scanning":true}"#);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.deliver(ScanEvent::Stopped);

        assert_eq!(rx.recv().await, Some(ScanEvent::Stopped));
        assert_eq!(ScanEvent::Stopped.event_type(), "stopped");
    }
}
