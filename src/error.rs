use crate::session::ScanState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanfieldError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),
}

impl ScanfieldError {
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::Config(config::ConfigError::Message(message.into()))
    }
}

/// Failures of the scan subsystem as seen by the controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Camera permission denied: {details}")]
    PermissionDenied { phase: EnginePhase, details: String },

    #[error("No camera devices found")]
    NoCameraFound,

    #[error("Failed to start camera stream: {details}")]
    StartFailed { details: String },

    #[error("Camera device {device} is busy: {details}")]
    DeviceBusy { device: String, details: String },

    #[error("Failed to stop camera stream: {details}")]
    StopFailed { details: String },

    #[error("Decode engine ended the camera stream")]
    StreamEnded,

    /// "No symbol in this frame". Filtered by the session, never delivered.
    #[error("Decode noise: {details}")]
    DecodeNoise { details: String },

    #[error("Decode engine unavailable: {details}")]
    EngineUnavailable { details: String },

    #[error("Invalid scan state: expected {expected}, found {actual}")]
    InvalidState {
        expected: ScanState,
        actual: ScanState,
    },

    #[error("Scanner has been torn down")]
    TornDown,
}

/// Raw failure reported by the decode engine, named after the platform
/// exception that produced it (`NotAllowedError`, `NotReadableError`, ...)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct EngineError {
    pub name: String,
    pub message: String,
}

impl EngineError {
    pub fn new<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn not_allowed<M: Into<String>>(message: M) -> Self {
        Self::new("NotAllowedError", message)
    }

    pub fn not_readable<M: Into<String>>(message: M) -> Self {
        Self::new("NotReadableError", message)
    }

    pub fn not_found<M: Into<String>>(message: M) -> Self {
        Self::new("NotFoundError", message)
    }

    fn is_permission_refusal(&self) -> bool {
        matches!(
            self.name.as_str(),
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError"
        )
    }

    fn is_device_in_use(&self) -> bool {
        matches!(
            self.name.as_str(),
            "NotReadableError" | "TrackStartError" | "AbortError"
        )
    }
}

/// Engine operation that produced a raw failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Load,
    Enumerate,
    Start,
    Stop,
}

impl ScanError {
    /// Classify a raw engine failure for the phase it happened in
    pub fn from_engine(phase: EnginePhase, device: Option<&str>, err: &EngineError) -> Self {
        if err.is_permission_refusal() && phase != EnginePhase::Stop {
            return ScanError::PermissionDenied {
                phase,
                details: err.message.clone(),
            };
        }

        match phase {
            EnginePhase::Load => ScanError::EngineUnavailable {
                details: err.to_string(),
            },
            EnginePhase::Enumerate => {
                if err.name == "NotFoundError" || err.name == "DevicesNotFoundError" {
                    ScanError::NoCameraFound
                } else {
                    ScanError::StartFailed {
                        details: err.message.clone(),
                    }
                }
            }
            EnginePhase::Start => {
                if err.is_device_in_use() {
                    ScanError::DeviceBusy {
                        device: device.unwrap_or("unknown").to_string(),
                        details: err.message.clone(),
                    }
                } else {
                    ScanError::StartFailed {
                        details: err.message.clone(),
                    }
                }
            }
            EnginePhase::Stop => ScanError::StopFailed {
                details: err.message.clone(),
            },
        }
    }
}

pub trait ScanErrorExt {
    fn is_recoverable(&self) -> bool;
    fn is_terminal(&self) -> bool;
    fn user_message(&self) -> String;
}

impl ScanErrorExt for ScanError {
    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::StartFailed { .. }
                | ScanError::DeviceBusy { .. }
                | ScanError::StopFailed { .. }
                | ScanError::StreamEnded
                | ScanError::DecodeNoise { .. }
                | ScanError::InvalidState { .. }
        )
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanError::PermissionDenied { .. }
                | ScanError::NoCameraFound
                | ScanError::EngineUnavailable { .. }
                | ScanError::TornDown
        )
    }

    fn user_message(&self) -> String {
        match self {
            ScanError::PermissionDenied {
                phase: EnginePhase::Start,
                ..
            } => "Permission denied.".to_string(),
            ScanError::PermissionDenied { .. } => "Camera permission denied.".to_string(),
            ScanError::NoCameraFound => "No cameras found".to_string(),
            ScanError::StartFailed { details } => format!("Start failed: {}", details),
            ScanError::DeviceBusy { device, .. } => {
                format!("Start failed: camera {} is in use by another application", device)
            }
            ScanError::StopFailed { details } => format!("Stop failed: {}", details),
            ScanError::StreamEnded => "Camera error: stream ended".to_string(),
            ScanError::DecodeNoise { details } => format!("Nothing decoded: {}", details),
            ScanError::EngineUnavailable { details } => format!("Camera error: {}", details),
            ScanError::InvalidState { actual, .. } => {
                format!("Scanner is busy ({})", actual)
            }
            ScanError::TornDown => "Scanner is closed".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanfieldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_refusal_maps_to_permission_denied() {
        let err = EngineError::not_allowed("user dismissed prompt");

        for phase in [EnginePhase::Load, EnginePhase::Enumerate, EnginePhase::Start] {
            let mapped = ScanError::from_engine(phase, Some("cam-0"), &err);
            assert!(matches!(mapped, ScanError::PermissionDenied { .. }));
            assert!(mapped.is_terminal());
            assert!(!mapped.is_recoverable());
        }
    }

    #[test]
    fn test_device_in_use_maps_to_device_busy() {
        let err = EngineError::not_readable("Could not start video source");
        let mapped = ScanError::from_engine(EnginePhase::Start, Some("cam-1"), &err);

        assert_eq!(
            mapped,
            ScanError::DeviceBusy {
                device: "cam-1".to_string(),
                details: "Could not start video source".to_string(),
            }
        );
        assert!(mapped.is_recoverable());
    }

    #[test]
    fn test_other_start_failures_map_to_start_failed() {
        let err = EngineError::new("OverconstrainedError", "no matching resolution");
        let mapped = ScanError::from_engine(EnginePhase::Start, Some("cam-0"), &err);

        assert!(matches!(mapped, ScanError::StartFailed { .. }));
        assert_eq!(mapped.user_message(), "Start failed: no matching resolution");
    }

    #[test]
    fn test_stop_failures_never_become_permission_errors() {
        let err = EngineError::not_allowed("revoked mid-stream");
        let mapped = ScanError::from_engine(EnginePhase::Stop, None, &err);

        assert!(matches!(mapped, ScanError::StopFailed { .. }));
    }

    #[test]
    fn test_no_camera_and_permission_messages_are_distinct() {
        let denied = ScanError::PermissionDenied {
            phase: EnginePhase::Enumerate,
            details: String::new(),
        };
        assert_ne!(denied.user_message(), ScanError::NoCameraFound.user_message());
        assert_eq!(ScanError::NoCameraFound.user_message(), "No cameras found");
    }

    #[test]
    fn test_permission_message_depends_on_phase() {
        let err = EngineError::not_allowed("Permission denied");

        let on_start = ScanError::from_engine(EnginePhase::Start, Some("cam-0"), &err);
        let on_enumerate = ScanError::from_engine(EnginePhase::Enumerate, None, &err);

        assert_eq!(on_start.user_message(), "Permission denied.");
        assert_eq!(on_enumerate.user_message(), "Camera permission denied.");
    }

    #[test]
    fn test_invalid_config_is_a_config_error() {
        let err = ScanfieldError::invalid_config("fps must be greater than 0");

        assert!(matches!(err, ScanfieldError::Config(_)));
        assert_eq!(
            err.to_string(),
            "Configuration error: fps must be greater than 0"
        );
    }

    #[test]
    fn test_enumerate_not_found() {
        let err = EngineError::not_found("Requested device not found");
        assert_eq!(
            ScanError::from_engine(EnginePhase::Enumerate, None, &err),
            ScanError::NoCameraFound
        );
    }
}
