use serde::Serialize;
use std::fmt;

/// Lifecycle of a scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScanState {
    /// No engine constructed yet
    Idle,
    /// Library load and engine construction in progress
    Initializing,
    /// Engine constructed, camera released
    Ready,
    /// Stream requested or open
    Scanning,
    /// Stream release in progress
    Stopping,
    /// Parked after a terminal failure
    Error,
}

impl ScanState {
    /// States that resolve on their own once an engine call completes
    pub fn is_transient(&self) -> bool {
        matches!(self, ScanState::Initializing | ScanState::Stopping)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "idle",
            ScanState::Initializing => "initializing",
            ScanState::Ready => "ready",
            ScanState::Scanning => "scanning",
            ScanState::Stopping => "stopping",
            ScanState::Error => "error",
        };
        f.write_str(name)
    }
}
