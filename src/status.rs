//! Status events reported to the caller.
//!
//! Sessions and the manager communicate with the embedding application
//! through a single tagged event stream: manager-level events (start, info,
//! failure, shutdown) and per-device events carrying the session phase,
//! progress and the image being transferred. The caller typically forwards
//! the sink into an `mpsc` channel and consumes events on its main thread.

use std::fmt;
use std::sync::Arc;

// =============================================================================
// Public Interface
// =============================================================================

/// Phase of a device session.
///
/// Phases only advance through the transitions implemented by
/// [`DeviceSession`](crate::DeviceSession); any `Complete` or `Fail` phase is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    Added,
    Opened,
    BootStart,
    BootProgress,
    BootComplete,
    BootFail,
    UpdateStart,
    UpdateProgress,
    UpdateComplete,
    UpdateFail,
    ImageSendStart,
    ImageSendProgress,
    ImageSendComplete,
    ImageSendFail,
}

impl DevicePhase {
    /// `true` for phases a session can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DevicePhase::BootComplete
                | DevicePhase::BootFail
                | DevicePhase::UpdateComplete
                | DevicePhase::UpdateFail
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, DevicePhase::BootFail | DevicePhase::UpdateFail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DevicePhase::Added => "Added",
            DevicePhase::Opened => "Opened",
            DevicePhase::BootStart => "BootStart",
            DevicePhase::BootProgress => "BootProgress",
            DevicePhase::BootComplete => "BootComplete",
            DevicePhase::BootFail => "BootFail",
            DevicePhase::UpdateStart => "UpdateStart",
            DevicePhase::UpdateProgress => "UpdateProgress",
            DevicePhase::UpdateComplete => "UpdateComplete",
            DevicePhase::UpdateFail => "UpdateFail",
            DevicePhase::ImageSendStart => "ImageSendStart",
            DevicePhase::ImageSendProgress => "ImageSendProgress",
            DevicePhase::ImageSendComplete => "ImageSendComplete",
            DevicePhase::ImageSendFail => "ImageSendFail",
        }
    }
}

impl fmt::Display for DevicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manager-level status tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    Start,
    Info,
    Failure,
    Shutdown,
}

/// A manager-level event: lifecycle and informational messages.
#[derive(Debug, Clone)]
pub struct ManagerEvent {
    pub status: ManagerStatus,
    pub message: String,
}

/// A per-device event.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub device: String,
    pub phase: DevicePhase,
    /// Transfer progress, 0..=100.
    pub progress: u8,
    pub image: String,
    pub message: String,
}

/// The tagged event type delivered to the status sink.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Manager(ManagerEvent),
    Device(DeviceEvent),
}

impl StatusEvent {
    pub fn manager(status: ManagerStatus, message: impl Into<String>) -> Self {
        StatusEvent::Manager(ManagerEvent {
            status,
            message: message.into(),
        })
    }
}

/// Thread-safe callback receiving status events from the manager and all of
/// its sessions. Passed in at manager construction; there is no global
/// singleton.
pub type StatusSink = Arc<dyn Fn(StatusEvent) + Send + Sync>;

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn terminal_phases() {
    assert!(DevicePhase::BootComplete.is_terminal());
    assert!(DevicePhase::UpdateFail.is_terminal());
    assert!(!DevicePhase::BootProgress.is_terminal());
    assert!(!DevicePhase::ImageSendComplete.is_terminal());
}

#[test]
fn failure_phases() {
    assert!(DevicePhase::BootFail.is_failure());
    assert!(DevicePhase::UpdateFail.is_failure());
    assert!(!DevicePhase::UpdateComplete.is_failure());
}
