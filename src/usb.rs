//! USB plumbing: per-device endpoint I/O and device discovery.
//!
//! Sessions talk to their device through the [`EndpointIo`] trait so the
//! state machine can be exercised against a mock in tests; the real
//! implementation wraps a libusb device handle. Discovery is provided by
//! the [`Transport`](transport::Transport) trait with a hotplug-callback
//! implementation and a polling fallback for platforms without hotplug
//! support.

mod endpoint_io;
mod gate;
pub mod transport;

pub use endpoint_io::UsbEndpointIo;
pub use gate::EnumerationGate;

use crate::error::UsbError;

// =============================================================================
// Public Interface
// =============================================================================

/// Events delivered from the endpoint I/O engine to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbEvent {
    /// An interrupt-in frame arrived; the payload accompanies the event.
    Interrupt,
    /// The device disappeared from the bus.
    NoDevice,
    /// A standing transfer was cancelled during shutdown.
    TransferCanceled,
    /// A transfer failed and could not be recovered.
    TransferError,
}

/// Callback receiving USB events. Invoked from the endpoint I/O worker
/// thread, never while any engine lock is held.
pub type UsbEventFn = Box<dyn Fn(UsbEvent, &[u8]) + Send + Sync>;

/// One USB device's endpoints, as a session sees them.
pub trait EndpointIo: Send + Sync {
    /// Open the device, claim its interface and discover endpoints. The
    /// callback observes interrupt frames and device-loss events once
    /// [`EndpointIo::enable_interrupts`] has been called.
    fn open(&self, callback: UsbEventFn) -> Result<(), UsbError>;

    /// Start delivering interrupt-in frames to the callback.
    fn enable_interrupts(&self) -> Result<(), UsbError>;

    /// Write `data` to the bulk-out endpoint, blocking until the transfer
    /// completes. Returns the number of bytes transferred.
    fn write(&self, data: &[u8]) -> Result<usize, UsbError>;

    /// Write raw ASCII to the interrupt-out endpoint (the U-Boot console).
    fn write_interrupt(&self, data: &[u8]) -> Result<(), UsbError>;

    /// Stable bus-path identifier (`bus-port[.port...]`).
    fn usb_path(&self) -> &str;

    /// `true` until the device is lost or the engine is shut down.
    fn is_running(&self) -> bool;

    /// Cancel standing transfers, join workers, release the interface.
    /// Idempotent and safe from any thread.
    fn close(&self);
}
