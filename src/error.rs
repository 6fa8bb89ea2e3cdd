//! Error types for the update manager and its collaborators.
//!
//! Every fallible operation in the crate returns an explicit `Result`; the
//! request-serving and USB callback threads never unwind across a thread
//! boundary. Errors that reach a [`DeviceSession`](crate::DeviceSession) are
//! converted into phase transitions and status events; the
//! [`DeviceManager`](crate::DeviceManager) aggregates session outcomes into
//! the process exit code.

use std::path::PathBuf;

use thiserror::Error;

// =============================================================================
// Public Interface
// =============================================================================

/// Errors produced while opening or streaming an [`Image`](crate::Image).
#[derive(Debug, Error)]
pub enum ImageError {
    /// The image path does not resolve to a file.
    #[error("image file not found: {0}")]
    NotFound(PathBuf),

    /// The file exists but could not be opened.
    #[error("failed to open image {path}: {source}")]
    Permission {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file shrank after it was opened; a full block could not be read.
    #[error("short read from image {0}")]
    Short(PathBuf),

    /// Any other I/O error while reading image data.
    #[error("image i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the USB endpoint I/O engine and the transport.
#[derive(Debug, Error)]
pub enum UsbError {
    /// The device could not be opened or its interface claimed.
    #[error("failed to open USB device: {0}")]
    Open(#[source] rusb::Error),

    /// The interface is missing one of the required endpoints.
    #[error("malformed USB device: missing bulk-out or interrupt endpoints")]
    Malformed,

    /// The device descriptor reported zero interfaces even after retries;
    /// a bus reset was issued and the device is expected to re-enumerate.
    #[error("transient USB device state, reset issued")]
    Transient,

    /// A transfer failed and the endpoint could not be recovered.
    #[error("USB transfer error: {0}")]
    Io(#[source] rusb::Error),

    /// The device disappeared from the bus.
    #[error("USB device is no longer available")]
    NoDevice,
}

/// Top-level error type returned by the manager and session operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Malformed manifest, unknown memory layout, unrecognized image type.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// No boot bundle matches the flash plan.
    #[error("no boot bundle found: {0}")]
    BundleNotFound(String),

    #[error(transparent)]
    Usb(#[from] UsbError),

    #[error(transparent)]
    Image(#[from] ImageError),

    /// The device disconnected while a session was in progress.
    #[error("device disconnected")]
    DeviceGone,

    /// The device requested an image that is not in the serve list.
    #[error("{0} image not found")]
    ImageMissing(String),

    /// No image request arrived within the deadline during boot.
    #[error("timeout waiting for an image request")]
    RequestTimeout,

    /// A logic invariant was broken; fatal to the session.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_yaml::Error> for ManagerError {
    fn from(err: serde_yaml::Error) -> Self {
        ManagerError::ConfigInvalid(err.to_string())
    }
}
