//! astra-update boots and flashes Astra SoCs held in USB-download mode.
//! When a device is in that mode its bootloader repeatedly asks the host
//! for named image blobs over a USB interrupt endpoint; the host answers
//! each request by streaming the file as a length-prefixed blob over a
//! bulk endpoint, while a textual U-Boot console is interleaved on the
//! same interrupt stream. On top of that request/response protocol the
//! crate drives a full multi-stage sequence: serve a boot bundle until the
//! device reaches U-Boot, optionally trigger an eMMC or SPI flash, then
//! confirm the device actually finished before reporting success.
//!
//! Most of the interesting behavior lives in per-device state machines:
//!
//! * A [`DeviceSession`] advances through
//!   `Added → Opened → BootStart → BootProgress → BootComplete` and, for
//!   updates, on through `UpdateStart → UpdateProgress → UpdateComplete`.
//!   Transitions are triggered by protocol events (image requests, sends,
//!   the size echo, disconnects) and every `Complete`/`Fail` phase is
//!   terminal: a session never re-enters a progress phase.
//! * The [`DeviceManager`] supervises discovery and runs one session per
//!   arriving device, aggregating their status events into a single
//!   stream for the caller.
//!
//! Threads coordinate through mutexes and condition variables: the USB
//! engine's callback worker feeds requests in, a serving thread answers
//! them, and an application thread drives each session to completion.
//! The caller only consumes [`StatusEvent`]s from the sink it passed in.

mod bundle;
mod console;
mod error;
mod flash;
mod image;
mod manager;
mod session;
mod settings;
mod status;
pub mod usb;

pub use bundle::{
    BootBundle, BundleCollection, DdrType, MemoryLayout, SecureBoot, UbootConsole, UbootVariant,
};
pub use error::{ImageError, ManagerError, UsbError};
pub use flash::{EmmcParams, FlashKind, FlashPlan, SpiImageParams, SpiParams};
pub use image::{Image, ImageKind};
pub use manager::DeviceManager;
pub use session::{
    DeviceSession, IMAGE_REQUEST_MARKER, MINILOADER_IMAGE, SIZE_ECHO_TAG_FLOOR,
    SIZE_REQUEST_IMAGE, UENV_IMAGE, USB_PATH_IMAGE,
};
pub use settings::{Settings, SettingsBuilder};
pub use status::{
    DeviceEvent, DevicePhase, ManagerEvent, ManagerStatus, StatusEvent, StatusSink,
};
