//! Settings for the update manager.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::time::Duration;

use log::LevelFilter;

// =============================================================================
// Public Interface
// =============================================================================

/// Groups all settings of the [`DeviceManager`](crate::DeviceManager) and
/// acts as a [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Path of the manager log file. When not set, the log is written inside
    /// the temp directory.
    pub log_path: Option<String>,

    /// Directory holding the per-device state (size echo files, synthesized
    /// `uEnv.txt`, console logs). When not set, a fresh temp directory is
    /// created and removed on shutdown unless a failure was reported.
    pub temp_dir: Option<String>,

    /// Keep serving newly arriving devices after the first one completes.
    pub continuous: bool,

    /// Comma-separated list of USB bus-path prefixes. Devices whose bus path
    /// does not start with one of the prefixes are ignored.
    pub filter_ports: Option<String>,

    /// Enable libusb debug output.
    pub usb_debug: bool,

    /// Minimum level written to the manager log file.
    pub log_level: LevelFilter,

    /// Deadline of the per-session request wait loop. A timeout while the
    /// session is in `BootProgress` fails the boot.
    pub request_timeout: Duration,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```ignore
/// let settings = SettingsBuilder::new().continuous(true).finalize();
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl SettingsBuilder {
    /// Start building the settings using default values.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                log_path: None,
                temp_dir: None,
                continuous: false,
                filter_ports: None,
                usb_debug: false,
                log_level: LevelFilter::Info,
                request_timeout: Duration::from_secs(10),
                _private_use_builder: (),
            },
        }
    }

    /// Set the path of the manager log file.
    pub fn log_path<'a>(mut self, log_path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.log_path = Some(log_path.into().as_ref().to_owned());
        self
    }

    /// Set the directory holding per-device state.
    pub fn temp_dir<'a>(mut self, temp_dir: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.temp_dir = Some(temp_dir.into().as_ref().to_owned());
        self
    }

    /// Keep serving devices after the first one completes.
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.settings.continuous = continuous;
        self
    }

    /// Set the comma-separated USB bus-path allowlist.
    pub fn filter_ports<'a>(mut self, filter_ports: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.filter_ports = Some(filter_ports.into().as_ref().to_owned());
        self
    }

    /// Enable libusb debug output.
    pub fn usb_debug(mut self, usb_debug: bool) -> Self {
        self.settings.usb_debug = usb_debug;
        self
    }

    /// Set the minimum level written to the manager log file.
    pub fn log_level(mut self, log_level: LevelFilter) -> Self {
        self.settings.log_level = log_level;
        self
    }

    /// Set the request wait deadline.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.settings.request_timeout = request_timeout;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        SettingsBuilder::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(
        settings,
        Settings {
            log_path: None,
            temp_dir: None,
            continuous: false,
            filter_ports: None,
            usb_debug: false,
            log_level: LevelFilter::Info,
            request_timeout: Duration::from_secs(10),
            _private_use_builder: (),
        }
    )
}

#[test]
fn log_path() {
    let settings = SettingsBuilder::new().log_path("/tmp/astra.log").finalize();
    assert_eq!(settings.log_path.unwrap(), "/tmp/astra.log");
}

#[test]
fn temp_dir() {
    let settings = SettingsBuilder::new().temp_dir("/tmp/astra").finalize();
    assert_eq!(settings.temp_dir.unwrap(), "/tmp/astra");
}

#[test]
fn continuous() {
    let settings = SettingsBuilder::new().continuous(true).finalize();
    assert!(settings.continuous);
}

#[test]
fn filter_ports() {
    let settings = SettingsBuilder::new().filter_ports("1-2,1-3.4").finalize();
    assert_eq!(settings.filter_ports.unwrap(), "1-2,1-3.4");
}

#[test]
fn usb_debug() {
    let settings = SettingsBuilder::new().usb_debug(true).finalize();
    assert!(settings.usb_debug);
}

#[test]
fn log_level() {
    let settings = SettingsBuilder::new()
        .log_level(LevelFilter::Debug)
        .finalize();
    assert_eq!(settings.log_level, LevelFilter::Debug);
}

#[test]
fn request_timeout() {
    let settings = SettingsBuilder::new()
        .request_timeout(Duration::from_millis(250))
        .finalize();
    assert_eq!(settings.request_timeout, Duration::from_millis(250));
}
