//! Device discovery: hotplug callbacks where libusb supports them, polled
//! enumeration everywhere else.
//!
//! Both transports match devices on (vendor id, product id), derive a stable
//! bus-path string, apply the optional path-prefix allowlist and hand an
//! endpoint-IO handle to the registered sink. The polling transport probes
//! each candidate once per arrival: an access-denied open means another
//! process already owns the device and it is skipped. Enumeration sweeps
//! serialize against boot-critical sections through the
//! [`EnumerationGate`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};

use super::{EnumerationGate, UsbEndpointIo};
use crate::error::UsbError;

const EVENT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_RETRIES: usize = 3;
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(50);

// =============================================================================
// Public Interface
// =============================================================================

/// Sink receiving newly discovered devices.
pub type DeviceAddedFn = Box<dyn Fn(UsbEndpointIo) + Send + Sync>;

/// Device discovery for one (vendor id, product id) pair.
pub trait Transport: Send {
    fn start(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        on_device: DeviceAddedFn,
    ) -> Result<(), UsbError>;

    /// Stop discovery and join the monitor thread. Idempotent.
    fn shutdown(&mut self);
}

/// Build the transport appropriate for this libusb build.
pub fn create_transport(
    usb_debug: bool,
    filter_ports: Option<&str>,
    gate: Arc<EnumerationGate>,
) -> Box<dyn Transport> {
    let filter = parse_filter_ports(filter_ports.unwrap_or(""));
    if rusb::has_hotplug() {
        debug!("hotplug is supported");
        Box::new(HotplugTransport::new(usb_debug, filter))
    } else {
        debug!("hotplug is NOT supported, using polled enumeration");
        Box::new(PollingTransport::new(usb_debug, filter, gate))
    }
}

/// Stable textual identifier for a device: bus number and the dotted chain
/// of port numbers from the root hub.
pub fn format_bus_path(bus: u8, ports: &[u8]) -> String {
    let mut path = format!("{}-", bus);
    for (i, port) in ports.iter().enumerate() {
        if i > 0 {
            path.push('.');
        }
        path.push_str(&port.to_string());
    }
    path
}

/// Split the comma-separated allowlist into prefixes, dropping empties.
pub fn parse_filter_ports(filter_ports: &str) -> Vec<String> {
    filter_ports
        .split(',')
        .filter(|p| !p.is_empty())
        .map(|p| {
            debug!("adding filter port: {}", p);
            p.to_string()
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Hotplug transport
// -----------------------------------------------------------------------------

/// Discovery through libusb's hotplug callback, processed on a dedicated
/// event thread with a 1 s poll timeout.
pub struct HotplugTransport {
    usb_debug: bool,
    filter_ports: Vec<String>,
    context: Option<Context>,
    registration: Option<Registration<Context>>,
    event_thread: Option<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl HotplugTransport {
    pub fn new(usb_debug: bool, filter_ports: Vec<String>) -> Self {
        HotplugTransport {
            usb_debug,
            filter_ports,
            context: None,
            registration: None,
            event_thread: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Transport for HotplugTransport {
    fn start(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        on_device: DeviceAddedFn,
    ) -> Result<(), UsbError> {
        let mut context = Context::new().map_err(UsbError::Open)?;
        if self.usb_debug {
            let _ = context.set_log_level(rusb::LogLevel::Debug);
        }

        let handler = ArrivalHandler {
            filter_ports: self.filter_ports.clone(),
            on_device,
        };

        let registration = HotplugBuilder::new()
            .vendor_id(vendor_id)
            .product_id(product_id)
            .enumerate(true)
            .register(context.clone(), Box::new(handler))
            .map_err(|e| {
                error!("failed to register hotplug callback: {}", e);
                UsbError::Open(e)
            })?;

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let event_context = context.clone();
        self.event_thread = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match event_context.handle_events(Some(EVENT_POLL_TIMEOUT)) {
                    Ok(()) => {}
                    Err(rusb::Error::Interrupted) => {
                        debug!("event handling interrupted");
                    }
                    Err(e) => {
                        error!("failed to handle events: {}", e);
                        break;
                    }
                }
            }
        }));

        self.context = Some(context);
        self.registration = Some(registration);

        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the registration deregisters the callback.
        self.registration = None;
        if let Some(thread) = self.event_thread.take() {
            let _ = thread.join();
        }
        self.context = None;
    }
}

impl Drop for HotplugTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// -----------------------------------------------------------------------------
// Polling transport
// -----------------------------------------------------------------------------

/// Discovery by periodic enumeration, for libusb builds without hotplug
/// support. An arrival is a matching bus path absent from the previous
/// sweep; each arrival is probed once with a bounded retry before being
/// handed to the sink.
pub struct PollingTransport {
    usb_debug: bool,
    filter_ports: Vec<String>,
    gate: Arc<EnumerationGate>,
    context: Option<Context>,
    sweep_thread: Option<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl PollingTransport {
    pub fn new(usb_debug: bool, filter_ports: Vec<String>, gate: Arc<EnumerationGate>) -> Self {
        PollingTransport {
            usb_debug,
            filter_ports,
            gate,
            context: None,
            sweep_thread: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Transport for PollingTransport {
    fn start(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        on_device: DeviceAddedFn,
    ) -> Result<(), UsbError> {
        let mut context = Context::new().map_err(UsbError::Open)?;
        if self.usb_debug {
            let _ = context.set_log_level(rusb::LogLevel::Debug);
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let sweep_context = context.clone();
        let filter_ports = self.filter_ports.clone();
        let gate = Arc::clone(&self.gate);

        self.sweep_thread = Some(thread::spawn(move || {
            let mut seen: HashSet<String> = HashSet::new();
            while running.load(Ordering::SeqCst) {
                gate.wait_clear();

                let mut present = HashSet::new();
                match sweep_context.devices() {
                    Ok(devices) => {
                        for device in devices.iter() {
                            let descriptor = match device.device_descriptor() {
                                Ok(d) => d,
                                Err(_) => continue,
                            };
                            if descriptor.vendor_id() != vendor_id
                                || descriptor.product_id() != product_id
                            {
                                continue;
                            }

                            let path = device_bus_path(&device);
                            present.insert(path.clone());

                            if seen.contains(&path) {
                                continue;
                            }
                            if !path_allowed(&filter_ports, &path) {
                                debug!("device is not on a port we are monitoring");
                                continue;
                            }
                            if probe_device(&device, &path) {
                                info!(
                                    "device arrived: vid {:#06X} pid {:#06X} at {}",
                                    vendor_id, product_id, path
                                );
                                on_device(UsbEndpointIo::new(device, path));
                            }
                        }
                    }
                    Err(e) => {
                        error!("failed to enumerate devices: {}", e);
                    }
                }

                seen = present;
                thread::sleep(SWEEP_INTERVAL);
            }
        }));

        self.context = Some(context);

        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(thread) = self.sweep_thread.take() {
            let _ = thread.join();
        }
        self.context = None;
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct ArrivalHandler {
    filter_ports: Vec<String>,
    on_device: DeviceAddedFn,
}

impl Hotplug<Context> for ArrivalHandler {
    fn device_arrived(&mut self, device: Device<Context>) {
        if let Ok(descriptor) = device.device_descriptor() {
            info!(
                "device arrived: vid {:#06X} pid {:#06X}",
                descriptor.vendor_id(),
                descriptor.product_id()
            );
        }

        let path = device_bus_path(&device);
        debug!("usb path: {}", path);
        if !path_allowed(&self.filter_ports, &path) {
            debug!("device is not on a port we are monitoring");
            return;
        }

        (self.on_device)(UsbEndpointIo::new(device, path));
    }

    fn device_left(&mut self, _device: Device<Context>) {
        // Loss is observed per-device through the endpoint engine.
        debug!("device left");
    }
}

fn device_bus_path(device: &Device<Context>) -> String {
    let ports = device.port_numbers().unwrap_or_default();
    format_bus_path(device.bus_number(), &ports)
}

fn path_allowed(filter_ports: &[String], path: &str) -> bool {
    filter_ports.is_empty() || filter_ports.iter().any(|p| path.starts_with(p.as_str()))
}

/// Open-probe a candidate. Access denial means another process owns the
/// device; transient errors get a short retry.
fn probe_device(device: &Device<Context>, path: &str) -> bool {
    for attempt in 0..PROBE_RETRIES {
        match device.open() {
            Ok(handle) => {
                drop(handle);
                return true;
            }
            Err(rusb::Error::Access) => {
                debug!("device {} open reported access denied, skipping", path);
                return false;
            }
            Err(rusb::Error::NoDevice) => return false,
            Err(e) => {
                warn!(
                    "probe of {} failed ({}), attempt {}/{}",
                    path,
                    e,
                    attempt + 1,
                    PROBE_RETRIES
                );
                thread::sleep(PROBE_RETRY_DELAY);
            }
        }
    }
    false
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_path_single_port() {
        assert_eq!(format_bus_path(1, &[2]), "1-2");
    }

    #[test]
    fn bus_path_port_chain() {
        assert_eq!(format_bus_path(3, &[1, 4, 2]), "3-1.4.2");
    }

    #[test]
    fn bus_path_no_ports() {
        assert_eq!(format_bus_path(2, &[]), "2-");
    }

    #[test]
    fn filter_parse_drops_empty_entries() {
        assert_eq!(parse_filter_ports(""), Vec::<String>::new());
        assert_eq!(parse_filter_ports("1-2,,3-1.2,"), vec!["1-2", "3-1.2"]);
    }

    #[test]
    fn empty_filter_allows_all() {
        assert!(path_allowed(&[], "1-2.3"));
    }

    #[test]
    fn filter_matches_prefix() {
        let filter = parse_filter_ports("1-2,2-1");
        assert!(path_allowed(&filter, "1-2.3"));
        assert!(path_allowed(&filter, "2-1"));
        assert!(!path_allowed(&filter, "3-1"));
    }
}
