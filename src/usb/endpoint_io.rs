//! Endpoint I/O engine for one USB device.
//!
//! Owns the device handle, discovers the interface endpoints, and runs two
//! worker threads: a reader pumping the interrupt-in endpoint and a
//! dispatcher draining the event queue into the owner's callback. Bulk
//! writes are synchronous on the caller's thread with a per-submission
//! timeout, one halt-clear retry, and at most one write in flight.
//!
//! Shutdown ordering: stop submissions, stop the reader (bounded wait for
//! its acknowledgement), drain and join the dispatcher, then release the
//! interface and drop the handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use retry::{delay, retry};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType};

use super::{EndpointIo, UsbEvent, UsbEventFn};
use crate::error::UsbError;

const INTERFACE_NUMBER: u8 = 0;
const BULK_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);
const INTERRUPT_OUT_TIMEOUT: Duration = Duration::from_millis(1000);
// The reader wakes at this cadence to observe cancellation.
const INTERRUPT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
const CANCEL_ACK_TIMEOUT: Duration = Duration::from_millis(500);
const DESCRIPTOR_RETRY_DELAY_MS: u64 = 100;
const DESCRIPTOR_RETRIES: usize = 4;

// =============================================================================
// Public Interface
// =============================================================================

pub struct UsbEndpointIo {
    device: Device<Context>,
    inner: Arc<IoShared>,
    reader_thread: Mutex<Option<thread::JoinHandle<()>>>,
    worker_thread: Mutex<Option<thread::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl UsbEndpointIo {
    pub fn new(device: Device<Context>, usb_path: String) -> Self {
        UsbEndpointIo {
            device,
            inner: Arc::new(IoShared {
                usb_path,
                handle: RwLock::new(None),
                endpoints: Mutex::new(None),
                running: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                worker_stop: AtomicBool::new(false),
                reader_done: Mutex::new(false),
                reader_done_cv: Condvar::new(),
                write_lock: Mutex::new(()),
            }),
            reader_thread: Mutex::new(None),
            worker_thread: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl EndpointIo for UsbEndpointIo {
    fn open(&self, callback: UsbEventFn) -> Result<(), UsbError> {
        if self.inner.handle.read().unwrap().is_some() {
            return Ok(());
        }

        let mut handle = self.device.open().map_err(UsbError::Open)?;

        // Devices fresh out of reset can briefly present an empty
        // configuration; give them a few attempts before giving up.
        let config = match retry(
            delay::Fixed::from_millis(DESCRIPTOR_RETRY_DELAY_MS).take(DESCRIPTOR_RETRIES),
            || -> Result<rusb::ConfigDescriptor, rusb::Error> {
                let config = self.device.config_descriptor(0)?;
                if config.num_interfaces() == 0 {
                    return Err(rusb::Error::Other);
                }
                Ok(config)
            },
        ) {
            Ok(config) => config,
            Err(retry::Error::Operation {
                error: rusb::Error::Other,
                tries,
                ..
            }) => {
                warn!(
                    "config descriptor reported zero interfaces after {} tries, resetting bus",
                    tries
                );
                let _ = handle.reset();
                return Err(UsbError::Transient);
            }
            Err(retry::Error::Operation { error, .. }) => {
                error!("failed to get config descriptor: {}", error);
                return Err(UsbError::Open(error));
            }
            Err(retry::Error::Internal(msg)) => {
                error!("internal retry error: {}", msg);
                return Err(UsbError::Transient);
            }
        };

        if let Ok(descriptor) = self.device.device_descriptor() {
            if let Ok(serial) = handle.read_serial_number_string_ascii(&descriptor) {
                info!("serial number: {}", serial);
            }
        }
        debug!("usb path: {}", self.inner.usb_path);

        match handle.set_auto_detach_kernel_driver(true) {
            Ok(()) => {}
            // Some platforms cannot detach kernel drivers at all.
            Err(rusb::Error::NotSupported) | Err(rusb::Error::NotFound) => {
                info!("kernel driver detach not supported");
            }
            Err(e) => {
                error!("failed to detach kernel driver: {}", e);
                return Err(UsbError::Open(e));
            }
        }

        handle
            .claim_interface(INTERFACE_NUMBER)
            .map_err(UsbError::Open)?;

        let endpoints = discover_endpoints(&config)?;
        debug!(
            "endpoints: interrupt-in {:#04x} ({}B), interrupt-out {:#04x} ({}B), bulk-out {:#04x}",
            endpoints.interrupt_in,
            endpoints.interrupt_in_size,
            endpoints.interrupt_out,
            endpoints.interrupt_out_size,
            endpoints.bulk_out,
        );

        for endpoint in endpoints.all() {
            handle.clear_halt(endpoint).map_err(UsbError::Open)?;
        }

        *self.inner.endpoints.lock().unwrap() = Some(endpoints);
        *self.inner.handle.write().unwrap() = Some(handle);

        // The dispatcher owns the callback; events queued before it runs
        // are delivered FIFO once it starts.
        let inner = Arc::clone(&self.inner);
        let worker = thread::spawn(move || {
            loop {
                let item = {
                    let mut queue = inner.queue.lock().unwrap();
                    loop {
                        if let Some(item) = queue.pop_front() {
                            break Some(item);
                        }
                        if inner.worker_stop.load(Ordering::SeqCst) {
                            break None;
                        }
                        queue = inner.queue_cv.wait(queue).unwrap();
                    }
                };
                match item {
                    Some((event, data)) => callback(event, &data),
                    None => break,
                }
            }
        });
        *self.worker_thread.lock().unwrap() = Some(worker);

        Ok(())
    }

    fn enable_interrupts(&self) -> Result<(), UsbError> {
        let endpoints = self
            .inner
            .endpoints
            .lock()
            .unwrap()
            .clone()
            .ok_or(UsbError::Malformed)?;

        self.inner.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let reader = thread::spawn(move || {
            inner.read_interrupts(endpoints.interrupt_in, endpoints.interrupt_in_size);
            let mut done = inner.reader_done.lock().unwrap();
            *done = true;
            inner.reader_done_cv.notify_all();
        });
        *self.reader_thread.lock().unwrap() = Some(reader);

        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize, UsbError> {
        // At most one bulk write in flight per device.
        let _write_guard = self.inner.write_lock.lock().unwrap();

        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(UsbError::NoDevice);
        }

        let endpoint = self.inner.bulk_out()?;
        debug!("bulk-out write: {} bytes", data.len());

        let mut written = 0;
        let mut halt_cleared = false;
        while written < data.len() {
            let result = {
                let guard = self.inner.handle.read().unwrap();
                let handle = guard.as_ref().ok_or(UsbError::NoDevice)?;
                handle.write_bulk(endpoint, &data[written..], BULK_TRANSFER_TIMEOUT)
            };
            match result {
                Ok(n) => written += n,
                Err(rusb::Error::Pipe) if !halt_cleared => {
                    warn!("bulk-out endpoint halted, clearing halt");
                    self.inner.clear_halt(endpoint)?;
                    info!("halt cleared, retrying transfer");
                    halt_cleared = true;
                }
                Err(rusb::Error::NoDevice) => {
                    error!("USB device is no longer available");
                    self.inner.running.store(false, Ordering::SeqCst);
                    return Err(UsbError::NoDevice);
                }
                Err(e) => {
                    error!("failed to write to USB device: {}", e);
                    return Err(UsbError::Io(e));
                }
            }
        }

        debug!("write complete: {} bytes written", written);
        Ok(written)
    }

    fn write_interrupt(&self, data: &[u8]) -> Result<(), UsbError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(UsbError::NoDevice);
        }

        let endpoint = {
            let endpoints = self.inner.endpoints.lock().unwrap();
            endpoints.as_ref().ok_or(UsbError::Malformed)?.interrupt_out
        };
        debug!("interrupt-out write: {} bytes", data.len());

        let guard = self.inner.handle.read().unwrap();
        let handle = guard.as_ref().ok_or(UsbError::NoDevice)?;
        handle
            .write_interrupt(endpoint, data, INTERRUPT_OUT_TIMEOUT)
            .map_err(|e| match e {
                rusb::Error::NoDevice => UsbError::NoDevice,
                other => UsbError::Io(other),
            })?;

        Ok(())
    }

    fn usb_path(&self) -> &str {
        &self.inner.usb_path
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.running.store(false, Ordering::SeqCst);

        // Bounded wait for the reader to acknowledge cancellation before
        // the handle goes away underneath it.
        let reader = self.reader_thread.lock().unwrap().take();
        if let Some(reader) = reader {
            let deadline = std::time::Instant::now() + CANCEL_ACK_TIMEOUT;
            let mut done = self.inner.reader_done.lock().unwrap();
            while !*done {
                let now = std::time::Instant::now();
                if now >= deadline {
                    warn!("interrupt reader did not acknowledge cancellation in time");
                    break;
                }
                let (guard, _) = self
                    .inner
                    .reader_done_cv
                    .wait_timeout(done, deadline - now)
                    .unwrap();
                done = guard;
            }
            drop(done);
            let _ = reader.join();
        }

        // Join the dispatcher before tearing anything down so no callback
        // observes a closed device.
        self.inner.worker_stop.store(true, Ordering::SeqCst);
        self.inner.queue_cv.notify_all();
        let worker = self.worker_thread.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }

        if let Some(mut handle) = self.inner.handle.write().unwrap().take() {
            debug!("releasing interface and closing device");
            let _ = handle.release_interface(INTERFACE_NUMBER);
        }
    }
}

impl Drop for UsbEndpointIo {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct IoShared {
    usb_path: String,
    handle: RwLock<Option<DeviceHandle<Context>>>,
    endpoints: Mutex<Option<Endpoints>>,
    running: AtomicBool,
    queue: Mutex<VecDeque<(UsbEvent, Vec<u8>)>>,
    queue_cv: Condvar,
    worker_stop: AtomicBool,
    reader_done: Mutex<bool>,
    reader_done_cv: Condvar,
    write_lock: Mutex<()>,
}

impl IoShared {
    fn push_event(&self, event: UsbEvent, data: Vec<u8>) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back((event, data));
        self.queue_cv.notify_one();
    }

    fn bulk_out(&self) -> Result<u8, UsbError> {
        let endpoints = self.endpoints.lock().unwrap();
        Ok(endpoints.as_ref().ok_or(UsbError::Malformed)?.bulk_out)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), UsbError> {
        let mut guard = self.handle.write().unwrap();
        let handle = guard.as_mut().ok_or(UsbError::NoDevice)?;
        handle.clear_halt(endpoint).map_err(|e| {
            error!("failed to clear halt on endpoint: {}", e);
            match e {
                rusb::Error::NoDevice => UsbError::NoDevice,
                other => UsbError::Io(other),
            }
        })
    }

    /// Pump the interrupt-in endpoint until cancellation or device loss.
    fn read_interrupts(&self, endpoint: u8, max_packet: usize) {
        let mut buf = vec![0u8; max_packet.max(1)];

        while self.running.load(Ordering::SeqCst) {
            let result = {
                let guard = self.handle.read().unwrap();
                let handle = match guard.as_ref() {
                    Some(handle) => handle,
                    None => break,
                };
                handle.read_interrupt(endpoint, &mut buf, INTERRUPT_POLL_TIMEOUT)
            };

            match result {
                Ok(n) => {
                    debug!("interrupt received: size {}", n);
                    self.push_event(UsbEvent::Interrupt, buf[..n].to_vec());
                }
                Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => continue,
                Err(rusb::Error::Pipe) => {
                    warn!("interrupt endpoint stalled, clearing halt");
                    match self.clear_halt(endpoint) {
                        Ok(()) => {
                            info!("halt cleared, resuming interrupt reads");
                            continue;
                        }
                        Err(UsbError::NoDevice) => {
                            self.running.store(false, Ordering::SeqCst);
                            self.push_event(UsbEvent::NoDevice, Vec::new());
                            break;
                        }
                        Err(_) => {
                            self.push_event(UsbEvent::TransferError, Vec::new());
                            break;
                        }
                    }
                }
                Err(rusb::Error::NoDevice) => {
                    info!("device is no longer there during transfer");
                    self.running.store(false, Ordering::SeqCst);
                    self.push_event(UsbEvent::NoDevice, Vec::new());
                    break;
                }
                Err(e) => {
                    error!("interrupt transfer failed: {}", e);
                    self.push_event(UsbEvent::TransferError, Vec::new());
                    break;
                }
            }
        }

        if !self.running.load(Ordering::SeqCst) {
            debug!("interrupt reader cancelled");
        }
    }
}

#[derive(Debug, Clone)]
struct Endpoints {
    interrupt_in: u8,
    interrupt_out: u8,
    bulk_out: u8,
    bulk_in: Option<u8>,
    interrupt_in_size: usize,
    interrupt_out_size: usize,
}

impl Endpoints {
    fn all(&self) -> Vec<u8> {
        let mut endpoints = vec![self.interrupt_in, self.interrupt_out, self.bulk_out];
        if let Some(bulk_in) = self.bulk_in {
            endpoints.push(bulk_in);
        }
        endpoints
    }
}

/// Classify every endpoint of the claimed interface by direction and
/// transfer type. Interrupt-in, interrupt-out and bulk-out are required.
fn discover_endpoints(config: &rusb::ConfigDescriptor) -> Result<Endpoints, UsbError> {
    let mut interrupt_in = None;
    let mut interrupt_out = None;
    let mut bulk_out = None;
    let mut bulk_in = None;
    let mut interrupt_in_size = 0usize;
    let mut interrupt_out_size = 0usize;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                debug!(
                    "endpoint {:#04x}: {:?} {:?}, max packet {}",
                    endpoint.address(),
                    endpoint.direction(),
                    endpoint.transfer_type(),
                    endpoint.max_packet_size(),
                );
                match (endpoint.direction(), endpoint.transfer_type()) {
                    (Direction::In, TransferType::Interrupt) => {
                        interrupt_in = Some(endpoint.address());
                        interrupt_in_size = endpoint.max_packet_size() as usize;
                    }
                    (Direction::Out, TransferType::Interrupt) => {
                        interrupt_out = Some(endpoint.address());
                        interrupt_out_size = endpoint.max_packet_size() as usize;
                    }
                    (Direction::In, TransferType::Bulk) => {
                        bulk_in = Some(endpoint.address());
                    }
                    (Direction::Out, TransferType::Bulk) => {
                        bulk_out = Some(endpoint.address());
                    }
                    _ => {}
                }
            }
        }
    }

    match (interrupt_in, interrupt_out, bulk_out) {
        (Some(interrupt_in), Some(interrupt_out), Some(bulk_out)) => Ok(Endpoints {
            interrupt_in,
            interrupt_out,
            bulk_out,
            bulk_in,
            interrupt_in_size,
            interrupt_out_size,
        }),
        _ => {
            error!("device interface is missing required endpoints");
            Err(UsbError::Malformed)
        }
    }
}
