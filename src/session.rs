//! Per-device boot-and-flash state machine.
//!
//! A session owns one USB device for its whole lifetime: it serves the
//! image requests the bootloader sends on the interrupt endpoint, streams
//! length-prefixed image payloads over bulk-out, tracks the boot/update
//! phase, and decides when the device has actually finished.
//!
//! Three threads cooperate per session: the endpoint engine's callback
//! worker feeds requests and console text in, the request-serving thread
//! answers them, and the application thread drives
//! boot → update → wait-for-completion. They share one mutex guarding the
//! phase, the image list and the pending request, so a phase transition
//! written by the serving thread is observed by the application thread in
//! order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use hexplay::HexViewBuilder;
use log::{debug, error, info, log_enabled, warn, Level::Debug};

use crate::bundle::{BootBundle, UbootConsole};
use crate::console::ConsoleStream;
use crate::error::ManagerError;
use crate::flash::FlashPlan;
use crate::image::{Image, ImageKind};
use crate::status::{DeviceEvent, DevicePhase, ManagerStatus, StatusEvent, StatusSink};
use crate::usb::{EndpointIo, EnumerationGate, UsbEvent};

// =============================================================================
// Wire protocol constants
// =============================================================================

/// Literal marker opening an image-request frame on the interrupt endpoint.
pub const IMAGE_REQUEST_MARKER: &[u8] = b"i*m*g*r*q*";

/// Served whenever requested: contains the device's bus path as ASCII.
pub const USB_PATH_IMAGE: &str = "06_IMAGE";

/// The size-echo file: 4 little-endian bytes holding the size of the most
/// recently sent image whose request tag exceeded the echo floor.
pub const SIZE_REQUEST_IMAGE: &str = "07_IMAGE";

/// Request tag bytes above this value are update payloads whose receipt the
/// device confirms by requesting the size-echo file.
pub const SIZE_ECHO_TAG_FLOOR: u8 = 0x79;

pub const UENV_IMAGE: &str = "uEnv.txt";

/// Loading this image resets the device; the disconnect that follows is
/// expected and must not fail the session.
pub const MINILOADER_IMAGE: &str = "gen3_miniloader.bin.usb";

const IMAGE_HEADER_SIZE: usize = 8;
const IMAGE_BLOCK_SIZE: usize = 1024 * 1024;
const BOOT_TIMEOUT_MESSAGE: &str =
    "Timeout during boot, press RESET while holding USB_BOOT to try again";

// =============================================================================
// Public Interface
// =============================================================================

/// One device being booted and optionally flashed.
pub struct DeviceSession {
    inner: Arc<SessionInner>,
    request_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DeviceSession {
    /// Wrap a freshly arrived device. `temp_dir` receives the per-device
    /// state directory; `boot_only` sessions stop after the boot sequence.
    pub fn new(
        io: Box<dyn EndpointIo>,
        temp_dir: &std::path::Path,
        boot_only: bool,
        boot_command: &str,
        status: StatusSink,
        gate: Arc<EnumerationGate>,
        request_timeout: Duration,
    ) -> Result<DeviceSession, ManagerError> {
        let device_name = format!("device:{}", io.usb_path());
        let device_dir = temp_dir.join(device_name.replace(':', "").replace('.', "_"));
        std::fs::create_dir_all(&device_dir)
            .map_err(|e| ManagerError::Internal(format!("cannot create device dir: {}", e)))?;

        let console = ConsoleStream::new(&device_dir);

        Ok(DeviceSession {
            inner: Arc::new(SessionInner {
                io,
                device_name,
                device_dir,
                boot_only,
                boot_command: boot_command.to_string(),
                request_timeout,
                status,
                gate,
                gate_held: AtomicBool::new(false),
                console,
                shared: Mutex::new(Shared {
                    phase: DevicePhase::Added,
                    images: Vec::new(),
                    requested_image: String::new(),
                    image_type_tag: 0,
                    request_ready: false,
                    final_boot_image: String::new(),
                    final_update_image: String::new(),
                    uenv_support: false,
                    console_mode: UbootConsole::Uart,
                    reset_when_complete: false,
                    completion_reported: false,
                    image_count: 0,
                }),
                request_cv: Condvar::new(),
                event_lock: Mutex::new(()),
                event_cv: Condvar::new(),
                ready_lock: Mutex::new(false),
                ready_cv: Condvar::new(),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
            request_thread: Mutex::new(None),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    pub fn phase(&self) -> DevicePhase {
        self.inner.shared.lock().unwrap().phase
    }

    /// Everything the device printed on its console so far.
    pub fn console_contents(&self) -> String {
        self.inner.console.contents()
    }

    /// Type raw ASCII into the U-Boot console.
    pub fn send_to_console(&self, data: &str) -> Result<(), ManagerError> {
        self.inner
            .io
            .write_interrupt(data.as_bytes())
            .map_err(|e| {
                error!("failed to send data to console: {}", e);
                ManagerError::Usb(e)
            })
    }

    /// Open the device and start serving the bundle's boot images.
    pub fn boot(&self, bundle: &BootBundle) -> Result<(), ManagerError> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.console_mode = bundle.console();
            shared.uenv_support = bundle.uenv_support();
            shared.final_boot_image = bundle.final_boot_image().to_string();
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .io
            .open(Box::new(move |event: UsbEvent, data: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_usb_event(event, data);
                }
            }))?;

        info!("device name: {}", self.inner.device_name);

        std::fs::write(
            self.inner.device_dir.join(USB_PATH_IMAGE),
            self.inner.io.usb_path(),
        )
        .map_err(|e| {
            error!("failed to create {} file: {}", USB_PATH_IMAGE, e);
            ManagerError::Internal(format!("cannot write {}: {}", USB_PATH_IMAGE, e))
        })?;

        {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.phase = DevicePhase::Opened;
            shared.images.extend(bundle.images().iter().cloned());

            let has_uenv = shared.images.iter().any(|img| img.name() == UENV_IMAGE);
            if !has_uenv && shared.uenv_support {
                debug!("adding {} to image list", UENV_IMAGE);

                if self.inner.boot_command.is_empty() {
                    // With nothing to run afterwards, booting is complete
                    // once the environment file itself has been loaded.
                    shared.final_boot_image = UENV_IMAGE.to_string();
                }

                self.write_uenv_file(&self.inner.boot_command)?;
                shared.images.push(Image::new(
                    self.inner.device_dir.join(UENV_IMAGE),
                    ImageKind::BootStage,
                ));
            }

            if !self.inner.boot_only && bundle.is_linux_boot() && shared.uenv_support {
                if shared.final_boot_image != UENV_IMAGE {
                    info!("overriding final boot image {} for update", shared.final_boot_image);
                    (self.inner.status)(StatusEvent::manager(
                        ManagerStatus::Info,
                        format!(
                            "Linux-capable bundle: treating boot as complete once {} is served",
                            UENV_IMAGE
                        ),
                    ));
                }
                shared.final_boot_image = UENV_IMAGE.to_string();
            }

            shared.images.push(Image::new(
                self.inner.device_dir.join(USB_PATH_IMAGE),
                ImageKind::BootStage,
            ));
            shared.images.push(Image::new(
                self.inner.device_dir.join(SIZE_REQUEST_IMAGE),
                ImageKind::UpdateEmmc,
            ));

            shared.phase = DevicePhase::BootStart;
        }

        self.inner.running.store(true, Ordering::SeqCst);
        self.inner
            .send_status(DevicePhase::BootStart, 0, "", "");

        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || {
            if let Err(e) = inner.handle_image_requests() {
                debug!("image request handling ended: {}", e);
            }
        });
        *self.request_thread.lock().unwrap() = Some(handle);

        // The very first request must not race thread startup.
        debug!("waiting for the image request thread to be ready");
        {
            let mut ready = self.inner.ready_lock.lock().unwrap();
            while !*ready {
                ready = self.inner.ready_cv.wait(ready).unwrap();
            }
        }

        self.inner.io.enable_interrupts()?;

        Ok(())
    }

    /// Queue the flash plan's images and, on USB-console devices without
    /// uEnv support, type the flash command once U-Boot is at its prompt.
    pub fn update(&self, plan: &FlashPlan) -> Result<(), ManagerError> {
        let (uenv_support, console_mode) = {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.final_update_image = plan.final_image().to_string();
            shared.reset_when_complete = plan.reset_when_complete();
            shared.images.extend(plan.images().iter().cloned());
            (shared.uenv_support, shared.console_mode)
        };

        if !uenv_support && console_mode == UbootConsole::Usb {
            if self.inner.console.wait_for_prompt() {
                self.send_to_console(&format!("{}\n", plan.flash_command()))?;
            }
        }

        Ok(())
    }

    /// Block until the device has demonstrably finished: a disconnect out
    /// of USB-download mode for uEnv/UART sessions, the U-Boot prompt for
    /// USB-console sessions. Emits the terminal Success event exactly once.
    pub fn wait_for_completion(&self) {
        let (uenv_support, console_mode) = {
            let shared = self.inner.shared.lock().unwrap();
            (shared.uenv_support, shared.console_mode)
        };

        if uenv_support || console_mode == UbootConsole::Uart {
            let mut guard = self.inner.event_lock.lock().unwrap();
            loop {
                self.inner.report_completion();
                if !self.inner.running.load(Ordering::SeqCst) {
                    debug!("device event received: shutting down");
                    break;
                }
                guard = self.inner.event_cv.wait(guard).unwrap();
            }
        } else if console_mode == UbootConsole::Usb {
            if self.inner.console.wait_for_prompt() {
                let reset = self.inner.shared.lock().unwrap().reset_when_complete;
                if reset {
                    if let Err(e) = self.send_to_console("reset\n") {
                        warn!("failed to reset device: {}", e);
                    }
                }
                self.inner.report_completion();
            }
        }
    }

    /// Stop the session: wake every waiter, join the serving thread, shut
    /// the console down and close the device. Idempotent.
    pub fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.notify_device_event();
        self.inner.notify_request_waiters();
        self.inner.console.shutdown();

        if let Some(handle) = self.request_thread.lock().unwrap().take() {
            debug!("joining image request thread");
            let _ = handle.join();
        }

        self.inner.shared.lock().unwrap().images.clear();
        self.inner.release_gate();

        debug!("closing USB device");
        self.inner.io.close();
        debug!("close complete");
    }

    fn write_uenv_file(&self, boot_command: &str) -> Result<(), ManagerError> {
        let contents = format!("bootcmd={}", boot_command);
        std::fs::write(self.inner.device_dir.join(UENV_IMAGE), contents).map_err(|e| {
            error!("failed to write {} file: {}", UENV_IMAGE, e);
            ManagerError::Internal(format!("cannot write {}: {}", UENV_IMAGE, e))
        })
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct SessionInner {
    io: Box<dyn EndpointIo>,
    device_name: String,
    device_dir: PathBuf,
    boot_only: bool,
    boot_command: String,
    request_timeout: Duration,
    status: StatusSink,
    gate: Arc<EnumerationGate>,
    gate_held: AtomicBool,
    console: ConsoleStream,
    shared: Mutex<Shared>,
    request_cv: Condvar,
    event_lock: Mutex<()>,
    event_cv: Condvar,
    ready_lock: Mutex<bool>,
    ready_cv: Condvar,
    running: AtomicBool,
    shutdown: AtomicBool,
}

/// Everything the serving, callback and application threads share.
struct Shared {
    phase: DevicePhase,
    images: Vec<Image>,
    requested_image: String,
    image_type_tag: u8,
    request_ready: bool,
    final_boot_image: String,
    final_update_image: String,
    uenv_support: bool,
    console_mode: UbootConsole,
    reset_when_complete: bool,
    completion_reported: bool,
    image_count: u32,
}

impl SessionInner {
    fn send_status(&self, phase: DevicePhase, progress: u8, image: &str, message: &str) {
        // The size-echo exchange is protocol chatter, not user progress.
        if image == SIZE_REQUEST_IMAGE {
            return;
        }
        info!(
            "device status: {} progress: {} image: {} message: {}",
            phase, progress, image, message
        );
        (self.status)(StatusEvent::Device(DeviceEvent {
            device: self.device_name.clone(),
            phase,
            progress,
            image: image.to_string(),
            message: message.to_string(),
        }));
    }

    /// Emit the terminal Success event once the session's goal phase has
    /// been reached. Latched: at most one report per session.
    fn report_completion(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.completion_reported {
            return;
        }
        let goal = if self.boot_only {
            DevicePhase::BootComplete
        } else {
            DevicePhase::UpdateComplete
        };
        if shared.phase == goal {
            shared.completion_reported = true;
            drop(shared);
            self.send_status(goal, 100, "", "Success");
        }
    }

    fn notify_device_event(&self) {
        let _guard = self.event_lock.lock().unwrap();
        self.event_cv.notify_all();
    }

    fn notify_request_waiters(&self) {
        let _guard = self.shared.lock().unwrap();
        self.request_cv.notify_all();
    }

    fn release_gate(&self) {
        if self.gate_held.swap(false, Ordering::SeqCst) {
            self.gate.unblock_enumeration();
        }
    }

    fn handle_usb_event(&self, event: UsbEvent, data: &[u8]) {
        match event {
            UsbEvent::Interrupt => self.handle_interrupt(data),
            UsbEvent::NoDevice | UsbEvent::TransferCanceled | UsbEvent::TransferError => {
                let mut shared = self.shared.lock().unwrap();
                if shared.requested_image == MINILOADER_IMAGE {
                    // The miniloader resets the device right after loading;
                    // this disconnect is the expected hand-off and the
                    // device re-enumerates on the same bus path.
                    warn!("device disconnected after sending {}", MINILOADER_IMAGE);
                    drop(shared);
                    self.release_gate();
                } else {
                    debug!("device disconnected: shutting down");
                    if shared.phase == DevicePhase::UpdateProgress {
                        shared.phase = DevicePhase::UpdateFail;
                    } else if shared.phase == DevicePhase::BootProgress {
                        shared.phase = DevicePhase::BootFail;
                    }
                    let phase = shared.phase;
                    drop(shared);
                    if phase != DevicePhase::UpdateComplete && phase != DevicePhase::BootComplete {
                        // Completed sessions report success from
                        // wait_for_completion instead.
                        self.send_status(phase, 0, "", "Device disconnected");
                    }
                }
                self.running.store(false, Ordering::SeqCst);
                self.notify_device_event();
                self.notify_request_waiters();
            }
        }
    }

    fn handle_interrupt(&self, data: &[u8]) {
        debug!("interrupt received: size: {}", data.len());
        if log_enabled!(Debug) {
            let view = HexViewBuilder::new(data)
                .address_offset(0)
                .row_width(16)
                .finish();
            debug!("\n{}", view);
        }

        match parse_image_request(data) {
            Some((tag, name)) => {
                let mut shared = self.shared.lock().unwrap();
                if shared.phase == DevicePhase::BootComplete && !self.boot_only {
                    shared.phase = DevicePhase::UpdateStart;
                }
                debug!("image type: {:#04x}", tag);
                debug!("requested image name: '{}'", name);
                shared.image_type_tag = tag;
                shared.requested_image = name;
                shared.request_ready = true;
                self.request_cv.notify_one();
            }
            None => {
                self.console.append(&String::from_utf8_lossy(data));
            }
        }
    }

    /// The request-serving loop. Returns when the session stops running,
    /// after a boot timeout, or after a serve failure.
    fn handle_image_requests(&self) -> Result<(), ManagerError> {
        debug!("signal image request thread ready");
        {
            let mut ready = self.ready_lock.lock().unwrap();
            *ready = true;
            self.ready_cv.notify_all();
        }

        let mut wait_for_size_request = false;
        let mut block = vec![0u8; IMAGE_BLOCK_SIZE];

        loop {
            let mut shared = self.shared.lock().unwrap();
            let (guard, timeout) = self
                .request_cv
                .wait_timeout_while(shared, self.request_timeout, |s| {
                    !s.request_ready && self.running.load(Ordering::SeqCst)
                })
                .unwrap();
            shared = guard;

            if !self.running.load(Ordering::SeqCst) {
                debug!("image request received while the session is not running");
                return Ok(());
            }

            if timeout.timed_out() && !shared.request_ready {
                debug!("timeout waiting for image request");
                if shared.phase == DevicePhase::BootProgress {
                    shared.phase = DevicePhase::BootFail;
                    drop(shared);
                    self.send_status(DevicePhase::BootFail, 0, "", BOOT_TIMEOUT_MESSAGE);
                    return Err(ManagerError::RequestTimeout);
                }
                continue;
            }

            shared.request_ready = false;

            let mut requested = shared.requested_image.clone();
            // Requests may carry a directory prefix; only the basename is
            // matched against the serve list.
            if let Some(pos) = requested.find('/') {
                let prefix = requested[..pos].to_string();
                requested = requested[pos + 1..].to_string();
                debug!(
                    "requested image name prefix: '{}', requested image name: '{}'",
                    prefix, requested
                );
            }

            let index = shared
                .images
                .iter()
                .position(|img| img.name() == requested);
            let index = match index {
                Some(index) => index,
                None => {
                    error!("requested image not found: {}", requested);
                    let message = format!("{} image not found", requested);
                    match shared.phase {
                        DevicePhase::BootStart | DevicePhase::BootProgress => {
                            shared.phase = DevicePhase::BootFail;
                            drop(shared);
                            self.send_status(DevicePhase::BootFail, 0, &requested, &message);
                        }
                        DevicePhase::UpdateStart | DevicePhase::UpdateProgress => {
                            shared.phase = DevicePhase::UpdateFail;
                            drop(shared);
                            self.send_status(DevicePhase::UpdateFail, 0, &requested, &message);
                        }
                        phase => {
                            warn!(
                                "requested image not found: {} while in {}",
                                requested, phase
                            );
                        }
                    }
                    return Err(ManagerError::ImageMissing(requested));
                }
            };

            if shared.phase == DevicePhase::BootStart {
                debug!("phase set to BootProgress");
                shared.phase = DevicePhase::BootProgress;
            } else if shared.phase == DevicePhase::UpdateStart {
                debug!("phase set to UpdateProgress");
                shared.phase = DevicePhase::UpdateProgress;
            }

            // The miniloader reset window must not race a concurrent
            // enumeration sweep.
            if requested == MINILOADER_IMAGE && !self.gate_held.swap(true, Ordering::SeqCst) {
                self.gate.block_enumeration();
            }

            match self.send_image(&mut shared, index, &mut block) {
                Err(e) => {
                    error!("failed to send image: {}", e);
                    let phase = match shared.phase {
                        DevicePhase::BootStart | DevicePhase::BootProgress => {
                            DevicePhase::BootFail
                        }
                        DevicePhase::UpdateStart | DevicePhase::UpdateProgress => {
                            DevicePhase::UpdateFail
                        }
                        phase => phase,
                    };
                    shared.phase = phase;
                    let name = shared.images[index].name().to_string();
                    drop(shared);
                    self.send_status(phase, 0, &name, "Failed to send image");
                    return Err(e);
                }
                Ok(()) => {
                    let name = shared.images[index].name().to_string();
                    let kind = shared.images[index].kind();
                    debug!(
                        "image sent successfully: {} (final boot '{}', final update '{}')",
                        name, shared.final_boot_image, shared.final_update_image
                    );

                    if !shared.final_boot_image.is_empty()
                        && name.contains(shared.final_boot_image.as_str())
                    {
                        debug!("final boot image sent");
                        shared.phase = DevicePhase::BootComplete;
                        if !self.boot_only {
                            drop(shared);
                            self.send_status(DevicePhase::BootComplete, 100, "", "Success");
                            shared = self.shared.lock().unwrap();
                        }
                        // Boot-only sessions report their success from
                        // wait_for_completion.
                    } else if !shared.final_update_image.is_empty()
                        && name.contains(shared.final_update_image.as_str())
                    {
                        debug!("final update image sent");
                        if kind == ImageKind::UpdateEmmc || kind == ImageKind::UpdateSpi {
                            // The device confirms receipt by asking for the
                            // size echo; completion waits for that request.
                            wait_for_size_request = true;
                        } else {
                            shared.phase = DevicePhase::UpdateComplete;
                        }
                    } else if wait_for_size_request
                        && name == SIZE_REQUEST_IMAGE
                        && !self.boot_only
                    {
                        debug!("size request image sent");
                        shared.phase = DevicePhase::UpdateComplete;
                        wait_for_size_request = false;
                    }

                    shared.image_count += 1;
                    debug!("image count: {}", shared.image_count);
                }
            }
        }
    }

    /// Stream one image: the 8-byte header, then file blocks until the
    /// whole payload is on the wire, updating the size echo afterwards.
    fn send_image(
        &self,
        shared: &mut Shared,
        index: usize,
        block: &mut [u8],
    ) -> Result<(), ManagerError> {
        let tag = shared.image_type_tag;
        let image = &mut shared.images[index];

        image.open().map_err(|e| {
            error!("failed to load image: {}", e);
            ManagerError::Image(e)
        })?;

        let name = image.name().to_string();
        let size = image.size();
        self.send_status(DevicePhase::ImageSendStart, 0, &name, "");

        let mut header = [0u8; IMAGE_HEADER_SIZE];
        header[..4].copy_from_slice(&(size as u32).to_le_bytes());

        let total_size = size as usize + IMAGE_HEADER_SIZE;
        debug!("total transfer size: {}", total_size);

        let mut transferred = self.io.write(&header)?;
        self.send_status(
            DevicePhase::ImageSendProgress,
            progress(transferred, total_size),
            &name,
            "",
        );

        while transferred < total_size {
            let image = &mut shared.images[index];
            let n = image.next_block(block)?;
            if n == 0 {
                break;
            }
            transferred += self.io.write(&block[..n])?;
            self.send_status(
                DevicePhase::ImageSendProgress,
                progress(transferred, total_size),
                &name,
                "",
            );
        }

        if transferred != total_size {
            error!("failed to transfer entire image");
            return Err(ManagerError::Internal(
                "failed to transfer entire image".into(),
            ));
        }

        if tag > SIZE_ECHO_TAG_FLOOR {
            self.update_size_echo(size as u32);
        }

        self.send_status(DevicePhase::ImageSendComplete, 100, &name, "");

        Ok(())
    }

    /// Overwrite the size-echo file with the little-endian size of the
    /// image that was just sent.
    fn update_size_echo(&self, size: u32) {
        let path = self.device_dir.join(SIZE_REQUEST_IMAGE);
        debug!("writing image size to {}: {}", SIZE_REQUEST_IMAGE, size);
        if let Err(e) = std::fs::write(&path, size.to_le_bytes()) {
            error!("failed to write image size to {}: {}", path.display(), e);
        }
    }
}

fn progress(transferred: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((transferred as f64 / total as f64) * 100.0) as u8
}

/// Scan an interrupt frame for the request marker. Text before the marker
/// is discarded; the byte after it is the image-type tag, followed by a
/// NUL-terminated basename. Returns `None` for console frames.
fn parse_image_request(data: &[u8]) -> Option<(u8, String)> {
    let pos = data
        .windows(IMAGE_REQUEST_MARKER.len())
        .position(|window| window == IMAGE_REQUEST_MARKER)?;

    let tail = &data[pos + IMAGE_REQUEST_MARKER.len()..];
    let tag = tail.first().copied().unwrap_or(0);
    let name_bytes = if tail.len() > 1 { &tail[1..] } else { &[][..] };
    let name_end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();

    Some((tag, name))
}

// =============================================================================
// Unit Tests
// =============================================================================
