//! Top-level coordinator: owns the transport, spawns one session per
//! arriving device and fans status events out to the caller.
//!
//! The manager is constructed with a status sink and [`Settings`]; a call
//! to [`DeviceManager::boot`] or [`DeviceManager::update`] loads the boot
//! bundle (selecting the best match for an update when none is pinned) and
//! starts discovery. Each arrival runs boot → update → wait-for-completion
//! on its own detached thread. When a non-continuous run reaches its goal
//! phase the manager emits a Shutdown event for the caller to act on.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, info, warn};
use simplelog::{Config, WriteLogger};

use crate::bundle::{BootBundle, BundleCollection};
use crate::error::ManagerError;
use crate::flash::FlashPlan;
use crate::session::DeviceSession;
use crate::settings::Settings;
use crate::status::{DeviceEvent, DevicePhase, ManagerStatus, StatusEvent, StatusSink};
use crate::usb::transport::{create_transport, Transport};
use crate::usb::{EnumerationGate, UsbEndpointIo};

const MANAGER_LOG_FILE: &str = "astra-manager.log";

// =============================================================================
// Public Interface
// =============================================================================

pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl DeviceManager {
    /// Create the manager: resolves the temp directory, opens the log file
    /// and wraps the caller's sink so failures retain the temp directory.
    pub fn new(sink: StatusSink, settings: Settings) -> Result<DeviceManager, ManagerError> {
        let (temp_dir, temp_guard) = match settings.temp_dir.as_deref() {
            Some(dir) => {
                let path = PathBuf::from(dir);
                std::fs::create_dir_all(&path).map_err(|e| {
                    ManagerError::ConfigInvalid(format!("cannot create temp dir: {}", e))
                })?;
                (path, None)
            }
            None => {
                let guard = tempfile::Builder::new()
                    .prefix("astra-update-")
                    .tempdir()
                    .map_err(|e| {
                        ManagerError::Internal(format!("cannot create temp dir: {}", e))
                    })?;
                (guard.path().to_path_buf(), Some(guard))
            }
        };

        let log_path = settings
            .log_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| temp_dir.join(MANAGER_LOG_FILE));

        match File::create(&log_path) {
            // A second manager in the same process keeps the first logger.
            Ok(file) => {
                let _ = WriteLogger::init(settings.log_level, Config::default(), file);
            }
            Err(e) => eprintln!("cannot open log file {}: {}", log_path.display(), e),
        }

        let failure_reported = Arc::new(AtomicBool::new(false));
        let status = intercept_failures(sink, Arc::clone(&failure_reported));

        Ok(DeviceManager {
            inner: Arc::new(ManagerInner {
                settings,
                status,
                temp_dir,
                temp_guard: Mutex::new(temp_guard),
                log_path,
                failure_reported,
                mode: Mutex::new(Mode::Boot),
                bundle: Mutex::new(None),
                plan: Mutex::new(None),
                boot_command: Mutex::new(String::new()),
                transport: Mutex::new(None),
                sessions: Mutex::new(Vec::new()),
                gate: Arc::new(EnumerationGate::new()),
            }),
        })
    }

    /// Boot every arriving device from the bundle at `bundle_path`,
    /// optionally baking `boot_command` into a synthesized `uEnv.txt`.
    pub fn boot(&self, bundle_path: &Path, boot_command: &str) -> Result<(), ManagerError> {
        *self.inner.mode.lock().unwrap() = Mode::Boot;
        *self.inner.boot_command.lock().unwrap() = boot_command.to_string();

        let bundle = Arc::new(BootBundle::load(bundle_path)?);
        ManagerInner::init(&self.inner, bundle)
    }

    /// Boot every arriving device with the best-matching bundle under
    /// `bundles_path`, then run the flash plan.
    pub fn update(&self, plan: FlashPlan, bundles_path: &Path) -> Result<(), ManagerError> {
        *self.inner.mode.lock().unwrap() = Mode::Update;
        *self.inner.boot_command.lock().unwrap() = plan.flash_command().to_string();

        let collection = BundleCollection::load(bundles_path)?;

        let bundle = if plan.boot_bundle_id().is_empty() {
            if plan.chip().is_empty() {
                return Err(ManagerError::ConfigInvalid(
                    "chip name and boot bundle id missing".into(),
                ));
            }
            let candidates = collection.matching(
                plan.chip(),
                plan.secure_boot(),
                plan.memory_layout(),
                plan.ddr_type(),
                plan.board(),
            );
            BundleCollection::best_match(&candidates).ok_or_else(|| {
                ManagerError::BundleNotFound(format!("no boot bundle for chip {}", plan.chip()))
            })?
        } else {
            let id = plan.boot_bundle_id().to_string();
            collection
                .get(&id)
                .ok_or(ManagerError::BundleNotFound(id))?
        };

        *self.inner.plan.lock().unwrap() = Some(Arc::new(plan));
        ManagerInner::init(&self.inner, bundle)
    }

    /// Stop discovery, close every session and clean up the temp
    /// directory. Returns `true` when any failure was reported.
    pub fn shutdown(&self) -> bool {
        if let Some(mut transport) = self.inner.transport.lock().unwrap().take() {
            transport.shutdown();
        }

        let sessions = std::mem::take(&mut *self.inner.sessions.lock().unwrap());
        for session in sessions {
            session.close();
        }

        let failed = self.inner.failure_reported.load(Ordering::SeqCst);
        if let Some(guard) = self.inner.temp_guard.lock().unwrap().take() {
            if failed {
                // Keep the logs around for the operator.
                let _ = guard.into_path();
            }
        }

        failed
    }

    /// Path of the manager log file, printed to the user on failure.
    pub fn log_file(&self) -> &Path {
        &self.inner.log_path
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Boot,
    Update,
}

struct ManagerInner {
    settings: Settings,
    status: StatusSink,
    temp_dir: PathBuf,
    temp_guard: Mutex<Option<tempfile::TempDir>>,
    log_path: PathBuf,
    failure_reported: Arc<AtomicBool>,
    mode: Mutex<Mode>,
    bundle: Mutex<Option<Arc<BootBundle>>>,
    plan: Mutex<Option<Arc<FlashPlan>>>,
    boot_command: Mutex<String>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    sessions: Mutex<Vec<Arc<DeviceSession>>>,
    gate: Arc<EnumerationGate>,
}

impl ManagerInner {
    /// Announce the bundle, start the transport and begin accepting
    /// devices.
    fn init(inner: &Arc<ManagerInner>, bundle: Arc<BootBundle>) -> Result<(), ManagerError> {
        (inner.status)(StatusEvent::manager(
            ManagerStatus::Info,
            bundle.description(),
        ));

        let vendor_id = bundle.vendor_id();
        let product_id = bundle.product_id();
        *inner.bundle.lock().unwrap() = Some(bundle);

        let mut transport = create_transport(
            inner.settings.usb_debug,
            inner.settings.filter_ports.as_deref(),
            Arc::clone(&inner.gate),
        );

        let sink_inner = Arc::clone(inner);
        transport.start(
            vendor_id,
            product_id,
            Box::new(move |io| ManagerInner::on_device_added(&sink_inner, io)),
        )?;
        debug!("USB transport initialized successfully");

        *inner.transport.lock().unwrap() = Some(transport);

        (inner.status)(StatusEvent::manager(
            ManagerStatus::Start,
            format!(
                "Waiting for Astra Device ({:04X}:{:04X})",
                vendor_id, product_id
            ),
        ));

        Ok(())
    }

    fn on_device_added(inner: &Arc<ManagerInner>, io: UsbEndpointIo) {
        use crate::usb::EndpointIo;

        debug!("device added: {}", io.usb_path());
        let device_name = format!("device:{}", io.usb_path());
        (inner.status)(StatusEvent::Device(DeviceEvent {
            device: device_name.clone(),
            phase: DevicePhase::Added,
            progress: 0,
            image: String::new(),
            message: String::new(),
        }));

        let boot_only = *inner.mode.lock().unwrap() == Mode::Boot;
        let boot_command = inner.boot_command.lock().unwrap().clone();

        let session = match DeviceSession::new(
            Box::new(io),
            &inner.temp_dir,
            boot_only,
            &boot_command,
            Arc::clone(&inner.status),
            Arc::clone(&inner.gate),
            inner.settings.request_timeout,
        ) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                error!("failed to create device session: {}", e);
                (inner.status)(StatusEvent::manager(
                    ManagerStatus::Failure,
                    format!("Failed to create device session: {}", e),
                ));
                return;
            }
        };

        inner.sessions.lock().unwrap().push(Arc::clone(&session));

        let thread_inner = Arc::clone(inner);
        thread::Builder::new()
            .name(format!("session-{}", device_name))
            .spawn(move || ManagerInner::run_session(&thread_inner, session))
            .map(|_| ())
            .unwrap_or_else(|e| error!("failed to spawn session thread: {}", e));
    }

    /// Drive one session to its terminal phase on a detached thread.
    fn run_session(inner: &Arc<ManagerInner>, session: Arc<DeviceSession>) {
        debug!("booting device {}", session.device_name());

        let bundle = match inner.bundle.lock().unwrap().clone() {
            Some(bundle) => bundle,
            None => {
                error!("no boot bundle loaded");
                return;
            }
        };

        if let Err(e) = session.boot(&bundle) {
            error!("failed to boot device: {}", e);
            (inner.status)(StatusEvent::Device(DeviceEvent {
                device: session.device_name().to_string(),
                phase: DevicePhase::BootFail,
                progress: 0,
                image: String::new(),
                message: "Failed to Boot Device".into(),
            }));
            return;
        }

        let mode = *inner.mode.lock().unwrap();
        if mode == Mode::Update {
            let plan = inner.plan.lock().unwrap().clone();
            match plan {
                Some(plan) => {
                    if let Err(e) = session.update(&plan) {
                        error!("failed to update device: {}", e);
                        return;
                    }
                }
                None => {
                    warn!("update mode without a flash plan");
                    return;
                }
            }
        }

        session.wait_for_completion();

        let phase = session.phase();
        info!("session for {} ended in {}", session.device_name(), phase);

        let continuous = inner.settings.continuous;
        let done = match mode {
            Mode::Update => phase == DevicePhase::UpdateComplete,
            Mode::Boot => phase == DevicePhase::BootComplete,
        };
        if done && !continuous {
            debug!("shutting down the device manager");
            (inner.status)(StatusEvent::manager(
                ManagerStatus::Shutdown,
                "Astra Device Manager shutting down",
            ));
        }

        session.close();
    }
}

/// Wrap the caller's sink: any failure event also latches the
/// failure-reported flag so the temp directory (and its logs) survive
/// shutdown.
fn intercept_failures(sink: StatusSink, failure: Arc<AtomicBool>) -> StatusSink {
    Arc::new(move |event: StatusEvent| {
        match &event {
            StatusEvent::Manager(m) if m.status == ManagerStatus::Failure => {
                failure.store(true, Ordering::SeqCst);
            }
            StatusEvent::Device(d) if d.phase.is_failure() => {
                failure.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        sink(event);
    })
}
