//! Interleaved U-Boot console carried on the interrupt-in endpoint.
//!
//! Interrupt frames that are not image requests are console text. The stream
//! appends them to an in-memory buffer and to a `console.log` file in the
//! per-device directory, and watches for the U-Boot prompt suffix at the end
//! of the received data to wake threads waiting to type a command.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use log::{debug, warn};

// The bootloader signals it is ready for input with this suffix.
const UBOOT_PROMPT: &str = "=>";

// =============================================================================
// Crate-Public Interface
// =============================================================================

pub(crate) struct ConsoleStream {
    state: Mutex<ConsoleState>,
    prompt_cv: Condvar,
    shutdown: AtomicBool,
}

struct ConsoleState {
    data: String,
    prompt_seen: bool,
    log: Option<File>,
}

impl ConsoleStream {
    /// Create the stream, truncating any previous `console.log` in
    /// `device_dir`.
    pub(crate) fn new(device_dir: &Path) -> Self {
        let log = match File::create(device_dir.join("console.log")) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("failed to create console.log: {}", e);
                None
            }
        };

        ConsoleStream {
            state: Mutex::new(ConsoleState {
                data: String::new(),
                prompt_seen: false,
                log,
            }),
            prompt_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Append a console fragment, persist it, and wake prompt waiters if the
    /// trimmed data now ends with the prompt suffix.
    pub(crate) fn append(&self, data: &str) {
        let mut state = self.state.lock().unwrap();

        if data.trim_end().ends_with(UBOOT_PROMPT) {
            debug!("U-Boot prompt detected");
            state.prompt_seen = true;
            self.prompt_cv.notify_all();
        }

        state.data.push_str(data);
        if let Some(log) = state.log.as_mut() {
            let _ = log.write_all(data.as_bytes());
            let _ = log.flush();
        }
    }

    /// Everything received so far.
    pub(crate) fn contents(&self) -> String {
        self.state.lock().unwrap().data.clone()
    }

    /// Block until the prompt suffix arrives. Returns `false` when the
    /// stream was shut down instead.
    pub(crate) fn wait_for_prompt(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while !state.prompt_seen && !self.shutdown.load(Ordering::SeqCst) {
            state = self.prompt_cv.wait(state).unwrap();
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        state.prompt_seen = false;
        true
    }

    /// Release all prompt waiters and close the log.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.log = None;
        self.prompt_cv.notify_all();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
