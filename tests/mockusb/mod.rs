//! In-memory stand-in for a USB device in download mode.
//!
//! Records every bulk and interrupt-out write and lets a test inject
//! interrupt-in frames (image requests, console text) and disconnect
//! events through the same callback path the real endpoint engine uses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use astra_update::usb::{EndpointIo, UsbEvent, UsbEventFn};
use astra_update::{UsbError, IMAGE_REQUEST_MARKER};

pub struct MockEndpointIo {
    path: String,
    state: Arc<MockState>,
}

#[derive(Default)]
pub struct MockState {
    callback: Mutex<Option<UsbEventFn>>,
    pub bulk_writes: Mutex<Vec<Vec<u8>>>,
    pub interrupt_writes: Mutex<Vec<Vec<u8>>>,
    running: AtomicBool,
    pub closed: AtomicBool,
}

impl MockEndpointIo {
    pub fn new(path: &str) -> (MockEndpointIo, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            MockEndpointIo {
                path: path.to_string(),
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl MockState {
    /// Inject one interrupt-in frame.
    pub fn feed(&self, data: &[u8]) {
        let callback = self.callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(UsbEvent::Interrupt, data);
        }
    }

    /// Inject an image-request frame for `name` with the given type tag.
    pub fn request(&self, tag: u8, name: &str) {
        let mut frame = Vec::new();
        frame.extend_from_slice(IMAGE_REQUEST_MARKER);
        frame.push(tag);
        frame.extend_from_slice(name.as_bytes());
        frame.push(0);
        self.feed(&frame);
    }

    /// Simulate the device dropping off the bus.
    pub fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        let callback = self.callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(UsbEvent::NoDevice, &[]);
        }
    }

    /// Everything written to the bulk endpoint, concatenated.
    pub fn bulk_bytes(&self) -> Vec<u8> {
        self.bulk_writes.lock().unwrap().concat()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EndpointIo for MockEndpointIo {
    fn open(&self, callback: UsbEventFn) -> Result<(), UsbError> {
        *self.state.callback.lock().unwrap() = Some(callback);
        self.state.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn enable_interrupts(&self) -> Result<(), UsbError> {
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize, UsbError> {
        if !self.state.running.load(Ordering::SeqCst) {
            return Err(UsbError::NoDevice);
        }
        self.state.bulk_writes.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn write_interrupt(&self, data: &[u8]) -> Result<(), UsbError> {
        if !self.state.running.load(Ordering::SeqCst) {
            return Err(UsbError::NoDevice);
        }
        self.state
            .interrupt_writes
            .lock()
            .unwrap()
            .push(data.to_vec());
        Ok(())
    }

    fn usb_path(&self) -> &str {
        &self.path
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.running.store(false, Ordering::SeqCst);
    }
}
