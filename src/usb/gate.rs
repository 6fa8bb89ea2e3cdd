//! Serialization of device enumeration against boot-critical sections.
//!
//! Some boot stages reset the device immediately after they are loaded;
//! probing devices while such a reset is in flight can steal the handle out
//! from under the session that is mid-boot. Sessions hold the gate around
//! that window and the polling transport waits for it to clear before each
//! enumeration sweep. A crashed holder is recovered by the sweep timeout.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

// An abandoned gate must not stall enumeration forever.
const ABANDONMENT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Default)]
pub struct EnumerationGate {
    holders: Mutex<u32>,
    cv: Condvar,
}

impl EnumerationGate {
    pub fn new() -> Self {
        EnumerationGate {
            holders: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Enter a boot-critical section.
    pub fn block_enumeration(&self) {
        let mut holders = self.holders.lock().unwrap();
        *holders += 1;
    }

    /// Leave a boot-critical section.
    pub fn unblock_enumeration(&self) {
        let mut holders = self.holders.lock().unwrap();
        *holders = holders.saturating_sub(1);
        if *holders == 0 {
            self.cv.notify_all();
        }
    }

    /// Wait until no boot-critical section is open, or until the
    /// abandonment timeout elapses.
    pub fn wait_clear(&self) {
        let deadline = std::time::Instant::now() + ABANDONMENT_TIMEOUT;
        let mut holders = self.holders.lock().unwrap();
        while *holders > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self.cv.wait_timeout(holders, deadline - now).unwrap();
            holders = guard;
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn clear_gate_does_not_wait() {
        let gate = EnumerationGate::new();
        gate.wait_clear();
    }

    #[test]
    fn unblock_releases_waiter() {
        let gate = Arc::new(EnumerationGate::new());
        gate.block_enumeration();

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_clear())
        };
        std::thread::sleep(Duration::from_millis(50));
        gate.unblock_enumeration();
        waiter.join().unwrap();
    }

    #[test]
    fn nested_sections_all_released() {
        let gate = EnumerationGate::new();
        gate.block_enumeration();
        gate.block_enumeration();
        gate.unblock_enumeration();
        assert_eq!(*gate.holders.lock().unwrap(), 1);
        gate.unblock_enumeration();
        assert_eq!(*gate.holders.lock().unwrap(), 0);
    }

    #[test]
    fn unblock_without_block_is_harmless() {
        let gate = EnumerationGate::new();
        gate.unblock_enumeration();
        assert_eq!(*gate.holders.lock().unwrap(), 0);
    }
}
