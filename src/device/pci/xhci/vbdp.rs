//! The suspended-device cache and its worker thread.
//!
//! A guest-initiated S3 cycle makes passed-through devices disappear on
//! the host side and reappear after resume. The cache records every
//! emulated binding at suspend time so the interim disconnect/reconnect
//! stays invisible to the guest; the worker re-announces the cached ports
//! once the guest has torn down the old slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::device::usb::DevicePath;

use super::XhciController;

/// The state of one suspended-device cache entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VbdpState {
    /// Unused entry.
    #[default]
    None,
    /// Recorded at suspend; arrival callbacks reuse the cached virtual
    /// port and suppress their connect event.
    Start,
    /// The guest disabled the slot; the worker may re-announce the port.
    End,
}

/// One suspended-device record: the physical path and the virtual port it
/// must reappear on.
#[derive(Debug, Default, Clone, Copy)]
pub struct VbdpEntry {
    /// The physical device path, `None` for unused entries.
    pub path: Option<DevicePath>,
    /// The virtual port the device occupied before suspend.
    pub vport: u8,
    /// Entry state.
    pub state: VbdpState,
}

/// A counting semaphore built from a mutex and a condition variable.
///
/// The vbdp worker parks on this; Disable-Slot posts it from MMIO context
/// without blocking.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    /// Increment the semaphore and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    /// Block until the semaphore is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }
}

/// Spawn the worker that re-announces suspended devices.
///
/// The worker owns no controller state; each wakeup it takes the device
/// lock, retires one `End` entry and, if the physical device has already
/// reappeared, raises the deferred port-status-change event.
pub(super) fn spawn_worker(
    controller: Arc<Mutex<XhciController>>,
    sem: Arc<Semaphore>,
    polling: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("xhci-vbdp".into())
        .spawn(move || {
            while polling.load(Ordering::SeqCst) {
                sem.wait();
                if !polling.load(Ordering::SeqCst) {
                    break;
                }

                controller.lock().unwrap().vbdp_service();
            }
            debug!("vbdp worker exits");
        })
        .expect("failed to spawn vbdp worker")
}
