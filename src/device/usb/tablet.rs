//! A fully emulated USB pointer device (absolute-coordinate tablet).
//!
//! This is the canonical static backend: control transfers answer from
//! canned descriptors, and the interrupt IN endpoint NAKs until input is
//! queued, which exercises the controller's deferred-retry path the same
//! way the original tablet emulation does.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::device::bus::BusDeviceRef;

use super::{Direction, UsbDeviceKind, UsbDeviceModel, UsbRequest, UsbSpeed, UsbStatus, Xfer};

/// Standard request codes the tablet answers.
const GET_STATUS: u8 = 0;
const SET_ADDRESS: u8 = 5;
const GET_DESCRIPTOR: u8 = 6;
const GET_CONFIGURATION: u8 = 8;
const SET_CONFIGURATION: u8 = 9;
/// HID class request.
const SET_IDLE: u8 = 0x0a;

/// Descriptor type in the high byte of wValue.
const DESC_DEVICE: u8 = 1;
const DESC_CONFIG: u8 = 2;
const DESC_STRING: u8 = 3;
const DESC_HID_REPORT: u8 = 0x22;

const DEVICE_DESCRIPTOR: [u8; 18] = [
    18,   // bLength
    1,    // bDescriptorType: DEVICE
    0x00, 0x02, // bcdUSB 2.0
    0,    // bDeviceClass (per interface)
    0,    // bDeviceSubClass
    0,    // bDeviceProtocol
    8,    // bMaxPacketSize0
    0x27, 0x06, // idVendor
    0x01, 0x00, // idProduct
    0x00, 0x01, // bcdDevice
    1,    // iManufacturer
    2,    // iProduct
    0,    // iSerialNumber
    1,    // bNumConfigurations
];

const CONFIG_DESCRIPTOR: [u8; 34] = [
    // configuration
    9, 2, 34, 0, 1, 1, 0, 0xa0, 50, //
    // interface: HID, boot-incapable pointer
    9, 4, 0, 0, 1, 3, 0, 0, 0, //
    // HID descriptor, one report descriptor of 52 bytes
    9, 0x21, 0x01, 0x01, 0, 1, 0x22, 52, 0, //
    // endpoint 1 IN, interrupt, 8 bytes, 10ms
    7, 5, 0x81, 3, 8, 0, 10,
];

/// Absolute pointer with three buttons and a wheel, 16-bit axes.
const HID_REPORT_DESCRIPTOR: [u8; 51] = [
    0x05, 0x01, // Usage Page (Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xa1, 0x01, // Collection (Application)
    0x09, 0x01, //   Usage (Pointer)
    0xa1, 0x00, //   Collection (Physical)
    0x05, 0x09, //     Usage Page (Button)
    0x19, 0x01, //     Usage Minimum (1)
    0x29, 0x03, //     Usage Maximum (3)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x95, 0x03, //     Report Count (3)
    0x75, 0x01, //     Report Size (1)
    0x81, 0x02, //     Input (Data, Variable, Absolute)
    0x95, 0x01, //     Report Count (1)
    0x75, 0x05, //     Report Size (5)
    0x81, 0x01, //     Input (Constant)
    0x05, 0x01, //     Usage Page (Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x15, 0x00, //     Logical Minimum (0)
    0x26, 0xff, 0x7f, // Logical Maximum (32767)
    0x75, 0x10, //     Report Size (16)
    0x95, 0x02, //     Report Count (2)
    0x81, 0x02, //     Input (Data, Variable, Absolute)
    0xc0, //   End Collection
    0xc0, // End Collection
];

/// One input report of the tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletReport {
    /// Button bitmask, bits 0..=2.
    pub buttons: u8,
    /// Absolute X, 0..=32767.
    pub x: u16,
    /// Absolute Y, 0..=32767.
    pub y: u16,
}

impl TabletReport {
    fn to_bytes(self) -> [u8; 5] {
        let x = self.x.to_le_bytes();
        let y = self.y.to_le_bytes();
        [self.buttons & 0x7, x[0], x[1], y[0], y[1]]
    }
}

/// Input-injection handle for a [`UsbTablet`].
///
/// Cloneable; the UI side queues reports here and the guest picks them up
/// on its next interrupt IN transfer.
#[derive(Debug, Clone, Default)]
pub struct UsbTabletHandle {
    pending: Arc<Mutex<VecDeque<TabletReport>>>,
}

impl UsbTabletHandle {
    /// Queue one input report.
    pub fn push(&self, report: TabletReport) {
        self.pending.lock().unwrap().push_back(report);
    }
}

/// The emulated tablet device.
#[derive(Debug)]
pub struct UsbTablet {
    pending: Arc<Mutex<VecDeque<TabletReport>>>,
    configuration: u8,
}

impl UsbTablet {
    /// Create a tablet and the handle used to feed it input.
    #[must_use]
    pub fn new() -> (Self, UsbTabletHandle) {
        let handle = UsbTabletHandle::default();
        (
            Self {
                pending: handle.pending.clone(),
                configuration: 0,
            },
            handle,
        )
    }

    /// Answer a GET_DESCRIPTOR request.
    fn descriptor(&self, value: u16) -> Option<Vec<u8>> {
        let desc_type = (value >> 8) as u8;
        let index = (value & 0xFF) as u8;

        match (desc_type, index) {
            (DESC_DEVICE, _) => Some(DEVICE_DESCRIPTOR.to_vec()),
            (DESC_CONFIG, _) => Some(CONFIG_DESCRIPTOR.to_vec()),
            (DESC_HID_REPORT, _) => Some(HID_REPORT_DESCRIPTOR.to_vec()),
            (DESC_STRING, 0) => Some(vec![4, 3, 0x09, 0x04]),
            (DESC_STRING, 1) => Some(string_descriptor("xhcid")),
            (DESC_STRING, 2) => Some(string_descriptor("USB Tablet")),
            _ => None,
        }
    }

}

fn string_descriptor(s: &str) -> Vec<u8> {
    let utf16: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let mut desc = vec![(2 + utf16.len()) as u8, DESC_STRING];
    desc.extend_from_slice(&utf16);
    desc
}

impl UsbDeviceModel for UsbTablet {
    fn kind(&self) -> UsbDeviceKind {
        UsbDeviceKind::Static
    }

    fn usb_version(&self) -> u16 {
        0x0200
    }

    fn speed(&self) -> UsbSpeed {
        UsbSpeed::Full
    }

    fn reset(&mut self) -> UsbStatus {
        self.configuration = 0;
        self.pending.lock().unwrap().clear();
        UsbStatus::Completed
    }

    fn request(&mut self, xfer: &mut Xfer, mem: &BusDeviceRef) -> UsbStatus {
        let Some(ureq) = xfer.ureq else {
            warn!("tablet control transfer without setup packet");
            return UsbStatus::Stalled;
        };

        debug!(
            "tablet request type {:#x} request {} value {:#x}",
            ureq.request_type, ureq.request, ureq.value
        );

        match (ureq.is_device_to_host(), ureq.request) {
            (true, GET_DESCRIPTOR) => match self.descriptor(ureq.value) {
                Some(desc) => {
                    let wanted = usize::from(ureq.length).min(desc.len());
                    xfer.complete_inline(mem, Some(&desc[..wanted]))
                }
                None => {
                    debug!("tablet stalls unknown descriptor {:#x}", ureq.value);
                    UsbStatus::Stalled
                }
            },
            (true, GET_STATUS) => xfer.complete_inline(mem, Some(&[0, 0])),
            (true, GET_CONFIGURATION) => {
                xfer.complete_inline(mem, Some(&[self.configuration]))
            }
            (false, SET_CONFIGURATION) => {
                self.configuration = ureq.value as u8;
                xfer.complete_inline(mem, None)
            }
            (false, SET_ADDRESS) | (false, SET_IDLE) => xfer.complete_inline(mem, None),
            _ => {
                debug!("tablet stalls unhandled request {}", ureq.request);
                UsbStatus::Stalled
            }
        }
    }

    fn data(
        &mut self,
        xfer: &mut Xfer,
        dir: Direction,
        epnum: u8,
        mem: &BusDeviceRef,
    ) -> UsbStatus {
        if dir != Direction::In || epnum != 1 {
            warn!("tablet data transfer on unexpected endpoint {epnum}");
            return UsbStatus::Stalled;
        }

        let report = match self.pending.lock().unwrap().pop_front() {
            Some(report) => report,
            None => {
                // Nothing to report; leave the blocks queued for the next
                // doorbell.
                let head = xfer.head();
                if !xfer.is_empty() {
                    xfer.block_mut(head).status = UsbStatus::Nak;
                }
                return UsbStatus::Nak;
            }
        };

        let bytes = report.to_bytes();
        xfer.complete_inline(mem, Some(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::bus::testutils::GuestRam;
    use crate::device::usb::{BlockState, XferBuf};
    use std::sync::Arc;

    fn control_in(xfer: &mut Xfer, request: u8, value: u16, length: u16, buf_addr: u64) {
        xfer.ureq = Some(UsbRequest {
            request_type: UsbRequest::DIR_DEVICE_TO_HOST,
            request,
            value,
            index: 0,
            length,
        });
        // Setup stage is already consumed by the engine.
        xfer.append(XferBuf::None, 0x10, true, 0)
            .unwrap()
            .processed = BlockState::Handled;
        // Data stage.
        xfer.append(
            XferBuf::Guest {
                addr: buf_addr,
                len: length.into(),
            },
            0x20,
            true,
            0,
        )
        .unwrap();
        // Status stage.
        xfer.append(XferBuf::None, 0x30, true, 0).unwrap();
    }

    #[test]
    fn device_descriptor_is_served() {
        let mem: BusDeviceRef = Arc::new(GuestRam::new(0x1000));
        let (mut tablet, _handle) = UsbTablet::new();

        let mut xfer = Xfer::new(1, 1);
        control_in(&mut xfer, GET_DESCRIPTOR, (DESC_DEVICE as u16) << 8, 18, 0x100);

        assert_eq!(tablet.request(&mut xfer, &mem), UsbStatus::Completed);

        let mut desc = [0u8; 18];
        mem.read_bulk(0x100, &mut desc);
        assert_eq!(desc, DEVICE_DESCRIPTOR);

        // All stages are ready for event emission.
        assert!(xfer
            .live_indices()
            .all(|i| xfer.block(i).processed == BlockState::Handled));
    }

    #[test]
    fn short_descriptor_reads_report_short_transfer() {
        let mem: BusDeviceRef = Arc::new(GuestRam::new(0x1000));
        let (mut tablet, _handle) = UsbTablet::new();

        let mut xfer = Xfer::new(1, 1);
        // Ask for more than the config descriptor holds.
        control_in(&mut xfer, GET_DESCRIPTOR, (DESC_CONFIG as u16) << 8, 255, 0x100);

        assert_eq!(tablet.request(&mut xfer, &mem), UsbStatus::ShortXfer);
    }

    #[test]
    fn interrupt_in_naks_until_input_arrives() {
        let mem: BusDeviceRef = Arc::new(GuestRam::new(0x1000));
        let (mut tablet, handle) = UsbTablet::new();

        let mut xfer = Xfer::new(1, 3);
        xfer.append(
            XferBuf::Guest {
                addr: 0x200,
                len: 8,
            },
            0x40,
            true,
            0,
        )
        .unwrap();

        assert_eq!(tablet.data(&mut xfer, Direction::In, 1, &mem), UsbStatus::Nak);
        assert_eq!(xfer.block(xfer.head()).status, UsbStatus::Nak);

        handle.push(TabletReport {
            buttons: 1,
            x: 100,
            y: 200,
        });

        assert_eq!(
            tablet.data(&mut xfer, Direction::In, 1, &mem),
            UsbStatus::ShortXfer,
            "5-byte report against an 8-byte buffer is a short transfer"
        );

        let mut report = [0u8; 5];
        mem.read_bulk(0x200, &mut report);
        assert_eq!(report, [1, 100, 0, 200, 0]);
    }
}
