//! # USB Device Backends
//!
//! This module defines the narrow interface between the xHCI controller
//! core and the USB devices it multiplexes: fully emulated devices and the
//! native pass-through backend. The controller only ever talks to a
//! [`UsbDeviceModel`]; completions of asynchronous backends come back
//! through the [`XferNotify`] callback surface.

pub mod passthrough;
pub mod tablet;
mod xfer;

pub use xfer::{BlockState, Xfer, XferBlock, XferBuf};

use std::fmt::{self, Debug, Display};
use std::sync::{Arc, Mutex};

use crate::device::bus::BusDeviceRef;
use crate::device::pci::constants::xhci::USB_MAX_TIERS;

/// The speed of a USB device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl UsbSpeed {
    /// The speed id as encoded in the PORTSC speed field.
    #[must_use]
    pub const fn portsc_id(self) -> u32 {
        match self {
            Self::Full => 1,
            Self::Low => 2,
            Self::High => 3,
            Self::Super => 4,
            Self::SuperPlus => 5,
        }
    }

    /// The USB release this speed first appeared in, as BCD.
    ///
    /// This decides which half of the root hub the device shows up in.
    #[must_use]
    pub const fn usb_version(self) -> u16 {
        match self {
            Self::Low | Self::Full | Self::High => 0x0200,
            Self::Super | Self::SuperPlus => 0x0300,
        }
    }
}

/// The result of a backend operation, in USB terms.
///
/// The transfer engine maps these onto xHCI completion codes when it emits
/// Transfer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbStatus {
    /// The transfer completed with all data moved.
    Completed,
    /// The device moved less data than requested.
    ShortXfer,
    /// The endpoint stalled.
    Stalled,
    /// The device did not answer in time.
    Timeout,
    /// The host-side transport failed.
    IoError,
    /// The data buffer did not fit the endpoint's constraints.
    BadBufferSize,
    /// The endpoint NAKed; the transfer stays queued at the device and
    /// completes later through [`XferNotify`].
    Nak,
    /// The transfer was taken down by a Stop-Endpoint request.
    Stopped,
    /// The backend has no handler for this transfer type.
    NotStarted,
}

/// The direction of a non-control transfer, as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Direction {
    In,
    Out,
}

/// A USB control request (setup packet).
///
/// For documentation of the fields, see Section 9.3 "USB Device Requests"
/// in the USB 2.0 specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UsbRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl UsbRequest {
    /// Device-to-host direction bit of `request_type`.
    pub const DIR_DEVICE_TO_HOST: u8 = 0x80;

    /// Unpack a setup packet from the 8 immediate bytes of a Setup Stage
    /// TRB.
    #[must_use]
    pub const fn from_le(raw: u64) -> Self {
        let bytes = raw.to_le_bytes();
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Whether the data stage of this request moves device-to-host.
    #[must_use]
    pub const fn is_device_to_host(&self) -> bool {
        self.request_type & Self::DIR_DEVICE_TO_HOST != 0
    }
}

/// The position of a physical device in the host's USB topology.
///
/// The tuple (bus, port chain) is stable across re-enumeration and is what
/// configuration whitelists and the S3 suspend cache key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePath {
    /// The native bus number.
    pub bus: u8,
    /// The number of valid entries in `path`.
    pub depth: u8,
    /// The port chain from the root hub to the device.
    pub path: [u8; USB_MAX_TIERS],
}

impl DevicePath {
    /// Create a path from a bus number and a port chain.
    #[must_use]
    pub fn new(bus: u8, ports: &[u8]) -> Self {
        assert!(!ports.is_empty() && ports.len() <= USB_MAX_TIERS);

        let mut path = [0; USB_MAX_TIERS];
        path[..ports.len()].copy_from_slice(ports);
        Self {
            bus,
            depth: ports.len() as u8,
            path,
        }
    }

    /// The root hub port this device hangs off.
    #[must_use]
    pub const fn root_port(&self) -> u8 {
        self.path[0]
    }

    /// The path of a child device behind port `port` of this device.
    ///
    /// Returns `None` when the hub chain would become too deep.
    #[must_use]
    pub fn child(&self, port: u8) -> Option<Self> {
        if usize::from(self.depth) >= USB_MAX_TIERS {
            return None;
        }

        let mut child = *self;
        child.path[usize::from(child.depth)] = port;
        child.depth += 1;
        Some(child)
    }
}

impl Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.path[0])?;
        for tier in &self.path[1..usize::from(self.depth)] {
            write!(f, ".{}", tier)?;
        }
        Ok(())
    }
}

/// What kind of thing arrived on the native side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    /// A regular device that can be passed through.
    Device,
    /// An external hub; its ports become candidate attachment points.
    ExternalHub {
        /// The number of downstream ports of the hub.
        maxchild: u8,
    },
}

/// Identity of a physical USB device as reported by the hot-plug monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeDeviceInfo {
    /// The stable topology position.
    pub path: DevicePath,
    /// The negotiated speed.
    pub speed: UsbSpeed,
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// The device's USB release as BCD; decides the root hub half.
    pub bcd: u16,
    /// Device or external hub.
    pub kind: NativeKind,
}

/// Whether a backend completes transfers inline or from its own threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbDeviceKind {
    /// Fully emulated in-process; `request`/`data` complete inline.
    Static,
    /// Bridges to a physical USB device; data transfers may complete
    /// asynchronously via [`XferNotify`].
    PortMapped,
}

/// Callback surface handed to asynchronous backends.
///
/// Backend worker threads use this to hand completed transfers back to the
/// controller and to ask for interrupts. Implementations take the
/// device-wide lock themselves; backends must not call this while the
/// controller is calling into them.
pub trait XferNotify: Debug + Send + Sync {
    /// A transfer on `(slot, epid)` has blocks ready for completion
    /// processing.
    fn notify(&self, slot: u8, epid: u8);

    /// Unconditionally raise the controller interrupter.
    fn interrupt(&self);
}

/// Everything an asynchronous backend needs to service one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    /// The slot the endpoint belongs to.
    pub slot: u8,
    /// The endpoint id (2..=31).
    pub epid: u8,
    /// The transfer state shared with the controller.
    pub xfer: Arc<Mutex<Xfer>>,
    /// Guest memory for data buffers.
    pub mem: BusDeviceRef,
    /// Completion callbacks into the controller.
    pub notify: Arc<dyn XferNotify>,
}

/// The interface each USB device backend implements towards the controller.
///
/// Construction of the backend is the `init` operation; dropping it is
/// `deinit`. The controller calls `request`/`data` with the device-wide
/// lock and the per-transfer lock held, so implementations must not block
/// on guest-visible state and asynchronous backends must queue and return.
pub trait UsbDeviceModel: Debug + Send {
    /// Whether this backend completes transfers inline.
    fn kind(&self) -> UsbDeviceKind;

    /// The USB release of the device as BCD (`0x0200`, `0x0300`, ...).
    fn usb_version(&self) -> u16;

    /// The speed the device operates at.
    fn speed(&self) -> UsbSpeed;

    /// Reset the device. Called for Address-Device and port resets.
    fn reset(&mut self) -> UsbStatus;

    /// Execute a control transfer. The setup packet is in `xfer.ureq`; the
    /// data stage block, if any, is on the transfer's block list.
    fn request(&mut self, xfer: &mut Xfer, mem: &BusDeviceRef) -> UsbStatus;

    /// Execute a non-control transfer on endpoint number `epnum`
    /// (1..=15), direction as seen from the host.
    fn data(&mut self, xfer: &mut Xfer, dir: Direction, epnum: u8, mem: &BusDeviceRef)
        -> UsbStatus;

    /// An endpoint was configured. Asynchronous backends set up their
    /// per-endpoint workers here; static devices usually ignore it.
    fn enable_endpoint(&mut self, _handle: EndpointHandle) {}

    /// Stop all outstanding activity. Called on deconfiguration.
    fn stop(&mut self) {}
}
