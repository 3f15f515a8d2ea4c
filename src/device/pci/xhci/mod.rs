//! Emulation of a USB3 Host (xHCI) controller.
//!
//! The controller multiplexes fully emulated USB devices and passed-through
//! physical devices onto one virtual root hub. This module owns the
//! register file and its dispatch; the submodules implement the moving
//! parts:
//!
//! - [`trb`]: the 16-byte Transfer Request Block and the completion codes,
//! - [`rings`]: event ring producer, command ring consumer, ring cursors,
//! - [`context`]: wrappers over the guest-resident context structures,
//! - `commands`: the command handlers,
//! - `transfer`: the doorbell-driven transfer engine,
//! - `ports`: the root hub and the virtual-port binding table,
//! - `vbdp`: the suspended-device cache and its worker thread,
//! - [`extcaps`]: the extended-capability window.
//!
//! The specification is available
//! [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf).

mod commands;
pub mod context;
pub mod extcaps;
mod ports;
pub mod rings;
mod transfer;
pub mod trb;
mod vbdp;

pub use extcaps::{DrdRole, ExcapProfile, ExtendedCaps, FileRoleSwitch, RoleSwitchSink};
pub use ports::{NativePort, PortRegs, VportState};
pub use vbdp::{Semaphore, VbdpEntry, VbdpState};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, warn};

use crate::device::bus::{BusDeviceRef, Request, RequestSize};
use crate::device::interrupt_line::{DummyInterruptLine, InterruptLine};
use crate::device::pci::config_space::{BarInfo, ConfigSpace, ConfigSpaceBuilder};
use crate::device::pci::constants::config_space::{
    class, device, progif, subclass, usb_revision, vendor,
};
use crate::device::pci::constants::xhci::{
    capability, doorbell, offset, operational::usbcmd, operational::usbsts,
    operational::PAGESIZE_4K, runtime, CAPLEN, DBOFF, EXCAPOFF, MAX_DEVS, MAX_SLOTS,
    NATIVE_PORTS_MAX, PORTREGS_SETSZ, PORTREGS_START, RTSOFF,
};
use crate::device::pci::traits::PciDevice;
use crate::device::usb::{
    EndpointHandle, NativeDeviceInfo, UsbDeviceKind, UsbDeviceModel, Xfer, XferNotify,
};

use context::{Dcbaa, StreamContext};
use rings::{CommandRing, EventInsert, EventRing, TrbRing};
use trb::{CompletionCode, Trb};

/// Instantiates a pass-through backend for a physical device the guest
/// addresses.
pub type BackendFactory =
    Box<dyn Fn(&NativeDeviceInfo) -> anyhow::Result<Box<dyn UsbDeviceModel>> + Send>;

/// The per-endpoint transfer ring state: a single ring, or the stream
/// context array with one ring per primary stream.
#[derive(Debug)]
pub(crate) enum EndpointRing {
    /// A plain transfer ring.
    Single(TrbRing),
    /// Primary streams: guest stream context array plus a cursor per
    /// stream.
    Streams {
        /// Guest address of the stream context array.
        sctx_base: u64,
        /// One ring cursor per stream id.
        rings: Vec<TrbRing>,
    },
}

/// One set-up endpoint of a slot.
#[derive(Debug)]
pub(crate) struct Endpoint {
    /// Ring state.
    ring: EndpointRing,
    /// The transfer shared with the backend; at most one in flight.
    xfer: Arc<Mutex<Xfer>>,
}

/// A slot with a bound device instance.
#[derive(Debug)]
pub(crate) struct DeviceSlot {
    /// The device backend bound to this slot.
    dev: Box<dyn UsbDeviceModel>,
    /// The virtual root hub port the device sits on.
    vport: u8,
    /// The physical identity for pass-through devices.
    native_info: Option<NativeDeviceInfo>,
    /// Endpoint records, indexed by endpoint id.
    eps: [Option<Endpoint>; 32],
}

impl DeviceSlot {
    fn new(dev: Box<dyn UsbDeviceModel>, vport: u8, native_info: Option<NativeDeviceInfo>) -> Self {
        Self {
            dev,
            vport,
            native_info,
            eps: std::array::from_fn(|_| None),
        }
    }
}

/// Completion surface handed to asynchronous device backends.
///
/// Worker threads report through this; it takes the device-wide lock and
/// drives the completion routine and the interrupter.
#[derive(Debug, Clone)]
struct NotifySurface {
    controller: Weak<Mutex<XhciController>>,
    slot: u8,
}

impl XferNotify for NotifySurface {
    fn notify(&self, slot: u8, epid: u8) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        let mut xdev = controller.lock().unwrap();
        if xdev.notify_transfer(slot, epid) {
            xdev.assert_interrupt();
        }
    }

    fn interrupt(&self) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        let mut xdev = controller.lock().unwrap();
        xdev.device_interrupt(self.slot);
    }
}

/// The state machine of the virtual xHCI controller.
///
/// All of the controller lives behind one device-wide mutex (see
/// [`XhciDevice`]); methods here expect to be called with that lock held.
pub struct XhciController {
    /// Guest memory for all DMA.
    pub(crate) dma_bus: BusDeviceRef,
    config_space: ConfigSpace,
    interrupt_line: Arc<dyn InterruptLine>,
    /// Back-reference for completion surfaces handed to backends.
    self_ref: Weak<Mutex<XhciController>>,

    // Operational registers.
    usbcmd: u32,
    usbsts: u32,
    dnctrl: u32,
    dcbaap: u64,
    config: u32,
    pub(crate) command_ring: CommandRing,

    // Interrupter register set 0.
    iman: u32,
    imod: u32,
    erstsz: u32,
    pub(crate) erstba: u64,
    erdp: u64,
    mfindex: u64,
    mf_prev: Instant,

    pub(crate) event_ring: EventRing,

    // Root hub, indexed 1..=MAX_DEVS.
    pub(crate) ports: Vec<PortRegs>,
    /// Emulated devices parked at their port until the guest addresses
    /// them.
    pub(crate) port_devices: Vec<Option<Box<dyn UsbDeviceModel>>>,
    pub(crate) usb2_port_start: u8,
    pub(crate) usb3_port_start: u8,

    // Slots, indexed 1..=MAX_SLOTS.
    pub(crate) slot_allocated: [bool; MAX_SLOTS as usize + 1],
    pub(crate) slots: Vec<Option<DeviceSlot>>,

    // Physical-port bindings and the suspended-device cache.
    pub(crate) native_ports: [NativePort; NATIVE_PORTS_MAX],
    pub(crate) vbdp_devs: [VbdpEntry; NATIVE_PORTS_MAX],
    pub(crate) vbdp_dev_num: u32,
    pub(crate) vbdp_sem: Arc<Semaphore>,

    pub(crate) excaps: ExtendedCaps,
    backend_factory: BackendFactory,
}

impl fmt::Debug for XhciController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XhciController")
            .field("usbcmd", &self.usbcmd)
            .field("usbsts", &self.usbsts)
            .field("slots", &self.slot_allocated.iter().filter(|&&a| a).count())
            .finish_non_exhaustive()
    }
}

impl XhciController {
    /// Create a controller with no devices attached.
    ///
    /// `dma_bus` is the device on which we will perform DMA operations;
    /// this is typically VM guest memory. `excaps` selects the
    /// extended-capability profile (which also decides the PCI identity)
    /// and `backend_factory` instantiates pass-through backends when the
    /// guest addresses a physical device.
    #[must_use]
    pub fn new(dma_bus: BusDeviceRef, excaps: ExtendedCaps, backend_factory: BackendFactory) -> Self {
        let (vid, pid) = match excaps.profile() {
            ExcapProfile::Drd => (vendor::INTEL, device::INTEL_APL_XHCI),
            ExcapProfile::Default => (vendor::REDHAT, device::REDHAT_XHCI),
        };

        let bar_size = (excaps.regsend() as u32).next_power_of_two();

        let mut controller = Self {
            dma_bus,
            config_space: ConfigSpaceBuilder::new(vid, pid)
                .class(class::SERIAL, subclass::SERIAL_USB, progif::USB_XHCI)
                .usb_release(usb_revision::USB_3_0)
                .mem32_nonprefetchable_bar(0, bar_size)
                .msi_capability()
                .config_space(),
            interrupt_line: Arc::new(DummyInterruptLine::default()),
            self_ref: Weak::new(),
            usbcmd: 0,
            usbsts: usbsts::HCH,
            dnctrl: 0,
            dcbaap: 0,
            config: 0,
            command_ring: CommandRing::default(),
            iman: 0,
            imod: runtime::IMOD_DEFAULT,
            erstsz: 0,
            erstba: 0,
            erdp: 0,
            mfindex: 0,
            mf_prev: Instant::now(),
            event_ring: EventRing::default(),
            ports: vec![PortRegs::default(); MAX_DEVS as usize + 1],
            port_devices: (0..=MAX_DEVS as usize).map(|_| None).collect(),
            usb2_port_start: (MAX_DEVS / 2) as u8 + 1,
            usb3_port_start: 1,
            slot_allocated: [false; MAX_SLOTS as usize + 1],
            slots: (0..=MAX_SLOTS as usize).map(|_| None).collect(),
            native_ports: [NativePort::default(); NATIVE_PORTS_MAX],
            vbdp_devs: [VbdpEntry::default(); NATIVE_PORTS_MAX],
            vbdp_dev_num: 0,
            vbdp_sem: Arc::new(Semaphore::default()),
            excaps,
            backend_factory,
        };

        for port in 1..=MAX_DEVS as u8 {
            controller.init_port(port);
        }
        controller.reset();

        controller
    }

    /// Configure the interrupt line used to signal events to the guest.
    pub fn connect_irq(&mut self, irq: Arc<dyn InterruptLine>) {
        self.interrupt_line = irq;
    }

    /// Whether a slot id is in range and currently enabled.
    pub(crate) fn slot_valid(&self, slot: u8) -> bool {
        (1..=MAX_SLOTS as u8).contains(&slot) && self.slot_allocated[usize::from(slot)]
    }

    /// The device context base address array, once the guest installed
    /// it.
    pub(crate) fn dcbaa(&self) -> Option<Dcbaa> {
        (self.dcbaap != 0).then(|| Dcbaa::new(self.dcbaap, self.dma_bus.clone()))
    }

    /// Reset the controller: every slot disabled, rings rewound, producer
    /// cycle back to one.
    pub fn reset(&mut self) {
        debug!("controller reset");

        self.event_ring.reset();
        self.command_ring.reset();
        self.mfindex = 0;

        for slot in 1..=MAX_SLOTS as u8 {
            self.reset_slot(slot);
        }
    }

    /// The number of microframes that passed since the controller was
    /// reset, as accumulated by MFINDEX reads.
    #[must_use]
    pub fn microframes(&self) -> u64 {
        self.mfindex
    }

    /// Release a slot during controller reset.
    ///
    /// Emulated devices return to their port; pass-through bindings fall
    /// back to connected so the guest can re-address them.
    fn reset_slot(&mut self, slot: u8) {
        self.slot_allocated[usize::from(slot)] = false;
        let Some(entry) = self.slots[usize::from(slot)].take() else {
            return;
        };

        if entry.dev.kind() == UsbDeviceKind::Static {
            self.port_devices[usize::from(entry.vport)] = Some(entry.dev);
        } else if let Some(di) = entry.native_info {
            if let Some(index) = self.native_index_by_path(&di.path) {
                self.native_ports[index].state = VportState::Connected;
            }
        }
    }

    /// Append an event to the event ring and optionally raise the
    /// interrupter.
    ///
    /// An overrun forces the interrupt regardless of `do_intr`; the
    /// caller's event is lost in that case.
    pub(crate) fn insert_event(&mut self, evtrb: &Trb, do_intr: bool) -> CompletionCode {
        let mem = self.dma_bus.clone();

        let (code, intr) = if self.erstba == 0 {
            warn!("dropping event; the guest has not set up an event ring");
            (CompletionCode::EventRingFullError, do_intr)
        } else {
            match self.event_ring.insert(&mem, self.erstba, evtrb) {
                EventInsert::Inserted => (CompletionCode::Success, do_intr),
                EventInsert::Overflowed => (CompletionCode::EventRingFullError, true),
                EventInsert::Full => (CompletionCode::EventRingFullError, do_intr),
            }
        };

        if intr {
            self.assert_interrupt();
        }

        code
    }

    /// Latch the interrupt status bits and fire the interrupt hook if the
    /// guest enabled interrupts.
    pub(crate) fn assert_interrupt(&mut self) {
        self.erdp |= runtime::erdp::EHB;
        self.iman |= runtime::iman::IP;
        self.usbsts |= usbsts::EINT;

        if self.usbcmd & usbcmd::INTE != 0 && self.iman & runtime::iman::IE != 0 {
            self.interrupt_line.interrupt();
        }
    }

    /// Remote wakeup: a backend raised an interrupt for a device whose
    /// port may be suspended.
    pub(crate) fn device_interrupt(&mut self, slot: u8) {
        use crate::device::pci::constants::xhci::operational::portsc;

        if let Some(entry) = self.slots.get(usize::from(slot)).and_then(Option::as_ref) {
            let port = entry.vport;
            let regs = &mut self.ports[usize::from(port)];
            let pls = (regs.portsc & portsc::PLS_MASK) >> portsc::PLS_SHIFT;

            if pls == portsc::pls::U3 {
                regs.portsc &= !portsc::PLS_MASK;
                regs.portsc |= portsc::pls::RESUME << portsc::PLS_SHIFT;

                if regs.portsc & portsc::PLC == 0 {
                    regs.portsc |= portsc::PLC;
                    self.insert_event(&Trb::port_status_change_event(port), false);
                }
            }
        }

        self.assert_interrupt();
    }

    /// Set up an endpoint record from its (already installed) context.
    pub(crate) fn init_ep(&mut self, slot: u8, epid: u8) -> Result<(), ()> {
        let mem = self.dma_bus.clone();
        let dev_ctx = self.device_context(slot).ok_or(())?;
        let ep_ctx = dev_ctx.endpoint(epid);

        let pstreams = ep_ctx.max_pstreams();
        let ring = if pstreams > 0 {
            debug!("init endpoint {epid} with {pstreams} primary streams");
            let (sctx_base, _) = ep_ctx.dequeue_pointer();
            let rings = (0..=pstreams as u16)
                .map(|sid| {
                    let (ringaddr, ccs) =
                        StreamContext::new(sctx_base, sid, mem.clone()).dequeue_pointer();
                    TrbRing::new(ringaddr, ccs)
                })
                .collect();
            EndpointRing::Streams { sctx_base, rings }
        } else {
            let (ringaddr, ccs) = ep_ctx.dequeue_pointer();
            debug!("init endpoint {epid}, ring {ringaddr:#x} ccs {}", ccs as u8);
            EndpointRing::Single(TrbRing::new(ringaddr, ccs))
        };

        let self_ref = self.self_ref.clone();
        let entry = self.slots[usize::from(slot)].as_mut().ok_or(())?;

        let xfer = entry.eps[usize::from(epid)]
            .as_ref()
            .map(|ep| ep.xfer.clone())
            .unwrap_or_else(|| Arc::new(Mutex::new(Xfer::new(slot, epid))));

        entry.eps[usize::from(epid)] = Some(Endpoint {
            ring,
            xfer: xfer.clone(),
        });

        // Asynchronous backends service non-control endpoints from their
        // own threads and need the completion surface.
        if epid >= 2 && entry.dev.kind() == UsbDeviceKind::PortMapped {
            entry.dev.enable_endpoint(EndpointHandle {
                slot,
                epid,
                xfer,
                mem,
                notify: Arc::new(NotifySurface {
                    controller: self_ref,
                    slot,
                }),
            });
        }

        Ok(())
    }

    /// Tear down an endpoint record and mark the context disabled.
    /// Disabling is idempotent.
    pub(crate) fn disable_ep(&mut self, slot: u8, epid: u8) {
        use crate::device::pci::constants::xhci::context::ep_state;

        if let Some(dev_ctx) = self.device_context(slot) {
            dev_ctx.endpoint(epid).set_state(ep_state::DISABLED);
        }

        if let Some(entry) = self.slots[usize::from(slot)].as_mut() {
            entry.eps[usize::from(epid)] = None;
        }
    }

    /// The single-ring cursor of an endpoint, if it has one.
    pub(crate) fn endpoint_ring(&self, slot: u8, epid: u8) -> Option<TrbRing> {
        match &self.slots[usize::from(slot)].as_ref()?.eps[usize::from(epid)]
            .as_ref()?
            .ring
        {
            EndpointRing::Single(ring) => Some(*ring),
            EndpointRing::Streams { .. } => None,
        }
    }

    /// One pass of the suspended-device worker: retire an `End` entry and
    /// re-announce its port if the device is back.
    ///
    /// Returns whether an entry was retired.
    pub(crate) fn vbdp_service(&mut self) -> bool {
        let Some(idx) = self
            .vbdp_devs
            .iter()
            .position(|entry| entry.state == VbdpState::End)
        else {
            return false;
        };

        self.vbdp_devs[idx].state = VbdpState::None;
        let Some(path) = self.vbdp_devs[idx].path.take() else {
            return true;
        };

        let Some(native_idx) = self.native_index_by_path(&path) else {
            debug!("suspended device {path} has not reappeared yet");
            return true;
        };

        let entry = &self.native_ports[native_idx];
        if entry.state != VportState::Connected {
            return true;
        }

        let vport = entry.vport;
        let speed = entry.info.expect("connected entries carry info").speed;
        debug!("re-announcing {path} on virtual port {vport}");
        self.connect_port(vport, speed, true);
        true
    }

    /// USBCMD write: run/stop, controller reset and the S3 save hook.
    fn usbcmd_write(&mut self, value: u32) {
        let value = value & usbcmd::WRITABLE_BITS;

        if value & usbcmd::RS != 0 {
            self.usbsts &= !usbsts::HCH;
            self.usbsts |= usbsts::PCD;
        } else {
            self.usbsts |= usbsts::HCH;
            self.usbsts &= !usbsts::PCD;
        }

        let mut cmd = value;

        if cmd & usbcmd::HCRST != 0 {
            self.reset();
            cmd &= !usbcmd::HCRST;
        }

        if cmd & usbcmd::CSS != 0 {
            self.save_state_for_suspend();
        }

        // Save/restore state are self-clearing request bits.
        cmd &= !(usbcmd::CSS | usbcmd::CRS);
        self.usbcmd = cmd;
    }

    /// The guest saves controller state for S3: record every emulated
    /// pass-through binding so the suspend-side disconnect stays
    /// invisible.
    fn save_state_for_suspend(&mut self) {
        // Stale entries of a failed suspend would confuse the resume
        // path.
        self.vbdp_dev_num = 0;
        self.vbdp_devs = [VbdpEntry::default(); NATIVE_PORTS_MAX];

        for i in 0..NATIVE_PORTS_MAX {
            if self.native_ports[i].state != VportState::Emulated {
                continue;
            }

            let info = self.native_ports[i].info.expect("bound entries carry info");
            let vport = self.native_ports[i].vport;

            let slot = self.vbdp_dev_num as usize;
            self.vbdp_devs[slot] = VbdpEntry {
                path: Some(info.path),
                vport,
                state: VbdpState::Start,
            };
            self.vbdp_dev_num += 1;

            self.init_port(vport);
            self.native_ports[i].vport = 0;
            self.native_ports[i].state = VportState::Assigned;

            debug!("s3: saved state of {} on port {vport}", info.path);
        }
    }

    /// Synthesize MFINDEX from wall-clock time.
    ///
    /// Returns the number of 125us microframes since the previous read,
    /// modulo the counter width, and accumulates them into the internal
    /// counter.
    fn mfindex_read(&mut self) -> u32 {
        let now = Instant::now();
        let elapsed_us = now.duration_since(self.mf_prev).as_micros() as u64;
        self.mf_prev = now;

        let ticks = elapsed_us / runtime::MICROFRAME_US;
        self.mfindex = self.mfindex.wrapping_add(ticks);

        mfindex_value(ticks)
    }

    /// Doorbell writes: doorbell 0 kicks the command processor, the rest
    /// target a slot's endpoint.
    fn doorbell_write(&mut self, index: u64, value: u32) {
        if self.usbsts & usbsts::HCH != 0 {
            warn!("doorbell write while the controller is halted");
            return;
        }

        if index == 0 {
            self.complete_commands();
            return;
        }

        if index > MAX_SLOTS {
            warn!("doorbell write for invalid slot {index}");
            return;
        }

        let epid = (value & doorbell::TARGET_MASK) as u8;
        let streamid = (value >> doorbell::STREAM_SHIFT) as u16;
        self.device_doorbell(index as u8, epid, streamid);
    }

    fn runtime_write(&mut self, rel: u64, value: u32) {
        use crate::device::pci::constants::xhci::runtime::{erdp, iman};

        if rel == offset::MFINDEX {
            warn!("attempted write to MFINDEX");
            return;
        }
        if rel < offset::IR0 {
            warn!("write to reserved runtime offset {rel:#x}");
            return;
        }

        let mem = self.dma_bus.clone();

        match rel - offset::IR0 {
            offset::IMAN => {
                if value & iman::IP != 0 {
                    self.iman &= !iman::IP;
                }
                self.iman = (value & iman::IE) | (self.iman & iman::IP);
            }
            offset::IMOD => self.imod = value,
            offset::ERSTSZ => self.erstsz = value & 0xFFFF,
            offset::ERSTBA_LO => {
                self.erstba = (self.erstba & !0xFFFF_FFFFu64) | u64::from(value & !0x3F);
            }
            offset::ERSTBA_HI => {
                self.erstba = (self.erstba & 0xFFFF_FFFF) | (u64::from(value) << 32);
                debug!("event ring segment table at {:#x}", self.erstba);
            }
            offset::ERDP_LO => {
                let keep_hi = self.erdp & !0xFFFF_FFFFu64;
                let busy = self.erdp & erdp::EHB;
                self.erdp = keep_hi | busy | u64::from(value & !0xF);
                if u64::from(value) & erdp::EHB != 0 {
                    self.erdp &= !erdp::EHB;
                    self.iman &= !runtime::iman::IP;
                }
                if self.erstba != 0 {
                    self.event_ring.update_dequeue(&mem, self.erstba, self.erdp);
                }
            }
            offset::ERDP_HI => {
                self.erdp = (self.erdp & 0xFFFF_FFFF) | (u64::from(value) << 32);
                if self.erstba != 0 {
                    self.event_ring.update_dequeue(&mem, self.erstba, self.erdp);
                }
            }
            other => warn!("write to unimplemented runtime offset {other:#x}"),
        }
    }

    fn runtime_read(&mut self, rel: u64) -> u32 {
        if rel == offset::MFINDEX {
            return self.mfindex_read();
        }
        if rel < offset::IR0 {
            return 0;
        }

        match rel - offset::IR0 {
            offset::IMAN => self.iman,
            offset::IMOD => self.imod,
            offset::ERSTSZ => self.erstsz,
            offset::ERSTBA_LO => self.erstba as u32,
            offset::ERSTBA_HI => (self.erstba >> 32) as u32,
            offset::ERDP_LO => self.erdp as u32,
            offset::ERDP_HI => (self.erdp >> 32) as u32,
            _ => 0,
        }
    }

    fn operational_write(&mut self, rel: u64, value: u32) {
        match rel {
            offset::USBCMD => self.usbcmd_write(value),
            offset::USBSTS => self.usbsts &= !(value & usbsts::W1C_BITS),
            offset::PAGESIZE => debug!("ignoring write to read-only PAGESIZE"),
            offset::DNCTRL => self.dnctrl = value & 0xFFFF,
            offset::CRCR_LO => self.command_ring.control_lo(value.into()),
            offset::CRCR_HI => self.command_ring.control_hi(value.into()),
            offset::DCBAAP_LO => {
                self.dcbaap = (self.dcbaap & !0xFFFF_FFFFu64) | u64::from(value & 0xFFFF_FFC0);
            }
            offset::DCBAAP_HI => {
                self.dcbaap = (self.dcbaap & 0xFFFF_FFFF) | (u64::from(value) << 32);
                debug!("device context base array at {:#x}", self.dcbaap);
            }
            offset::CONFIG => self.config = value & 0x3FF,
            rel if rel >= PORTREGS_START => {
                let port = ((rel - PORTREGS_START) / PORTREGS_SETSZ) as u8 + 1;
                let reg = (rel - PORTREGS_START) % PORTREGS_SETSZ;
                self.portregs_write(port, reg, value);
            }
            other => warn!("write to unimplemented operational offset {other:#x}"),
        }
    }

    fn operational_read(&mut self, rel: u64) -> u32 {
        match rel {
            offset::USBCMD => self.usbcmd,
            offset::USBSTS => self.usbsts,
            offset::PAGESIZE => PAGESIZE_4K,
            offset::DNCTRL => self.dnctrl,
            offset::CRCR_LO => self.command_ring.status() as u32,
            offset::CRCR_HI => 0,
            offset::DCBAAP_LO => self.dcbaap as u32,
            offset::DCBAAP_HI => (self.dcbaap >> 32) as u32,
            offset::CONFIG => self.config,
            rel if rel >= PORTREGS_START => {
                let port = ((rel - PORTREGS_START) / PORTREGS_SETSZ) + 1;
                if port > MAX_DEVS {
                    warn!("read of out-of-range port {port}");
                    return 0;
                }
                let reg = (rel - PORTREGS_START) % PORTREGS_SETSZ;
                self.ports[port as usize].read(reg)
            }
            _ => 0,
        }
    }

    /// Read the register dword containing `offset`.
    fn mmio_read_dword(&mut self, offset: u64) -> u32 {
        let value = if offset < CAPLEN {
            match offset {
                offset::CAPLENGTH => capability::CAPLENGTH,
                offset::HCSPARAMS1 => capability::HCSPARAMS1,
                offset::HCSPARAMS2 => capability::HCSPARAMS2,
                offset::HCSPARAMS3 => capability::HCSPARAMS3,
                offset::HCCPARAMS1 => capability::HCCPARAMS1,
                offset::DBOFF => DBOFF as u32,
                offset::RTSOFF => RTSOFF as u32,
                offset::HCCPARAMS2 => capability::HCCPARAMS2,
                _ => 0,
            }
        } else if offset < DBOFF {
            self.operational_read(offset - CAPLEN)
        } else if offset < RTSOFF {
            // Doorbell reads always return zero.
            0
        } else if offset < EXCAPOFF {
            self.runtime_read(offset - RTSOFF)
        } else if offset < self.excaps.regsend() {
            self.excaps.read(offset)
        } else {
            debug!("read of invalid register offset {offset:#x}");
            0
        };

        value
    }

    /// Write the register dword containing `offset`.
    fn mmio_write_dword(&mut self, offset: u64, value: u32) {
        if offset < CAPLEN {
            warn!("write to read-only capability registers at {offset:#x}");
        } else if offset < DBOFF {
            self.operational_write(offset - CAPLEN, value);
        } else if offset < RTSOFF {
            self.doorbell_write((offset - DBOFF) / 4, value);
        } else if offset < EXCAPOFF {
            self.runtime_write(offset - RTSOFF, value);
        } else if offset < self.excaps.regsend() {
            self.excaps.write(offset, value);
        } else {
            warn!("write to invalid register offset {offset:#x}");
        }
    }

    /// MMIO read entry point of the register file.
    pub fn mmio_read(&mut self, req: Request) -> u64 {
        let aligned = req.addr & !0x3;
        match req.size {
            RequestSize::Size8 => {
                u64::from(self.mmio_read_dword(aligned))
                    | (u64::from(self.mmio_read_dword(aligned + 4)) << 32)
            }
            RequestSize::Size4 => self.mmio_read_dword(aligned).into(),
            _ => {
                let shift = (req.addr & 0x3) * 8;
                let mask = (1u64 << (u64::from(req.size) * 8)) - 1;
                (u64::from(self.mmio_read_dword(aligned)) >> shift) & mask
            }
        }
    }

    /// MMIO write entry point of the register file.
    pub fn mmio_write(&mut self, req: Request, value: u64) {
        let aligned = req.addr & !0x3;
        match req.size {
            RequestSize::Size8 => {
                self.mmio_write_dword(aligned, value as u32);
                self.mmio_write_dword(aligned + 4, (value >> 32) as u32);
            }
            RequestSize::Size4 => self.mmio_write_dword(aligned, value as u32),
            _ => {
                // Sub-dword writes merge with the current register
                // content.
                let shift = (req.addr & 0x3) * 8;
                let mask = ((1u64 << (u64::from(req.size) * 8)) - 1) << shift;
                let current = u64::from(self.mmio_read_dword(aligned));
                let merged = (current & !mask) | ((value << shift) & mask);
                self.mmio_write_dword(aligned, merged as u32);
            }
        }
    }
}

/// MFINDEX value for a number of elapsed microframes.
const fn mfindex_value(ticks: u64) -> u32 {
    (ticks % (1 << runtime::MFINDEX_BITS)) as u32
}

/// The hosting-facing wrapper: the device-wide mutex around the
/// controller plus the suspended-device worker thread.
///
/// MMIO, the hot-plug callbacks and backend completions all serialize on
/// the one mutex; the worker only ever takes it between semaphore waits.
#[derive(Debug)]
pub struct XhciDevice {
    controller: Arc<Mutex<XhciController>>,
    vbdp_polling: Arc<AtomicBool>,
    vbdp_sem: Arc<Semaphore>,
    worker: Option<JoinHandle<()>>,
}

impl XhciDevice {
    /// Create the controller and start its worker thread.
    #[must_use]
    pub fn new(dma_bus: BusDeviceRef, excaps: ExtendedCaps, backend_factory: BackendFactory) -> Self {
        let controller = Arc::new_cyclic(|weak| {
            let mut controller = XhciController::new(dma_bus, excaps, backend_factory);
            controller.self_ref = weak.clone();
            Mutex::new(controller)
        });

        let vbdp_sem = controller.lock().unwrap().vbdp_sem.clone();
        let vbdp_polling = Arc::new(AtomicBool::new(true));
        let worker = vbdp::spawn_worker(controller.clone(), vbdp_sem.clone(), vbdp_polling.clone());

        Self {
            controller,
            vbdp_polling,
            vbdp_sem,
            worker: Some(worker),
        }
    }

    /// Access the controller under the device-wide lock.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, XhciController> {
        self.controller.lock().unwrap()
    }

    /// Configure the interrupt line for the controller.
    pub fn connect_irq(&self, irq: Arc<dyn InterruptLine>) {
        self.lock().connect_irq(irq);
    }

    /// Attach a fully emulated device; see
    /// [`XhciController::attach_device`].
    pub fn attach_device(&self, dev: Box<dyn UsbDeviceModel>) -> anyhow::Result<u8> {
        self.lock().attach_device(dev)
    }

    /// Whitelist a physical device path for pass-through.
    pub fn assign_native_port(&self, info: NativeDeviceInfo) -> bool {
        self.lock().assign_native_port(info)
    }

    /// Hot-plug arrival callback.
    pub fn on_connect(&self, di: &NativeDeviceInfo) {
        self.lock().on_connect(di);
    }

    /// Hot-plug removal callback.
    pub fn on_disconnect(&self, di: &NativeDeviceInfo) {
        self.lock().on_disconnect(di);
    }

    /// Unconditionally raise the interrupter on behalf of a device.
    pub fn on_interrupt(&self) {
        self.lock().assert_interrupt();
    }

    /// Reset the controller on behalf of the hosting transport.
    pub fn reset(&self) {
        self.lock().reset();
    }
}

impl Drop for XhciDevice {
    fn drop(&mut self) {
        // Stop the worker before tearing down slots: it must never
        // observe a half-destroyed controller.
        self.vbdp_polling.store(false, Ordering::SeqCst);
        self.vbdp_sem.post();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl PciDevice for XhciDevice {
    fn write_cfg(&self, req: Request, value: u64) {
        use crate::device::bus::SingleThreadedBusDevice;

        self.lock().config_space.write(req, value);
    }

    fn read_cfg(&self, req: Request) -> u64 {
        self.lock().config_space.read(req)
    }

    fn write_io(&self, region: u32, req: Request, value: u64) {
        // The xHCI controller has a single MMIO BAR.
        assert_eq!(region, 0);

        self.lock().mmio_write(req, value);
    }

    fn read_io(&self, region: u32, req: Request) -> u64 {
        assert_eq!(region, 0);

        self.lock().mmio_read(req)
    }

    fn bar(&self, bar_no: u8) -> Option<BarInfo> {
        self.lock().config_space.bar(bar_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::bus::testutils::GuestRam;
    use crate::device::interrupt_line::testutils::CountingInterruptLine;
    use crate::device::pci::constants::xhci::operational::portsc;
    use crate::device::pci::constants::xhci::rings::{trb_control, trb_types};
    use crate::device::usb::tablet::UsbTablet;
    use crate::device::usb::{BlockState, DevicePath, Direction, NativeKind, UsbSpeed, UsbStatus};

    // Guest memory layout of the test rig.
    const ERST: u64 = 0x1000;
    const EVENT_SEG: u64 = 0x2000;
    const EVENT_SEG_SIZE: u32 = 32;
    const CMD_RING: u64 = 0x3000;
    const DCBAA_ADDR: u64 = 0x4000;
    const DEV_CTX: u64 = 0x5000;
    const INPUT_CTX: u64 = 0x6000;
    const EP0_RING: u64 = 0x7000;
    const EP_RING: u64 = 0x8000;
    const DATA_BUF: u64 = 0x9000;

    /// A static backend with scripted data-phase behavior.
    #[derive(Debug)]
    struct FakeDevice {
        version: u16,
        speed: UsbSpeed,
        data_status: UsbStatus,
        bdone: u32,
    }

    impl FakeDevice {
        fn high_speed() -> Self {
            Self {
                version: 0x0200,
                speed: UsbSpeed::High,
                data_status: UsbStatus::Completed,
                bdone: 0,
            }
        }

        fn short_xfer(bdone: u32) -> Self {
            Self {
                data_status: UsbStatus::ShortXfer,
                bdone,
                ..Self::high_speed()
            }
        }
    }

    impl UsbDeviceModel for FakeDevice {
        fn kind(&self) -> UsbDeviceKind {
            UsbDeviceKind::Static
        }

        fn usb_version(&self) -> u16 {
            self.version
        }

        fn speed(&self) -> UsbSpeed {
            self.speed
        }

        fn reset(&mut self) -> UsbStatus {
            UsbStatus::Completed
        }

        fn request(&mut self, xfer: &mut Xfer, mem: &BusDeviceRef) -> UsbStatus {
            xfer.complete_inline(mem, Some(&[0u8; 8]))
        }

        fn data(
            &mut self,
            xfer: &mut Xfer,
            _dir: Direction,
            _epnum: u8,
            _mem: &BusDeviceRef,
        ) -> UsbStatus {
            if self.data_status == UsbStatus::Nak {
                return UsbStatus::Nak;
            }

            for idx in xfer.live_indices().collect::<Vec<_>>() {
                let block = xfer.block_mut(idx);
                if block.processed != BlockState::Free {
                    continue;
                }
                if !block.buf.is_empty() {
                    let done = self.bdone.min(block.blen);
                    block.bdone = done;
                    block.blen -= done;
                }
                block.status = self.data_status;
                block.processed = BlockState::Handled;
            }

            xfer.status = self.data_status;
            self.data_status
        }
    }

    struct TestRig {
        mem: BusDeviceRef,
        irq: Arc<CountingInterruptLine>,
        xhci: XhciController,
        cmd_enq: u64,
        event_deq: u32,
    }

    impl TestRig {
        fn new() -> Self {
            let mem: BusDeviceRef = Arc::new(GuestRam::new(0x10000));
            let irq = Arc::new(CountingInterruptLine::default());

            let factory: BackendFactory = Box::new(|di| {
                Ok(Box::new(FakeDevice {
                    version: di.bcd,
                    speed: di.speed,
                    data_status: UsbStatus::Completed,
                    bdone: 0,
                }) as Box<dyn UsbDeviceModel>)
            });

            let mut xhci = XhciController::new(
                mem.clone(),
                ExtendedCaps::new(ExcapProfile::Default, None),
                factory,
            );
            xhci.connect_irq(irq.clone());

            Self {
                mem,
                irq,
                xhci,
                cmd_enq: CMD_RING,
                event_deq: 0,
            }
        }

        fn op_write(&mut self, rel: u64, value: u32) {
            self.xhci
                .mmio_write(Request::new(CAPLEN + rel, RequestSize::Size4), value.into());
        }

        fn op_read(&mut self, rel: u64) -> u32 {
            self.xhci
                .mmio_read(Request::new(CAPLEN + rel, RequestSize::Size4)) as u32
        }

        fn rt_write(&mut self, rel: u64, value: u32) {
            self.xhci
                .mmio_write(Request::new(RTSOFF + rel, RequestSize::Size4), value.into());
        }

        /// Program the event ring, command ring and DCBAA, then start the
        /// controller with interrupts enabled.
        fn start(&mut self) {
            // A single-entry segment table.
            self.mem
                .write(Request::new(ERST, RequestSize::Size8), EVENT_SEG);
            self.mem.write(
                Request::new(ERST + 8, RequestSize::Size4),
                EVENT_SEG_SIZE.into(),
            );

            self.rt_write(offset::IR0 + offset::IMAN, runtime::iman::IE);
            self.rt_write(offset::IR0 + offset::ERSTSZ, 1);
            self.rt_write(offset::IR0 + offset::ERSTBA_LO, ERST as u32);
            self.rt_write(offset::IR0 + offset::ERSTBA_HI, 0);
            self.rt_write(offset::IR0 + offset::ERDP_LO, EVENT_SEG as u32);
            self.rt_write(offset::IR0 + offset::ERDP_HI, 0);

            self.op_write(offset::CRCR_LO, CMD_RING as u32 | 1);
            self.op_write(offset::CRCR_HI, 0);
            self.op_write(offset::DCBAAP_LO, DCBAA_ADDR as u32);
            self.op_write(offset::DCBAAP_HI, 0);
            self.op_write(offset::CONFIG, MAX_SLOTS as u32);

            self.op_write(offset::USBCMD, usbcmd::RS | usbcmd::INTE);
        }

        fn push_command(&mut self, mut trb: Trb) {
            trb.set_cycle(true);
            trb.write_to(&self.mem, self.cmd_enq);
            self.cmd_enq += 16;
        }

        fn ring_command_doorbell(&mut self) {
            self.xhci
                .mmio_write(Request::new(DBOFF, RequestSize::Size4), 0);
        }

        fn ring_device_doorbell(&mut self, slot: u8, value: u32) {
            self.xhci.mmio_write(
                Request::new(DBOFF + u64::from(slot) * 4, RequestSize::Size4),
                value.into(),
            );
        }

        /// Collect the events the controller produced since the last
        /// call.
        fn take_events(&mut self) -> Vec<Trb> {
            let mut events = vec![];
            loop {
                let trb = Trb::read_from(&self.mem, EVENT_SEG + u64::from(self.event_deq) * 16);
                if trb.trb_type_raw() == 0 || !trb.cycle() {
                    break;
                }
                events.push(trb);
                self.event_deq += 1;
            }
            events
        }

        /// Prepare DCBAA and input context so `slot` can be addressed on
        /// `rh_port`.
        fn prime_address_device(&mut self, slot: u8, rh_port: u8) {
            self.mem.write(
                Request::new(DCBAA_ADDR + u64::from(slot) * 8, RequestSize::Size8),
                DEV_CTX,
            );

            // Input control context: drop nothing, add slot and EP0.
            self.mem
                .write(Request::new(INPUT_CTX, RequestSize::Size4), 0);
            self.mem
                .write(Request::new(INPUT_CTX + 4, RequestSize::Size4), 0x3);
            // Input slot context: root hub port.
            self.mem.write(
                Request::new(INPUT_CTX + 0x20 + 4, RequestSize::Size4),
                u64::from(rh_port) << 16,
            );
            // Input EP0 context: transfer ring with CCS=1.
            self.mem.write(
                Request::new(INPUT_CTX + 0x40 + 8, RequestSize::Size8),
                EP0_RING | 1,
            );
        }

        fn enable_and_address(&mut self, slot: u8, rh_port: u8) {
            self.prime_address_device(slot, rh_port);

            self.push_command(Trb::new(
                0,
                0,
                u32::from(trb_types::ENABLE_SLOT_COMMAND) << trb_control::TYPE_SHIFT,
            ));
            self.push_command(Trb::new(
                INPUT_CTX,
                0,
                (u32::from(trb_types::ADDRESS_DEVICE_COMMAND) << trb_control::TYPE_SHIFT)
                    | (u32::from(slot) << trb_control::SLOT_SHIFT),
            ));
            self.ring_command_doorbell();
        }

        /// Configure an endpoint with a fresh transfer ring at
        /// [`EP_RING`].
        fn configure_endpoint(&mut self, slot: u8, epid: u8) {
            self.mem
                .write(Request::new(INPUT_CTX, RequestSize::Size4), 0);
            self.mem.write(
                Request::new(INPUT_CTX + 4, RequestSize::Size4),
                1u64 << epid,
            );
            self.mem.write(
                Request::new(INPUT_CTX + 0x20 * (u64::from(epid) + 1) + 8, RequestSize::Size8),
                EP_RING | 1,
            );

            self.push_command(Trb::new(
                INPUT_CTX,
                0,
                (u32::from(trb_types::CONFIGURE_ENDPOINT_COMMAND) << trb_control::TYPE_SHIFT)
                    | (u32::from(slot) << trb_control::SLOT_SHIFT),
            ));
            self.ring_command_doorbell();
        }
    }

    fn native_device(bcd: u16, speed: UsbSpeed) -> NativeDeviceInfo {
        NativeDeviceInfo {
            path: DevicePath::new(1, &[2]),
            speed,
            vid: 0x1234,
            pid: 0x5678,
            bcd,
            kind: NativeKind::Device,
        }
    }

    #[test]
    fn capability_registers_have_the_advertised_layout() {
        let mut rig = TestRig::new();

        let caplength = rig.xhci.mmio_read(Request::new(0, RequestSize::Size4));
        assert_eq!(caplength, (0x0100 << 16) | 0x20);

        let hcsparams1 = rig.xhci.mmio_read(Request::new(0x4, RequestSize::Size4));
        assert_eq!(hcsparams1, (20 << 24) | (1 << 8) | 64);

        assert_eq!(
            rig.xhci.mmio_read(Request::new(0x14, RequestSize::Size4)),
            DBOFF
        );
        assert_eq!(
            rig.xhci.mmio_read(Request::new(0x18, RequestSize::Size4)),
            RTSOFF
        );
        // DBOFF is 32-bit aligned, RTSOFF 32-byte aligned.
        assert_eq!(DBOFF & 0x3, 0);
        assert_eq!(RTSOFF & 0x1F, 0);
    }

    #[test]
    fn run_stop_drives_the_halted_bit() {
        let mut rig = TestRig::new();

        assert_ne!(rig.op_read(offset::USBSTS) & usbsts::HCH, 0);

        rig.op_write(offset::USBCMD, usbcmd::RS);
        assert_eq!(rig.op_read(offset::USBSTS) & usbsts::HCH, 0);

        rig.op_write(offset::USBCMD, 0);
        assert_ne!(rig.op_read(offset::USBSTS) & usbsts::HCH, 0);
    }

    #[test]
    fn mfindex_counts_in_microframes() {
        assert_eq!(mfindex_value(0), 0);
        assert_eq!(mfindex_value(40), 40);
        // 14-bit wrap-around.
        assert_eq!(mfindex_value(1 << 14), 0);
        assert_eq!(mfindex_value((1 << 14) + 7), 7);
        // N microseconds of idle time are N/125 ticks.
        assert_eq!(mfindex_value(1_000_000 / 125), 8000);
    }

    #[test]
    fn slot_enable_then_address_for_an_emulated_device() {
        let mut rig = TestRig::new();
        let (tablet, _handle) = UsbTablet::new();
        let port = rig.xhci.attach_device(Box::new(tablet)).unwrap();
        assert_eq!(port, 11, "full-speed devices go to the USB2 half");

        rig.start();
        rig.take_events();
        rig.enable_and_address(1, port);

        let events = rig.take_events();
        assert_eq!(events.len(), 2);
        for (idx, event) in events.iter().enumerate() {
            assert_eq!(event.trb_type_raw(), trb_types::COMMAND_COMPLETION_EVENT);
            assert_eq!(event.completion_code_raw(), CompletionCode::Success as u8);
            assert_eq!(event.slot_id(), 1);
            assert_eq!(event.parameter, CMD_RING + idx as u64 * 16);
        }
        assert!(rig.irq.asserted() >= 1);

        // The device context reflects the addressed slot.
        let dev_ctx = rig.xhci.device_context(1).unwrap();
        assert_eq!(dev_ctx.slot().state(), 2);
        assert_eq!(dev_ctx.endpoint(1).state(), 1);
    }

    #[test]
    fn port_reset_enables_the_port_and_reports_the_change() {
        let mut rig = TestRig::new();
        rig.start();

        let di = native_device(0x0300, UsbSpeed::Super);
        assert!(rig.xhci.assign_native_port(di));
        rig.xhci.on_connect(&di);

        let vport = 1;
        assert_eq!(
            rig.xhci.native_index_by_vport(vport),
            Some(0),
            "super-speed devices take the USB3 half"
        );
        rig.take_events();

        // Guest writes PR into PORTSC of port 1.
        rig.op_write(
            PORTREGS_START + u64::from(vport - 1) * PORTREGS_SETSZ,
            portsc::PR,
        );

        let sc = rig.xhci.ports[usize::from(vport)].portsc;
        assert_ne!(sc & portsc::PED, 0);
        assert_eq!((sc & portsc::SPEED_MASK) >> portsc::SPEED_SHIFT, 4);
        assert_ne!(sc & portsc::PRC, 0);
        assert_eq!(sc & portsc::PR, 0);

        let events = rig.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trb_type_raw(), trb_types::PORT_STATUS_CHANGE_EVENT);
        assert_eq!((events[0].parameter >> 24) as u8, vport);
    }

    #[test]
    fn portsc_change_bits_are_write_one_to_clear() {
        let mut rig = TestRig::new();
        rig.start();

        let di = native_device(0x0300, UsbSpeed::Super);
        rig.xhci.assign_native_port(di);
        rig.xhci.on_connect(&di);

        let sc_off = PORTREGS_START;
        assert_ne!(rig.op_read(sc_off) & portsc::CSC, 0);

        // Writing zero does not clear the change bit.
        rig.op_write(sc_off, 0);
        assert_ne!(rig.op_read(sc_off) & portsc::CSC, 0);

        rig.op_write(sc_off, portsc::CSC);
        assert_eq!(rig.op_read(sc_off) & portsc::CSC, 0);
        // Connect status itself is untouched.
        assert_ne!(rig.op_read(sc_off) & portsc::CCS, 0);
    }

    #[test]
    fn short_packet_transfer_reports_the_remainder() {
        let mut rig = TestRig::new();
        let port = rig
            .xhci
            .attach_device(Box::new(FakeDevice::short_xfer(128)))
            .unwrap();

        rig.start();
        rig.enable_and_address(1, port);
        rig.configure_endpoint(1, 2);
        rig.take_events();
        let interrupts_before = rig.irq.asserted();

        // One NORMAL TRB of 512 bytes with IOC.
        Trb::new(
            DATA_BUF,
            512,
            (u32::from(trb_types::NORMAL) << trb_control::TYPE_SHIFT) | trb_control::IOC | 1,
        )
        .write_to(&rig.mem, EP_RING);

        rig.ring_device_doorbell(1, 2);

        let events = rig.take_events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.trb_type_raw(), trb_types::TRANSFER_EVENT);
        assert_eq!(
            event.completion_code_raw(),
            CompletionCode::ShortPacket as u8
        );
        assert_eq!(event.status & 0xFF_FFFF, 384, "remainder is 512 - 128");
        assert_eq!(event.slot_id(), 1);
        assert_eq!(event.endpoint_id(), 2);
        assert_eq!(event.parameter, EP_RING);

        assert!(rig.irq.asserted() > interrupts_before);
    }

    #[test]
    fn static_device_nak_defers_until_the_next_doorbell() {
        let mut rig = TestRig::new();
        let (tablet, handle) = UsbTablet::new();
        let port = rig.xhci.attach_device(Box::new(tablet)).unwrap();

        rig.start();
        rig.enable_and_address(1, port);
        // The tablet's interrupt IN endpoint is id 3 (endpoint 1 IN).
        rig.configure_endpoint(1, 3);
        rig.take_events();

        Trb::new(
            DATA_BUF,
            8,
            (u32::from(trb_types::NORMAL) << trb_control::TYPE_SHIFT) | trb_control::IOC | 1,
        )
        .write_to(&rig.mem, EP_RING);

        // No input queued: the transfer stays pending, no event.
        rig.ring_device_doorbell(1, 3);
        assert!(rig.take_events().is_empty());

        // Input arrives; the next doorbell retries the parked transfer.
        handle.push(crate::device::usb::tablet::TabletReport {
            buttons: 0,
            x: 1,
            y: 2,
        });
        rig.ring_device_doorbell(1, 3);

        let events = rig.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trb_type_raw(), trb_types::TRANSFER_EVENT);
    }

    #[test]
    fn enable_disable_slot_round_trips() {
        let mut rig = TestRig::new();
        rig.start();

        rig.push_command(Trb::new(
            0,
            0,
            u32::from(trb_types::ENABLE_SLOT_COMMAND) << trb_control::TYPE_SHIFT,
        ));
        rig.ring_command_doorbell();
        let events = rig.take_events();
        assert_eq!(events[0].slot_id(), 1);
        assert!(rig.xhci.slot_allocated[1]);

        rig.push_command(Trb::new(
            0,
            0,
            (u32::from(trb_types::DISABLE_SLOT_COMMAND) << trb_control::TYPE_SHIFT) | (1 << 24),
        ));
        rig.ring_command_doorbell();
        let events = rig.take_events();
        assert_eq!(events[0].completion_code_raw(), CompletionCode::Success as u8);
        assert!(!rig.xhci.slot_allocated[1]);

        // Disabling again fails: the slot table is back to its initial
        // state.
        rig.push_command(Trb::new(
            0,
            0,
            (u32::from(trb_types::DISABLE_SLOT_COMMAND) << trb_control::TYPE_SHIFT) | (1 << 24),
        ));
        rig.ring_command_doorbell();
        let events = rig.take_events();
        assert_eq!(
            events[0].completion_code_raw(),
            CompletionCode::SlotNotEnabledError as u8
        );
    }

    #[test]
    fn deconfigure_returns_the_slot_to_addressed() {
        let mut rig = TestRig::new();
        let port = rig
            .xhci
            .attach_device(Box::new(FakeDevice::high_speed()))
            .unwrap();

        rig.start();
        rig.enable_and_address(1, port);
        rig.configure_endpoint(1, 2);
        rig.take_events();

        let dev_ctx = rig.xhci.device_context(1).unwrap();
        assert_eq!(dev_ctx.slot().state(), 3, "slot is configured");

        // Configure Endpoint with the deconfigure bit set.
        rig.push_command(Trb::new(
            0,
            0,
            (u32::from(trb_types::CONFIGURE_ENDPOINT_COMMAND) << trb_control::TYPE_SHIFT)
                | trb_control::BIT9
                | (1 << 24),
        ));
        rig.ring_command_doorbell();

        let events = rig.take_events();
        assert_eq!(events[0].completion_code_raw(), CompletionCode::Success as u8);

        let dev_ctx = rig.xhci.device_context(1).unwrap();
        assert_eq!(dev_ctx.slot().state(), 2, "slot is back to addressed");
        for epid in 2..=31 {
            assert_eq!(dev_ctx.endpoint(epid).state(), 0);
            assert!(rig.xhci.endpoint_ring(1, epid).is_none());
        }
    }

    #[test]
    fn command_ring_wraps_through_a_toggling_link() {
        let mut rig = TestRig::new();
        rig.start();
        rig.take_events();

        // Two NOOPs and a link TRB with toggle-cycle back to the start.
        rig.push_command(Trb::new(
            0,
            0,
            u32::from(trb_types::NO_OP_COMMAND) << trb_control::TYPE_SHIFT,
        ));
        rig.push_command(Trb::new(
            0,
            0,
            u32::from(trb_types::NO_OP_COMMAND) << trb_control::TYPE_SHIFT,
        ));
        rig.push_command(Trb::new(
            CMD_RING,
            0,
            (u32::from(trb_types::LINK) << trb_control::TYPE_SHIFT) | trb_control::TC,
        ));
        rig.ring_command_doorbell();

        assert_eq!(rig.take_events().len(), 2);

        // The guest posts the third NOOP after the wrap with the toggled
        // cycle.
        let mut wrapped = Trb::new(
            0,
            0,
            u32::from(trb_types::NO_OP_COMMAND) << trb_control::TYPE_SHIFT,
        );
        wrapped.set_cycle(false);
        wrapped.write_to(&rig.mem, CMD_RING);
        rig.ring_command_doorbell();

        let events = rig.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].completion_code_raw(), CompletionCode::Success as u8);
        assert_eq!(events[0].parameter, CMD_RING);
        assert!(
            !rig.xhci.command_ring.cycle_state(),
            "the consumer cycle state ends toggled"
        );
    }

    #[test]
    fn s3_cycle_keeps_the_virtual_port_of_a_passed_through_device() {
        let mut rig = TestRig::new();
        // The tablet occupies port 11, so the native high-speed device
        // lands on port 12.
        let (tablet, _handle) = UsbTablet::new();
        rig.xhci.attach_device(Box::new(tablet)).unwrap();

        rig.start();

        let di = native_device(0x0200, UsbSpeed::High);
        assert!(rig.xhci.assign_native_port(di));
        rig.xhci.on_connect(&di);

        let vport = 12;
        let idx = rig.xhci.native_index_by_vport(vport).expect("device bound");
        rig.enable_and_address(1, vport);
        assert_eq!(rig.xhci.native_ports[idx].state, VportState::Emulated);
        rig.take_events();

        // Guest initiates S3: controller state save.
        rig.op_write(offset::USBCMD, usbcmd::RS | usbcmd::INTE | usbcmd::CSS);

        assert_eq!(
            rig.xhci.ports[usize::from(vport)].portsc,
            portsc::PP | (portsc::pls::RX_DETECT << portsc::PLS_SHIFT),
            "PORTSC is re-initialized at suspend"
        );
        assert_eq!(rig.xhci.vbdp_devs[0].state, VbdpState::Start);
        assert_eq!(rig.xhci.vbdp_devs[0].vport, vport);
        assert_eq!(rig.xhci.native_ports[idx].state, VportState::Assigned);

        // The host-side disconnect during suspend is hidden from the
        // guest.
        rig.xhci.on_disconnect(&di);
        assert!(rig.take_events().is_empty());

        // The reconnect after resume reuses the cached virtual port and
        // stays silent as well.
        rig.xhci.on_connect(&di);
        assert!(rig.take_events().is_empty());
        assert_eq!(rig.xhci.native_ports[idx].state, VportState::Connected);
        assert_eq!(rig.xhci.native_ports[idx].vport, vport);

        // The guest tears down the stale slot; this hands the port to
        // the worker.
        rig.push_command(Trb::new(
            0,
            0,
            (u32::from(trb_types::DISABLE_SLOT_COMMAND) << trb_control::TYPE_SHIFT) | (1 << 24),
        ));
        rig.ring_command_doorbell();
        let events = rig.take_events();
        assert_eq!(events[0].completion_code_raw(), CompletionCode::Success as u8);
        assert_eq!(rig.xhci.vbdp_devs[0].state, VbdpState::End);

        // One worker pass re-announces the port with the device's speed.
        assert!(rig.xhci.vbdp_service());

        let events = rig.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trb_type_raw(), trb_types::PORT_STATUS_CHANGE_EVENT);
        assert_eq!((events[0].parameter >> 24) as u8, vport);

        let sc = rig.xhci.ports[usize::from(vport)].portsc;
        assert_ne!(sc & portsc::CCS, 0);
        assert_eq!(
            (sc & portsc::SPEED_MASK) >> portsc::SPEED_SHIFT,
            UsbSpeed::High.portsc_id()
        );
    }

    #[test]
    fn doorbells_are_ignored_while_halted() {
        let mut rig = TestRig::new();
        // No RS: the controller stays halted.
        rig.push_command(Trb::new(
            0,
            0,
            u32::from(trb_types::ENABLE_SLOT_COMMAND) << trb_control::TYPE_SHIFT,
        ));
        rig.ring_command_doorbell();
        assert!(rig.take_events().is_empty());
        assert!(!rig.xhci.slot_allocated[1]);
    }

    #[test]
    fn setup_trbs_require_immediate_data_of_length_8() {
        let mut rig = TestRig::new();
        let (tablet, _handle) = UsbTablet::new();
        let port = rig.xhci.attach_device(Box::new(tablet)).unwrap();

        rig.start();
        rig.enable_and_address(1, port);
        rig.take_events();

        // A setup stage without IDT is malformed.
        Trb::new(
            0x80060001_00000000,
            8,
            (u32::from(trb_types::SETUP_STAGE) << trb_control::TYPE_SHIFT) | 1,
        )
        .write_to(&rig.mem, EP0_RING);

        rig.ring_device_doorbell(1, 1);

        let events = rig.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trb_type_raw(), trb_types::TRANSFER_EVENT);
        assert_eq!(events[0].completion_code_raw(), CompletionCode::TrbError as u8);
    }

    #[test]
    fn control_transfer_through_the_tablet_succeeds() {
        let mut rig = TestRig::new();
        let (tablet, _handle) = UsbTablet::new();
        let port = rig.xhci.attach_device(Box::new(tablet)).unwrap();

        rig.start();
        rig.enable_and_address(1, port);
        rig.take_events();

        // GET_DESCRIPTOR(DEVICE) as setup/data/status TD.
        let setup = UsbRequestBytes {
            request_type: 0x80,
            request: 6,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        Trb::new(
            setup.to_le(),
            8,
            (u32::from(trb_types::SETUP_STAGE) << trb_control::TYPE_SHIFT)
                | trb_control::IDT
                | 1,
        )
        .write_to(&rig.mem, EP0_RING);
        Trb::new(
            DATA_BUF,
            18,
            (u32::from(trb_types::DATA_STAGE) << trb_control::TYPE_SHIFT) | 1,
        )
        .write_to(&rig.mem, EP0_RING + 16);
        Trb::new(
            0,
            0,
            (u32::from(trb_types::STATUS_STAGE) << trb_control::TYPE_SHIFT)
                | trb_control::IOC
                | 1,
        )
        .write_to(&rig.mem, EP0_RING + 32);

        rig.ring_device_doorbell(1, 1);

        let events = rig.take_events();
        assert_eq!(events.len(), 1, "only the IOC status stage notifies");
        assert_eq!(events[0].trb_type_raw(), trb_types::TRANSFER_EVENT);
        assert_eq!(events[0].completion_code_raw(), CompletionCode::Success as u8);
        assert_eq!(events[0].parameter, EP0_RING + 32);

        // The descriptor landed in guest memory.
        let mut descriptor = [0u8; 2];
        rig.mem.read_bulk(DATA_BUF, &mut descriptor);
        assert_eq!(descriptor, [18, 1], "device descriptor header");
    }

    /// Little helper to build setup packets in guest byte order.
    struct UsbRequestBytes {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    }

    impl UsbRequestBytes {
        fn to_le(&self) -> u64 {
            u64::from_le_bytes([
                self.request_type,
                self.request,
                self.value.to_le_bytes()[0],
                self.value.to_le_bytes()[1],
                self.index.to_le_bytes()[0],
                self.index.to_le_bytes()[1],
                self.length.to_le_bytes()[0],
                self.length.to_le_bytes()[1],
            ])
        }
    }
}
