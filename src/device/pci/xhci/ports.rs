//! The root hub: port registers, the virtual-port binding table and the
//! hot-plug surface.
//!
//! Virtual ports are a stable identity the guest sees; physical devices
//! come and go underneath. The `native_ports` table mediates between the
//! two, and the suspended-device cache hides disconnects caused by a guest
//! S3 cycle.

use tracing::{debug, info, warn};

use crate::device::pci::constants::xhci::operational::portsc;
use crate::device::pci::constants::xhci::operational::usbcmd;
use crate::device::pci::constants::xhci::MAX_DEVS;
use crate::device::usb::{DevicePath, NativeDeviceInfo, NativeKind, UsbDeviceModel, UsbSpeed};

use super::trb::Trb;
use super::vbdp::VbdpState;
use super::XhciController;

/// The register set of one root hub port.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortRegs {
    /// Port status and control.
    pub portsc: u32,
    /// Port power management status and control.
    pub portpmsc: u32,
    /// Port link info (read-only).
    pub portli: u32,
    /// Port hardware LPM control.
    pub porthlpmc: u32,
}

impl PortRegs {
    /// Reset the port to its powered, disconnected state.
    pub fn init(&mut self) {
        self.portsc = portsc::PP | (portsc::pls::RX_DETECT << portsc::PLS_SHIFT);
        self.portpmsc = 0;
        self.portli = 0;
        self.porthlpmc = 0;
    }

    /// Read one of the four registers by its offset within the set.
    #[must_use]
    pub const fn read(&self, reg: u64) -> u32 {
        match reg {
            0 => self.portsc,
            4 => self.portpmsc,
            8 => self.portli,
            _ => self.porthlpmc,
        }
    }
}

/// The binding state of one `native_ports` entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VportState {
    /// Unused entry.
    #[default]
    Free,
    /// The physical path is whitelisted but nothing is connected.
    Assigned,
    /// A physical device arrived and holds a virtual port.
    Connected,
    /// The guest addressed the device; a slot exists for it.
    Emulated,
}

/// One entry of the physical-to-virtual port binding table.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePort {
    /// The physical device identity, present from `Assigned` onwards.
    pub info: Option<NativeDeviceInfo>,
    /// The allocated virtual port, 0 while only assigned.
    pub vport: u8,
    /// Binding state.
    pub state: VportState,
}

impl XhciController {
    /// Find the binding entry for a physical path.
    pub(super) fn native_index_by_path(&self, path: &DevicePath) -> Option<usize> {
        self.native_ports.iter().position(|entry| {
            entry.state != VportState::Free
                && entry.info.map(|info| info.path == *path).unwrap_or(false)
        })
    }

    /// Find the binding entry holding a virtual port. Assigned-only
    /// entries hold no port yet and never match.
    pub(super) fn native_index_by_vport(&self, vport: u8) -> Option<usize> {
        if vport == 0 {
            return None;
        }

        self.native_ports
            .iter()
            .position(|entry| entry.state != VportState::Free && entry.vport == vport)
    }

    /// Whitelist a physical path for pass-through.
    ///
    /// Returns false when the binding table is exhausted.
    pub fn assign_native_port(&mut self, info: NativeDeviceInfo) -> bool {
        let Some(free) = self
            .native_ports
            .iter()
            .position(|entry| entry.state == VportState::Free)
        else {
            warn!("too many native USB devices");
            return false;
        };

        debug!("assigned native port {}", info.path);
        self.native_ports[free] = NativePort {
            info: Some(info),
            vport: 0,
            state: VportState::Assigned,
        };
        true
    }

    fn clear_native_port(&mut self, path: &DevicePath) {
        if let Some(idx) = self.native_index_by_path(path) {
            self.native_ports[idx] = NativePort::default();
        }
    }

    /// Mark the downstream paths of an arrived external hub as assigned.
    fn assign_hub_ports(&mut self, info: &NativeDeviceInfo) {
        let NativeKind::ExternalHub { maxchild } = info.kind else {
            return;
        };

        // Refresh the hub's own entry so removal finds maxchild again.
        if let Some(idx) = self.native_index_by_path(&info.path) {
            self.native_ports[idx].info = Some(*info);
        } else {
            debug!("hub {} is not assigned to this controller", info.path);
            return;
        }

        info!("USB hub {} with {} ports arrived", info.path, maxchild);

        for port in 1..=maxchild {
            let Some(child_path) = info.path.child(port) else {
                warn!("hub chain behind {} is too deep", info.path);
                break;
            };
            let child = NativeDeviceInfo {
                path: child_path,
                kind: NativeKind::Device,
                ..*info
            };
            if !self.assign_native_port(child) {
                break;
            }
        }
    }

    /// Forget the downstream paths of a removed external hub.
    fn unassign_hub_ports(&mut self, info: &NativeDeviceInfo) {
        let Some(idx) = self.native_index_by_path(&info.path) else {
            warn!("cannot find USB hub {}", info.path);
            return;
        };
        let Some(NativeDeviceInfo {
            kind: NativeKind::ExternalHub { maxchild },
            path,
            ..
        }) = self.native_ports[idx].info
        else {
            return;
        };

        info!("USB hub {} with {} ports removed", path, maxchild);

        for port in 1..=maxchild {
            if let Some(child) = path.child(port) {
                self.clear_native_port(&child);
            }
        }
    }

    /// Whether something occupies the virtual port: a parked emulated
    /// device, an addressed slot, or a connected native binding.
    pub(super) fn port_occupied(&self, port: u8) -> bool {
        if self.port_devices[usize::from(port)].is_some() {
            return true;
        }
        if self
            .slots
            .iter()
            .flatten()
            .any(|slot| slot.vport == port)
        {
            return true;
        }
        self.native_index_by_vport(port).is_some()
    }

    /// Allocate a free virtual port in the half matching a USB release.
    pub(super) fn free_vport(&self, bcd: u16) -> Option<u8> {
        let half = (MAX_DEVS / 2) as u8;
        let start = if bcd < 0x0300 {
            self.usb2_port_start
        } else {
            self.usb3_port_start
        };

        (start..start + half).find(|&port| {
            !self.port_occupied(port)
                && !self.vbdp_devs.iter().any(|entry| {
                    entry.state == VbdpState::Start && entry.vport == port
                })
        })
    }

    /// Reset the registers of one port.
    pub(super) fn init_port(&mut self, port: u8) {
        self.ports[usize::from(port)].init();
    }

    /// Apply a connect to PORTSC and raise the port-status-change event.
    pub(super) fn connect_port(&mut self, port: u8, speed: UsbSpeed, need_intr: bool) {
        let regs = &mut self.ports[usize::from(port)];
        regs.portsc = portsc::CCS
            | portsc::PP
            | portsc::CSC
            | (speed.portsc_id() << portsc::SPEED_SHIFT);

        self.port_change_event(port, need_intr);
    }

    /// Apply a disconnect to PORTSC and raise the port-status-change
    /// event.
    pub(super) fn disconnect_port(&mut self, port: u8, need_intr: bool) {
        let regs = &mut self.ports[usize::from(port)];
        regs.portsc &= !(portsc::CCS | portsc::PED);
        regs.portsc |= portsc::CSC | (portsc::pls::RX_DETECT << portsc::PLS_SHIFT);

        self.port_change_event(port, need_intr);
    }

    fn port_change_event(&mut self, port: u8, need_intr: bool) {
        debug!(
            "port {} status change: portsc {:#010x}",
            port, self.ports[usize::from(port)].portsc
        );

        if !need_intr {
            return;
        }

        // A stopped controller reports the change on the next start.
        if self.usbcmd & usbcmd::RS == 0 {
            return;
        }

        self.insert_event(&Trb::port_status_change_event(port), true);
    }

    /// Arrival callback of the hot-plug monitor.
    pub fn on_connect(&mut self, di: &NativeDeviceInfo) {
        debug!(
            "{:04x}:{:04x} {} connecting",
            di.vid, di.pid, di.path
        );

        if matches!(di.kind, NativeKind::ExternalHub { .. }) {
            self.assign_hub_ports(di);
            return;
        }

        let Some(index) = self.native_index_by_path(&di.path) else {
            debug!("{} does not belong to this controller", di.path);
            return;
        };

        // A device coming back from a guest S3 cycle keeps its cached
        // virtual port; the connect event stays suppressed until the
        // guest has torn down the old slot.
        let mut s3_resume = false;
        let mut vport = 0;
        if self.vbdp_dev_num > 0 {
            for entry in &self.vbdp_devs {
                if entry.state == VbdpState::Start && entry.path == Some(di.path) {
                    s3_resume = true;
                    vport = entry.vport;
                    info!("caching connect event for {} until resume finishes", di.path);
                    break;
                }
            }
        }

        if vport == 0 {
            match self.free_vport(di.bcd) {
                Some(free) => vport = free,
                None => {
                    warn!("no free virtual port for native device {}", di.path);
                    return;
                }
            }
        }

        self.native_ports[index] = NativePort {
            info: Some(*di),
            vport,
            state: VportState::Connected,
        };

        info!(
            "{:04x}:{:04x} {} attached to virtual port {}",
            di.vid, di.pid, di.path, vport
        );

        if s3_resume {
            return;
        }

        self.connect_port(vport, di.speed, true);
    }

    /// Removal callback of the hot-plug monitor.
    pub fn on_disconnect(&mut self, di: &NativeDeviceInfo) {
        if matches!(di.kind, NativeKind::ExternalHub { .. }) {
            self.unassign_hub_ports(di);
            return;
        }

        let Some(index) = self.native_index_by_path(&di.path) else {
            warn!("cannot find native device {}", di.path);
            return;
        };

        let state = self.native_ports[index].state;
        let vport = self.native_ports[index].vport;

        if state == VportState::Connected && vport > 0 {
            // The device disappeared before the guest addressed it.
            // Silently drop the binding back to assigned.
            info!("disconnect of unaddressed device {} on port {}", di.path, vport);
            self.disconnect_port(vport, false);
            self.native_ports[index].state = VportState::Assigned;
            self.native_ports[index].vport = 0;
            return;
        }

        // During a guest S3 cycle the disconnect is expected and hidden.
        if self.vbdp_dev_num > 0
            && self
                .vbdp_devs
                .iter()
                .any(|entry| entry.state == VbdpState::Start && entry.path == Some(di.path))
        {
            debug!("suppressing S3 disconnect of {}", di.path);
            return;
        }

        self.native_ports[index].state = VportState::Assigned;
        self.native_ports[index].vport = 0;

        debug!("reporting disconnect on virtual port {vport}");
        self.disconnect_port(vport, true);

        // Slot teardown stays with the guest: resources are released by
        // its Disable-Slot command.
    }

    /// The speed of whatever is bound to a virtual port.
    fn port_speed(&self, port: u8) -> Option<(UsbSpeed, u16)> {
        if let Some(idx) = self.native_index_by_vport(port) {
            let info = self.native_ports[idx].info?;
            return Some((info.speed, info.bcd));
        }
        if let Some(dev) = &self.port_devices[usize::from(port)] {
            return Some((dev.speed(), dev.usb_version()));
        }
        self.slots
            .iter()
            .flatten()
            .find(|slot| slot.vport == port)
            .map(|slot| (slot.dev.speed(), slot.dev.usb_version()))
    }

    /// Perform a (possibly warm) port reset.
    pub(super) fn reset_port(&mut self, port: u8, warm: bool) {
        debug!("reset port {port} (warm: {warm})");

        let Some((speed, bcd)) = self.port_speed(port) else {
            warn!("cannot reset port {port}: nothing connected");
            return;
        };

        let regs = &mut self.ports[usize::from(port)];
        regs.portsc &= !(portsc::PLS_MASK | portsc::PR | portsc::PRC);
        regs.portsc |= portsc::PED | (speed.portsc_id() << portsc::SPEED_SHIFT);

        if warm && bcd >= 0x0300 {
            regs.portsc |= portsc::WRC;
        }

        regs.portsc |= portsc::PRC;
        self.port_change_event(port, true);
    }

    /// Handle a write to one of a port's registers.
    pub(super) fn portregs_write(&mut self, port: u8, reg: u64, value: u32) {
        if port == 0 || u64::from(port) > MAX_DEVS {
            warn!("write to out-of-range port {port}");
            return;
        }

        match reg {
            0 => self.portsc_write(port, value),
            4 => self.ports[usize::from(port)].portpmsc = value,
            8 => debug!("ignoring write to read-only PORTLI of port {port}"),
            _ => self.ports[usize::from(port)].porthlpmc = value,
        }
    }

    fn portsc_write(&mut self, port: u8, value: u32) {
        // Reset requests short-circuit everything else.
        if value & (portsc::PR | portsc::WPR) != 0 {
            self.reset_port(port, value & portsc::WPR != 0);
            return;
        }

        if self.ports[usize::from(port)].portsc & portsc::PP == 0 {
            warn!("write to unpowered port {port}");
            return;
        }

        let occupied = self.port_occupied(port);
        let regs = &mut self.ports[usize::from(port)];
        let oldpls = (regs.portsc & portsc::PLS_MASK) >> portsc::PLS_SHIFT;
        let newpls = (value & portsc::PLS_MASK) >> portsc::PLS_SHIFT;

        // Only the controller-owned status bits survive; the command
        // bits of the incoming value never land in PORTSC directly. The
        // sticky change bits stay until they are written as one.
        regs.portsc &= portsc::PED
            | portsc::PLS_MASK
            | portsc::SPEED_MASK
            | portsc::PIC_MASK
            | portsc::CHANGE_BITS;

        if occupied {
            regs.portsc |= portsc::CCS | portsc::PP;
        } else {
            regs.portsc |= portsc::PP;
        }

        regs.portsc |= value
            & !(portsc::OCA
                | portsc::PR
                | portsc::PED
                | portsc::PLS_MASK
                | portsc::SPEED_MASK
                | portsc::PIC_MASK
                | portsc::LWS
                | portsc::DR
                | portsc::WPR);

        // Write-one-to-clear for the sticky change bits.
        regs.portsc &= !(value & portsc::CHANGE_BITS);

        if value & portsc::PED != 0 {
            debug!("guest requests disable of port {port}");
        }

        // Link-state writes only count when Link Write Strobe is set.
        if value & portsc::LWS == 0 {
            return;
        }

        match newpls {
            portsc::pls::U0 | portsc::pls::U3 if oldpls != newpls => {
                regs.portsc &= !portsc::PLS_MASK;
                regs.portsc |= newpls << portsc::PLS_SHIFT;

                if newpls == portsc::pls::U0 {
                    regs.portsc |= portsc::PLC;
                }

                if oldpls != portsc::pls::U0 && newpls == portsc::pls::U0 {
                    self.insert_event(&Trb::port_status_change_event(port), true);
                }
            }
            portsc::pls::U0 | portsc::pls::U3 => {}
            _ => {
                warn!("unhandled link state change of port {port} to PLS {newpls}");
            }
        }
    }

    /// Attach a fully emulated device to a free port of the matching root
    /// hub half.
    ///
    /// The device is parked at the port until the guest addresses it; its
    /// PORTSC is primed so the initial port sweep discovers it.
    pub fn attach_device(&mut self, dev: Box<dyn UsbDeviceModel>) -> anyhow::Result<u8> {
        let Some(port) = self.free_vport(dev.usb_version()) else {
            anyhow::bail!("no free port for emulated device");
        };

        let speed = dev.speed();
        self.port_devices[usize::from(port)] = Some(dev);
        self.connect_port(port, speed, false);

        info!("emulated device attached to port {port}");
        Ok(port)
    }
}
