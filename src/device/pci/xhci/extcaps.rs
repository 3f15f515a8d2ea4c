//! The extended-capability register window.
//!
//! Two layouts are supported: the default profile with a USB2 and a USB3
//! Supported Protocol capability, and the vendor dual-role profile that
//! adds a writable Dual-Role-Device capability whose mode switches are
//! forwarded to a host-side sink.

use std::fmt::Debug;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::device::pci::constants::xhci::extended::{
    drd, CAP_ID_SUPPORTED_PROTOCOL, CAP_ID_VENDOR_DRD,
};
use crate::device::pci::constants::xhci::{EXCAPOFF, MAX_DEVS};

/// Register window of the USB2 Supported Protocol capability.
const U2_START: u64 = EXCAPOFF;
const U2_END: u64 = U2_START + 0x10;
/// Register window of the USB3 Supported Protocol capability.
const U3_START: u64 = EXCAPOFF + 0x20;
const U3_END: u64 = U3_START + 0x10;
/// Register window of the vendor Dual-Role-Device capability. The
/// configuration registers sit at the end, after a pad that mirrors the
/// physical controller's layout.
const DRD_START: u64 = EXCAPOFF + 0x70;
const DRD_END: u64 = DRD_START + 0x70;
const DRD_CFG0: u64 = DRD_END - 8;
const DRD_CFG1: u64 = DRD_END - 4;

/// The extended-capability layout profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcapProfile {
    /// Supported-protocol capabilities only.
    Default,
    /// Supported-protocol capabilities plus the vendor dual-role
    /// capability.
    Drd,
}

/// The role selected through the dual-role capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DrdRole {
    Host,
    Device,
}

/// Receiver of dual-role mode switches.
///
/// The controller core does not know how the platform flips the PHY mux;
/// it only reports the requested role here.
pub trait RoleSwitchSink: Debug + Send {
    /// Apply the requested role on the host side.
    fn set_role(&self, role: DrdRole) -> io::Result<()>;
}

/// A [`RoleSwitchSink`] that writes `host`/`device` into a host file,
/// typically the platform's role-switch sysfs attribute.
#[derive(Debug)]
pub struct FileRoleSwitch {
    path: PathBuf,
}

impl FileRoleSwitch {
    /// Forward role switches to the file at `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RoleSwitchSink for FileRoleSwitch {
    fn set_role(&self, role: DrdRole) -> io::Result<()> {
        let keyword = match role {
            DrdRole::Host => "host",
            DrdRole::Device => "device",
        };
        OpenOptions::new()
            .write(true)
            .open(&self.path)?
            .write_all(keyword.as_bytes())
    }
}

/// One Supported Protocol capability, serialized as its four register
/// dwords.
const fn protocol_cap(major: u8, next: u8, port_off: u8, port_cnt: u8) -> [u32; 4] {
    [
        CAP_ID_SUPPORTED_PROTOCOL as u32 | (next as u32) << 8 | (major as u32) << 24,
        u32::from_le_bytes(*b"USB "),
        port_off as u32 | (port_cnt as u32) << 8,
        0,
    ]
}

/// The extended-capability window of the controller.
#[derive(Debug)]
pub struct ExtendedCaps {
    profile: ExcapProfile,
    u2: [u32; 4],
    u3: [u32; 4],
    drdcfg0: u32,
    drdcfg1: u32,
    sink: Option<Box<dyn RoleSwitchSink>>,
}

impl ExtendedCaps {
    /// Build the window for `profile`. A role-switch `sink` only makes
    /// sense with [`ExcapProfile::Drd`].
    #[must_use]
    pub fn new(profile: ExcapProfile, sink: Option<Box<dyn RoleSwitchSink>>) -> Self {
        let half = (MAX_DEVS / 2) as u8;
        let u3_next = match profile {
            // The next pointer is in dwords; 0x50 bytes to the DRD
            // capability.
            ExcapProfile::Drd => 0x14,
            ExcapProfile::Default => 0,
        };

        Self {
            profile,
            // USB2 ports occupy the upper half of the root hub, USB3 the
            // lower.
            u2: protocol_cap(2, 0x08, half + 1, half),
            u3: protocol_cap(3, u3_next, 1, half),
            drdcfg0: 0,
            drdcfg1: drd::CFG1_HOST_MODE,
            sink,
        }
    }

    /// The selected layout profile.
    #[must_use]
    pub const fn profile(&self) -> ExcapProfile {
        self.profile
    }

    /// The end of the register space, exclusive.
    #[must_use]
    pub const fn regsend(&self) -> u64 {
        match self.profile {
            ExcapProfile::Default => U3_END,
            ExcapProfile::Drd => DRD_END,
        }
    }

    /// Read the dword at absolute BAR offset `offset`.
    #[must_use]
    pub fn read(&self, offset: u64) -> u32 {
        let offset = offset & !0x3;
        match offset {
            U2_START..U2_END => self.u2[((offset - U2_START) / 4) as usize],
            U3_START..U3_END => self.u3[((offset - U3_START) / 4) as usize],
            DRD_START..DRD_END if self.profile == ExcapProfile::Drd => match offset {
                DRD_START => CAP_ID_VENDOR_DRD as u32,
                DRD_CFG0 => self.drdcfg0,
                DRD_CFG1 => self.drdcfg1,
                _ => 0,
            },
            _ => {
                warn!("read of unimplemented extended capability offset {offset:#x}");
                0
            }
        }
    }

    /// Write the dword at absolute BAR offset `offset`.
    ///
    /// Only the first dual-role configuration register is writable. A
    /// write that flips the ID pin selection is forwarded to the
    /// role-switch sink; the status register follows on success.
    pub fn write(&mut self, offset: u64, value: u32) {
        if self.profile != ExcapProfile::Drd || offset != DRD_CFG0 {
            warn!("ignoring write to read-only extended capability offset {offset:#x}");
            return;
        }

        if self.drdcfg0 == value {
            debug!(
                "no drd mode switch; staying in {} mode",
                if self.drdcfg1 & drd::CFG1_HOST_MODE != 0 {
                    "host"
                } else {
                    "device"
                }
            );
            return;
        }

        self.drdcfg0 = value;

        if value & drd::CFG0_IDPIN_EN == 0 {
            return;
        }

        let (role, cfg1) = if value & drd::CFG0_IDPIN == 0 {
            (DrdRole::Host, drd::CFG1_HOST_MODE)
        } else {
            (DrdRole::Device, 0)
        };

        match self.sink.as_ref().map(|sink| sink.set_role(role)) {
            Some(Ok(())) => {
                debug!("switched dual-role mode to {role:?}");
                self.drdcfg1 = cfg1;
            }
            Some(Err(error)) => {
                warn!("role switch to {role:?} failed: {error}");
            }
            None => {
                warn!("no role-switch sink configured, ignoring mode switch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct RecordingSink {
        switches: Arc<AtomicU32>,
        last_host: Arc<AtomicU32>,
    }

    impl RoleSwitchSink for RecordingSink {
        fn set_role(&self, role: DrdRole) -> io::Result<()> {
            self.switches.fetch_add(1, Ordering::SeqCst);
            self.last_host
                .store((role == DrdRole::Host) as u32, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn default_profile_exposes_two_protocol_capabilities() {
        let caps = ExtendedCaps::new(ExcapProfile::Default, None);

        // USB2: revision 2.x, ports 11..=20, next capability at +0x20.
        let u2 = caps.read(U2_START);
        assert_eq!(u2 & 0xFF, CAP_ID_SUPPORTED_PROTOCOL as u32);
        assert_eq!((u2 >> 8) & 0xFF, 0x08);
        assert_eq!(u2 >> 24, 2);
        assert_eq!(caps.read(U2_START + 8) & 0xFF, 11);
        assert_eq!((caps.read(U2_START + 8) >> 8) & 0xFF, 10);

        // USB3: revision 3.x, ports 1..=10, end of chain.
        let u3 = caps.read(U3_START);
        assert_eq!(u3 >> 24, 3);
        assert_eq!((u3 >> 8) & 0xFF, 0);
        assert_eq!(caps.read(U3_START + 8) & 0xFF, 1);

        assert_eq!(caps.regsend(), U3_END);
    }

    #[test]
    fn name_string_is_usb() {
        let caps = ExtendedCaps::new(ExcapProfile::Default, None);
        assert_eq!(caps.read(U2_START + 4), u32::from_le_bytes(*b"USB "));
    }

    #[test]
    fn drd_profile_chains_to_the_vendor_capability() {
        let caps = ExtendedCaps::new(ExcapProfile::Drd, None);

        assert_eq!((caps.read(U3_START) >> 8) & 0xFF, 0x14);
        assert_eq!(caps.read(DRD_START) & 0xFF, CAP_ID_VENDOR_DRD as u32);
        assert_eq!(caps.regsend(), DRD_END);
    }

    #[test]
    fn idpin_writes_drive_the_role_switch_sink() {
        let sink = RecordingSink::default();
        let switches = sink.switches.clone();
        let last_host = sink.last_host.clone();

        let mut caps = ExtendedCaps::new(ExcapProfile::Drd, Some(Box::new(sink)));
        assert_eq!(caps.read(DRD_CFG1), drd::CFG1_HOST_MODE);

        // Switch to device mode.
        caps.write(DRD_CFG0, drd::CFG0_IDPIN_EN | drd::CFG0_IDPIN);
        assert_eq!(switches.load(Ordering::SeqCst), 1);
        assert_eq!(last_host.load(Ordering::SeqCst), 0);
        assert_eq!(caps.read(DRD_CFG1), 0);

        // Re-writing the same value does not switch again.
        caps.write(DRD_CFG0, drd::CFG0_IDPIN_EN | drd::CFG0_IDPIN);
        assert_eq!(switches.load(Ordering::SeqCst), 1);

        // Back to host mode.
        caps.write(DRD_CFG0, drd::CFG0_IDPIN_EN);
        assert_eq!(switches.load(Ordering::SeqCst), 2);
        assert_eq!(caps.read(DRD_CFG1), drd::CFG1_HOST_MODE);

        // A write without IDPIN_EN changes the register but not the
        // role.
        caps.write(DRD_CFG0, 0);
        assert_eq!(switches.load(Ordering::SeqCst), 2);
        assert_eq!(caps.read(DRD_CFG0), 0);
    }
}
