//! # PCI Configuration Space Helpers
//!
//! This module contains helpers for creating and emulating a PCI
//! Configuration Space. To construct a Configuration Space use
//! [`ConfigSpaceBuilder`].

use crate::device::{
    bus::{Request, RequestSize, SingleThreadedBusDevice},
    register_set::{RegisterSet, RegisterSetBuilder},
};

use super::{
    constants::config_space::{
        self, capability_id, command, header_type,
        mask::CAPABILITIES_POINTER as CAPABILITY_POINTER_MASK, offset, status, MAX_BARS,
    },
    traits::RequestKind,
};

/// The offset at which we start to allocate capabilities.
///
/// The region between the standard header and this offset is left for
/// device-specific registers such as the serial-bus release number.
const INITIAL_CAPABILITY_OFFSET: u8 = 0x70;

/// Meta-information about a PCI BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    /// The size of the BAR in bytes.
    pub size: u32,

    /// The type of requests this BAR matches.
    pub kind: RequestKind,
}

impl BarInfo {
    fn new(size: u32, kind: RequestKind) -> Self {
        Self { size, kind }
    }
}

/// A builder for [`ConfigSpace`] objects.
#[derive(Debug, Clone)]
pub struct ConfigSpaceBuilder {
    reg_builder: RegisterSetBuilder<{ config_space::SIZE }>,
    multifunction: bool,
    revision: u8,
    interrupt_pin: u8,
    interrupt_line: u8,
    status: u16,

    bars: [Option<BarInfo>; MAX_BARS],

    /// The offset in the Configuration Space where we add the next
    /// capability.
    ///
    /// This has to be a 4-byte aligned address as mandated by the PCI
    /// specification.
    next_capability_offset: u8,

    /// The offset where the capability pointer needs to be updated when we
    /// add a capability.
    last_capability_pointer: u8,
}

impl ConfigSpaceBuilder {
    /// Create a builder for [`ConfigSpace`] with default settings.
    ///
    /// This will create a Configuration Space with default behavior for
    /// standard fields.
    ///
    /// There are pre-defined constants for
    /// [`vendor`](super::constants::config_space::vendor) and
    /// [`device`](super::constants::config_space::device) IDs.
    #[must_use]
    pub fn new(vendor: u16, device: u16) -> Self {
        let mut reg_builder = RegisterSetBuilder::<{ config_space::SIZE }>::new();

        reg_builder
            .u16_le_ro_at(offset::VENDOR, vendor)
            .u16_le_ro_at(offset::DEVICE, device)
            .u16_le_at(offset::COMMAND, 0, command::WRITABLE_BITS)
            .u8_rw_at(offset::CACHE_LINE_SIZE, 0)
            .u8_rw_at(offset::LATENCY_TIMER, 0)
            .u8_ro_at(offset::BIST, 0)
            .u32_le_ro_at(offset::ROM_BAR, 0)
            .u8_ro_at(offset::MIN_GNT, 0)
            .u8_ro_at(offset::MAX_LAT, 0);

        for i in 0..MAX_BARS {
            // Unimplemented BARs are hardwired to zero.
            reg_builder.u32_le_ro_at(offset::BAR_0 + i * 4, 0);
        }

        Self {
            reg_builder,
            multifunction: false,
            revision: 0,
            interrupt_pin: 0,
            interrupt_line: 255,
            status: 0,
            bars: [None; MAX_BARS],

            next_capability_offset: INITIAL_CAPABILITY_OFFSET,
            last_capability_pointer: offset::CAPABILITIES_POINTER.try_into().unwrap(),
        }
    }

    /// Configure the class and subclass field.
    ///
    /// When these are not set, they default to `0xFF`, which is the
    /// undefined device class and subclass.
    #[must_use]
    pub fn class(mut self, class: u8, subclass: u8, prog_if: u8) -> Self {
        self.reg_builder
            .u8_ro_at(offset::CLASS, class)
            .u8_ro_at(offset::SUBCLASS, subclass)
            .u8_ro_at(offset::PROG_IF, prog_if);

        self
    }

    /// Configure the revision field for this device.
    ///
    /// When not specified, the revision defaults to 0.
    #[must_use]
    #[allow(unused)]
    pub fn revision(mut self, revision: u8) -> Self {
        self.revision = revision;

        self
    }

    /// Configure the subsystem and subsystem vendor IDs.
    #[must_use]
    #[allow(unused)]
    pub fn subsystem(mut self, subsystem_vendor_id: u16, subsystem_id: u16) -> Self {
        self.reg_builder
            .u16_le_ro_at(offset::SUBSYSTEM_VENDOR_ID, subsystem_vendor_id)
            .u16_le_ro_at(offset::SUBSYSTEM_ID, subsystem_id);

        self
    }

    /// Mark the device as a multifunction device.
    #[must_use]
    #[allow(unused)]
    pub fn multifunction(mut self) -> Self {
        self.multifunction = true;
        self
    }

    /// Configure the PCI interrupt pin information field for this device.
    ///
    /// When not specified, the interrupt pin defaults to 0 (None).
    #[must_use]
    #[allow(unused)]
    pub fn interrupt_pin(mut self, irq_pin: u8) -> Self {
        self.interrupt_pin = irq_pin;

        self
    }

    /// Set the serial-bus release number register.
    ///
    /// USB host controllers report the supported USB revision in a
    /// device-specific config register below the capability area.
    #[must_use]
    pub fn usb_release(mut self, revision: u8) -> Self {
        self.reg_builder.u8_ro_at(offset::USB_REVISION, revision);

        self
    }

    /// Add a Base Address Register (BAR) for a non-prefetchable 32-bit
    /// memory region.
    ///
    /// This is the typical BAR type for MMIO regions.
    ///
    /// Size must be a power of 2 and at least 16 bytes, but 4 KiB is the
    /// recommended minimum: when BARs are smaller than the page size, BARs
    /// from multiple devices may share a frame of physical memory, which
    /// can then not be safely mapped to userspace drivers.
    #[must_use]
    pub fn mem32_nonprefetchable_bar(mut self, index: u8, size: u32) -> Self {
        let index: usize = index.into();

        assert!(index < MAX_BARS);
        assert_eq!(self.bars[index], None);

        assert!(size.is_power_of_two());
        assert!(size >= 16);

        self.reg_builder
            .u32_le_at(config_space::offset::BAR_0 + index * 4, 0, !(size - 1));

        self.bars[index] = Some(BarInfo::new(size, RequestKind::Memory));
        self
    }

    /// Add a PCI capability to the Configuration Space.
    ///
    /// The given `regs` must not contain the generic PCI Capability header
    /// (ID and next pointer). These fields will be added automatically.
    #[must_use]
    pub fn capability<const CAP_SIZE: usize>(
        mut self,
        capability_id: u8,
        regs: &RegisterSet<CAP_SIZE>,
    ) -> Self {
        let offset = self.next_capability_offset;
        assert_eq!(offset & !CAPABILITY_POINTER_MASK, 0);

        let header_size = 2;
        let next_offset = usize::from(offset) + header_size + CAP_SIZE;
        assert!(next_offset <= u8::MAX.into());

        // The next capability must start at an aligned address.
        self.next_capability_offset =
            ((next_offset + !usize::from(CAPABILITY_POINTER_MASK)) as u8) & CAPABILITY_POINTER_MASK;

        self.reg_builder
            // Extend the capability pointer list to include the new
            // capability.
            .u8_ro_at(self.last_capability_pointer.into(), offset)
            // Add the capability header. The next pointer will be written
            // when we add the next capability or when we finalize the
            // Configuration Space.
            .u8_ro_at(offset.into(), capability_id)
            // Add the register body.
            .register_set_at(usize::from(offset) + header_size, regs);

        self.last_capability_pointer = offset + 1;
        self
    }

    /// Add an MSI capability with a single vector.
    ///
    /// The capability uses the 64-bit address format without per-vector
    /// masking. The guest programs address and data; delivery is the
    /// hosting side's business, the registers are plain storage here.
    #[must_use]
    pub fn msi_capability(self) -> Self {
        use config_space::msi;

        let msi_cap: RegisterSet<{ msi::BODY_SIZE }> =
            RegisterSetBuilder::<{ msi::BODY_SIZE }>::new()
                // Message control: one vector requested, 64-bit capable.
                .u16_le_at(
                    msi::CONTROL as usize,
                    msi::control::CAP_64BIT,
                    msi::control::WRITABLE_BITS,
                )
                .u32_le_rw_at(msi::ADDRESS_LOW as usize, 0)
                .u32_le_rw_at(msi::ADDRESS_HIGH as usize, 0)
                .u16_le_rw_at(msi::DATA as usize, 0)
                .into();

        self.capability(capability_id::MSI, &msi_cap)
    }

    /// Create the finalized Configuration Space object.
    #[must_use]
    pub fn config_space(mut self) -> ConfigSpace {
        ConfigSpace {
            bars: self.bars,
            config_space: self
                .reg_builder
                // This field is written by firmware at boot time to
                // indicate which PIC pin the interrupt is routed to. A
                // value of 255 means "no connection" and this is a good
                // default.
                .u8_rw_at(offset::IRQ_LINE, self.interrupt_line)
                // This is the physical PCI interrupt pin the device is
                // connected to. A value of 0 means that it is not connected
                // to any interrupt line.
                .u8_ro_at(offset::IRQ_PIN, self.interrupt_pin)
                // The status field is not actually read-only in hardware.
                // It has error bits that can be cleared by writing 1 into
                // them. As we can never set these bits, we get the correct
                // semantics by hardcoding the error bits to zero.
                .u16_le_ro_at(
                    offset::STATUS,
                    self.status
                        | if self.next_capability_offset == INITIAL_CAPABILITY_OFFSET {
                            0
                        } else {
                            status::CAPABILITIES
                        },
                )
                .u8_ro_at(offset::REVISION, self.revision)
                .u8_ro_at(
                    offset::HEADER_TYPE,
                    header_type::TYPE_00
                        | if self.multifunction {
                            header_type::MULTIFUNCTION
                        } else {
                            0
                        },
                )
                // Finalize the list of capabilities by ending the pointer
                // chain.
                .u8_ro_at(self.last_capability_pointer.into(), 0)
                .into(),
        }
    }
}

/// The Configuration Space of a PCI device.
///
/// Use [`ConfigSpaceBuilder`] to construct this.
///
/// # Limitations
///
/// This Configuration Space emulation does not support side effects for
/// writes. Any register in the config space that needs to behave
/// differently from memory cannot be represented. This stems from the
/// underlying limitation of [`RegisterSet`].
#[derive(Debug, Clone)]
pub struct ConfigSpace {
    config_space: RegisterSet<{ config_space::SIZE }>,
    bars: [Option<BarInfo>; MAX_BARS],
}

/// An iterator that yields offsets of standard PCI capabilities.
struct CapabilityIterator<'a> {
    config_space: &'a ConfigSpace,
    cap_offset: u8,
}

impl Iterator for CapabilityIterator<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cap_offset == 0 {
            return None;
        }

        let cap_ptr =
            self.config_space
                .read(Request::new(self.cap_offset.into(), RequestSize::Size1)) as u8
                & CAPABILITY_POINTER_MASK;

        if cap_ptr == 0 {
            self.cap_offset = 0;
            None
        } else {
            // The pointer points to the ID field. The next offset is one
            // byte after it.
            self.cap_offset = cap_ptr + 1;
            Some(cap_ptr)
        }
    }
}

impl ConfigSpace {
    /// Same as `read` from [`SingleThreadedBusDevice`], but without
    /// requiring a mutable reference.
    #[must_use]
    pub fn read(&self, req: Request) -> u64 {
        self.config_space.read(req)
    }

    /// Iterate over all capabilities of the Configuration Space.
    ///
    /// The resulting iterator returns the Configuration Space offset of
    /// each standard PCI capability.
    #[allow(unused)]
    pub fn iter_capability_offsets(&self) -> impl Iterator<Item = u8> + '_ {
        CapabilityIterator {
            config_space: self,
            cap_offset: config_space::offset::CAPABILITIES_POINTER
                .try_into()
                .unwrap(),
        }
    }

    /// Retrieve information about a specific BAR.
    pub fn bar(&self, bar_no: u8) -> Option<BarInfo> {
        self.bars.get(usize::from(bar_no)).and_then(|&b| b)
    }
}

impl SingleThreadedBusDevice for ConfigSpace {
    fn size(&self) -> u64 {
        self.config_space.size()
    }

    fn read(&mut self, req: Request) -> u64 {
        self.config_space.read(req)
    }

    fn write(&mut self, req: Request, value: u64) {
        self.config_space.write(req, value)
    }
}

#[cfg(test)]
mod tests {
    use crate::device::bus::RequestSize;

    use super::*;

    #[test]
    fn device_vendor_id_are_set() {
        let example_vendor_id = 0xDEAD;
        let example_device_id = 0xBEEF;
        let cfg_space: ConfigSpace =
            ConfigSpaceBuilder::new(example_vendor_id, example_device_id).config_space();

        for (offset, value) in [
            (offset::VENDOR, example_vendor_id),
            (offset::DEVICE, example_device_id),
        ] {
            assert_eq!(
                cfg_space.read(Request::new(offset as u64, RequestSize::Size2)),
                u64::from(value)
            );
        }
    }

    #[test]
    fn class_codes_are_set() {
        let example_class = 0xDE;
        let example_subclass = 0xAD;
        let example_prog_if = 0x11;
        let cfg_space: ConfigSpace = ConfigSpaceBuilder::new(0, 0)
            .class(example_class, example_subclass, example_prog_if)
            .config_space();

        for (offset, value) in [
            (offset::CLASS, example_class),
            (offset::SUBCLASS, example_subclass),
            (offset::PROG_IF, example_prog_if),
        ] {
            assert_eq!(
                cfg_space.read(Request::new(offset as u64, RequestSize::Size1)),
                u64::from(value)
            );
        }
    }

    #[test]
    fn usb_release_register_is_set() {
        let cfg_space: ConfigSpace = ConfigSpaceBuilder::new(0, 0).usb_release(0x30).config_space();

        assert_eq!(
            cfg_space.read(Request::new(offset::USB_REVISION as u64, RequestSize::Size1)),
            0x30
        );
    }

    #[test]
    fn create_single_function_device_by_default() {
        let cfg_space: ConfigSpace = ConfigSpaceBuilder::new(0, 0).config_space();

        assert_eq!(
            cfg_space.read(Request::new(offset::HEADER_TYPE as u64, RequestSize::Size1))
                & u64::from(header_type::MULTIFUNCTION),
            0
        )
    }

    #[test]
    fn expose_no_capabilities_by_default() {
        let cfg_space: ConfigSpace = ConfigSpaceBuilder::new(0, 0).config_space();

        assert_eq!(
            cfg_space.read(Request::new(offset::STATUS as u64, RequestSize::Size2))
                & u64::from(status::CAPABILITIES),
            0
        );

        assert_eq!(
            cfg_space.read(Request::new(
                offset::CAPABILITIES_POINTER as u64,
                RequestSize::Size1
            )),
            0
        );
    }

    #[test]
    fn can_add_one_capability() {
        let example_id = 0x12;
        let example_capability: RegisterSet<2> = RegisterSetBuilder::<2>::new()
            .u16_le_ro_at(0, 0xAABB)
            .into();

        let cfg_space: ConfigSpace = ConfigSpaceBuilder::new(0, 0)
            .capability(example_id, &example_capability)
            .config_space();

        // We announce a capability list.
        assert_eq!(
            cfg_space.read(Request::new(offset::STATUS as u64, RequestSize::Size2))
                & u64::from(status::CAPABILITIES),
            u64::from(status::CAPABILITIES)
        );

        let cap_ptr = cfg_space.read(Request::new(
            offset::CAPABILITIES_POINTER as u64,
            RequestSize::Size1,
        )) & u64::from(CAPABILITY_POINTER_MASK);

        // At the announced capability offset, we see its header and
        // content.
        assert_eq!(
            cfg_space.read(Request::new(cap_ptr, RequestSize::Size1)),
            u64::from(example_id)
        );

        // The capability list terminates at this capability.
        assert_eq!(
            cfg_space.read(Request::new(cap_ptr + 1, RequestSize::Size1)),
            0
        );

        assert_eq!(
            cfg_space.read(Request::new(cap_ptr + 2, RequestSize::Size2)),
            0xAABB
        );
    }

    #[test]
    fn msi_capability_has_one_64bit_vector() {
        use config_space::msi;

        let mut cfg_space = ConfigSpaceBuilder::new(0, 0).msi_capability().config_space();

        let cap_ptr = cfg_space.read(Request::new(
            offset::CAPABILITIES_POINTER as u64,
            RequestSize::Size1,
        )) & u64::from(CAPABILITY_POINTER_MASK);

        assert_eq!(
            <ConfigSpace as SingleThreadedBusDevice>::read(
                &mut cfg_space,
                Request::new(cap_ptr, RequestSize::Size1)
            ),
            u64::from(capability_id::MSI)
        );

        let control_addr = cap_ptr + 2 + msi::CONTROL;

        // 64-bit capable, no multi-message support, disabled after reset.
        assert_eq!(
            cfg_space.read(Request::new(control_addr, RequestSize::Size2)),
            u64::from(msi::control::CAP_64BIT)
        );

        // The guest can enable MSI delivery, but cannot request more
        // vectors.
        <ConfigSpace as SingleThreadedBusDevice>::write(
            &mut cfg_space,
            Request::new(control_addr, RequestSize::Size2),
            u64::from(msi::control::ENABLE) | 0x70,
        );
        assert_eq!(
            cfg_space.read(Request::new(control_addr, RequestSize::Size2)),
            u64::from(msi::control::ENABLE | msi::control::CAP_64BIT)
        );

        // Address and data registers are plain storage.
        let addr_lo = cap_ptr + 2 + msi::ADDRESS_LOW;
        <ConfigSpace as SingleThreadedBusDevice>::write(
            &mut cfg_space,
            Request::new(addr_lo, RequestSize::Size4),
            0xFEE0_1004,
        );
        assert_eq!(
            cfg_space.read(Request::new(addr_lo, RequestSize::Size4)),
            0xFEE0_1004
        );
    }

    #[test]
    fn bars_sizing_works() {
        const BAR_SIZE: u32 = 0x1000;

        let mut cfg_space = ConfigSpaceBuilder::new(0, 0)
            .mem32_nonprefetchable_bar(1, BAR_SIZE)
            .config_space();

        // Guest operating systems determine the size of the region behind
        // the BAR by checking which lower bits don't toggle. If 12 lower
        // bits don't toggle, the BAR describes a 2^12 byte region.
        <ConfigSpace as SingleThreadedBusDevice>::write(
            &mut cfg_space,
            Request::new(offset::BAR_1 as u64, RequestSize::Size4),
            0xFFFF_FFFF,
        );
        let bar_val = cfg_space.read(Request::new(offset::BAR_1 as u64, RequestSize::Size4));

        assert_eq!(bar_val, 0xFFFF_F000);
    }

    #[test]
    fn can_query_bars() {
        let cfg_space = ConfigSpaceBuilder::new(0, 0)
            .mem32_nonprefetchable_bar(0, 0x1_0000)
            .config_space();

        assert_eq!(
            cfg_space.bar(0),
            Some(BarInfo {
                size: 0x1_0000,
                kind: RequestKind::Memory
            })
        );
        assert_eq!(cfg_space.bar(1), None);
    }
}
