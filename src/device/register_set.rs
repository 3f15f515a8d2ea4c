//! # MMIO Register Abstraction
//!
//! This module helps to create device emulation that needs contiguous
//! register regions with per-bit writability, such as the PCI config space
//! or the extended-capability window of the xHCI controller.

use std::convert::TryInto;

use crate::device::bus::{Request, SingleThreadedBusDevice};

/// A builder for [`RegisterSet`] objects.
///
/// With this struct the register region can be incrementally constructed
/// and finally converted into a matching `RegisterSet` struct, whose layout
/// is immutable.
///
/// # Examples
///
/// ```
/// use xhcid::device::register_set::*;
///
/// let region: RegisterSet::<8> = RegisterSetBuilder::<8>::new()
///     .u8_ro_at(0, 0xAB)        // A completely read-only byte register at offset 0.
///     .u8_at(1, 0x10, 0x0F)     // A byte register with writable low nibble at offset 1.
///     .u16_le_rw_at(2, 0xCAFE)  // A little-endian fully writable 16-bit value.
///     .u32_le_w1c_at(4, 0xFFFF) // A 32-bit write-one-clear register, typically a status register.
///     .into();
/// ```
#[derive(Debug, Clone)]
pub struct RegisterSetBuilder<const SIZE: usize> {
    data: [u8; SIZE],
    rw_mask: [u8; SIZE],
    w1c_mask: [u8; SIZE],
}

impl<const SIZE: usize> Default for RegisterSetBuilder<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> RegisterSetBuilder<SIZE> {
    /// Initialize a builder for a fully read-only MMIO region where all
    /// bits are set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: [0xFF; SIZE],
            rw_mask: [0; SIZE],
            w1c_mask: [0; SIZE],
        }
    }

    fn init_u8(&mut self, pos: usize, value: u8, write_mask: u8, w1c_mask: u8) {
        assert!(pos < SIZE);

        self.data[pos] = value;
        self.rw_mask[pos] = write_mask;
        self.w1c_mask[pos] = w1c_mask;
    }

    fn init_u8_slice(
        &mut self,
        pos: usize,
        value_bytes: &[u8],
        write_mask_bytes: &[u8],
        w1c_mask_bytes: &[u8],
    ) {
        assert_eq!(value_bytes.len(), write_mask_bytes.len());
        assert_eq!(value_bytes.len(), w1c_mask_bytes.len());

        for offset in 0..value_bytes.len() {
            self.init_u8(
                pos + offset,
                value_bytes[offset],
                write_mask_bytes[offset],
                w1c_mask_bytes[offset],
            )
        }
    }

    fn init_u16_le(&mut self, pos: usize, value: u16, write_mask: u16, w1c_mask: u16) {
        self.init_u8_slice(
            pos,
            &value.to_le_bytes(),
            &write_mask.to_le_bytes(),
            &w1c_mask.to_le_bytes(),
        );
    }

    fn init_u32_le(&mut self, pos: usize, value: u32, write_mask: u32, w1c_mask: u32) {
        self.init_u8_slice(
            pos,
            &value.to_le_bytes(),
            &write_mask.to_le_bytes(),
            &w1c_mask.to_le_bytes(),
        );
    }

    /// Place a byte at the specified address with a mask indicating which
    /// bits are writable.
    pub fn u8_at(&mut self, pos: usize, value: u8, write_mask: u8) -> &mut Self {
        self.init_u8(pos, value, write_mask, 0);
        self
    }

    /// Place a read-only byte at the given position.
    pub fn u8_ro_at(&mut self, pos: usize, value: u8) -> &mut Self {
        self.u8_at(pos, value, 0)
    }

    /// Place a writable byte at the given position.
    pub fn u8_rw_at(&mut self, pos: usize, value: u8) -> &mut Self {
        self.u8_at(pos, value, 0xFF)
    }

    /// Place a 16-bit value at the specified address in little-endian
    /// order with a mask indicating which bits are writable.
    pub fn u16_le_at(&mut self, pos: usize, value: u16, write_mask: u16) -> &mut Self {
        self.init_u16_le(pos, value, write_mask, 0);
        self
    }

    /// Place a read-only 16-bit value at the given position in
    /// little-endian order.
    pub fn u16_le_ro_at(&mut self, pos: usize, value: u16) -> &mut Self {
        self.u16_le_at(pos, value, 0)
    }

    /// Place a writable 16-bit value at the given position in
    /// little-endian order.
    pub fn u16_le_rw_at(&mut self, pos: usize, value: u16) -> &mut Self {
        self.u16_le_at(pos, value, 0xFFFF)
    }

    /// Place a 32-bit value at the specified address in little-endian
    /// order with a mask indicating which bits are writable.
    pub fn u32_le_at(&mut self, pos: usize, value: u32, write_mask: u32) -> &mut Self {
        self.init_u32_le(pos, value, write_mask, 0);
        self
    }

    /// Place a read-only 32-bit value at the given position in
    /// little-endian order.
    pub fn u32_le_ro_at(&mut self, pos: usize, value: u32) -> &mut Self {
        self.u32_le_at(pos, value, 0)
    }

    /// Place a writable 32-bit value at the given position in
    /// little-endian order.
    pub fn u32_le_rw_at(&mut self, pos: usize, value: u32) -> &mut Self {
        self.u32_le_at(pos, value, 0xFFFF_FFFF)
    }

    /// Place a little-endian 32-bit write-one-clear (W1C) value at the
    /// given position. Bits flip to zero when they are written with a 1.
    pub fn u32_le_w1c_at(&mut self, pos: usize, value: u32) -> &mut Self {
        self.init_u32_le(pos, value, 0, 0xFFFF_FFFF);
        self
    }

    /// Place an already existing register set at the given position.
    ///
    /// This allows to compose larger register sets out of smaller ones.
    /// The newly created register set will inherit the current value and
    /// read-write attributes of the given part. The newly created register
    /// set will be completely stand-alone and modifications of its content
    /// will not be reflected in the `regs` parameter passed here or vice
    /// versa.
    pub fn register_set_at<const PART_SIZE: usize>(
        &mut self,
        pos: usize,
        regs: &RegisterSet<PART_SIZE>,
    ) -> &mut Self {
        assert!(
            PART_SIZE <= SIZE,
            "Trying to add a register set that is too large"
        );
        assert!(
            pos + PART_SIZE <= SIZE,
            "Not enough space for register set at given position"
        );

        self.data[pos..(pos + PART_SIZE)].copy_from_slice(&regs.data[..PART_SIZE]);
        self.rw_mask[pos..(pos + PART_SIZE)].copy_from_slice(&regs.rw_mask[..PART_SIZE]);
        self.w1c_mask[pos..(pos + PART_SIZE)].copy_from_slice(&regs.w1c_mask[..PART_SIZE]);

        self
    }

    /// Construct the final register set from the build instructions.
    #[must_use]
    pub fn build(&self) -> RegisterSet<SIZE> {
        Iterator::zip(self.rw_mask.iter(), self.w1c_mask.iter())
            .enumerate()
            .for_each(|(offset, (rw_mask, w1c_mask))| {
                let overlap = rw_mask & w1c_mask;
                assert_eq!(
                    overlap, 0,
                    "Writable and W1C bits overlap in register set at offset {:#x}: {:#x}",
                    offset, overlap
                );
            });

        RegisterSet {
            data: self.data,
            rw_mask: self.rw_mask,
            w1c_mask: self.w1c_mask,
        }
    }
}

/// A helper for implementing MMIO regions.
///
/// Each `RegisterSet` contains a compile-time sized memory region with
/// configurable writability.
///
/// `RegisterSets` are constructed using [`RegisterSetBuilder`].
#[derive(Debug, Clone)]
pub struct RegisterSet<const SIZE: usize> {
    data: [u8; SIZE],
    rw_mask: [u8; SIZE],
    w1c_mask: [u8; SIZE],
}

impl<const SIZE: usize> RegisterSet<SIZE> {
    /// Write the underlying register value regardless of register
    /// writability or W1C semantics.
    ///
    /// This is typically used by the device emulation logic itself to
    /// update read-only or W1C registers.
    pub fn write_direct(&mut self, req: Request, val: u64) {
        let le_bytes = val.to_le_bytes();

        for (req, &byte) in req.iter_bytes().zip(&le_bytes) {
            let off: usize = req.addr.try_into().unwrap();

            self.data[off] = byte;
        }
    }
}

impl<const SIZE: usize> From<&mut RegisterSetBuilder<SIZE>> for RegisterSet<SIZE> {
    fn from(builder: &mut RegisterSetBuilder<SIZE>) -> Self {
        builder.build()
    }
}

impl<const SIZE: usize> From<RegisterSetBuilder<SIZE>> for RegisterSet<SIZE> {
    fn from(builder: RegisterSetBuilder<SIZE>) -> Self {
        builder.build()
    }
}

/// Fold a sequence of bytes into a little-endian value.
///
/// **Note**: This function will cause a runtime error in case the iterator
/// yields more bytes than fit into an u64.
fn fold_iter_le(it: impl Iterator<Item = u8>) -> u64 {
    it.enumerate().fold(0, |acc, (pos, byte)| {
        let bytes_in_u64 = 8;
        assert!(pos < bytes_in_u64);

        let shifted_byte: u64 = u64::from(byte) << (pos * 8);
        acc | shifted_byte
    })
}

impl<const SIZE: usize> RegisterSet<SIZE> {
    /// Same as `read` from [`SingleThreadedBusDevice`], but without
    /// requiring a mutable reference.
    #[must_use]
    pub fn read(&self, req: Request) -> u64 {
        fold_iter_le(req.iter_bytes().map(|r| -> u8 {
            let off: usize = r.addr.try_into().unwrap();
            self.data[off]
        }))
    }
}

impl<const SIZE: usize> SingleThreadedBusDevice for RegisterSet<SIZE> {
    fn size(&self) -> u64 {
        SIZE.try_into().unwrap()
    }

    fn write(&mut self, req: Request, val: u64) {
        let le_bytes = val.to_le_bytes();

        for (req, &byte) in req.iter_bytes().zip(&le_bytes) {
            let off: usize = req.addr.try_into().unwrap();

            // Set writable bits to zero.
            self.data[off] &= !self.rw_mask[off];

            // Populate writable bits with new content.
            self.data[off] |= byte & self.rw_mask[off];

            // Clear all W1C bits that were written with 1.
            self.data[off] &= !(byte & self.w1c_mask[off]);
        }
    }

    fn read(&mut self, req: Request) -> u64 {
        (self as &Self).read(req)
    }
}
