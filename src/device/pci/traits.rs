//! # PCI Core Traits
//!
//! This module contains the core traits for PCI emulation. See
//! [`PciDevice`].

use std::fmt::Debug;

use crate::device::bus::Request;

use super::config_space::BarInfo;

/// The type of I/O region request for a PCI device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A legacy x86 port I/O request. Usually made via `IN` or `OUT`
    /// instructions.
    PortIO,

    /// A MMIO request.
    Memory,
}

/// The interface a device has to implement to be served to a VMM.
///
/// PCI devices have to respond to requests in two address spaces: the PCI
/// Configuration Space and the I/O regions described by their Base Address
/// Registers (BARs). Configuration Space requests are always answered; I/O
/// requests arrive relative to the BAR region they hit.
pub trait PciDevice: Debug {
    /// Write to the PCI Configuration Space of the device.
    ///
    /// # Parameters
    ///
    /// - `req`: The address and size of the request.
    /// - `value`: The value to be written.
    fn write_cfg(&self, req: Request, value: u64);

    /// Read from the PCI Configuration Space of the device.
    ///
    /// # Parameters
    ///
    /// - `req`: The address and size of the request.
    fn read_cfg(&self, req: Request) -> u64;

    /// Write a value to an I/O region.
    ///
    /// # Parameters
    ///
    /// - `region`: The index of the BAR the request hits.
    /// - `req`: The offset and size of the request, relative to the
    ///   beginning of the region.
    /// - `value`: The value to be written.
    fn write_io(&self, region: u32, req: Request, value: u64);

    /// Read a value from an I/O region.
    ///
    /// # Parameters
    ///
    /// - `region`: The index of the BAR the request hits.
    /// - `req`: The offset and size of the request, relative to the
    ///   beginning of the region.
    fn read_io(&self, region: u32, req: Request) -> u64;

    /// Retrieve information about a specific BAR, if it is implemented.
    fn bar(&self, bar_no: u8) -> Option<BarInfo>;
}
