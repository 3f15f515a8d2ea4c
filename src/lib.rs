//! # xhcid
//!
//! A user-space virtual xHCI (USB 3.0) host controller. The controller is
//! served to a VMM as a PCI device and multiplexes fully emulated USB
//! devices and passed-through physical devices onto one virtual root hub.
//!
//! The crate splits into:
//!
//! - [`device`]: the VMM-agnostic emulation core (memory bus, PCI
//!   plumbing, the xHCI state machine and the USB device backends),
//! - [`xhci_backend`], [`memory_segment`], [`dynamic_bus`]: the vfio-user
//!   hosting glue that maps guest memory and delivers interrupts.

pub mod cli;
pub mod device;
pub mod dynamic_bus;
pub mod memory_segment;
pub mod xhci_backend;
