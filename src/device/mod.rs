//! # Device Emulation Code
//!
//! This module tree contains the VMM-agnostic device emulation: the memory
//! bus, the PCI plumbing, the xHCI controller core and the USB device
//! backends. It should never depend on the hosting transport or on Linux
//! specific parts; those live at the crate root.

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![allow(rustdoc::private_doc_tests)]
#![deny(clippy::must_use_candidate)]
#![deny(missing_debug_implementations)]

pub mod bus;
pub mod interrupt_line;
pub mod interval;
pub mod pci;
pub mod register_set;
pub mod usb;
