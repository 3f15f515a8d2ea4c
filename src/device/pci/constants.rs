//! # PCI and xHCI Constants
//!
//! This module collects PCI configuration space constants and the xHCI MMIO
//! register layout. PCI definitions are derived from the PCI Local Bus and
//! PCI Express Base specifications; xHCI definitions follow the eXtensible
//! Host Controller Interface specification, revision 1.1.

// Allow missing docs to avoid duplicating the specs for all constants.
#![allow(missing_docs)]
// Allow unused constants that might come in handy at some point.
#![allow(unused)]

/// Constants related to the configuration space.
pub mod config_space {

    /// The config space size of a single PCI device in bytes.
    pub const SIZE: usize = 256;

    /// The maximum number of Base Address Registers (BARs) per device.
    pub const MAX_BARS: usize = 6;

    /// Masks for various configuration space fields.
    pub mod mask {
        pub const CAPABILITIES_POINTER: u8 = 0xfc;
        pub const MMIO_BAR_TYPE: u64 = 0x6;
        pub const MMIO_BAR_64_BIT: u64 = 0x4;
        pub const MMIO_BAR_ADDRESS: u64 = 0xffff_fff0;
    }

    /// The offsets of various fields in the configuration space.
    pub mod offset {
        pub const VENDOR: usize = 0x0;
        pub const DEVICE: usize = 0x2;
        pub const COMMAND: usize = 0x4;
        pub const STATUS: usize = 0x6;
        pub const REVISION: usize = 0x8;
        pub const PROG_IF: usize = 0x9;
        pub const SUBCLASS: usize = 0xA;
        pub const CLASS: usize = 0xB;
        pub const CACHE_LINE_SIZE: usize = 0xC;
        pub const LATENCY_TIMER: usize = 0xD;
        pub const HEADER_TYPE: usize = 0xE;
        pub const BIST: usize = 0xF;

        pub const BAR_0: usize = 0x10;
        pub const BAR_1: usize = 0x14;
        pub const BAR_2: usize = 0x18;
        pub const BAR_3: usize = 0x1C;
        pub const BAR_4: usize = 0x20;
        pub const BAR_5: usize = 0x24;

        pub const SUBSYSTEM_VENDOR_ID: usize = 0x2C;
        pub const SUBSYSTEM_ID: usize = 0x2E;
        pub const ROM_BAR: usize = 0x30;
        pub const CAPABILITIES_POINTER: usize = 0x34;
        pub const IRQ_LINE: usize = 0x3C;
        pub const IRQ_PIN: usize = 0x3D;
        pub const MIN_GNT: usize = 0x3E;
        pub const MAX_LAT: usize = 0x3F;

        /// USB revision byte as defined for serial bus controllers.
        pub const USB_REVISION: usize = 0x60;
    }

    /// The device vendor.
    pub mod vendor {
        pub const INVALID: u16 = 0xFFFF;
        pub const INTEL: u16 = 0x8086;
        pub const REDHAT: u16 = 0x1b36;
    }

    pub mod device {
        pub const INVALID: u16 = 0xFFFF;
        pub const REDHAT_XHCI: u16 = 0x000d;

        /// The Intel Apollo Lake xHCI, used for the dual-role capability
        /// profile.
        pub const INTEL_APL_XHCI: u16 = 0x5aa8;
    }

    /// Command Register Constants.
    pub mod command {
        pub const WRITABLE_BITS: u16 = 0x077F;
    }

    /// Status Register Constants.
    pub mod status {
        /// The device has a list of capabilities starting at
        /// [`CAPABILITIES_POINTER`](super::offset::CAPABILITIES_POINTER).
        pub const CAPABILITIES: u16 = 1 << 4;
    }

    /// PCI class constants.
    pub mod class {
        pub const SERIAL: u8 = 0xc;
        pub const UNASSIGNED: u8 = 0xFF;
    }

    /// PCI sub-class constants.
    pub mod subclass {
        pub const SERIAL_USB: u8 = 0x03;
        pub const UNASSIGNED: u8 = 0xFF;
    }

    /// PCI programming interface constants.
    pub mod progif {
        pub const USB_XHCI: u8 = 0x30;
    }

    /// USB revision values for the USB_REVISION config byte.
    pub mod usb_revision {
        pub const USB_3_0: u8 = 0x30;
    }

    /// PCI header type.
    ///
    /// This is usually type 0, except for PCI-to-PCI bridges and other
    /// exotic devices such as Cardbus bridges.
    pub mod header_type {
        pub const TYPE_00: u8 = 0;
        pub const MULTIFUNCTION: u8 = 1 << 7;
    }

    /// IDs for PCI Capabilities.
    pub mod capability_id {
        pub const MSI: u8 = 0x05;
        pub const VENDOR_SPECIFIC: u8 = 0x09;
    }

    /// Constants for the MSI capability.
    pub mod msi {
        /// Size of the capability body (without the generic header) in
        /// bytes, for the 64-bit address variant without per-vector
        /// masking.
        pub const BODY_SIZE: usize = 12;

        /// The offset of the message control register within the body.
        pub const CONTROL: u64 = 0;
        /// The offset of the lower address part within the body.
        pub const ADDRESS_LOW: u64 = 2;
        /// The offset of the high address part of a 64 bit address.
        pub const ADDRESS_HIGH: u64 = 6;
        /// The offset of the data field within the body.
        pub const DATA: u64 = 10;

        /// Constants for the Control field.
        pub mod control {
            pub const ENABLE: u16 = 1 << 0;
            /// 64-bit address capable.
            pub const CAP_64BIT: u16 = 1 << 7;

            pub const WRITABLE_BITS: u16 = ENABLE;
        }
    }
}

/// Constants related to the xHCI MMIO space.
pub mod xhci {

    /// Offset of the operational register space (CAPLENGTH).
    pub const CAPLEN: u64 = 0x20;
    /// Number of root hub ports (half USB3, half USB2).
    pub const MAX_DEVS: u64 = 20;
    /// Maximum number of supported interrupter register sets.
    pub const MAX_INTRS: u64 = 1;
    /// Maximum number of supported device slots.
    pub const MAX_SLOTS: u64 = 64;
    /// Maximum number of primary streams per endpoint (MaxPSA).
    pub const STREAMS_MAX: u64 = 1;

    /// Number of entries in the native-port binding table. Sized for all
    /// root hub ports plus external-hub children.
    pub const NATIVE_PORTS_MAX: usize = 40;

    /// The deepest supported chain of hubs in a physical device path.
    pub const USB_MAX_TIERS: usize = 7;

    /// Start of the port register sets relative to the operational base.
    pub const PORTREGS_START: u64 = 0x400;
    /// The size of one port register set in bytes.
    pub const PORTREGS_SETSZ: u64 = 0x10;

    /// Doorbell array offset. Placed directly after the port register
    /// block; already 32-bit aligned.
    pub const DBOFF: u64 = CAPLEN + PORTREGS_START + MAX_DEVS * PORTREGS_SETSZ;
    /// Runtime register offset. Placed after the doorbell array, 32-byte
    /// aligned.
    pub const RTSOFF: u64 = (DBOFF + (MAX_SLOTS + 1) * 4 + 0x1F) & !0x1F;
    /// Start of the extended-capability register window.
    pub const EXCAPOFF: u64 = 0x8000;

    /// Offsets of various fields from the start of the xHCI MMIO region.
    pub mod offset {
        use super::CAPLEN;

        /// Capability Register Offsets
        pub const CAPLENGTH: u64 = 0x0;
        pub const HCIVERSION: u64 = 0x2;
        pub const HCSPARAMS1: u64 = 0x4;
        pub const HCSPARAMS2: u64 = 0x8;
        pub const HCSPARAMS3: u64 = 0xc;
        pub const HCCPARAMS1: u64 = 0x10;
        pub const DBOFF: u64 = 0x14;
        pub const RTSOFF: u64 = 0x18;
        pub const HCCPARAMS2: u64 = 0x1c;

        /// Operational Register Offsets, relative to the operational base.
        pub const USBCMD: u64 = 0x0;
        pub const USBSTS: u64 = 0x4;
        pub const PAGESIZE: u64 = 0x8;
        pub const DNCTRL: u64 = 0x14;
        pub const CRCR_LO: u64 = 0x18;
        pub const CRCR_HI: u64 = 0x1c;
        pub const DCBAAP_LO: u64 = 0x30;
        pub const DCBAAP_HI: u64 = 0x34;
        pub const CONFIG: u64 = 0x38;

        /// Runtime Register Offsets, relative to RTSOFF.
        pub const MFINDEX: u64 = 0x0;
        /// Interrupter register set 0, relative to RTSOFF.
        pub const IR0: u64 = 0x20;

        pub const IMAN: u64 = 0x0;
        pub const IMOD: u64 = 0x4;
        pub const ERSTSZ: u64 = 0x8;
        pub const ERSTBA_LO: u64 = 0x10;
        pub const ERSTBA_HI: u64 = 0x14;
        pub const ERDP_LO: u64 = 0x18;
        pub const ERDP_HI: u64 = 0x1c;
    }

    /// Constants for the capability registers.
    pub mod capability {
        use super::{CAPLEN, EXCAPOFF, MAX_DEVS, MAX_INTRS, MAX_SLOTS, STREAMS_MAX};

        /// We emulate version 1.0.0 of the xHCI spec.
        pub const HCIVERSION: u32 = 0x0100;
        /// CAPLENGTH and HCIVERSION share a register.
        pub const CAPLENGTH: u32 = (HCIVERSION << 16) | CAPLEN as u32;

        pub const HCSPARAMS1: u32 =
            ((MAX_DEVS as u32) << 24) | ((MAX_INTRS as u32) << 8) | MAX_SLOTS as u32;
        /// IST = 4 microframes; ERST-MAX = 0 (single segment).
        pub const HCSPARAMS2: u32 = 0x04;
        pub const HCSPARAMS3: u32 = 0;
        /// NSS (no secondary streams), SPC (stopped short packet),
        /// MaxPSA, and the extended-capability pointer in 32-bit words.
        pub const HCCPARAMS1: u32 = ((EXCAPOFF as u32 >> 2) << 16)
            | ((STREAMS_MAX as u32) << 12)
            | (1 << 9)
            | (1 << 7);
        /// LEC (large ESIT capable) and U3C (U3 entry capable).
        pub const HCCPARAMS2: u32 = (1 << 4) | 1;
    }

    /// Constants for the operational registers.
    pub mod operational {
        pub mod usbcmd {
            pub const RS: u32 = 1 << 0;
            pub const HCRST: u32 = 1 << 1;
            pub const INTE: u32 = 1 << 2;
            pub const HSEE: u32 = 1 << 3;
            pub const CSS: u32 = 1 << 8;
            pub const CRS: u32 = 1 << 9;
            pub const EWE: u32 = 1 << 10;

            /// Bits a guest write can touch.
            pub const WRITABLE_BITS: u32 = 0x3F0F;
        }

        pub mod usbsts {
            pub const HCH: u32 = 1 << 0;
            pub const HSE: u32 = 1 << 2;
            pub const EINT: u32 = 1 << 3;
            pub const PCD: u32 = 1 << 4;
            pub const SSS: u32 = 1 << 8;
            pub const RSS: u32 = 1 << 9;
            pub const SRE: u32 = 1 << 10;
            pub const CNR: u32 = 1 << 11;
            pub const HCE: u32 = 1 << 12;

            /// Write-one-to-clear bits.
            pub const W1C_BITS: u32 = HSE | EINT | PCD | SSS | RSS | SRE | CNR;
        }

        pub mod crcr {
            pub const RCS: u64 = 1 << 0;
            pub const CS: u64 = 1 << 1;
            pub const CA: u64 = 1 << 2;
            pub const CRR: u64 = 1 << 3;
            pub const DEQUEUE_POINTER_MASK: u64 = !0x3f;
        }

        pub mod portsc {
            pub const CCS: u32 = 1 << 0;
            pub const PED: u32 = 1 << 1;
            pub const OCA: u32 = 1 << 3;
            pub const PR: u32 = 1 << 4;

            pub const PLS_SHIFT: u32 = 5;
            pub const PLS_MASK: u32 = 0xF << PLS_SHIFT;

            pub const PP: u32 = 1 << 9;

            pub const SPEED_SHIFT: u32 = 10;
            pub const SPEED_MASK: u32 = 0xF << SPEED_SHIFT;

            pub const PIC_SHIFT: u32 = 14;
            pub const PIC_MASK: u32 = 0x3 << PIC_SHIFT;

            pub const LWS: u32 = 1 << 16;
            pub const CSC: u32 = 1 << 17;
            pub const PEC: u32 = 1 << 18;
            pub const WRC: u32 = 1 << 19;
            pub const OCC: u32 = 1 << 20;
            pub const PRC: u32 = 1 << 21;
            pub const PLC: u32 = 1 << 22;
            pub const CEC: u32 = 1 << 23;
            pub const CAS: u32 = 1 << 24;
            pub const WCE: u32 = 1 << 25;
            pub const WDE: u32 = 1 << 26;
            pub const WOE: u32 = 1 << 27;
            pub const DR: u32 = 1 << 30;
            pub const WPR: u32 = 1u32 << 31;

            /// The sticky change bits, cleared by write-one-to-clear.
            pub const CHANGE_BITS: u32 = CSC | PEC | WRC | OCC | PRC | PLC | CEC | CAS;

            /// Port link state values.
            pub mod pls {
                pub const U0: u32 = 0;
                pub const U3: u32 = 3;
                pub const RX_DETECT: u32 = 5;
                pub const RESUME: u32 = 15;
            }
        }

        /// PAGESIZE register value: 4 KiB pages.
        pub const PAGESIZE_4K: u32 = 0x1;
    }

    /// Constants for the runtime registers.
    pub mod runtime {
        pub mod iman {
            pub const IP: u32 = 1 << 0;
            pub const IE: u32 = 1 << 1;
        }

        pub mod erdp {
            /// Event Handler Busy.
            pub const EHB: u64 = 1 << 3;
            /// Dequeue ERST segment index.
            pub const DESI_MASK: u64 = 0x7;
            pub const POINTER_MASK: u64 = !0xF;
        }

        /// The default minimum interrupt interval of ~1ms (4000 * 250ns).
        pub const IMOD_DEFAULT: u32 = 4000;

        /// One MFINDEX tick is 125 microseconds.
        pub const MICROFRAME_US: u64 = 125;
        /// MFINDEX is a 14-bit counter.
        pub const MFINDEX_BITS: u32 = 14;
    }

    /// Constants for doorbell register values.
    pub mod doorbell {
        /// The doorbell target (endpoint id for device doorbells).
        pub const TARGET_MASK: u32 = 0xFF;
        /// The stream id lives in the upper half of the doorbell value.
        pub const STREAM_SHIFT: u32 = 16;
    }

    /// Constants for the rings.
    pub mod rings {
        /// A TRB is always 16 bytes.
        pub const TRB_SIZE: usize = 16;

        /// The identifiers of transfer request blocks.
        pub mod trb_types {
            pub const RESERVED: u8 = 0;
            pub const NORMAL: u8 = 1;
            pub const SETUP_STAGE: u8 = 2;
            pub const DATA_STAGE: u8 = 3;
            pub const STATUS_STAGE: u8 = 4;
            pub const ISOCH: u8 = 5;
            pub const LINK: u8 = 6;
            pub const EVENT_DATA: u8 = 7;
            pub const NO_OP: u8 = 8;

            pub const ENABLE_SLOT_COMMAND: u8 = 9;
            pub const DISABLE_SLOT_COMMAND: u8 = 10;
            pub const ADDRESS_DEVICE_COMMAND: u8 = 11;
            pub const CONFIGURE_ENDPOINT_COMMAND: u8 = 12;
            pub const EVALUATE_CONTEXT_COMMAND: u8 = 13;
            pub const RESET_ENDPOINT_COMMAND: u8 = 14;
            pub const STOP_ENDPOINT_COMMAND: u8 = 15;
            pub const SET_TR_DEQUEUE_POINTER_COMMAND: u8 = 16;
            pub const RESET_DEVICE_COMMAND: u8 = 17;
            pub const FORCE_EVENT_COMMAND: u8 = 18;
            pub const NEGOTIATE_BANDWIDTH_COMMAND: u8 = 19;
            pub const SET_LATENCY_TOLERANCE_VALUE_COMMAND: u8 = 20;
            pub const GET_PORT_BANDWIDTH_COMMAND: u8 = 21;
            pub const FORCE_HEADER_COMMAND: u8 = 22;
            pub const NO_OP_COMMAND: u8 = 23;

            pub const TRANSFER_EVENT: u8 = 32;
            pub const COMMAND_COMPLETION_EVENT: u8 = 33;
            pub const PORT_STATUS_CHANGE_EVENT: u8 = 34;
            pub const BANDWIDTH_REQUEST_EVENT: u8 = 35;
            pub const DOORBELL_EVENT: u8 = 36;
            pub const HOST_CONTROLLER_EVENT: u8 = 37;
            pub const DEVICE_NOTIFICATION_EVENT: u8 = 38;
            pub const MFINDEX_WRAP_EVENT: u8 = 39;
        }

        /// Bits of the TRB control word.
        pub mod trb_control {
            pub const CYCLE: u32 = 1 << 0;
            /// Toggle Cycle; only valid on Link TRBs.
            pub const TC: u32 = 1 << 1;
            /// Event Data flag on Transfer Event TRBs.
            pub const ED: u32 = 1 << 2;
            /// Interrupt on Short Packet.
            pub const ISP: u32 = 1 << 2;
            /// Interrupt On Completion.
            pub const IOC: u32 = 1 << 5;
            /// Immediate Data.
            pub const IDT: u32 = 1 << 6;
            /// Block Set Address Request (Address Device Command) and
            /// Deconfigure (Configure Endpoint Command) share this bit.
            pub const BIT9: u32 = 1 << 9;

            pub const TYPE_SHIFT: u32 = 10;
            pub const TYPE_MASK: u32 = 0x3F << TYPE_SHIFT;

            pub const EP_SHIFT: u32 = 16;
            pub const EP_MASK: u32 = 0x1F << EP_SHIFT;

            pub const SLOT_SHIFT: u32 = 24;
        }

        /// Bits of the TRB status word.
        pub mod trb_status {
            /// Transfer length of a transfer TRB.
            pub const LENGTH_MASK: u32 = 0x1FFFF;
            /// Remaining-bytes field of a Transfer Event.
            pub const REM_MASK: u32 = 0xFF_FFFF;
            /// Event completion code lives in the top byte.
            pub const COMPLETION_SHIFT: u32 = 24;
            /// Stream id of a transfer TRB status word.
            pub const STREAM_SHIFT: u32 = 16;
        }

        /// Constants specific to the event ring.
        pub mod event_ring {
            /// The offsets to fields in Event Ring Segment Table Entries.
            pub mod erst_entry_offsets {
                pub const BASE_ADDR: u64 = 0;
                pub const SIZE: u64 = 8;
            }
        }
    }

    /// Constants for the guest-resident device contexts.
    pub mod context {
        /// Both slot and endpoint contexts are 32 bytes (CSZ=0).
        pub const CONTEXT_SIZE: u64 = 32;

        /// Slot states, stored in bits 27..=31 of the fourth slot context
        /// dword.
        pub mod slot_state {
            pub const DISABLED_ENABLED: u32 = 0;
            pub const DEFAULT: u32 = 1;
            pub const ADDRESSED: u32 = 2;
            pub const CONFIGURED: u32 = 3;
        }

        /// Endpoint states, stored in bits 0..=2 of the first endpoint
        /// context dword.
        pub mod ep_state {
            pub const DISABLED: u32 = 0;
            pub const RUNNING: u32 = 1;
            pub const HALTED: u32 = 2;
            pub const STOPPED: u32 = 3;
            pub const ERROR: u32 = 4;
        }
    }

    /// Constants for the extended capability window.
    pub mod extended {
        /// Capability id of a Supported Protocol capability.
        pub const CAP_ID_SUPPORTED_PROTOCOL: u8 = 2;
        /// Capability id of the vendor-defined Dual-Role-Device
        /// capability.
        pub const CAP_ID_VENDOR_DRD: u8 = 192;

        /// Dual-role configuration register bits. The values are
        /// controller specific.
        pub mod drd {
            /// Software controls the ID pin.
            pub const CFG0_IDPIN_EN: u32 = 1 << 21;
            /// ID pin value; 0 selects host mode, 1 selects device mode.
            pub const CFG0_IDPIN: u32 = 1 << 20;
            /// Status bit reflecting the currently selected host mode.
            pub const CFG1_HOST_MODE: u32 = 1 << 24;
        }
    }
}

/// Limits of the USB data transfer model.
pub mod usb {
    /// Maximum number of blocks a single USB data transfer can carry.
    pub const USB_MAX_XFER_BLOCKS: usize = 64;
}
