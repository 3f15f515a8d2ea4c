//! The Transfer Request Block, the 16-byte unit of communication on every
//! xHCI ring.
//!
//! The specification is available
//! [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf).

use crate::device::bus::BusDeviceRef;
use crate::device::pci::constants::xhci::rings::{
    trb_control, trb_status, trb_types, TRB_SIZE,
};

/// A raw TRB: a 64-bit parameter, a 32-bit status and a 32-bit control
/// word. The interpretation of the words depends on the TRB type encoded
/// in the control word.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Trb {
    /// The type-specific 64-bit parameter (buffer pointer, ring segment
    /// pointer, immediate data, ...).
    pub parameter: u64,
    /// The type-specific status word.
    pub status: u32,
    /// The control word: cycle bit, flags and the TRB type.
    pub control: u32,
}

/// The decoded type of a TRB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TrbType {
    Reserved,
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    Noop,
    EnableSlotCommand,
    DisableSlotCommand,
    AddressDeviceCommand,
    ConfigureEndpointCommand,
    EvaluateContextCommand,
    ResetEndpointCommand,
    StopEndpointCommand,
    SetTrDequeuePointerCommand,
    ResetDeviceCommand,
    NoopCommand,
    TransferEvent,
    CommandCompletionEvent,
    PortStatusChangeEvent,
    HostControllerEvent,
    /// Everything we do not implement, with the raw type id.
    Other(u8),
}

impl From<u8> for TrbType {
    fn from(raw: u8) -> Self {
        use trb_types::*;

        match raw {
            RESERVED => Self::Reserved,
            NORMAL => Self::Normal,
            SETUP_STAGE => Self::SetupStage,
            DATA_STAGE => Self::DataStage,
            STATUS_STAGE => Self::StatusStage,
            ISOCH => Self::Isoch,
            LINK => Self::Link,
            EVENT_DATA => Self::EventData,
            NO_OP => Self::Noop,
            ENABLE_SLOT_COMMAND => Self::EnableSlotCommand,
            DISABLE_SLOT_COMMAND => Self::DisableSlotCommand,
            ADDRESS_DEVICE_COMMAND => Self::AddressDeviceCommand,
            CONFIGURE_ENDPOINT_COMMAND => Self::ConfigureEndpointCommand,
            EVALUATE_CONTEXT_COMMAND => Self::EvaluateContextCommand,
            RESET_ENDPOINT_COMMAND => Self::ResetEndpointCommand,
            STOP_ENDPOINT_COMMAND => Self::StopEndpointCommand,
            SET_TR_DEQUEUE_POINTER_COMMAND => Self::SetTrDequeuePointerCommand,
            RESET_DEVICE_COMMAND => Self::ResetDeviceCommand,
            NO_OP_COMMAND => Self::NoopCommand,
            TRANSFER_EVENT => Self::TransferEvent,
            COMMAND_COMPLETION_EVENT => Self::CommandCompletionEvent,
            PORT_STATUS_CHANGE_EVENT => Self::PortStatusChangeEvent,
            HOST_CONTROLLER_EVENT => Self::HostControllerEvent,
            other => Self::Other(other),
        }
    }
}

impl Trb {
    /// Assemble a TRB from its three fields.
    #[must_use]
    pub const fn new(parameter: u64, status: u32, control: u32) -> Self {
        Self {
            parameter,
            status,
            control,
        }
    }

    /// Read a TRB from guest memory at `addr`.
    pub fn read_from(mem: &BusDeviceRef, addr: u64) -> Self {
        let mut bytes = [0u8; TRB_SIZE];
        mem.read_bulk(addr, &mut bytes);
        Self::from_bytes(bytes)
    }

    /// Write this TRB to guest memory at `addr`.
    pub fn write_to(&self, mem: &BusDeviceRef, addr: u64) {
        mem.write_bulk(addr, &self.to_bytes());
    }

    /// Decode the guest byte representation.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TRB_SIZE]) -> Self {
        Self {
            parameter: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            status: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            control: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }

    /// Generate the guest byte representation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TRB_SIZE] {
        let mut bytes = [0u8; TRB_SIZE];
        bytes[0..8].copy_from_slice(&self.parameter.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.status.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.control.to_le_bytes());
        bytes
    }

    /// The raw TRB type id.
    #[must_use]
    pub const fn trb_type_raw(&self) -> u8 {
        ((self.control & trb_control::TYPE_MASK) >> trb_control::TYPE_SHIFT) as u8
    }

    /// The decoded TRB type.
    #[must_use]
    pub fn trb_type(&self) -> TrbType {
        self.trb_type_raw().into()
    }

    /// The cycle bit.
    #[must_use]
    pub const fn cycle(&self) -> bool {
        self.control & trb_control::CYCLE != 0
    }

    /// Overwrite the cycle bit.
    pub fn set_cycle(&mut self, cycle: bool) {
        self.control = (self.control & !trb_control::CYCLE) | cycle as u32;
    }

    /// Toggle Cycle flag of a Link TRB.
    #[must_use]
    pub const fn toggle_cycle(&self) -> bool {
        self.control & trb_control::TC != 0
    }

    /// Interrupt On Completion flag.
    #[must_use]
    pub const fn ioc(&self) -> bool {
        self.control & trb_control::IOC != 0
    }

    /// Interrupt on Short Packet flag.
    #[must_use]
    pub const fn isp(&self) -> bool {
        self.control & trb_control::ISP != 0
    }

    /// Immediate Data flag.
    #[must_use]
    pub const fn idt(&self) -> bool {
        self.control & trb_control::IDT != 0
    }

    /// The shared BSR/Deconfigure bit of Address Device and Configure
    /// Endpoint commands.
    #[must_use]
    pub const fn bit9(&self) -> bool {
        self.control & trb_control::BIT9 != 0
    }

    /// The transfer length field of a transfer TRB.
    #[must_use]
    pub const fn transfer_length(&self) -> u32 {
        self.status & trb_status::LENGTH_MASK
    }

    /// The slot id field of commands and events.
    #[must_use]
    pub const fn slot_id(&self) -> u8 {
        (self.control >> trb_control::SLOT_SHIFT) as u8
    }

    /// The endpoint id field of endpoint commands and Transfer events.
    #[must_use]
    pub const fn endpoint_id(&self) -> u8 {
        ((self.control & trb_control::EP_MASK) >> trb_control::EP_SHIFT) as u8
    }

    /// The stream id field of a Set TR Dequeue Pointer command.
    #[must_use]
    pub const fn stream_id(&self) -> u16 {
        (self.status >> trb_status::STREAM_SHIFT) as u16
    }

    /// The completion code of an event TRB.
    #[must_use]
    pub const fn completion_code_raw(&self) -> u8 {
        (self.status >> trb_status::COMPLETION_SHIFT) as u8
    }

    /// Build a Transfer Event (xHCI 6.4.2.1).
    #[must_use]
    pub fn transfer_event(
        trb_pointer: u64,
        remainder: u32,
        code: CompletionCode,
        event_data: bool,
        slot: u8,
        epid: u8,
    ) -> Self {
        Self {
            parameter: trb_pointer,
            status: (remainder & trb_status::REM_MASK)
                | ((code as u32) << trb_status::COMPLETION_SHIFT),
            control: (u32::from(trb_types::TRANSFER_EVENT) << trb_control::TYPE_SHIFT)
                | (u32::from(slot) << trb_control::SLOT_SHIFT)
                | (u32::from(epid) << trb_control::EP_SHIFT)
                | if event_data { trb_control::ED } else { 0 },
        }
    }

    /// Build a Command Completion Event (xHCI 6.4.2.2).
    ///
    /// `command_trb_pointer` is the guest address of the command TRB this
    /// event answers and must be 16-byte aligned.
    #[must_use]
    pub fn command_completion_event(
        command_trb_pointer: u64,
        code: CompletionCode,
        slot: u8,
    ) -> Self {
        assert_eq!(
            command_trb_pointer & 0xF,
            0,
            "command TRB pointers are 16-byte aligned"
        );
        Self {
            parameter: command_trb_pointer,
            status: (code as u32) << trb_status::COMPLETION_SHIFT,
            control: (u32::from(trb_types::COMMAND_COMPLETION_EVENT) << trb_control::TYPE_SHIFT)
                | (u32::from(slot) << trb_control::SLOT_SHIFT),
        }
    }

    /// Build a Port Status Change Event (xHCI 6.4.2.3).
    #[must_use]
    pub fn port_status_change_event(port: u8) -> Self {
        Self {
            parameter: u64::from(port) << 24,
            status: (CompletionCode::Success as u32) << trb_status::COMPLETION_SHIFT,
            control: u32::from(trb_types::PORT_STATUS_CHANGE_EVENT) << trb_control::TYPE_SHIFT,
        }
    }

    /// Build a Host Controller Event carrying an error code.
    #[must_use]
    pub fn host_controller_event(code: CompletionCode) -> Self {
        Self {
            parameter: 0,
            status: (code as u32) << trb_status::COMPLETION_SHIFT,
            control: u32::from(trb_types::HOST_CONTROLLER_EVENT) << trb_control::TYPE_SHIFT,
        }
    }
}

/// The xHCI completion codes (xHCI table 6-90).
///
/// Every command yields exactly one of these in its Command Completion
/// Event; transfer completions map backend status onto them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CompletionCode {
    Invalid = 0,
    Success = 1,
    DataBufferError = 2,
    BabbleDetectedError = 3,
    UsbTransactionError = 4,
    TrbError = 5,
    StallError = 6,
    ResourceError = 7,
    BandwidthError = 8,
    NoSlotsAvailableError = 9,
    InvalidStreamTypeError = 10,
    SlotNotEnabledError = 11,
    EndpointNotEnabledError = 12,
    ShortPacket = 13,
    RingUnderrun = 14,
    RingOverrun = 15,
    VfEventRingFullError = 16,
    ParameterError = 17,
    BandwidthOverrunError = 18,
    ContextStateError = 19,
    NoPingResponseError = 20,
    EventRingFullError = 21,
    IncompatibleDeviceError = 22,
    MissedServiceError = 23,
    CommandRingStopped = 24,
    CommandAborted = 25,
    Stopped = 26,
    StoppedLengthInvalid = 27,
    MaxExitLatencyTooLargeError = 29,
    IsochBufferOverrun = 31,
    EventLostError = 32,
    UndefinedError = 33,
    InvalidStreamIdError = 34,
    SplitTransactionError = 36,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_representation_round_trips() {
        let trb = Trb::new(0x1122_3344_5566_7780, 0xAABB_CCDD, 0x0000_2401);
        assert_eq!(Trb::from_bytes(trb.to_bytes()), trb);
    }

    #[test]
    fn command_completion_event_layout() {
        let mut trb =
            Trb::command_completion_event(0x1122_3344_5566_7780, CompletionCode::Success, 2);
        trb.set_cycle(true);
        assert_eq!(
            trb.to_bytes(),
            [
                0x80, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0x00, 0x00, 0x01, 0x01,
                0x84, 0x00, 0x02,
            ],
        );
    }

    #[test]
    fn port_status_change_event_layout() {
        let mut trb = Trb::port_status_change_event(2);
        trb.set_cycle(true);
        assert_eq!(
            trb.to_bytes(),
            [
                0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x01,
                0x88, 0x00, 0x00,
            ],
        );
    }

    #[test]
    fn transfer_event_carries_slot_endpoint_and_remainder() {
        let trb = Trb::transfer_event(0x1000, 384, CompletionCode::ShortPacket, false, 1, 4);

        assert_eq!(trb.trb_type(), TrbType::TransferEvent);
        assert_eq!(trb.parameter, 0x1000);
        assert_eq!(trb.status & 0xFF_FFFF, 384);
        assert_eq!(trb.completion_code_raw(), CompletionCode::ShortPacket as u8);
        assert_eq!(trb.slot_id(), 1);
        assert_eq!(trb.endpoint_id(), 4);
    }

    #[test]
    fn control_word_flags_decode() {
        let trb = Trb::new(
            0,
            8,
            (u32::from(super::trb_types::SETUP_STAGE) << 10) | (1 << 6) | (1 << 5) | 1,
        );

        assert_eq!(trb.trb_type(), TrbType::SetupStage);
        assert!(trb.cycle());
        assert!(trb.ioc());
        assert!(trb.idt());
        assert_eq!(trb.transfer_length(), 8);
    }
}
