//! Wrappers around the guest-resident xHCI context structures.
//!
//! Device contexts, input contexts and stream contexts are owned by the
//! guest; the controller never allocates them. These wrappers carry only a
//! guest-physical base address and copy individual fields in and out
//! through the memory bus.

use crate::device::bus::{BusDeviceRef, Request, RequestSize};
use crate::device::pci::constants::xhci::context::CONTEXT_SIZE;

/// Read access to the Device Context Base Address Array.
///
/// The DCBAA maps slot ids to device context pointers. Only the pointer
/// value is cached (the DCBAAP register); every entry lookup goes to guest
/// memory.
#[derive(Debug, Clone)]
pub struct Dcbaa {
    base: u64,
    mem: BusDeviceRef,
}

impl Dcbaa {
    /// Wrap the DCBAA at guest address `base`.
    #[must_use]
    pub const fn new(base: u64, mem: BusDeviceRef) -> Self {
        Self { base, mem }
    }

    /// The device context pointer of `slot`, or `None` when the guest has
    /// not installed one.
    #[must_use]
    pub fn device_context_addr(&self, slot: u8) -> Option<u64> {
        let addr = self.mem.read(Request::new(
            self.base + u64::from(slot) * 8,
            RequestSize::Size8,
        )) & !0x3F;

        (addr != 0).then_some(addr)
    }
}

/// A slot context in guest memory (xHCI 6.2.2).
#[derive(Debug, Clone)]
pub struct SlotContext {
    address: u64,
    mem: BusDeviceRef,
}

impl SlotContext {
    /// Wrap the slot context at guest address `address`.
    #[must_use]
    pub const fn new(address: u64, mem: BusDeviceRef) -> Self {
        Self { address, mem }
    }

    fn dword(&self, idx: u64) -> u32 {
        self.mem
            .read(Request::new(self.address + idx * 4, RequestSize::Size4)) as u32
    }

    fn set_dword(&self, idx: u64, value: u32) {
        self.mem.write(
            Request::new(self.address + idx * 4, RequestSize::Size4),
            value.into(),
        );
    }

    /// The root hub port the device is attached to (dword 1, bits
    /// 16..=23).
    #[must_use]
    pub fn root_hub_port(&self) -> u8 {
        (self.dword(1) >> 16) as u8
    }

    /// The slot state (dword 3, bits 27..=31).
    #[must_use]
    pub fn state(&self) -> u32 {
        self.dword(3) >> 27
    }

    /// Replace the slot state.
    pub fn set_state(&self, state: u32) {
        self.set_dword(3, (self.dword(3) & !(0x1F << 27)) | (state << 27));
    }

    /// Replace slot state and USB device address in one go (dword 3).
    pub fn set_state_and_address(&self, state: u32, address: u8) {
        self.set_dword(3, (state << 27) | u32::from(address));
    }

    /// Replace the context-entries count (dword 0, bits 27..=31).
    pub fn set_context_entries(&self, entries: u32) {
        self.set_dword(0, (self.dword(0) & !(0x1F << 27)) | (entries << 27));
    }

    /// Copy the context-entries count from another slot context.
    pub fn copy_context_entries(&self, other: &SlotContext) {
        self.set_context_entries(other.dword(0) >> 27);
    }

    /// Copy max exit latency (dword 1, bits 0..=15) from `other`.
    pub fn copy_max_exit_latency(&self, other: &SlotContext) {
        let latency = other.dword(1) & 0xFFFF;
        self.set_dword(1, (self.dword(1) & !0xFFFF) | latency);
    }

    /// Copy the interrupter target (dword 2, bits 22..=31) from `other`.
    pub fn copy_interrupter_target(&self, other: &SlotContext) {
        let target = other.dword(2) & (0x3FF << 22);
        self.set_dword(2, (self.dword(2) & !(0x3FF << 22)) | target);
    }

    /// Overwrite the whole context with the content of `other`.
    pub fn copy_from(&self, other: &SlotContext) {
        let mut raw = [0u8; CONTEXT_SIZE as usize];
        other.mem.read_bulk(other.address, &mut raw);
        self.mem.write_bulk(self.address, &raw);
    }
}

/// An endpoint context in guest memory (xHCI 6.2.3).
#[derive(Debug, Clone)]
pub struct EndpointContext {
    address: u64,
    mem: BusDeviceRef,
}

impl EndpointContext {
    /// Wrap the endpoint context at guest address `address`.
    #[must_use]
    pub const fn new(address: u64, mem: BusDeviceRef) -> Self {
        Self { address, mem }
    }

    fn dword(&self, idx: u64) -> u32 {
        self.mem
            .read(Request::new(self.address + idx * 4, RequestSize::Size4)) as u32
    }

    fn set_dword(&self, idx: u64, value: u32) {
        self.mem.write(
            Request::new(self.address + idx * 4, RequestSize::Size4),
            value.into(),
        );
    }

    /// The endpoint state (dword 0, bits 0..=2).
    #[must_use]
    pub fn state(&self) -> u32 {
        self.dword(0) & 0x7
    }

    /// Replace the endpoint state.
    pub fn set_state(&self, state: u32) {
        self.set_dword(0, (self.dword(0) & !0x7) | state);
    }

    /// The number of primary streams (dword 0, bits 10..=14). Zero means
    /// the endpoint uses a plain transfer ring.
    #[must_use]
    pub fn max_pstreams(&self) -> u32 {
        (self.dword(0) >> 10) & 0x1F
    }

    /// The Linear Stream Array flag (dword 0, bit 15).
    #[must_use]
    pub fn linear_stream_array(&self) -> bool {
        self.dword(0) & (1 << 15) != 0
    }

    /// The TR dequeue pointer field (dword 2/3): the ring address and the
    /// consumer cycle state.
    #[must_use]
    pub fn dequeue_pointer(&self) -> (u64, bool) {
        let raw = self
            .mem
            .read(Request::new(self.address + 8, RequestSize::Size8));
        (raw & !0xF, raw & 0x1 != 0)
    }

    /// Install a new TR dequeue pointer and consumer cycle state.
    pub fn set_dequeue_pointer(&self, ringaddr: u64, ccs: bool) {
        assert_eq!(ringaddr & 0xF, 0, "transfer rings are 16-byte aligned");
        self.mem.write(
            Request::new(self.address + 8, RequestSize::Size8),
            ringaddr | u64::from(ccs),
        );
    }

    /// Copy the max packet size (dword 1, bits 16..=31) from `other`.
    pub fn copy_max_packet_size(&self, other: &EndpointContext) {
        let mps = other.dword(1) & (0xFFFF << 16);
        self.set_dword(1, (self.dword(1) & !(0xFFFF << 16)) | mps);
    }

    /// Overwrite the whole context with the content of `other`.
    pub fn copy_from(&self, other: &EndpointContext) {
        let mut raw = [0u8; CONTEXT_SIZE as usize];
        other.mem.read_bulk(other.address, &mut raw);
        self.mem.write_bulk(self.address, &raw);
    }
}

/// A device context in guest memory: one slot context followed by 31
/// endpoint contexts.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    address: u64,
    mem: BusDeviceRef,
}

impl DeviceContext {
    /// Wrap the device context at guest address `address`.
    #[must_use]
    pub const fn new(address: u64, mem: BusDeviceRef) -> Self {
        Self { address, mem }
    }

    /// The slot context entry.
    #[must_use]
    pub fn slot(&self) -> SlotContext {
        SlotContext::new(self.address, self.mem.clone())
    }

    /// The endpoint context of endpoint id `epid` (1..=31).
    #[must_use]
    pub fn endpoint(&self, epid: u8) -> EndpointContext {
        assert!((1..=31).contains(&epid));

        EndpointContext::new(
            self.address + CONTEXT_SIZE * u64::from(epid),
            self.mem.clone(),
        )
    }
}

/// An input context in guest memory: the input control context followed by
/// a device-context-shaped payload (xHCI 6.2.5).
#[derive(Debug, Clone)]
pub struct InputContext {
    address: u64,
    mem: BusDeviceRef,
}

impl InputContext {
    /// Wrap the input context at guest address `address`.
    #[must_use]
    pub const fn new(address: u64, mem: BusDeviceRef) -> Self {
        Self { address, mem }
    }

    /// The drop-context flags (input control context dword 0).
    #[must_use]
    pub fn drop_flags(&self) -> u32 {
        self.mem.read(Request::new(self.address, RequestSize::Size4)) as u32
    }

    /// The add-context flags (input control context dword 1).
    #[must_use]
    pub fn add_flags(&self) -> u32 {
        self.mem
            .read(Request::new(self.address + 4, RequestSize::Size4)) as u32
    }

    /// The slot context of the payload.
    #[must_use]
    pub fn slot(&self) -> SlotContext {
        SlotContext::new(self.address + CONTEXT_SIZE, self.mem.clone())
    }

    /// The endpoint context of endpoint id `epid` (1..=31) of the
    /// payload.
    #[must_use]
    pub fn endpoint(&self, epid: u8) -> EndpointContext {
        assert!((1..=31).contains(&epid));

        EndpointContext::new(
            self.address + CONTEXT_SIZE * (u64::from(epid) + 1),
            self.mem.clone(),
        )
    }
}

/// A stream context in guest memory (xHCI 6.2.4.1).
#[derive(Debug, Clone)]
pub struct StreamContext {
    address: u64,
    mem: BusDeviceRef,
}

impl StreamContext {
    /// Wrap entry `stream_id` of the stream context array at `base`.
    #[must_use]
    pub const fn new(base: u64, stream_id: u16, mem: BusDeviceRef) -> Self {
        Self {
            address: base + 16 * stream_id as u64,
            mem,
        }
    }

    /// The Stream Context Type field.
    #[must_use]
    pub fn stream_context_type(&self) -> u32 {
        (self
            .mem
            .read(Request::new(self.address, RequestSize::Size8))
            >> 1) as u32
            & 0x7
    }

    /// The ring dequeue pointer and consumer cycle state of the stream.
    #[must_use]
    pub fn dequeue_pointer(&self) -> (u64, bool) {
        let raw = self.mem.read(Request::new(self.address, RequestSize::Size8));
        (raw & !0xF, raw & 0x1 != 0)
    }

    /// Install a new dequeue pointer, keeping the context type bits.
    pub fn set_dequeue_pointer(&self, ringaddr: u64, ccs: bool) {
        let raw = self.mem.read(Request::new(self.address, RequestSize::Size8));
        self.mem.write(
            Request::new(self.address, RequestSize::Size8),
            (ringaddr & !0xF) | (raw & 0xE) | u64::from(ccs),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::bus::testutils::GuestRam;
    use std::sync::Arc;

    fn guest_ram() -> BusDeviceRef {
        Arc::new(GuestRam::new(0x10000))
    }

    #[test]
    fn dcbaa_resolves_slot_entries() {
        let mem = guest_ram();
        mem.write(Request::new(0x1000 + 8, RequestSize::Size8), 0x2040);

        let dcbaa = Dcbaa::new(0x1000, mem);
        assert_eq!(dcbaa.device_context_addr(1), Some(0x2040));
        assert_eq!(dcbaa.device_context_addr(2), None);
    }

    #[test]
    fn slot_context_fields_round_trip() {
        let mem = guest_ram();
        let ctx = SlotContext::new(0x2000, mem.clone());

        // Root hub port lives in dword 1.
        mem.write(Request::new(0x2004, RequestSize::Size4), 12 << 16);
        assert_eq!(ctx.root_hub_port(), 12);

        ctx.set_state_and_address(2, 5);
        assert_eq!(ctx.state(), 2);
        assert_eq!(
            mem.read(Request::new(0x200C, RequestSize::Size4)) as u32,
            (2 << 27) | 5
        );

        ctx.set_context_entries(31);
        assert_eq!(mem.read(Request::new(0x2000, RequestSize::Size4)) as u32 >> 27, 31);
    }

    #[test]
    fn endpoint_context_dequeue_round_trips() {
        let mem = guest_ram();
        let ctx = EndpointContext::new(0x3000, mem);

        ctx.set_dequeue_pointer(0x4000, true);
        assert_eq!(ctx.dequeue_pointer(), (0x4000, true));

        ctx.set_state(2);
        assert_eq!(ctx.state(), 2);
        // The state nibble shares a dword with MaxPStreams; it must stay
        // untouched.
        assert_eq!(ctx.max_pstreams(), 0);
    }

    #[test]
    fn input_context_layout_matches_device_context_shape() {
        let mem = guest_ram();
        let input = InputContext::new(0x5000, mem.clone());

        mem.write(Request::new(0x5000, RequestSize::Size4), 0);
        mem.write(Request::new(0x5004, RequestSize::Size4), 0x3);
        assert_eq!(input.drop_flags(), 0);
        assert_eq!(input.add_flags(), 0x3);

        // Slot context starts one entry in; endpoint 1 follows it.
        mem.write(Request::new(0x5020 + 4, RequestSize::Size4), 7 << 16);
        assert_eq!(input.slot().root_hub_port(), 7);

        input.endpoint(1).set_dequeue_pointer(0x6000, false);
        assert_eq!(
            mem.read(Request::new(0x5040 + 8, RequestSize::Size8)),
            0x6000
        );
    }

    #[test]
    fn context_copies_are_byte_exact() {
        let mem = guest_ram();
        let src = EndpointContext::new(0x7000, mem.clone());
        let dst = EndpointContext::new(0x7100, mem.clone());

        mem.write_bulk(0x7000, &[0xAB; 32]);
        dst.copy_from(&src);

        let mut copied = [0u8; 32];
        mem.read_bulk(0x7100, &mut copied);
        assert_eq!(copied, [0xAB; 32]);
    }
}
