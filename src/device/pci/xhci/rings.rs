//! Ring plumbing of the controller: the event ring producer, the command
//! ring consumer and the per-endpoint transfer ring cursor.
//!
//! All rings live in guest memory; this module keeps only indices, cycle
//! state and guest addresses and re-resolves everything else per access.

use tracing::{debug, trace, warn};

use crate::device::bus::{BusDeviceRef, Request, RequestSize};
use crate::device::pci::constants::xhci::operational::crcr;
use crate::device::pci::constants::xhci::rings::event_ring::erst_entry_offsets;
use crate::device::pci::constants::xhci::rings::TRB_SIZE;

use super::trb::{CompletionCode, Trb, TrbType};

/// The dequeue position of a consumer ring: the guest address of the next
/// TRB to read and the consumer cycle state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrbRing {
    /// Guest address of the next TRB.
    pub ringaddr: u64,
    /// The consumer cycle state.
    pub ccs: bool,
}

impl TrbRing {
    /// Create a cursor at `ringaddr` with cycle state `ccs`.
    #[must_use]
    pub const fn new(ringaddr: u64, ccs: bool) -> Self {
        Self { ringaddr, ccs }
    }
}

/// The result of appending to the event ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventInsert {
    /// The event was written.
    Inserted,
    /// The ring was about to overrun; a Host Controller Event carrying
    /// `EventRingFullError` was written instead and the caller must force
    /// an interrupt.
    Overflowed,
    /// The ring is full; nothing was written.
    Full,
}

/// The producer side of the (single-segment) event ring.
///
/// The segment base and size are re-read from the guest's ERST entry on
/// every append; only the enqueue index, the number of in-flight events
/// and the producer cycle state are controller state.
#[derive(Debug, Default, Clone)]
pub struct EventRing {
    enq_idx: u32,
    events_cnt: u32,
    pcs: bool,
}

impl EventRing {
    /// Reset the producer to the beginning of a fresh ring.
    ///
    /// Call this for controller reset and whenever the guest installs a
    /// new segment table.
    pub fn reset(&mut self) {
        self.enq_idx = 0;
        self.events_cnt = 0;
        self.pcs = true;
    }

    /// The current producer cycle state.
    #[must_use]
    pub const fn cycle_state(&self) -> bool {
        self.pcs
    }

    /// The current enqueue index within the segment.
    #[must_use]
    pub const fn enqueue_index(&self) -> u32 {
        self.enq_idx
    }

    /// The number of events the guest has not consumed yet.
    #[must_use]
    pub const fn in_flight(&self) -> u32 {
        self.events_cnt
    }

    /// Resolve the single ERST entry: segment base address and size in
    /// TRBs.
    fn erst_entry(mem: &BusDeviceRef, erstba: u64) -> (u64, u32) {
        let base = mem.read(Request::new(
            erstba + erst_entry_offsets::BASE_ADDR,
            RequestSize::Size8,
        )) & !0x3F;
        let size = mem.read(Request::new(
            erstba + erst_entry_offsets::SIZE,
            RequestSize::Size4,
        )) as u32
            & 0xFFFF;

        (base, size)
    }

    /// Append an event TRB.
    ///
    /// The cycle bit of `trb` is overwritten with the producer cycle
    /// state. The last free slot is used for the synthetic overflow
    /// event: appending event number `size` yields
    /// [`EventInsert::Overflowed`].
    pub fn insert(&mut self, mem: &BusDeviceRef, erstba: u64, trb: &Trb) -> EventInsert {
        let (base, size) = Self::erst_entry(mem, erstba);
        if size == 0 {
            warn!("event ring segment with zero size, dropping event");
            return EventInsert::Full;
        }

        if self.events_cnt >= size {
            warn!("cannot insert event; ring full");
            return EventInsert::Full;
        }

        if self.events_cnt == size - 1 {
            // The guest has not advanced ERDP and we are down to the last
            // slot: report the overrun instead of the caller's event,
            // which is lost.
            warn!("event ring overrun, reporting host controller event");

            let mut errev = Trb::host_controller_event(CompletionCode::EventRingFullError);
            errev.set_cycle(self.pcs);
            errev.write_to(mem, base + u64::from(self.enq_idx) * TRB_SIZE as u64);

            self.events_cnt += 1;
            self.advance(size);
            return EventInsert::Overflowed;
        }

        let mut trb = *trb;
        trb.set_cycle(self.pcs);
        trb.write_to(mem, base + u64::from(self.enq_idx) * TRB_SIZE as u64);

        self.events_cnt += 1;
        self.advance(size);

        trace!(
            "inserted event at index {}, {} in flight, pcs {}",
            self.enq_idx,
            self.events_cnt,
            self.pcs as u8
        );

        EventInsert::Inserted
    }

    fn advance(&mut self, size: u32) {
        self.enq_idx = (self.enq_idx + 1) % size;
        if self.enq_idx == 0 {
            self.pcs = !self.pcs;
        }
    }

    /// Recompute the number of in-flight events after the guest moved
    /// ERDP.
    pub fn update_dequeue(&mut self, mem: &BusDeviceRef, erstba: u64, erdp: u64) {
        if self.events_cnt == 0 {
            return;
        }

        let (base, size) = Self::erst_entry(mem, erstba);
        if size == 0 {
            return;
        }

        let erdp_idx = ((erdp & !0xF).wrapping_sub(base) / TRB_SIZE as u64) as u32 % size;

        self.events_cnt = if erdp_idx <= self.enq_idx {
            self.enq_idx - erdp_idx
        } else {
            size - (erdp_idx - self.enq_idx)
        };

        debug!(
            "guest consumed events up to index {}, {} in flight",
            erdp_idx, self.events_cnt
        );
    }
}

/// The consumer side of the command ring.
#[derive(Debug, Default, Clone)]
pub struct CommandRing {
    /// Whether the command ring is running (CRCR.CRR).
    running: bool,
    /// The dequeue pointer: guest address of the next command TRB.
    dequeue_pointer: u64,
    /// The controller's consumer cycle state.
    cycle_state: bool,
}

impl CommandRing {
    /// Handle a write to the low half of the CRCR register.
    ///
    /// While the ring is running, only the stop/abort bits are honored
    /// (and recorded without aborting anything, as command abort is not
    /// needed by the guests we serve). While stopped, the write installs
    /// the dequeue pointer and the consumer cycle state.
    pub fn control_lo(&mut self, value: u64) {
        if self.running {
            if value & (crcr::CA | crcr::CS) != 0 {
                debug!("guest requests command ring stop/abort");
            } else {
                warn!("ignoring CRCR write while command ring runs: {value:#x}");
            }
        } else {
            self.dequeue_pointer =
                (self.dequeue_pointer & !0xFFFF_FFFFu64) | (value & 0xFFFF_FFC0);
            self.cycle_state = value & crcr::RCS != 0;
            debug!(
                "command ring dequeue (lo) {:#x}, cs {}",
                self.dequeue_pointer, self.cycle_state as u8
            );
        }
    }

    /// Handle a write to the high half of the CRCR register.
    pub fn control_hi(&mut self, value: u64) {
        if !self.running {
            self.dequeue_pointer = (self.dequeue_pointer & 0xFFFF_FFFF) | (value << 32);
            debug!("command ring dequeue (hi) {:#x}", self.dequeue_pointer);
        }
    }

    /// The value the guest sees when reading CRCR: everything is zero
    /// except the ring-running bit.
    #[must_use]
    pub const fn status(&self) -> u64 {
        if self.running {
            crcr::CRR
        } else {
            0
        }
    }

    /// Mark the ring as running while commands are consumed.
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// The current dequeue pointer.
    #[must_use]
    pub const fn dequeue_pointer(&self) -> u64 {
        self.dequeue_pointer
    }

    /// The current consumer cycle state.
    #[must_use]
    pub const fn cycle_state(&self) -> bool {
        self.cycle_state
    }

    /// Clear all state, for controller reset.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fetch the next fresh command TRB, following Link TRBs.
    ///
    /// Returns the guest address of the TRB and the TRB itself, with the
    /// dequeue pointer advanced past it. Returns `None` on a cycle-bit
    /// mismatch, leaving the dequeue pointer at the first unconsumed TRB.
    pub fn next_command_trb(&mut self, mem: &BusDeviceRef) -> Option<(u64, Trb)> {
        // A Link TRB loop in a malicious command ring must not hang the
        // vCPU; bail out after a generous number of hops.
        for _ in 0..64 {
            let trb = Trb::read_from(mem, self.dequeue_pointer);

            if trb.cycle() != self.cycle_state {
                return None;
            }

            if trb.trb_type() == TrbType::Link {
                if trb.toggle_cycle() {
                    self.cycle_state = !self.cycle_state;
                }
                self.dequeue_pointer = trb.parameter & !0xF;
                continue;
            }

            let trb_address = self.dequeue_pointer;
            self.dequeue_pointer += TRB_SIZE as u64;
            return Some((trb_address, trb));
        }

        warn!("giving up on command ring full of link TRBs");
        None
    }
}
