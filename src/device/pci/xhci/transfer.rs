//! The transfer engine: doorbell-driven transfer ring consumption, backend
//! submission and completion-event production.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::device::pci::constants::xhci::context::ep_state;
use crate::device::pci::constants::xhci::rings::TRB_SIZE;
use crate::device::usb::{
    BlockState, Direction, UsbDeviceKind, UsbRequest, UsbStatus, Xfer, XferBuf,
};

use super::context::DeviceContext;
use super::rings::TrbRing;
use super::trb::{CompletionCode, Trb, TrbType};
use super::{EndpointRing, XhciController};

/// Map a backend status onto the xHCI completion code reported to the
/// guest.
const fn map_usb_status(status: UsbStatus) -> CompletionCode {
    match status {
        UsbStatus::Completed | UsbStatus::Nak => CompletionCode::Success,
        UsbStatus::ShortXfer => CompletionCode::ShortPacket,
        UsbStatus::Stalled => CompletionCode::StallError,
        UsbStatus::Timeout | UsbStatus::IoError => CompletionCode::UsbTransactionError,
        UsbStatus::BadBufferSize => CompletionCode::BabbleDetectedError,
        UsbStatus::Stopped => CompletionCode::Stopped,
        UsbStatus::NotStarted => CompletionCode::EndpointNotEnabledError,
    }
}

impl XhciController {
    /// The shared transfer state of an endpoint, if the endpoint is set
    /// up.
    pub(super) fn endpoint_xfer(&self, slot: u8, epid: u8) -> Option<Arc<Mutex<Xfer>>> {
        self.slots
            .get(usize::from(slot))?
            .as_ref()?
            .eps
            .get(usize::from(epid))?
            .as_ref()
            .map(|ep| ep.xfer.clone())
    }

    /// A guest doorbell for `(slot, epid)`, stream `streamid`.
    pub(super) fn device_doorbell(&mut self, slot: u8, epid: u8, streamid: u16) {
        debug!("doorbell slot {slot} epid {epid} stream {streamid}");

        if !self.slot_valid(slot) || !(1..=31).contains(&epid) {
            warn!("doorbell for invalid slot {slot}/endpoint {epid}");
            return;
        }

        let Some(dev_ctx) = self.device_context(slot) else {
            warn!("doorbell without device context for slot {slot}");
            return;
        };
        let ep_ctx = dev_ctx.endpoint(epid);
        if ep_ctx.dequeue_pointer().0 == 0 {
            return;
        }

        let Some(xfer_arc) = self.endpoint_xfer(slot, epid) else {
            warn!("doorbell for disabled endpoint {epid} of slot {slot}");
            return;
        };

        // A static device with outstanding blocks was NAKed earlier; give
        // it another chance before consuming new TRBs.
        let is_static = {
            let slot_entry = self.slots[usize::from(slot)].as_ref().unwrap();
            slot_entry.dev.kind() == UsbDeviceKind::Static
        };
        {
            let mut xfer = xfer_arc.lock().unwrap();
            if is_static && !xfer.is_empty() {
                self.try_usb_xfer(&mut xfer, slot, epid);
                return;
            }
        }

        // Start of a fresh transfer: pick up the ring cursor, from the
        // stream record if streams are active.
        let cursor = {
            let slot_entry = self.slots[usize::from(slot)].as_ref().unwrap();
            let Some(ep) = slot_entry.eps[usize::from(epid)].as_ref() else {
                return;
            };
            match &ep.ring {
                EndpointRing::Single(ring) => *ring,
                EndpointRing::Streams { rings, .. } => {
                    let Some(ring) = rings.get(usize::from(streamid)) else {
                        warn!("doorbell for invalid stream {streamid}");
                        return;
                    };
                    *ring
                }
            }
        };

        let first = Trb::read_from(&self.dma_bus.clone(), cursor.ringaddr);
        if first.trb_type() == TrbType::Reserved {
            debug!("transfer ring of endpoint {epid} holds no work");
            return;
        }

        let mut xfer = xfer_arc.lock().unwrap();
        self.handle_transfer(&mut xfer, slot, epid, streamid, cursor);
    }

    /// Walk the transfer ring, build the transfer and hand it to the
    /// backend.
    fn handle_transfer(
        &mut self,
        xfer: &mut Xfer,
        slot: u8,
        epid: u8,
        streamid: u16,
        mut cursor: TrbRing,
    ) {
        let mem = self.dma_bus.clone();

        if let Some(dev_ctx) = self.device_context(slot) {
            dev_ctx.endpoint(epid).set_state(ep_state::RUNNING);
        }

        'next_td: loop {
            let mut submit = false;
            let mut setup_pending = false;
            let mut abort = None;

            loop {
                let trb = Trb::read_from(&mem, cursor.ringaddr);
                trace!(
                    "transfer trb at {:#x}: type {:?} flags {:#x}",
                    cursor.ringaddr,
                    trb.trb_type(),
                    trb.control
                );

                let is_link = trb.trb_type() == TrbType::Link;
                if !is_link && trb.cycle() != cursor.ccs {
                    break;
                }

                let trb_addr = cursor.ringaddr;
                let block_state = match trb.trb_type() {
                    TrbType::Link => {
                        if trb.toggle_cycle() {
                            cursor.ccs = !cursor.ccs;
                        }
                        Some((XferBuf::None, BlockState::Handled))
                    }
                    TrbType::SetupStage => {
                        if !trb.idt() || trb.transfer_length() != 8 {
                            debug!("malformed setup stage TRB");
                            abort = Some(CompletionCode::TrbError);
                            None
                        } else {
                            xfer.ureq = Some(UsbRequest::from_le(trb.parameter));
                            setup_pending = true;
                            Some((XferBuf::None, BlockState::Handled))
                        }
                    }
                    TrbType::Normal | TrbType::Isoch if setup_pending => {
                        warn!("data TRB inside an unfinished control transfer");
                        abort = Some(CompletionCode::TrbError);
                        None
                    }
                    TrbType::Normal | TrbType::Isoch | TrbType::DataStage => {
                        let len = trb.transfer_length();
                        let buf = if trb.idt() {
                            XferBuf::Immediate {
                                data: trb.parameter.to_le_bytes(),
                                len: len.min(8),
                            }
                        } else {
                            XferBuf::Guest {
                                addr: trb.parameter,
                                len,
                            }
                        };
                        Some((buf, BlockState::Free))
                    }
                    TrbType::StatusStage => Some((XferBuf::None, BlockState::Free)),
                    TrbType::EventData => {
                        // Event Data TRBs on the control endpoint are
                        // finished by the request hook together with the
                        // rest of the control transfer.
                        let state = if epid > 1 && trb.ioc() {
                            BlockState::Handled
                        } else {
                            BlockState::Free
                        };
                        Some((XferBuf::None, state))
                    }
                    TrbType::Noop => Some((XferBuf::None, BlockState::Handled)),
                    other => {
                        warn!("unexpected TRB type {other:?} on transfer ring");
                        abort = Some(CompletionCode::TrbError);
                        None
                    }
                };

                let Some((buf, state)) = block_state else {
                    break;
                };

                // Advance the cursor before recording the block so a
                // mid-transfer stop observes progress.
                cursor.ringaddr = if is_link {
                    trb.parameter & !0xF
                } else {
                    cursor.ringaddr + TRB_SIZE as u64
                };

                let Some(block) = xfer.append(buf, trb_addr, cursor.ccs, streamid) else {
                    warn!("transfer exceeds the block ring");
                    abort = Some(CompletionCode::ResourceError);
                    break;
                };
                block.processed = state;
                block.trbnext = cursor.ringaddr;

                self.update_ep_ring(slot, epid, streamid, cursor);

                if trb.ioc() {
                    submit = true;
                    break;
                }
            }

            if let Some(code) = abort {
                self.abort_transfer(xfer, slot, epid, code);
                xfer.reset();
                return;
            }

            if xfer.is_empty() {
                return;
            }

            if epid == 1 {
                // Control transfer: the request hook answers inline.
                let status = {
                    let slot_entry = self.slots[usize::from(slot)].as_mut().unwrap();
                    slot_entry.dev.request(xfer, &mem)
                };
                xfer.status = status;

                let code = map_usb_status(status);
                if matches!(
                    code,
                    CompletionCode::Success
                        | CompletionCode::ShortPacket
                        | CompletionCode::StallError
                ) {
                    let (code, do_intr) = self.xfer_complete_locked(xfer, slot, epid);
                    if do_intr {
                        self.assert_interrupt();
                    }
                    if code == CompletionCode::EventRingFullError {
                        xfer.reset();
                        return;
                    }
                } else {
                    self.abort_transfer(xfer, slot, epid, code);
                    xfer.reset();
                    return;
                }

                xfer.reset();
                if submit {
                    // The guest may have queued further control TDs
                    // behind the one we just finished.
                    continue 'next_td;
                }
                return;
            }

            // Data endpoints submit one batch per doorbell; completions
            // of asynchronous backends arrive via the notify surface.
            self.try_usb_xfer(xfer, slot, epid);
            return;
        }
    }

    /// Report a broken transfer to the guest with a single Transfer event
    /// carrying `code`.
    fn abort_transfer(&mut self, xfer: &mut Xfer, slot: u8, epid: u8, code: CompletionCode) {
        let trb_addr = xfer
            .live_indices()
            .last()
            .map(|idx| xfer.block(idx).trb_addr)
            .unwrap_or(0);

        self.insert_event(
            &Trb::transfer_event(trb_addr, 0, code, false, slot, epid),
            true,
        );
    }

    /// Submit (or re-submit) the pending transfer to the device backend.
    ///
    /// A NAK answer leaves the transfer queued; a static backend's inline
    /// answer is completed immediately.
    pub(super) fn try_usb_xfer(&mut self, xfer: &mut Xfer, slot: u8, epid: u8) {
        if let Some(dev_ctx) = self.device_context(slot) {
            dev_ctx.endpoint(epid).set_state(ep_state::RUNNING);
        }

        let mem = self.dma_bus.clone();
        let direction = if epid % 2 == 1 {
            Direction::In
        } else {
            Direction::Out
        };
        let epnum = epid / 2;

        let (status, kind) = {
            let slot_entry = self.slots[usize::from(slot)].as_mut().unwrap();
            let status = slot_entry.dev.data(xfer, direction, epnum, &mem);
            (status, slot_entry.dev.kind())
        };

        if status == UsbStatus::Nak {
            // Deferred: the device keeps the transfer and answers later.
            trace!("endpoint {epid} NAKed, transfer stays queued");
            return;
        }

        xfer.status = status;
        let (code, do_intr) = self.xfer_complete_locked(xfer, slot, epid);
        if code == CompletionCode::Success && do_intr {
            self.assert_interrupt();
        }

        if kind == UsbDeviceKind::Static {
            xfer.reset();
        }
    }

    /// Completion entry for the notify callback surface: look up the
    /// endpoint's transfer and drain it.
    ///
    /// Returns whether an interrupt is needed.
    pub(super) fn notify_transfer(&mut self, slot: u8, epid: u8) -> bool {
        let Some(xfer_arc) = self.endpoint_xfer(slot, epid) else {
            return false;
        };

        let mut xfer = xfer_arc.lock().unwrap();
        let (_, do_intr) = self.xfer_complete_locked(&mut xfer, slot, epid);
        do_intr
    }

    /// Drain processed blocks of a transfer into Transfer events.
    ///
    /// Returns the last insertion result and whether any emitted event
    /// asked for an interrupt; the caller raises the interrupter at most
    /// once.
    pub(super) fn xfer_complete_locked(
        &mut self,
        xfer: &mut Xfer,
        slot: u8,
        epid: u8,
    ) -> (CompletionCode, bool) {
        let mem = self.dma_bus.clone();

        let err = map_usb_status(xfer.status);
        if err == CompletionCode::StallError {
            if let Some(dev_ctx) = self.device_context(slot) {
                dev_ctx.endpoint(epid).set_state(ep_state::HALTED);
            }
        }

        let mut result = CompletionCode::Success;
        let mut do_intr = false;
        let mut edtla: u32 = 0;

        while !xfer.is_empty() {
            let idx = xfer.head();
            let block = *xfer.block(idx);

            // Blocks not yet handled park the head for a later retry.
            if block.processed != BlockState::Handled {
                xfer.park_head(idx);
                break;
            }

            let trb = Trb::read_from(&mem, block.trb_addr);
            edtla = edtla.wrapping_add(block.bdone);

            // Hand the TRB back to the guest with the cycle it was
            // consumed at.
            let mut returned = trb;
            returned.set_cycle(block.ccs);
            returned.write_to(&mem, block.trb_addr);

            xfer.release_head();

            // Only notify on IOC, or on a short packet with ISP.
            if !trb.ioc() && !(err == CompletionCode::ShortPacket && trb.isp()) {
                continue;
            }

            let event = if trb.trb_type() == TrbType::EventData {
                let event = Trb::transfer_event(
                    trb.parameter,
                    edtla & 0xFFFFF,
                    err,
                    true,
                    slot,
                    epid,
                );
                edtla = 0;
                event
            } else {
                Trb::transfer_event(block.trb_addr, block.blen, err, false, slot, epid)
            };

            do_intr = true;

            result = self.insert_event(&event, false);
            if result != CompletionCode::Success {
                break;
            }
        }

        (result, do_intr)
    }

    /// Record transfer-ring progress in the endpoint (or stream) record
    /// and mirror it into the guest context.
    pub(super) fn update_ep_ring(&mut self, slot: u8, epid: u8, streamid: u16, cursor: TrbRing) {
        let mem = self.dma_bus.clone();
        let dev_ctx = self.device_context(slot);

        let Some(slot_entry) = self.slots[usize::from(slot)].as_mut() else {
            return;
        };
        let Some(ep) = slot_entry.eps[usize::from(epid)].as_mut() else {
            return;
        };

        match &mut ep.ring {
            EndpointRing::Single(ring) => {
                *ring = cursor;
                if let Some(dev_ctx) = dev_ctx {
                    dev_ctx
                        .endpoint(epid)
                        .set_dequeue_pointer(cursor.ringaddr & !0xF, cursor.ccs);
                }
            }
            EndpointRing::Streams { sctx_base, rings } => {
                if let Some(ring) = rings.get_mut(usize::from(streamid)) {
                    *ring = cursor;
                    super::context::StreamContext::new(*sctx_base, streamid, mem)
                        .set_dequeue_pointer(cursor.ringaddr, cursor.ccs);
                }
                if let Some(dev_ctx) = dev_ctx {
                    let ep_ctx = dev_ctx.endpoint(epid);
                    let (addr, _) = ep_ctx.dequeue_pointer();
                    ep_ctx.set_dequeue_pointer(addr, cursor.ccs);
                }
            }
        }
    }

    /// Look up the guest device context of a slot.
    pub(super) fn device_context(&self, slot: u8) -> Option<DeviceContext> {
        let addr = self.dcbaa()?.device_context_addr(slot)?;
        Some(DeviceContext::new(addr, self.dma_bus.clone()))
    }
}
