//! The command ring consumer and the handlers of the individual xHCI
//! commands.
//!
//! Every non-Link command yields exactly one Command Completion Event; the
//! handlers return the completion code by value and never fail
//! out-of-band.

use tracing::{debug, info, warn};

use crate::device::pci::constants::xhci::context::{ep_state, slot_state};
use crate::device::pci::constants::xhci::operational::portsc;
use crate::device::pci::constants::xhci::{MAX_SLOTS, STREAMS_MAX};
use crate::device::usb::{UsbDeviceKind, UsbStatus};

use super::context::InputContext;
use super::rings::TrbRing;
use super::trb::{CompletionCode, Trb, TrbType};
use super::vbdp::VbdpState;
use super::{EndpointRing, VportState, XhciController};

impl XhciController {
    /// Walk the command ring and answer every fresh command.
    ///
    /// Triggered by a doorbell 0 write. The ring-running bit is visible in
    /// CRCR for the duration of the walk; the stored dequeue pointer ends
    /// up at the first unconsumed TRB.
    pub(super) fn complete_commands(&mut self) {
        let mem = self.dma_bus.clone();
        self.command_ring.set_running(true);

        while let Some((address, trb)) = self.command_ring.next_command_trb(&mem) {
            let mut slot = 0u8;

            debug!(
                "command {:?} at {address:#x}",
                trb.trb_type()
            );

            let code = match trb.trb_type() {
                TrbType::EnableSlotCommand => self.cmd_enable_slot(&mut slot),
                TrbType::DisableSlotCommand => {
                    slot = trb.slot_id();
                    self.cmd_disable_slot(slot)
                }
                TrbType::AddressDeviceCommand => {
                    slot = trb.slot_id();
                    self.cmd_address_device(slot, &trb)
                }
                TrbType::ConfigureEndpointCommand => {
                    slot = trb.slot_id();
                    self.cmd_config_ep(slot, &trb)
                }
                TrbType::EvaluateContextCommand => {
                    slot = trb.slot_id();
                    self.cmd_eval_ctx(slot, &trb)
                }
                TrbType::ResetEndpointCommand | TrbType::StopEndpointCommand => {
                    slot = trb.slot_id();
                    self.cmd_reset_or_stop_ep(slot, &trb)
                }
                TrbType::SetTrDequeuePointerCommand => {
                    slot = trb.slot_id();
                    self.cmd_set_tr_dequeue(slot, &trb)
                }
                TrbType::ResetDeviceCommand => {
                    slot = trb.slot_id();
                    self.cmd_reset_device(slot)
                }
                TrbType::NoopCommand => CompletionCode::Success,
                other => {
                    debug!("unsupported command {other:?}");
                    CompletionCode::Success
                }
            };

            debug!("command result {code:?} for slot {slot}");
            self.insert_event(&Trb::command_completion_event(address, code, slot), true);
        }

        self.command_ring.set_running(false);
    }

    /// Enable Slot: hand out the lowest free slot id.
    fn cmd_enable_slot(&mut self, slot: &mut u8) -> CompletionCode {
        for candidate in 1..=MAX_SLOTS as u8 {
            if !self.slot_allocated[usize::from(candidate)] {
                self.slot_allocated[usize::from(candidate)] = true;
                *slot = candidate;
                debug!("enabled slot {candidate}");
                return CompletionCode::Success;
            }
        }

        CompletionCode::NoSlotsAvailableError
    }

    /// Disable Slot: tear the device instance down and release the slot.
    fn cmd_disable_slot(&mut self, slot: u8) -> CompletionCode {
        debug!("disable slot {slot}");

        if !self.slot_valid(slot) {
            return CompletionCode::SlotNotEnabledError;
        }

        let Some(entry) = self.slots[usize::from(slot)].take() else {
            // Enabled but never addressed: releasing the id is all there
            // is to do.
            self.slot_allocated[usize::from(slot)] = false;
            return CompletionCode::Success;
        };

        self.slot_allocated[usize::from(slot)] = false;

        let vport = entry.vport;
        self.ports[usize::from(vport)].portsc &=
            !(portsc::CSC | portsc::CCS | portsc::PED | portsc::PP);

        let native_info = entry.native_info;
        if entry.dev.kind() == UsbDeviceKind::Static {
            // Emulated devices survive the slot; park them back at their
            // port for a later re-enumeration.
            self.port_devices[usize::from(vport)] = Some(entry.dev);
        }
        drop(entry.eps);

        let Some(di) = native_info else {
            return CompletionCode::Success;
        };

        // Finish a suspended-device record: the worker re-announces the
        // port once we signal it.
        let mut signalled = false;
        for vbdp in self.vbdp_devs.iter_mut() {
            if vbdp.state == VbdpState::Start && vbdp.path == Some(di.path) {
                vbdp.state = VbdpState::End;
                self.vbdp_dev_num = self.vbdp_dev_num.saturating_sub(1);
                signalled = true;
                info!("signalling worker to reconnect {}", di.path);
            }
        }
        if signalled {
            self.vbdp_sem.post();
            return CompletionCode::Success;
        }

        match self.native_index_by_path(&di.path) {
            Some(index) => {
                // Guest-driven teardown of a present device: the binding
                // drops back to assigned until the next arrival.
                self.native_ports[index].state = VportState::Assigned;
                self.native_ports[index].vport = 0;
                info!("disable slot {slot} for native device {}", di.path);
                CompletionCode::Success
            }
            None => {
                // The device vanished mid-teardown, possibly during a
                // resume. Give the worker an opportunity to retry.
                self.vbdp_sem.post();
                CompletionCode::SlotNotEnabledError
            }
        }
    }

    /// Address Device: bind the port's device to the slot and initialize
    /// the control endpoint.
    fn cmd_address_device(&mut self, slot: u8, trb: &Trb) -> CompletionCode {
        let input = InputContext::new(trb.parameter & !0xF, self.dma_bus.clone());

        // Addressing expects drop-ctx empty and exactly slot context plus
        // endpoint 0 added.
        if input.drop_flags() != 0 || input.add_flags() & 0x3 != 0x3 {
            debug!("address device: invalid input control context");
            return CompletionCode::TrbError;
        }

        if !self.slot_valid(slot) {
            debug!("address device: invalid slot {slot}");
            return CompletionCode::SlotNotEnabledError;
        }

        if self.slots[usize::from(slot)].is_none() {
            let rh_port = input.slot().root_hub_port();

            let instantiated = if let Some(dev) =
                self.port_devices.get_mut(usize::from(rh_port)).and_then(Option::take)
            {
                Some((dev, None))
            } else {
                match self.native_index_by_vport(rh_port) {
                    Some(index) => {
                        let di = self.native_ports[index].info.expect("bound entries carry info");
                        match (self.backend_factory)(&di) {
                            Ok(dev) => {
                                self.native_ports[index].state = VportState::Emulated;
                                Some((dev, Some(di)))
                            }
                            Err(error) => {
                                warn!("cannot instantiate backend for {}: {error:#}", di.path);
                                None
                            }
                        }
                    }
                    None => {
                        warn!("address device: no device on root hub port {rh_port}");
                        return CompletionCode::TrbError;
                    }
                }
            };

            let Some((dev, native_info)) = instantiated else {
                return CompletionCode::ResourceError;
            };

            info!("created device instance on virtual port {rh_port} for slot {slot}");
            self.slots[usize::from(slot)] = Some(super::DeviceSlot::new(dev, rh_port, native_info));
        }

        let Some(dev_ctx) = self.device_context(slot) else {
            return CompletionCode::ContextStateError;
        };

        {
            let entry = self.slots[usize::from(slot)].as_mut().unwrap();
            if entry.dev.reset() != UsbStatus::Completed {
                return CompletionCode::EndpointNotEnabledError;
            }
        }

        // The output slot context becomes the input one, addressed, with
        // the slot id doubling as the USB device address.
        dev_ctx.slot().copy_from(&input.slot());
        dev_ctx
            .slot()
            .set_state_and_address(slot_state::ADDRESSED, slot);

        dev_ctx.endpoint(1).copy_from(&input.endpoint(1));
        dev_ctx.endpoint(1).set_state(ep_state::RUNNING);

        if self.init_ep(slot, 1).is_err() {
            return CompletionCode::IncompatibleDeviceError;
        }

        CompletionCode::Success
    }

    /// Configure Endpoint: apply the add/drop sets, or deconfigure.
    fn cmd_config_ep(&mut self, slot: u8, trb: &Trb) -> CompletionCode {
        debug!("configure endpoint, slot {slot}");

        if !self.slot_valid(slot) || self.slots[usize::from(slot)].is_none() {
            return CompletionCode::SlotNotEnabledError;
        }

        let Some(dev_ctx) = self.device_context(slot) else {
            return CompletionCode::TrbError;
        };

        // The deconfigure bit drops everything but the control endpoint.
        if trb.bit9() {
            debug!("deconfigure slot {slot}");
            {
                let entry = self.slots[usize::from(slot)].as_mut().unwrap();
                entry.dev.stop();
            }

            dev_ctx.slot().set_context_entries(1);
            dev_ctx.slot().set_state(slot_state::ADDRESSED);

            for epid in 2..=31 {
                self.disable_ep(slot, epid);
            }

            return CompletionCode::Success;
        }

        if dev_ctx.slot().state() < slot_state::ADDRESSED {
            warn!("configure endpoint on unaddressed slot {slot}");
            return CompletionCode::SlotNotEnabledError;
        }

        let input = InputContext::new(trb.parameter & !0xF, self.dma_bus.clone());
        let drop_flags = input.drop_flags();
        let add_flags = input.add_flags();

        for epid in 2..=31u8 {
            if drop_flags & (1 << epid) != 0 {
                debug!("dropping endpoint {epid}");
                self.disable_ep(slot, epid);
            }

            if add_flags & (1 << epid) != 0 {
                dev_ctx.endpoint(epid).copy_from(&input.endpoint(epid));

                if self.init_ep(slot, epid).is_err() {
                    for rollback in 2..=epid {
                        self.disable_ep(slot, rollback);
                    }
                    return CompletionCode::ResourceError;
                }

                dev_ctx.endpoint(epid).set_state(ep_state::RUNNING);
            }
        }

        dev_ctx.slot().set_state(slot_state::CONFIGURED);
        dev_ctx.slot().copy_context_entries(&input.slot());

        CompletionCode::Success
    }

    /// Evaluate Context: adopt the tunable slot and endpoint 0 fields.
    fn cmd_eval_ctx(&mut self, slot: u8, trb: &Trb) -> CompletionCode {
        let input = InputContext::new(trb.parameter & !0xF, self.dma_bus.clone());

        if input.drop_flags() != 0 || input.add_flags() & 0x3 == 0 {
            warn!("evaluate context: invalid input control context");
            return CompletionCode::TrbError;
        }

        if !self.slot_valid(slot) {
            return CompletionCode::SlotNotEnabledError;
        }

        let Some(dev_ctx) = self.device_context(slot) else {
            return CompletionCode::CommandAborted;
        };

        if input.add_flags() & 0x1 != 0 {
            dev_ctx.slot().copy_max_exit_latency(&input.slot());
            dev_ctx.slot().copy_interrupter_target(&input.slot());
        }
        if input.add_flags() & 0x2 != 0 {
            dev_ctx
                .endpoint(1)
                .copy_max_packet_size(&input.endpoint(1));
        }

        CompletionCode::Success
    }

    /// Reset Endpoint and Stop Endpoint.
    ///
    /// Stopping is best-effort: the endpoint is marked stopped, in-flight
    /// backend activity runs to completion. Resetting additionally
    /// recovers a halted endpoint and rewinds its transfer state.
    fn cmd_reset_or_stop_ep(&mut self, slot: u8, trb: &Trb) -> CompletionCode {
        let epid = trb.endpoint_id();
        let is_stop = trb.trb_type() == TrbType::StopEndpointCommand;

        debug!(
            "{} endpoint {epid} of slot {slot}",
            if is_stop { "stop" } else { "reset" }
        );

        if !self.slot_valid(slot) || self.slots[usize::from(slot)].is_none() {
            return CompletionCode::SlotNotEnabledError;
        }
        if !(1..=31).contains(&epid) {
            return CompletionCode::TrbError;
        }

        let Some(dev_ctx) = self.device_context(slot) else {
            return CompletionCode::ContextStateError;
        };
        let ep_ctx = dev_ctx.endpoint(epid);

        if is_stop {
            ep_ctx.set_state(ep_state::STOPPED);
            return CompletionCode::Success;
        }

        if ep_ctx.state() != ep_state::HALTED {
            return CompletionCode::ContextStateError;
        }

        if let Some(xfer) = self.endpoint_xfer(slot, epid) {
            xfer.lock().unwrap().reset();
        }

        ep_ctx.set_state(ep_state::STOPPED);

        // Restore the context's dequeue pointer from the endpoint
        // record.
        if ep_ctx.max_pstreams() == 0 {
            let ring = self.endpoint_ring(slot, epid);
            if let Some(TrbRing { ringaddr, ccs }) = ring {
                ep_ctx.set_dequeue_pointer(ringaddr & !0xF, ccs);
            }
        }

        CompletionCode::Success
    }

    /// Set TR Dequeue Pointer: install a new ring position on a stopped
    /// endpoint.
    fn cmd_set_tr_dequeue(&mut self, slot: u8, trb: &Trb) -> CompletionCode {
        let epid = trb.endpoint_id();
        let streamid = trb.stream_id();

        debug!(
            "set TR dequeue of slot {slot} endpoint {epid} stream {streamid} to {:#x}",
            trb.parameter & !0xF
        );

        if !self.slot_valid(slot) || self.slots[usize::from(slot)].is_none() {
            return CompletionCode::SlotNotEnabledError;
        }
        if !(1..=31).contains(&epid) {
            return CompletionCode::TrbError;
        }

        let Some(dev_ctx) = self.device_context(slot) else {
            return CompletionCode::ContextStateError;
        };
        let ep_ctx = dev_ctx.endpoint(epid);

        match ep_ctx.state() {
            ep_state::STOPPED | ep_state::ERROR => {}
            other => {
                debug!("set TR dequeue in endpoint state {other}");
                return CompletionCode::ContextStateError;
            }
        }

        let new_ring = TrbRing::new(trb.parameter & !0xF, trb.parameter & 0x1 != 0);

        if ep_ctx.max_pstreams() > 0 {
            if ep_ctx.max_pstreams() > STREAMS_MAX as u32 {
                return CompletionCode::InvalidStreamIdError;
            }
            if !ep_ctx.linear_stream_array() {
                return CompletionCode::InvalidStreamIdError;
            }
            if u32::from(streamid) > ep_ctx.max_pstreams() {
                return CompletionCode::InvalidStreamTypeError;
            }

            let mem = self.dma_bus.clone();
            let Some(entry) = self.slots[usize::from(slot)].as_mut() else {
                return CompletionCode::SlotNotEnabledError;
            };
            let Some(ep) = entry.eps[usize::from(epid)].as_mut() else {
                return CompletionCode::EndpointNotEnabledError;
            };
            if let EndpointRing::Streams { sctx_base, rings } = &mut ep.ring {
                if let Some(ring) = rings.get_mut(usize::from(streamid)) {
                    *ring = new_ring;
                    super::context::StreamContext::new(*sctx_base, streamid, mem)
                        .set_dequeue_pointer(new_ring.ringaddr, new_ring.ccs);
                }
            }
        } else {
            if streamid != 0 {
                debug!("ignoring stream id {streamid} on a stream-less endpoint");
            }
            ep_ctx.set_dequeue_pointer(new_ring.ringaddr, new_ring.ccs);

            if let Some(entry) = self.slots[usize::from(slot)].as_mut() {
                if let Some(ep) = entry.eps[usize::from(epid)].as_mut() {
                    ep.ring = EndpointRing::Single(new_ring);
                }
            }
        }

        ep_ctx.set_state(ep_state::STOPPED);
        CompletionCode::Success
    }

    /// Reset Device: back to the default state with only endpoint 0.
    fn cmd_reset_device(&mut self, slot: u8) -> CompletionCode {
        debug!("reset device, slot {slot}");

        if !self.slot_valid(slot) || self.slots[usize::from(slot)].is_none() {
            return CompletionCode::SlotNotEnabledError;
        }

        let Some(dev_ctx) = self.device_context(slot) else {
            return CompletionCode::SlotNotEnabledError;
        };

        dev_ctx.slot().set_state_and_address(slot_state::DEFAULT, 0);
        dev_ctx.slot().set_context_entries(1);

        for epid in 2..=31 {
            self.disable_ep(slot, epid);
        }

        CompletionCode::Success
    }
}
