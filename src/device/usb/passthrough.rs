//! The native USB pass-through backend.
//!
//! A [`PassthroughDevice`] bridges one guest-visible USB device to a
//! physical device on the host via `nusb`. Control transfers are forwarded
//! synchronously; bulk IN endpoints get a worker thread that owns the host
//! endpoint and completes transfer blocks through the controller's
//! [`XferNotify`] surface.

use std::cmp::Ordering::*;
use std::fmt::Debug;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use nusb::MaybeFuture;
use tracing::{debug, warn};

use crate::device::bus::BusDeviceRef;

use super::{
    BlockState, Direction, EndpointHandle, NativeDeviceInfo, UsbDeviceKind, UsbDeviceModel,
    UsbRequest, UsbSpeed, UsbStatus, Xfer,
};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(200);
const BULK_OUT_TIMEOUT: Duration = Duration::from_millis(400);
const BULK_IN_TIMEOUT: Duration = Duration::from_millis(800);

enum EndpointWorker {
    /// Wakeup channel of the IN worker thread. Dropping it terminates the
    /// worker.
    BulkIn(Sender<()>),
    BulkOut(nusb::Endpoint<Bulk, Out>),
}

/// A physical device claimed for pass-through.
pub struct PassthroughDevice {
    device: nusb::Device,
    info: NativeDeviceInfo,
    interfaces: Vec<nusb::Interface>,
    endpoints: [Option<EndpointWorker>; 30],
}

impl Debug for PassthroughDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughDevice")
            .field("path", &self.info.path)
            .field("vid", &self.info.vid)
            .field("pid", &self.info.pid)
            .finish()
    }
}

impl PassthroughDevice {
    /// Claim all interfaces of `device` and prepare it for guest use.
    ///
    /// Failure to talk to the device here means it cannot be passed
    /// through at all, so errors are surfaced to the caller.
    pub fn new(device: nusb::Device, info: NativeDeviceInfo) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut interfaces = vec![];
        let desc = device
            .active_configuration()
            .context("Failed to query active configuration")?;
        for interface in desc.interfaces() {
            let interface_number = interface.interface_number();
            debug!("claiming interface {}", interface_number);
            interfaces.push(
                device
                    .detach_and_claim_interface(interface_number)
                    .wait()
                    .with_context(|| format!("Failed to claim interface {interface_number}"))?,
            );
        }

        Ok(Self {
            device,
            info,
            interfaces,
            endpoints: std::array::from_fn(|_| None),
        })
    }

    fn control_transfer_device_to_host(
        &self,
        request: &UsbRequest,
        xfer: &mut Xfer,
        mem: &BusDeviceRef,
    ) -> UsbStatus {
        let control = ControlIn {
            control_type: ControlType::Standard,
            recipient: Recipient::Device,
            request: request.request,
            value: request.value,
            index: request.index,
            length: request.length,
        };

        debug!("forwarding control in request to native device");
        match self.device.control_in(control, CONTROL_TIMEOUT).wait() {
            Ok(data) => xfer.complete_inline(mem, Some(&data)),
            Err(error) => {
                warn!("control in request failed: {:?}", error);
                xfer.status = UsbStatus::IoError;
                xfer.complete_inline(mem, None);
                UsbStatus::IoError
            }
        }
    }

    fn control_transfer_host_to_device(
        &self,
        request: &UsbRequest,
        xfer: &mut Xfer,
        mem: &BusDeviceRef,
    ) -> UsbStatus {
        // Collect the data stage, if the request carries one.
        let mut data = vec![0; usize::from(request.length)];
        let mut len = 0;
        for idx in xfer.live_indices().collect::<Vec<_>>() {
            let block = xfer.block(idx);
            if block.processed == BlockState::Free && !block.buf.is_empty() {
                len = block.buf.read(mem, &mut data);
                break;
            }
        }
        data.truncate(len);

        let control = ControlOut {
            control_type: ControlType::Standard,
            recipient: Recipient::Device,
            request: request.request,
            value: request.value,
            index: request.index,
            data: &data,
        };

        debug!("forwarding control out request to native device");
        match self.device.control_out(control, CONTROL_TIMEOUT).wait() {
            Ok(_) => {
                // The data stage is consumed in full on success.
                for idx in xfer.live_indices().collect::<Vec<_>>() {
                    let block = xfer.block_mut(idx);
                    if block.processed == BlockState::Free {
                        block.bdone = block.blen;
                        block.blen = 0;
                        block.processed = BlockState::Handled;
                    }
                }
                UsbStatus::Completed
            }
            Err(error) => {
                warn!("control out request failed: {:?}", error);
                xfer.complete_inline(mem, None);
                UsbStatus::IoError
            }
        }
    }

    fn interface_containing_endpoint(&self, endpoint_address: u8) -> Option<usize> {
        self.interfaces.iter().position(|interface| {
            interface
                .descriptor()
                .map(|desc| desc.endpoints().any(|ep| ep.address() == endpoint_address))
                .unwrap_or(false)
        })
    }

    fn transfer_out(&mut self, epid: u8, xfer: &mut Xfer, mem: &BusDeviceRef) -> UsbStatus {
        let ep_out = match self.endpoints[usize::from(epid) - 2].as_mut() {
            Some(EndpointWorker::BulkOut(ep)) => ep,
            _ => {
                warn!("out transfer on unconfigured endpoint {epid}");
                return UsbStatus::NotStarted;
            }
        };

        let mut status = UsbStatus::Completed;
        for idx in xfer.live_indices().collect::<Vec<_>>() {
            let block = xfer.block_mut(idx);
            if block.processed != BlockState::Free {
                continue;
            }
            if block.buf.is_empty() {
                block.processed = BlockState::Handled;
                continue;
            }

            let mut data = vec![0; block.blen as usize];
            let n = block.buf.read(mem, &mut data);
            data.truncate(n);

            ep_out.submit(data.into());
            match ep_out.wait_next_complete(BULK_OUT_TIMEOUT) {
                Some(_) => {
                    block.bdone = block.blen;
                    block.blen = 0;
                }
                None => {
                    warn!("bulk out transfer timed out on endpoint {epid}");
                    status = UsbStatus::Timeout;
                }
            }
            block.processed = BlockState::Handled;
            block.status = status;
        }

        status
    }

    fn transfer_in(&mut self, epid: u8, xfer: &mut Xfer) -> UsbStatus {
        let sender = match self.endpoints[usize::from(epid) - 2].as_ref() {
            Some(EndpointWorker::BulkIn(sender)) => sender,
            _ => {
                warn!("in transfer on unconfigured endpoint {epid}");
                return UsbStatus::NotStarted;
            }
        };

        // Hand the queued blocks to the worker and report the transfer as
        // deferred; the worker completes it through the notify surface.
        for idx in xfer.live_indices().collect::<Vec<_>>() {
            let block = xfer.block_mut(idx);
            if block.processed == BlockState::Free && !block.buf.is_empty() {
                block.processed = BlockState::Acquired;
            }
        }

        let _ = sender.send(());
        UsbStatus::Nak
    }
}

impl From<nusb::Speed> for UsbSpeed {
    fn from(value: nusb::Speed) -> Self {
        match value {
            nusb::Speed::Low => Self::Low,
            nusb::Speed::Full => Self::Full,
            nusb::Speed::High => Self::High,
            nusb::Speed::Super => Self::Super,
            _ => Self::SuperPlus,
        }
    }
}

impl UsbDeviceModel for PassthroughDevice {
    fn kind(&self) -> UsbDeviceKind {
        UsbDeviceKind::PortMapped
    }

    fn usb_version(&self) -> u16 {
        self.info.bcd
    }

    fn speed(&self) -> UsbSpeed {
        self.device
            .speed()
            .map(Into::into)
            .unwrap_or(self.info.speed)
    }

    fn reset(&mut self) -> UsbStatus {
        // The device went through a host-side reset when it was claimed;
        // a guest-initiated reset needs no further action.
        debug!("guest reset of {}", self.info.path);
        UsbStatus::Completed
    }

    fn request(&mut self, xfer: &mut Xfer, mem: &BusDeviceRef) -> UsbStatus {
        let Some(ureq) = xfer.ureq else {
            warn!("control transfer without setup packet");
            return UsbStatus::Stalled;
        };

        if ureq.is_device_to_host() {
            self.control_transfer_device_to_host(&ureq, xfer, mem)
        } else {
            self.control_transfer_host_to_device(&ureq, xfer, mem)
        }
    }

    fn data(
        &mut self,
        xfer: &mut Xfer,
        dir: Direction,
        _epnum: u8,
        mem: &BusDeviceRef,
    ) -> UsbStatus {
        match dir {
            Direction::Out => self.transfer_out(xfer.epid, xfer, mem),
            Direction::In => self.transfer_in(xfer.epid, xfer),
        }
    }

    fn enable_endpoint(&mut self, handle: EndpointHandle) {
        let epid = handle.epid;
        assert!(
            (2..=31).contains(&epid),
            "request to enable invalid endpoint id on native device: {}",
            epid
        );
        if self.endpoints[usize::from(epid) - 2].is_some() {
            // The Linux kernel configures and directly afterwards
            // reconfigures the endpoints, triggering multiple enable
            // calls for the same endpoint.
            return;
        }

        let endpoint_number = epid / 2;
        let is_out_endpoint = epid % 2 == 0;
        let worker = if is_out_endpoint {
            let Some(iface) = self.interface_containing_endpoint(endpoint_number) else {
                warn!("no interface exposes OUT endpoint {endpoint_number}");
                return;
            };
            match self.interfaces[iface].endpoint::<Bulk, Out>(endpoint_number) {
                Ok(ep) => EndpointWorker::BulkOut(ep),
                Err(error) => {
                    warn!("cannot claim OUT endpoint {endpoint_number}: {error:?}");
                    return;
                }
            }
        } else {
            let endpoint_address = 0x80 | endpoint_number;
            let Some(iface) = self.interface_containing_endpoint(endpoint_address) else {
                warn!("no interface exposes IN endpoint {endpoint_number}");
                return;
            };
            let endpoint = match self.interfaces[iface].endpoint::<Bulk, In>(endpoint_address) {
                Ok(ep) => ep,
                Err(error) => {
                    warn!("cannot claim IN endpoint {endpoint_number}: {error:?}");
                    return;
                }
            };
            let (sender, receiver) = mpsc::channel();
            thread::spawn(move || transfer_in_worker(endpoint, handle, receiver));
            EndpointWorker::BulkIn(sender)
        };

        self.endpoints[usize::from(epid) - 2] = Some(worker);
        debug!("enabled endpoint {} on native device", epid);
    }

    fn stop(&mut self) {
        // Dropping the workers closes the wakeup channels; the IN threads
        // exit on their next receive.
        self.endpoints = std::array::from_fn(|_| None);
    }
}

/// The worker loop of one bulk IN endpoint.
///
/// Each wakeup, it drains all blocks the controller handed over, issuing
/// one host transfer per block, then reports completion.
fn transfer_in_worker(
    mut endpoint: nusb::Endpoint<Bulk, In>,
    handle: EndpointHandle,
    wakeup: Receiver<()>,
) {
    while wakeup.recv().is_ok() {
        loop {
            // Pick the next acquired block while holding the transfer
            // lock, but run the host I/O without it.
            let (idx, requested) = {
                let xfer = handle.xfer.lock().unwrap();
                let found = xfer
                    .live_indices()
                    .find(|&i| xfer.block(i).processed == BlockState::Acquired);
                match found {
                    Some(idx) => (idx, xfer.block(idx).blen as usize),
                    None => break,
                }
            };

            let buffer_size = determine_buffer_size(requested, endpoint.max_packet_size());
            endpoint.submit(Buffer::new(buffer_size));
            let Some(completion) = endpoint.wait_next_complete(BULK_IN_TIMEOUT) else {
                warn!("bulk in transfer timed out, failing block");
                let mut xfer = handle.xfer.lock().unwrap();
                let block = xfer.block_mut(idx);
                block.status = UsbStatus::Timeout;
                block.processed = BlockState::Handled;
                xfer.status = UsbStatus::Timeout;
                drop(xfer);
                handle.notify.notify(handle.slot, handle.epid);
                continue;
            };

            let byte_count = match completion.actual_len.cmp(&requested) {
                // More data than the guest asked for: never write past
                // the guest buffer. Real devices pad short reads up to
                // max_packet_size.
                Greater => requested,
                // Devices may legitimately answer with less than the
                // guest's worst-case buffer (variable-size responses).
                Less => completion.actual_len,
                Equal => requested,
            };

            let status = if byte_count < requested {
                UsbStatus::ShortXfer
            } else {
                UsbStatus::Completed
            };

            let mut xfer = handle.xfer.lock().unwrap();
            let block = xfer.block_mut(idx);
            block.bdone = byte_count as u32;
            block.buf.write(&handle.mem, &completion.buffer[..byte_count]);
            block.blen -= byte_count as u32;
            block.status = status;
            block.processed = BlockState::Handled;
            xfer.status = status;
            drop(xfer);

            handle.notify.notify(handle.slot, handle.epid);
        }
    }

    debug!("bulk in worker for endpoint {} exits", handle.epid);
}

const fn determine_buffer_size(guest_transfer_length: usize, max_packet_size: usize) -> usize {
    if guest_transfer_length <= max_packet_size {
        max_packet_size
    } else {
        guest_transfer_length.div_ceil(max_packet_size) * max_packet_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizes_are_rounded_to_packet_multiples() {
        assert_eq!(determine_buffer_size(0, 512), 512);
        assert_eq!(determine_buffer_size(36, 512), 512);
        assert_eq!(determine_buffer_size(512, 512), 512);
        assert_eq!(determine_buffer_size(513, 512), 1024);
        assert_eq!(determine_buffer_size(4096, 1024), 4096);
    }
}
