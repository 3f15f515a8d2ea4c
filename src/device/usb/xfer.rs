//! The USB data transfer model shared between the transfer engine and the
//! device backends.
//!
//! A [`Xfer`] is a bounded ring of blocks, one block per consumed transfer
//! TRB. The transfer engine appends blocks while walking a transfer ring;
//! the backend fills in completion status and byte counts; the completion
//! routine drains processed blocks and turns them into Transfer events.

use crate::device::bus::BusDeviceRef;
use crate::device::pci::constants::usb::USB_MAX_XFER_BLOCKS;

use super::{UsbRequest, UsbStatus};

/// The data buffer a transfer block describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferBuf {
    /// No data (status stages, events, link sentinels).
    None,
    /// A buffer in guest memory.
    Guest {
        /// Guest-physical address of the buffer.
        addr: u64,
        /// Length of the buffer in bytes.
        len: u32,
    },
    /// Up to 8 bytes of immediate data carried in the TRB itself.
    Immediate {
        /// The data bytes.
        data: [u8; 8],
        /// How many of them are valid.
        len: u32,
    },
}

impl XferBuf {
    /// The requested transfer length of this buffer.
    #[must_use]
    pub const fn len(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Guest { len, .. } => *len,
            Self::Immediate { len, .. } => *len,
        }
    }

    /// Whether there is no data to move.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy data from the buffer into `out`. Returns the number of bytes
    /// copied.
    pub fn read(&self, mem: &BusDeviceRef, out: &mut [u8]) -> usize {
        match self {
            Self::None => 0,
            Self::Guest { addr, len } => {
                let n = out.len().min(*len as usize);
                mem.read_bulk(*addr, &mut out[..n]);
                n
            }
            Self::Immediate { data, len } => {
                let n = out.len().min(*len as usize);
                out[..n].copy_from_slice(&data[..n]);
                n
            }
        }
    }

    /// Copy `data` into the buffer. Returns the number of bytes copied.
    pub fn write(&self, mem: &BusDeviceRef, data: &[u8]) -> usize {
        match self {
            Self::None | Self::Immediate { .. } => 0,
            Self::Guest { addr, len } => {
                let n = data.len().min(*len as usize);
                mem.write_bulk(*addr, &data[..n]);
                n
            }
        }
    }
}

/// The life-cycle state of one transfer block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockState {
    /// Not yet processed; the completion routine stops here.
    Free,
    /// Consumed by the engine or completed by the backend; ready for
    /// event emission.
    Handled,
    /// Owned by an asynchronous backend; completion pending.
    Acquired,
}

/// One consumed transfer TRB, waiting for completion.
#[derive(Debug, Clone, Copy)]
pub struct XferBlock {
    /// The data buffer, if any.
    pub buf: XferBuf,
    /// Bytes still outstanding; becomes the Transfer event's remainder
    /// field.
    pub blen: u32,
    /// Bytes the backend actually moved.
    pub bdone: u32,
    /// Life-cycle marker.
    pub processed: BlockState,
    /// Guest address of the TRB this block was built from.
    pub trb_addr: u64,
    /// Snapshot of the consumer cycle state at the TRB.
    pub ccs: bool,
    /// Stream this block belongs to, 0 without streams.
    pub streamid: u16,
    /// Guest address of the TRB following this one.
    pub trbnext: u64,
    /// Per-block backend status, checked for NAK on the retry path.
    pub status: UsbStatus,
}

impl XferBlock {
    const fn empty() -> Self {
        Self {
            buf: XferBuf::None,
            blen: 0,
            bdone: 0,
            processed: BlockState::Free,
            trb_addr: 0,
            ccs: false,
            streamid: 0,
            trbnext: 0,
            status: UsbStatus::Completed,
        }
    }
}

/// A USB data transfer: a bounded ring of blocks plus the control-request
/// slot.
///
/// At most one `Xfer` is in flight per endpoint; it is shared between the
/// transfer engine and asynchronous backends behind its own mutex.
#[derive(Debug)]
pub struct Xfer {
    /// The captured setup packet of a control transfer.
    pub ureq: Option<UsbRequest>,
    /// The owning slot, for completion routing.
    pub slot: u8,
    /// The owning endpoint id, for completion routing.
    pub epid: u8,
    /// Transfer-wide backend status.
    pub status: UsbStatus,

    blocks: Box<[XferBlock; USB_MAX_XFER_BLOCKS]>,
    head: usize,
    tail: usize,
    ndata: usize,
}

impl Xfer {
    /// Create an empty transfer for `(slot, epid)`.
    #[must_use]
    pub fn new(slot: u8, epid: u8) -> Self {
        Self {
            ureq: None,
            slot,
            epid,
            status: UsbStatus::Completed,
            blocks: Box::new([XferBlock::empty(); USB_MAX_XFER_BLOCKS]),
            head: 0,
            tail: 0,
            ndata: 0,
        }
    }

    /// Forget all blocks and the pending setup packet.
    pub fn reset(&mut self) {
        self.ureq = None;
        self.status = UsbStatus::Completed;
        self.head = 0;
        self.tail = 0;
        self.ndata = 0;
        *self.blocks = [XferBlock::empty(); USB_MAX_XFER_BLOCKS];
    }

    /// The number of blocks currently on the transfer.
    #[must_use]
    pub const fn ndata(&self) -> usize {
        self.ndata
    }

    /// Whether the transfer carries no blocks.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ndata == 0
    }

    /// The index of the first unconsumed block.
    #[must_use]
    pub const fn head(&self) -> usize {
        self.head
    }

    /// Append a block for a consumed TRB.
    ///
    /// Returns `None` when the block ring is exhausted.
    pub fn append(
        &mut self,
        buf: XferBuf,
        trb_addr: u64,
        ccs: bool,
        streamid: u16,
    ) -> Option<&mut XferBlock> {
        if self.ndata == USB_MAX_XFER_BLOCKS {
            return None;
        }

        let idx = self.tail;
        self.tail = (self.tail + 1) % USB_MAX_XFER_BLOCKS;
        self.ndata += 1;

        let block = &mut self.blocks[idx];
        *block = XferBlock {
            buf,
            blen: buf.len(),
            bdone: 0,
            processed: BlockState::Free,
            trb_addr,
            ccs,
            streamid,
            trbnext: 0,
            status: UsbStatus::Completed,
        };
        Some(block)
    }

    /// Access a block by ring index.
    #[must_use]
    pub fn block(&self, idx: usize) -> &XferBlock {
        &self.blocks[idx]
    }

    /// Mutable access to a block by ring index.
    pub fn block_mut(&mut self, idx: usize) -> &mut XferBlock {
        &mut self.blocks[idx]
    }

    /// Release the block at `head` and advance. Only the completion
    /// routine calls this.
    pub fn release_head(&mut self) {
        assert!(self.ndata > 0);

        self.blocks[self.head].processed = BlockState::Free;
        self.head = (self.head + 1) % USB_MAX_XFER_BLOCKS;
        self.ndata -= 1;
    }

    /// Record a retry position: `head` stays at `idx` so a later pass
    /// resumes there.
    pub fn park_head(&mut self, idx: usize) {
        self.head = idx;
    }

    /// Iterate over the indices of live blocks in submission order.
    pub fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.ndata).map(move |i| (self.head + i) % USB_MAX_XFER_BLOCKS)
    }

    /// The index after `idx` in ring order.
    #[must_use]
    pub const fn next_index(idx: usize) -> usize {
        (idx + 1) % USB_MAX_XFER_BLOCKS
    }

    /// Complete all unprocessed blocks inline: fill the first data-bearing
    /// block with `data` (if any) and mark everything handled.
    ///
    /// This is the completion path of backends that answer immediately. A
    /// response shorter than the buffer yields [`UsbStatus::ShortXfer`].
    pub fn complete_inline(&mut self, mem: &BusDeviceRef, data: Option<&[u8]>) -> UsbStatus {
        let mut status = UsbStatus::Completed;
        let mut data = data;

        for idx in self.live_indices().collect::<Vec<_>>() {
            let block = &mut self.blocks[idx];
            if block.processed != BlockState::Free {
                continue;
            }

            if !block.buf.is_empty() {
                let copied = match data.take() {
                    Some(data) => block.buf.write(mem, data) as u32,
                    None => 0,
                };
                block.bdone = copied;
                if copied < block.blen {
                    status = UsbStatus::ShortXfer;
                }
                block.blen -= copied;
            }
            block.processed = BlockState::Handled;
            block.status = status;
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_release_keep_the_count() {
        let mut xfer = Xfer::new(1, 2);
        assert!(xfer.is_empty());

        for i in 0..4 {
            let block = xfer
                .append(XferBuf::None, 0x1000 + i * 16, true, 0)
                .expect("ring has room");
            block.processed = BlockState::Handled;
        }
        assert_eq!(xfer.ndata(), 4);

        xfer.release_head();
        xfer.release_head();
        assert_eq!(xfer.ndata(), 2);
        assert_eq!(xfer.block(xfer.head()).trb_addr, 0x1020);
    }

    #[test]
    fn append_fails_when_the_ring_is_full() {
        let mut xfer = Xfer::new(1, 2);

        for _ in 0..USB_MAX_XFER_BLOCKS {
            assert!(xfer.append(XferBuf::None, 0, true, 0).is_some());
        }
        assert!(xfer.append(XferBuf::None, 0, true, 0).is_none());

        xfer.reset();
        assert!(xfer.is_empty());
        assert!(xfer.append(XferBuf::None, 0, true, 0).is_some());
    }

    #[test]
    fn immediate_buffers_round_trip() {
        use crate::device::bus::testutils::GuestRam;
        use std::sync::Arc;

        let mem: BusDeviceRef = Arc::new(GuestRam::new(0x1000));

        let buf = XferBuf::Immediate {
            data: [1, 2, 3, 4, 5, 6, 7, 8],
            len: 4,
        };
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mem, &mut out), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);

        let gbuf = XferBuf::Guest {
            addr: 0x100,
            len: 8,
        };
        assert_eq!(gbuf.write(&mem, &[9, 9, 9]), 3);
        let mut back = [0u8; 3];
        assert_eq!(gbuf.read(&mem, &mut back), 3);
        assert_eq!(back, [9, 9, 9]);
    }
}
