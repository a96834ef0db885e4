//! The virtio-block front end: one interface drives one block device.
//!
//! `kick` pulls descriptor chains from the available ring, turns them into
//! requests, resolves their scatter lists to bus addresses and admits them
//! to the device. Admission failure with `Busy` parks the request in a FIFO
//! that is replayed as completions free up slots. Completion writes the
//! status byte, pushes the used ring and pokes the client's interrupt.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{trace, warn};
use vblkd_block::{
    BlockDevice, Datablock, Dataspace, DeviceError, DmaDirection, InoutCallback, Result,
};

use crate::queue::{GuestMem, GuestMemExt, PoppedChain, VirtQueue};

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Request header: type, ioprio, sector in 512-byte units.
pub const BLK_HEADER_SIZE: u32 = 16;

// Feature bits, legacy layout.
pub const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
pub const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
pub const VIRTIO_BLK_F_RO: u64 = 1 << 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;

/// Default cap on a single scatter block: 4 MiB.
pub const DEFAULT_SIZE_MAX: u32 = 0x40_0000;

/// Edge-style interrupt the client polls or waits on.
pub trait NotifyIrq {
    fn trigger(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioBlkConfig {
    /// Capacity in 512-byte sectors.
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub blk_size: u32,
}

impl VirtioBlkConfig {
    // capacity (8) + size_max (4) + seg_max (4) + geometry (4) + blk_size (4)
    pub const SIZE: usize = 24;

    pub fn read(&self, offset: u64, data: &mut [u8]) {
        let mut cfg = [0u8; Self::SIZE];
        cfg[0..8].copy_from_slice(&self.capacity.to_le_bytes());
        cfg[8..12].copy_from_slice(&self.size_max.to_le_bytes());
        cfg[12..16].copy_from_slice(&self.seg_max.to_le_bytes());
        // geometry stays zero.
        cfg[20..24].copy_from_slice(&self.blk_size.to_le_bytes());

        let start: usize = match offset.try_into() {
            Ok(v) => v,
            Err(_) => {
                data.fill(0);
                return;
            }
        };
        if start >= cfg.len() {
            data.fill(0);
            return;
        }
        let end = start.checked_add(data.len()).unwrap_or(cfg.len()).min(cfg.len());
        data[..end - start].copy_from_slice(&cfg[start..end]);
        if end - start < data.len() {
            data[end - start..].fill(0);
        }
    }
}

/// A client memory window: a registered dataspace mapped at a client-chosen
/// base address.
struct MemRegion {
    ds: Dataspace,
    base: u64,
}

/// Borrowed view over the regions, so queue accesses and status writes can
/// run while the interface itself is mutably borrowed.
struct RegionView<'a>(&'a [MemRegion]);

impl RegionView<'_> {
    fn resolve(&self, addr: u64, len: usize) -> Result<(Dataspace, usize)> {
        for r in self.0 {
            if addr >= r.base && addr + len as u64 <= r.base + r.ds.len() as u64 {
                return Ok((r.ds.clone(), (addr - r.base) as usize));
            }
        }
        Err(DeviceError::BadDescriptor("address outside registered memory"))
    }
}

impl GuestMem for RegionView<'_> {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (ds, off) = self.resolve(addr, buf.len())?;
        ds.read(off, buf)
    }

    fn write(&self, addr: u64, buf: &[u8]) -> Result<()> {
        let (ds, off) = self.resolve(addr, buf.len())?;
        ds.write(off, buf)
    }
}

/// A parsed request, before its scatter list is resolved.
struct Request {
    typ: u32,
    /// Start sector in 512-byte units, as the client sent it.
    sector: u64,
    /// Client-address scatter list (address, length).
    segments: Vec<(u64, u32)>,
    /// Client address of the status byte.
    status_addr: u64,
    /// Running status; `Unsupported` once an oversized block was seen.
    status: u8,
    head: u16,
}

/// A request together with its resolved DMA state, waiting for a slot or
/// owned by the hardware.
struct PendingRequest {
    req: Request,
    blocks: Vec<Datablock>,
    /// Bus mappings to release at completion: (bus base, length, direction).
    mappings: Vec<(u64, usize, DmaDirection)>,
    dir: DmaDirection,
}

struct Inner {
    dev: Rc<dyn BlockDevice>,
    notify: Rc<dyn NotifyIrq>,
    num_ds: usize,
    regions: Vec<MemRegion>,
    queue: Option<VirtQueue>,
    config: VirtioBlkConfig,
    features: u64,
    max_block_size: u32,
    failed: bool,
    pending: VecDeque<PendingRequest>,
}

/// One virtio-block interface bound to one device. Clones share state.
#[derive(Clone)]
pub struct VirtioBlk(Rc<RefCell<Inner>>);

enum Pulled {
    Stop,
    Finalize(Request),
    Process(Request),
}

impl VirtioBlk {
    pub fn new(dev: Rc<dyn BlockDevice>, num_ds: usize, notify: Rc<dyn NotifyIrq>) -> Self {
        let info = dev.info();
        let config = VirtioBlkConfig {
            capacity: dev.capacity_bytes() >> 9,
            size_max: DEFAULT_SIZE_MAX.min(dev.max_block_size()),
            seg_max: dev.max_segments(),
            blk_size: info.sector_size,
        };
        let mut features = VIRTIO_F_RING_INDIRECT_DESC
            | VIRTIO_BLK_F_SIZE_MAX
            | VIRTIO_BLK_F_SEG_MAX
            | VIRTIO_BLK_F_BLK_SIZE;
        if info.features.ro {
            features |= VIRTIO_BLK_F_RO;
        }
        Self(Rc::new(RefCell::new(Inner {
            dev,
            notify,
            num_ds,
            regions: Vec::new(),
            queue: None,
            config,
            features,
            max_block_size: config.size_max,
            failed: false,
            pending: VecDeque::new(),
        })))
    }

    /// Two handles refer to the same interface iff they share state.
    pub fn same_as(&self, other: &VirtioBlk) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn device_features(&self) -> u64 {
        self.0.borrow().features
    }

    pub fn device_config(&self) -> VirtioBlkConfig {
        self.0.borrow().config
    }

    pub fn read_config(&self, offset: u64, data: &mut [u8]) {
        self.0.borrow().config.read(offset, data)
    }

    /// The device sets `failed` on malformed descriptor chains; the client
    /// has to reset to recover.
    pub fn is_failed(&self) -> bool {
        self.0.borrow().failed
    }

    pub fn pending_requests(&self) -> usize {
        self.0.borrow().pending.len()
    }

    /// Register a client dataspace mapped at `base` in the client's address
    /// terms. At most `num_ds` dataspaces may be registered.
    pub fn register_ds(&self, ds: Dataspace, base: u64) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.regions.len() >= inner.num_ds {
            return Err(DeviceError::ResourceExhausted("dataspace limit reached"));
        }
        inner.regions.push(MemRegion { ds, base });
        Ok(())
    }

    /// Configure the queue from the client's ring addresses.
    pub fn setup_queue(&self, size: u16, desc: u64, avail: u64, used: u64) -> Result<()> {
        let queue = VirtQueue::new(size, desc, avail, used)?;
        self.0.borrow_mut().queue = Some(queue);
        Ok(())
    }

    /// Reset the interface and the hardware behind it.
    pub fn reset(&self) {
        let dev = {
            let mut inner = self.0.borrow_mut();
            inner.queue = None;
            inner.failed = false;
            inner.pending.clear();
            inner.dev.clone()
        };
        dev.reset_device();
    }

    /// Client notification: drain the available ring.
    pub fn kick(&self) {
        if !self.0.borrow().pending.is_empty() {
            // Stopped: requests queue up until a slot frees.
            return;
        }

        loop {
            let pulled = self.pull_request();
            match pulled {
                Pulled::Stop => break,
                Pulled::Finalize(req) => {
                    let status = req.status;
                    self.finalize(req, status, 0);
                }
                Pulled::Process(req) => {
                    if !self.process_request(req) {
                        break;
                    }
                }
            }
        }
    }

    /// Pull and parse one chain. No device calls happen under the borrow.
    fn pull_request(&self) -> Pulled {
        let mut inner = self.0.borrow_mut();
        let inner = &mut *inner;
        if inner.failed {
            return Pulled::Stop;
        }
        let Some(queue) = inner.queue.as_mut() else {
            return Pulled::Stop;
        };
        let view = RegionView(&inner.regions);

        let popped = match queue.next_avail(&view) {
            Ok(Some(popped)) => popped,
            Ok(None) => return Pulled::Stop,
            Err(err) => {
                warn!(%err, "available ring unreadable, failing device");
                inner.failed = true;
                return Pulled::Stop;
            }
        };

        let chain = match popped {
            PoppedChain::Chain(chain) => chain,
            PoppedChain::Invalid { head } => {
                warn!(head, "malformed descriptor chain, failing device");
                inner.failed = true;
                let _ = queue.add_used(&view, head, 0);
                return Pulled::Stop;
            }
        };

        match parse_request(&view, &chain, inner.max_block_size) {
            Ok(req) if req.status == VIRTIO_BLK_S_OK => Pulled::Process(req),
            Ok(req) => Pulled::Finalize(req),
            Err(err) => {
                warn!(%err, head = chain.head_index(), "bad request, failing device");
                inner.failed = true;
                let _ = queue.add_used(&view, chain.head_index(), 0);
                Pulled::Stop
            }
        }
    }

    /// Returns false when the queue should stop being drained (request
    /// parked on the pending FIFO).
    fn process_request(&self, req: Request) -> bool {
        trace!(typ = req.typ, sector = req.sector, "request received");
        let dir = match req.typ {
            VIRTIO_BLK_T_IN => DmaDirection::FromDevice,
            VIRTIO_BLK_T_OUT => DmaDirection::ToDevice,
            _ => {
                self.finalize(req, VIRTIO_BLK_S_UNSUPP, 0);
                return true;
            }
        };

        let preq = match self.build_datablocks(req, dir) {
            Ok(preq) => preq,
            Err(req) => {
                self.finalize(req, VIRTIO_BLK_S_IOERR, 0);
                return true;
            }
        };

        match self.submit(preq) {
            Submitted::Admitted | Submitted::Failed => true,
            Submitted::Parked => false,
        }
    }

    /// Resolve the scatter list to bus addresses. Each distinct dataspace is
    /// mapped once; the mapping lives until the request completes.
    fn build_datablocks(
        &self,
        req: Request,
        dir: DmaDirection,
    ) -> std::result::Result<PendingRequest, Request> {
        let (dev, resolved) = {
            let inner = self.0.borrow();
            let view = RegionView(&inner.regions);
            let mut out = Vec::with_capacity(req.segments.len());
            let mut ok = true;
            for &(addr, len) in &req.segments {
                match view.resolve(addr, len as usize) {
                    Ok(pair) => out.push((pair.0, pair.1, len)),
                    Err(err) => {
                        warn!(%err, addr, "cannot resolve data block");
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                return Err(req);
            }
            (inner.dev.clone(), out)
        };

        let dma = dev.dma_space();
        let mut mapped: Vec<(Dataspace, u64)> = Vec::new();
        let mut mappings = Vec::new();
        let mut blocks = Vec::with_capacity(resolved.len());
        for (ds, ds_off, len) in resolved {
            let bus_base = match mapped.iter().find(|(m, _)| m.same_as(&ds)) {
                Some(&(_, bus)) => bus,
                None => match dma.map(&ds, 0, ds.len(), dir) {
                    Ok(bus) => {
                        mapped.push((ds.clone(), bus));
                        mappings.push((bus, ds.len(), dir));
                        bus
                    }
                    Err(err) => {
                        warn!(%err, "cannot map client dataspace for dma");
                        for (bus, len, dir) in mappings {
                            dma.unmap(bus, len, dir);
                        }
                        return Err(req);
                    }
                },
            };
            blocks.push(Datablock::new(bus_base + ds_off as u64, len));
        }

        Ok(PendingRequest {
            req,
            blocks,
            mappings,
            dir,
        })
    }

    fn submit(&self, preq: PendingRequest) -> Submitted {
        self.try_submit(preq, false)
    }

    /// Issue a request to the device.
    ///
    /// On `Busy` the request is parked: at the back of the FIFO for fresh
    /// requests, at the front when it was already parked (`replay`), so the
    /// queue keeps admission order.
    fn try_submit(&self, preq: PendingRequest, replay: bool) -> Submitted {
        let (dev, sector_size) = {
            let inner = self.0.borrow();
            (inner.dev.clone(), inner.dev.sector_size())
        };
        // Virtio sectors are always 512 bytes, the device's may be larger.
        let lba = preq.req.sector / u64::from(sector_size >> 9);
        let blocks = preq.blocks.clone();
        let dir = preq.dir;

        // On an error return the callback was never stored; the holder lets
        // this function reclaim the request in that case.
        let holder = Rc::new(RefCell::new(Some(preq)));
        let cb_holder = holder.clone();
        let iface = self.clone();
        let cb: InoutCallback = Box::new(move |res| {
            if let Some(preq) = cb_holder.borrow_mut().take() {
                iface.task_finished(preq, res);
            }
        });

        match dev.inout_data(lba, &blocks, dir, cb) {
            Ok(()) => Submitted::Admitted,
            Err(DeviceError::Busy) => {
                let preq = holder.borrow_mut().take().expect("request unclaimed");
                trace!(sector = preq.req.sector, "device busy, queueing request");
                let mut inner = self.0.borrow_mut();
                if replay {
                    inner.pending.push_front(preq);
                } else {
                    inner.pending.push_back(preq);
                }
                Submitted::Parked
            }
            Err(err) => {
                let preq = holder.borrow_mut().take().expect("request unclaimed");
                trace!(%err, "request failed at admission");
                self.release_mappings(&preq);
                self.finalize(preq.req, VIRTIO_BLK_S_IOERR, 0);
                Submitted::Failed
            }
        }
    }

    fn release_mappings(&self, preq: &PendingRequest) {
        let dma = self.0.borrow().dev.dma_space();
        for &(bus, len, dir) in &preq.mappings {
            dma.unmap(bus, len, dir);
        }
    }

    /// Hardware completion: release DMA state, report to the client, then
    /// give parked requests a chance.
    fn task_finished(&self, preq: PendingRequest, res: Result<u32>) {
        self.release_mappings(&preq);
        let (status, bytes) = match res {
            Ok(bytes) => (VIRTIO_BLK_S_OK, bytes),
            Err(err) => {
                trace!(%err, "transfer failed");
                (VIRTIO_BLK_S_IOERR, 0)
            }
        };
        self.finalize(preq.req, status, bytes);
        self.check_pending();
    }

    /// Write the status byte, consume the chain and ring the client.
    fn finalize(&self, req: Request, status: u8, bytes: u32) {
        let notify = {
            let mut inner = self.0.borrow_mut();
            let inner = &mut *inner;
            let view = RegionView(&inner.regions);
            if let Err(err) = view.write_u8(req.status_addr, status) {
                warn!(%err, "cannot write request status byte");
            }
            if let Some(queue) = inner.queue.as_mut() {
                if let Err(err) = queue.add_used(&view, req.head, bytes) {
                    warn!(%err, "cannot push used ring entry");
                    inner.failed = true;
                }
            }
            inner.notify.clone()
        };
        notify.trigger();
    }

    /// Replay the pending FIFO head until it is admitted, fails, or the
    /// device is busy again.
    fn check_pending(&self) {
        if self.0.borrow().pending.is_empty() {
            return;
        }

        loop {
            let Some(preq) = self.0.borrow_mut().pending.pop_front() else {
                break;
            };
            match self.try_submit(preq, true) {
                Submitted::Parked => return,
                Submitted::Admitted | Submitted::Failed => {}
            }
        }

        // All parked requests went out; pull whatever queued up meanwhile.
        self.kick();
    }
}

enum Submitted {
    Admitted,
    Parked,
    Failed,
}

impl std::fmt::Debug for VirtioBlk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("VirtioBlk")
            .field("capacity", &inner.config.capacity)
            .field("failed", &inner.failed)
            .field("pending", &inner.pending.len())
            .finish_non_exhaustive()
    }
}

/// Turn a descriptor chain into a request.
///
/// The first descriptor must hold at least the 16-byte header; the final
/// byte of the final descriptor is the status byte. A block larger than
/// `max_block_size` marks the request unsupported, but the walk continues
/// so the status byte location is still found.
fn parse_request(
    mem: &dyn GuestMem,
    chain: &crate::queue::DescriptorChain,
    max_block_size: u32,
) -> Result<Request> {
    let descs = chain.descriptors();
    let first = descs.first().ok_or(DeviceError::BadDescriptor("empty chain"))?;
    if first.len < BLK_HEADER_SIZE {
        return Err(DeviceError::BadDescriptor("header descriptor too short"));
    }

    let mut hdr = [0u8; BLK_HEADER_SIZE as usize];
    mem.read(first.addr, &mut hdr)?;
    let typ = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    let sector = u64::from_le_bytes(hdr[8..16].try_into().unwrap());

    if descs.len() < 2 {
        return Err(DeviceError::BadDescriptor("no room for the status byte"));
    }

    let mut status = VIRTIO_BLK_S_OK;
    let mut segments = Vec::new();
    let mut status_addr = 0;
    let last_idx = descs.len() - 1;
    for (i, d) in descs.iter().enumerate().skip(1) {
        let mut len = d.len;
        if i == last_idx {
            if len == 0 {
                return Err(DeviceError::BadDescriptor("status descriptor is empty"));
            }
            len -= 1;
            status_addr = d.addr + u64::from(len);
        }
        if len > max_block_size {
            status = VIRTIO_BLK_S_UNSUPP;
        }
        if status == VIRTIO_BLK_S_OK && len > 0 {
            segments.push((d.addr, len));
        }
    }

    Ok(Request {
        typ,
        sector,
        segments,
        status_addr,
        status,
        head: chain.head_index(),
    })
}
