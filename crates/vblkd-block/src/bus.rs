//! Software implementations of the bus contracts.
//!
//! [`MemBus`] is a [`DmaSpace`] backed by plain memory: mappings get bus
//! addresses from a bump allocator and reads/writes resolve through the
//! mapping table. [`MemDevice`] is a synchronous in-memory [`BlockDevice`].
//! Both are used by unit tests across the workspace and by the simulated
//! controller, which needs a bus to service PRD lists from.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::{
    Datablock, DeviceError, DeviceFeatures, DeviceInfo, DmaDirection, DmaSpace, BlockDevice,
    Dataspace, InoutCallback, Result,
};

struct Mapping {
    bus: u64,
    len: usize,
    ds: Dataspace,
    offset: usize,
}

#[derive(Default)]
struct BusInner {
    next_bus: u64,
    maps: Vec<Mapping>,
    fail_maps: u32,
}

/// A memory-backed DMA space.
pub struct MemBus {
    inner: RefCell<BusInner>,
}

impl MemBus {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(BusInner {
                next_bus: 0x10_0000,
                ..Default::default()
            }),
        })
    }

    /// Make the next `n` map calls fail with `ResourceExhausted`.
    pub fn fail_next_maps(&self, n: u32) {
        self.inner.borrow_mut().fail_maps = n;
    }

    pub fn mapping_count(&self) -> usize {
        self.inner.borrow().maps.len()
    }

    fn resolve(&self, bus: u64, len: usize) -> Result<(Dataspace, usize)> {
        let inner = self.inner.borrow();
        for m in &inner.maps {
            if bus >= m.bus && bus + len as u64 <= m.bus + m.len as u64 {
                return Ok((m.ds.clone(), m.offset + (bus - m.bus) as usize));
            }
        }
        Err(DeviceError::InvalidArgument("unmapped bus address"))
    }

    /// Read device-visible memory at a bus address.
    pub fn read(&self, bus: u64, buf: &mut [u8]) -> Result<()> {
        let (ds, off) = self.resolve(bus, buf.len())?;
        ds.read(off, buf)
    }

    /// Write device-visible memory at a bus address.
    pub fn write(&self, bus: u64, buf: &[u8]) -> Result<()> {
        let (ds, off) = self.resolve(bus, buf.len())?;
        ds.write(off, buf)
    }

    pub fn read_u32(&self, bus: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(bus, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_u32(&self, bus: u64, val: u32) -> Result<()> {
        self.write(bus, &val.to_le_bytes())
    }
}

impl DmaSpace for MemBus {
    fn map(&self, ds: &Dataspace, offset: usize, len: usize, dir: DmaDirection) -> Result<u64> {
        let _ = dir;
        let mut inner = self.inner.borrow_mut();
        if inner.fail_maps > 0 {
            inner.fail_maps -= 1;
            return Err(DeviceError::ResourceExhausted("dma mapping refused"));
        }
        if offset + len > ds.len() {
            return Err(DeviceError::InvalidArgument("map range outside dataspace"));
        }
        let bus = inner.next_bus;
        inner.next_bus += (len as u64).next_multiple_of(0x1000);
        inner.maps.push(Mapping {
            bus,
            len,
            ds: ds.clone(),
            offset,
        });
        Ok(bus)
    }

    fn unmap(&self, bus_addr: u64, _len: usize, _dir: DmaDirection) {
        let mut inner = self.inner.borrow_mut();
        match inner.maps.iter().position(|m| m.bus == bus_addr) {
            Some(idx) => {
                inner.maps.swap_remove(idx);
            }
            None => tracing::warn!(bus_addr, "unmap of unknown bus mapping"),
        }
    }
}

struct PendingIo {
    sector: u64,
    blocks: Vec<Datablock>,
    dir: DmaDirection,
    cb: InoutCallback,
}

/// A synchronous in-memory block device.
///
/// `deferred` mode queues completions instead, so tests can exercise
/// admission pressure and completion ordering; [`MemDevice::complete_one`]
/// fires the oldest queued completion.
pub struct MemDevice {
    bus: Rc<MemBus>,
    data: RefCell<Vec<u8>>,
    info: RefCell<DeviceInfo>,
    max_block_size: Cell<u32>,
    max_segments: Cell<u32>,
    max_in_flight: Cell<u32>,
    in_flight: Cell<u32>,
    deferred: Cell<bool>,
    pending: RefCell<VecDeque<PendingIo>>,
    busy_budget: Cell<u32>,
    fail_budget: Cell<u32>,
}

impl MemDevice {
    pub fn new(bus: Rc<MemBus>, num_sectors: u64, sector_size: u32) -> Rc<Self> {
        let info = DeviceInfo {
            hid: "MEMDISK0001".into(),
            serial: "MEMDISK0001".into(),
            model: "VBLKD MEMORY DEVICE".into(),
            firmware_rev: "0.1".into(),
            ata_major_rev: 0,
            ata_minor_rev: 0,
            sector_size,
            num_sectors,
            features: DeviceFeatures {
                lba: true,
                dma: true,
                longaddr: true,
                s64a: true,
                ro: false,
            },
        };
        Rc::new(Self {
            bus,
            data: RefCell::new(vec![0; (num_sectors * u64::from(sector_size)) as usize]),
            info: RefCell::new(info),
            max_block_size: Cell::new(0x40_0000),
            max_segments: Cell::new(168),
            max_in_flight: Cell::new(32),
            in_flight: Cell::new(0),
            deferred: Cell::new(false),
            pending: RefCell::new(VecDeque::new()),
            busy_budget: Cell::new(0),
            fail_budget: Cell::new(0),
        })
    }

    pub fn set_hid(&self, hid: &str) {
        let mut info = self.info.borrow_mut();
        info.hid = hid.to_string();
        info.serial = hid.to_string();
    }

    pub fn set_read_only(&self, ro: bool) {
        self.info.borrow_mut().features.ro = ro;
    }

    pub fn set_max_in_flight(&self, n: u32) {
        self.max_in_flight.set(n);
    }

    pub fn set_max_block_size(&self, n: u32) {
        self.max_block_size.set(n);
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.set(deferred);
    }

    /// Make the next `n` admissions fail with `Busy`.
    pub fn busy_next_admissions(&self, n: u32) {
        self.busy_budget.set(n);
    }

    /// Make the next `n` admissions fail with `Io`.
    pub fn fail_next_admissions(&self, n: u32) {
        self.fail_budget.set(n);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn write_sector(&self, lba: u64, buf: &[u8]) {
        let ss = self.info.borrow().sector_size as usize;
        assert_eq!(buf.len(), ss);
        let off = lba as usize * ss;
        self.data.borrow_mut()[off..off + ss].copy_from_slice(buf);
    }

    pub fn read_sector(&self, lba: u64) -> Vec<u8> {
        let ss = self.info.borrow().sector_size as usize;
        let off = lba as usize * ss;
        self.data.borrow()[off..off + ss].to_vec()
    }

    pub fn fill_sector(&self, lba: u64, byte: u8) {
        let ss = self.info.borrow().sector_size as usize;
        self.write_sector(lba, &vec![byte; ss]);
    }

    fn transfer(&self, sector: u64, blocks: &[Datablock], dir: DmaDirection) -> Result<u32> {
        let ss = u64::from(self.info.borrow().sector_size);
        let mut offset = (sector * ss) as usize;
        let mut total = 0u32;
        for b in blocks {
            let len = b.len as usize;
            match dir {
                DmaDirection::FromDevice => {
                    let chunk = self.data.borrow()[offset..offset + len].to_vec();
                    self.bus.write(b.bus_addr, &chunk)?;
                }
                DmaDirection::ToDevice | DmaDirection::Bidirectional => {
                    let mut chunk = vec![0u8; len];
                    self.bus.read(b.bus_addr, &mut chunk)?;
                    self.data.borrow_mut()[offset..offset + len].copy_from_slice(&chunk);
                }
            }
            offset += len;
            total += b.len;
        }
        Ok(total)
    }

    /// Fire the oldest queued completion. Returns false if none was queued.
    pub fn complete_one(&self) -> bool {
        let Some(io) = self.pending.borrow_mut().pop_front() else {
            return false;
        };
        let res = self.transfer(io.sector, &io.blocks, io.dir);
        self.in_flight.set(self.in_flight.get() - 1);
        // The borrow is already released; the callback may submit new I/O.
        (io.cb)(res);
        true
    }

    /// Fire all queued completions in order.
    pub fn complete_all(&self) {
        while self.complete_one() {}
    }
}

impl BlockDevice for MemDevice {
    fn info(&self) -> DeviceInfo {
        self.info.borrow().clone()
    }

    fn max_block_size(&self) -> u32 {
        self.max_block_size.get()
    }

    fn max_segments(&self) -> u32 {
        self.max_segments.get()
    }

    fn max_in_flight(&self) -> u32 {
        self.max_in_flight.get()
    }

    fn dma_space(&self) -> Rc<dyn DmaSpace> {
        self.bus.clone()
    }

    fn inout_data(
        &self,
        sector: u64,
        blocks: &[Datablock],
        dir: DmaDirection,
        cb: InoutCallback,
    ) -> Result<()> {
        if self.fail_budget.get() > 0 {
            self.fail_budget.set(self.fail_budget.get() - 1);
            return Err(DeviceError::Io);
        }
        if self.busy_budget.get() > 0 {
            self.busy_budget.set(self.busy_budget.get() - 1);
            return Err(DeviceError::Busy);
        }
        if self.in_flight.get() >= self.max_in_flight.get() {
            return Err(DeviceError::Busy);
        }

        let info = self.info.borrow();
        let total: u64 = blocks.iter().map(|b| u64::from(b.len)).sum();
        if total % u64::from(info.sector_size) != 0 {
            return Err(DeviceError::InvalidArgument("partial sector transfer"));
        }
        if sector + total / u64::from(info.sector_size) > info.num_sectors {
            return Err(DeviceError::InvalidArgument("transfer past end of device"));
        }
        drop(info);

        if self.deferred.get() {
            self.in_flight.set(self.in_flight.get() + 1);
            self.pending.borrow_mut().push_back(PendingIo {
                sector,
                blocks: blocks.to_vec(),
                dir,
                cb,
            });
        } else {
            cb(self.transfer(sector, blocks, dir));
        }
        Ok(())
    }

    fn reset_device(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_resolves_and_unmap_removes() {
        let bus = MemBus::new();
        let ds = Dataspace::new(4096);
        ds.write(8, &[1, 2, 3, 4]).unwrap();

        let bus_addr = bus.map(&ds, 0, 4096, DmaDirection::Bidirectional).unwrap();
        let mut out = [0u8; 4];
        bus.read(bus_addr + 8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        bus.write(bus_addr + 16, &[9, 9]).unwrap();
        let mut chk = [0u8; 2];
        ds.read(16, &mut chk).unwrap();
        assert_eq!(chk, [9, 9]);

        bus.unmap(bus_addr, 4096, DmaDirection::Bidirectional);
        assert!(bus.read(bus_addr, &mut out).is_err());
    }

    #[test]
    fn refused_mapping_reports_resource_exhaustion() {
        let bus = MemBus::new();
        let ds = Dataspace::new(512);
        bus.fail_next_maps(1);
        assert_eq!(
            bus.map(&ds, 0, 512, DmaDirection::ToDevice).unwrap_err(),
            DeviceError::ResourceExhausted("dma mapping refused")
        );
        assert!(bus.map(&ds, 0, 512, DmaDirection::ToDevice).is_ok());
    }

    #[test]
    fn mem_device_roundtrip() {
        let bus = MemBus::new();
        let dev = MemDevice::new(bus.clone(), 64, 512);

        let ds = Dataspace::new(512);
        ds.write(0, b"hello disk").unwrap();
        let bus_addr = bus.map(&ds, 0, 512, DmaDirection::Bidirectional).unwrap();
        let block = Datablock::new(bus_addr, 512);

        dev.inout_data(3, &[block], DmaDirection::ToDevice, Box::new(|_| {}))
            .unwrap();
        assert_eq!(&dev.read_sector(3)[..10], b"hello disk");

        let out = Dataspace::new(512);
        let out_addr = bus.map(&out, 0, 512, DmaDirection::FromDevice).unwrap();
        dev.inout_data(
            3,
            &[Datablock::new(out_addr, 512)],
            DmaDirection::FromDevice,
            Box::new(|res| assert_eq!(res, Ok(512))),
        )
        .unwrap();
        let mut chk = [0u8; 10];
        out.read(0, &mut chk).unwrap();
        assert_eq!(&chk, b"hello disk");
    }
}
